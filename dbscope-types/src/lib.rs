#![deny(missing_docs)]
//! Shared type definitions for the dbscope session isolation core.
//!
//! This crate groups together the strongly-typed values passed between the
//! core and its collaborators. It provides:
//!
//! * Thin wrappers around the opaque identifier strings that scope every
//!   unit of work (user, request, thread, run, session), with consistent
//!   serialization and display implementations.
//! * The [`Identity`] bundle attached to every database session at issue
//!   time (see [`ident`] module for construction and the structured
//!   identifier grammar).
//! * The authentication API surface consumed by the resilience layer (see
//!   [`auth`] module).
//!
//! Use these types to pass, store, and (de)serialize identifiers in a
//! type-safe way throughout your application.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Re-export async-trait for convenience.
pub use async_trait;

pub mod auth;
pub mod ident;

/// An opaque user identifier. Non-empty by construction (see
/// [`Identity::builder`]).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// An opaque request identifier, unique per unit of work.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

/// A conversation/channel scope identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

/// An agent-execution scope identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

/// The key of one issued database session:
/// `{user_id}_{request_id}_{short_random}`. Unique per issued session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

macro_rules! opaque_string_id {
    ($name:ident) => {
        impl $name {
            /// Wraps a raw string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the wrapper and returns the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_string_id!(UserId);
opaque_string_id!(RequestId);
opaque_string_id!(ThreadId);
opaque_string_id!(RunId);
opaque_string_id!(SessionKey);

/// The immutable identity bundle passed to every session scope.
///
/// Constructed through [`Identity::builder`]; once built it never changes.
/// The `user_id` and `request_id` are always present, the thread and run
/// scopes are optional. A fresh [`SessionKey`] is derived from this bundle
/// every time a session is issued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    user_id: UserId,
    request_id: RequestId,
    thread_id: Option<ThreadId>,
    run_id: Option<RunId>,
}

impl Identity {
    /// Starts building an identity for the given user.
    pub fn builder(user_id: impl Into<UserId>) -> IdentityBuilder {
        IdentityBuilder {
            user_id: user_id.into(),
            request_id: None,
            thread_id: None,
            run_id: None,
        }
    }

    /// The user this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The request this identity was created for.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The conversation/channel scope, if any.
    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    /// The agent-execution scope, if any.
    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    /// Derives a fresh session key for this identity:
    /// `{user_id}_{request_id}_{short_random}`.
    pub fn derive_session_key(&self) -> SessionKey {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        SessionKey(format!(
            "{}_{}_{}",
            self.user_id,
            self.request_id,
            &suffix[..8]
        ))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.request_id)
    }
}

/// Builder for [`Identity`]. Auto-generates a `req_` request id when none
/// is supplied.
#[derive(Clone, Debug)]
pub struct IdentityBuilder {
    user_id: UserId,
    request_id: Option<RequestId>,
    thread_id: Option<ThreadId>,
    run_id: Option<RunId>,
}

impl IdentityBuilder {
    /// Sets an explicit request id.
    pub fn request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the conversation/channel scope.
    pub fn thread_id(mut self, thread_id: impl Into<ThreadId>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Sets the agent-execution scope.
    pub fn run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Builds the identity.
    ///
    /// Fails with [`ident::MalformedIdentifier::EmptyBody`] if the user id
    /// is empty. Generates a `req_`-prefixed request id when none was set.
    pub fn build(self) -> Result<Identity, ident::MalformedIdentifier> {
        if self.user_id.as_str().is_empty() {
            return Err(ident::MalformedIdentifier::EmptyBody);
        }
        let request_id = match self.request_id {
            Some(request_id) => request_id,
            None => RequestId(ident::ScopedId::generate(ident::IdPrefix::Req, "auto").into_inner()),
        };
        Ok(Identity {
            user_id: self.user_id,
            request_id,
            thread_id: self.thread_id,
            run_id: self.run_id,
        })
    }
}
