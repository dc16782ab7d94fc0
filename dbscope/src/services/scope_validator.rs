//! Stateless validation of session tags.
//!
//! Every session the factory issues carries a [`SessionTag`]: the identity
//! it was issued for plus the marker flags downstream code checks before
//! trusting the handle. The predicates here read the immutable tag and
//! take no locks; all of them fail with the isolation/lifecycle kinds from
//! [`crate::error`].
//!
//! The "no stored sessions" property of the source design is not a runtime
//! check in this rendition: a scoped session is an owned, non-`Clone`
//! guard, so a consumer cannot retain one past its scope in the first
//! place (see [`crate::services::session_factory::ScopedSession`]).

use chrono::{DateTime, Utc};
use dbscope_types::{Identity, RequestId, RunId, SessionKey, ThreadId, UserId};
use serde::Serialize;

use crate::error::SessionError;

/// The identity and marker flags attached to a session at issue time.
///
/// Immutable once attached. Re-tagging is not supported: a different
/// user means a different session, issued and registered from scratch.
#[derive(Clone, Debug, Serialize)]
pub struct SessionTag {
    /// The session the tag belongs to.
    pub session_id: SessionKey,
    /// The user the session was issued for.
    pub user_id: UserId,
    /// The request the session was issued for.
    pub request_id: RequestId,
    /// Conversation/channel scope, if any.
    pub thread_id: Option<ThreadId>,
    /// Agent-execution scope, if any.
    pub run_id: Option<RunId>,
    /// Marker: the session is bound to exactly one request.
    pub is_request_scoped: bool,
    /// Marker: the session was issued by the factory.
    pub factory_managed: bool,
    /// When the tag was attached.
    pub created_at: DateTime<Utc>,
}

/// Builds the tag attached to a session at issue time.
pub fn tag(identity: &Identity, session_id: &SessionKey) -> SessionTag {
    SessionTag {
        session_id: session_id.clone(),
        user_id: identity.user_id().clone(),
        request_id: identity.request_id().clone(),
        thread_id: identity.thread_id().cloned(),
        run_id: identity.run_id().cloned(),
        is_request_scoped: true,
        factory_managed: true,
        created_at: Utc::now(),
    }
}

/// Fails unless the tag marks the session as request-scoped.
pub fn validate_request_scoped(tag: &SessionTag) -> Result<(), SessionError> {
    if tag.is_request_scoped {
        Ok(())
    } else {
        Err(SessionError::NotScoped {
            session_id: tag.session_id.clone(),
            missing_flag: "request-scoped",
        })
    }
}

/// Fails unless the tag marks the session as factory-managed.
pub fn validate_factory_managed(tag: &SessionTag) -> Result<(), SessionError> {
    if tag.factory_managed {
        Ok(())
    } else {
        Err(SessionError::NotScoped {
            session_id: tag.session_id.clone(),
            missing_flag: "factory-managed",
        })
    }
}

/// Fails unless the tag's owner is the expected user.
pub fn validate_ownership(tag: &SessionTag, expected: &UserId) -> Result<(), SessionError> {
    if &tag.user_id == expected {
        Ok(())
    } else {
        Err(SessionError::Isolation {
            session_id: tag.session_id.clone(),
            owner: tag.user_id.clone(),
            expected: expected.clone(),
        })
    }
}
