//! Error taxonomy of the session isolation core.
//!
//! Session-path errors carry the `session_id`/`user_id`/`request_id` they
//! relate to so callers can correlate them with logs and metrics. Local
//! recovery happens only where explicitly designed (token-cache fallback,
//! rollback on scope error); everything else surfaces.

use std::time::Duration;

use dbscope_types::ident::MalformedIdentifier;
use dbscope_types::{SessionKey, UserId};

use crate::provider::AcquireError;

/// Errors on the session path.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A session was presented to code it does not belong to, or its tag
    /// is missing/inconsistent. Never masked; always fails the request.
    #[error(
        "session isolation violated: session {session_id} belongs to user {owner}, but expected user {expected}"
    )]
    Isolation {
        /// The session whose tag failed validation.
        session_id: SessionKey,
        /// The user the tag names.
        owner: UserId,
        /// The user the caller expected.
        expected: UserId,
    },
    /// A session tag is missing a required marker flag.
    #[error("session isolation violated: session {session_id} is not {missing_flag}")]
    NotScoped {
        /// The session whose tag failed validation.
        session_id: SessionKey,
        /// Human-readable name of the missing marker.
        missing_flag: &'static str,
    },
    /// Use of a session that is closed or was invalidated by forced
    /// cleanup. Indicates a bug in the caller or a reaped leak.
    #[error("session {session_id} is no longer usable: {reason}")]
    Lifecycle {
        /// The session that was used after its lifetime ended.
        session_id: SessionKey,
        /// Why the session is unusable.
        reason: String,
    },
    /// The factory was closed; no sessions can be issued from it anymore.
    #[error("session factory is closed")]
    FactoryClosed,
    /// The connection provider could not hand out a session.
    #[error("could not acquire a database session for user {user_id}")]
    Acquire {
        /// The user the acquisition was for.
        user_id: UserId,
        /// The provider's failure.
        #[source]
        source: AcquireError,
    },
    /// An identifier failed the boundary grammar or the prefix allowlist.
    #[error(transparent)]
    Identifier(
        /// The grammar violation.
        #[from]
        MalformedIdentifier,
    ),
    /// The backend failed while executing on an otherwise healthy session.
    ///
    /// The cause is carried as an `eyre::Report` rather than a source chain
    /// because reports aggregate their own context.
    #[error("database error on session {session_id}: {cause}")]
    Backend {
        /// The session the statement ran on.
        session_id: SessionKey,
        /// The backend's failure.
        cause: eyre::Report,
    },
}

/// Errors surfaced by [`authenticate`](crate::SessionCore::authenticate)
/// and the other breaker-wrapped auth operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The auth dependency is unreachable (breaker open or probing at
    /// capacity) and no cached verdict exists. Adapters map this to a
    /// 503-class outcome.
    #[error("auth service temporarily unavailable (breaker '{breaker}' rejected the call)")]
    Unavailable {
        /// Name of the breaker that rejected the call.
        breaker: String,
    },
    /// The call reached the dependency but exceeded its deadline.
    #[error("auth call timed out after {after:?} (breaker '{breaker}')")]
    Timeout {
        /// Name of the breaker that enforced the deadline.
        breaker: String,
        /// The enforced deadline.
        after: Duration,
    },
    /// The auth service itself failed the call.
    #[error("auth service call failed: {0}")]
    Service(
        /// The service's failure.
        eyre::Report,
    ),
}
