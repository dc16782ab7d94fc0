//! Structured identifier grammar.
//!
//! Every identifier the core emits at a boundary has the shape
//! `{prefix}_{operation}_{base36(millis)}_{base36(random64)}`, where the
//! prefix is one of the well-known [`IdPrefix`] values. The time component
//! makes identifiers sortable by creation order, the random component makes
//! them globally unique with high probability.
//!
//! Persistence collaborators only accept thread identifiers whose prefix
//! passes the configured [`PrefixAllowlist`]; ad-hoc prefixes (for example
//! `websocket_factory_…`) are rejected before any session is issued.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::{RequestId, RunId, ThreadId, UserId};

/// Error returned when an identifier string does not follow the grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedIdentifier {
    /// The identifier has no `_`-separated prefix.
    #[error("identifier has no prefix")]
    MissingPrefix,
    /// The identifier has a prefix but nothing after it.
    #[error("identifier has an empty body")]
    EmptyBody,
    /// The prefix is not accepted in this position.
    #[error("identifier prefix '{0}' is not in the allowlist")]
    PrefixNotAllowed(
        /// The offending prefix.
        String,
    ),
}

/// The well-known identifier prefixes emitted by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPrefix {
    /// Conversation/channel scope.
    Thread,
    /// Agent-execution scope.
    Run,
    /// One unit of work.
    Req,
    /// WebSocket connection scope.
    Ws,
    /// Issued database session.
    Session,
}

impl IdPrefix {
    /// The prefix as it appears at the front of an identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Thread => "thread",
            IdPrefix::Run => "run",
            IdPrefix::Req => "req",
            IdPrefix::Ws => "ws",
            IdPrefix::Session => "session",
        }
    }
}

impl fmt::Display for IdPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdPrefix {
    type Err = MalformedIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(IdPrefix::Thread),
            "run" => Ok(IdPrefix::Run),
            "req" => Ok(IdPrefix::Req),
            "ws" => Ok(IdPrefix::Ws),
            "session" => Ok(IdPrefix::Session),
            other => Err(MalformedIdentifier::PrefixNotAllowed(other.to_owned())),
        }
    }
}

/// A structured identifier following the boundary grammar.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopedId(String);

impl ScopedId {
    /// Generates a fresh identifier for the given prefix and operation tag.
    pub fn generate(prefix: IdPrefix, operation: &str) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let entropy: u64 = rand::thread_rng().r#gen();
        Self(format!(
            "{}_{}_{}_{}",
            prefix,
            operation,
            base36(millis),
            base36(entropy)
        ))
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

impl fmt::Display for ScopedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed identifier, split into its prefix and the remainder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedId<'a> {
    /// Everything before the first underscore.
    pub prefix: &'a str,
    /// Everything after the first underscore. Never empty.
    pub body: &'a str,
}

/// Splits an identifier into `{prefix, body}` at the first underscore.
///
/// This only checks the shape of the string; whether the prefix is accepted
/// in a given position is decided by [`PrefixAllowlist::check_thread_id`].
pub fn parse_id(s: &str) -> Result<ParsedId<'_>, MalformedIdentifier> {
    let (prefix, body) = s.split_once('_').ok_or(MalformedIdentifier::MissingPrefix)?;
    if prefix.is_empty() {
        return Err(MalformedIdentifier::MissingPrefix);
    }
    if body.is_empty() {
        return Err(MalformedIdentifier::EmptyBody);
    }
    Ok(ParsedId { prefix, body })
}

/// Generates the `(thread_id, run_id, request_id)` triple for one user
/// operation.
///
/// Each identifier carries the operation tag and is globally unique with
/// high probability. The user id does not become part of the identifiers;
/// it is accepted so call sites read as "ids for this user's operation"
/// and can be logged together.
pub fn generate_user_context_ids(
    _user_id: &UserId,
    operation: &str,
) -> (ThreadId, RunId, RequestId) {
    let thread_id = ThreadId::new(ScopedId::generate(IdPrefix::Thread, operation).into_inner());
    let run_id = RunId::new(ScopedId::generate(IdPrefix::Run, operation).into_inner());
    let request_id = RequestId::new(ScopedId::generate(IdPrefix::Req, operation).into_inner());
    (thread_id, run_id, request_id)
}

/// The set of identifier prefixes accepted when persisting thread
/// identifiers.
///
/// Defaults to `["thread"]`. Identifiers with any other prefix fail
/// [`PrefixAllowlist::check_thread_id`] and must be rejected before a
/// session is issued for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixAllowlist(Vec<String>);

impl Default for PrefixAllowlist {
    fn default() -> Self {
        Self(vec![IdPrefix::Thread.as_str().to_owned()])
    }
}

impl PrefixAllowlist {
    /// Builds an allowlist from the given prefixes.
    pub fn new(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(prefixes.into_iter().map(Into::into).collect())
    }

    /// The accepted prefixes.
    pub fn prefixes(&self) -> &[String] {
        &self.0
    }

    /// Validates a thread identifier against the allowlist.
    pub fn check_thread_id(&self, thread_id: &ThreadId) -> Result<(), MalformedIdentifier> {
        let parsed = parse_id(thread_id.as_str())?;
        if self.0.iter().any(|p| p == parsed.prefix) {
            Ok(())
        } else {
            Err(MalformedIdentifier::PrefixNotAllowed(
                parsed.prefix.to_owned(),
            ))
        }
    }
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    // only ASCII digits in the table
    String::from_utf8(out).expect("base36 digits are ASCII")
}
