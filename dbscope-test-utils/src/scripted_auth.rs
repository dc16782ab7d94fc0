//! Auth client whose outcomes are scripted per call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbscope_types::auth::{AuthApi, AuthApiService, AuthGrant, AuthServiceHealth, AuthVerdict};
use parking_lot::Mutex;
use secrecy::SecretString;

/// One scripted validation outcome.
#[derive(Clone, Debug)]
pub enum AuthScript {
    /// Answer with a positive verdict for this user.
    Valid(String),
    /// Answer with a negative verdict carrying this reason.
    Invalid(String),
    /// Fail the call with this message.
    Error(String),
    /// Suspend for this long before answering, to trip call deadlines.
    Hang(Duration),
}

struct Inner {
    script: Mutex<VecDeque<AuthScript>>,
    default: AuthScript,
    validate_calls: AtomicU64,
    refresh_calls: AtomicU64,
    logout_calls: AtomicU64,
}

/// An [`AuthApi`] implementation driven by a queue of [`AuthScript`]
/// entries; once the queue is empty every call answers with the default
/// outcome.
#[derive(Clone)]
pub struct ScriptedAuthApi(Arc<Inner>);

impl Default for ScriptedAuthApi {
    fn default() -> Self {
        Self::with_default(AuthScript::Valid("test-user".to_owned()))
    }
}

impl ScriptedAuthApi {
    /// A client that validates every token for `test-user`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A client with the given fallback outcome.
    pub fn with_default(default: AuthScript) -> Self {
        Self(Arc::new(Inner {
            script: Mutex::new(VecDeque::new()),
            default,
            validate_calls: AtomicU64::new(0),
            refresh_calls: AtomicU64::new(0),
            logout_calls: AtomicU64::new(0),
        }))
    }

    /// Wraps this client into the service trait object the core consumes.
    /// Clones share the script and counters.
    pub fn service(&self) -> AuthApiService {
        Arc::new(self.clone())
    }

    /// Queues one outcome for the next validation.
    pub fn push(&self, outcome: AuthScript) {
        self.0.script.lock().push_back(outcome);
    }

    /// Queues the same outcome `n` times.
    pub fn push_repeated(&self, n: usize, outcome: AuthScript) {
        let mut script = self.0.script.lock();
        for _ in 0..n {
            script.push_back(outcome.clone());
        }
    }

    /// How often `validate` was actually called. Calls rejected by a
    /// breaker never reach the client and are not counted.
    pub fn validate_calls(&self) -> u64 {
        self.0.validate_calls.load(Ordering::Relaxed)
    }

    /// How often `refresh` was called.
    pub fn refresh_calls(&self) -> u64 {
        self.0.refresh_calls.load(Ordering::Relaxed)
    }

    /// How often `logout` was called.
    pub fn logout_calls(&self) -> u64 {
        self.0.logout_calls.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> AuthScript {
        self.0
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.0.default.clone())
    }
}

#[async_trait]
impl AuthApi for ScriptedAuthApi {
    async fn validate(&self, _token: &SecretString) -> eyre::Result<AuthVerdict> {
        self.0.validate_calls.fetch_add(1, Ordering::Relaxed);
        match self.next_outcome() {
            AuthScript::Valid(user) => Ok(AuthVerdict::valid_for(user)),
            AuthScript::Invalid(reason) => Ok(AuthVerdict::invalid(reason)),
            AuthScript::Error(message) => Err(eyre::eyre!(message)),
            AuthScript::Hang(duration) => {
                tokio::time::sleep(duration).await;
                // deadlines fire long before this; answer positively so a
                // missing deadline shows up as a surprising success
                Ok(AuthVerdict::valid_for("late-user"))
            }
        }
    }

    async fn refresh(&self, _refresh_token: &SecretString) -> eyre::Result<AuthGrant> {
        self.0.refresh_calls.fetch_add(1, Ordering::Relaxed);
        Ok(AuthGrant {
            access_token: SecretString::from("refreshed-access-token".to_owned()),
            refresh_token: SecretString::from("refreshed-refresh-token".to_owned()),
            expires_in: 3600,
        })
    }

    async fn logout(&self, _token: &SecretString) -> eyre::Result<bool> {
        self.0.logout_calls.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn health(&self) -> eyre::Result<AuthServiceHealth> {
        Ok(AuthServiceHealth {
            status: "ok".to_owned(),
        })
    }
}
