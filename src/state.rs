use std::sync::Arc;

use crate::config::ControlSettings;
use crate::crypto::SecretCipher;
use crate::events::EventManager;
use crate::rate_limit::SignupRateLimiter;
use crate::runner_client::RunnerClient;

/// Control-plane application context threaded through handlers via
/// `Extension<Arc<AppContext>>`. Constructor wiring replaces any global
/// singletons; only the pure token helpers live outside of it.
pub struct AppContext {
    pub settings: ControlSettings,
    pub cipher: SecretCipher,
    pub runner: RunnerClient,
    pub events: Arc<EventManager>,
    pub signup_limiter: SignupRateLimiter,
}
