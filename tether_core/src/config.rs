//! Transport configuration.
//!
//! Everything that selects transport behaviour is carried in a
//! [`TransportConfig`] value passed to constructors. Reading the process
//! environment is left to binaries (see [`is_affirmative`]).

use core::time::Duration;

use crate::kind::TransportKind;

/// Default maximum message size accepted by either transport (100 MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 100_000_000;

/// Default sub-path, beneath the connection's address, at which the
/// long-poll listener is mounted.
pub const DEFAULT_FALLBACK_PATH: &str = "/engine.io/";

/// Default time a long-poll request is held open before returning empty.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(25);

/// Transport selection and limits shared by clients and acceptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Client: start negotiation with [`TransportKind::Fallback`] instead of
    /// trying the upgrade first.
    pub force_fallback: bool,

    /// Acceptor: refuse upgrade handshakes and serve long-polling only.
    pub polling_only: bool,

    /// Acceptor: mount the long-poll listener next to the upgrade listener.
    pub enable_fallback: bool,

    /// Largest message either listener accepts.
    pub max_payload: usize,

    /// Sub-path of the long-poll listener. Always starts and ends with `/`.
    pub fallback_path: String,

    /// How long the server holds an empty long-poll request.
    pub poll_timeout: Duration,
}

impl TransportConfig {
    /// Default configuration: upgrade first, both listeners enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            force_fallback: false,
            polling_only: false,
            enable_fallback: true,
            max_payload: DEFAULT_MAX_PAYLOAD,
            fallback_path: DEFAULT_FALLBACK_PATH.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Pin the client to the fallback transport from the start.
    #[must_use]
    pub fn with_force_fallback(mut self, force: bool) -> Self {
        self.force_fallback = force;
        self
    }

    /// Serve long-polling only.
    #[must_use]
    pub fn with_polling_only(mut self, polling_only: bool) -> Self {
        self.polling_only = polling_only;
        self
    }

    /// Enable or disable the long-poll listener.
    #[must_use]
    pub fn with_fallback_enabled(mut self, enabled: bool) -> Self {
        self.enable_fallback = enabled;
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Set the long-poll hold time.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the long-poll mount path. A missing leading or trailing `/` is added.
    #[must_use]
    pub fn with_fallback_path(mut self, path: &str) -> Self {
        let trimmed = path.trim_matches('/');
        self.fallback_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        self
    }

    /// The transport a client tries first.
    #[must_use]
    pub const fn preferred_kind(&self) -> TransportKind {
        if self.force_fallback {
            TransportKind::Fallback
        } else {
            TransportKind::Primary
        }
    }

    /// Whether the acceptor should answer upgrade handshakes.
    #[must_use]
    pub const fn accepts_upgrades(&self) -> bool {
        !self.polling_only
    }

    /// Whether the acceptor should serve long-poll requests.
    #[must_use]
    pub const fn accepts_polling(&self) -> bool {
        self.enable_fallback || self.polling_only
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpret a boolean-ish setting such as an environment variable value.
///
/// `1`, `true`, `yes`, `y` and `on` (any case, surrounding whitespace
/// ignored) are affirmative; everything else is not.
#[must_use]
pub fn is_affirmative(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}
