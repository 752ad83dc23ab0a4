//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use mssql_auth::{Credentials, KeyStoreRegistry};
use tds_protocol::version::TdsVersion;
use tds_protocol::{EncryptionLevel, MIN_PACKET_SIZE};

use crate::error::Error;

/// Largest packet size a client may request in LOGIN7.
const MAX_REQUESTED_PACKET_SIZE: usize = 32767;

/// Timeout configuration for the phases of a connection's life.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to establish the transport (default: 15s).
    pub connect_timeout: Duration,
    /// Time to wait for each packet during PRELOGIN and LOGIN7 (default: 30s).
    pub login_timeout: Duration,
    /// Default time to wait for each packet of a request's response (default: 30s).
    ///
    /// The timer restarts whenever a packet arrives.
    pub command_timeout: Duration,
    /// Time to wait for the server to acknowledge an attention (default: 5s).
    pub cancel_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            login_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the login timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the default command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the attention acknowledgement timeout.
    #[must_use]
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }
}

/// Retry policy for the login phase.
///
/// Once logged in nothing is retried; only connection establishment, routing
/// redirects and transient login failures go through this policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration before first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration between retries (default: 30s).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retry attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the initial backoff duration.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff duration.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disable automatic retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the backoff duration for a given retry attempt.
    ///
    /// Attempt 0 is the first try and never waits.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_millis() as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Check if more retries are allowed for the given attempt number.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Configuration for connecting to SQL Server.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Database name.
    pub database: Option<String>,

    /// Authentication credentials.
    pub credentials: Credentials,

    /// Application name (shown in SQL Server management tools).
    pub application_name: String,

    /// Requested TDS packet size, 512 to 32767 (default: 4096).
    pub packet_size: u16,

    /// Requested TDS protocol version (default: 7.4).
    pub tds_version: TdsVersion,

    /// Encryption level announced in PRELOGIN (default: `On`).
    pub encrypt: EncryptionLevel,

    /// Whether to request Always Encrypted support at login.
    pub column_encryption: bool,

    /// Key store providers used to unwrap column encryption keys.
    pub key_stores: Arc<KeyStoreRegistry>,

    /// Retry policy for the login phase.
    pub retry: RetryPolicy,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            database: None,
            credentials: Credentials::sql_server("", ""),
            application_name: "mssql-client".to_string(),
            packet_size: 4096,
            tds_version: TdsVersion::V7_4,
            encrypt: EncryptionLevel::On,
            column_encryption: false,
            key_stores: Arc::new(KeyStoreRegistry::new()),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the TDS protocol version.
    ///
    /// The server may negotiate a lower version in LOGINACK.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the encryption level announced in PRELOGIN.
    ///
    /// `NotSupported` keeps the whole session in plain text and is only
    /// meant for trusted networks and tests.
    #[must_use]
    pub fn encrypt(mut self, level: EncryptionLevel) -> Self {
        self.encrypt = level;
        self
    }

    /// Request Always Encrypted support at login.
    #[must_use]
    pub fn column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption = enabled;
        self
    }

    /// Set the key store providers and turn on column encryption.
    #[must_use]
    pub fn key_stores(mut self, registry: KeyStoreRegistry) -> Self {
        self.key_stores = Arc::new(registry);
        self.column_encryption = true;
        self
    }

    /// Create a new configuration with a different endpoint (for routing).
    #[must_use]
    pub fn with_endpoint(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the maximum number of retry attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.retry.max_retries = max;
        self
    }

    /// Set the timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the default command timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.command_timeout = timeout;
        self
    }

    /// Check that every setting is within the range the protocol allows.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        let size = usize::from(self.packet_size);
        if !(MIN_PACKET_SIZE..=MAX_REQUESTED_PACKET_SIZE).contains(&size) {
            return Err(Error::Config(format!(
                "packet size {size} outside {MIN_PACKET_SIZE}..={MAX_REQUESTED_PACKET_SIZE}"
            )));
        }
        if !self.tds_version.at_least(TdsVersion::V7_1) || self.tds_version.is_tds_8() {
            return Err(Error::Config(format!(
                "unsupported TDS version {:?}",
                self.tds_version
            )));
        }
        if self.column_encryption && !self.tds_version.supports_column_encryption() {
            return Err(Error::Config(
                "column encryption requires TDS 7.4".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoff multiplier must be at least 1.0".into()));
        }
        for (name, timeout) in [
            ("connect", self.timeouts.connect_timeout),
            ("login", self.timeouts.login_timeout),
            ("command", self.timeouts.command_timeout),
            ("cancel", self.timeouts.cancel_timeout),
        ] {
            if timeout.is_zero() {
                return Err(Error::Config(format!("{name} timeout must be positive")));
            }
        }
        Ok(())
    }
}
