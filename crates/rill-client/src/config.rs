// Client-side defaults.
use std::time::Duration;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_ID_PREFIX: &str = "rill";
pub(crate) const CONNECT_TIMEOUT_ENV: &str = "RILL_CONNECT_TIMEOUT_MS";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long construction blocks waiting for the gateway connection.
    pub connect_timeout: Duration,
    /// Prefix for generated envelope ids.
    pub id_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            id_prefix: DEFAULT_ID_PREFIX.to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults with environment overrides applied. Invalid values are
    /// logged and ignored rather than failing construction.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(CONNECT_TIMEOUT_ENV) {
            match parse_timeout_ms(&raw) {
                Some(timeout) => config.connect_timeout = timeout,
                None => {
                    tracing::warn!(var = CONNECT_TIMEOUT_ENV, value = %raw, "ignoring invalid timeout override")
                }
            }
        }
        config
    }
}

fn parse_timeout_ms(raw: &str) -> Option<Duration> {
    raw.parse::<u64>().ok().map(Duration::from_millis)
}
