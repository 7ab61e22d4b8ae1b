//! Error taxonomy for the scan pipeline.

use std::time::Duration;

use thiserror::Error;

/// Delay used when an endpoint rate-limits without saying for how long.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Errors that can occur while scanning, decoding, or committing.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// Timeout, connection reset, 5xx. Retried with exponential backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The provider asked us to slow down.
    #[error("rate limited (retry after {}ms)", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// A record matched the expected shape but its fields could not be extracted.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The stored cursor moved underneath us (second writer or stale read).
    #[error(
        "concurrent modification of {protocol}/{chain}: expected cursor {expected:?}, found {found:?}"
    )]
    ConcurrentModification {
        protocol: String,
        chain: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Misconfigured endpoint, credential, or engine configuration.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// A `get_logs` call exceeded the provider's maximum block range.
    #[error("block range {from}..={to} exceeds max range {max_range}")]
    RangeTooLarge { from: u64, to: u64, max_range: u64 },

    /// Progress store or ledger failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ScanError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::RateLimited { .. })
    }

    /// Returns `true` if the error can never succeed without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalConfig(_) | Self::RangeTooLarge { .. })
    }

    /// Stable snake_case reason code, used as the key in skip/failure counts.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedRecord(_) => "malformed_record",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::FatalConfig(_) => "fatal_config",
            Self::RangeTooLarge { .. } => "range_too_large",
            Self::Storage(_) => "storage",
        }
    }

    /// Classify a non-2xx HTTP response from a chain endpoint.
    ///
    /// `retry_after` is the raw `Retry-After` header (seconds); 429 without it
    /// waits [`DEFAULT_RETRY_AFTER`].
    pub fn from_http_status(status: u16, retry_after: Option<&str>, body: &str) -> Self {
        let body = match body.char_indices().nth(200) {
            Some((idx, _)) => &body[..idx],
            None => body,
        };
        match status {
            429 => Self::RateLimited {
                retry_after: retry_after
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RETRY_AFTER),
            },
            401 | 403 => Self::FatalConfig(format!("endpoint rejected credentials (HTTP {status})")),
            408 | 500..=599 => Self::TransientNetwork(format!("HTTP {status}: {body}")),
            _ => Self::FatalConfig(format!("HTTP {status}: {body}")),
        }
    }
}
