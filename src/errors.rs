use crate::models::QuoteStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Market discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// The operation observed a newer run epoch and stopped; never shown to users.
    #[error("Cancelled")]
    Cancelled,

    #[error("Job failed: {0}")]
    Job(String),

    #[error("{0}")]
    Other(String),
}

/// Failure reported by the exchange connectivity gateway for one call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("{0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("{0} not listed")]
    NoSymbol(String),

    #[error("unsupported exchange {0}")]
    UnsupportedExchange(String),
}

impl GatewayError {
    /// Failures that put the whole exchange on error cooldown.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::Timeout(_) | GatewayError::RateLimited(_)
        )
    }
}

/// Why a canonical pair could not be turned into a venue symbol right now.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("Loading markets")]
    WarmingUp,

    #[error("{0} not listed")]
    NoSymbol(String),

    #[error("{message} (cooldown {remaining_secs}s)")]
    Cooldown { message: String, remaining_secs: u64 },
}

impl ResolveError {
    pub fn status(&self) -> QuoteStatus {
        match self {
            ResolveError::WarmingUp => QuoteStatus::WarmingUp,
            ResolveError::NoSymbol(_) => QuoteStatus::NoSymbol,
            ResolveError::Cooldown { .. } => QuoteStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_timeout_count_as_transport() {
        assert!(GatewayError::RateLimited("429".into()).is_transport());
        assert!(GatewayError::Timeout("10s".into()).is_transport());
        assert!(!GatewayError::NoSymbol("BTC/EUR".into()).is_transport());
    }

    #[test]
    fn no_symbol_message_names_the_pair() {
        let err = GatewayError::NoSymbol("BTC/EUR".into());
        assert_eq!(err.to_string(), "BTC/EUR not listed");
    }

    #[test]
    fn cooldown_carries_remaining_wait() {
        let err = ResolveError::Cooldown {
            message: "connection reset".into(),
            remaining_secs: 9,
        };
        assert_eq!(err.to_string(), "connection reset (cooldown 9s)");
        assert_eq!(err.status(), QuoteStatus::Error);
        assert_eq!(ResolveError::WarmingUp.status(), QuoteStatus::WarmingUp);
    }
}
