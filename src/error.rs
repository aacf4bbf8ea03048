use thiserror::Error;

/// Main error type for the market-data hub
#[derive(Error, Debug)]
pub enum TickerHubError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} for {path}")]
    HttpStatus { status: u16, path: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Invalid priority: {0}")]
    InvalidPriority(String),

    // Streaming errors
    #[error("Stream error: {0}")]
    Stream(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TickerHubError {
    /// HTTP 429 from the upstream API
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TickerHubError::RateLimited(_))
    }

    /// Whether the same request may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            TickerHubError::RateLimited(_)
            | TickerHubError::Timeout(_)
            | TickerHubError::Io(_)
            | TickerHubError::WebSocket(_)
            | TickerHubError::Stream(_) => true,
            TickerHubError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            TickerHubError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for TickerHubError
pub type Result<T> = std::result::Result<T, TickerHubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TickerHubError::RateLimited("x".into()).is_rate_limited());
        assert!(TickerHubError::RateLimited("x".into()).is_retryable());
        assert!(TickerHubError::HttpStatus {
            status: 503,
            path: "/quote/AAPL".into()
        }
        .is_retryable());
        assert!(!TickerHubError::HttpStatus {
            status: 404,
            path: "/quote/AAPL".into()
        }
        .is_retryable());
        assert!(!TickerHubError::InvalidMarketData("zero price".into()).is_retryable());
    }
}
