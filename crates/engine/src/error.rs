//! Error types for the engine crate

use thiserror::Error;

/// Rejected run settings
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("date window of {days} days before {as_of} is out of range")]
    DateWindow { days: i64, as_of: String },
}

/// Errors from the market data provider
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("no data found for {symbol}")]
    NotFound { symbol: String },

    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected upstream payload: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A rule parse error with the character offset it was detected at
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Render the input with a caret under the failing position
    pub fn display_with_context(&self, input: &str) -> String {
        let byte_pos = self.position.min(input.len());
        let column = input
            .get(..byte_pos)
            .map_or_else(|| input.chars().count(), |prefix| prefix.chars().count());
        let caret = " ".repeat(column) + "^";
        format!("{input}\n{caret}\n{self}")
    }
}

/// Errors turning generated text into a runnable strategy
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("empty strategy document")]
    Empty,

    #[error("invalid strategy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported strategy schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("missing rule `{field}`")]
    MissingRule { field: &'static str },

    #[error("rule `{field}`: {context}")]
    Rule {
        field: &'static str,
        error: ParseError,
        context: String,
    },

    #[error("invalid indicator {indicator}: {reason}")]
    InvalidIndicator { indicator: String, reason: String },

    #[error("invalid {field}: {value} (must be between 0 and 100)")]
    InvalidRisk { field: &'static str, value: f64 },
}

/// Errors running a strategy against one symbol
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("no data for {symbol}")]
    NoData { symbol: String },

    #[error("insufficient data for {symbol}: have {bars} bars, need {minimum}")]
    InsufficientData {
        symbol: String,
        bars: usize,
        minimum: usize,
    },

    #[error("indicator setup failed: {0}")]
    Indicator(String),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors calling the completion endpoint
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no LLM API key configured (set LLM_API_KEY or GROQ_API_KEY)")]
    MissingApiKey,

    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("completion response had no content")]
    EmptyResponse,
}
