//! Error types for value parsing
//!
//! Exchange payloads carry prices, quantities and symbols as strings.
//! Everything that can go wrong turning them into typed values lands here.

use thiserror::Error;

/// Failure to turn raw exchange text into a typed value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Unknown stream kind: {0}")]
    UnknownStream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::InvalidPrice("-1".to_string());
        assert_eq!(err.to_string(), "Invalid price: -1");
    }

    #[test]
    fn test_symbol_error_quotes_input() {
        let err = ParseError::InvalidSymbol("btc usdt".to_string());
        assert!(err.to_string().contains("\"btc usdt\""));
    }
}
