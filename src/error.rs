use thiserror::Error;

use crate::domain::OrderAction;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum SlicerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors (order snapshot file, log setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Task / command validation
    #[error("Validation failed: {0}")]
    Validation(String),

    // Wire messages that do not parse or are missing required fields
    #[error("Malformed message: {0}")]
    Malformed(String),

    // Reference id the ledger has no record of
    #[error("Unknown reference id: {0}")]
    UnknownRefId(String),

    // Bus transport failures (channel closed, publish refused)
    #[error("Bus error: {0}")]
    Bus(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SlicerError
pub type Result<T> = std::result::Result<T, SlicerError>;

/// Classified gateway error responses.
///
/// The gateway reports errors as a numeric code string whose first three
/// digits identify the venue adapter; classification keys off the suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// Order size below the exchange minimum
    SizeTooSmall,
    /// Price or quantity outside the exchange's accepted range
    OutOfRange,
    /// Gateway- or exchange-side systemic fault
    Systemic,
    /// Request rate exceeded; the caller should back off
    RateLimited,
    /// Anything the code table does not cover
    Unclassified,
}

impl GatewayErrorKind {
    /// Classify a gateway error code for a given request action.
    ///
    /// Rate limiting is only actionable on inspect requests (the polling
    /// path); on other actions the same code is treated as systemic.
    pub fn classify(error_code: &str, action: OrderAction) -> Self {
        if error_code.len() < 4 {
            return GatewayErrorKind::Unclassified;
        }
        match &error_code[3..] {
            "105" | "106" => GatewayErrorKind::SizeTooSmall,
            "109" | "110" => GatewayErrorKind::OutOfRange,
            "500" | "501" | "503" | "508" | "509" => GatewayErrorKind::Systemic,
            "502" => {
                if action == OrderAction::Inspect {
                    GatewayErrorKind::RateLimited
                } else {
                    GatewayErrorKind::Systemic
                }
            }
            _ => GatewayErrorKind::Unclassified,
        }
    }

    /// Human-readable prefix attached to the gateway's own message.
    pub fn describe(&self) -> &'static str {
        match self {
            GatewayErrorKind::SizeTooSmall => "order size below exchange minimum",
            GatewayErrorKind::OutOfRange => "price or quantity out of range",
            GatewayErrorKind::Systemic => "gateway system error",
            GatewayErrorKind::RateLimited => "request rate exceeded",
            GatewayErrorKind::Unclassified => "unclassified gateway error",
        }
    }

    /// Errors that count toward the escalation streak.
    pub fn is_escalatable(&self) -> bool {
        matches!(self, GatewayErrorKind::Systemic | GatewayErrorKind::Unclassified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_suffix() {
        assert_eq!(
            GatewayErrorKind::classify("001105", OrderAction::Send),
            GatewayErrorKind::SizeTooSmall
        );
        assert_eq!(
            GatewayErrorKind::classify("042110", OrderAction::Send),
            GatewayErrorKind::OutOfRange
        );
        assert_eq!(
            GatewayErrorKind::classify("007503", OrderAction::Cancel),
            GatewayErrorKind::Systemic
        );
        assert_eq!(
            GatewayErrorKind::classify("007502", OrderAction::Inspect),
            GatewayErrorKind::RateLimited
        );
        // 502 outside the polling path is not a backoff signal
        assert_eq!(
            GatewayErrorKind::classify("007502", OrderAction::Send),
            GatewayErrorKind::Systemic
        );
        assert_eq!(
            GatewayErrorKind::classify("999999", OrderAction::Send),
            GatewayErrorKind::Unclassified
        );
        assert_eq!(
            GatewayErrorKind::classify("x", OrderAction::Send),
            GatewayErrorKind::Unclassified
        );
    }

    #[test]
    fn escalation_set() {
        assert!(GatewayErrorKind::Systemic.is_escalatable());
        assert!(GatewayErrorKind::Unclassified.is_escalatable());
        assert!(!GatewayErrorKind::SizeTooSmall.is_escalatable());
        assert!(!GatewayErrorKind::RateLimited.is_escalatable());
    }
}
