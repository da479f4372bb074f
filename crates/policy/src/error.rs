//! Validation error kinds. Each variant carries the path of the offending
//! field so operator tooling can point at the exact input that failed.

use thiserror::Error;

/// A closed set of intake validation failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{0}: policy name must be a DNS-label-like identifier")]
    InvalidName(String),

    #[error("{0}: a policy requires at least one rule")]
    EmptyRules(String),

    #[error("{0}: a rule requires at least one match condition")]
    EmptyMatch(String),

    #[error("{0}: percentage must be between 0 and 100, got {1}")]
    PercentageOutOfRange(String, i32),

    #[error("{0}: abort status must be between 400 and 599, got {1}")]
    AbortStatusOutOfRange(String, u16),

    #[error("{0}: a rule requires an abort or delay action")]
    MissingAction(String),

    #[error("{0}: abort and delay are mutually exclusive")]
    ConflictingActions(String),

    #[error("{0}: exactly one of fixedDelayMs, range, normal must be set")]
    AmbiguousDelay(String),

    #[error("{0}: delay range minimum exceeds maximum")]
    InvertedDelayRange(String),

    #[error("{0}: delay parameters must be non-negative and finite")]
    InvalidDelayParameters(String),

    #[error("{0}: invalid regex pattern: {1}")]
    InvalidRegex(String, String),

    #[error("{0}: invert requires a matcher to invert")]
    InvertWithoutMatcher(String),

    #[error("{0}: header matchers are mutually exclusive")]
    ConflictingHeaderMatchers(String),

    #[error("{0}: header match requires a non-empty header name")]
    EmptyHeaderName(String),

    #[error("{0}: duration_seconds must not exceed {1}")]
    DurationTooLong(String, u64),
}

impl ValidationError {
    /// Path of the field this error points at, e.g. `spec.rules[2].fault`.
    pub fn field(&self) -> &str {
        match self {
            Self::InvalidName(field)
            | Self::EmptyRules(field)
            | Self::EmptyMatch(field)
            | Self::PercentageOutOfRange(field, _)
            | Self::AbortStatusOutOfRange(field, _)
            | Self::MissingAction(field)
            | Self::ConflictingActions(field)
            | Self::AmbiguousDelay(field)
            | Self::InvertedDelayRange(field)
            | Self::InvalidDelayParameters(field)
            | Self::InvalidRegex(field, _)
            | Self::InvertWithoutMatcher(field)
            | Self::ConflictingHeaderMatchers(field)
            | Self::EmptyHeaderName(field)
            | Self::DurationTooLong(field, _) => field,
        }
    }
}
