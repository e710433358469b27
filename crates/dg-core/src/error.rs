//! Core error types for dockgate

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Argument template errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("Unterminated placeholder at offset {0}")]
    Unterminated(usize),

    /// Placeholder body is not a `.Field` reference
    #[error("Malformed placeholder: {{{{{0}}}}}")]
    Malformed(String),

    /// Placeholder names a field the policy does not have
    #[error("Unknown field: {0}")]
    UnknownField(String),
}

/// Shell-word splitting errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// A quote was opened but never closed
    #[error("Unterminated {0} quote")]
    UnterminatedQuote(char),

    /// Input ends with a lone backslash
    #[error("Trailing escape character")]
    TrailingEscape,
}
