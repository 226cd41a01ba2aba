//! Core error types for vmhost

use std::fmt;
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

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors reported by a VM driver
#[derive(Error, Debug)]
pub enum DriverError {
    /// The driver does not implement this capability
    #[error("Driver does not support {0}")]
    Unsupported(&'static str),

    /// The VM could not be launched
    #[error("Failed to start VM: {0}")]
    Start(String),

    /// The VM could not be stopped
    #[error("Failed to stop VM: {0}")]
    Stop(String),

    /// The VM exited on its own while it was supposed to be running
    #[error("VM exited unexpectedly: {0}")]
    Exited(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Several independent failures reported together.
///
/// Pushing never short-circuits; callers collect every failure of a batch
/// of independent steps and surface them once.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure
    pub fn push(&mut self, err: impl Into<anyhow::Error>) {
        self.errors.push(err.into());
    }

    /// Record the error of `result`, if any
    pub fn check<T, E: Into<anyhow::Error>>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    /// Absorb all failures of another collection
    pub fn extend(&mut self, other: MultiError) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// One rendered message per recorded failure, including causes
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| format!("{:#}", e)).collect()
    }

    /// `Ok(())` when nothing failed
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:#}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl From<anyhow::Error> for MultiError {
    fn from(err: anyhow::Error) -> Self {
        Self { errors: vec![err] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }

    #[test]
    fn test_display_joins_lines() {
        let mut errs = MultiError::new();
        errs.push(anyhow::anyhow!("first"));
        errs.push(ConfigError::Invalid("second".to_string()));
        assert_eq!(errs.len(), 2);
        assert_eq!(errs.to_string(), "first\nInvalid config: second");
    }

    #[test]
    fn test_check_records_error() {
        let mut errs = MultiError::new();
        let ok: Option<u32> = errs.check(Ok::<_, std::io::Error>(7));
        let bad: Option<u32> = errs.check(Err(std::io::Error::other("boom")));
        assert_eq!(ok, Some(7));
        assert_eq!(bad, None);
        assert_eq!(errs.messages(), vec!["boom".to_string()]);
    }

    #[test]
    fn test_messages_include_context() {
        use anyhow::Context;

        let mut errs = MultiError::new();
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("inner")).context("outer");
        errs.check(res);
        assert_eq!(errs.messages(), vec!["outer: inner".to_string()]);
    }
}
