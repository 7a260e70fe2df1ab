//! Error type for CLI commands.

use std::fmt;

/// Errors surfaced to the terminal by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line usage.
    Usage(String),

    /// Failed to set up the runtime or transport.
    Setup(String),

    /// The tileset never produced a root tile.
    BootstrapFailed(String),

    /// Loads did not settle within the configured timeout.
    Timeout { seconds: u64 },
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(msg) => write!(f, "{}", msg),
            Self::Setup(msg) => write!(f, "setup failed: {}", msg),
            Self::BootstrapFailed(msg) => write!(f, "tileset bootstrap failed: {}", msg),
            Self::Timeout { seconds } => {
                write!(f, "loads did not settle within {}s", seconds)
            }
        }
    }
}

impl std::error::Error for CliError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_usage() {
        let err = CliError::Usage("provide a URL".to_string());
        assert_eq!(err.to_string(), "provide a URL");
    }

    #[test]
    fn test_display_timeout() {
        let err = CliError::Timeout { seconds: 30 };
        assert!(err.to_string().contains("30s"));
    }
}
