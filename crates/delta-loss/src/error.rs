use alloc::string::String;

use burn::config::ConfigError;

/// Errors raised while selecting or loading a loss.
#[derive(thiserror::Error, Debug)]
pub enum LossError {
    /// The loss type name is not one of the known losses.
    #[error("Unknown loss type `{0}`")]
    UnknownLoss(String),

    /// The configuration could not be parsed.
    #[error("Invalid loss configuration: {0}")]
    Config(ConfigError),

    /// Reading or writing a configuration file failed.
    #[cfg(feature = "std")]
    #[error("Configuration I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConfigError> for LossError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}
