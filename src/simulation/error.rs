//! Errors from loading and checking simulation parameters and scenes.

use std::fmt;

/// Errors arising while reading or validating configuration files.
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration file could not be read.
    Io {
        /// The file that was accessed.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
    /// A document is not valid YAML or does not match the expected layout.
    Parse {
        /// Where the document came from.
        origin: String,
        /// The underlying error.
        source: serde_yaml::Error,
    },
    /// An overwrite file names a key that does not exist.
    UnknownKey(String),
    /// A parameter has a value the solver cannot work with.
    InvalidParameter {
        /// The parameter name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// A scene entry is degenerate.
    InvalidScene(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed reading `{path}`: {source}"),
            Self::Parse { origin, source } => write!(f, "failed parsing {origin}: {source}"),
            Self::UnknownKey(key) => write!(f, "not able to find attribute `{key}`"),
            Self::InvalidParameter { name, reason } => write!(f, "invalid parameter `{name}`: {reason}"),
            Self::InvalidScene(reason) => write!(f, "invalid scene: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) fn read_file(path: &std::path::Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
