//! Common types used throughout fleetsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Deployment topology the process is bound to.
///
/// Decided once at startup and never changed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Centrally hosted, always reachable, backed by PostgreSQL.
    #[default]
    Connected,
    /// Offline-first node backed by a local SQLite file.
    Disconnected,
}

impl DeploymentMode {
    /// Map the boolean mode flag onto a deployment mode.
    pub fn from_disconnected_flag(disconnected: bool) -> Self {
        if disconnected {
            Self::Disconnected
        } else {
            Self::Connected
        }
    }

    /// Whether this is the offline-first topology.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a boolean flag as written in environment variables.
///
/// Accepts `1/0`, `true/false`, `yes/no`, `on/off` (case-insensitive).
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Secret string (auth tokens, encryption keys) that zeroizes on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for the single call site that needs it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} chars])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(
            DeploymentMode::from_disconnected_flag(true),
            DeploymentMode::Disconnected
        );
        assert_eq!(
            DeploymentMode::from_disconnected_flag(false),
            DeploymentMode::Connected
        );
        assert!(DeploymentMode::Disconnected.is_disconnected());
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&DeploymentMode::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
        let mode: DeploymentMode = serde_json::from_str("\"connected\"").unwrap();
        assert_eq!(mode, DeploymentMode::Connected);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 1 "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_secret_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED; 7 chars])");
        assert_eq!(secret.expose(), "hunter2");
    }

    proptest! {
        #[test]
        fn prop_flag_parsing_ignores_case_and_padding(
            word in prop::sample::select(vec!["true", "yes", "on", "false", "no", "off"]),
            upper in any::<bool>(),
            pad in 0usize..3,
        ) {
            let expected = matches!(word, "true" | "yes" | "on");
            let text = if upper { word.to_uppercase() } else { word.to_string() };
            let padded = format!("{}{}{}", " ".repeat(pad), text, " ".repeat(pad));
            prop_assert_eq!(parse_flag(&padded), Some(expected));
        }
    }
}
