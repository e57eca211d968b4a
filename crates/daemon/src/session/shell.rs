//! Shell selection.
//!
//! Only a fixed allow-list of shells may be started. The requested shell kind
//! arrives from an untrusted consumer, so it is parsed into [`ShellKind`] and
//! only [`ShellKind::program`] ever reaches process execution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::pty::SessionError;

/// Shells a session may run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    #[default]
    Bash,
    Zsh,
    Fish,
    Sh,
}

impl ShellKind {
    /// Every allowed shell, in preference order.
    pub const ALL: [ShellKind; 4] = [ShellKind::Bash, ShellKind::Zsh, ShellKind::Fish, ShellKind::Sh];

    /// The program name handed to process execution.
    pub fn program(&self) -> &'static str {
        match self {
            ShellKind::Bash => "bash",
            ShellKind::Zsh => "zsh",
            ShellKind::Fish => "fish",
            ShellKind::Sh => "sh",
        }
    }

    /// Resolve a requested shell, substituting `default` when it is not allowed.
    ///
    /// Returns the shell to run and whether a substitution happened.
    pub fn resolve(requested: &str, default: ShellKind) -> (ShellKind, bool) {
        match requested.parse::<ShellKind>() {
            Ok(kind) => (kind, false),
            Err(e) => {
                tracing::warn!(
                    requested = %requested.escape_debug(),
                    fallback = %default,
                    error = %e,
                    "Requested shell not allowed, using default"
                );
                (default, true)
            }
        }
    }
}

impl FromStr for ShellKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShellKind::ALL
            .into_iter()
            .find(|kind| kind.program() == s)
            .ok_or_else(|| SessionError::InvalidShell(s.to_string()))
    }
}

impl fmt::Display for ShellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_shells() {
        assert_eq!("bash".parse::<ShellKind>().unwrap(), ShellKind::Bash);
        assert_eq!("zsh".parse::<ShellKind>().unwrap(), ShellKind::Zsh);
        assert_eq!("fish".parse::<ShellKind>().unwrap(), ShellKind::Fish);
        assert_eq!("sh".parse::<ShellKind>().unwrap(), ShellKind::Sh);
    }

    #[test]
    fn test_parse_rejects_everything_else() {
        for bad in [
            "totally-invalid",
            "",
            "BASH",
            "/bin/bash",
            "bash -c 'rm -rf /'",
            "sh; id",
            "python",
        ] {
            let err = bad.parse::<ShellKind>().unwrap_err();
            assert!(matches!(err, SessionError::InvalidShell(_)), "{}", bad);
        }
    }

    #[test]
    fn test_resolve_substitutes_default() {
        assert_eq!(
            ShellKind::resolve("totally-invalid", ShellKind::Sh),
            (ShellKind::Sh, true)
        );
        assert_eq!(
            ShellKind::resolve("zsh", ShellKind::Sh),
            (ShellKind::Zsh, false)
        );
    }

    #[test]
    fn test_display_matches_program() {
        for kind in ShellKind::ALL {
            assert_eq!(kind.to_string(), kind.program());
        }
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&ShellKind::Fish).unwrap(), r#""fish""#);
        let kind: ShellKind = serde_json::from_str(r#""sh""#).unwrap();
        assert_eq!(kind, ShellKind::Sh);
    }
}
