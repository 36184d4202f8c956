//! Credential resolution for remote hosts
//!
//! Host properties may carry a `private-key` path and/or a `password`.
//! A private key always wins; a password next to it is the key's passphrase.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Property naming the private key file.
pub const PRIVATE_KEY_PROPERTY: &str = "private-key";

/// Property holding a password, or the private key's passphrase.
pub const PASSWORD_PROPERTY: &str = "password";

/// A secret string that never shows up in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret. Only hand this to the process that consumes it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Authentication material for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Password(Secret),
    Certificate {
        key_path: PathBuf,
        passphrase: Option<Secret>,
    },
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::Certificate { .. } => "certificate",
        }
    }

    /// The secret that must be typed at an interactive prompt, if any.
    pub fn prompt_secret(&self) -> Option<&Secret> {
        match self {
            Credential::Password(secret) => Some(secret),
            Credential::Certificate { passphrase, .. } => passphrase.as_ref(),
        }
    }
}

/// Resolve a credential from host properties.
///
/// Returns `None` when neither key is present; the backend then relies on
/// ambient authentication such as an SSH agent.
pub fn resolve(properties: &BTreeMap<String, String>) -> Option<Credential> {
    let password = properties.get(PASSWORD_PROPERTY).map(Secret::new);

    match properties.get(PRIVATE_KEY_PROPERTY) {
        Some(key_path) => Some(Credential::Certificate {
            key_path: PathBuf::from(key_path),
            passphrase: password,
        }),
        None => password.map(Credential::Password),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_properties_no_credential() {
        assert_eq!(resolve(&props(&[])), None);
        assert_eq!(resolve(&props(&[("xenon-property-Port", "22")])), None);
    }

    #[test]
    fn test_password_only() {
        let credential = resolve(&props(&[("password", "p")])).unwrap();
        assert_eq!(credential, Credential::Password(Secret::new("p")));
        assert_eq!(credential.kind(), "password");
    }

    #[test]
    fn test_private_key_with_passphrase() {
        let credential = resolve(&props(&[("private-key", "/k"), ("password", "pass")])).unwrap();
        assert_eq!(
            credential,
            Credential::Certificate {
                key_path: PathBuf::from("/k"),
                passphrase: Some(Secret::new("pass")),
            }
        );
        assert_eq!(credential.prompt_secret().map(Secret::expose), Some("pass"));
    }

    #[test]
    fn test_private_key_without_passphrase() {
        let credential = resolve(&props(&[("private-key", "/k")])).unwrap();
        assert_eq!(credential.kind(), "certificate");
        assert!(credential.prompt_secret().is_none());
    }

    #[test]
    fn test_secret_is_redacted() {
        let credential = resolve(&props(&[("password", "hunter2")])).unwrap();
        let debug = format!("{credential:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!(Secret::new("hunter2").to_string(), "***");
    }
}
