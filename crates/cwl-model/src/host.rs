//! Host address parsing (`scheme://hostname`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SCHEME_SEPARATOR;

/// Errors produced while parsing a host address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("host must contain a scheme and a hostname, syntax `scheme://host`: {0:?}")]
    MissingSeparator(String),

    #[error("host must contain exactly one `://` separator: {0:?}")]
    TooManySeparators(String),

    #[error("host has an empty scheme: {0:?}")]
    EmptyScheme(String),

    #[error("host has an empty hostname: {0:?}")]
    EmptyHostname(String),
}

/// A compute host address split into its scheme and hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostAddress {
    scheme: String,
    hostname: String,
}

impl HostAddress {
    /// Parse a `scheme://hostname` string.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let parts: Vec<&str> = address.split(SCHEME_SEPARATOR).collect();
        match parts.as_slice() {
            [_] => Err(AddressError::MissingSeparator(address.to_string())),
            [scheme, hostname] => {
                if scheme.is_empty() {
                    return Err(AddressError::EmptyScheme(address.to_string()));
                }
                if hostname.is_empty() {
                    return Err(AddressError::EmptyHostname(address.to_string()));
                }
                Ok(Self {
                    scheme: scheme.to_string(),
                    hostname: hostname.to_string(),
                })
            }
            _ => Err(AddressError::TooManySeparators(address.to_string())),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SCHEME_SEPARATOR, self.hostname)
    }
}

impl FromStr for HostAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HostAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HostAddress> for String {
    fn from(address: HostAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exposes_exact_substrings() {
        let cases = [
            ("ssh://cluster.example.org", "ssh", "cluster.example.org"),
            ("slurm://user@login:2222", "slurm", "user@login:2222"),
            ("local://localhost", "local", "localhost"),
            ("x://y", "x", "y"),
        ];
        for (input, scheme, hostname) in cases {
            let address = HostAddress::parse(input).unwrap();
            assert_eq!(address.scheme(), scheme, "scheme of {input}");
            assert_eq!(address.hostname(), hostname, "hostname of {input}");
            assert_eq!(address.to_string(), input);
        }
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert_eq!(
            HostAddress::parse("cluster.example.org"),
            Err(AddressError::MissingSeparator("cluster.example.org".to_string()))
        );
        assert!(HostAddress::parse("ssh:/host").is_err());
        assert!(HostAddress::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_multiple_separators() {
        assert!(matches!(
            HostAddress::parse("ssh://gateway://host"),
            Err(AddressError::TooManySeparators(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_parts() {
        assert!(matches!(
            HostAddress::parse("://host"),
            Err(AddressError::EmptyScheme(_))
        ));
        assert!(matches!(
            HostAddress::parse("ssh://"),
            Err(AddressError::EmptyHostname(_))
        ));
    }

    #[test]
    fn test_serde_uses_string_form() {
        let address = HostAddress::parse("ssh://host").unwrap();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"ssh://host\"");

        let back: HostAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);

        let bad: Result<HostAddress, _> = serde_json::from_str("\"no-scheme\"");
        assert!(bad.is_err());
    }
}
