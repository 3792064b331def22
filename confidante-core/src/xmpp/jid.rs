use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Error, anyhow};
use regex::Regex;

static JID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<local>[^@/]+)@)?(?P<domain>[^@/]+)(?:/(?P<resource>.+))?$")
        .expect("JID regex is valid")
});

/// An XMPP address: `[local@]domain[/resource]`.
///
/// A JID with a resource is a *full* JID; without one it is *bare*.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(local: Option<String>, domain: String, resource: Option<String>) -> Self {
        Self {
            local,
            domain,
            resource,
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_full_jid(&self) -> bool {
        self.resource.is_some()
    }

    pub fn is_bare_jid(&self) -> bool {
        self.resource.is_none()
    }

    /// Returns the bare form of this JID, dropping any resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a full JID with the given resource attached.
    pub fn bind(&self, resource: String) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource),
        }
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = JID_PATTERN
            .captures(s)
            .ok_or_else(|| anyhow!("`{}` is not a valid JID", s))?;

        Ok(Jid {
            local: captures.name("local").map(|m| m.as_str().to_string()),
            domain: captures
                .name("domain")
                .ok_or_else(|| anyhow!("`{}` is not a valid JID", s))?
                .as_str()
                .to_string(),
            resource: captures.name("resource").map(|m| m.as_str().to_string()),
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid: Jid = "user@example.com/resource".parse().unwrap();
        assert_eq!(jid.local(), Some("user"));
        assert_eq!(jid.domain(), "example.com");
        assert_eq!(jid.resource(), Some("resource"));
        assert!(jid.is_full_jid());
    }

    #[test]
    fn parses_bare_jid() {
        let jid: Jid = "user@example.com".parse().unwrap();
        assert_eq!(jid.resource(), None);
        assert!(jid.is_bare_jid());
    }

    #[test]
    fn parses_domain_only() {
        let jid: Jid = "example.com".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.domain(), "example.com");
    }

    #[test]
    fn fails_on_empty_string() {
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn round_trips_full_jid() {
        let source = "user@example.com/resource";
        let jid: Jid = source.parse().unwrap();
        assert_eq!(jid.to_string(), source);
    }

    #[test]
    fn to_bare_drops_resource() {
        let jid: Jid = "user@example.com/resource".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "user@example.com");
    }

    #[test]
    fn bind_attaches_resource() {
        let bare: Jid = "user@example.com".parse().unwrap();
        let full = bare.bind("resource".to_string());
        assert_eq!(full.to_string(), "user@example.com/resource");
        assert!(bare.is_bare_jid());
    }

    #[test]
    fn equality_ignores_construction_path() {
        let a: Jid = "user@example.com/resource".parse().unwrap();
        let b = Jid::new(
            Some("user".to_string()),
            "example.com".to_string(),
            Some("resource".to_string()),
        );
        assert_eq!(a, b);
    }
}
