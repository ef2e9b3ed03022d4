use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_NAMESPACE: &str = "Default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    User,
    Group,
}

/// How a domain qualifier is embedded in a principal's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainFormat {
    /// Bare name, no domain.
    None,
    /// `user@domain`
    Dns,
    /// `domain\user`
    Netbios,
    /// `domain/user`
    NetbiosForwardSlash,
}

/// A user or group, identified by name within a namespace.
///
/// The name may carry a domain in any of the [`DomainFormat`]s.
/// Equality, ordering and hashing all work on the *parsed* form, so
/// `DOMAIN\user` and `user@DOMAIN` are the same principal; the raw
/// spelling is preserved for display and feed emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    kind: PrincipalKind,
    name: String,
    namespace: String,
}

impl Principal {
    pub fn new<S: Into<String>, N: Into<String>>(
        kind: PrincipalKind,
        name: S,
        namespace: N,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn user<S: Into<String>>(name: S) -> Self {
        Self::new(PrincipalKind::User, name, DEFAULT_NAMESPACE)
    }

    pub fn group<S: Into<String>>(name: S) -> Self {
        Self::new(PrincipalKind::Group, name, DEFAULT_NAMESPACE)
    }

    pub fn user_in_namespace<S: Into<String>, N: Into<String>>(name: S, namespace: N) -> Self {
        Self::new(PrincipalKind::User, name, namespace)
    }

    pub fn group_in_namespace<S: Into<String>, N: Into<String>>(name: S, namespace: N) -> Self {
        Self::new(PrincipalKind::Group, name, namespace)
    }

    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    pub fn is_group(&self) -> bool {
        self.kind == PrincipalKind::Group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// A principal is usable in an ACL or group feed only if its name
    /// and namespace are non-empty and carry no surrounding whitespace.
    pub fn is_well_formed(&self) -> bool {
        !self.name.is_empty()
            && self.name.trim() == self.name
            && !self.namespace.is_empty()
            && self.namespace.trim() == self.namespace
    }

    /// Split the name into its plain name and domain.
    pub fn parse(&self) -> ParsedPrincipal {
        let (plain_name, domain, domain_format) = if let Some(at) = self.name.find('@') {
            (
                self.name[..at].to_string(),
                self.name[at + 1..].to_string(),
                DomainFormat::Dns,
            )
        } else if let Some(bs) = self.name.find('\\') {
            (
                self.name[bs + 1..].to_string(),
                self.name[..bs].to_string(),
                DomainFormat::Netbios,
            )
        } else if let Some(fs) = self.name.find('/') {
            (
                self.name[fs + 1..].to_string(),
                self.name[..fs].to_string(),
                DomainFormat::NetbiosForwardSlash,
            )
        } else {
            (self.name.clone(), String::new(), DomainFormat::None)
        };
        ParsedPrincipal {
            is_group: self.is_group(),
            plain_name,
            domain,
            domain_format,
            namespace: self.namespace.clone(),
        }
    }

    fn parsed_key(&self) -> (String, PrincipalKind, String, String) {
        let parsed = self.parse();
        (
            self.namespace.clone(),
            self.kind,
            parsed.plain_name,
            parsed.domain,
        )
    }

    /// Ordering that lowercases namespace, domain and plain name on the
    /// fly. Case-insensitive ACLs keep their members sorted with this,
    /// leaving the original spelling intact.
    pub fn cmp_ignore_case(&self, other: &Self) -> Ordering {
        let a = self.parse();
        let b = other.parse();
        (
            self.namespace.to_lowercase(),
            self.kind,
            a.plain_name.to_lowercase(),
            a.domain.to_lowercase(),
        )
            .cmp(&(
                other.namespace.to_lowercase(),
                other.kind,
                b.plain_name.to_lowercase(),
                b.domain.to_lowercase(),
            ))
    }
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        self.parsed_key() == other.parsed_key()
    }
}

impl Eq for Principal {}

impl PartialOrd for Principal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Principal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed_key().cmp(&other.parsed_key())
    }
}

impl std::hash::Hash for Principal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.parsed_key().hash(state);
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self.kind {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
        };
        write!(fmt, "{kind}:{}:{}", self.namespace, self.name)
    }
}

/// The split form of a principal's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPrincipal {
    pub is_group: bool,
    pub plain_name: String,
    pub domain: String,
    pub domain_format: DomainFormat,
    pub namespace: String,
}

impl ParsedPrincipal {
    /// Rejoin into a principal. `p.parse().to_principal() == p` holds
    /// for every principal.
    pub fn to_principal(&self) -> Principal {
        let name = match self.domain_format {
            DomainFormat::None => self.plain_name.clone(),
            DomainFormat::Dns => format!("{}@{}", self.plain_name, self.domain),
            DomainFormat::Netbios => format!("{}\\{}", self.domain, self.plain_name),
            DomainFormat::NetbiosForwardSlash => format!("{}/{}", self.domain, self.plain_name),
        };
        let kind = if self.is_group {
            PrincipalKind::Group
        } else {
            PrincipalKind::User
        };
        Principal::new(kind, name, self.namespace.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_precedence() {
        let p = Principal::user("alice@corp.example");
        let parsed = p.parse();
        assert_eq!(parsed.domain_format, DomainFormat::Dns);
        assert_eq!(parsed.plain_name, "alice");
        assert_eq!(parsed.domain, "corp.example");

        let p = Principal::user("CORP\\alice");
        let parsed = p.parse();
        assert_eq!(parsed.domain_format, DomainFormat::Netbios);
        assert_eq!(parsed.plain_name, "alice");
        assert_eq!(parsed.domain, "CORP");

        let p = Principal::user("CORP/alice");
        assert_eq!(p.parse().domain_format, DomainFormat::NetbiosForwardSlash);

        let p = Principal::user("alice");
        let parsed = p.parse();
        assert_eq!(parsed.domain_format, DomainFormat::None);
        assert_eq!(parsed.domain, "");

        // '@' wins even when a backslash appears earlier in the name.
        let p = Principal::user("CORP\\alice@x");
        let parsed = p.parse();
        assert_eq!(parsed.domain_format, DomainFormat::Dns);
        assert_eq!(parsed.plain_name, "CORP\\alice");
        assert_eq!(parsed.domain, "x");
    }

    #[test]
    fn parse_round_trips() {
        for name in [
            "alice",
            "alice@corp",
            "CORP\\alice",
            "CORP/alice",
            "alice@",
            "\\alice",
            "/alice",
            "a b@dom ain",
        ] {
            for p in [
                Principal::user(name),
                Principal::group_in_namespace(name, "LocalNs"),
            ] {
                assert_eq!(p.parse().to_principal(), p, "{name:?}");
            }
        }
    }

    #[test]
    fn equality_ignores_domain_format() {
        let dns = Principal::user("alice@CORP");
        let netbios = Principal::user("CORP\\alice");
        let slash = Principal::user("CORP/alice");
        assert_eq!(dns, netbios);
        assert_eq!(dns, slash);

        use std::collections::HashSet;
        let set: HashSet<Principal> = [dns.clone(), netbios, slash].into_iter().collect();
        assert_eq!(set.len(), 1);

        // Different namespace, kind, or case breaks equality.
        assert_ne!(dns, Principal::user_in_namespace("alice@CORP", "Other"));
        assert_ne!(dns, Principal::group("alice@CORP"));
        assert_ne!(dns, Principal::user("Alice@CORP"));
    }

    #[test]
    fn case_insensitive_comparison() {
        let a = Principal::user("Alice@CORP");
        let b = Principal::user("corp\\alice");
        assert_ne!(a, b);
        assert_eq!(a.cmp_ignore_case(&b), Ordering::Equal);
    }

    #[test]
    fn well_formedness() {
        assert!(Principal::user("alice").is_well_formed());
        assert!(!Principal::user("").is_well_formed());
        assert!(!Principal::user(" alice").is_well_formed());
        assert!(!Principal::user("alice ").is_well_formed());
        assert!(!Principal::user_in_namespace("alice", "").is_well_formed());
    }
}
