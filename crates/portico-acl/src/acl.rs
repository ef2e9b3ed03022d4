use crate::{AuthnIdentity, AuthzStatus, Principal, PrincipalKind};
use portico_docid::DocId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// How a document's own ACL combines with the decision inherited from
/// its children when the chain is folded leaf→root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InheritanceType {
    ChildOverrides,
    ParentOverrides,
    AndBothPermit,
    /// Terminal node: nothing may inherit from it.
    LeafNode,
}

impl InheritanceType {
    /// Combine the child's non-local decision with this node's local
    /// decision.
    pub fn combine(self, child: AuthzStatus, parent: AuthzStatus) -> AuthzStatus {
        use AuthzStatus::*;
        match self {
            Self::ChildOverrides => {
                if child == Indeterminate {
                    parent
                } else {
                    child
                }
            }
            Self::ParentOverrides => {
                if parent == Indeterminate {
                    child
                } else {
                    parent
                }
            }
            Self::AndBothPermit => {
                if child == Permit && parent == Permit {
                    Permit
                } else {
                    Deny
                }
            }
            Self::LeafNode => Deny,
        }
    }

    /// The attribute value the feed dialect uses for this rule.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::ChildOverrides => "child-overrides",
            Self::ParentOverrides => "parent-overrides",
            Self::AndBothPermit => "and-both-permit",
            Self::LeafNode => "leaf-node",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "child-overrides" => Some(Self::ChildOverrides),
            "parent-overrides" => Some(Self::ParentOverrides),
            "and-both-permit" => Some(Self::AndBothPermit),
            "leaf-node" => Some(Self::LeafNode),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum AclError {
    #[error("principal {0:?} is empty or surrounded by whitespace")]
    IllFormedPrincipal(String),
    #[error("principal {name:?} is a {actual:?} but was supplied as a {expected:?}")]
    WrongKind {
        name: String,
        expected: PrincipalKind,
        actual: PrincipalKind,
    },
}

/// Structural problems with an ACL chain handed to [`Acl::is_authorized`].
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("ACL chain is empty")]
    EmptyChain,
    #[error("root of an ACL chain must not inherit, but inherits from {0:?}")]
    RootInherits(DocId),
    #[error("ACL chain entry {0} is not the root yet inherits from nothing")]
    MissingInheritance(usize),
}

/// An immutable access control list.
///
/// Member sets are kept sorted and deduplicated under the comparator
/// selected by `case_sensitive`, so membership tests and equality match
/// the ACL's own sensitivity while members keep their original case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    permit_users: Vec<Principal>,
    deny_users: Vec<Principal>,
    permit_groups: Vec<Principal>,
    deny_groups: Vec<Principal>,
    inherit_from: Option<DocId>,
    inherit_fragment: Option<String>,
    inheritance_type: InheritanceType,
    case_sensitive: bool,
}

impl Acl {
    pub fn builder() -> AclBuilder {
        AclBuilder::default()
    }

    /// The canonical "document has no ACLs" value: all member sets
    /// empty, no inheritance, leaf node, case-sensitive.
    pub fn empty() -> Self {
        AclBuilder::default().build().expect("empty ACL is valid")
    }

    pub fn permit_users(&self) -> &[Principal] {
        &self.permit_users
    }

    pub fn deny_users(&self) -> &[Principal] {
        &self.deny_users
    }

    pub fn permit_groups(&self) -> &[Principal] {
        &self.permit_groups
    }

    pub fn deny_groups(&self) -> &[Principal] {
        &self.deny_groups
    }

    pub fn inherit_from(&self) -> Option<&DocId> {
        self.inherit_from.as_ref()
    }

    pub fn inherit_fragment(&self) -> Option<&str> {
        self.inherit_fragment.as_deref()
    }

    pub fn inheritance_type(&self) -> InheritanceType {
        self.inheritance_type
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn compare(&self, a: &Principal, b: &Principal) -> Ordering {
        if self.case_sensitive {
            a.cmp(b)
        } else {
            a.cmp_ignore_case(b)
        }
    }

    fn member_of(&self, members: &[Principal], principal: &Principal) -> bool {
        members
            .binary_search_by(|m| self.compare(m, principal))
            .is_ok()
    }

    /// This ACL's own decision for the identity, ignoring inheritance.
    /// Denies dominate permits.
    pub fn is_authorized_local(&self, identity: &AuthnIdentity) -> AuthzStatus {
        let user = identity.user();
        if self.member_of(&self.deny_users, user)
            || identity
                .groups()
                .iter()
                .any(|g| self.member_of(&self.deny_groups, g))
        {
            return AuthzStatus::Deny;
        }
        if self.member_of(&self.permit_users, user)
            || identity
                .groups()
                .iter()
                .any(|g| self.member_of(&self.permit_groups, g))
        {
            return AuthzStatus::Permit;
        }
        AuthzStatus::Indeterminate
    }

    /// Decide authorization over a full chain, ordered root first and
    /// the document's own ACL last.
    ///
    /// The chain must be non-empty, its root must not inherit, and
    /// every other entry must. A chain whose document consists of the
    /// single empty ACL means "no ACLs at all" and is Indeterminate,
    /// as is a chain where some interior node claims to be a leaf. Any
    /// other Indeterminate outcome is coerced to Deny: a document with
    /// ACLs that say nothing about an identity is withheld from it.
    pub fn is_authorized(
        identity: &AuthnIdentity,
        chain: &[Acl],
    ) -> Result<AuthzStatus, ChainError> {
        let Some(root) = chain.first() else {
            return Err(ChainError::EmptyChain);
        };
        if let Some(parent) = root.inherit_from() {
            return Err(ChainError::RootInherits(parent.clone()));
        }
        for (i, acl) in chain.iter().enumerate().skip(1) {
            if acl.inherit_from().is_none() {
                return Err(ChainError::MissingInheritance(i));
            }
        }
        if chain.len() == 1 && chain[0] == Acl::empty() {
            return Ok(AuthzStatus::Indeterminate);
        }
        for acl in &chain[..chain.len() - 1] {
            if acl.inheritance_type() == InheritanceType::LeafNode {
                tracing::warn!(
                    "ACL chain contains a leaf-node entry above the document; \
                     refusing to decide"
                );
                return Ok(AuthzStatus::Indeterminate);
            }
        }
        let mut decision = chain[chain.len() - 1].is_authorized_local(identity);
        for acl in chain[..chain.len() - 1].iter().rev() {
            decision = acl
                .inheritance_type()
                .combine(decision, acl.is_authorized_local(identity));
        }
        Ok(match decision {
            AuthzStatus::Indeterminate => AuthzStatus::Deny,
            other => other,
        })
    }
}

impl PartialEq for Acl {
    fn eq(&self, other: &Self) -> bool {
        if self.case_sensitive != other.case_sensitive
            || self.inheritance_type != other.inheritance_type
            || self.inherit_from != other.inherit_from
            || self.inherit_fragment != other.inherit_fragment
        {
            return false;
        }
        let sets_equal = |a: &[Principal], b: &[Principal]| {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| self.compare(x, y) == Ordering::Equal)
        };
        sets_equal(&self.permit_users, &other.permit_users)
            && sets_equal(&self.deny_users, &other.deny_users)
            && sets_equal(&self.permit_groups, &other.permit_groups)
            && sets_equal(&self.deny_groups, &other.deny_groups)
    }
}

impl Eq for Acl {}

/// Builder for [`Acl`]. Member validation happens in [`AclBuilder::build`].
#[derive(Debug, Default, Clone)]
pub struct AclBuilder {
    permit_users: Vec<Principal>,
    deny_users: Vec<Principal>,
    permit_groups: Vec<Principal>,
    deny_groups: Vec<Principal>,
    inherit_from: Option<DocId>,
    inherit_fragment: Option<String>,
    inheritance_type: Option<InheritanceType>,
    case_sensitive: Option<bool>,
}

impl AclBuilder {
    pub fn permit_user<P: Into<Principal>>(mut self, user: P) -> Self {
        self.permit_users.push(user.into());
        self
    }

    pub fn permit_users<I: IntoIterator<Item = Principal>>(mut self, users: I) -> Self {
        self.permit_users.extend(users);
        self
    }

    pub fn deny_user<P: Into<Principal>>(mut self, user: P) -> Self {
        self.deny_users.push(user.into());
        self
    }

    pub fn deny_users<I: IntoIterator<Item = Principal>>(mut self, users: I) -> Self {
        self.deny_users.extend(users);
        self
    }

    pub fn permit_group<P: Into<Principal>>(mut self, group: P) -> Self {
        self.permit_groups.push(group.into());
        self
    }

    pub fn permit_groups<I: IntoIterator<Item = Principal>>(mut self, groups: I) -> Self {
        self.permit_groups.extend(groups);
        self
    }

    pub fn deny_group<P: Into<Principal>>(mut self, group: P) -> Self {
        self.deny_groups.push(group.into());
        self
    }

    pub fn deny_groups<I: IntoIterator<Item = Principal>>(mut self, groups: I) -> Self {
        self.deny_groups.extend(groups);
        self
    }

    pub fn inherit_from(mut self, parent: DocId) -> Self {
        self.inherit_from = Some(parent);
        self
    }

    pub fn inherit_from_fragment(mut self, parent: DocId, fragment: &str) -> Self {
        self.inherit_from = Some(parent);
        self.inherit_fragment = Some(fragment.to_string());
        self
    }

    pub fn inheritance_type(mut self, inheritance_type: InheritanceType) -> Self {
        self.inheritance_type = Some(inheritance_type);
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = Some(case_sensitive);
        self
    }

    pub fn build(self) -> Result<Acl, AclError> {
        let case_sensitive = self.case_sensitive.unwrap_or(true);
        let inheritance_type = self.inheritance_type.unwrap_or(InheritanceType::LeafNode);
        let prepare = |mut members: Vec<Principal>,
                       expected: PrincipalKind|
         -> Result<Vec<Principal>, AclError> {
            for member in &members {
                if !member.is_well_formed() {
                    return Err(AclError::IllFormedPrincipal(member.name().to_string()));
                }
                if member.kind() != expected {
                    return Err(AclError::WrongKind {
                        name: member.name().to_string(),
                        expected,
                        actual: member.kind(),
                    });
                }
            }
            if case_sensitive {
                members.sort();
                members.dedup();
            } else {
                members.sort_by(|a, b| a.cmp_ignore_case(b));
                members.dedup_by(|a, b| a.cmp_ignore_case(b) == Ordering::Equal);
            }
            Ok(members)
        };
        Ok(Acl {
            permit_users: prepare(self.permit_users, PrincipalKind::User)?,
            deny_users: prepare(self.deny_users, PrincipalKind::User)?,
            permit_groups: prepare(self.permit_groups, PrincipalKind::Group)?,
            deny_groups: prepare(self.deny_groups, PrincipalKind::Group)?,
            inherit_from: self.inherit_from,
            inherit_fragment: self.inherit_fragment,
            inheritance_type,
            case_sensitive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthnIdentity;

    fn user(name: &str) -> Principal {
        Principal::user(name)
    }

    fn group(name: &str) -> Principal {
        Principal::group(name)
    }

    fn identity(name: &str, groups: &[&str]) -> AuthnIdentity {
        AuthnIdentity::with_groups(user(name), groups.iter().map(|g| group(g)))
    }

    #[test]
    fn builder_rejects_bad_members() {
        assert!(matches!(
            Acl::builder().permit_user(user(" alice")).build(),
            Err(AclError::IllFormedPrincipal(_))
        ));
        assert!(matches!(
            Acl::builder().permit_user(group("eng")).build(),
            Err(AclError::WrongKind { .. })
        ));
    }

    #[test]
    fn deny_dominates_permit() {
        // S2: alice is permitted by name but denied through her group.
        let acl = Acl::builder()
            .permit_user(user("alice"))
            .deny_group(group("eng"))
            .build()
            .unwrap();
        let alice = identity("alice", &["eng"]);
        assert_eq!(acl.is_authorized_local(&alice), AuthzStatus::Deny);
    }

    #[test]
    fn local_decisions() {
        let acl = Acl::builder()
            .permit_user(user("alice"))
            .permit_group(group("qa"))
            .deny_user(user("mallory"))
            .build()
            .unwrap();
        assert_eq!(
            acl.is_authorized_local(&identity("alice", &[])),
            AuthzStatus::Permit
        );
        assert_eq!(
            acl.is_authorized_local(&identity("bob", &["qa"])),
            AuthzStatus::Permit
        );
        assert_eq!(
            acl.is_authorized_local(&identity("mallory", &["qa"])),
            AuthzStatus::Deny
        );
        assert_eq!(
            acl.is_authorized_local(&identity("bob", &["sales"])),
            AuthzStatus::Indeterminate
        );
    }

    #[test]
    fn case_insensitive_membership() {
        let acl = Acl::builder()
            .case_sensitive(false)
            .permit_user(user("Alice@CORP"))
            .build()
            .unwrap();
        assert_eq!(
            acl.is_authorized_local(&identity("corp\\alice", &[])),
            AuthzStatus::Permit
        );

        let sensitive = Acl::builder().permit_user(user("Alice@CORP")).build().unwrap();
        assert_eq!(
            sensitive.is_authorized_local(&identity("corp\\alice", &[])),
            AuthzStatus::Indeterminate
        );
    }

    #[test]
    fn acl_equality_respects_sensitivity() {
        let a = Acl::builder()
            .case_sensitive(false)
            .permit_user(user("ALICE"))
            .build()
            .unwrap();
        let b = Acl::builder()
            .case_sensitive(false)
            .permit_user(user("alice"))
            .build()
            .unwrap();
        assert_eq!(a, b);

        let c = Acl::builder().permit_user(user("ALICE")).build().unwrap();
        let d = Acl::builder().permit_user(user("alice")).build().unwrap();
        assert_ne!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn combine_table() {
        use AuthzStatus::*;
        use InheritanceType::*;
        let table = [
            (ChildOverrides, Permit, Permit, Permit),
            (ChildOverrides, Permit, Deny, Permit),
            (ChildOverrides, Permit, Indeterminate, Permit),
            (ChildOverrides, Deny, Permit, Deny),
            (ChildOverrides, Deny, Deny, Deny),
            (ChildOverrides, Deny, Indeterminate, Deny),
            (ChildOverrides, Indeterminate, Permit, Permit),
            (ChildOverrides, Indeterminate, Deny, Deny),
            (ChildOverrides, Indeterminate, Indeterminate, Indeterminate),
            (ParentOverrides, Permit, Permit, Permit),
            (ParentOverrides, Permit, Deny, Deny),
            (ParentOverrides, Permit, Indeterminate, Permit),
            (ParentOverrides, Deny, Permit, Permit),
            (ParentOverrides, Deny, Deny, Deny),
            (ParentOverrides, Deny, Indeterminate, Deny),
            (ParentOverrides, Indeterminate, Permit, Permit),
            (ParentOverrides, Indeterminate, Deny, Deny),
            (ParentOverrides, Indeterminate, Indeterminate, Indeterminate),
            (AndBothPermit, Permit, Permit, Permit),
            (AndBothPermit, Permit, Deny, Deny),
            (AndBothPermit, Permit, Indeterminate, Deny),
            (AndBothPermit, Deny, Permit, Deny),
            (AndBothPermit, Deny, Deny, Deny),
            (AndBothPermit, Deny, Indeterminate, Deny),
            (AndBothPermit, Indeterminate, Permit, Deny),
            (AndBothPermit, Indeterminate, Deny, Deny),
            (AndBothPermit, Indeterminate, Indeterminate, Deny),
            (LeafNode, Permit, Permit, Deny),
            (LeafNode, Indeterminate, Indeterminate, Deny),
            (LeafNode, Deny, Permit, Deny),
        ];
        for (rule, child, parent, expected) in table {
            assert_eq!(
                rule.combine(child, parent),
                expected,
                "{rule:?}.combine({child:?}, {parent:?})"
            );
        }
    }

    #[test]
    fn chain_preconditions() {
        let adam = identity("adam", &[]);
        assert!(matches!(
            Acl::is_authorized(&adam, &[]),
            Err(ChainError::EmptyChain)
        ));

        let inheriting = Acl::builder()
            .inherit_from(DocId::new("parent"))
            .build()
            .unwrap();
        assert!(matches!(
            Acl::is_authorized(&adam, &[inheriting.clone()]),
            Err(ChainError::RootInherits(_))
        ));

        let root = Acl::builder()
            .inheritance_type(InheritanceType::ChildOverrides)
            .build()
            .unwrap();
        let orphan = Acl::builder().build().unwrap();
        assert!(matches!(
            Acl::is_authorized(&adam, &[root, orphan]),
            Err(ChainError::MissingInheritance(1))
        ));
    }

    #[test]
    fn single_empty_acl_is_indeterminate() {
        let adam = identity("adam", &[]);
        assert_eq!(
            Acl::is_authorized(&adam, &[Acl::empty()]).unwrap(),
            AuthzStatus::Indeterminate
        );
        // A lone non-empty ACL that says nothing about adam denies him.
        let other = Acl::builder().permit_user(user("eve")).build().unwrap();
        assert_eq!(
            Acl::is_authorized(&adam, &[other]).unwrap(),
            AuthzStatus::Deny
        );
    }

    #[test]
    fn leaf_node_above_document_is_indeterminate() {
        let adam = identity("adam", &[]);
        let root = Acl::builder()
            .permit_user(user("adam"))
            .inheritance_type(InheritanceType::LeafNode)
            .build()
            .unwrap();
        let child = Acl::builder()
            .inherit_from(DocId::new("root"))
            .build()
            .unwrap();
        assert_eq!(
            Acl::is_authorized(&adam, &[root, child]).unwrap(),
            AuthzStatus::Indeterminate
        );
    }

    #[test]
    fn child_overrides_inherits_parent_permit() {
        // S3: empty child inheriting from a folder that permits adam.
        let folder = Acl::builder()
            .permit_user(user("adam"))
            .inheritance_type(InheritanceType::ChildOverrides)
            .build()
            .unwrap();
        let child = Acl::builder()
            .inherit_from(DocId::new("Folder"))
            .build()
            .unwrap();
        assert_eq!(
            Acl::is_authorized(&identity("adam", &[]), &[folder, child]).unwrap(),
            AuthzStatus::Permit
        );
    }

    #[test]
    fn and_both_permit_needs_both() {
        // S4: the file says nothing about charlie, the share permits
        // him; AND_BOTH_PERMIT turns that into a deny.
        let share = Acl::builder()
            .permit_user(user("charlie"))
            .inheritance_type(InheritanceType::AndBothPermit)
            .build()
            .unwrap();
        let file = Acl::builder()
            .permit_group(group("qa"))
            .inherit_from(DocId::new("Share"))
            .build()
            .unwrap();
        let chain = [share, file];
        assert_eq!(
            Acl::is_authorized(&identity("charlie", &[]), &chain).unwrap(),
            AuthzStatus::Deny
        );
        assert_eq!(
            Acl::is_authorized(&identity("charlie", &["qa"]), &chain).unwrap(),
            AuthzStatus::Permit
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let chain = [
            Acl::builder()
                .permit_user(user("adam"))
                .deny_group(group("interns"))
                .inheritance_type(InheritanceType::ParentOverrides)
                .build()
                .unwrap(),
            Acl::builder()
                .permit_group(group("interns"))
                .inherit_from(DocId::new("top"))
                .build()
                .unwrap(),
        ];
        let id = identity("adam", &["interns"]);
        let first = Acl::is_authorized(&id, &chain).unwrap();
        for _ in 0..10 {
            assert_eq!(Acl::is_authorized(&id, &chain).unwrap(), first);
        }
        assert_eq!(first, AuthzStatus::Deny);
    }
}
