//! Principals, access control lists and the deterministic evaluator
//! that decides whether an authenticated identity may see a document.
//!
//! ACLs form parent→child chains via `inherit_from`; the evaluator
//! folds a chain from the leaf back to the root under one of four
//! inheritance rules. A batched variant fetches chains on demand for
//! many documents at once, coalescing duplicate parent lookups.
use serde::{Deserialize, Serialize};

mod acl;
mod batch;
mod principal;

pub use acl::{Acl, AclBuilder, AclError, ChainError, InheritanceType};
pub use batch::{is_authorized_batch, BatchRetriever};
pub use principal::{DomainFormat, ParsedPrincipal, Principal, PrincipalKind, DEFAULT_NAMESPACE};

/// The outcome of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthzStatus {
    Permit,
    Deny,
    /// The ACLs seen so far neither permit nor deny the identity.
    /// Interior nodes pass this through; a top-level Indeterminate is
    /// coerced to Deny by the chain evaluator, and the batch endpoint
    /// reports it so the appliance can fall back to its own checks.
    Indeterminate,
}

/// An authenticated identity: the user plus every group it belongs to,
/// as resolved by the repository or the appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthnIdentity {
    user: Principal,
    groups: std::collections::BTreeSet<Principal>,
}

impl AuthnIdentity {
    pub fn new(user: Principal) -> Self {
        Self {
            user,
            groups: Default::default(),
        }
    }

    pub fn with_groups<I: IntoIterator<Item = Principal>>(user: Principal, groups: I) -> Self {
        Self {
            user,
            groups: groups.into_iter().collect(),
        }
    }

    pub fn user(&self) -> &Principal {
        &self.user
    }

    pub fn groups(&self) -> &std::collections::BTreeSet<Principal> {
        &self.groups
    }
}
