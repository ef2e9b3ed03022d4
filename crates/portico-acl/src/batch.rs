use crate::{Acl, AuthnIdentity, AuthzStatus};
use async_trait::async_trait;
use portico_docid::DocId;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Supplies ACLs for batches of documents. The batch authorization
/// endpoint asks once per frontier of unknown documents, so a
/// retriever backed by a repository can answer each round with a
/// single bulk query.
///
/// A retriever may return ACLs for documents it was not asked about
/// (prefetching a whole folder chain, say); they are cached and never
/// requested again. Documents absent from the reply are recorded as
/// having no ACL.
#[async_trait]
pub trait BatchRetriever: Send + Sync {
    async fn retrieve_acls(&self, ids: &BTreeSet<DocId>) -> anyhow::Result<HashMap<DocId, Acl>>;
}

/// Decide authorization for many documents at once, fetching ACL
/// chains on demand.
///
/// Parent lookups are coalesced across documents: a folder inherited
/// by a thousand files is fetched once. A document whose chain hits a
/// missing ACL, or loops back on itself, is Indeterminate. The result
/// holds an entry for every requested id.
pub async fn is_authorized_batch(
    identity: &AuthnIdentity,
    ids: &[DocId],
    retriever: &dyn BatchRetriever,
) -> anyhow::Result<HashMap<DocId, AuthzStatus>> {
    // Phase one: pull ACLs until every reachable chain is resolved.
    // `known` maps each asked-about id to its ACL, or None when the
    // retriever had nothing for it.
    let mut known: HashMap<DocId, Option<Acl>> = HashMap::new();
    let mut frontier: BTreeSet<DocId> = ids.iter().cloned().collect();
    while !frontier.is_empty() {
        let fetched = retriever.retrieve_acls(&frontier).await?;
        let mut next = BTreeSet::new();
        let mut note = |id: &DocId, acl: &Acl, next: &mut BTreeSet<DocId>| {
            if let Some(parent) = acl.inherit_from() {
                if !known.contains_key(parent) && !frontier.contains(parent) {
                    next.insert(parent.clone());
                }
            }
        };
        for (id, acl) in &fetched {
            note(id, acl, &mut next);
        }
        for id in &frontier {
            let entry = fetched.get(id).cloned();
            if entry.is_none() {
                tracing::warn!("no ACL available for {id:?}");
            }
            known.insert(id.clone(), entry);
        }
        for (id, acl) in fetched {
            known.entry(id).or_insert(Some(acl));
        }
        next.retain(|id| !known.contains_key(id));
        frontier = next;
    }

    // Phase two: materialize each document's chain and fold it.
    let mut decisions = HashMap::with_capacity(ids.len());
    for id in ids {
        decisions.insert(id.clone(), decide(identity, id, &known));
    }
    Ok(decisions)
}

fn decide(
    identity: &AuthnIdentity,
    id: &DocId,
    known: &HashMap<DocId, Option<Acl>>,
) -> AuthzStatus {
    let mut chain: Vec<Acl> = Vec::new();
    let mut visited: HashSet<DocId> = HashSet::new();
    let mut cursor = id.clone();
    loop {
        if !visited.insert(cursor.clone()) {
            tracing::warn!("ACL chain for {id:?} loops back through {cursor:?}");
            return AuthzStatus::Indeterminate;
        }
        let acl = match known.get(&cursor) {
            Some(Some(acl)) => acl.clone(),
            _ => {
                tracing::warn!("ACL chain for {id:?} is missing an ACL for {cursor:?}");
                return AuthzStatus::Indeterminate;
            }
        };
        let parent = acl.inherit_from().cloned();
        chain.push(acl);
        match parent {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    chain.reverse();
    match Acl::is_authorized(identity, &chain) {
        Ok(status) => status,
        Err(err) => {
            tracing::warn!("ACL chain for {id:?} is malformed: {err}");
            AuthzStatus::Indeterminate
        }
    }
}
