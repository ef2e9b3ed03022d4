use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-document metadata: a multimap from names to values, iterated in
/// sorted order so emission is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.entries
            .entry(name.into())
            .or_default()
            .insert(value.into());
    }

    /// Replace every value recorded under `name`.
    pub fn set<K: Into<String>, I, V>(&mut self, name: K, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let name = name.into();
        if values.is_empty() {
            self.entries.remove(&name);
        } else {
            self.entries.insert(name, values);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }

    pub fn values_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.entries
            .get(name)
            .into_iter()
            .flat_map(|values| values.iter().map(String::as_str))
    }

    /// Every (name, value) pair in name order, then value order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| {
            values.iter().map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// A copy with every name and value whitespace-trimmed; entries
    /// that trim to an empty name are dropped.
    pub fn trimmed(&self) -> Metadata {
        let mut out = Metadata::new();
        for (name, value) in self.iter() {
            let name = name.trim();
            if !name.is_empty() {
                out.add(name, value.trim());
            }
        }
        out
    }

    /// Equality after trimming both sides.
    pub fn eq_trimmed(&self, other: &Metadata) -> bool {
        self.trimmed() == other.trimmed()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in iter {
            metadata.add(name, value);
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimap_semantics() {
        let mut m = Metadata::new();
        m.add("author", "bob");
        m.add("author", "alice");
        m.add("author", "bob");
        m.add("dept", "eng");
        assert_eq!(m.len(), 3);
        let pairs: Vec<_> = m.iter().collect();
        assert_eq!(
            pairs,
            vec![("author", "alice"), ("author", "bob"), ("dept", "eng")]
        );
        m.set("author", ["carol"]);
        assert_eq!(m.values_of("author").collect::<Vec<_>>(), vec!["carol"]);
        m.set("author", Vec::<String>::new());
        assert!(m.values_of("author").next().is_none());
    }

    #[test]
    fn trimmed_equality() {
        let a: Metadata = [("key", "value")].into_iter().collect();
        let b: Metadata = [(" key ", " value ")].into_iter().collect();
        assert_ne!(a, b);
        assert!(a.eq_trimmed(&b));
    }
}
