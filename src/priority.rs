//! # Importer Priority
//!
//! Decides whether an importer may overwrite a value currently owned by a
//! set of other importers. The policy is pure and deterministic; it is
//! injected into the merge engine at construction.

use std::collections::HashMap;

/// Write-permission policy over importer identities.
pub trait PriorityResolver: Send + Sync {
    /// Whether `new_importer` may overwrite a value owned by `current_owners`.
    fn is_allowed(&self, new_importer: &str, current_owners: &[String]) -> bool;
}

/// A total order over importer identifiers.
///
/// Importers missing from the map rank 0. An importer may overwrite iff no
/// current owner outranks it.
#[derive(Debug, Clone, Default)]
pub struct StaticPriorityResolver {
    ranks: HashMap<String, i32>,
}

impl StaticPriorityResolver {
    pub fn new(ranks: HashMap<String, i32>) -> Self {
        Self { ranks }
    }

    /// The reference ordering: `user > vetinf > carddav`.
    pub fn standard() -> Self {
        Self::new(HashMap::from([
            ("user".to_string(), 2),
            ("vetinf".to_string(), 1),
            ("carddav".to_string(), 0),
        ]))
    }

    fn rank(&self, importer: &str) -> i32 {
        self.ranks.get(importer).copied().unwrap_or(0)
    }
}

impl PriorityResolver for StaticPriorityResolver {
    fn is_allowed(&self, new_importer: &str, current_owners: &[String]) -> bool {
        let rank = self.rank(new_importer);
        current_owners.iter().all(|owner| self.rank(owner) <= rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_unowned_is_always_allowed() {
        let resolver = StaticPriorityResolver::standard();

        assert!(resolver.is_allowed("carddav", &[]));
        assert!(resolver.is_allowed("unknown", &[]));
    }

    #[test]
    fn test_higher_rank_overwrites_lower() {
        let resolver = StaticPriorityResolver::standard();

        assert!(resolver.is_allowed("user", &owners(&["vetinf", "carddav"])));
        assert!(resolver.is_allowed("vetinf", &owners(&["carddav"])));
        assert!(!resolver.is_allowed("carddav", &owners(&["vetinf"])));
        assert!(!resolver.is_allowed("vetinf", &owners(&["user"])));
    }

    #[test]
    fn test_equal_rank_may_overwrite() {
        let resolver = StaticPriorityResolver::standard();

        assert!(resolver.is_allowed("vetinf", &owners(&["vetinf"])));
        // Unknown importers all rank 0 and may replace each other.
        assert!(resolver.is_allowed("foo", &owners(&["bar"])));
    }
}
