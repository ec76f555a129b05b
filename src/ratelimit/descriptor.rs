//! Rule key derivation from a domain and its descriptors.

use ahash::AHasher;
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// Descriptor entries qualifying a domain, ordered by key.
pub type Descriptors = BTreeMap<String, String>;

/// Feed one length-prefixed field so that no two field sequences share a
/// byte encoding.
fn write_field<H: Hasher>(hasher: &mut H, field: &str) {
    hasher.write(&(field.len() as u64).to_be_bytes());
    hasher.write(field.as_bytes());
}

/// A key that uniquely identifies a (domain, descriptor set) combination.
///
/// The key is a fixed-width, lowercase hexadecimal rendering of a 64-bit
/// FNV-1a digest. It indexes the rule set and namespaces quota state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(String);

impl RuleKey {
    /// Derive the key for a domain and a set of descriptor entries.
    ///
    /// Entries are sorted by key (then value) before hashing, so any map type
    /// and any iteration order produce the same key for the same identity.
    /// The domain, each key and each value are hashed with a length prefix,
    /// so separator characters inside them cannot alias another identity.
    pub fn resolve<I, K, V>(domain: &str, descriptors: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entries: Vec<(K, V)> = descriptors.into_iter().collect();
        entries.sort_by(|a, b| {
            a.0.as_ref()
                .cmp(b.0.as_ref())
                .then_with(|| a.1.as_ref().cmp(b.1.as_ref()))
        });

        let mut hasher = FnvHasher::default();
        write_field(&mut hasher, domain);
        for (key, value) in &entries {
            write_field(&mut hasher, key.as_ref());
            write_field(&mut hasher, value.as_ref());
        }

        Self(format!("{:016x}", hasher.finish()))
    }

    /// The hexadecimal digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Secondary hash used to spread keys over lock shards.
    pub(crate) fn shard(&self, shards: usize) -> usize {
        let mut hasher = AHasher::default();
        hasher.write(self.0.as_bytes());
        (hasher.finish() % shards.max(1) as u64) as usize
    }
}

impl AsRef<str> for RuleKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rule_key_is_fixed_width_hex() {
        let key = RuleKey::resolve("checkout", [("tier", "free")]);

        assert_eq!(key.as_str().len(), 16);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_rule_key_deterministic() {
        let mut descriptors = Descriptors::new();
        descriptors.insert("tier".to_string(), "free".to_string());

        let key1 = RuleKey::resolve("checkout", &descriptors);
        let key2 = RuleKey::resolve("checkout", &descriptors);

        assert_eq!(key1, key2);
    }

    #[test]
    fn test_rule_key_ignores_entry_order() {
        let forward = RuleKey::resolve("api", vec![("a", "1"), ("b", "2"), ("c", "3")]);
        let backward = RuleKey::resolve("api", vec![("c", "3"), ("b", "2"), ("a", "1")]);

        let mut hashed: HashMap<String, String> = HashMap::new();
        hashed.insert("b".to_string(), "2".to_string());
        hashed.insert("c".to_string(), "3".to_string());
        hashed.insert("a".to_string(), "1".to_string());
        let from_hash_map = RuleKey::resolve("api", &hashed);

        assert_eq!(forward, backward);
        assert_eq!(forward, from_hash_map);
    }

    #[test]
    fn test_rule_key_distinguishes_values_and_domains() {
        let free = RuleKey::resolve("checkout", [("tier", "free")]);
        let paid = RuleKey::resolve("checkout", [("tier", "paid")]);
        let other_domain = RuleKey::resolve("search", [("tier", "free")]);
        let bare = RuleKey::resolve("checkout", Vec::<(&str, &str)>::new());

        assert_ne!(free, paid);
        assert_ne!(free, other_domain);
        assert_ne!(free, bare);
    }

    #[test]
    fn test_separators_in_domain_do_not_alias_descriptors() {
        let real = RuleKey::resolve("checkout", [("tier", "free")]);
        let forged = RuleKey::resolve("checkout|tier=free", Vec::<(&str, &str)>::new());

        assert_ne!(real, forged);
    }

    #[test]
    fn test_separators_in_values_do_not_alias_extra_entries() {
        let two_entries = RuleKey::resolve("api", [("tier", "free"), ("user", "x")]);
        let one_entry = RuleKey::resolve("api", [("tier", "free|user=x")]);
        let shifted = RuleKey::resolve("api", [("tier=free", "")]);
        let split = RuleKey::resolve("api", [("tier", "=free")]);

        assert_ne!(two_entries, one_entry);
        assert_ne!(shifted, split);
    }

    #[test]
    fn test_field_boundaries_matter() {
        let domain_heavy = RuleKey::resolve("ab", [("c", "d")]);
        let key_heavy = RuleKey::resolve("a", [("bc", "d")]);
        let value_heavy = RuleKey::resolve("a", [("b", "cd")]);

        assert_ne!(domain_heavy, key_heavy);
        assert_ne!(key_heavy, value_heavy);
        assert_ne!(domain_heavy, value_heavy);
    }

    #[test]
    fn test_rule_key_matches_fnv_digest_of_framed_fields() {
        let mut hasher = FnvHasher::default();
        write_field(&mut hasher, "checkout");
        write_field(&mut hasher, "tier");
        write_field(&mut hasher, "free");

        let key = RuleKey::resolve("checkout", [("tier", "free")]);
        assert_eq!(key.as_str(), format!("{:016x}", hasher.finish()));
    }

    #[test]
    fn test_shard_within_bounds() {
        let key = RuleKey::resolve("checkout", [("tier", "free")]);

        for shards in 1..32 {
            assert!(key.shard(shards) < shards);
        }
        assert_eq!(key.shard(0), 0);
    }
}
