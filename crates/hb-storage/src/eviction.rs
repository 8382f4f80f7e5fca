use crate::store::EntryMeta;
use std::cmp::Reverse;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: String,
    pub size_bytes: u64,
    pub age_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub usage_before: f64,
    pub usage_after: f64,
    pub removed: Vec<EvictionCandidate>,
    pub failed: Vec<String>,
}

impl EvictionReport {
    pub fn removed_keys(&self) -> Vec<&str> {
        self.removed.iter().map(|c| c.key.as_str()).collect()
    }
}

/// Orders entries largest first, oldest first among equal sizes, skipping
/// anything still pending in the queue or explicitly protected.
pub fn select_candidates(
    entries: &[EntryMeta],
    pending: &HashSet<String>,
    protected: &[String],
    now_ms: i64,
    cap: usize,
) -> Vec<EvictionCandidate> {
    let mut candidates = entries
        .iter()
        .filter(|entry| !pending.contains(&entry.key))
        .filter(|entry| !protected.iter().any(|key| key == &entry.key))
        .map(|entry| EvictionCandidate {
            key: entry.key.clone(),
            size_bytes: entry.size_bytes,
            age_ms: now_ms.saturating_sub(entry.updated_at_ms).max(0),
        })
        .collect::<Vec<_>>();
    candidates.sort_by_key(|c| (Reverse(c.size_bytes), Reverse(c.age_ms), c.key.clone()));
    candidates.truncate(cap);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000_000;

    fn entry(key: &str, size_bytes: u64, age_ms: i64) -> EntryMeta {
        EntryMeta {
            key: key.to_string(),
            size_bytes,
            updated_at_ms: NOW - age_ms,
        }
    }

    #[test]
    fn larger_then_older_entries_go_first() {
        let entries = vec![entry("A", 10, 1), entry("B", 10, 5), entry("C", 5, 100)];
        let order = select_candidates(&entries, &HashSet::new(), &[], NOW, 5)
            .into_iter()
            .map(|c| c.key)
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[test]
    fn pending_and_protected_keys_are_never_candidates() {
        let entries = vec![
            entry("settings", 500, 10),
            entry("queued", 400, 10),
            entry("old", 1, 99_999),
        ];
        let pending = HashSet::from(["queued".to_string()]);
        let protected = vec!["settings".to_string()];
        let picked = select_candidates(&entries, &pending, &protected, NOW, 5);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].key, "old");
        assert_eq!(picked[0].age_ms, 99_999);
    }

    #[test]
    fn cap_limits_one_pass() {
        let entries = (0..12)
            .map(|i| entry(&format!("k{i}"), 100 + i, 0))
            .collect::<Vec<_>>();
        let picked = select_candidates(&entries, &HashSet::new(), &[], NOW, 5);
        assert_eq!(picked.len(), 5);
        assert_eq!(picked[0].key, "k11");
        assert_eq!(picked[4].key, "k7");
    }
}
