use std::collections::HashMap;
use std::hash::Hash;

/// Partition of a remote listing against stored records.
#[derive(Debug)]
pub struct Reconciliation<R, K> {
    /// Local records still present remotely, with their key.
    pub matched: Vec<(R, K)>,
    /// Local records no longer present remotely.
    pub unmatched_local: Vec<R>,
    /// Remote keys with no local record.
    pub unmatched_remote: Vec<K>,
}

/// Match `remote` identifiers against `local` records keyed by `key_of`.
///
/// Runs in O(n + m). Identifiers are assumed unique on both sides; remote
/// order is preserved in `matched` and `unmatched_remote`.
pub fn reconcile<R, K, F>(remote: &[K], local: Vec<R>, key_of: F) -> Reconciliation<R, K>
where
    K: Eq + Hash + Clone,
    F: Fn(&R) -> K,
{
    let mut index: HashMap<K, R> = local.into_iter().map(|r| (key_of(&r), r)).collect();

    let mut matched = Vec::new();
    let mut unmatched_remote = Vec::new();
    for key in remote {
        match index.remove(key) {
            Some(record) => matched.push((record, key.clone())),
            None => unmatched_remote.push(key.clone()),
        }
    }

    Reconciliation {
        matched,
        unmatched_local: index.into_values().collect(),
        unmatched_remote,
    }
}
