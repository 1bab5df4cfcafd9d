use serde::Serialize;

use crate::fingerprint::hamming_distance;
use crate::models::CacheEntry;

#[derive(Debug, Clone, Serialize)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub distance: u32,
}

/// Closest entry strictly below `max_distance`. Entries whose fingerprint is
/// not comparable are skipped; ties go to the first (newest) entry.
#[must_use]
pub fn find_best_match(entries: Vec<CacheEntry>, fingerprint: &str, max_distance: u32) -> Option<CacheHit> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let distance = hamming_distance(&entry.fingerprint, fingerprint)?;
            (distance < max_distance).then_some(CacheHit { entry, distance })
        })
        .fold(None, |best: Option<CacheHit>, hit| match best {
            Some(b) if b.distance <= hit.distance => Some(b),
            _ => Some(hit),
        })
}
