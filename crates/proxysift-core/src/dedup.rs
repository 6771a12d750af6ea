//! Duplicate removal and latency ranking.
//!
//! Duplicates are endpoints whose canonical keys match; the survivor is the
//! one with the lower measured latency (first-encountered on a tie). The
//! surviving set is ordered by ascending latency. Latency itself varies
//! across runs, so the ordering is deterministic only for a fixed set of
//! measurements.

use std::collections::HashMap;

use tracing::debug;

use crate::descriptor::CanonicalKey;
use crate::scheduler::LiveEndpoint;

/// Deduplicate and rank the merged live set.
///
/// Returns the survivors, ascending by latency, and the number of
/// duplicates removed. Idempotent: running it on its own output removes
/// nothing further.
#[must_use]
pub fn dedupe_and_rank(live: Vec<LiveEndpoint>) -> (Vec<LiveEndpoint>, usize) {
    let total = live.len();
    let mut survivors: Vec<LiveEndpoint> = Vec::with_capacity(total);
    let mut by_key: HashMap<CanonicalKey, usize> = HashMap::with_capacity(total);

    for endpoint in live {
        let key = endpoint.candidate.descriptor.canonical_key();
        match by_key.get(&key) {
            Some(&slot) => {
                // Lower latency wins; ties keep the first encountered.
                if endpoint.latency_ms < survivors[slot].latency_ms {
                    survivors[slot] = endpoint;
                }
            },
            None => {
                by_key.insert(key, survivors.len());
                survivors.push(endpoint);
            },
        }
    }

    let removed = total - survivors.len();
    // Stable sort: equal latencies preserve first-encountered order.
    survivors.sort_by_key(|e| e.latency_ms);
    if removed > 0 {
        debug!(removed, kept = survivors.len(), "duplicates dropped");
    }
    (survivors, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Candidate;

    fn live(uri: &str, latency_ms: u64) -> LiveEndpoint {
        LiveEndpoint {
            candidate: Candidate::from_line(uri).unwrap(),
            latency_ms,
        }
    }

    #[test]
    fn ranks_by_ascending_latency() {
        let (ranked, removed) = dedupe_and_rank(vec![
            live("vless://a@192.0.2.1:443", 300),
            live("vless://b@192.0.2.2:443", 100),
            live("vless://c@192.0.2.3:443", 200),
        ]);
        assert_eq!(removed, 0);
        let latencies: Vec<u64> = ranked.iter().map(|l| l.latency_ms).collect();
        assert_eq!(latencies, vec![100, 200, 300]);
    }

    #[test]
    fn host_only_difference_keeps_exactly_one() {
        let (ranked, removed) = dedupe_and_rank(vec![
            live("vless://u@192.0.2.1:443?type=ws&host=cdn-a.example", 150),
            live("vless://u@192.0.2.1:443?type=ws&host=cdn-b.example", 90),
        ]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(removed, 1);
        assert_eq!(ranked[0].latency_ms, 90, "lower latency survives");
    }

    #[test]
    fn tag_only_difference_keeps_first_on_equal_latency() {
        let (ranked, _) = dedupe_and_rank(vec![
            live("vless://u@192.0.2.1:443#first", 100),
            live("vless://u@192.0.2.1:443#second", 100),
        ]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].candidate.descriptor.tag, "first");
    }

    #[test]
    fn distinct_endpoints_all_survive() {
        let (ranked, removed) = dedupe_and_rank(vec![
            live("vless://u@192.0.2.1:443", 100),
            live("vless://u@192.0.2.1:8443", 100),
            live("vless://v@192.0.2.1:443", 100),
        ]);
        assert_eq!(ranked.len(), 3);
        assert_eq!(removed, 0);
    }

    #[test]
    fn deduplication_is_idempotent() {
        let input = vec![
            live("vless://u@192.0.2.1:443?type=ws&host=a.example", 150),
            live("vless://u@192.0.2.1:443?type=ws&host=b.example", 90),
            live("vless://w@192.0.2.9:443", 10),
        ];
        let (first, _) = dedupe_and_rank(input);
        let (second, removed) = dedupe_and_rank(first.clone());
        assert_eq!(removed, 0);
        assert_eq!(
            first.iter().map(|l| &l.candidate.url).collect::<Vec<_>>(),
            second.iter().map(|l| &l.candidate.url).collect::<Vec<_>>()
        );
    }
}
