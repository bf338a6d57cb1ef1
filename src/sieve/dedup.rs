//! Fingerprint-based node deduplication.

use std::collections::HashMap;

use super::node::Node;

/// Surviving nodes in first-seen order plus the number of dropped duplicates.
#[derive(Debug, Default)]
pub struct Deduplicated {
    pub nodes: Vec<Node>,
    pub duplicates: usize,
}

/// Keep the first node seen for every fingerprint.
///
/// Duplicates do not need to be adjacent; the first-seen `raw` form wins.
pub fn dedup<I>(nodes: I) -> Deduplicated
where
    I: IntoIterator<Item = Node>,
{
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut out = Deduplicated::default();

    for node in nodes {
        if first_seen.contains_key(node.fingerprint()) {
            out.duplicates += 1;
            continue;
        }
        first_seen.insert(node.fingerprint().to_string(), out.nodes.len());
        out.nodes.push(node);
    }

    out
}
