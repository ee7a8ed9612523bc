//! Rendezvous hashing
//!
//! HRW (Highest Random Weight) hashing gives the allocator a deterministic,
//! well-spread tie-break between equally weighted nodes: the same shard and
//! node set always produce the same order, on every leader.

/// HRW weight of `node` for `key`; the higher weight wins a tie
pub fn hrw_weight(key: &str, node: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[0]);
    hasher.update(node.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrw_weight_deterministic() {
        assert_eq!(hrw_weight("[logs][0]", "n1"), hrw_weight("[logs][0]", "n1"));
        assert_ne!(hrw_weight("[logs][0]", "n1"), hrw_weight("[logs][0]", "n2"));
    }

    #[test]
    fn test_key_and_node_are_not_concatenated_blindly() {
        assert_ne!(hrw_weight("ab", "c"), hrw_weight("a", "bc"));
    }

    #[test]
    fn test_winner_varies_by_key() {
        let nodes = ["n1", "n2", "n3", "n4"];
        let winner = |key: &str| {
            nodes
                .iter()
                .max_by_key(|node| hrw_weight(key, node))
                .map(|node| node.to_string())
        };
        let winners: std::collections::BTreeSet<_> =
            (0..32).filter_map(|shard| winner(&format!("[logs][{}]", shard))).collect();
        assert!(winners.len() > 1);
    }
}
