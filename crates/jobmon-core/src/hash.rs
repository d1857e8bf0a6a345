// Content addressing for DAGs and workflow identity.
//
// Workflows are unique by (tool version, dag, workflow args); the hashes
// computed here make that uniqueness a single indexed column.

use sha2::{Digest, Sha256};

/// Hex sha256 over the given parts, joined unambiguously.
pub fn content_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

/// Stable hash of a DAG's structure: sorted node ids and sorted edges.
pub fn dag_hash(node_ids: &[i64], edges: &[(i64, i64)]) -> String {
    let mut nodes = node_ids.to_vec();
    nodes.sort_unstable();
    let mut sorted_edges = edges.to_vec();
    sorted_edges.sort_unstable();

    let node_part = nodes
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let edge_part = sorted_edges
        .iter()
        .map(|(u, v)| format!("{}->{}", u, v))
        .collect::<Vec<_>>()
        .join(",");

    content_hash([node_part.as_str(), edge_part.as_str()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_order_insensitive_for_dags() {
        let a = dag_hash(&[1, 2, 3], &[(1, 2), (2, 3)]);
        let b = dag_hash(&[3, 1, 2], &[(2, 3), (1, 2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_distinguishes_structure() {
        let chain = dag_hash(&[1, 2, 3], &[(1, 2), (2, 3)]);
        let fan = dag_hash(&[1, 2, 3], &[(1, 2), (1, 3)]);
        assert_ne!(chain, fan);
    }

    #[test]
    fn length_prefix_prevents_ambiguous_joins() {
        assert_ne!(content_hash(["ab", "c"]), content_hash(["a", "bc"]));
    }
}
