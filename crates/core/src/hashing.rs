//! SHA-256 digests of submitted graphs.
//!
//! The digest of a graph's canonical JSON is stored in sidecar metadata so
//! two outputs can be checked for having come from the same graph.

use sha2::{Digest, Sha256};

use crate::graph::ExecutionGraph;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Digest of a graph's canonical serialization.
pub fn graph_digest(graph: &ExecutionGraph) -> String {
    sha256_hex(graph.to_canonical_string().as_bytes())
}
