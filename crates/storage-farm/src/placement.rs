//! Permuted server ordering
//!
//! Each file has a peer-selection index. Servers are ranked for that file by
//! `SHA-1(index || permutation seed)`, which gives every file its own stable
//! ordering of the grid. Preferred servers always sort ahead of the rest.

use crate::config::BrokerConfig;
use crate::seed::PermutationSeed;
use crate::server::StorageServer;
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Position of a server in the ordering for `peer_selection_index`
pub fn permute_server_hash(peer_selection_index: &[u8], seed: &PermutationSeed) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(peer_selection_index);
    hasher.update(seed.as_bytes());
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Order `servers` for one file
pub fn servers_for_psi(
    mut servers: Vec<Arc<StorageServer>>,
    peer_selection_index: &[u8],
    config: &BrokerConfig,
) -> Vec<Arc<StorageServer>> {
    if config.permute_peers {
        servers.sort_by_cached_key(|s| {
            (
                !config.is_preferred(s.server_id()),
                permute_server_hash(peer_selection_index, s.get_permutation_seed()),
            )
        });
    } else {
        servers.sort_by_cached_key(|s| (!config.is_preferred(s.server_id()), s.server_id().clone()));
    }
    servers
}
