//! Cluster peer table.

use crate::core::{KestrelError, Result};
use serde::Serialize;

/// One collector process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Peer {
    pub address: String,
    pub is_self: bool,
}

/// Deduplicated, sorted list of peers. Every process sorts the same way, so
/// global instance indices mean the same thing everywhere.
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: Vec<Peer>,
    self_index: usize,
}

impl PeerTable {
    /// Single-process table.
    pub fn standalone(self_address: &str) -> Self {
        PeerTable {
            peers: vec![Peer {
                address: self_address.to_string(),
                is_self: true,
            }],
            self_index: 0,
        }
    }

    /// Builds the table from configured addresses. An empty list means standalone.
    pub fn new(self_address: &str, addresses: &[String]) -> Result<Self> {
        if addresses.is_empty() {
            return Ok(Self::standalone(self_address));
        }

        let mut sorted: Vec<&str> = addresses.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let self_index = sorted.iter().position(|a| *a == self_address).ok_or_else(|| {
            KestrelError::config(format!("self address {} is not a cluster peer", self_address))
        })?;

        let peers = sorted
            .into_iter()
            .map(|address| Peer {
                address: address.to_string(),
                is_self: address == self_address,
            })
            .collect();

        Ok(PeerTable { peers, self_index })
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn self_index(&self) -> usize {
        self.self_index
    }

    pub fn self_peer(&self) -> &Peer {
        &self.peers[self.self_index]
    }

    pub fn is_standalone(&self) -> bool {
        self.peers.len() == 1
    }

    /// Peer owning global instance `index` when each peer runs `per_peer` instances.
    pub fn owner_of(&self, index: usize, per_peer: usize) -> &Peer {
        &self.peers[(index / per_peer.max(1)) % self.peers.len()]
    }
}
