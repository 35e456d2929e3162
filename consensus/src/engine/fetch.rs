/// Quorum fetch of a committed record
///
/// Used at a cycle boundary when we hold no candidate for the record being
/// closed. Peers are asked in random order for the committed record at a
/// counter; an answer counts only when it is committed, links to our head,
/// and its marker recomputes. The first marker reported by
/// `fetch_redundancy` peers (fewer when fewer peers exist) is accepted.

use super::EngineInner;
use crate::crypto::Hash;
use crate::network::types::Route;
use crate::storage::StoredCycle;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Request body of the newest-cycle route
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleQuery {
    /// Committed record at this counter; the newest when absent
    pub counter: Option<u64>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FetchError {
    #[error("Record is still provisional")]
    Provisional,

    #[error("Expected counter {expected}, got {got}")]
    WrongCounter { expected: u64, got: u64 },

    #[error("Record does not link to our head")]
    WrongPrevious,

    #[error("Stored marker does not match record")]
    MarkerMismatch,
}

/// Check one peer answer against what we expect to receive
pub fn check_candidate(stored: &StoredCycle, counter: u64, previous: &Hash) -> Result<(), FetchError> {
    if stored.provisional {
        return Err(FetchError::Provisional);
    }
    if stored.record.counter != counter {
        return Err(FetchError::WrongCounter {
            expected: counter,
            got: stored.record.counter,
        });
    }
    if &stored.record.previous != previous {
        return Err(FetchError::WrongPrevious);
    }
    match stored.record.marker() {
        Ok(marker) if marker == stored.marker => Ok(()),
        _ => Err(FetchError::MarkerMismatch),
    }
}

/// Votes per marker
#[derive(Debug)]
pub struct FetchTally {
    needed: usize,
    votes: HashMap<Hash, (StoredCycle, usize)>,
}

impl FetchTally {
    pub fn new(needed: usize) -> Self {
        Self {
            needed: needed.max(1),
            votes: HashMap::new(),
        }
    }

    /// Count a checked answer; returns the record once enough peers agree
    pub fn add(&mut self, stored: StoredCycle) -> Option<StoredCycle> {
        let entry = self.votes.entry(stored.marker).or_insert_with(|| (stored, 0));
        entry.1 += 1;
        if entry.1 >= self.needed {
            Some(entry.0.clone())
        } else {
            None
        }
    }

    pub fn votes(&self, marker: &Hash) -> usize {
        self.votes.get(marker).map_or(0, |(_, n)| *n)
    }
}

impl EngineInner {
    /// One fetch attempt for the committed record at `counter`
    pub(crate) async fn fetch_cycle(&self, counter: u64) -> Option<StoredCycle> {
        let (mut peers, previous) = {
            let state = self.state.read().await;
            let peers: Vec<_> = state
                .nodes
                .active()
                .into_iter()
                .filter(|n| &n.id != self.id())
                .collect();
            (peers, state.head_marker)
        };
        if peers.is_empty() {
            debug!(counter, "no peers to fetch from");
            return None;
        }
        peers.shuffle(&mut *self.rng.lock().await);

        let query = CycleQuery { counter: Some(counter) };
        let mut tally = FetchTally::new(self.config.fetch_redundancy.min(peers.len()));

        for peer in &peers {
            let Some(response) = self.comms.ask(peer, Route::NewestCycle, &query, None).await else {
                continue;
            };
            let stored: StoredCycle = match serde_json::from_value::<Option<StoredCycle>>(response) {
                Ok(Some(stored)) => stored,
                Ok(None) => {
                    trace!(peer = %peer.id, counter, "peer has no committed record yet");
                    continue;
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "malformed fetch response");
                    continue;
                }
            };
            if let Err(e) = check_candidate(&stored, counter, &previous) {
                debug!(peer = %peer.id, counter, error = %e, "rejecting fetched record");
                continue;
            }
            if let Some(agreed) = tally.add(stored) {
                debug!(counter, marker = %agreed.marker, "fetched record agreed by quorum");
                return Some(agreed);
            }
        }
        None
    }
}
