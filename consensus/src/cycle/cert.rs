/// Cycle certificates
///
/// A certificate is one node's signature over a marker. Certificates are
/// ranked by an XOR score so every node orders the same signer set the same
/// way; per marker only the best `BEST_CERTS_WANTED` distinct owners are
/// kept, and the marker with the highest aggregate wins the cycle.

use super::types::CycleRecord;
use crate::config::BEST_CERTS_WANTED;
use crate::crypto::{ecdsa_sign, ecdsa_verify, hash_object, ECDSASignature, Hash, HashError, KeyPair};
use crate::membership::NodeList;
use crate::network::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Certificate validation errors
#[derive(Error, Debug)]
pub enum CertError {
    #[error("Empty certificate bundle")]
    Empty,

    #[error("Record counter {got} does not follow chain head {head}")]
    WrongCounter { head: u64, got: u64 },

    #[error("Certificate marker {cert} does not match record marker {record}")]
    MarkerMismatch { cert: Hash, record: Hash },

    #[error("Duplicate certificate owner: {0}")]
    DuplicateOwner(NodeId),

    #[error("Unknown certificate owner: {0}")]
    UnknownOwner(NodeId),

    #[error("Invalid certificate signature from {0}")]
    BadSignature(NodeId),

    #[error("Certificate score mismatch for {0}")]
    BadScore(NodeId),

    #[error("Hash error: {0}")]
    Hash(#[from] HashError),
}

pub type Result<T> = std::result::Result<T, CertError>;

/// Owner and signature of a certificate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub owner: NodeId,
    pub sig: ECDSASignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCert {
    pub marker: Hash,
    pub sign: Sign,
    pub score: u32,
}

impl CycleCert {
    /// Sign `marker` with our key
    pub fn create(marker: Hash, keypair: &KeyPair) -> Result<Self> {
        let owner = NodeId::from_public_key(&keypair.public_key);
        let score = score(&marker, &owner)?;
        let sig = ecdsa_sign(&keypair.secret_key, marker.as_bytes());
        Ok(Self {
            marker,
            sign: Sign { owner, sig },
            score,
        })
    }

    pub fn owner(&self) -> &NodeId {
        &self.sign.owner
    }
}

#[derive(Serialize)]
struct IdObject<'a> {
    id: &'a NodeId,
}

/// XOR of the leading 32 bits of the marker and of `hash({id: owner})`
pub fn score(marker: &Hash, owner: &NodeId) -> Result<u32> {
    let owner_hash = hash_object(&IdObject { id: owner })?;
    Ok(marker.prefix_u32() ^ owner_hash.prefix_u32())
}

/// `{certs, record}` as carried by compare-cert and gossip-cert
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertBundle {
    pub certs: Vec<CycleCert>,
    pub record: CycleRecord,
}

impl CertBundle {
    pub fn marker(&self) -> Option<Hash> {
        self.certs.first().map(|c| c.marker)
    }
}

/// Check a bundle as a whole; any failure rejects every cert in it
pub fn validate_certs(
    certs: &[CycleCert],
    record: &CycleRecord,
    head_counter: u64,
    nodes: &NodeList,
    sender: &NodeId,
) -> Result<()> {
    if certs.is_empty() {
        return Err(CertError::Empty);
    }
    if record.counter != head_counter + 1 {
        return Err(CertError::WrongCounter {
            head: head_counter,
            got: record.counter,
        });
    }

    let marker = record.marker()?;
    let mut owners = Vec::with_capacity(certs.len());

    for cert in certs {
        if cert.marker != marker {
            return Err(CertError::MarkerMismatch {
                cert: cert.marker,
                record: marker,
            });
        }
        if owners.contains(&cert.owner()) {
            return Err(CertError::DuplicateOwner(cert.owner().clone()));
        }
        owners.push(cert.owner());

        let node = nodes
            .get(cert.owner())
            .ok_or_else(|| CertError::UnknownOwner(cert.owner().clone()))?;
        if !ecdsa_verify(&node.public_key, marker.as_bytes(), &cert.sign.sig) {
            return Err(CertError::BadSignature(cert.owner().clone()));
        }
        if cert.score != score(&marker, cert.owner())? {
            return Err(CertError::BadScore(cert.owner().clone()));
        }
    }

    debug!(%sender, %marker, certs = certs.len(), "cert bundle valid");
    Ok(())
}

/// Outcome of one compare-cert exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    /// Peer holds our best marker
    Equal,
    /// Peer's bundle improved our best; adopted
    Better,
    /// Invalid or lower ranked; ignored
    Worse,
    /// Our cycle or quarter moved on mid-comparison
    Abort,
}

/// Converging agreement state for the current cycle
#[derive(Clone, Debug, Default)]
pub struct BestCertState {
    pub best_marker: Option<Hash>,
    pub best_record: Option<CycleRecord>,
    /// Top certs per marker, best first
    pub best_cycle_certs: HashMap<Hash, Vec<CycleCert>>,
    /// Aggregate score per marker
    pub best_cert_scores: HashMap<Hash, u64>,
}

impl BestCertState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn aggregate(&self, marker: &Hash) -> u64 {
        self.best_cert_scores.get(marker).copied().unwrap_or(0)
    }

    pub fn certs_for(&self, marker: &Hash) -> &[CycleCert] {
        self.best_cycle_certs.get(marker).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Full best bundle, if any cert has been seen this cycle
    pub fn best_bundle(&self) -> Option<CertBundle> {
        let marker = self.best_marker?;
        let record = self.best_record.clone()?;
        Some(CertBundle {
            certs: self.certs_for(&marker).to_vec(),
            record,
        })
    }

    /// Merge validated certs for `record` and re-rank.
    ///
    /// The best pair is replaced only when `(aggregate, marker)` strictly
    /// exceeds the current best, so the result does not depend on arrival
    /// order. Applying the same certs twice changes nothing.
    pub fn improve_best_cert(&mut self, certs: &[CycleCert], record: &CycleRecord) -> bool {
        let marker = match certs.first() {
            Some(cert) => cert.marker,
            None => return false,
        };
        let previous_best = self.best_marker.map(|m| (self.aggregate(&m), m));

        let ranked = self.best_cycle_certs.entry(marker).or_default();
        for cert in certs.iter().filter(|c| c.marker == marker) {
            match ranked.iter_mut().find(|c| c.owner() == cert.owner()) {
                Some(existing) if cert.score > existing.score => *existing = cert.clone(),
                Some(_) => {}
                None => ranked.push(cert.clone()),
            }
        }
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.owner().cmp(b.owner())));
        ranked.truncate(BEST_CERTS_WANTED);

        let aggregate: u64 = ranked.iter().map(|c| c.score as u64).sum();
        self.best_cert_scores.insert(marker, aggregate);

        let improved = match previous_best {
            None => true,
            Some(best) => (aggregate, marker) > best,
        };
        if improved {
            self.best_marker = Some(marker);
            self.best_record = Some(record.clone());
        }
        improved
    }
}
