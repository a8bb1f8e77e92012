//! Glare-free initiator selection and per-pair signaling phases.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Whether `self_id` sends the offer to `other_id`.
///
/// The greater id (byte-wise string order) initiates, so both sides reach the same answer
/// without coordinating. A user is never paired with itself.
pub fn should_initiate(self_id: &str, other_id: &str) -> bool {
    self_id > other_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkPhase {
    Unpaired,
    OfferSent,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("user {0} cannot pair with itself")]
    SelfPair(String),
    #[error("{from} is not the initiator for this pair; {initiator} sends the offer")]
    NotInitiator { from: String, initiator: String },
    #[error("answer from {from} has no outstanding offer")]
    NoPendingOffer { from: String },
    #[error("peer link is closed")]
    Closed,
}

/// Unordered pair of user ids, stored low/high.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            Self {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerLink {
    pub initiator: String,
    pub responder: String,
    pub phase: LinkPhase,
}

impl PeerLink {
    pub fn between(a: &str, b: &str) -> Result<Self, PairingError> {
        if a == b {
            return Err(PairingError::SelfPair(a.to_string()));
        }
        let (initiator, responder) = if should_initiate(a, b) { (a, b) } else { (b, a) };
        Ok(Self {
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            phase: LinkPhase::Unpaired,
        })
    }

    /// Offers only ever come from the initiator. Re-offers (ICE restarts) are allowed.
    pub fn on_offer(&mut self, from: &str) -> Result<LinkPhase, PairingError> {
        if self.phase == LinkPhase::Closed {
            return Err(PairingError::Closed);
        }
        if from != self.initiator {
            return Err(PairingError::NotInitiator {
                from: from.to_string(),
                initiator: self.initiator.clone(),
            });
        }
        self.phase = LinkPhase::OfferSent;
        Ok(self.phase)
    }

    pub fn on_answer(&mut self, from: &str) -> Result<LinkPhase, PairingError> {
        if self.phase == LinkPhase::Closed {
            return Err(PairingError::Closed);
        }
        if from != self.responder || self.phase != LinkPhase::OfferSent {
            return Err(PairingError::NoPendingOffer {
                from: from.to_string(),
            });
        }
        self.phase = LinkPhase::AnswerSent;
        Ok(self.phase)
    }

    pub fn on_candidate(&self) -> Result<LinkPhase, PairingError> {
        match self.phase {
            LinkPhase::Closed => Err(PairingError::Closed),
            phase => Ok(phase),
        }
    }

    pub fn report(&mut self, phase: LinkPhase) -> Result<LinkPhase, PairingError> {
        if self.phase == LinkPhase::Closed {
            return Err(PairingError::Closed);
        }
        self.phase = phase;
        Ok(self.phase)
    }
}

/// At most one link per unordered pair.
#[derive(Debug, Default)]
pub struct PeerLinks {
    links: HashMap<PairKey, PeerLink>,
}

impl PeerLinks {
    /// Creates the link for a pair if it does not exist yet. Returns true when created.
    pub fn ensure(&mut self, a: &str, b: &str) -> Result<bool, PairingError> {
        let key = PairKey::new(a, b);
        if self.links.contains_key(&key) {
            return Ok(false);
        }
        let link = PeerLink::between(a, b)?;
        self.links.insert(key, link);
        Ok(true)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<&PeerLink> {
        self.links.get(&PairKey::new(a, b))
    }

    pub fn get_mut(&mut self, a: &str, b: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(&PairKey::new(a, b))
    }

    /// Tears down every link the user takes part in; the removed links are returned closed.
    pub fn remove_user(&mut self, user_id: &str) -> Vec<PeerLink> {
        let keys: Vec<PairKey> = self
            .links
            .keys()
            .filter(|key| key.contains(user_id))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.links.remove(&key))
            .map(|mut link| {
                link.phase = LinkPhase::Closed;
                link
            })
            .collect()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.links.len();
        self.links.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
