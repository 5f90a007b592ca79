//! This module holds some utilities for working with participants.
//!
//! There are two kinds of lists here. A [`PeerList`] is the canonical list of
//! peer identities for one run, which fixes every participant's index. A
//! [`ParticipantList`] is a sorted set of threshold-scheme participants, which
//! knows how to compute Lagrange coefficients for interpolation at zero.
use std::collections::BTreeSet;

use elliptic_curve::Field;
use magikitten::Transcript;
use rand_core::RngCore;
use thiserror::Error;

use crate::compat::PgpCurve;
use crate::protocol::Participant;

/// The largest number of participants a run supports.
pub const MAX_N: usize = 32;

/// The smallest number of participants a run supports.
///
/// Fewer parties cannot tolerate a single fault under `t = (n - 1) / 3`.
pub const MIN_N: usize = 3;

/// The longest peer identity, in bytes.
pub const MAX_PEER_ID_LEN: usize = 255;

const SESSION_LABEL: &[u8] = b"threshold-revoke session";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerListError {
    #[error("no peers given")]
    Empty,
    #[error("peer identity \"{0}\" too long")]
    IdentityTooLong(String),
    #[error("peer identity \"{0}\" contains '|'")]
    Separator(String),
    #[error("too few or too many peers given: {count} (allowed {min}..={max})", min = MIN_N, max = MAX_N)]
    BadCount { count: usize },
    #[error("\"{0}\" is not a member of the peer list")]
    NotAMember(String),
}

/// The canonicalized list of peer identities for one run.
///
/// Every participant canonicalizes the list independently; since the result
/// only depends on the set of identities, all of them agree on the index
/// assigned to each peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    peers: Vec<String>,
}

impl PeerList {
    /// Sort and de-duplicate the given identities, then check the bounds.
    pub fn canonicalize<I, S>(peers: I) -> Result<Self, PeerListError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for peer in peers {
            let peer = peer.into();
            if peer.len() > MAX_PEER_ID_LEN {
                return Err(PeerListError::IdentityTooLong(peer));
            }
            // '|' separates the identities in the protocol identifier.
            if peer.contains('|') {
                return Err(PeerListError::Separator(peer));
            }
            out.push(peer);
        }
        if out.is_empty() {
            return Err(PeerListError::Empty);
        }
        let out: Vec<String> = out.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if out.len() < MIN_N || out.len() > MAX_N {
            return Err(PeerListError::BadCount { count: out.len() });
        }
        Ok(Self { peers: out })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.peers
    }

    /// The identity of a participant.
    pub fn name(&self, p: Participant) -> &str {
        &self.peers[p.index()]
    }

    /// Return the index of a given identity.
    pub fn index_of(&self, peer: &str) -> Result<Participant, PeerListError> {
        self.peers
            .binary_search_by(|x| x.as_str().cmp(peer))
            .map(|i| Participant::from(i as u32))
            .map_err(|_| PeerListError::NotAMember(peer.to_string()))
    }

    /// Iterate over all participants, in canonical order.
    pub fn participants(&self) -> impl Iterator<Item = Participant> + '_ {
        (0..self.peers.len() as u32).map(Participant::from)
    }

    /// Iterate over the other participants.
    pub fn others(&self, me: Participant) -> impl Iterator<Item = Participant> + '_ {
        self.participants().filter(move |p| *p != me)
    }

    /// The maximum number of faulty parties tolerated, `t = (n - 1) / 3`.
    pub fn resilience(&self) -> usize {
        (self.peers.len() - 1) / 3
    }

    /// The identifier binding broadcasts to this tool, version, and peer list.
    pub fn protocol_id(&self, tool: &str, version: &str) -> String {
        let mut id = format!("{tool}|{version}|");
        for peer in &self.peers {
            id.push_str(peer);
            id.push('|');
        }
        id
    }
}

/// Squeeze a protocol identifier into the digest carried by every broadcast.
pub fn session_digest(protocol_id: &str) -> [u8; 32] {
    let mut transcript = Transcript::new(SESSION_LABEL);
    transcript.message(b"protocol id", protocol_id.as_bytes());
    let mut out = [0u8; 32];
    transcript.challenge(b"session").fill_bytes(&mut out);
    out
}

/// Represents a sorted list of participants.
///
/// Everybody agrees on its order, so iterating it picks the same subsets
/// at every participant.
#[derive(Debug, Clone)]
pub struct ParticipantList {
    participants: Vec<Participant>,
}

impl ParticipantList {
    /// Create a participant list from a slice of participants.
    ///
    /// This will return None if the participants have duplicates.
    pub fn new(participants: &[Participant]) -> Option<Self> {
        let mut out = participants.to_owned();
        out.sort();
        if out.windows(2).any(|w| w[0] == w[1]) {
            return None;
        }
        Some(Self { participants: out })
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    /// Iterate over the participants, in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().copied()
    }

    /// Iterate over the other participants
    pub fn others(&self, me: Participant) -> impl Iterator<Item = Participant> + '_ {
        self.participants.iter().filter(move |x| **x != me).copied()
    }

    /// Get the lagrange coefficient for a participant, relative to this list.
    ///
    /// This is the coefficient for interpolating at zero.
    pub fn lagrange<C: PgpCurve>(&self, p: Participant) -> C::Scalar {
        let p_scalar = p.scalar::<C>();

        let mut top = C::Scalar::ONE;
        let mut bot = C::Scalar::ONE;
        for q in self.others(p) {
            let q_scalar = q.scalar::<C>();
            top *= q_scalar;
            bot *= q_scalar - p_scalar;
        }

        // The participants are distinct, so bot is never zero.
        top * bot.invert().unwrap()
    }
}
