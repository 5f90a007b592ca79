//! This module provides the vocabulary shared by every multi-party step.
//!
//! Participants are identified by small integers, messages are opaque byte
//! vectors, and everything that can go wrong while talking to other parties
//! is a [`ProtocolError`]. The channels themselves live in [`crate::transport`];
//! the waitpoint-tagged private channels built on top of them live in
//! [`internal`].
use std::error;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compat::PgpCurve;

/// Represents an error which can happen when running a protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A blocking receive hit its deadline.
    #[error("timeout while waiting for {0}")]
    Timeout(String),
    /// Every sender feeding a channel has gone away.
    #[error("channel closed while waiting for {0}")]
    ChannelClosed(String),
    /// A message could not be decoded.
    #[error("malformed message from {from:?}: {reason}")]
    Malformed { from: Participant, reason: String },
    /// Some assertion in the protocol failed.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
    /// Some generic error happened.
    #[error(transparent)]
    Other(#[from] Box<dyn error::Error + Send + Sync>),
}

impl ProtocolError {
    /// True for errors caused by a peer that stopped answering.
    pub fn is_liveness_fault(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ChannelClosed(_))
    }
}

/// Represents an error which can happen when *initializing* a protocol.
///
/// These are related to bad parameters for the protocol, and things like that.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("bad parameters: {0}")]
    BadParameters(String),
}

/// Represents a participant in the protocol.
///
/// The same type is used for two numbering schemes: the index of a peer in the
/// canonical peer list of the current run, and the position of a peer in the
/// peer list stored with the key share. [`crate::lifecycle::Mapping`] converts
/// between the two.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
pub struct Participant(u32);

impl Participant {
    /// Return this participant as little endian bytes.
    pub fn bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// The position of this participant, usable as a vector index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Return the scalar associated with this participant.
    ///
    /// This is the x-coordinate used for Shamir sharing, so it is never zero.
    pub fn scalar<C: PgpCurve>(&self) -> C::Scalar {
        C::Scalar::from(self.0 as u64 + 1)
    }
}

impl From<Participant> for u32 {
    fn from(p: Participant) -> Self {
        p.0
    }
}

impl From<u32> for Participant {
    fn from(x: u32) -> Self {
        Participant(x)
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p_{}", self.0)
    }
}

/// Represents the data making up a message.
///
/// We choose to just represent messages as opaque vectors of bytes, with all
/// the serialization logic handled internally.
pub type MessageData = Vec<u8>;

pub mod internal;
