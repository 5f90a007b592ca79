use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::serde::{decode, encode_with_header};
use crate::transport::ChannelSet;

use super::{MessageData, Participant, ProtocolError};

/// A sub channel, inside of a channel.
///
/// Used to run several signing jobs over the same channels.
pub type SubChannel = u16;
/// A waitpoint inside of a channel.
pub type Waitpoint = u8;

/// Upper bound on messages parked for waitpoints nobody asked for yet.
const MAX_BUFFERED: usize = 4096;

/// A header used to route the message
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Hash)]
pub struct MessageHeader {
    /// Identifying the sub channel.
    sub_channel: SubChannel,
    /// Identifying the specific waitpoint.
    waitpoint: Waitpoint,
}

impl MessageHeader {
    /// The number of bytes in this encoding.
    const LEN: usize = 3;

    pub fn new(sub_channel: SubChannel) -> Self {
        Self {
            sub_channel,
            waitpoint: 0,
        }
    }

    fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.sub_channel.to_le_bytes());
        out[2] = self.waitpoint;
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            sub_channel: u16::from_le_bytes([bytes[0], bytes[1]]),
            waitpoint: bytes[2],
        })
    }

    pub fn with_waitpoint(&self, waitpoint: Waitpoint) -> Self {
        Self {
            sub_channel: self.sub_channel,
            waitpoint,
        }
    }

    pub fn next_waitpoint(&mut self) -> Waitpoint {
        let out = self.waitpoint;
        self.waitpoint += 1;
        out
    }
}

/// Private channels to every other participant, routed by [`MessageHeader`].
///
/// Messages for a header nobody is waiting on yet are buffered, so the order
/// in which peers advance through the waitpoints does not matter.
pub struct PrivateChannels {
    chans: ChannelSet,
    buffer: HashMap<(MessageHeader, Participant), VecDeque<MessageData>>,
    buffered: usize,
}

impl PrivateChannels {
    pub fn new(chans: ChannelSet) -> Self {
        Self {
            chans,
            buffer: HashMap::new(),
            buffered: 0,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.chans
    }

    pub fn me(&self) -> Participant {
        self.chans.me()
    }

    /// Send a message privately to one participant.
    ///
    /// A failed send is only logged: the receiver will notice the gap.
    pub fn send_private<T: Serialize>(&self, header: MessageHeader, to: Participant, data: &T) {
        let message = encode_with_header(&header.to_bytes(), data);
        if let Err(e) = self.chans.send(to, message) {
            debug!(participant = %self.me(), "private send to {to} failed: {e}");
        }
    }

    /// Receive the message a participant sent for a given header.
    pub async fn recv_from<T: DeserializeOwned>(
        &mut self,
        header: MessageHeader,
        from: Participant,
        deadline: Instant,
    ) -> Result<T, ProtocolError> {
        let data = match self.pop(header, from) {
            Some(data) => data,
            None => loop {
                let (sender, message) = self.chans.recv(deadline).await.map_err(|e| match e {
                    ProtocolError::Timeout(_) => {
                        ProtocolError::Timeout(format!("private message from {from}"))
                    }
                    other => other,
                })?;
                let their_header = match MessageHeader::from_bytes(&message) {
                    Some(h) => h,
                    None => {
                        warn!(participant = %self.me(), "dropping headerless message from {sender}");
                        continue;
                    }
                };
                if their_header == header && sender == from {
                    break message;
                }
                self.push(their_header, sender, message);
            },
        };
        decode(&data[MessageHeader::LEN..]).map_err(|e| ProtocolError::Malformed {
            from,
            reason: e.to_string(),
        })
    }

    fn pop(&mut self, header: MessageHeader, from: Participant) -> Option<MessageData> {
        let queue = self.buffer.get_mut(&(header, from))?;
        let out = queue.pop_front();
        if out.is_some() {
            self.buffered -= 1;
        }
        out
    }

    fn push(&mut self, header: MessageHeader, from: Participant, message: MessageData) {
        if self.buffered >= MAX_BUFFERED {
            warn!(participant = %self.me(), "message buffer full, dropping message from {from}");
            return;
        }
        self.buffered += 1;
        self.buffer
            .entry((header, from))
            .or_default()
            .push_back(message);
    }
}
