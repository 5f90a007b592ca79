//! Authenticated point-to-point channels between participants.
//!
//! A [`ChannelSet`] is everything one participant owns for one kind of
//! channel: a handle per peer for sending, and a single inbox where every
//! incoming message arrives tagged with its authenticated sender. Two
//! transports produce channel sets: [`pipe`] connects participants living in
//! one process, [`tcp`] connects participants over the network.
//!
//! Every receive takes an absolute deadline, so no participant can block
//! forever on a peer that went away.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use smol::channel::{Receiver, Sender, TrySendError};
use smol::{Task, Timer};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::protocol::{MessageData, Participant, ProtocolError};

mod frame;
pub mod pipe;
pub mod tcp;

pub use pipe::PipeTransport;
pub use tcp::TcpTransport;

/// A message together with the participant it came from.
pub type Envelope = (Participant, MessageData);

/// The two kinds of channels every pair of participants shares.
///
/// Unicast channels carry the share exchange of the signing primitive,
/// broadcast channels carry the traffic of the reliable broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelKind {
    Unicast,
    Broadcast,
}

impl ChannelKind {
    fn tag(&self) -> u8 {
        match self {
            Self::Unicast => 0,
            Self::Broadcast => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Unicast),
            1 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unicast => write!(f, "unicast"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no channel to {0}")]
    UnknownPeer(Participant),
    #[error("channel to {0} is closed")]
    Closed(Participant),
    #[error("{0} channels were already opened")]
    AlreadyOpen(ChannelKind),
    #[error("missing channel key for {0}")]
    MissingKey(Participant),
    #[error("handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },
    #[error("timeout while {0}")]
    Timeout(String),
    #[error("sealing a frame failed")]
    Seal,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The keys protecting the channel to every other participant.
///
/// The key at position `j` protects the channel to participant `j`.
pub struct ChannelKeys {
    keys: Vec<Zeroizing<Vec<u8>>>,
}

impl ChannelKeys {
    pub fn new(keys: Vec<Zeroizing<Vec<u8>>>) -> Self {
        Self { keys }
    }

    /// Fixed labels, for transports which already protect the channels.
    ///
    /// The label of a channel only depends on the pair of participants, so
    /// both ends of it derive the same keys.
    pub fn labels(tool: &str, me: Participant, n: usize) -> Self {
        let keys = (0..n)
            .map(|i| {
                let (lo, hi) = (i.min(me.index()), i.max(me.index()));
                Zeroizing::new(format!("{tool}|{lo}|{hi}").into_bytes())
            })
            .collect();
        Self { keys }
    }

    pub fn get(&self, peer: Participant) -> Result<&[u8], TransportError> {
        self.keys
            .get(peer.index())
            .map(|k| k.as_slice())
            .ok_or(TransportError::MissingKey(peer))
    }
}

/// Traffic counters for the channel to one peer.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
}

impl ChannelStats {
    fn record_sent(&self, len: usize) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_received(&self, len: usize) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
}

/// The sending half of the channel to one peer.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    me: Participant,
    peer: Participant,
    tx: Sender<Envelope>,
    stats: Arc<ChannelStats>,
}

impl ChannelHandle {
    pub fn new(me: Participant, peer: Participant, tx: Sender<Envelope>) -> Self {
        Self {
            me,
            peer,
            tx,
            stats: Arc::new(ChannelStats::default()),
        }
    }

    pub fn peer(&self) -> Participant {
        self.peer
    }

    pub fn send(&self, data: MessageData) -> Result<(), TransportError> {
        let len = data.len();
        match self.tx.try_send((self.me, data)) {
            Ok(()) => {
                self.stats.record_sent(len);
                Ok(())
            }
            Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => {
                Err(TransportError::Closed(self.peer))
            }
        }
    }
}

/// All channels of one kind owned by one participant.
///
/// Dropping the set releases every handle, closes the inbox, and cancels any
/// background task pumping a network connection.
pub struct ChannelSet {
    me: Participant,
    kind: ChannelKind,
    handles: BTreeMap<Participant, ChannelHandle>,
    inbox: Receiver<Envelope>,
    tasks: Vec<Task<()>>,
}

impl ChannelSet {
    pub fn new(
        me: Participant,
        kind: ChannelKind,
        handles: Vec<ChannelHandle>,
        inbox: Receiver<Envelope>,
    ) -> Self {
        Self {
            me,
            kind,
            handles: handles.into_iter().map(|h| (h.peer, h)).collect(),
            inbox,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn with_tasks(mut self, tasks: Vec<Task<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn me(&self) -> Participant {
        self.me
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Iterate over the peers this set has a channel to.
    pub fn peers(&self) -> impl Iterator<Item = Participant> + '_ {
        self.handles.keys().copied()
    }

    /// Send a message to one peer.
    pub fn send(&self, to: Participant, data: MessageData) -> Result<(), TransportError> {
        self.handles
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?
            .send(data)
    }

    /// Send a message to every peer, returning how many accepted it.
    ///
    /// A peer whose channel is closed has crashed or finished; that is not an
    /// error for the sender, whose own progress only depends on receiving.
    pub fn send_many(&self, data: &MessageData) -> usize {
        let mut delivered = 0;
        for handle in self.handles.values() {
            match handle.send(data.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(participant = %self.me, kind = %self.kind, "send failed: {e}"),
            }
        }
        delivered
    }

    /// Receive the next message from any peer, waiting until the deadline.
    pub async fn recv(&self, deadline: Instant) -> Result<Envelope, ProtocolError> {
        loop {
            let received = smol::future::or(async { Some(self.inbox.recv().await) }, async {
                Timer::at(deadline).await;
                None
            })
            .await;
            match received {
                None => {
                    return Err(ProtocolError::Timeout(format!("{} message", self.kind)));
                }
                Some(Err(_)) => {
                    return Err(ProtocolError::ChannelClosed(format!("{} message", self.kind)));
                }
                Some(Ok((from, data))) => match self.handles.get(&from) {
                    Some(handle) => {
                        handle.stats.record_received(data.len());
                        return Ok((from, data));
                    }
                    None => {
                        debug!(participant = %self.me, "dropping message from unknown {from}");
                    }
                },
            }
        }
    }

    /// Traffic counters for every peer.
    pub fn statistics(&self) -> Vec<(Participant, StatsSnapshot)> {
        self.handles
            .values()
            .map(|h| (h.peer, h.stats.snapshot()))
            .collect()
    }

    pub fn log_statistics(&self) {
        for (peer, stats) in self.statistics() {
            info!(
                participant = %self.me,
                kind = %self.kind,
                %peer,
                sent = stats.sent_messages,
                sent_bytes = stats.sent_bytes,
                received = stats.received_messages,
                received_bytes = stats.received_bytes,
                "channel statistics"
            );
        }
    }
}

/// Something which can connect one participant to all the others.
///
/// The participant calls [`Transport::open`] once per [`ChannelKind`].
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Open a channel of the given kind to every other participant.
    async fn open(
        &mut self,
        kind: ChannelKind,
        keys: &ChannelKeys,
    ) -> Result<ChannelSet, TransportError>;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_send_and_recv_update_statistics() {
        let mut transports = pipe::network(3);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), 3);
        smol::block_on(async {
            let mut t1 = transports.pop().unwrap();
            let mut t0 = transports.remove(0);
            let c0 = t0.open(ChannelKind::Unicast, &keys).await.unwrap();
            let c2 = t1.open(ChannelKind::Unicast, &keys).await.unwrap();
            c0.send(Participant::from(2u32), vec![1, 2, 3]).unwrap();
            let (from, data) = c2
                .recv(Instant::now() + Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(from, Participant::from(0u32));
            assert_eq!(data, vec![1, 2, 3]);
            let sent: Vec<_> = c0.statistics();
            let to_two = sent.iter().find(|(p, _)| *p == 2u32.into()).unwrap().1;
            assert_eq!(to_two.sent_messages, 1);
            assert_eq!(to_two.sent_bytes, 3);
            let received = c2.statistics();
            let from_zero = received.iter().find(|(p, _)| *p == 0u32.into()).unwrap().1;
            assert_eq!(from_zero.received_messages, 1);
        });
    }

    #[test]
    fn test_recv_times_out() {
        let mut transports = pipe::network(3);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), 3);
        smol::block_on(async {
            let set = transports[0].open(ChannelKind::Broadcast, &keys).await.unwrap();
            let start = Instant::now();
            let err = set
                .recv(start + Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, ProtocolError::Timeout(_)));
            assert!(start.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn test_send_to_crashed_peer_fails() {
        let mut transports = pipe::network(3);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), 3);
        drop(transports.pop());
        smol::block_on(async {
            let set = transports[0].open(ChannelKind::Unicast, &keys).await.unwrap();
            assert!(matches!(
                set.send(Participant::from(2u32), vec![0]),
                Err(TransportError::Closed(_))
            ));
            assert_eq!(set.send_many(&vec![0]), 1);
        });
    }

    #[test]
    fn test_labels_agree_on_both_ends() {
        let (p0, p1, p2) = (Participant::from(0u32), Participant::from(1u32), Participant::from(2u32));
        let at = |me| ChannelKeys::labels("test", me, 3);
        assert_eq!(at(p0).get(p2).unwrap(), at(p2).get(p0).unwrap());
        assert_eq!(at(p1).get(p2).unwrap(), at(p2).get(p1).unwrap());
        assert_ne!(at(p0).get(p1).unwrap(), at(p0).get(p2).unwrap());
        assert_ne!(at(p0).get(p2).unwrap(), at(p1).get(p2).unwrap());
        assert!(matches!(at(p0).get(Participant::from(3u32)), Err(TransportError::MissingKey(_))));
    }
}
