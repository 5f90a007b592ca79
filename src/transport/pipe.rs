//! In-process channels, connecting participants running on one host.
//!
//! Every participant gets a [`PipeTransport`] holding its inboxes and a
//! sender into the inbox of every other participant. Dropping a transport
//! (or a channel set opened from it) closes those channels, which the other
//! participants observe exactly like a crashed peer.
use smol::channel::{unbounded, Receiver, Sender};

use crate::protocol::Participant;

use super::{ChannelHandle, ChannelKeys, ChannelKind, ChannelSet, Envelope, Transport, TransportError};

struct Endpoint {
    inbox: Receiver<Envelope>,
    outboxes: Vec<(Participant, Sender<Envelope>)>,
}

/// One participant's end of an in-process network.
pub struct PipeTransport {
    me: Participant,
    unicast: Option<Endpoint>,
    broadcast: Option<Endpoint>,
}

impl PipeTransport {
    pub fn me(&self) -> Participant {
        self.me
    }
}

fn endpoints(n: usize) -> Vec<Endpoint> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..n).map(|_| unbounded()).unzip();
    receivers
        .into_iter()
        .enumerate()
        .map(|(i, inbox)| {
            let outboxes = senders
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, tx)| (Participant::from(j as u32), tx.clone()))
                .collect();
            Endpoint { inbox, outboxes }
        })
        .collect()
}

/// Create a fully connected network of `n` participants.
///
/// The transport at position `i` belongs to participant `i`.
pub fn network(n: usize) -> Vec<PipeTransport> {
    endpoints(n)
        .into_iter()
        .zip(endpoints(n))
        .enumerate()
        .map(|(i, (unicast, broadcast))| PipeTransport {
            me: Participant::from(i as u32),
            unicast: Some(unicast),
            broadcast: Some(broadcast),
        })
        .collect()
}

impl Transport for PipeTransport {
    /// Pipes never leave the process, so the channel keys are not needed.
    async fn open(
        &mut self,
        kind: ChannelKind,
        _keys: &ChannelKeys,
    ) -> Result<ChannelSet, TransportError> {
        let endpoint = match kind {
            ChannelKind::Unicast => self.unicast.take(),
            ChannelKind::Broadcast => self.broadcast.take(),
        }
        .ok_or(TransportError::AlreadyOpen(kind))?;
        let handles = endpoint
            .outboxes
            .into_iter()
            .map(|(peer, tx)| ChannelHandle::new(self.me, peer, tx))
            .collect();
        Ok(ChannelSet::new(self.me, kind, handles, endpoint.inbox))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_open_twice_fails() {
        let mut transports = network(3);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), 3);
        smol::block_on(async {
            let set = transports[1].open(ChannelKind::Unicast, &keys).await.unwrap();
            let peers: Vec<_> = set.peers().collect();
            assert_eq!(peers, vec![Participant::from(0u32), Participant::from(2u32)]);
            assert!(matches!(
                transports[1].open(ChannelKind::Unicast, &keys).await,
                Err(TransportError::AlreadyOpen(ChannelKind::Unicast))
            ));
            assert!(transports[1].open(ChannelKind::Broadcast, &keys).await.is_ok());
        });
    }
}
