//! Bracha style reliable broadcast.
//!
//! Every participant can broadcast a sequence of values. For each origin and
//! sequence number we run one instance of the classic three phase protocol:
//!
//! 1. the origin sends its value to everybody,
//! 2. on the first value from the origin, every party echoes it,
//! 3. on `ceil((n + t + 1) / 2)` matching echoes, or `t + 1` matching readies,
//!    a party sends ready for that value,
//! 4. on `2t + 1` matching readies, the value is delivered.
//!
//! With `n > 3t`, if one honest party delivers a value then every honest
//! party eventually delivers the same value, even if the origin and up to
//! `t - 1` other parties are malicious.
//!
//! All messages carry a 32 byte session digest derived from the protocol
//! identifier; messages from another session are ignored.
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::participants::session_digest;
use crate::protocol::{InitializationError, MessageData, Participant, ProtocolError};
use crate::serde::{decode, encode};
use crate::transport::ChannelSet;

/// How far ahead of the next expected delivery an instance may be.
const MAX_SEQ_WINDOW: u64 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RbcMessage {
    Send {
        seq: u64,
        value: MessageData,
    },
    Echo {
        origin: Participant,
        seq: u64,
        value: MessageData,
    },
    Ready {
        origin: Participant,
        seq: u64,
        value: MessageData,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RbcEnvelope {
    session: [u8; 32],
    message: RbcMessage,
}

#[derive(Debug, Default)]
struct Instance {
    sent_echo: bool,
    sent_ready: bool,
    echo_from: BTreeSet<Participant>,
    ready_from: BTreeSet<Participant>,
    echoes: HashMap<MessageData, usize>,
    readies: HashMap<MessageData, usize>,
    delivered: Option<MessageData>,
}

/// One participant's view of the reliable broadcast.
pub struct ReliableBroadcast {
    n: usize,
    t: usize,
    me: Participant,
    id: String,
    session: [u8; 32],
    chans: ChannelSet,
    timeout: Duration,
    next_seq: u64,
    next_delivery: Vec<u64>,
    instances: HashMap<(Participant, u64), Instance>,
}

impl ReliableBroadcast {
    pub fn new(
        n: usize,
        t: usize,
        me: Participant,
        chans: ChannelSet,
        timeout: Duration,
    ) -> Result<Self, InitializationError> {
        if n <= 3 * t {
            return Err(InitializationError::BadParameters(format!(
                "reliable broadcast needs n > 3t, found n = {n}, t = {t}"
            )));
        }
        if me.index() >= n {
            return Err(InitializationError::BadParameters(format!(
                "{me} is not one of {n} participants"
            )));
        }
        let id = String::new();
        Ok(Self {
            n,
            t,
            me,
            session: session_digest(&id),
            id,
            chans,
            timeout,
            next_seq: 0,
            next_delivery: vec![0; n],
            instances: HashMap::new(),
        })
    }

    /// Bind this broadcast to a protocol identifier.
    pub fn set_id(&mut self, id: &str) {
        self.id = id.to_string();
        self.session = session_digest(id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn me(&self) -> Participant {
        self.me
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A deadline one timeout from now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.chans
    }

    fn echo_quorum(&self) -> usize {
        (self.n + self.t + 2) / 2
    }

    /// Broadcast the next value of this participant.
    pub fn broadcast(&mut self, value: MessageData) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.multicast(RbcMessage::Send { seq, value });
    }

    /// Wait for the next value broadcast by `origin`.
    ///
    /// The instance is consumed even on failure, so a missing value from one
    /// round never shifts the values of later rounds.
    pub async fn deliver_from(
        &mut self,
        origin: Participant,
        deadline: Instant,
    ) -> Result<MessageData, ProtocolError> {
        if origin.index() >= self.n {
            return Err(ProtocolError::AssertionFailed(format!(
                "{origin} is not a participant"
            )));
        }
        let seq = self.next_delivery[origin.index()];
        self.next_delivery[origin.index()] += 1;
        loop {
            if let Some(value) = self
                .instances
                .get(&(origin, seq))
                .and_then(|i| i.delivered.clone())
            {
                return Ok(value);
            }
            let (from, data) = self.chans.recv(deadline).await.map_err(|e| match e {
                ProtocolError::Timeout(_) => {
                    ProtocolError::Timeout(format!("broadcast {seq} from {origin}"))
                }
                ProtocolError::ChannelClosed(_) => {
                    ProtocolError::ChannelClosed(format!("broadcast {seq} from {origin}"))
                }
                other => other,
            })?;
            self.receive(from, &data);
        }
    }

    /// Keep serving the broadcast for `t + 1` rounds of `unit` each.
    ///
    /// Slower parties may still need our echoes and readies to deliver values
    /// we already have.
    pub async fn sync(&mut self, unit: Duration) {
        for round in 0..=self.t {
            let deadline = Instant::now() + unit;
            let mut handled = 0usize;
            loop {
                match self.chans.recv(deadline).await {
                    Ok((from, data)) => {
                        self.receive(from, &data);
                        handled += 1;
                    }
                    Err(ProtocolError::ChannelClosed(_)) => {
                        debug!(participant = %self.me, round, "every peer closed, stopping sync");
                        return;
                    }
                    Err(_) => break,
                }
            }
            debug!(participant = %self.me, round, handled, "sync round done");
        }
    }

    fn multicast(&mut self, message: RbcMessage) {
        let envelope = RbcEnvelope {
            session: self.session,
            message,
        };
        self.chans.send_many(&encode(&envelope));
        self.handle(self.me, envelope.message);
    }

    fn receive(&mut self, from: Participant, data: &[u8]) {
        let envelope: RbcEnvelope = match decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(participant = %self.me, %from, "dropping malformed broadcast message: {e}");
                return;
            }
        };
        if envelope.session != self.session {
            debug!(participant = %self.me, %from, "dropping message from another session");
            return;
        }
        self.handle(from, envelope.message);
    }

    fn in_window(&self, origin: Participant, seq: u64) -> bool {
        origin.index() < self.n && seq < self.next_delivery[origin.index()] + MAX_SEQ_WINDOW
    }

    fn handle(&mut self, from: Participant, message: RbcMessage) {
        match message {
            RbcMessage::Send { seq, value } => {
                let origin = from;
                if !self.in_window(origin, seq) {
                    return;
                }
                let instance = self.instances.entry((origin, seq)).or_default();
                if instance.sent_echo {
                    return;
                }
                instance.sent_echo = true;
                trace!(participant = %self.me, %origin, seq, "echo");
                self.multicast(RbcMessage::Echo { origin, seq, value });
            }
            RbcMessage::Echo { origin, seq, value } => {
                if !self.in_window(origin, seq) {
                    return;
                }
                let quorum = self.echo_quorum();
                let instance = self.instances.entry((origin, seq)).or_default();
                if !instance.echo_from.insert(from) {
                    return;
                }
                let count = instance.echoes.entry(value.clone()).or_insert(0);
                *count += 1;
                if *count >= quorum && !instance.sent_ready {
                    instance.sent_ready = true;
                    trace!(participant = %self.me, %origin, seq, "ready after echoes");
                    self.multicast(RbcMessage::Ready { origin, seq, value });
                }
            }
            RbcMessage::Ready { origin, seq, value } => {
                if !self.in_window(origin, seq) {
                    return;
                }
                let (t, me) = (self.t, self.me);
                let instance = self.instances.entry((origin, seq)).or_default();
                if !instance.ready_from.insert(from) {
                    return;
                }
                let count = instance.readies.entry(value.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                if count >= 2 * t + 1 && instance.delivered.is_none() {
                    debug!(participant = %me, %origin, seq, "delivered");
                    instance.delivered = Some(value.clone());
                }
                if count >= t + 1 && !instance.sent_ready {
                    instance.sent_ready = true;
                    trace!(participant = %me, %origin, seq, "ready after readies");
                    self.multicast(RbcMessage::Ready { origin, seq, value });
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::{pipe, ChannelKeys, ChannelKind, Transport};

    fn setup(n: usize, t: usize) -> Vec<ReliableBroadcast> {
        let mut transports = pipe::network(n);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), n);
        transports
            .iter_mut()
            .enumerate()
            .map(|(i, transport)| {
                let chans =
                    smol::block_on(transport.open(ChannelKind::Broadcast, &keys)).unwrap();
                let mut rbc = ReliableBroadcast::new(
                    n,
                    t,
                    Participant::from(i as u32),
                    chans,
                    Duration::from_secs(5),
                )
                .unwrap();
                rbc.set_id("rbc test");
                rbc
            })
            .collect()
    }

    #[test]
    fn test_bad_parameters() {
        let mut transports = pipe::network(3);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), 3);
        let chans = smol::block_on(transports[0].open(ChannelKind::Broadcast, &keys)).unwrap();
        assert!(ReliableBroadcast::new(3, 1, 0u32.into(), chans, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_everybody_delivers_every_value() {
        let rbcs = setup(4, 1);
        let results = easy_parallel::Parallel::new()
            .each(rbcs, |mut rbc| {
                smol::block_on(async {
                    let me = rbc.me();
                    rbc.broadcast(encode(&u32::from(me)));
                    let mut got = Vec::new();
                    for j in 0..4u32 {
                        let data = rbc.deliver_from(j.into(), rbc.deadline()).await?;
                        got.push(decode::<u32>(&data).unwrap());
                    }
                    rbc.sync(Duration::from_millis(50)).await;
                    Ok::<_, ProtocolError>(got)
                })
            })
            .run();
        for result in results {
            assert_eq!(result.unwrap(), vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_one_silent_party_does_not_block_delivery() {
        let mut rbcs = setup(4, 1);
        // Participant 3 has crashed: its channels are gone.
        drop(rbcs.pop());
        let results = easy_parallel::Parallel::new()
            .each(rbcs, |mut rbc| {
                smol::block_on(async {
                    rbc.broadcast(encode(&"hello"));
                    let mut got = Vec::new();
                    for j in 0..3u32 {
                        let data = rbc.deliver_from(j.into(), rbc.deadline()).await?;
                        got.push(decode::<String>(&data).unwrap());
                    }
                    let missing = rbc
                        .deliver_from(3u32.into(), Instant::now() + Duration::from_millis(100))
                        .await;
                    rbc.sync(Duration::from_millis(50)).await;
                    Ok::<_, ProtocolError>((got, missing.is_err()))
                })
            })
            .run();
        for result in results {
            let (got, missing) = result.unwrap();
            assert_eq!(got, vec!["hello"; 3]);
            assert!(missing);
        }
    }

    #[test]
    fn test_foreign_session_is_ignored() {
        let mut rbcs = setup(4, 1);
        rbcs[1].set_id("another session");
        let mut sender = rbcs.remove(1);
        sender.broadcast(encode(&7u8));
        let mut receiver = rbcs.remove(0);
        let result = smol::block_on(
            receiver.deliver_from(1u32.into(), Instant::now() + Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    }
}
