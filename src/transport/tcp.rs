//! Channels over TCP, for participants on different hosts.
//!
//! Participant `i` listens on `port_base + i`. For every pair, the
//! participant with the lower index dials the one with the higher index, so
//! exactly one connection exists per pair and kind. A connection starts with
//! a plain introduction (channel kind and claimed index) followed by a sealed
//! hello in each direction; only a peer knowing the channel password can
//! produce a hello that opens.
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use smol::channel::{unbounded, Sender};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::net::{TcpListener, TcpStream};
use smol::{Task, Timer};
use tracing::{debug, info, warn};

use crate::participants::PeerList;
use crate::protocol::Participant;

use super::frame::{read_frame, write_frame, Opener, Sealer};
use super::{ChannelHandle, ChannelKeys, ChannelKind, ChannelSet, Envelope, Transport, TransportError};

const HELLO: &[u8] = b"threshold-revoke hello";
const INTRO_LEN: usize = 5;
const RETRY_DELAY: Duration = Duration::from_millis(250);

struct Connection {
    stream: TcpStream,
    sealer: Sealer,
    opener: Opener,
}

async fn with_deadline<T>(
    fut: impl Future<Output = std::io::Result<T>>,
    deadline: Instant,
    what: &str,
) -> Result<T, TransportError> {
    smol::future::or(async { Some(fut.await) }, async {
        Timer::at(deadline).await;
        None
    })
    .await
    .ok_or_else(|| TransportError::Timeout(what.to_string()))?
    .map_err(TransportError::from)
}

fn port_for(port_base: u16, p: Participant) -> Result<u16, TransportError> {
    u16::try_from(p.index())
        .ok()
        .and_then(|i| port_base.checked_add(i))
        .ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no port for {p} above base {port_base}"),
            ))
        })
}

/// One participant's end of a TCP network.
pub struct TcpTransport {
    me: Participant,
    hosts: Vec<String>,
    port_base: u16,
    session: [u8; 32],
    listener: TcpListener,
    connect_timeout: Duration,
    parked: HashMap<(ChannelKind, Participant), TcpStream>,
}

impl TcpTransport {
    /// Start listening for the lower indexed peers.
    ///
    /// The peer identities double as the host names to dial.
    pub async fn bind(
        peers: &PeerList,
        me: Participant,
        port_base: u16,
        session: [u8; 32],
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = port_for(port_base, me)?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(participant = %me, port, "listening for peers");
        Ok(Self {
            me,
            hosts: peers.as_slice().to_vec(),
            port_base,
            session,
            listener,
            connect_timeout,
            parked: HashMap::new(),
        })
    }

    fn hello(&self) -> Vec<u8> {
        let mut out = HELLO.to_vec();
        out.extend_from_slice(&self.session);
        out
    }

    async fn dial(
        &self,
        peer: Participant,
        kind: ChannelKind,
        key: &[u8],
        deadline: Instant,
    ) -> Result<Connection, TransportError> {
        let host = self.hosts[peer.index()].as_str();
        let port = port_for(self.port_base, peer)?;
        let mut stream = loop {
            match with_deadline(TcpStream::connect((host, port)), deadline, "dialing").await {
                Ok(s) => break s,
                Err(TransportError::Timeout(what)) => return Err(TransportError::Timeout(what)),
                Err(e) => {
                    if Instant::now() + RETRY_DELAY >= deadline {
                        return Err(e);
                    }
                    debug!(participant = %self.me, %peer, "connect failed, retrying: {e}");
                    Timer::after(RETRY_DELAY).await;
                }
            }
        };
        let mut intro = [0u8; INTRO_LEN];
        intro[0] = kind.tag();
        intro[1..].copy_from_slice(&self.me.bytes());
        with_deadline(stream.write_all(&intro), deadline, "sending introduction").await?;

        let mut sealer = Sealer::new(key, &self.session, kind, self.me, peer)?;
        let mut opener = Opener::new(key, &self.session, kind, self.me, peer)?;
        let hello = sealer.seal(&self.hello())?;
        with_deadline(write_frame(&mut stream, &hello), deadline, "sending hello").await?;
        let reply = with_deadline(read_frame(&mut stream), deadline, "waiting for hello").await?;
        if opener.open(&reply).as_deref() != Some(self.hello().as_slice()) {
            return Err(TransportError::Handshake {
                peer: host.to_string(),
                reason: "hello did not authenticate".to_string(),
            });
        }
        Ok(Connection {
            stream,
            sealer,
            opener,
        })
    }

    async fn accept(
        &mut self,
        peer: Participant,
        kind: ChannelKind,
        key: &[u8],
        deadline: Instant,
    ) -> Result<Connection, TransportError> {
        let mut stream = loop {
            if let Some(s) = self.parked.remove(&(kind, peer)) {
                break s;
            }
            let (mut s, addr) = with_deadline(self.listener.accept(), deadline, "accepting").await?;
            let mut intro = [0u8; INTRO_LEN];
            if let Err(e) = with_deadline(s.read_exact(&mut intro), deadline, "introduction").await {
                debug!(participant = %self.me, %addr, "dropping connection: {e}");
                continue;
            }
            let from = Participant::from(u32::from_le_bytes([intro[1], intro[2], intro[3], intro[4]]));
            match ChannelKind::from_tag(intro[0]) {
                Some(k) if from < self.me => {
                    self.parked.insert((k, from), s);
                }
                _ => warn!(participant = %self.me, %addr, "dropping connection with a bad introduction"),
            }
        };

        let mut sealer = Sealer::new(key, &self.session, kind, self.me, peer)?;
        let mut opener = Opener::new(key, &self.session, kind, self.me, peer)?;
        let hello = with_deadline(read_frame(&mut stream), deadline, "waiting for hello").await?;
        if opener.open(&hello).as_deref() != Some(self.hello().as_slice()) {
            return Err(TransportError::Handshake {
                peer: self.hosts[peer.index()].clone(),
                reason: "hello did not authenticate".to_string(),
            });
        }
        let reply = sealer.seal(&self.hello())?;
        with_deadline(write_frame(&mut stream, &reply), deadline, "sending hello").await?;
        Ok(Connection {
            stream,
            sealer,
            opener,
        })
    }
}

/// Move a connection into a reader and a writer task.
///
/// Returns the sender feeding the writer, and both tasks; dropping the tasks
/// cancels them, which closes the connection.
fn spawn_pumps(
    me: Participant,
    peer: Participant,
    connection: Connection,
    inbox: Sender<Envelope>,
) -> (Sender<Envelope>, Vec<Task<()>>) {
    let Connection {
        stream,
        mut sealer,
        mut opener,
    } = connection;
    let mut reader = stream.clone();
    let mut writer = stream;
    let (tx, rx) = unbounded::<Envelope>();

    let read_task = smol::spawn(async move {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(participant = %me, %peer, "connection closed: {e}");
                    break;
                }
            };
            match opener.open(&frame) {
                Some(data) => {
                    if inbox.send((peer, data)).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(participant = %me, %peer, "frame failed to open, closing connection");
                    break;
                }
            }
        }
    });
    let write_task = smol::spawn(async move {
        while let Ok((_, data)) = rx.recv().await {
            let sealed = match sealer.seal(&data) {
                Ok(sealed) => sealed,
                Err(_) => break,
            };
            if let Err(e) = write_frame(&mut writer, &sealed).await {
                debug!(participant = %me, %peer, "write failed: {e}");
                break;
            }
        }
    });
    (tx, vec![read_task, write_task])
}

impl Transport for TcpTransport {
    async fn open(
        &mut self,
        kind: ChannelKind,
        keys: &ChannelKeys,
    ) -> Result<ChannelSet, TransportError> {
        let deadline = Instant::now() + self.connect_timeout;
        let (inbox_tx, inbox) = unbounded();
        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        let n = self.hosts.len() as u32;

        // Accept the lower peers before dialing the higher ones. A dial only
        // completes once the dialed peer reaches its accepts, and peer 0 has
        // nothing to accept, so by induction every dial is answered.
        for j in 0..self.me.index() as u32 {
            let peer = Participant::from(j);
            let connection = self.accept(peer, kind, keys.get(peer)?, deadline).await?;
            debug!(participant = %self.me, %peer, %kind, "accepted");
            let (tx, mut pumps) = spawn_pumps(self.me, peer, connection, inbox_tx.clone());
            handles.push(ChannelHandle::new(self.me, peer, tx));
            tasks.append(&mut pumps);
        }
        for j in (self.me.index() as u32 + 1)..n {
            let peer = Participant::from(j);
            let connection = self.dial(peer, kind, keys.get(peer)?, deadline).await?;
            debug!(participant = %self.me, %peer, %kind, "connected");
            let (tx, mut pumps) = spawn_pumps(self.me, peer, connection, inbox_tx.clone());
            handles.push(ChannelHandle::new(self.me, peer, tx));
            tasks.append(&mut pumps);
        }
        info!(participant = %self.me, %kind, peers = handles.len(), "channels established");
        Ok(ChannelSet::new(self.me, kind, handles, inbox).with_tasks(tasks))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::participants::session_digest;
    use zeroize::Zeroizing;

    fn keys(password: &str, n: usize) -> ChannelKeys {
        ChannelKeys::new(
            (0..n)
                .map(|_| Zeroizing::new(password.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_three_party_loopback() {
        let peers = PeerList::canonicalize(["127.0.0.1", "127.0.0.2", "localhost"]).unwrap();
        let session = session_digest("tcp test");
        let port_base = 20000 + (std::process::id() % 20000) as u16;
        let results = easy_parallel::Parallel::new()
            .each(0..3u32, |i| {
                smol::block_on(async {
                    let me = Participant::from(i);
                    let mut transport =
                        TcpTransport::bind(&peers, me, port_base, session, Duration::from_secs(10))
                            .await?;
                    let chans = transport.open(ChannelKind::Unicast, &keys("pw", 3)).await?;
                    chans.send_many(&vec![i as u8]);
                    let mut got = Vec::new();
                    for _ in 0..2 {
                        let (from, data) = chans
                            .recv(Instant::now() + Duration::from_secs(10))
                            .await
                            .map_err(|e| TransportError::Timeout(e.to_string()))?;
                        assert_eq!(data, vec![u32::from(from) as u8]);
                        got.push(from);
                    }
                    got.sort();
                    // Keep the channels open until every thread is done.
                    Ok::<_, TransportError>((got, chans))
                })
            })
            .run();
        for (i, result) in results.into_iter().enumerate() {
            let (got, _chans) = result.unwrap();
            let expected: Vec<_> = (0..3u32)
                .filter(|j| *j as usize != i)
                .map(Participant::from)
                .collect();
            assert_eq!(got, expected);
        }
    }
}
