//! Running every participant inside this process.
//!
//! Each participant gets its own thread and its own executor, and talks to
//! the others over in-process pipes. Apart from the transport this is the
//! same code path as a distributed run.
use std::thread;

use tracing::{debug, info_span};

use crate::config::RevokeConfig;
use crate::error::RevokeError;
use crate::orchestrator::{self, RevocationOutput};
use crate::participants::PeerList;
use crate::transport::pipe::{self, PipeTransport};

/// The outcome for one participant of a local run.
pub struct LocalOutcome {
    pub peer: String,
    pub result: Result<RevocationOutput, RevokeError>,
}

/// Run the participants owning `transports`, one thread each, until all of
/// them finish.
///
/// Leaving a participant's transport out of `transports` makes it look
/// crashed to the others.
pub fn revoke_with(
    config: &RevokeConfig,
    peers: &PeerList,
    transports: Vec<PipeTransport>,
) -> Vec<LocalOutcome> {
    thread::scope(|scope| {
        let handles: Vec<_> = transports
            .into_iter()
            .map(|mut transport| {
                let me = transport.me();
                let peer = peers.name(me).to_string();
                let handle = scope.spawn(move || {
                    let _span = info_span!("participant", peer = %peers.name(me)).entered();
                    smol::block_on(orchestrator::revoke(config, peers, me, &mut transport))
                });
                (peer, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(peer, handle)| {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(RevokeError::SigningFailed(format!(
                        "participant {peer} panicked"
                    )))
                });
                debug!(%peer, ok = result.is_ok(), "participant finished");
                LocalOutcome { peer, result }
            })
            .collect()
    })
}

/// Revoke the key of every peer, all of them running in this process.
pub fn revoke_all(config: &RevokeConfig, peers: &PeerList) -> Vec<LocalOutcome> {
    revoke_with(config, peers, pipe::network(peers.len()))
}
