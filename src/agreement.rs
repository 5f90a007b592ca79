//! Values every honest participant must agree on before signing.
//!
//! Signatures made by the threshold primitive only combine if every party
//! hashes exactly the same material, so the signature creation time and the
//! hash algorithm are fixed here first. The time goes through the reliable
//! broadcast; the hash algorithm is a pure function of the public curve.
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::openpgp::HashAlgorithm;
use crate::participants::PeerList;
use crate::protocol::ProtocolError;
use crate::rbc::ReliableBroadcast;
use crate::serde::{decode, encode};

#[derive(Debug, Error)]
pub enum AgreementError {
    #[error("exchange test failed: {0}")]
    ExchangeTest(ProtocolError),
    #[error("time agreement failed: {0}")]
    Time(ProtocolError),
    #[error("only {got} of the {needed} required time proposals were delivered")]
    NotEnoughProposals { got: usize, needed: usize },
    #[error("agreed time {0} does not fit an OpenPGP timestamp")]
    TimeOutOfRange(u64),
    #[error("no admissible hash algorithm for a {bits} bit group order")]
    NoAdmissibleHashAlgorithm { bits: usize },
}

/// The protocol-wide values fixed before any signature is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreedParameters {
    pub common_time: u32,
    pub hash: HashAlgorithm,
}

/// Run a few broadcast rounds without payload, checking every peer answers.
///
/// Every party broadcasts the round number, and must deliver that same
/// number from everybody else.
pub async fn exchange_test(
    rbc: &mut ReliableBroadcast,
    peers: &PeerList,
    rounds: usize,
) -> Result<(), AgreementError> {
    let me = rbc.me();
    for round in 0..rounds as u64 {
        rbc.broadcast(encode(&round));
        for j in peers.others(me) {
            let data = rbc
                .deliver_from(j, rbc.deadline())
                .await
                .map_err(AgreementError::ExchangeTest)?;
            let theirs: u64 = decode(&data).map_err(|e| {
                AgreementError::ExchangeTest(ProtocolError::Malformed {
                    from: j,
                    reason: e.to_string(),
                })
            })?;
            if theirs != round {
                return Err(AgreementError::ExchangeTest(ProtocolError::AssertionFailed(
                    format!("{j} answered round {theirs} in round {round}"),
                )));
            }
            debug!(participant = %me, peer = %j, round, "exchange test answered");
        }
    }
    if rounds > 0 {
        info!(participant = %me, rounds, "exchange test passed");
    }
    Ok(())
}

fn median(mut times: Vec<u64>) -> u64 {
    times.sort_unstable();
    times[times.len() / 2]
}

/// Agree on the creation time of every signature made in this run.
///
/// Each party proposes its local clock; the result is the median of the
/// proposals delivered, which needs at least `n - t` of them.
pub async fn agree_time(
    rbc: &mut ReliableBroadcast,
    peers: &PeerList,
    proposal: u64,
) -> Result<u32, AgreementError> {
    let me = rbc.me();
    rbc.broadcast(encode(&proposal));
    let mut times = vec![proposal];
    for j in peers.others(me) {
        match rbc.deliver_from(j, rbc.deadline()).await {
            Ok(data) => match decode::<u64>(&data) {
                Ok(time) => {
                    debug!(participant = %me, peer = %j, time, "time proposal delivered");
                    times.push(time);
                }
                Err(e) => warn!(participant = %me, peer = %j, "malformed time proposal: {e}"),
            },
            Err(e) if e.is_liveness_fault() => {
                warn!(participant = %me, peer = %j, "no time proposal: {e}");
            }
            Err(e) => return Err(AgreementError::Time(e)),
        }
    }
    let needed = peers.len() - peers.resilience();
    if times.len() < needed {
        return Err(AgreementError::NotEnoughProposals {
            got: times.len(),
            needed,
        });
    }
    let common = median(times);
    let common = u32::try_from(common).map_err(|_| AgreementError::TimeOutOfRange(common))?;
    info!(participant = %me, common_time = common, "agreed on signature time");
    Ok(common)
}

/// Pick the digest whose size matches the group order.
pub fn select_hash_algorithm(bits: usize) -> Result<HashAlgorithm, AgreementError> {
    HashAlgorithm::for_order_bits(bits).ok_or(AgreementError::NoAdmissibleHashAlgorithm { bits })
}

/// The local wall clock, in seconds since the epoch.
pub fn local_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::Participant;
    use crate::transport::{pipe, ChannelKeys, ChannelKind, Transport};
    use std::time::Duration;

    fn setup(n: usize) -> (PeerList, Vec<ReliableBroadcast>) {
        let peers = PeerList::canonicalize((0..n).map(|i| format!("peer{i}"))).unwrap();
        let mut transports = pipe::network(n);
        let keys = ChannelKeys::labels("test", Participant::from(0u32), n);
        let rbcs = transports
            .iter_mut()
            .enumerate()
            .map(|(i, transport)| {
                let chans =
                    smol::block_on(transport.open(ChannelKind::Broadcast, &keys)).unwrap();
                let mut rbc = ReliableBroadcast::new(
                    n,
                    peers.resilience(),
                    Participant::from(i as u32),
                    chans,
                    Duration::from_millis(500),
                )
                .unwrap();
                rbc.set_id(&peers.protocol_id("test", "1"));
                rbc
            })
            .collect();
        (peers, rbcs)
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![5, 1, 3]), 3);
        assert_eq!(median(vec![40, 10, 30, 20]), 30);
    }

    #[test]
    fn test_agree_time_is_common_median() {
        let (peers, rbcs) = setup(4);
        let proposals = [1_700_000_010u64, 1_700_000_000, 1_700_000_030, 1_700_000_020];
        let results = easy_parallel::Parallel::new()
            .each(rbcs.into_iter().zip(proposals), |(mut rbc, proposal)| {
                smol::block_on(async {
                    exchange_test(&mut rbc, &peers, 2).await?;
                    let time = agree_time(&mut rbc, &peers, proposal).await?;
                    rbc.sync(Duration::from_millis(20)).await;
                    Ok::<_, AgreementError>(time)
                })
            })
            .run();
        for result in results {
            assert_eq!(result.unwrap(), 1_700_000_020);
        }
    }

    #[test]
    fn test_exchange_test_fails_on_crashed_peer() {
        let (peers, mut rbcs) = setup(3);
        drop(rbcs.pop());
        let results = easy_parallel::Parallel::new()
            .each(rbcs, |mut rbc| smol::block_on(exchange_test(&mut rbc, &peers, 1)))
            .run();
        for result in results {
            assert!(matches!(result, Err(AgreementError::ExchangeTest(_))));
        }
    }

    #[test]
    fn test_hash_algorithm_selection() {
        assert_eq!(select_hash_algorithm(256).unwrap(), HashAlgorithm::Sha256);
        assert_eq!(select_hash_algorithm(384).unwrap(), HashAlgorithm::Sha384);
        assert_eq!(select_hash_algorithm(512).unwrap(), HashAlgorithm::Sha512);
        assert!(matches!(
            select_hash_algorithm(255),
            Err(AgreementError::NoAdmissibleHashAlgorithm { bits: 255 })
        ));
    }
}
