//! Threshold revocation of OpenPGP keys.
//!
//! The private key of an ECDSA OpenPGP key is split among `n` peers using
//! Shamir secret sharing of degree `t`, with `n >= 2t + 1`. Each peer holds a
//! private key file with the public key material of the whole key and its own
//! share. To revoke the key, the peers run an interactive protocol together,
//! and each of them ends up with the same revocation signatures attached to
//! its copy of the key.
//!
//! # Design
//!
//! A run of one participant goes through these layers:
//!
//! - The [participants] are identified by their canonical index in the
//!   sorted peer list, the same on every host.
//! - The [transport] opens two channel sets to the other peers, one for
//!   private messages and one for the broadcast.
//! - On top of the broadcast channels sits the [reliable broadcast](rbc),
//!   Bracha's protocol: every correct peer delivers the same value for each
//!   broadcast, or none at all.
//! - Through the broadcast the peers [agree](agreement) on the creation
//!   time of the signatures.
//! - The [signing protocol](sign) produces one ECDSA signature from the
//!   shares, checking it before anyone uses it.
//! - The [orchestrator] strings all of this together: one signature for the
//!   primary key, one for each selected subkey, then the key files are
//!   rewritten.
//!
//! The OpenPGP side, parsing and writing keys and building signatures,
//! lives in [openpgp].
//!
//! # Running locally
//!
//! Without a hostname, every peer runs as a thread of one process, see
//! [local]. This is useful for testing, and for keys whose shares all live
//! on one machine.
//!
//! # Shortcomings
//!
//! - The protocol does not identify which peer misbehaved; a bad share
//!   makes the run fail for everyone.
//! - Agreement on the time is gentle: a faulty peer can make some correct
//!   peers fail while others finish.
pub mod agreement;
pub mod compat;
pub mod config;
pub mod dealer;
pub mod error;
pub mod files;
pub mod keyshare;
pub mod lifecycle;
pub mod local;
mod math;
pub mod memlock;
pub mod openpgp;
pub mod orchestrator;
pub mod participants;
pub mod passphrase;
pub mod protocol;
pub mod rbc;
mod serde;
pub mod sign;
pub mod transport;

pub use compat::{CurveKind, PgpCurve};
pub use config::RevokeConfig;
pub use error::RevokeError;
pub use orchestrator::{revoke, RevocationOutput};
pub use sign::FullSignature;
