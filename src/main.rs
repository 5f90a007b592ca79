use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use k256::Secp256k1;
use p256::NistP256;
use rand_core::OsRng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use threshold_revoke::agreement::local_time;
use threshold_revoke::config::{ConfigFile, RevokeConfig, SubkeySelection, TransportConfig};
use threshold_revoke::dealer::{deal_keys, write_dealt_keys, DealError, DealtKey};
use threshold_revoke::error::{RevokeError, SetupFailure};
use threshold_revoke::local;
use threshold_revoke::memlock::lock_memory;
use threshold_revoke::openpgp::{hex, revocations, Cert};
use threshold_revoke::orchestrator::{self, PROTOCOL_VERSION, TOOL};
use threshold_revoke::participants::{session_digest, PeerList};
use threshold_revoke::transport::tcp::TcpTransport;
use threshold_revoke::CurveKind;

#[derive(Parser)]
#[command(name = "threshold-revoke", version, disable_version_flag = true)]
#[command(about = "Revoke a threshold OpenPGP key together with its other share holders")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print the version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,

    /// More logging, repeat for even more (RUST_LOG overrides this)
    #[arg(short = 'V', long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Revoke the key, together with the other peers
    Revoke(RevokeArgs),
    /// Create a threshold key and a key file for every peer
    Deal(DealArgs),
    /// Check the revocations attached to a key file
    Verify {
        /// The armored key file
        file: PathBuf,
    },
}

#[derive(Args)]
struct RevokeArgs {
    /// The peers sharing the key, in any order; replaces those of the config file
    peers: Vec<String>,

    /// Read settings from this TOML file, overridden by the options given here
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as this peer over TCP; without it every peer runs locally
    #[arg(short = 'H', long)]
    hostname: Option<String>,

    /// The port of the first peer, the others follow
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// The channel passwords, one per peer in sorted order, separated by '/'
    #[arg(short = 'P', long)]
    passwords: Option<String>,

    /// How long to wait for any message, in minutes
    #[arg(short = 'W', long)]
    timeout: Option<u64>,

    /// Broadcast rounds to run before agreeing on anything
    #[arg(short = 'x', long)]
    exchange_tests: Option<usize>,

    /// The reason code put into the revocations
    #[arg(short = 'r', long)]
    reason_code: Option<u32>,

    /// The human readable reason put into the revocations
    #[arg(short = 'R', long)]
    reason: Option<String>,

    /// Subkeys to revoke: none, first, all, a position, or a fingerprint
    #[arg(short = 's', long)]
    subkeys: Option<SubkeySelection>,

    /// The directory holding the key files
    #[arg(short = 'd', long)]
    key_dir: Option<PathBuf>,

    /// Environment variable holding the key passphrase
    #[arg(long)]
    passphrase_env: Option<String>,
}

#[derive(Args)]
struct DealArgs {
    /// The peers to create key files for
    #[arg(required = true)]
    peers: Vec<String>,

    /// The degree of the sharing; signing needs 2t + 1 peers
    #[arg(short = 't', long)]
    threshold: usize,

    /// p256 or secp256k1
    #[arg(short = 'c', long, default_value = "p256", value_parser = parse_curve)]
    curve: CurveKind,

    /// The user id of the new key
    #[arg(short = 'u', long)]
    user_id: String,

    /// Where to write the key files
    #[arg(short = 'd', long, default_value = ".")]
    key_dir: PathBuf,

    /// Environment variable holding the passphrase protecting the shares
    #[arg(long)]
    passphrase_env: Option<String>,
}

fn parse_curve(s: &str) -> Result<CurveKind, String> {
    CurveKind::from_name(s).ok_or_else(|| format!("unknown curve {s}"))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: RevokeArgs) -> Result<RevokeConfig, RevokeError> {
    let mut config = RevokeConfig::default();
    if let Some(path) = &args.config {
        ConfigFile::load(path).map_err(usage)?.apply(&mut config);
    }
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }
    if let Some(hostname) = args.hostname {
        config.hostname = Some(hostname);
    }
    if let Some(port) = args.port {
        config.port_base = port;
    }
    if let Some(passwords) = args.passwords {
        config.passwords = Some(passwords.into());
    }
    if let Some(minutes) = args.timeout {
        config.timeout = Duration::from_secs(minutes * 60);
    }
    if let Some(rounds) = args.exchange_tests {
        config.exchange_tests = rounds;
    }
    if let Some(code) = args.reason_code {
        config.reason_code = code;
    }
    if let Some(reason) = args.reason {
        config.reason = reason;
    }
    if let Some(subkeys) = args.subkeys {
        config.subkeys = subkeys;
    }
    if let Some(dir) = args.key_dir {
        config.key_dir = dir;
    }
    if let Some(var) = args.passphrase_env {
        config.passphrase_env = Some(var);
    }
    Ok(config)
}

fn usage(e: impl ToString) -> RevokeError {
    RevokeError::SetupFailed {
        kind: SetupFailure::Usage,
        reason: e.to_string(),
    }
}

/// Run the revocation, returning the public key to print.
fn revoke(args: RevokeArgs) -> Result<String, RevokeError> {
    let config = build_config(args)?;
    let peers = config.validate().map_err(usage)?;
    lock_memory();
    match config.transport() {
        TransportConfig::Local => run_local(&config, &peers),
        TransportConfig::Tcp {
            hostname,
            port_base,
        } => {
            let me = peers.index_of(&hostname).map_err(usage)?;
            let session = session_digest(&peers.protocol_id(TOOL, PROTOCOL_VERSION));
            smol::block_on(async {
                let mut transport =
                    TcpTransport::bind(&peers, me, port_base, session, config.timeout)
                        .await
                        .map_err(|e| RevokeError::SetupFailed {
                            kind: SetupFailure::Channels,
                            reason: e.to_string(),
                        })?;
                orchestrator::revoke(&config, &peers, me, &mut transport).await
            })
            .map(|output| output.public_armor)
        }
    }
}

fn run_local(config: &RevokeConfig, peers: &PeerList) -> Result<String, RevokeError> {
    let mut public_armor = None;
    let mut failure = None;
    for outcome in local::revoke_all(config, peers) {
        match outcome.result {
            Ok(output) => {
                info!(peer = %outcome.peer, "revocation finished");
                public_armor.get_or_insert(output.public_armor);
            }
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    match (failure, public_armor) {
        (Some(e), _) => Err(e),
        (None, Some(armor)) => Ok(armor),
        (None, None) => Err(usage("no participants ran")),
    }
}

fn deal(args: DealArgs) -> Result<Vec<PathBuf>, DealError> {
    lock_memory();
    let peers = PeerList::canonicalize(args.peers.iter().cloned())
        .map_err(|e| DealError::Peers(e.to_string()))?;
    let passphrase = threshold_revoke::lifecycle::initial_passphrase(args.passphrase_env.as_deref());
    let created = u32::try_from(local_time()).unwrap_or(u32::MAX);
    let keys: Vec<DealtKey> = match args.curve {
        CurveKind::NistP256 => deal_keys::<NistP256>(
            &mut OsRng,
            &peers,
            args.threshold,
            &args.user_id,
            &passphrase,
            created,
        )?,
        CurveKind::Secp256k1 => deal_keys::<Secp256k1>(
            &mut OsRng,
            &peers,
            args.threshold,
            &args.user_id,
            &passphrase,
            created,
        )?,
    };
    write_dealt_keys(&args.key_dir, &keys).map_err(DealError::Write)
}

/// Print the revocations of a key file, failing unless all of them verify.
fn verify(file: PathBuf) -> ExitCode {
    let cert = match std::fs::read_to_string(&file)
        .map_err(|e| e.to_string())
        .and_then(|text| Cert::from_armor(&text).map_err(|e| e.to_string()))
    {
        Ok((_, cert)) => cert,
        Err(e) => {
            error!("reading {}: {e}", file.display());
            return ExitCode::from(254);
        }
    };
    let statuses = revocations(&cert);
    if statuses.is_empty() {
        println!("{}: no revocations", hex(&cert.fingerprint()));
        return ExitCode::from(254);
    }
    let mut all_valid = true;
    for status in &statuses {
        let what = if status.subkey { "subkey" } else { "key" };
        let reason = match &status.reason {
            Some((code, text)) if text.is_empty() => code.describe().to_string(),
            Some((code, text)) => format!("{}: {text}", code.describe()),
            None => "no reason given".to_string(),
        };
        let verdict = if status.valid { "good" } else { "BAD" };
        println!(
            "{what} {} revoked at {} ({reason}): {verdict}",
            hex(&status.fingerprint),
            status.created.unwrap_or(0),
        );
        all_valid &= status.valid;
    }
    if all_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(254)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::Revoke(args) => match revoke(args) {
            Ok(public_armor) => {
                print!("{public_armor}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e}");
                ExitCode::from(e.exit_code())
            }
        },
        Command::Deal(args) => match deal(args) {
            Ok(written) => {
                for path in written {
                    println!("{}", path.display());
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{e}");
                ExitCode::from(255)
            }
        },
        Command::Verify { file } => verify(file),
    }
}
