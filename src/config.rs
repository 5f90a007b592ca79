//! Settings of a revocation run.
//!
//! A [`RevokeConfig`] starts from defaults, takes the values of an optional
//! TOML file, and finally the command line. It is validated before anything
//! touches the network.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::openpgp::{hex, Subkey};
use crate::participants::{PeerList, PeerListError};
use crate::protocol::Participant;
use crate::transport::ChannelKeys;

pub const DEFAULT_PORT_BASE: u16 = 55000;
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Peers(#[from] PeerListError),
    #[error("passwords are required when connecting over TCP")]
    MissingPasswords,
    #[error("{got} passwords given for {n} peers")]
    PasswordCount { got: usize, n: usize },
    #[error("bad subkey selection \"{0}\": expected none, first, all, an index, or a fingerprint")]
    BadSubkeySelection(String),
    #[error("subkey {0} does not exist")]
    NoSuchSubkey(String),
    #[error("timeout must be positive")]
    ZeroTimeout,
    #[error("port base {0} leaves no room for every peer")]
    PortRange(u16),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which subkeys get a revocation besides the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SubkeySelection {
    None,
    First,
    All,
    Index(usize),
    Fingerprint(String),
}

impl Default for SubkeySelection {
    fn default() -> Self {
        Self::First
    }
}

impl FromStr for SubkeySelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => return Ok(Self::None),
            "first" => return Ok(Self::First),
            "all" => return Ok(Self::All),
            _ => {}
        }
        if let Ok(i) = s.parse::<usize>() {
            return Ok(Self::Index(i));
        }
        let fpr: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if fpr.len() == 40 && fpr.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self::Fingerprint(fpr.to_ascii_uppercase()));
        }
        Err(ConfigError::BadSubkeySelection(s.to_string()))
    }
}

impl TryFrom<String> for SubkeySelection {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl SubkeySelection {
    /// The positions of the selected subkeys.
    ///
    /// Asking for the first subkey of a key without subkeys selects nothing;
    /// asking for a specific one that does not exist is an error.
    pub fn select(&self, subkeys: &[Subkey]) -> Result<Vec<usize>, ConfigError> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::First => Ok((0..subkeys.len().min(1)).collect()),
            Self::All => Ok((0..subkeys.len()).collect()),
            Self::Index(i) if *i < subkeys.len() => Ok(vec![*i]),
            Self::Index(i) => Err(ConfigError::NoSuchSubkey(i.to_string())),
            Self::Fingerprint(fpr) => subkeys
                .iter()
                .position(|subkey| hex(&subkey.key.fingerprint()) == *fpr)
                .map(|i| vec![i])
                .ok_or_else(|| ConfigError::NoSuchSubkey(fpr.clone())),
        }
    }
}

/// How the participants reach each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Every participant runs as a thread of this process.
    Local,
    /// This process is the participant `hostname`, the others are reached
    /// over TCP at `port_base + index`.
    Tcp { hostname: String, port_base: u16 },
}

#[derive(Clone)]
pub struct RevokeConfig {
    pub peers: Vec<String>,
    pub hostname: Option<String>,
    pub port_base: u16,
    /// One password per peer, in canonical order, separated by slashes.
    pub passwords: Option<Zeroizing<String>>,
    pub timeout: Duration,
    pub exchange_tests: usize,
    pub reason_code: u32,
    pub reason: String,
    pub subkeys: SubkeySelection,
    pub key_dir: PathBuf,
    /// The environment variable holding the key passphrase.
    pub passphrase_env: Option<String>,
}

impl Default for RevokeConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            hostname: None,
            port_base: DEFAULT_PORT_BASE,
            passwords: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
            exchange_tests: 0,
            reason_code: 0,
            reason: String::new(),
            subkeys: SubkeySelection::First,
            key_dir: PathBuf::from("."),
            passphrase_env: None,
        }
    }
}

impl RevokeConfig {
    pub fn transport(&self) -> TransportConfig {
        match &self.hostname {
            Some(hostname) => TransportConfig::Tcp {
                hostname: hostname.clone(),
                port_base: self.port_base,
            },
            None => TransportConfig::Local,
        }
    }

    fn password_list(&self) -> Option<Vec<&str>> {
        self.passwords
            .as_ref()
            .map(|pw| pw.split('/').collect::<Vec<_>>())
    }

    /// Check the settings and return the canonical peer list.
    pub fn validate(&self) -> Result<PeerList, ConfigError> {
        let peers = PeerList::canonicalize(self.peers.iter().cloned())?;
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if let Some(hostname) = &self.hostname {
            peers.index_of(hostname)?;
            let passwords = self.password_list().ok_or(ConfigError::MissingPasswords)?;
            if passwords.len() != peers.len() {
                return Err(ConfigError::PasswordCount {
                    got: passwords.len(),
                    n: peers.len(),
                });
            }
            if usize::from(self.port_base) + peers.len() > usize::from(u16::MAX) {
                return Err(ConfigError::PortRange(self.port_base));
            }
        }
        Ok(peers)
    }

    /// The keys for the channels of participant `me`.
    pub fn channel_keys(&self, tool: &str, peers: &PeerList, me: Participant) -> Result<ChannelKeys, ConfigError> {
        match self.password_list() {
            Some(passwords) if self.hostname.is_some() => {
                if passwords.len() != peers.len() {
                    return Err(ConfigError::PasswordCount {
                        got: passwords.len(),
                        n: peers.len(),
                    });
                }
                Ok(ChannelKeys::new(
                    passwords
                        .into_iter()
                        .map(|pw| Zeroizing::new(pw.as_bytes().to_vec()))
                        .collect(),
                ))
            }
            _ => Ok(ChannelKeys::labels(tool, me, peers.len())),
        }
    }

    /// The time unit of draining, a tenth of the message timeout.
    pub fn sync_unit(&self) -> Duration {
        self.timeout / 10
    }
}

/// The settings a configuration file may contain.
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub peers: Option<Vec<String>>,
    pub hostname: Option<String>,
    pub port_base: Option<u16>,
    pub passwords: Option<String>,
    pub timeout_minutes: Option<u64>,
    pub exchange_tests: Option<usize>,
    pub reason_code: Option<u32>,
    pub reason: Option<String>,
    pub subkeys: Option<SubkeySelection>,
    pub key_dir: Option<PathBuf>,
    pub passphrase_env: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overwrite the settings present in this file.
    pub fn apply(self, config: &mut RevokeConfig) {
        if let Some(peers) = self.peers {
            config.peers = peers;
        }
        if let Some(hostname) = self.hostname {
            config.hostname = Some(hostname);
        }
        if let Some(port_base) = self.port_base {
            config.port_base = port_base;
        }
        if let Some(passwords) = self.passwords {
            config.passwords = Some(Zeroizing::new(passwords));
        }
        if let Some(minutes) = self.timeout_minutes {
            config.timeout = Duration::from_secs(minutes * 60);
        }
        if let Some(n) = self.exchange_tests {
            config.exchange_tests = n;
        }
        if let Some(code) = self.reason_code {
            config.reason_code = code;
        }
        if let Some(reason) = self.reason {
            config.reason = reason;
        }
        if let Some(subkeys) = self.subkeys {
            config.subkeys = subkeys;
        }
        if let Some(dir) = self.key_dir {
            config.key_dir = dir;
        }
        if let Some(var) = self.passphrase_env {
            config.passphrase_env = Some(var);
        }
    }
}
