//! Daemon configuration: a `toml` file, an optional `TOTEM_DATA_DIR`
//! environment override, and defaults for everything else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use totem_crypto::{CipherKind, HashKind};
use totem_types::NodeId;

/// Complete daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            transport: TransportConfig::default(),
            crypto: CryptoConfig::default(),
            timers: TimersConfig::default(),
            protocol: ProtocolConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { id: default_node_id() }
    }
}

fn default_node_id() -> u32 {
    1
}

/// Bind address/interface and the multicast-vs-fanout transport choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Local interface address to bind.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// UDP port shared by every ring member.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Multicast group address. When absent, `fanout_peers` is used
    /// instead (unicast fanout transport).
    #[serde(default)]
    pub mcast_addr: Option<String>,
    /// Peer addresses for the unicast fanout transport.
    #[serde(default)]
    pub fanout_peers: Vec<String>,
    /// The cluster's static nodelist: every member's id and address, used
    /// to resolve the ring successor to a destination (multicast's token
    /// unicast) and to build the full peer list (the fanout backend).
    #[serde(default)]
    pub members: Vec<MemberAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            mcast_addr: None,
            fanout_peers: Vec::new(),
            members: Vec::new(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5405
}

/// One cluster member's node id and address, as configured in the
/// nodelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberAddr {
    pub id: u32,
    /// Either `host:port` or a bare host, in which case `transport.port`
    /// is appended.
    pub addr: String,
}

impl TransportConfig {
    /// Resolve every configured member to a socket address, keyed by node
    /// id, so the event loop can look up the ring successor's destination
    /// without re-parsing strings on every membership change.
    pub fn address_book(&self) -> anyhow::Result<HashMap<NodeId, SocketAddr>> {
        let mut book = HashMap::with_capacity(self.members.len());
        for member in &self.members {
            let addr = self.resolve_member_addr(&member.addr)?;
            book.insert(NodeId::new(member.id), addr);
        }
        Ok(book)
    }

    fn resolve_member_addr(&self, raw: &str) -> anyhow::Result<SocketAddr> {
        let candidate = if raw.contains(':') { raw.to_string() } else { format!("{raw}:{}", self.port) };
        candidate.parse::<SocketAddr>().map_err(|e| anyhow::anyhow!("invalid member address {raw:?}: {e}"))
    }
}

/// Crypto cipher/hash selection and the path to the shared private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default = "default_hash")]
    pub hash: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { cipher: default_cipher(), hash: default_hash(), key_file: default_key_file() }
    }
}

fn default_cipher() -> String {
    "aes256".to_string()
}

fn default_hash() -> String {
    "sha256".to_string()
}

fn default_key_file() -> String {
    String::new()
}

impl CryptoConfig {
    pub fn cipher_kind(&self) -> anyhow::Result<CipherKind> {
        match self.cipher.as_str() {
            "none" => Ok(CipherKind::None),
            "aes256" => Ok(CipherKind::Aes256Cbc),
            "aes192" => Ok(CipherKind::Aes192Cbc),
            "aes128" => Ok(CipherKind::Aes128Cbc),
            "3des" => Ok(CipherKind::TripleDesCbc),
            other => anyhow::bail!("unknown cipher {other:?} in config"),
        }
    }

    pub fn hash_kind(&self) -> anyhow::Result<HashKind> {
        match self.hash.as_str() {
            "none" => Ok(HashKind::None),
            "md5" => Ok(HashKind::Md5Hmac),
            "sha1" => Ok(HashKind::Sha1Hmac),
            "sha256" => Ok(HashKind::Sha256Hmac),
            "sha384" => Ok(HashKind::Sha384Hmac),
            "sha512" => Ok(HashKind::Sha512Hmac),
            other => anyhow::bail!("unknown hash {other:?} in config"),
        }
    }
}

/// The five timer constants that drive the event loop, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersConfig {
    #[serde(default = "default_token_timeout_ms")]
    pub token_timeout_ms: u64,
    #[serde(default = "default_merge_detect_period_ms")]
    pub merge_detect_period_ms: u64,
    #[serde(default = "default_downcheck_interval_ms")]
    pub downcheck_interval_ms: u64,
    #[serde(default = "default_join_broadcast_period_ms")]
    pub join_broadcast_period_ms: u64,
    #[serde(default = "default_commit_token_timeout_ms")]
    pub commit_token_timeout_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            token_timeout_ms: default_token_timeout_ms(),
            merge_detect_period_ms: default_merge_detect_period_ms(),
            downcheck_interval_ms: default_downcheck_interval_ms(),
            join_broadcast_period_ms: default_join_broadcast_period_ms(),
            commit_token_timeout_ms: default_commit_token_timeout_ms(),
        }
    }
}

fn default_token_timeout_ms() -> u64 {
    1000
}

fn default_merge_detect_period_ms() -> u64 {
    200
}

fn default_downcheck_interval_ms() -> u64 {
    1000
}

fn default_join_broadcast_period_ms() -> u64 {
    100
}

fn default_commit_token_timeout_ms() -> u64 {
    1000
}

/// Flow-control window and frame-size ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_window")]
    pub window: u32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_crypto_reject_threshold")]
    pub crypto_reject_threshold: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_frame_size: default_max_frame_size(),
            crypto_reject_threshold: default_crypto_reject_threshold(),
        }
    }
}

fn default_window() -> u32 {
    50
}

fn default_max_frame_size() -> usize {
    totem_crypto::MAX_FRAME_SIZE
}

fn default_crypto_reject_threshold() -> u32 {
    10
}

/// Client IPC socket placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Empty = `$data_dir/totem-cpg.sock`.
    #[serde(default)]
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self { socket_path: String::new() }
    }
}

impl DaemonConfig {
    /// Load configuration from an explicit path, or the default location
    /// if `None`. Falls back to defaults if the file does not exist; an
    /// existing-but-unreadable or unparsable file is a fatal startup
    /// error.
    pub fn load(explicit_path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let config_path = match explicit_path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| anyhow::anyhow!("reading config {config_path:?}: {e}"))?;
            let config: DaemonConfig = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("parsing config {config_path:?}: {e}"))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("TOTEM_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".totem"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/totem"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::data_dir().join("totem.toml")
    }

    pub fn ipc_socket_path(&self) -> PathBuf {
        if self.ipc.socket_path.is_empty() {
            Self::data_dir().join("totem-cpg.sock")
        } else {
            PathBuf::from(&self.ipc.socket_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = DaemonConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.transport.port, config.transport.port);
    }

    #[test]
    fn cipher_and_hash_names_resolve_to_the_expected_kinds() {
        let crypto = CryptoConfig { cipher: "aes128".into(), hash: "sha1".into(), key_file: String::new() };
        assert_eq!(crypto.cipher_kind().expect("cipher"), CipherKind::Aes128Cbc);
        assert_eq!(crypto.hash_kind().expect("hash"), HashKind::Sha1Hmac);
    }

    #[test]
    fn unknown_cipher_name_is_rejected() {
        let crypto = CryptoConfig { cipher: "rot13".into(), hash: "sha256".into(), key_file: String::new() };
        assert!(crypto.cipher_kind().is_err());
    }
}
