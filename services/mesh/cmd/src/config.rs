//! Configuration handling for the mesh router.
//!
//! Settings come from a YAML file, then `MESH_*` environment variables,
//! then command-line flags, each layer overriding the one before.

use anyhow::{bail, Context, Result};
use mesh_crypto::Keypair;
use mesh_session::{NodeProfile, SessionConfig};
use mesh_wire::{Band, Capability, Role};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Router node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name sent in the identity stage
    pub identity_name: String,
    /// File holding the 32-byte signing seed; generated when missing
    pub key_file: Option<PathBuf>,
    /// Bearers this node provides, most preferred first
    pub capabilities: Vec<String>,
    /// Bearer the TCP discovery links stand in for
    pub discovery_bearer: String,
    /// Role held in other encounters (`uke` or `seme`)
    pub role_hint: String,
    /// Preferred rendezvous band
    pub band: String,
    /// Address accepting discovery links
    pub listen: Option<SocketAddr>,
    /// Peers to dial at startup
    pub connect: Vec<SocketAddr>,
    /// Address rendezvous listeners bind to
    pub rendezvous_ip: IpAddr,
    #[serde(with = "duration_str")]
    pub stage_timeout: Duration,
    #[serde(with = "duration_str")]
    pub ack_timeout: Duration,
    #[serde(with = "duration_str")]
    pub luid_rotation_interval: Duration,
    pub max_frame_size: usize,
    pub reassembly_capacity: usize,
    pub max_channels: usize,
    pub identity_batch: usize,
    pub message_batch: usize,
    pub block_size: usize,
    /// Whether to take content from peers
    pub accept_content: bool,
    /// Largest message content taken from a peer
    pub max_message_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            identity_name: "mesh-node".to_string(),
            key_file: None,
            capabilities: vec!["lan".to_string(), "ble".to_string()],
            discovery_bearer: "ble".to_string(),
            role_hint: "seme".to_string(),
            band: "any".to_string(),
            listen: None,
            connect: Vec::new(),
            rendezvous_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            stage_timeout: session.stage_timeout,
            ack_timeout: session.ack_timeout,
            luid_rotation_interval: Duration::from_secs(15 * 60),
            max_frame_size: session.max_frame_size,
            reassembly_capacity: session.reassembly_capacity,
            max_channels: session.max_channels,
            identity_batch: session.identity_batch,
            message_batch: session.message_batch,
            block_size: session.block_size,
            accept_content: session.accept_content,
            max_message_size: session.max_message_size,
        }
    }
}

/// Root of the YAML file; router settings live under `node`
#[derive(Debug, Deserialize)]
struct RootConfig {
    node: Option<NodeConfig>,
}

impl NodeConfig {
    /// Load from `config_path` if it exists, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.node.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse_num(key: &str, value: &str) -> Result<usize> {
            value
                .parse()
                .with_context(|| format!("{key}: expected a number, got {value:?}"))
        }
        fn parse_duration(key: &str, value: &str) -> Result<Duration> {
            humantime::parse_duration(value)
                .with_context(|| format!("{key}: expected a duration, got {value:?}"))
        }

        if let Some(v) = lookup("MESH_IDENTITY_NAME") {
            self.identity_name = v;
        }
        if let Some(v) = lookup("MESH_CAPABILITIES") {
            self.capabilities = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("MESH_BAND") {
            self.band = v;
        }
        if let Some(v) = lookup("MESH_STAGE_TIMEOUT") {
            self.stage_timeout = parse_duration("MESH_STAGE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MESH_ACK_TIMEOUT") {
            self.ack_timeout = parse_duration("MESH_ACK_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MESH_LUID_ROTATION_INTERVAL") {
            self.luid_rotation_interval = parse_duration("MESH_LUID_ROTATION_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("MESH_MAX_FRAME_SIZE") {
            self.max_frame_size = parse_num("MESH_MAX_FRAME_SIZE", &v)?;
        }
        if let Some(v) = lookup("MESH_REASSEMBLY_CAPACITY") {
            self.reassembly_capacity = parse_num("MESH_REASSEMBLY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("MESH_MAX_CHANNELS") {
            self.max_channels = parse_num("MESH_MAX_CHANNELS", &v)?;
        }
        if let Some(v) = lookup("MESH_IDENTITY_BATCH") {
            self.identity_batch = parse_num("MESH_IDENTITY_BATCH", &v)?;
        }
        if let Some(v) = lookup("MESH_MESSAGE_BATCH") {
            self.message_batch = parse_num("MESH_MESSAGE_BATCH", &v)?;
        }
        if let Some(v) = lookup("MESH_BLOCK_SIZE") {
            self.block_size = parse_num("MESH_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("MESH_MAX_MESSAGE_SIZE") {
            self.max_message_size = parse_num("MESH_MAX_MESSAGE_SIZE", &v)?;
        }
        Ok(())
    }

    /// Parsed capability list; must not be empty
    pub fn capabilities(&self) -> Result<Vec<Capability>> {
        if self.capabilities.is_empty() {
            bail!("at least one capability is required");
        }
        self.capabilities
            .iter()
            .map(|c| c.parse::<Capability>().map_err(anyhow::Error::from))
            .collect()
    }

    /// Parsed discovery bearer
    pub fn discovery_bearer(&self) -> Result<Capability> {
        Ok(self.discovery_bearer.parse()?)
    }

    /// Check every field that can only be checked after parsing
    pub fn validate(&self) -> Result<()> {
        self.capabilities()?;
        self.discovery_bearer()?;
        self.role_hint.parse::<Role>()?;
        self.band.parse::<Band>()?;
        if self.stage_timeout.is_zero() || self.ack_timeout.is_zero() {
            bail!("stage and ack timeouts must be positive");
        }
        if self.max_channels == 0 {
            bail!("max_channels must be at least 1");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be positive");
        }
        Ok(())
    }

    /// Library-side session settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stage_timeout: self.stage_timeout,
            ack_timeout: self.ack_timeout,
            max_frame_size: self.max_frame_size,
            reassembly_capacity: self.reassembly_capacity,
            identity_batch: self.identity_batch,
            message_batch: self.message_batch,
            block_size: self.block_size,
            accept_content: self.accept_content,
            max_message_size: self.max_message_size,
            max_channels: self.max_channels,
        }
    }

    /// Node profile signed by `keypair`
    pub fn profile(&self, keypair: Keypair) -> Result<NodeProfile> {
        let mut profile = NodeProfile::new(keypair, self.identity_name.clone(), self.capabilities()?);
        profile.role_hint = self.role_hint.parse()?;
        profile.band = self.band.parse()?;
        Ok(profile)
    }

    /// Read the signing seed from `key_file`, creating it on first use
    pub fn load_keypair(&self) -> Result<Keypair> {
        let Some(path) = &self.key_file else {
            info!("No key file configured, using an ephemeral identity");
            return Ok(Keypair::generate());
        };
        match std::fs::read(path) {
            Ok(seed) => Keypair::from_seed(&seed)
                .with_context(|| format!("invalid key file {:?}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Keypair::generate();
                std::fs::write(path, keypair.secret_bytes())
                    .with_context(|| format!("failed to write key file {:?}", path))?;
                info!("Generated new identity in {:?}", path);
                Ok(keypair)
            }
            Err(e) => Err(e).with_context(|| format!("failed to read key file {:?}", path)),
        }
    }
}

/// Durations written the humantime way (`30s`, `15m`)
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
