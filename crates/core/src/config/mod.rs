//! Node configuration.
//!
//! Values come from three places, in decreasing priority: command line
//! arguments (or their environment variables), the `config.toml` file in the
//! config directory and the built-in defaults. A device id is generated on
//! first start and persisted so the node keeps its identity across restarts.

use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{ChaChaSealer, MessageSealer, NoopSealer},
    ip_monitor::{self, HttpAddressProbe},
    mesh,
    node::NodeConfig,
    reconnect::ReconnectPolicy,
    types::{LocalIdentity, OrganizationId, PeerId, Role},
    util::backoff::ExponentialBackoff,
};

const QUALIFIER: &str = "";
const ORGANIZATION: &str = "orgmesh";
const APPLICATION: &str = "orgmesh";

pub const CONFIG_FILE: &str = "config.toml";

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub reconnect: ReconnectArgs,

    #[command(flatten)]
    pub mesh: MeshArgs,

    #[command(flatten)]
    pub config_paths: ConfigPathsArgs,

    /// Log level: off, error, warn, info, debug or trace.
    #[arg(long, env = "ORGMESH_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ConfigArgs {
    fn read_config(dir: &Path) -> std::io::Result<Option<Config>> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        tracing::debug!(path = ?path, "Reading configuration file");
        let mut content = String::new();
        File::open(&path)?.read_to_string(&mut content)?;
        let config = toml::from_str::<Config>(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(Some(config))
    }

    /// Resolve the final configuration, persisting it when no file existed yet.
    pub fn build(mut self) -> anyhow::Result<Config> {
        let config_dir = match self.config_paths.config_dir.take() {
            Some(dir) => dir,
            None => ConfigPathsArgs::project_dirs()?.config_local_dir().to_path_buf(),
        };
        let stored = Self::read_config(&config_dir)
            .with_context(|| format!("reading {}", config_dir.join(CONFIG_FILE).display()))?;
        let should_persist = stored.is_none();
        if let Some(stored) = stored {
            self.merge(stored);
        }

        let data_dir = self.config_paths.data_dir()?;

        let id = self.identity.id.unwrap_or_else(|| {
            let id = PeerId::random();
            tracing::info!(%id, "Generated device id");
            id.to_string()
        });
        let organization_id = self
            .identity
            .organization_id
            .context("an organization id is required (--organization-id)")?;

        let reconnect_defaults = ReconnectSection::default();
        let mesh_defaults = MeshSection::default();
        let network_defaults = NetworkSection::default();

        let this = Config {
            identity: IdentitySection {
                name: self.identity.name.unwrap_or_else(|| id.clone()),
                id: id.into(),
                organization_name: self
                    .identity
                    .organization_name
                    .unwrap_or_else(|| organization_id.clone()),
                organization_id: organization_id.into(),
                role: self.identity.role.unwrap_or(Role::Client),
                admin_id: self.identity.admin_id.map(PeerId::from),
            },
            network: NetworkSection {
                relay_url: self.network.relay_url,
                ip_probe_url: self
                    .network
                    .ip_probe_url
                    .unwrap_or(network_defaults.ip_probe_url),
                ip_probe_interval_secs: self
                    .network
                    .ip_probe_interval_secs
                    .unwrap_or(network_defaults.ip_probe_interval_secs),
                negotiation_timeout_secs: self
                    .network
                    .negotiation_timeout_secs
                    .unwrap_or(network_defaults.negotiation_timeout_secs),
                client_ip_grace_secs: self
                    .network
                    .client_ip_grace_secs
                    .unwrap_or(network_defaults.client_ip_grace_secs),
                key_file: self.network.key_file,
            },
            reconnect: ReconnectSection {
                max_attempts: self
                    .reconnect
                    .max_attempts
                    .unwrap_or(reconnect_defaults.max_attempts),
                base_delay_ms: self
                    .reconnect
                    .base_delay_ms
                    .unwrap_or(reconnect_defaults.base_delay_ms),
                ip_change_base_delay_ms: self
                    .reconnect
                    .ip_change_base_delay_ms
                    .unwrap_or(reconnect_defaults.ip_change_base_delay_ms),
                max_delay_ms: self
                    .reconnect
                    .max_delay_ms
                    .unwrap_or(reconnect_defaults.max_delay_ms),
                jitter_percent: self
                    .reconnect
                    .jitter_percent
                    .unwrap_or(reconnect_defaults.jitter_percent),
            },
            mesh: MeshSection {
                heartbeat_interval_secs: self
                    .mesh
                    .heartbeat_interval_secs
                    .unwrap_or(mesh_defaults.heartbeat_interval_secs),
                admin_timeout_secs: self
                    .mesh
                    .admin_timeout_secs
                    .unwrap_or(mesh_defaults.admin_timeout_secs),
                liveness_interval_ms: self
                    .mesh
                    .liveness_interval_ms
                    .unwrap_or(mesh_defaults.liveness_interval_ms),
                admin_purge_after_secs: self
                    .mesh
                    .admin_purge_after_secs
                    .unwrap_or(mesh_defaults.admin_purge_after_secs),
                primary_silence_secs: self
                    .mesh
                    .primary_silence_secs
                    .unwrap_or(mesh_defaults.primary_silence_secs),
                cleanup_interval_secs: self
                    .mesh
                    .cleanup_interval_secs
                    .unwrap_or(mesh_defaults.cleanup_interval_secs),
            },
            storage: StorageSection {
                data_dir: data_dir.clone(),
            },
            config_paths: ConfigPaths {
                config_dir: config_dir.clone(),
                data_dir,
            },
            log_level: self.log_level,
        };

        if should_persist {
            fs::create_dir_all(&config_dir)?;
            let path = config_dir.join(CONFIG_FILE);
            tracing::info!(path = ?path, "Persisting configuration");
            let mut file = File::create(path)?;
            file.write_all(toml::to_string(&this)?.as_bytes())?;
        }

        Ok(this)
    }

    /// File values only fill what the command line left unset.
    fn merge(&mut self, other: Config) {
        let identity = other.identity;
        self.identity.id.get_or_insert(identity.id.to_string());
        self.identity.name.get_or_insert(identity.name);
        self.identity
            .organization_id
            .get_or_insert(identity.organization_id.to_string());
        self.identity
            .organization_name
            .get_or_insert(identity.organization_name);
        self.identity.role.get_or_insert(identity.role);
        if self.identity.admin_id.is_none() {
            self.identity.admin_id = identity.admin_id.map(|id| id.to_string());
        }

        let network = other.network;
        if self.network.relay_url.is_none() {
            self.network.relay_url = network.relay_url;
        }
        self.network.ip_probe_url.get_or_insert(network.ip_probe_url);
        self.network
            .ip_probe_interval_secs
            .get_or_insert(network.ip_probe_interval_secs);
        self.network
            .negotiation_timeout_secs
            .get_or_insert(network.negotiation_timeout_secs);
        self.network
            .client_ip_grace_secs
            .get_or_insert(network.client_ip_grace_secs);
        if self.network.key_file.is_none() {
            self.network.key_file = network.key_file;
        }

        let reconnect = other.reconnect;
        self.reconnect.max_attempts.get_or_insert(reconnect.max_attempts);
        self.reconnect.base_delay_ms.get_or_insert(reconnect.base_delay_ms);
        self.reconnect
            .ip_change_base_delay_ms
            .get_or_insert(reconnect.ip_change_base_delay_ms);
        self.reconnect.max_delay_ms.get_or_insert(reconnect.max_delay_ms);
        self.reconnect.jitter_percent.get_or_insert(reconnect.jitter_percent);

        let mesh = other.mesh;
        self.mesh
            .heartbeat_interval_secs
            .get_or_insert(mesh.heartbeat_interval_secs);
        self.mesh.admin_timeout_secs.get_or_insert(mesh.admin_timeout_secs);
        self.mesh.liveness_interval_ms.get_or_insert(mesh.liveness_interval_ms);
        self.mesh
            .admin_purge_after_secs
            .get_or_insert(mesh.admin_purge_after_secs);
        self.mesh.primary_silence_secs.get_or_insert(mesh.primary_silence_secs);
        self.mesh
            .cleanup_interval_secs
            .get_or_insert(mesh.cleanup_interval_secs);

        self.config_paths.data_dir.get_or_insert(other.storage.data_dir);
        if self.log_level.is_none() {
            self.log_level = other.log_level;
        }
    }
}

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct IdentityArgs {
    /// Device id; generated and persisted on first start when missing.
    #[arg(long = "device-id", env = "ORGMESH_DEVICE_ID")]
    pub id: Option<String>,

    /// Human readable device name.
    #[arg(long = "device-name", env = "ORGMESH_DEVICE_NAME")]
    pub name: Option<String>,

    #[arg(long, env = "ORGMESH_ORGANIZATION_ID")]
    pub organization_id: Option<String>,

    #[arg(long, env = "ORGMESH_ORGANIZATION_NAME")]
    pub organization_name: Option<String>,

    #[arg(long, value_enum, env = "ORGMESH_ROLE")]
    pub role: Option<Role>,

    /// Id of the organization admin, when known ahead of its first presence.
    #[arg(long, env = "ORGMESH_ADMIN_ID")]
    pub admin_id: Option<String>,
}

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct NetworkArgs {
    /// WebSocket URL of the fallback signaling relay.
    #[arg(long, env = "ORGMESH_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Endpoint answering with the caller's public address.
    #[arg(long, env = "ORGMESH_IP_PROBE_URL")]
    pub ip_probe_url: Option<String>,

    #[arg(long, env = "ORGMESH_IP_PROBE_INTERVAL")]
    pub ip_probe_interval_secs: Option<u64>,

    #[arg(long, env = "ORGMESH_NEGOTIATION_TIMEOUT")]
    pub negotiation_timeout_secs: Option<u64>,

    #[arg(long, env = "ORGMESH_CLIENT_IP_GRACE")]
    pub client_ip_grace_secs: Option<u64>,

    /// 32 byte organization key used to seal data-channel frames.
    #[arg(long, env = "ORGMESH_KEY_FILE")]
    pub key_file: Option<PathBuf>,
}

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectArgs {
    #[arg(long = "reconnect-max-attempts", env = "ORGMESH_RECONNECT_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long = "reconnect-base-delay-ms", env = "ORGMESH_RECONNECT_BASE_DELAY_MS")]
    pub base_delay_ms: Option<u64>,

    #[arg(
        long = "reconnect-ip-change-base-delay-ms",
        env = "ORGMESH_RECONNECT_IP_CHANGE_BASE_DELAY_MS"
    )]
    pub ip_change_base_delay_ms: Option<u64>,

    #[arg(long = "reconnect-max-delay-ms", env = "ORGMESH_RECONNECT_MAX_DELAY_MS")]
    pub max_delay_ms: Option<u64>,

    #[arg(long = "reconnect-jitter-percent", env = "ORGMESH_RECONNECT_JITTER_PERCENT")]
    pub jitter_percent: Option<u32>,
}

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct MeshArgs {
    #[arg(long, env = "ORGMESH_HEARTBEAT_INTERVAL")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Admin silence after which clients elect a temporary relay.
    #[arg(long, env = "ORGMESH_ADMIN_TIMEOUT")]
    pub admin_timeout_secs: Option<u64>,

    #[arg(long, env = "ORGMESH_LIVENESS_INTERVAL_MS")]
    pub liveness_interval_ms: Option<u64>,

    #[arg(long, env = "ORGMESH_ADMIN_PURGE_AFTER")]
    pub admin_purge_after_secs: Option<u64>,

    #[arg(long, env = "ORGMESH_PRIMARY_SILENCE")]
    pub primary_silence_secs: Option<u64>,

    #[arg(long, env = "ORGMESH_CLEANUP_INTERVAL")]
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(clap::Parser, Default, Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPathsArgs {
    /// The configuration directory.
    #[arg(long, default_value = None, env = "ORGMESH_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,
    /// The data directory.
    #[arg(long, default_value = None, env = "ORGMESH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

impl ConfigPathsArgs {
    /// The data directory, falling back to the platform default.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_local_dir().to_path_buf()),
        }
    }

    fn project_dirs() -> anyhow::Result<ProjectDirs> {
        ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .context("could not determine a home directory for orgmesh")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    pub identity: IdentitySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub mesh: MeshSection,
    pub storage: StorageSection,
    #[serde(skip)]
    pub config_paths: ConfigPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    pub id: PeerId,
    pub name: String,
    pub organization_id: OrganizationId,
    pub organization_name: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    pub ip_probe_url: String,
    pub ip_probe_interval_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub client_ip_grace_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            relay_url: None,
            ip_probe_url: HttpAddressProbe::DEFAULT_URL.to_owned(),
            ip_probe_interval_secs: ip_monitor::DEFAULT_PROBE_INTERVAL.as_secs(),
            negotiation_timeout_secs: node.negotiation_timeout.as_secs(),
            client_ip_grace_secs: node.client_ip_grace.as_secs(),
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub ip_change_base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_percent: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: ReconnectPolicy::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: millis(ReconnectPolicy::DEFAULT_BASE),
            ip_change_base_delay_ms: millis(ReconnectPolicy::DEFAULT_IP_CHANGE_BASE),
            max_delay_ms: millis(ReconnectPolicy::DEFAULT_CAP),
            jitter_percent: ReconnectPolicy::DEFAULT_JITTER_PERCENT,
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> ReconnectPolicy {
        let cap = Duration::from_millis(self.max_delay_ms);
        let standard = ExponentialBackoff::new(Duration::from_millis(self.base_delay_ms), cap)
            .with_jitter(self.jitter_percent);
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            connection_lost: standard.clone(),
            ice_failed: standard,
            ip_change: ExponentialBackoff::new(
                Duration::from_millis(self.ip_change_base_delay_ms),
                cap,
            )
            .with_jitter(self.jitter_percent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    pub heartbeat_interval_secs: u64,
    pub admin_timeout_secs: u64,
    pub liveness_interval_ms: u64,
    pub admin_purge_after_secs: u64,
    pub primary_silence_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: mesh::HEARTBEAT_INTERVAL.as_secs(),
            admin_timeout_secs: mesh::ADMIN_TIMEOUT.as_secs(),
            liveness_interval_ms: millis(mesh::LIVENESS_CHECK_INTERVAL),
            admin_purge_after_secs: mesh::admin::ADMIN_PURGE_AFTER.as_secs(),
            primary_silence_secs: mesh::admin::PRIMARY_SILENCE.as_secs(),
            cleanup_interval_secs: NodeConfig::default().cleanup_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding one state file per organization.
    pub data_dir: PathBuf,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn local_identity(&self) -> LocalIdentity {
        LocalIdentity {
            id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            organization_id: self.identity.organization_id.clone(),
            organization_name: self.identity.organization_name.clone(),
            role: self.identity.role,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        let network = &self.network;
        let mesh = &self.mesh;
        NodeConfig {
            admin_id: self.identity.admin_id.clone(),
            negotiation_timeout: Duration::from_secs(network.negotiation_timeout_secs),
            client_ip_grace: Duration::from_secs(network.client_ip_grace_secs),
            heartbeat_interval: Duration::from_secs(mesh.heartbeat_interval_secs),
            admin_timeout: Duration::from_secs(mesh.admin_timeout_secs),
            liveness_interval: Duration::from_millis(mesh.liveness_interval_ms),
            cleanup_interval: Duration::from_secs(mesh.cleanup_interval_secs),
            admin_purge_after: Duration::from_secs(mesh.admin_purge_after_secs),
            primary_silence: Duration::from_secs(mesh.primary_silence_secs),
            reconnect: self.reconnect.policy(),
            ..NodeConfig::default()
        }
    }

    pub fn ip_probe(&self) -> anyhow::Result<(HttpAddressProbe, Duration)> {
        let probe = HttpAddressProbe::new(&self.network.ip_probe_url, Duration::from_secs(5))?;
        Ok((
            probe,
            Duration::from_secs(self.network.ip_probe_interval_secs),
        ))
    }

    /// The frame sealer; frames travel in the clear without a key file.
    pub fn sealer(&self) -> anyhow::Result<Arc<dyn MessageSealer>> {
        match &self.network.key_file {
            Some(path) => {
                let sealer = ChaChaSealer::from_key_file(path)
                    .with_context(|| format!("loading organization key {}", path.display()))?;
                Ok(Arc::new(sealer))
            }
            None => Ok(Arc::new(NoopSealer)),
        }
    }

    pub fn log_level(&self) -> Option<tracing::level_filters::LevelFilter> {
        self.log_level.as_deref().and_then(|level| match level.parse() {
            Ok(level) => Some(level),
            Err(_) => {
                tracing::warn!(%level, "Ignoring unknown log level");
                None
            }
        })
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}
