use crate::persistent::{JsonFileStore, PersistentStore};
use anyhow::Result as AnyResult;
use config::{Config, Environment as ConfigEnv, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

pub const DEFAULT_MAX_RECORDS: usize = 3300;
pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    9880,
);

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ApplicationConfig {
    pub workers: Option<usize>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub exporter: ExporterConfig,
}

impl ApplicationConfig {
    pub fn load_config() -> AnyResult<Self> {
        let cfg = Config::builder()
            .add_source(ConfigFile::with_name("/etc/bound-cert-store/config").required(false))
            .add_source(ConfigFile::with_name("config").required(false))
            .add_source(
                ConfigEnv::with_prefix("BCS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Soft limit on the number of certificates. Exceeding it is logged but
    /// nothing is evicted.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub session_only: bool,

    #[serde(default)]
    pub force_keep_session_state: bool,
}

impl PersistenceConfig {
    /// Open the configured backing store. Without a path the certificates only
    /// live in memory.
    pub fn open(&self) -> Option<Arc<dyn PersistentStore>> {
        let path = self.path.as_ref()?;
        info!("Persisting bound certificates to {}", path.display());

        let store = JsonFileStore::new(path).session_only(self.session_only);
        Some(Arc::new(store))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExporterConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

const fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

const fn default_listen() -> SocketAddr {
    DEFAULT_LISTEN
}
