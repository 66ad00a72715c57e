extern crate config as _;

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::protocol::{TextEncoding, DEFAULT_PACKET_SIZE};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<ConnectorConfig> = OnceCell::new();
pub fn global_config() -> &'static ConnectorConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    pub id: i32,
    /// Route tag appended to minted session ids so a sticky front end can
    /// pin a client to this instance.
    pub instance_route: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Negotiated packet size; body chunk limits scale with it.
    pub packet_size: usize,
    /// Applied only while waiting for the next transaction's first bytes.
    /// 0 disables the timeout.
    pub await_read_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 8009,
            max_connection: 256,
            packet_size: DEFAULT_PACKET_SIZE,
            await_read_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ProtocolConfig {
    /// When set, every forward request must carry this secret attribute.
    pub required_secret: Option<String>,
    /// Target encoding for escaped text runs. Only "utf-8" is accepted.
    pub packet_encoding: Option<String>,
    pub enforce_secure_scheme: bool,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct KeepAliveConfig {
    /// Probe task period. 0 disables keep-alive entirely.
    pub tick_interval_ms: u64,
    /// Write-idle threshold beyond which a probe is sent.
    pub max_write_idle_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Enforce one in-flight long-running transaction per matched route.
    pub restrict_long_running: bool,
    pub long_running_path: String,
    pub long_running_param: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ConnectorConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub keep_alive: KeepAliveConfig,
    pub admission: AdmissionConfig,
}

impl ConnectorConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ConnectorConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()
            .unwrap_or_else(|err| {
                eprintln!("error in reading config files: {:?}", err);
                std::process::exit(1);
            });

        let connector_config: ConnectorConfig = config.try_deserialize()?;

        Ok(connector_config)
    }
}

/// Per-connection snapshot of everything the protocol machinery needs.
///
/// Captured once at accept time and handed to the connection, so a config
/// reload never changes behavior mid-transaction and tests can construct
/// one directly.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub packet_size: usize,
    pub encoding: TextEncoding,
    pub required_secret: Option<String>,
    pub await_read_timeout: Option<Duration>,
    pub keep_alive_tick: Option<Duration>,
    pub max_write_idle: Duration,
    pub enforce_secure_scheme: bool,
    pub restrict_long_running: bool,
    pub long_running_path: String,
    pub long_running_param: String,
    pub instance_route: String,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolSettings {
            packet_size: DEFAULT_PACKET_SIZE,
            encoding: TextEncoding::Utf8,
            required_secret: None,
            await_read_timeout: None,
            keep_alive_tick: None,
            max_write_idle: Duration::from_secs(10),
            enforce_secure_scheme: false,
            restrict_long_running: false,
            long_running_path: String::new(),
            long_running_param: String::new(),
            instance_route: String::new(),
        }
    }
}

impl ProtocolSettings {
    pub fn from_config(cfg: &ConnectorConfig) -> AppResult<ProtocolSettings> {
        if !(1024..=65536).contains(&cfg.network.packet_size) {
            return Err(AppError::InvalidValue(format!(
                "packet_size {} outside 1024..=65536",
                cfg.network.packet_size
            )));
        }
        let encoding = match cfg.protocol.packet_encoding.as_deref() {
            None => TextEncoding::Utf8,
            Some(name) => TextEncoding::from_name(name).ok_or_else(|| {
                AppError::InvalidValue(format!("unsupported packet_encoding: {}", name))
            })?,
        };
        Ok(ProtocolSettings {
            packet_size: cfg.network.packet_size,
            encoding,
            required_secret: cfg.protocol.required_secret.clone(),
            await_read_timeout: match cfg.network.await_read_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            keep_alive_tick: match cfg.keep_alive.tick_interval_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_write_idle: Duration::from_millis(cfg.keep_alive.max_write_idle_ms.max(1)),
            enforce_secure_scheme: cfg.protocol.enforce_secure_scheme,
            restrict_long_running: cfg.admission.restrict_long_running,
            long_running_path: cfg.admission.long_running_path.clone(),
            long_running_param: cfg.admission.long_running_param.clone(),
            instance_route: cfg.general.instance_route.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_reject_bad_packet_size() {
        let mut cfg = ConnectorConfig::default();
        cfg.network = NetworkConfig::default();
        cfg.network.packet_size = 100;
        assert!(ProtocolSettings::from_config(&cfg).is_err());
    }

    #[test]
    fn settings_reject_unknown_encoding() {
        let mut cfg = ConnectorConfig::default();
        cfg.network = NetworkConfig::default();
        cfg.protocol.packet_encoding = Some("ebcdic".to_string());
        assert!(ProtocolSettings::from_config(&cfg).is_err());
    }

    #[test]
    fn zero_timeouts_disable_features() {
        let mut cfg = ConnectorConfig::default();
        cfg.network = NetworkConfig::default();
        let settings = ProtocolSettings::from_config(&cfg).unwrap();
        assert!(settings.await_read_timeout.is_none());
        assert!(settings.keep_alive_tick.is_none());
    }
}
