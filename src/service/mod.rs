pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, AdmissionConfig, ConnectorConfig, GeneralConfig, KeepAliveConfig,
    NetworkConfig, ProtocolConfig, ProtocolSettings, GLOBAL_CONFIG,
};
pub use connector::Connector;
pub use server::{ConnectionIdGenerator, Server};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod connector;
mod server;
mod shutdown;
mod tracing_config;
