mod network;
mod protocol;
mod request;
mod service;
mod utils;

pub use network::{Action, ConnectionCancel, Processor, Stage};
pub use protocol::{Frame, FrameError, TextEncoding, DEFAULT_PACKET_SIZE};
pub use request::{
    status_text, AjpHandler, AjpRequest, AjpResponse, Cookie, HandlerError,
    MemorySessionRegistry, PathRouter, SessionRegistry,
};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, Connector,
    ConnectorConfig, ProtocolSettings, Shutdown, GLOBAL_CONFIG,
};
pub use utils::{schedule_periodic, CancelHandle};
