use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use rivetd::{
    setup_tracing, AjpHandler, AjpRequest, AjpResponse, AppResult, Connector, ConnectorConfig,
    HandlerError, MemorySessionRegistry, PathRouter, GLOBAL_CONFIG,
};
use tokio::runtime;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Built-in liveness handler mounted at the root; real deployments mount
/// their own handlers on the router.
struct StatusHandler;

#[async_trait]
impl AjpHandler for StatusHandler {
    async fn handle(
        &self,
        _request: &mut AjpRequest,
        response: &mut AjpResponse,
    ) -> Result<(), HandlerError> {
        response
            .set_header("content-type", "text/plain")
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        response
            .write_body(b"rivetd is alive\n")
            .await
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        Ok(())
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _log_guard = setup_tracing();

    //setup config
    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let connector_config = ConnectorConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", connector_config);
        return Ok(());
    }
    GLOBAL_CONFIG
        .set(connector_config)
        .expect("set connector config failed");

    let mut router = PathRouter::new();
    router.add_route("/", Arc::new(StatusHandler));

    let sessions = Arc::new(MemorySessionRegistry::new(10_000));

    let mut connector = Connector::new(Arc::new(router), sessions);
    connector.start(&rt)?;

    Ok(())
}
