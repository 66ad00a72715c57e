use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::Sender;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::signal;
use tracing::{error, info, trace};

use crate::request::{PathRouter, SessionRegistry};
use crate::service::Server;
use crate::AppError::IllegalState;
use crate::{global_config, AppResult, ProtocolSettings};

/// Top-level wiring: binds the listener, runs the accept loop and drives
/// graceful shutdown.
///
/// Shutdown sequence: ctrl-c cancels the accept loop; dropping the server
/// releases its completion sender; the broadcast signal stops every
/// connection handler after its in-flight transaction; once the last
/// handler drops its completion sender the connector returns.
pub struct Connector {
    router: Arc<PathRouter>,
    sessions: Arc<dyn SessionRegistry>,
}

impl Connector {
    pub fn new(router: Arc<PathRouter>, sessions: Arc<dyn SessionRegistry>) -> Connector {
        Connector { router, sessions }
    }

    pub fn start(&mut self, rt: &Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        rt.block_on(Self::run_tcp_server(
            self.router.clone(),
            self.sessions.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx,
        ))?;

        // tcp server has been shut down, fan the signal out
        let _ = notify_shutdown.send(());
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("connector shutdown complete");
        Ok(())
    }

    async fn run_tcp_server(
        router: Arc<PathRouter>,
        sessions: Arc<dyn SessionRegistry>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: Sender<()>,
    ) -> AppResult<()> {
        let network_conf = &global_config().network;
        let listen_address = format!("{}:{}", network_conf.ip, network_conf.port);

        let bind_result = TcpListener::bind(&listen_address).await;
        if let Err(err) = &bind_result {
            let error_msg = format!(
                "Failed to bind connector to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            return Err(IllegalState(error_msg));
        }
        info!("connector binding to {} for listening", &listen_address);

        let settings = ProtocolSettings::from_config(global_config())?;
        let server = Server::new(
            bind_result?,
            Arc::new(Semaphore::new(network_conf.max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            settings,
            router,
            sessions,
        );
        tokio::select! {
          res = server.run() => {
              if let Err(err) = res {
                  error!(cause = %err, "failed to accept");
              }
          }
          _ = signal::ctrl_c() => {
              info!("get shutdown signal");
          }
        }

        Ok(())
    }
}
