use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::network::Processor;
use crate::request::{AdmissionControl, PathRouter, SessionRegistry};
use crate::{AppError, AppResult};

use super::{ProtocolSettings, Shutdown};

/// Monotonic connection-id source, owned by the server and injected into
/// each processor at construction.
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
    next: AtomicU64,
}

impl ConnectionIdGenerator {
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// handler for each connection
struct ConnectionHandler {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    processor: Processor,
}

impl ConnectionHandler {
    async fn handle_connection(&mut self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        self.processor.run(&mut shutdown).await
    }
}

pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    settings: ProtocolSettings,
    router: Arc<PathRouter>,
    sessions: Arc<dyn SessionRegistry>,
    admission: Arc<AdmissionControl>,
    connection_ids: ConnectionIdGenerator,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        settings: ProtocolSettings,
        router: Arc<PathRouter>,
        sessions: Arc<dyn SessionRegistry>,
    ) -> Server {
        let admission = Arc::new(AdmissionControl::from_settings(&settings));
        Server {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            settings,
            router,
            sessions,
            admission,
            connection_ids: ConnectionIdGenerator::default(),
        }
    }

    /// Accepts connections until told to stop, spawning one task per
    /// connection. A semaphore permit bounds the number of live
    /// connections; the permit travels into the task and is released when
    /// the connection ends, however it ends.
    pub async fn run(&self) -> AppResult<()> {
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            debug!("accept new connection");

            let socket = self.accept().await?;
            let connection_id = self.connection_ids.next_id();

            let processor = Processor::new(
                connection_id,
                socket,
                self.settings.clone(),
                self.router.clone(),
                self.sessions.clone(),
                self.admission.clone(),
            );

            let mut handler = ConnectionHandler {
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
                notify_shutdown: self.notify_shutdown.clone(),
                processor,
            };

            tokio::spawn(async move {
                if let Err(err) = handler.handle_connection().await {
                    error!(connection = connection_id, "connection error: {:?}", err);
                }
                // whether gracefully or unexpectedly closed, release the slot
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    info!(peer = %addr, "accepted connection");
                    return Ok(socket);
                }
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler dropped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::request::{AjpHandler, AjpRequest, AjpResponse, HandlerError, MemorySessionRegistry};

    struct OkHandler;

    #[async_trait]
    impl AjpHandler for OkHandler {
        async fn handle(
            &self,
            _request: &mut AjpRequest,
            _response: &mut AjpResponse,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn connection_ids_are_monotonic() {
        let ids = ConnectionIdGenerator::default();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[tokio::test]
    async fn server_accepts_and_answers_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let mut router = PathRouter::new();
        router.add_route("/", Arc::new(OkHandler));
        let server = Server::new(
            listener,
            Arc::new(Semaphore::new(4)),
            notify_shutdown.clone(),
            complete_tx,
            ProtocolSettings::default(),
            Arc::new(router),
            Arc::new(MemorySessionRegistry::new(8)),
        );
        let server_task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[0x12, 0x34, 0x00, 0x01, 10])
            .await
            .unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x41, 0x42, 0x00, 0x01, 9]);

        server_task.abort();
    }
}
