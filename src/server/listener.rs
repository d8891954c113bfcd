use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::http::connection::Connection;
use crate::http::creator::ResponseCreatorFactory;
use crate::http::timeout::{IdleTimeout, RequestTimeout, TimeoutError, Timeouts};
use crate::server::registry::ConnectionRegistry;

pub const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 10_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: i64 = 10_000;

/// Pause after a failed accept before retrying.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("no response creator factory configured")]
    MissingFactory,
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Collects and validates the listener's construction parameters.
pub struct ListenerBuilder {
    address: IpAddr,
    port: u16,
    factory: Option<Arc<dyn ResponseCreatorFactory>>,
    request_timeout_ms: i64,
    idle_timeout_ms: i64,
}

impl Default for ListenerBuilder {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            factory: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

impl ListenerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    /// Port 0 asks the OS for an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn endpoint(self, endpoint: SocketAddr) -> Self {
        self.address(endpoint.ip()).port(endpoint.port())
    }

    pub fn factory(mut self, factory: Arc<dyn ResponseCreatorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn request_timeout_ms(mut self, millis: i64) -> Self {
        self.request_timeout_ms = millis;
        self
    }

    pub fn idle_timeout_ms(mut self, millis: i64) -> Self {
        self.idle_timeout_ms = millis;
        self
    }

    /// Fails without binding anything if a parameter is invalid.
    pub fn build(self) -> Result<Listener, ListenerError> {
        let factory = self.factory.ok_or(ListenerError::MissingFactory)?;
        let timeouts = Timeouts {
            request: RequestTimeout::from_millis(self.request_timeout_ms)?,
            idle: IdleTimeout::from_millis(self.idle_timeout_ms)?,
        };

        Ok(Listener {
            endpoint: SocketAddr::new(self.address, self.port),
            factory,
            timeouts,
            registry: Arc::new(ConnectionRegistry::new()),
            running: None,
        })
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Accepts TCP connections and hands each one to its own [`Connection`].
pub struct Listener {
    endpoint: SocketAddr,
    factory: Arc<dyn ResponseCreatorFactory>,
    timeouts: Timeouts,
    registry: Arc<ConnectionRegistry>,
    running: Option<Running>,
}

impl Listener {
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::new()
    }

    pub fn new(
        endpoint: SocketAddr,
        factory: Arc<dyn ResponseCreatorFactory>,
        request_timeout: RequestTimeout,
        idle_timeout: IdleTimeout,
    ) -> Self {
        Self {
            endpoint,
            factory,
            timeouts: Timeouts {
                request: request_timeout,
                idle: idle_timeout,
            },
            registry: Arc::new(ConnectionRegistry::new()),
            running: None,
        }
    }

    /// Binds the endpoint and starts accepting in the background.
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        if let Some(running) = &self.running {
            return Err(ListenerError::AlreadyListening(running.local_addr));
        }

        let listener = TcpListener::bind(self.endpoint)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: self.endpoint,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ListenerError::LocalAddr)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.factory.clone(),
            self.timeouts,
            self.registry.clone(),
            shutdown_rx,
        ));

        info!(
            addr = %local_addr,
            request_timeout_ms = self.timeouts.request.as_duration().as_millis() as u64,
            idle_timeout_ms = self.timeouts.idle.as_duration().as_millis() as u64,
            "Listening"
        );

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    /// Stops accepting and closes every live connection.
    ///
    /// Returns once all connection tasks have finished. Calling it on a
    /// listener that is not running does nothing.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        let _ = running.accept_task.await;

        let connections = self.registry.drain();
        let closed = connections.len();
        for (id, handle) in connections {
            if let Err(e) = handle.await {
                warn!(connection = %id, error = %e, "Connection task failed");
            }
        }

        info!(addr = %running.local_addr, closed, "Stopped listening");
    }

    pub fn is_listening(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// The bound address while listening, the configured one otherwise.
    pub fn address(&self) -> IpAddr {
        self.local_addr().unwrap_or(self.endpoint).ip()
    }

    /// The bound port while listening, the configured one otherwise.
    pub fn port(&self) -> u16 {
        self.local_addr().unwrap_or(self.endpoint).port()
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Connections accepted since construction.
    pub fn accepted_count(&self) -> u64 {
        self.registry.total_allocated()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            // Dropping the sender also wakes every connection
            let _ = running.shutdown.send(true);
            running.accept_task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    factory: Arc<dyn ResponseCreatorFactory>,
    timeouts: Timeouts,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let id = registry.allocate_id();
                    info!(connection = %id, peer = %peer, "Accepted connection");

                    let connection = Connection::new(
                        id,
                        peer,
                        socket,
                        factory.create(),
                        timeouts,
                        Arc::downgrade(&registry),
                        shutdown.clone(),
                    );
                    registry.spawn(id, connection.run());
                }
                Err(e) => {
                    // Errors such as EMFILE persist until a connection closes
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
}
