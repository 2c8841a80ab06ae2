use std::{io, net::SocketAddr, sync::Arc};

use futures::{Stream, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, Semaphore},
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    config::{BridgeConfig, ConnectionPolicy},
    connection,
    endpoint::{EndpointHandle, EndpointId, OpenEndpoint},
    error::Error,
    mock::MockBuilder,
    serial::serial_port::SerialPortBuilder,
};

/// Bridges one endpoint to one TCP listener.
pub struct Server<O> {
    opener: O,
    address: String,
    policy: ConnectionPolicy,
    bound: Option<oneshot::Sender<SocketAddr>>,
}

impl<O: OpenEndpoint> Server<O> {
    /// A server which will open the endpoint and listen on the address (host:port) when run.
    pub fn new(opener: O, address: &str) -> Self {
        Self {
            opener,
            address: address.into(),
            policy: ConnectionPolicy::default(),
            bound: None,
        }
    }

    /// Set how concurrent clients are handled.
    pub fn policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Once listening, the local address is sent on the provided channel.
    /// Useful when binding port 0.
    pub fn notify_bound(mut self, bound: oneshot::Sender<SocketAddr>) -> Self {
        self.bound = Some(bound);
        self
    }

    /// Open the endpoint, then the listener, then serve connections until `shutdown` is cancelled.
    ///
    /// Failing to open either is returned as an error.
    /// The listener is never opened if the endpoint fails,
    /// and the endpoint is closed again if the listener fails.
    ///
    /// On shutdown the listener and the endpoint are closed.
    /// Active connections are not waited for, they end on their own when they see the endpoint close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Self {
            opener,
            address,
            policy,
            bound,
        } = self;

        info!(endpoint = %opener.id(), %address, ?policy, "Running");

        let endpoint = match opener.open() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(%e, "Failed to open serial port");
                return Err(e);
            }
        };

        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(%source, %address, "Failed to listen");
                endpoint.close().await;
                return Err(Error::Listen { address, source });
            }
        };

        match listener.local_addr() {
            Ok(local) => {
                info!("Listening on {local}");

                if let Some(bound) = bound {
                    if bound.send(local).is_err() {
                        debug!("Nobody waiting for the bound address");
                    }
                }
            }
            Err(e) => warn!(?e, "Listening, but the local address is unknown"),
        }

        serve(TcpListenerStream::new(listener), &endpoint, policy, shutdown).await;

        endpoint.close().await;

        info!("Stopped");

        Ok(())
    }
}

/// Run the bridge described by the configuration until `shutdown` is cancelled.
pub async fn run(config: BridgeConfig, shutdown: CancellationToken) -> Result<(), Error> {
    match &config.endpoint {
        EndpointId::Tty(path) => {
            let builder = SerialPortBuilder::new(path).set_config(config.serial);

            Server::new(builder, &config.address)
                .policy(config.policy)
                .run(shutdown)
                .await
        }
        EndpointId::Mock(name) => {
            Server::new(MockBuilder::loopback(name), &config.address)
                .policy(config.policy)
                .run(shutdown)
                .await
        }
    }
}

/// Accept connections from `incoming` and bridge each to the endpoint,
/// until `shutdown` is cancelled or `incoming` ends.
///
/// A failed accept is logged and the next connection is waited for.
/// Each connection is handled in its own task.
pub async fn serve<S>(
    mut incoming: S,
    endpoint: &EndpointHandle,
    policy: ConnectionPolicy,
    shutdown: CancellationToken,
) where
    S: Stream<Item = io::Result<TcpStream>> + Unpin,
{
    let exclusive = Arc::new(Semaphore::new(1));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down");
                break;
            }
            next = incoming.next() => next,
        };

        let stream = match next {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                error!(%e, "Failed to accept connection");
                continue;
            }
            None => {
                warn!("Listener closed");
                break;
            }
        };

        let span = connection_span(&stream);

        let permit = match policy {
            ConnectionPolicy::Shared => None,
            ConnectionPolicy::Exclusive => match exclusive.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    span.in_scope(|| warn!("Serial port in use by another connection, rejecting"));
                    continue;
                }
            },
        };

        if endpoint.is_closed() {
            span.in_scope(|| warn!("Serial port is closed, connection will end right away"));
        }

        let link = endpoint.link();

        tokio::spawn(
            async move {
                let _permit = permit;

                connection::handle_connection(stream, link).await;
            }
            .instrument(span),
        );
    }
}

fn connection_span(stream: &TcpStream) -> Span {
    fn show(addr: io::Result<SocketAddr>) -> String {
        addr.map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    info_span!(
        "connection",
        local = %show(stream.local_addr()),
        remote = %show(stream.peer_addr())
    )
}
