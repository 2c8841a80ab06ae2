#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use color_eyre::Result;
use serialtcp::{
    config::ConnectionPolicy, error::Error, logging, mock::MockBuilder, server::Server,
};
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A bridge running in the background.
pub struct RunningBridge {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), Error>>,
}

impl RunningBridge {
    /// Cancel and wait for the server to return.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        timeout(TIMEOUT, self.task).await???;

        Ok(())
    }
}

pub async fn start_bridge(builder: MockBuilder, policy: ConnectionPolicy) -> RunningBridge {
    logging::init(Level::DEBUG, None).await;

    let (bound_tx, bound_rx) = oneshot::channel();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(
        Server::new(builder, "127.0.0.1:0")
            .policy(policy)
            .notify_bound(bound_tx)
            .run(shutdown.clone()),
    );

    let addr = bound_rx
        .await
        .expect("Server should reply with bound address");

    info!("Bridge listening on {addr}");

    RunningBridge {
        addr,
        shutdown,
        task,
    }
}

/// A bridge where the test plays the serial device.
pub async fn start_bridge_with_device(name: &str) -> (RunningBridge, DuplexStream) {
    let (builder, device) = MockBuilder::with_device(name);
    let bridge = start_bridge(builder, ConnectionPolicy::Shared).await;

    (bridge, device)
}

/// A bridge where the serial device echoes everything.
pub async fn start_loopback_bridge(name: &str, policy: ConnectionPolicy) -> RunningBridge {
    start_bridge(MockBuilder::loopback(name), policy).await
}

pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    info!("Connecting to bridge on {addr}");

    Ok(timeout(TIMEOUT, TcpStream::connect(addr)).await??)
}

/// Read exactly `n` bytes, or fail after [`TIMEOUT`].
pub async fn read_n<R: AsyncReadExt + Unpin>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; n];
    timeout(TIMEOUT, reader.read_exact(&mut buf)).await??;

    Ok(buf)
}

/// Read until end of file, or fail after [`TIMEOUT`].
pub async fn read_to_end<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf = vec![];
    timeout(TIMEOUT, reader.read_to_end(&mut buf)).await??;

    Ok(buf)
}
