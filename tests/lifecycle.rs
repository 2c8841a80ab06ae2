use std::io;

use color_eyre::Result;
use common::*;
use futures::stream;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serialtcp::{
    config::ConnectionPolicy,
    endpoint::OpenEndpoint,
    error::Error,
    mock::MockBuilder,
    serial::serial_port::SerialPortBuilder,
    server::{self, Server},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

mod common;

#[tokio::test]
async fn serial_open_failure_never_listens() -> Result<()> {
    let (bound_tx, bound_rx) = oneshot::channel();

    let result = Server::new(MockBuilder::unavailable("unplugged"), "127.0.0.1:0")
        .notify_bound(bound_tx)
        .run(CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Unavailable(_))));

    // Never listened, so nothing was ever sent.
    assert!(bound_rx.await.is_err());

    Ok(())
}

#[tokio::test]
async fn missing_tty_never_listens() -> Result<()> {
    // Find a free port.
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

    let result = Server::new(
        SerialPortBuilder::new("/dev/this-port-does-not-exist"),
        &addr.to_string(),
    )
    .run(CancellationToken::new())
    .await;

    assert!(matches!(result, Err(Error::SerialOpen { .. })));

    // The address is still free.
    TcpListener::bind(addr).await?;

    Ok(())
}

#[tokio::test]
async fn listen_failure_closes_serial_port() -> Result<()> {
    let taken = TcpListener::bind("127.0.0.1:0").await?;
    let addr = taken.local_addr()?.to_string();

    let (builder, mut device) = MockBuilder::with_device("listen-failure");

    let result = Server::new(builder, &addr)
        .run(CancellationToken::new())
        .await;

    match result {
        Err(Error::Listen { address, .. }) => assert_eq!(address, addr),
        other => panic!("Expected listen error, got {other:?}"),
    }

    // The device sees the port being closed.
    assert!(read_to_end(&mut device).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn accept_failure_does_not_stop_accepting() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let failures = (0..3).map(|i| {
        Err::<TcpStream, _>(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            format!("simulated accept failure {i}"),
        ))
    });
    let incoming = stream::iter(failures).chain(TcpListenerStream::new(listener));

    let endpoint = MockBuilder::loopback("accept-failure").open()?;
    let shutdown = CancellationToken::new();

    let client = async {
        let mut client = connect(addr).await?;
        client.write_all(b"PING").await?;
        let echoed = read_n(&mut client, 4).await;

        shutdown.cancel();
        echoed
    };

    let ((), echoed) = timeout(
        TIMEOUT,
        async {
            tokio::join!(
                server::serve(incoming, &endpoint, ConnectionPolicy::Shared, shutdown.clone()),
                client
            )
        },
    )
    .await?;

    assert_eq!(echoed?, b"PING");

    endpoint.close().await;

    Ok(())
}

#[tokio::test]
async fn shutdown_ends_every_connection() -> Result<()> {
    const CLIENTS: u8 = 4;

    let (bridge, mut device) = start_bridge_with_device("shutdown").await;

    let mut clients = vec![];
    for i in 0..CLIENTS {
        let mut client = connect(bridge.addr).await?;
        client.write_all(&[i]).await?;
        clients.push(client);
    }

    // Every copier is running once all bytes got through.
    let mut received = read_n(&mut device, CLIENTS as usize).await?;
    received.sort();
    assert_eq!(received, (0..CLIENTS).collect::<Vec<_>>());

    device.write_all(b"hi").await?;
    for client in &mut clients {
        assert_eq!(read_n(client, 2).await?, b"hi");
    }

    let addr = bridge.addr;
    bridge.stop().await?;

    // All connections end.
    for client in &mut clients {
        assert!(read_to_end(client).await?.is_empty());
    }

    // Serial port closed.
    assert!(read_to_end(&mut device).await?.is_empty());

    // Listener closed.
    assert!(TcpStream::connect(addr).await.is_err());

    Ok(())
}

#[tokio::test]
async fn shutdown_without_connections() -> Result<()> {
    let bridge = start_loopback_bridge("idle", ConnectionPolicy::Shared).await;

    bridge.stop().await
}
