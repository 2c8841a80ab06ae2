use std::{fmt::Display, io};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::endpoint::{SerialLink, SerialReader, SerialWriter};

const READ_CHUNK: usize = 4096;

/// Which part of a connection's life something happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Preparing the socket.
    Setup,

    /// Bytes going from the serial port to the client.
    SerialToClient,

    /// Bytes going from the client to the serial port.
    ClientToSerial,

    /// Closing the socket.
    Close,
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Setup => "setup",
            Direction::SerialToClient => "serial -> client",
            Direction::ClientToSerial => "client -> serial",
            Direction::Close => "close",
        };

        write!(f, "{s}")
    }
}

/// Everything that went wrong during one connection.
///
/// Holds at least one error.
#[derive(Debug, Error)]
#[error("{}", summarize(.errors))]
pub struct ConnectionError {
    errors: Vec<(Direction, io::Error)>,
}

fn summarize(errors: &[(Direction, io::Error)]) -> String {
    errors
        .iter()
        .map(|(direction, e)| format!("{direction}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConnectionError {
    fn single(direction: Direction, e: io::Error) -> Self {
        Self {
            errors: vec![(direction, e)],
        }
    }

    /// The underlying errors, in the order: serial to client, client to serial, close.
    pub fn errors(&self) -> impl Iterator<Item = (Direction, &io::Error)> {
        self.errors.iter().map(|(direction, e)| (*direction, e))
    }

    /// The error from the given direction, if any.
    pub fn get(&self, direction: Direction) -> Option<&io::Error> {
        self.errors
            .iter()
            .find(|(d, _)| *d == direction)
            .map(|(_, e)| e)
    }
}

/// How a connection ended.
#[derive(Debug)]
pub enum CopyOutcome {
    /// Both directions ended without errors because the serial port was closed.
    Closed,

    /// The client stopped sending, and everything was wrapped up without errors.
    ClosedByPeer,

    /// One or more errors happened.
    Failed(ConnectionError),
}

impl CopyOutcome {
    /// True if nothing went wrong.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// The result of copying bytes for one connection.
#[derive(Debug)]
pub struct CopyReport {
    /// How it ended.
    pub outcome: CopyOutcome,

    /// Bytes written to the client.
    pub to_client: u64,

    /// Bytes sent towards the serial port.
    pub to_serial: u64,
}

/// Why the client to serial direction stopped.
enum Stopped {
    /// The client sent end of file.
    ByPeer,

    /// The serial port was closed.
    SerialClosed,

    /// The other direction ended.
    Other,
}

/// Copy bytes between a client and the serial port until both directions are done.
///
/// A client that stops sending still gets serial output, until the serial port closes
/// or writing to the client fails.
/// Any other ending tells the remaining direction to wrap up:
/// bytes already read from the serial port are still written to the client.
/// The connection is closed before returning. The serial port is left as is.
///
/// Logs one event when starting and one when done,
/// callers should put this in a span identifying the connection.
pub async fn handle_connection(stream: TcpStream, link: SerialLink) -> CopyReport {
    info!("Accepted");

    let report = copy(stream, link).await;

    match &report.outcome {
        CopyOutcome::Failed(e) => {
            error!(
                %e,
                to_client = report.to_client,
                to_serial = report.to_serial,
                "Failed to handle connection"
            )
        }
        outcome => {
            info!(
                ?outcome,
                to_client = report.to_client,
                to_serial = report.to_serial,
                "Connection closed"
            )
        }
    }

    report
}

async fn copy(stream: TcpStream, link: SerialLink) -> CopyReport {
    let mut report = CopyReport {
        outcome: CopyOutcome::Closed,
        to_client: 0,
        to_serial: 0,
    };

    if let Err(e) = stream.set_nodelay(true) {
        report.outcome = CopyOutcome::Failed(ConnectionError::single(Direction::Setup, e));
        return report;
    }

    let (mut client_reader, mut client_writer) = stream.into_split();
    let (serial_reader, serial_writer) = link.into_split();

    // Cancelled when either direction is done, except when the client only stopped sending.
    let done = CancellationToken::new();

    let (to_client, to_serial) = tokio::join!(
        serial_to_client(serial_reader, &mut client_writer, &done, &mut report.to_client),
        client_to_serial(&mut client_reader, &serial_writer, &done, &mut report.to_serial),
    );

    let closed = match client_writer.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
        _ => Ok(()),
    };

    // Both halves are dropped here, which closes the socket.
    drop(client_reader);
    drop(client_writer);

    let mut errors = vec![];
    let to_serial = match to_serial {
        Ok(stopped) => Some(stopped),
        Err(e) => {
            errors.push((Direction::ClientToSerial, e));
            None
        }
    };
    match to_client {
        // A client which stopped sending and then went away is not a failure.
        Err(e) if matches!(to_serial, Some(Stopped::ByPeer)) && gone(&e) => {
            debug!(%e, "Client went away")
        }
        Err(e) => errors.insert(0, (Direction::SerialToClient, e)),
        Ok(()) => {}
    }
    match closed {
        Err(e) if matches!(to_serial, Some(Stopped::ByPeer)) && gone(&e) => {}
        Err(e) => errors.push((Direction::Close, e)),
        Ok(()) => {}
    }

    report.outcome = if !errors.is_empty() {
        CopyOutcome::Failed(ConnectionError { errors })
    } else if matches!(to_serial, Some(Stopped::ByPeer)) {
        CopyOutcome::ClosedByPeer
    } else {
        CopyOutcome::Closed
    };

    report
}

fn gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

async fn serial_to_client(
    mut serial: SerialReader,
    client: &mut OwnedWriteHalf,
    done: &CancellationToken,
    count: &mut u64,
) -> io::Result<()> {
    let _guard = done.clone().drop_guard();

    loop {
        let message = tokio::select! {
            biased;

            message = serial.recv() => message?,
            _ = done.cancelled() => {
                // Hand over what already arrived before stopping.
                while let Some(message) = serial.try_recv()? {
                    client.write_all(&message).await?;
                    *count += message.len() as u64;
                }
                None
            }
        };

        let Some(message) = message else { break };

        client.write_all(&message).await?;
        *count += message.len() as u64;

        trace!("{} byte(s) to client", message.len());
    }

    client.flush().await?;

    debug!("Serial to client done");

    Ok(())
}

async fn client_to_serial(
    client: &mut OwnedReadHalf,
    serial: &SerialWriter,
    done: &CancellationToken,
    count: &mut u64,
) -> io::Result<Stopped> {
    let guard = done.clone().drop_guard();
    let mut buf = vec![0; READ_CHUNK];

    let stopped = loop {
        let n = tokio::select! {
            read = client.read(&mut buf) => read?,
            _ = serial.closed() => break Stopped::SerialClosed,
            _ = done.cancelled() => break Stopped::Other,
        };

        if n == 0 {
            guard.disarm();
            break Stopped::ByPeer;
        }

        serial.send(Bytes::copy_from_slice(&buf[..n])).await?;
        *count += n as u64;

        trace!("{n} byte(s) to serial");
    };

    debug!("Client to serial done");

    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        time::timeout,
    };

    use super::*;
    use crate::{endpoint::OpenEndpoint, mock::MockBuilder};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        (client, server)
    }

    #[test]
    fn errors_are_kept_together() {
        let e = ConnectionError {
            errors: vec![
                (
                    Direction::SerialToClient,
                    io::Error::new(io::ErrorKind::BrokenPipe, "first"),
                ),
                (
                    Direction::Close,
                    io::Error::new(io::ErrorKind::Other, "second"),
                ),
            ],
        };

        assert_eq!(e.to_string(), "serial -> client: first; close: second");
        assert_eq!(e.errors().count(), 2);
        assert!(e.get(Direction::ClientToSerial).is_none());
        assert_eq!(e.get(Direction::Close).unwrap().to_string(), "second");
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let (mut client, server) = socket_pair().await;
        let endpoint = MockBuilder::loopback("copier-echo").open().unwrap();

        let copier = tokio::spawn(handle_connection(server, endpoint.link()));

        client.write_all(b"PING").await.unwrap();

        let mut buf = [0; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PING");

        endpoint.close().await;

        let report = timeout(Duration::from_secs(5), copier)
            .await
            .unwrap()
            .unwrap();
        assert!(report.outcome.is_ok());
        assert_eq!(report.to_serial, 4);
        assert_eq!(report.to_client, 4);
    }

    #[tokio::test]
    async fn reply_after_half_close_reaches_client() {
        let (mut client, server) = socket_pair().await;
        let (builder, mut device) = MockBuilder::with_device("copier-half-close");
        let endpoint = builder.open().unwrap();

        let copier = tokio::spawn(handle_connection(server, endpoint.link()));

        client.write_all(b"PING").await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0; 4];
        timeout(Duration::from_secs(5), device.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PING");

        // The device answers only after the client is done sending.
        tokio::time::sleep(Duration::from_millis(100)).await;
        device.write_all(b"PONG").await.unwrap();

        let mut buf = [0; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PONG");

        endpoint.close().await;

        let report = timeout(Duration::from_secs(5), copier)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.outcome, CopyOutcome::ClosedByPeer));
        assert_eq!(report.to_serial, 4);
        assert_eq!(report.to_client, 4);

        let mut rest = vec![];
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_going_away_ends_connection() {
        let (mut client, server) = socket_pair().await;
        let (builder, mut device) = MockBuilder::with_device("copier-gone");
        let endpoint = builder.open().unwrap();

        let mut copier = tokio::spawn(handle_connection(server, endpoint.link()));

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0; 2];
        timeout(Duration::from_secs(5), device.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        drop(client);

        // Serial output makes the copier find out the client is gone.
        let report = timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    report = &mut copier => break report.unwrap(),
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {
                        device.write_all(b"tick").await.unwrap();
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(report.to_serial, 2);
        assert!(!endpoint.is_closed());
    }

    #[tokio::test]
    async fn serial_close_ends_connection() {
        let (mut client, server) = socket_pair().await;
        let (builder, mut device) = MockBuilder::with_device("copier-serial-close");
        let endpoint = builder.open().unwrap();

        let copier = tokio::spawn(handle_connection(server, endpoint.link()));

        device.write_all(b"bye").await.unwrap();

        let mut buf = [0; 3];
        timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"bye");

        endpoint.close().await;

        let report = timeout(Duration::from_secs(5), copier)
            .await
            .unwrap()
            .unwrap();
        assert!(report.outcome.is_ok());
        assert_eq!(report.to_client, 3);

        // The client sees end of file.
        let mut rest = vec![];
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
