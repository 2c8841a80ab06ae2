use std::{fmt::Display, io};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Instrument, Span};

use crate::{error::Error, serial::SerialMessageBytes};

/// How many reads from the wire may be queued per connection
/// before that connection is considered lagging.
pub(crate) const FROM_WIRE_CAPACITY: usize = 1024;

/// How many writes may be queued towards the wire before writers wait.
pub(crate) const TO_WIRE_CAPACITY: usize = 64;

const READ_CHUNK: usize = 4096;

/// The serial port a bridge is attached to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub enum EndpointId {
    /// A tty/COM endpoint.
    Tty(String),

    /// An in-memory loopback device.
    /// Anything written to it is read back.
    Mock(String),
}

impl EndpointId {
    /// A new TTY endpoint identifier.
    pub fn tty(tty: &str) -> Self {
        Self::Tty(tty.into())
    }

    /// A id for a mock endpoint.
    pub fn mock(name: &str) -> Self {
        Self::Mock(name.into())
    }
}

impl Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointId::Tty(tty) => {
                // Reduce log verbosity
                let tty = tty.strip_prefix("/dev/serial/by-id/").unwrap_or(tty);

                write!(f, "tty: {tty}")
            }
            EndpointId::Mock(mock) => write!(f, "mock: {mock}"),
        }
    }
}

/// Something which can be opened into a running [`EndpointHandle`].
pub trait OpenEndpoint {
    /// The endpoint this will open.
    fn id(&self) -> EndpointId;

    /// Open the endpoint and start the task driving it.
    ///
    /// Must be called from within a Tokio runtime.
    fn open(self) -> Result<EndpointHandle, Error>;
}

/// An open endpoint.
///
/// A single task owns the underlying byte stream.
/// Everything read from it is broadcast to all [`SerialLink`]s,
/// everything sent through a link is written to it.
///
/// Dropping the handle without [`EndpointHandle::close`] also stops the task.
#[derive(Debug)]
pub struct EndpointHandle {
    id: EndpointId,
    task: Option<JoinHandle<()>>,
    to_wire: mpsc::Sender<SerialMessageBytes>,
    from_wire: broadcast::Sender<SerialMessageBytes>,
    closed: CancellationToken,
}

impl EndpointHandle {
    pub(crate) fn spawn<S>(id: EndpointId, stream: S, span: Span) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (to_wire, to_wire_receiver) = mpsc::channel(TO_WIRE_CAPACITY);
        let (from_wire, _) = broadcast::channel(FROM_WIRE_CAPACITY);
        let closed = CancellationToken::new();

        let task = tokio::spawn(
            drive(stream, to_wire_receiver, from_wire.clone(), closed.clone()).instrument(span),
        );

        Self {
            id,
            task: Some(task),
            to_wire,
            from_wire,
            closed,
        }
    }

    /// A new link for reading and writing this endpoint.
    ///
    /// Only bytes read from the wire after this call are seen by the link.
    pub fn link(&self) -> SerialLink {
        SerialLink {
            reader: SerialReader {
                from_wire: self.from_wire.subscribe(),
                closed: self.closed.clone(),
            },
            writer: SerialWriter {
                to_wire: self.to_wire.clone(),
                closed: self.closed.clone(),
            },
        }
    }

    /// True if the endpoint stopped, either by [`EndpointHandle::close`] or by
    /// the underlying stream failing.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop the endpoint and wait until the underlying stream is released.
    ///
    /// Every [`SerialLink`] observes the close: pending receives end
    /// and sends fail.
    pub async fn close(mut self) {
        self.closed.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(?e, endpoint = %self.id, "Endpoint task did not end cleanly");
            }
        }

        debug!(endpoint = %self.id, "Endpoint closed");
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn drive<S>(
    mut stream: S,
    mut to_wire: mpsc::Receiver<SerialMessageBytes>,
    from_wire: broadcast::Sender<SerialMessageBytes>,
    closed: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!("Asked to close");
                break;
            }
            message = to_wire.recv() => {
                let Some(message) = message else { break };

                let written = tokio::select! {
                    _ = closed.cancelled() => break,
                    written = stream.write_all(&message) => written,
                };

                if let Err(e) = written {
                    error!(?e, "Serial port error in write, closing");
                    break;
                }

                trace!("Wrote {} byte(s) to wire", message.len());
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        warn!("Serial port reached end of stream, closing");
                        break;
                    }
                    Ok(n) => {
                        let message = buf.split().freeze();
                        buf.reserve(READ_CHUNK);

                        match from_wire.send(message) {
                            Ok(listeners) => {
                                trace!("Broadcasted {n} byte(s) to {listeners} listener(s)")
                            }
                            Err(_) => {
                                trace!("No listeners, dropped {n} byte(s)")
                            }
                        }
                    }
                    Err(e) => {
                        error!(?e, "Serial port error in read, closing");
                        break;
                    }
                }
            }
        }
    }

    // Also covers the stream failing on its own.
    closed.cancel();

    if let Err(e) = stream.shutdown().await {
        debug!(?e, "Problem shutting down stream");
    }
}

/// One user's view of an open endpoint.
///
/// This is the only way connections touch the serial port.
/// Split it with [`SerialLink::into_split`] to read and write concurrently.
#[derive(Debug)]
pub struct SerialLink {
    reader: SerialReader,
    writer: SerialWriter,
}

impl SerialLink {
    /// See [`SerialReader::recv`].
    pub async fn recv(&mut self) -> io::Result<Option<SerialMessageBytes>> {
        self.reader.recv().await
    }

    /// See [`SerialWriter::send`].
    pub async fn send(&self, message: SerialMessageBytes) -> io::Result<()> {
        self.writer.send(message).await
    }

    /// Resolves once the endpoint is closed.
    pub async fn closed(&self) {
        self.writer.closed().await
    }

    /// True if the endpoint is closed.
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Separate reading from writing.
    pub fn into_split(self) -> (SerialReader, SerialWriter) {
        (self.reader, self.writer)
    }
}

/// The reading half of a [`SerialLink`].
#[derive(Debug)]
pub struct SerialReader {
    from_wire: broadcast::Receiver<SerialMessageBytes>,
    closed: CancellationToken,
}

impl SerialReader {
    /// The next bytes read from the wire.
    ///
    /// `Ok(None)` means the endpoint was closed.
    /// Bytes read before the close are still handed out first.
    /// Falling too far behind the wire is an error, bytes are never skipped silently.
    pub async fn recv(&mut self) -> io::Result<Option<SerialMessageBytes>> {
        tokio::select! {
            biased;

            message = self.from_wire.recv() => return map_received(message),
            _ = self.closed.cancelled() => {}
        }

        self.try_recv()
    }

    /// Bytes already read from the wire and waiting for this reader, if any.
    pub fn try_recv(&mut self) -> io::Result<Option<SerialMessageBytes>> {
        match self.from_wire.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(lagged(n)),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed) => {
                Ok(None)
            }
        }
    }
}

/// The writing half of a [`SerialLink`].
#[derive(Debug)]
pub struct SerialWriter {
    to_wire: mpsc::Sender<SerialMessageBytes>,
    closed: CancellationToken,
}

impl SerialWriter {
    /// Queue bytes to be written to the wire.
    ///
    /// Waits while the write queue is full.
    pub async fn send(&self, message: SerialMessageBytes) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(endpoint_closed());
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(endpoint_closed()),
            sent = self.to_wire.send(message) => sent.map_err(|_| endpoint_closed()),
        }
    }

    /// Resolves once the endpoint is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// True if the endpoint is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn map_received(
    message: Result<SerialMessageBytes, broadcast::error::RecvError>,
) -> io::Result<Option<SerialMessageBytes>> {
    match message {
        Ok(message) => Ok(Some(message)),
        Err(broadcast::error::RecvError::Closed) => Ok(None),
        Err(broadcast::error::RecvError::Lagged(n)) => Err(lagged(n)),
    }
}

fn lagged(n: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("fell behind the serial port, {n} message(s) lost"),
    )
}

fn endpoint_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "serial port closed")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;
    use tracing::info_span;

    use super::*;

    fn spawn_on_duplex() -> (EndpointHandle, tokio::io::DuplexStream) {
        let (ours, device) = tokio::io::duplex(1024);
        let handle = EndpointHandle::spawn(EndpointId::mock("test"), ours, info_span!("test"));

        (handle, device)
    }

    #[tokio::test]
    async fn wire_bytes_reach_every_link() {
        let (handle, mut device) = spawn_on_duplex();

        let mut first = handle.link();
        let mut second = handle.link();

        device.write_all(b"hello").await.unwrap();

        let timeout_after = Duration::from_secs(5);
        let a = timeout(timeout_after, first.recv()).await.unwrap().unwrap();
        let b = timeout(timeout_after, second.recv()).await.unwrap().unwrap();

        assert_eq!(a, Some(Bytes::from_static(b"hello")));
        assert_eq!(b, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn link_bytes_reach_wire() {
        let (handle, mut device) = spawn_on_duplex();

        handle.link().send(Bytes::from_static(b"abc")).await.unwrap();

        let mut buf = [0; 3];
        timeout(Duration::from_secs(5), device.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn close_is_seen_by_links_and_device() {
        let (handle, mut device) = spawn_on_duplex();
        let mut link = handle.link();

        handle.close().await;

        assert!(link.is_closed());
        assert_eq!(link.recv().await.unwrap(), None);
        assert_eq!(
            link.send(Bytes::from_static(b"x")).await.unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        let mut buf = [0; 1];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn device_going_away_closes_endpoint() {
        let (handle, device) = spawn_on_duplex();
        let link = handle.link();

        drop(device);

        timeout(Duration::from_secs(5), link.closed()).await.unwrap();
        assert!(handle.is_closed());
    }

    #[test]
    fn display_strips_by_id_prefix() {
        let id = EndpointId::tty("/dev/serial/by-id/usb-FTDI-if00");

        assert_eq!(id.to_string(), "tty: usb-FTDI-if00");
    }
}
