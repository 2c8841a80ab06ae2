//! A mock, useful to test the bridge without an actual serial port.

use tokio::io::{self, DuplexStream};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    endpoint::{EndpointHandle, EndpointId, OpenEndpoint},
    error::Error,
};

const MOCK_BUFFER: usize = 4096;

enum Device {
    /// Echo everything written back.
    Loopback,

    /// The other end of the duplex is held by someone else.
    External(DuplexStream),

    /// Refuse to open.
    Unavailable,
}

/// Builder for an in-memory endpoint.
///
/// The endpoint side is one half of a [`tokio::io::duplex`] pipe.
/// The other half plays the part of the device at the end of the serial cable.
pub struct MockBuilder {
    name: String,
    device: Device,
}

impl MockBuilder {
    /// A mock which echoes whatever is written to it.
    pub fn loopback(name: &str) -> Self {
        Self {
            name: name.into(),
            device: Device::Loopback,
        }
    }

    /// A mock where the caller acts as the device.
    ///
    /// Bytes written to the returned stream are read from the endpoint,
    /// bytes written to the endpoint can be read from the returned stream.
    /// The stream reaches end of file once the endpoint is closed.
    pub fn with_device(name: &str) -> (Self, DuplexStream) {
        let (ours, theirs) = io::duplex(MOCK_BUFFER);

        let builder = Self {
            name: name.into(),
            device: Device::External(ours),
        };

        (builder, theirs)
    }

    /// A mock which fails to open, like a serial port which isn't plugged in.
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: name.into(),
            device: Device::Unavailable,
        }
    }
}

impl OpenEndpoint for MockBuilder {
    fn id(&self) -> EndpointId {
        EndpointId::mock(&self.name)
    }

    fn open(self) -> Result<EndpointHandle, Error> {
        let id = self.id();
        let Self { name, device } = self;

        let stream = match device {
            Device::External(stream) => stream,
            Device::Unavailable => return Err(Error::Unavailable(id.to_string())),
            Device::Loopback => {
                let (ours, device) = io::duplex(MOCK_BUFFER);

                tokio::spawn(
                    async move {
                        let (mut reader, mut writer) = io::split(device);

                        match io::copy(&mut reader, &mut writer).await {
                            Ok(bytes) => debug!("Loopback done after {bytes} byte(s)"),
                            Err(e) => warn!(?e, "Loopback stopped"),
                        }
                    }
                    .instrument(info_span!("loopback", %name)),
                );

                ours
            }
        };

        info!(%name, "Running mock");

        Ok(EndpointHandle::spawn(id, stream, info_span!("mock", %name)))
    }
}
