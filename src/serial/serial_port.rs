use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{info, info_span};

use crate::{
    config::{DataBits, Parity, SerialConfig, StopBits},
    endpoint::{EndpointHandle, EndpointId, OpenEndpoint},
    error::Error,
};

/// Builder for a serial port backed [`EndpointHandle`].
#[derive(Debug, Clone)]
pub struct SerialPortBuilder {
    path: String,
    config: SerialConfig,
}

impl SerialPortBuilder {
    /// Start a new builder.
    /// The tty should likely be along the lines of `/dev/ttyACMx` on unix, and `COMx` on Windows.
    pub fn new(tty: &str) -> Self {
        Self {
            path: tty.to_string(),
            config: SerialConfig::default(),
        }
    }

    /// Use this line configuration instead of the default.
    pub fn set_config(mut self, config: SerialConfig) -> Self {
        self.config = config;
        self
    }
}

fn driver_settings(
    path: &str,
    config: &SerialConfig,
) -> Result<(tokio_serial::DataBits, tokio_serial::Parity, tokio_serial::StopBits), Error> {
    let unsupported = |setting: String| Error::Unsupported {
        path: path.into(),
        setting,
    };

    let data_bits = match config.data_bits() {
        DataBits::Five => tokio_serial::DataBits::Five,
        DataBits::Six => tokio_serial::DataBits::Six,
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    };

    let parity = match config.parity() {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
        parity @ (Parity::Mark | Parity::Space) => {
            return Err(unsupported(format!("parity {parity}")))
        }
    };

    let stop_bits = match config.stop_bits() {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
        StopBits::OnePointFive => return Err(unsupported("1.5 stop bits".into())),
    };

    Ok((data_bits, parity, stop_bits))
}

fn try_create_serial_port(path: &str, config: &SerialConfig) -> Result<SerialStream, Error> {
    let (data_bits, parity, stop_bits) = driver_settings(path, config)?;

    let open_error = |source| Error::SerialOpen {
        path: path.into(),
        source,
    };

    let mut serial_stream = tokio_serial::new(path, config.baud_rate())
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(open_error)?;

    serial_stream
        .write_request_to_send(config.rts())
        .map_err(open_error)?;
    serial_stream
        .write_data_terminal_ready(config.dtr())
        .map_err(open_error)?;

    Ok(serial_stream)
}

impl OpenEndpoint for SerialPortBuilder {
    fn id(&self) -> EndpointId {
        EndpointId::tty(&self.path)
    }

    fn open(self) -> Result<EndpointHandle, Error> {
        info!(%self.path, %self.config, "Opening serial port");

        let serial_stream = try_create_serial_port(&self.path, &self.config)?;

        info!(%self.path, "Opened serial port");

        let span = info_span!("tty", %self.path);

        Ok(EndpointHandle::spawn(self.id(), serial_stream, span))
    }
}
