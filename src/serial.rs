use bytes::Bytes;

/// The serial port structure.
pub mod serial_port;

/// The message data type used for serial bytes.
pub type SerialMessageBytes = Bytes;

/// A serial port present on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailablePort {
    /// Path or name to pass as the port name.
    pub name: String,

    /// What kind of port it is, e.g. USB with vendor info.
    pub kind: String,
}

/// The serial ports found on this machine.
pub fn available_ports() -> Result<Vec<AvailablePort>, serialport::Error> {
    let ports = serialport::available_ports()?
        .into_iter()
        .map(|port| AvailablePort {
            kind: describe(&port.port_type),
            name: port.port_name,
        })
        .collect();

    Ok(ports)
}

fn describe(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            let mut s = format!("USB {:04x}:{:04x}", usb.vid, usb.pid);

            if let Some(manufacturer) = &usb.manufacturer {
                s += &format!(" {manufacturer}");
            }
            if let Some(product) = &usb.product {
                s += &format!(" {product}");
            }

            s
        }
        serialport::SerialPortType::PciPort => "PCI".into(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth".into(),
        serialport::SerialPortType::Unknown => "Unknown".into(),
    }
}
