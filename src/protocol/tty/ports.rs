use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEntry {
    pub port_name: String,
    pub port_type: String,
}

/// Lower sorts first: USB adapters, then ACM devices, then on-board UARTs.
pub fn port_priority(name: &str) -> i32 {
    let n = name.to_lowercase();
    if n.contains("ttyusb") || n.contains("usb") {
        0
    } else if n.contains("acm") {
        1
    } else if n.contains("ttys") || n.contains("serial") || n.starts_with("com") {
        2
    } else {
        10
    }
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => format!(
            "usb vid:{:04x} pid:{:04x}{}",
            info.vid,
            info.pid,
            info.product
                .as_deref()
                .map(|p| format!(" ({p})"))
                .unwrap_or_default()
        ),
        SerialPortType::PciPort => "pci".to_string(),
        SerialPortType::BluetoothPort => "bluetooth".to_string(),
        SerialPortType::Unknown => "unknown".to_string(),
    }
}

pub(crate) fn sort_and_dedup(raw: Vec<SerialPortInfo>) -> Vec<PortEntry> {
    let mut seen = HashSet::new();
    let mut ports: Vec<PortEntry> = raw
        .into_iter()
        .filter(|p| seen.insert(p.port_name.to_lowercase()))
        .map(|p| PortEntry {
            port_type: describe(&p.port_type),
            port_name: p.port_name,
        })
        .collect();
    ports.sort_by(|a, b| {
        port_priority(&a.port_name)
            .cmp(&port_priority(&b.port_name))
            .then_with(|| a.port_name.cmp(&b.port_name))
    });
    ports
}

/// Serial ports present on this machine, USB adapters first.
pub fn available_ports_sorted() -> Vec<PortEntry> {
    match serialport::available_ports() {
        Ok(raw) => sort_and_dedup(raw),
        Err(err) => {
            log::warn!("failed to enumerate serial ports: {err}");
            Vec::new()
        }
    }
}
