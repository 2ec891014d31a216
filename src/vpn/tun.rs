//! The TUN device boundary. Opening and reading from a real kernel TUN
//! interface is platform-specific and declared out of scope; this trait is
//! the seam, with a capturing test double standing in for CI.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NodeError;

/// A TUN-like device: a byte-packet source/sink with an explicit
/// open/close lifecycle.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Opens the device, assigning `overlay_ip/prefix_len` to it.
    async fn open(&self, overlay_ip: std::net::Ipv4Addr, prefix_len: u8) -> Result<(), NodeError>;

    /// Starts a background reader that forwards each packet read from the
    /// device onto `tx`. Returns once reading has started; packets arrive
    /// asynchronously.
    async fn start_reading(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<(), NodeError>;

    /// Writes one IP packet to the device.
    async fn write(&self, packet: &[u8]) -> Result<(), NodeError>;

    async fn close(&self) -> Result<(), NodeError>;
}

/// An in-memory double used by tests: `write` captures bytes instead of
/// touching a kernel device, and packets can be injected as if read from
/// the device via [`NullTun::inject`].
#[derive(Default)]
pub struct NullTun {
    written: Mutex<Vec<Vec<u8>>>,
    reader: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl NullTun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written_packets(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    /// Simulates a packet arriving on the device, as if read from the
    /// kernel; delivered to whoever called `start_reading`.
    pub async fn inject(&self, packet: Vec<u8>) {
        let tx = self.reader.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(packet).await;
        }
    }
}

#[async_trait]
impl TunDevice for NullTun {
    async fn open(&self, _overlay_ip: std::net::Ipv4Addr, _prefix_len: u8) -> Result<(), NodeError> {
        Ok(())
    }

    async fn start_reading(&self, tx: mpsc::Sender<Vec<u8>>) -> Result<(), NodeError> {
        *self.reader.lock().unwrap() = Some(tx);
        Ok(())
    }

    async fn write(&self, packet: &[u8]) -> Result<(), NodeError> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), NodeError> {
        *self.reader.lock().unwrap() = None;
        Ok(())
    }
}

/// `tun` crate adapter for Linux. Builds the real device configuration;
/// actually creating the device and wiring its file descriptor into an
/// async reader/writer pair is left a stub, since that plumbing is
/// declared out of scope at this boundary.
#[cfg(target_os = "linux")]
pub struct LinuxTun {
    name: String,
}

#[cfg(target_os = "linux")]
impl LinuxTun {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn netmask(prefix_len: u8) -> std::net::Ipv4Addr {
        let bits = if prefix_len == 0 { 0u32 } else { u32::MAX << (32 - prefix_len) };
        std::net::Ipv4Addr::from(bits)
    }

    fn configuration(&self, overlay_ip: std::net::Ipv4Addr, prefix_len: u8) -> tun::Configuration {
        let mut config = tun::Configuration::default();
        config
            .name(&self.name)
            .address(overlay_ip)
            .netmask(Self::netmask(prefix_len))
            .up();
        config
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TunDevice for LinuxTun {
    async fn open(&self, overlay_ip: std::net::Ipv4Addr, prefix_len: u8) -> Result<(), NodeError> {
        let _config = self.configuration(overlay_ip, prefix_len);
        Err(NodeError::Tun(format!(
            "kernel TUN backend for device {} is not implemented in this build",
            self.name
        )))
    }

    async fn start_reading(&self, _tx: mpsc::Sender<Vec<u8>>) -> Result<(), NodeError> {
        Err(NodeError::Tun("kernel TUN backend not implemented".into()))
    }

    async fn write(&self, _packet: &[u8]) -> Result<(), NodeError> {
        Err(NodeError::Tun("kernel TUN backend not implemented".into()))
    }

    async fn close(&self) -> Result<(), NodeError> {
        Ok(())
    }
}
