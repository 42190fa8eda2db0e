//! Packet capture capability boundary.
//!
//! The router core never talks to pcap, tap devices, or any other capture
//! backend directly. It depends on exactly two operations: read one frame,
//! write one frame. Backends are selected at startup and injected; the
//! forwarding path never branches on backend type.

use std::io;
use std::sync::mpsc;
use std::sync::Mutex;

/// Blocking frame source. One call, one frame.
pub trait PacketSource: Send {
    fn read_packet(&mut self) -> io::Result<Vec<u8>>;
}

/// Frame sink for injecting frames into the local network.
pub trait PacketSink: Send + Sync {
    fn write_packet(&self, frame: &[u8]) -> io::Result<()>;
}

/// In-memory capture device backed by channels.
///
/// Used by tests and by daemon runs without a capture interface: frames
/// pushed through [`MemoryDevice::inject`] appear on the source side, and
/// frames the router writes are collected on a channel the test can drain.
pub struct MemoryDevice {
    /// Dropped once the device starts serving as a source, so `recv`
    /// can observe all external injector handles going away.
    inject_tx: Option<mpsc::Sender<Vec<u8>>>,
    source_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    sink_tx: mpsc::Sender<Vec<u8>>,
}

impl MemoryDevice {
    /// Create a device plus the receiver that observes written frames.
    pub fn new() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (inject_tx, source_rx) = mpsc::channel();
        let (sink_tx, sink_rx) = mpsc::channel();
        (
            Self {
                inject_tx: Some(inject_tx),
                source_rx: Mutex::new(source_rx),
                sink_tx,
            },
            sink_rx,
        )
    }

    /// Make a frame available to the next `read_packet` call.
    pub fn inject(&self, frame: Vec<u8>) {
        // Receiver dropped means the router is shutting down; nothing to do.
        if let Some(tx) = &self.inject_tx {
            let _ = tx.send(frame);
        }
    }

    /// A handle for injecting frames from another thread.
    pub fn injector(&self) -> mpsc::Sender<Vec<u8>> {
        self.inject_tx
            .as_ref()
            .expect("injector taken after the device became a source")
            .clone()
    }

    /// A standalone sink handle writing to the same observer channel,
    /// so the source and sink halves can be owned separately.
    pub fn sink(&self) -> MemorySink {
        MemorySink {
            tx: self.sink_tx.clone(),
        }
    }
}

/// Detached sink half of a [`MemoryDevice`].
#[derive(Clone)]
pub struct MemorySink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl PacketSink for MemorySink {
    fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "capture sink closed"))
    }
}

impl PacketSource for MemoryDevice {
    fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        // Relinquish the internal inject handle: from here the channel
        // stays open only while external injector handles are alive, so
        // dropping them unblocks `recv` and lets the sniffer task exit.
        self.inject_tx = None;
        let rx = self
            .source_rx
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture source poisoned"))?;
        rx.recv()
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "capture source closed"))
    }
}

impl PacketSink for MemoryDevice {
    fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
        self.sink_tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "capture sink closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_device_roundtrip() {
        let (mut dev, written) = MemoryDevice::new();
        dev.inject(vec![1, 2, 3]);
        assert_eq!(dev.read_packet().unwrap(), vec![1, 2, 3]);

        dev.write_packet(&[4, 5, 6]).unwrap();
        assert_eq!(written.recv().unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn test_sink_fails_when_observer_dropped() {
        let (dev, written) = MemoryDevice::new();
        drop(written);
        assert!(dev.write_packet(&[1]).is_err());
    }
}
