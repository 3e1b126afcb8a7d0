//! Console collaborator contract.
//!
//! The real terminal (POSIX, ncurses, whatever) lives outside the core.
//! It feeds input bytes from its own reader thread and accepts output
//! bytes; the core additionally flips two activity flags the front-end
//! may display as panel lights.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// What the TTY device needs from a console front-end.
pub trait Console: Send {
    /// Wait up to `timeout` for an input byte. A zero timeout polls.
    fn wait_for_char(&mut self, timeout: Duration) -> Option<u8>;

    /// Emit one output byte. Must not block the emulation loop.
    fn put_char(&mut self, ch: u8);

    /// Disk read activity flag, set by the core while a read runs.
    fn disk_read_activity(&self) -> Arc<AtomicBool>;

    /// Disk write activity flag, set by the core while a write runs.
    fn disk_write_activity(&self) -> Arc<AtomicBool>;
}

/// Console over a bounded spsc channel.
///
/// The producing side is handed to whatever thread reads the real
/// terminal (or a test); output goes to any writer.
pub struct ChannelConsole {
    input: Receiver<u8>,
    output: Box<dyn Write + Send>,
    disk_read: Arc<AtomicBool>,
    disk_write: Arc<AtomicBool>,
}

impl ChannelConsole {
    /// Create a console writing to `output`; the returned sender feeds
    /// its input side.
    #[must_use]
    pub fn new(output: Box<dyn Write + Send>) -> (Self, SyncSender<u8>) {
        let (tx, rx) = sync_channel(256);
        (
            Self {
                input: rx,
                output,
                disk_read: Arc::new(AtomicBool::new(false)),
                disk_write: Arc::new(AtomicBool::new(false)),
            },
            tx,
        )
    }
}

impl Console for ChannelConsole {
    fn wait_for_char(&mut self, timeout: Duration) -> Option<u8> {
        if timeout.is_zero() {
            match self.input.try_recv() {
                Ok(byte) => Some(byte),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            }
        } else {
            self.input.recv_timeout(timeout).ok()
        }
    }

    fn put_char(&mut self, ch: u8) {
        let _ = self.output.write_all(&[ch]);
        let _ = self.output.flush();
    }

    fn disk_read_activity(&self) -> Arc<AtomicBool> {
        self.disk_read.clone()
    }

    fn disk_write_activity(&self) -> Arc<AtomicBool> {
        self.disk_write.clone()
    }
}

/// Shared output sink for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_returns_queued_bytes_in_order() {
        let (mut console, tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        tx.send(b'h').expect("send");
        tx.send(b'i').expect("send");
        assert_eq!(console.wait_for_char(Duration::ZERO), Some(b'h'));
        assert_eq!(console.wait_for_char(Duration::ZERO), Some(b'i'));
        assert_eq!(console.wait_for_char(Duration::ZERO), None);
    }

    #[test]
    fn timeout_expires_without_input() {
        let (mut console, _tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        assert_eq!(console.wait_for_char(Duration::from_millis(5)), None);
    }

    #[test]
    fn output_reaches_the_buffer() {
        let buffer = OutputBuffer::new();
        let (mut console, _tx) = ChannelConsole::new(Box::new(buffer.clone()));
        console.put_char(b'A');
        console.put_char(b'B');
        assert_eq!(buffer.contents(), b"AB");
    }

    #[test]
    fn activity_flags_are_shared() {
        use std::sync::atomic::Ordering;
        let (console, _tx) = ChannelConsole::new(Box::new(OutputBuffer::new()));
        let flag = console.disk_read_activity();
        flag.store(true, Ordering::Relaxed);
        assert!(console.disk_read_activity().load(Ordering::Relaxed));
    }
}
