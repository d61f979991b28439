//! Serial transport: raw byte I/O plus the framed 4-byte
//! write-with-echo-check and read-with-reply primitives the protocol
//! engine is built on.
//!
//! The `Transport` trait decouples `Flasher<T>` from the real serial
//! port so the state machine can be driven against an in-memory scripted
//! mock in tests (§9: "inject a clock and a state source in tests").

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::codec::CommandFrame;
use crate::error::{FlashError, FlashResult};

/// Everything the flasher state engine needs from a serial link.
pub trait Transport {
    /// Current input queue length.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Block, polling `bytes_available` every 1 ms, until at least `n`
    /// bytes are available, then read. If more than `n` bytes are
    /// buffered when unblocked, drain everything and keep the **last**
    /// `n` bytes — a deliberate resync policy (§4.1, §9), not a general
    /// framing contract.
    fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>>;

    /// Send bytes one at a time; a short write is an I/O error.
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Write 4 bytes, wait 1 ms, read 4 bytes back. `Ok(true)` iff the
    /// reply is byte-equal to the request (command echo).
    fn write_cmd(&mut self, frame: CommandFrame) -> FlashResult<bool> {
        self.write_raw(frame.as_bytes())?;
        thread::sleep(Duration::from_millis(1));
        let reply = self.read_raw(4)?;
        let mut got = CommandFrame::default();
        got.as_mut_bytes().copy_from_slice(&reply);
        Ok(frame == got)
    }

    /// Write 4 bytes, wait 1 ms, read 4 bytes back as the reply (byte 3
    /// typically carries the requested datum).
    fn read_cmd(&mut self, frame: CommandFrame) -> FlashResult<CommandFrame> {
        self.write_raw(frame.as_bytes())?;
        thread::sleep(Duration::from_millis(1));
        let reply = self.read_raw(4)?;
        let mut got = CommandFrame::default();
        got.as_mut_bytes().copy_from_slice(&reply);
        Ok(got)
    }
}

/// If more than `n` bytes were buffered when `read_raw` unblocked, keep
/// only the trailing `n` bytes. The device always answers the most
/// recent command last, so discarding the head is the correct resync
/// when an earlier partial write left stale bytes in the queue.
fn keep_tail(buf: Vec<u8>, n: usize) -> Vec<u8> {
    if buf.len() <= n {
        buf
    } else {
        buf[buf.len() - n..].to_vec()
    }
}

/// Real transport over a host serial port, opened 115200-8-N-2, no flow
/// control, raw mode.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Open `path` at 115200-8-N-2, no flow control, raw (non-canonical)
    /// mode. `timeout` is in tenths of a second, matching the original's
    /// `VTIME` unit.
    ///
    /// The teacher's `ttywrite` configures the port through the `serial`
    /// crate (`SerialPortSettings`/`SerialDevice`), but that crate has no
    /// input-queue-length primitive, which `bytes_available` depends on.
    /// `serialport::SerialPort::bytes_to_read()` wraps the same
    /// `FIONREAD` ioctl the original C++ uses directly, so this swaps in
    /// `serialport` for the transport concern only (see DESIGN.md).
    pub fn open(path: &str, timeout: u8) -> FlashResult<Self> {
        let port = serialport::new(path, 115_200)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(u64::from(timeout) * 100))
            .open()?;
        Ok(Self { port })
    }
}

fn serialport_err(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let n = self.port.bytes_to_read().map_err(serialport_err)? as usize;
        log::debug!("Bytes available {n}");
        Ok(n)
    }

    fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut bytes = self.bytes_available()?;
        while bytes < n {
            thread::sleep(Duration::from_millis(1));
            bytes = self.bytes_available()?;
        }
        let mut buf = vec![0u8; bytes];
        self.port.read_exact(&mut buf)?;
        Ok(keep_tail(buf, n))
    }

    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        for byte in buf {
            let written = self.port.write(std::slice::from_ref(byte))?;
            if written != 1 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
            }
        }
        Ok(())
    }
}

impl From<serialport::Error> for FlashError {
    fn from(err: serialport::Error) -> Self {
        FlashError::Transport(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

#[cfg(test)]
pub mod mock {
    //! A scripted in-memory transport used to drive the protocol engine
    //! deterministically in tests, without real hardware or real sleeps.

    use super::*;
    use std::collections::VecDeque;

    /// Replies the mock will hand back, one 4-byte frame per
    /// `read_raw`/`write_cmd`/`read_cmd` call.
    pub struct MockTransport {
        pub replies: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                replies: VecDeque::new(),
                sent: Vec::new(),
            }
        }

        pub fn push_reply(&mut self, bytes: impl Into<Vec<u8>>) {
            self.replies.push_back(bytes.into());
        }
    }

    impl Transport for MockTransport {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.replies.front().map_or(0, |r| r.len()))
        }

        fn read_raw(&mut self, n: usize) -> io::Result<Vec<u8>> {
            let reply = self
                .replies
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted reply"))?;
            Ok(super::keep_tail(reply, n))
        }

        fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
            self.sent.push(buf.to_vec());
            Ok(())
        }
    }
}
