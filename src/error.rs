//! Typed errors for the device-protocol engine.
//!
//! Mirrors the taxonomy the original C++ tool reported as plain log
//! lines: a failed echo check, a state-byte poll that never reached the
//! expected condition, a verify mismatch, an on-chip CRC failure, or a
//! malformed NVR/preset buffer.

use crate::codec::CommandFrame;

pub type FlashResult<T> = Result<T, FlashError>;

#[derive(thiserror::Error, Debug)]
pub enum FlashError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("command echo mismatch: sent {sent}, step: {context}")]
    EchoMismatch {
        sent: CommandFrame,
        context: &'static str,
    },

    #[error("protocol error: state condition not reached within retry budget ({context})")]
    Protocol { context: &'static str },

    #[error("verify failed at offset {offset}: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Verify {
        offset: usize,
        expected: u8,
        actual: u8,
    },

    #[error("on-chip CRC check failed")]
    Crc,

    #[error("format error: {0}")]
    Format(String),
}
