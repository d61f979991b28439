//! Library crate for programming and verifying the flash and NVR of a
//! Z-Wave radio module over its service bootloader's raw serial
//! protocol. See `README`/`DESIGN.md` for the wire protocol and the
//! module layout.

pub mod cli;
pub mod codec;
pub mod crc;
pub mod error;
pub mod flasher;
pub mod nvr;
pub mod preset;
pub mod transport;

pub use error::{FlashError, FlashResult};
pub use flasher::Flasher;
pub use nvr::NvrRecord;
pub use transport::{SerialTransport, Transport};
