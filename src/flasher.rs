//! The protocol driver on top of transport + codec: connect handshake
//! and identity read, state-byte polling, SRAM write staging, sector
//! commit, erase, NVR read/write, lockbit read/write, on-chip CRC
//! trigger, and full-image verify.
//!
//! Translated from `original_source/src/flasher.cpp`, one private method
//! at a time, preserving its timing and retry budget (§5) and the two
//! open questions from §9 that must not be silently "fixed": the
//! CRC-32 trailer byte order (Open Question 1, `prepare_image` below)
//! and the `expected = false` polling semantics after the signature read
//! (Open Question 2, `read_signature` below).

use std::thread;
use std::time::Duration;

use crate::codec::{commands, CommandFrame, StateByte};
use crate::crc::crc32;
use crate::error::{FlashError, FlashResult};
use crate::nvr::{LOCKBITS_LEN, NVR_LEN, NVR_START, NVR_STOP};
use crate::transport::Transport;

const POLLING_TIMEOUT_MS: u64 = 100;
const RETRY_COUNT: u32 = 50;
const CONNECT_COUNT: u32 = 4;
pub const SECTOR_SIZE: usize = 2048;
pub const MAX_SECTORS: usize = 64;
const SIGNATURE_BYTES: u8 = 7;

/// Size of a fully padded, CRC-trailed flash image.
pub const IMAGE_LEN: usize = MAX_SECTORS * SECTOR_SIZE;

fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// The protocol driver. Owns the transport exclusively; NVR/flash byte
/// vectors are owned by the caller and passed in by reference.
pub struct Flasher<T: Transport> {
    transport: T,
    image: Vec<u8>,
    signature: Vec<u8>,
}

impl<T: Transport> Flasher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            image: Vec::new(),
            signature: Vec::new(),
        }
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn write_cmd(&mut self, context: &'static str, frame: CommandFrame) -> FlashResult<()> {
        log::debug!("Flasher: {context}");
        if self.transport.write_cmd(frame)? {
            Ok(())
        } else {
            Err(FlashError::EchoMismatch {
                sent: frame,
                context,
            })
        }
    }

    fn read_cmd(&mut self, context: &'static str, frame: CommandFrame) -> FlashResult<CommandFrame> {
        log::debug!("Flasher: {context}");
        self.transport.read_cmd(frame)
    }

    fn state_byte(&mut self) -> FlashResult<StateByte> {
        let reply = self.read_cmd("Get state", commands::CHECK_STATE)?;
        Ok(StateByte(reply.as_bytes()[3]))
    }

    /// Poll up to `retry` times, 100 ms apart, until `(state & mask) ==
    /// mask` equals `expected`. Returns whether that condition was
    /// observed within the retry budget.
    fn check_state(&mut self, retry: u32, mask: u8, expected: bool) -> FlashResult<bool> {
        for _ in 0..retry {
            let state = self.state_byte()?;
            if state.masked(mask) == expected {
                return Ok(true);
            }
            sleep_ms(POLLING_TIMEOUT_MS);
        }
        Ok(false)
    }

    fn require_state(&mut self, retry: u32, mask: u8, expected: bool, context: &'static str) -> FlashResult<()> {
        if self.check_state(retry, mask, expected)? {
            Ok(())
        } else {
            Err(FlashError::Protocol { context })
        }
    }

    /// Read the 7 signature bytes, then poll FLASH_BUSY until it clears.
    ///
    /// Open Question 2 (§9, preserved verbatim): this uses mask
    /// FLASH_BUSY with `expected = false`, i.e. it waits for the masked
    /// bits to be *not* set. Do not "correct" this to `true`.
    fn read_signature(&mut self) -> FlashResult<()> {
        self.signature.clear();
        for i in 0..SIGNATURE_BYTES {
            let reply = self.read_cmd("Read signature", commands::read_signature(i))?;
            self.signature.push(reply.as_bytes()[3]);
        }
        log::info!("Signature: {:02x?}", self.signature);
        self.require_state(10, StateByte::FLASH_BUSY, false, "signature read settle")
    }

    /// Connect and identify: up to `CONNECT_COUNT` handshake attempts,
    /// then the signature read.
    pub fn connect(&mut self) -> FlashResult<bool> {
        for _ in 0..CONNECT_COUNT {
            log::info!("Trying to connect");
            self.transport.write_raw(commands::ENABLE_INTERFACE.as_bytes())?;
            sleep_ms(2);
            let residual = self.transport.bytes_available()?;
            if residual == 2 || residual == 4 {
                let recv = self.transport.read_raw(residual)?;
                let offset = residual - 2;
                let enable = commands::ENABLE_INTERFACE.as_bytes();
                if recv[offset] == enable[2] && recv[offset + 1] == enable[3] {
                    self.read_signature()?;
                    return Ok(true);
                }
            }
            self.transport.write_raw(&[0])?;
            sleep_ms(POLLING_TIMEOUT_MS);
        }
        Ok(false)
    }

    fn write_single_byte(&mut self, address: u16, byte: u8) -> FlashResult<()> {
        self.write_cmd("Write single byte to SRAM", commands::write_sram(address, byte))
    }

    fn write_byte_block(&mut self, b0: u8, b1: u8, b2: u8) -> FlashResult<()> {
        self.write_cmd("Write byte block to SRAM", commands::cont_write_sram(b0, b1, b2))
    }

    /// Trigger a sector commit and poll FLASH_BUSY until it clears.
    fn commit_sector(&mut self, sector: u8, retry: u32) -> FlashResult<()> {
        self.write_cmd("Write flash", commands::write_flash_sector(sector))?;
        self.require_state(retry, StateByte::FLASH_BUSY, false, "sector commit")
    }

    /// Program one sector: skip if all-0xFF, otherwise elide the 0xFF
    /// head/tail and stage the remaining bytes as `offset` single-byte
    /// writes followed by 3-byte continuation writes, with
    /// `offset = (n - 1) % 3` so the body length is `1 + 3k`.
    fn program_sector(&mut self, sector: u8, buf: &[u8]) -> FlashResult<()> {
        let mut begin = match buf.iter().position(|&b| b != 0xFF) {
            Some(i) => i,
            None => return Ok(()), // whole sector is erased, nothing to do
        };
        let mut end = buf.len();
        while end > begin && buf[end - 1] == 0xFF {
            end -= 1;
        }

        let n = end - begin;
        let offset = (n - 1) % 3;

        for _ in 0..offset {
            self.write_single_byte(begin as u16, buf[begin])?;
            self.commit_sector(sector, RETRY_COUNT)?;
            begin += 1;
        }

        self.write_single_byte(begin as u16, buf[begin])?;
        begin += 1;

        while begin < end {
            let (b0, b1, b2) = (buf[begin], buf[begin + 1], buf[begin + 2]);
            self.write_byte_block(b0, b1, b2)?;
            begin += 3;
        }

        self.commit_sector(sector, RETRY_COUNT)
    }

    /// Pad `input` to `MAX_SECTORS*SECTOR_SIZE - 4` bytes with 0xFF and
    /// append the big-endian CRC-32 trailer of the padded payload.
    ///
    /// Open Question 1 (§9, preserved verbatim): the source computes the
    /// trailer with `(crc >> 24) & 0xFF` etc. — a right-shift-and-mask,
    /// which is what's implemented here. A left-shift variant exists in
    /// the original source as a known bug; do not introduce it.
    fn prepare_image(&mut self, input: &[u8]) {
        self.image.clear();
        self.image.extend_from_slice(input);
        self.image.resize(MAX_SECTORS * SECTOR_SIZE - 4, 0xFF);

        let crc = crc32(&self.image);
        log::info!("Calculated flash CRC: 0x{crc:08x}");
        self.image.push(((crc >> 24) & 0xFF) as u8);
        self.image.push(((crc >> 16) & 0xFF) as u8);
        self.image.push(((crc >> 8) & 0xFF) as u8);
        self.image.push((crc & 0xFF) as u8);
    }

    /// Pad, CRC-trail, and stream `flash` to the device sector by
    /// sector, then trigger the on-chip CRC check.
    pub fn write_flash(&mut self, flash: &[u8], sector_offset: usize) -> FlashResult<bool> {
        self.prepare_image(flash);
        log::info!(
            "Writing {} bytes in {} sectors",
            self.image.len(),
            MAX_SECTORS
        );
        for sector in sector_offset..MAX_SECTORS {
            log::info!("Write sector {sector}");
            let start = sector * SECTOR_SIZE;
            let chunk = self.image[start..start + SECTOR_SIZE].to_vec();
            self.program_sector(sector as u8, &chunk)?;
        }
        self.check_crc()
    }

    /// Stream the flash contents back, 32 sectors per read-start frame,
    /// discarding the first `sector_offset` sectors' worth of bytes.
    pub fn read_flash(&mut self, sector_offset: usize) -> FlashResult<Vec<u8>> {
        let mut out = Vec::with_capacity(IMAGE_LEN);
        let mut sector = 0usize;
        let mut bytes_read = 0usize;
        let offset_bytes = sector_offset * SECTOR_SIZE;

        let mut append = |out: &mut Vec<u8>, cnt: usize, byte: u8| {
            if cnt >= offset_bytes {
                out.push(byte);
            }
        };

        while sector < MAX_SECTORS {
            let reply = self.read_cmd("Read flash", commands::read_flash(sector as u8))?;
            append(&mut out, bytes_read, reply.as_bytes()[3]);
            bytes_read += 1;

            for _ in 0..(((SECTOR_SIZE * 32) - 1) / 3) {
                let reply = self.read_cmd("Read cont", commands::CONT_READ_SRAM)?;
                let bytes = reply.as_bytes();
                append(&mut out, bytes_read, bytes[1]);
                bytes_read += 1;
                append(&mut out, bytes_read, bytes[2]);
                bytes_read += 1;
                append(&mut out, bytes_read, bytes[3]);
                bytes_read += 1;
            }
            sector += 32;
        }

        Ok(out)
    }

    /// Byte-wise compare the staged image against a reread flash image,
    /// failing at the first mismatch.
    pub fn verify_flash(&self, reread: &[u8]) -> FlashResult<()> {
        for (i, (&expected, &actual)) in self.image.iter().zip(reread.iter()).enumerate() {
            if expected != actual {
                return Err(FlashError::Verify {
                    offset: i,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn erase_flash(&mut self) -> FlashResult<()> {
        self.write_cmd("Erasing flash", commands::ERASE_CHIP)?;
        self.require_state(10, StateByte::FLASH_BUSY, false, "erase chip")
    }

    /// Read the 247-byte NVR region, `NVR_START..=NVR_STOP`.
    pub fn read_nvr(&mut self) -> FlashResult<Vec<u8>> {
        let mut nvr = Vec::with_capacity(NVR_LEN);
        for addr in NVR_START..=NVR_STOP {
            let reply = self.read_cmd("Read nvr", commands::read_nvr(addr as u8))?;
            nvr.push(reply.as_bytes()[3]);
        }
        Ok(nvr)
    }

    pub fn set_nvr(&mut self, nvr: &[u8]) -> FlashResult<()> {
        if nvr.len() != NVR_LEN {
            return Err(FlashError::Format(format!(
                "NVR buffer must be {NVR_LEN} bytes, got {}",
                nvr.len()
            )));
        }
        for (i, addr) in (NVR_START..=NVR_STOP).enumerate() {
            self.write_cmd("Set nvr", commands::set_nvr(addr as u8, nvr[i]))?;
        }
        Ok(())
    }

    pub fn read_lockbits(&mut self) -> FlashResult<Vec<u8>> {
        let mut lockbits = Vec::with_capacity(LOCKBITS_LEN);
        for i in 0..LOCKBITS_LEN as u8 {
            let reply = self.read_cmd("Read lockbits", commands::read_lock_bits(i))?;
            let value = reply.as_bytes()[3];
            log::info!("Lockbyte[{i}]: 0b{value:08b}");
            lockbits.push(value);
            sleep_ms(POLLING_TIMEOUT_MS);
        }
        Ok(lockbits)
    }

    pub fn set_lockbits(&mut self, lockbits: &[u8]) -> FlashResult<()> {
        for (i, &value) in lockbits.iter().enumerate().take(LOCKBITS_LEN) {
            self.write_cmd("Write lockbits", commands::set_lock_bits(i as u8, value))?;
            sleep_ms(POLLING_TIMEOUT_MS);
        }
        Ok(())
    }

    /// Disable APM: lockbit index 8, value 0b11111001, then poll
    /// FLASH_BUSY clear.
    pub fn disable_apm(&mut self) -> FlashResult<()> {
        self.write_cmd("Disable APM", commands::set_lock_bits(8, 0b1111_1001))?;
        self.require_state(10, StateByte::FLASH_BUSY, false, "disable APM")
    }

    /// Trigger the on-chip CRC check and report its result.
    pub fn check_crc(&mut self) -> FlashResult<bool> {
        self.write_cmd("Check CRC", commands::RUN_CRC_CHECK)?;
        self.check_state(50, StateByte::CRC_BUSY, false)?;
        let state = self.state_byte()?;
        if state.masked(StateByte::CRC_DONE) {
            log::debug!("CRC check done");
            Ok(true)
        } else if state.masked(StateByte::CRC_FAILED) {
            log::debug!("CRC check failed");
            Err(FlashError::Crc)
        } else {
            log::debug!("CRC check failed (unknown)");
            Err(FlashError::Crc)
        }
    }

    /// Reset the chip. No state polling afterwards — the device
    /// restarts and cannot answer further frames.
    pub fn reset(&mut self) -> FlashResult<()> {
        self.write_cmd("Reset", commands::RESET_CHIP)
    }
}
