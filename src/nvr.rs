//! The NVR structured record: lockbits, calibration/identity fields, the
//! S2 Curve25519 key pair, and the inner CRC-16 that protects them.
//!
//! Translated field-by-field from `original_source/inc/nvr.hpp`'s
//! `nvr_config_t`/`nvr_t` structs. Deliberately *not* a `#[repr(C)]`
//! struct punned onto the wire bytes — §9 calls out that the original's
//! direct in-memory layout dump is exactly the kind of implicit-padding
//! trap a portable rewrite must avoid, so every field here is serialized
//! explicitly at a named offset and the offsets are unit-tested.

use crate::crc::crc16;
use crate::error::{FlashError, FlashResult};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

pub const NVR_START: u16 = 0x09;
pub const NVR_STOP: u16 = 0xFF;

pub const LOCKBITS_LEN: usize = 9;
const PADDING1_LEN: usize = 7;
const SAW_CF_LEN: usize = 3;
const NVM_SIZE_LEN: usize = 2;
const NVM_PAGE_SIZE_LEN: usize = 2;
const UUID_LEN: usize = 16;
const USBID_LEN: usize = 2;
pub const S2_KEY_LEN: usize = 32;
const PADDING2_LEN: usize = 11;
const CRC_LEN: usize = 2;

/// Size of the `crc_protected` sub-record: the range the inner CRC-16
/// actually covers.
const CRC_PROTECTED_LEN: usize = 4 // rev, c_cal, pin_swap, nvm_cs
    + SAW_CF_LEN + 1 + 1 // saw_cf, saw_bBandwidth, nvm_type
    + NVM_SIZE_LEN + NVM_PAGE_SIZE_LEN
    + UUID_LEN
    + USBID_LEN * 2 // usb_vid, usb_pid
    + 2 // tx_cal_1, tx_cal_2
    + S2_KEY_LEN * 2 // s2_public_key, s2_private_key
    + PADDING2_LEN;

/// Size of the fixed-layout `config` header (everything before the
/// variable-length `application` tail).
const CONFIG_LEN: usize = LOCKBITS_LEN + PADDING1_LEN + CRC_PROTECTED_LEN + CRC_LEN + 1;

/// Total serialized size of the NVR record: the inclusive device address
/// range `NVR_START..=NVR_STOP` is exactly 247 bytes. The application
/// tail fills whatever config doesn't use.
pub const NVR_LEN: usize = (NVR_STOP - NVR_START + 1) as usize;
const APPLICATION_LEN: usize = NVR_LEN - CONFIG_LEN;

// Offsets into the serialized buffer, in declaration order.
const OFF_LOCKBITS: usize = 0;
const OFF_PADDING1: usize = OFF_LOCKBITS + LOCKBITS_LEN;
const OFF_CRC_PROTECTED: usize = OFF_PADDING1 + PADDING1_LEN;
const OFF_REV: usize = OFF_CRC_PROTECTED;
const OFF_C_CAL: usize = OFF_REV + 1;
const OFF_PIN_SWAP: usize = OFF_C_CAL + 1;
const OFF_NVM_CS: usize = OFF_PIN_SWAP + 1;
const OFF_SAW_CF: usize = OFF_NVM_CS + 1;
const OFF_SAW_BANDWIDTH: usize = OFF_SAW_CF + SAW_CF_LEN;
const OFF_NVM_TYPE: usize = OFF_SAW_BANDWIDTH + 1;
const OFF_NVM_SIZE: usize = OFF_NVM_TYPE + 1;
const OFF_NVM_PAGE_SIZE: usize = OFF_NVM_SIZE + NVM_SIZE_LEN;
const OFF_UUID: usize = OFF_NVM_PAGE_SIZE + NVM_PAGE_SIZE_LEN;
const OFF_USB_VID: usize = OFF_UUID + UUID_LEN;
const OFF_USB_PID: usize = OFF_USB_VID + USBID_LEN;
const OFF_TX_CAL_1: usize = OFF_USB_PID + USBID_LEN;
const OFF_TX_CAL_2: usize = OFF_TX_CAL_1 + 1;
const OFF_S2_PUBLIC: usize = OFF_TX_CAL_2 + 1;
const OFF_S2_PRIVATE: usize = OFF_S2_PUBLIC + S2_KEY_LEN;
const OFF_PADDING2: usize = OFF_S2_PRIVATE + S2_KEY_LEN;
const OFF_CRC: usize = OFF_PADDING2 + PADDING2_LEN;
const OFF_HW_VERSION: usize = OFF_CRC + CRC_LEN;
const OFF_APPLICATION: usize = OFF_HW_VERSION + 1;

/// The 247-byte NVR record, decoded from (or destined for) device
/// addresses `NVR_START..=NVR_STOP`.
#[derive(Clone, PartialEq, Eq)]
pub struct NvrRecord {
    pub lockbits: [u8; LOCKBITS_LEN],
    pub rev: u8,
    pub c_cal: u8,
    pub pin_swap: u8,
    pub nvm_cs: u8,
    pub saw_cf: [u8; SAW_CF_LEN],
    pub saw_b_bandwidth: u8,
    pub nvm_type: u8,
    pub nvm_size: [u8; NVM_SIZE_LEN],
    pub nvm_page_size: [u8; NVM_PAGE_SIZE_LEN],
    pub uuid: [u8; UUID_LEN],
    pub usb_vid: [u8; USBID_LEN],
    pub usb_pid: [u8; USBID_LEN],
    pub tx_cal_1: u8,
    pub tx_cal_2: u8,
    pub s2_public_key: [u8; S2_KEY_LEN],
    pub s2_private_key: [u8; S2_KEY_LEN],
    pub crc: [u8; CRC_LEN],
    pub hw_version: u8,
    pub application: Vec<u8>,
}

impl Default for NvrRecord {
    fn default() -> Self {
        Self {
            lockbits: [0xFF; LOCKBITS_LEN],
            rev: 0,
            c_cal: 0,
            pin_swap: 0,
            nvm_cs: 0,
            saw_cf: [0; SAW_CF_LEN],
            saw_b_bandwidth: 0,
            nvm_type: 0,
            nvm_size: [0; NVM_SIZE_LEN],
            nvm_page_size: [0; NVM_PAGE_SIZE_LEN],
            uuid: [0; UUID_LEN],
            usb_vid: [0; USBID_LEN],
            usb_pid: [0; USBID_LEN],
            tx_cal_1: 0,
            tx_cal_2: 0,
            s2_public_key: [0; S2_KEY_LEN],
            s2_private_key: [0; S2_KEY_LEN],
            crc: [0; CRC_LEN],
            hw_version: 0,
            application: vec![0xFF; APPLICATION_LEN],
        }
    }
}

impl NvrRecord {
    /// Serialize the `crc_protected` sub-record in declaration order,
    /// exactly the range the inner CRC-16 is computed over.
    fn serialize_crc_protected(&self) -> [u8; CRC_PROTECTED_LEN] {
        let mut buf = [0u8; CRC_PROTECTED_LEN];
        let mut pos = 0;
        let mut put = |src: &[u8], pos: &mut usize| {
            buf[*pos..*pos + src.len()].copy_from_slice(src);
            *pos += src.len();
        };
        put(&[self.rev], &mut pos);
        put(&[self.c_cal], &mut pos);
        put(&[self.pin_swap], &mut pos);
        put(&[self.nvm_cs], &mut pos);
        put(&self.saw_cf, &mut pos);
        put(&[self.saw_b_bandwidth], &mut pos);
        put(&[self.nvm_type], &mut pos);
        put(&self.nvm_size, &mut pos);
        put(&self.nvm_page_size, &mut pos);
        put(&self.uuid, &mut pos);
        put(&self.usb_vid, &mut pos);
        put(&self.usb_pid, &mut pos);
        put(&[self.tx_cal_1], &mut pos);
        put(&[self.tx_cal_2], &mut pos);
        put(&self.s2_public_key, &mut pos);
        put(&self.s2_private_key, &mut pos);
        put(&[0xFFu8; PADDING2_LEN], &mut pos);
        debug_assert_eq!(pos, CRC_PROTECTED_LEN);
        buf
    }

    /// Recompute `crc` from the current `crc_protected` contents. Must be
    /// called after any mutation of a `crc_protected` field before the
    /// record is written back to the device.
    pub fn recompute_crc(&mut self) {
        let protected = self.serialize_crc_protected();
        let crc = crc16(&protected);
        self.crc = [(crc >> 8) as u8, (crc & 0xFF) as u8];
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NVR_LEN];
        buf[OFF_LOCKBITS..OFF_PADDING1].copy_from_slice(&self.lockbits);
        buf[OFF_PADDING1..OFF_CRC_PROTECTED].copy_from_slice(&[0xFFu8; PADDING1_LEN]);
        buf[OFF_CRC_PROTECTED..OFF_CRC].copy_from_slice(&self.serialize_crc_protected());
        buf[OFF_CRC..OFF_HW_VERSION].copy_from_slice(&self.crc);
        buf[OFF_HW_VERSION] = self.hw_version;
        buf[OFF_APPLICATION..].copy_from_slice(&self.application);
        debug_assert_eq!(buf.len(), NVR_LEN);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> FlashResult<Self> {
        if buf.len() != NVR_LEN {
            return Err(FlashError::Format(format!(
                "NVR buffer must be {NVR_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let mut lockbits = [0u8; LOCKBITS_LEN];
        lockbits.copy_from_slice(&buf[OFF_LOCKBITS..OFF_PADDING1]);
        let mut saw_cf = [0u8; SAW_CF_LEN];
        saw_cf.copy_from_slice(&buf[OFF_SAW_CF..OFF_SAW_BANDWIDTH]);
        let mut nvm_size = [0u8; NVM_SIZE_LEN];
        nvm_size.copy_from_slice(&buf[OFF_NVM_SIZE..OFF_NVM_PAGE_SIZE]);
        let mut nvm_page_size = [0u8; NVM_PAGE_SIZE_LEN];
        nvm_page_size.copy_from_slice(&buf[OFF_NVM_PAGE_SIZE..OFF_UUID]);
        let mut uuid = [0u8; UUID_LEN];
        uuid.copy_from_slice(&buf[OFF_UUID..OFF_USB_VID]);
        let mut usb_vid = [0u8; USBID_LEN];
        usb_vid.copy_from_slice(&buf[OFF_USB_VID..OFF_USB_PID]);
        let mut usb_pid = [0u8; USBID_LEN];
        usb_pid.copy_from_slice(&buf[OFF_USB_PID..OFF_TX_CAL_1]);
        let mut s2_public_key = [0u8; S2_KEY_LEN];
        s2_public_key.copy_from_slice(&buf[OFF_S2_PUBLIC..OFF_S2_PRIVATE]);
        let mut s2_private_key = [0u8; S2_KEY_LEN];
        s2_private_key.copy_from_slice(&buf[OFF_S2_PRIVATE..OFF_PADDING2]);
        let mut crc = [0u8; CRC_LEN];
        crc.copy_from_slice(&buf[OFF_CRC..OFF_HW_VERSION]);

        Ok(Self {
            lockbits,
            rev: buf[OFF_REV],
            c_cal: buf[OFF_C_CAL],
            pin_swap: buf[OFF_PIN_SWAP],
            nvm_cs: buf[OFF_NVM_CS],
            saw_cf,
            saw_b_bandwidth: buf[OFF_SAW_BANDWIDTH],
            nvm_type: buf[OFF_NVM_TYPE],
            nvm_size,
            nvm_page_size,
            uuid,
            usb_vid,
            usb_pid,
            tx_cal_1: buf[OFF_TX_CAL_1],
            tx_cal_2: buf[OFF_TX_CAL_2],
            s2_public_key,
            s2_private_key,
            crc,
            hw_version: buf[OFF_HW_VERSION],
            application: buf[OFF_APPLICATION..].to_vec(),
        })
    }

    /// Draw a fresh S2 Curve25519 key pair, bump `rev` to 2, and
    /// recompute `crc`. Mirrors `nvr::generate_and_set_s2` in
    /// `original_source/src/nvr.cpp`.
    pub fn generate_and_set_s2(&mut self) {
        let mut private_key = [0u8; S2_KEY_LEN];
        OsRng.fill_bytes(&mut private_key);

        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);

        self.s2_private_key = private_key;
        self.s2_public_key = public.to_bytes();
        self.rev = 2;
        self.recompute_crc();
    }

    /// Fill the application tail with 0xFF, matching
    /// `nvr::clear_application`.
    pub fn clear_application(&mut self) {
        self.application.fill(0xFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_length_is_247_bytes() {
        let record = NvrRecord::default();
        assert_eq!(record.serialize().len(), NVR_LEN);
        assert_eq!(NVR_LEN, 247);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let mut record = NvrRecord::default();
        record.uuid = [0xAB; UUID_LEN];
        record.usb_vid = [0x12, 0x34];
        record.tx_cal_1 = 7;
        record.recompute_crc();

        let bytes = record.serialize();
        let decoded = NvrRecord::deserialize(&bytes).unwrap();
        assert_eq!(decoded.uuid, record.uuid);
        assert_eq!(decoded.usb_vid, record.usb_vid);
        assert_eq!(decoded.tx_cal_1, 7);
        assert_eq!(decoded.crc, record.crc);
    }

    #[test]
    fn deserialize_rejects_wrong_length() {
        let err = NvrRecord::deserialize(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, FlashError::Format(_)));
    }

    /// NVR CRC round-trip: re-running crc16 over crc_protected after
    /// recompute_crc() must agree with the stored big-endian crc bytes.
    #[test]
    fn crc_round_trip_invariant() {
        let mut record = NvrRecord::default();
        record.nvm_type = 3;
        record.s2_public_key = [0x11; S2_KEY_LEN];
        record.recompute_crc();

        let protected = record.serialize_crc_protected();
        let expected = crc16(&protected);
        assert_eq!(record.crc, [(expected >> 8) as u8, (expected & 0xFF) as u8]);
    }

    /// Pinned golden CRC for a fixed crc_protected pattern (all zero
    /// bytes except padding2, which is always 0xFF).
    #[test]
    fn nvr_crc_known_pattern_golden() {
        let record = NvrRecord::default();
        let protected = record.serialize_crc_protected();
        assert_eq!(protected.len(), CRC_PROTECTED_LEN);
        assert_eq!(crc16(&protected), 0x86AD);
    }

    #[test]
    fn generate_and_set_s2_forces_rev_2_and_consistent_crc() {
        let mut record = NvrRecord::default();
        record.generate_and_set_s2();
        assert_eq!(record.rev, 2);

        let protected = record.serialize_crc_protected();
        let expected = crc16(&protected);
        assert_eq!(record.crc, [(expected >> 8) as u8, (expected & 0xFF) as u8]);
        assert_ne!(record.s2_private_key, [0u8; S2_KEY_LEN]);
    }

    #[test]
    fn clear_application_fills_0xff() {
        let mut record = NvrRecord::default();
        record.application = vec![0x00; APPLICATION_LEN];
        record.clear_application();
        assert!(record.application.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn offsets_match_declaration_order() {
        assert_eq!(OFF_LOCKBITS, 0);
        assert_eq!(OFF_PADDING1, 9);
        assert_eq!(OFF_CRC_PROTECTED, 16);
        assert_eq!(OFF_CRC, 126);
        assert_eq!(OFF_HW_VERSION, 128);
        assert_eq!(OFF_APPLICATION, 129);
        assert_eq!(NVR_LEN - OFF_APPLICATION, APPLICATION_LEN);
    }
}
