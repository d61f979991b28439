//! JSON import/export of the calibration subset of an NVR record.
//!
//! Only the fields a factory preset actually needs to stamp are exposed
//! here — lockbits, the S2 key pair, and the CRC are left untouched by
//! the preset round-trip and must be set through `NvrRecord` directly.

use serde::{Deserialize, Serialize};

use crate::nvr::NvrRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preset {
    pub rev: u8,
    pub c_cal: u8,
    pub pin_swap: u8,
    pub nvm_cs: u8,
    pub saw_cf: [u8; 3],
    #[serde(rename = "saw_bBandwidth")]
    pub saw_b_bandwidth: u8,
    pub nvm_type: u8,
    pub nvm_size: [u8; 2],
    pub nvm_page_size: [u8; 2],
    pub uuid: [u8; 16],
    pub usb_vid: [u8; 2],
    pub usb_pid: [u8; 2],
    pub tx_cal_1: u8,
    pub tx_cal_2: u8,
}

impl Preset {
    /// Read the calibration fields out of an NVR record for export.
    pub fn from_nvr(nvr: &NvrRecord) -> Self {
        Self {
            rev: nvr.rev,
            c_cal: nvr.c_cal,
            pin_swap: nvr.pin_swap,
            nvm_cs: nvr.nvm_cs,
            saw_cf: nvr.saw_cf,
            saw_b_bandwidth: nvr.saw_b_bandwidth,
            nvm_type: nvr.nvm_type,
            nvm_size: nvr.nvm_size,
            nvm_page_size: nvr.nvm_page_size,
            uuid: nvr.uuid,
            usb_vid: nvr.usb_vid,
            usb_pid: nvr.usb_pid,
            tx_cal_1: nvr.tx_cal_1,
            tx_cal_2: nvr.tx_cal_2,
        }
    }

    /// Stamp the calibration fields onto `nvr` and recompute its CRC.
    /// Leaves lockbits, the S2 key pair, and the application tail alone.
    pub fn apply_to(&self, nvr: &mut NvrRecord) {
        nvr.rev = self.rev;
        nvr.c_cal = self.c_cal;
        nvr.pin_swap = self.pin_swap;
        nvr.nvm_cs = self.nvm_cs;
        nvr.saw_cf = self.saw_cf;
        nvr.saw_b_bandwidth = self.saw_b_bandwidth;
        nvr.nvm_type = self.nvm_type;
        nvr.nvm_size = self.nvm_size;
        nvr.nvm_page_size = self.nvm_page_size;
        nvr.uuid = self.uuid;
        nvr.usb_vid = self.usb_vid;
        nvr.usb_pid = self.usb_pid;
        nvr.tx_cal_1 = self.tx_cal_1;
        nvr.tx_cal_2 = self.tx_cal_2;
        nvr.recompute_crc();
    }
}
