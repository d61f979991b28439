//! Command-line surface and the high-level orchestration sequence.
//!
//! The flag table mirrors `zft.cpp`'s `getopt` table 1:1; the run
//! sequence mirrors its `command_list` early-return loop: any failed
//! step aborts immediately rather than attempting the remaining ones.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use crate::error::FlashResult;
use crate::flasher::Flasher;
use crate::nvr::NvrRecord;
use crate::preset::Preset;
use crate::transport::{SerialTransport, Transport};

#[derive(StructOpt, Debug)]
#[structopt(name = "zwave-flash-tool")]
pub struct Opt {
    /// Serial device path, e.g. /dev/ttyUSB0
    #[structopt(short = "d", long = "device")]
    pub device: String,

    /// Flash image to write
    #[structopt(short = "f", long = "flash-in", parse(from_os_str))]
    pub flash_in: Option<PathBuf>,

    /// Path to dump the read-back flash image to
    #[structopt(short = "o", long = "flash-out", parse(from_os_str))]
    pub flash_out: Option<PathBuf>,

    /// Raw 247-byte NVR image to write
    #[structopt(short = "n", long = "nvr-in", parse(from_os_str))]
    pub nvr_in: Option<PathBuf>,

    /// Path to dump the read NVR image to
    #[structopt(short = "m", long = "nvr-out", parse(from_os_str))]
    pub nvr_out: Option<PathBuf>,

    /// NVR calibration preset, as JSON
    #[structopt(short = "p", long = "preset-in", parse(from_os_str))]
    pub preset_in: Option<PathBuf>,

    /// Path to export the current NVR calibration fields as JSON
    #[structopt(short = "j", long = "preset-out", parse(from_os_str))]
    pub preset_out: Option<PathBuf>,

    /// Draw a fresh S2 Curve25519 key pair and write it into the NVR
    #[structopt(short = "s", long = "update-s2")]
    pub update_s2: bool,

    /// Erase the chip before writing
    #[structopt(short = "e", long = "erase")]
    pub erase: bool,

    /// Clear the NVR application tail
    #[structopt(short = "r", long = "reset-nvr-app")]
    pub reset_nvr_app: bool,

    /// Serial read timeout, in tenths of a second
    #[structopt(short = "t", long = "timeout", default_value = "1")]
    pub timeout: u8,

    /// Verbosity: 0 (errors only) through 4 (trace)
    #[structopt(short = "v", long = "verbosity", default_value = "1")]
    pub verbosity: u8,
}

impl Opt {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Outer reconnect budget: `zft.cpp`'s top-level `connect()` retries its
/// 4-try handshake forever, 1 s apart, until hardware answers. A bounded
/// budget is used here instead so a CLI invocation against a genuinely
/// absent/dead device still terminates with a reported error rather than
/// hanging indefinitely (see DESIGN.md).
const RECONNECT_ATTEMPTS: u32 = 3;

/// Run the full orchestration sequence against an already-connected
/// flasher. Split out from `main` so it can be driven against a
/// `MockTransport` in tests.
pub fn run<T: Transport>(opt: &Opt, flasher: &mut Flasher<T>) -> FlashResult<()> {
    let mut connected = false;
    for attempt in 0..RECONNECT_ATTEMPTS {
        if flasher.connect()? {
            connected = true;
            break;
        }
        if attempt + 1 < RECONNECT_ATTEMPTS {
            log::warn!("Connect attempt {} failed, retrying in 1s", attempt + 1);
            thread::sleep(Duration::from_secs(1));
        }
    }
    if !connected {
        return Err(crate::error::FlashError::Protocol {
            context: "connect handshake",
        });
    }
    log::info!("Connected, signature: {:02x?}", flasher.signature());

    let mut nvr = if opt.nvr_in.is_none()
        && (opt.reset_nvr_app
            || opt.preset_in.is_some()
            || opt.update_s2
            || opt.nvr_out.is_some()
            || opt.preset_out.is_some())
    {
        let bytes = flasher.read_nvr()?;
        Some(NvrRecord::deserialize(&bytes)?)
    } else {
        None
    };

    if let Some(path) = &opt.nvr_in {
        let bytes = read_file(path)?;
        nvr = Some(NvrRecord::deserialize(&bytes)?);
    }

    if opt.reset_nvr_app {
        if let Some(record) = nvr.as_mut() {
            record.clear_application();
        }
    }

    if let Some(path) = &opt.preset_in {
        let text = read_file(path)?;
        let preset: Preset = serde_json::from_slice(&text)
            .map_err(|e| crate::error::FlashError::Format(e.to_string()))?;
        if let Some(record) = nvr.as_mut() {
            preset.apply_to(record);
        }
    }

    if opt.update_s2 {
        if let Some(record) = nvr.as_mut() {
            record.generate_and_set_s2();
        }
    }

    if opt.erase {
        flasher.erase_flash()?;
    }

    if let Some(record) = &nvr {
        flasher.set_nvr(&record.serialize())?;
    }

    if let Some(path) = &opt.flash_in {
        // Lockbits are only read/restored around a flash write, matching
        // zft.cpp's "Flashing is requested" grouping: a bare connect or a
        // standalone dump never touches them.
        let lockbits = flasher.read_lockbits()?;
        let image = read_file(path)?;
        flasher.write_flash(&image, 0)?;
        let reread = flasher.read_flash(0)?;
        flasher.verify_flash(&reread)?;
        flasher.set_lockbits(&lockbits)?;
    }

    if let Some(path) = &opt.flash_out {
        let image = flasher.read_flash(0)?;
        write_file(path, &image)?;
    }

    if let Some(path) = &opt.nvr_out {
        let bytes = flasher.read_nvr()?;
        write_file(path, &bytes)?;
    }

    if let Some(path) = &opt.preset_out {
        if let Some(record) = &nvr {
            let preset = Preset::from_nvr(record);
            let json = serde_json::to_vec_pretty(&preset)
                .map_err(|e| crate::error::FlashError::Format(e.to_string()))?;
            write_file(path, &json)?;
        }
    }

    Ok(())
}

pub fn open_transport(opt: &Opt) -> FlashResult<SerialTransport> {
    SerialTransport::open(&opt.device, opt.timeout)
}

fn read_file(path: &PathBuf) -> FlashResult<Vec<u8>> {
    fs::read(path).map_err(crate::error::FlashError::Transport)
}

fn write_file(path: &PathBuf, data: &[u8]) -> FlashResult<()> {
    fs::write(path, data).map_err(crate::error::FlashError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn minimal_opt(device: &str) -> Opt {
        Opt {
            device: device.to_string(),
            flash_in: None,
            flash_out: None,
            nvr_in: None,
            nvr_out: None,
            preset_in: None,
            preset_out: None,
            update_s2: false,
            erase: false,
            reset_nvr_app: false,
            timeout: 1,
            verbosity: 1,
        }
    }

    #[test]
    fn run_without_any_flags_only_connects() {
        // No flag requests lockbits, NVR, or flash I/O, so the only wire
        // traffic is the handshake + signature read; no lockbit reads,
        // no NVR read, and no chip reset.
        let mut t = MockTransport::new();
        t.push_reply(vec![0xAA, 0x55]);
        for _ in 0..7 {
            t.push_reply(vec![0x30, 0x00, 0xFF, 0x01]);
        }
        t.push_reply(vec![0x7F, 0xFE, 0x00, 0x00]); // signature settle poll

        let opt = minimal_opt("/dev/ttyUSB0");
        let mut flasher = Flasher::new(t);
        run(&opt, &mut flasher).unwrap();
    }

    #[test]
    fn run_fails_after_exhausting_reconnect_budget() {
        // An empty transport never produces a 2-or-4-byte handshake
        // residual, so every inner connect() try and every outer
        // reconnect attempt fails; `run` must give up and report an
        // error rather than hang.
        let t = MockTransport::new();
        let opt = minimal_opt("/dev/ttyUSB0");
        let mut flasher = Flasher::new(t);
        assert!(run(&opt, &mut flasher).is_err());
    }

    #[test]
    fn preset_out_writes_calibration_json_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let preset_path = dir.path().join("preset.json");

        // Reading a preset always re-reads the device NVR, then writes
        // the (unmodified) record straight back — mirror that round trip
        // by deriving the expected SET_NVR payload from the same
        // deserialize/serialize path `run` itself exercises.
        let device_bytes = vec![0u8; crate::nvr::NVR_LEN];
        let record = NvrRecord::deserialize(&device_bytes).unwrap();
        let write_back = record.serialize();

        let mut t = MockTransport::new();
        t.push_reply(vec![0xAA, 0x55]);
        for _ in 0..7 {
            t.push_reply(vec![0x30, 0x00, 0xFF, 0x01]);
        }
        t.push_reply(vec![0x7F, 0xFE, 0x00, 0x00]); // signature settle poll
        for addr in crate::nvr::NVR_START..=crate::nvr::NVR_STOP {
            t.push_reply(vec![0xF2, 0x00, addr as u8, 0x00]); // read NVR
        }
        for (i, addr) in (crate::nvr::NVR_START..=crate::nvr::NVR_STOP).enumerate() {
            t.push_reply(vec![0xFE, 0x00, addr as u8, write_back[i]]); // set NVR echo
        }

        let mut opt = minimal_opt("/dev/ttyUSB0");
        opt.preset_out = Some(preset_path.clone());

        let mut flasher = Flasher::new(t);
        run(&opt, &mut flasher).unwrap();

        let written = fs::read_to_string(&preset_path).unwrap();
        let preset: Preset = serde_json::from_str(&written).unwrap();
        assert_eq!(preset.rev, 0);
    }

    #[test]
    fn run_skips_device_nvr_read_when_nvr_in_is_set() {
        // preset_out alone would trigger a device NVR read, but nvr_in is
        // also set here, so the device round trip must be skipped
        // entirely in favor of the file-loaded record.
        let write_back = NvrRecord::default().serialize();

        let mut t = MockTransport::new();
        t.push_reply(vec![0xAA, 0x55]);
        for _ in 0..7 {
            t.push_reply(vec![0x30, 0x00, 0xFF, 0x01]);
        }
        t.push_reply(vec![0x7F, 0xFE, 0x00, 0x00]); // signature settle poll
        // no READ_NVR replies scripted: if `run` attempted one, the mock
        // would return an I/O error and the test would fail.
        for (i, addr) in (crate::nvr::NVR_START..=crate::nvr::NVR_STOP).enumerate() {
            t.push_reply(vec![0xFE, 0x00, addr as u8, write_back[i]]); // set_nvr echo
        }

        let dir = tempfile::tempdir().unwrap();
        let nvr_path = dir.path().join("nvr.bin");
        fs::write(&nvr_path, &write_back).unwrap();
        let preset_path = dir.path().join("preset.json");

        let mut opt = minimal_opt("/dev/ttyUSB0");
        opt.nvr_in = Some(nvr_path);
        opt.preset_out = Some(preset_path);

        let mut flasher = Flasher::new(t);
        run(&opt, &mut flasher).unwrap();
    }

    #[test]
    fn level_filter_maps_verbosity_range() {
        let mut opt = minimal_opt("/dev/ttyUSB0");
        opt.verbosity = 0;
        assert_eq!(opt.level_filter(), log::LevelFilter::Error);
        opt.verbosity = 4;
        assert_eq!(opt.level_filter(), log::LevelFilter::Trace);
        opt.verbosity = 99;
        assert_eq!(opt.level_filter(), log::LevelFilter::Trace);
    }
}
