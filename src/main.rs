use structopt::StructOpt;
use zwave_flash_tool::cli::{self, Opt};
use zwave_flash_tool::Flasher;

/// Best-effort round-robin real-time scheduling hint, matching the
/// original tool's `pthread_setschedparam(SCHED_RR)` call. Flashing is
/// timing-sensitive but not timing-dependent: if this fails (no
/// permission, non-Linux), the tool still runs correctly, just without
/// the hint.
#[cfg(unix)]
fn request_realtime_priority() {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_RR);
        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
            log::debug!("Could not set SCHED_RR priority, continuing without it");
        }
    }
}

#[cfg(not(unix))]
fn request_realtime_priority() {}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    env_logger::Builder::new()
        .filter_level(opt.level_filter())
        .init();

    request_realtime_priority();

    let transport = cli::open_transport(&opt)?;
    let mut flasher = Flasher::new(transport);

    cli::run(&opt, &mut flasher)?;

    log::info!("Done");
    Ok(())
}
