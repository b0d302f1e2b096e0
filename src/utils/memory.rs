use std::sync::{Mutex, OnceLock};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Resident set size of this process in bytes.
///
/// Only this process is refreshed on each call. None when the platform does
/// not report process memory.
pub fn process_rss_bytes() -> Option<u64> {
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let mut sys = SYSTEM.get_or_init(|| Mutex::new(System::new())).lock().ok()?;
    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new().with_memory());

    sys.process(pid).map(|p| p.memory()).filter(|rss| *rss > 0)
}
