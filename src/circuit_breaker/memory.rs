use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of the process's resident memory
pub trait MemoryGauge: Send + Sync {
    /// Resident set size in bytes, or `None` when unavailable
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads this process's resident memory through `sysinfo`, which accounts for
/// the host page size and works on every supported platform.
pub struct ProcessMemory {
    system: Mutex<System>,
    pid: Pid,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGauge for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let resident = system.process(self.pid)?.memory();
        // zero means the platform reported nothing usable
        (resident > 0).then_some(resident)
    }
}
