//! Число ядер CPU и память процесса для статуса движка.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::NativeError;

static DETECTED_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Количество логических ядер CPU.
pub fn cpu_cores() -> Result<usize, NativeError> {
    let cached = DETECTED_THREADS.load(Ordering::Relaxed);
    if cached > 0 {
        return Ok(cached);
    }
    let count = std::thread::available_parallelism()
        .map_err(|e| NativeError::HardwareDetectionFailed(e.to_string()))?
        .get();
    DETECTED_THREADS.store(count, Ordering::Relaxed);
    Ok(count)
}

/// Резидентная память текущего процесса в МБ. Перечитывается на каждый вызов.
pub fn process_memory_mb() -> f64 {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(_) => return 0.0,
    };
    let mut sys = sysinfo::System::new();
    if !sys.refresh_process(pid) {
        return 0.0;
    }
    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
