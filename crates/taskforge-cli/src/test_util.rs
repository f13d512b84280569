//! Test-only helpers shared across this crate's unit tests.

use std::sync::{Mutex, OnceLock};

/// Serializes tests that mutate process-global environment variables
/// (`TASKFORGE_DATABASE_URL`, `TASKFORGE_CREDENTIAL_SECRET`, `HOME`,
/// `XDG_CONFIG_HOME`), which would otherwise race under the default
/// multi-threaded test runner.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
