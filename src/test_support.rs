//! Shared helpers for tests that spawn real processes.
//!
//! The reaper collects every exited child of the test binary, including
//! children spawned by other tests running in parallel. Any test that spawns
//! a process, or starts a reaper, holds this lock for its whole body.

pub static PROCESS_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
