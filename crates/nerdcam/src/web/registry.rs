//! Per-client process tracking
//!
//! Each streaming response registers its transcode process and holds the
//! returned [`RegisteredProcess`] for as long as it streams. Dropping the
//! guard kills the process and unregisters it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::ShutdownReport;
use crate::transcode::{TranscodeProcess, KILL_WAIT};

type Processes = HashMap<u64, Arc<TranscodeProcess>>;

#[derive(Clone, Default)]
pub struct ProcessRegistry {
    processes: Arc<Mutex<Processes>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Processes> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, process: Arc<TranscodeProcess>) -> RegisteredProcess {
        self.lock().insert(process.id(), Arc::clone(&process));
        debug!(id = process.id(), task = process.task(), "Process registered");
        RegisteredProcess {
            registry: self.clone(),
            process,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the registered processes
    pub fn active(&self) -> Vec<Arc<TranscodeProcess>> {
        self.lock().values().cloned().collect()
    }

    /// Unregister everything without killing it
    pub fn drain(&self) -> Vec<Arc<TranscodeProcess>> {
        self.lock().drain().map(|(_, p)| p).collect()
    }
}

/// Kill every process and wait (bounded) for each to exit.
pub async fn terminate(processes: Vec<Arc<TranscodeProcess>>) -> ShutdownReport {
    for process in &processes {
        process.kill();
    }

    let mut all_exited = true;
    for process in &processes {
        if tokio::time::timeout(KILL_WAIT, process.wait()).await.is_err() {
            warn!(task = process.task(), pid = process.pid(), "Process did not exit after kill");
            all_exited = false;
        }
    }

    ShutdownReport {
        terminated: processes.len(),
        all_exited,
    }
}

/// Registration guard for one per-client process
pub struct RegisteredProcess {
    registry: ProcessRegistry,
    process: Arc<TranscodeProcess>,
}

impl RegisteredProcess {
    pub fn process(&self) -> &Arc<TranscodeProcess> {
        &self.process
    }
}

impl Drop for RegisteredProcess {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.process.id());
        if self.process.is_running() {
            self.process.kill();
        }
        debug!(id = self.process.id(), task = self.process.task(), "Process unregistered");
    }
}
