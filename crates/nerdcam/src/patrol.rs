//! Preset patrol
//!
//! A background task that recalls camera presets on a timed cycle. One run at
//! a time; `stop` cancels it immediately, including mid-dwell.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::camera::{CameraControl, CgiResponse};
use crate::error::{Error, Result};
use crate::settings::{PatrolPlan, PatrolPosition};

/// Camera command that recalls a preset
pub const RECALL_COMMAND: &str = "ptzGotoPresetPoint";

/// How long `shutdown` waits for the loop to finish
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatrolStatus {
    pub running: bool,
    pub current_pos: String,
    pub cycle: u64,
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PatrolState {
    run: Option<ActiveRun>,
    current_pos: String,
    cycle: u64,
}

impl PatrolState {
    fn is_current(&self, id: u64) -> bool {
        self.run.as_ref().is_some_and(|r| r.id == id)
    }
}

pub struct PatrolController {
    camera: Arc<dyn CameraControl>,
    state: Arc<Mutex<PatrolState>>,
    next_id: AtomicU64,
}

impl PatrolController {
    pub fn new(camera: Arc<dyn CameraControl>) -> Self {
        Self {
            camera,
            state: Arc::new(Mutex::new(PatrolState::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start cycling through a snapshot of `plan`'s active positions.
    pub fn start(&self, plan: &PatrolPlan) -> Result<()> {
        let positions = plan.active_positions();
        let mut state = lock(&self.state);

        if state.run.is_some() {
            return Err(Error::conflict("Patrol already running"));
        }
        if positions.len() < 2 {
            return Err(Error::invalid(format!(
                "Need at least 2 positions with dwell > 0, have {}",
                positions.len()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        state.current_pos.clear();
        state.cycle = 0;

        info!(
            positions = ?positions.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            repeat = plan.repeat,
            "Patrol started"
        );

        let task = tokio::spawn(run_patrol(
            Arc::clone(&self.camera),
            Arc::clone(&self.state),
            id,
            cancel.clone(),
            positions,
            plan.repeat,
        ));
        state.run = Some(ActiveRun {
            id,
            cancel,
            task: Some(task),
        });
        Ok(())
    }

    /// Cancel the running patrol. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.state);
        match state.run.take() {
            Some(run) => {
                run.cancel.cancel();
                state.current_pos.clear();
                info!(cycle = state.cycle, "Patrol stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).run.is_some()
    }

    pub fn status(&self) -> PatrolStatus {
        let state = lock(&self.state);
        PatrolStatus {
            running: state.run.is_some(),
            current_pos: state.current_pos.clone(),
            cycle: state.cycle,
        }
    }

    /// Stop and wait (bounded) for the loop to exit.
    pub async fn shutdown(&self) {
        let task = {
            let mut state = lock(&self.state);
            state.current_pos.clear();
            state.run.take().and_then(|mut run| {
                run.cancel.cancel();
                run.task.take()
            })
        };
        if let Some(task) = task {
            if tokio::time::timeout(SHUTDOWN_WAIT, task).await.is_err() {
                warn!("Patrol task did not exit in time");
            }
        }
    }
}

fn lock(state: &Mutex<PatrolState>) -> MutexGuard<'_, PatrolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_patrol(
    camera: Arc<dyn CameraControl>,
    state: Arc<Mutex<PatrolState>>,
    id: u64,
    cancel: CancellationToken,
    positions: Vec<PatrolPosition>,
    repeat: bool,
) {
    'patrol: loop {
        {
            let mut s = lock(&state);
            if !s.is_current(id) {
                break;
            }
            s.cycle += 1;
            debug!(cycle = s.cycle, "Patrol cycle");
        }

        for pos in &positions {
            {
                let mut s = lock(&state);
                if !s.is_current(id) {
                    break 'patrol;
                }
                s.current_pos = pos.name.clone();
            }

            let params = [("name", pos.name.as_str())];
            let recall = tokio::select! {
                _ = cancel.cancelled() => break 'patrol,
                r = camera.command(RECALL_COMMAND, &params) => r,
            };
            match recall.and_then(CgiResponse::check) {
                Ok(_) => debug!(position = %pos.name, "Patrol: moved"),
                Err(e) => warn!(position = %pos.name, error = %e, "Patrol: preset recall failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'patrol,
                _ = tokio::time::sleep(pos.dwell_duration()) => {}
            }
        }

        if !repeat {
            break;
        }
    }

    let mut s = lock(&state);
    if s.is_current(id) {
        s.run = None;
        s.current_pos.clear();
        info!(cycles = s.cycle, "Patrol finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    /// Records every recall with the (paused) clock time it arrived.
    struct RecordingCamera {
        started: Instant,
        calls: Mutex<Vec<(String, Duration)>>,
        result: &'static str,
    }

    impl RecordingCamera {
        fn new(result: &'static str) -> Arc<Self> {
            Arc::new(Self {
                started: Instant::now(),
                calls: Mutex::new(Vec::new()),
                result,
            })
        }

        fn calls(&self) -> Vec<(String, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CameraControl for RecordingCamera {
        async fn command(&self, cmd: &str, params: &[(&str, &str)]) -> Result<CgiResponse> {
            assert_eq!(cmd, RECALL_COMMAND);
            let name = params
                .iter()
                .find(|(k, _)| *k == "name")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            self.calls.lock().unwrap().push((name, self.started.elapsed()));
            let mut fields = std::collections::BTreeMap::new();
            fields.insert("result".to_string(), self.result.to_string());
            Ok(CgiResponse(fields))
        }
    }

    fn plan(positions: &[(&str, f64)], repeat: bool) -> PatrolPlan {
        PatrolPlan {
            positions: positions.iter().map(|(n, d)| PatrolPosition::new(n, *d)).collect(),
            repeat,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_pass_skips_inert_positions() {
        let camera = RecordingCamera::new("0");
        let patrol = PatrolController::new(camera.clone());

        patrol.start(&plan(&[("A", 10.0), ("B", 20.0), ("C", 0.0)], false)).unwrap();
        assert!(patrol.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = patrol.status();
        assert_eq!(status.current_pos, "A");
        assert_eq!(status.cycle, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(patrol.status().current_pos, "B");

        tokio::time::sleep(Duration::from_secs(20)).await;
        let status = patrol.status();
        assert!(!status.running);
        assert_eq!(status.current_pos, "");
        assert_eq!(status.cycle, 1);

        let calls = camera.calls();
        let names: Vec<_> = calls.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(calls[1].1.as_secs(), 10, "B follows A's dwell");
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_counts_cycles() {
        let camera = RecordingCamera::new("0");
        let patrol = PatrolController::new(camera.clone());
        patrol.start(&plan(&[("A", 1.0), ("B", 1.0)], true)).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(patrol.status().cycle, 3);
        assert!(patrol.stop());
        assert_eq!(camera.calls().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_dwell_is_honored() {
        let camera = RecordingCamera::new("0");
        let patrol = PatrolController::new(camera.clone());
        patrol.start(&plan(&[("A", 2.5), ("B", 0.5)], false)).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        let calls = camera.calls();
        assert_eq!(calls.len(), 2);
        let gap = calls[1].1.as_millis();
        assert!((2500..2510).contains(&gap), "B after {}ms", gap);
        assert!(!patrol.is_running());
    }

    #[tokio::test]
    async fn fewer_than_two_active_positions_is_rejected() {
        let camera = RecordingCamera::new("0");
        let patrol = PatrolController::new(camera.clone());

        let err = patrol.start(&plan(&[("A", 10.0), ("B", 0.0), ("C", -5.0)], true));
        assert!(matches!(err, Err(Error::InvalidInput(_))));
        assert!(!patrol.is_running());
        assert!(camera.calls().is_empty());

        assert!(matches!(
            patrol.start(&PatrolPlan::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn second_start_conflicts() {
        let patrol = PatrolController::new(RecordingCamera::new("0"));
        let p = plan(&[("A", 30.0), ("B", 30.0)], true);
        patrol.start(&p).unwrap();
        assert!(matches!(patrol.start(&p), Err(Error::Conflict(_))));
        patrol.shutdown().await;
        assert!(!patrol.is_running());
    }

    #[tokio::test]
    async fn stop_mid_dwell_is_prompt() {
        let camera = RecordingCamera::new("0");
        let patrol = PatrolController::new(camera.clone());
        patrol.start(&plan(&[("A", 30.0), ("B", 30.0)], true)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        patrol.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(150));

        let status = patrol.status();
        assert!(!status.running);
        assert_eq!(status.current_pos, "");
        assert_eq!(camera.calls().len(), 1, "no further recall after stop");
        assert!(!patrol.stop(), "stop is idempotent");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recall_does_not_stop_the_loop() {
        let camera = RecordingCamera::new("-1");
        let patrol = PatrolController::new(camera.clone());
        patrol.start(&plan(&[("A", 1.0), ("B", 1.0)], false)).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(camera.calls().len(), 2);
        assert!(!patrol.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_resets_counters() {
        let patrol = PatrolController::new(RecordingCamera::new("0"));
        let p = plan(&[("A", 1.0), ("B", 1.0)], true);

        patrol.start(&p).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(patrol.stop());
        assert_eq!(patrol.status().cycle, 2);

        patrol.start(&p).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(patrol.status().cycle, 1);
        patrol.shutdown().await;
    }
}
