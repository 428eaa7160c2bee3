use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use heating_common::SupervisorConfig;

use crate::cycle::{CleanupReport, Cycle, CycleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("control loop failed {attempts} times in a row; last error: {last}")]
    RestartsExhausted { attempts: u32, last: CycleError },
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub ticks: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Runs the control cycle on a fixed interval, restarting it after
/// machinery failures and switching every relay off when it stops.
///
/// A stopped supervisor can be started again with [`Supervisor::start`];
/// each start gets its own cancellation token and cleanup latch.
pub struct Supervisor {
    cycle: Arc<dyn Cycle>,
    config: SupervisorConfig,
    state: watch::Sender<SupervisorState>,
    cancel: Mutex<CancellationToken>,
    run_lock: Mutex<()>,
    cleaned_up: AtomicBool,
    ticks: AtomicU64,
    failures: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl Supervisor {
    pub fn new(cycle: Arc<dyn Cycle>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            cycle,
            config,
            state,
            cancel: Mutex::new(CancellationToken::new()),
            run_lock: Mutex::new(()),
            cleaned_up: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub async fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state(),
            ticks: self.ticks.load(Ordering::Relaxed),
            consecutive_failures: self.failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().await.clone(),
        }
    }

    /// Runs ticks back to back until stopped. Returns an error once more
    /// than `max_restarts` consecutive ticks have failed; cleanup has run by
    /// then. Does nothing unless the supervisor is idle.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        match self.begin(false).await {
            Some(cancel) => self.run_loop(cancel).await,
            None => {
                debug!(state = ?self.state(), "supervisor not idle; not starting");
                Ok(())
            }
        }
    }

    /// Starts the loop in the background, re-arming a stopped supervisor.
    /// Returns false when it is already running or still stopping.
    pub async fn start(self: &Arc<Self>) -> bool {
        let Some(cancel) = self.begin(true).await else {
            return false;
        };
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(err) = supervisor.run_loop(cancel).await {
                error!(error = %err, "control loop stopped");
            }
        });
        true
    }

    /// Stops the loop at its next suspension point and switches all relays
    /// off. Cleanup happens at most once per start.
    pub async fn stop_and_cleanup(&self) -> Option<CleanupReport> {
        {
            let cancel = self.cancel.lock().await;
            self.state.send_if_modified(|state| {
                if *state == SupervisorState::Stopped {
                    return false;
                }
                *state = SupervisorState::Stopping;
                true
            });
            cancel.cancel();
        }

        // Waits for an in-flight run to observe the cancellation.
        let _running = self.run_lock.lock().await;
        let report = self.cleanup().await;
        self.state.send_replace(SupervisorState::Stopped);
        report
    }

    /// Moves to Running and hands out the token for this run. Only an idle
    /// supervisor starts, or a stopped one when `rearm` is set.
    async fn begin(&self, rearm: bool) -> Option<CancellationToken> {
        let mut cancel = self.cancel.lock().await;
        let mut rearmed = false;
        let began = self.state.send_if_modified(|state| match *state {
            SupervisorState::Idle => {
                *state = SupervisorState::Running;
                true
            }
            SupervisorState::Stopped if rearm => {
                rearmed = true;
                *state = SupervisorState::Running;
                true
            }
            _ => false,
        });
        if !began {
            return None;
        }

        if rearmed {
            *cancel = CancellationToken::new();
            self.cleaned_up.store(false, Ordering::SeqCst);
            self.failures.store(0, Ordering::Relaxed);
            info!("control loop re-armed");
        }
        Some(cancel.clone())
    }

    async fn run_loop(&self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        let _running = self.run_lock.lock().await;
        if cancel.is_cancelled() {
            debug!("supervisor stopped before the loop began");
            return Ok(());
        }

        info!(
            interval_secs = self.config.check_interval_secs,
            max_restarts = self.config.max_restarts,
            "control loop started"
        );

        loop {
            match self.tick(&cancel).await {
                Ok(()) => {}
                Err(CycleError::Aborted) => break,
                Err(err) => {
                    let attempts = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(attempts, error = %err, "control cycle failed");
                    *self.last_error.lock().await = Some(err.to_string());

                    if attempts > self.config.max_restarts {
                        error!("restart budget exhausted; stopping control loop");
                        self.cleanup().await;
                        self.state.send_replace(SupervisorState::Stopped);
                        return Err(SupervisorError::RestartsExhausted {
                            attempts,
                            last: err,
                        });
                    }

                    let report = self.cycle.switch_all_off().await;
                    warn!(
                        attempts,
                        switched_off = report.switched_off,
                        "restarting control loop"
                    );
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.check_interval()) => {}
            }
        }

        info!("control loop exited");
        Ok(())
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<(), CycleError> {
        let cycle = self.cycle.clone();
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move { cycle.run_once(&cancel).await });

        let report = match handle.await {
            Ok(result) => result?,
            Err(err) if err.is_panic() => {
                return Err(CycleError::Panicked(panic_message(err.into_panic())))
            }
            Err(_) => return Err(CycleError::Aborted),
        };

        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        let heating = report.zones.iter().filter(|zone| zone.heat).count();
        debug!(
            zones = report.zones.len(),
            heating,
            skipped = report.skipped,
            "control cycle complete"
        );
        Ok(())
    }

    async fn cleanup(&self) -> Option<CleanupReport> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("cleanup already done");
            return None;
        }
        Some(self.cycle.switch_all_off().await)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleReport;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Step {
        Ok,
        Fail,
        Panic,
    }

    /// Replays a script of tick results, then succeeds forever.
    #[derive(Default)]
    struct ScriptedCycle {
        script: StdMutex<Vec<Step>>,
        runs: AtomicU32,
        cleanups: AtomicU32,
    }

    impl ScriptedCycle {
        fn new(script: &[Step]) -> Arc<Self> {
            let mut script = script.to_vec();
            script.reverse();
            Arc::new(Self {
                script: StdMutex::new(script),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Cycle for ScriptedCycle {
        async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
            if cancel.is_cancelled() {
                return Err(CycleError::Aborted);
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop().unwrap_or(Step::Ok);
            match step {
                Step::Ok => Ok(CycleReport::default()),
                Step::Fail => Err(CycleError::Panicked("store exploded".to_string())),
                Step::Panic => panic!("cycle bug"),
            }
        }

        async fn switch_all_off(&self) -> CleanupReport {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            CleanupReport {
                switched_off: 1,
                failed: 0,
            }
        }
    }

    fn config(max_restarts: u32) -> SupervisorConfig {
        SupervisorConfig {
            check_interval_secs: 1,
            max_restarts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_restarts_clean_up_once_and_stop() {
        let cycle = ScriptedCycle::new(&[Step::Fail, Step::Panic, Step::Fail]);
        let supervisor = Supervisor::new(cycle.clone(), config(2));

        let err = supervisor.run().await.unwrap_err();

        let SupervisorError::RestartsExhausted { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        // One switch-off per failure: two restarts plus the final cleanup.
        assert_eq!(cycle.cleanups.load(Ordering::SeqCst), 3);

        assert!(supervisor.stop_and_cleanup().await.is_none());
        assert_eq!(cycle.cleanups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_tick_resets_failure_count() {
        let cycle = ScriptedCycle::new(&[
            Step::Fail,
            Step::Fail,
            Step::Ok,
            Step::Fail,
            Step::Fail,
            Step::Ok,
        ]);
        let supervisor = Arc::new(Supervisor::new(cycle.clone(), config(2)));

        let runner = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.status().await.consecutive_failures, 0);

        assert!(supervisor.stop_and_cleanup().await.is_some());
        runner.await.unwrap().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_cleanup_is_idempotent() {
        let cycle = ScriptedCycle::new(&[]);
        let supervisor = Arc::new(Supervisor::new(cycle.clone(), config(3)));
        let mut states = supervisor.subscribe();

        let runner = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        states
            .wait_for(|state| *state == SupervisorState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let first = supervisor.stop_and_cleanup().await;
        let second = supervisor.stop_and_cleanup().await;
        runner.await.unwrap().unwrap();

        assert_eq!(
            first,
            Some(CleanupReport {
                switched_off: 1,
                failed: 0
            })
        );
        assert_eq!(second, None);
        assert_eq!(cycle.cleanups.load(Ordering::SeqCst), 1);
        assert!(cycle.runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_supervisor_starts_again_with_fresh_cleanup() {
        let cycle = ScriptedCycle::new(&[]);
        let supervisor = Arc::new(Supervisor::new(cycle.clone(), config(3)));
        let mut states = supervisor.subscribe();

        assert!(supervisor.start().await);
        assert!(!supervisor.start().await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(supervisor.stop_and_cleanup().await.is_some());
        let runs_before_restart = cycle.runs.load(Ordering::SeqCst);

        assert!(supervisor.start().await);
        states
            .wait_for(|state| *state == SupervisorState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cycle.runs.load(Ordering::SeqCst) > runs_before_restart);

        assert!(supervisor.stop_and_cleanup().await.is_some());
        assert_eq!(cycle.cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_during_hanging_tick_aborts_and_cleans_up() {
        use crate::{cycle::ControlCycle, remote::testing::FakeNodes, store::ZoneStore};
        use heating_common::{
            PersistenceDocument, RelayNode, RuntimeConfig, SensorNode, Zone, ZoneId,
        };

        let dir = tempfile::tempdir().unwrap();
        let store = ZoneStore::new(dir.path().join("persistence.json"));
        let zone = Zone::new(
            ZoneId::new("hall"),
            SensorNode::new("http://sensor-hall"),
            RelayNode::new(
                "http://relay/off?pin=4",
                "http://relay/on?pin=4",
                "http://relay/status?pin=4",
            ),
        )
        .unwrap();
        store.save(&zone).await.unwrap();

        let nodes = Arc::new(FakeNodes::default());
        nodes.hang("http://sensor-hall");
        nodes.respond("http://relay/on?pin=4", "");
        let cycle = Arc::new(ControlCycle::new(
            store.clone(),
            nodes.clone(),
            Arc::new(RuntimeConfig::default()),
            chrono_tz::UTC,
        ));
        let supervisor = Arc::new(Supervisor::new(cycle, config(3)));

        let runner = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        while nodes.count("http://sensor-hall") == 0 {
            tokio::task::yield_now().await;
        }

        let report = supervisor.stop_and_cleanup().await;
        runner.await.unwrap().unwrap();

        assert_eq!(
            report,
            Some(CleanupReport {
                switched_off: 1,
                failed: 0
            })
        );
        assert_eq!(nodes.count("http://relay/on?pin=4"), 1);
        assert_eq!(supervisor.status().await.ticks, 0);
        let text = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(PersistenceDocument::parse(&text).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stopping_before_run_prevents_start() {
        let cycle = ScriptedCycle::new(&[]);
        let supervisor = Supervisor::new(cycle.clone(), config(3));

        supervisor.stop_and_cleanup().await;
        supervisor.run().await.unwrap();

        assert_eq!(cycle.runs.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }
}
