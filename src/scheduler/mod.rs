//! Per-browser-instance scheduling.
//!
//! Each configured browser instance gets one [`GroupScheduler`] running on
//! its own task. The scheduler owns the group's session lifecycle and drives
//! its workers through the pure state machine in [`state`]: start a session,
//! log every worker in, then loop update passes until a failure or session
//! age forces a restart, or cancellation winds the group down.

pub mod state;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::BrowserError;
use crate::config::ConfigManager;
use crate::plugins::PluginWorker;
use state::{transition, GroupEvent, GroupState};

/// Pause between login retries so a rejecting backend is not hammered.
const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Session factory seam between the scheduler and the browser layer.
#[async_trait]
pub trait SessionProvider: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    /// Produce a fresh session, retrying internally until it succeeds,
    /// the caller is cancelled, or the provider gives up.
    async fn start(&self, cancel: &CancellationToken) -> Result<Self::Session, BrowserError>;

    /// Tear a session down. Must not fail; a wedged session is abandoned.
    async fn stop(&self, session: Self::Session);
}

/// Drives one browser instance and the workers assigned to it.
pub struct GroupScheduler<P: SessionProvider> {
    instance: String,
    provider: P,
    workers: Vec<Arc<dyn PluginWorker<P::Session>>>,
    config: Arc<ConfigManager>,
    cancel: CancellationToken,
}

impl<P: SessionProvider> GroupScheduler<P> {
    pub fn new(
        instance: impl Into<String>,
        provider: P,
        workers: Vec<Arc<dyn PluginWorker<P::Session>>>,
        config: Arc<ConfigManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance: instance.into(),
            provider,
            workers,
            config,
            cancel,
        }
    }

    /// Run the group to completion. Returns once the state machine reaches
    /// `Stopped`, with the session torn down and every worker shut down.
    pub async fn run(self) {
        let mut machine = GroupState::Starting;
        let mut session: Option<P::Session> = None;
        let mut session_started = Instant::now();
        // Per-worker completion times survive restarts: pacing protects the
        // backends, which do not care which session asked.
        let mut last_updates: Vec<Option<Instant>> = vec![None; self.workers.len()];

        info!(instance = %self.instance, workers = self.workers.len(), "Scheduler group starting");

        while !machine.is_terminal() {
            let max_session = self.config.current().settings.max_session_duration;

            match machine {
                GroupState::Starting | GroupState::Restarting => {
                    if let Some(old) = session.take() {
                        self.provider.stop(old).await;
                    }
                    if self.cancel.is_cancelled() {
                        machine = transition(machine, GroupEvent::StopRequested, max_session);
                        continue;
                    }

                    match self.provider.start(&self.cancel).await {
                        Ok(fresh) => {
                            session_started = Instant::now();
                            match self.login_all(&fresh).await {
                                Ok(()) => {
                                    machine =
                                        transition(machine, GroupEvent::LoginComplete, max_session);
                                }
                                Err(()) => {
                                    // State holds, so the next iteration tears
                                    // this session down and starts over.
                                    session = Some(fresh);
                                    tokio::select! {
                                        () = self.cancel.cancelled() => {}
                                        () = tokio::time::sleep(LOGIN_RETRY_DELAY) => {}
                                    }
                                    continue;
                                }
                            }
                            session = Some(fresh);
                        }
                        Err(BrowserError::Cancelled) => {
                            machine = transition(machine, GroupEvent::StopRequested, max_session);
                        }
                        Err(e) => {
                            error!(instance = %self.instance, "Session start failed for good: {e}");
                            machine = transition(machine, GroupEvent::StopRequested, max_session);
                        }
                    }
                }

                GroupState::LoggedIn | GroupState::Running => {
                    let Some(active) = session.as_ref() else {
                        // Unreachable by construction; recover via restart.
                        machine = GroupState::Restarting;
                        continue;
                    };

                    if self.config.check_for_update() {
                        info!(instance = %self.instance, "Config change applied before pass");
                    }

                    let failed = self.update_all(active, &mut last_updates).await;
                    let session_age = session_started.elapsed();
                    machine = transition(
                        machine,
                        GroupEvent::PassCompleted {
                            failed,
                            session_age,
                        },
                        max_session,
                    );

                    match machine {
                        GroupState::Running => {
                            tokio::select! {
                                () = self.cancel.cancelled() => {
                                    machine = transition(
                                        machine,
                                        GroupEvent::StopRequested,
                                        max_session,
                                    );
                                }
                                () = tokio::time::sleep(self.pass_interval()) => {}
                            }
                        }
                        GroupState::Restarting => {
                            info!(
                                instance = %self.instance,
                                failed,
                                session_age_secs = session_age.as_secs(),
                                "Restarting session"
                            );
                        }
                        _ => {}
                    }
                }

                GroupState::Stopping => {
                    for worker in &self.workers {
                        worker.shutdown().await;
                    }
                    if let Some(old) = session.take() {
                        self.provider.stop(old).await;
                    }
                    machine = transition(machine, GroupEvent::ShutdownComplete, max_session);
                }

                GroupState::Stopped => {}
            }
        }

        info!(instance = %self.instance, "Scheduler group stopped");
    }

    /// Log every worker in, in assignment order. Any failure aborts the
    /// sequence; the caller restarts the session and retries them all.
    async fn login_all(&self, session: &P::Session) -> Result<(), ()> {
        for worker in &self.workers {
            if self.cancel.is_cancelled() {
                return Err(());
            }
            if let Err(e) = worker.perform_login(session).await {
                warn!(instance = %self.instance, worker = worker.name(), "Login failed: {e}");
                return Err(());
            }
            debug!(instance = %self.instance, worker = worker.name(), "Logged in");
        }
        Ok(())
    }

    /// One update pass over every worker due for a refresh. Returns true
    /// when a worker failed; the rest of the pass is skipped since the
    /// session is suspect.
    async fn update_all(&self, session: &P::Session, last_updates: &mut [Option<Instant>]) -> bool {
        for (worker, last) in self.workers.iter().zip(last_updates.iter_mut()) {
            if self.cancel.is_cancelled() {
                return false;
            }
            if last.is_some_and(|at| at.elapsed() < worker.update_interval()) {
                continue;
            }
            if let Err(e) = worker.perform_update(session).await {
                warn!(instance = %self.instance, worker = worker.name(), "Update failed: {e}");
                return true;
            }
            *last = Some(Instant::now());
        }
        false
    }

    /// Fastest update cadence among the group's workers paces the pass loop.
    fn pass_interval(&self) -> Duration {
        self.workers
            .iter()
            .map(|w| w.update_interval())
            .min()
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Owns the tasks of all running groups and the shared stop signal.
pub struct SchedulerSet {
    cancel: CancellationToken,
    groups: Vec<(String, JoinHandle<()>)>,
}

impl SchedulerSet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            groups: Vec::new(),
        }
    }

    /// Token handed to group builders so every group observes shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn spawn<P: SessionProvider>(&mut self, scheduler: GroupScheduler<P>) {
        let name = scheduler.instance.clone();
        self.groups.push((name, tokio::spawn(scheduler.run())));
    }

    /// Signal every group to stop and wait up to `grace` for each to finish
    /// its in-flight work. Groups still running after the grace period are
    /// aborted.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        for (name, handle) in self.groups {
            let abort = handle.abort_handle();
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => info!(instance = %name, "Group shut down cleanly"),
                Ok(Err(e)) => error!(instance = %name, "Group task panicked: {e}"),
                Err(_) => {
                    warn!(instance = %name, "Group did not stop within grace period, aborting");
                    abort.abort();
                }
            }
        }
    }
}

impl Default for SchedulerSet {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::{capture_failure, EventLog, MockSessions, ScriptedWorker};
    use super::*;
    use crate::config::testing::{dashboards_fixture, global_fixture, manager_with};
    use tokio::sync::Notify;

    fn test_config(max_session_minutes: u64) -> Arc<ConfigManager> {
        manager_with(
            &global_fixture("/tmp/wb-sched-test", "alpha", max_session_minutes),
            &dashboards_fixture(&["cpu"]),
        )
    }

    async fn wait_for(log: &EventLog, needle: &str) {
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while !log.contains(needle) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        deadline.await.unwrap_or_else(|_| {
            panic!("timed out waiting for '{needle}', log so far: {:?}", log.entries())
        });
    }

    #[tokio::test]
    async fn update_failure_relogs_in_every_worker() {
        let log = EventLog::new();
        let first = Arc::new(
            ScriptedWorker::new("alpha-a", log.clone()).script_updates(vec![Err(capture_failure())]),
        );
        let second = Arc::new(ScriptedWorker::new("alpha-b", log.clone()));

        let cancel = CancellationToken::new();
        let scheduler = GroupScheduler::new(
            "alpha",
            MockSessions::new(log.clone()),
            vec![first, second],
            test_config(300),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        // The first pass fails in worker a, so worker b only ever updates
        // on the replacement session.
        wait_for(&log, "update:alpha-b@2").await;
        cancel.cancel();
        handle.await.unwrap();

        let entries = log.entries();
        assert_eq!(
            &entries[..10],
            &[
                "session-start:1",
                "login:alpha-a@1",
                "login:alpha-b@1",
                "update:alpha-a@1",
                "session-stop:1",
                "session-start:2",
                "login:alpha-a@2",
                "login:alpha-b@2",
                "update:alpha-a@2",
                "update:alpha-b@2",
            ]
        );
        assert_eq!(log.count_of("update:alpha-b@1"), 0);
        assert!(log.contains("shutdown:alpha-a"));
        assert!(log.contains("shutdown:alpha-b"));
        assert!(log.contains("session-stop:2"));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_update() {
        let log = EventLog::new();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let worker = Arc::new(
            ScriptedWorker::new("slow", log.clone()).gated(started.clone(), gate.clone()),
        );

        let cancel = CancellationToken::new();
        let scheduler = GroupScheduler::new(
            "alpha",
            MockSessions::new(log.clone()),
            vec![worker],
            test_config(300),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        started.notified().await;
        cancel.cancel();

        // The update is still blocked on the gate; stopping must not
        // preempt it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(log.count_of("update:slow@1"), 1);
        assert!(log.contains("shutdown:slow"));
        assert!(log.contains("session-stop:1"));
    }

    // Multi-threaded runtime: with a zero session budget the scheduler task
    // never hits an await that yields, so the watcher must run on its own
    // worker thread to observe the log and cancel the group.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_session_is_rotated_with_full_relogin() {
        let log = EventLog::new();
        // Zero interval so the worker is due on every session, no matter
        // how quickly rotation churns through them.
        let worker = Arc::new(ScriptedWorker::new("rot", log.clone()).with_interval(Duration::ZERO));

        let cancel = CancellationToken::new();
        // Zero max session duration makes every pass exceed the budget.
        let scheduler = GroupScheduler::new(
            "alpha",
            MockSessions::new(log.clone()),
            vec![worker],
            test_config(0),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        wait_for(&log, "update:rot@2").await;
        cancel.cancel();
        handle.await.unwrap();

        let entries = log.entries();
        assert_eq!(
            &entries[..8],
            &[
                "session-start:1",
                "login:rot@1",
                "update:rot@1",
                "session-stop:1",
                "session-start:2",
                "login:rot@2",
                "update:rot@2",
                "session-stop:2",
            ]
        );
    }

    #[tokio::test]
    async fn scheduler_set_stops_every_group() {
        let log = EventLog::new();
        let mut set = SchedulerSet::new();

        for instance in ["alpha", "beta"] {
            let worker = Arc::new(ScriptedWorker::new(format!("{instance}-w"), log.clone()));
            let scheduler = GroupScheduler::new(
                instance,
                MockSessions::new(log.clone()),
                vec![worker],
                test_config(300),
                set.cancel_token(),
            );
            set.spawn(scheduler);
        }

        wait_for(&log, "update:alpha-w@1").await;
        wait_for(&log, "update:beta-w@1").await;
        set.shutdown(Duration::from_secs(5)).await;

        assert!(log.contains("shutdown:alpha-w"));
        assert!(log.contains("shutdown:beta-w"));
    }
}

