//! Mock session provider and workers for scheduler tests.
//!
//! These mocks record everything that happens to a shared [`EventLog`] so
//! tests can assert on the exact order of logins, updates, and session
//! lifecycle events without a real browser.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::SessionProvider;
use crate::browser::BrowserError;
use crate::config::GraphKind;
use crate::plugins::{PluginError, PluginWorker};

/// Shared ordered record of mock activity.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == needle)
    }

    pub fn count_of(&self, needle: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == needle).count()
    }
}

/// Session stand-in carrying only a launch ordinal.
pub struct MockSession {
    pub id: usize,
}

/// Provider that always launches instantly, numbering sessions from 1.
pub struct MockSessions {
    log: EventLog,
    started: AtomicUsize,
}

impl MockSessions {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            started: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionProvider for MockSessions {
    type Session = MockSession;

    async fn start(&self, _cancel: &CancellationToken) -> Result<MockSession, BrowserError> {
        let id = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(format!("session-start:{id}"));
        Ok(MockSession { id })
    }

    async fn stop(&self, session: MockSession) {
        self.log.push(format!("session-stop:{}", session.id));
    }
}

/// A failure result for scripting worker updates.
pub fn capture_failure() -> PluginError {
    PluginError::NothingCaptured {
        kind: GraphKind::Performr,
        failures: 1,
    }
}

/// Worker whose update results follow a script, then default to `Ok`.
pub struct ScriptedWorker {
    name: String,
    log: EventLog,
    update_results: Mutex<VecDeque<Result<(), PluginError>>>,
    interval: Duration,
    update_started: Option<Arc<Notify>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedWorker {
    pub fn new(name: impl Into<String>, log: EventLog) -> Self {
        Self {
            name: name.into(),
            log,
            update_results: Mutex::new(VecDeque::new()),
            interval: Duration::from_millis(5),
            update_started: None,
            gate: None,
        }
    }

    /// Override the default 5 ms update interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Queue results for the next update calls, in order.
    pub fn script_updates(self, results: Vec<Result<(), PluginError>>) -> Self {
        self.update_results.lock().unwrap().extend(results);
        self
    }

    /// Make every update announce itself on `started` and then block until
    /// `gate` is notified.
    pub fn gated(mut self, started: Arc<Notify>, gate: Arc<Notify>) -> Self {
        self.update_started = Some(started);
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl PluginWorker<MockSession> for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn update_interval(&self) -> Duration {
        self.interval
    }

    async fn perform_login(&self, session: &MockSession) -> Result<(), PluginError> {
        self.log.push(format!("login:{}@{}", self.name, session.id));
        Ok(())
    }

    async fn perform_update(&self, session: &MockSession) -> Result<(), PluginError> {
        self.log.push(format!("update:{}@{}", self.name, session.id));
        if let (Some(started), Some(gate)) = (&self.update_started, &self.gate) {
            started.notify_one();
            gate.notified().await;
        }
        self.update_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn shutdown(&self) {
        self.log.push(format!("shutdown:{}", self.name));
    }
}
