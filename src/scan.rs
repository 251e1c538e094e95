//! Cell scan workflow.
//!
//! A scan detaches the modem from the network, runs the vendor cell scan,
//! parses the discovered cells and then deliberately leaves the modem
//! detached until the caller asks for [`ScanOrchestrator::restore_network`].
//! Every step goes through the [`Dispatcher`], so the multi-minute scan
//! command holds the single command slot and other callers queue behind it.
//!
//! ```text
//! Idle → Initializing → Detaching → Scanning → Collecting
//!      → AwaitingRestore → Restoring → Completed
//! (any active phase) → Failed → Restoring
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::dispatcher::Dispatcher;
use crate::error::ModemError;
use crate::events::{DeviceEvent, EventBus};
use crate::parser::{parse_scan_results, CellRecord};
use crate::probe::epoch_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Idle,
    Initializing,
    Detaching,
    Scanning,
    Collecting,
    AwaitingRestore,
    Restoring,
    Completed,
    Failed,
}

impl ScanPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Detaching => "detaching",
            Self::Scanning => "scanning",
            Self::Collecting => "collecting",
            Self::AwaitingRestore => "awaiting_restore",
            Self::Restoring => "restoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A session in this phase blocks new scans.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }

    pub fn is_restorable(self) -> bool {
        matches!(self, Self::AwaitingRestore | Self::Failed)
    }

    /// Whether the workflow may move from `self` to `next`.
    pub fn can_transition_to(self, next: ScanPhase) -> bool {
        use ScanPhase::{
            AwaitingRestore, Collecting, Completed, Detaching, Failed, Idle, Initializing,
            Restoring, Scanning,
        };
        match (self, next) {
            (Idle, Initializing)
            | (Initializing, Detaching)
            | (Detaching, Scanning)
            | (Scanning, Collecting)
            | (Collecting, AwaitingRestore)
            | (AwaitingRestore | Failed, Restoring)
            | (Restoring, Completed) => true,
            (from, Failed) => from.is_active(),
            _ => false,
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("a scan is already active ({phase})")]
    AlreadyActive { phase: ScanPhase },

    #[error("nothing to restore while scan is {phase}")]
    NotRestorable { phase: ScanPhase },

    #[error("invalid scan transition {from} -> {to}")]
    InvalidTransition { from: ScanPhase, to: ScanPhase },

    #[error(transparent)]
    Device(#[from] ModemError),
}

/// One scan run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    pub id: Uuid,
    pub phase: ScanPhase,
    pub cells: Vec<CellRecord>,
    /// Epoch milliseconds.
    pub started_at: u64,
    pub updated_at: u64,
    pub message: String,
    pub percent: u8,
    /// Phase that was running when the session failed.
    pub failed_phase: Option<ScanPhase>,
    pub error: Option<String>,
    /// Scan lines that could not be parsed.
    pub skipped_records: usize,
}

impl ScanSession {
    fn new() -> Self {
        let now = epoch_millis();
        Self {
            id: Uuid::new_v4(),
            phase: ScanPhase::Idle,
            cells: Vec::new(),
            started_at: now,
            updated_at: now,
            message: String::new(),
            percent: 0,
            failed_phase: None,
            error: None,
            skipped_records: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Sent in order before detaching.
    pub init_commands: Vec<String>,
    pub init_attempts: u32,
    pub init_retry_delay: Duration,
    pub init_timeout: Duration,
    pub detach_command: String,
    pub detach_timeout: Duration,
    pub scan_command: String,
    pub scan_timeout: Duration,
    pub attach_command: String,
    pub attach_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            init_commands: ["AT", "ATE0", "AT+CMEE=1", "AT+CFUN=1"]
                .map(String::from)
                .to_vec(),
            init_attempts: 3,
            init_retry_delay: Duration::from_secs(2),
            init_timeout: Duration::from_secs(5),
            detach_command: "AT+COPS=2".to_string(),
            detach_timeout: Duration::from_secs(30),
            scan_command: "AT+QSCAN=3,1".to_string(),
            scan_timeout: Duration::from_secs(300),
            attach_command: "AT+COPS=0".to_string(),
            attach_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Default)]
struct Sessions {
    current: Option<ScanSession>,
    last: Option<ScanSession>,
    task: Option<JoinHandle<()>>,
}

impl Sessions {
    fn phase(&self) -> ScanPhase {
        self.current.as_ref().map_or(ScanPhase::Idle, |s| s.phase)
    }
}

struct Inner {
    dispatcher: Dispatcher,
    events: EventBus,
    config: ScanConfig,
    sessions: Mutex<Sessions>,
    phase: watch::Sender<ScanPhase>,
}

/// Runs at most one scan session at a time.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<Inner>,
}

impl ScanOrchestrator {
    pub fn new(dispatcher: Dispatcher, events: EventBus, config: ScanConfig) -> Self {
        let (phase, _) = watch::channel(ScanPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                events,
                config,
                sessions: Mutex::new(Sessions::default()),
                phase,
            }),
        }
    }

    /// Begin a new scan and return its session id.
    ///
    /// Rejected without side effects while another session is active. A
    /// finished session is archived as [`last_session`](Self::last_session).
    pub fn start_scan(&self) -> Result<Uuid, ScanError> {
        let mut sessions = self.inner.lock();
        let phase = sessions.phase();
        if phase.is_active() {
            return Err(ScanError::AlreadyActive { phase });
        }

        if let Some(previous) = sessions.current.take() {
            sessions.last = Some(previous);
        }
        let session = ScanSession::new();
        let id = session.id;
        sessions.current = Some(session);
        self.inner.apply(
            &mut sessions,
            id,
            ScanPhase::Initializing,
            "Initializing modem".to_string(),
            5,
        )?;

        info!("Scan: session {id} started");
        let inner = Arc::clone(&self.inner);
        sessions.task = Some(tokio::spawn(async move {
            if let Err(e) = inner.drive(id).await {
                error!("Scan: session {id} aborted: {e}");
            }
        }));
        Ok(id)
    }

    /// Re-attach to the network after a scan, or after a failed one.
    pub async fn restore_network(&self) -> Result<(), ScanError> {
        let id = {
            let mut sessions = self.inner.lock();
            let phase = sessions.phase();
            let Some(id) = sessions.current.as_ref().map(|s| s.id) else {
                return Err(ScanError::NotRestorable { phase });
            };
            if !phase.is_restorable() {
                return Err(ScanError::NotRestorable { phase });
            }
            self.inner.apply(
                &mut sessions,
                id,
                ScanPhase::Restoring,
                "Restoring network registration".to_string(),
                95,
            )?;
            id
        };

        let config = &self.inner.config;
        let command =
            Command::long_running(config.attach_command.as_str()).with_timeout(config.attach_timeout);
        match self.inner.dispatcher.execute(command).await {
            Ok(_) => {
                self.inner.transition(
                    id,
                    ScanPhase::Completed,
                    "Network restored".to_string(),
                    100,
                )?;
                Ok(())
            }
            Err(e) => {
                self.inner.fail(id, format!("restore failed: {e}"))?;
                Err(ScanError::Device(e))
            }
        }
    }

    /// Send the attach command for a modem left detached by an earlier
    /// process. A restorable session is restored through
    /// [`restore_network`](Self::restore_network) instead.
    pub async fn reattach(&self) -> Result<(), ScanError> {
        let phase = self.phase();
        if phase.is_restorable() {
            return self.restore_network().await;
        }
        if phase.is_active() {
            return Err(ScanError::AlreadyActive { phase });
        }
        let config = &self.inner.config;
        let command =
            Command::long_running(config.attach_command.as_str()).with_timeout(config.attach_timeout);
        self.inner.dispatcher.execute(command).await?;
        info!("Scan: network attach sent outside a session");
        Ok(())
    }

    /// Archive a finished session and return to idle.
    pub fn acknowledge(&self) -> Result<Option<ScanSession>, ScanError> {
        let mut sessions = self.inner.lock();
        let phase = sessions.phase();
        if phase.is_active() {
            return Err(ScanError::AlreadyActive { phase });
        }
        let archived = sessions.current.take();
        if let Some(session) = &archived {
            sessions.last = Some(session.clone());
        }
        sessions.task = None;
        self.inner.phase.send_replace(ScanPhase::Idle);
        Ok(archived)
    }

    pub fn session(&self) -> Option<ScanSession> {
        self.inner.lock().current.clone()
    }

    pub fn last_session(&self) -> Option<ScanSession> {
        self.inner.lock().last.clone()
    }

    pub fn phase(&self) -> ScanPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ScanPhase> {
        self.inner.phase.subscribe()
    }

    /// Abort a running workflow task. The session keeps its last phase.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.lock().task.take() {
            task.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and apply a phase change, then publish it.
    fn apply(
        &self,
        sessions: &mut Sessions,
        id: Uuid,
        next: ScanPhase,
        message: String,
        percent: u8,
    ) -> Result<(), ScanError> {
        let Some(session) = sessions.current.as_mut().filter(|s| s.id == id) else {
            return Err(ScanError::InvalidTransition {
                from: ScanPhase::Idle,
                to: next,
            });
        };
        let from = session.phase;
        if !from.can_transition_to(next) {
            error!("Scan: refusing transition {from} -> {next}");
            return Err(ScanError::InvalidTransition { from, to: next });
        }

        session.phase = next;
        session.percent = percent;
        session.message.clone_from(&message);
        session.updated_at = epoch_millis();
        self.phase.send_replace(next);

        info!("Scan: {next} ({percent}%) {message}");
        self.events.publish(DeviceEvent::ScanProgress {
            session_id: id,
            phase: next,
            message,
            percent,
        });
        Ok(())
    }

    fn transition(
        &self,
        id: Uuid,
        next: ScanPhase,
        message: String,
        percent: u8,
    ) -> Result<(), ScanError> {
        let mut sessions = self.lock();
        self.apply(&mut sessions, id, next, message, percent)
    }

    /// Progress within the current phase.
    fn progress(&self, id: Uuid, message: String, percent: u8) {
        let mut sessions = self.lock();
        let Some(session) = sessions.current.as_mut().filter(|s| s.id == id) else {
            return;
        };
        session.percent = percent;
        session.message.clone_from(&message);
        session.updated_at = epoch_millis();
        let phase = session.phase;
        self.events.publish(DeviceEvent::ScanProgress {
            session_id: id,
            phase,
            message,
            percent,
        });
    }

    /// Move to `Failed`, keeping whatever was collected so far.
    fn fail(&self, id: Uuid, message: String) -> Result<(), ScanError> {
        let mut sessions = self.lock();
        let Some((phase, percent)) = sessions
            .current
            .as_ref()
            .filter(|s| s.id == id)
            .map(|s| (s.phase, s.percent))
        else {
            return Ok(());
        };

        warn!("Scan: failed during {phase}: {message}");
        self.apply(&mut sessions, id, ScanPhase::Failed, message.clone(), percent)?;
        if let Some(session) = sessions.current.as_mut() {
            session.failed_phase = Some(phase);
            session.error = Some(message.clone());
        }
        self.events.publish(DeviceEvent::ScanError {
            session_id: id,
            phase,
            message,
        });
        Ok(())
    }

    async fn drive(&self, id: Uuid) -> Result<(), ScanError> {
        let config = &self.config;

        let total = config.init_commands.len().max(1);
        for (i, text) in config.init_commands.iter().enumerate() {
            let percent = 5 + u8::try_from(20 * i / total).unwrap_or(20);
            self.progress(
                id,
                format!("Initializing ({}/{total}): {text}", i + 1),
                percent,
            );
            if let Err(e) = self.init_command(text).await {
                return self.fail(id, format!("init {text} failed: {e}"));
            }
        }
        self.progress(id, "Modem initialized".to_string(), 25);

        self.transition(
            id,
            ScanPhase::Detaching,
            "Detaching from network".to_string(),
            30,
        )?;
        let detach = Command::quick(config.detach_command.as_str()).with_timeout(config.detach_timeout);
        if let Err(e) = self.dispatcher.execute(detach).await {
            return self.fail(id, format!("detach failed: {e}"));
        }

        self.transition(
            id,
            ScanPhase::Scanning,
            "Scanning for cells".to_string(),
            35,
        )?;
        let scan =
            Command::long_running(config.scan_command.as_str()).with_timeout(config.scan_timeout);
        let response = match self.dispatcher.execute(scan).await {
            Ok(response) => response,
            Err(e) => return self.fail(id, format!("scan failed: {e}")),
        };

        self.transition(
            id,
            ScanPhase::Collecting,
            "Parsing scan results".to_string(),
            85,
        )?;
        let parsed = parse_scan_results(&response.text());
        for e in &parsed.errors {
            warn!("Scan: skipped record: {e}");
        }
        let skipped = parsed.errors.len();
        let cells = parsed.value;
        {
            let mut sessions = self.lock();
            if let Some(session) = sessions.current.as_mut().filter(|s| s.id == id) {
                session.cells.clone_from(&cells);
                session.skipped_records = skipped;
            }
        }

        self.transition(
            id,
            ScanPhase::AwaitingRestore,
            format!("Found {} cells, network detached until restore", cells.len()),
            90,
        )?;
        self.events.publish(DeviceEvent::ScanComplete {
            session_id: id,
            results: cells,
            skipped,
        });
        Ok(())
    }

    /// One init command with bounded retries; any failure kind is retried.
    async fn init_command(&self, text: &str) -> Result<(), ModemError> {
        let attempts = self.config.init_attempts.max(1);
        let mut attempt = 1;
        loop {
            let command = Command::quick(text).with_timeout(self.config.init_timeout);
            match self.dispatcher.execute(command).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!("Scan: init {text} failed ({attempt}/{attempts}): {e}, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.init_retry_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::dispatcher::DispatcherConfig;
    use crate::testing::{MockModem, Reply};

    const SCAN_LINES: [&str; 3] = [
        "+QSCAN: \"NR5G\",302,720,627264,123,-88,-11,20,1,1A2B3C4D5,3E8,12,78,15",
        "+QSCAN: \"LTE\",302,720,1300,101,-95,-12,30,-,0A1B2C3,61E4,5,3",
        "+QSCAN: \"LTE\",302,610,3050,202,-105,-15,12,-",
    ];

    const SCAN_LINES_OK: [&str; 2] = [
        "+QSCAN: \"LTE\",302,720,1300,101,-95,-12,30,-,0A1B2C3,61E4,5,3",
        "OK",
    ];

    fn test_config() -> ScanConfig {
        ScanConfig {
            init_retry_delay: Duration::from_millis(10),
            ..ScanConfig::default()
        }
    }

    async fn orchestrator(modem: &MockModem) -> (ScanOrchestrator, EventBus) {
        let config = DispatcherConfig {
            init_commands: Vec::new(),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::start(modem.connector(), ChannelConfig::default(), config)
            .await
            .unwrap();
        let events = EventBus::default();
        (
            ScanOrchestrator::new(dispatcher, events.clone(), test_config()),
            events,
        )
    }

    async fn wait_phase(orch: &ScanOrchestrator, phase: ScanPhase) {
        let mut rx = orch.subscribe_phase();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    #[test]
    fn test_transition_table() {
        use ScanPhase::*;
        assert!(Idle.can_transition_to(Initializing));
        assert!(!Idle.can_transition_to(Scanning));
        assert!(!Idle.can_transition_to(Failed));
        assert!(Scanning.can_transition_to(Collecting));
        assert!(Scanning.can_transition_to(Failed));
        assert!(!Collecting.can_transition_to(Completed));
        assert!(AwaitingRestore.can_transition_to(Restoring));
        assert!(!AwaitingRestore.can_transition_to(Completed));
        assert!(!AwaitingRestore.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Restoring));
        assert!(!Failed.can_transition_to(Failed));
        assert!(Restoring.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Initializing));
    }

    #[tokio::test]
    async fn test_end_to_end_success() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+QSCAN=3,1" => Reply::data(&SCAN_LINES),
            _ => Reply::ok(),
        });
        let (orch, events) = orchestrator(&modem).await;
        let mut rx = events.subscribe();

        let id = orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::AwaitingRestore).await;

        let session = orch.session().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.cells.len(), 3);
        assert_eq!(session.skipped_records, 0);

        // Stays detached until told otherwise.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.phase(), ScanPhase::AwaitingRestore);
        assert_eq!(modem.count("AT+COPS=0"), 0);

        orch.restore_network().await.unwrap();
        assert_eq!(orch.phase(), ScanPhase::Completed);
        assert_eq!(
            modem.commands(),
            vec![
                "AT",
                "ATE0",
                "AT+CMEE=1",
                "AT+CFUN=1",
                "AT+COPS=2",
                "AT+QSCAN=3,1",
                "AT+COPS=0"
            ]
        );

        let mut percents = Vec::new();
        let mut completed_cells = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                DeviceEvent::ScanProgress { percent, .. } => percents.push(percent),
                DeviceEvent::ScanComplete { results, .. } => completed_cells = Some(results.len()),
                _ => {}
            }
        }
        assert_eq!(completed_cells, Some(3));
        assert_eq!(percents.first(), Some(&5));
        assert_eq!(&percents[percents.len() - 6..], &[30, 35, 85, 90, 95, 100]);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    }

    #[tokio::test]
    async fn test_end_to_end_detach_failure() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+COPS=2" => Reply::error(),
            _ => Reply::ok(),
        });
        let (orch, events) = orchestrator(&modem).await;
        let mut rx = events.subscribe();

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::Failed).await;

        let session = orch.session().unwrap();
        assert!(session.cells.is_empty());
        assert_eq!(session.failed_phase, Some(ScanPhase::Detaching));
        assert!(session.error.unwrap().contains("detach failed"));
        assert_eq!(modem.count("AT+QSCAN=3,1"), 0);

        let mut error_phase = None;
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::ScanError { phase, .. } = event {
                error_phase = Some(phase);
            }
        }
        assert_eq!(error_phase, Some(ScanPhase::Detaching));

        orch.restore_network().await.unwrap();
        assert_eq!(orch.phase(), ScanPhase::Completed);
        assert_eq!(modem.count("AT+COPS=0"), 1);
    }

    #[tokio::test]
    async fn test_second_start_rejected_without_side_effects() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+QSCAN=3,1" => Reply::delayed(Duration::from_millis(300), &["OK"]),
            _ => Reply::ok(),
        });
        let (orch, _events) = orchestrator(&modem).await;

        let id = orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::Scanning).await;

        let err = orch.start_scan().unwrap_err();
        assert_eq!(
            err,
            ScanError::AlreadyActive {
                phase: ScanPhase::Scanning
            }
        );
        assert_eq!(orch.session().unwrap().id, id);
        assert!(orch.last_session().is_none());
        assert!(matches!(
            orch.restore_network().await,
            Err(ScanError::NotRestorable {
                phase: ScanPhase::Scanning
            })
        ));

        wait_phase(&orch, ScanPhase::AwaitingRestore).await;
        assert!(orch.session().unwrap().cells.is_empty());
    }

    #[tokio::test]
    async fn test_init_retry_recovers() {
        let rejections = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&rejections);
        let modem = MockModem::new(move |cmd| match cmd {
            "AT+CMEE=1" if seen.fetch_add(1, Ordering::SeqCst) == 0 => {
                Reply::Lines(vec!["+CME ERROR: 3".into()])
            }
            _ => Reply::ok(),
        });
        let (orch, _events) = orchestrator(&modem).await;

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::AwaitingRestore).await;
        assert_eq!(modem.count("AT+CMEE=1"), 2);
    }

    #[tokio::test]
    async fn test_init_retries_exhausted() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+CFUN=1" => Reply::error(),
            _ => Reply::ok(),
        });
        let (orch, _events) = orchestrator(&modem).await;

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::Failed).await;
        assert_eq!(modem.count("AT+CFUN=1"), 3);
        assert_eq!(modem.count("AT+COPS=2"), 0);
        assert_eq!(
            orch.session().unwrap().failed_phase,
            Some(ScanPhase::Initializing)
        );
    }

    #[tokio::test]
    async fn test_restore_requires_session() {
        let modem = MockModem::new(|_| Reply::ok());
        let (orch, _events) = orchestrator(&modem).await;
        assert_eq!(
            orch.restore_network().await,
            Err(ScanError::NotRestorable {
                phase: ScanPhase::Idle
            })
        );
    }

    #[tokio::test]
    async fn test_reattach_without_session() {
        let modem = MockModem::new(|_| Reply::ok());
        let (orch, _events) = orchestrator(&modem).await;
        orch.reattach().await.unwrap();
        assert_eq!(modem.count("AT+COPS=0"), 1);
        assert_eq!(orch.phase(), ScanPhase::Idle);

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::AwaitingRestore).await;
        orch.reattach().await.unwrap();
        assert_eq!(orch.phase(), ScanPhase::Completed);
        assert_eq!(modem.count("AT+COPS=0"), 2);
    }

    #[tokio::test]
    async fn test_failed_restore_stays_restorable() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+COPS=0" => Reply::Lines(vec!["+CME ERROR: 30".into()]),
            _ => Reply::ok(),
        });
        let (orch, _events) = orchestrator(&modem).await;

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::AwaitingRestore).await;
        let err = orch.restore_network().await.unwrap_err();
        assert!(matches!(err, ScanError::Device(ModemError::CommandRejected { .. })));
        assert_eq!(orch.phase(), ScanPhase::Failed);
        assert_eq!(
            orch.session().unwrap().failed_phase,
            Some(ScanPhase::Restoring)
        );
        assert!(orch.restore_network().await.is_err());
        assert_eq!(modem.count("AT+COPS=0"), 2);
    }

    #[tokio::test]
    async fn test_acknowledge_archives_and_new_scan_allowed() {
        let modem = MockModem::new(|_| Reply::ok());
        let (orch, _events) = orchestrator(&modem).await;

        let first = orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::AwaitingRestore).await;
        assert!(matches!(
            orch.acknowledge(),
            Err(ScanError::AlreadyActive { .. })
        ));
        orch.restore_network().await.unwrap();

        let archived = orch.acknowledge().unwrap().unwrap();
        assert_eq!(archived.id, first);
        assert_eq!(orch.phase(), ScanPhase::Idle);
        assert!(orch.session().is_none());
        assert_eq!(orch.last_session().unwrap().phase, ScanPhase::Completed);

        let second = orch.start_scan().unwrap();
        assert_ne!(first, second);
    }
    #[tokio::test]
    async fn test_scan_rejection_fails_in_scanning() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+QSCAN=3,1" => Reply::error(),
            _ => Reply::ok(),
        });
        let (orch, events) = orchestrator(&modem).await;
        let mut rx = events.subscribe();

        let id = orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::Failed).await;

        let session = orch.session().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.failed_phase, Some(ScanPhase::Scanning));
        assert!(session.cells.is_empty());
        assert!(session.error.unwrap().contains("scan failed"));

        let mut error_phase = None;
        while let Ok(event) = rx.try_recv() {
            if let DeviceEvent::ScanError { phase, .. } = event {
                error_phase = Some(phase);
            }
        }
        assert_eq!(error_phase, Some(ScanPhase::Scanning));
        assert_eq!(
            serde_json::to_value(ScanPhase::Scanning).unwrap(),
            "scanning"
        );

        orch.restore_network().await.unwrap();
        assert_eq!(orch.phase(), ScanPhase::Completed);
        assert_eq!(modem.count("AT+COPS=0"), 1);
    }

    #[tokio::test]
    async fn test_scan_timeout_then_restore() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+QSCAN=3,1" => Reply::delayed(Duration::from_millis(400), &SCAN_LINES_OK),
            _ => Reply::ok(),
        });
        let config = DispatcherConfig {
            init_commands: Vec::new(),
            stale_drain: Duration::from_millis(20),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::start(modem.connector(), ChannelConfig::default(), config)
            .await
            .unwrap();
        let scan_config = ScanConfig {
            scan_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let orch = ScanOrchestrator::new(dispatcher, EventBus::default(), scan_config);

        orch.start_scan().unwrap();
        wait_phase(&orch, ScanPhase::Failed).await;
        let session = orch.session().unwrap();
        assert_eq!(session.failed_phase, Some(ScanPhase::Scanning));
        assert!(session.error.unwrap().contains("timed out"));

        // The late scan reply must not be mistaken for the attach reply.
        orch.restore_network().await.unwrap();
        assert_eq!(orch.phase(), ScanPhase::Completed);
        assert_eq!(modem.count("AT+COPS=0"), 1);
    }
}
