//! Single-worker AT command dispatcher.
//!
//! Every caller (adapters, the monitor, the scan orchestrator) submits
//! [`Command`]s through a cloneable [`Dispatcher`] handle. One worker task
//! owns the [`Channel`] and drains a bounded FIFO queue, so there is exactly
//! one command on the wire at any time. Callers suspend on a oneshot until
//! their command completes, is rejected, or times out.
//!
//! The worker also owns recovery: a transport fault, or too many timeouts in
//! a row, makes it reconnect the channel and replay the init commands.
//! Requests that arrive while it is reconnecting are rejected with
//! [`ModemError::DeviceUnavailable`] instead of piling up.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelConfig, ConnectionState, Connector};
use crate::command::{self, at, is_echo, is_final_result, Command, Response};
use crate::error::ModemError;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout for commands built with [`Dispatcher::quick_command`].
    pub command_timeout: Duration,
    /// Timeout for commands built with [`Dispatcher::long_command`].
    pub long_command_timeout: Duration,
    /// Consecutive timeouts/transport errors before forcing a reconnect.
    pub max_consecutive_failures: u32,
    /// Bounded queue length; senders wait when it is full.
    pub queue_depth: usize,
    /// Quiet period used to swallow the tail of a timed-out reply. Replies
    /// that arrive later are flushed by a resync before the next command.
    pub stale_drain: Duration,
    /// Pause between reconnect rounds once the channel is faulted.
    pub faulted_retry_interval: Duration,
    /// Sent after every successful (re)connect.
    pub init_commands: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout: command::DEFAULT_TIMEOUT,
            long_command_timeout: command::DEFAULT_LONG_TIMEOUT,
            max_consecutive_failures: 3,
            queue_depth: 32,
            stale_drain: Duration::from_millis(250),
            faulted_retry_interval: Duration::from_secs(30),
            init_commands: vec![at::ECHO_OFF.to_string()],
        }
    }
}

struct PendingRequest {
    command: Command,
    reply: oneshot::Sender<Result<Response, ModemError>>,
    cancel: Option<CancellationToken>,
    enqueued_at: Instant,
}

impl PendingRequest {
    fn abandoned(&self) -> bool {
        self.reply.is_closed() || self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Cheap, cloneable handle to the dispatcher worker.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<PendingRequest>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: Arc<DispatcherConfig>,
    endpoint: Arc<str>,
}

impl Dispatcher {
    /// Connect the channel and spawn the worker.
    ///
    /// Fails with [`ModemError::Transport`] if the initial connect (with its
    /// backoff retries) does not succeed.
    pub async fn start(
        connector: Arc<dyn Connector>,
        channel_config: ChannelConfig,
        config: DispatcherConfig,
    ) -> Result<Self, ModemError> {
        let mut channel = Channel::new(connector, channel_config);
        channel.connect().await?;

        let endpoint: Arc<str> = channel.endpoint().into();
        let state = channel.subscribe_state();
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let shutdown = CancellationToken::new();
        let config = Arc::new(config);

        let worker = Worker {
            channel,
            rx,
            state: state.clone(),
            shutdown: shutdown.clone(),
            config: Arc::clone(&config),
            consecutive_failures: 0,
            stale_replies: 0,
        };
        let handle = tokio::spawn(worker.run());
        info!("Modem {endpoint}: dispatcher started");

        Ok(Self {
            tx,
            state,
            shutdown,
            worker: Arc::new(Mutex::new(Some(handle))),
            config,
            endpoint,
        })
    }

    /// Run a command and wait for its response.
    pub async fn execute(&self, command: Command) -> Result<Response, ModemError> {
        self.submit(command, None).await
    }

    /// Like [`execute`](Self::execute), but cancelling `token` withdraws the
    /// request. A request still in the queue is never written; one already
    /// on the wire finishes there and its result is discarded.
    pub async fn execute_cancellable(
        &self,
        command: Command,
        token: &CancellationToken,
    ) -> Result<Response, ModemError> {
        self.submit(command, Some(token.clone())).await
    }

    async fn submit(
        &self,
        command: Command,
        cancel: Option<CancellationToken>,
    ) -> Result<Response, ModemError> {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            return Err(ModemError::DeviceUnavailable(state));
        }

        let (reply, reply_rx) = oneshot::channel();
        let request = PendingRequest {
            command,
            reply,
            cancel: cancel.clone(),
            enqueued_at: Instant::now(),
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| ModemError::DeviceUnavailable(ConnectionState::Disconnected))?;

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                outcome = reply_rx => outcome,
                () = token.cancelled() => return Err(ModemError::Cancelled),
            },
            None => reply_rx.await,
        };
        outcome.unwrap_or(Err(ModemError::DeviceUnavailable(
            ConnectionState::Disconnected,
        )))
    }

    /// Quick command with the configured default timeout.
    pub fn quick_command(&self, text: impl Into<String>) -> Command {
        Command::quick(text).with_timeout(self.config.command_timeout)
    }

    /// Long-running command with the configured extended timeout.
    pub fn long_command(&self, text: impl Into<String>) -> Command {
        Command::long_running(text).with_timeout(self.config.long_command_timeout)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every channel state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop the worker and close the channel. Queued requests are rejected.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Modem {}: dispatcher worker panicked: {e}", self.endpoint);
            }
        }
    }
}

/// First `max` characters of `text`, for logs.
fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Drive `fut` to completion while turning away every queued request.
/// Returns `None` if shutdown was requested first.
async fn reject_until<F: Future>(
    rx: &mut mpsc::Receiver<PendingRequest>,
    state: &watch::Receiver<ConnectionState>,
    shutdown: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            () = shutdown.cancelled() => return None,
            Some(request) = rx.recv() => {
                let current = *state.borrow();
                debug!("Modem: rejecting {} while {current}", request.command.text());
                let _ = request.reply.send(Err(ModemError::DeviceUnavailable(current)));
            }
        }
    }
}

struct Worker {
    channel: Channel,
    rx: mpsc::Receiver<PendingRequest>,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    config: Arc<DispatcherConfig>,
    consecutive_failures: u32,
    /// Final result codes still owed by the modem for abandoned commands.
    stale_replies: u32,
}

impl Worker {
    async fn run(mut self) {
        let endpoint = self.channel.endpoint();
        self.initialize().await;

        loop {
            if self.channel.state() != ConnectionState::Connected && !self.recover().await {
                break;
            }

            let request = tokio::select! {
                () = self.shutdown.cancelled() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if request.abandoned() {
                debug!("Modem {endpoint}: skipping cancelled {}", request.command.text());
                let _ = request.reply.send(Err(ModemError::Cancelled));
                continue;
            }

            let waited = request.enqueued_at.elapsed();
            let result = self.exchange(&request.command).await;
            match &result {
                Ok(resp) => debug!(
                    "Modem {endpoint} {} (queued {}ms): {:?}",
                    request.command.text(),
                    waited.as_millis(),
                    preview(&resp.text(), 80)
                ),
                Err(e) => warn!("Modem {endpoint} {} failed: {e}", request.command.text()),
            }
            self.record_outcome(&result);
            let _ = request.reply.send(result);

            if self.consecutive_failures >= self.config.max_consecutive_failures.max(1) {
                warn!(
                    "Modem {endpoint}: {} consecutive failures, reconnecting",
                    self.consecutive_failures
                );
                if !self.recover().await {
                    break;
                }
            }
        }

        self.channel.close();
        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            let _ = request
                .reply
                .send(Err(ModemError::DeviceUnavailable(ConnectionState::Disconnected)));
        }
        debug!("Modem {endpoint}: dispatcher worker exiting");
    }

    fn record_outcome(&mut self, result: &Result<Response, ModemError>) {
        match result {
            Err(e) if e.is_link_failure() => self.consecutive_failures += 1,
            _ => self.consecutive_failures = 0,
        }
    }

    /// Discard stale input, write, then collect lines up to a terminator.
    async fn exchange(&mut self, command: &Command) -> Result<Response, ModemError> {
        let deadline = Instant::now() + command.timeout();
        if self.stale_replies == 0 {
            self.channel.discard_pending();
        } else {
            // Owed result codes may already be buffered; resync counts them.
            self.resync(deadline).await.map_err(|e| match e {
                ModemError::Timeout(_) => ModemError::timeout(command.text()),
                other => other,
            })?;
        }
        self.channel.write_line(command.text()).await?;

        let mut lines = Vec::new();
        loop {
            let line = match self.channel.read_line(deadline).await {
                Ok(line) => line,
                Err(ModemError::Timeout(_)) => {
                    if !lines.is_empty() {
                        debug!("Modem: dropping {} partial lines", lines.len());
                    }
                    if !self.channel.drain_stale(self.config.stale_drain).await {
                        self.stale_replies += 1;
                    }
                    return Err(ModemError::timeout(command.text()));
                }
                Err(e) => return Err(e),
            };

            if is_echo(&line) {
                continue;
            }
            match command.terminator_for(&line) {
                Some(t) if t.is_success() => {
                    return Ok(Response {
                        command: command.text().to_string(),
                        lines,
                    })
                }
                Some(_) => {
                    return Err(ModemError::CommandRejected {
                        command: command.text().to_string(),
                        reason: line,
                    })
                }
                None => lines.push(line),
            }
        }
    }

    /// Send a bare `AT` and throw away input until every owed final result
    /// code, the ping's own included, has been read. The modem answers in
    /// order, so the line after the ping's `OK` belongs to the next command.
    async fn resync(&mut self, deadline: Instant) -> Result<(), ModemError> {
        debug!(
            "Modem: resyncing, {} abandoned replies outstanding",
            self.stale_replies
        );
        self.channel.write_line(at::PING).await?;
        self.stale_replies += 1;
        while self.stale_replies > 0 {
            let line = self.channel.read_line(deadline).await?;
            if is_final_result(&line) {
                self.stale_replies -= 1;
            } else {
                debug!("Modem: discarding stale line {line:?}");
            }
        }
        Ok(())
    }

    async fn initialize(&mut self) {
        let init = self.config.init_commands.clone();
        for text in init {
            let command = Command::quick(text.as_str()).with_timeout(self.config.command_timeout);
            match self.exchange(&command).await {
                Ok(_) => debug!("Modem: init {text} ok"),
                Err(e) => warn!("Modem: init {text} failed ({e}), continuing anyway"),
            }
        }
    }

    /// Reconnect until it works or shutdown is requested. Returns `false`
    /// on shutdown.
    async fn recover(&mut self) -> bool {
        self.consecutive_failures = 0;
        self.stale_replies = 0;
        let endpoint = self.channel.endpoint();
        loop {
            let connect = self.channel.connect();
            match reject_until(&mut self.rx, &self.state, &self.shutdown, connect).await {
                None => return false,
                Some(Ok(())) => {
                    info!("Modem {endpoint}: reconnected");
                    self.initialize().await;
                    return true;
                }
                Some(Err(e)) => {
                    error!(
                        "Modem {endpoint}: {e}, next attempt in {}s",
                        self.config.faulted_retry_interval.as_secs()
                    );
                    let pause = tokio::time::sleep(self.config.faulted_retry_interval);
                    if reject_until(&mut self.rx, &self.state, &self.shutdown, pause)
                        .await
                        .is_none()
                    {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockModem, Reply};

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            stale_drain: Duration::from_millis(50),
            init_commands: Vec::new(),
            ..DispatcherConfig::default()
        }
    }

    fn fast_channel() -> ChannelConfig {
        ChannelConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_commands_never_overlap() {
        let modem = MockModem::new(|cmd| {
            let tag = cmd.trim_start_matches("AT");
            Reply::delayed(Duration::from_millis(15), &[&format!("{tag}: 1"), "OK"])
        });
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let d = dispatcher.clone();
            tasks.push(tokio::spawn(async move {
                let cmd = format!("AT+T{i}");
                (i, d.execute(Command::quick(cmd)).await)
            }));
        }
        for task in tasks {
            let (i, result) = task.await.unwrap();
            assert_eq!(result.unwrap().lines, vec![format!("+T{i}: 1")]);
        }

        assert!(!modem.saw_overlap());
        assert_eq!(modem.commands().len(), 8);
    }

    #[tokio::test]
    async fn test_timeout_does_not_leak_into_next_command() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+SLOW" => Reply::delayed(Duration::from_millis(150), &["+SLOW: late", "OK"]),
            _ => Reply::data(&["+FAST: 1"]),
        });
        let config = DispatcherConfig {
            stale_drain: Duration::from_millis(300),
            ..test_config()
        };
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), config)
            .await
            .unwrap();

        let slow = Command::quick("AT+SLOW").with_timeout(Duration::from_millis(100));
        let err = dispatcher.execute(slow).await.unwrap_err();
        assert_eq!(err, ModemError::timeout("AT+SLOW"));

        let resp = dispatcher.execute(Command::quick("AT+FAST")).await.unwrap();
        assert_eq!(resp.lines, vec!["+FAST: 1"]);
        assert_eq!(dispatcher.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reply_after_drain_window_is_resynced() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+SLOW" => Reply::delayed(Duration::from_millis(600), &["+SLOW: late", "OK"]),
            "AT+FAST" => Reply::data(&["+FAST: 1"]),
            _ => Reply::ok(),
        });
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();

        let slow = Command::quick("AT+SLOW").with_timeout(Duration::from_millis(100));
        let err = dispatcher.execute(slow).await.unwrap_err();
        assert_eq!(err, ModemError::timeout("AT+SLOW"));

        let resp = dispatcher.execute(Command::quick("AT+FAST")).await.unwrap();
        assert_eq!(resp.lines, vec!["+FAST: 1"]);
        let resp = dispatcher.execute(Command::quick("AT+FAST")).await.unwrap();
        assert_eq!(resp.lines, vec!["+FAST: 1"]);
        assert_eq!(
            modem.commands(),
            vec!["AT+SLOW", "AT", "AT+FAST", "AT+FAST"]
        );
    }

    #[tokio::test]
    async fn test_late_reply_buffered_before_next_command() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+SLOW" => Reply::delayed(Duration::from_millis(200), &["+SLOW: late", "OK"]),
            "AT+FAST" => Reply::data(&["+FAST: 1"]),
            _ => Reply::ok(),
        });
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();

        let slow = Command::quick("AT+SLOW").with_timeout(Duration::from_millis(50));
        assert!(dispatcher.execute(slow).await.is_err());
        // Let the late reply land in the read buffer while the queue is idle.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let resp = dispatcher.execute(Command::quick("AT+FAST")).await.unwrap();
        assert_eq!(resp.lines, vec!["+FAST: 1"]);
    }

    #[tokio::test]
    async fn test_long_running_timeout_releases_queue() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+QSCAN=3,1" => Reply::delayed(Duration::from_millis(300), &["+QSCAN: x", "OK"]),
            "AT+CSQ" => Reply::data(&["+CSQ: 20,99"]),
            _ => Reply::ok(),
        });
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();

        let d = dispatcher.clone();
        let scan = tokio::spawn(async move {
            let cmd = Command::long_running("AT+QSCAN=3,1").with_timeout(Duration::from_millis(100));
            d.execute(cmd).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let d = dispatcher.clone();
        let queued = tokio::spawn(async move { d.execute(Command::quick("AT+CSQ")).await });

        assert_eq!(
            scan.await.unwrap(),
            Err(ModemError::timeout("AT+QSCAN=3,1"))
        );
        let resp = queued.await.unwrap().unwrap();
        assert_eq!(resp.lines, vec!["+CSQ: 20,99"]);
        assert_eq!(dispatcher.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_rejection_carries_reason() {
        let modem = MockModem::new(|_| Reply::Lines(vec!["+CME ERROR: 10".into()]));
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();
        let err = dispatcher.execute(Command::quick("AT+QCCID")).await.unwrap_err();
        assert_eq!(err.cme_code(), Some(10));
        assert!(matches!(err, ModemError::CommandRejected { ref command, .. } if command == "AT+QCCID"));
    }

    #[tokio::test]
    async fn test_echo_lines_dropped() {
        let modem = MockModem::new(|cmd| Reply::data(&[cmd, "RM520N-GL"]));
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();
        let resp = dispatcher.execute(Command::quick("AT+CGMM")).await.unwrap();
        assert_eq!(resp.lines, vec!["RM520N-GL"]);
    }

    #[tokio::test]
    async fn test_init_commands_run_first() {
        let modem = MockModem::new(|_| Reply::ok());
        let config = DispatcherConfig {
            init_commands: vec!["ATE0".into()],
            ..test_config()
        };
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), config)
            .await
            .unwrap();
        dispatcher.execute(Command::quick("AT")).await.unwrap();
        assert_eq!(modem.commands(), vec!["ATE0", "AT"]);
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_force_reconnect() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+HANG" => Reply::Silent,
            _ => Reply::ok(),
        });
        let config = DispatcherConfig {
            max_consecutive_failures: 2,
            ..test_config()
        };
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), config)
            .await
            .unwrap();

        for _ in 0..2 {
            let cmd = Command::quick("AT+HANG").with_timeout(Duration::from_millis(30));
            assert!(matches!(
                dispatcher.execute(cmd).await,
                Err(ModemError::Timeout(_))
            ));
        }

        let d = dispatcher.clone();
        let m = modem.clone();
        wait_for(move || {
            m.connect_attempts() == 2 && d.connection_state() == ConnectionState::Connected
        })
        .await;
        dispatcher.execute(Command::quick("AT")).await.unwrap();
    }

    #[tokio::test]
    async fn test_faulted_channel_rejects_commands() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+BYE" => Reply::Hangup,
            _ => Reply::ok(),
        })
        .single_connection();
        let config = DispatcherConfig {
            faulted_retry_interval: Duration::from_secs(60),
            ..test_config()
        };
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), config)
            .await
            .unwrap();

        let err = dispatcher.execute(Command::quick("AT+BYE")).await.unwrap_err();
        assert!(matches!(err, ModemError::Transport(_)));

        let d = dispatcher.clone();
        wait_for(move || d.connection_state() == ConnectionState::Faulted).await;
        let err = dispatcher.execute(Command::quick("AT")).await.unwrap_err();
        assert_eq!(err, ModemError::DeviceUnavailable(ConnectionState::Faulted));
        assert_eq!(modem.count("AT"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queued_request_never_written() {
        let modem = MockModem::new(|cmd| match cmd {
            "AT+SLOW" => Reply::delayed(Duration::from_millis(100), &["OK"]),
            _ => Reply::ok(),
        });
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();

        let d = dispatcher.clone();
        let slow = tokio::spawn(async move { d.execute(Command::quick("AT+SLOW")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let token = CancellationToken::new();
        let d = dispatcher.clone();
        let t = token.clone();
        let queued = tokio::spawn(async move {
            d.execute_cancellable(Command::quick("AT+QUEUED"), &t).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(queued.await.unwrap(), Err(ModemError::Cancelled));
        slow.await.unwrap().unwrap();
        dispatcher.execute(Command::quick("AT")).await.unwrap();
        assert_eq!(modem.count("AT+QUEUED"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let modem = MockModem::new(|_| Reply::ok());
        let dispatcher = Dispatcher::start(modem.connector(), fast_channel(), test_config())
            .await
            .unwrap();
        dispatcher.shutdown().await;
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(
            dispatcher.execute(Command::quick("AT")).await,
            Err(ModemError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("ok", 80), "ok");
    }
}
