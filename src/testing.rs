//! Scripted in-memory modem for tests.
//!
//! Each connect hands out one end of a `tokio::io::duplex` pipe; a spawned
//! task on the other end reads CR-terminated commands, records them, and
//! answers from a script closure. The mock flags any command that arrives
//! while it is still busy replying to the previous one.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::channel::{BoxedStream, Connector};

/// What the mock does in response to one command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write these lines immediately.
    Lines(Vec<String>),
    /// Wait, then write these lines.
    Delayed(Duration, Vec<String>),
    /// Never answer.
    Silent,
    /// Close the connection.
    Hangup,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Lines(vec!["OK".into()])
    }

    pub fn error() -> Self {
        Reply::Lines(vec!["ERROR".into()])
    }

    /// Data lines followed by `OK`.
    pub fn data(lines: &[&str]) -> Self {
        let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
        out.push("OK".into());
        Reply::Lines(out)
    }

    pub fn delayed(delay: Duration, lines: &[&str]) -> Self {
        Reply::Delayed(delay, lines.iter().map(|l| (*l).to_string()).collect())
    }
}

type Script = dyn Fn(&str) -> Reply + Send + Sync;

struct Shared {
    script: Box<Script>,
    commands: Mutex<Vec<String>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_after_first: AtomicBool,
    overlap: AtomicBool,
}

/// Handle used by tests to build connectors and inspect traffic.
#[derive(Clone)]
pub struct MockModem {
    shared: Arc<Shared>,
}

impl MockModem {
    pub fn new(script: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Box::new(script),
                commands: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                fail_after_first: AtomicBool::new(false),
                overlap: AtomicBool::new(false),
            }),
        }
    }

    /// The first `n` connect attempts fail with `ConnectionRefused`.
    #[must_use]
    pub fn failing_connects(self, n: usize) -> Self {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    /// Every connect after the first one fails.
    #[must_use]
    pub fn single_connection(self) -> Self {
        self.shared.fail_after_first.store(true, Ordering::SeqCst);
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Total connect attempts, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Every command received, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Commands received whose text equals `text`.
    pub fn count(&self, text: &str) -> usize {
        self.commands().iter().filter(|c| *c == text).count()
    }

    /// Whether a command ever arrived while a reply was still pending.
    pub fn saw_overlap(&self) -> bool {
        self.shared.overlap.load(Ordering::SeqCst)
    }
}

struct MockConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let attempt = self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.shared.failing_connects.load(Ordering::SeqCst);
        if attempt < failing
            || (self.shared.fail_after_first.load(Ordering::SeqCst) && attempt > 0)
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock modem refused",
            ));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, Arc::clone(&self.shared)));
        Ok(Box::new(client))
    }

    fn describe(&self) -> String {
        "mock://modem".to_string()
    }
}

async fn serve(stream: DuplexStream, shared: Arc<Shared>) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut backlog: Vec<String> = Vec::new();

    loop {
        let command = if backlog.is_empty() {
            let mut raw = Vec::new();
            match reader.read_until(b'\r', &mut raw).await {
                Ok(0) | Err(_) => return,
                Ok(_) => String::from_utf8_lossy(&raw).trim().to_string(),
            }
        } else {
            backlog.remove(0)
        };
        if command.is_empty() {
            continue;
        }
        shared.commands.lock().unwrap().push(command.clone());

        let (delay, lines) = match (shared.script)(&command) {
            Reply::Lines(lines) => (Duration::ZERO, lines),
            Reply::Delayed(delay, lines) => (delay, lines),
            Reply::Silent => (Duration::ZERO, Vec::new()),
            Reply::Hangup => return,
        };

        if !delay.is_zero() {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                let mut raw = Vec::new();
                tokio::select! {
                    () = &mut sleep => break,
                    read = reader.read_until(b'\r', &mut raw) => match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            let early = String::from_utf8_lossy(&raw).trim().to_string();
                            if !early.is_empty() {
                                shared.overlap.store(true, Ordering::SeqCst);
                                backlog.push(early);
                            }
                        }
                    },
                }
            }
        }

        for line in lines {
            let framed = format!("\r\n{line}\r\n");
            if write_half.write_all(framed.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
