//! AT command values and the Quectel command table.
//!
//! A [`Command`] is built once by a caller and consumed once by the
//! dispatcher. It carries everything the dispatcher needs to know about the
//! exchange: the text to write, how long to wait and which lines end it.

use std::time::Duration;

use serde::Serialize;

/// Default timeout for quick commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for long-running commands (network scans, attach).
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(300);

/// How the dispatcher should treat a command's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Quick,
    LongRunning,
}

/// A final result code that closes a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Ok,
    Error,
    CmeError,
    CmsError,
}

impl Terminator {
    /// Every terminator the modem family can emit.
    pub const ALL: [Terminator; 4] = [
        Terminator::Ok,
        Terminator::Error,
        Terminator::CmeError,
        Terminator::CmsError,
    ];

    /// Whether `line` (already trimmed) is this terminator.
    pub fn matches(self, line: &str) -> bool {
        match self {
            Terminator::Ok => line == "OK",
            Terminator::Error => line == "ERROR",
            Terminator::CmeError => line.starts_with("+CME ERROR:"),
            Terminator::CmsError => line.starts_with("+CMS ERROR:"),
        }
    }

    pub fn is_success(self) -> bool {
        self == Terminator::Ok
    }
}

/// An immutable AT command ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    kind: CommandKind,
    timeout: Duration,
    terminators: Vec<Terminator>,
}

impl Command {
    /// A quick command with the default 5s timeout.
    pub fn quick(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Quick,
            timeout: DEFAULT_TIMEOUT,
            terminators: Terminator::ALL.to_vec(),
        }
    }

    /// A long-running command (scan, attach) with the extended timeout.
    pub fn long_running(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::LongRunning,
            timeout: DEFAULT_LONG_TIMEOUT,
            terminators: Terminator::ALL.to_vec(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Restrict the set of lines that end the response. An empty set falls
    /// back to all terminators so a command can never wait on nothing.
    #[must_use]
    pub fn with_terminators(mut self, terminators: &[Terminator]) -> Self {
        self.terminators = if terminators.is_empty() {
            Terminator::ALL.to_vec()
        } else {
            terminators.to_vec()
        };
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn terminators(&self) -> &[Terminator] {
        &self.terminators
    }

    /// Which of this command's terminators `line` is, if any.
    pub fn terminator_for(&self, line: &str) -> Option<Terminator> {
        let trimmed = line.trim();
        self.terminators.iter().copied().find(|t| t.matches(trimmed))
    }
}

/// Data lines of a successful exchange (echo, blanks and `OK` removed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub command: String,
    pub lines: Vec<String>,
}

impl Response {
    /// Lines joined with CRLF, as the parsers expect.
    pub fn text(&self) -> String {
        self.lines.join("\r\n")
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Whether `line` is the modem echoing a command back.
///
/// Leading garbage bytes from a stale buffer are skipped before checking for
/// the `AT` prefix; a line with no letters at all is never echo.
pub fn is_echo(line: &str) -> bool {
    let trimmed = line.trim();
    match trimmed.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => trimmed[pos..].starts_with("AT") || trimmed[pos..].starts_with("at"),
        None => false,
    }
}

/// Whether `line` is any final result code, whatever command it answers.
pub fn is_final_result(line: &str) -> bool {
    let line = line.trim();
    Terminator::ALL.iter().any(|t| t.matches(line))
}

/// Command strings for the Quectel RM5xx family.
pub mod at {
    /// Signal quality per serving RAT.
    pub const SIGNAL: &str = "AT+QCSQ";
    /// Per-carrier aggregation records.
    pub const CARRIER_AGGREGATION: &str = "AT+QCAINFO";
    /// LTE cell lock query.
    pub const LOCK_STATUS_LTE: &str = "AT+QNWLOCK=\"common/4g\"";
    /// NR cell lock query.
    pub const LOCK_STATUS_NR: &str = "AT+QNWLOCK=\"common/5g\"";
    /// Clear the LTE lock.
    pub const UNLOCK_LTE: &str = "AT+QNWLOCK=\"common/4g\",0";
    /// Clear the NR lock.
    pub const UNLOCK_NR: &str = "AT+QNWLOCK=\"common/5g\",0";
    /// Thermal sensors.
    pub const TEMPERATURE: &str = "AT+QTEMP";
    pub const MODEL: &str = "AT+CGMM";
    pub const FIRMWARE: &str = "AT+CGMR";
    pub const IMEI: &str = "AT+GSN";
    pub const ICCID: &str = "AT+QCCID";
    /// Disable command echo.
    pub const ECHO_OFF: &str = "ATE0";
    /// Bare attention command, answered with `OK`.
    pub const PING: &str = "AT";

    /// Lock onto a single NR cell.
    pub fn lock_nr(pci: u16, arfcn: u32, scs_khz: u16, band: u16) -> String {
        format!("AT+QNWLOCK=\"common/5g\",{pci},{arfcn},{scs_khz},{band}")
    }

    /// Lock onto a single LTE cell.
    pub fn lock_lte(earfcn: u32, pci: u16) -> String {
        format!("AT+QNWLOCK=\"common/4g\",1,{earfcn},{pci}")
    }
}
