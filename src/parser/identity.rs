//! Static modem identity.

use serde::Serialize;

use super::tagged_payloads;
use crate::command::{is_echo, is_final_result};

/// What the modem says it is. Read once per connection; any field the
/// firmware refuses to report stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModemInfo {
    /// `AT+CGMM`, e.g. `RM520N-GL`.
    pub model: Option<String>,
    /// `AT+CGMR`.
    pub firmware: Option<String>,
    /// `AT+GSN`.
    pub imei: Option<String>,
    /// `AT+QCCID`, absent without a SIM.
    pub iccid: Option<String>,
}

impl ModemInfo {
    /// Whether the modem answered none of the identity queries.
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.firmware.is_none()
            && self.imei.is_none()
            && self.iccid.is_none()
    }
}

/// First data line of an untagged identity reply (`AT+CGMM`, `AT+CGMR`,
/// `AT+GSN`). Echo and result codes are not data.
pub fn parse_identity_line(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take_while(|line| !is_final_result(line))
        .find(|line| !is_echo(line))
        .map(str::to_string)
}

/// ICCID from `+QCCID: <iccid>`.
pub fn parse_qccid(response: &str) -> Option<String> {
    let iccid = tagged_payloads(response, "+QCCID").next()?;
    (!iccid.is_empty()).then(|| iccid.to_string())
}
