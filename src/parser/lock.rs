//! `AT+QNWLOCK` cell lock status.

use serde::Serialize;

use super::{band_name, split_fields, tagged_payloads, ParseError, Rat};

const TAG: &str = "+QNWLOCK";

/// Parameters of an active cell lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockParams {
    /// Only known for NR locks (`n78`); LTE lock records carry no band.
    pub band: Option<String>,
    pub arfcn: u32,
    pub pci: u16,
    pub scs_khz: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    /// `params` is `None` when the modem reports a lock whose parameters
    /// could not be read.
    Locked {
        rat: Rat,
        params: Option<LockParams>,
    },
}

impl LockStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// `"common/5g",<pci>,<arfcn>,<scs>,<band>`
fn nr_params(fields: &[&str]) -> Option<LockParams> {
    let pci = fields.get(1)?.parse().ok()?;
    let arfcn = fields.get(2)?.parse().ok()?;
    let scs_khz = fields.get(3)?.parse().ok()?;
    let band: u16 = fields.get(4)?.parse().ok()?;
    Some(LockParams {
        band: Some(band_name(Rat::Nr, band)),
        arfcn,
        pci,
        scs_khz: Some(scs_khz),
    })
}

/// `"common/4g",<count>,<earfcn>,<pci>[,...]`
fn lte_params(fields: &[&str]) -> Option<LockParams> {
    let arfcn = fields.get(2)?.parse().ok()?;
    let pci = fields.get(3)?.parse().ok()?;
    Some(LockParams {
        band: None,
        arfcn,
        pci,
        scs_khz: None,
    })
}

fn record_status(rat: Rat, fields: &[&str]) -> LockStatus {
    // NR PCI 0 is legal, so only a bare "0" means unlocked.
    let explicit_off = fields.get(1) == Some(&"0") && fields[2..].iter().all(|f| f.is_empty());
    if explicit_off {
        return LockStatus::Unlocked;
    }
    let params = match rat {
        Rat::Nr => nr_params(fields),
        Rat::Lte => lte_params(fields),
    };
    LockStatus::Locked { rat, params }
}

/// Parse one or both `AT+QNWLOCK="common/4g"` / `"common/5g"` query
/// responses (concatenated).
///
/// A locked RAT wins over an unlocked one, and NR wins over LTE.
pub fn parse_lock_status(response: &str) -> Result<LockStatus, ParseError> {
    let mut nr: Option<LockStatus> = None;
    let mut lte: Option<LockStatus> = None;
    let mut unknown: Option<String> = None;

    for payload in tagged_payloads(response, TAG) {
        let fields = split_fields(payload);
        match fields.first().copied() {
            Some("common/5g") => nr = Some(record_status(Rat::Nr, &fields)),
            Some("common/4g") => lte = Some(record_status(Rat::Lte, &fields)),
            other => {
                unknown.get_or_insert_with(|| other.unwrap_or_default().to_string());
            }
        }
    }

    match (nr, lte) {
        (Some(nr), _) if nr.is_locked() => Ok(nr),
        (_, Some(lte)) if lte.is_locked() => Ok(lte),
        (Some(_), _) | (_, Some(_)) => Ok(LockStatus::Unlocked),
        (None, None) => match unknown {
            Some(value) => Err(ParseError::InvalidField {
                tag: TAG,
                field: "mode",
                value,
            }),
            None => Err(ParseError::MissingTag { tag: TAG }),
        },
    }
}
