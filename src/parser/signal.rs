//! `AT+QCSQ` signal quality.

use serde::{Serialize, Serializer};

use super::{int_field, rsrp_dbm, rsrq_db, sinr_db, split_fields, tagged_payloads, ParseError, Rat};

const TAG: &str = "+QCSQ";

/// Serving system reported by `+QCSQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMode {
    NoService,
    Gsm,
    Wcdma,
    Lte,
    Nr5gSa,
    /// LTE anchor with an NR leg; quality figures come from the NR leg.
    EnDc,
    Other(String),
}

impl SystemMode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoService => "NOSERVICE",
            Self::Gsm => "GSM",
            Self::Wcdma => "WCDMA",
            Self::Lte => "LTE",
            Self::Nr5gSa => "NR5G-SA",
            Self::EnDc => "EN-DC",
            Self::Other(name) => name,
        }
    }
}

impl Serialize for SystemMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Signal quality snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSample {
    pub mode: SystemMode,
    /// RSSI in dBm (LTE, WCDMA and GSM lines only).
    pub rssi_dbm: Option<i32>,
    pub rsrp_dbm: Option<i32>,
    pub rsrq_db: Option<f64>,
    pub sinr_db: Option<f64>,
    /// Signal quality as 1-5 bars, derived from RSRP (or RSSI fallback).
    /// Zero when nothing was measured.
    pub signal_bars: u8,
    /// When this reading was recorded (epoch milliseconds).
    pub recorded_at: u64,
}

/// Lower bounds (dBm) for 5, 4, 3 and 2 bars.
const RSRP_STEPS: [i32; 4] = [-80, -90, -100, -110];
const RSSI_STEPS: [i32; 4] = [-65, -75, -85, -95];

/// 1-5 bars from RSRP, or from RSSI when the RAT reports no RSRP. Zero
/// when neither was measured.
pub fn signal_bars(rsrp_dbm: Option<i32>, rssi_dbm: Option<i32>) -> u8 {
    let (value, steps) = match (rsrp_dbm, rssi_dbm) {
        (Some(rsrp), _) => (rsrp, &RSRP_STEPS),
        (None, Some(rssi)) => (rssi, &RSSI_STEPS),
        (None, None) => return 0,
    };
    let below = steps.iter().take_while(|step| value < **step).count();
    5 - below as u8
}

#[derive(Debug, Default, Clone, Copy)]
struct Leg {
    rssi: Option<i32>,
    rsrp: Option<i32>,
    rsrq: Option<f64>,
    sinr: Option<f64>,
}

fn require(fields: &[&str], expected: usize) -> Result<(), ParseError> {
    if fields.len() < expected {
        return Err(ParseError::FieldCount {
            tag: TAG,
            expected,
            found: fields.len(),
        });
    }
    Ok(())
}

/// Parse an `AT+QCSQ` response.
///
/// Line shapes:
/// - `"LTE",<rssi>,<rsrp>,<sinr>,<rsrq>`
/// - `"NR5G",<rsrp>,<sinr>,<rsrq>`
/// - `"WCDMA",<rssi>,<rscp>,<ecio>`
/// - `"GSM",<rssi>`
/// - `"NOSERVICE"`
///
/// An LTE line together with an NR5G line is EN-DC: RSRP/RSRQ/SINR are taken
/// from the NR leg where it reports them, RSSI from the LTE anchor.
pub fn parse_signal(response: &str, recorded_at: u64) -> Result<SignalSample, ParseError> {
    let mut seen = false;
    let mut lte: Option<Leg> = None;
    let mut nr: Option<Leg> = None;
    let mut legacy: Option<(SystemMode, Option<i32>)> = None;

    for payload in tagged_payloads(response, TAG) {
        seen = true;
        let fields = split_fields(payload);
        let mode = fields.first().copied().unwrap_or_default();
        match mode {
            "LTE" => {
                require(&fields, 5)?;
                lte = Some(Leg {
                    rssi: int_field(fields.get(1)),
                    rsrp: rsrp_dbm(int_field(fields.get(2)), Rat::Lte),
                    sinr: sinr_db(int_field(fields.get(3))),
                    rsrq: rsrq_db(int_field(fields.get(4)), Rat::Lte),
                });
            }
            "NR5G" => {
                require(&fields, 4)?;
                nr = Some(Leg {
                    rssi: None,
                    rsrp: rsrp_dbm(int_field(fields.get(1)), Rat::Nr),
                    sinr: sinr_db(int_field(fields.get(2))),
                    rsrq: rsrq_db(int_field(fields.get(3)), Rat::Nr),
                });
            }
            "WCDMA" => {
                require(&fields, 2)?;
                legacy = Some((SystemMode::Wcdma, int_field(fields.get(1))));
            }
            "GSM" => {
                require(&fields, 2)?;
                legacy = Some((SystemMode::Gsm, int_field(fields.get(1))));
            }
            "NOSERVICE" | "" => {}
            other => {
                legacy = Some((SystemMode::Other(other.to_string()), int_field(fields.get(1))));
            }
        }
    }

    if !seen {
        return Err(ParseError::MissingTag { tag: TAG });
    }

    let (mode, leg) = match (lte, nr, legacy) {
        (Some(lte), Some(nr), _) => (
            SystemMode::EnDc,
            Leg {
                rssi: lte.rssi,
                rsrp: nr.rsrp.or(lte.rsrp),
                rsrq: nr.rsrq.or(lte.rsrq),
                sinr: nr.sinr.or(lte.sinr),
            },
        ),
        (None, Some(nr), _) => (SystemMode::Nr5gSa, nr),
        (Some(lte), None, _) => (SystemMode::Lte, lte),
        (None, None, Some((mode, rssi))) => (
            mode,
            Leg {
                rssi,
                ..Leg::default()
            },
        ),
        (None, None, None) => (SystemMode::NoService, Leg::default()),
    };

    Ok(SignalSample {
        mode,
        rssi_dbm: leg.rssi,
        rsrp_dbm: leg.rsrp,
        rsrq_db: leg.rsrq,
        sinr_db: leg.sinr,
        signal_bars: signal_bars(leg.rsrp, leg.rssi),
        recorded_at,
    })
}
