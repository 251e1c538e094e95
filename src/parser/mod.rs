//! Pure parsers for modem responses.
//!
//! Every function here takes the response text (data lines joined by CRLF)
//! and never panics: a response that doesn't fit the expected grammar yields
//! a typed [`ParseError`], and multi-record responses return whatever could
//! be salvaged in a [`Partial`] alongside the errors for the rejected lines.

pub mod carrier;
pub mod cells;
pub mod identity;
pub mod lock;
pub mod signal;
pub mod temperature;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use carrier::{
    classify, parse_carrier_aggregation, AggregationKind, CarrierAggregationStatus,
    CarrierRecord, CarrierRole,
};
pub use cells::{parse_scan_results, CellRecord};
pub use identity::{parse_identity_line, parse_qccid, ModemInfo};
pub use lock::{parse_lock_status, LockParams, LockStatus};
pub use signal::{parse_signal, signal_bars, SignalSample, SystemMode};
pub use temperature::{parse_temperature, Temperature};

/// Why a response (or one record of it) was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no {tag} line in response")]
    MissingTag { tag: &'static str },

    #[error("{tag} record has {found} fields, expected at least {expected}")]
    FieldCount {
        tag: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{tag} field {field} is not valid: {value:?}")]
    InvalidField {
        tag: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Best-effort result of a multi-record parse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partial<T> {
    pub value: T,
    /// One entry per record that had to be skipped.
    #[serde(skip)]
    pub errors: Vec<ParseError>,
}

impl<T> Partial<T> {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Radio access technology of a carrier, lock or scanned cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rat {
    #[serde(rename = "LTE")]
    Lte,
    #[serde(rename = "NR")]
    Nr,
}

impl Rat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lte => "LTE",
            Self::Nr => "NR",
        }
    }
}

/// Display name for a band: `B3` for LTE, `n78` for NR.
pub fn band_name(rat: Rat, band: u16) -> String {
    match rat {
        Rat::Lte => format!("B{band}"),
        Rat::Nr => format!("n{band}"),
    }
}

/// Parse a band label in any of the forms the modem or a caller uses.
///
/// - `"LTE BAND 3"`, `"B3"`, `"b3"`, `"3"` → LTE band 3
/// - `"NR5G BAND 78"`, `"n78"`, `"N78"` → NR band 78
pub fn parse_band_label(label: &str) -> Option<(Rat, u16)> {
    let label = label.trim().trim_matches('"').trim();
    let (rat, number) = if let Some(rest) = label.strip_prefix("LTE BAND ") {
        (Rat::Lte, rest)
    } else if let Some(rest) = label.strip_prefix("NR5G BAND ") {
        (Rat::Nr, rest)
    } else if let Some(rest) = label.strip_prefix(|c: char| c == 'n' || c == 'N') {
        (Rat::Nr, rest)
    } else if let Some(rest) = label.strip_prefix(|c: char| c == 'b' || c == 'B') {
        (Rat::Lte, rest)
    } else {
        (Rat::Lte, label)
    };
    let number: u16 = number.trim().parse().ok()?;
    (number > 0).then_some((rat, number))
}

/// Payloads (text after `tag:`) of every line carrying `tag`.
pub(crate) fn tagged_payloads<'a>(
    response: &'a str,
    tag: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    response.lines().filter_map(move |line| {
        let start = line.find(tag)?;
        let rest = &line[start + tag.len()..];
        let rest = rest.strip_prefix(':')?;
        Some(rest.trim())
    })
}

/// Split a payload on commas, trimming whitespace and quotes.
pub(crate) fn split_fields(payload: &str) -> Vec<&str> {
    payload
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim())
        .collect()
}

/// Integer field; `-`, empty and the `-32768` / `255` "not available"
/// sentinels map to `None`.
pub(crate) fn int_field(field: Option<&&str>) -> Option<i32> {
    let s = *field?;
    if s.is_empty() || s == "-" {
        return None;
    }
    let value: i32 = s.parse().ok()?;
    (value != -32768 && value != 255).then_some(value)
}

/// Decimal field with the same sentinel handling as [`int_field`].
pub(crate) fn float_field(field: Option<&&str>) -> Option<f64> {
    let s = *field?;
    if s.is_empty() || s == "-" {
        return None;
    }
    let value: f64 = s.parse().ok()?;
    #[allow(clippy::float_cmp)]
    let sentinel = value == -32768.0 || value == 255.0;
    (!sentinel).then_some(value)
}

/// RSRP in dBm. Negative values are already dBm; small non-negative values
/// are 3GPP measurement indices (TS 36.133 / 38.133).
pub(crate) fn rsrp_dbm(raw: Option<i32>, rat: Rat) -> Option<i32> {
    let raw = raw?;
    if raw < 0 {
        return (-160..=-30).contains(&raw).then_some(raw);
    }
    match rat {
        Rat::Lte if raw <= 97 => Some(raw - 141),
        Rat::Nr if raw <= 127 => Some(raw - 157),
        _ => None,
    }
}

/// RSRQ in dB, with the same index fallback as [`rsrp_dbm`].
pub(crate) fn rsrq_db(raw: Option<i32>, rat: Rat) -> Option<f64> {
    let raw = raw?;
    if raw < 0 {
        return (-45..=0).contains(&raw).then_some(f64::from(raw));
    }
    match rat {
        Rat::Lte if raw <= 34 => Some(f64::from(raw) * 0.5 - 20.0),
        Rat::Nr if raw <= 127 => Some(f64::from(raw) * 0.5 - 43.5),
        _ => None,
    }
}

/// SINR in dB from the Quectel quantized scale (0..=250, dB = raw/5 − 20).
/// Negative values are passed through as dB.
pub(crate) fn sinr_db(raw: Option<i32>) -> Option<f64> {
    let raw = raw?;
    match raw {
        r if r < 0 => Some(f64::from(r)),
        r if r <= 250 => Some(f64::from(r) / 5.0 - 20.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_band_label_forms() {
        assert_eq!(parse_band_label("LTE BAND 3"), Some((Rat::Lte, 3)));
        assert_eq!(parse_band_label("\"NR5G BAND 78\""), Some((Rat::Nr, 78)));
        assert_eq!(parse_band_label("n78"), Some((Rat::Nr, 78)));
        assert_eq!(parse_band_label("N41"), Some((Rat::Nr, 41)));
        assert_eq!(parse_band_label("B7"), Some((Rat::Lte, 7)));
        assert_eq!(parse_band_label("b20"), Some((Rat::Lte, 20)));
        assert_eq!(parse_band_label("66"), Some((Rat::Lte, 66)));
        assert_eq!(parse_band_label("WCDMA BAND 2"), None);
        assert_eq!(parse_band_label("n0"), None);
        assert_eq!(parse_band_label(""), None);
    }

    #[test]
    fn test_band_name() {
        assert_eq!(band_name(Rat::Lte, 3), "B3");
        assert_eq!(band_name(Rat::Nr, 78), "n78");
    }

    #[test]
    fn test_tagged_payloads() {
        let response = "+QCSQ: \"LTE\",-60,-95,150,-11\r\n+QCSQ: \"NR5G\",-85,150,-11\r\nOK";
        let payloads: Vec<&str> = tagged_payloads(response, "+QCSQ").collect();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1], "\"NR5G\",-85,150,-11");
    }

    #[test]
    fn test_tagged_payloads_requires_colon() {
        let payloads: Vec<&str> = tagged_payloads("+QCSQX \"LTE\"", "+QCSQ").collect();
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_int_field_sentinels() {
        assert_eq!(int_field(Some(&"-95")), Some(-95));
        assert_eq!(int_field(Some(&"-")), None);
        assert_eq!(int_field(Some(&"-32768")), None);
        assert_eq!(int_field(Some(&"255")), None);
        assert_eq!(int_field(Some(&"abc")), None);
        assert_eq!(int_field(None), None);
    }

    #[test]
    fn test_rsrp_conversion() {
        assert_eq!(rsrp_dbm(Some(-95), Rat::Lte), Some(-95));
        assert_eq!(rsrp_dbm(Some(46), Rat::Lte), Some(-95));
        assert_eq!(rsrp_dbm(Some(72), Rat::Nr), Some(-85));
        assert_eq!(rsrp_dbm(Some(200), Rat::Nr), None);
        assert_eq!(rsrp_dbm(Some(-200), Rat::Lte), None);
    }

    #[test]
    fn test_rsrq_conversion() {
        assert_eq!(rsrq_db(Some(-11), Rat::Lte), Some(-11.0));
        assert_eq!(rsrq_db(Some(18), Rat::Lte), Some(-11.0));
        assert_eq!(rsrq_db(Some(65), Rat::Nr), Some(-11.0));
    }

    #[test]
    fn test_sinr_conversion() {
        assert_eq!(sinr_db(Some(150)), Some(10.0));
        assert_eq!(sinr_db(Some(0)), Some(-20.0));
        assert_eq!(sinr_db(Some(-3)), Some(-3.0));
        assert_eq!(sinr_db(Some(251)), None);
    }

    #[test]
    fn test_partial_is_complete() {
        let ok: Partial<u8> = Partial {
            value: 1,
            errors: vec![],
        };
        assert!(ok.is_complete());
        let bad: Partial<u8> = Partial {
            value: 1,
            errors: vec![ParseError::MissingTag { tag: "+QSCAN" }],
        };
        assert!(!bad.is_complete());
    }
}
