//! `AT+QSCAN` cell scan results.

use serde::Serialize;

use super::{
    band_name, float_field, int_field, rsrp_dbm, rsrq_db, split_fields, tagged_payloads,
    ParseError, Partial, Rat,
};

const TAG: &str = "+QSCAN";

/// Fewest fields a scan line needs to describe a cell.
const MIN_FIELDS: usize = 7;

/// One cell found by a network scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellRecord {
    pub rat: Rat,
    /// MCC followed by MNC, e.g. `302720`.
    pub plmn: Option<String>,
    pub arfcn: u32,
    pub pci: u16,
    pub band: Option<String>,
    pub tac: Option<u32>,
    pub cell_id: Option<String>,
    pub scs_khz: Option<u16>,
    pub rsrp_dbm: Option<i32>,
    pub rsrq_db: Option<f64>,
    pub sinr_db: Option<f64>,
}

/// NR numerology index 0..=4 → 15/30/60/120/240 kHz.
fn nr_scs_khz(index: Option<i32>) -> Option<u16> {
    match index? {
        i @ 0..=4 => Some(15 << i),
        _ => None,
    }
}

fn text_field(field: Option<&&str>) -> Option<String> {
    let s = *field?;
    (!s.is_empty() && s != "-").then(|| s.to_string())
}

fn invalid(field: &'static str, value: &str) -> ParseError {
    ParseError::InvalidField {
        tag: TAG,
        field,
        value: value.to_string(),
    }
}

/// `"<LTE|NR5G>",<mcc>,<mnc>,<arfcn>,<pci>,<rsrp>,<rsrq>,<srxlev>,<squal|scs>[,<cellid>,<tac>,<bw>,<band>[,<sinr>]]`
fn parse_line(payload: &str) -> Result<CellRecord, ParseError> {
    let fields = split_fields(payload);
    if fields.len() < MIN_FIELDS {
        return Err(ParseError::FieldCount {
            tag: TAG,
            expected: MIN_FIELDS,
            found: fields.len(),
        });
    }

    let rat = match fields[0] {
        "LTE" => Rat::Lte,
        "NR5G" | "NR" => Rat::Nr,
        other => return Err(invalid("rat", other)),
    };
    let arfcn: u32 = fields[3].parse().map_err(|_| invalid("arfcn", fields[3]))?;
    let pci: u16 = fields[4].parse().map_err(|_| invalid("pci", fields[4]))?;

    let plmn = match (text_field(fields.get(1)), text_field(fields.get(2))) {
        (Some(mcc), Some(mnc)) => Some(format!("{mcc}{mnc}")),
        _ => None,
    };
    let scs_khz = match rat {
        Rat::Lte => Some(15),
        Rat::Nr => nr_scs_khz(int_field(fields.get(8))),
    };
    let tac = fields
        .get(10)
        .and_then(|s| u32::from_str_radix(s, 16).ok());
    let band = int_field(fields.get(12))
        .and_then(|b| u16::try_from(b).ok())
        .filter(|b| *b > 0)
        .map(|b| band_name(rat, b));

    Ok(CellRecord {
        rat,
        plmn,
        arfcn,
        pci,
        band,
        tac,
        cell_id: text_field(fields.get(9)),
        scs_khz,
        rsrp_dbm: rsrp_dbm(int_field(fields.get(5)), rat),
        rsrq_db: rsrq_db(int_field(fields.get(6)), rat),
        sinr_db: float_field(fields.get(13)),
    })
}

/// Parse an `AT+QSCAN=3,1` response into one record per complete line.
///
/// Ragged lines are skipped and reported in [`Partial::errors`]; an
/// empty result is valid.
pub fn parse_scan_results(response: &str) -> Partial<Vec<CellRecord>> {
    let mut cells = Vec::new();
    let mut errors = Vec::new();
    for payload in tagged_payloads(response, TAG) {
        match parse_line(payload) {
            Ok(cell) => cells.push(cell),
            Err(e) => errors.push(e),
        }
    }
    Partial {
        value: cells,
        errors,
    }
}
