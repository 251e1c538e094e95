//! `AT+QCAINFO` carrier aggregation.

use serde::Serialize;

use super::{
    band_name, float_field, int_field, parse_band_label, rsrp_dbm, rsrq_db, split_fields,
    tagged_payloads, ParseError, Partial, Rat,
};

const TAG: &str = "+QCAINFO";

/// LTE downlink bandwidth by resource-block count.
const LTE_RB_MHZ: [(u32, f64); 6] = [
    (6, 1.4),
    (15, 3.0),
    (25, 5.0),
    (50, 10.0),
    (75, 15.0),
    (100, 20.0),
];

/// LTE bandwidth index 0..=5.
const LTE_INDEX_MHZ: [f64; 6] = [1.4, 3.0, 5.0, 10.0, 15.0, 20.0];

/// NR bandwidth index 0..=14.
const NR_INDEX_MHZ: [f64; 15] = [
    5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 200.0, 400.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CarrierRole {
    #[serde(rename = "PCC")]
    Primary,
    #[serde(rename = "SCC")]
    Secondary,
}

/// One component carrier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarrierRecord {
    pub role: CarrierRole,
    pub rat: Rat,
    /// `B3` / `n78`.
    pub band: String,
    pub arfcn: u32,
    pub bandwidth_mhz: Option<f64>,
    pub pci: Option<u16>,
    pub rsrp_dbm: Option<i32>,
    pub rsrq_db: Option<f64>,
    pub sinr_db: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregationKind {
    #[serde(rename = "NR-CA")]
    NrCa,
    #[serde(rename = "EN-DC")]
    EnDc,
    #[serde(rename = "LTE-CA")]
    LteCa,
    #[serde(rename = "NR-SA")]
    NrSa,
    #[serde(rename = "LTE-SA")]
    LteSa,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarrierAggregationStatus {
    pub nr: Vec<CarrierRecord>,
    pub lte: Vec<CarrierRecord>,
    pub kind: AggregationKind,
    pub total_carriers: usize,
}

impl Default for CarrierAggregationStatus {
    fn default() -> Self {
        Self {
            nr: Vec::new(),
            lte: Vec::new(),
            kind: AggregationKind::None,
            total_carriers: 0,
        }
    }
}

/// Classify an aggregation by how many carriers of each RAT are active.
pub fn classify(nr: usize, lte: usize) -> AggregationKind {
    match (nr, lte) {
        (n, _) if n >= 2 => AggregationKind::NrCa,
        (1, l) if l >= 1 => AggregationKind::EnDc,
        (0, l) if l >= 2 => AggregationKind::LteCa,
        (1, 0) => AggregationKind::NrSa,
        (0, 1) => AggregationKind::LteSa,
        _ => AggregationKind::None,
    }
}

fn bandwidth_mhz(rat: Rat, raw: Option<i32>) -> Option<f64> {
    let raw = u32::try_from(raw?).ok()?;
    match rat {
        Rat::Lte => LTE_RB_MHZ
            .iter()
            .find(|(rbs, _)| *rbs == raw)
            .map(|(_, mhz)| *mhz)
            .or_else(|| LTE_INDEX_MHZ.get(raw as usize).copied()),
        Rat::Nr => NR_INDEX_MHZ.get(raw as usize).copied(),
    }
}

/// `"PCC"|"SCC",<arfcn>,<bw>,"<band>"[,<state>],<pci>[,<rsrp>,<rsrq>,<rssi>,<sinr>]`
fn parse_record(payload: &str) -> Result<CarrierRecord, ParseError> {
    let fields = split_fields(payload);
    if fields.len() < 5 {
        return Err(ParseError::FieldCount {
            tag: TAG,
            expected: 5,
            found: fields.len(),
        });
    }

    let role = match fields[0] {
        "PCC" => CarrierRole::Primary,
        "SCC" => CarrierRole::Secondary,
        other => {
            return Err(ParseError::InvalidField {
                tag: TAG,
                field: "role",
                value: other.to_string(),
            })
        }
    };
    let arfcn: u32 = fields[1].parse().map_err(|_| ParseError::InvalidField {
        tag: TAG,
        field: "arfcn",
        value: fields[1].to_string(),
    })?;
    let (rat, band) = parse_band_label(fields[3]).ok_or_else(|| ParseError::InvalidField {
        tag: TAG,
        field: "band",
        value: fields[3].to_string(),
    })?;

    // PCI alone or PCI plus four metrics leaves an odd count: no state field.
    let rest = &fields[4..];
    let rest = if rest.len() % 2 == 0 { &rest[1..] } else { rest };
    let (pci, metrics) = (rest.first(), rest.get(1..).unwrap_or_default());

    Ok(CarrierRecord {
        role,
        rat,
        band: band_name(rat, band),
        arfcn,
        bandwidth_mhz: bandwidth_mhz(rat, int_field(fields.get(2))),
        pci: pci.and_then(|p| p.parse().ok()),
        rsrp_dbm: rsrp_dbm(int_field(metrics.first()), rat),
        rsrq_db: rsrq_db(int_field(metrics.get(1)), rat),
        sinr_db: float_field(metrics.get(3)),
    })
}

/// Parse an `AT+QCAINFO` response. Malformed lines are skipped and reported.
pub fn parse_carrier_aggregation(response: &str) -> Partial<CarrierAggregationStatus> {
    let mut status = CarrierAggregationStatus::default();
    let mut errors = Vec::new();

    for payload in tagged_payloads(response, TAG) {
        match parse_record(payload) {
            Ok(record) if record.rat == Rat::Nr => status.nr.push(record),
            Ok(record) => status.lte.push(record),
            Err(e) => errors.push(e),
        }
    }

    status.total_carriers = status.nr.len() + status.lte.len();
    status.kind = classify(status.nr.len(), status.lte.len());
    Partial {
        value: status,
        errors,
    }
}
