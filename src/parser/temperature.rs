//! `AT+QTEMP` thermal sensors.

use serde::Serialize;

use super::{split_fields, tagged_payloads};

const TAG: &str = "+QTEMP";

/// Sensor names for the positional `+QTEMP: <pmic>,<xo>,<pa>` form.
const POSITIONAL_SENSORS: [&str; 3] = ["pmic", "xo", "pa"];

/// Hottest valid modem sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Temperature {
    pub raw: Option<i32>,
    pub celsius: Option<f64>,
    pub sensor: Option<String>,
    /// `"47°C"`, or `"--"` when unknown.
    pub display: String,
}

impl Default for Temperature {
    fn default() -> Self {
        Self {
            raw: None,
            celsius: None,
            sensor: None,
            display: "--".to_string(),
        }
    }
}

impl Temperature {
    pub fn is_known(&self) -> bool {
        self.raw.is_some()
    }
}

fn valid(value: i32) -> bool {
    value > -273 && value < 200
}

/// Parse an `AT+QTEMP` response in either the named
/// (`+QTEMP:"<sensor>","<value>"`) or the positional form.
///
/// Never fails: anything unreadable yields [`Temperature::default`].
pub fn parse_temperature(response: &str) -> Temperature {
    let mut readings: Vec<(String, i32)> = Vec::new();

    for payload in tagged_payloads(response, TAG) {
        let fields = split_fields(payload);
        let named = fields.len() == 2 && fields[0].parse::<i32>().is_err();
        if named {
            if let Ok(value) = fields[1].parse::<i32>() {
                readings.push((fields[0].to_string(), value));
            }
            continue;
        }
        for (idx, field) in fields.iter().enumerate() {
            let Ok(value) = field.parse::<i32>() else {
                continue;
            };
            let sensor = POSITIONAL_SENSORS
                .get(idx)
                .map_or_else(|| format!("sensor{idx}"), |s| (*s).to_string());
            readings.push((sensor, value));
        }
    }

    let Some((sensor, raw)) = readings
        .into_iter()
        .filter(|(_, v)| valid(*v))
        .max_by_key(|(_, v)| *v)
    else {
        return Temperature::default();
    };

    Temperature {
        raw: Some(raw),
        celsius: Some(f64::from(raw)),
        sensor: Some(sensor),
        display: format!("{raw}°C"),
    }
}
