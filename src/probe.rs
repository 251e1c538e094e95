//! Read-only device queries shared by the adapter surface and the monitor.
//!
//! Each function issues its command(s) through the [`Dispatcher`] and runs
//! the matching parser. A `cancel` token, when given, withdraws the request
//! if it is still queued.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{at, Command, Response};
use crate::dispatcher::Dispatcher;
use crate::error::ModemError;
use crate::parser::{
    parse_carrier_aggregation, parse_identity_line, parse_lock_status, parse_qccid, parse_signal,
    parse_temperature, CarrierAggregationStatus, LockStatus, ModemInfo, Partial, SignalSample,
    Temperature,
};

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

async fn run(
    dispatcher: &Dispatcher,
    command: Command,
    cancel: Option<&CancellationToken>,
) -> Result<Response, ModemError> {
    match cancel {
        Some(token) => dispatcher.execute_cancellable(command, token).await,
        None => dispatcher.execute(command).await,
    }
}

pub async fn read_signal(
    dispatcher: &Dispatcher,
    cancel: Option<&CancellationToken>,
) -> Result<SignalSample, ModemError> {
    let resp = run(dispatcher, dispatcher.quick_command(at::SIGNAL), cancel).await?;
    Ok(parse_signal(&resp.text(), epoch_millis())?)
}

pub async fn read_carrier_aggregation(
    dispatcher: &Dispatcher,
    cancel: Option<&CancellationToken>,
) -> Result<Partial<CarrierAggregationStatus>, ModemError> {
    let resp = run(
        dispatcher,
        dispatcher.quick_command(at::CARRIER_AGGREGATION),
        cancel,
    )
    .await?;
    let parsed = parse_carrier_aggregation(&resp.text());
    for e in &parsed.errors {
        debug!("CA: skipped record: {e}");
    }
    Ok(parsed)
}

pub async fn read_temperature(
    dispatcher: &Dispatcher,
    cancel: Option<&CancellationToken>,
) -> Result<Temperature, ModemError> {
    let resp = run(dispatcher, dispatcher.quick_command(at::TEMPERATURE), cancel).await?;
    Ok(parse_temperature(&resp.text()))
}

/// Query both the NR and the LTE lock. A RAT the firmware rejects is
/// ignored as long as the other one answers.
pub async fn read_lock_status(
    dispatcher: &Dispatcher,
    cancel: Option<&CancellationToken>,
) -> Result<LockStatus, ModemError> {
    let mut text = Vec::new();
    let mut rejection = None;
    for query in [at::LOCK_STATUS_NR, at::LOCK_STATUS_LTE] {
        match run(dispatcher, dispatcher.quick_command(query), cancel).await {
            Ok(resp) => text.push(resp.text()),
            Err(e @ ModemError::CommandRejected { .. }) => {
                debug!("Lock: {query} rejected: {e}");
                rejection = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    if text.is_empty() {
        if let Some(e) = rejection {
            return Err(e);
        }
    }
    Ok(parse_lock_status(&text.join("\r\n"))?)
}

/// Read static modem identity (IMEI, model, firmware, ICCID). Fields the
/// modem refuses to report stay `None`.
pub async fn read_modem_info(dispatcher: &Dispatcher) -> ModemInfo {
    let line = |text: &'static str| async move {
        dispatcher
            .execute(dispatcher.quick_command(text))
            .await
            .ok()
            .map(|resp| resp.text())
    };

    let model = line(at::MODEL).await.as_deref().and_then(parse_identity_line);
    let firmware = line(at::FIRMWARE).await.as_deref().and_then(parse_identity_line);
    let imei = line(at::IMEI).await.as_deref().and_then(parse_identity_line);
    let iccid = line(at::ICCID).await.as_deref().and_then(parse_qccid);

    ModemInfo {
        model,
        firmware,
        imei,
        iccid,
    }
}
