//! Push events for realtime subscribers.
//!
//! [`EventBus`] is a thin typed wrapper over `tokio::sync::broadcast`. Slow
//! subscribers lag and lose the oldest events; publishers never block.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::parser::{CarrierAggregationStatus, CellRecord, LockStatus, SignalSample, Temperature};
use crate::scan::ScanPhase;

/// Default broadcast buffer.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    SignalUpdate {
        signal: SignalSample,
    },
    TemperatureUpdate {
        temperature: Temperature,
    },
    LockStatusUpdate {
        lock: LockStatus,
    },
    CarrierAggregationUpdate {
        carriers: CarrierAggregationStatus,
    },
    ScanProgress {
        session_id: Uuid,
        phase: ScanPhase,
        message: String,
        percent: u8,
    },
    ScanComplete {
        session_id: Uuid,
        results: Vec<CellRecord>,
        skipped: usize,
    },
    ScanError {
        session_id: Uuid,
        phase: ScanPhase,
        message: String,
    },
    /// A monitor probe failed; polling continues.
    MonitorDegraded {
        probe: String,
        error: String,
        errors_total: u64,
    },
}

impl DeviceEvent {
    /// Wire name of the event, as found in its `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignalUpdate { .. } => "signalUpdate",
            Self::TemperatureUpdate { .. } => "temperatureUpdate",
            Self::LockStatusUpdate { .. } => "lockStatusUpdate",
            Self::CarrierAggregationUpdate { .. } => "carrierAggregationUpdate",
            Self::ScanProgress { .. } => "scanProgress",
            Self::ScanComplete { .. } => "scanComplete",
            Self::ScanError { .. } => "scanError",
            Self::MonitorDegraded { .. } => "monitorDegraded",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Returns how many received it;
    /// having none is not an error.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
