//! Background device monitor.
//!
//! When enabled, a ticker periodically polls signal, carrier aggregation,
//! temperature and lock status through the [`Dispatcher`], keeps the latest
//! values in a [`MonitorSnapshot`], and publishes them on the [`EventBus`].
//! Signal is published on every successful read; the other values only when
//! they change.
//!
//! The monitor has no priority over other callers. While a scan holds the
//! dispatcher for minutes, a cycle stays in flight and further ticks are
//! skipped (and counted), never queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::ModemError;
use crate::events::{DeviceEvent, EventBus};
use crate::parser::{CarrierAggregationStatus, LockStatus, SignalSample, Temperature};
use crate::probe;

/// Latest polled values and counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub running: bool,
    pub interval_ms: Option<u64>,
    pub signal: Option<SignalSample>,
    pub carriers: Option<CarrierAggregationStatus>,
    pub temperature: Option<Temperature>,
    pub lock: Option<LockStatus>,
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub errors_total: u64,
    pub last_error: Option<String>,
}

/// Shared monitor state updated by the poll cycles.
#[derive(Default)]
struct MonitorState {
    signal: Option<SignalSample>,
    carriers: Option<CarrierAggregationStatus>,
    temperature: Option<Temperature>,
    lock: Option<LockStatus>,
    cycles: u64,
    skipped_ticks: u64,
    errors_total: u64,
    last_error: Option<String>,
}

struct Running {
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    dispatcher: Dispatcher,
    events: EventBus,
    state: Mutex<MonitorState>,
    in_flight: AtomicBool,
    running: StdMutex<Option<Running>>,
}

#[derive(Clone)]
pub struct DeviceMonitor {
    inner: Arc<Inner>,
}

impl DeviceMonitor {
    pub fn new(dispatcher: Dispatcher, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                events,
                state: Mutex::new(MonitorState::default()),
                in_flight: AtomicBool::new(false),
                running: StdMutex::new(None),
            }),
        }
    }

    /// Start polling every `interval`. Returns `false` if the monitor was
    /// already running with that interval; a different interval restarts it.
    pub fn start(&self, interval: Duration) -> bool {
        let interval = interval.max(Duration::from_millis(1));
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = running.as_ref() {
            if current.interval == interval && !current.handle.is_finished() {
                return false;
            }
        }
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.inner),
            interval,
            cancel.clone(),
        ));
        info!("Monitor: polling every {}ms", interval.as_millis());
        *running = Some(Running {
            interval,
            cancel,
            handle,
        });
        true
    }

    /// Stop polling. Returns `false` if it was not running. A cycle already
    /// on the wire finishes; its queued probes are withdrawn.
    pub fn stop(&self) -> bool {
        let previous = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match previous {
            Some(running) => {
                running.cancel.cancel();
                info!("Monitor: stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.interval().is_some()
    }

    fn interval(&self) -> Option<Duration> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.interval)
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let interval = self.interval();
        let state = self.inner.state.lock().await;
        MonitorSnapshot {
            running: interval.is_some(),
            interval_ms: interval.and_then(|i| u64::try_from(i.as_millis()).ok()),
            signal: state.signal.clone(),
            carriers: state.carriers.clone(),
            temperature: state.temperature.clone(),
            lock: state.lock.clone(),
            cycles: state.cycles,
            skipped_ticks: state.skipped_ticks,
            errors_total: state.errors_total,
            last_error: state.last_error.clone(),
        }
    }
}

async fn tick_loop(inner: Arc<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if inner.in_flight.swap(true, Ordering::AcqRel) {
            inner.state.lock().await.skipped_ticks += 1;
            debug!("Monitor: previous cycle still running, tick skipped");
            continue;
        }

        let cycle = Arc::clone(&inner);
        let token = cancel.clone();
        tokio::spawn(async move {
            run_cycle(&cycle, &token).await;
            cycle.in_flight.store(false, Ordering::Release);
        });
    }
}

/// Record a probe failure. Returns `true` when the rest of the cycle should
/// be abandoned.
async fn degrade(inner: &Inner, probe: &str, err: &ModemError) -> bool {
    if matches!(err, ModemError::Cancelled) {
        return true;
    }
    let errors_total = {
        let mut state = inner.state.lock().await;
        state.errors_total += 1;
        state.last_error = Some(format!("{probe}: {err}"));
        state.errors_total
    };
    debug!("Monitor: {probe} failed: {err}");
    inner.events.publish(DeviceEvent::MonitorDegraded {
        probe: probe.to_string(),
        error: err.to_string(),
        errors_total,
    });
    matches!(
        err,
        ModemError::DeviceUnavailable(_) | ModemError::Transport(_)
    )
}

async fn run_cycle(inner: &Inner, cancel: &CancellationToken) {
    let d = &inner.dispatcher;
    let cancel = Some(cancel);
    inner.state.lock().await.cycles += 1;

    match probe::read_signal(d, cancel).await {
        Ok(signal) => {
            debug!(
                "Monitor: mode={} RSRP={:?} SINR={:?} bars={}",
                signal.mode.as_str(),
                signal.rsrp_dbm,
                signal.sinr_db,
                signal.signal_bars
            );
            inner.state.lock().await.signal = Some(signal.clone());
            inner.events.publish(DeviceEvent::SignalUpdate { signal });
        }
        Err(e) => {
            if degrade(inner, "signal", &e).await {
                return;
            }
        }
    }

    match probe::read_carrier_aggregation(d, cancel).await {
        Ok(parsed) => {
            let carriers = parsed.value;
            let changed = {
                let mut state = inner.state.lock().await;
                let changed = state.carriers.as_ref() != Some(&carriers);
                state.carriers = Some(carriers.clone());
                changed
            };
            if changed {
                inner
                    .events
                    .publish(DeviceEvent::CarrierAggregationUpdate { carriers });
            }
        }
        Err(e) => {
            if degrade(inner, "carrier_aggregation", &e).await {
                return;
            }
        }
    }

    match probe::read_temperature(d, cancel).await {
        Ok(temperature) => {
            let changed = {
                let mut state = inner.state.lock().await;
                let changed = state.temperature.as_ref() != Some(&temperature);
                state.temperature = Some(temperature.clone());
                changed
            };
            if changed {
                inner
                    .events
                    .publish(DeviceEvent::TemperatureUpdate { temperature });
            }
        }
        Err(e) => {
            if degrade(inner, "temperature", &e).await {
                return;
            }
        }
    }

    match probe::read_lock_status(d, cancel).await {
        Ok(lock) => {
            let changed = {
                let mut state = inner.state.lock().await;
                let changed = state.lock.as_ref() != Some(&lock);
                state.lock = Some(lock.clone());
                changed
            };
            if changed {
                if lock.is_locked() {
                    warn!("Monitor: cell lock active: {lock:?}");
                }
                inner.events.publish(DeviceEvent::LockStatusUpdate { lock });
            }
        }
        Err(e) => {
            degrade(inner, "lock_status", &e).await;
        }
    }
}
