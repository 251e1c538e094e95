//! The command surface adapters talk to.
//!
//! [`Device`] is built once at startup and owns every long-lived part of the
//! core: the [`Dispatcher`], the [`EventBus`], the [`DeviceMonitor`] and the
//! [`ScanOrchestrator`]. HTTP/WS handlers or the CLI hold an `Arc<Device>`.
//!
//! All methods go through the dispatcher's single queue. While a scan is in
//! its `scanning` phase the channel is held for minutes, so adapter calls
//! queue behind it and monitor ticks are skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ConnectionState, Connector, SerialConnector, TcpConnector};
use crate::command::{at, Response};
use crate::config::{Config, Transport};
use crate::dispatcher::Dispatcher;
use crate::error::ModemError;
use crate::events::{DeviceEvent, EventBus};
use crate::monitor::{DeviceMonitor, MonitorSnapshot};
use crate::parser::{
    band_name, parse_band_label, CarrierAggregationStatus, LockParams, LockStatus, ModemInfo, Rat,
    SignalSample, Temperature,
};
use crate::probe;
use crate::scan::{ScanError, ScanOrchestrator, ScanSession};

/// Highest physical cell id per RAT.
const MAX_LTE_PCI: u16 = 503;
const MAX_NR_PCI: u16 = 1007;

/// Subcarrier spacing (kHz) the modem expects when locking an NR band.
pub fn nr_scs_khz(band: u16) -> u16 {
    match band {
        38 | 40 | 41 | 48 | 77 | 78 | 79 => 30,
        257..=261 => 120,
        _ => 15,
    }
}

/// Connector for the configured transport.
pub fn connector_for(config: &Config) -> Arc<dyn Connector> {
    match config.modem.transport {
        Transport::Tcp => Arc::new(TcpConnector::new(
            config.modem.address.clone(),
            config.connect_timeout(),
        )),
        Transport::Serial => Arc::new(SerialConnector::new(
            config.modem.serial_device.clone(),
            config.modem.baud,
        )),
    }
}

pub struct Device {
    dispatcher: Dispatcher,
    events: EventBus,
    monitor: DeviceMonitor,
    scan: ScanOrchestrator,
    info: ModemInfo,
    monitor_interval: Duration,
}

impl Device {
    /// Connect to the configured modem and start every background task.
    pub async fn start(config: &Config) -> Result<Self, ModemError> {
        Self::with_connector(connector_for(config), config).await
    }

    pub async fn with_connector(
        connector: Arc<dyn Connector>,
        config: &Config,
    ) -> Result<Self, ModemError> {
        let dispatcher = Dispatcher::start(
            connector,
            config.channel_config(),
            config.dispatcher_config(),
        )
        .await?;

        let events = EventBus::default();
        let monitor = DeviceMonitor::new(dispatcher.clone(), events.clone());
        let scan = ScanOrchestrator::new(dispatcher.clone(), events.clone(), config.scan_config());

        let info = probe::read_modem_info(&dispatcher).await;
        if info.is_empty() {
            warn!("Modem {}: no identity reported", dispatcher.endpoint());
        }
        info!(
            "Modem {}: model={} firmware={} imei={}",
            dispatcher.endpoint(),
            info.model.as_deref().unwrap_or("?"),
            info.firmware.as_deref().unwrap_or("?"),
            info.imei.as_deref().unwrap_or("?"),
        );

        let monitor_interval = config.monitor_interval();
        if config.monitor.enabled {
            monitor.start(monitor_interval);
        }

        Ok(Self {
            dispatcher,
            events,
            monitor,
            scan,
            info,
            monitor_interval,
        })
    }

    /// Send a free-form AT command and return its data lines.
    pub async fn send_raw_command(&self, text: &str) -> Result<Response, ModemError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ModemError::invalid_argument("empty command"));
        }
        if text.contains(['\r', '\n']) {
            return Err(ModemError::invalid_argument(
                "command must be a single line",
            ));
        }
        if !text
            .get(..2)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("AT"))
        {
            return Err(ModemError::invalid_argument(format!(
                "not an AT command: {text}"
            )));
        }
        self.dispatcher
            .execute(self.dispatcher.quick_command(text))
            .await
    }

    pub async fn get_signal(&self) -> Result<SignalSample, ModemError> {
        probe::read_signal(&self.dispatcher, None).await
    }

    /// Carrier aggregation. Records that fail to parse are dropped and logged.
    pub async fn get_carrier_aggregation_status(
        &self,
    ) -> Result<CarrierAggregationStatus, ModemError> {
        Ok(probe::read_carrier_aggregation(&self.dispatcher, None)
            .await?
            .value)
    }

    pub async fn get_lock_status(&self) -> Result<LockStatus, ModemError> {
        probe::read_lock_status(&self.dispatcher, None).await
    }

    pub async fn get_temperature(&self) -> Result<Temperature, ModemError> {
        probe::read_temperature(&self.dispatcher, None).await
    }

    /// Lock onto one cell. `band` takes any of `n78`, `B3`, `b3` or `3`
    /// (a bare number means LTE).
    pub async fn lock_cell(
        &self,
        band: &str,
        arfcn: u32,
        pci: u16,
    ) -> Result<LockStatus, ModemError> {
        let (rat, band_number) = parse_band_label(band)
            .ok_or_else(|| ModemError::invalid_argument(format!("unrecognized band: {band}")))?;

        let max_pci = match rat {
            Rat::Lte => MAX_LTE_PCI,
            Rat::Nr => MAX_NR_PCI,
        };
        if pci > max_pci {
            return Err(ModemError::invalid_argument(format!(
                "{} PCI {pci} out of range 0-{max_pci}",
                rat.as_str()
            )));
        }

        let (command, scs_khz) = match rat {
            Rat::Nr => {
                let scs = nr_scs_khz(band_number);
                (at::lock_nr(pci, arfcn, scs, band_number), Some(scs))
            }
            Rat::Lte => (at::lock_lte(arfcn, pci), None),
        };
        self.dispatcher
            .execute(self.dispatcher.quick_command(command))
            .await?;

        // Same shape the lock query reports, so the monitor sees no change.
        let status = LockStatus::Locked {
            rat,
            params: Some(LockParams {
                band: (rat == Rat::Nr).then(|| band_name(rat, band_number)),
                arfcn,
                pci,
                scs_khz,
            }),
        };
        info!(
            "Modem {}: locked to {} ARFCN {arfcn} PCI {pci}",
            self.dispatcher.endpoint(),
            band_name(rat, band_number)
        );
        self.events.publish(DeviceEvent::LockStatusUpdate {
            lock: status.clone(),
        });
        Ok(status)
    }

    /// Clear both the NR and the LTE lock. Firmware without one of the two
    /// lock modes rejects it; that alone is not a failure.
    pub async fn unlock_cell(&self) -> Result<(), ModemError> {
        let mut rejected = Vec::new();
        for command in [at::UNLOCK_NR, at::UNLOCK_LTE] {
            match self
                .dispatcher
                .execute(self.dispatcher.quick_command(command))
                .await
            {
                Ok(_) => {}
                Err(e @ ModemError::CommandRejected { .. }) => {
                    debug!("Modem: {command} rejected: {e}");
                    rejected.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        if rejected.len() == 2 {
            if let Some(e) = rejected.pop() {
                return Err(e);
            }
        }
        info!("Modem {}: cell lock cleared", self.dispatcher.endpoint());
        self.events.publish(DeviceEvent::LockStatusUpdate {
            lock: LockStatus::Unlocked,
        });
        Ok(())
    }

    /// Start a cell scan in the background. The modem is detached from the
    /// network until [`restore_network`](Self::restore_network) is called.
    pub fn start_scan(&self) -> Result<Uuid, ScanError> {
        self.scan.start_scan()
    }

    pub async fn restore_network(&self) -> Result<(), ScanError> {
        self.scan.restore_network().await
    }

    /// Re-attach without a scan session in this process.
    pub async fn reattach(&self) -> Result<(), ScanError> {
        self.scan.reattach().await
    }

    /// Clear a finished scan so the next one can start.
    pub fn acknowledge_scan(&self) -> Result<Option<ScanSession>, ScanError> {
        self.scan.acknowledge()
    }

    pub fn scan_session(&self) -> Option<ScanSession> {
        self.scan.session()
    }

    pub fn last_scan_session(&self) -> Option<ScanSession> {
        self.scan.last_session()
    }

    /// Turn background polling on or off. `interval` defaults to the
    /// configured one. Returns whether anything changed.
    pub fn enable_monitoring(&self, enabled: bool, interval: Option<Duration>) -> bool {
        if enabled {
            let interval = interval.unwrap_or(self.monitor_interval);
            if interval.is_zero() {
                warn!("Monitor: zero interval requested, using {:?}", self.monitor_interval);
                return self.monitor.start(self.monitor_interval);
            }
            self.monitor.start(interval)
        } else {
            self.monitor.stop()
        }
    }

    pub async fn monitor_snapshot(&self) -> MonitorSnapshot {
        self.monitor.snapshot().await
    }

    /// Identity read at startup.
    pub fn modem_info(&self) -> &ModemInfo {
        &self.info
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.dispatcher.connection_state()
    }

    pub fn endpoint(&self) -> &str {
        self.dispatcher.endpoint()
    }

    /// Stop the monitor, abort any scan task, then close the channel.
    ///
    /// A scan aborted while detached leaves the modem detached; callers
    /// should restore first when [`scan_session`](Self::scan_session) shows
    /// one pending.
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.scan.shutdown();
        self.dispatcher.shutdown().await;
        info!("Modem {}: shut down", self.dispatcher.endpoint());
    }
}
