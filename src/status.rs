/*!
    Notifications emitted by the master and the housekeeping while running the bus.

    Nothing in this crate prints on its own: every event worth reporting goes through a [StatusCallback]. The default [LogStatus] forwards them to the [log] facade, the application chooses the logger.
*/

use core::fmt;
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicI64, Ordering},
        },
    };
use crate::{
    registers::{al_status_message, RxErrorCounters},
    slave::SlaveState,
    };


/// minimum time between two repetitions of a throttled message
pub const SYNC_MESSAGES_INTERVAL: i64 = 5_000_000_000;

/// steps of the master and slave configuration, reported when tracing
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TraceEvent {
    OpenInterface,
    InitializingSlaves,
    ConfiguringSlaves,
    DcEnabled,
    DcDisabled,
    AllocateIomap,
    LinkBuffers,
    ConfigureTxrx,
    ConfigureComplete,
    StopHouseholder,
    SwitchPreop,
    CleanupSlaves,
    ConfigureDc,
    ClearPdos,
    WritePdos,
    WritePdoSize,
    ReconfigToPreop,
    ReconfigToSafeop,
    RecoverSlave,
    RecoveredSlave,
    SlaveFound,
    SlaveLost,
    ReadWatchdogDiv,
    WriteWatchdogTimeout,
}
impl TraceEvent {
    pub fn message(self) -> &'static str {
        match self {
            Self::OpenInterface => "Opening interface",
            Self::InitializingSlaves => "Initializing slaves",
            Self::ConfiguringSlaves => "Configured slaves",
            Self::DcEnabled => "DC enabled",
            Self::DcDisabled => "DC disabled",
            Self::AllocateIomap => "Allocating process image",
            Self::LinkBuffers => "Linking buffers to slave data",
            Self::ConfigureTxrx => "Sending first datagram",
            Self::ConfigureComplete => "Configuration complete",
            Self::StopHouseholder => "Shutting down housekeeping thread",
            Self::SwitchPreop => "Switching slaves to PRE-OP state",
            Self::CleanupSlaves => "Cleanup slaves",
            Self::ConfigureDc => "Configuring DC settings",
            Self::ClearPdos => "Clearing PDO configuration",
            Self::WritePdos => "Writing PDO entries",
            Self::WritePdoSize => "Writing number of PDO entries",
            Self::ReconfigToPreop => "Reconfiguring to PRE-OP",
            Self::ReconfigToSafeop => "Reconfiguring to SAFE-OP",
            Self::RecoverSlave => "Recovering slave",
            Self::RecoveredSlave => "Slave recovered",
            Self::SlaveFound => "Slave found",
            Self::SlaveLost => "Slave lost",
            Self::ReadWatchdogDiv => "Reading watchdog divider",
            Self::WriteWatchdogTimeout => "Writing PDO watchdog timeout",
        }
    }
}
impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// how a slave is named in notifications
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlaveId {
    /// name given by the device
    pub name: &'static str,
    pub alias: u16,
    pub position: u16,
    /// topological index in the ring
    pub index: u16,
}
impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.name, self.alias, self.position)
    }
}

/**
    receiver of everything worth reporting while configuring and running the bus

    All methods default to doing nothing, so an implementor only picks what it is interested in. Methods are called from the thread running the housekeeping or from the thread calling [crate::Master::init], never from inside the process data exchange.
*/
#[allow(unused_variables)]
pub trait StatusCallback: Send + Sync {
    fn trace(&self, event: TraceEvent) {}
    fn trace_slave(&self, slave: &SlaveId, event: TraceEvent) {}
    fn trace_sync_manager(&self, slave: &SlaveId, sync_manager: u8, event: TraceEvent) {}

    /// a slave changed state, `al_code` is its last AL status code
    fn state_change(&self, slave: &SlaveId, previous: SlaveState, current: SlaveState, al_code: u16) {}
    /// a slave is waiting in SAFE_OP for its clock to converge since `runtime` nanoseconds
    fn dc_sync_wait(&self, slave: &SlaveId, runtime: i64, offset: i32, al_code: u16) {}
    /// the cyclic thread jitter has not converged since `runtime` nanoseconds
    fn master_stable_rate(&self, runtime: i64, jitter: i64) {}
    fn dc_not_capable(&self) {}
    fn expected_working_counter(&self, expected: u16) {}

    fn sdo_read(&self, slave: &SlaveId, index: u16, sub: u8, wkc: u16, data: &[u8]) {}
    fn sdo_write(&self, slave: &SlaveId, index: u16, sub: u8, wkc: u16, data: &[u8]) {}
    /// writing the PDO assignment of a sync manager failed
    fn pdo_configuration_error(&self, slave: &SlaveId, sync_manager: u8, pdo: u16) {}

    /// the PDO watchdog has been set to `timeout` ticks of `divider` nanoseconds
    fn watchdog_configured(&self, slave: &SlaveId, divider: u32, timeout: u16) {}
    fn watchdog_error(&self, slave: &SlaveId) {}
    /// the AL status of a slave could not be read
    fn slave_state_error(&self, slave: &SlaveId) {}
    fn rx_error(&self, slave: &SlaveId, counters: &RxErrorCounters) {}
    fn clear_rx_errors(&self, slave: &SlaveId, success: bool) {}
}

/// [StatusCallback] forwarding everything to the [log] facade, throttling the repetitive messages
#[derive(Default)]
pub struct LogStatus {
    dc_wait: Mutex<HashMap<SlaveId, i64>>,
    stable_rate: AtomicI64,
}
impl LogStatus {
    pub fn new() -> Self  {Self::default()}
}

impl StatusCallback for LogStatus {
    fn trace(&self, event: TraceEvent) {
        log::trace!("Master: {}", event);
    }
    fn trace_slave(&self, slave: &SlaveId, event: TraceEvent) {
        log::trace!("{}: {}", slave, event);
    }
    fn trace_sync_manager(&self, slave: &SlaveId, sync_manager: u8, event: TraceEvent) {
        log::trace!("{} sm({}): {}", slave, sync_manager, event);
    }

    fn state_change(&self, slave: &SlaveId, previous: SlaveState, current: SlaveState, al_code: u16) {
        log::debug!("{} changed state from {:?} to {:?}", slave, previous, current);
        match current {
            SlaveState::PreOpErr => log::error!("{} in PREOP+ERR. {}", slave, al_status_message(al_code)),
            SlaveState::SafeOpErr => log::error!("{} in SAFEOP+ERR. {}", slave, al_status_message(al_code)),
            _ => {},
        }
    }
    fn dc_sync_wait(&self, slave: &SlaveId, runtime: i64, offset: i32, al_code: u16) {
        let cycle = runtime / SYNC_MESSAGES_INTERVAL;
        let Ok(mut printed) = self.dc_wait.lock() else {return};
        let printed = printed.entry(*slave).or_insert(0);
        if cycle != *printed {
            log::warn!("{}: DC clock not synchronized or slave refused OP mode for {}ms. Current offset is {}ns. AL status: {}",
                slave, runtime / 1_000_000, offset, al_status_message(al_code));
            *printed = cycle;
        }
    }
    fn master_stable_rate(&self, runtime: i64, jitter: i64) {
        let cycle = runtime / SYNC_MESSAGES_INTERVAL;
        if self.stable_rate.swap(cycle, Ordering::Relaxed) != cycle {
            log::warn!("Master thread not converged to stable rate for {}ms. Current jitter estimate is {}ns.",
                runtime / 1_000_000, jitter);
        }
    }
    fn dc_not_capable(&self) {
        log::warn!("DC requested but the bus is not DC capable, running without DC");
    }
    fn expected_working_counter(&self, expected: u16) {
        log::info!("Expected working counter: {}", expected);
    }

    fn sdo_read(&self, slave: &SlaveId, index: u16, sub: u8, wkc: u16, data: &[u8]) {
        log::trace!("{}: read SDO {:#06x}:{} wkc {} {:?}", slave, index, sub, wkc, data);
    }
    fn sdo_write(&self, slave: &SlaveId, index: u16, sub: u8, wkc: u16, data: &[u8]) {
        log::trace!("{}: wrote SDO {:#06x}:{} wkc {} {:?}", slave, index, sub, wkc, data);
    }
    fn pdo_configuration_error(&self, slave: &SlaveId, sync_manager: u8, pdo: u16) {
        log::error!("{}: cannot configure PDO {:#06x} of sync manager {}", slave, pdo, sync_manager);
    }

    fn watchdog_configured(&self, slave: &SlaveId, divider: u32, timeout: u16) {
        log::debug!("{}: PDO watchdog set to {} x {}ns", slave, timeout, divider);
    }
    fn watchdog_error(&self, slave: &SlaveId) {
        log::warn!("{}: cannot configure PDO watchdog", slave);
    }
    fn slave_state_error(&self, slave: &SlaveId) {
        log::debug!("{}: cannot read state", slave);
    }
    fn rx_error(&self, slave: &SlaveId, counters: &RxErrorCounters) {
        log::debug!("{}: rx errors {:?}", slave, counters);
    }
    fn clear_rx_errors(&self, slave: &SlaveId, success: bool) {
        if success {log::debug!("{}: rx error counters cleared", slave)}
        else {log::warn!("{}: cannot clear rx error counters", slave)}
    }
}
