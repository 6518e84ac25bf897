/*!
    Slave registration, and the per-slave lifecycle controller run by the housekeeping.

    A slave is described before [crate::Master::init] by a [Slave]: its identity, its [Device] callbacks and its PDO watchdog. Once the bus is initialized it becomes a [SlaveController], owned by the housekeeping, which is ticked to bring the slave to OP and keep it there. The cyclic side only sees a [SlaveStatus] copied at each rendezvous.
*/

use core::{fmt, time::Duration};
use crate::{
    config::MasterConfig,
    data::{PduData, Field},
    error::{EthercatError, EthercatResult},
    mapping::Mapping,
    registers::{self, AlControlRequest, AlState, AlStatus, RxErrorCounters},
    sdo::{self, SdoRequest, SdoTransfer},
    status::{SlaveId, StatusCallback, TraceEvent},
    transport::{BusTransport, SlaveAddress},
    };


/**
    communication state of a slave as seen by the housekeeping

    It is decoded from the AL status register, states are ordered so that the lowest state of a bus is its minimum.
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum SlaveState {
    /// the slave does not answer, or reports a state that cannot be handled
    #[default]
    Offline,
    Boot,
    Init,
    PreOp,
    PreOpErr,
    SafeOp,
    SafeOpErr,
    Op,
}
impl SlaveState {
    /// decode the AL status register, mixed or erroneous states other than PRE_OP and SAFE_OP errors are offline
    pub fn from_status(status: AlStatus) -> Self {
        match u8::from(status) & 0x1f {
            0x03 => Self::Boot,
            0x01 => Self::Init,
            0x02 => Self::PreOp,
            0x12 => Self::PreOpErr,
            0x04 => Self::SafeOp,
            0x14 => Self::SafeOpErr,
            0x08 => Self::Op,
            _ => Self::Offline,
        }
    }
}
impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "OFFLINE",
            Self::Boot => "BOOT",
            Self::Init => "INIT",
            Self::PreOp => "PRE_OP",
            Self::PreOpErr => "PRE_OP+ERR",
            Self::SafeOp => "SAFE_OP",
            Self::SafeOpErr => "SAFE_OP+ERR",
            Self::Op => "OP",
        })
    }
}


/**
    register and mailbox access to one slave, given to the [Device] callbacks

    Every access blocks until the slave answers or the configured timeout elapses, so this is only meant for configuration.
*/
pub struct SlaveAccess<'a> {
    pub(crate) bus: &'a dyn BusTransport,
    pub(crate) status: &'a dyn StatusCallback,
    pub(crate) config: &'a MasterConfig,
    pub(crate) id: SlaveId,
}
impl SlaveAccess<'_> {
    pub fn id(&self) -> &SlaveId  {&self.id}
    pub fn read<T: PduData>(&self, field: Field<T>) -> EthercatResult<T> {
        self.bus.read(self.id.index, field, self.config.register_timeout)
    }
    pub fn write<T: PduData>(&self, field: Field<T>, value: T) -> EthercatResult {
        match self.bus.write(self.id.index, field, value, self.config.register_timeout)? {
            0 => Err(EthercatError::Timeout("slave did not answer")),
            _ => Ok(()),
        }
    }
    /// blocking SDO upload
    pub fn sdo_read<T: PduData>(&self, index: u16, sub: u8) -> EthercatResult<T> {
        let mut buffer = <T::Packed as crate::data::Storage>::zeroed();
        let wkc = self.bus.sdo_read(self.id.index, index, sub, buffer.as_mut(), self.config.sdo_timeout);
        self.status.sdo_read(&self.id, index, sub, wkc, buffer.as_ref());
        if wkc == 0
            {return Err(EthercatError::Timeout("SDO read failed"))}
        Ok(T::unpack(buffer.as_ref())?)
    }
    /// blocking SDO download
    pub fn sdo_write<T: PduData>(&self, index: u16, sub: u8, value: T) -> EthercatResult {
        let mut buffer = <T::Packed as crate::data::Storage>::zeroed();
        value.pack(buffer.as_mut())?;
        let wkc = self.bus.sdo_write(self.id.index, index, sub, buffer.as_ref(), self.config.sdo_timeout);
        self.status.sdo_write(&self.id, index, sub, wkc, buffer.as_ref());
        if wkc == 0
            {return Err(EthercatError::Timeout("SDO write failed"))}
        Ok(())
    }
    /// enable or disable the DC sync0 signal of this slave
    pub fn dc_sync0(&self, enable: bool, cycle: Duration, shift: Duration) {
        self.bus.dc_sync0(self.id.index, enable, cycle, shift)
    }
}

/**
    device specific behavior of a slave

    Every method has a default, a device without any specific need can use [GenericDevice].
*/
pub trait Device: Send {
    /// name used in the notifications
    fn name(&self) -> &'static str  {"Slave"}
    /**
        called before going to SAFE_OP, at initialization and each time the slave is brought back from PRE_OP.

        This is the place to write configuration SDOs. The default enables DC sync0 with the cycle period, or disables it when DC is not running.
    */
    fn configure(&mut self, slave: &SlaveAccess<'_>, dc: bool, cycle: Duration) -> EthercatResult {
        if dc  {slave.dc_sync0(true, cycle, Duration::ZERO)}
        else   {slave.dc_sync0(false, Duration::ZERO, Duration::ZERO)}
        Ok(())
    }
    /// called every cycle when the bus is shutting down, until [Self::has_shutdown]
    fn shutdown(&mut self) {}
    fn has_shutdown(&self) -> bool  {true}
    /// whether the device supports SDO complete access
    fn supports_complete_access(&self) -> bool  {true}
}

/// device without any specific configuration
#[derive(Copy, Clone, Debug, Default)]
pub struct GenericDevice;
impl Device for GenericDevice {}


/**
    registration of a slave expected on the bus

    A slave is addressed by its alias and its position after the last slave carrying this alias, as in the configured station alias scheme. A slave without alias has alias 0 and its ring position.
*/
pub struct Slave {
    pub alias: u16,
    pub position: u16,
    pub vendor: u32,
    pub product: u32,
    device: Box<dyn Device>,
    watchdog: Option<Duration>,
}
impl Slave {
    pub fn new(vendor: u32, product: u32, alias: u16, position: u16) -> Self {
        Self {alias, position, vendor, product, device: Box::new(GenericDevice), watchdog: None}
    }
    pub fn with_device(mut self, device: impl Device + 'static) -> Self {
        self.device = Box::new(device);
        self
    }
    /// configure the PDO watchdog of the slave with this timeout during configuration
    pub fn pdo_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog = Some(timeout);
        self
    }
    pub fn address(&self) -> (u16, u16)  {(self.alias, self.position)}
    pub fn name(&self) -> &'static str  {self.device.name()}
}
impl fmt::Debug for Slave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slave{{{} {}:{}, {:#x}:{:#x}}}", self.device.name(), self.alias, self.position, self.vendor, self.product)
    }
}


/// PDOs to write in the assignment object of a sync manager
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PdoAssignment {
    pub sync_manager: u8,
    pub pdos: Vec<u16>,
}
impl PdoAssignment {
    /// the assignments to write for a mapping, only channels requesting it are configured
    pub fn from_mapping(mapping: &Mapping) -> Vec<Self> {
        mapping.channels().iter()
            .filter(|channel| channel.configure)
            .map(|channel| Self {
                sync_manager: channel.index,
                pdos: channel.pdos.iter().map(|pdo| pdo.index).collect(),
                })
            .collect()
    }
}


/// what the cyclic side knows about a slave, updated at each rendezvous
#[derive(Copy, Clone, Debug, Default)]
pub struct SlaveStatus {
    pub state: SlaveState,
    pub al_code: u16,
    pub lost: bool,
    pub rx_frame_errors: [u8; 4],
    pub rx_physical_errors: [u8; 4],
    pub lost_links: [u8; 4],
    /// the application asked to reset the error counters
    pub(crate) clear_rx_errors: bool,
}
impl SlaveStatus {
    pub fn al_status_message(&self) -> &'static str  {registers::al_status_message(self.al_code)}
}


/// the bus-wide conditions the controller depends on
#[derive(Copy, Clone, Debug, Default)]
pub struct Tick {
    /// nanoseconds since the housekeeping started
    pub runtime: i64,
    /// whether the cyclic thread is stable enough for slaves to go to OP
    pub op_allowed: bool,
}

/**
    housekeeping record of a slave: it follows the slave state and brings it to OP

    Every method issues blocking register accesses, it must only be used from the housekeeping.
*/
pub struct SlaveController {
    id: SlaveId,
    vendor: u32,
    product: u32,
    device: Box<dyn Device>,
    watchdog: Option<Duration>,
    assignments: Vec<PdoAssignment>,
    dc: bool,

    state: SlaveState,
    al_code: u16,
    /// last raw AL status read
    raw: AlStatus,
    reached_op: bool,
    lost: bool,

    dc_stable: bool,
    dc_samples: u32,
    dc_previous: i32,

    counters: RxErrorCounters,
    clear_rx_errors: bool,
    /// the controller acted on the slave since the last state read
    refresh: bool,
    pub(crate) sdos: Vec<SdoTransfer>,
}

impl SlaveController {
    pub(crate) fn new(slave: Slave, id: SlaveId, assignments: Vec<PdoAssignment>, dc: bool) -> Self {
        Self {
            id,
            vendor: slave.vendor,
            product: slave.product,
            device: slave.device,
            watchdog: slave.watchdog,
            assignments,
            dc,

            state: SlaveState::Offline,
            al_code: 0,
            raw: AlStatus::default(),
            reached_op: false,
            lost: false,

            dc_stable: false,
            dc_samples: 0,
            dc_previous: 0,

            counters: RxErrorCounters::default(),
            clear_rx_errors: false,
            refresh: true,
            sdos: Vec::new(),
        }
    }
    pub fn id(&self) -> &SlaveId  {&self.id}
    pub fn state(&self) -> SlaveState  {self.state}
    pub fn al_code(&self) -> u16  {self.al_code}
    pub fn lost(&self) -> bool  {self.lost}
    pub fn dc_stable(&self) -> bool  {self.dc_stable}
    pub fn reached_op(&self) -> bool  {self.reached_op}
    pub fn counters(&self) -> &RxErrorCounters  {&self.counters}
    pub fn device(&self) -> &dyn Device  {&*self.device}
    pub fn device_mut(&mut self) -> &mut dyn Device  {&mut *self.device}
    pub(crate) fn clear_rx_errors_requested(&self) -> bool  {self.clear_rx_errors}
    /// the state must be read again even if the bus working counter did not change
    pub(crate) fn needs_refresh(&self) -> bool  {self.refresh}
    /// at least one SDO transfer is waiting
    pub fn sdo_pending(&self) -> bool  {self.sdos.iter().any(SdoTransfer::pending)}

    fn access<'a>(&self, bus: &'a dyn BusTransport, status: &'a dyn StatusCallback, config: &'a MasterConfig) -> SlaveAccess<'a> {
        SlaveAccess {bus, status, config, id: self.id}
    }

    /**
        one-time configuration of the slave before SAFE_OP, it is also run again when the slave fell back to PRE_OP

        Watchdog and PDO assignment failures are only reported, the device configuration error is returned.
    */
    pub fn configure(&mut self, bus: &dyn BusTransport, status: &dyn StatusCallback, config: &MasterConfig) -> EthercatResult {
        let access = self.access(bus, status, config);
        access.dc_sync0(false, Duration::ZERO, Duration::ZERO);

        if let Some(timeout) = self.watchdog {
            configure_pdo_watchdog(&access, timeout);
        }
        for assignment in self.assignments.iter() {
            configure_assignment(&access, assignment);
        }

        status.trace_slave(&self.id, TraceEvent::ConfigureDc);
        self.device.configure(&access, self.dc, config.cycle)
    }

    /// read the AL status and status code, returns false if the slave did not answer
    pub fn read_state(&mut self, bus: &dyn BusTransport, status: &dyn StatusCallback, config: &MasterConfig) -> bool {
        self.refresh = false;
        match bus.read_al_status(self.id.index, config.register_timeout) {
            Ok((raw, code)) => {
                let previous = self.state;
                self.raw = raw;
                self.state = SlaveState::from_status(raw);
                self.al_code = code;
                if self.state == SlaveState::Op
                    {self.reached_op = true}
                if previous != self.state
                    {status.state_change(&self.id, previous, self.state, code)}
                true
            },
            Err(_) => {
                // a slave not answering is reported like a slave in no state
                let previous = self.state;
                self.raw = AlStatus::default();
                self.state = SlaveState::Offline;
                if previous != self.state
                    {status.state_change(&self.id, previous, self.state, self.al_code)}
                status.slave_state_error(&self.id);
                false
            },
        }
    }

    /// read the port error counters, returns false if the slave did not answer
    pub fn read_statistics(&mut self, bus: &dyn BusTransport, status: &dyn StatusCallback, config: &MasterConfig) -> bool {
        match bus.read(self.id.index, registers::ports_errors, config.register_timeout) {
            Ok(counters) => {
                self.counters = counters;
                true
            },
            Err(_) => {
                status.rx_error(&self.id, &self.counters);
                false
            },
        }
    }

    /// reset all port error counters of the slave
    pub fn clear_rx_errors(&mut self, bus: &dyn BusTransport, status: &dyn StatusCallback, config: &MasterConfig) -> bool {
        self.clear_rx_errors = false;
        let success = matches!(
            bus.write(self.id.index, registers::ports_errors, RxErrorCounters::reset(), config.register_timeout),
            Ok(wkc) if wkc > 0);
        status.clear_rx_errors(&self.id, success);
        success
    }

    /**
        act according to the last state read, to bring the slave to OP or recover it

        This is one step only, and it is expected to be called again at the next housekeeping pass until the slave reaches OP.
    */
    pub fn state_control(&mut self, bus: &dyn BusTransport, status: &dyn StatusCallback, config: &MasterConfig, tick: Tick) {
        let index = self.id.index;
        let timeout = config.state_timeout;
        match self.state {
            SlaveState::Boot | SlaveState::Init => {
                if ! self.dc {
                    status.trace_slave(&self.id, TraceEvent::ReconfigToPreop);
                    if bus.reconfigure_to_preop(index, timeout)
                        {self.lost = false}
                }
            },
            SlaveState::PreOp => {
                if ! self.dc {
                    status.trace_slave(&self.id, TraceEvent::ReconfigToSafeop);
                    if let Err(err) = self.configure(bus, status, config) {
                        log::warn!("{}: configuration failed: {}", self.id, err);
                    }
                    if bus.reconfigure_to_safeop(index, timeout)
                        {self.lost = false}
                }
                self.reset_dc();
            },
            SlaveState::SafeOp => {
                if self.dc && ! self.dc_stable {
                    let offset = self.read_dc_offset(bus, config);
                    self.sample_dc(offset, config, status, tick.runtime);
                }
                else if tick.op_allowed {
                    self.request(bus, AlState::Operational, false);
                }
            },
            SlaveState::SafeOpErr => {
                self.reset_dc();
                self.request(bus, AlState::SafeOperational, true);
            },
            SlaveState::Offline => {
                if ! self.lost {
                    let answer = bus.state_check(SlaveAddress::Slave(index), AlState::Operational, config.register_timeout);
                    if let Ok(raw) = answer
                        {self.raw = raw}
                    if answer.map_or(true, |raw| u8::from(raw) & 0x0f == 0) {
                        self.lost = true;
                        status.trace_slave(&self.id, TraceEvent::SlaveLost);
                    }
                }
            },
            SlaveState::PreOpErr | SlaveState::Op => {},
        }
        self.refresh = ! matches!(self.state, SlaveState::PreOpErr | SlaveState::Op);

        if ! self.dc && config.recovery && self.lost {
            if u8::from(self.raw) & 0x0f == 0 {
                status.trace_slave(&self.id, TraceEvent::RecoverSlave);
                if bus.recover_slave(index, timeout) {
                    self.lost = false;
                    status.trace_slave(&self.id, TraceEvent::RecoveredSlave);
                }
            }
            else {
                self.lost = false;
                status.trace_slave(&self.id, TraceEvent::SlaveFound);
            }
        }
    }

    /// disable the DC sync signals, called once when the bus shuts down
    pub fn cleanup(&mut self, bus: &dyn BusTransport) {
        bus.dc_sync0(self.id.index, false, Duration::ZERO, Duration::ZERO);
    }

    /// give back the registration and the SDO transfers the controller was built from
    pub(crate) fn release(self) -> (Slave, Vec<SdoTransfer>) {
        let slave = Slave {
            alias: self.id.alias,
            position: self.id.position,
            vendor: self.vendor,
            product: self.product,
            device: self.device,
            watchdog: self.watchdog,
            };
        (slave, self.sdos)
    }

    /// copy the housekeeping variables to the cyclic side, and exchange the SDO data
    pub(crate) fn sync(&mut self, status: &mut SlaveStatus, requests: &mut [SdoRequest]) {
        status.state = self.state;
        status.al_code = self.al_code;
        status.lost = self.lost;
        let counters = self.counters;
        for (i, port) in {counters.port}.iter().enumerate() {
            status.rx_frame_errors[i] = port.frame();
            status.rx_physical_errors[i] = port.physical();
        }
        status.lost_links = counters.lost_link;
        if core::mem::take(&mut status.clear_rx_errors)
            {self.clear_rx_errors = true}

        for (request, transfer) in requests.iter_mut().zip(self.sdos.iter_mut()) {
            sdo::sync(request, transfer);
        }
    }

    fn request(&self, bus: &dyn BusTransport, state: AlState, ack: bool) {
        // the answer is checked by the next state read
        let _ = bus.write_state(
            SlaveAddress::Slave(self.id.index),
            AlControlRequest::new(state.into(), ack, false),
            );
    }

    fn reset_dc(&mut self) {
        self.dc_stable = false;
        self.dc_samples = 0;
    }

    /// signed DC offset, the largest offset if it cannot be read
    fn read_dc_offset(&self, bus: &dyn BusTransport, config: &MasterConfig) -> i32 {
        bus.read(self.id.index, registers::clock::system_difference, config.register_timeout)
            .map_or(i32::MAX, |difference| difference.nanoseconds())
    }

    /// count consecutive offsets in bound until the slave clock is considered stable
    fn sample_dc(&mut self, offset: i32, config: &MasterConfig, status: &dyn StatusCallback, runtime: i64) {
        let bound = config.dc_bound.as_nanos() as i64;
        if i64::from(offset).abs() < bound {
            // a zero offset right after a nonzero one is a slave clock not yet running
            if offset != 0 || self.dc_previous == 0 {
                if self.dc_samples > config.dc_samples
                    {self.dc_stable = true}
                self.dc_samples += 1;
            }
            else {
                self.dc_samples = 0;
            }
        }
        else {
            status.dc_sync_wait(&self.id, runtime, offset, self.al_code);
        }
        self.dc_previous = offset;
    }
}

/// set the PDO watchdog timeout, in multiples of the watchdog divider
fn configure_pdo_watchdog(slave: &SlaveAccess<'_>, timeout: Duration) {
    slave.status.trace_slave(&slave.id, TraceEvent::ReadWatchdogDiv);
    let Ok(raw) = slave.read(registers::watchdog_divider)
        else {return slave.status.watchdog_error(&slave.id)};
    // the divider is in 40ns ticks, minus 2
    let divider = 40 * (u32::from(raw) + 2);
    let ticks = (timeout.as_nanos() / u128::from(divider)).min(u16::MAX.into()) as u16;
    slave.status.watchdog_configured(&slave.id, divider, ticks);
    slave.status.trace_slave(&slave.id, TraceEvent::WriteWatchdogTimeout);
    if slave.write(registers::sync_manager::watchdog, ticks).is_err() {
        slave.status.watchdog_error(&slave.id);
    }
}

/// write the PDO assignment of a sync manager, stops at the first failure
fn configure_assignment(slave: &SlaveAccess<'_>, assignment: &PdoAssignment) {
    let index = registers::sdo::pdo_assignment + u16::from(assignment.sync_manager);
    let sm = assignment.sync_manager;
    let failed = |pdo: u16| slave.status.pdo_configuration_error(&slave.id, sm, pdo);

    slave.status.trace_sync_manager(&slave.id, sm, TraceEvent::ClearPdos);
    if slave.sdo_write(index, 0, 0u8).is_err()
        {return failed(0)}
    slave.status.trace_sync_manager(&slave.id, sm, TraceEvent::WritePdos);
    for (i, &pdo) in assignment.pdos.iter().enumerate() {
        if slave.sdo_write(index, i as u8 + 1, pdo).is_err()
            {return failed(pdo)}
    }
    slave.status.trace_sync_manager(&slave.id, sm, TraceEvent::WritePdoSize);
    if slave.sdo_write(index, 0, assignment.pdos.len() as u8).is_err()
        {return failed(0)}
}

/// process data size of an unregistered slave kept on the bus, it is not accessible
pub(crate) fn placeholder_size(input_bits: usize, output_bits: usize) -> usize {
    (input_bits + 7) / 8 + (output_bits + 7) / 8
}
