/*!
    The master orchestrating a whole ethercat segment: it checks the bus against the registered slaves, maps the process image, and then exchanges it every cycle while the housekeeping brings the slaves to OP.

    ## Example

    The typical use of a master, here with a bus driven by the application's own loop:

    ```ignore
    let mut master = Master::new(bus, MasterConfig::new("eno1").dc(true, Duration::from_micros(50)));
    let drive = master.register_slave(Slave::new(0x2, 0x1a4a3052, 0, 0))?;
    let position = {
        let mut mapping = master.mapping(drive)?;
        let mut channel = mapping.channel(0x13, Direction::Input, true);
        let mut pdo = channel.push(0x1a00);
        pdo.push::<i32>("position")
    };
    master.init()?;

    loop {
        master.send()?;
        if let Receive::WorkingCounter(_) = master.receive() {
            let position = master.get(position)?;
            // control
        }
        master.update_state_variables();
        // wait for next cycle
    }
    ```
*/

use std::{
    sync::Arc,
    thread::JoinHandle,
    };
use core::time::Duration;
use crate::{
    config::{MasterConfig, HousekeepingMode},
    coordinator::Coordinator,
    data::{PduData, BitField},
    error::{EthercatError, EthercatResult, ConfigError},
    mapping::{Direction, Entry, Mapping, ProcessImage},
    registers::{AlControlRequest, AlState},
    sdo::{self, SdoHandle, SdoObject, SdoRequest, SdoTransfer, Reader, Writer, ReadSdo, WriteSdo},
    slave::{Slave, SlaveController, SlaveState, SlaveStatus, PdoAssignment, placeholder_size},
    statemachine::{BusStatus, Householder, Housekeeping},
    status::{LogStatus, SlaveId, StatusCallback, TraceEvent},
    transport::{BusTransport, SlaveAddress, Receive},
    };


/// handle on a registered slave, returned by [Master::register_slave]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlaveHandle(usize);
impl SlaveHandle {
    /// rank of the slave in registration order
    pub fn index(&self) -> usize  {self.0}
}

/**
    Master of an ethercat segment.

    All methods are meant to be called from the cyclic thread. Only [Self::init] and [Self::shutdown] issue blocking accesses to the bus, everything else in the cycle is non-blocking as long as the transport's process data exchange is.

    The slaves are owned by the housekeeping once initialized, the cyclic side only sees their [SlaveStatus] as copied at the last call to [Self::update_state_variables].
*/
pub struct Master {
    bus: Arc<dyn BusTransport>,
    status: Arc<dyn StatusCallback>,
    config: MasterConfig,

    registered: Vec<Slave>,
    mappings: Vec<Mapping>,
    transfers: Vec<Vec<SdoTransfer>>,
    requests: Vec<Vec<SdoRequest>>,
    statuses: Vec<SlaveStatus>,

    image: ProcessImage,
    shared: Arc<BusStatus>,
    jitter: JitterEstimator,
    expected_wkc: u16,
    start_dc_time: i64,

    housekeeping: Option<Arc<Coordinator<Housekeeping>>>,
    thread: Option<JoinHandle<()>>,
    initialized: bool,
    opened: bool,
    shut_down: bool,
}

impl Master {
    /// create a master on the given transport, nothing is sent on the bus before [Self::init]
    pub fn new(bus: Arc<dyn BusTransport>, config: MasterConfig) -> Self {
        Self {
            bus,
            status: Arc::new(LogStatus::new()),
            config,

            registered: Vec::new(),
            mappings: Vec::new(),
            transfers: Vec::new(),
            requests: Vec::new(),
            statuses: Vec::new(),

            image: ProcessImage::new(0),
            shared: Arc::new(BusStatus::default()),
            jitter: JitterEstimator::default(),
            expected_wkc: 0,
            start_dc_time: 0,

            housekeeping: None,
            thread: None,
            initialized: false,
            opened: false,
            shut_down: false,
        }
    }
    /// replace the default notifications going to the log
    pub fn with_status(mut self, status: Arc<dyn StatusCallback>) -> Self {
        self.status = status;
        self
    }
    pub fn config(&self) -> &MasterConfig  {&self.config}
    /// the status receiver in use
    pub fn status(&self) -> &Arc<dyn StatusCallback>  {&self.status}

    /**
        register a slave expected on the bus

        Every slave on the bus must be registered before [Self::init], unless [MasterConfig::require_all_slaves] is disabled.
    */
    pub fn register_slave(&mut self, slave: Slave) -> EthercatResult<SlaveHandle> {
        if self.initialized
            {return Err(EthercatError::Master("cannot register slaves after init"))}
        if self.registered.iter().any(|other| other.address() == slave.address()) {
            return Err(ConfigError::DuplicateAddress {alias: slave.alias, position: slave.position}.into())
        }
        let handle = SlaveHandle(self.registered.len());
        log::debug!("registered {:?}", slave);
        self.registered.push(slave);
        self.mappings.push(Mapping::new(handle.0));
        self.transfers.push(Vec::new());
        self.requests.push(Vec::new());
        Ok(handle)
    }
    /// PDO schema of a registered slave, it can only be changed before [Self::init]
    pub fn mapping(&mut self, slave: SlaveHandle) -> EthercatResult<&mut Mapping> {
        if self.initialized
            {return Err(EthercatError::Master("cannot change the mapping after init"))}
        self.mappings.get_mut(slave.0)
            .ok_or(EthercatError::Master("unknown slave"))
    }
    /**
        register an object transferred asynchronously with the given slave

        The returned handle is either a [ReadSdo] or a [WriteSdo], and gives access to the object through [Self::read_sdo] or [Self::write_sdo]
    */
    pub fn register_sdo<H: SdoHandle>(&mut self, slave: SlaveHandle, object: SdoObject) -> EthercatResult<H> {
        if self.initialized
            {return Err(EthercatError::Master("cannot register SDOs after init"))}
        let (request, transfer) = sdo::split(object, H::DIRECTION)?;
        let (Some(requests), Some(transfers)) = (self.requests.get_mut(slave.0), self.transfers.get_mut(slave.0))
            else {return Err(EthercatError::Master("unknown slave"))};
        requests.push(request);
        transfers.push(transfer);
        Ok(H::new(slave.0, requests.len() - 1))
    }
    /// cyclic access to an object read from a slave
    pub fn read_sdo(&mut self, handle: ReadSdo) -> EthercatResult<Reader<'_>> {
        Ok(Reader(self.request(handle)?))
    }
    /// cyclic access to an object written to a slave
    pub fn write_sdo(&mut self, handle: WriteSdo) -> EthercatResult<Writer<'_>> {
        Ok(Writer(self.request(handle)?))
    }
    fn request(&mut self, handle: impl SdoHandle) -> EthercatResult<&mut SdoRequest> {
        let (slave, sdo) = handle.location();
        self.requests.get_mut(slave)
            .and_then(|requests| requests.get_mut(sdo))
            .ok_or(EthercatError::Master("unknown SDO"))
    }

    /**
        open the bus, check it matches the registered slaves, configure them and map the process image

        The slaves are then in SAFE_OP and the housekeeping is running (or ready to run when [HousekeepingMode::Inline]). Any mismatch between the bus and the registered slaves is reported as [EthercatError::Config].

        On failure the bus is switched back to PRE_OP and closed, the registrations are kept so the initialization can be tried again.
    */
    pub fn init(&mut self) -> EthercatResult {
        if self.initialized
            {return Err(EthercatError::Master("master already initialized"))}
        let interface = self.config.interface.clone()
            .ok_or(EthercatError::Master("no network interface configured"))?;

        self.status.trace(TraceEvent::OpenInterface);
        if let Err(err) = self.bus.open(&interface) {
            log::error!("cannot open {}: {}", interface, err);
            return Err(ConfigError::InterfaceUnavailable(interface).into())
        }
        self.opened = true;

        let mut controllers = Vec::new();
        if let Err(err) = self.configure_bus(&mut controllers) {
            self.abort_init(controllers);
            return Err(err)
        }
        self.statuses = vec![SlaveStatus::default(); controllers.len()];

        let coordinator = Arc::new(Coordinator::new(Housekeeping::new(Householder {
            bus: self.bus.clone(),
            status: self.status.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            slaves: controllers,
            })));
        match self.config.housekeeping {
            HousekeepingMode::Thread => match coordinator.spawn(self.config.park, Housekeeping::pass, Housekeeping::teardown) {
                Ok(thread) => self.thread = Some(thread),
                Err(err) => {
                    // the thread closure is dropped with the failed spawn
                    let controllers = Arc::try_unwrap(coordinator).ok()
                        .map(|coordinator| coordinator.into_inner().into_slaves())
                        .unwrap_or_default();
                    self.abort_init(controllers);
                    return Err(err.into())
                },
            },
            HousekeepingMode::Inline => coordinator.start(),
        }
        self.housekeeping = Some(coordinator);
        self.initialized = true;

        self.status.trace(TraceEvent::ConfigureComplete);
        Ok(())
    }

    /// blocking part of [Self::init], the registered slaves are moved to `controllers` as soon as the bus matches them
    fn configure_bus(&mut self, controllers: &mut Vec<SlaveController>) -> EthercatResult {
        self.status.trace(TraceEvent::InitializingSlaves);
        let discovered = self.bus.enumerate()?;

        if self.config.dc && ! self.bus.configure_dc() {
            self.config.dc = false;
            self.status.dc_not_capable();
        }
        self.status.trace(if self.config.dc {TraceEvent::DcEnabled} else {TraceEvent::DcDisabled});
        self.shared.set_dc(self.config.dc);

        self.status.trace(TraceEvent::ConfiguringSlaves);
        let registered = self.registered.len();
        let online = discovered.len();
        if registered > online
            {return Err(ConfigError::SlavesOffline {online, registered}.into())}
        if registered < online && self.config.require_all_slaves
            {return Err(ConfigError::SlavesNotConfigured {online, registered}.into())}

        // ring index of each registered slave
        let mut ring = vec![None; registered];
        let mut size = 0;
        let mut previous = None;
        for (index, found) in discovered.iter().enumerate() {
            let (alias, position) = station_address(previous, found.alias);
            previous = Some((alias, position));

            match self.registered.iter().position(|slave| slave.address() == (alias, position)) {
                Some(rank) => {
                    let slave = &self.registered[rank];
                    if slave.vendor != found.vendor || slave.product != found.product
                        {return Err(ConfigError::InvalidSlaveIdentity {alias, position}.into())}
                    ring[rank] = Some(index);
                    size += self.mappings[rank].process_data_size();
                },
                None if ! self.config.require_all_slaves => {
                    log::warn!("slave {}:{} is not registered, it stays on the bus without process data access", alias, position);
                    size += placeholder_size(found.input_bits, found.output_bits);
                },
                None => return Err(ConfigError::UnconfiguredSlave {alias, position}.into()),
            }
        }
        let ring = ring.into_iter()
            .collect::<Option<Vec<usize>>>()
            .ok_or(ConfigError::SlavesOffline {online, registered})?;

        for (rank, (slave, transfers)) in core::mem::take(&mut self.registered).into_iter()
                .zip(core::mem::take(&mut self.transfers))
                .enumerate() {
            let id = SlaveId {
                name: slave.name(),
                alias: slave.alias,
                position: slave.position,
                index: ring[rank] as u16,
                };
            let assignments = PdoAssignment::from_mapping(&self.mappings[rank]);
            let mut controller = SlaveController::new(slave, id, assignments, self.config.dc);
            controller.sdos = transfers;
            controllers.push(controller);
        }
        // configure in ring order
        let mut order = (0 .. registered).collect::<Vec<_>>();
        order.sort_by_key(|&rank| ring[rank]);
        for rank in order {
            let controller = &mut controllers[rank];
            if ! controller.device().supports_complete_access()
                {self.bus.disable_complete_access(controller.id().index)}
            controller.configure(&*self.bus, &*self.status, &self.config)?;
        }

        self.status.trace(TraceEvent::AllocateIomap);
        let map = self.bus.map_process_image(size)?;
        if map.size != size
            {return Err(ConfigError::ImageSizeMismatch {expected: size, allocated: map.size}.into())}
        if map.slaves.len() != online
            {return Err(EthercatError::Protocol("process image is not mapped for every slave"))}

        let safeop = self.bus.state_check(SlaveAddress::Broadcast, AlState::SafeOperational, self.config.state_timeout)
            .map_or(false, |reached| SlaveState::from_status(reached) >= SlaveState::SafeOp);
        if ! safeop
            {return Err(ConfigError::SafeOpTimeout.into())}

        self.status.trace(TraceEvent::LinkBuffers);
        for (rank, mapping) in self.mappings.iter_mut().enumerate() {
            let regions = map.slaves[ring[rank]];
            let id = controllers[rank].id();
            mapping.link_slave(Direction::Input, regions.inputs, id.alias, id.position)?;
            mapping.link_slave(Direction::Output, regions.outputs, id.alias, id.position)?;
        }
        self.image = ProcessImage::new(size);

        self.status.trace(TraceEvent::ConfigureTxrx);
        self.bus.send(self.image.as_slice())?;
        self.bus.receive(self.image.as_mut_slice(), self.config.receive_timeout);

        self.expected_wkc = map.outputs_wkc * 2 + map.inputs_wkc;
        self.shared.set_expected_working_counter(self.expected_wkc);
        self.status.expected_working_counter(self.expected_wkc);

        if self.config.dc
            {self.start_dc_time = self.bus.dc_time()}
        Ok(())
    }

    /// undo a failed [Self::init]: slaves back to PRE_OP without sync signals, registrations restored, bus closed
    fn abort_init(&mut self, controllers: Vec<SlaveController>) {
        self.status.trace(TraceEvent::SwitchPreop);
        if let Err(err) = self.bus.write_state(
                SlaveAddress::Broadcast,
                AlControlRequest::new(AlState::PreOperational.into(), false, false),
                ) {
            log::warn!("cannot switch slaves to PRE-OP: {}", err);
        }
        for mut controller in controllers {
            controller.cleanup(&*self.bus);
            let (slave, transfers) = controller.release();
            self.registered.push(slave);
            self.transfers.push(transfers);
        }
        for mapping in self.mappings.iter_mut() {
            mapping.unlink();
        }
        self.image = ProcessImage::new(0);
        self.expected_wkc = 0;
        self.statuses.clear();
        self.bus.close();
        self.opened = false;
    }

    /// send the process data, call cyclically before [Self::receive]
    pub fn send(&self) -> EthercatResult {
        self.bus.send(self.image.as_slice())
    }
    /**
        receive the process data, call cyclically after [Self::send]

        With DC, the arrival times are used to estimate the jitter of the cyclic thread (RFC 1889). The working counter should be checked against [Self::expected_working_counter].
    */
    pub fn receive(&mut self) -> Receive {
        let received = self.bus.receive(self.image.as_mut_slice(), self.config.receive_timeout);
        if let Receive::WorkingCounter(wkc) = received {
            if self.config.dc {
                self.jitter.update(self.bus.dc_time(), self.config.cycle_ns());
                self.shared.set_jitter(self.jitter.estimate, self.jitter.samples);
            }
            self.shared.set_working_counter(wkc);
        }
        received
    }
    /// receive the process data without estimating the jitter, to exchange more than one frame per cycle
    pub fn receive_simple(&mut self) -> Receive {
        self.bus.receive(self.image.as_mut_slice(), self.config.receive_timeout)
    }

    /**
        rendezvous with the housekeeping: copy the slaves' status and exchange the SDO data, then wake up the housekeeping

        Nothing is done and false is returned if the housekeeping is still running. Call after [Self::receive].
    */
    pub fn update_state_variables(&mut self) -> bool {
        let Some(coordinator) = &self.housekeeping
            else {return false};
        let Some(mut house) = coordinator.try_lock_cyclic()
            else {return false};
        house.sync(&mut self.statuses, &mut self.requests);
        house.release_and_start_state_control();
        true
    }
    /// run one housekeeping pass from the calling thread, returns false if it was not its turn
    pub fn do_state_control(&self) -> bool {
        self.housekeeping.as_ref()
            .map_or(false, |coordinator| coordinator.run_state_control(Housekeeping::pass))
    }

    /// lowest state of the registered slaves, offline before [Self::init] or without any slave registered
    pub fn state(&self) -> SlaveState {
        self.statuses.iter()
            .map(|status| status.state)
            .min()
            .unwrap_or(SlaveState::Offline)
    }
    /// status of a slave as seen at the last rendezvous
    pub fn slave_status(&self, slave: SlaveHandle) -> Option<&SlaveStatus> {
        self.statuses.get(slave.0)
    }
    /// ask the housekeeping to reset the port error counters of a slave
    pub fn clear_rx_errors(&mut self, slave: SlaveHandle) {
        if let Some(status) = self.statuses.get_mut(slave.0)
            {status.clear_rx_errors = true}
    }

    /// read an entry of the process image
    pub fn get<T: PduData>(&self, entry: Entry<T>) -> EthercatResult<T> {
        self.image.get(self.field(entry)?)
    }
    /// write an entry of the process image, it is sent by the next [Self::send]
    pub fn set<T: PduData>(&mut self, entry: Entry<T>, value: T) -> EthercatResult {
        let field = self.field(entry)?;
        self.image.set(field, value)
    }
    fn field<T: PduData>(&self, entry: Entry<T>) -> EthercatResult<BitField<T>> {
        self.mappings.get(entry.slave())
            .ok_or(EthercatError::Master("unknown slave"))?
            .field(entry)
    }
    /// raw process image
    pub fn image(&self) -> &[u8]  {self.image.as_slice()}

    /**
        call cyclically to run the devices' shutdown, returns true once all of them report they have shut down

        This does not exchange the process data, so the application keeps calling [Self::send] and [Self::receive] meanwhile.
    */
    pub fn shutdown_slaves(&mut self) -> bool {
        let Some(coordinator) = &self.housekeeping
            else {return true};
        let Some(mut house) = coordinator.try_lock_cyclic()
            else {return false};
        let mut done = true;
        for slave in house.slaves_mut() {
            if ! slave.device().has_shutdown() {
                done = false;
                slave.device_mut().shutdown();
            }
        }
        done
    }
    /**
        stop the housekeeping, switch the bus to PRE_OP and release the transport

        Shutting down the devices is the application's responsibility, see [Self::shutdown_slaves]. Only the first call has effect.
    */
    pub fn shutdown(&mut self) {
        if core::mem::replace(&mut self.shut_down, true)
            {return}
        self.status.trace(TraceEvent::StopHouseholder);
        if let Some(mut coordinator) = self.housekeeping.take() {
            coordinator.shutdown();
            match self.thread.take() {
                Some(thread) => if thread.join().is_err() {
                    log::error!("housekeeping thread panicked, slaves are left in their current state");
                },
                None => match Arc::get_mut(&mut coordinator) {
                    Some(coordinator) => coordinator.get_mut().teardown(),
                    None => log::warn!("housekeeping still in use, slaves are left in their current state"),
                },
            }
        }
        if self.opened
            {self.bus.close()}
    }

    /// expected working counter of a frame processed by every slave
    pub fn expected_working_counter(&self) -> u16  {self.expected_wkc}
    /// working counter of the last frame received
    pub fn working_counter(&self) -> u16  {self.shared.working_counter()}
    /// whether DC is running, it is disabled by [Self::init] if the bus is not capable
    pub fn dc_enabled(&self) -> bool  {self.config.dc}
    /// DC time of the last frame received, in nanoseconds
    pub fn dc_time(&self) -> i64  {self.bus.dc_time()}
    /// DC time at the end of [Self::init]
    pub fn start_dc_time(&self) -> i64  {self.start_dc_time}
    /// current jitter estimate of the cyclic thread, in nanoseconds
    pub fn jitter_estimate(&self) -> i64  {self.jitter.estimate}
    /// number of samples the jitter estimate is made of
    pub fn jitter_samples(&self) -> u64  {self.jitter.samples}
    /// duration of the last housekeeping pass
    pub fn housekeeping_duration(&self) -> Duration {
        self.housekeeping.as_ref().map_or(Duration::ZERO, |coordinator| coordinator.duration())
    }
    /// period of the process data exchange
    pub fn cycle(&self) -> Duration  {self.config.cycle}
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/**
    address of a discovered slave following the one at `previous`

    A slave without alias, or with the same alias as the previous one, comes next to the previous one. A new alias starts counting positions again.
*/
fn station_address(previous: Option<(u16, u16)>, alias: u16) -> (u16, u16) {
    match previous {
        Some((previous, position)) if alias == 0 || alias == previous => (previous, position + 1),
        _ => (alias, 0),
    }
}

/// interarrival jitter estimate as in RFC 1889
#[derive(Copy, Clone, Debug, Default)]
struct JitterEstimator {
    estimate: i64,
    samples: u64,
    previous: i64,
}
impl JitterEstimator {
    fn update(&mut self, arrival: i64, cycle: i64) {
        if self.previous != 0 {
            let deviation = (arrival - self.previous - cycle).abs();
            // rounded away from zero so the estimate settles exactly on a constant deviation
            let step = deviation - self.estimate;
            self.estimate += (step + step.signum() * 15) / 16;
            self.samples += 1;
        }
        self.previous = arrival;
    }
}
