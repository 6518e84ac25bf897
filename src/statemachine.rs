/*!
    The housekeeping side of the master: the slave controllers, their SDO transfers, and the pipeline running them.

    [Housekeeping] is the data owned by the [crate::coordinator::Coordinator], it is only ever touched by the housekeeping thread, or by the cyclic thread during the rendezvous. [BusStatus] carries the few values the cyclic thread updates every cycle and the housekeeping reads at any time.
*/

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering::*};
use std::{
    sync::Arc,
    time::Instant,
    };
use crate::{
    config::MasterConfig,
    pipeline::{Executor, Task},
    registers::{AlControlRequest, AlState},
    sdo::SdoRequest,
    slave::{SlaveController, SlaveState, SlaveStatus, Tick},
    status::{StatusCallback, TraceEvent},
    transport::{BusTransport, SlaveAddress},
    };

/// number of jitter samples before the jitter estimate is trusted
pub const MINIMUM_JITTER_SAMPLES: u64 = 1000;


/// values published by the cyclic thread for the housekeeping
#[derive(Debug, Default)]
pub struct BusStatus {
    wkc: AtomicU16,
    expected_wkc: AtomicU16,
    /// jitter estimate in nanoseconds
    jitter: AtomicI64,
    jitter_samples: AtomicU64,
    dc: AtomicBool,
}
impl BusStatus {
    pub fn working_counter(&self) -> u16  {self.wkc.load(Relaxed)}
    pub fn expected_working_counter(&self) -> u16  {self.expected_wkc.load(Relaxed)}
    pub fn jitter(&self) -> i64  {self.jitter.load(Relaxed)}
    pub fn jitter_samples(&self) -> u64  {self.jitter_samples.load(Relaxed)}
    pub fn dc(&self) -> bool  {self.dc.load(Relaxed)}

    pub(crate) fn set_working_counter(&self, wkc: u16)  {self.wkc.store(wkc, Relaxed)}
    pub(crate) fn set_expected_working_counter(&self, wkc: u16)  {self.expected_wkc.store(wkc, Relaxed)}
    pub(crate) fn set_jitter(&self, jitter: i64, samples: u64) {
        self.jitter.store(jitter, Relaxed);
        self.jitter_samples.store(samples, Relaxed);
    }
    pub(crate) fn set_dc(&self, dc: bool)  {self.dc.store(dc, Relaxed)}
    /// the last frame was processed by all the slaves
    pub fn working_counter_matches(&self) -> bool {
        self.working_counter() == self.expected_working_counter()
    }

    /**
        whether the cyclic thread is stable enough to let the slaves go to OP

        Without DC any rate is fine. With DC the jitter estimate must have enough samples and be under the given bound.
    */
    pub fn op_allowed(&self, max_jitter: i64) -> bool {
        if ! self.dc()
            {return true}
        let jitter = self.jitter();
        self.jitter_samples() >= MINIMUM_JITTER_SAMPLES
            && jitter != 0
            && jitter <= max_jitter
    }
}


/// everything the housekeeping tasks work on
pub struct Householder {
    pub bus: Arc<dyn BusTransport>,
    pub status: Arc<dyn StatusCallback>,
    pub config: MasterConfig,
    pub shared: Arc<BusStatus>,
    pub slaves: Vec<SlaveController>,
}

impl Householder {
    /// OP gate, reporting when the cyclic thread does not converge
    fn op_allowed(&self, runtime: i64) -> bool {
        let allowed = self.shared.op_allowed(self.config.max_jitter.as_nanos() as i64);
        if ! allowed && self.shared.jitter_samples() >= MINIMUM_JITTER_SAMPLES {
            self.status.master_stable_rate(runtime, self.shared.jitter());
        }
        allowed
    }
}

/// housekeeping data shared through the coordinator
pub struct Housekeeping {
    householder: Householder,
    pipeline: Executor<Householder>,
    start: Option<Instant>,
    shut_down: bool,
}

impl Housekeeping {
    /// build the pipeline, one bin of tasks per slave
    pub fn new(householder: Householder) -> Self {
        let mut pipeline = Executor::new();
        for slave in 0 .. householder.slaves.len() {
            let tasks: Vec<Box<dyn Task<Householder>>> = vec![
                Box::new(ReadState {slave, previous: None}),
                Box::new(ReadStatistics {slave}),
                Box::new(StateControl {slave}),
                Box::new(SdoService {slave, current: 0}),
                ];
            pipeline.push_bin(householder.slaves[slave].id().name, tasks);
        }
        Self {householder, pipeline, start: None, shut_down: false}
    }
    pub fn householder(&self) -> &Householder  {&self.householder}
    pub fn slaves(&self) -> &[SlaveController]  {&self.householder.slaves}
    pub fn slaves_mut(&mut self) -> &mut [SlaveController]  {&mut self.householder.slaves}
    /// slave controllers, taken back when the housekeeping could not start
    pub(crate) fn into_slaves(self) -> Vec<SlaveController>  {self.householder.slaves}
    /// name of the last task run, for diagnostics
    pub fn last_executed(&self) -> &'static str  {self.pipeline.last_executed()}

    /// one step of the housekeeping pipeline
    pub fn pass(&mut self) {
        let start = *self.start.get_or_insert_with(Instant::now);
        let runtime = start.elapsed().as_nanos() as i64;
        self.pipeline.execute(&mut self.householder, runtime);
    }

    /// exchange the housekeeping variables with the cyclic side, slave by slave in registration order
    pub fn sync(&mut self, statuses: &mut [SlaveStatus], requests: &mut [Vec<SdoRequest>]) {
        for ((slave, status), requests) in self.householder.slaves.iter_mut()
                .zip(statuses.iter_mut())
                .zip(requests.iter_mut()) {
            slave.sync(status, requests);
        }
    }

    /// bring the bus back to PRE_OP and disable the slaves' synchronization, only the first call has effect
    pub fn teardown(&mut self) {
        if core::mem::replace(&mut self.shut_down, true)
            {return}
        let Householder {bus, status, slaves, ..} = &mut self.householder;
        status.trace(TraceEvent::SwitchPreop);
        if let Err(err) = bus.write_state(
                SlaveAddress::Broadcast,
                AlControlRequest::new(AlState::PreOperational.into(), false, false),
                ) {
            log::warn!("cannot switch slaves to PRE-OP: {}", err);
        }
        status.trace(TraceEvent::CleanupSlaves);
        for slave in slaves.iter_mut() {
            slave.cleanup(&**bus);
        }
    }
}


/// read the slave state, only when the bus working counter changed since the last read or the controller acted on the slave
struct ReadState {
    slave: usize,
    previous: Option<u16>,
}
impl Task<Householder> for ReadState {
    fn name(&self) -> &'static str  {"ReadState"}
    fn skip(&self, house: &Householder) -> bool {
        self.previous == Some(house.shared.working_counter())
            && ! house.slaves[self.slave].needs_refresh()
    }
    fn execute(&mut self, house: &mut Householder, _runtime: i64) -> bool {
        self.previous = Some(house.shared.working_counter());
        house.slaves[self.slave].read_state(&*house.bus, &*house.status, &house.config);
        true
    }
}

/// read or clear the port error counters
struct ReadStatistics {
    slave: usize,
}
impl Task<Householder> for ReadStatistics {
    fn name(&self) -> &'static str  {"ReadStatistics"}
    fn skip(&self, house: &Householder) -> bool {
        ! house.config.statistics && ! house.slaves[self.slave].clear_rx_errors_requested()
    }
    fn execute(&mut self, house: &mut Householder, _runtime: i64) -> bool {
        let slave = &mut house.slaves[self.slave];
        if slave.clear_rx_errors_requested()
            {slave.clear_rx_errors(&*house.bus, &*house.status, &house.config);}
        if house.config.statistics
            {slave.read_statistics(&*house.bus, &*house.status, &house.config);}
        true
    }
}

/// one step of the slave lifecycle controller
struct StateControl {
    slave: usize,
}
impl Task<Householder> for StateControl {
    fn name(&self) -> &'static str  {"StateControl"}
    fn skip(&self, house: &Householder) -> bool {
        let slave = &house.slaves[self.slave];
        slave.state() == SlaveState::Op
            || (slave.reached_op() && ! house.config.recovery)
    }
    fn execute(&mut self, house: &mut Householder, runtime: i64) -> bool {
        let tick = Tick {
            runtime,
            op_allowed: house.slaves[self.slave].state() != SlaveState::SafeOp || house.op_allowed(runtime),
            };
        house.slaves[self.slave].state_control(&*house.bus, &*house.status, &house.config, tick);
        true
    }
}

/// perform the pending SDO transfers of the slave, one per call
struct SdoService {
    slave: usize,
    current: usize,
}
impl Task<Householder> for SdoService {
    fn name(&self) -> &'static str  {"SdoService"}
    fn skip(&self, house: &Householder) -> bool {
        let slave = &house.slaves[self.slave];
        ! (house.shared.working_counter_matches()
            && slave.state() == SlaveState::Op
            && slave.sdo_pending())
    }
    fn execute(&mut self, house: &mut Householder, _runtime: i64) -> bool {
        let Householder {bus, status, config, slaves, ..} = house;
        let slave = &mut slaves[self.slave];
        let id = *slave.id();
        while self.current < slave.sdos.len() {
            if slave.sdos[self.current].execute(&**bus, &id, config.sdo_timeout, &**status)
                {break}
            self.current += 1;
        }
        if self.current >= slave.sdos.len() {
            self.current = 0;
            true
        }
        else {false}
    }
}
