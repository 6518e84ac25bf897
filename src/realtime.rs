/*!
    Periodic driver of a [Master], calling the application's control at every cycle.

    The cyclic thread wakes up on absolute deadlines of the monotonic clock. When distributed clocks are enabled, the deadlines are continuously shifted so the cycle starts a fixed time after the slaves' sync0 events, the correction is a small PI loop on the DC time of the last frame.

    ```ignore
    struct Control {position: Entry<i32>}
    impl CyclicController for Control {
        fn do_control(&mut self, cyclic: &mut Cyclic) {
            let position = cyclic.master().get(self.position).unwrap_or(0);
            // ...
        }
    }

    let thread = RealtimeThread::new(master, Control {position});
    let stop = thread.stopper();
    let handle = thread.spawn()?;
    // later
    stop.stop();
    handle.join().unwrap()?;
    ```
*/

use core::{
    sync::atomic::{AtomicBool, Ordering::*},
    time::Duration,
    };
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    };
use crate::{
    config::HousekeepingMode,
    coordinator::realtime_priority,
    error::EthercatResult,
    master::Master,
    slave::SlaveState,
    transport::Receive,
    };


/// callbacks of the application, all called from the cyclic thread
#[allow(unused_variables)]
pub trait CyclicController: Send {
    /// called every cycle once all the slaves are in OP and the process data came back
    fn do_control(&mut self, cyclic: &mut Cyclic);
    /// called every cycle, whatever happened
    fn do_reporting(&mut self, cyclic: &Cyclic) {}
    /// the thread woke up after its deadline, no process data was exchanged this cycle
    fn deadline_missed(&mut self) {}
    /// the process data frame did not come back
    fn datagram_lost(&mut self) {}
    /// the process data frame was not processed by every slave
    fn working_counter_mismatch(&mut self, expected: u16, actual: u16) {}
}

/// request the cyclic thread to stop, it will then shut the slaves down and release the bus
#[derive(Clone, Debug, Default)]
pub struct Stop(Arc<AtomicBool>);
impl Stop {
    pub fn stop(&self)  {self.0.store(true, Relaxed)}
    pub fn is_stopped(&self) -> bool  {self.0.load(Relaxed)}
}

/// PI correction of the wakeup time toward the DC time
#[derive(Copy, Clone, Debug, Default)]
struct DcControl {
    integral: i64,
    error: i64,
}
impl DcControl {
    /// shift to apply to the next wakeup
    fn offset(&mut self, dc_time: i64, sync_offset: i64, cycle: i64) -> i64 {
        self.error = (dc_time - sync_offset).rem_euclid(cycle);
        if self.error > cycle / 2
            {self.error -= cycle}
        if self.error > 0
            {self.integral += 1}
        if self.error < 0
            {self.integral -= 1}
        -(self.error / 100) - self.integral / 20
    }
}

/**
    the master and the timings of the current cycle, as seen by the [CyclicController]

    All times are in nanoseconds. Without DC they are on the monotonic clock, with DC the cycle timestamps are on the DC clock.
*/
pub struct Cyclic {
    master: Master,
    cycle: i64,
    sync_offset: i64,
    dc: bool,
    control: DcControl,

    next: i64,
    cycle_start: i64,
    start_free_run: i64,
    timestamp: i64,
    dc_time: i64,
    idle_time: i64,
    transaction_time: i64,
    state_machine_time: i64,
    last_cycle_duration: i64,
    in_op: bool,
}

impl Cyclic {
    fn new(master: Master) -> Self {
        Self {
            cycle: master.cycle().as_nanos() as i64,
            sync_offset: master.config().sync_offset.as_nanos() as i64,
            dc: false,
            master,
            control: DcControl::default(),

            next: 0,
            cycle_start: 0,
            start_free_run: 0,
            timestamp: 0,
            dc_time: 0,
            idle_time: 0,
            transaction_time: 0,
            state_machine_time: 0,
            last_cycle_duration: 0,
            in_op: false,
        }
    }
    pub fn master(&self) -> &Master  {&self.master}
    pub fn master_mut(&mut self) -> &mut Master  {&mut self.master}
    /// start of the current cycle: the last sync0 event with DC, the wakeup time without
    pub fn timestamp(&self) -> i64  {self.timestamp}
    /// timestamp of the first cycle
    pub fn init_timestamp(&self) -> i64 {
        if self.dc  {(self.master.start_dc_time() / self.cycle) * self.cycle}
        else  {self.start_free_run}
    }
    /// time slept before the current cycle
    pub fn idle_time(&self) -> i64  {self.idle_time}
    /// duration of the process data exchange and the rendezvous
    pub fn transaction_time(&self) -> i64  {self.transaction_time}
    /// duration of the rendezvous, including the housekeeping when run inline
    pub fn state_machine_time(&self) -> i64  {self.state_machine_time}
    /// time between the last two wakeups
    pub fn last_cycle_duration(&self) -> i64  {self.last_cycle_duration}
    /// error of the wakeup time against the DC time, as seen by the last correction
    pub fn dc_offset_error(&self) -> i64  {self.control.error}
    /// whether all the slaves reached OP once
    pub fn in_op(&self) -> bool  {self.in_op}

    /**
        exchange an extra process data frame if there is enough time left in the cycle

        Returns `None` when skipped. The jitter estimate is not updated by this exchange.
    */
    pub fn do_secondary_transfer(&mut self, headroom: i64) -> Option<Receive> {
        let elapsed = monotonic() - self.cycle_start;
        if elapsed + self.sync_offset + self.transaction_time + headroom >= self.cycle
            {return None}
        if let Err(err) = self.master.send() {
            log::warn!("cannot send secondary frame: {}", err);
            return Some(Receive::NoFrame)
        }
        Some(self.master.receive_simple())
    }

    fn start(&mut self) {
        self.dc = self.master.dc_enabled();
        let now = monotonic();
        self.start_free_run = now;
        self.cycle_start = now;
        self.next = now;
    }

    /// sleep until the next period, returns the time slept
    fn wait_next_period(&mut self) -> i64 {
        let offset = if self.dc {self.control.offset(self.dc_time, self.sync_offset, self.cycle)} else {0};
        self.next += self.cycle;
        let now = monotonic();
        // more than a cycle late, restart from now
        if now > self.next + self.cycle
            {self.next = now}
        let deadline = self.next + offset;
        let idle = deadline - now;
        if idle > 0
            {sleep_until(deadline)}
        idle
    }

    fn cycle_timestamp(&self) -> i64 {
        if self.dc  {(self.dc_time / self.cycle) * self.cycle}
        else  {monotonic()}
    }

    /// wait for the next period and exchange the process data, returns true if the data came back
    fn transfer(&mut self, controller: &mut dyn CyclicController) -> bool {
        self.idle_time = self.wait_next_period();
        let now = monotonic();
        self.last_cycle_duration = now - self.cycle_start;
        self.cycle_start = now;
        if self.idle_time <= 0 {
            controller.deadline_missed();
            return false
        }

        let start = monotonic();
        if let Err(err) = self.master.send() {
            log::warn!("cannot send process data: {}", err);
            controller.datagram_lost();
            return false
        }
        let wkc = match self.master.receive() {
            Receive::WorkingCounter(wkc) => wkc,
            Receive::NoFrame => {
                controller.datagram_lost();
                self.transaction_time = monotonic() - start;
                return false
            },
        };
        self.dc_time = self.master.dc_time();
        let expected = self.master.expected_working_counter();
        if self.in_op && wkc != expected
            {controller.working_counter_mismatch(expected, wkc)}

        let housekeeping = monotonic();
        self.master.update_state_variables();
        if self.master.config().housekeeping == HousekeepingMode::Inline
            {self.master.do_state_control();}
        let end = monotonic();
        self.transaction_time = end - start;
        self.state_machine_time = end - housekeeping;
        true
    }
}

/**
    cyclic thread running a [Master] and a [CyclicController]

    [Self::run] initializes the master, calls the controller every cycle until stopped, then shuts the slaves and the master down.
*/
pub struct RealtimeThread {
    cyclic: Cyclic,
    controller: Box<dyn CyclicController>,
    stop: Stop,
}

impl RealtimeThread {
    /// the master must have its slaves registered but not be initialized yet
    pub fn new(master: Master, controller: impl CyclicController + 'static) -> Self {
        Self {
            cyclic: Cyclic::new(master),
            controller: Box::new(controller),
            stop: Stop::default(),
        }
    }
    /// handle to stop the loop from an other thread
    pub fn stopper(&self) -> Stop  {self.stop.clone()}

    /// run the cyclic loop in the calling thread until stopped
    pub fn run(mut self) -> EthercatResult {
        self.cyclic.master.init()?;
        self.cyclic.start();

        while ! self.stop.is_stopped() {
            if self.cyclic.transfer(&mut *self.controller) && self.cyclic.in_op {
                self.cyclic.timestamp = self.cyclic.cycle_timestamp();
                self.controller.do_control(&mut self.cyclic);
            }
            else if ! self.cyclic.in_op && self.cyclic.master.state() == SlaveState::Op {
                log::info!("all slaves in OP");
                self.cyclic.in_op = true;
            }
            self.controller.do_reporting(&self.cyclic);
        }

        let timeout = self.cyclic.master.config().state_timeout.as_nanos() as i64;
        let deadline = monotonic() + timeout;
        loop {
            if self.cyclic.transfer(&mut *self.controller) && self.cyclic.master.shutdown_slaves()
                {break}
            if monotonic() > deadline {
                log::warn!("slaves did not shut down in {:?}", Duration::from_nanos(timeout as u64));
                break
            }
        }
        self.cyclic.master.shutdown();
        Ok(())
    }

    /// run the cyclic loop in a new thread with realtime priority
    pub fn spawn(self) -> std::io::Result<JoinHandle<EthercatResult>> {
        thread::Builder::new()
            .name("ethercat-cyclic".into())
            .spawn(move || {
                realtime_priority();
                io_priority();
                self.run()
            })
    }
}


#[cfg(target_os = "linux")]
fn monotonic() -> i64 {
    let mut time = libc::timespec {tv_sec: 0, tv_nsec: 0};
    // SAFETY: the pointer is valid for the duration of the call
    unsafe {libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut time)};
    time.tv_sec as i64 * 1_000_000_000 + time.tv_nsec as i64
}
#[cfg(target_os = "linux")]
fn sleep_until(deadline: i64) {
    let time = libc::timespec {
        tv_sec: (deadline / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline % 1_000_000_000) as libc::c_long,
        };
    // interrupted by a signal
    while unsafe {libc::clock_nanosleep(libc::CLOCK_MONOTONIC, libc::TIMER_ABSTIME, &time, core::ptr::null_mut())} == libc::EINTR {}
}
#[cfg(target_os = "linux")]
fn io_priority() {
    use ioprio::{Class, Pid, Priority, RtPriorityLevel, Target};
    if let Err(err) = ioprio::set_priority(
            Target::Process(Pid::this()),
            Priority::new(Class::Realtime(RtPriorityLevel::highest())),
            ) {
        log::warn!("cannot set realtime io priority: {:?}", err);
    }
}

#[cfg(not(target_os = "linux"))]
fn monotonic() -> i64 {
    static ORIGIN: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    ORIGIN.get_or_init(std::time::Instant::now).elapsed().as_nanos() as i64
}
#[cfg(not(target_os = "linux"))]
fn sleep_until(deadline: i64) {
    let now = monotonic();
    if deadline > now
        {thread::sleep(Duration::from_nanos((deadline - now) as u64))}
}
#[cfg(not(target_os = "linux"))]
fn io_priority() {}
