/*!
    Lock-free rendezvous between the cyclic thread and the housekeeping thread.

    The data shared by both threads is only ever accessed by one of them at a time, the turn is given by a single atomic state:

    ```text
    STARTING -> IDLE -> CYCLIC_RUNNING -> CYCLIC_DONE -> STATE_CONTROL_RUNNING -> STATE_CONTROL_DONE
                             ^                                                          |
                             +----------------------------------------------------------+
    ```

    - the cyclic thread never waits: when the housekeeping is running, it simply skips the rendezvous for this cycle
    - the housekeeping thread sleeps until it is woken by the cyclic thread, or for a bounded time

    The cyclic thread never blocks, but the housekeeping may be delayed by lower priority threads, so it should run at equal or higher priority than every other thread of the application.
*/

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU8, AtomicU64, Ordering::*},
    time::Duration,
    };
use std::{
    sync::{Arc, OnceLock},
    thread::{self, Thread, JoinHandle},
    time::Instant,
    };

pub const STARTING: u8 = 0;
pub const IDLE: u8 = 1;
pub const CYCLIC_RUNNING: u8 = 2;
pub const CYCLIC_DONE: u8 = 3;
pub const STATE_CONTROL_RUNNING: u8 = 4;
pub const STATE_CONTROL_DONE: u8 = 5;
pub const SHUTDOWN: u8 = 6;

/// default bounded sleep of the housekeeping thread
pub const PARK_TIME: Duration = Duration::from_millis(10);


/**
    owner of the data shared by the cyclic and housekeeping threads

    Access is granted by [Self::try_lock_cyclic] on the cyclic side and [Self::run_state_control] on the housekeeping side, never both at once.
*/
pub struct Coordinator<T> {
    state: AtomicU8,
    data: UnsafeCell<T>,
    /// housekeeping thread to wake up
    thread: OnceLock<Thread>,
    /// duration of the last housekeeping pass in nanoseconds, written by the housekeeping
    duration_in_thread: AtomicU64,
    /// copy of [Self::duration_in_thread] made at the rendezvous
    duration_in_cyclic: AtomicU64,
}

// the state machine ensures the data is only accessed by one thread at a time
unsafe impl<T: Send> Sync for Coordinator<T> {}

impl<T> Coordinator<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicU8::new(STARTING),
            data: UnsafeCell::new(data),
            thread: OnceLock::new(),
            duration_in_thread: AtomicU64::new(0),
            duration_in_cyclic: AtomicU64::new(0),
        }
    }
    pub fn state(&self) -> u8  {self.state.load(Acquire)}
    /// exclusive access when nothing else can reach the coordinator
    pub fn get_mut(&mut self) -> &mut T  {self.data.get_mut()}
    pub fn into_inner(self) -> T  {self.data.into_inner()}

    /// duration of the last housekeeping pass, as seen at the last rendezvous
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_in_cyclic.load(Relaxed))
    }

    /**
        try to get the shared data from the cyclic thread

        Returns `None` when the housekeeping is not started, running, or shut down, and while a guard is already held. Releasing the guard hands the data to the housekeeping.
    */
    pub fn try_lock_cyclic(&self) -> Option<CyclicGuard<'_, T>> {
        let current = self.state.load(Acquire);
        match current {
            IDLE | CYCLIC_DONE | STATE_CONTROL_DONE => self.state
                    .compare_exchange(current, CYCLIC_RUNNING, Acquire, Relaxed)
                    .ok()
                    .map(|_| CyclicGuard {coordinator: self}),
            _ => None,
        }
    }

    /// give the turn to the housekeeping, panics if the cyclic thread did not have it
    fn release_cyclic(&self) {
        if self.state.compare_exchange(CYCLIC_RUNNING, CYCLIC_DONE, Release, Relaxed).is_err() {
            panic!("illegal coordinator state {} when releasing the cyclic side", self.state());
        }
        self.duration_in_cyclic.store(self.duration_in_thread.load(Relaxed), Relaxed);
        if let Some(thread) = self.thread.get()
            {thread.unpark()}
    }

    /// register the calling thread as the housekeeping thread, panics if already started
    pub fn start(&self) {
        if let Err(state) = self.try_start() {
            panic!("illegal coordinator state {} when starting", state);
        }
    }
    fn try_start(&self) -> Result<(), u8> {
        self.state.compare_exchange(STARTING, IDLE, AcqRel, Acquire)?;
        let _ = self.thread.set(thread::current());
        Ok(())
    }

    /**
        run one housekeeping pass if the cyclic thread handed over the data

        Returns false if it was not the housekeeping's turn. Panics if the state changed during the pass in any other way than a shutdown request.
    */
    pub fn run_state_control(&self, pass: impl FnOnce(&mut T)) -> bool {
        if self.state.compare_exchange(CYCLIC_DONE, STATE_CONTROL_RUNNING, Acquire, Relaxed).is_err()
            {return false}

        let start = Instant::now();
        // SAFETY: the state is STATE_CONTROL_RUNNING so the cyclic side cannot lock
        pass(unsafe {&mut *self.data.get()});
        self.duration_in_thread.store(start.elapsed().as_nanos() as u64, Relaxed);

        if let Err(state) = self.state.compare_exchange(STATE_CONTROL_RUNNING, STATE_CONTROL_DONE, Release, Acquire) {
            if state != SHUTDOWN
                {panic!("illegal coordinator state {} after state control", state)}
        }
        true
    }

    /// request the housekeeping to stop, the cyclic side cannot lock anymore
    pub fn shutdown(&self) {
        self.state.store(SHUTDOWN, Release);
        if let Some(thread) = self.thread.get()
            {thread.unpark()}
    }
    pub fn is_shutdown(&self) -> bool  {self.state() == SHUTDOWN}

    /**
        housekeeping loop: sleep, run a pass when woken with the cyclic side done, until shutdown

        `teardown` is given the data once after shutdown was requested.
    */
    pub fn run(&self, park: Duration, mut pass: impl FnMut(&mut T), teardown: impl FnOnce(&mut T)) {
        // shut down before the thread even started
        if let Err(state) = self.try_start() {
            if state != SHUTDOWN
                {panic!("illegal coordinator state {} when starting", state)}
        }
        while ! self.is_shutdown() {
            thread::park_timeout(park);
            if self.is_shutdown()
                {break}
            self.run_state_control(&mut pass);
        }
        // SAFETY: the cyclic side cannot lock once shut down, and this thread is the only housekeeping
        teardown(unsafe {&mut *self.data.get()});
    }
}

impl<T: Send + 'static> Coordinator<T> {
    /// start the housekeeping loop in a new thread, with realtime priority when available
    pub fn spawn<P, D>(self: &Arc<Self>, park: Duration, pass: P, teardown: D) -> std::io::Result<JoinHandle<()>>
    where
        P: FnMut(&mut T) + Send + 'static,
        D: FnOnce(&mut T) + Send + 'static,
    {
        let coordinator = self.clone();
        thread::Builder::new()
            .name("ethercat-housekeeping".into())
            .spawn(move || {
                realtime_priority();
                coordinator.run(park, pass, teardown)
            })
    }
}

/// give the calling thread the maximum FIFO priority
#[cfg(target_os = "linux")]
pub(crate) fn realtime_priority() {
    if let Err(err) = thread_priority::set_thread_priority_and_policy(
            thread_priority::thread_native_id(),
            thread_priority::ThreadPriority::Max,
            thread_priority::ThreadSchedulePolicy::Realtime(thread_priority::RealtimeThreadSchedulePolicy::Fifo),
            ) {
        log::warn!("cannot set realtime priority of {:?}: {:?}", thread::current().name(), err);
    }
}
#[cfg(not(target_os = "linux"))]
pub(crate) fn realtime_priority() {}

/// exclusive access of the cyclic thread to the shared data, handing it to the housekeeping when dropped
pub struct CyclicGuard<'a, T> {
    coordinator: &'a Coordinator<T>,
}
impl<T> CyclicGuard<'_, T> {
    /// explicit version of dropping the guard
    pub fn release_and_start_state_control(self) {}
}
impl<T> Deref for CyclicGuard<'_, T> {
    type Target = T;
    // SAFETY: the state is CYCLIC_RUNNING as long as the guard exists
    fn deref(&self) -> &T  {unsafe {&*self.coordinator.data.get()}}
}
impl<T> DerefMut for CyclicGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T  {unsafe {&mut *self.coordinator.data.get()}}
}
impl<T> Drop for CyclicGuard<'_, T> {
    fn drop(&mut self) {
        self.coordinator.release_cyclic();
    }
}
