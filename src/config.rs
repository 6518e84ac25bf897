//! settings of a [crate::Master], all known before [crate::Master::init]

use core::time::Duration;


/// how the housekeeping is run after each cycle
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HousekeepingMode {
    /// a dedicated thread woken after each cycle
    Thread,
    /// the application calls [crate::Master::do_state_control] from its own loop
    Inline,
}

/**
    settings of a [crate::Master]

    Built with its default and the chained setters:

    ```
    # use ethercycle::config::MasterConfig;
    # use core::time::Duration;
    let config = MasterConfig::new("eth0")
        .cycle(Duration::from_micros(500))
        .dc(true, Duration::from_micros(100));
    assert!(config.dc);
    // slaves cannot be recovered when DC is running
    assert!(! config.recovery);
    ```
*/
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// network interface to open
    pub interface: Option<String>,
    /// period of the process data exchange
    pub cycle: Duration,
    /// enable distributed clocks
    pub dc: bool,
    /// delay of the cyclic exchange after the DC sync0 event
    pub sync_offset: Duration,
    /// jitter estimate below which the cyclic thread is considered stable enough to let slaves go to OP
    pub max_jitter: Duration,
    /// fail when slaves are found on the bus that have not been registered
    pub require_all_slaves: bool,
    /// bring back slaves that dropped out
    pub recovery: bool,
    /// read the port error counters of each slave in the housekeeping
    pub statistics: bool,
    /// how long to wait for the process data frame
    pub receive_timeout: Duration,
    /// timeout of register accesses issued by the housekeeping
    pub register_timeout: Duration,
    /// timeout of SDO transfers
    pub sdo_timeout: Duration,
    /// timeout of the state transitions
    pub state_timeout: Duration,
    /// maximum DC offset of a slave to consider its clock synchronized
    pub dc_bound: Duration,
    /// number of consecutive offset samples under [Self::dc_bound] before a slave's clock is stable
    pub dc_samples: u32,
    /// longest sleep of the housekeeping thread before it checks for new work
    pub park: Duration,
    pub housekeeping: HousekeepingMode,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            interface: None,
            cycle: Duration::from_millis(1),
            dc: false,
            sync_offset: Duration::ZERO,
            max_jitter: Duration::from_micros(25),
            require_all_slaves: true,
            recovery: true,
            statistics: false,
            receive_timeout: Duration::from_millis(2),
            register_timeout: Duration::from_micros(2000),
            sdo_timeout: Duration::from_millis(700),
            state_timeout: Duration::from_secs(2),
            dc_bound: Duration::from_nanos(200),
            dc_samples: 10,
            park: Duration::from_millis(10),
            housekeeping: HousekeepingMode::Thread,
        }
    }
}

impl MasterConfig {
    pub fn new(interface: &str) -> Self {
        Self {interface: Some(interface.into()), .. Default::default()}
    }
    pub fn cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }
    /// enable or disable distributed clocks, enabling also disables recovery
    pub fn dc(mut self, enable: bool, sync_offset: Duration) -> Self {
        self.dc = enable;
        self.sync_offset = sync_offset;
        if enable {self.recovery = false}
        self
    }
    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }
    pub fn require_all_slaves(mut self, require: bool) -> Self {
        self.require_all_slaves = require;
        self
    }
    pub fn recovery(mut self, enable: bool) -> Self {
        self.recovery = enable && ! self.dc;
        self
    }
    pub fn statistics(mut self, enable: bool) -> Self {
        self.statistics = enable;
        self
    }
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }
    pub fn dc_stability(mut self, bound: Duration, samples: u32) -> Self {
        self.dc_bound = bound;
        self.dc_samples = samples;
        self
    }
    pub fn housekeeping(mut self, mode: HousekeepingMode) -> Self {
        self.housekeeping = mode;
        self
    }
    pub fn park(mut self, park: Duration) -> Self {
        self.park = park;
        self
    }

    pub(crate) fn cycle_ns(&self) -> i64  {self.cycle.as_nanos() as i64}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.cycle, Duration::from_millis(1));
        assert_eq!(config.max_jitter, Duration::from_nanos(25_000));
        assert_eq!(config.dc_bound, Duration::from_nanos(200));
        assert_eq!(config.dc_samples, 10);
        assert_eq!(config.park, Duration::from_millis(10));
        assert!(config.require_all_slaves && config.recovery && ! config.dc);
    }

    #[test]
    fn recovery_needs_no_dc() {
        let config = MasterConfig::new("eth0").dc(true, Duration::ZERO).recovery(true);
        assert!(! config.recovery);
        let config = MasterConfig::new("eth0").recovery(false).dc(false, Duration::ZERO);
        assert!(! config.recovery);
        assert_eq!(config.interface.as_deref(), Some("eth0"));
    }
}
