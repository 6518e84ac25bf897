//! definition of the general ethercat error type, and of the configuration errors reported by [crate::Master::init]

use std::sync::Arc;
use core::fmt;
use crate::mapping::Direction;

/**
    general object reporting an unexpected result regarding ethercat communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it.

    [Self::Slave] variant should not be used without an appropriate type for `T`, `T` depend on the operation the slave reports for, and is usually an error code, or an enum.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a slave, its type depend on the operation returning this error
    ///
    /// these errors can generally be handled and fixed by retrying the operation or reconfiguring the slave
    Slave(T),

    /// error reported by the master
    ///
    /// these errors can generally be handled and fixed by retrying the operation or using the master differently when the issue is in the user code
    Master(&'static str),

    /// error detected by the master in the ethercat communication
    ///
    /// these errors can generally not be fixed and the whole communication has to be restarted
    Protocol(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),

    /// the bus does not match what has been registered, detected before any cyclic exchange
    ///
    /// these errors require to fix the registered configuration or the physical bus, then to initialize again
    Config(ConfigError),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(value) => write!(f, "Io: {}", value),
            Self::Slave(value) => write!(f, "Slave: {:?}", value),
            Self::Master(value) => write!(f, "Master: {}", value),
            Self::Protocol(value) => write!(f, "Protocol: {}", value),
            Self::Timeout(value) => write!(f, "Timeout: {}", value),
            Self::Config(value) => write!(f, "Config: {}", value),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for EthercatError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        EthercatError::Protocol(match src {
            crate::data::PackingError::BadSize(_, text) => text,
            crate::data::PackingError::BadAlignment(_, text) => text,
            crate::data::PackingError::InvalidValue(text) => text,
        })
    }
}

impl<T> From<ConfigError> for EthercatError<T> {
    fn from(src: ConfigError) -> Self {
        EthercatError::Config(src)
    }
}

// because rust doesn't allow specialization and already implements `From<T> for T`, we cannot write smart conversions for generic EthercatError<T>, so these are manual conversion methods
impl<E> EthercatError<E> {
    /// convert the error if the slave specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the error with a callback handling the case of slave-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(value) => EthercatError::Slave(callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
            EthercatError::Config(error) => EthercatError::Config(error),
        }
    }
}

/**
    mismatch between the registered slaves and the discovered bus

    All these are detected by [crate::Master::init] before the first cyclic exchange, so the application can report them and stop cleanly.
*/
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// more slaves answered on the bus than were registered
    #[error("not all slaves are configured: {online} slaves online, {registered} registered")]
    SlavesNotConfigured {online: usize, registered: usize},
    /// less slaves answered on the bus than were registered
    #[error("not all registered slaves are online: {online} slaves online, {registered} registered")]
    SlavesOffline {online: usize, registered: usize},
    /// a discovered slave has no registration at its address
    #[error("unconfigured slave on {alias}:{position}, power cycle after changing alias addresses")]
    UnconfiguredSlave {alias: u16, position: u16},
    /// vendor or product code read from the slave differ from the registration
    #[error("invalid vendor and/or product code for slave {alias}:{position}")]
    InvalidSlaveIdentity {alias: u16, position: u16},
    /// two registrations claim the same address
    #[error("slave {alias}:{position} registered twice")]
    DuplicateAddress {alias: u16, position: u16},
    /// the transport allocated a different process image than the sum of the registered mappings
    #[error("cannot allocate process image: expected {expected} bytes, allocated {allocated}")]
    ImageSizeMismatch {expected: usize, allocated: usize},
    /// the registered mapping is smaller than what the slave exchanges
    #[error("slave {alias}:{position}: {bits} unmapped bits in the {direction} mapping, make sure the PDO configuration matches the slave")]
    UnmappedBits {alias: u16, position: u16, bits: usize, direction: Direction},
    /// the registered mapping is larger than what the slave exchanges
    #[error("slave {alias}:{position}: not enough space in the {direction} mapping")]
    InsufficientImageSpace {alias: u16, position: u16, direction: Direction},
    /// the bus did not reach SAFE_OP after configuration
    #[error("cannot transfer to SAFE_OP state")]
    SafeOpTimeout,
    /// the network interface cannot be opened
    #[error("cannot open interface {0}")]
    InterfaceUnavailable(String),
}
