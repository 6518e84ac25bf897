/*!
    structs and consts for the registers of a standard slave's RAM used by the housekeeping. This should be used instead of any hardcoded register value.

    Only the registers this master actually reads or writes are gathered here, anything else is the transport's business.
*/

use bilge::prelude::*;
use crate::data::{self, Field};

pub const ports_errors: Field<RxErrorCounters> = Field::simple(0x0300);
pub const watchdog_divider: Field<u16> = Field::simple(0x0400);

pub mod sync_manager {
    use super::*;

    /// PDO watchdog time, in multiples of [watchdog_divider]
    /// ETG.1000.6 table 45
    pub const watchdog: Field<u16> = Field::simple(0x0420);
}

pub mod clock {
    use super::*;

    /// difference between the local copy of the system time and the received system time, in sign-magnitude
    /// ETG.1000.4 table 60
    pub const system_difference: Field<TimeDifference> = Field::simple(0x092c);
}

/// AL (Application Layer) registers are controling the communication state of a slave
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    pub const error: Field<u16> = Field::simple(0x0134);
    /// status and error code in one read
    pub const status_code: Field<AlStatusCode> = Field::simple(status.byte);
}

/// CoE objects involved in the process data configuration
pub mod sdo {
    /// PDO assignment of sync manager `n` is at this index plus `n`
    pub const pdo_assignment: u16 = 0x1c10;
}



/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(TryFromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication
    pub state: AlMixedState,
    /// acknowledge the error indicated by [AlStatus::error]
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlControlRequest, u8);

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication
    pub state: AlMixedState,
    /// the slave refused or left the requested state, the code is in [al::error]
    pub error: bool,
    reserved: u3,
}
data::bilge_pdudata!(AlStatus, u8);

/// AL status register followed by the AL status code register
#[repr(packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct AlStatusCode {
    pub status: AlStatus,
    reserved: [u8; 3],
    pub code: u16,
}
data::packed_pdudata!(AlStatusCode);

/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlState {
    /// Transitional state meaning the slave is booting up and ready for nothing yet.
    Bootstrap = 3,
    /// only registers can be used
    Init = 1,
    /// mailbox communication is allowed, used to configure the slave
    PreOperational = 2,
    /// process data inputs are valid, outputs are ignored by the slave
    SafeOperational = 4,
    /// realtime operations running
    Operational = 8,
}

/**
	gather the current operation states on several devices
	this struct does not provide any way to know which slave is in which state

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlMixedState {
    /// one slave at least is in [AlState::Init]
	pub init: bool,
	/// one slave at least is in [AlState::PreOperational]
	pub pre_operational: bool,
	/// one slave at least is in [AlState::SafeOperational]
	pub safe_operational: bool,
	/// one slave at least is in [AlState::Operational]
	pub operational: bool,
}

impl TryFrom<AlMixedState> for AlState {
    type Error = &'static str;
    fn try_from(state: AlMixedState) -> Result<Self, Self::Error> {
        Self::try_from(u4::from(state)).map_err(|_|  "cannot unwrap when not only 1 state in mix")
    }
}
impl From<AlState> for AlMixedState {
    fn from(state: AlState) -> Self {
        Self::from(u4::from(state))
    }
}

/// ETG.1000.6 table 11, most common codes of [al::error]
pub fn al_status_message(code: u16) -> &'static str {
    match code {
        0x0000 => "no error",
        0x0001 => "unspecified error",
        0x0002 => "no memory",
        0x0011 => "invalid requested state change",
        0x0012 => "unknown requested state",
        0x0013 => "bootstrap not supported",
        0x0014 => "no valid firmware",
        0x0015 => "invalid mailbox configuration",
        0x0016 => "invalid mailbox configuration",
        0x0017 => "invalid sync manager configuration",
        0x0018 => "no valid inputs available",
        0x0019 => "no valid outputs",
        0x001a => "synchronization error",
        0x001b => "sync manager watchdog",
        0x001c => "invalid sync manager types",
        0x001d => "invalid output configuration",
        0x001e => "invalid input configuration",
        0x001f => "invalid watchdog configuration",
        0x0020 => "slave needs cold start",
        0x0021 => "slave needs INIT",
        0x0022 => "slave needs PREOP",
        0x0023 => "slave needs SAFEOP",
        0x0024 => "invalid input mapping",
        0x0025 => "invalid output mapping",
        0x0026 => "inconsistent settings",
        0x0027 => "freerun not supported",
        0x0028 => "syncmode not supported",
        0x0029 => "freerun needs 3 buffer mode",
        0x002a => "background watchdog",
        0x002b => "no valid inputs and outputs",
        0x002c => "fatal sync error",
        0x002d => "no sync error",
        0x0030 => "invalid DC SYNC configuration",
        0x0031 => "invalid DC latch configuration",
        0x0032 => "PLL error",
        0x0033 => "DC sync IO error",
        0x0034 => "DC sync timeout error",
        0x0035 => "DC invalid sync cycle time",
        0x0050 => "EEPROM no access",
        0x0051 => "EEPROM error",
        0x0060 => "slave restarted locally",
        0x8000 ..= 0xffff => "vendor specific",
        _ => "unknown",
    }
}

/**
    RX error counters of the 4 ports. A write to one counter will reset all counters of the group

	ETG.1000.4 table 40
*/
#[repr(packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct RxErrorCounters {
	pub port: [PortErrorCount; 4],
	/// forwarded RX errors
	pub previous: [u8; 4],
	pub processing_unit: u8,
	pub pdi: u8,
	reserved: [u8; 2],
	/// counts the occurrences of link down on each port
	pub lost_link: [u8; 4],
}
data::packed_pdudata!(RxErrorCounters);

impl RxErrorCounters {
	/// value resetting every counter when written
	pub fn reset() -> Self {
		<Self as data::PduData>::unpack(&[0xff; core::mem::size_of::<Self>()]).unwrap_or_default()
	}
}

#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub struct PortErrorCount {
	/// counts the occurrences of frame errors (including RX errors within frame)
	pub frame: u8,
	/// counts the occurrences of RX errors at the physical layer
	pub physical: u8,
}
data::bilge_pdudata!(PortErrorCount, u16);

#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct TimeDifference {
    /// Mean difference between local copy of System Time and received System Time values
    pub mean: u31,
    /// true if local copy of system time smaller than received system time
    pub sign: bool,
}
data::bilge_pdudata!(TimeDifference, u32);

impl TimeDifference {
    /// signed offset in nanoseconds
    pub fn nanoseconds(&self) -> i32 {
        sign_magnitude(u32::from(*self))
    }
}

/// convert a sign-magnitude 32 bit register to a two's complement integer
pub fn sign_magnitude(raw: u32) -> i32 {
    let magnitude = (raw & 0x7fff_ffff) as i32;
    if raw & 0x8000_0000 != 0 {-magnitude}
    else {magnitude}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn dc_difference() {
        assert_eq!(sign_magnitude(150), 150);
        assert_eq!(sign_magnitude(0x8000_0096), -150);
        assert_eq!(sign_magnitude(0x8000_0000), 0);
        assert_eq!(TimeDifference::unpack(&[0x96, 0, 0, 0x80]).unwrap().nanoseconds(), -150);
    }

    #[test]
    fn status_code() {
        let block = AlStatusCode::unpack(&[0x14, 0, 0, 0, 0x1b, 0]).unwrap();
        let status = block.status;
        let code = block.code;
        assert!(status.error());
        assert_eq!(AlState::try_from(status.state()), Ok(AlState::SafeOperational));
        assert_eq!(code, 0x1b);
        assert_eq!(al_status_message(code), "sync manager watchdog");
    }

    #[test]
    fn control_request() {
        let mut packed = [0u8; 1];
        AlControlRequest::new(AlState::SafeOperational.into(), true, false)
            .pack(&mut packed).unwrap();
        assert_eq!(packed, [0x14]);
    }
}
