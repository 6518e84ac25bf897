/*!
    This module provide the trait [BusTransport], the boundary between this master and whatever actually puts frames on the wire.

    The transport is responsible for the physical layer and the ethercat telegrams: opening the network interface, addressing slaves, building datagrams, retrying, and mapping the process image to the slaves' FMMUs. This crate only drives the application layer on top of it: slave lifecycle, process data and service data.

    A transport is shared between the cyclic thread and the housekeeping thread, so all its methods take `&self` and it must be `Send + Sync`. Only the cyclic thread ever calls [BusTransport::send] and [BusTransport::receive]. Register and mailbox accesses are only issued by the thread holding the [crate::coordinator::Coordinator], so an implementation only has to keep its process data exchange and its register accesses from corrupting each other.
*/

use core::time::Duration;
use crate::{
    data::{PduData, Field, Storage},
    error::EthercatResult,
    registers::{self, AlControlRequest, AlState, AlStatus},
    };


/// addressing of the slaves in the methods of [BusTransport]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SlaveAddress {
    /// all the slaves at once
    Broadcast,
    /// topological index of a slave in the ring, starting from 0
    Slave(u16),
}

/// what the transport found on the bus, in ring order
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiscoveredSlave {
    /// configured station alias, 0 if none
    pub alias: u16,
    /// vendor id read from the slave information interface
    pub vendor: u32,
    /// product code read from the slave information interface
    pub product: u32,
    /// size of the slave's inputs (TxPDOs)
    pub input_bits: usize,
    /// size of the slave's outputs (RxPDOs)
    pub output_bits: usize,
}

/// area of a slave in the process image
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub byte: usize,
    pub bit: u8,
    pub bits: usize,
}

/// location of one slave's data in the process image
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SlaveRegions {
    pub inputs: Region,
    pub outputs: Region,
}

/// result of mapping the process image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageMap {
    /// bytes actually used by the transport
    pub size: usize,
    /// regions of each slave, in ring order
    pub slaves: Vec<SlaveRegions>,
    /// number of slaves the output datagrams are expected to be processed by
    pub outputs_wkc: u16,
    /// number of slaves the input datagrams are expected to be processed by
    pub inputs_wkc: u16,
}

/// outcome of one process data exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Receive {
    /// no frame came back before the timeout
    NoFrame,
    /// the frame came back, with this working counter
    WorkingCounter(u16),
}

/**
    trait implementing the ethercat communication primitives the master relies on

    Methods returning a working counter report how many slaves processed the datagram, a zero means the slave did not answer. A frame lost on the way is reported by an error instead.
*/
pub trait BusTransport: Send + Sync {
    /// open the given network interface, this is called first by [crate::Master::init]
    fn open(&self, interface: &str) -> EthercatResult;
    /// release the network interface
    fn close(&self);
    /// discover the slaves on the bus and bring them to PRE_OP, in ring order
    fn enumerate(&self) -> EthercatResult<Vec<DiscoveredSlave>>;
    /// initialize distributed clocks, returns false when the bus is not capable of it
    fn configure_dc(&self) -> bool;
    /// map the process image of all slaves, `size` is the image size expected by the master
    fn map_process_image(&self, size: usize) -> EthercatResult<ImageMap>;

    /// send the process data frame built from the given image
    fn send(&self, image: &[u8]) -> EthercatResult;
    /// wait for the process data frame and copy its inputs into the given image
    fn receive(&self, image: &mut [u8], timeout: Duration) -> Receive;
    /// time of the reference clock in the last received frame, in nanoseconds
    fn dc_time(&self) -> i64;

    /// read a slave's physical memory, returns the working counter
    fn read_register(&self, slave: u16, address: u16, data: &mut [u8], timeout: Duration) -> EthercatResult<u16>;
    /// write a slave's physical memory, returns the working counter
    fn write_register(&self, slave: u16, address: u16, data: &[u8], timeout: Duration) -> EthercatResult<u16>;
    /// request a new AL state
    fn write_state(&self, target: SlaveAddress, request: AlControlRequest) -> EthercatResult<u16>;
    /// wait until the target reaches the given state or the timeout elapses, and return the last state read (the lowest when broadcasting)
    fn state_check(&self, target: SlaveAddress, state: AlState, timeout: Duration) -> EthercatResult<AlStatus>;

    /// bring a slave that went back to INIT to PRE_OP again, restoring its mailbox configuration
    fn reconfigure_to_preop(&self, slave: u16, timeout: Duration) -> bool;
    /// bring a slave in PRE_OP to SAFE_OP again, restoring its sync managers and FMMUs
    fn reconfigure_to_safeop(&self, slave: u16, timeout: Duration) -> bool;
    /// give back its station address to a slave that has been power cycled or reconnected
    fn recover_slave(&self, slave: u16, timeout: Duration) -> bool;
    /// enable or disable the DC sync0 signal of a slave
    fn dc_sync0(&self, slave: u16, enable: bool, cycle: Duration, shift: Duration);
    /// stop using complete access when reading the slave's object dictionary
    fn disable_complete_access(&self, _slave: u16) {}

    /// expedited or segmented SDO upload, returns the working counter
    fn sdo_read(&self, slave: u16, index: u16, sub: u8, data: &mut [u8], timeout: Duration) -> u16;
    /// expedited or segmented SDO download, returns the working counter
    fn sdo_write(&self, slave: u16, index: u16, sub: u8, data: &[u8], timeout: Duration) -> u16;
}

impl dyn BusTransport + '_ {
    /// read a register and extract it, fails if the slave did not answer
    pub fn read<T: PduData>(&self, slave: u16, field: Field<T>, timeout: Duration) -> EthercatResult<T> {
        let mut buffer = T::Packed::zeroed();
        let wkc = self.read_register(slave, field.byte as u16, &mut buffer.as_mut()[.. field.len], timeout)?;
        if wkc == 0 {
            return Err(crate::EthercatError::Timeout("slave did not answer"))
        }
        Ok(T::unpack(buffer.as_ref())?)
    }
    /// pack and write a register, returns the working counter
    pub fn write<T: PduData>(&self, slave: u16, field: Field<T>, value: T, timeout: Duration) -> EthercatResult<u16> {
        let mut buffer = T::Packed::zeroed();
        value.pack(buffer.as_mut())?;
        self.write_register(slave, field.byte as u16, &buffer.as_ref()[.. field.len], timeout)
    }
    /// read the AL status and the AL status code of a slave
    pub fn read_al_status(&self, slave: u16, timeout: Duration) -> EthercatResult<(AlStatus, u16)> {
        let block = self.read(slave, registers::al::status_code, timeout)?;
        Ok((block.status, block.code))
    }
}
