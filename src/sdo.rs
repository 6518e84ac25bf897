/*!
    Asynchronous SDO transactions between the cyclic thread and the housekeeping.

    An SDO transfer takes much longer than a cycle, so it cannot be issued from the cyclic thread. Each registered object is split in two halves:

    - [SdoRequest] owned by the cyclic side, this is what the application reads and writes through [Reader] and [Writer]
    - [SdoTransfer] owned by the housekeeping, which performs the wire transfer when its slave gets its turn

    The two halves only meet in [sync], called once per cycle at the rendezvous, so they never need to be locked. There is never more than one wire transfer in flight for the same object.

    # Example

    ```ignore
    let speed: ReadSdo = master.register_sdo(drive, SdoObject::new(0x606c, 0, 4))?;
    let limit: WriteSdo = master.register_sdo(drive, SdoObject::new(0x6072, 0, 2))?;
    master.init()?;

    // in the cyclic loop
    let mut reader = master.read_sdo(speed)?;
    if reader.is_valid() {
        let speed = reader.get::<i32>()?;
    }
    reader.request_new_data();

    let mut writer = master.write_sdo(limit)?;
    if writer.can_write_data() {
        writer.write(1000u16)?;
    }
    ```
*/

use core::time::Duration;
use crate::{
    data::PduData,
    error::{EthercatError, EthercatResult},
    status::{SlaveId, StatusCallback},
    transport::BusTransport,
    };

/// maximum size of an SDO buffer
pub const MAX_SDO_SIZE: usize = 128;
pub type SdoBuffer = heapless::Vec<u8, MAX_SDO_SIZE>;


/// whether an object is read from or written to the slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdoDirection {
    Read,
    Write,
}

/// address and size of an object in the slave's dictionnary
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SdoObject {
    /// index of the item in the slave's dictionnary of objects
    pub index: u16,
    /// subindex in the item
    pub sub: u8,
    /// byte size of the data transfered
    pub size: usize,
}
impl SdoObject {
    pub const fn new(index: u16, sub: u8, size: usize) -> Self {
        Self {index, sub, size}
    }
}

/// state of the user-facing half
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CyclicState {
    WaitingForUserData,
    Queued,
    WaitingForTransfer,
}

/// state of the housekeeping half
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferState {
    Idle,
    DoTransfer,
    TransferDone,
    TransferFailed,
}


/// cyclic half of an SDO transaction
#[derive(Clone, Debug)]
pub struct SdoRequest {
    object: SdoObject,
    direction: SdoDirection,
    buffer: SdoBuffer,
    state: CyclicState,
    valid: bool,
}
impl SdoRequest {
    pub fn object(&self) -> SdoObject  {self.object}
    pub fn direction(&self) -> SdoDirection  {self.direction}
    pub fn state(&self) -> CyclicState  {self.state}
    /// the last queued transaction succeeded and no new transaction has been queued since
    pub fn is_valid(&self) -> bool  {self.valid}
    /// no transaction is queued or running
    pub fn is_ready(&self) -> bool  {self.state == CyclicState::WaitingForUserData}

    /**
        queue a new transaction

        returns false, leaving the buffer untouched, if the previous transaction is still ongoing
    */
    pub fn queue(&mut self) -> bool {
        if ! self.is_ready()
            {return false}
        self.state = CyclicState::Queued;
        self.valid = false;
        true
    }
}

/// housekeeping half of an SDO transaction
#[derive(Clone, Debug)]
pub struct SdoTransfer {
    object: SdoObject,
    direction: SdoDirection,
    buffer: SdoBuffer,
    state: TransferState,
}
impl SdoTransfer {
    pub fn object(&self) -> SdoObject  {self.object}
    pub fn state(&self) -> TransferState  {self.state}
    /// a wire transfer is waiting to be performed
    pub fn pending(&self) -> bool  {self.state == TransferState::DoTransfer}

    /**
        perform the pending wire transfer, returns false if there was nothing to do

        A transfer answered by no slave is marked failed, the failure only shows on the cyclic side as an invalid request.
    */
    pub fn execute(&mut self, bus: &dyn BusTransport, slave: &SlaveId, timeout: Duration, status: &dyn StatusCallback) -> bool {
        if ! self.pending()
            {return false}
        let SdoObject {index, sub, ..} = self.object;
        let wkc = match self.direction {
            SdoDirection::Read => {
                let wkc = bus.sdo_read(slave.index, index, sub, &mut self.buffer, timeout);
                status.sdo_read(slave, index, sub, wkc, &self.buffer);
                wkc
            },
            SdoDirection::Write => {
                let wkc = bus.sdo_write(slave.index, index, sub, &self.buffer, timeout);
                status.sdo_write(slave, index, sub, wkc, &self.buffer);
                wkc
            },
        };
        self.state = if wkc > 0 {TransferState::TransferDone} else {TransferState::TransferFailed};
        true
    }
}

/// create both halves of a transaction on the given object
pub fn split(object: SdoObject, direction: SdoDirection) -> EthercatResult<(SdoRequest, SdoTransfer)> {
    if object.size > MAX_SDO_SIZE
        {return Err(EthercatError::Master("SDO larger than the maximum buffer size"))}
    let mut buffer = SdoBuffer::new();
    buffer.resize_default(object.size)
        .map_err(|_| EthercatError::Master("SDO larger than the maximum buffer size"))?;
    Ok((
        SdoRequest {object, direction, buffer: buffer.clone(), state: CyclicState::WaitingForUserData, valid: false},
        SdoTransfer {object, direction, buffer, state: TransferState::Idle},
        ))
}

/**
    rendezvous of the two halves, called once per cycle while the housekeeping is not running

    - a queued request is handed to an idle transfer, written data is copied to the transfer
    - a finished transfer is handed back, read data is copied to the request and validity reflects the outcome
*/
pub fn sync(request: &mut SdoRequest, transfer: &mut SdoTransfer) {
    match (request.state, transfer.state) {
        (CyclicState::Queued, TransferState::Idle) => {
            if request.direction == SdoDirection::Write
                {transfer.buffer.clone_from(&request.buffer)}
            transfer.state = TransferState::DoTransfer;
            request.state = CyclicState::WaitingForTransfer;
        },
        (CyclicState::WaitingForTransfer, TransferState::TransferDone | TransferState::TransferFailed) => {
            let done = transfer.state == TransferState::TransferDone;
            if done && request.direction == SdoDirection::Read
                {request.buffer.clone_from(&transfer.buffer)}
            request.valid = done;
            request.state = CyclicState::WaitingForUserData;
            transfer.state = TransferState::Idle;
        },
        _ => {},
    }
}


/// handle on a registered object read from the slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReadSdo {
    pub(crate) slave: usize,
    pub(crate) sdo: usize,
}
/// handle on a registered object written to the slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteSdo {
    pub(crate) slave: usize,
    pub(crate) sdo: usize,
}

/// handle types returned by [crate::Master::register_sdo]
pub trait SdoHandle: Copy {
    const DIRECTION: SdoDirection;
    #[doc(hidden)]
    fn new(slave: usize, sdo: usize) -> Self;
    #[doc(hidden)]
    fn location(&self) -> (usize, usize);
}
impl SdoHandle for ReadSdo {
    const DIRECTION: SdoDirection = SdoDirection::Read;
    fn new(slave: usize, sdo: usize) -> Self  {Self {slave, sdo}}
    fn location(&self) -> (usize, usize)  {(self.slave, self.sdo)}
}
impl SdoHandle for WriteSdo {
    const DIRECTION: SdoDirection = SdoDirection::Write;
    fn new(slave: usize, sdo: usize) -> Self  {Self {slave, sdo}}
    fn location(&self) -> (usize, usize)  {(self.slave, self.sdo)}
}


/// cyclic access to an object read from the slave
pub struct Reader<'a>(pub(crate) &'a mut SdoRequest);
impl Reader<'_> {
    /// queue a read, returns false if the previous one is not finished yet
    pub fn request_new_data(&mut self) -> bool  {self.0.queue()}
    pub fn is_valid(&self) -> bool  {self.0.is_valid()}
    /// the data received by the last successful read
    pub fn data(&self) -> EthercatResult<&[u8]> {
        if ! self.0.valid
            {return Err(EthercatError::Master("no valid SDO data available"))}
        Ok(&self.0.buffer)
    }
    /// extract the data received by the last successful read
    pub fn get<T: PduData>(&self) -> EthercatResult<T> {
        Ok(T::unpack(self.data()?)?)
    }
}

/// cyclic access to an object written to the slave
pub struct Writer<'a>(pub(crate) &'a mut SdoRequest);
impl Writer<'_> {
    /**
        true if the last write succeeded

        Only the first call after a successful write returns true
    */
    pub fn data_has_been_written(&mut self) -> bool {
        core::mem::replace(&mut self.0.valid, false)
    }
    /**
        true if no write has ever been requested, or if the last one is finished

        This consumes the success report of [Self::data_has_been_written]
    */
    pub fn can_write_data(&mut self) -> bool {
        self.data_has_been_written() || self.0.is_ready()
    }
    /// pack a value and queue its write, fails if the previous write is not finished yet
    pub fn write<T: PduData>(&mut self, value: T) -> EthercatResult {
        if ! self.0.is_ready()
            {return Err(EthercatError::Master("cannot write new value to SDO, SDO is not ready"))}
        if T::packed_size() > self.0.buffer.len()
            {return Err(EthercatError::Master("value larger than the SDO"))}
        self.0.buffer.iter_mut().for_each(|b| *b = 0);
        value.pack(&mut self.0.buffer)?;
        self.0.queue();
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn complete(transfer: &mut SdoTransfer, data: &[u8], success: bool) {
        assert!(transfer.pending());
        transfer.buffer[..].copy_from_slice(data);
        transfer.state = if success {TransferState::TransferDone} else {TransferState::TransferFailed};
    }

    #[test]
    fn read_cycle() {
        let (mut request, mut transfer) = split(SdoObject::new(0x6064, 0, 4), SdoDirection::Read).unwrap();
        let mut reader = Reader(&mut request);
        assert!(! reader.is_valid());
        assert!(reader.get::<i32>().is_err());
        assert!(reader.request_new_data());
        // already queued
        assert!(! reader.request_new_data());

        sync(&mut request, &mut transfer);
        assert_eq!(request.state(), CyclicState::WaitingForTransfer);
        assert_eq!(transfer.state(), TransferState::DoTransfer);
        assert!(! Reader(&mut request).request_new_data());

        // nothing changes while the transfer is running
        sync(&mut request, &mut transfer);
        assert_eq!(request.state(), CyclicState::WaitingForTransfer);

        complete(&mut transfer, &(-5i32).to_le_bytes(), true);
        sync(&mut request, &mut transfer);
        assert_eq!(transfer.state(), TransferState::Idle);
        let reader = Reader(&mut request);
        assert!(reader.is_valid());
        assert_eq!(reader.get::<i32>().unwrap(), -5);
    }

    #[test]
    fn failed_read() {
        let (mut request, mut transfer) = split(SdoObject::new(0x6064, 0, 2), SdoDirection::Read).unwrap();
        assert!(request.queue());
        sync(&mut request, &mut transfer);
        complete(&mut transfer, &[1, 2], false);
        sync(&mut request, &mut transfer);
        assert!(! request.is_valid());
        assert!(request.is_ready());
        assert_eq!(request.buffer.as_slice(), &[0, 0]);
    }

    #[test]
    fn write_reported_once() {
        let (mut request, mut transfer) = split(SdoObject::new(0x6072, 0, 2), SdoDirection::Write).unwrap();
        let mut writer = Writer(&mut request);
        assert!(writer.can_write_data());
        writer.write(0x1234u16).unwrap();
        assert!(! writer.can_write_data());
        assert!(writer.write(0u16).is_err());

        sync(&mut request, &mut transfer);
        assert_eq!(transfer.buffer.as_slice(), &[0x34, 0x12]);
        complete(&mut transfer, &[0x34, 0x12], true);
        sync(&mut request, &mut transfer);

        let mut writer = Writer(&mut request);
        assert!(writer.data_has_been_written());
        assert!(! writer.data_has_been_written());
        assert!(writer.can_write_data());
    }

    #[test]
    fn oversized() {
        assert!(split(SdoObject::new(0x2000, 0, 129), SdoDirection::Read).is_err());
        let (mut request, _) = split(SdoObject::new(0x2000, 0, 2), SdoDirection::Write).unwrap();
        assert!(Writer(&mut request).write(0u32).is_err());
        assert!(request.is_ready());
    }
}
