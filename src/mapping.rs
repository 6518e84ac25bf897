/*!
    This module provide helper structs to describe the process data of each slave and to use it in the shared process image.

    It highlights
    - [Mapping] the schema of one slave's process data: its sync managers, their PDOs and the PDO entries, in the exact order the slave exchanges them
    - [Entry] a typed handle on one PDO entry, returned when the entry is pushed and usable once the master linked the schema to the process image
    - [ProcessImage] the buffer exchanged with the bus every cycle

    Example

    ```ignore
    let drive = master.register_slave(Slave::new(0x9a, 0x30924, 0, 0))?;
    let mut mapping = master.mapping(drive)?;
        let mut channel = mapping.channel(2, Direction::Output, true);
            let mut pdo = channel.push(0x1600);
                let controlword = pdo.push::<u16>("controlword");
                let target = pdo.push::<i32>("target position");
        let mut channel = mapping.channel(3, Direction::Input, true);
            let mut pdo = channel.push(0x1a00);
                let statusword = pdo.push::<u16>("statusword");
                let position = pdo.push::<i32>("position");
                let fault = pdo.push_bits::<bool>("fault", 1);
                let padding = pdo.push_bits::<u8>("padding", 7);

    master.init()?;

    // realtime exchanges
    master.send()?;
    master.receive();
    let position = master.get(position)?;
    master.set(target, position + 100)?;
    ```
*/

use core::{fmt, marker::PhantomData};
use crate::{
    data::{PduData, BitField},
    error::{ConfigError, EthercatError, EthercatResult},
    layout::BitCursor,
    transport::Region,
    };


/// direction of a process data channel, seen from the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// data sent by the slave (TxPDO)
    Input,
    /// data sent to the slave (RxPDO)
    Output,
}
impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// one value in a PDO
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdoEntry {
    pub name: &'static str,
    pub bits: usize,
    pub signed: bool,
}

/// a PDO and the indices of its entries in [Mapping::entries]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pdo {
    pub index: u16,
    pub entries: Vec<usize>,
}

/// a sync manager channel and the PDOs assigned to it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Channel {
    pub index: u8,
    pub direction: Direction,
    /// whether the PDO assignment must be written to the slave during configuration
    pub configure: bool,
    pub pdos: Vec<Pdo>,
}

/**
    process data schema of one slave

    The pushed entries are placed in the exact order they are pushed. Each PDO starts on a byte boundary when it is at least a byte long, entries inside a PDO are packed bit to bit, as the slave sends them.
*/
#[derive(Clone, Debug, Default)]
pub struct Mapping {
    /// registration index of the slave this mapping belongs to
    slave: usize,
    channels: Vec<Channel>,
    entries: Vec<PdoEntry>,
    /// absolute bit position of each entry in the process image, set by [Self::link]
    offsets: Vec<Option<usize>>,
}

impl Mapping {
    pub(crate) fn new(slave: usize) -> Self {
        Self {slave, .. Default::default()}
    }
    /// add a sync manager channel, and return an object to push its PDOs
    pub fn channel(&mut self, index: u8, direction: Direction, configure: bool) -> MappingChannel<'_> {
        let channel = match self.channels.iter().position(|c| c.index == index) {
            Some(channel) => channel,
            None => {
                self.channels.push(Channel {index, direction, configure, pdos: Vec::new()});
                self.channels.len() - 1
            },
        };
        MappingChannel {mapping: self, channel}
    }
    pub fn channels(&self) -> &[Channel]  {&self.channels}
    pub fn entries(&self) -> &[PdoEntry]  {&self.entries}

    fn pdo_bits(&self, pdo: &Pdo) -> usize {
        pdo.entries.iter().map(|&e| self.entries[e].bits).sum()
    }
    /// number of bytes the given direction needs in the process image, each PDO rounded to bytes
    pub fn size(&self, direction: Direction) -> usize {
        self.channels.iter()
            .filter(|c| c.direction == direction)
            .flat_map(|c| c.pdos.iter())
            .map(|pdo| (self.pdo_bits(pdo) + 7) / 8)
            .sum()
    }
    /// number of bytes this slave needs in the process image
    pub fn process_data_size(&self) -> usize {
        self.size(Direction::Input) + self.size(Direction::Output)
    }

    /**
        place the entries of the given direction in the slave's region of the process image

        The whole region must be used: any bit left at the end means the schema does not match what the slave really exchanges.
    */
    pub fn link(&mut self, direction: Direction, region: Region) -> Result<(), LinkError> {
        let mut cursor = BitCursor::new(region.byte, region.bit.into(), region.bits);
        for channel in self.channels.iter().filter(|c| c.direction == direction) {
            for pdo in channel.pdos.iter() {
                let bits = pdo.entries.iter().map(|&e| self.entries[e].bits).sum::<usize>();
                cursor.align(bits >> 3, bits & 7)
                    .map_err(|_| LinkError::InsufficientSpace)?;
                let mut position = cursor.position();
                for &entry in pdo.entries.iter() {
                    self.offsets[entry] = Some(position);
                    position += self.entries[entry].bits;
                }
                cursor.advance(bits >> 3, bits & 7)
                    .map_err(|_| LinkError::InsufficientSpace)?;
            }
        }
        match cursor.available_bits() {
            0 => Ok(()),
            bits => Err(LinkError::UnmappedBits(bits)),
        }
    }
    /// forget the locations of all entries
    pub(crate) fn unlink(&mut self) {
        self.offsets.iter_mut().for_each(|offset| *offset = None);
    }
    /// same as [Self::link] but reporting the configuration error of the given slave
    pub(crate) fn link_slave(&mut self, direction: Direction, region: Region, alias: u16, position: u16) -> EthercatResult {
        self.link(direction, region).map_err(|e| match e {
            LinkError::InsufficientSpace => ConfigError::InsufficientImageSpace {alias, position, direction},
            LinkError::UnmappedBits(bits) => ConfigError::UnmappedBits {alias, position, bits, direction},
        }.into())
    }
    /// location of an entry in the process image, if linked
    pub fn field<T: PduData>(&self, entry: Entry<T>) -> EthercatResult<BitField<T>> {
        if entry.slave != self.slave
            {return Err(EthercatError::Master("entry belongs to an other slave"))}
        let position = self.offsets.get(entry.index)
            .copied()
            .flatten()
            .ok_or(EthercatError::Master("entry is not linked to the process image"))?;
        Ok(BitField::new(position, self.entries[entry.index].bits))
    }
}

/// reason why a schema does not fit in its region
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkError {
    InsufficientSpace,
    UnmappedBits(usize),
}

/// object allowing to push PDOs to a sync manager channel
pub struct MappingChannel<'a> {
    mapping: &'a mut Mapping,
    channel: usize,
}
impl MappingChannel<'_> {
    /// add a pdo to this channel, and return an object to push its entries
    pub fn push(&mut self, index: u16) -> MappingPdo<'_>  {
        let pdos = &mut self.mapping.channels[self.channel].pdos;
        pdos.push(Pdo {index, entries: Vec::new()});
        let pdo = pdos.len() - 1;
        MappingPdo {mapping: self.mapping, channel: self.channel, pdo}
    }
}

/// object allowing to push entries to a PDO
pub struct MappingPdo<'a> {
    mapping: &'a mut Mapping,
    channel: usize,
    pdo: usize,
}
impl MappingPdo<'_> {
    /// add an entry of the full size of `T`
    pub fn push<T: PduData>(&mut self, name: &'static str) -> Entry<T> {
        self.push_bits(name, T::packed_bitsize())
    }
    /// add an entry of the given bit size, extracted to `T`
    pub fn push_bits<T: PduData>(&mut self, name: &'static str, bits: usize) -> Entry<T> {
        let mapping = &mut *self.mapping;
        let index = mapping.entries.len();
        mapping.entries.push(PdoEntry {name, bits, signed: T::ID.signed()});
        mapping.offsets.push(None);
        mapping.channels[self.channel].pdos[self.pdo].entries.push(index);
        Entry {slave: mapping.slave, index, extracted: PhantomData}
    }
}


/**
    typed handle on a PDO entry of a registered slave

    It does not hold the entry offset, which is only known once the master linked the process image, it only identifies the entry so the master can find it.
*/
pub struct Entry<T: PduData> {
    slave: usize,
    index: usize,
    extracted: PhantomData<T>,
}
impl<T: PduData> Entry<T> {
    /// registration index of the slave owning this entry
    pub fn slave(&self) -> usize  {self.slave}
}
impl<T: PduData> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entry{{{}, {}}}", self.slave, self.index)
    }
}
// [Clone] and [Copy] must be implemented manually to allow copying an entry pointing to a type which does not implement this operation
impl<T: PduData> Clone for Entry<T> {
    fn clone(&self) -> Self   {Self {slave: self.slave, index: self.index, extracted: PhantomData}}
}
impl<T: PduData> Copy for Entry<T> {}


/// the contiguous buffer exchanged with the bus every cycle, inputs and outputs of all slaves
#[derive(Clone, Debug, Default)]
pub struct ProcessImage {
    data: Vec<u8>,
}
impl ProcessImage {
    pub fn new(size: usize) -> Self  {Self {data: vec![0; size]}}
    pub fn len(&self) -> usize  {self.data.len()}
    pub fn is_empty(&self) -> bool  {self.data.is_empty()}
    pub fn as_slice(&self) -> &[u8]  {&self.data}
    pub fn as_mut_slice(&mut self) -> &mut [u8]  {&mut self.data}

    /// extract a mapped value
    pub fn get<T: PduData>(&self, field: BitField<T>) -> EthercatResult<T> {
        Ok(field.get(&self.data)?)
    }
    /// pack a mapped value
    pub fn set<T: PduData>(&mut self, field: BitField<T>, value: T) -> EthercatResult {
        Ok(field.set(&mut self.data, value)?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> (Mapping, Entry<u16>, Entry<i32>, Entry<bool>, Entry<u8>, Entry<u16>) {
        let mut mapping = Mapping::new(0);
        let mut channel = mapping.channel(2, Direction::Output, true);
        let mut pdo = channel.push(0x1600);
        let control = pdo.push::<u16>("controlword");
        let mut channel = mapping.channel(3, Direction::Input, true);
        let mut pdo = channel.push(0x1a00);
        let position = pdo.push::<i32>("position");
        let fault = pdo.push_bits::<bool>("fault", 1);
        let mode = pdo.push_bits::<u8>("mode", 3);
        let mut pdo = channel.push(0x1a01);
        let status = pdo.push::<u16>("statusword");
        (mapping, control, position, fault, mode, status)
    }

    #[test]
    fn sizes() {
        let (mapping, ..) = drive();
        assert_eq!(mapping.size(Direction::Output), 2);
        // 36 bits rounded to 5 bytes, then 2 bytes
        assert_eq!(mapping.size(Direction::Input), 7);
        assert_eq!(mapping.process_data_size(), 9);
        assert_eq!(mapping.entries()[2], PdoEntry {name: "fault", bits: 1, signed: false});
        assert!(mapping.entries()[1].signed);
    }

    #[test]
    fn link_and_access() {
        let (mut mapping, control, position, fault, mode, status) = drive();
        mapping.link(Direction::Output, Region {byte: 0, bit: 0, bits: 16}).unwrap();
        // the second PDO is byte wide so it starts on the next byte
        mapping.link(Direction::Input, Region {byte: 2, bit: 0, bits: 56}).unwrap();

        assert_eq!(mapping.field(control).unwrap(), BitField::new(0, 16));
        assert_eq!(mapping.field(position).unwrap(), BitField::new(16, 32));
        assert_eq!(mapping.field(fault).unwrap(), BitField::new(48, 1));
        assert_eq!(mapping.field(mode).unwrap(), BitField::new(49, 3));
        assert_eq!(mapping.field(status).unwrap(), BitField::new(56, 16));

        let mut image = ProcessImage::new(9);
        image.set(mapping.field(position).unwrap(), -2).unwrap();
        image.set(mapping.field(fault).unwrap(), true).unwrap();
        image.set(mapping.field(mode).unwrap(), 5).unwrap();
        image.set(mapping.field(status).unwrap(), 0x0237).unwrap();
        assert_eq!(image.as_slice(), &[0, 0, 0xfe, 0xff, 0xff, 0xff, 0b1011, 0x37, 0x02]);
        assert_eq!(image.get(mapping.field(position).unwrap()).unwrap(), -2);
        assert_eq!(image.get(mapping.field(mode).unwrap()).unwrap(), 5);
    }

    #[test]
    fn link_errors() {
        let (mut mapping, control, ..) = drive();
        assert!(mapping.field(control).is_err());
        assert_eq!(
            mapping.link(Direction::Output, Region {byte: 0, bit: 0, bits: 24}),
            Err(LinkError::UnmappedBits(8)));
        assert_eq!(
            mapping.link(Direction::Output, Region {byte: 0, bit: 0, bits: 12}),
            Err(LinkError::InsufficientSpace));
        assert_eq!(
            mapping.link_slave(Direction::Input, Region {byte: 2, bit: 0, bits: 60}, 0, 3)
                .map_err(|e| match e {EthercatError::Config(e) => Some(e), _ => None}),
            Err(Some(ConfigError::UnmappedBits {alias: 0, position: 3, bits: 4, direction: Direction::Input})));
    }
}
