//! Traits and impls used to read/write data to/from the wire and the process image.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types than can be packed/unpacked to/from a PDU, an SDO buffer or the process image

	Everything is little endian, as in ethercat.
*/
pub trait PduData: Sized {
    const ID: TypeId;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}
}

/** Enum to identify and raise adapted error raised by this package
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PackingError {
    BadSize(usize, &'static str),
    BadAlignment(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// fixed size byte storage of a packed [PduData], since rust doesn't actually support using generic consts in const expressions
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/** dtype identifiers associated to dtypes allowing to dynamically check the type of a [PduData] implementor

	It is only convering the common useful types and not all the possible implementors of [PduData]
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeId {
	/// default value of the enum, used in case the matching [PduData] does not fit in any of these integers
	CUSTOM,
	VOID, BOOL,
	I8, I16, I32, I64,
	U8, U16, U32, U64,
	F32, F64,
}
impl TypeId {
	/// true for two's complement integers, whose truncated bit fields must be sign-extended
	pub const fn signed(self) -> bool {
		matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
	}
}

impl<const N: usize> PduData for [u8; N] {
	const ID: TypeId = TypeId::CUSTOM;
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        src.get(.. N)
            .and_then(|s| Self::try_from(s).ok())
            .ok_or(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))
	}
}

impl PduData for bool {
	const ID: TypeId = TypeId::BOOL;
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), ""))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), ""))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/// macro implementing [PduData] for a given struct generated with `bilge`
/// this is an ugly unsafe code to overcome the lack of traits providing containing ints in [bilge]
macro_rules! bilge_pdudata {
    ($t: ty, $id: ident) => { impl crate::data::PduData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
        type Packed = [u8; ($id::BITS as usize + 7)/8];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            if dst.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            dst[..Self::Packed::LEN].copy_from_slice(&unsafe{ core::mem::transmute_copy::<Self, Self::Packed>(self) });
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            if src.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))}
            let mut tmp = [0; core::mem::size_of::<Self>()];
            tmp[.. Self::Packed::LEN].copy_from_slice(&src[.. Self::Packed::LEN]);
            Ok(unsafe{ core::mem::transmute::<[u8; core::mem::size_of::<Self>()], Self>(tmp) })
        }
    }};
}
pub(crate) use bilge_pdudata;

/// unsafe macro implementing [PduData] for a given struct with `repr(packed)`
macro_rules! packed_pdudata {
    ($t: ty) => { impl crate::data::PduData for $t {
        const ID: crate::data::TypeId = crate::data::TypeId::CUSTOM;
        type Packed = [u8; core::mem::size_of::<$t>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            if dst.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for struct"))}
            dst[..Self::Packed::LEN].copy_from_slice(&unsafe{ core::mem::transmute_copy::<Self, Self::Packed>(self) });
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            let src: Self::Packed = src.get(.. Self::Packed::LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for struct"))?;
            Ok(unsafe{ core::mem::transmute::<Self::Packed, Self>(src) })
        }
    }};
}
pub(crate) use packed_pdudata;

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty, $id: ident) => { impl crate::data::PduData for $t {
			const ID: crate::data::TypeId = crate::data::TypeId::$id;
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
				let size = core::mem::size_of::<$t>();
				if dst.len() < size
					{return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for number"))}
				dst[.. size].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
				Ok(Self::from_le_bytes(src.get(.. core::mem::size_of::<$t>())
					.and_then(|s| s.try_into().ok())
					.ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for number"))?
					))
			}
		}};
}

num_pdudata!(u8, U8);
num_pdudata!(u16, U16);
num_pdudata!(u32, U32);
num_pdudata!(u64, U64);
num_pdudata!(i8, I8);
num_pdudata!(i16, I16);
num_pdudata!(i32, I32);
num_pdudata!(i64, I64);
num_pdudata!(f32, F32);
num_pdudata!(f64, F64);



/**
	locate some data in a datagram by its byte position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.

	This is what register addresses are made of in [crate::registers]
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start byte index of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: PduData> Field<T>
{
	/// build a Field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a Field from its byte offset, infering its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T>       {
		T::unpack(data.get(self.byte ..)
			.and_then(|d| d.get(.. self.len))
			.ok_or(PackingError::BadSize(data.len(), "field out of data"))?)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()>   {
		let size = data.len();
        value.pack(data.get_mut(self.byte ..)
			.and_then(|d| d.get_mut(.. self.len))
			.ok_or(PackingError::BadSize(size, "field out of data"))?)
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self   {Self::new(self.byte, self.len)}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}


/**
	locate some data in a datagram by its bit position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.

	Bits are numbered from the least significant bit of the first byte. A field narrower than `T` is zero-extended, or sign-extended when `T` is a signed integer. Fields up to 64 bits can be unaligned, wider fields must start on a byte boundary and fill `T` exactly.
*/
#[derive(Default, Eq, PartialEq, Hash)]
pub struct BitField<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start bit index of the object
	pub bit: usize,
	/// bit length of the object
	pub len: usize,
}
impl<T: PduData> BitField<T> {
	/// build a Field from its content
	pub const fn new(bit: usize, len: usize) -> Self {
		Self{extracted: PhantomData, bit, len}
	}
	/// byte aligned and exactly the size of `T`, so it can be copied without bit shifting
	fn aligned(&self) -> bool {
		self.bit % 8 == 0 && self.len == T::packed_bitsize()
	}
	fn check(&self, size: usize) -> PackingResult<()> {
		if (self.bit + self.len + 7) / 8 > size
			{return Err(PackingError::BadSize(size, "bit field out of data"))}
		if self.len > 64 && ! self.aligned()
			{return Err(PackingError::BadAlignment(self.bit, "wide bit fields must be byte aligned"))}
		if self.len > T::packed_bitsize()
			{return Err(PackingError::BadSize(self.len, "bit field larger than its type"))}
		Ok(())
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T>       {
		self.check(data.len())?;
		if self.aligned() {
			return T::unpack(&data[self.bit/8 ..][.. T::Packed::LEN])
		}
		let mut raw = 0u64;
		for i in 0 .. self.len {
			let bit = self.bit + i;
			if (data[bit/8] >> (bit%8)) & 1 != 0
				{raw |= 1 << i}
		}
		if T::ID.signed() && self.len > 0 && self.len < 64 && (raw >> (self.len-1)) & 1 != 0
			{raw |= u64::MAX << self.len}

		let mut packed = T::Packed::zeroed();
		let size = T::Packed::LEN.min(8);
		packed.as_mut()[.. size].copy_from_slice(&raw.to_le_bytes()[.. size]);
		T::unpack(packed.as_ref())
	}
	/// dump the given value to the place pointed by the field in the byte array, bits around the field are preserved
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()>   {
		self.check(data.len())?;
		if self.aligned() {
			return value.pack(&mut data[self.bit/8 ..][.. T::Packed::LEN])
		}
		let mut packed = T::Packed::zeroed();
		value.pack(packed.as_mut())?;
		let mut bytes = [0u8; 8];
		let size = T::Packed::LEN.min(8);
		bytes[.. size].copy_from_slice(&packed.as_ref()[.. size]);
		let raw = u64::from_le_bytes(bytes);

		for i in 0 .. self.len {
			let bit = self.bit + i;
			let mask = 1 << (bit%8);
			if (raw >> i) & 1 != 0
				{data[bit/8] |= mask}
			else
				{data[bit/8] &= !mask}
		}
		Ok(())
	}
}
impl<T: PduData> fmt::Debug for BitField<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "BitField{{{}, {}}}", self.bit, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for BitField<T> {
    fn clone(&self) -> Self   {Self::new(self.bit, self.len)}
}
impl<T: PduData> Copy for BitField<T> {}



#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bitfield_unaligned() {
		let mut data = [0u8; 4];
		let nibble = BitField::<u8>::new(4, 4);
		let word = BitField::<u16>::new(8, 12);

		nibble.set(&mut data, 0xa).unwrap();
		word.set(&mut data, 0xbcd).unwrap();
		assert_eq!(data, [0xa0, 0xcd, 0x0b, 0x00]);
		assert_eq!(nibble.get(&data).unwrap(), 0xa);
		assert_eq!(word.get(&data).unwrap(), 0xbcd);

		// neighbour bits are left untouched
		BitField::<bool>::new(0, 1).set(&mut data, true).unwrap();
		assert_eq!(nibble.get(&data).unwrap(), 0xa);
		assert_eq!(data[0], 0xa1);
	}

	#[test]
	fn bitfield_sign_extension() {
		let mut data = [0u8; 2];
		let field = BitField::<i8>::new(3, 5);
		field.set(&mut data, -3).unwrap();
		assert_eq!(field.get(&data).unwrap(), -3);
		field.set(&mut data, 7).unwrap();
		assert_eq!(field.get(&data).unwrap(), 7);
	}

	#[test]
	fn bitfield_bounds() {
		let data = [0u8; 2];
		assert!(BitField::<u16>::new(4, 16).get(&data).is_err());
		assert!(BitField::<u8>::new(4, 12).get(&data).is_err());
		assert_eq!(BitField::<u16>::new(0, 16).get(&[0x34, 0x12]).unwrap(), 0x1234);
	}

	#[test]
	fn field_access() {
		let mut data = [0u8; 6];
		let field = Field::<u32>::simple(2);
		field.set(&mut data, 0xdeadbeef).unwrap();
		assert_eq!(data, [0, 0, 0xef, 0xbe, 0xad, 0xde]);
		assert_eq!(field.get(&data).unwrap(), 0xdeadbeef);
		assert!(Field::<u32>::simple(4).get(&data).is_err());
	}
}
