/*!
    Bit cursor used to place the PDO entries of a slave in its region of the process image.

    A slave's region in the process image is not necessarily byte aligned, and its entries can be narrower than a byte, so the cursor tracks a byte and a bit offset and refuses to go beyond the region.
*/

use crate::error::{EthercatError, EthercatResult};


/**
    position of the next free bit in a region of the process image

    The position only moves forward. A move that would go beyond the region's capacity fails and leaves the position unchanged.

    ## Example

    ```
    # use ethercycle::layout::BitCursor;
    let mut cursor = BitCursor::new(0, 0, 16);
    cursor.advance(0, 4).unwrap();
    // a byte wide entry will not start mid-byte
    cursor.align(1, 0).unwrap();
    assert_eq!((cursor.byte_offset(), cursor.bit_offset()), (1, 0));
    cursor.advance(1, 0).unwrap();
    assert_eq!(cursor.available_bits(), 0);
    assert!(cursor.advance(0, 1).is_err());
    ```
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BitCursor {
    byte: usize,
    bit: usize,
    /// absolute bit position of the end of the region
    capacity: usize,
}

impl BitCursor {
    /// cursor at the start of a region of `size` bits beginning at the given byte and bit
    pub fn new(byte: usize, bit: usize, size: usize) -> Self {
        Self {
            byte: byte + bit / 8,
            bit: bit % 8,
            capacity: byte*8 + bit + size,
        }
    }

    pub fn byte_offset(&self) -> usize  {self.byte}
    pub fn bit_offset(&self) -> usize  {self.bit}
    /// absolute bit position in the image
    pub fn position(&self) -> usize  {self.byte*8 + self.bit}
    /// bits remaining until the end of the region
    pub fn available_bits(&self) -> usize  {self.capacity - self.position()}

    /// move forward by the given size, fails without moving if this overflows the region
    pub fn advance(&mut self, bytes: usize, bits: usize) -> EthercatResult {
        let bit = self.bit + bits;
        let byte = self.byte + bytes + bit / 8;
        let bit = bit % 8;
        if byte*8 + bit > self.capacity {
            return Err(EthercatError::Master("not enough space in process image"))
        }
        self.byte = byte;
        self.bit = bit;
        Ok(())
    }

    /// round up to the next byte if a field of the given size is at least a byte wide and the cursor is mid-byte
    pub fn align(&mut self, bytes: usize, bits: usize) -> EthercatResult {
        if bytes + (bits >> 3) != 0 && self.bit != 0 {
            self.advance(0, 8 - self.bit)
        }
        else {
            Ok(())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::BitCursor;

    fn state(cursor: &BitCursor) -> (usize, usize, usize) {
        (cursor.byte_offset(), cursor.bit_offset(), cursor.available_bits())
    }

    #[test]
    fn advance_sequence() {
        let mut cursor = BitCursor::new(0, 0, 128);
        assert_eq!(state(&cursor), (0, 0, 128));
        for (step, expected) in [
                ((0, 4), (0, 4, 124)),
                ((0, 4), (1, 0, 120)),
                ((0, 4), (1, 4, 116)),
                ((1, 6), (3, 2, 102)),
                ((0, 6), (4, 0, 96)),
                ((3, 7), (7, 7, 65)),
                ] {
            cursor.advance(step.0, step.1).unwrap();
            assert_eq!(state(&cursor), expected);
        }
        assert!(cursor.advance(8, 2).is_err());
        assert_eq!(state(&cursor), (7, 7, 65));
    }

    #[test]
    fn advance_to_capacity() {
        let mut cursor = BitCursor::new(12, 5, 128);
        cursor.advance(15, 3).unwrap();
        assert_eq!(state(&cursor), (28, 0, 5));
        cursor.advance(0, 1).unwrap();
        assert_eq!(cursor.available_bits(), 4);
        cursor.advance(0, 4).unwrap();
        assert_eq!(cursor.available_bits(), 0);
        assert!(cursor.advance(0, 1).is_err());
        assert_eq!(state(&cursor), (28, 5, 0));
    }

    #[test]
    fn align() {
        let mut cursor = BitCursor::new(0, 0, 128);
        // bit fields never trigger alignment
        cursor.align(0, 3).unwrap();
        assert_eq!(state(&cursor), (0, 0, 128));
        cursor.advance(0, 3).unwrap();
        cursor.align(0, 3).unwrap();
        assert_eq!(state(&cursor), (0, 3, 125));
        // a byte wide field starts on the next byte
        cursor.align(1, 0).unwrap();
        assert_eq!(state(&cursor), (1, 0, 120));
        cursor.advance(1, 0).unwrap();
        // already aligned
        cursor.align(2, 0).unwrap();
        assert_eq!(state(&cursor), (2, 0, 112));
    }

    #[test]
    fn unaligned_start() {
        let mut cursor = BitCursor::new(3, 6, 10);
        assert_eq!(state(&cursor), (3, 6, 10));
        cursor.align(0, 8).unwrap();
        assert_eq!(state(&cursor), (4, 0, 8));
        assert!(cursor.advance(1, 1).is_err());
        cursor.advance(1, 0).unwrap();
        assert_eq!(cursor.available_bits(), 0);
    }
}
