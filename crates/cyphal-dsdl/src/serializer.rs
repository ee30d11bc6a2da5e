//! Bit-level serializer for the DSDL wire format.
//!
//! The serializer writes into a caller-provided zero-initialized buffer,
//! either bit-by-bit or in aligned bulk. Multi-byte values are always
//! little-endian and bits are filled LSB first. Unaligned writes use a
//! variant of Ben Dyer's unaligned bit copy algorithm specialized for the
//! case where the source is byte-aligned.

use half::f16;

use crate::{
    CodecError,
    primitive::{StdPrimitive, pack_bits_lsb, unsigned_to_bytes},
};

/// The buffer must extend one byte past the requested capacity because
/// non-byte-aligned writes temporarily touch the byte after the cursor.
pub const EXTRA_BUFFER_CAPACITY_BYTES: usize = 1;

/// Bit-oriented writer over a borrowed destination buffer.
///
/// Constructed over a zero-initialized buffer of `extent + 1` bytes (see
/// [`EXTRA_BUFFER_CAPACITY_BYTES`]); the serializer is the exclusive writer
/// for its lifetime. [`Serializer::fork_bytes`] creates a child serializer
/// over a sub-range of the same buffer for delimited nested values; the
/// borrow checker prevents interleaved writes through parent and fork.
///
/// Methods that accept an explicit bit length truncate the value to the low
/// `bit_length` bits. Saturation of out-of-range values is the caller's
/// concern, with one exception: float conversions degrade to infinity.
#[derive(Debug)]
pub struct Serializer<'a> {
    buf: &'a mut [u8],
    bit_offset: usize,
}

impl<'a> Serializer<'a> {
    /// Creates a serializer over `buffer`, which must be zero-initialized
    /// and sized `extent_bytes + EXTRA_BUFFER_CAPACITY_BYTES`.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buf: buffer, bit_offset: 0 }
    }

    /// Number of bits written so far.
    #[must_use]
    pub fn current_bit_length(&self) -> usize {
        self.bit_offset
    }

    /// The destination bytes written so far, zero-bit-padded to a whole byte.
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.bit_offset.div_ceil(8).min(self.buf.len())]
    }

    /// Advances the cursor without writing. Used for padding fields and for
    /// skipping ranges written by forked serializers.
    pub fn skip_bits(&mut self, bit_length: usize) {
        self.bit_offset += bit_length;
    }

    /// Writes zero bits until the cursor is a multiple of `bit_length`.
    pub fn pad_to_alignment(&mut self, bit_length: usize) -> Result<(), CodecError> {
        while self.bit_offset % bit_length != 0 {
            self.add_unaligned_bit(false)?;
        }
        Ok(())
    }

    /// Creates a serializer over the next `forked_buffer_size_bytes + 1`
    /// bytes of the same buffer, starting at the current cursor position.
    ///
    /// This is the building block of delimited serialization; see
    /// [`Serializer::add_delimited`] for the complete procedure. Fails with
    /// [`CodecError::InvalidValue`] if the cursor is not byte-aligned or the
    /// remaining buffer is too small.
    pub fn fork_bytes(
        &mut self,
        forked_buffer_size_bytes: usize,
    ) -> Result<Serializer<'_>, CodecError> {
        if self.bit_offset % 8 != 0 {
            return Err(CodecError::InvalidValue("cannot fork unaligned serializer".into()));
        }
        let offset = self.bit_offset / 8;
        let required = forked_buffer_size_bytes + EXTRA_BUFFER_CAPACITY_BYTES;
        let available = self.buf.len().saturating_sub(offset);
        if available < required {
            return Err(CodecError::InvalidValue(format!(
                "required forked buffer size of {required} bytes exceeds \
                 the remaining buffer space of {available} bytes"
            )));
        }
        Ok(Serializer { buf: &mut self.buf[offset..offset + required], bit_offset: 0 })
    }

    /// Serializes a delimited nested value: reserves the 32-bit delimiter
    /// header, runs `f` against a fork positioned after the header, then
    /// back-patches the header with the actual nested length in bytes and
    /// advances the cursor past the written range.
    pub fn add_delimited<F>(&mut self, max_size_bytes: usize, f: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut Serializer<'_>) -> Result<(), CodecError>,
    {
        let header_offset = self.bit_offset / 8;
        self.add_aligned_u32(0)?; // Reserved; patched below.
        let nested_bytes = {
            let mut fork = self.fork_bytes(max_size_bytes)?;
            f(&mut fork)?;
            fork.current_bit_length().div_ceil(8)
        };
        let header = u32::try_from(nested_bytes).map_err(|_| {
            CodecError::InvalidValue(format!("delimited value of {nested_bytes} bytes is too long"))
        })?;
        self.buf[header_offset..header_offset + 4].copy_from_slice(&header.to_le_bytes());
        self.skip_bits(nested_bytes * 8);
        Ok(())
    }

    // Fast methods optimized for aligned primitive fields. The most
    // specialized method must be used whenever one is applicable.

    /// Appends raw bytes. The cursor must be byte-aligned.
    pub fn add_aligned_bytes(&mut self, bs: &[u8]) -> Result<(), CodecError> {
        let offset = self.ensure_aligned()?;
        self.ensure_capacity(offset + bs.len())?;
        self.buf[offset..offset + bs.len()].copy_from_slice(bs);
        self.bit_offset += bs.len() * 8;
        Ok(())
    }

    /// Encodes an array of booleans one bit per element, LSB first.
    /// The cursor must be byte-aligned.
    pub fn add_aligned_array_of_bits(&mut self, bits: &[bool]) -> Result<(), CodecError> {
        let offset = self.ensure_aligned()?;
        let packed = pack_bits_lsb(bits);
        self.ensure_capacity(offset + packed.len())?;
        self.buf[offset..offset + packed.len()].copy_from_slice(&packed);
        self.bit_offset += bits.len();
        Ok(())
    }

    /// Bulk-encodes an array of standard-bit-length primitives. On a
    /// little-endian host this degenerates to a plain memory copy; the
    /// explicit per-element conversion keeps the wire form correct
    /// everywhere. The cursor must be byte-aligned.
    pub fn add_aligned_array_of_standard_bit_length_primitives<T: StdPrimitive>(
        &mut self,
        xs: &[T],
    ) -> Result<(), CodecError> {
        let mut offset = self.ensure_aligned()?;
        self.ensure_capacity(offset + xs.len() * T::SIZE_BYTES)?;
        for &x in xs {
            x.write_le(&mut self.buf[offset..offset + T::SIZE_BYTES]);
            offset += T::SIZE_BYTES;
        }
        self.bit_offset += xs.len() * T::SIZE_BYTES * 8;
        Ok(())
    }

    /// Appends one aligned byte.
    pub fn add_aligned_u8(&mut self, x: u8) -> Result<(), CodecError> {
        self.add_aligned_bytes(&[x])
    }

    /// Appends an aligned little-endian `u16`.
    pub fn add_aligned_u16(&mut self, x: u16) -> Result<(), CodecError> {
        self.add_aligned_bytes(&x.to_le_bytes())
    }

    /// Appends an aligned little-endian `u32`.
    pub fn add_aligned_u32(&mut self, x: u32) -> Result<(), CodecError> {
        self.add_aligned_bytes(&x.to_le_bytes())
    }

    /// Appends an aligned little-endian `u64`.
    pub fn add_aligned_u64(&mut self, x: u64) -> Result<(), CodecError> {
        self.add_aligned_bytes(&x.to_le_bytes())
    }

    /// Appends an aligned `i8` in two's complement.
    pub fn add_aligned_i8(&mut self, x: i8) -> Result<(), CodecError> {
        self.add_aligned_u8(x as u8)
    }

    /// Appends an aligned little-endian `i16` in two's complement.
    pub fn add_aligned_i16(&mut self, x: i16) -> Result<(), CodecError> {
        self.add_aligned_u16(x as u16)
    }

    /// Appends an aligned little-endian `i32` in two's complement.
    pub fn add_aligned_i32(&mut self, x: i32) -> Result<(), CodecError> {
        self.add_aligned_u32(x as u32)
    }

    /// Appends an aligned little-endian `i64` in two's complement.
    pub fn add_aligned_i64(&mut self, x: i64) -> Result<(), CodecError> {
        self.add_aligned_u64(x as u64)
    }

    /// Appends an aligned IEEE 754 binary16. Values exceeding the binary16
    /// range degrade to the correspondingly signed infinity.
    pub fn add_aligned_f16(&mut self, x: f32) -> Result<(), CodecError> {
        self.add_aligned_bytes(&f16::from_f32(x).to_le_bytes())
    }

    /// Appends an aligned IEEE 754 binary32.
    pub fn add_aligned_f32(&mut self, x: f32) -> Result<(), CodecError> {
        self.add_aligned_bytes(&x.to_le_bytes())
    }

    /// Appends an aligned IEEE 754 binary64.
    pub fn add_aligned_f64(&mut self, x: f64) -> Result<(), CodecError> {
        self.add_aligned_bytes(&x.to_le_bytes())
    }

    // Less specialized methods: the value is aligned at the beginning but
    // its bit length may not be an integer multiple of eight.

    /// Appends the low `bit_length` bits of `value` starting at an aligned
    /// cursor. The cursor advances by exactly `bit_length` bits.
    pub fn add_aligned_unsigned(&mut self, value: u64, bit_length: usize) -> Result<(), CodecError> {
        let offset = self.ensure_aligned()?;
        Self::ensure_bit_length(bit_length)?;
        let (raw, num_bytes) = unsigned_to_bytes(value, bit_length);
        self.ensure_capacity(offset + num_bytes)?;
        self.buf[offset..offset + num_bytes].copy_from_slice(&raw[..num_bytes]);
        self.bit_offset += bit_length;
        Ok(())
    }

    /// Appends a signed value of `bit_length >= 2` bits in two's complement,
    /// starting at an aligned cursor.
    pub fn add_aligned_signed(&mut self, value: i64, bit_length: usize) -> Result<(), CodecError> {
        if bit_length < 2 {
            return Err(CodecError::InvalidValue(format!(
                "signed bit length must be at least 2, got {bit_length}"
            )));
        }
        self.add_aligned_unsigned(value as u64, bit_length)
    }

    // Least specialized methods: no alignment assumptions. Slowest; used
    // only when no specialized method above is applicable.

    /// Appends raw bytes at an arbitrary bit offset.
    ///
    /// This is a faster variant of Ben Dyer's unaligned bit copy algorithm
    /// exploiting the fact that the source is always byte-aligned.
    pub fn add_unaligned_bytes(&mut self, bs: &[u8]) -> Result<(), CodecError> {
        let left = self.bit_offset % 8;
        if left == 0 {
            return self.add_aligned_bytes(bs);
        }
        let right = 8 - left;
        // Each iteration touches the byte after the cursor, hence the +1.
        self.ensure_capacity(self.bit_offset / 8 + bs.len() + 1)?;
        for &b in bs {
            self.buf[self.bit_offset / 8] |= (u16::from(b) << left) as u8;
            self.bit_offset += 8;
            self.buf[self.bit_offset / 8] = (u16::from(b) >> right) as u8;
        }
        Ok(())
    }

    /// Encodes an array of booleans one bit per element at an arbitrary bit
    /// offset.
    pub fn add_unaligned_array_of_bits(&mut self, bits: &[bool]) -> Result<(), CodecError> {
        let packed = pack_bits_lsb(bits);
        let backtrack = packed.len() * 8 - bits.len();
        self.add_unaligned_bytes(&packed)?;
        self.bit_offset -= backtrack;
        Ok(())
    }

    /// See the aligned counterpart.
    pub fn add_unaligned_array_of_standard_bit_length_primitives<T: StdPrimitive>(
        &mut self,
        xs: &[T],
    ) -> Result<(), CodecError> {
        for &x in xs {
            let mut raw = [0_u8; 8];
            x.write_le(&mut raw[..T::SIZE_BYTES]);
            self.add_unaligned_bytes(&raw[..T::SIZE_BYTES])?;
        }
        Ok(())
    }

    /// Appends the low `bit_length` bits of `value` at an arbitrary bit
    /// offset.
    pub fn add_unaligned_unsigned(
        &mut self,
        value: u64,
        bit_length: usize,
    ) -> Result<(), CodecError> {
        Self::ensure_bit_length(bit_length)?;
        let (raw, num_bytes) = unsigned_to_bytes(value, bit_length);
        let backtrack = num_bytes * 8 - bit_length;
        self.add_unaligned_bytes(&raw[..num_bytes])?;
        self.bit_offset -= backtrack;
        Ok(())
    }

    /// Appends a signed value of `bit_length >= 2` bits in two's complement
    /// at an arbitrary bit offset.
    pub fn add_unaligned_signed(&mut self, value: i64, bit_length: usize) -> Result<(), CodecError> {
        if bit_length < 2 {
            return Err(CodecError::InvalidValue(format!(
                "signed bit length must be at least 2, got {bit_length}"
            )));
        }
        self.add_unaligned_unsigned(value as u64, bit_length)
    }

    /// See [`Serializer::add_aligned_f16`].
    pub fn add_unaligned_f16(&mut self, x: f32) -> Result<(), CodecError> {
        self.add_unaligned_bytes(&f16::from_f32(x).to_le_bytes())
    }

    /// Appends an IEEE 754 binary32 at an arbitrary bit offset.
    pub fn add_unaligned_f32(&mut self, x: f32) -> Result<(), CodecError> {
        self.add_unaligned_bytes(&x.to_le_bytes())
    }

    /// Appends an IEEE 754 binary64 at an arbitrary bit offset.
    pub fn add_unaligned_f64(&mut self, x: f64) -> Result<(), CodecError> {
        self.add_unaligned_bytes(&x.to_le_bytes())
    }

    /// Appends a single bit.
    pub fn add_unaligned_bit(&mut self, x: bool) -> Result<(), CodecError> {
        self.ensure_capacity(self.bit_offset / 8 + 1)?;
        self.buf[self.bit_offset / 8] |= u8::from(x) << (self.bit_offset % 8);
        self.bit_offset += 1;
        Ok(())
    }

    fn ensure_aligned(&self) -> Result<usize, CodecError> {
        if self.bit_offset % 8 != 0 {
            return Err(CodecError::InvalidValue(format!(
                "byte-aligned operation invoked at bit offset {}",
                self.bit_offset
            )));
        }
        Ok(self.bit_offset / 8)
    }

    fn ensure_capacity(&self, required_bytes: usize) -> Result<(), CodecError> {
        if required_bytes > self.buf.len() {
            return Err(CodecError::InvalidValue(format!(
                "write of up to {required_bytes} bytes overruns the \
                 serialization buffer of {} bytes",
                self.buf.len()
            )));
        }
        Ok(())
    }

    fn ensure_bit_length(bit_length: usize) -> Result<(), CodecError> {
        if !(1..=64).contains(&bit_length) {
            return Err(CodecError::InvalidValue(format!(
                "bit length must be in [1, 64], got {bit_length}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn bit_string(ser: &Serializer<'_>) -> String {
        ser.buffer().iter().map(|b| format!("{b:08b}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn aligned_scalars() {
        let mut buf = vec![0_u8; 64];
        let mut ser = Serializer::new(&mut buf);

        ser.add_aligned_u8(0b1010_0111).unwrap();
        ser.add_aligned_i64(0x1234_5678_90AB_CDEF).unwrap();
        ser.add_aligned_i32(-0x1234_5678).unwrap(); // Two's complement: 0xedcb_a988
        ser.add_aligned_i16(-2).unwrap(); // Two's complement: 0xfffe
        ser.skip_bits(8);
        ser.add_aligned_i8(127).unwrap();
        ser.add_aligned_f64(1.0).unwrap(); // IEEE 754: 0x3ff0_0000_0000_0000
        ser.add_aligned_f32(1.0).unwrap(); // IEEE 754: 0x3f80_0000
        ser.add_aligned_f16(99999.9).unwrap(); // Overflow degenerates to +inf: 0x7c00

        assert_eq!(
            ser.buffer(),
            [
                0xA7, 0xEF, 0xCD, 0xAB, 0x90, 0x78, 0x56, 0x34, 0x12, 0x88, 0xA9, 0xCB, 0xED,
                0xFE, 0xFF, 0x00, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F, 0x00,
                0x00, 0x80, 0x3F, 0x00, 0x7C,
            ]
        );
    }

    #[test]
    fn aligned_non_standard_widths() {
        let mut buf = vec![0_u8; 16];
        let mut ser = Serializer::new(&mut buf);

        ser.add_aligned_unsigned(0xBEDA, 12).unwrap(); // 0xBxxx is truncated away.
        assert_eq!(ser.current_bit_length(), 12);
        ser.skip_bits(4);
        ser.add_aligned_unsigned(0xBEDA, 16).unwrap();
        ser.add_aligned_signed(-2, 9).unwrap(); // Two's complement: 510
        ser.skip_bits(7);
        assert_eq!(bit_string(&ser), "11011010 00001110 11011010 10111110 11111110 00000001");
    }

    #[test]
    fn aligned_arrays() {
        let mut buf = vec![0_u8; 16];
        let mut ser = Serializer::new(&mut buf);

        ser.add_aligned_array_of_standard_bit_length_primitives(&[0xDEAD_u16, 0xBEEF])
            .unwrap();
        #[rustfmt::skip]
        let bits = [
            true, false, true, false, false, false, true, true,
            true, true, false, true, false,
        ];
        ser.add_aligned_array_of_bits(&bits).unwrap();
        assert_eq!(bit_string(&ser), "10101101 11011110 11101111 10111110 11000101 00001011");
        assert_eq!(ser.current_bit_length(), 32 + 13);
    }

    #[test]
    fn unaligned_writes() {
        // Mirrors the trickiest fixture of the original protocol suite.
        let mut buf = vec![0_u8; 41];
        let mut ser = Serializer::new(&mut buf);

        #[rustfmt::skip]
        let first = [
            true, false, true, false, false, false, true, true,
            true, true, true,
        ];
        ser.add_unaligned_array_of_bits(&first).unwrap();
        assert_eq!(ser.current_bit_length(), 11);

        #[rustfmt::skip]
        let second = [
            true, false, true, false, false,
            true, true, true, false, true,
        ];
        ser.add_unaligned_array_of_bits(&second).unwrap();
        ser.add_unaligned_bytes(&[0x12, 0x34, 0x56]).unwrap();
        assert_eq!(
            bit_string(&ser),
            "11000101 00101111 01010111 10000010 11000110 00001010"
        );

        ser.add_unaligned_array_of_bits(&[false, true, true]).unwrap();
        assert_eq!(ser.current_bit_length() % 8, 0, "byte alignment is not restored");

        ser.add_unaligned_bytes(&[0x12, 0x34, 0x56]).unwrap(); // Aligned at this point.
        for bit in [true, false, false, true, true] {
            ser.add_unaligned_bit(bit).unwrap();
        }
        ser.add_unaligned_signed(-2, 8).unwrap();
        ser.add_unaligned_unsigned(0b111_0110_0101, 11).unwrap();
        assert_eq!(ser.current_bit_length() % 8, 0, "byte alignment is not restored");
        ser.add_unaligned_unsigned(0b1110, 3).unwrap(); // MSB truncated away.
        ser.add_unaligned_f64(1.0).unwrap();
        ser.add_unaligned_f32(1.0).unwrap();
        ser.add_unaligned_f16(-99999.9).unwrap(); // Overflow degenerates to -inf.
        ser.add_unaligned_array_of_standard_bit_length_primitives(&[0xDEAD_u16, 0xBEEF])
            .unwrap();
        ser.skip_bits(5);
        assert_eq!(ser.current_bit_length() % 8, 0, "byte alignment is not restored");

        assert_eq!(
            bit_string(&ser),
            "11000101 00101111 01010111 10000010 11000110 11001010 00010010 00110100 01010110 \
             11011001 10111111 11101100 00000110 00000000 00000000 00000000 00000000 00000000 \
             10000000 11111111 00000001 00000000 00000000 11111100 00000001 11100000 01101111 \
             11110101 01111110 11110111 00000101"
        );
    }

    #[test]
    fn fork_shares_the_destination_buffer() {
        let mut reference_buf = vec![0_u8; 17];
        let mut main_buf = vec![0_u8; 17];
        let mut reference = Serializer::new(&mut reference_buf);
        let mut main = Serializer::new(&mut main_buf);

        reference.add_aligned_u8(123).unwrap();
        main.add_aligned_u8(123).unwrap();

        assert!(main.fork_bytes(16).is_err()); // Out of range.

        {
            let mut fork = main.fork_bytes(15).unwrap();
            assert_eq!(fork.buffer(), &[]);
            fork.add_aligned_u8(42).unwrap();
            {
                let mut nested = fork.fork_bytes(1).unwrap();
                nested.add_aligned_u8(11).unwrap();
                nested.add_unaligned_bit(true).unwrap(); // Break alignment.
                assert!(nested.fork_bytes(0).is_err()); // Bad alignment.
            }
            fork.skip_bits(16);
        }
        main.skip_bits(16);

        reference.add_aligned_u8(42).unwrap();
        reference.add_aligned_u8(11).unwrap();
        assert_eq!(reference.buffer(), main.buffer());
    }

    #[test]
    fn misuse_is_reported() {
        let mut buf = vec![0_u8; 4];
        let mut ser = Serializer::new(&mut buf);
        ser.add_unaligned_bit(true).unwrap();
        assert!(matches!(ser.add_aligned_u8(1), Err(CodecError::InvalidValue(_))));
        assert!(matches!(ser.add_aligned_signed(0, 1), Err(CodecError::InvalidValue(_))));
        ser.pad_to_alignment(8).unwrap();
        assert!(matches!(ser.add_aligned_u64(1), Err(CodecError::InvalidValue(_))));
    }
}
