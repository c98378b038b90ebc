//! Bit-level message codec.
//!
//! Every value on the wire goes through [`BitWriter`] / [`BitReader`]. Bits are
//! packed LSB-first into bytes, so an 8-bit write on a byte boundary produces
//! the plain byte and a 32-bit write on a byte boundary is little-endian.
//!
//! Strings come in two flavours selected by the protocol strategy:
//! - [`StringMode::Normal`]: raw bytes, NUL terminated.
//! - [`StringMode::Scrambled`]: every non-NUL byte is passed through a fixed
//!   substitution table. This only exists for compatibility with servers that
//!   expect it and provides no secrecy.

use bytes::Bytes;

use crate::error::{NetError, NetResult};

/// Largest datagram either side will build or accept.
pub const MAX_MSGLEN: usize = 16384;
/// Longest regular string (including the terminator).
pub const MAX_STRING_CHARS: usize = 1024;
/// Longest configstring / big string (including the terminator).
pub const BIG_INFO_STRING: usize = 8192;

/// String encoding used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringMode {
    #[default]
    Normal,
    Scrambled,
}

const fn build_scramble_table() -> [u8; 256] {
    // Permutation of 1..=255 (113 is coprime with 255); NUL stays NUL so the
    // terminator survives.
    let mut table = [0u8; 256];
    let mut i = 1;
    while i < 256 {
        table[i] = (((i - 1) * 113 + 37) % 255 + 1) as u8;
        i += 1;
    }
    table
}

const fn invert_table(table: &[u8; 256]) -> [u8; 256] {
    let mut inverse = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inverse[table[i] as usize] = i as u8;
        i += 1;
    }
    inverse
}

const SCRAMBLE: [u8; 256] = build_scramble_table();
const UNSCRAMBLE: [u8; 256] = invert_table(&SCRAMBLE);

impl StringMode {
    #[inline]
    fn encode(self, b: u8) -> u8 {
        match self {
            StringMode::Normal => b,
            StringMode::Scrambled => SCRAMBLE[b as usize],
        }
    }

    #[inline]
    fn decode(self, b: u8) -> u8 {
        match self {
            StringMode::Normal => b,
            StringMode::Scrambled => UNSCRAMBLE[b as usize],
        }
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Growable bit writer with a hard capacity.
#[derive(Debug, Clone)]
pub struct BitWriter {
    data: Vec<u8>,
    bit: usize,
    capacity: usize,
    mode: StringMode,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MSGLEN)
    }

    /// Creates a writer that refuses to grow past `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(MAX_MSGLEN)),
            bit: 0,
            capacity,
            mode: StringMode::Normal,
        }
    }

    pub fn set_string_mode(&mut self, mode: StringMode) {
        self.mode = mode;
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bit
    }

    /// Number of bytes the message occupies.
    pub fn len(&self) -> usize {
        self.bit.div_ceil(8)
    }

    pub fn is_empty(&self) -> bool {
        self.bit == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn finish(self) -> Bytes {
        Bytes::from(self.data)
    }

    /// Writes the low `bits` bits of `value` (1..=64).
    pub fn write_bits(&mut self, value: u64, bits: u32) -> NetResult<()> {
        debug_assert!((1..=64).contains(&bits), "bit width {bits}");
        let needed = self.bit + bits as usize;
        if needed > self.capacity * 8 {
            return Err(NetError::BufferOverflow {
                needed,
                capacity: self.capacity,
            });
        }

        let mut value = value & mask(bits);
        let mut remaining = bits;
        while remaining > 0 {
            let byte = self.bit >> 3;
            let offset = (self.bit & 7) as u32;
            if byte == self.data.len() {
                self.data.push(0);
            }
            let take = (8 - offset).min(remaining);
            let chunk = (value & mask(take)) as u8;
            self.data[byte] |= chunk << offset;
            value >>= take;
            remaining -= take;
            self.bit += take as usize;
        }
        Ok(())
    }

    /// Writes `value` with a table-style width: negative `bits` means a signed
    /// value packed into `|bits|` bits.
    pub fn write_number(&mut self, value: i64, bits: i32) -> NetResult<()> {
        self.write_bits(value as u64, bits.unsigned_abs())
    }

    pub fn write_bool(&mut self, value: bool) -> NetResult<()> {
        self.write_bits(value as u64, 1)
    }

    pub fn write_byte(&mut self, value: u8) -> NetResult<()> {
        self.write_bits(value as u64, 8)
    }

    pub fn write_short(&mut self, value: i16) -> NetResult<()> {
        self.write_bits(value as u16 as u64, 16)
    }

    pub fn write_long(&mut self, value: i32) -> NetResult<()> {
        self.write_bits(value as u32 as u64, 32)
    }

    pub fn write_float(&mut self, value: f32) -> NetResult<()> {
        self.write_bits(value.to_bits() as u64, 32)
    }

    pub fn write_data(&mut self, data: &[u8]) -> NetResult<()> {
        for &b in data {
            self.write_byte(b)?;
        }
        Ok(())
    }

    pub fn write_string(&mut self, s: &str) -> NetResult<()> {
        self.write_string_limited(s, MAX_STRING_CHARS)
    }

    pub fn write_big_string(&mut self, s: &str) -> NetResult<()> {
        self.write_string_limited(s, BIG_INFO_STRING)
    }

    fn write_string_limited(&mut self, s: &str, limit: usize) -> NetResult<()> {
        if s.len() >= limit {
            return Err(NetError::StringTooLong(limit));
        }
        for &b in s.as_bytes() {
            self.write_byte(self.mode.encode(b))?;
        }
        self.write_byte(0)
    }
}

/// Bit reader over a received datagram.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
    mode: StringMode,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bit: 0,
            mode: StringMode::Normal,
        }
    }

    pub fn set_string_mode(&mut self, mode: StringMode) {
        self.mode = mode;
    }

    pub fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    /// True once fewer than 8 bits are left; trailing bits are padding.
    pub fn is_exhausted(&self) -> bool {
        self.bits_remaining() < 8
    }

    pub fn read_bits(&mut self, bits: u32) -> NetResult<u64> {
        debug_assert!((1..=64).contains(&bits), "bit width {bits}");
        if bits as usize > self.bits_remaining() {
            return Err(NetError::TruncatedMessage {
                wanted: bits,
                remaining: self.bits_remaining(),
            });
        }

        let mut value = 0u64;
        let mut got = 0u32;
        while got < bits {
            let byte = self.data[self.bit >> 3];
            let offset = (self.bit & 7) as u32;
            let take = (8 - offset).min(bits - got);
            let chunk = ((byte >> offset) as u64) & mask(take);
            value |= chunk << got;
            got += take;
            self.bit += take as usize;
        }
        Ok(value)
    }

    /// Inverse of [`BitWriter::write_number`]; negative widths sign-extend.
    pub fn read_number(&mut self, bits: i32) -> NetResult<i64> {
        let width = bits.unsigned_abs();
        let raw = self.read_bits(width)?;
        if bits < 0 && width < 64 && raw & (1u64 << (width - 1)) != 0 {
            Ok((raw | !mask(width)) as i64)
        } else {
            Ok(raw as i64)
        }
    }

    pub fn read_bool(&mut self) -> NetResult<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    pub fn read_byte(&mut self) -> NetResult<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_short(&mut self) -> NetResult<i16> {
        Ok(self.read_bits(16)? as u16 as i16)
    }

    pub fn read_long(&mut self) -> NetResult<i32> {
        Ok(self.read_bits(32)? as u32 as i32)
    }

    pub fn read_float(&mut self) -> NetResult<f32> {
        Ok(f32::from_bits(self.read_bits(32)? as u32))
    }

    pub fn read_data(&mut self, len: usize) -> NetResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_byte()?);
        }
        Ok(out)
    }

    pub fn read_string(&mut self) -> NetResult<String> {
        self.read_string_limited(MAX_STRING_CHARS)
    }

    pub fn read_big_string(&mut self) -> NetResult<String> {
        self.read_string_limited(BIG_INFO_STRING)
    }

    fn read_string_limited(&mut self, limit: usize) -> NetResult<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b == 0 {
                break;
            }
            if bytes.len() + 1 >= limit {
                return Err(NetError::StringTooLong(limit));
            }
            bytes.push(self.mode.decode(b));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_width_roundtrips() {
        let mut w = BitWriter::new();
        for bits in 1..=64u32 {
            let value = 0xA5A5_5A5A_F00D_BEEFu64 & mask(bits);
            w.write_bits(value, bits).unwrap();
        }
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        for bits in 1..=64u32 {
            let expected = 0xA5A5_5A5A_F00D_BEEFu64 & mask(bits);
            assert_eq!(r.read_bits(bits).unwrap(), expected, "width {bits}");
        }
    }

    #[test]
    fn signed_numbers_sign_extend() {
        let mut w = BitWriter::new();
        w.write_number(-5, -7).unwrap();
        w.write_number(63, -7).unwrap();
        w.write_number(-64, -7).unwrap();
        w.write_number(200, 8).unwrap();
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_number(-7).unwrap(), -5);
        assert_eq!(r.read_number(-7).unwrap(), 63);
        assert_eq!(r.read_number(-7).unwrap(), -64);
        assert_eq!(r.read_number(8).unwrap(), 200);
    }

    #[test]
    fn long_on_byte_boundary_is_little_endian() {
        let mut w = BitWriter::new();
        w.write_long(0x0403_0201).unwrap();
        assert_eq!(w.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn reading_past_end_is_truncation() {
        let data = [0xFFu8];
        let mut r = BitReader::new(&data);
        r.read_bits(6).unwrap();
        match r.read_bits(3) {
            Err(NetError::TruncatedMessage { wanted, remaining }) => {
                assert_eq!(wanted, 3);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn writing_past_capacity_overflows() {
        let mut w = BitWriter::with_capacity(2);
        w.write_short(7).unwrap();
        assert!(matches!(
            w.write_bool(true),
            Err(NetError::BufferOverflow { capacity: 2, .. })
        ));
    }

    #[test]
    fn scramble_table_is_a_permutation_fixing_nul() {
        let mut seen = [false; 256];
        for &b in SCRAMBLE.iter() {
            assert!(!seen[b as usize]);
            seen[b as usize] = true;
        }
        assert_eq!(SCRAMBLE[0], 0);
        for i in 0..256 {
            assert_eq!(UNSCRAMBLE[SCRAMBLE[i] as usize] as usize, i);
        }
    }

    #[test]
    fn scrambled_strings_roundtrip_and_differ_on_wire() {
        let text = "cs 12 \"mapname\\obj/v2_rocket\"";

        let mut plain = BitWriter::new();
        plain.write_string(text).unwrap();

        let mut scrambled = BitWriter::new();
        scrambled.set_string_mode(StringMode::Scrambled);
        scrambled.write_string(text).unwrap();

        assert_eq!(plain.len(), scrambled.len());
        assert_ne!(plain.as_slice(), scrambled.as_slice());

        let bytes = scrambled.finish();
        let mut r = BitReader::new(&bytes);
        r.set_string_mode(StringMode::Scrambled);
        assert_eq!(r.read_string().unwrap(), text);
        assert!(r.is_exhausted());
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut w = BitWriter::new();
        let long = "x".repeat(MAX_STRING_CHARS);
        assert!(matches!(
            w.write_string(&long),
            Err(NetError::StringTooLong(MAX_STRING_CHARS))
        ));
    }
}
