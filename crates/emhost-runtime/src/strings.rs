//! String marshalling between host `str` values and linear memory.
//!
//! Each codec writes a zero terminator as wide as one code unit. `encode`
//! takes a byte budget that includes the terminator and returns the
//! number of bytes written without it; strings that do not fit are cut at
//! the last whole code point. Nothing is written when the address is
//! misaligned or the output range is out of bounds.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::{Fault, MemoryView, MemoryViewMut};

/// A null-terminated string encoding over linear memory.
pub trait StringCodec {
    const NAME: &'static str;
    /// Width of one code unit and of the terminator, in bytes. Addresses
    /// must be aligned to it.
    const UNIT: usize;

    /// Encoded width of `c`, or `None` if the codec cannot represent it.
    fn char_len(c: char) -> Option<usize>;

    fn encode_char(c: char, out: &mut Vec<u8>);

    /// Decode a terminator-free byte run whose length is a multiple of `UNIT`.
    fn decode_bytes(bytes: &[u8]) -> String;
}

/// 7-bit ASCII. Decoding maps each byte to the code point of equal value.
pub struct Ascii;

pub struct Utf8;

/// Little-endian UTF-16; non-BMP characters become surrogate pairs.
pub struct Utf16;

/// Little-endian UTF-32.
pub struct Utf32;

impl StringCodec for Ascii {
    const NAME: &'static str = "ASCII";
    const UNIT: usize = 1;

    fn char_len(c: char) -> Option<usize> {
        c.is_ascii().then_some(1)
    }

    fn encode_char(c: char, out: &mut Vec<u8>) {
        out.push(c as u8);
    }

    fn decode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| char::from(b)).collect()
    }
}

impl StringCodec for Utf8 {
    const NAME: &'static str = "UTF-8";
    const UNIT: usize = 1;

    fn char_len(c: char) -> Option<usize> {
        Some(c.len_utf8())
    }

    fn encode_char(c: char, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
    }

    fn decode_bytes(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl StringCodec for Utf16 {
    const NAME: &'static str = "UTF-16";
    const UNIT: usize = 2;

    fn char_len(c: char) -> Option<usize> {
        Some(c.len_utf16() * 2)
    }

    fn encode_char(c: char, out: &mut Vec<u8>) {
        let mut buf = [0u16; 2];
        for unit in c.encode_utf16(&mut buf) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }

    fn decode_bytes(bytes: &[u8]) -> String {
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

impl StringCodec for Utf32 {
    const NAME: &'static str = "UTF-32";
    const UNIT: usize = 4;

    fn char_len(_: char) -> Option<usize> {
        Some(4)
    }

    fn encode_char(c: char, out: &mut Vec<u8>) {
        out.extend_from_slice(&(c as u32).to_le_bytes());
    }

    fn decode_bytes(bytes: &[u8]) -> String {
        bytes
            .chunks_exact(4)
            .map(|q| u32::from_le_bytes([q[0], q[1], q[2], q[3]]))
            .map(|cp| char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The string holds a character the codec cannot represent.
    Unrepresentable { codec: &'static str, ch: char },
    Memory(Fault),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Unrepresentable { codec, ch } => {
                write!(f, "{ch:?} cannot be encoded as {codec}")
            }
            EncodeError::Memory(fault) => fault.fmt(f),
        }
    }
}

impl core::error::Error for EncodeError {}

impl From<Fault> for EncodeError {
    fn from(fault: Fault) -> Self {
        EncodeError::Memory(fault)
    }
}

fn check_alignment<C: StringCodec>(address: u32) -> Result<(), Fault> {
    if address as usize % C::UNIT != 0 {
        return Err(Fault::Misaligned {
            address,
            align: C::UNIT as u32,
        });
    }
    Ok(())
}

/// Encoded length of `s` in bytes, excluding the terminator.
pub fn measure<C: StringCodec>(s: &str) -> Result<usize, EncodeError> {
    s.chars().try_fold(0usize, |acc, c| {
        C::char_len(c)
            .map(|n| acc + n)
            .ok_or(EncodeError::Unrepresentable { codec: C::NAME, ch: c })
    })
}

/// Bytes needed to store `s` including its terminator.
pub fn measure_with_terminator<C: StringCodec>(s: &str) -> Result<usize, EncodeError> {
    Ok(measure::<C>(s)? + C::UNIT)
}

/// Write `s` at `address` within a budget of `max_bytes` (terminator
/// included). Returns bytes written, excluding the terminator.
///
/// A budget smaller than one code unit writes nothing; a budget of exactly
/// one unit writes only the terminator.
pub fn encode<C: StringCodec>(
    mem: &mut MemoryViewMut<'_>,
    s: &str,
    address: u32,
    max_bytes: usize,
) -> Result<usize, EncodeError> {
    check_alignment::<C>(address)?;
    if max_bytes < C::UNIT {
        return Ok(0);
    }
    let budget = max_bytes - C::UNIT;
    let mut out = Vec::with_capacity(budget.min(s.len() * C::UNIT) + C::UNIT);
    for c in s.chars() {
        let len = C::char_len(c).ok_or(EncodeError::Unrepresentable { codec: C::NAME, ch: c })?;
        if out.len() + len > budget {
            break;
        }
        C::encode_char(c, &mut out);
    }
    let written = out.len();
    out.resize(written + C::UNIT, 0);
    mem.write_bytes(address, &out)?;
    Ok(written)
}

/// Read a string at `address`.
///
/// Without `max_len`, scans for the terminator; a missing terminator is an
/// out-of-bounds fault. With `max_len` (in bytes, a multiple of the unit),
/// stops at the terminator or after `max_len` bytes, whichever is first.
/// A null address decodes to the empty string.
pub fn decode<C: StringCodec>(
    mem: &MemoryView<'_>,
    address: u32,
    max_len: Option<usize>,
) -> Result<String, Fault> {
    if address == 0 {
        return Ok(String::new());
    }
    check_alignment::<C>(address)?;
    let region = match max_len {
        Some(len) => {
            if len % C::UNIT != 0 {
                return Err(Fault::PartialUnit {
                    address,
                    len: len as u32,
                    unit: C::UNIT as u32,
                });
            }
            mem.bytes(address, len)?
        }
        None => mem.tail(address)?,
    };
    let end = region
        .chunks_exact(C::UNIT)
        .position(|unit| unit.iter().all(|&b| b == 0));
    let bytes = match (end, max_len) {
        (Some(units), _) => &region[..units * C::UNIT],
        (None, Some(_)) => region,
        (None, None) => {
            return Err(Fault::OutOfBounds {
                address,
                len: region.len() as u32,
            })
        }
    };
    Ok(C::decode_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GrowthPolicy, LinearMemory};

    fn memory() -> LinearMemory {
        LinearMemory::allocate(65536, GrowthPolicy::default()).unwrap()
    }

    fn roundtrip<C: StringCodec>(s: &str, max_bytes: usize) -> (usize, String) {
        let mut mem = memory();
        let written = encode::<C>(&mut mem.view_mut(), s, 256, max_bytes).unwrap();
        let decoded = decode::<C>(&mem.view(), 256, None).unwrap();
        (written, decoded)
    }

    #[test]
    fn utf8_fits_exactly() {
        let (written, decoded) = roundtrip::<Utf8>("héllo", 7);
        assert_eq!(written, 6);
        assert_eq!(decoded, "héllo");
    }

    #[test]
    fn utf8_truncates_on_code_point_boundary() {
        // "aé" needs 3 bytes; a 3-byte budget leaves room for only "a".
        let (written, decoded) = roundtrip::<Utf8>("aé", 3);
        assert_eq!(written, 1);
        assert_eq!(decoded, "a");
    }

    #[test]
    fn encode_never_writes_past_budget() {
        let mut mem = memory();
        mem.view_mut().write_bytes(256, &[0xAA; 16]).unwrap();
        encode::<Utf8>(&mut mem.view_mut(), "abcdefgh", 256, 4).unwrap();
        let bytes = mem.view().bytes(256, 6).unwrap();
        assert_eq!(bytes, b"abc\0\xAA\xAA");
    }

    #[test]
    fn tiny_budgets() {
        let mut mem = memory();
        mem.view_mut().write_bytes(256, &[0xAA; 4]).unwrap();
        assert_eq!(encode::<Utf8>(&mut mem.view_mut(), "x", 256, 0), Ok(0));
        assert_eq!(mem.view().load_u8(256), Ok(0xAA));
        assert_eq!(encode::<Utf8>(&mut mem.view_mut(), "x", 256, 1), Ok(0));
        assert_eq!(mem.view().load_u8(256), Ok(0));
        assert_eq!(encode::<Utf16>(&mut mem.view_mut(), "x", 256, 1), Ok(0));
        assert_eq!(mem.view().load_u8(257), Ok(0xAA));
    }

    #[test]
    fn utf16_keeps_surrogate_pairs_whole() {
        let s = "a\u{1F600}b";
        let (written, decoded) = roundtrip::<Utf16>(s, 64);
        assert_eq!(written, 8);
        assert_eq!(decoded, s);

        // Room for "a" plus one unit: the pair is not split.
        let (written, decoded) = roundtrip::<Utf16>(s, 6);
        assert_eq!(written, 2);
        assert_eq!(decoded, "a");
    }

    #[test]
    fn utf32_roundtrip_and_measure() {
        let s = "z\u{1F600}";
        assert_eq!(measure::<Utf32>(s), Ok(8));
        assert_eq!(measure::<Utf16>(s), Ok(6));
        assert_eq!(measure::<Utf8>(s), Ok(5));
        let (written, decoded) = roundtrip::<Utf32>(s, 12);
        assert_eq!(written, 8);
        assert_eq!(decoded, s);
    }

    #[test]
    fn misaligned_addresses_are_rejected_before_writing() {
        let mut mem = memory();
        assert_eq!(
            encode::<Utf16>(&mut mem.view_mut(), "ab", 257, 16),
            Err(EncodeError::Memory(Fault::Misaligned {
                address: 257,
                align: 2
            }))
        );
        assert_eq!(
            decode::<Utf32>(&mem.view(), 258, None),
            Err(Fault::Misaligned {
                address: 258,
                align: 4
            })
        );
        assert!(mem.view().bytes(256, 8).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn length_must_cover_whole_units() {
        let mem = memory();
        assert_eq!(
            decode::<Utf16>(&mem.view(), 256, Some(5)),
            Err(Fault::PartialUnit {
                address: 256,
                len: 5,
                unit: 2
            })
        );
    }

    #[test]
    fn ascii_rejects_non_ascii() {
        let mut mem = memory();
        assert_eq!(
            encode::<Ascii>(&mut mem.view_mut(), "né", 256, 16),
            Err(EncodeError::Unrepresentable {
                codec: "ASCII",
                ch: 'é'
            })
        );
        assert_eq!(mem.view().load_u8(256), Ok(0));
    }

    #[test]
    fn decode_with_explicit_length_stops_early() {
        let mut mem = memory();
        mem.view_mut().write_bytes(512, b"hello\0world").unwrap();
        assert_eq!(decode::<Utf8>(&mem.view(), 512, Some(3)).unwrap(), "hel");
        assert_eq!(decode::<Utf8>(&mem.view(), 512, Some(11)).unwrap(), "hello");
        assert_eq!(decode::<Ascii>(&mem.view(), 0, None).unwrap(), "");
    }

    #[test]
    fn decode_without_terminator_is_out_of_bounds() {
        let mut mem = memory();
        mem.view_mut().write_bytes(65532, b"abcd").unwrap();
        assert!(matches!(
            decode::<Utf8>(&mem.view(), 65532, None),
            Err(Fault::OutOfBounds { .. })
        ));
    }

    #[test]
    fn invalid_utf8_decodes_lossily() {
        let mut mem = memory();
        mem.view_mut().write_bytes(64, &[b'a', 0xFF, b'b', 0]).unwrap();
        assert_eq!(decode::<Utf8>(&mem.view(), 64, None).unwrap(), "a\u{FFFD}b");
    }
}
