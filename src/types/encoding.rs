//! Deterministic binary encoding used for object images, type images and
//! store records.
//!
//! Every byte produced here may end up inside a content hash, so the format
//! must never depend on platform, hash-map order or pointer identity.
//!
//! # Binary Format
//!
//! - Fixed-width integers: little-endian
//! - Lengths and `usize`: unsigned LEB128 varint
//! - `bool`: single byte (0 = false, 1 = true)
//! - `Vec<T>`/`String`/`Rc<str>`: varint length prefix followed by elements
//! - `Option<T>`: 1-byte tag (0 = None, 1 = Some) followed by value if present
//! - `BigInt`: sign byte (0 = zero, 1 = positive, 2 = negative) then
//!   little-endian magnitude bytes with a varint length prefix
//! - Arrays `[T; N]`: elements serialized sequentially without length prefix

use gnovm_derive::Error;
use num_bigint::{BigInt, Sign};
use std::rc::Rc;

/// Sink for writing encoded bytes.
///
/// Implemented by byte buffers and hashers so images can be hashed without
/// materializing them first.
pub trait EncodeSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Counts encoded bytes without storing them.
#[derive(Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Types with a canonical binary form.
pub trait Encode {
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Serializes into a buffer sized by a counting pass.
    fn to_bytes(&self) -> Vec<u8> {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);
        let mut out = Vec::with_capacity(counter.len());
        self.encode(&mut out);
        out
    }

    /// Number of bytes [`Encode::encode`] would produce.
    fn encoded_len(&self) -> usize {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);
        counter.len()
    }
}

/// Errors raised while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid encoded value")]
    InvalidValue,
    #[error("invalid tag {0}")]
    InvalidTag(u8),
    #[error("length prefix exceeds limit")]
    LengthOverflow,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

pub trait Decode: Sized {
    /// Decodes a value and advances `input` past it.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value that must span all of `data`.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::TrailingBytes(input.len()));
        }
        Ok(value)
    }
}

/// Upper bound on decoded collection lengths.
pub const MAX_VEC_LEN: usize = 1 << 24;

pub fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if input.len() < n {
        return Err(DecodeError::UnexpectedEof);
    }
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    Ok(bytes)
}

/// Writes `v` as an unsigned LEB128 varint.
pub fn write_uvarint<S: EncodeSink>(out: &mut S, mut v: u64) {
    let mut buf = [0u8; 10];
    let mut i = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[i] = byte;
            i += 1;
            break;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
    out.write(&buf[..i]);
}

pub fn read_uvarint(input: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = read_bytes(input, 1)?[0];
        if shift == 63 && byte > 1 {
            return Err(DecodeError::LengthOverflow);
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            // Reject non-minimal encodings so every value has one image.
            if byte == 0 && shift > 0 {
                return Err(DecodeError::InvalidValue);
            }
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::LengthOverflow);
        }
    }
}

fn read_len(input: &mut &[u8]) -> Result<usize, DecodeError> {
    let len = read_uvarint(input)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::LengthOverflow)?;
    if len > MAX_VEC_LEN {
        return Err(DecodeError::LengthOverflow);
    }
    Ok(len)
}

impl Encode for u8 {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self]);
    }
}

impl Decode for u8 {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(read_bytes(input, 1)?[0])
    }
}

macro_rules! impl_fixed_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    let bytes = read_bytes(input, std::mem::size_of::<$t>())?;
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    Ok(<$t>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_fixed_int!(i8, u16, u32, u64, i16, i32, i64);

impl Encode for usize {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        write_uvarint(out, *self as u64);
    }
}

impl Decode for usize {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let v = read_uvarint(input)?;
        usize::try_from(v).map_err(|_| DecodeError::LengthOverflow)
    }
}

impl Encode for bool {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self as u8]);
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::InvalidTag(tag)),
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = read_len(input)?;
        let mut vec = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            vec.push(T::decode(input)?);
        }
        Ok(vec)
    }
}

impl Encode for [u8] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self);
    }
}

impl Encode for str {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_bytes().encode(out);
    }
}

impl Encode for String {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_str().encode(out);
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = read_len(input)?;
        let bytes = read_bytes(input, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidValue)
    }
}

impl Encode for Rc<str> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_ref().encode(out);
    }
}

impl Decode for Rc<str> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Rc::from(String::decode(input)?))
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            None => 0u8.encode(out),
            Some(v) => {
                1u8.encode(out);
                v.encode(out);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(input)?)),
            tag => Err(DecodeError::InvalidTag(tag)),
        }
    }
}

impl<T: Encode> Encode for Box<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (**self).encode(out);
    }
}

impl<T: Decode> Decode for Box<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Box::new(T::decode(input)?))
    }
}

impl<T: Encode, const N: usize> Encode for [T; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut vec = Vec::with_capacity(N);
        for _ in 0..N {
            vec.push(T::decode(input)?);
        }
        vec.try_into().map_err(|_| DecodeError::InvalidValue)
    }
}

impl Encode for BigInt {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        let (sign, magnitude) = self.to_bytes_le();
        let tag: u8 = match sign {
            Sign::NoSign => 0,
            Sign::Plus => 1,
            Sign::Minus => 2,
        };
        tag.encode(out);
        if tag != 0 {
            magnitude.as_slice().encode(out);
        }
    }
}

impl Decode for BigInt {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let sign = match u8::decode(input)? {
            0 => return Ok(BigInt::from(0)),
            1 => Sign::Plus,
            2 => Sign::Minus,
            tag => return Err(DecodeError::InvalidTag(tag)),
        };
        let len = read_len(input)?;
        let magnitude = read_bytes(input, len)?;
        Ok(BigInt::from_bytes_le(sign, magnitude))
    }
}
