//! Canonical binary encoding for channel data and wire payloads.
//!
//! Every value that is hashed, signed or framed goes through this module so
//! that both participants and the adjudicator agree on the exact bytes.
//! Encoders stream into a [Writer]; hashing reuses the same path through
//! [HashWriter] so a value is never materialized twice. Decoders work on a
//! [Reader] and callers are expected to [Reader::finish] so that trailing
//! garbage is rejected.

pub mod types;

use core::fmt::Display;

use sha2::{Digest, Sha256};

use self::types::{Address, Hash, Signature, U256};

/// Errors raised while encoding or decoding canonical data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The input ended before the value was complete.
    UnexpectedEnd,
    /// The input contained bytes after the value was complete.
    TrailingBytes(usize),
    /// A length prefix exceeded the maximum representable size.
    LengthOverflow(usize),
    /// A tag, flag or enum discriminant had no defined meaning.
    InvalidValue(&'static str),
    /// A string field was not valid UTF-8.
    InvalidUtf8,
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::UnexpectedEnd => f.write_str("unexpected end of input"),
            Error::TrailingBytes(n) => write!(f, "{n} trailing bytes after value"),
            Error::LengthOverflow(n) => write!(f, "length {n} exceeds field limit"),
            Error::InvalidValue(what) => write!(f, "invalid value for {what}"),
            Error::InvalidUtf8 => f.write_str("string field is not valid utf-8"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Byte sink for canonical encoding.
pub trait Writer {
    fn write(&mut self, bytes: &[u8]);
}

impl Writer for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Writer that feeds a domain-separated SHA-256 instead of a buffer.
///
/// The domain tag is hashed first, length-prefixed, so values of different
/// kinds can never collide even if their encodings are identical.
pub struct HashWriter {
    hasher: Sha256,
}

impl HashWriter {
    pub fn new(domain: &'static str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([domain.len() as u8]);
        hasher.update(domain.as_bytes());
        Self { hasher }
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Writer for HashWriter {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Values with a canonical encoding.
pub trait Encode {
    fn encode(&self, w: &mut dyn Writer) -> Result<()>;
}

/// Values decodable from their canonical encoding.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self>;
}

/// Helper methods available on every [Writer].
pub trait WriteExt: Writer {
    fn put_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn put_u16(&mut self, v: u16) {
        self.write(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.write(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.write(&v.to_be_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.write(&v.to_be_bytes());
    }

    fn put_u256(&mut self, v: &U256) {
        self.write(&v.to_be_32());
    }

    fn put_address(&mut self, v: &Address) {
        self.write(&v.0);
    }

    fn put_hash(&mut self, v: &Hash) {
        self.write(&v.0);
    }

    fn put_signature(&mut self, v: &Signature) {
        self.write(&v.0);
    }

    /// Variable-length bytes with a u16 length prefix.
    fn put_bytes(&mut self, v: &[u8]) -> Result<()> {
        let len = u16::try_from(v.len()).map_err(|_| Error::LengthOverflow(v.len()))?;
        self.put_u16(len);
        self.write(v);
        Ok(())
    }

    fn put_str(&mut self, v: &str) -> Result<()> {
        self.put_bytes(v.as_bytes())
    }
}

impl<W: Writer + ?Sized> WriteExt for W {}

/// Cursor over a canonical encoding.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fails unless the whole input has been consumed.
    pub fn finish(self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::TrailingBytes(self.buf.len()))
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue("bool")),
        }
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn u256(&mut self) -> Result<U256> {
        Ok(U256::from_be_32(self.take(32)?.try_into().unwrap()))
    }

    pub fn address(&mut self) -> Result<Address> {
        Ok(Address(self.take(Address::LEN)?.try_into().unwrap()))
    }

    pub fn hash(&mut self) -> Result<Hash> {
        Ok(Hash(self.take(Hash::LEN)?.try_into().unwrap()))
    }

    pub fn bytes32(&mut self) -> Result<types::Bytes32> {
        Ok(types::Bytes32(self.take(32)?.try_into().unwrap()))
    }

    pub fn signature(&mut self) -> Result<Signature> {
        Ok(Signature(self.take(Signature::LEN)?.try_into().unwrap()))
    }

    /// Variable-length bytes with a u16 length prefix.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?).map_err(|_| Error::InvalidUtf8)
    }
}

/// Encodes a value into a fresh buffer.
pub fn to_vec<T: Encode + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.encode(&mut buf)?;
    Ok(buf)
}

/// Hashes a value's canonical encoding under the given domain tag.
pub fn to_hash<T: Encode + ?Sized>(domain: &'static str, value: &T) -> Result<Hash> {
    let mut writer = HashWriter::new(domain);
    value.encode(&mut writer)?;
    Ok(writer.finalize())
}

/// Decodes a value and rejects trailing bytes.
pub fn from_slice<T: Decode>(buf: &[u8]) -> Result<T> {
    let mut reader = Reader::new(buf);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample {
        n: u64,
        tag: String,
        amount: U256,
    }

    impl Encode for Sample {
        fn encode(&self, w: &mut dyn Writer) -> Result<()> {
            w.put_u64(self.n);
            w.put_str(&self.tag)?;
            w.put_u256(&self.amount);
            Ok(())
        }
    }

    impl Decode for Sample {
        fn decode(r: &mut Reader<'_>) -> Result<Self> {
            Ok(Sample {
                n: r.u64()?,
                tag: r.string()?,
                amount: r.u256()?,
            })
        }
    }

    #[test]
    fn round_trip() {
        let v = Sample {
            n: 42,
            tag: "transfer".into(),
            amount: U256::from(1_000_000u64),
        };
        let buf = to_vec(&v).unwrap();
        let back: Sample = from_slice(&buf).unwrap();
        assert_eq!(back.n, v.n);
        assert_eq!(back.tag, v.tag);
        assert_eq!(back.amount, v.amount);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let v = Sample {
            n: 1,
            tag: "x".into(),
            amount: U256::zero(),
        };
        let mut buf = to_vec(&v).unwrap();
        buf.push(0);
        assert_eq!(from_slice::<Sample>(&buf), Err(Error::TrailingBytes(1)));
    }

    #[test]
    fn rejects_truncated_input() {
        let v = Sample {
            n: 1,
            tag: "x".into(),
            amount: U256::zero(),
        };
        let buf = to_vec(&v).unwrap();
        assert_eq!(
            from_slice::<Sample>(&buf[..buf.len() - 1]),
            Err(Error::UnexpectedEnd)
        );
    }

    #[test]
    fn domain_tags_separate_hashes() {
        let v = Sample {
            n: 7,
            tag: "y".into(),
            amount: U256::one(),
        };
        let a = to_hash("domain/a", &v).unwrap();
        let b = to_hash("domain/b", &v).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bool_rejects_other_discriminants() {
        let mut r = Reader::new(&[2]);
        assert_eq!(r.bool(), Err(Error::InvalidValue("bool")));
    }
}
