use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_n {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl $T {
            pub const LEN: usize = $N;

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let raw = hex::decode(s.trim_start_matches("0x")).ok()?;
                let raw: [u8; $N] = raw.try_into().ok()?;
                Some(Self(raw))
            }
        }

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct BytesVisitor;
                impl<'de> Visitor<'de> for BytesVisitor {
                    type Value = $T;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        write!(f, "{} bytes", $N)
                    }

                    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<$T, E> {
                        let raw: [u8; $N] = v
                            .try_into()
                            .map_err(|_| E::invalid_length(v.len(), &self))?;
                        Ok($T(raw))
                    }

                    fn visit_seq<A: serde::de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<$T, A::Error> {
                        let mut raw = [0u8; $N];
                        for (i, slot) in raw.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                        }
                        Ok($T(raw))
                    }
                }
                deserializer.deserialize_bytes(BytesVisitor)
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_n!(Bytes32, 32);
bytes_n!(Hash, 32);
bytes_n!(Signature, 65);

/// One participant's random contribution to the channel nonce.
///
/// The shares of all participants are combined into the final nonce using
/// SHA-256, proposer's share first.
pub type NonceShare = Bytes32;

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_32(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }

    pub fn from_be_32(bytes: &[u8; 32]) -> Self {
        U256::from_big_endian(bytes)
    }
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_be_32())
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct U256Visitor;
        impl<'de> Visitor<'de> for U256Visitor {
            type Value = U256;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.write_str("32 big-endian bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<U256, E> {
                let raw: [u8; 32] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(U256::from_be_32(&raw))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<U256, A::Error> {
                let mut raw = [0u8; 32];
                for (i, slot) in raw.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(U256::from_be_32(&raw))
            }
        }
        deserializer.deserialize_bytes(U256Visitor)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// An off-chain or on-chain account address.
///
/// Addresses are compared byte-wise; they are derived from the signer's
/// public key in [crate::sig].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);

impl Address {
    pub const LEN: usize = 20;

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s.trim_start_matches("0x")).ok()?;
        let raw: [u8; 20] = raw.try_into().ok()?;
        Some(Self(raw))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct AddrVisitor;
        impl<'de> Visitor<'de> for AddrVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.write_str("20 bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Address, E> {
                let raw: [u8; 20] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Address(raw))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Address, A::Error> {
                let mut raw = [0u8; 20];
                for (i, slot) in raw.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Address(raw))
            }
        }
        deserializer.deserialize_bytes(AddrVisitor)
    }
}

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}
