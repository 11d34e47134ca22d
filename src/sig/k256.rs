//! Signer backed by the k256 crate (pure Rust ECDSA over secp256k1).

use crate::codec::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::hash_to_signed_msg_hash;

pub use k256::ecdsa::Error;

/// Holds a secp256k1 signing key together with the address derived from it.
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        // The first byte of the uncompressed encoding is the SEC1 point tag;
        // it is not part of the public key and is skipped before hashing.
        let pk_bytes = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&pk_bytes.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    /// Creates a signer with a fresh random key.
    pub fn random<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes);
            // from_slice rejects zero and values >= the curve order; with a
            // uniformly random 32-byte value a retry is essentially unreachable.
            if let Ok(key) = SigningKey::from_slice(&bytes) {
                return Self::from_key(key);
            }
        }
    }

    /// Creates a deterministic signer from a seed.
    ///
    /// Only meant for tests and local stub wallets, never for real funds.
    pub fn from_seed(seed: u64) -> Self {
        use rand::{rngs::StdRng, SeedableRng};
        Self::random(&mut StdRng::seed_from_u64(seed))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        Ok(Self::from_key(SigningKey::from_slice(bytes)?))
    }

    fn from_key(key: SigningKey) -> Self {
        let addr = Address::from(key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Signs a state hash, producing a 65-byte recoverable signature.
    pub fn sign(&self, msg: Hash) -> Signature {
        let hash = hash_to_signed_msg_hash(msg);

        let (sig, recid): (EcdsaSignature, RecoveryId) = self
            .key
            .sign_prehash_recoverable(&hash.0)
            .expect("signing a 32-byte prehash cannot fail");

        let mut rs = [0u8; 64];
        rs.copy_from_slice(&sig.to_bytes());
        // v is offset by 27 in the format the verifying contracts expect.
        Signature::new(&rs, recid.to_byte() + 27)
    }

    /// Recovers the address that produced `sig` over `msg`.
    pub fn recover(msg: Hash, sig: Signature) -> Result<Address, Error> {
        let hash = hash_to_signed_msg_hash(msg);

        let recid = RecoveryId::from_byte(sig.0[64].wrapping_sub(27)).ok_or_else(Error::new)?;
        let rs = EcdsaSignature::from_slice(&sig.0[..64])?;

        let key = VerifyingKey::recover_from_prehash(&hash.0, &rs, recid)?;
        Ok(Address::from(&key))
    }
}
