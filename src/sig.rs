//! Creation and verification of recoverable signatures over state hashes.
//!
//! Channel states are digested in [crate::codec] and the 32-byte digest is
//! signed here. Signatures are 65 bytes (r ‖ s ‖ v) so that the signer's
//! address can be recovered without shipping public keys over the wire.

mod k256;

pub use self::k256::{Error, Signer};

use crate::codec::types::Hash;
use sha2::{Digest, Sha256};

/// Prefixes a state hash before signing.
///
/// Keeps signatures over channel data distinct from any other use of the
/// same key; the adjudicator applies the same prefix when verifying.
fn hash_to_signed_msg_hash(hash: Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(b"\x19paynode signed state:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sign_and_recover() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = Signer::random(&mut rng);
        let msg = Hash([0x11; 32]);

        let sig = signer.sign(msg);
        let recovered = Signer::recover(msg, sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn recover_detects_wrong_message() {
        let mut rng = StdRng::seed_from_u64(1);
        let signer = Signer::random(&mut rng);

        let sig = signer.sign(Hash([0x22; 32]));
        let recovered = Signer::recover(Hash([0x23; 32]), sig).unwrap();
        assert_ne!(recovered, signer.address());
    }

    #[test]
    fn distinct_keys_have_distinct_addresses() {
        let mut rng = StdRng::seed_from_u64(2);
        let a = Signer::random(&mut rng);
        let b = Signer::random(&mut rng);
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn signer_from_seed_is_deterministic() {
        let a = Signer::from_seed(7);
        let b = Signer::from_seed(7);
        assert_eq!(a.address(), b.address());
    }
}
