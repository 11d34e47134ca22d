//! Channel parameters, states, transactions and the transition rules.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::app::{App, AppError};
use super::PartIdx;
use crate::codec::{self, Decode, Encode, Reader, WriteExt, Writer};
use crate::codec::types::{Address, Hash, Signature, U256};
use crate::sig::Signer;

const PARAMS_DOMAIN: &str = "paynode/params/v1";
const STATE_DOMAIN: &str = "paynode/state/v1";

/// Immutable channel parameters. Their digest is the channel ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: Vec<Address>,
    pub app_def: Option<Address>,
    pub parent: Option<Hash>,
}

impl Params {
    /// The channel ID: a digest over all parameters.
    pub fn id(&self) -> codec::Result<Hash> {
        codec::to_hash(PARAMS_DOMAIN, self)
    }

    pub fn index_of(&self, addr: &Address) -> Option<PartIdx> {
        self.participants.iter().position(|p| p == addr)
    }
}

impl Encode for Params {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_u64(self.challenge_duration);
        w.put_u256(&self.nonce);
        let count = u16::try_from(self.participants.len())
            .map_err(|_| codec::Error::LengthOverflow(self.participants.len()))?;
        w.put_u16(count);
        for p in &self.participants {
            w.put_address(p);
        }
        w.put_bool(self.app_def.is_some());
        if let Some(def) = &self.app_def {
            w.put_address(def);
        }
        w.put_bool(self.parent.is_some());
        if let Some(parent) = &self.parent {
            w.put_hash(parent);
        }
        Ok(())
    }
}

impl Decode for Params {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        let challenge_duration = r.u64()?;
        let nonce = r.u256()?;
        let count = r.u16()? as usize;
        let mut participants = Vec::with_capacity(count);
        for _ in 0..count {
            participants.push(r.address()?);
        }
        let app_def = if r.bool()? { Some(r.address()?) } else { None };
        let parent = if r.bool()? { Some(r.hash()?) } else { None };
        Ok(Params {
            challenge_duration,
            nonce,
            participants,
            app_def,
            parent,
        })
    }
}

/// Distribution of the channel's single asset over its participants.
///
/// The sum of the balances is the channel's funded total and never changes
/// across updates; updates only redistribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub asset: Address,
    pub balances: Vec<U256>,
}

impl Allocation {
    pub fn new(asset: Address, balances: Vec<U256>) -> Self {
        Self { asset, balances }
    }

    /// Total funds held by the channel; `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.balances
            .iter()
            .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
    }

    /// Moves `amount` from `payer` to `payee`, failing on insufficient funds.
    pub fn transfer(
        &mut self,
        payer: PartIdx,
        payee: PartIdx,
        amount: U256,
    ) -> Result<(), TransitionError> {
        let from = self
            .balances
            .get(payer)
            .copied()
            .ok_or(TransitionError::NoSuchParticipant(payer))?;
        let to = self
            .balances
            .get(payee)
            .copied()
            .ok_or(TransitionError::NoSuchParticipant(payee))?;
        let from = from
            .checked_sub(amount)
            .ok_or(TransitionError::InsufficientBalance)?;
        let to = to
            .checked_add(amount)
            .ok_or(TransitionError::InsufficientBalance)?;
        self.balances[payer] = from;
        self.balances[payee] = to;
        Ok(())
    }
}

impl Encode for Allocation {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_address(&self.asset);
        let count = u16::try_from(self.balances.len())
            .map_err(|_| codec::Error::LengthOverflow(self.balances.len()))?;
        w.put_u16(count);
        for b in &self.balances {
            w.put_u256(b);
        }
        Ok(())
    }
}

impl Decode for Allocation {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        let asset = r.address()?;
        let count = r.u16()? as usize;
        let mut balances = Vec::with_capacity(count);
        for _ in 0..count {
            balances.push(r.u256()?);
        }
        Ok(Allocation { asset, balances })
    }
}

/// App definition and data carried inside a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppField {
    pub def: Address,
    pub data: Vec<u8>,
}

/// One full state of a channel. The piece of data that is signed and, during
/// disputes, sent to the adjudicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    id: Hash,
    version: u64,
    pub allocation: Allocation,
    pub app: Option<AppField>,
    pub is_final: bool,
}

impl State {
    /// Creates the initial state (version 0) for the given parameters.
    pub fn new(params: &Params, allocation: Allocation) -> codec::Result<Self> {
        Ok(State {
            id: params.id()?,
            version: 0,
            allocation,
            app: params.app_def.map(|def| AppField { def, data: Vec::new() }),
            is_final: false,
        })
    }

    pub fn channel_id(&self) -> Hash {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Clones the state with the version advanced by one.
    pub fn make_next_state(&self) -> State {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// The digest participants sign.
    pub fn hash(&self) -> codec::Result<Hash> {
        codec::to_hash(STATE_DOMAIN, self)
    }
}

impl Encode for State {
    fn encode(&self, w: &mut dyn Writer) -> codec::Result<()> {
        w.put_hash(&self.id);
        w.put_u64(self.version);
        self.allocation.encode(w)?;
        w.put_bool(self.is_final);
        w.put_bool(self.app.is_some());
        if let Some(app) = &self.app {
            w.put_address(&app.def);
            w.put_bytes(&app.data)?;
        }
        Ok(())
    }
}

impl Decode for State {
    fn decode(r: &mut Reader<'_>) -> codec::Result<Self> {
        let id = r.hash()?;
        let version = r.u64()?;
        let allocation = Allocation::decode(r)?;
        let is_final = r.bool()?;
        let app = if r.bool()? {
            Some(AppField {
                def: r.address()?,
                data: r.bytes()?,
            })
        } else {
            None
        };
        Ok(State {
            id,
            version,
            allocation,
            app,
            is_final,
        })
    }
}

/// Why a candidate state or signature was refused.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("channel id mismatch")]
    ChannelIdMismatch,
    #[error("version must be {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("allocation sum changed")]
    BalanceSumChanged,
    #[error("allocation asset changed")]
    AssetChanged,
    #[error("participant count mismatch")]
    ParticipantCountMismatch,
    #[error("no participant with index {0}")]
    NoSuchParticipant(PartIdx),
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("state is final, no further transitions")]
    FinalState,
    #[error("app changed between states")]
    AppMismatch,
    #[error("app rejected the transition: {0}")]
    App(#[from] AppError),
    #[error("signature by {0:?} is not from participant {1}")]
    InvalidSignature(Address, PartIdx),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature already present for participant {0}")]
    AlreadySigned(PartIdx),
    #[error("missing signature from participant {0}")]
    MissingSignature(PartIdx),
    #[error("encoding failed: {0}")]
    Encoding(#[from] codec::Error),
}

/// Checks transition validity per the channel rules:
/// same channel, version advanced by exactly one, constant allocation sum,
/// same asset, no transition out of a final state, and the app's rules.
pub fn validate_transition(
    params: &Params,
    app: &App,
    from: &State,
    to: &State,
    actor: PartIdx,
) -> Result<(), TransitionError> {
    if from.is_final {
        return Err(TransitionError::FinalState);
    }
    if to.id != from.id {
        return Err(TransitionError::ChannelIdMismatch);
    }
    if to.version != from.version + 1 {
        return Err(TransitionError::VersionMismatch {
            expected: from.version + 1,
            got: to.version,
        });
    }
    if to.allocation.asset != from.allocation.asset {
        return Err(TransitionError::AssetChanged);
    }
    if to.allocation.balances.len() != params.participants.len()
        || from.allocation.balances.len() != params.participants.len()
    {
        return Err(TransitionError::ParticipantCountMismatch);
    }
    if actor >= params.participants.len() {
        return Err(TransitionError::NoSuchParticipant(actor));
    }
    match (from.allocation.total(), to.allocation.total()) {
        (Some(a), Some(b)) if a == b => {}
        _ => return Err(TransitionError::BalanceSumChanged),
    }
    if from.app.as_ref().map(|a| a.def) != to.app.as_ref().map(|a| a.def) {
        return Err(TransitionError::AppMismatch);
    }
    app.valid_transition(params, from, to, actor)?;
    Ok(())
}

/// A state together with one signature slot per participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub state: State,
    pub sigs: Vec<Option<Signature>>,
}

impl Transaction {
    /// A fresh, unsigned transaction over `state`.
    pub fn new(state: State, participants: usize) -> Self {
        Self {
            state,
            sigs: vec![None; participants],
        }
    }

    pub fn is_fully_signed(&self) -> bool {
        self.sigs.iter().all(Option::is_some)
    }

    /// Verifies `sig` against participant `idx` and stores it.
    pub fn add_sig(
        &mut self,
        idx: PartIdx,
        sig: Signature,
        participants: &[Address],
    ) -> Result<(), TransitionError> {
        let expected = participants
            .get(idx)
            .ok_or(TransitionError::NoSuchParticipant(idx))?;
        let signer = Signer::recover(self.state.hash()?, sig)
            .map_err(|_| TransitionError::MalformedSignature)?;
        if signer != *expected {
            return Err(TransitionError::InvalidSignature(signer, idx));
        }
        match self.sigs.get_mut(idx) {
            Some(slot @ None) => {
                *slot = Some(sig);
                Ok(())
            }
            Some(Some(_)) => Err(TransitionError::AlreadySigned(idx)),
            None => Err(TransitionError::NoSuchParticipant(idx)),
        }
    }

    /// Signs with the given account and stores our signature.
    pub fn sign(
        &mut self,
        idx: PartIdx,
        account: &dyn crate::wallet::Account,
    ) -> Result<Signature, TransitionError> {
        let sig = account.sign(self.state.hash()?);
        match self.sigs.get_mut(idx) {
            Some(slot @ None) => {
                *slot = Some(sig);
                Ok(sig)
            }
            Some(Some(_)) => Err(TransitionError::AlreadySigned(idx)),
            None => Err(TransitionError::NoSuchParticipant(idx)),
        }
    }

    /// Checks that every slot is filled and verifies against the matching
    /// participant address.
    pub fn verify_fully_signed(&self, participants: &[Address]) -> Result<(), TransitionError> {
        if self.sigs.len() != participants.len() {
            return Err(TransitionError::ParticipantCountMismatch);
        }
        let hash = self.state.hash()?;
        for (idx, (slot, expected)) in self.sigs.iter().zip(participants).enumerate() {
            let sig = slot.ok_or(TransitionError::MissingSignature(idx))?;
            let signer =
                Signer::recover(hash, sig).map_err(|_| TransitionError::MalformedSignature)?;
            if signer != *expected {
                return Err(TransitionError::InvalidSignature(signer, idx));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::app::App;
    use crate::codec::types::Bytes32;

    pub(crate) fn test_params(participants: Vec<Address>) -> Params {
        Params {
            challenge_duration: 10,
            nonce: U256::from(42u8),
            participants,
            app_def: None,
            parent: None,
        }
    }

    fn two_party() -> (Params, State) {
        let params = test_params(vec![Address([1; 20]), Address([2; 20])]);
        let allocation = Allocation::new(
            Address([0xEE; 20]),
            vec![U256::from(200u8), U256::from(200u8)],
        );
        let state = State::new(&params, allocation).unwrap();
        (params, state)
    }

    #[test]
    fn channel_id_commits_to_params() {
        let (params, state) = two_party();
        assert_eq!(state.channel_id(), params.id().unwrap());

        let mut other = params.clone();
        other.nonce = U256::from(43u8);
        assert_ne!(other.id().unwrap(), params.id().unwrap());
    }

    #[test]
    fn state_encoding_round_trips() {
        let (_, mut state) = two_party();
        state.app = Some(AppField {
            def: Address([7; 20]),
            data: vec![1, 2, 3],
        });
        let buf = codec::to_vec(&state).unwrap();
        let back: State = codec::from_slice(&buf).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn state_decode_rejects_trailing_garbage() {
        let (_, state) = two_party();
        let mut buf = codec::to_vec(&state).unwrap();
        buf.push(0xFF);
        assert!(codec::from_slice::<State>(&buf).is_err());
    }

    #[test]
    fn params_encoding_round_trips() {
        let mut params = test_params(vec![Address([1; 20]), Address([2; 20])]);
        params.app_def = Some(Address([9; 20]));
        params.parent = Some(Hash([4; 32]));
        let buf = codec::to_vec(&params).unwrap();
        let back: Params = codec::from_slice(&buf).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn valid_payment_transition() {
        let (params, from) = two_party();
        let mut to = from.make_next_state();
        to.allocation.transfer(0, 1, U256::from(50u8)).unwrap();
        validate_transition(&params, &App::None, &from, &to, 0).unwrap();
    }

    #[test]
    fn rejects_version_jump() {
        let (params, from) = two_party();
        let mut to = from.make_next_state();
        to.version += 1;
        assert!(matches!(
            validate_transition(&params, &App::None, &from, &to, 0),
            Err(TransitionError::VersionMismatch { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn rejects_minting() {
        let (params, from) = two_party();
        let mut to = from.make_next_state();
        to.allocation.balances[0] = U256::from(201u8);
        assert!(matches!(
            validate_transition(&params, &App::None, &from, &to, 0),
            Err(TransitionError::BalanceSumChanged)
        ));
    }

    #[test]
    fn rejects_overdraft() {
        let (_, from) = two_party();
        let mut next = from.make_next_state();
        assert!(matches!(
            next.allocation.transfer(0, 1, U256::from(201u8)),
            Err(TransitionError::InsufficientBalance)
        ));
    }

    #[test]
    fn final_state_is_terminal() {
        let (params, mut from) = two_party();
        from.is_final = true;
        let to = from.make_next_state();
        assert!(matches!(
            validate_transition(&params, &App::None, &from, &to, 0),
            Err(TransitionError::FinalState)
        ));
    }

    #[test]
    fn rejects_foreign_channel_state() {
        let (params, from) = two_party();
        let mut other_params = params.clone();
        other_params.nonce = U256::from(7u8);
        let to = State::new(&other_params, from.allocation.clone()).unwrap();
        let mut to = to.make_next_state();
        // Align versions so only the id differs.
        assert_eq!(to.version(), 1);
        to.allocation = from.allocation.clone();
        assert!(matches!(
            validate_transition(&params, &App::None, &from, &to, 0),
            Err(TransitionError::ChannelIdMismatch)
        ));
    }

    #[test]
    fn signature_collection() {
        use crate::sig::Signer;
        struct Acc(Signer);
        impl crate::wallet::Account for Acc {
            fn address(&self) -> Address {
                self.0.address()
            }
            fn sign(&self, msg: Hash) -> Signature {
                self.0.sign(msg)
            }
        }

        let alice = Acc(Signer::from_seed(1));
        let bob = Acc(Signer::from_seed(2));
        let params = test_params(vec![alice.0.address(), bob.0.address()]);
        let state = State::new(
            &params,
            Allocation::new(Address([0xEE; 20]), vec![U256::one(), U256::one()]),
        )
        .unwrap();

        let mut tx = Transaction::new(state.clone(), 2);
        assert!(!tx.is_fully_signed());
        assert!(matches!(
            tx.verify_fully_signed(&params.participants),
            Err(TransitionError::MissingSignature(0))
        ));

        tx.sign(0, &alice).unwrap();
        let bob_sig = bob.0.sign(state.hash().unwrap());
        tx.add_sig(1, bob_sig, &params.participants).unwrap();

        assert!(tx.is_fully_signed());
        tx.verify_fully_signed(&params.participants).unwrap();

        // A signature from the wrong key is refused.
        let mallory = Signer::from_seed(3);
        let mut tx2 = Transaction::new(state.clone(), 2);
        let bad = mallory.sign(state.hash().unwrap());
        assert!(matches!(
            tx2.add_sig(0, bad, &params.participants),
            Err(TransitionError::InvalidSignature(_, 0))
        ));
    }

    #[test]
    fn nonce_share_type_is_32_bytes() {
        assert_eq!(Bytes32::LEN, 32);
    }
}
