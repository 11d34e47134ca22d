//! The per-channel phase machine.
//!
//! Drives one channel from proposal agreement through signing, funding,
//! acting and settlement. The machine owns the current (latest fully
//! signed) transaction and at most one staging transaction under signature
//! collection; phase moves are validated against the transition graph.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::app::App;
use super::state::{validate_transition, Params, State, Transaction, TransitionError};
use super::PartIdx;
use crate::codec;
use crate::codec::types::{Hash, Signature};
use crate::wallet::Account;

/// Lifecycle phase of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Initial,
    Signing,
    Funding,
    Acting,
    Registering,
    Registered,
    Progressing,
    Progressed,
    Withdrawing,
    Withdrawn,
}

impl Phase {
    /// Whether the phase graph permits moving from `self` to `to`.
    ///
    /// The only backward edge is `Withdrawing -> Acting`, taken when a
    /// cooperative close is abandoned.
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Initial, Signing)
                | (Signing, Funding)
                | (Funding, Acting)
                | (Acting, Registering)
                | (Registering, Registered)
                | (Registered, Progressing)
                | (Progressing, Progressed)
                | (Progressed, Progressing)
                | (Registered, Withdrawing)
                | (Progressed, Withdrawing)
                | (Withdrawing, Withdrawn)
                | (Withdrawing, Acting)
        )
    }

    /// Phases written to the store; the others are reconstructed after a
    /// restart.
    pub fn is_persisted(self) -> bool {
        matches!(self, Phase::Signing | Phase::Acting | Phase::Withdrawn)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Initial => "initial",
            Phase::Signing => "signing",
            Phase::Funding => "funding",
            Phase::Acting => "acting",
            Phase::Registering => "registering",
            Phase::Registered => "registered",
            Phase::Progressing => "progressing",
            Phase::Progressed => "progressed",
            Phase::Withdrawing => "withdrawing",
            Phase::Withdrawn => "withdrawn",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("phase transition {from} -> {to} is not allowed")]
    InvalidPhaseTransition { from: Phase, to: Phase },
    #[error("operation requires phase {required}, machine is in {actual}")]
    WrongPhase { required: Phase, actual: Phase },
    #[error("no staging transaction")]
    NoStagingTransaction,
    #[error("a staging transaction is already in progress")]
    StagingInProgress,
    #[error("staging transaction is not fully signed")]
    StagingNotFullySigned,
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] codec::Error),
}

/// State machine for a single channel.
#[derive(Debug)]
pub struct Machine {
    params: Params,
    own_idx: PartIdx,
    app: App,
    phase: Phase,
    current: Transaction,
    staging: Option<Transaction>,
}

impl Machine {
    /// Creates a machine for freshly agreed-upon parameters; the machine
    /// starts in `Signing` with the unsigned initial transaction staged as
    /// current.
    pub fn new(
        params: Params,
        own_idx: PartIdx,
        init_state: State,
        app: App,
    ) -> Result<Self, MachineError> {
        let participants = params.participants.len();
        Ok(Machine {
            params,
            own_idx,
            app,
            phase: Phase::Signing,
            current: Transaction::new(init_state, participants),
            staging: None,
        })
    }

    /// Rebuilds a machine from persisted data.
    pub fn restore(
        params: Params,
        own_idx: PartIdx,
        app: App,
        phase: Phase,
        current: Transaction,
        staging: Option<Transaction>,
    ) -> Self {
        Machine {
            params,
            own_idx,
            app,
            phase,
            current,
            staging,
        }
    }

    pub fn channel_id(&self) -> Hash {
        self.current.state.channel_id()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn own_idx(&self) -> PartIdx {
        self.own_idx
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current(&self) -> &Transaction {
        &self.current
    }

    pub fn staging(&self) -> Option<&Transaction> {
        self.staging.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.current.state.version()
    }

    /// Moves the machine to `to`, validating against the phase graph.
    pub fn set_phase(&mut self, to: Phase) -> Result<(), MachineError> {
        if !self.phase.can_transition_to(to) {
            return Err(MachineError::InvalidPhaseTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    fn require_phase(&self, required: Phase) -> Result<(), MachineError> {
        if self.phase != required {
            return Err(MachineError::WrongPhase {
                required,
                actual: self.phase,
            });
        }
        Ok(())
    }

    /// Signs the initial state during `Signing`.
    pub fn sign_init(&mut self, account: &dyn Account) -> Result<Signature, MachineError> {
        self.require_phase(Phase::Signing)?;
        Ok(self.current.sign(self.own_idx, account)?)
    }

    /// Adds a peer's signature over the initial state during `Signing`.
    pub fn add_init_sig(&mut self, idx: PartIdx, sig: Signature) -> Result<(), MachineError> {
        self.require_phase(Phase::Signing)?;
        let participants = self.params.participants.clone();
        self.current.add_sig(idx, sig, &participants)?;
        Ok(())
    }

    /// Finishes `Signing`: requires every initial signature, moves to
    /// `Funding`.
    pub fn mark_funding(&mut self) -> Result<(), MachineError> {
        self.require_phase(Phase::Signing)?;
        self.current.verify_fully_signed(&self.params.participants)?;
        self.set_phase(Phase::Funding)
    }

    /// Finishes `Funding` once the on-chain deposit is complete.
    pub fn mark_active(&mut self) -> Result<(), MachineError> {
        self.require_phase(Phase::Funding)?;
        self.set_phase(Phase::Acting)
    }

    /// Stages a candidate next state proposed by `actor`, validating the
    /// transition rules. Only one staging transaction may be in flight.
    pub fn stage(&mut self, next: State, actor: PartIdx) -> Result<(), MachineError> {
        self.require_phase(Phase::Acting)?;
        if self.staging.is_some() {
            return Err(MachineError::StagingInProgress);
        }
        validate_transition(&self.params, &self.app, &self.current.state, &next, actor)?;
        self.staging = Some(Transaction::new(next, self.params.participants.len()));
        Ok(())
    }

    /// Signs the staging transaction with our account.
    pub fn sign_staging(&mut self, account: &dyn Account) -> Result<Signature, MachineError> {
        let own_idx = self.own_idx;
        let staging = self
            .staging
            .as_mut()
            .ok_or(MachineError::NoStagingTransaction)?;
        Ok(staging.sign(own_idx, account)?)
    }

    /// Adds a participant's signature over the staging transaction.
    pub fn add_staging_sig(&mut self, idx: PartIdx, sig: Signature) -> Result<(), MachineError> {
        let participants = self.params.participants.clone();
        let staging = self
            .staging
            .as_mut()
            .ok_or(MachineError::NoStagingTransaction)?;
        staging.add_sig(idx, sig, &participants)?;
        Ok(())
    }

    /// Promotes a fully signed staging transaction to current.
    pub fn commit_staging(&mut self) -> Result<&Transaction, MachineError> {
        let staging = self
            .staging
            .take()
            .ok_or(MachineError::NoStagingTransaction)?;
        if !staging.is_fully_signed() {
            self.staging = Some(staging);
            return Err(MachineError::StagingNotFullySigned);
        }
        if let Err(e) = staging.verify_fully_signed(&self.params.participants) {
            self.staging = Some(staging);
            return Err(e.into());
        }
        self.current = staging;
        Ok(&self.current)
    }

    /// Drops the staging transaction after a rejection or timeout.
    pub fn discard_staging(&mut self) {
        self.staging = None;
    }

    /// Adopts a state the adjudicator progressed on-chain during a dispute.
    ///
    /// The chain already enforced the app rules for the progression, so the
    /// state is authoritative; the machine walks `Progressing ->
    /// Progressed` and replaces the current transaction. Stale or repeated
    /// versions are ignored.
    pub fn adopt_progressed(&mut self, state: State) -> Result<bool, MachineError> {
        if state.channel_id() != self.channel_id() {
            return Err(MachineError::Transition(TransitionError::ChannelIdMismatch));
        }
        if state.version() <= self.version() {
            return Ok(false);
        }
        self.set_phase(Phase::Progressing)?;
        let participants = self.params.participants.len();
        self.current = Transaction::new(state, participants);
        self.staging = None;
        self.set_phase(Phase::Progressed)?;
        Ok(true)
    }

    /// Adopts a strictly newer, fully signed transaction received during
    /// channel sync after a restart.
    pub fn adopt_synced(&mut self, tx: Transaction) -> Result<bool, MachineError> {
        if tx.state.channel_id() != self.channel_id() {
            return Err(MachineError::Transition(TransitionError::ChannelIdMismatch));
        }
        if tx.state.version() <= self.version() {
            return Ok(false);
        }
        tx.verify_fully_signed(&self.params.participants)?;
        self.current = tx;
        self.staging = None;
        Ok(true)
    }
}
