//! Durable per-channel store.
//!
//! One embedded key-value database per session directory; keys are the
//! 32-byte channel IDs, values are versioned records holding everything
//! needed to resume a channel after a restart. Each logical mutation
//! rewrites the channel's record in a single atomic write, so a crash can
//! never expose a partially updated channel.

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::machine::Phase;
use crate::channel::state::{Params, Transaction};
use crate::channel::PartIdx;
use crate::codec::types::Hash;

/// Version tag prefixed to every stored record.
pub const RECORD_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("channel not in store: {0}")]
    UnknownChannel(String),
    #[error("channel already in store: {0}")]
    ChannelExists(String),
    #[error("unsupported record version {0}")]
    UnsupportedRecord(u8),
    #[error("stored record is malformed: {0}")]
    Corrupted(String),
    #[error("phase move {from} -> {to} not allowed")]
    PhaseRegression { from: Phase, to: Phase },
}

/// Everything persisted for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChannel {
    pub params: Params,
    pub own_idx: PartIdx,
    pub current: Transaction,
    pub staging: Option<Transaction>,
    pub phase: Phase,
    pub parent: Option<Hash>,
}

/// Which transaction slot a write replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxSlot {
    Current,
    Staging,
}

/// Orders phases along the lifecycle for the monotonicity check. Writes may
/// skip transient phases, so any forward move is fine; the only legal
/// backward move is the `Withdrawing -> Acting` rollback.
fn phase_rank(phase: Phase) -> u8 {
    match phase {
        Phase::Initial => 0,
        Phase::Signing => 1,
        Phase::Funding => 2,
        Phase::Acting => 3,
        Phase::Registering => 4,
        Phase::Registered => 5,
        Phase::Progressing => 6,
        Phase::Progressed => 7,
        Phase::Withdrawing => 8,
        Phase::Withdrawn => 9,
    }
}

fn phase_move_allowed(from: Phase, to: Phase) -> bool {
    phase_rank(to) > phase_rank(from) || (from == Phase::Withdrawing && to == Phase::Acting)
}

/// The store. Handles are safe to share; read-modify-write cycles are
/// serialized internally.
pub struct Store {
    db: DB,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, dir)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Creates a fresh entry in phase `Signing`.
    pub fn put_channel(
        &self,
        params: &Params,
        own_idx: PartIdx,
        init: &Transaction,
    ) -> Result<(), StoreError> {
        let id = init.state.channel_id();
        let _guard = self.write_lock.lock();
        if self.db.get(id.0)?.is_some() {
            return Err(StoreError::ChannelExists(id.hex()));
        }
        let record = StoredChannel {
            params: params.clone(),
            own_idx,
            current: init.clone(),
            staging: None,
            phase: Phase::Signing,
            parent: params.parent,
        };
        self.write(&id, &record)
    }

    /// Replaces one transaction slot atomically.
    pub fn put_transaction(
        &self,
        ch_id: &Hash,
        tx: &Transaction,
        slot: TxSlot,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.read(ch_id)?;
        match slot {
            TxSlot::Current => {
                record.current = tx.clone();
                // A committed current transaction supersedes any staging.
                if record
                    .staging
                    .as_ref()
                    .map(|s| s.state.version() <= tx.state.version())
                    .unwrap_or(false)
                {
                    record.staging = None;
                }
            }
            TxSlot::Staging => record.staging = Some(tx.clone()),
        }
        self.write(ch_id, &record)
    }

    /// Drops the staging transaction after a rejected or expired update.
    pub fn drop_staging(&self, ch_id: &Hash) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.read(ch_id)?;
        record.staging = None;
        self.write(ch_id, &record)
    }

    /// Moves the stored phase; rejects backward moves except the
    /// `Withdrawing -> Acting` rollback.
    pub fn put_phase(&self, ch_id: &Hash, phase: Phase) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut record = self.read(ch_id)?;
        if record.phase != phase && !phase_move_allowed(record.phase, phase) {
            return Err(StoreError::PhaseRegression {
                from: record.phase,
                to: phase,
            });
        }
        record.phase = phase;
        self.write(ch_id, &record)
    }

    pub fn remove_channel(&self, ch_id: &Hash) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if self.db.get(ch_id.0)?.is_none() {
            return Err(StoreError::UnknownChannel(ch_id.hex()));
        }
        self.db.delete(ch_id.0)?;
        Ok(())
    }

    pub fn get_channel(&self, ch_id: &Hash) -> Result<StoredChannel, StoreError> {
        self.read(ch_id)
    }

    /// Iterates over every persisted channel.
    pub fn enumerate(
        &self,
    ) -> impl Iterator<Item = Result<StoredChannel, StoreError>> + '_ {
        self.db.iterator(IteratorMode::Start).map(|entry| {
            let (_, value) = entry?;
            decode_record(&value)
        })
    }

    fn read(&self, ch_id: &Hash) -> Result<StoredChannel, StoreError> {
        let value = self
            .db
            .get(ch_id.0)?
            .ok_or_else(|| StoreError::UnknownChannel(ch_id.hex()))?;
        decode_record(&value)
    }

    fn write(&self, ch_id: &Hash, record: &StoredChannel) -> Result<(), StoreError> {
        let mut value = Vec::with_capacity(256);
        value.push(RECORD_VERSION);
        bincode::serialize_into(&mut value, record)?;
        self.db.put(ch_id.0, value)?;
        Ok(())
    }
}

fn decode_record(value: &[u8]) -> Result<StoredChannel, StoreError> {
    let (&version, body) = value
        .split_first()
        .ok_or_else(|| StoreError::Corrupted("empty record".into()))?;
    if version != RECORD_VERSION {
        return Err(StoreError::UnsupportedRecord(version));
    }
    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::{Allocation, State};
    use crate::codec::types::{Address, U256};
    use tempfile::tempdir;

    fn fixture(nonce: u8) -> (Params, Transaction) {
        let params = Params {
            challenge_duration: 10,
            nonce: U256::from(nonce),
            participants: vec![Address([1; 20]), Address([2; 20])],
            app_def: None,
            parent: None,
        };
        let state = State::new(
            &params,
            Allocation::new(Address([0xEE; 20]), vec![U256::from(5u8), U256::from(5u8)]),
        )
        .unwrap();
        let tx = Transaction::new(state, 2);
        (params, tx)
    }

    #[test]
    fn create_read_remove() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (params, tx) = fixture(1);
        let id = tx.state.channel_id();

        store.put_channel(&params, 0, &tx).unwrap();
        let record = store.get_channel(&id).unwrap();
        assert_eq!(record.phase, Phase::Signing);
        assert_eq!(record.own_idx, 0);
        assert_eq!(record.current, tx);
        assert!(record.staging.is_none());

        assert!(matches!(
            store.put_channel(&params, 0, &tx),
            Err(StoreError::ChannelExists(_))
        ));

        store.remove_channel(&id).unwrap();
        assert!(matches!(
            store.get_channel(&id),
            Err(StoreError::UnknownChannel(_))
        ));
        assert!(matches!(
            store.remove_channel(&id),
            Err(StoreError::UnknownChannel(_))
        ));
    }

    #[test]
    fn transaction_slots() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (params, tx) = fixture(2);
        let id = tx.state.channel_id();
        store.put_channel(&params, 1, &tx).unwrap();

        let staging = Transaction::new(tx.state.make_next_state(), 2);
        store.put_transaction(&id, &staging, TxSlot::Staging).unwrap();
        let record = store.get_channel(&id).unwrap();
        assert_eq!(record.staging.as_ref().unwrap().state.version(), 1);

        // Committing the staging transaction as current clears the slot.
        store.put_transaction(&id, &staging, TxSlot::Current).unwrap();
        let record = store.get_channel(&id).unwrap();
        assert_eq!(record.current.state.version(), 1);
        assert!(record.staging.is_none());
    }

    #[test]
    fn drop_staging_clears_slot() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (params, tx) = fixture(3);
        let id = tx.state.channel_id();
        store.put_channel(&params, 0, &tx).unwrap();

        let staging = Transaction::new(tx.state.make_next_state(), 2);
        store.put_transaction(&id, &staging, TxSlot::Staging).unwrap();
        store.drop_staging(&id).unwrap();
        assert!(store.get_channel(&id).unwrap().staging.is_none());
    }

    #[test]
    fn phase_moves_are_monotone() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let (params, tx) = fixture(4);
        let id = tx.state.channel_id();
        store.put_channel(&params, 0, &tx).unwrap();

        store.put_phase(&id, Phase::Acting).unwrap();
        assert!(matches!(
            store.put_phase(&id, Phase::Signing),
            Err(StoreError::PhaseRegression { .. })
        ));

        // The only permitted rollback.
        store.put_phase(&id, Phase::Withdrawing).unwrap();
        store.put_phase(&id, Phase::Acting).unwrap();

        store.put_phase(&id, Phase::Withdrawn).unwrap();
        assert!(matches!(
            store.put_phase(&id, Phase::Acting),
            Err(StoreError::PhaseRegression { .. })
        ));
    }

    #[test]
    fn enumerate_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            for nonce in 1..=3 {
                let (params, tx) = fixture(nonce);
                store.put_channel(&params, 0, &tx).unwrap();
            }
        }

        let store = Store::open(dir.path()).unwrap();
        let mut records: Vec<StoredChannel> =
            store.enumerate().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);
        records.sort_by_key(|r| r.params.nonce);
        assert_eq!(records[0].params.nonce, U256::from(1u8));

        // The iterator restarts from the beginning on every call.
        assert_eq!(store.enumerate().count(), 3);
    }

    #[test]
    fn unknown_record_version_is_an_error() {
        assert!(matches!(
            decode_record(&[99, 0, 0]),
            Err(StoreError::UnsupportedRecord(99))
        ));
        assert!(matches!(
            decode_record(&[]),
            Err(StoreError::Corrupted(_))
        ));
    }
}
