//! Append-only, hash-chained record of every ingestion.
//!
//! Each block commits to its predecessor through `prev_hash`, the SHA-256 of
//! the predecessor's canonical encoding. Block 0 points at
//! [`GENESIS_SENTINEL`]. Persisted blocks also carry their own digest
//! (`block_hash`) so [`Ledger::verify`] can name the block whose payload was
//! altered rather than its successor.
//!
//! Writers go through one mutex: reading the tail, building the block,
//! persisting it and publishing it happen under the same guard. Readers only
//! ever see the published prefix.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::hasher::{self, GENESIS_SENTINEL};
use crate::store::{AppendLog, MemoryLog};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub index: u64,
    pub filename: String,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl LedgerBlock {
    /// Compact JSON with a fixed key order and a fixed timestamp rendering.
    pub fn canonical_encoding(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            index: u64,
            filename: &'a str,
            hash: &'a str,
            prev_hash: &'a str,
            timestamp: String,
        }

        let canonical = Canonical {
            index: self.index,
            filename: &self.filename,
            hash: &self.hash,
            prev_hash: &self.prev_hash,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        };
        // Serializing a struct of strings and integers cannot fail.
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    pub fn digest(&self) -> String {
        hasher::digest(&self.canonical_encoding())
    }
}

/// A block as it sits in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlock {
    #[serde(flatten)]
    pub block: LedgerBlock,
    pub block_hash: String,
}

impl SealedBlock {
    pub fn seal(block: LedgerBlock) -> Self {
        let block_hash = block.digest();
        Self { block, block_hash }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub first_broken_index: Option<u64>,
    pub blocks_checked: u64,
}

impl ChainVerification {
    pub fn into_result(self) -> Result<(), PipelineError> {
        match self.first_broken_index {
            Some(index) => Err(PipelineError::ChainIntegrity { index }),
            None => Ok(()),
        }
    }
}

pub type LedgerLog = Box<dyn AppendLog<SealedBlock>>;

pub struct Ledger {
    writer: Mutex<LedgerLog>,
    chain: RwLock<Vec<SealedBlock>>,
}

impl Ledger {
    /// Loads whatever the backend holds. A chain that fails verification
    /// still opens; call [`Ledger::verify`] to audit it.
    pub fn open(mut log: LedgerLog) -> Result<Self, PipelineError> {
        let chain = log.load()?;
        tracing::debug!(blocks = chain.len(), "ledger opened");
        Ok(Self {
            writer: Mutex::new(log),
            chain: RwLock::new(chain),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            writer: Mutex::new(Box::new(MemoryLog::new())),
            chain: RwLock::new(Vec::new()),
        }
    }

    pub fn close(self) -> Result<(), PipelineError> {
        let mut log = self
            .writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        log.flush()
    }

    pub fn begin(&self) -> Result<LedgerTransaction<'_>, PipelineError> {
        let log = self
            .writer
            .lock()
            .map_err(|_| PipelineError::storage("ledger writer lock poisoned"))?;
        Ok(LedgerTransaction {
            ledger: self,
            log,
            staged: None,
            committed: false,
        })
    }

    pub fn append(
        &self,
        filename: &str,
        content_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerBlock, PipelineError> {
        let mut txn = self.begin()?;
        let block = txn.append(filename, content_hash, timestamp)?;
        txn.commit();
        Ok(block)
    }

    /// Cuts the chain back to its first `len` blocks, in storage and in
    /// memory.
    pub fn truncate(&self, len: usize) -> Result<(), PipelineError> {
        let mut log = self
            .writer
            .lock()
            .map_err(|_| PipelineError::storage("ledger writer lock poisoned"))?;
        log.truncate(len)?;
        self.chain
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .truncate(len);
        Ok(())
    }

    pub fn last(&self) -> Option<LedgerBlock> {
        self.read_chain().last().map(|sealed| sealed.block.clone())
    }

    pub fn snapshot(&self) -> Vec<LedgerBlock> {
        self.read_chain()
            .iter()
            .map(|sealed| sealed.block.clone())
            .collect()
    }

    pub fn latest_for(&self, filename: &str) -> Option<LedgerBlock> {
        latest_in(&self.read_chain(), filename)
    }

    pub fn len(&self) -> usize {
        self.read_chain().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn verify(&self) -> ChainVerification {
        verify_chain(&self.read_chain())
    }

    fn read_chain(&self) -> RwLockReadGuard<'_, Vec<SealedBlock>> {
        // The vector is only pushed to after a successful persist, so a
        // poisoned lock still guards a consistent prefix.
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn tamper(&self, position: usize, edit: impl FnOnce(&mut LedgerBlock)) {
        let mut chain = self.chain.write().unwrap();
        edit(&mut chain[position].block);
    }
}

/// Exclusive write access to a [`Ledger`].
///
/// A staged block is durable but invisible until [`commit`](Self::commit).
/// Dropping the transaction without committing rolls the staged block back.
pub struct LedgerTransaction<'a> {
    ledger: &'a Ledger,
    log: MutexGuard<'a, LedgerLog>,
    staged: Option<SealedBlock>,
    committed: bool,
}

impl LedgerTransaction<'_> {
    pub fn latest_for(&self, filename: &str) -> Option<LedgerBlock> {
        latest_in(&self.ledger.read_chain(), filename)
    }

    pub fn append(
        &mut self,
        filename: &str,
        content_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<LedgerBlock, PipelineError> {
        if self.staged.is_some() {
            return Err(PipelineError::storage(
                "a block is already staged in this transaction",
            ));
        }

        let (index, prev_hash) = {
            let chain = self.ledger.read_chain();
            match chain.last() {
                Some(tail) => (chain.len() as u64, tail.block.digest()),
                None => (0, GENESIS_SENTINEL.to_string()),
            }
        };

        let sealed = SealedBlock::seal(LedgerBlock {
            index,
            filename: filename.to_string(),
            hash: content_hash.to_string(),
            prev_hash,
            timestamp,
        });
        self.log.append(&sealed)?;
        let block = sealed.block.clone();
        self.staged = Some(sealed);
        Ok(block)
    }

    pub fn commit(mut self) {
        if let Some(sealed) = self.staged.take() {
            let mut chain = self
                .ledger
                .chain
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            tracing::debug!(index = sealed.block.index, "ledger block committed");
            chain.push(sealed);
        }
        self.committed = true;
    }

    pub fn rollback(mut self) -> Result<(), PipelineError> {
        self.undo_staged()
    }

    fn undo_staged(&mut self) -> Result<(), PipelineError> {
        if let Some(sealed) = self.staged.take() {
            let published = self.ledger.read_chain().len();
            self.log.truncate(published)?;
            tracing::warn!(index = sealed.block.index, "ledger block rolled back");
        }
        Ok(())
    }
}

impl Drop for LedgerTransaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.undo_staged() {
            tracing::error!(error = %err, "failed to roll back staged ledger block");
        }
    }
}

fn latest_in(chain: &[SealedBlock], filename: &str) -> Option<LedgerBlock> {
    chain
        .iter()
        .rev()
        .find(|sealed| sealed.block.filename == filename)
        .map(|sealed| sealed.block.clone())
}

fn verify_chain(chain: &[SealedBlock]) -> ChainVerification {
    let mut expected_prev = GENESIS_SENTINEL.to_string();
    for (position, sealed) in chain.iter().enumerate() {
        let digest = sealed.block.digest();
        let intact = sealed.block.index == position as u64
            && sealed.block.prev_hash == expected_prev
            && sealed.block_hash == digest;
        if !intact {
            return ChainVerification {
                valid: false,
                first_broken_index: Some(position as u64),
                blocks_checked: position as u64 + 1,
            };
        }
        expected_prev = digest;
    }
    ChainVerification {
        valid: true,
        first_broken_index: None,
        blocks_checked: chain.len() as u64,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn hash_of(label: &str) -> String {
        hasher::digest(label.as_bytes())
    }

    #[test]
    fn genesis_block() {
        let ledger = Ledger::in_memory();
        let block = ledger.append("a.fasta", &hash_of("a"), at(0)).unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.prev_hash, GENESIS_SENTINEL);
    }

    #[test]
    fn blocks_link_to_predecessor() {
        let ledger = Ledger::in_memory();
        let first = ledger.append("a.fasta", &hash_of("a"), at(0)).unwrap();
        let second = ledger.append("b.fasta", &hash_of("b"), at(1)).unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.prev_hash, hasher::digest(&first.canonical_encoding()));
        assert!(ledger.verify().valid);
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let block = LedgerBlock {
            index: 3,
            filename: "x.fa".to_string(),
            hash: hash_of("x"),
            prev_hash: GENESIS_SENTINEL.to_string(),
            timestamp: at(0),
        };
        let text = String::from_utf8(block.canonical_encoding()).unwrap();
        assert!(text.starts_with("{\"index\":3,\"filename\":\"x.fa\",\"hash\":"));
        assert!(text.ends_with("\"timestamp\":\"2023-11-14T22:13:20.000000000Z\"}"));
    }

    #[test]
    fn tampered_payload_is_located() {
        let ledger = Ledger::in_memory();
        for n in 0..3 {
            ledger
                .append(&format!("f{n}.fasta"), &hash_of(&n.to_string()), at(n))
                .unwrap();
        }
        ledger.tamper(1, |block| block.filename = "forged.fasta".to_string());
        let report = ledger.verify();
        assert!(!report.valid);
        assert_eq!(report.first_broken_index, Some(1));
        assert_matches!(
            report.into_result(),
            Err(PipelineError::ChainIntegrity { index: 1 })
        );
    }

    #[test]
    fn rewritten_link_is_located() {
        let ledger = Ledger::in_memory();
        for n in 0..3 {
            ledger.append("same.fasta", &hash_of("s"), at(n)).unwrap();
        }
        ledger.tamper(2, |block| block.prev_hash = GENESIS_SENTINEL.to_string());
        assert_eq!(ledger.verify().first_broken_index, Some(2));
    }

    #[test]
    fn rolled_back_block_is_never_visible() {
        let ledger = Ledger::in_memory();
        ledger.append("a.fasta", &hash_of("a"), at(0)).unwrap();
        {
            let mut txn = ledger.begin().unwrap();
            let staged = txn.append("b.fasta", &hash_of("b"), at(1)).unwrap();
            assert_eq!(staged.index, 1);
            assert_eq!(ledger.len(), 1);
            txn.rollback().unwrap();
        }
        {
            let mut txn = ledger.begin().unwrap();
            txn.append("c.fasta", &hash_of("c"), at(2)).unwrap();
        }
        assert_eq!(ledger.len(), 1);
        let next = ledger.append("d.fasta", &hash_of("d"), at(3)).unwrap();
        assert_eq!(next.index, 1);
        assert!(ledger.verify().valid);
    }

    #[test]
    fn truncate_drops_the_tail() {
        let ledger = Ledger::in_memory();
        let first = ledger.append("a.fasta", &hash_of("a"), at(0)).unwrap();
        ledger.append("b.fasta", &hash_of("b"), at(1)).unwrap();
        ledger.truncate(1).unwrap();
        assert_eq!(ledger.last(), Some(first.clone()));
        let next = ledger.append("c.fasta", &hash_of("c"), at(2)).unwrap();
        assert_eq!(next.index, 1);
        assert_eq!(next.prev_hash, first.digest());
    }

    #[test]
    fn concurrent_appends_are_contiguous() {
        let ledger = Arc::new(Ledger::in_memory());
        let handles: Vec<_> = (0..32)
            .map(|n| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .append(&format!("f{n}.fasta"), &hash_of(&n.to_string()), at(n))
                        .unwrap()
                        .index
                })
            })
            .collect();
        let mut indices: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..32).collect::<Vec<_>>());
        assert!(ledger.verify().valid);
    }

    #[test]
    fn latest_for_prefers_newest() {
        let ledger = Ledger::in_memory();
        ledger.append("a.fasta", &hash_of("v1"), at(0)).unwrap();
        ledger.append("b.fasta", &hash_of("b"), at(1)).unwrap();
        ledger.append("a.fasta", &hash_of("v2"), at(2)).unwrap();
        assert_eq!(ledger.latest_for("a.fasta").unwrap().hash, hash_of("v2"));
        assert!(ledger.latest_for("missing.fasta").is_none());
    }
}
