//! Outstanding request/response transactions
//!
//! A transaction is one acknowledged configuration message waiting for its
//! status. Only one may be open per destination and request opcode, and a
//! response only resolves it when it comes from that destination.

use super::timer::TimerId;
use crate::model::MeshAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction 0x{opcode:04X} to {dst} is already pending")]
    AlreadyPending { dst: MeshAddress, opcode: u32 },
}

/// Why a transaction ended without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionFailure {
    /// Segments of the response arrived but the message never completed
    IncompleteSegments,
    /// Nothing usable arrived before the deadline
    Timeout,
}

impl fmt::Display for TransactionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionFailure::IncompleteSegments => {
                write!(f, "incomplete timer expired: peer did not deliver all segments")
            }
            TransactionFailure::Timeout => write!(f, "transaction timed out"),
        }
    }
}

/// Destination and request opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub dst: MeshAddress,
    pub opcode: u32,
}

#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub key: TransactionKey,
    /// Opcodes that resolve this transaction
    pub expected_opcodes: Vec<u32>,
    pub started_at_ms: u64,
    pub deadline_timer: TimerId,
    /// Response segments seen so far
    pub segments_seen: u32,
}

impl PendingTransaction {
    /// Classification when the deadline passes
    pub fn failure_on_expiry(&self) -> TransactionFailure {
        if self.segments_seen > 0 {
            TransactionFailure::IncompleteSegments
        } else {
            TransactionFailure::Timeout
        }
    }
}

#[derive(Debug, Default)]
pub struct TransactionTracker {
    pending: HashMap<TransactionKey, PendingTransaction>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction; fails if the same destination/opcode is still open
    pub fn begin(
        &mut self,
        key: TransactionKey,
        expected_opcodes: Vec<u32>,
        deadline_timer: TimerId,
        now_ms: u64,
    ) -> Result<(), TransactionError> {
        if self.pending.contains_key(&key) {
            return Err(TransactionError::AlreadyPending {
                dst: key.dst,
                opcode: key.opcode,
            });
        }
        debug!("Transaction 0x{:04X} to {} opened", key.opcode, key.dst);
        self.pending.insert(
            key,
            PendingTransaction {
                key,
                expected_opcodes,
                started_at_ms: now_ms,
                deadline_timer,
                segments_seen: 0,
            },
        );
        Ok(())
    }

    /// Close the transaction a response from `src` with `opcode` answers
    pub fn resolve(&mut self, src: MeshAddress, opcode: u32) -> Option<PendingTransaction> {
        let key = self
            .pending
            .values()
            .find(|t| t.key.dst == src && t.expected_opcodes.contains(&opcode))
            .map(|t| t.key)?;
        self.pending.remove(&key)
    }

    /// Record a response segment from `src`; false if nothing is pending there
    pub fn note_segment(&mut self, src: MeshAddress) -> bool {
        let mut matched = false;
        for transaction in self.pending.values_mut().filter(|t| t.key.dst == src) {
            transaction.segments_seen += 1;
            matched = true;
        }
        matched
    }

    /// Remove the transaction whose deadline timer fired
    pub fn expire(&mut self, timer: TimerId) -> Option<PendingTransaction> {
        let key = self
            .pending
            .values()
            .find(|t| t.deadline_timer == timer)
            .map(|t| t.key)?;
        self.pending.remove(&key)
    }

    pub fn take(&mut self, key: &TransactionKey) -> Option<PendingTransaction> {
        self.pending.remove(key)
    }

    /// Drop everything; callers cancel the returned deadline timers
    pub fn clear(&mut self) -> Vec<PendingTransaction> {
        self.pending.drain().map(|(_, t)| t).collect()
    }

    pub fn is_pending(&self, key: &TransactionKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
