//! Session/transaction bookkeeping: cancelable timers and pending transactions

pub mod timer;
pub mod transaction;

pub use timer::{TimerId, TimerQueue};
pub use transaction::{
    PendingTransaction, TransactionError, TransactionFailure, TransactionKey, TransactionTracker,
};
