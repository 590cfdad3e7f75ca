//! Write-ahead log and transaction management for FolioDB
//!
//! The WAL is an append-only file of length-prefixed, CRC-guarded frames.
//! Sequence numbers are assigned at append time and stay strictly
//! monotonic across restarts (recovered from the tail on open). Large
//! payloads may travel through a compression envelope (gzip or lz4).
//!
//! The transaction manager owns the log and the set of live transactions,
//! and coordinates two-phase commit across registered participants. It
//! holds weak references only: participants (collections) own themselves.
//!
//! Recovery scans the log forward, replays committed transactions into
//! participants in order, and aborts anything still in flight: a
//! PREPARE without a COMMIT is presumed aborted.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compression;
pub mod config;
pub mod encoding;
pub mod entry;
pub mod log;
pub mod manager;
pub mod recovery;

pub use compression::{CompressionAlgorithm, CompressionCodec, CompressionEnvelope};
pub use config::{CompressionConfig, WalOptions};
pub use encoding::{decode_frame, encode_frame, DecodedFrame};
pub use entry::{WalEntry, WalEntryKind};
pub use log::{OpenReport, WalFile, WalIterator};
pub use manager::{
    IsolationLevel, TransactionManager, TransactionOptions, TransactionParticipant, TxState,
};
pub use recovery::{recover, RecoverySummary};
