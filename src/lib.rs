#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
//! An embedded, persistent, transactional key/value cache, used to memoize
//! expensive indexing artifacts across runs of a language-analysis
//! toolchain.
//!
//! The cache wraps a memory-mapped LMDB environment (through [`heed`]) and
//! imposes a strict concurrency discipline on top of it: exactly one writer
//! thread, any number of reader threads sharing a single
//! snapshot-consistent view, and an atomic versioning scheme that discards
//! a stale cache when the schema tag changes.
//!
//! ```
//! use kvcache::{OwnedStore, ReadOnlyStore, Store};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = Store::open("1", dir.path(), "standard").unwrap();
//!
//! // The thread that wraps the store becomes its writer; other threads
//! // read a stable snapshot through a shared reference.
//! let mut owned = OwnedStore::new(store).unwrap();
//! owned.write_value(b"ast:lib.rb", b"serialized tree").unwrap();
//! assert_eq!(owned.read_value(b"ast:lib.rb").unwrap(), b"serialized tree");
//!
//! // Committing hands the environment back for re-wrapping.
//! let store = OwnedStore::best_effort_commit(owned);
//! let reader = ReadOnlyStore::new(store).unwrap();
//! assert_eq!(reader.read_value(b"ast:lib.rb").unwrap(), b"serialized tree");
//! ```
//!
//! # Concurrency model
//!
//! At most one [`Store`] exists per process at any instant: the underlying
//! environment is a process-global resource, and a second simultaneous
//! handle fails with [`Error::AlreadyInUse`]. A [`Store`] is wrapped into
//! either a [`ReadOnlyStore`] or an [`OwnedStore`]; closing a view hands
//! the bare [`Store`] back so the caller may re-wrap it.
//!
//! A [`ReadOnlyStore`] holds one long-lived read-only transaction. Every
//! lookup, from any thread, observes the database exactly as it was when
//! the view was opened, regardless of commits made by other processes in
//! the meantime.
//!
//! An [`OwnedStore`] holds a write transaction owned by the thread that
//! created the view, plus a second read-only snapshot shared with all
//! other threads. The writer sees its own pending writes immediately;
//! peer threads keep seeing the last-committed state until the store is
//! committed and re-wrapped. Mutating operations invoked from any other
//! thread fail with [`Error::WrongThread`]: the engine pins write
//! transactions to their creating thread, and touching one from elsewhere
//! would wedge every future writer.
//!
//! # Persisted format
//!
//! Each [`Store`] manages one environment directory holding named
//! sub-databases, one per `flavor`. A sub-database carries a reserved
//! record under the key `DB_FORMAT_VERSION` whose value is the
//! length-prefixed schema tag of the writer that produced it. Values
//! written through [`OwnedStore::write_value`] are framed as a
//! little-endian `u64` length followed by the payload verbatim, so the
//! original length is recoverable from the raw mapped record on any
//! architecture. Bumping the schema tag between runs is the supported way
//! to invalidate a cache: the next writer finds the mismatch, clears the
//! sub-database and publishes the new tag.

use thiserror::Error;

mod store;
pub use store::{OwnedStore, ReadOnlyStore, Store};


/// Errors that can occur while operating the cache.
#[derive(Debug, Error)]
pub enum Error {
    /// A second [`Store`] was opened while another one was still alive.
    #[error("cannot create two cache store instances simultaneously")]
    AlreadyInUse,
    /// The environment could not be created or opened.
    #[error("failed to create database: {0}")]
    Open(#[source] heed::Error),
    /// A main or snapshot transaction could not be opened or published.
    #[error("failed to create transaction: {0}")]
    Txn(#[source] heed::Error),
    /// A point lookup failed for a reason other than the key being absent.
    #[error("failed read from the database: {0}")]
    Read(#[source] heed::Error),
    /// An insert-or-overwrite failed.
    #[error("failed write into the database: {0}")]
    Write(#[source] heed::Error),
    /// Emptying the sub-database, or re-publishing it afterwards, failed.
    #[error("failed to clear the database: {0}")]
    Clear(#[source] heed::Error),
    /// Committing the pending writes failed.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] heed::Error),
    /// A writer-only operation was invoked off the writer thread.
    #[error("cache store can only write from the thread that created it")]
    WrongThread,
    /// The view's main transaction has already ended.
    #[error("cache store transaction has already ended")]
    Closed,
    /// A stored record is too short for its own length framing.
    #[error("corrupt record: truncated length prefix")]
    Corrupt,
}
