use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use log::error;

use crate::Error;

mod owned;
pub use owned::OwnedStore;

/// Reserved key holding the length-prefixed schema tag of the writer that
/// produced the sub-database.
pub(crate) const VERSION_KEY: &[u8] = b"DB_FORMAT_VERSION";

/// 2 GiB. Hard cap on both the on-disk footprint and the virtual memory
/// mapping.
const MAX_DB_SIZE_BYTES: usize = 2 * 1024 * 1024 * 1024;

const MAX_NAMED_DBS: u32 = 3;

/// The environment is a process-global resource; this flag is claimed by
/// [`Store::open`] and released when the handle drops.
static STORE_IN_USE: AtomicBool = AtomicBool::new(false);

/// Session ids tag each successfully opened main transaction; 0 is the
/// "never opened" sentinel, so the counter starts at 1.
static SESSION_COUNTER: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_session_id() -> u32 {
    SESSION_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// The process-level handle to the memory-mapped cache directory.
///
/// At most one `Store` exists per process at any instant; a second
/// simultaneous [`open`](Store::open) fails with [`Error::AlreadyInUse`].
/// A `Store` on its own has no open transactions: wrap it into a
/// [`ReadOnlyStore`] or an [`OwnedStore`](crate::OwnedStore) to read or
/// write, and close the view to get the `Store` back.
pub struct Store {
    /// Boxed so that live transactions, which keep an internal reference
    /// to the environment, stay valid while the owning view moves.
    pub(crate) env: Box<Env>,
    pub(crate) version: String,
    pub(crate) flavor: String,
}

impl Store {
    /// Open the cache environment at `path`, an existing directory.
    ///
    /// `version` is the schema tag for everything written through this
    /// store; it must be non-empty. A reader that finds a different tag on
    /// disk serves an empty cache, and a writer clears and re-tags the
    /// sub-database. `flavor` names the sub-database all views of this
    /// store operate on.
    pub fn open<P: AsRef<Path>>(version: &str, path: P, flavor: &str) -> Result<Store, Error> {
        Store::open_sized(version, path, flavor, MAX_DB_SIZE_BYTES)
    }

    /// Open on a shrunk map, so tests can exhaust it.
    #[cfg(test)]
    pub(crate) fn open_with_map_size<P: AsRef<Path>>(
        version: &str,
        path: P,
        flavor: &str,
        map_size: usize,
    ) -> Result<Store, Error> {
        Store::open_sized(version, path, flavor, map_size)
    }

    fn open_sized<P: AsRef<Path>>(
        version: &str,
        path: P,
        flavor: &str,
        map_size: usize,
    ) -> Result<Store, Error> {
        assert!(!version.is_empty(), "cache schema version must be non-empty");
        if STORE_IN_USE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyInUse);
        }
        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(MAX_NAMED_DBS);
        // NO_TLS detaches read transactions from thread-local reader
        // slots, so one snapshot transaction can be consulted from any
        // thread.
        unsafe {
            options.flags(EnvFlags::NO_TLS);
        }
        // SAFETY: the in-use flag above guarantees this process holds no
        // other handle on the environment, so the map is never aliased.
        let env = match unsafe { options.open(path) } {
            Ok(env) => env,
            Err(e) => {
                STORE_IN_USE.store(false, Ordering::SeqCst);
                return Err(Error::Open(e));
            }
        };
        Ok(Store {
            env: Box::new(env),
            version: version.to_string(),
            flavor: flavor.to_string(),
        })
    }

    /// The schema tag this store was opened with.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The name of the sub-database views of this store operate on.
    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    /// The directory backing the environment.
    pub fn path(&self) -> &Path {
        self.env.path()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // The environment itself closes when the boxed handle drops.
        if STORE_IN_USE
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!("cache store in-use flag was already clear on close");
            debug_assert!(false, "cache store in-use flag was already clear on close");
        }
    }
}

/// A read-only view: one long-lived snapshot of the cache.
///
/// Every lookup, from any thread, observes the database exactly as it was
/// when the view was opened, regardless of commits made by other processes
/// in the meantime. The view owns its [`Store`];
/// [`close`](ReadOnlyStore::close) hands it back for re-wrapping.
pub struct ReadOnlyStore {
    /// Declared before `store`: the transaction must drop before the
    /// environment it references.
    txn: Option<RoTxn<'static>>,
    db: Option<Database<Bytes, Bytes>>,
    wrong_version: bool,
    session_id: u32,
    store: Store,
}

// SAFETY: the environment is opened with NO_TLS, so the engine does not
// bind read-only transactions to their creating thread; this view uses its
// transaction only for point lookups through a shared reference, and
// dropping it (an abort) is equally thread-agnostic under NO_TLS.
unsafe impl Send for ReadOnlyStore {}
unsafe impl Sync for ReadOnlyStore {}

impl ReadOnlyStore {
    /// Wrap `store` into a read-only view, taking the snapshot it will
    /// serve for its whole lifetime.
    ///
    /// A missing sub-database, or a schema tag on disk that differs from
    /// [`Store::version`], is not an error: the view opens with the wrong
    /// version recorded and every read reports absent.
    pub fn new(store: Store) -> Result<ReadOnlyStore, Error> {
        let mut view = ReadOnlyStore {
            txn: None,
            db: None,
            wrong_version: false,
            session_id: 0,
            store,
        };
        view.open_txn().map_err(Error::Txn)?;
        let wrong_version = view.read_value(VERSION_KEY)? != view.store.version.as_bytes();
        view.wrong_version = wrong_version;
        Ok(view)
    }

    fn open_txn(&mut self) -> Result<(), heed::Error> {
        if self.txn.is_some() {
            error!("reader view already has a live transaction");
            debug_assert!(false, "reader view already has a live transaction");
        }
        let txn = self.store.env.read_txn()?;
        // SAFETY: the transaction is stored next to the boxed environment
        // that created it and always drops first; the box keeps the
        // environment's address stable while the view moves.
        let txn: RoTxn<'static> = unsafe { mem::transmute(txn) };
        match self
            .store
            .env
            .open_database::<Bytes, Bytes>(&txn, Some(&self.store.flavor))?
        {
            Some(db) => {
                self.db = Some(db);
                self.session_id = next_session_id();
            }
            // The sub-database was never created: serve an empty cache.
            None => self.wrong_version = true,
        }
        self.txn = Some(txn);
        Ok(())
    }

    /// Point lookup of the raw stored record.
    ///
    /// Returns `None` when the key is absent or the view is on the wrong
    /// schema version. The returned slice aliases the memory map and is
    /// valid for as long as the view.
    pub fn read(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        if self.wrong_version {
            return Ok(None);
        }
        let (Some(db), Some(txn)) = (&self.db, &self.txn) else {
            return Err(Error::Closed);
        };
        lookup(db, txn, key)
    }

    /// Look up a length-prefixed value written by
    /// [`OwnedStore::write_value`](crate::OwnedStore::write_value).
    ///
    /// An absent key decodes to the empty slice.
    pub fn read_value(&self, key: &[u8]) -> Result<&[u8], Error> {
        match self.read(key)? {
            Some(record) => decode_value(record),
            None => Ok(&[]),
        }
    }

    /// Debug tag assigned when the snapshot was opened, 0 when the
    /// sub-database did not exist.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// End the snapshot transaction. Idempotent; reads after this fail
    /// with [`Error::Closed`] unless the view was already serving an empty
    /// cache.
    pub fn abort(&mut self) {
        if self.txn.is_none() {
            return;
        }
        // Dropping the transaction aborts it. The engine keeps named
        // database handles cached in the environment, so releasing ours is
        // just letting it go.
        self.txn = None;
        self.db = None;
    }

    /// Abort the view and hand back the reusable [`Store`].
    pub fn close(mut this: ReadOnlyStore) -> Store {
        this.abort();
        let ReadOnlyStore { txn, store, .. } = this;
        drop(txn);
        store
    }
}

fn lookup<'t>(
    db: &Database<Bytes, Bytes>,
    txn: &'t RoTxn<'static>,
    key: &[u8],
) -> Result<Option<&'t [u8]>, Error> {
    db.get(txn, key).map_err(Error::Read)
}

/// Frame `value` for storage: a little-endian `u64` length, then the
/// payload verbatim.
fn encode_value(value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(size_of::<u64>() + value.len());
    record.extend_from_slice(&(value.len() as u64).to_le_bytes());
    record.extend_from_slice(value);
    record
}

/// Recover the payload from a length-prefixed record.
fn decode_value(record: &[u8]) -> Result<&[u8], Error> {
    const PREFIX: usize = size_of::<u64>();
    if record.len() < PREFIX {
        return Err(Error::Corrupt);
    }
    let mut len = [0u8; PREFIX];
    len.copy_from_slice(&record[..PREFIX]);
    let len = usize::try_from(u64::from_le_bytes(len)).map_err(|_| Error::Corrupt)?;
    PREFIX
        .checked_add(len)
        .and_then(|end| record.get(PREFIX..end))
        .ok_or(Error::Corrupt)
}

#[test]
fn value_framing_round_trips() {
    let record = encode_value(b"payload");
    assert_eq!(decode_value(&record).unwrap(), b"payload");
    assert_eq!(decode_value(&encode_value(b"")).unwrap(), b"");
}

#[test]
fn value_framing_rejects_truncation() {
    assert!(matches!(decode_value(b"\x01\x02"), Err(Error::Corrupt)));
    let mut record = encode_value(b"payload");
    record.truncate(10);
    assert!(matches!(decode_value(&record), Err(Error::Corrupt)));
}
