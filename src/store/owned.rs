use std::mem;
use std::thread::{self, ThreadId};
use std::time::Instant;

use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};
use log::{debug, error};

use super::{decode_value, encode_value, lookup, next_session_id, Store, VERSION_KEY};
use crate::Error;

/// The live transactions of an [`OwnedStore`], with the identity of the
/// one thread allowed to end them.
///
/// Dropping this off the writer thread leaks the transactions instead of
/// aborting them: the engine pins write transactions to their creating
/// thread, and an abort from anywhere else would wedge every future
/// writer.
struct WriterTxns {
    main: Option<RwTxn<'static>>,
    read: Option<RoTxn<'static>>,
    writer: ThreadId,
}

impl Drop for WriterTxns {
    fn drop(&mut self) {
        if self.main.is_none() && self.read.is_none() {
            return;
        }
        if thread::current().id() != self.writer {
            error!("owned cache store dropped off its writer thread; leaking live transactions");
            if let Some(txn) = self.main.take() {
                mem::forget(txn);
            }
            if let Some(txn) = self.read.take() {
                mem::forget(txn);
            }
        }
        // On the writer thread, the remaining transactions drop here,
        // which aborts them.
    }
}

/// The writer view: one thread writes, any thread reads.
///
/// The thread constructing the view becomes its writer. Every mutating
/// operation checks for it and fails with [`Error::WrongThread`] from
/// anywhere else. Reads dispatch on the calling thread: the writer reads
/// through its own write transaction and sees pending writes immediately,
/// while peer threads read a snapshot taken at construction (or at the
/// last [`clear`](OwnedStore::clear)) and see the last-committed state
/// until the store is committed and re-wrapped.
pub struct OwnedStore {
    /// Declared before `store`: the transactions must drop, or leak,
    /// before the environment they reference.
    txns: WriterTxns,
    db: Option<Database<Bytes, Bytes>>,
    session_id: u32,
    store: Store,
}

// SAFETY: the write transaction is only ever reached on the thread
// recorded in `txns.writer` (checked at runtime on every mutating path and
// in the read dispatch), and the snapshot transaction is a NO_TLS
// read-only transaction used for point lookups through a shared reference,
// which the engine permits from any thread. A drop on the wrong thread
// leaks the transactions rather than touching them.
unsafe impl Send for OwnedStore {}
unsafe impl Sync for OwnedStore {}

impl OwnedStore {
    /// Wrap `store` into the writer view, making the calling thread the
    /// writer.
    ///
    /// If the sub-database carries a schema tag other than
    /// [`Store::version`], it is cleared and re-tagged before the view is
    /// returned.
    pub fn new(store: Store) -> Result<OwnedStore, Error> {
        let mut view = OwnedStore {
            txns: WriterTxns {
                main: None,
                read: None,
                writer: thread::current().id(),
            },
            db: None,
            session_id: 0,
            store,
        };
        view.open_txns().map_err(Error::Txn)?;
        if view.read_value(VERSION_KEY)? != view.store.version.as_bytes() {
            view.clear()?;
            let version = view.store.version.clone();
            view.write_value(VERSION_KEY, version.as_bytes())?;
        }
        Ok(view)
    }

    /// Begin the write transaction, publish the sub-database handle, and
    /// take the snapshot transaction peer threads will read from.
    fn open_txns(&mut self) -> Result<(), heed::Error> {
        if self.txns.main.is_some() || self.txns.read.is_some() {
            error!("owned cache store already has live transactions");
            debug_assert!(false, "owned cache store already has live transactions");
        }
        let env = &self.store.env;
        // SAFETY (all three transmutes): each transaction is stored next
        // to the boxed environment that created it and never outlives it;
        // the box keeps the environment's address stable while the view
        // moves.
        let mut main: RwTxn<'static> = unsafe { mem::transmute(env.write_txn()?) };
        let db = env.create_database::<Bytes, Bytes>(&mut main, Some(&self.store.flavor))?;
        self.session_id = next_session_id();
        // A named database created inside a transaction stays private to
        // it until that transaction commits. Commit right away so the
        // snapshot transaction below can see the handle, then re-begin for
        // the actual writes.
        main.commit()?;
        let main: RwTxn<'static> = unsafe { mem::transmute(env.write_txn()?) };
        let read: RoTxn<'static> = unsafe { mem::transmute(env.read_txn()?) };
        self.db = Some(db);
        self.txns.main = Some(main);
        self.txns.read = Some(read);
        Ok(())
    }

    fn check_writer(&self) -> Result<(), Error> {
        if thread::current().id() == self.txns.writer {
            Ok(())
        } else {
            Err(Error::WrongThread)
        }
    }

    /// The transaction the calling thread reads through: the write
    /// transaction for the writer, the snapshot for everyone else.
    fn thread_txn(&self) -> Option<&RoTxn<'static>> {
        if thread::current().id() == self.txns.writer {
            self.txns.main.as_ref().map(|txn| &**txn)
        } else {
            self.txns.read.as_ref()
        }
    }

    /// Point lookup of the raw stored record, dispatched on the calling
    /// thread: the writer reads through the write transaction, everyone
    /// else through the snapshot.
    ///
    /// The returned slice aliases the memory map; it is invalidated by the
    /// next mutation, which the borrow on `self` enforces.
    pub fn read(&self, key: &[u8]) -> Result<Option<&[u8]>, Error> {
        let Some(db) = &self.db else {
            return Err(Error::Closed);
        };
        let txn = self.thread_txn().ok_or(Error::Closed)?;
        lookup(db, txn, key)
    }

    /// Look up a length-prefixed value written by
    /// [`write_value`](Self::write_value).
    ///
    /// An absent key decodes to the empty slice.
    pub fn read_value(&self, key: &[u8]) -> Result<&[u8], Error> {
        match self.read(key)? {
            Some(record) => decode_value(record),
            None => Ok(&[]),
        }
    }

    /// Debug tag assigned when the current main transaction was opened.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Insert or overwrite the raw bytes under `key` in the write
    /// transaction. Writer-thread only.
    ///
    /// The write is visible to reads on the writer thread immediately and
    /// to peer threads only after the next successful commit.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.check_writer()?;
        let Some(db) = self.db else {
            return Err(Error::Closed);
        };
        let main = self.txns.main.as_mut().ok_or(Error::Closed)?;
        db.put(main, key, value).map_err(Error::Write)
    }

    /// Length-prefix `value` and store it under `key`. Writer-thread only.
    pub fn write_value(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let record = encode_value(value);
        self.write(key, &record)
    }

    /// Drop every record in the sub-database and start over on fresh
    /// transactions. Writer-thread only.
    ///
    /// The snapshot peer threads read from is refreshed, and a new session
    /// id is assigned; callers must not rely on
    /// [`session_id`](Self::session_id) being stable across a clear.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.check_writer()?;
        let Some(db) = self.db else {
            return Err(Error::Closed);
        };
        let main = self.txns.main.as_mut().ok_or(Error::Closed)?;
        db.clear(main).map_err(Error::Clear)?;
        self.commit_txns().map_err(Error::Clear)?;
        self.open_txns().map_err(Error::Clear)
    }

    /// Commit the pending writes. Writer-thread only.
    ///
    /// After a successful commit the view is closed: reads and writes fail
    /// with [`Error::Closed`], and the view should be handed back through
    /// [`best_effort_commit`](Self::best_effort_commit) or dropped.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.txns.main.is_none() {
            return Err(Error::Closed);
        }
        self.check_writer()?;
        self.commit_txns().map_err(Error::Commit)
    }

    /// Commit the snapshot transaction first, releasing its reader slot,
    /// then the write transaction.
    ///
    /// The snapshot's commit result is ignored: the write transaction
    /// always commits, and its result is the one returned.
    fn commit_txns(&mut self) -> Result<(), heed::Error> {
        if let Some(read) = self.txns.read.take() {
            let _ = read.commit();
        }
        let result = match self.txns.main.take() {
            Some(main) => main.commit(),
            None => Ok(()),
        };
        self.db = None;
        result
    }

    /// Abort the pending writes. A no-op when the view is already closed.
    ///
    /// Fails with [`Error::WrongThread`] off the writer thread: ending the
    /// write transaction anywhere else would wedge the next writer.
    pub fn abort(&mut self) -> Result<(), Error> {
        if self.txns.main.is_none() {
            return Ok(());
        }
        self.check_writer()?;
        // The snapshot goes first, then the write transaction; dropping
        // aborts each.
        self.txns.read = None;
        self.txns.main = None;
        self.db = None;
        Ok(())
    }

    /// Commit and hand the [`Store`] back for re-owning, demoting a commit
    /// failure to an error-level log entry.
    pub fn best_effort_commit(mut this: OwnedStore) -> Store {
        let start = Instant::now();
        if let Err(e) = this.commit() {
            error!("failed to commit cache store: {}", e);
        }
        debug!("cache store commit finished in {:?}", start.elapsed());
        let OwnedStore { txns, store, .. } = this;
        drop(txns);
        store
    }

    /// Abort and hand the [`Store`] back for re-owning.
    ///
    /// Off the writer thread this fails, and the whole view is leaked: a
    /// live write transaction must not be ended here, and closing the
    /// environment underneath it would be no better.
    pub fn close(mut this: OwnedStore) -> Result<Store, Error> {
        match this.abort() {
            Ok(()) => {
                let OwnedStore { txns, store, .. } = this;
                drop(txns);
                Ok(store)
            }
            Err(e) => {
                error!("cache store closed off its writer thread; leaking the view");
                mem::forget(this);
                Err(e)
            }
        }
    }
}
