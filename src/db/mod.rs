//! Connection object: handle validation, statement registry and call
//! marshaling for every host-facing database operation.

mod core;
mod metadata;
mod statement;

use ::core::ptr::NonNull;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec::TextCodec;
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::function::Registration;
use crate::hooks::HookTable;
use crate::provider::Sqlite3Api;
use crate::runtime::HostRuntime;

/// Host-visible statement handle. Zero means "no statement".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StmtHandle(usize);

impl StmtHandle {
    pub const NULL: StmtHandle = StmtHandle(0);

    pub const fn from_raw(raw: usize) -> Self {
        StmtHandle(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// One `create_function` call owned by the connection.
pub(crate) struct FunctionEntry<P: Sqlite3Api> {
    pub(crate) name: Vec<u8>,
    pub(crate) n_args: i32,
    /// Keeps the connection's reference alive until the entry is dropped.
    pub(crate) _registration: Arc<Registration<P>>,
}

pub(crate) struct DbState<P: Sqlite3Api> {
    pub(crate) statements: HashSet<usize>,
    pub(crate) functions: Vec<FunctionEntry<P>>,
    pub(crate) hooks: HookTable,
}

impl<P: Sqlite3Api> Default for DbState<P> {
    fn default() -> Self {
        Self {
            statements: HashSet::new(),
            functions: Vec::new(),
            hooks: HookTable::default(),
        }
    }
}

/// Host connection object.
///
/// The native connection pointer lives in an integer field: zero while closed.
/// Statements, function registrations and hook contexts created through this
/// object are owned by it and released when it closes.
pub struct NativeDb<'p, P: Sqlite3Api> {
    pub(crate) api: &'p P,
    pub(crate) runtime: Arc<dyn HostRuntime>,
    pub(crate) config: BridgeConfig,
    pub(crate) codec: TextCodec,
    handle: AtomicUsize,
    state: Mutex<DbState<P>>,
}

impl<'p, P: Sqlite3Api> NativeDb<'p, P> {
    /// Closed connection using the process-wide configuration.
    pub fn new(api: &'p P, runtime: Arc<dyn HostRuntime>) -> Self {
        Self::with_config(api, runtime, *crate::config::global())
    }

    pub fn with_config(api: &'p P, runtime: Arc<dyn HostRuntime>, config: BridgeConfig) -> Self {
        Self {
            api,
            runtime,
            codec: config.codec(),
            config,
            handle: AtomicUsize::new(0),
            state: Mutex::new(DbState::default()),
        }
    }

    pub fn api(&self) -> &'p P {
        self.api
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn codec(&self) -> TextCodec {
        self.codec
    }

    /// Raw connection handle; zero when closed.
    pub fn handle(&self) -> usize {
        self.handle.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.handle() != 0
    }

    /// Validated connection pointer.
    pub(crate) fn db(&self) -> Result<NonNull<P::Db>> {
        NonNull::new(self.handle() as *mut P::Db).ok_or(Error::Closed)
    }

    pub(crate) fn set_handle(&self, db: NonNull<P::Db>) {
        self.handle.store(db.as_ptr() as usize, Ordering::Release);
    }

    pub(crate) fn take_handle(&self) -> Option<NonNull<P::Db>> {
        NonNull::new(self.handle.swap(0, Ordering::AcqRel) as *mut P::Db)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DbState<P>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validated statement pointer: rejects zero and handles this connection
    /// never issued or already finalized.
    pub(crate) fn stmt(&self, handle: StmtHandle) -> Result<NonNull<P::Stmt>> {
        if handle.is_null() || !self.lock_state().statements.contains(&handle.as_raw()) {
            return Err(Error::Finalized);
        }
        NonNull::new(handle.as_raw() as *mut P::Stmt).ok_or(Error::Finalized)
    }

    /// Number of statements prepared and not yet finalized.
    pub fn open_statements(&self) -> usize {
        self.lock_state().statements.len()
    }

    /// Number of live function registrations.
    pub fn registered_functions(&self) -> usize {
        self.lock_state().functions.len()
    }
}

impl<P: Sqlite3Api> Drop for NativeDb<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing connection on drop failed");
        }
    }
}
