use core::ptr::NonNull;
use std::sync::Arc;

use super::{FunctionEntry, NativeDb, StmtHandle};
use crate::codec::{HostText, TextMode, TextValue};
use crate::error::{Error, Result};
use crate::function::{self, Function};
use crate::provider::{FunctionFlags, OpenFlags, Sqlite3Api};

impl<'p, P: Sqlite3Api> NativeDb<'p, P> {
    /// Open `path` with `flags`; the path is encoded with `mode`.
    ///
    /// Opening an already-open connection closes the stale handle and fails.
    pub fn open(&self, path: HostText<'_>, flags: OpenFlags, mode: TextMode) -> Result<()> {
        if self.is_open() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "closing stale connection failed");
            }
            return Err(Error::AlreadyOpen);
        }
        let path = self.codec.encode(path, mode)?;
        let db = unsafe { self.api.open(&path, flags)? };
        if !self.install_handle(db) {
            if let Err(err) = unsafe { self.api.close(db) } {
                tracing::warn!(error = %err, "closing racing connection failed");
            }
            return Err(Error::AlreadyOpen);
        }
        if let Err(err) = unsafe { self.api.extended_result_codes(db, true) } {
            tracing::warn!(error = %err, "enabling extended result codes failed");
        }
        tracing::debug!(
            backend = self.api.backend_name(),
            path = %String::from_utf8_lossy(&path),
            "opened connection"
        );
        Ok(())
    }

    fn install_handle(&self, db: NonNull<P::Db>) -> bool {
        if self.is_open() {
            return false;
        }
        self.set_handle(db);
        true
    }

    /// Close the connection. A closed connection is left alone.
    ///
    /// The handle reads back as zero afterwards even when the engine reports
    /// a failure; the failure is still returned.
    pub fn close(&self) -> Result<()> {
        let Some(db) = self.take_handle() else {
            return Ok(());
        };
        let mut state = self.lock_state();
        for raw in state.statements.drain() {
            if let Some(stmt) = NonNull::new(raw as *mut P::Stmt) {
                if let Err(err) = unsafe { self.api.finalize(stmt) } {
                    tracing::debug!(error = %err, "finalize during close reported an error");
                }
            }
        }
        let out = unsafe { self.api.close(db) };
        match &out {
            Ok(()) => state.hooks.release_all(),
            Err(err) => {
                tracing::warn!(error = %err, "close failed, leaking hook contexts");
                state.hooks.leak_all();
            }
        }
        state.functions.clear();
        drop(state);
        tracing::debug!("closed connection");
        out
    }

    /// Ask a running statement to stop. Safe to call from another thread.
    pub fn interrupt(&self) -> Result<()> {
        let db = self.db()?;
        unsafe { self.api.interrupt(db) };
        Ok(())
    }

    /// Compile the first statement of `sql`.
    ///
    /// Returns [`StmtHandle::NULL`] when `sql` holds no statement.
    pub fn prepare(&self, sql: HostText<'_>, mode: TextMode) -> Result<StmtHandle> {
        let db = self.db()?;
        let sql = self.codec.encode(sql, mode)?;
        let Some(stmt) = (unsafe { self.api.prepare_v2(db, &sql)? }) else {
            return Ok(StmtHandle::NULL);
        };
        let handle = StmtHandle::from_raw(stmt.as_ptr() as usize);
        self.lock_state().statements.insert(handle.as_raw());
        Ok(handle)
    }

    /// Run every statement in `sql`, discarding rows.
    pub fn exec(&self, sql: HostText<'_>, mode: TextMode) -> Result<()> {
        let db = self.db()?;
        let sql = self.codec.encode(sql, mode)?;
        unsafe { self.api.exec(db, &sql) }
    }

    /// Most recent engine error message.
    pub fn errmsg(&self, mode: TextMode) -> Result<Option<TextValue<'static>>> {
        let db = self.db()?;
        let raw = unsafe { self.api.errmsg(db) };
        if raw.is_null() {
            return Ok(None);
        }
        let text = self.codec.decode(unsafe { raw.as_slice() }, mode)?;
        Ok(Some(text.into_owned()))
    }

    /// Most recent primary or extended status of the connection.
    pub fn errcode(&self) -> Result<i32> {
        let db = self.db()?;
        let extended = unsafe { self.api.extended_errcode(db) };
        Ok(extended.unwrap_or_else(|| unsafe { self.api.errcode(db) }))
    }

    /// Engine version string; needs no connection.
    pub fn libversion(api: &P, mode: TextMode) -> Result<TextValue<'static>> {
        crate::config::global()
            .codec()
            .decode(api.libversion(), mode)
            .map(TextValue::into_owned)
    }

    pub fn changes(&self) -> Result<i64> {
        let db = self.db()?;
        Ok(unsafe { self.api.changes(db) })
    }

    pub fn total_changes(&self) -> Result<i64> {
        let db = self.db()?;
        Ok(unsafe { self.api.total_changes(db) })
    }

    /// Set limit `id` to `value` (negative leaves it unchanged); returns the
    /// previous value.
    pub fn limit(&self, id: i32, value: i32) -> Result<i32> {
        let db = self.db()?;
        Ok(unsafe { self.api.limit(db, id, value) })
    }

    /// Process-wide shared-cache switch.
    pub fn shared_cache(&self, enable: bool) -> Result<()> {
        unsafe { self.api.enable_shared_cache(enable) }
    }

    pub fn enable_load_extension(&self, enable: bool) -> Result<()> {
        let db = self.db()?;
        unsafe { self.api.enable_load_extension(db, enable) }
    }

    /// Register `function` under `name` for `n_args` arguments (-1: any).
    ///
    /// A previous registration with the same name and arity is replaced.
    pub fn create_function(
        &self,
        name: HostText<'_>,
        function: Arc<Function<P>>,
        n_args: i32,
        flags: FunctionFlags,
        mode: TextMode,
    ) -> Result<()> {
        let db = self.db()?;
        let name = self.codec.encode(name, mode)?.into_owned();
        let mut state = self.lock_state();
        let registration = function::register(
            self.api,
            db,
            &name,
            function,
            n_args,
            flags,
            Arc::clone(&self.runtime),
            self.codec,
        )?;
        state
            .functions
            .retain(|entry| !(entry.n_args == n_args && entry.name.eq_ignore_ascii_case(&name)));
        state.functions.push(FunctionEntry {
            name,
            n_args,
            _registration: registration,
        });
        Ok(())
    }

    /// Remove the function registered under `name` and `n_args`.
    pub fn destroy_function(&self, name: HostText<'_>, n_args: i32, mode: TextMode) -> Result<()> {
        let db = self.db()?;
        let name = self.codec.encode(name, mode)?;
        let mut state = self.lock_state();
        function::unregister(self.api, db, &name, n_args)?;
        state
            .functions
            .retain(|entry| !(entry.n_args == n_args && entry.name.eq_ignore_ascii_case(&name)));
        Ok(())
    }

    /// Unregister and release every function this connection registered.
    pub fn free_functions(&self) -> Result<()> {
        let mut state = self.lock_state();
        let entries = std::mem::take(&mut state.functions);
        let Ok(db) = self.db() else {
            return Ok(());
        };
        let mut first_error = None;
        for entry in &entries {
            if let Err(err) = function::unregister(self.api, db, &entry.name, entry.n_args) {
                tracing::warn!(
                    name = %String::from_utf8_lossy(&entry.name),
                    error = %err,
                    "unregistering function failed"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
