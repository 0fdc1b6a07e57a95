use core::ptr::NonNull;

use super::{NativeDb, StmtHandle};
use crate::codec::{HostText, TextMode, TextValue};
use crate::error::{Error, Result, SQLITE_NOMEM};
use crate::provider::{Sqlite3Api, StepResult, ValueType};

impl<'p, P: Sqlite3Api> NativeDb<'p, P> {
    /// Release a prepared statement. Each issued handle is released once;
    /// zero, foreign and already-finalized handles fail with `Finalized`.
    pub fn finalize(&self, handle: StmtHandle) -> Result<()> {
        if handle.is_null() || !self.lock_state().statements.remove(&handle.as_raw()) {
            return Err(Error::Finalized);
        }
        let stmt = NonNull::new(handle.as_raw() as *mut P::Stmt).ok_or(Error::Finalized)?;
        unsafe { self.api.finalize(stmt) }.map_err(|err| self.with_db_state(err))
    }

    pub fn step(&self, handle: StmtHandle) -> Result<StepResult> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.step(stmt) }.map_err(|err| self.with_db_state(err))
    }

    pub fn reset(&self, handle: StmtHandle) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.reset(stmt) }.map_err(|err| self.with_db_state(err))
    }

    pub fn clear_bindings(&self, handle: StmtHandle) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.clear_bindings(stmt) }.map_err(|err| self.with_db_state(err))
    }

    pub fn bind_parameter_count(&self, handle: StmtHandle) -> Result<i32> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.bind_parameter_count(stmt) })
    }

    pub fn column_count(&self, handle: StmtHandle) -> Result<i32> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.column_count(stmt) })
    }

    pub fn column_type(&self, handle: StmtHandle, col: i32) -> Result<ValueType> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.column_type(stmt, col) })
    }

    /// Column text; `None` for SQL NULL.
    pub fn column_text(
        &self,
        handle: StmtHandle,
        col: i32,
        mode: TextMode,
    ) -> Result<Option<TextValue<'static>>> {
        let stmt = self.stmt(handle)?;
        let raw = unsafe { self.api.column_text(stmt, col) };
        if raw.is_null() {
            let db = self.db()?;
            if unsafe { self.api.errcode(db) } & 0xff == SQLITE_NOMEM {
                return Err(Error::OutOfMemory);
            }
            return Ok(None);
        }
        let text = self.codec.decode(unsafe { raw.as_slice() }, mode)?;
        Ok(Some(text.into_owned()))
    }

    /// Column bytes; `None` for SQL NULL, empty for a zero-length blob.
    pub fn column_blob(&self, handle: StmtHandle, col: i32) -> Result<Option<Vec<u8>>> {
        let stmt = self.stmt(handle)?;
        let kind = unsafe { self.api.column_type(stmt, col) };
        if kind == ValueType::Null {
            return Ok(None);
        }
        let raw = unsafe { self.api.column_blob(stmt, col) };
        if raw.is_null() {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(unsafe { raw.as_slice() }.to_vec()))
    }

    pub fn column_double(&self, handle: StmtHandle, col: i32) -> Result<f64> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.column_double(stmt, col) })
    }

    pub fn column_long(&self, handle: StmtHandle, col: i32) -> Result<i64> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.column_int64(stmt, col) })
    }

    pub fn column_int(&self, handle: StmtHandle, col: i32) -> Result<i32> {
        let stmt = self.stmt(handle)?;
        Ok(unsafe { self.api.column_int(stmt, col) })
    }

    pub fn bind_null(&self, handle: StmtHandle, pos: i32) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.bind_null(stmt, pos) }.map_err(|err| self.with_db_state(err))
    }

    pub fn bind_int(&self, handle: StmtHandle, pos: i32, v: i32) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.bind_int(stmt, pos, v) }.map_err(|err| self.with_db_state(err))
    }

    pub fn bind_long(&self, handle: StmtHandle, pos: i32, v: i64) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.bind_int64(stmt, pos, v) }.map_err(|err| self.with_db_state(err))
    }

    pub fn bind_double(&self, handle: StmtHandle, pos: i32, v: f64) -> Result<()> {
        let stmt = self.stmt(handle)?;
        unsafe { self.api.bind_double(stmt, pos, v) }.map_err(|err| self.with_db_state(err))
    }

    /// Bind text encoded with `mode`; `None` binds NULL.
    pub fn bind_text(
        &self,
        handle: StmtHandle,
        pos: i32,
        v: Option<HostText<'_>>,
        mode: TextMode,
    ) -> Result<()> {
        let stmt = self.stmt(handle)?;
        let rc = match v {
            Some(text) => {
                let bytes = self.codec.encode(text, mode)?;
                unsafe { self.api.bind_text(stmt, pos, &bytes) }
            }
            None => unsafe { self.api.bind_null(stmt, pos) },
        };
        rc.map_err(|err| self.with_db_state(err))
    }

    /// Bind bytes; `None` binds NULL.
    pub fn bind_blob(&self, handle: StmtHandle, pos: i32, v: Option<&[u8]>) -> Result<()> {
        let stmt = self.stmt(handle)?;
        let rc = match v {
            Some(bytes) => unsafe { self.api.bind_blob(stmt, pos, bytes) },
            None => unsafe { self.api.bind_null(stmt, pos) },
        };
        rc.map_err(|err| self.with_db_state(err))
    }

    /// Fill in the connection's message and extended code for an engine
    /// error raised by a statement call.
    fn with_db_state(&self, err: Error) -> Error {
        match (err, self.db()) {
            (
                Error::Engine {
                    code,
                    extended,
                    message,
                },
                Ok(db),
            ) => {
                let extended = extended.or_else(|| unsafe { self.api.extended_errcode(db) });
                let message = message.or_else(|| {
                    let raw = unsafe { self.api.errmsg(db) };
                    if raw.is_null() {
                        return None;
                    }
                    Some(String::from_utf8_lossy(unsafe { raw.as_slice() }).into_owned())
                });
                Error::Engine {
                    code,
                    extended,
                    message,
                }
            }
            (err, _) => err,
        }
    }
}
