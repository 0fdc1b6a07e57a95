use super::{NativeDb, StmtHandle};
use crate::codec::{TextMode, TextValue};
use crate::error::Result;
use crate::provider::{ColumnMetadata, RawBytes, Sqlite3Metadata};

impl<'p, P: Sqlite3Metadata> NativeDb<'p, P> {
    fn decode_name(&self, raw: RawBytes, mode: TextMode) -> Result<Option<TextValue<'static>>> {
        if raw.is_null() {
            return Ok(None);
        }
        let text = self.codec.decode(unsafe { raw.as_slice() }, mode)?;
        Ok(Some(text.into_owned()))
    }

    /// Declared type of a result column; `None` for expressions.
    pub fn column_decltype(
        &self,
        handle: StmtHandle,
        col: i32,
        mode: TextMode,
    ) -> Result<Option<TextValue<'static>>> {
        let stmt = self.stmt(handle)?;
        self.decode_name(unsafe { self.api.column_decltype(stmt, col) }, mode)
    }

    pub fn column_table_name(
        &self,
        handle: StmtHandle,
        col: i32,
        mode: TextMode,
    ) -> Result<Option<TextValue<'static>>> {
        let stmt = self.stmt(handle)?;
        self.decode_name(unsafe { self.api.column_table_name(stmt, col) }, mode)
    }

    pub fn column_name(
        &self,
        handle: StmtHandle,
        col: i32,
        mode: TextMode,
    ) -> Result<Option<TextValue<'static>>> {
        let stmt = self.stmt(handle)?;
        self.decode_name(unsafe { self.api.column_name(stmt, col) }, mode)
    }

    /// `[not_null, primary_key, autoinc]` for every result column.
    ///
    /// Columns not backed by a table column report all `false`.
    pub fn column_metadata(&self, handle: StmtHandle) -> Result<Vec<ColumnMetadata>> {
        let stmt = self.stmt(handle)?;
        let db = self.db()?;
        let count = unsafe { self.api.column_count(stmt) };
        let mut out = Vec::with_capacity(count.max(0) as usize);
        for col in 0..count {
            let table = unsafe { self.api.column_table_name(stmt, col) };
            let column = unsafe { self.api.column_origin_name(stmt, col) };
            if table.is_null() || column.is_null() {
                out.push(ColumnMetadata::default());
                continue;
            }
            let schema = unsafe { self.api.column_database_name(stmt, col) };
            let schema = (!schema.is_null()).then(|| unsafe { schema.as_slice() });
            let meta = unsafe {
                self.api
                    .table_column_metadata(db, schema, table.as_slice(), column.as_slice())?
            };
            out.push(meta);
        }
        Ok(out)
    }
}
