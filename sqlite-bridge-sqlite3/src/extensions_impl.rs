use super::*;

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Metadata for LibSqlite3 {
    unsafe fn table_column_metadata(
        &self,
        db: NonNull<Self::Db>,
        db_name: Option<&[u8]>,
        table: &[u8],
        column: &[u8],
    ) -> Result<ColumnMetadata> {
        let func = match self.fns.table_column_metadata {
            Some(func) => func,
            None => {
                return Err(Error::FeatureUnavailable(
                    "table_column_metadata not available",
                ));
            }
        };
        let table = c_string(table, "table")?;
        let column = c_string(column, "column")?;
        let db_name = match db_name {
            Some(name) => Some(c_string(name, "db name")?),
            None => None,
        };
        let mut data_type = null();
        let mut coll_seq = null();
        let mut not_null = 0;
        let mut primary_key = 0;
        let mut autoinc = 0;
        let rc = func(
            db.as_ptr(),
            db_name.as_ref().map(|s| s.as_ptr()).unwrap_or(null()),
            table.as_ptr(),
            column.as_ptr(),
            &mut data_type,
            &mut coll_seq,
            &mut not_null,
            &mut primary_key,
            &mut autoinc,
        );
        if rc != SQLITE_OK {
            return Err(self.error_from_rc(rc, Some(db)));
        }
        Ok(ColumnMetadata {
            not_null: not_null != 0,
            primary_key: primary_key != 0,
            autoinc: autoinc != 0,
        })
    }

    unsafe fn column_decltype(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        raw_bytes_from_cstr((self.fns.column_decltype)(stmt.as_ptr(), col))
    }

    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        raw_bytes_from_cstr((self.fns.column_name)(stmt.as_ptr(), col))
    }

    unsafe fn column_table_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        match self.fns.column_table_name {
            Some(func) => raw_bytes_from_cstr(func(stmt.as_ptr(), col)),
            None => RawBytes::null(),
        }
    }

    unsafe fn column_origin_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        match self.fns.column_origin_name {
            Some(func) => raw_bytes_from_cstr(func(stmt.as_ptr(), col)),
            None => RawBytes::null(),
        }
    }

    unsafe fn column_database_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        match self.fns.column_database_name {
            Some(func) => raw_bytes_from_cstr(func(stmt.as_ptr(), col)),
            None => RawBytes::null(),
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Hooks for LibSqlite3 {
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()> {
        let busy_timeout = match self.fns.busy_timeout {
            Some(busy_timeout) => busy_timeout,
            None => return Err(Error::FeatureUnavailable("busy_timeout not available")),
        };
        let rc = busy_timeout(db.as_ptr(), ms);
        self.check(rc, Some(db))
    }

    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let busy_handler = match self.fns.busy_handler {
            Some(busy_handler) => busy_handler,
            None => return Err(Error::FeatureUnavailable("busy_handler not available")),
        };
        let rc = busy_handler(db.as_ptr(), callback, context);
        self.check(rc, Some(db))
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n: i32,
        callback: Option<ProgressCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let progress = match self.fns.progress_handler {
            Some(progress) => progress,
            None => return Err(Error::FeatureUnavailable("progress_handler not available")),
        };
        progress(db.as_ptr(), n, callback, context);
        Ok(())
    }

    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let update_hook = match self.fns.update_hook {
            Some(update_hook) => update_hook,
            None => return Err(Error::FeatureUnavailable("update_hook not available")),
        };
        update_hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let commit_hook = match self.fns.commit_hook {
            Some(commit_hook) => commit_hook,
            None => return Err(Error::FeatureUnavailable("commit_hook not available")),
        };
        commit_hook(db.as_ptr(), callback, context);
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        let rollback_hook = match self.fns.rollback_hook {
            Some(rollback_hook) => rollback_hook,
            None => return Err(Error::FeatureUnavailable("rollback_hook not available")),
        };
        rollback_hook(db.as_ptr(), callback, context);
        Ok(())
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Backup for LibSqlite3 {
    type Backup = sqlite3_backup;

    unsafe fn backup_init(
        &self,
        dest_db: NonNull<Self::Db>,
        dest_name: &[u8],
        source_db: NonNull<Self::Db>,
        source_name: &[u8],
    ) -> Result<NonNull<Self::Backup>> {
        let backup_init = match self.fns.backup_init {
            Some(backup_init) => backup_init,
            None => return Err(Error::FeatureUnavailable("backup_init not available")),
        };
        let dest_name = c_string(dest_name, "dest name")?;
        let source_name = c_string(source_name, "source name")?;
        let backup = backup_init(
            dest_db.as_ptr(),
            dest_name.as_ptr(),
            source_db.as_ptr(),
            source_name.as_ptr(),
        );
        if let Some(backup) = NonNull::new(backup) {
            Ok(backup)
        } else {
            let rc = (self.fns.errcode)(dest_db.as_ptr());
            Err(self.error_from_rc(rc, Some(dest_db)))
        }
    }

    unsafe fn backup_step(&self, backup: NonNull<Self::Backup>, pages: i32) -> Result<BackupStep> {
        let backup_step = match self.fns.backup_step {
            Some(backup_step) => backup_step,
            None => return Err(Error::FeatureUnavailable("backup_step not available")),
        };
        match backup_step(backup.as_ptr(), pages) {
            SQLITE_OK => Ok(BackupStep::More),
            SQLITE_DONE => Ok(BackupStep::Done),
            rc => Err(self.error_from_rc(rc, None)),
        }
    }

    unsafe fn backup_remaining(&self, backup: NonNull<Self::Backup>) -> i32 {
        self.fns
            .backup_remaining
            .map(|f| f(backup.as_ptr()))
            .unwrap_or(0)
    }

    unsafe fn backup_pagecount(&self, backup: NonNull<Self::Backup>) -> i32 {
        self.fns
            .backup_pagecount
            .map(|f| f(backup.as_ptr()))
            .unwrap_or(0)
    }

    unsafe fn backup_finish(&self, backup: NonNull<Self::Backup>) -> Result<()> {
        let backup_finish = match self.fns.backup_finish {
            Some(backup_finish) => backup_finish,
            None => return Err(Error::FeatureUnavailable("backup_finish not available")),
        };
        let rc = backup_finish(backup.as_ptr());
        self.check(rc, None)
    }

    fn sleep(&self, ms: u32) {
        unsafe { (self.fns.sleep)(ms.min(i32::MAX as u32) as c_int) };
    }
}
