use super::*;

fn drop_registration_user_data(
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
) {
    if let Some(drop_user_data) = drop_user_data {
        drop_user_data(user_data);
    }
}

fn registration_name_or_drop(
    name: &[u8],
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
) -> Result<CString> {
    match CString::new(name) {
        Ok(name) => Ok(name),
        Err(_) => {
            drop_registration_user_data(user_data, drop_user_data);
            Err(Error::misuse("function name contains NUL"))
        }
    }
}

#[allow(unsafe_op_in_unsafe_fn)]
unsafe impl Sqlite3Api for LibSqlite3 {
    type Db = sqlite3;
    type Stmt = sqlite3_stmt;
    type Value = sqlite3_value;
    type Context = sqlite3_context;

    fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "libsqlite3"
    }

    fn libversion(&self) -> &'static [u8] {
        unsafe { raw_cstr((self.fns.libversion)()) }
            .map(CStr::to_bytes)
            .unwrap_or_default()
    }

    unsafe fn open(&self, filename: &[u8], flags: OpenFlags) -> Result<NonNull<Self::Db>> {
        let filename = c_string(filename, "filename")?;
        let mut db = null_mut();
        let rc = (self.fns.open_v2)(filename.as_ptr(), &mut db, map_open_flags(flags), null());
        if rc != SQLITE_OK {
            let err = self.error_from_rc(rc, NonNull::new(db));
            if !db.is_null() {
                let _ = (self.fns.close)(db);
            }
            return Err(err);
        }
        NonNull::new(db).ok_or(Error::OutOfMemory)
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        let rc = (self.fns.close)(db.as_ptr());
        self.check(rc, Some(db))
    }

    unsafe fn extended_result_codes(&self, db: NonNull<Self::Db>, on: bool) -> Result<()> {
        let rc = (self.fns.extended_result_codes)(db.as_ptr(), on as c_int);
        self.check(rc, Some(db))
    }

    unsafe fn prepare_v2(
        &self,
        db: NonNull<Self::Db>,
        sql: &[u8],
    ) -> Result<Option<NonNull<Self::Stmt>>> {
        let mut stmt = null_mut();
        let rc = (self.fns.prepare_v2)(
            db.as_ptr(),
            sql.as_ptr() as *const c_char,
            clamp_len(sql.len()),
            &mut stmt,
            null_mut(),
        );
        if rc != SQLITE_OK {
            return Err(self.error_from_rc(rc, Some(db)));
        }
        Ok(NonNull::new(stmt))
    }

    unsafe fn exec(&self, db: NonNull<Self::Db>, sql: &[u8]) -> Result<()> {
        let sql = c_string(sql, "sql")?;
        let mut errmsg: *mut c_char = null_mut();
        let rc = (self.fns.exec)(db.as_ptr(), sql.as_ptr(), None, null_mut(), &mut errmsg);
        if rc == SQLITE_OK {
            return Ok(());
        }
        let message = raw_cstr(errmsg).map(|c| c.to_string_lossy().into_owned());
        if !errmsg.is_null() {
            (self.fns.free)(errmsg as *mut c_void);
        }
        match message {
            Some(message) => {
                let extended = self.fns.extended_errcode.map(|f| f(db.as_ptr()));
                Err(Error::engine(rc, Some(message), extended))
            }
            None => Err(self.error_from_rc(rc, Some(db))),
        }
    }

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32 {
        (self.fns.errcode)(db.as_ptr())
    }

    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32> {
        self.fns.extended_errcode.map(|f| f(db.as_ptr()))
    }

    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> RawBytes {
        raw_bytes_from_cstr((self.fns.errmsg)(db.as_ptr()))
    }

    unsafe fn interrupt(&self, db: NonNull<Self::Db>) {
        (self.fns.interrupt)(db.as_ptr());
    }

    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64 {
        match self.fns.changes64 {
            Some(changes64) => changes64(db.as_ptr()),
            None => i64::from((self.fns.changes)(db.as_ptr())),
        }
    }

    unsafe fn total_changes(&self, db: NonNull<Self::Db>) -> i64 {
        match self.fns.total_changes64 {
            Some(total_changes64) => total_changes64(db.as_ptr()),
            None => i64::from((self.fns.total_changes)(db.as_ptr())),
        }
    }

    unsafe fn limit(&self, db: NonNull<Self::Db>, id: i32, value: i32) -> i32 {
        (self.fns.limit)(db.as_ptr(), id, value)
    }

    unsafe fn enable_load_extension(&self, db: NonNull<Self::Db>, on: bool) -> Result<()> {
        let enable = match self.fns.enable_load_extension {
            Some(enable) => enable,
            None => {
                return Err(Error::FeatureUnavailable(
                    "enable_load_extension not available",
                ))
            }
        };
        let rc = enable(db.as_ptr(), on as c_int);
        self.check(rc, Some(db))
    }

    unsafe fn enable_shared_cache(&self, on: bool) -> Result<()> {
        let enable = match self.fns.enable_shared_cache {
            Some(enable) => enable,
            None => return Err(Error::FeatureUnavailable("enable_shared_cache not available")),
        };
        let rc = enable(on as c_int);
        self.check(rc, None)
    }

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult> {
        match (self.fns.step)(stmt.as_ptr()) {
            SQLITE_ROW => Ok(StepResult::Row),
            SQLITE_DONE => Ok(StepResult::Done),
            rc => Err(self.error_from_rc(rc, None)),
        }
    }

    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.reset)(stmt.as_ptr());
        self.check(rc, None)
    }

    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.finalize)(stmt.as_ptr());
        self.check(rc, None)
    }

    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        let rc = (self.fns.clear_bindings)(stmt.as_ptr());
        self.check(rc, None)
    }

    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.bind_parameter_count)(stmt.as_ptr())
    }

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()> {
        let rc = (self.fns.bind_null)(stmt.as_ptr(), idx);
        self.check(rc, None)
    }

    unsafe fn bind_int(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i32) -> Result<()> {
        let rc = (self.fns.bind_int)(stmt.as_ptr(), idx, v);
        self.check(rc, None)
    }

    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()> {
        let rc = (self.fns.bind_int64)(stmt.as_ptr(), idx, v);
        self.check(rc, None)
    }

    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()> {
        let rc = (self.fns.bind_double)(stmt.as_ptr(), idx, v);
        self.check(rc, None)
    }

    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v)?;
        let rc = (self.fns.bind_text)(
            stmt.as_ptr(),
            idx,
            ptr as *const c_char,
            clamp_len(v.len()),
            dtor,
        );
        self.check(rc, None)
    }

    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        let (ptr, dtor) = self.alloc_copy(v)?;
        let rc = (self.fns.bind_blob)(stmt.as_ptr(), idx, ptr, clamp_len(v.len()), dtor);
        self.check(rc, None)
    }

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        (self.fns.column_count)(stmt.as_ptr())
    }

    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType {
        ValueType::from_code((self.fns.column_type)(stmt.as_ptr(), col))
    }

    unsafe fn column_int(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i32 {
        (self.fns.column_int)(stmt.as_ptr(), col)
    }

    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64 {
        (self.fns.column_int64)(stmt.as_ptr(), col)
    }

    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64 {
        (self.fns.column_double)(stmt.as_ptr(), col)
    }

    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_text)(stmt.as_ptr(), col) as *const u8;
        if ptr.is_null() {
            return RawBytes::null();
        }
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        RawBytes {
            ptr,
            len: len.max(0) as usize,
        }
    }

    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        let ptr = (self.fns.column_blob)(stmt.as_ptr(), col) as *const u8;
        if ptr.is_null() {
            return RawBytes::null();
        }
        let len = (self.fns.column_bytes)(stmt.as_ptr(), col);
        RawBytes {
            ptr,
            len: len.max(0) as usize,
        }
    }

    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &[u8],
        n_args: i32,
        flags: FunctionFlags,
        x_func: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        let name = registration_name_or_drop(name, user_data, drop_user_data)?;
        // sqlite3_create_function_v2 runs the destructor itself when it fails.
        let rc = (self.fns.create_function_v2)(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_func,
            x_step,
            x_final,
            drop_user_data,
        );
        self.check(rc, Some(db))
    }

    unsafe fn create_window_function(
        &self,
        db: NonNull<Self::Db>,
        name: &[u8],
        n_args: i32,
        flags: FunctionFlags,
        x_step: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        x_final: Option<extern "C" fn(*mut Self::Context)>,
        x_value: Option<extern "C" fn(*mut Self::Context)>,
        x_inverse: Option<extern "C" fn(*mut Self::Context, i32, *mut *mut Self::Value)>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        let create = match self.fns.create_window_function {
            Some(create) => create,
            None => {
                drop_registration_user_data(user_data, drop_user_data);
                return Err(Error::FeatureUnavailable(
                    "create_window_function not available",
                ));
            }
        };
        let name = registration_name_or_drop(name, user_data, drop_user_data)?;
        let rc = create(
            db.as_ptr(),
            name.as_ptr(),
            n_args,
            map_function_flags(flags),
            user_data,
            x_step,
            x_final,
            x_value,
            x_inverse,
            drop_user_data,
        );
        self.check(rc, Some(db))
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        (self.fns.aggregate_context)(ctx.as_ptr(), clamp_len(bytes))
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        match USER_DATA_FN.get() {
            Some(f) => f(ctx.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_null)(ctx.as_ptr());
    }

    unsafe fn result_int(&self, ctx: NonNull<Self::Context>, v: i32) {
        (self.fns.result_int)(ctx.as_ptr(), v);
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        (self.fns.result_int64)(ctx.as_ptr(), v);
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        (self.fns.result_double)(ctx.as_ptr(), v);
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => {
                let len = clamp_len(v.len());
                (self.fns.result_text)(ctx.as_ptr(), ptr as *const c_char, len, dtor);
            }
            Err(_) => (self.fns.result_error_nomem)(ctx.as_ptr()),
        }
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        match self.alloc_copy(v) {
            Ok((ptr, dtor)) => {
                (self.fns.result_blob)(ctx.as_ptr(), ptr, clamp_len(v.len()), dtor);
            }
            Err(_) => (self.fns.result_error_nomem)(ctx.as_ptr()),
        }
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &[u8]) {
        (self.fns.result_error)(ctx.as_ptr(), msg.as_ptr() as *const c_char, clamp_len(msg.len()));
    }

    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        (self.fns.result_error_nomem)(ctx.as_ptr());
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        ValueType::from_code((self.fns.value_type)(v.as_ptr()))
    }

    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32 {
        (self.fns.value_int)(v.as_ptr())
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        (self.fns.value_int64)(v.as_ptr())
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        (self.fns.value_double)(v.as_ptr())
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_text)(v.as_ptr()) as *const u8;
        if ptr.is_null() {
            return RawBytes::null();
        }
        let len = (self.fns.value_bytes)(v.as_ptr());
        RawBytes {
            ptr,
            len: len.max(0) as usize,
        }
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        let ptr = (self.fns.value_blob)(v.as_ptr()) as *const u8;
        if ptr.is_null() {
            return RawBytes::null();
        }
        let len = (self.fns.value_bytes)(v.as_ptr());
        RawBytes {
            ptr,
            len: len.max(0) as usize,
        }
    }
}
