use std::collections::VecDeque;
use std::ffi::{CString, c_char, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use sqlite_bridge::*;

#[derive(Clone, Debug, PartialEq)]
enum MockValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl MockValue {
    fn value_type(&self) -> ValueType {
        match self {
            MockValue::Null => ValueType::Null,
            MockValue::Integer(_) => ValueType::Integer,
            MockValue::Float(_) => ValueType::Float,
            MockValue::Text(_) => ValueType::Text,
            MockValue::Blob(_) => ValueType::Blob,
        }
    }

    fn raw_text(&self) -> RawBytes {
        match self {
            MockValue::Text(text) => RawBytes {
                ptr: text.as_ptr(),
                len: text.len(),
            },
            _ => RawBytes::null(),
        }
    }

    fn raw_blob(&self) -> RawBytes {
        match self {
            MockValue::Blob(bytes) if !bytes.is_empty() => RawBytes {
                ptr: bytes.as_ptr(),
                len: bytes.len(),
            },
            _ => RawBytes::null(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum MockResult {
    Null,
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
    Error(String),
    NoMem,
}

struct MockContext {
    user_data: *mut c_void,
    result: Option<MockResult>,
    agg_storage: Option<Vec<usize>>,
}

impl MockContext {
    fn new(user_data: *mut c_void) -> Self {
        Self {
            user_data,
            result: None,
            agg_storage: None,
        }
    }
}

struct MockStmt {
    rows: Vec<Vec<MockValue>>,
    next_row: usize,
    current_row: Option<usize>,
    binds: Vec<(i32, MockValue)>,
}

impl MockStmt {
    fn current_value(&self, col: i32) -> Option<&MockValue> {
        let row = self.current_row?;
        self.rows.get(row)?.get(col as usize)
    }
}

type ArgsCallback = extern "C" fn(*mut MockContext, i32, *mut *mut MockValue);
type FinalCallback = extern "C" fn(*mut MockContext);

#[allow(dead_code)]
struct FunctionRegistration {
    name: Vec<u8>,
    n_args: i32,
    x_func: Option<ArgsCallback>,
    x_step: Option<ArgsCallback>,
    x_final: Option<FinalCallback>,
    x_value: Option<FinalCallback>,
    x_inverse: Option<ArgsCallback>,
    user_data: *mut c_void,
    destroy: Option<extern "C" fn(*mut c_void)>,
}

impl FunctionRegistration {
    fn release(self) {
        if let Some(destroy) = self.destroy {
            destroy(self.user_data);
        }
    }
}

#[derive(Default)]
struct HookRegistry {
    busy: Option<(BusyCallback, usize)>,
    progress: Option<(ProgressCallback, usize)>,
    update: Option<(UpdateCallback, usize)>,
    commit: Option<(CommitCallback, usize)>,
    rollback: Option<(RollbackCallback, usize)>,
    busy_timeout: Option<i32>,
}

struct MockDb {
    path: Vec<u8>,
    functions: Mutex<Vec<FunctionRegistration>>,
    hooks: Mutex<HookRegistry>,
}

impl MockDb {
    fn function(&self, name: &str) -> Option<usize> {
        self.functions
            .lock()
            .unwrap()
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name.as_bytes()))
    }

    fn with_function<R>(&self, name: &str, f: impl FnOnce(&FunctionRegistration) -> R) -> R {
        let functions = self.functions.lock().unwrap();
        let reg = functions
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name.as_bytes()))
            .expect("function registered");
        f(reg)
    }
}

struct MockBackup {
    remaining: i32,
}

struct MockApi {
    features: FeatureSet,
    calls: AtomicUsize,
    opens: Mutex<Vec<(Vec<u8>, OpenFlags)>>,
    closes: AtomicUsize,
    finalizes: AtomicUsize,
    next_rows: Mutex<Vec<Vec<MockValue>>>,
    exec_status: AtomicI32,
    step_status: AtomicI32,
    fail_rollback_hook: AtomicBool,
    execs: Mutex<Vec<Vec<u8>>>,
    backup_script: Mutex<VecDeque<i32>>,
    backup_inits: Mutex<Vec<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)>>,
    backup_finishes: AtomicUsize,
    sleeps: Mutex<Vec<u32>>,
}

impl MockApi {
    fn new() -> Self {
        Self::with_features(FeatureSet::HOOKS | FeatureSet::BACKUP | FeatureSet::COLUMN_METADATA)
    }

    fn with_features(features: FeatureSet) -> Self {
        Self {
            features,
            calls: AtomicUsize::new(0),
            opens: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            finalizes: AtomicUsize::new(0),
            next_rows: Mutex::new(Vec::new()),
            exec_status: AtomicI32::new(0),
            step_status: AtomicI32::new(0),
            fail_rollback_hook: AtomicBool::new(false),
            execs: Mutex::new(Vec::new()),
            backup_script: Mutex::new(VecDeque::new()),
            backup_inits: Mutex::new(Vec::new()),
            backup_finishes: AtomicUsize::new(0),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn native_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_rows(&self, rows: Vec<Vec<MockValue>>) {
        *self.next_rows.lock().unwrap() = rows;
    }

    fn script_backup(&self, statuses: &[i32]) {
        *self.backup_script.lock().unwrap() = statuses.iter().copied().collect();
    }

    fn sleep_count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }

    fn engine_error(code: i32) -> Error {
        Error::engine(code, Some(format!("mock status {}", code)), Some(code))
    }
}

unsafe impl Sqlite3Api for MockApi {
    type Db = MockDb;
    type Stmt = MockStmt;
    type Value = MockValue;
    type Context = MockContext;

    fn api_version(&self) -> ApiVersion {
        ApiVersion::new(3, 44, 0)
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn libversion(&self) -> &'static [u8] {
        b"3.44.0"
    }

    unsafe fn open(&self, filename: &[u8], flags: OpenFlags) -> Result<NonNull<Self::Db>> {
        self.hit();
        self.opens.lock().unwrap().push((filename.to_vec(), flags));
        let db = Box::new(MockDb {
            path: filename.to_vec(),
            functions: Mutex::new(Vec::new()),
            hooks: Mutex::new(HookRegistry::default()),
        });
        Ok(NonNull::from(Box::leak(db)))
    }

    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()> {
        self.hit();
        self.closes.fetch_add(1, Ordering::SeqCst);
        let db = unsafe { Box::from_raw(db.as_ptr()) };
        let functions = std::mem::take(&mut *db.functions.lock().unwrap());
        for reg in functions {
            reg.release();
        }
        Ok(())
    }

    unsafe fn extended_result_codes(&self, _db: NonNull<Self::Db>, _on: bool) -> Result<()> {
        self.hit();
        Ok(())
    }

    unsafe fn prepare_v2(
        &self,
        _db: NonNull<Self::Db>,
        sql: &[u8],
    ) -> Result<Option<NonNull<Self::Stmt>>> {
        self.hit();
        if sql.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        let rows = std::mem::take(&mut *self.next_rows.lock().unwrap());
        let stmt = Box::new(MockStmt {
            rows,
            next_row: 0,
            current_row: None,
            binds: Vec::new(),
        });
        Ok(Some(NonNull::from(Box::leak(stmt))))
    }

    unsafe fn exec(&self, _db: NonNull<Self::Db>, sql: &[u8]) -> Result<()> {
        self.hit();
        self.execs.lock().unwrap().push(sql.to_vec());
        match self.exec_status.load(Ordering::SeqCst) {
            0 => Ok(()),
            code => Err(Self::engine_error(code)),
        }
    }

    unsafe fn errcode(&self, _db: NonNull<Self::Db>) -> i32 {
        self.hit();
        self.exec_status.load(Ordering::SeqCst) & 0xff
    }

    unsafe fn extended_errcode(&self, _db: NonNull<Self::Db>) -> Option<i32> {
        self.hit();
        Some(self.exec_status.load(Ordering::SeqCst))
    }

    unsafe fn errmsg(&self, _db: NonNull<Self::Db>) -> RawBytes {
        self.hit();
        let msg: &'static [u8] = b"mock error";
        RawBytes {
            ptr: msg.as_ptr(),
            len: msg.len(),
        }
    }

    unsafe fn interrupt(&self, _db: NonNull<Self::Db>) {
        self.hit();
    }

    unsafe fn changes(&self, _db: NonNull<Self::Db>) -> i64 {
        self.hit();
        1
    }

    unsafe fn total_changes(&self, _db: NonNull<Self::Db>) -> i64 {
        self.hit();
        7
    }

    unsafe fn limit(&self, _db: NonNull<Self::Db>, _id: i32, _value: i32) -> i32 {
        self.hit();
        1000
    }

    unsafe fn enable_load_extension(&self, _db: NonNull<Self::Db>, _on: bool) -> Result<()> {
        self.hit();
        Err(Error::FeatureUnavailable("load_extension not available"))
    }

    unsafe fn enable_shared_cache(&self, _on: bool) -> Result<()> {
        self.hit();
        Ok(())
    }

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult> {
        self.hit();
        let status = self.step_status.load(Ordering::SeqCst);
        if status != 0 {
            return Err(Error::engine(status, None, None));
        }
        let stmt = unsafe { &mut *stmt.as_ptr() };
        if stmt.next_row < stmt.rows.len() {
            stmt.current_row = Some(stmt.next_row);
            stmt.next_row += 1;
            Ok(StepResult::Row)
        } else {
            stmt.current_row = None;
            Ok(StepResult::Done)
        }
    }

    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.hit();
        let stmt = unsafe { &mut *stmt.as_ptr() };
        stmt.next_row = 0;
        stmt.current_row = None;
        Ok(())
    }

    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.hit();
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(stmt.as_ptr()) });
        Ok(())
    }

    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.clear() };
        Ok(())
    }

    unsafe fn bind_parameter_count(&self, _stmt: NonNull<Self::Stmt>) -> i32 {
        self.hit();
        3
    }

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Null)) };
        Ok(())
    }

    unsafe fn bind_int(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i32) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Integer(i64::from(v)))) };
        Ok(())
    }

    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Integer(v))) };
        Ok(())
    }

    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Float(v))) };
        Ok(())
    }

    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        self.hit();
        let text = String::from_utf8_lossy(v).into_owned();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Text(text))) };
        Ok(())
    }

    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()> {
        self.hit();
        unsafe { (*stmt.as_ptr()).binds.push((idx, MockValue::Blob(v.to_vec()))) };
        Ok(())
    }

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32 {
        self.hit();
        let stmt = unsafe { &*stmt.as_ptr() };
        stmt.rows.first().map(|row| row.len() as i32).unwrap_or(0)
    }

    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType {
        self.hit();
        let stmt = unsafe { &*stmt.as_ptr() };
        stmt.current_value(col)
            .map(MockValue::value_type)
            .unwrap_or(ValueType::Null)
    }

    unsafe fn column_int(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i32 {
        unsafe { self.column_int64(stmt, col) as i32 }
    }

    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64 {
        self.hit();
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Integer(v)) => *v,
            Some(MockValue::Float(v)) => *v as i64,
            _ => 0,
        }
    }

    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64 {
        self.hit();
        match unsafe { (*stmt.as_ptr()).current_value(col) } {
            Some(MockValue::Float(v)) => *v,
            Some(MockValue::Integer(v)) => *v as f64,
            _ => 0.0,
        }
    }

    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        self.hit();
        unsafe { (*stmt.as_ptr()).current_value(col) }
            .map(MockValue::raw_text)
            .unwrap_or(RawBytes::null())
    }

    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        self.hit();
        unsafe { (*stmt.as_ptr()).current_value(col) }
            .map(MockValue::raw_blob)
            .unwrap_or(RawBytes::null())
    }

    unsafe fn create_function_v2(
        &self,
        db: NonNull<Self::Db>,
        name: &[u8],
        n_args: i32,
        _flags: FunctionFlags,
        x_func: Option<ArgsCallback>,
        x_step: Option<ArgsCallback>,
        x_final: Option<FinalCallback>,
        user_data: *mut c_void,
        destroy: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        self.hit();
        let db = unsafe { &*db.as_ptr() };
        let registration = FunctionRegistration {
            name: name.to_vec(),
            n_args,
            x_func,
            x_step,
            x_final,
            x_value: None,
            x_inverse: None,
            user_data,
            destroy,
        };
        replace_function(db, registration);
        Ok(())
    }

    unsafe fn create_window_function(
        &self,
        db: NonNull<Self::Db>,
        name: &[u8],
        n_args: i32,
        _flags: FunctionFlags,
        x_step: Option<ArgsCallback>,
        x_final: Option<FinalCallback>,
        x_value: Option<FinalCallback>,
        x_inverse: Option<ArgsCallback>,
        user_data: *mut c_void,
        destroy: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        self.hit();
        let db = unsafe { &*db.as_ptr() };
        let registration = FunctionRegistration {
            name: name.to_vec(),
            n_args,
            x_func: None,
            x_step,
            x_final,
            x_value,
            x_inverse,
            user_data,
            destroy,
        };
        replace_function(db, registration);
        Ok(())
    }

    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void {
        let ctx = unsafe { &mut *ctx.as_ptr() };
        if ctx.agg_storage.is_none() {
            if bytes == 0 {
                return std::ptr::null_mut();
            }
            let words = bytes.div_ceil(std::mem::size_of::<usize>());
            ctx.agg_storage = Some(vec![0usize; words]);
        }
        ctx.agg_storage
            .as_mut()
            .map(|storage| storage.as_mut_ptr() as *mut c_void)
            .unwrap_or(std::ptr::null_mut())
    }

    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void {
        unsafe { (*ctx.as_ptr()).user_data }
    }

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Null) };
    }

    unsafe fn result_int(&self, ctx: NonNull<Self::Context>, v: i32) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Integer(i64::from(v))) };
    }

    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Integer(v)) };
    }

    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Float(v)) };
    }

    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Text(v.to_vec())) };
    }

    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Blob(v.to_vec())) };
    }

    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &[u8]) {
        let msg = String::from_utf8_lossy(msg).into_owned();
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::Error(msg)) };
    }

    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>) {
        unsafe { (*ctx.as_ptr()).result = Some(MockResult::NoMem) };
    }

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType {
        unsafe { v.as_ref() }.value_type()
    }

    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32 {
        unsafe { self.value_int64(v) as i32 }
    }

    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64 {
        match unsafe { v.as_ref() } {
            MockValue::Integer(v) => *v,
            MockValue::Float(v) => *v as i64,
            _ => 0,
        }
    }

    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64 {
        match unsafe { v.as_ref() } {
            MockValue::Float(v) => *v,
            MockValue::Integer(v) => *v as f64,
            _ => 0.0,
        }
    }

    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes {
        unsafe { v.as_ref() }.raw_text()
    }

    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes {
        unsafe { v.as_ref() }.raw_blob()
    }
}

/// Engine semantics: a new definition replaces (and destroys) the old one;
/// a definition without callbacks only deletes.
fn replace_function(db: &MockDb, registration: FunctionRegistration) {
    let removed = {
        let mut functions = db.functions.lock().unwrap();
        let position = functions.iter().position(|f| {
            f.n_args == registration.n_args && f.name.eq_ignore_ascii_case(&registration.name)
        });
        let removed = position.map(|idx| functions.remove(idx));
        let deletes = registration.x_func.is_none()
            && registration.x_step.is_none()
            && registration.x_final.is_none();
        if !deletes {
            functions.push(registration);
        }
        removed
    };
    if let Some(old) = removed {
        old.release();
    }
}

unsafe impl Sqlite3Hooks for MockApi {
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()> {
        self.hit();
        let mut hooks = unsafe { db.as_ref() }.hooks.lock().unwrap();
        hooks.busy = None;
        hooks.busy_timeout = Some(ms);
        Ok(())
    }

    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        self.hit();
        unsafe { db.as_ref() }.hooks.lock().unwrap().busy =
            callback.map(|cb| (cb, context as usize));
        Ok(())
    }

    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        _n: i32,
        callback: Option<ProgressCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        self.hit();
        unsafe { db.as_ref() }.hooks.lock().unwrap().progress =
            callback.map(|cb| (cb, context as usize));
        Ok(())
    }

    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        self.hit();
        unsafe { db.as_ref() }.hooks.lock().unwrap().update =
            callback.map(|cb| (cb, context as usize));
        Ok(())
    }

    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        self.hit();
        unsafe { db.as_ref() }.hooks.lock().unwrap().commit =
            callback.map(|cb| (cb, context as usize));
        Ok(())
    }

    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()> {
        self.hit();
        if self.fail_rollback_hook.load(Ordering::SeqCst) {
            return Err(Self::engine_error(1));
        }
        unsafe { db.as_ref() }.hooks.lock().unwrap().rollback =
            callback.map(|cb| (cb, context as usize));
        Ok(())
    }
}

unsafe impl Sqlite3Backup for MockApi {
    type Backup = MockBackup;

    unsafe fn backup_init(
        &self,
        dest_db: NonNull<Self::Db>,
        dest_name: &[u8],
        source_db: NonNull<Self::Db>,
        source_name: &[u8],
    ) -> Result<NonNull<Self::Backup>> {
        self.hit();
        let dest_path = unsafe { dest_db.as_ref() }.path.clone();
        let source_path = unsafe { source_db.as_ref() }.path.clone();
        self.backup_inits.lock().unwrap().push((
            dest_path,
            dest_name.to_vec(),
            source_path,
            source_name.to_vec(),
        ));
        let remaining = self.backup_script.lock().unwrap().len() as i32;
        Ok(NonNull::from(Box::leak(Box::new(MockBackup { remaining }))))
    }

    unsafe fn backup_step(&self, backup: NonNull<Self::Backup>, _pages: i32) -> Result<BackupStep> {
        self.hit();
        let backup = unsafe { &mut *backup.as_ptr() };
        backup.remaining = (backup.remaining - 1).max(0);
        match self.backup_script.lock().unwrap().pop_front().unwrap_or(101) {
            0 => Ok(BackupStep::More),
            101 => Ok(BackupStep::Done),
            code => Err(Self::engine_error(code)),
        }
    }

    unsafe fn backup_remaining(&self, backup: NonNull<Self::Backup>) -> i32 {
        unsafe { backup.as_ref() }.remaining
    }

    unsafe fn backup_pagecount(&self, _backup: NonNull<Self::Backup>) -> i32 {
        10
    }

    unsafe fn backup_finish(&self, backup: NonNull<Self::Backup>) -> Result<()> {
        self.hit();
        self.backup_finishes.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(backup.as_ptr()) });
        Ok(())
    }

    fn sleep(&self, ms: u32) {
        self.sleeps.lock().unwrap().push(ms);
    }
}

unsafe impl Sqlite3Metadata for MockApi {
    unsafe fn table_column_metadata(
        &self,
        _db: NonNull<Self::Db>,
        db_name: Option<&[u8]>,
        table: &[u8],
        column: &[u8],
    ) -> Result<ColumnMetadata> {
        self.hit();
        assert_eq!(db_name, Some(&b"main"[..]));
        assert_eq!(table, b"t");
        assert_eq!(column, b"id");
        Ok(ColumnMetadata {
            not_null: true,
            primary_key: true,
            autoinc: true,
        })
    }

    unsafe fn column_decltype(&self, _stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        static_text(if col == 0 { Some(b"INTEGER") } else { None })
    }

    unsafe fn column_name(&self, _stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        static_text(Some(if col == 0 { b"id" } else { b"x2" }))
    }

    unsafe fn column_table_name(&self, _stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        static_text(if col == 0 { Some(b"t") } else { None })
    }

    unsafe fn column_origin_name(&self, _stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        static_text(if col == 0 { Some(b"id") } else { None })
    }

    unsafe fn column_database_name(&self, _stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes {
        static_text(if col == 0 { Some(b"main") } else { None })
    }
}

fn static_text<const N: usize>(text: Option<&'static [u8; N]>) -> RawBytes {
    match text {
        Some(text) => RawBytes {
            ptr: text.as_ptr(),
            len: N,
        },
        None => RawBytes::null(),
    }
}

fn utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

fn open_conn(api: &MockApi) -> NativeDb<'_, MockApi> {
    let db = NativeDb::with_config(api, LocalRuntime::new(), BridgeConfig::default());
    db.open(
        HostText::Bytes(b"test.db"),
        OpenFlags::READ_WRITE | OpenFlags::CREATE,
        TextMode::Array,
    )
    .unwrap();
    db
}

fn mock_db<'a>(db: &NativeDb<'a, MockApi>) -> &'a MockDb {
    unsafe { &*(db.handle() as *const MockDb) }
}

fn invoke_args(cb: ArgsCallback, ctx: &mut MockContext, args: &mut [MockValue]) {
    let mut argv: Vec<*mut MockValue> = args.iter_mut().map(|v| v as *mut MockValue).collect();
    cb(ctx, argv.len() as i32, argv.as_mut_ptr());
}

struct AddOne;

impl FunctionBody<MockApi> for AddOne {
    fn x_func(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        let v = call.value_long(0)?;
        call.result_long(v + 1)?;
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    clones: AtomicUsize,
    releases: AtomicUsize,
}

struct Sum {
    counters: Arc<Counters>,
    total: Mutex<i64>,
    is_clone: bool,
}

impl Sum {
    fn prototype(counters: &Arc<Counters>) -> Self {
        Self {
            counters: Arc::clone(counters),
            total: Mutex::new(0),
            is_clone: false,
        }
    }
}

impl Drop for Sum {
    fn drop(&mut self) {
        if self.is_clone {
            self.counters.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl FunctionBody<MockApi> for Sum {
    fn x_step(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        *self.total.lock().unwrap() += call.value_long(0)?;
        Ok(())
    }

    fn x_inverse(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        *self.total.lock().unwrap() -= call.value_long(0)?;
        Ok(())
    }

    fn x_value(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        call.result_long(*self.total.lock().unwrap())?;
        Ok(())
    }

    fn x_final(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        call.result_long(*self.total.lock().unwrap())?;
        Ok(())
    }

    fn clone_body(&self) -> HostResult<Box<dyn FunctionBody<MockApi>>> {
        self.counters.clones.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Sum {
            counters: Arc::clone(&self.counters),
            total: Mutex::new(0),
            is_clone: true,
        }))
    }
}

#[test]
fn closed_connection_makes_no_native_calls() {
    let api = MockApi::new();
    let db = NativeDb::new(&api, LocalRuntime::new());
    assert!(!db.is_open());
    assert!(matches!(
        db.prepare(HostText::Bytes(b"select 1"), TextMode::Array),
        Err(Error::Closed)
    ));
    assert!(matches!(
        db.exec(HostText::Bytes(b"select 1"), TextMode::Array),
        Err(Error::Closed)
    ));
    assert!(matches!(db.changes(), Err(Error::Closed)));
    assert!(matches!(db.errcode(), Err(Error::Closed)));
    assert!(matches!(db.interrupt(), Err(Error::Closed)));
    assert!(matches!(db.busy_timeout(10), Err(Error::Closed)));
    assert!(matches!(
        db.backup(
            HostText::Bytes(b"main"),
            HostText::Bytes(b"out.db"),
            None,
            TextMode::Array
        ),
        Err(Error::Closed)
    ));
    assert!(matches!(db.step(StmtHandle::NULL), Err(Error::Finalized)));
    assert!(matches!(db.finalize(StmtHandle::NULL), Err(Error::Finalized)));
    assert!(db.close().is_ok());
    assert_eq!(api.native_calls(), 0);
}

#[test]
fn unknown_statement_handle_makes_no_native_call() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let before = api.native_calls();
    let bogus = StmtHandle::from_raw(0xdead_0000);
    assert!(matches!(db.step(bogus), Err(Error::Finalized)));
    assert!(matches!(db.column_count(bogus), Err(Error::Finalized)));
    assert!(matches!(db.bind_int(bogus, 1, 1), Err(Error::Finalized)));
    assert_eq!(api.native_calls(), before);
}

#[test]
fn close_is_idempotent() {
    let api = MockApi::new();
    let db = open_conn(&api);
    assert!(db.is_open());
    db.close().unwrap();
    assert_eq!(db.handle(), 0);
    db.close().unwrap();
    drop(db);
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn reopen_while_open_closes_and_fails() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let err = db
        .open(HostText::Bytes(b"other.db"), OpenFlags::READ_ONLY, TextMode::Array)
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyOpen));
    assert!(!db.is_open());
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
    assert_eq!(api.opens.lock().unwrap().len(), 1);
}

#[test]
fn open_encodes_path_per_mode() {
    let api = MockApi::new();
    let db = NativeDb::new(&api, LocalRuntime::new());
    let path = utf16("caf\u{e9}.db");
    db.open(HostText::Utf16(&path), OpenFlags::READ_WRITE, TextMode::StringCutf8)
        .unwrap();
    let opens = api.opens.lock().unwrap();
    assert_eq!(opens[0].0, "caf\u{e9}.db".as_bytes());
}

#[test]
fn finalize_twice_reports_finalized() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let stmt = db
        .prepare(HostText::Bytes(b"select 1"), TextMode::Array)
        .unwrap();
    assert!(!stmt.is_null());
    assert_eq!(db.open_statements(), 1);
    db.finalize(stmt).unwrap();
    assert!(matches!(db.finalize(stmt), Err(Error::Finalized)));
    assert!(matches!(db.step(stmt), Err(Error::Finalized)));
    assert_eq!(api.finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(db.open_statements(), 0);
}

#[test]
fn empty_sql_prepares_null_handle() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let stmt = db.prepare(HostText::Bytes(b"   "), TextMode::Array).unwrap();
    assert!(stmt.is_null());
    assert_eq!(db.open_statements(), 0);
}

#[test]
fn close_finalizes_outstanding_statements() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let a = db.prepare(HostText::Bytes(b"select 1"), TextMode::Array).unwrap();
    let _b = db.prepare(HostText::Bytes(b"select 2"), TextMode::Array).unwrap();
    db.close().unwrap();
    assert_eq!(api.finalizes.load(Ordering::SeqCst), 2);
    assert!(matches!(db.step(a), Err(Error::Finalized)));
}

#[test]
fn exec_error_keeps_extended_code() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.exec_status.store(2067, Ordering::SeqCst);
    let err = db
        .exec(HostText::Bytes(b"insert into t values (1)"), TextMode::Array)
        .unwrap_err();
    assert_eq!(err.raw_code(), Some(2067));
    assert_eq!(err.code(), ErrorCode::Constraint);
    assert_eq!(db.errcode().unwrap(), 2067);
    let msg = db.errmsg(TextMode::StringCesu8).unwrap().unwrap();
    assert_eq!(msg.as_utf16(), Some(utf16("mock error").as_slice()));
}

#[test]
fn step_error_carries_connection_message() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let stmt = db
        .prepare(HostText::Bytes(b"insert into t values (1)"), TextMode::Array)
        .unwrap();
    api.step_status.store(1555, Ordering::SeqCst);
    api.exec_status.store(1555, Ordering::SeqCst);
    let err = db.step(stmt).unwrap_err();
    match &err {
        Error::Engine {
            code,
            extended,
            message,
        } => {
            assert_eq!(*code, 1555);
            assert_eq!(*extended, Some(1555));
            assert_eq!(message.as_deref(), Some("mock error"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.code(), ErrorCode::Constraint);
    assert!(err.to_string().contains("mock error"));
}

#[test]
fn out_of_memory_status_is_not_an_engine_error() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.exec_status.store(7, Ordering::SeqCst);
    let err = db
        .exec(HostText::Bytes(b"select 1"), TextMode::Array)
        .unwrap_err();
    assert!(matches!(err, Error::OutOfMemory));
}

#[test]
fn column_reads_distinguish_null_and_empty_blob() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.set_rows(vec![vec![
        MockValue::Blob(Vec::new()),
        MockValue::Null,
        MockValue::Blob(vec![1, 2, 3]),
    ]]);
    let stmt = db.prepare(HostText::Bytes(b"select b"), TextMode::Array).unwrap();
    assert_eq!(db.step(stmt).unwrap(), StepResult::Row);
    assert_eq!(db.column_count(stmt).unwrap(), 3);
    assert_eq!(db.column_type(stmt, 0).unwrap(), ValueType::Blob);
    assert_eq!(db.column_blob(stmt, 0).unwrap(), Some(Vec::new()));
    assert_eq!(db.column_type(stmt, 1).unwrap(), ValueType::Null);
    assert_eq!(db.column_blob(stmt, 1).unwrap(), None);
    assert_eq!(db.column_blob(stmt, 2).unwrap(), Some(vec![1, 2, 3]));
    assert_eq!(db.step(stmt).unwrap(), StepResult::Done);
}

#[test]
fn column_text_decodes_per_mode() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.set_rows(vec![vec![
        MockValue::Text("h\u{e9}llo".to_string()),
        MockValue::Null,
        MockValue::Integer(42),
        MockValue::Float(1.5),
    ]]);
    let stmt = db.prepare(HostText::Bytes(b"select s"), TextMode::Array).unwrap();
    db.step(stmt).unwrap();
    let text = db.column_text(stmt, 0, TextMode::StringCutf8).unwrap().unwrap();
    assert_eq!(text.as_utf16(), Some(utf16("h\u{e9}llo").as_slice()));
    let raw = db.column_text(stmt, 0, TextMode::Array).unwrap().unwrap();
    assert_eq!(raw.as_bytes(), Some("h\u{e9}llo".as_bytes()));
    let buffered = db.column_text(stmt, 0, TextMode::Buffer).unwrap().unwrap();
    assert_eq!(buffered.as_bytes(), Some("h\u{e9}llo".as_bytes()));
    assert_eq!(db.column_text(stmt, 1, TextMode::StringCesu8).unwrap(), None);
    assert_eq!(db.column_long(stmt, 2).unwrap(), 42);
    assert_eq!(db.column_int(stmt, 2).unwrap(), 42);
    assert_eq!(db.column_double(stmt, 3).unwrap(), 1.5);
}

#[test]
fn binds_reach_the_statement() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let stmt = db
        .prepare(HostText::Bytes(b"insert into t values (?, ?, ?)"), TextMode::Array)
        .unwrap();
    assert_eq!(db.bind_parameter_count(stmt).unwrap(), 3);
    let word = utf16("w\u{f6}rd");
    db.bind_text(stmt, 1, Some(HostText::Utf16(&word)), TextMode::StringCutf8)
        .unwrap();
    db.bind_blob(stmt, 2, None).unwrap();
    db.bind_long(stmt, 3, i64::MAX).unwrap();
    db.bind_double(stmt, 4, 0.25).unwrap();
    db.bind_text(stmt, 5, None, TextMode::StringCutf8).unwrap();
    let binds = unsafe { &(*(stmt.as_raw() as *const MockStmt)).binds };
    assert_eq!(
        binds,
        &vec![
            (1, MockValue::Text("w\u{f6}rd".to_string())),
            (2, MockValue::Null),
            (3, MockValue::Integer(i64::MAX)),
            (4, MockValue::Float(0.25)),
            (5, MockValue::Null),
        ]
    );
    db.clear_bindings(stmt).unwrap();
    db.reset(stmt).unwrap();
}

#[test]
fn bad_surrogate_fails_before_native_bind() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let stmt = db.prepare(HostText::Bytes(b"select ?"), TextMode::Array).unwrap();
    let before = api.native_calls();
    let lone = [0x61, 0xD800];
    let err = db
        .bind_text(stmt, 1, Some(HostText::Utf16(&lone)), TextMode::StringCutf8)
        .unwrap_err();
    assert!(matches!(err, Error::BadEncoding { offset: 1, .. }));
    assert_eq!(api.native_calls(), before);
}

#[test]
fn libversion_decodes_per_mode() {
    let api = MockApi::new();
    let version = NativeDb::<MockApi>::libversion(&api, TextMode::StringCesu8).unwrap();
    assert_eq!(version.to_string_lossy(), "3.44.0");
    let bytes = NativeDb::<MockApi>::libversion(&api, TextMode::Array).unwrap();
    assert_eq!(bytes.as_bytes(), Some(&b"3.44.0"[..]));
}

#[test]
fn connection_counters_pass_through() {
    let api = MockApi::new();
    let db = open_conn(&api);
    assert_eq!(db.changes().unwrap(), 1);
    assert_eq!(db.total_changes().unwrap(), 7);
    assert_eq!(db.limit(0, -1).unwrap(), 1000);
    db.shared_cache(true).unwrap();
    assert!(matches!(
        db.enable_load_extension(true),
        Err(Error::FeatureUnavailable(_))
    ));
}

#[test]
fn column_metadata_covers_expression_columns() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.set_rows(vec![vec![MockValue::Integer(1), MockValue::Integer(2)]]);
    let stmt = db
        .prepare(HostText::Bytes(b"select id, id * 2 from t"), TextMode::Array)
        .unwrap();
    let meta = db.column_metadata(stmt).unwrap();
    assert_eq!(
        meta,
        vec![
            ColumnMetadata {
                not_null: true,
                primary_key: true,
                autoinc: true,
            },
            ColumnMetadata::default(),
        ]
    );
    let decl = db.column_decltype(stmt, 0, TextMode::Array).unwrap().unwrap();
    assert_eq!(decl.as_bytes(), Some(&b"INTEGER"[..]));
    assert_eq!(db.column_decltype(stmt, 1, TextMode::Array).unwrap(), None);
    let table = db.column_table_name(stmt, 0, TextMode::StringCesu8).unwrap().unwrap();
    assert_eq!(table.to_string_lossy(), "t");
    let name = db.column_name(stmt, 1, TextMode::StringCutf8).unwrap().unwrap();
    assert_eq!(name.to_string_lossy(), "x2");
}

#[test]
fn scalar_function_round_trip_and_cleared_context() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let function = Function::scalar(AddOne);
    db.create_function(
        HostText::Bytes(b"add_one"),
        Arc::clone(&function),
        1,
        FunctionFlags::DETERMINISTIC,
        TextMode::Array,
    )
    .unwrap();
    assert_eq!(db.registered_functions(), 1);

    let (x_func, user_data) =
        mock_db(&db).with_function("add_one", |reg| (reg.x_func.unwrap(), reg.user_data));
    let mut ctx = MockContext::new(user_data);
    invoke_args(x_func, &mut ctx, &mut [MockValue::Integer(41)]);
    assert_eq!(ctx.result, Some(MockResult::Integer(42)));

    let call = function.call_context();
    assert!(!call.is_armed());
    assert_eq!(call.context(), 0);
    assert_eq!(call.value(), 0);
    assert_eq!(call.args(), 0);
}

struct Interleaved {
    both_armed: Barrier,
    first_returned: Arc<Barrier>,
}

impl FunctionBody<MockApi> for Interleaved {
    fn x_func(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        let v = call.value_long(0)?;
        self.both_armed.wait();
        if v == 2 {
            self.first_returned.wait();
            assert_eq!(call.args(), 1);
            assert_eq!(call.value_long(0)?, 2);
        }
        call.result_long(v * 10)?;
        Ok(())
    }
}

#[test]
fn overlapping_invocations_keep_their_own_context() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let first_returned = Arc::new(Barrier::new(2));
    let function = Function::scalar(Interleaved {
        both_armed: Barrier::new(2),
        first_returned: Arc::clone(&first_returned),
    });
    db.create_function(
        HostText::Bytes(b"interleaved"),
        Arc::clone(&function),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_func, user_data) = mock_db(&db).with_function("interleaved", |reg| {
        (reg.x_func.unwrap(), reg.user_data as usize)
    });

    let run = move |arg: i64, after: Option<Arc<Barrier>>| {
        std::thread::spawn(move || {
            let mut ctx = MockContext::new(user_data as *mut c_void);
            invoke_args(x_func, &mut ctx, &mut [MockValue::Integer(arg)]);
            if let Some(barrier) = after {
                barrier.wait();
            }
            ctx.result
        })
    };
    let first = run(1, Some(Arc::clone(&first_returned)));
    let second = run(2, None);
    assert_eq!(first.join().unwrap(), Some(MockResult::Integer(10)));
    assert_eq!(second.join().unwrap(), Some(MockResult::Integer(20)));

    let call = function.call_context();
    assert!(!call.is_armed());
    assert_eq!(call.context(), 0);
    assert_eq!(call.value(), 0);
    assert_eq!(call.args(), 0);
}

struct ArgRecorder {
    seen: Mutex<Vec<String>>,
}

impl FunctionBody<MockApi> for ArgRecorder {
    fn x_func(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
        let mut seen = self.seen.lock().unwrap();
        assert!(call.call_context().is_armed());
        for arg in [-1, 0, 1, 2] {
            let entry = match call.value_text(arg, TextMode::StringCesu8) {
                Ok(Some(text)) => text.to_string_lossy(),
                Ok(None) => "null".to_string(),
                Err(Error::Misuse(msg)) => msg,
                Err(other) => other.to_string(),
            };
            seen.push(entry);
        }
        seen.push(format!("{:?}", call.value_blob(1)?));
        call.result_text(Some(HostText::Bytes(b"ok")), TextMode::Array)?;
        Ok(())
    }
}

#[test]
fn argument_access_checks_bounds() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let recorder = Arc::new(ArgRecorder {
        seen: Mutex::new(Vec::new()),
    });
    struct Shared(Arc<ArgRecorder>);
    impl FunctionBody<MockApi> for Shared {
        fn x_func(&self, call: &Call<'_, MockApi>) -> HostResult<()> {
            self.0.x_func(call)
        }
    }
    db.create_function(
        HostText::Bytes(b"recorder"),
        Function::scalar(Shared(Arc::clone(&recorder))),
        -1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_func, user_data) =
        mock_db(&db).with_function("recorder", |reg| (reg.x_func.unwrap(), reg.user_data));
    let mut ctx = MockContext::new(user_data);
    invoke_args(
        x_func,
        &mut ctx,
        &mut [MockValue::Text("abc".to_string()), MockValue::Null],
    );
    assert_eq!(ctx.result, Some(MockResult::Text(b"ok".to_vec())));
    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![
            "negative arg out of range".to_string(),
            "abc".to_string(),
            "null".to_string(),
            "arg out of range".to_string(),
            "None".to_string(),
        ]
    );
}

struct Fails(Option<&'static str>);

impl FunctionBody<MockApi> for Fails {
    fn x_func(&self, _call: &Call<'_, MockApi>) -> HostResult<()> {
        match self.0 {
            Some(msg) => Err(HostException::new(msg)),
            None => Err(HostException::opaque()),
        }
    }
}

struct Panics;

impl FunctionBody<MockApi> for Panics {
    fn x_func(&self, _call: &Call<'_, MockApi>) -> HostResult<()> {
        panic!("boom");
    }
}

fn run_scalar(body: impl FunctionBody<MockApi>) -> (Option<MockResult>, Arc<Function<MockApi>>) {
    let api = MockApi::new();
    let db = open_conn(&api);
    let function = Function::scalar(body);
    db.create_function(
        HostText::Bytes(b"f"),
        Arc::clone(&function),
        0,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_func, user_data) =
        mock_db(&db).with_function("f", |reg| (reg.x_func.unwrap(), reg.user_data));
    let mut ctx = MockContext::new(user_data);
    invoke_args(x_func, &mut ctx, &mut []);
    (ctx.result, function)
}

#[test]
fn host_exception_becomes_result_error() {
    let (result, function) = run_scalar(Fails(Some("bad input")));
    assert_eq!(result, Some(MockResult::Error("bad input".to_string())));
    assert!(!function.call_context().is_armed());
}

#[test]
fn exception_without_description_reports_nomem() {
    let (result, _) = run_scalar(Fails(None));
    assert_eq!(result, Some(MockResult::NoMem));
}

#[test]
fn panic_in_function_is_contained() {
    let (result, function) = run_scalar(Panics);
    assert_eq!(
        result,
        Some(MockResult::Error("panic in user-defined function".to_string()))
    );
    assert!(!function.call_context().is_armed());
}

#[test]
fn aggregate_group_without_rows_clones_once() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let counters = Arc::new(Counters::default());
    db.create_function(
        HostText::Bytes(b"total"),
        Function::aggregate(Sum::prototype(&counters)),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_final, user_data) =
        mock_db(&db).with_function("total", |reg| (reg.x_final.unwrap(), reg.user_data));
    let mut ctx = MockContext::new(user_data);
    x_final(&mut ctx);
    assert_eq!(ctx.result, Some(MockResult::Integer(0)));
    assert_eq!(counters.clones.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn aggregate_group_clones_once_for_all_steps() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let counters = Arc::new(Counters::default());
    db.create_function(
        HostText::Bytes(b"total"),
        Function::aggregate(Sum::prototype(&counters)),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_step, x_final, user_data) = mock_db(&db).with_function("total", |reg| {
        assert!(reg.x_func.is_none());
        (reg.x_step.unwrap(), reg.x_final.unwrap(), reg.user_data)
    });
    let mut ctx = MockContext::new(user_data);
    for v in [1, 2, 3] {
        invoke_args(x_step, &mut ctx, &mut [MockValue::Integer(v)]);
    }
    assert_eq!(counters.clones.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 0);
    x_final(&mut ctx);
    assert_eq!(ctx.result, Some(MockResult::Integer(6)));
    assert_eq!(counters.clones.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn separate_groups_get_separate_instances() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let counters = Arc::new(Counters::default());
    db.create_function(
        HostText::Bytes(b"total"),
        Function::aggregate(Sum::prototype(&counters)),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_step, x_final, user_data) = mock_db(&db)
        .with_function("total", |reg| (reg.x_step.unwrap(), reg.x_final.unwrap(), reg.user_data));
    let mut first = MockContext::new(user_data);
    let mut second = MockContext::new(user_data);
    invoke_args(x_step, &mut first, &mut [MockValue::Integer(5)]);
    invoke_args(x_step, &mut second, &mut [MockValue::Integer(7)]);
    x_final(&mut first);
    x_final(&mut second);
    assert_eq!(first.result, Some(MockResult::Integer(5)));
    assert_eq!(second.result, Some(MockResult::Integer(7)));
    assert_eq!(counters.clones.load(Ordering::SeqCst), 2);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
}

#[test]
fn window_function_uses_value_and_inverse() {
    let api = MockApi::with_features(FeatureSet::WINDOW_FUNCTIONS | FeatureSet::HOOKS);
    let db = open_conn(&api);
    let counters = Arc::new(Counters::default());
    db.create_function(
        HostText::Bytes(b"moving"),
        Function::window(Sum::prototype(&counters)),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_step, x_inverse, x_value, x_final, user_data) =
        mock_db(&db).with_function("moving", |reg| {
            (
                reg.x_step.unwrap(),
                reg.x_inverse.unwrap(),
                reg.x_value.unwrap(),
                reg.x_final.unwrap(),
                reg.user_data,
            )
        });
    let mut ctx = MockContext::new(user_data);
    invoke_args(x_step, &mut ctx, &mut [MockValue::Integer(4)]);
    invoke_args(x_step, &mut ctx, &mut [MockValue::Integer(6)]);
    x_value(&mut ctx);
    assert_eq!(ctx.result, Some(MockResult::Integer(10)));
    invoke_args(x_inverse, &mut ctx, &mut [MockValue::Integer(4)]);
    x_value(&mut ctx);
    assert_eq!(ctx.result, Some(MockResult::Integer(6)));
    x_final(&mut ctx);
    assert_eq!(ctx.result, Some(MockResult::Integer(6)));
    assert_eq!(counters.clones.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn aggregate_without_clone_support_reports_error() {
    struct NoClone;
    impl FunctionBody<MockApi> for NoClone {}

    let api = MockApi::new();
    let db = open_conn(&api);
    db.create_function(
        HostText::Bytes(b"nc"),
        Function::aggregate(NoClone),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_step, user_data) =
        mock_db(&db).with_function("nc", |reg| (reg.x_step.unwrap(), reg.user_data));
    let mut ctx = MockContext::new(user_data);
    invoke_args(x_step, &mut ctx, &mut [MockValue::Integer(1)]);
    assert_eq!(
        ctx.result,
        Some(MockResult::Error("function cannot be cloned".to_string()))
    );
}

#[test]
fn destroy_and_free_functions_release_registrations() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let first = Function::scalar(AddOne);
    let second = Function::scalar(AddOne);
    for (name, function) in [(&b"one"[..], &first), (&b"two"[..], &second)] {
        db.create_function(
            HostText::Bytes(name),
            Arc::clone(function),
            1,
            FunctionFlags::empty(),
            TextMode::Array,
        )
        .unwrap();
    }
    assert_eq!(db.registered_functions(), 2);
    assert_eq!(Arc::strong_count(&first), 2);

    db.destroy_function(HostText::Bytes(b"ONE"), 1, TextMode::Array)
        .unwrap();
    assert_eq!(db.registered_functions(), 1);
    assert!(mock_db(&db).function("one").is_none());
    assert_eq!(Arc::strong_count(&first), 1);

    db.free_functions().unwrap();
    assert_eq!(db.registered_functions(), 0);
    assert!(mock_db(&db).function("two").is_none());
    assert_eq!(Arc::strong_count(&second), 1);
}

#[test]
fn replacing_a_function_releases_the_old_one() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let old = Function::scalar(AddOne);
    let new = Function::scalar(AddOne);
    for function in [&old, &new] {
        db.create_function(
            HostText::Bytes(b"f"),
            Arc::clone(function),
            1,
            FunctionFlags::empty(),
            TextMode::Array,
        )
        .unwrap();
    }
    assert_eq!(db.registered_functions(), 1);
    assert_eq!(Arc::strong_count(&old), 1);
    db.close().unwrap();
    assert_eq!(Arc::strong_count(&new), 1);
}

#[test]
fn restore_retries_busy_source() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.script_backup(&[5, 5, 0, 101]);
    let progress = Mutex::new(Vec::new());
    let observer = |remaining: i32, pages: i32| progress.lock().unwrap().push((remaining, pages));
    db.restore(
        HostText::Bytes(b"main"),
        HostText::Bytes(b"backup.db"),
        Some(&observer),
        TextMode::Array,
    )
    .unwrap();
    assert_eq!(*api.sleeps.lock().unwrap(), vec![100, 100]);
    assert_eq!(progress.lock().unwrap().len(), 4);
    assert_eq!(api.backup_finishes.load(Ordering::SeqCst), 1);

    let opens = api.opens.lock().unwrap();
    assert_eq!(opens.last().unwrap().0, b"backup.db");
    assert_eq!(opens.last().unwrap().1, OpenFlags::READ_ONLY);
    let inits = api.backup_inits.lock().unwrap();
    assert_eq!(
        inits[0],
        (
            b"test.db".to_vec(),
            b"main".to_vec(),
            b"backup.db".to_vec(),
            b"main".to_vec()
        )
    );
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn restore_gives_up_after_three_busy_retries() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.script_backup(&[5, 5, 5, 5]);
    let err = db
        .restore(
            HostText::Bytes(b"main"),
            HostText::Bytes(b"backup.db"),
            None,
            TextMode::Array,
        )
        .unwrap_err();
    assert!(err.is_busy());
    assert_eq!(api.sleep_count(), 3);
    assert_eq!(api.backup_finishes.load(Ordering::SeqCst), 1);
}

#[test]
fn backup_does_not_retry_busy() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.script_backup(&[5]);
    let err = db
        .backup(
            HostText::Bytes(b"main"),
            HostText::Bytes(b"out.db"),
            None,
            TextMode::Array,
        )
        .unwrap_err();
    assert!(err.is_busy());
    assert_eq!(api.sleep_count(), 0);
    assert_eq!(api.backup_finishes.load(Ordering::SeqCst), 1);
}

#[test]
fn backup_writes_into_created_file() {
    let api = MockApi::new();
    let db = open_conn(&api);
    api.script_backup(&[0, 0, 101]);
    let steps = AtomicUsize::new(0);
    let observer = |_remaining: i32, pages: i32| {
        assert_eq!(pages, 10);
        steps.fetch_add(1, Ordering::SeqCst);
    };
    let main = utf16("main");
    let dest = utf16("file:out.db?cache=private");
    db.backup(
        HostText::Utf16(&main),
        HostText::Utf16(&dest),
        Some(&observer),
        TextMode::StringCesu8,
    )
    .unwrap();
    assert_eq!(steps.load(Ordering::SeqCst), 3);
    let opens = api.opens.lock().unwrap();
    let (path, flags) = opens.last().unwrap();
    assert_eq!(path, b"file:out.db?cache=private");
    assert!(flags.contains(OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::URI));
    let inits = api.backup_inits.lock().unwrap();
    assert_eq!(inits[0].1, b"main");
    assert_eq!(inits[0].2, b"test.db");
    assert_eq!(api.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn update_listener_receives_decoded_names() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    db.set_update_listener(Some(Arc::new(move |event: &UpdateEvent| -> HostResult<()> {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    })))
    .unwrap();
    assert!(db.has_hook(HookKind::Update));

    let (cb, context) = mock_db(&db).hooks.lock().unwrap().update.unwrap();
    let database = CString::new("main").unwrap();
    let table = CString::new("t\u{e9}").unwrap();
    cb(
        context as *mut c_void,
        UpdateEvent::INSERT,
        database.as_ptr() as *const c_char,
        table.as_ptr() as *const c_char,
        12,
    );
    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![UpdateEvent {
            operation: UpdateEvent::INSERT,
            database: utf16("main"),
            table: utf16("t\u{e9}"),
            rowid: 12,
        }]
    );
}

#[test]
fn replacing_a_listener_releases_the_previous_one() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let first: Arc<dyn UpdateListener> = Arc::new(|_: &UpdateEvent| -> HostResult<()> { Ok(()) });
    let second: Arc<dyn UpdateListener> = Arc::new(|_: &UpdateEvent| -> HostResult<()> { Ok(()) });
    db.set_update_listener(Some(Arc::clone(&first))).unwrap();
    assert_eq!(Arc::strong_count(&first), 2);
    db.set_update_listener(Some(Arc::clone(&second))).unwrap();
    assert_eq!(Arc::strong_count(&first), 1);
    assert_eq!(Arc::strong_count(&second), 2);
    db.set_update_listener(None).unwrap();
    assert!(!db.has_hook(HookKind::Update));
    assert!(mock_db(&db).hooks.lock().unwrap().update.is_none());
    assert_eq!(Arc::strong_count(&second), 1);
}

#[test]
fn hooks_are_scoped_to_their_connection() {
    let api = MockApi::new();
    let left = open_conn(&api);
    let right = open_conn(&api);
    let hits = Arc::new(AtomicUsize::new(0));
    let left_hits = Arc::clone(&hits);
    left.set_update_listener(Some(Arc::new(move |_: &UpdateEvent| -> HostResult<()> {
        left_hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })))
    .unwrap();
    right
        .set_update_listener(Some(Arc::new(|_: &UpdateEvent| -> HostResult<()> { Ok(()) })))
        .unwrap();
    assert!(left.has_hook(HookKind::Update));
    assert!(right.has_hook(HookKind::Update));
    right.set_update_listener(None).unwrap();
    assert!(left.has_hook(HookKind::Update));

    let (cb, context) = mock_db(&left).hooks.lock().unwrap().update.unwrap();
    let name = CString::new("t").unwrap();
    cb(context as *mut c_void, UpdateEvent::DELETE, name.as_ptr(), name.as_ptr(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn close_releases_hook_subscribers() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let listener: Arc<dyn CommitListener> = Arc::new(|_: bool| -> HostResult<()> { Ok(()) });
    db.set_commit_listener(Some(Arc::clone(&listener))).unwrap();
    assert_eq!(Arc::strong_count(&listener), 2);
    db.close().unwrap();
    assert_eq!(Arc::strong_count(&listener), 1);
    assert!(!db.has_hook(HookKind::Commit));
}

#[test]
fn commit_listener_sees_commit_and_rollback() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    db.set_commit_listener(Some(Arc::new(move |commit: bool| -> HostResult<()> {
        sink.lock().unwrap().push(commit);
        Ok(())
    })))
    .unwrap();
    let hooks = mock_db(&db).hooks.lock().unwrap();
    let (commit, commit_ctx) = hooks.commit.unwrap();
    let (rollback, rollback_ctx) = hooks.rollback.unwrap();
    drop(hooks);
    assert_eq!(commit(commit_ctx as *mut c_void), 0);
    rollback(rollback_ctx as *mut c_void);
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);

    db.set_commit_listener(None).unwrap();
    let hooks = mock_db(&db).hooks.lock().unwrap();
    assert!(hooks.commit.is_none());
    assert!(hooks.rollback.is_none());
}

#[test]
fn failed_rollback_registration_drops_the_commit_slot() {
    let api = MockApi::new();
    let db = open_conn(&api);
    let first: Arc<dyn CommitListener> = Arc::new(|_: bool| -> HostResult<()> { Ok(()) });
    db.set_commit_listener(Some(Arc::clone(&first))).unwrap();
    let (_, first_ctx) = mock_db(&db).hooks.lock().unwrap().rollback.unwrap();

    api.fail_rollback_hook.store(true, Ordering::SeqCst);
    let second: Arc<dyn CommitListener> = Arc::new(|_: bool| -> HostResult<()> { Ok(()) });
    let err = db.set_commit_listener(Some(Arc::clone(&second))).unwrap_err();
    assert_eq!(err.raw_code(), Some(1));
    assert!(!db.has_hook(HookKind::Commit));

    let hooks = mock_db(&db).hooks.lock().unwrap();
    assert!(hooks.commit.is_none());
    // The rollback hook still points at the first context, which stays alive.
    let (rollback, rollback_ctx) = hooks.rollback.unwrap();
    drop(hooks);
    assert_eq!(rollback_ctx, first_ctx);
    rollback(rollback_ctx as *mut c_void);
    assert_eq!(Arc::strong_count(&first), 2);
    assert_eq!(Arc::strong_count(&second), 2);

    db.close().unwrap();
    assert_eq!(Arc::strong_count(&first), 2);
}

#[test]
fn progress_handler_fails_closed() {
    let api = MockApi::new();
    let db = open_conn(&api);
    db.register_progress_handler(100, Arc::new(|| -> HostResult<i32> { Ok(0) }))
        .unwrap();
    let (cb, context) = mock_db(&db).hooks.lock().unwrap().progress.unwrap();
    assert_eq!(cb(context as *mut c_void), 0);

    db.register_progress_handler(
        100,
        Arc::new(|| -> HostResult<i32> { Err(HostException::new("stop")) }),
    )
    .unwrap();
    let (cb, context) = mock_db(&db).hooks.lock().unwrap().progress.unwrap();
    assert_eq!(cb(context as *mut c_void), 1);

    db.register_progress_handler(100, Arc::new(|| -> HostResult<i32> { panic!("progress") }))
        .unwrap();
    let (cb, context) = mock_db(&db).hooks.lock().unwrap().progress.unwrap();
    assert_eq!(cb(context as *mut c_void), 1);

    db.clear_progress_handler().unwrap();
    assert!(!db.has_hook(HookKind::Progress));
}

#[test]
fn busy_handler_and_timeout_are_exclusive() {
    let api = MockApi::new();
    let db = open_conn(&api);
    db.busy_handler(Some(Arc::new(|count: i32| -> HostResult<i32> {
        Ok(i32::from(count < 3))
    })))
    .unwrap();
    assert!(db.has_hook(HookKind::Busy));
    let (cb, context) = mock_db(&db).hooks.lock().unwrap().busy.unwrap();
    assert_eq!(cb(context as *mut c_void, 0), 1);
    assert_eq!(cb(context as *mut c_void, 3), 0);

    db.busy_timeout(250).unwrap();
    assert!(!db.has_hook(HookKind::Busy));
    let hooks = mock_db(&db).hooks.lock().unwrap();
    assert!(hooks.busy.is_none());
    assert_eq!(hooks.busy_timeout, Some(250));
}

#[test]
fn busy_handler_exception_stops_retrying() {
    let api = MockApi::new();
    let db = open_conn(&api);
    db.busy_handler(Some(Arc::new(|_: i32| -> HostResult<i32> {
        Err(HostException::new("no"))
    })))
    .unwrap();
    let (cb, context) = mock_db(&db).hooks.lock().unwrap().busy.unwrap();
    assert_eq!(cb(context as *mut c_void, 0), 0);
}

#[derive(Default)]
struct CountingRuntime {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
}

impl HostRuntime for CountingRuntime {
    fn attach_current_thread(&self) -> Result<()> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_current_thread(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn callbacks_attach_their_thread() {
    let api = MockApi::new();
    let counting = Arc::new(CountingRuntime::default());
    let db = NativeDb::new(&api, counting.clone());
    db.open(HostText::Bytes(b"t.db"), OpenFlags::READ_WRITE, TextMode::Array)
        .unwrap();
    db.create_function(
        HostText::Bytes(b"add_one"),
        Function::scalar(AddOne),
        1,
        FunctionFlags::empty(),
        TextMode::Array,
    )
    .unwrap();
    let (x_func, user_data) =
        mock_db(&db).with_function("add_one", |reg| (reg.x_func.unwrap(), reg.user_data as usize));
    let worker = std::thread::spawn(move || {
        let mut results = Vec::new();
        for v in [1, 2] {
            let mut ctx = MockContext::new(user_data as *mut c_void);
            invoke_args(x_func, &mut ctx, &mut [MockValue::Integer(v)]);
            results.push(ctx.result);
        }
        results
    });
    assert_eq!(
        worker.join().unwrap(),
        vec![Some(MockResult::Integer(2)), Some(MockResult::Integer(3))]
    );
    assert_eq!(counting.attaches.load(Ordering::SeqCst), 1);
    assert_eq!(counting.detaches.load(Ordering::SeqCst), 1);
}
