//! Dynamic `libsqlite3` backend for `sqlite-bridge`.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};
use sqlite_bridge::{
    ApiVersion, BackupStep, BusyCallback, ColumnMetadata, CommitCallback, Error, FeatureSet,
    FunctionFlags, OpenFlags, ProgressCallback, RawBytes, Result, RollbackCallback, Sqlite3Api,
    Sqlite3Backup, Sqlite3Hooks, Sqlite3Metadata, StepResult, UpdateCallback, ValueType,
};
use std::ffi::{CStr, CString};
use std::ptr::{null, null_mut, NonNull};
use std::sync::OnceLock;

mod core_impl;
mod extensions_impl;

#[cfg(target_os = "linux")]
#[link(name = "dl")]
extern "C" {}

const SQLITE_OK: i32 = 0;
const SQLITE_ROW: i32 = 100;
const SQLITE_DONE: i32 = 101;

const SQLITE_OPEN_READONLY: i32 = 0x0000_0001;
const SQLITE_OPEN_READWRITE: i32 = 0x0000_0002;
const SQLITE_OPEN_CREATE: i32 = 0x0000_0004;
const SQLITE_OPEN_URI: i32 = 0x0000_0040;
const SQLITE_OPEN_NOMUTEX: i32 = 0x0000_8000;
const SQLITE_OPEN_FULLMUTEX: i32 = 0x0001_0000;
const SQLITE_OPEN_SHAREDCACHE: i32 = 0x0002_0000;
const SQLITE_OPEN_PRIVATECACHE: i32 = 0x0004_0000;

const SQLITE_UTF8: i32 = 0x0000_0001;
const SQLITE_DETERMINISTIC: i32 = 0x0000_0800;
const SQLITE_INNOCUOUS: i32 = 0x0002_0000;
const SQLITE_DIRECTONLY: i32 = 0x0008_0000;
const EMPTY_BYTE: u8 = 0;

type sqlite3 = c_void;
type sqlite3_stmt = c_void;
type sqlite3_value = c_void;
type sqlite3_context = c_void;
type sqlite3_backup = c_void;

type sqlite3_destructor_type = Option<unsafe extern "C" fn(*mut c_void)>;

type OpenV2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
type Close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ExtendedResultCodes = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type PrepareV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
type Exec = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    Option<extern "C" fn(*mut c_void, c_int, *mut *mut c_char, *mut *mut c_char) -> c_int>,
    *mut c_void,
    *mut *mut c_char,
) -> c_int;
type Step = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type Reset = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type Finalize = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type ClearBindings = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type BindParameterCount = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;

type BindNull = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type BindInt = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, c_int) -> c_int;
type BindInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, i64) -> c_int;
type BindDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, f64) -> c_int;
type BindText = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_char,
    c_int,
    sqlite3_destructor_type,
) -> c_int;
type BindBlob = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    c_int,
    sqlite3_destructor_type,
) -> c_int;

type ColumnCount = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
type ColumnType = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnInt = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnInt64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> i64;
type ColumnDouble = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> f64;
type ColumnText = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_uchar;
type ColumnBlob = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_void;
type ColumnBytes = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
type ColumnString = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_char;

type ErrCode = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type ErrMsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
type Interrupt = unsafe extern "C" fn(*mut sqlite3);
type Changes = unsafe extern "C" fn(*mut sqlite3) -> c_int;
type Changes64 = unsafe extern "C" fn(*mut sqlite3) -> i64;
type Limit = unsafe extern "C" fn(*mut sqlite3, c_int, c_int) -> c_int;
type EnableLoadExtension = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type EnableSharedCache = unsafe extern "C" fn(c_int) -> c_int;

type CreateFunctionV2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context)>,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;

type CreateWindowFunction = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    c_int,
    *mut c_void,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut sqlite3_context)>,
    Option<extern "C" fn(*mut sqlite3_context)>,
    Option<extern "C" fn(*mut sqlite3_context, c_int, *mut *mut sqlite3_value)>,
    Option<extern "C" fn(*mut c_void)>,
) -> c_int;

type AggregateContext = unsafe extern "C" fn(*mut sqlite3_context, c_int) -> *mut c_void;
type ResultNull = unsafe extern "C" fn(*mut sqlite3_context);
type ResultInt = unsafe extern "C" fn(*mut sqlite3_context, c_int);
type ResultInt64 = unsafe extern "C" fn(*mut sqlite3_context, i64);
type ResultDouble = unsafe extern "C" fn(*mut sqlite3_context, f64);
type ResultText =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int, sqlite3_destructor_type);
type ResultBlob =
    unsafe extern "C" fn(*mut sqlite3_context, *const c_void, c_int, sqlite3_destructor_type);
type ResultError = unsafe extern "C" fn(*mut sqlite3_context, *const c_char, c_int);
type ResultErrorNomem = unsafe extern "C" fn(*mut sqlite3_context);
type UserData = unsafe extern "C" fn(*mut sqlite3_context) -> *mut c_void;

type ValueTypeFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueIntFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
type ValueInt64Fn = unsafe extern "C" fn(*mut sqlite3_value) -> i64;
type ValueDoubleFn = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
type ValueTextFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
type ValueBlobFn = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
type ValueBytesFn = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;

type Libversion = unsafe extern "C" fn() -> *const c_char;
type LibversionNumber = unsafe extern "C" fn() -> c_int;

type Malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
type Free = unsafe extern "C" fn(*mut c_void);
type Sleep = unsafe extern "C" fn(c_int) -> c_int;

type BusyTimeout = unsafe extern "C" fn(*mut sqlite3, c_int) -> c_int;
type BusyHandlerFn = unsafe extern "C" fn(*mut sqlite3, Option<BusyCallback>, *mut c_void) -> c_int;
type ProgressHandlerFn =
    unsafe extern "C" fn(*mut sqlite3, c_int, Option<ProgressCallback>, *mut c_void);
type UpdateHookFn =
    unsafe extern "C" fn(*mut sqlite3, Option<UpdateCallback>, *mut c_void) -> *mut c_void;
type CommitHookFn =
    unsafe extern "C" fn(*mut sqlite3, Option<CommitCallback>, *mut c_void) -> *mut c_void;
type RollbackHookFn =
    unsafe extern "C" fn(*mut sqlite3, Option<RollbackCallback>, *mut c_void) -> *mut c_void;

type BackupInit = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *mut sqlite3,
    *const c_char,
) -> *mut sqlite3_backup;
type BackupStepFn = unsafe extern "C" fn(*mut sqlite3_backup, c_int) -> c_int;
type BackupCount = unsafe extern "C" fn(*mut sqlite3_backup) -> c_int;
type BackupFinish = unsafe extern "C" fn(*mut sqlite3_backup) -> c_int;

type TableColumnMetadata = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    *const c_char,
    *const c_char,
    *mut *const c_char,
    *mut *const c_char,
    *mut c_int,
    *mut c_int,
    *mut c_int,
) -> c_int;

struct LibHandle {
    handle: *mut c_void,
}

unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    unsafe fn open() -> Option<Self> {
        let mut handle = null_mut();
        for name in lib_names() {
            let cstr = CStr::from_bytes_with_nul_unchecked(name);
            handle = libc::dlopen(cstr.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL);
            if !handle.is_null() {
                break;
            }
        }
        if handle.is_null() {
            None
        } else {
            Some(Self { handle })
        }
    }

    unsafe fn symbol<T>(&self, name: &'static [u8]) -> Option<T>
    where
        T: Copy,
    {
        let sym = libc::dlsym(self.handle, name.as_ptr() as *const c_char);
        if sym.is_null() {
            None
        } else {
            debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
            Some(std::mem::transmute_copy(&sym))
        }
    }
}

struct LibSqlite3Fns {
    open_v2: OpenV2,
    close: Close,
    extended_result_codes: ExtendedResultCodes,
    prepare_v2: PrepareV2,
    exec: Exec,
    step: Step,
    reset: Reset,
    finalize: Finalize,
    clear_bindings: ClearBindings,
    bind_parameter_count: BindParameterCount,
    bind_null: BindNull,
    bind_int: BindInt,
    bind_int64: BindInt64,
    bind_double: BindDouble,
    bind_text: BindText,
    bind_blob: BindBlob,
    column_count: ColumnCount,
    column_type: ColumnType,
    column_int: ColumnInt,
    column_int64: ColumnInt64,
    column_double: ColumnDouble,
    column_text: ColumnText,
    column_blob: ColumnBlob,
    column_bytes: ColumnBytes,
    errcode: ErrCode,
    errmsg: ErrMsg,
    extended_errcode: Option<ErrCode>,
    interrupt: Interrupt,
    changes: Changes,
    changes64: Option<Changes64>,
    total_changes: Changes,
    total_changes64: Option<Changes64>,
    limit: Limit,
    enable_load_extension: Option<EnableLoadExtension>,
    enable_shared_cache: Option<EnableSharedCache>,
    create_function_v2: CreateFunctionV2,
    create_window_function: Option<CreateWindowFunction>,
    aggregate_context: AggregateContext,
    result_null: ResultNull,
    result_int: ResultInt,
    result_int64: ResultInt64,
    result_double: ResultDouble,
    result_text: ResultText,
    result_blob: ResultBlob,
    result_error: ResultError,
    result_error_nomem: ResultErrorNomem,
    user_data: UserData,
    value_type: ValueTypeFn,
    value_int: ValueIntFn,
    value_int64: ValueInt64Fn,
    value_double: ValueDoubleFn,
    value_text: ValueTextFn,
    value_blob: ValueBlobFn,
    value_bytes: ValueBytesFn,
    libversion: Libversion,
    libversion_number: LibversionNumber,
    malloc: Malloc,
    free: Free,
    sleep: Sleep,
    busy_timeout: Option<BusyTimeout>,
    busy_handler: Option<BusyHandlerFn>,
    progress_handler: Option<ProgressHandlerFn>,
    update_hook: Option<UpdateHookFn>,
    commit_hook: Option<CommitHookFn>,
    rollback_hook: Option<RollbackHookFn>,
    backup_init: Option<BackupInit>,
    backup_step: Option<BackupStepFn>,
    backup_remaining: Option<BackupCount>,
    backup_pagecount: Option<BackupCount>,
    backup_finish: Option<BackupFinish>,
    column_decltype: ColumnString,
    column_name: ColumnString,
    column_table_name: Option<ColumnString>,
    column_origin_name: Option<ColumnString>,
    column_database_name: Option<ColumnString>,
    table_column_metadata: Option<TableColumnMetadata>,
}

impl LibSqlite3Fns {
    unsafe fn load(lib: &LibHandle) -> Option<Self> {
        Some(Self {
            open_v2: lib.symbol(b"sqlite3_open_v2\0")?,
            close: lib.symbol(b"sqlite3_close\0")?,
            extended_result_codes: lib.symbol(b"sqlite3_extended_result_codes\0")?,
            prepare_v2: lib.symbol(b"sqlite3_prepare_v2\0")?,
            exec: lib.symbol(b"sqlite3_exec\0")?,
            step: lib.symbol(b"sqlite3_step\0")?,
            reset: lib.symbol(b"sqlite3_reset\0")?,
            finalize: lib.symbol(b"sqlite3_finalize\0")?,
            clear_bindings: lib.symbol(b"sqlite3_clear_bindings\0")?,
            bind_parameter_count: lib.symbol(b"sqlite3_bind_parameter_count\0")?,
            bind_null: lib.symbol(b"sqlite3_bind_null\0")?,
            bind_int: lib.symbol(b"sqlite3_bind_int\0")?,
            bind_int64: lib.symbol(b"sqlite3_bind_int64\0")?,
            bind_double: lib.symbol(b"sqlite3_bind_double\0")?,
            bind_text: lib.symbol(b"sqlite3_bind_text\0")?,
            bind_blob: lib.symbol(b"sqlite3_bind_blob\0")?,
            column_count: lib.symbol(b"sqlite3_column_count\0")?,
            column_type: lib.symbol(b"sqlite3_column_type\0")?,
            column_int: lib.symbol(b"sqlite3_column_int\0")?,
            column_int64: lib.symbol(b"sqlite3_column_int64\0")?,
            column_double: lib.symbol(b"sqlite3_column_double\0")?,
            column_text: lib.symbol(b"sqlite3_column_text\0")?,
            column_blob: lib.symbol(b"sqlite3_column_blob\0")?,
            column_bytes: lib.symbol(b"sqlite3_column_bytes\0")?,
            errcode: lib.symbol(b"sqlite3_errcode\0")?,
            errmsg: lib.symbol(b"sqlite3_errmsg\0")?,
            extended_errcode: lib.symbol(b"sqlite3_extended_errcode\0"),
            interrupt: lib.symbol(b"sqlite3_interrupt\0")?,
            changes: lib.symbol(b"sqlite3_changes\0")?,
            changes64: lib.symbol(b"sqlite3_changes64\0"),
            total_changes: lib.symbol(b"sqlite3_total_changes\0")?,
            total_changes64: lib.symbol(b"sqlite3_total_changes64\0"),
            limit: lib.symbol(b"sqlite3_limit\0")?,
            enable_load_extension: lib.symbol(b"sqlite3_enable_load_extension\0"),
            enable_shared_cache: lib.symbol(b"sqlite3_enable_shared_cache\0"),
            create_function_v2: lib.symbol(b"sqlite3_create_function_v2\0")?,
            create_window_function: lib.symbol(b"sqlite3_create_window_function\0"),
            aggregate_context: lib.symbol(b"sqlite3_aggregate_context\0")?,
            result_null: lib.symbol(b"sqlite3_result_null\0")?,
            result_int: lib.symbol(b"sqlite3_result_int\0")?,
            result_int64: lib.symbol(b"sqlite3_result_int64\0")?,
            result_double: lib.symbol(b"sqlite3_result_double\0")?,
            result_text: lib.symbol(b"sqlite3_result_text\0")?,
            result_blob: lib.symbol(b"sqlite3_result_blob\0")?,
            result_error: lib.symbol(b"sqlite3_result_error\0")?,
            result_error_nomem: lib.symbol(b"sqlite3_result_error_nomem\0")?,
            user_data: lib.symbol(b"sqlite3_user_data\0")?,
            value_type: lib.symbol(b"sqlite3_value_type\0")?,
            value_int: lib.symbol(b"sqlite3_value_int\0")?,
            value_int64: lib.symbol(b"sqlite3_value_int64\0")?,
            value_double: lib.symbol(b"sqlite3_value_double\0")?,
            value_text: lib.symbol(b"sqlite3_value_text\0")?,
            value_blob: lib.symbol(b"sqlite3_value_blob\0")?,
            value_bytes: lib.symbol(b"sqlite3_value_bytes\0")?,
            libversion: lib.symbol(b"sqlite3_libversion\0")?,
            libversion_number: lib.symbol(b"sqlite3_libversion_number\0")?,
            malloc: lib.symbol(b"sqlite3_malloc\0")?,
            free: lib.symbol(b"sqlite3_free\0")?,
            sleep: lib.symbol(b"sqlite3_sleep\0")?,
            busy_timeout: lib.symbol(b"sqlite3_busy_timeout\0"),
            busy_handler: lib.symbol(b"sqlite3_busy_handler\0"),
            progress_handler: lib.symbol(b"sqlite3_progress_handler\0"),
            update_hook: lib.symbol(b"sqlite3_update_hook\0"),
            commit_hook: lib.symbol(b"sqlite3_commit_hook\0"),
            rollback_hook: lib.symbol(b"sqlite3_rollback_hook\0"),
            backup_init: lib.symbol(b"sqlite3_backup_init\0"),
            backup_step: lib.symbol(b"sqlite3_backup_step\0"),
            backup_remaining: lib.symbol(b"sqlite3_backup_remaining\0"),
            backup_pagecount: lib.symbol(b"sqlite3_backup_pagecount\0"),
            backup_finish: lib.symbol(b"sqlite3_backup_finish\0"),
            column_decltype: lib.symbol(b"sqlite3_column_decltype\0")?,
            column_name: lib.symbol(b"sqlite3_column_name\0")?,
            column_table_name: lib.symbol(b"sqlite3_column_table_name\0"),
            column_origin_name: lib.symbol(b"sqlite3_column_origin_name\0"),
            column_database_name: lib.symbol(b"sqlite3_column_database_name\0"),
            table_column_metadata: lib.symbol(b"sqlite3_table_column_metadata\0"),
        })
    }
}

static USER_DATA_FN: OnceLock<UserData> = OnceLock::new();

/// Dynamic `libsqlite3` backend loaded via `dlopen`.
pub struct LibSqlite3 {
    fns: LibSqlite3Fns,
    features: FeatureSet,
    api_version: ApiVersion,
    _lib: LibHandle,
}

impl LibSqlite3 {
    /// Load `libsqlite3` and return a process-wide adapter instance.
    ///
    /// Returns `None` if the library or required symbols are unavailable.
    pub fn load() -> Option<&'static LibSqlite3> {
        static INSTANCE: OnceLock<Option<&'static LibSqlite3>> = OnceLock::new();
        *INSTANCE.get_or_init(|| unsafe { Self::load_uncached() })
    }

    unsafe fn load_uncached() -> Option<&'static LibSqlite3> {
        let lib = LibHandle::open()?;
        let fns = LibSqlite3Fns::load(&lib)?;
        let api_version = ApiVersion::from_number((fns.libversion_number)());
        let mut features = FeatureSet::empty();
        if fns.create_window_function.is_some() {
            features |= FeatureSet::WINDOW_FUNCTIONS;
        }
        if fns.extended_errcode.is_some() {
            features |= FeatureSet::EXTENDED_ERRCODES;
        }
        if fns.enable_load_extension.is_some() {
            features |= FeatureSet::LOAD_EXTENSION;
        }
        if fns.table_column_metadata.is_some()
            && fns.column_table_name.is_some()
            && fns.column_origin_name.is_some()
        {
            features |= FeatureSet::COLUMN_METADATA;
        }
        if fns.busy_handler.is_some() && fns.progress_handler.is_some() && fns.update_hook.is_some()
        {
            features |= FeatureSet::HOOKS;
        }
        if fns.backup_init.is_some() && fns.backup_step.is_some() && fns.backup_finish.is_some() {
            features |= FeatureSet::BACKUP;
        }
        let _ = USER_DATA_FN.set(fns.user_data);
        tracing::debug!(version = ?api_version, "loaded libsqlite3");
        let adapter = LibSqlite3 {
            fns,
            features,
            api_version,
            _lib: lib,
        };
        Some(Box::leak(Box::new(adapter)))
    }

    fn error_from_rc(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Error {
        let message = db
            .and_then(|db| unsafe { raw_cstr((self.fns.errmsg)(db.as_ptr())) })
            .map(|c| c.to_string_lossy().into_owned());
        let extended = db
            .and_then(|db| self.fns.extended_errcode.map(|f| unsafe { f(db.as_ptr()) }));
        Error::engine(rc, message, extended)
    }

    fn check(&self, rc: i32, db: Option<NonNull<sqlite3>>) -> Result<()> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.error_from_rc(rc, db))
        }
    }

    // Allocate with sqlite3_malloc so SQLite can free via sqlite3_free.
    fn alloc_copy(&self, bytes: &[u8]) -> Result<(*const c_void, sqlite3_destructor_type)> {
        if bytes.is_empty() {
            return Ok((&EMPTY_BYTE as *const u8 as *const c_void, None));
        }
        if bytes.len() > i32::MAX as usize {
            return Err(Error::misuse("value too large"));
        }
        let ptr = unsafe { (self.fns.malloc)(bytes.len() as i32) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
        }
        Ok((ptr, Some(self.fns.free)))
    }
}

fn map_open_flags(flags: OpenFlags) -> i32 {
    let mut out = 0;
    if flags.contains(OpenFlags::READ_ONLY) {
        out |= SQLITE_OPEN_READONLY;
    }
    if flags.contains(OpenFlags::READ_WRITE) {
        out |= SQLITE_OPEN_READWRITE;
    }
    if flags.contains(OpenFlags::CREATE) {
        out |= SQLITE_OPEN_CREATE;
    }
    if flags.contains(OpenFlags::URI) {
        out |= SQLITE_OPEN_URI;
    }
    if flags.contains(OpenFlags::NO_MUTEX) {
        out |= SQLITE_OPEN_NOMUTEX;
    }
    if flags.contains(OpenFlags::FULL_MUTEX) {
        out |= SQLITE_OPEN_FULLMUTEX;
    }
    if flags.contains(OpenFlags::SHARED_CACHE) {
        out |= SQLITE_OPEN_SHAREDCACHE;
    }
    if flags.contains(OpenFlags::PRIVATE_CACHE) {
        out |= SQLITE_OPEN_PRIVATECACHE;
    }
    out
}

fn map_function_flags(flags: FunctionFlags) -> i32 {
    let mut out = SQLITE_UTF8;
    if flags.contains(FunctionFlags::DETERMINISTIC) {
        out |= SQLITE_DETERMINISTIC;
    }
    if flags.contains(FunctionFlags::DIRECT_ONLY) {
        out |= SQLITE_DIRECTONLY;
    }
    if flags.contains(FunctionFlags::INNOCUOUS) {
        out |= SQLITE_INNOCUOUS;
    }
    out
}

fn clamp_len(len: usize) -> i32 {
    if len > i32::MAX as usize {
        i32::MAX
    } else {
        len as i32
    }
}

fn c_string(bytes: &[u8], what: &'static str) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::misuse(format!("{} contains NUL", what)))
}

unsafe fn raw_cstr<'a>(ptr: *const c_char) -> Option<&'a CStr> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr))
    }
}

fn raw_bytes_from_cstr(ptr: *const c_char) -> RawBytes {
    match unsafe { raw_cstr(ptr) } {
        Some(cstr) => RawBytes {
            ptr: cstr.as_ptr() as *const u8,
            len: cstr.to_bytes().len(),
        },
        None => RawBytes::null(),
    }
}

fn lib_names() -> &'static [&'static [u8]] {
    #[cfg(target_os = "macos")]
    const NAMES: [&[u8]; 3] = [
        b"libsqlite3.dylib\0",
        b"libsqlite3.so.0\0",
        b"libsqlite3.so\0",
    ];
    #[cfg(not(target_os = "macos"))]
    const NAMES: [&[u8]; 2] = [b"libsqlite3.so.0\0", b"libsqlite3.so\0"];
    &NAMES
}
