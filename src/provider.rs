use core::ffi::{c_char, c_void};
use core::ptr::NonNull;

use crate::error::Result;

/// SQLite API version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Decode `sqlite3_libversion_number()` form (`X*1000000 + Y*1000 + Z`).
    pub const fn from_number(number: i32) -> Self {
        Self::new(
            (number / 1_000_000) as u16,
            ((number / 1_000) % 1_000) as u16,
            (number % 1_000) as u16,
        )
    }
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident: $bits:ty { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            bits: $bits,
        }

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name { bits: $value };)*

            pub const fn empty() -> Self {
                Self { bits: 0 }
            }

            pub const fn from_bits(bits: $bits) -> Self {
                Self { bits }
            }

            pub const fn bits(self) -> $bits {
                self.bits
            }

            /// Return whether `other` is fully contained in this set.
            pub const fn contains(self, other: $name) -> bool {
                (self.bits & other.bits) == other.bits
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name { bits: self.bits | rhs.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.bits |= rhs.bits;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name { bits: self.bits & rhs.bits }
            }
        }
    };
}

flag_set! {
    /// Backend capability flags.
    FeatureSet: u64 {
        /// `sqlite3_create_window_function` is available.
        WINDOW_FUNCTIONS = 1 << 0;
        /// Extended result code APIs are available.
        EXTENDED_ERRCODES = 1 << 1;
        /// `sqlite3_enable_load_extension` is available.
        LOAD_EXTENSION = 1 << 2;
        /// Column/table metadata APIs are available.
        COLUMN_METADATA = 1 << 3;
        /// Hook registration APIs are available.
        HOOKS = 1 << 4;
        /// Online backup APIs are available.
        BACKUP = 1 << 5;
    }
}

flag_set! {
    /// Flags for opening a database connection.
    OpenFlags: u32 {
        READ_ONLY = 1 << 0;
        READ_WRITE = 1 << 1;
        CREATE = 1 << 2;
        /// Treat the filename as a URI.
        URI = 1 << 3;
        NO_MUTEX = 1 << 4;
        FULL_MUTEX = 1 << 5;
        SHARED_CACHE = 1 << 6;
        PRIVATE_CACHE = 1 << 7;
    }
}

flag_set! {
    /// Function flags passed with a user-defined-function registration.
    FunctionFlags: u32 {
        DETERMINISTIC = 1 << 0;
        DIRECT_ONLY = 1 << 1;
        INNOCUOUS = 1 << 2;
    }
}

/// Result of a `step` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Row,
    Done,
}

/// Result of one `backup_step` batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupStep {
    /// Pages remain to be copied.
    More,
    /// The copy is complete.
    Done,
}

/// SQLite storage class for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl ValueType {
    /// Decode SQLite's integer storage-class code.
    pub const fn from_code(code: i32) -> ValueType {
        match code {
            1 => ValueType::Integer,
            2 => ValueType::Float,
            3 => ValueType::Text,
            4 => ValueType::Blob,
            _ => ValueType::Null,
        }
    }

    pub const fn to_code(self) -> i32 {
        match self {
            ValueType::Integer => 1,
            ValueType::Float => 2,
            ValueType::Text => 3,
            ValueType::Blob => 4,
            ValueType::Null => 5,
        }
    }
}

/// Raw view into engine-managed bytes.
///
/// Valid until the owning statement steps, resets or finalizes, or until the
/// owning function invocation returns. A null `ptr` means the engine returned
/// no buffer, which is not the same as a zero-length value.
#[derive(Clone, Copy, Debug)]
pub struct RawBytes {
    pub ptr: *const u8,
    pub len: usize,
}

impl RawBytes {
    pub const fn null() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    /// Caller must ensure the pointer/length remain valid for the returned slice.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        if self.ptr.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Column metadata returned by `Sqlite3Metadata`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub not_null: bool,
    pub primary_key: bool,
    pub autoinc: bool,
}

/// Provider SPI over the SQLite C API.
///
/// Text crosses this seam as bytes: the bridge may hand the engine CESU-8 or
/// caller-supplied raw bytes, and the engine stores them untouched.
///
/// # Safety
/// Implementations must uphold the SQLite C ABI contracts.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub unsafe trait Sqlite3Api: Send + Sync + 'static {
    type Db;
    type Stmt;
    type Value;
    type Context;

    fn api_version(&self) -> ApiVersion;
    fn feature_set(&self) -> FeatureSet;
    /// Stable backend identifier for diagnostics.
    fn backend_name(&self) -> &'static str;
    /// `sqlite3_libversion()` bytes, without the trailing NUL.
    fn libversion(&self) -> &'static [u8];

    unsafe fn open(&self, filename: &[u8], flags: OpenFlags) -> Result<NonNull<Self::Db>>;
    unsafe fn close(&self, db: NonNull<Self::Db>) -> Result<()>;
    unsafe fn extended_result_codes(&self, db: NonNull<Self::Db>, on: bool) -> Result<()>;

    /// Prepare one statement. Returns `None` when `sql` holds no statement.
    unsafe fn prepare_v2(&self, db: NonNull<Self::Db>, sql: &[u8])
    -> Result<Option<NonNull<Self::Stmt>>>;
    unsafe fn exec(&self, db: NonNull<Self::Db>, sql: &[u8]) -> Result<()>;

    unsafe fn errcode(&self, db: NonNull<Self::Db>) -> i32;
    unsafe fn extended_errcode(&self, db: NonNull<Self::Db>) -> Option<i32>;
    unsafe fn errmsg(&self, db: NonNull<Self::Db>) -> RawBytes;

    unsafe fn interrupt(&self, db: NonNull<Self::Db>);
    unsafe fn changes(&self, db: NonNull<Self::Db>) -> i64;
    unsafe fn total_changes(&self, db: NonNull<Self::Db>) -> i64;
    /// Set limit `id` to `value` (negative leaves it unchanged); returns the prior value.
    unsafe fn limit(&self, db: NonNull<Self::Db>, id: i32, value: i32) -> i32;
    unsafe fn enable_load_extension(&self, db: NonNull<Self::Db>, on: bool) -> Result<()>;
    /// Process-wide shared-cache switch.
    unsafe fn enable_shared_cache(&self, on: bool) -> Result<()>;

    unsafe fn step(&self, stmt: NonNull<Self::Stmt>) -> Result<StepResult>;
    unsafe fn reset(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    unsafe fn finalize(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    unsafe fn clear_bindings(&self, stmt: NonNull<Self::Stmt>) -> Result<()>;
    unsafe fn bind_parameter_count(&self, stmt: NonNull<Self::Stmt>) -> i32;

    unsafe fn bind_null(&self, stmt: NonNull<Self::Stmt>, idx: i32) -> Result<()>;
    unsafe fn bind_int(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i32) -> Result<()>;
    unsafe fn bind_int64(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: i64) -> Result<()>;
    unsafe fn bind_double(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: f64) -> Result<()>;
    /// Implementations must copy `v`.
    unsafe fn bind_text(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;
    /// Implementations must copy `v`.
    unsafe fn bind_blob(&self, stmt: NonNull<Self::Stmt>, idx: i32, v: &[u8]) -> Result<()>;

    unsafe fn column_count(&self, stmt: NonNull<Self::Stmt>) -> i32;
    unsafe fn column_type(&self, stmt: NonNull<Self::Stmt>, col: i32) -> ValueType;
    unsafe fn column_int(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i32;
    unsafe fn column_int64(&self, stmt: NonNull<Self::Stmt>, col: i32) -> i64;
    unsafe fn column_double(&self, stmt: NonNull<Self::Stmt>, col: i32) -> f64;
    unsafe fn column_text(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    unsafe fn column_blob(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;

    /// Register scalar or aggregate callbacks.
    ///
    /// Ownership of `user_data` moves to the provider at call entry: on
    /// success the provider calls `destroy` exactly once when the definition
    /// is replaced, removed or the connection closes; on failure it calls
    /// `destroy` before returning.
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
        destroy: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()>;

    /// Register aggregate or window callbacks. Same ownership contract as
    /// `create_function_v2`.
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
        destroy: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()>;

    /// Fetch (and with `bytes > 0`, allocate zeroed) per-group scratch memory.
    unsafe fn aggregate_context(&self, ctx: NonNull<Self::Context>, bytes: usize) -> *mut c_void;
    unsafe fn user_data(ctx: NonNull<Self::Context>) -> *mut c_void;

    unsafe fn result_null(&self, ctx: NonNull<Self::Context>);
    unsafe fn result_int(&self, ctx: NonNull<Self::Context>, v: i32);
    unsafe fn result_int64(&self, ctx: NonNull<Self::Context>, v: i64);
    unsafe fn result_double(&self, ctx: NonNull<Self::Context>, v: f64);
    /// Providers must ensure the engine copies `v`.
    unsafe fn result_text(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    /// Providers must ensure the engine copies `v`.
    unsafe fn result_blob(&self, ctx: NonNull<Self::Context>, v: &[u8]);
    unsafe fn result_error(&self, ctx: NonNull<Self::Context>, msg: &[u8]);
    unsafe fn result_error_nomem(&self, ctx: NonNull<Self::Context>);

    unsafe fn value_type(&self, v: NonNull<Self::Value>) -> ValueType;
    unsafe fn value_int(&self, v: NonNull<Self::Value>) -> i32;
    unsafe fn value_int64(&self, v: NonNull<Self::Value>) -> i64;
    unsafe fn value_double(&self, v: NonNull<Self::Value>) -> f64;
    unsafe fn value_text(&self, v: NonNull<Self::Value>) -> RawBytes;
    unsafe fn value_blob(&self, v: NonNull<Self::Value>) -> RawBytes;
}

pub type BusyCallback = extern "C" fn(*mut c_void, i32) -> i32;
pub type ProgressCallback = extern "C" fn(*mut c_void) -> i32;
pub type UpdateCallback = extern "C" fn(*mut c_void, i32, *const c_char, *const c_char, i64);
pub type CommitCallback = extern "C" fn(*mut c_void) -> i32;
pub type RollbackCallback = extern "C" fn(*mut c_void);

/// Optional backend extension for connection hooks.
///
/// # Safety
/// Implementations must hand `context` back unchanged to the callback and stop
/// using it once the hook is replaced or cleared.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Hooks: Sqlite3Api {
    /// Set busy timeout in milliseconds. Replaces any busy handler.
    unsafe fn busy_timeout(&self, db: NonNull<Self::Db>, ms: i32) -> Result<()>;
    unsafe fn busy_handler(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<BusyCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    unsafe fn progress_handler(
        &self,
        db: NonNull<Self::Db>,
        n: i32,
        callback: Option<ProgressCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    unsafe fn update_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<UpdateCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    unsafe fn commit_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<CommitCallback>,
        context: *mut c_void,
    ) -> Result<()>;
    unsafe fn rollback_hook(
        &self,
        db: NonNull<Self::Db>,
        callback: Option<RollbackCallback>,
        context: *mut c_void,
    ) -> Result<()>;
}

/// Optional backend extension for online backup.
///
/// # Safety
/// Backup handles must stay tied to the database handles they were created
/// from and follow SQLite's backup lifecycle.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Backup: Sqlite3Api {
    type Backup;

    unsafe fn backup_init(
        &self,
        dest_db: NonNull<Self::Db>,
        dest_name: &[u8],
        source_db: NonNull<Self::Db>,
        source_name: &[u8],
    ) -> Result<NonNull<Self::Backup>>;
    /// Copy up to `pages` pages (negative copies everything).
    unsafe fn backup_step(&self, backup: NonNull<Self::Backup>, pages: i32) -> Result<BackupStep>;
    unsafe fn backup_remaining(&self, backup: NonNull<Self::Backup>) -> i32;
    unsafe fn backup_pagecount(&self, backup: NonNull<Self::Backup>) -> i32;
    unsafe fn backup_finish(&self, backup: NonNull<Self::Backup>) -> Result<()>;

    /// Block the calling thread between retries.
    fn sleep(&self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

/// Optional backend extension for metadata helpers.
///
/// # Safety
/// Returned raw pointers must follow SQLite's documented lifetimes.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Sqlite3Metadata: Sqlite3Api {
    unsafe fn table_column_metadata(
        &self,
        db: NonNull<Self::Db>,
        db_name: Option<&[u8]>,
        table: &[u8],
        column: &[u8],
    ) -> Result<ColumnMetadata>;
    unsafe fn column_decltype(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    unsafe fn column_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    unsafe fn column_table_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Source column name (`sqlite3_column_origin_name`).
    unsafe fn column_origin_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
    /// Source database name (`sqlite3_column_database_name`).
    unsafe fn column_database_name(&self, stmt: NonNull<Self::Stmt>, col: i32) -> RawBytes;
}
