//! Contracts implemented by host code that the engine calls back into.

use core::fmt;

use crate::error::Error;

/// Failure raised by host code inside a callback.
///
/// The description is host text (UTF-16). A missing description means it
/// could not be obtained, which the bridge reports as memory exhaustion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostException {
    description: Option<Vec<u16>>,
}

/// Result of a host callback.
pub type HostResult<T> = core::result::Result<T, HostException>;

impl HostException {
    pub fn new(message: &str) -> Self {
        Self {
            description: Some(message.encode_utf16().collect()),
        }
    }

    pub fn from_utf16(units: Vec<u16>) -> Self {
        Self {
            description: Some(units),
        }
    }

    /// Exception whose description is unavailable.
    pub fn opaque() -> Self {
        Self { description: None }
    }

    pub fn description(&self) -> Option<&[u16]> {
        self.description.as_deref()
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(units) => write!(f, "{}", String::from_utf16_lossy(units)),
            None => write!(f, "host exception without description"),
        }
    }
}

impl std::error::Error for HostException {}

impl From<Error> for HostException {
    fn from(err: Error) -> Self {
        match err {
            Error::OutOfMemory => HostException::opaque(),
            other => HostException::new(&other.to_string()),
        }
    }
}

/// Called when a table is locked; return non-zero to retry.
pub trait BusyHandler: Send + Sync + 'static {
    fn on_busy(&self, invocations: i32) -> HostResult<i32>;
}

impl<F> BusyHandler for F
where
    F: Fn(i32) -> HostResult<i32> + Send + Sync + 'static,
{
    fn on_busy(&self, invocations: i32) -> HostResult<i32> {
        self(invocations)
    }
}

/// Called periodically during statement execution; non-zero aborts it.
pub trait ProgressHandler: Send + Sync + 'static {
    fn on_progress(&self) -> HostResult<i32>;
}

impl<F> ProgressHandler for F
where
    F: Fn() -> HostResult<i32> + Send + Sync + 'static,
{
    fn on_progress(&self) -> HostResult<i32> {
        self()
    }
}

/// Row change reported by the update hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEvent {
    /// `SQLITE_INSERT`, `SQLITE_DELETE` or `SQLITE_UPDATE`.
    pub operation: i32,
    pub database: Vec<u16>,
    pub table: Vec<u16>,
    pub rowid: i64,
}

impl UpdateEvent {
    pub const DELETE: i32 = 9;
    pub const INSERT: i32 = 18;
    pub const UPDATE: i32 = 23;
}

pub trait UpdateListener: Send + Sync + 'static {
    fn on_update(&self, event: &UpdateEvent) -> HostResult<()>;
}

impl<F> UpdateListener for F
where
    F: Fn(&UpdateEvent) -> HostResult<()> + Send + Sync + 'static,
{
    fn on_update(&self, event: &UpdateEvent) -> HostResult<()> {
        self(event)
    }
}

/// Told about every commit (`true`) and rollback (`false`).
pub trait CommitListener: Send + Sync + 'static {
    fn on_commit(&self, commit: bool) -> HostResult<()>;
}

impl<F> CommitListener for F
where
    F: Fn(bool) -> HostResult<()> + Send + Sync + 'static,
{
    fn on_commit(&self, commit: bool) -> HostResult<()> {
        self(commit)
    }
}

/// Receives page counts after every backup or restore step.
pub trait BackupObserver {
    fn on_progress(&self, remaining: i32, page_count: i32);
}

impl<F> BackupObserver for F
where
    F: Fn(i32, i32),
{
    fn on_progress(&self, remaining: i32, page_count: i32) {
        self(remaining, page_count)
    }
}
