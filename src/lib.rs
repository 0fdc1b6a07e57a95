//! Marshaling layer between a managed host runtime and SQLite.
//!
//! The engine is reached through the [`Sqlite3Api`] provider traits; a
//! [`NativeDb`] owns one connection and every statement, function
//! registration and hook context created through it.

mod backup;
pub mod codec;
pub mod config;
mod db;
mod error;
mod function;
mod hooks;
mod host;
mod provider;
pub mod runtime;

pub use crate::codec::{HostText, SurrogatePolicy, TextCodec, TextMode, TextValue};
pub use crate::config::BridgeConfig;
pub use crate::db::{NativeDb, StmtHandle};
pub use crate::error::{Error, ErrorCode, Result};
pub use crate::function::{Call, CallContext, Function, FunctionBody, FunctionKind};
pub use crate::hooks::HookKind;
pub use crate::host::{
    BackupObserver, BusyHandler, CommitListener, HostException, HostResult, ProgressHandler,
    UpdateEvent, UpdateListener,
};
pub use crate::provider::{
    ApiVersion, BackupStep, BusyCallback, ColumnMetadata, CommitCallback, FeatureSet,
    FunctionFlags, OpenFlags, ProgressCallback, RawBytes, RollbackCallback, Sqlite3Api,
    Sqlite3Backup, Sqlite3Hooks, Sqlite3Metadata, StepResult, UpdateCallback, ValueType,
};
pub use crate::runtime::{HostRuntime, LocalRuntime};
