//! Busy, progress, update and commit/rollback dispatch.
//!
//! Each connection owns a table with one slot per hook kind. A slot owns the
//! boxed context whose address the engine hands back to the trampolines.
//! Installing a subscriber registers the new context with the engine before
//! the old one is dropped, and a context the engine may still reference is
//! never freed.

use core::ffi::{CStr, c_char, c_void};
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::Arc;

use crate::codec;
use crate::db::NativeDb;
use crate::error::{Error, Result};
use crate::host::{BusyHandler, CommitListener, ProgressHandler, UpdateEvent, UpdateListener};
use crate::provider::{
    BusyCallback, CommitCallback, ProgressCallback, RollbackCallback, Sqlite3Hooks, UpdateCallback,
};
use crate::runtime::{self, HostRuntime};

/// Hook slots of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Busy,
    Progress,
    Update,
    /// Commit and rollback share one context.
    Commit,
}

enum Subscriber {
    Busy(Arc<dyn BusyHandler>),
    Progress(Arc<dyn ProgressHandler>),
    Update(Arc<dyn UpdateListener>),
    Commit(Arc<dyn CommitListener>),
}

struct HookState {
    runtime: Arc<dyn HostRuntime>,
    subscriber: Subscriber,
}

impl HookState {
    fn as_context(&self) -> *mut c_void {
        self as *const HookState as *mut c_void
    }
}

/// Per-connection hook contexts.
#[derive(Default)]
pub(crate) struct HookTable {
    slots: HashMap<HookKind, Box<HookState>>,
}

impl HookTable {
    pub(crate) fn is_installed(&self, kind: HookKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Drop every context. Only valid once the engine can no longer call them.
    pub(crate) fn release_all(&mut self) {
        self.slots.clear();
    }

    /// Empty the slot for `kind` without freeing its context.
    fn leak(&mut self, kind: HookKind) {
        if let Some(state) = self.slots.remove(&kind) {
            tracing::warn!(?kind, "hook context left registered after a failed update");
            Box::leak(state);
        }
    }

    /// Give up every context without freeing it.
    pub(crate) fn leak_all(&mut self) {
        for (_, state) in self.slots.drain() {
            Box::leak(state);
        }
    }
}

unsafe fn hook_state<'a>(ctx: *mut c_void) -> Option<&'a HookState> {
    if ctx.is_null() {
        return None;
    }
    Some(unsafe { &*(ctx as *const HookState) })
}

fn attach(state: &HookState) -> bool {
    match runtime::ensure_attached(&state.runtime) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(error = %err, "cannot attach hook thread to host runtime");
            false
        }
    }
}

extern "C" fn busy_trampoline(ctx: *mut c_void, invocations: i32) -> i32 {
    let Some(state) = (unsafe { hook_state(ctx) }) else { return 0 };
    let Subscriber::Busy(handler) = &state.subscriber else { return 0 };
    let handler = Arc::clone(handler);
    if !attach(state) {
        return 0;
    }
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.on_busy(invocations))) {
        Ok(Ok(retry)) => retry,
        Ok(Err(exc)) => {
            tracing::warn!(error = %exc, "busy handler raised, giving up");
            0
        }
        Err(_) => {
            tracing::warn!("busy handler panicked, giving up");
            0
        }
    }
}

extern "C" fn progress_trampoline(ctx: *mut c_void) -> i32 {
    // Fail closed: anything but a clean zero interrupts the statement.
    let Some(state) = (unsafe { hook_state(ctx) }) else { return 1 };
    let Subscriber::Progress(handler) = &state.subscriber else { return 1 };
    let handler = Arc::clone(handler);
    if !attach(state) {
        return 1;
    }
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.on_progress())) {
        Ok(Ok(out)) => out,
        Ok(Err(exc)) => {
            tracing::warn!(error = %exc, "progress handler raised, interrupting");
            1
        }
        Err(_) => {
            tracing::warn!("progress handler panicked, interrupting");
            1
        }
    }
}

fn engine_name(raw: *const c_char) -> Vec<u16> {
    if raw.is_null() {
        return Vec::new();
    }
    let bytes = unsafe { CStr::from_ptr(raw) }.to_bytes();
    codec::utf8_to_utf16(bytes)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).encode_utf16().collect())
}

extern "C" fn update_trampoline(
    ctx: *mut c_void,
    operation: i32,
    database: *const c_char,
    table: *const c_char,
    rowid: i64,
) {
    let Some(state) = (unsafe { hook_state(ctx) }) else { return };
    let Subscriber::Update(listener) = &state.subscriber else { return };
    let listener = Arc::clone(listener);
    if !attach(state) {
        return;
    }
    let event = UpdateEvent {
        operation,
        database: engine_name(database),
        table: engine_name(table),
        rowid,
    };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.on_update(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(exc)) => tracing::warn!(error = %exc, "update listener raised"),
        Err(_) => tracing::warn!("update listener panicked"),
    }
}

fn notify_commit(ctx: *mut c_void, commit: bool) {
    let Some(state) = (unsafe { hook_state(ctx) }) else { return };
    let Subscriber::Commit(listener) = &state.subscriber else { return };
    let listener = Arc::clone(listener);
    if !attach(state) {
        return;
    }
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.on_commit(commit))) {
        Ok(Ok(())) => {}
        Ok(Err(exc)) => tracing::warn!(error = %exc, commit, "commit listener raised"),
        Err(_) => tracing::warn!(commit, "commit listener panicked"),
    }
}

extern "C" fn commit_trampoline(ctx: *mut c_void) -> i32 {
    notify_commit(ctx, true);
    0
}

extern "C" fn rollback_trampoline(ctx: *mut c_void) {
    notify_commit(ctx, false);
}

/// A registration that failed, possibly halfway.
struct RegisterError {
    error: Error,
    /// The engine may still hold a context involved in the registration.
    stale: bool,
}

impl From<Error> for RegisterError {
    fn from(error: Error) -> Self {
        Self {
            error,
            stale: false,
        }
    }
}

unsafe fn register_hook<P: Sqlite3Hooks>(
    api: &P,
    db: NonNull<P::Db>,
    kind: HookKind,
    ctx: *mut c_void,
    progress_steps: i32,
) -> core::result::Result<(), RegisterError> {
    let on = !ctx.is_null();
    unsafe {
        match kind {
            HookKind::Busy => {
                api.busy_handler(db, on.then_some(busy_trampoline as BusyCallback), ctx)?;
            }
            HookKind::Progress => api.progress_handler(
                db,
                if on { progress_steps } else { 0 },
                on.then_some(progress_trampoline as ProgressCallback),
                ctx,
            )?,
            HookKind::Update => {
                api.update_hook(db, on.then_some(update_trampoline as UpdateCallback), ctx)?;
            }
            HookKind::Commit => {
                api.commit_hook(db, on.then_some(commit_trampoline as CommitCallback), ctx)?;
                let rollback = on.then_some(rollback_trampoline as RollbackCallback);
                if let Err(error) = api.rollback_hook(db, rollback, ctx) {
                    if let Err(err) = api.commit_hook(db, None, core::ptr::null_mut()) {
                        tracing::warn!(error = %err, "clearing commit hook failed");
                    }
                    return Err(RegisterError { error, stale: true });
                }
            }
        }
    }
    Ok(())
}

impl<'p, P: Sqlite3Hooks> NativeDb<'p, P> {
    fn install_hook(
        &self,
        kind: HookKind,
        subscriber: Subscriber,
        progress_steps: i32,
    ) -> Result<()> {
        let db = self.db()?;
        let state = Box::new(HookState {
            runtime: Arc::clone(&self.runtime),
            subscriber,
        });
        let mut table = self.lock_state();
        let ctx = state.as_context();
        if let Err(failure) = unsafe { register_hook(self.api, db, kind, ctx, progress_steps) } {
            if failure.stale {
                table.hooks.leak(kind);
                Box::leak(state);
            }
            return Err(failure.error);
        }
        // The engine now points at the new context; the old one is unreachable.
        let previous = table.hooks.slots.insert(kind, state);
        drop(previous);
        Ok(())
    }

    fn clear_hook(&self, kind: HookKind) -> Result<()> {
        let db = self.db()?;
        let mut table = self.lock_state();
        let cleared = unsafe { register_hook(self.api, db, kind, core::ptr::null_mut(), 0) };
        if let Err(failure) = cleared {
            if failure.stale {
                table.hooks.leak(kind);
            }
            return Err(failure.error);
        }
        table.hooks.slots.remove(&kind);
        Ok(())
    }

    /// Wait up to `ms` milliseconds on locked tables. Replaces any busy handler.
    pub fn busy_timeout(&self, ms: i32) -> Result<()> {
        let db = self.db()?;
        let mut table = self.lock_state();
        unsafe { self.api.busy_timeout(db, ms)? };
        table.hooks.slots.remove(&HookKind::Busy);
        Ok(())
    }

    /// Install or, with `None`, remove the busy handler.
    pub fn busy_handler(&self, handler: Option<Arc<dyn BusyHandler>>) -> Result<()> {
        match handler {
            Some(handler) => self.install_hook(HookKind::Busy, Subscriber::Busy(handler), 0),
            None => self.clear_hook(HookKind::Busy),
        }
    }

    /// Call `handler` every `steps` virtual machine instructions.
    pub fn register_progress_handler(
        &self,
        steps: i32,
        handler: Arc<dyn ProgressHandler>,
    ) -> Result<()> {
        self.install_hook(HookKind::Progress, Subscriber::Progress(handler), steps)
    }

    pub fn clear_progress_handler(&self) -> Result<()> {
        self.clear_hook(HookKind::Progress)
    }

    /// Install or, with `None`, remove the row change listener.
    pub fn set_update_listener(&self, listener: Option<Arc<dyn UpdateListener>>) -> Result<()> {
        match listener {
            Some(listener) => self.install_hook(HookKind::Update, Subscriber::Update(listener), 0),
            None => self.clear_hook(HookKind::Update),
        }
    }

    /// Install or, with `None`, remove the commit/rollback listener.
    pub fn set_commit_listener(&self, listener: Option<Arc<dyn CommitListener>>) -> Result<()> {
        match listener {
            Some(listener) => self.install_hook(HookKind::Commit, Subscriber::Commit(listener), 0),
            None => self.clear_hook(HookKind::Commit),
        }
    }

    /// Whether a subscriber is installed for `kind`.
    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.lock_state().hooks.is_installed(kind)
    }
}
