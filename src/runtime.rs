//! Managed-runtime thread attachment.
//!
//! The engine may call back from threads the host runtime has never seen.
//! Every callback boundary calls [`ensure_attached`] first; the attachment is
//! remembered per thread and released when the thread exits.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Capability to bind native threads to the managed host runtime.
pub trait HostRuntime: Send + Sync + 'static {
    /// Make the calling thread able to run host code.
    fn attach_current_thread(&self) -> Result<()>;
    /// Undo `attach_current_thread`. Called once, at thread exit.
    fn detach_current_thread(&self);
}

struct Attachment {
    runtime: Arc<dyn HostRuntime>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.runtime.detach_current_thread();
    }
}

thread_local! {
    static ATTACHED: RefCell<Vec<Attachment>> = const { RefCell::new(Vec::new()) };
}

fn runtime_id(runtime: &Arc<dyn HostRuntime>) -> usize {
    Arc::as_ptr(runtime) as *const () as usize
}

/// Attach the calling thread to `runtime` unless it already is.
pub fn ensure_attached(runtime: &Arc<dyn HostRuntime>) -> Result<()> {
    let id = runtime_id(runtime);
    ATTACHED
        .try_with(|cell| {
            let mut attached = cell.borrow_mut();
            if attached.iter().any(|a| runtime_id(&a.runtime) == id) {
                return Ok(());
            }
            runtime.attach_current_thread()?;
            tracing::trace!(
                thread = ?std::thread::current().id(),
                "attached thread to host runtime"
            );
            attached.push(Attachment {
                runtime: Arc::clone(runtime),
            });
            Ok(())
        })
        .unwrap_or_else(|_| Err(Error::misuse("thread is shutting down")))
}

/// Whether the calling thread is attached to `runtime`.
pub fn is_attached(runtime: &Arc<dyn HostRuntime>) -> bool {
    let id = runtime_id(runtime);
    ATTACHED
        .try_with(|cell| cell.borrow().iter().any(|a| runtime_id(&a.runtime) == id))
        .unwrap_or(false)
}

/// Runtime for hosts living in this process; attachment only keeps count.
#[derive(Debug, Default)]
pub struct LocalRuntime {
    attached: AtomicUsize,
}

impl LocalRuntime {
    pub fn new() -> Arc<dyn HostRuntime> {
        Arc::new(LocalRuntime::default())
    }

    pub fn attached_threads(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }
}

impl HostRuntime for LocalRuntime {
    fn attach_current_thread(&self) -> Result<()> {
        self.attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach_current_thread(&self) {
        self.attached.fetch_sub(1, Ordering::SeqCst);
    }
}
