use core::ffi::c_void;
use core::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::codec::{self, HostText, SurrogatePolicy, TextCodec, TextMode, TextValue};
use crate::error::{Error, Result};
use crate::host::{HostException, HostResult};
use crate::provider::{FeatureSet, FunctionFlags, Sqlite3Api, ValueType};
use crate::runtime::{self, HostRuntime};

/// Shape of a user-defined function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    /// `step`/`final` aggregate.
    Aggregate,
    /// Aggregate that also supports `value`/`inverse` over a sliding frame.
    Window,
}

/// Host-visible call state of a function object.
///
/// Holds the engine's result context, argument array and argument count
/// while an invocation runs; all three read back as zero otherwise.
#[derive(Debug, Default)]
pub struct CallContext {
    context: AtomicUsize,
    value: AtomicUsize,
    args: AtomicI32,
}

impl CallContext {
    pub fn context(&self) -> usize {
        self.context.load(Ordering::Acquire)
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    pub fn args(&self) -> i32 {
        self.args.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.context() != 0
    }

    /// Publish one invocation's engine state. Overlapping invocations of the
    /// same function each get their own `Call`; these fields only mirror the
    /// most recent one.
    fn arm(&self, context: usize, value: usize, args: i32) -> Armed<'_> {
        self.context.store(context, Ordering::Release);
        self.value.store(value, Ordering::Release);
        self.args.store(args, Ordering::Release);
        Armed { call: self }
    }
}

/// Clears the call fields when an invocation ends, however it ends.
struct Armed<'a> {
    call: &'a CallContext,
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        self.call.context.store(0, Ordering::Release);
        self.call.value.store(0, Ordering::Release);
        self.call.args.store(0, Ordering::Release);
    }
}

/// Host implementation of a user-defined function.
///
/// Only the entry points matching the function's kind are called. Aggregate
/// and window bodies must implement `clone_body`: every aggregation group
/// runs on its own clone.
pub trait FunctionBody<P: Sqlite3Api>: Send + Sync + 'static {
    fn x_func(&self, _call: &Call<'_, P>) -> HostResult<()> {
        Err(HostException::new("xFunc not implemented"))
    }

    fn x_step(&self, _call: &Call<'_, P>) -> HostResult<()> {
        Err(HostException::new("xStep not implemented"))
    }

    fn x_final(&self, _call: &Call<'_, P>) -> HostResult<()> {
        Err(HostException::new("xFinal not implemented"))
    }

    fn x_value(&self, _call: &Call<'_, P>) -> HostResult<()> {
        Err(HostException::new("xValue not implemented"))
    }

    fn x_inverse(&self, _call: &Call<'_, P>) -> HostResult<()> {
        Err(HostException::new("xInverse not implemented"))
    }

    fn clone_body(&self) -> HostResult<Box<dyn FunctionBody<P>>> {
        Err(HostException::new("function cannot be cloned"))
    }
}

/// Function object handed to `create_function`.
pub struct Function<P: Sqlite3Api> {
    kind: FunctionKind,
    body: Box<dyn FunctionBody<P>>,
    call: CallContext,
}

impl<P: Sqlite3Api> Function<P> {
    pub fn new(kind: FunctionKind, body: Box<dyn FunctionBody<P>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            body,
            call: CallContext::default(),
        })
    }

    pub fn scalar(body: impl FunctionBody<P>) -> Arc<Self> {
        Self::new(FunctionKind::Scalar, Box::new(body))
    }

    pub fn aggregate(body: impl FunctionBody<P>) -> Arc<Self> {
        Self::new(FunctionKind::Aggregate, Box::new(body))
    }

    pub fn window(body: impl FunctionBody<P>) -> Arc<Self> {
        Self::new(FunctionKind::Window, Box::new(body))
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn call_context(&self) -> &CallContext {
        &self.call
    }

    fn clone_instance(&self) -> HostResult<Arc<Self>> {
        Ok(Self::new(self.kind, self.body.clone_body()?))
    }
}

/// Argument and result access for one invocation.
///
/// Carries the engine pointers of the invocation it was built for; a `Call`
/// only lives for the duration of that invocation.
pub struct Call<'a, P: Sqlite3Api> {
    api: &'a P,
    call: &'a CallContext,
    codec: TextCodec,
    ctx: *mut P::Context,
    argv: *mut *mut P::Value,
    argc: i32,
}

impl<'a, P: Sqlite3Api> Call<'a, P> {
    pub(crate) fn new(
        api: &'a P,
        call: &'a CallContext,
        codec: TextCodec,
        ctx: NonNull<P::Context>,
        argv: *mut *mut P::Value,
        argc: i32,
    ) -> Self {
        Self {
            api,
            call,
            codec,
            ctx: ctx.as_ptr(),
            argv,
            argc,
        }
    }

    pub fn call_context(&self) -> &CallContext {
        self.call
    }

    pub fn args(&self) -> i32 {
        self.argc
    }

    fn value(&self, arg: i32) -> Result<NonNull<P::Value>> {
        if self.argv.is_null() {
            return Err(Error::misuse("no current value"));
        }
        if arg < 0 {
            return Err(Error::misuse("negative arg out of range"));
        }
        if arg >= self.argc {
            return Err(Error::misuse("arg out of range"));
        }
        let value = unsafe { *self.argv.add(arg as usize) };
        NonNull::new(value).ok_or_else(|| Error::misuse("no current value"))
    }

    fn context(&self) -> Result<NonNull<P::Context>> {
        NonNull::new(self.ctx).ok_or_else(|| Error::misuse("no current context"))
    }

    pub fn value_type(&self, arg: i32) -> Result<ValueType> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_type(value) })
    }

    pub fn value_int(&self, arg: i32) -> Result<i32> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_int(value) })
    }

    pub fn value_long(&self, arg: i32) -> Result<i64> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_int64(value) })
    }

    pub fn value_double(&self, arg: i32) -> Result<f64> {
        let value = self.value(arg)?;
        Ok(unsafe { self.api.value_double(value) })
    }

    /// Text of argument `arg`; `None` for SQL NULL.
    pub fn value_text(&self, arg: i32, mode: TextMode) -> Result<Option<TextValue<'a>>> {
        let value = self.value(arg)?;
        let raw = unsafe { self.api.value_text(value) };
        if raw.is_null() {
            if unsafe { self.api.value_type(value) } == ValueType::Null {
                return Ok(None);
            }
            return Err(Error::OutOfMemory);
        }
        self.codec.decode(unsafe { raw.as_slice() }, mode).map(Some)
    }

    /// Bytes of argument `arg`; `None` for SQL NULL, empty for a zero-length blob.
    pub fn value_blob(&self, arg: i32) -> Result<Option<Vec<u8>>> {
        let value = self.value(arg)?;
        let kind = unsafe { self.api.value_type(value) };
        let raw = unsafe { self.api.value_blob(value) };
        if raw.is_null() {
            return Ok(match kind {
                ValueType::Null => None,
                _ => Some(Vec::new()),
            });
        }
        Ok(Some(unsafe { raw.as_slice() }.to_vec()))
    }

    pub fn result_null(&self) -> Result<()> {
        let ctx = self.context()?;
        unsafe { self.api.result_null(ctx) };
        Ok(())
    }

    pub fn result_int(&self, v: i32) -> Result<()> {
        let ctx = self.context()?;
        unsafe { self.api.result_int(ctx, v) };
        Ok(())
    }

    pub fn result_long(&self, v: i64) -> Result<()> {
        let ctx = self.context()?;
        unsafe { self.api.result_int64(ctx, v) };
        Ok(())
    }

    pub fn result_double(&self, v: f64) -> Result<()> {
        let ctx = self.context()?;
        unsafe { self.api.result_double(ctx, v) };
        Ok(())
    }

    /// Text result; `None` sets SQL NULL.
    pub fn result_text(&self, v: Option<HostText<'_>>, mode: TextMode) -> Result<()> {
        let ctx = self.context()?;
        match v {
            Some(text) => {
                let bytes = self.codec.encode(text, mode)?;
                unsafe { self.api.result_text(ctx, &bytes) };
            }
            None => unsafe { self.api.result_null(ctx) },
        }
        Ok(())
    }

    /// Blob result; `None` sets SQL NULL.
    pub fn result_blob(&self, v: Option<&[u8]>) -> Result<()> {
        let ctx = self.context()?;
        match v {
            Some(bytes) => unsafe { self.api.result_blob(ctx, bytes) },
            None => unsafe { self.api.result_null(ctx) },
        }
        Ok(())
    }

    pub fn result_error(&self, message: HostText<'_>, mode: TextMode) -> Result<()> {
        let ctx = self.context()?;
        let bytes = self.codec.encode(message, mode)?;
        unsafe { self.api.result_error(ctx, &bytes) };
        Ok(())
    }
}

/// Engine-side registration: what `user_data` points at.
pub(crate) struct Registration<P: Sqlite3Api> {
    api: *const P,
    runtime: Arc<dyn HostRuntime>,
    function: Arc<Function<P>>,
    codec: TextCodec,
}

// `api` is a shared reference to a `Sync` provider that outlives the connection.
unsafe impl<P: Sqlite3Api> Send for Registration<P> {}
unsafe impl<P: Sqlite3Api> Sync for Registration<P> {}

impl<P: Sqlite3Api> Registration<P> {
    fn api(&self) -> &P {
        unsafe { &*self.api }
    }
}

extern "C" fn release_registration<P: Sqlite3Api>(user_data: *mut c_void) {
    if user_data.is_null() {
        return;
    }
    unsafe { drop(Arc::from_raw(user_data as *const Registration<P>)) };
}

/// Register `function` with the engine under `name`.
///
/// The engine receives its own reference, released through its destructor
/// callback; the returned one belongs to the connection's function list.
pub(crate) fn register<P: Sqlite3Api>(
    api: &P,
    db: NonNull<P::Db>,
    name: &[u8],
    function: Arc<Function<P>>,
    n_args: i32,
    flags: FunctionFlags,
    runtime: Arc<dyn HostRuntime>,
    codec: TextCodec,
) -> Result<Arc<Registration<P>>> {
    let kind = function.kind();
    let registration = Arc::new(Registration {
        api: api as *const P,
        runtime,
        function,
        codec,
    });
    let user_data = Arc::into_raw(Arc::clone(&registration)) as *mut c_void;
    let destroy = Some(release_registration::<P> as extern "C" fn(*mut c_void));
    let windows = api.feature_set().contains(FeatureSet::WINDOW_FUNCTIONS);
    unsafe {
        match kind {
            FunctionKind::Scalar => api.create_function_v2(
                db,
                name,
                n_args,
                flags,
                Some(x_func::<P>),
                None,
                None,
                user_data,
                destroy,
            ),
            FunctionKind::Aggregate if !windows => api.create_function_v2(
                db,
                name,
                n_args,
                flags,
                None,
                Some(x_step::<P>),
                Some(x_final::<P>),
                user_data,
                destroy,
            ),
            FunctionKind::Aggregate => api.create_window_function(
                db,
                name,
                n_args,
                flags,
                Some(x_step::<P>),
                Some(x_final::<P>),
                None,
                None,
                user_data,
                destroy,
            ),
            FunctionKind::Window => api.create_window_function(
                db,
                name,
                n_args,
                flags,
                Some(x_step::<P>),
                Some(x_final::<P>),
                Some(x_value::<P>),
                Some(x_inverse::<P>),
                user_data,
                destroy,
            ),
        }
    }?;
    Ok(registration)
}

/// Drop the engine's definition of `name`/`n_args`.
pub(crate) fn unregister<P: Sqlite3Api>(
    api: &P,
    db: NonNull<P::Db>,
    name: &[u8],
    n_args: i32,
) -> Result<()> {
    unsafe {
        api.create_function_v2(
            db,
            name,
            n_args,
            FunctionFlags::empty(),
            None,
            None,
            None,
            core::ptr::null_mut(),
            None,
        )
    }
}

unsafe fn registration<'r, P: Sqlite3Api>(ctx: NonNull<P::Context>) -> Option<&'r Registration<P>> {
    let user_data = unsafe { P::user_data(ctx) };
    if user_data.is_null() {
        return None;
    }
    Some(unsafe { &*(user_data as *const Registration<P>) })
}

/// Attach the calling thread before any host code runs.
fn enter<P: Sqlite3Api>(reg: &Registration<P>, ctx: NonNull<P::Context>) -> bool {
    match runtime::ensure_attached(&reg.runtime) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(error = %err, "cannot attach callback thread to host runtime");
            unsafe { reg.api().result_error(ctx, b"cannot attach thread to host runtime") };
            false
        }
    }
}

/// Convert a host failure into the engine's error result for this call.
fn report_exception<P: Sqlite3Api>(api: &P, ctx: NonNull<P::Context>, exc: &HostException) {
    let Some(units) = exc.description() else {
        unsafe { api.result_error_nomem(ctx) };
        return;
    };
    let message = codec::utf16_to_utf8(units, SurrogatePolicy::Strict)
        .unwrap_or_else(|_| String::from_utf16_lossy(units).into_bytes());
    unsafe { api.result_error(ctx, &message) };
}

fn invoke<P, F>(
    reg: &Registration<P>,
    ctx: NonNull<P::Context>,
    target: &Function<P>,
    argc: i32,
    argv: *mut *mut P::Value,
    f: F,
) where
    P: Sqlite3Api,
    F: FnOnce(&dyn FunctionBody<P>, &Call<'_, P>) -> HostResult<()>,
{
    let api = reg.api();
    let argc = if argv.is_null() { 0 } else { argc.max(0) };
    let armed = target.call.arm(ctx.as_ptr() as usize, argv as usize, argc);
    let call = Call::new(api, &target.call, reg.codec, ctx, argv, argc);
    let out = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        f(target.body.as_ref(), &call)
    }));
    drop(armed);
    match out {
        Ok(Ok(())) => {}
        Ok(Err(exc)) => report_exception(api, ctx, &exc),
        Err(_) => unsafe { api.result_error(ctx, b"panic in user-defined function") },
    }
}

type GroupSlot<P> = *const Function<P>;

/// Per-group clone stored in the engine's aggregate scratch slot, created on
/// first use.
fn group_instance<P: Sqlite3Api>(
    reg: &Registration<P>,
    ctx: NonNull<P::Context>,
) -> Option<*mut GroupSlot<P>> {
    let api = reg.api();
    let slot = unsafe { api.aggregate_context(ctx, core::mem::size_of::<GroupSlot<P>>()) }
        as *mut GroupSlot<P>;
    if slot.is_null() {
        unsafe { api.result_error_nomem(ctx) };
        return None;
    }
    if unsafe { (*slot).is_null() } {
        let cloned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reg.function.clone_instance()
        }));
        match cloned {
            Ok(Ok(instance)) => unsafe { *slot = Arc::into_raw(instance) },
            Ok(Err(exc)) => {
                report_exception(api, ctx, &exc);
                return None;
            }
            Err(_) => {
                unsafe { api.result_error(ctx, b"panic while cloning aggregate") };
                return None;
            }
        }
    }
    Some(slot)
}

extern "C" fn x_func<P: Sqlite3Api>(ctx: *mut P::Context, argc: i32, argv: *mut *mut P::Value) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(reg) = (unsafe { registration::<P>(ctx) }) else { return };
    if !enter(reg, ctx) {
        return;
    }
    invoke(reg, ctx, &reg.function, argc, argv, |body, call| body.x_func(call));
}

fn group_call<P, F>(ctx: *mut P::Context, argc: i32, argv: *mut *mut P::Value, f: F)
where
    P: Sqlite3Api,
    F: FnOnce(&dyn FunctionBody<P>, &Call<'_, P>) -> HostResult<()>,
{
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(reg) = (unsafe { registration::<P>(ctx) }) else { return };
    if !enter(reg, ctx) {
        return;
    }
    let Some(slot) = group_instance(reg, ctx) else { return };
    let instance = unsafe { &**slot };
    invoke(reg, ctx, instance, argc, argv, f);
}

extern "C" fn x_step<P: Sqlite3Api>(ctx: *mut P::Context, argc: i32, argv: *mut *mut P::Value) {
    group_call::<P, _>(ctx, argc, argv, |body, call| body.x_step(call));
}

extern "C" fn x_inverse<P: Sqlite3Api>(ctx: *mut P::Context, argc: i32, argv: *mut *mut P::Value) {
    group_call::<P, _>(ctx, argc, argv, |body, call| body.x_inverse(call));
}

extern "C" fn x_value<P: Sqlite3Api>(ctx: *mut P::Context) {
    group_call::<P, _>(ctx, 0, core::ptr::null_mut(), |body, call| body.x_value(call));
}

extern "C" fn x_final<P: Sqlite3Api>(ctx: *mut P::Context) {
    let Some(ctx) = NonNull::new(ctx) else { return };
    let Some(reg) = (unsafe { registration::<P>(ctx) }) else { return };
    if !enter(reg, ctx) {
        return;
    }
    // Zero-row groups never ran a step; clone here so every group ends the same way.
    let Some(slot) = group_instance(reg, ctx) else { return };
    let instance = unsafe { Arc::from_raw(*slot) };
    unsafe { *slot = core::ptr::null() };
    invoke(reg, ctx, &instance, 0, core::ptr::null_mut(), |body, call| {
        body.x_final(call)
    });
    drop(instance);
}
