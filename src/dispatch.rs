//! Handing an exception to the personality routine of a frame.

use crate::{
    descriptor::UnwindDescriptor,
    error::{Result, UnwindError},
    memory::Memory,
    scope::{resolve_scope, ScopeMatch},
    seh::EXCEPTION_DISPOSITION,
    snapshot::{ContextAdapter, RegisterSnapshot},
    table::{FunctionEntry, RuntimeFunction},
};

/// Everything a personality routine gets to know about the frame it is
/// called for. Lives for a single invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchContext {
    pub control_pc: u64,
    pub image_base: u64,
    /// The stack pointer identifying the frame being dispatched to.
    pub establisher_frame: u64,
    pub handler: u64,
    /// Address of the handler data that follows the handler RVA.
    pub handler_data: u64,
    pub function_entry: RuntimeFunction,
}

/// Calls personality routines. The live implementation jumps to native
/// code; tests substitute their own.
pub trait HandlerInvoker {
    /// The native register block handed to the routine.
    type Context: ContextAdapter;
    /// Whatever describes the exception being dispatched.
    type Exception: ?Sized;

    /// Calls the routine at `handler` and returns its raw disposition.
    fn invoke(
        &self,
        handler: u64,
        exception: &mut Self::Exception,
        context: &mut Self::Context,
        dispatch: &DispatchContext,
    ) -> i32;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub disposition: EXCEPTION_DISPOSITION,
    /// The snapshot after the routine ran, resynchronised from the native
    /// context if the routine changed it.
    pub snapshot: RegisterSnapshot,
    pub context_modified: bool,
    pub scope: Option<ScopeMatch>,
}

#[instrument(level = "debug", skip_all, fields(ip = snapshot.ip))]
pub fn dispatch_exception<M, I>(
    memory: &M,
    invoker: &I,
    snapshot: &RegisterSnapshot,
    entry: &FunctionEntry,
    descriptor: &UnwindDescriptor,
    exception: &mut I::Exception,
) -> Result<Dispatched>
where
    M: Memory + ?Sized,
    I: HandlerInvoker + ?Sized,
{
    let no_handler = UnwindError::HandlerInvocationFailed {
        address: snapshot.ip,
    };
    let (Some(info), Some(handler_data)) = (descriptor.handler(), descriptor.handler_data_address())
    else {
        debug!("descriptor has no handler");
        return Err(no_handler);
    };
    if info.handler_rva == 0 {
        return Err(no_handler);
    }

    let handler = entry.image_base + u64::from(info.handler_rva);
    if !memory.is_readable(handler, 1) {
        warn!("handler address {handler:#x} is not mapped");
        return Err(UnwindError::HandlerInvocationFailed { address: handler });
    }

    let scope = match resolve_scope(memory, descriptor, snapshot.ip, entry.image_base) {
        Ok(scope) => scope,
        // Not every language handler stores a scope table behind it.
        Err(err) => {
            debug!(%err, "handler data is not a scope table");
            None
        }
    };

    let dispatch = DispatchContext {
        control_pc: snapshot.ip,
        image_base: entry.image_base,
        establisher_frame: snapshot.sp,
        handler,
        handler_data,
        function_entry: entry.function,
    };
    debug!(?dispatch, ?scope, "invoking personality routine");

    let mut context = I::Context::from_snapshot(snapshot);
    let raw = invoker.invoke(handler, exception, &mut context, &dispatch);

    let disposition = match EXCEPTION_DISPOSITION::from_raw(raw) {
        Some(EXCEPTION_DISPOSITION::ExceptionContinueSearch) | None => {
            debug!(raw, "handler declined");
            return Err(UnwindError::HandlerDisposition {
                address: handler,
                disposition: raw,
            });
        }
        Some(disposition) => disposition,
    };

    let after = context.to_snapshot();
    let context_modified = after != *snapshot;
    debug!(?disposition, context_modified, "handler done");

    Ok(Dispatched {
        disposition,
        snapshot: after,
        context_modified,
        scope,
    })
}
