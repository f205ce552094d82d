//! Stepping out of a frame that has no unwind descriptor.
//!
//! Such a frame belongs to a leaf function: it has no prologue, never
//! touched a nonvolatile register, and the only thing on its stack is the
//! return address pushed by the call.

use crate::{
    error::{Result, UnwindError},
    memory::Memory,
    snapshot::RegisterSnapshot,
};

#[instrument(level = "debug", skip_all, fields(sp = snapshot.sp))]
pub fn step_leaf<M: Memory + ?Sized>(memory: &M, snapshot: &RegisterSnapshot) -> Result<RegisterSnapshot> {
    if snapshot.sp == 0 {
        debug!("null stack pointer, cannot pop a return address");
        return Err(UnwindError::InvalidStackPointer);
    }

    let return_address = memory.read_u64(snapshot.sp)?;

    let mut caller = *snapshot;
    caller.ip = return_address;
    caller.sp = snapshot.sp + 8;

    debug!("leaf frame: ip={:#x} sp={:#x}", caller.ip, caller.sp);
    Ok(caller)
}
