//! Software unwinding of x64 call stacks described by Windows-style unwind
//! metadata (`.pdata`/`.xdata`).
//!
//! The core never touches memory directly: everything is read through a
//! [`Memory`] implementation that probes before it reads, and descriptors are
//! located through a [`FunctionTable`]. The live collaborators for the
//! current process live in [`sys`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

mod cursor;
mod stdext;

pub mod diag;
pub mod error;
pub mod seh;

pub mod descriptor;
pub mod memory;
pub mod snapshot;
pub mod table;

pub mod dispatch;
pub mod leaf;
pub mod scope;
pub mod step;

pub mod arch;
pub mod sys;
pub mod unwinder;

#[cfg(test)]
mod testing;

pub use descriptor::{UnwindCode, UnwindDescriptor, UnwindOp};
pub use diag::{Destination, Diagnostics, DiagnosticsConfig, LastError};
pub use dispatch::{DispatchContext, Dispatched, HandlerInvoker};
pub use error::{ErrorKind, UnwindError};
pub use memory::{Memory, SyntheticMemory};
pub use scope::{ScopeEntry, ScopeMatch, ScopeTable};
pub use snapshot::{ContextAdapter, RegisterSnapshot};
pub use step::{FrameStepper, StepperConfig, VirtualFrame, VirtualUnwind};
pub use table::{FunctionEntry, FunctionTable, RuntimeFunction, SliceFunctionTable};
pub use unwinder::{Interception, Step, Unwinder, Walk, WalkConfig, WalkEnd};

#[cfg(target_arch = "x86_64")]
pub use arch::capture_snapshot;
