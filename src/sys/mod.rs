//! Collaborators backed by the running process.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::ProcessMemory;

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;
#[cfg(all(windows, target_arch = "x86_64"))]
pub use windows::{
    InterceptorConfig, ProcessMemory, SystemFunctionTable, SystemInvoker, SystemVirtualUnwind,
    VectoredInterceptor,
};
