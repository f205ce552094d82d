#![allow(nonstandard_style)] // Closely follow winnt.h here

use core::ffi;

/// What a language-specific handler wants the dispatcher to do next.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EXCEPTION_DISPOSITION {
    /// The handler fixed things up; resume at the (possibly modified)
    /// context.
    ExceptionContinueExecution = 0,
    /// This frame does not handle the exception; keep walking up.
    ExceptionContinueSearch = 1,
    /// An exception was raised while dispatching another one.
    ExceptionNestedException = 2,
    /// An unwind collided with another unwind in progress.
    ExceptionCollidedUnwind = 3,
}

impl EXCEPTION_DISPOSITION {
    /// Personality routines return a plain `int`, so anything can come back.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::ExceptionContinueExecution,
            1 => Self::ExceptionContinueSearch,
            2 => Self::ExceptionNestedException,
            3 => Self::ExceptionCollidedUnwind,
            _ => return None,
        })
    }
}

/// Return values of a vectored exception handler.
pub const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
pub const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

pub const EXCEPTION_NONCONTINUABLE: u32 = 0x1;
pub const EXCEPTION_UNWINDING: u32 = 0x2;

pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EXCEPTION_RECORD {
    pub ExceptionCode: u32,
    pub ExceptionFlags: u32,
    pub ExceptionRecord: *mut EXCEPTION_RECORD,
    pub ExceptionAddress: *mut ffi::c_void,
    pub NumberParameters: u32,
    pub ExceptionInformation: [usize; EXCEPTION_MAXIMUM_PARAMETERS],
}

impl EXCEPTION_RECORD {
    pub fn new(code: u32, address: u64) -> Self {
        Self {
            ExceptionCode: code,
            ExceptionFlags: 0,
            ExceptionRecord: core::ptr::null_mut(),
            ExceptionAddress: address as usize as *mut ffi::c_void,
            NumberParameters: 0,
            ExceptionInformation: [0; EXCEPTION_MAXIMUM_PARAMETERS],
        }
    }
}

/// The dispatcher context a personality routine receives on x64.
#[repr(C)]
#[derive(Debug)]
pub struct DISPATCHER_CONTEXT {
    pub ControlPc: u64,
    pub ImageBase: u64,
    pub FunctionEntry: *mut crate::table::RuntimeFunction,
    pub EstablisherFrame: u64,
    pub TargetIp: u64,
    pub ContextRecord: *mut ffi::c_void,
    pub LanguageHandler: *mut ffi::c_void,
    pub HandlerData: *mut ffi::c_void,
    pub HistoryTable: *mut ffi::c_void,
    pub ScopeIndex: u32,
    pub Fill0: u32,
}

/// `EXCEPTION_ROUTINE`. The return value is an [`EXCEPTION_DISPOSITION`]
/// but is kept as `i32` since nothing stops a routine from returning junk.
pub type ExceptionRoutine = unsafe extern "system" fn(
    exception_record: *mut EXCEPTION_RECORD,
    establisher_frame: u64,
    context_record: *mut ffi::c_void,
    dispatcher_context: *mut DISPATCHER_CONTEXT,
) -> i32;
