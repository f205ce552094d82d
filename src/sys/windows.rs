//! The live collaborators on x64 Windows: the system function table, the
//! system virtual unwinder, the native `CONTEXT` and a vectored exception
//! handler that dispatches through [`Unwinder`].
#![allow(nonstandard_style)] // Closely follow winnt.h here

use core::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use alloc::boxed::Box;

use crate::{
    diag::{Diagnostics, DiagnosticsConfig},
    dispatch::{DispatchContext, HandlerInvoker},
    memory::Memory,
    seh::{
        ExceptionRoutine, DISPATCHER_CONTEXT, EXCEPTION_CONTINUE_EXECUTION,
        EXCEPTION_CONTINUE_SEARCH, EXCEPTION_NONCONTINUABLE, EXCEPTION_RECORD,
    },
    snapshot::{ContextAdapter, RegisterSnapshot},
    step::{StepperConfig, VirtualFrame, VirtualUnwind},
    table::{FunctionEntry, FunctionTable, RuntimeFunction},
    unwinder::{Interception, Unwinder},
};

pub const CONTEXT_AMD64: u32 = 0x0010_0000;
pub const CONTEXT_CONTROL: u32 = CONTEXT_AMD64 | 0x1;
pub const CONTEXT_INTEGER: u32 = CONTEXT_AMD64 | 0x2;
pub const CONTEXT_FLOATING_POINT: u32 = CONTEXT_AMD64 | 0x8;
pub const CONTEXT_FULL: u32 = CONTEXT_CONTROL | CONTEXT_INTEGER | CONTEXT_FLOATING_POINT;

const UNW_FLAG_EHANDLER: u32 = 0x1;

#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct M128A {
    pub Low: u64,
    pub High: i64,
}

impl M128A {
    fn from_u128(value: u128) -> Self {
        Self {
            Low: value as u64,
            High: (value >> 64) as i64,
        }
    }

    fn to_u128(self) -> u128 {
        u128::from(self.Low) | (u128::from(self.High as u64) << 64)
    }
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct XMM_SAVE_AREA32 {
    pub ControlWord: u16,
    pub StatusWord: u16,
    pub TagWord: u8,
    pub Reserved1: u8,
    pub ErrorOpcode: u16,
    pub ErrorOffset: u32,
    pub ErrorSelector: u16,
    pub Reserved2: u16,
    pub DataOffset: u32,
    pub DataSelector: u16,
    pub Reserved3: u16,
    pub MxCsr: u32,
    pub MxCsr_Mask: u32,
    pub FloatRegisters: [M128A; 8],
    pub XmmRegisters: [M128A; 16],
    pub Reserved4: [u8; 96],
}

#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct CONTEXT {
    pub P1Home: u64,
    pub P2Home: u64,
    pub P3Home: u64,
    pub P4Home: u64,
    pub P5Home: u64,
    pub P6Home: u64,
    pub ContextFlags: u32,
    pub MxCsr: u32,
    pub SegCs: u16,
    pub SegDs: u16,
    pub SegEs: u16,
    pub SegFs: u16,
    pub SegGs: u16,
    pub SegSs: u16,
    pub EFlags: u32,
    pub Dr0: u64,
    pub Dr1: u64,
    pub Dr2: u64,
    pub Dr3: u64,
    pub Dr6: u64,
    pub Dr7: u64,
    pub Rax: u64,
    pub Rcx: u64,
    pub Rdx: u64,
    pub Rbx: u64,
    pub Rsp: u64,
    pub Rbp: u64,
    pub Rsi: u64,
    pub Rdi: u64,
    pub R8: u64,
    pub R9: u64,
    pub R10: u64,
    pub R11: u64,
    pub R12: u64,
    pub R13: u64,
    pub R14: u64,
    pub R15: u64,
    pub Rip: u64,
    pub FltSave: XMM_SAVE_AREA32,
    pub VectorRegister: [M128A; 26],
    pub VectorControl: u64,
    pub DebugControl: u64,
    pub LastBranchToRip: u64,
    pub LastBranchFromRip: u64,
    pub LastExceptionToRip: u64,
    pub LastExceptionFromRip: u64,
}

const _: () = assert!(core::mem::size_of::<XMM_SAVE_AREA32>() == 512);
const _: () = assert!(core::mem::size_of::<CONTEXT>() == 1232);

#[repr(C)]
pub struct EXCEPTION_POINTERS {
    pub ExceptionRecord: *mut EXCEPTION_RECORD,
    pub ContextRecord: *mut CONTEXT,
}

type VectoredHandler = unsafe extern "system" fn(*mut EXCEPTION_POINTERS) -> i32;

extern "system" {
    fn RtlLookupFunctionEntry(
        ControlPc: u64,
        ImageBase: *mut u64,
        HistoryTable: *mut c_void,
    ) -> *mut RuntimeFunction;
    fn RtlVirtualUnwind(
        HandlerType: u32,
        ImageBase: u64,
        ControlPc: u64,
        FunctionEntry: *const RuntimeFunction,
        ContextRecord: *mut CONTEXT,
        HandlerData: *mut *mut c_void,
        EstablisherFrame: *mut u64,
        ContextPointers: *mut c_void,
    ) -> *mut c_void;
    fn AddVectoredExceptionHandler(First: u32, Handler: VectoredHandler) -> *mut c_void;
    fn RemoveVectoredExceptionHandler(Handle: *mut c_void) -> u32;
    fn GetCurrentProcess() -> *mut c_void;
    fn ReadProcessMemory(
        hProcess: *mut c_void,
        lpBaseAddress: *const c_void,
        lpBuffer: *mut c_void,
        nSize: usize,
        lpNumberOfBytesRead: *mut usize,
    ) -> i32;
}

/// Copies the registers a snapshot carries into `context`, leaving
/// everything else (segments, MXCSR, debug registers) as it was.
pub fn apply_snapshot(context: &mut CONTEXT, snapshot: &RegisterSnapshot) {
    context.Rip = snapshot.ip;
    context.Rsp = snapshot.sp;
    context.Rbp = snapshot.fp;
    context.Rax = snapshot.gpr[0];
    context.Rcx = snapshot.gpr[1];
    context.Rdx = snapshot.gpr[2];
    context.Rbx = snapshot.gpr[3];
    context.Rsi = snapshot.gpr[6];
    context.Rdi = snapshot.gpr[7];
    context.R8 = snapshot.gpr[8];
    context.R9 = snapshot.gpr[9];
    context.R10 = snapshot.gpr[10];
    context.R11 = snapshot.gpr[11];
    context.R12 = snapshot.gpr[12];
    context.R13 = snapshot.gpr[13];
    context.R14 = snapshot.gpr[14];
    context.R15 = snapshot.gpr[15];
    context.EFlags = snapshot.flags;
    for (slot, value) in context.FltSave.XmmRegisters.iter_mut().zip(snapshot.xmm) {
        *slot = M128A::from_u128(value);
    }
}

impl ContextAdapter for CONTEXT {
    fn from_snapshot(snapshot: &RegisterSnapshot) -> Self {
        // SAFETY: CONTEXT is plain data, all zeroes is a valid value.
        let mut context: CONTEXT = unsafe { core::mem::zeroed() };
        context.ContextFlags = CONTEXT_FULL;
        apply_snapshot(&mut context, snapshot);
        context
    }

    fn to_snapshot(&self) -> RegisterSnapshot {
        let mut snapshot = RegisterSnapshot::new(self.Rip, self.Rsp);
        snapshot.fp = self.Rbp;
        snapshot.gpr = [
            self.Rax, self.Rcx, self.Rdx, self.Rbx, 0, 0, self.Rsi, self.Rdi, self.R8, self.R9,
            self.R10, self.R11, self.R12, self.R13, self.R14, self.R15,
        ];
        for (slot, value) in snapshot.xmm.iter_mut().zip(self.FltSave.XmmRegisters) {
            *slot = value.to_u128();
        }
        snapshot.flags = self.EFlags;
        snapshot
    }
}

/// The function tables of every image loaded into this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemFunctionTable;

impl FunctionTable for SystemFunctionTable {
    fn lookup(&self, ip: u64) -> Option<FunctionEntry> {
        let mut image_base = 0;
        // SAFETY: a null history table is allowed.
        let function = unsafe { RtlLookupFunctionEntry(ip, &mut image_base, ptr::null_mut()) };
        if function.is_null() {
            return None;
        }
        Some(FunctionEntry {
            image_base,
            // SAFETY: the entry lives in a loaded image's .pdata.
            function: unsafe { function.read() },
        })
    }
}

/// `RtlVirtualUnwind`. Only valid for frames of this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemVirtualUnwind;

impl VirtualUnwind for SystemVirtualUnwind {
    fn virtual_unwind(&self, entry: &FunctionEntry, snapshot: &RegisterSnapshot) -> Option<VirtualFrame> {
        let mut context = CONTEXT::from_snapshot(snapshot);
        let mut handler_data = ptr::null_mut();
        let mut establisher_frame = 0;

        // SAFETY: all out pointers are valid and `entry` came from a lookup
        // in this process.
        let handler = unsafe {
            RtlVirtualUnwind(
                UNW_FLAG_EHANDLER,
                entry.image_base,
                snapshot.ip,
                &entry.function,
                &mut context,
                &mut handler_data,
                &mut establisher_frame,
                ptr::null_mut(),
            )
        };

        Some(VirtualFrame {
            caller: context.to_snapshot(),
            handler: (!handler.is_null()).then_some(handler as u64),
            establisher_frame,
        })
    }
}

/// Calls personality routines of this process with the native ABI.
#[derive(Debug)]
pub struct SystemInvoker {
    _private: (),
}

impl SystemInvoker {
    /// # Safety
    /// Every handler address dispatched through this invoker is called as
    /// an `EXCEPTION_ROUTINE`. The caller must only dispatch frames of this
    /// process whose metadata it trusts.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl HandlerInvoker for SystemInvoker {
    type Context = CONTEXT;
    type Exception = EXCEPTION_RECORD;

    fn invoke(
        &self,
        handler: u64,
        exception: &mut EXCEPTION_RECORD,
        context: &mut CONTEXT,
        dispatch: &DispatchContext,
    ) -> i32 {
        let mut function_entry = dispatch.function_entry;
        let context_record = ptr::from_mut(context).cast::<c_void>();
        let mut dispatcher = DISPATCHER_CONTEXT {
            ControlPc: dispatch.control_pc,
            ImageBase: dispatch.image_base,
            FunctionEntry: &mut function_entry,
            EstablisherFrame: dispatch.establisher_frame,
            TargetIp: 0,
            ContextRecord: context_record,
            LanguageHandler: handler as usize as *mut c_void,
            HandlerData: dispatch.handler_data as usize as *mut c_void,
            HistoryTable: ptr::null_mut(),
            ScopeIndex: 0,
            Fill0: 0,
        };

        // SAFETY: guaranteed by the contract of `SystemInvoker::new`.
        unsafe {
            let routine = core::mem::transmute::<usize, ExceptionRoutine>(handler as usize);
            routine(exception, dispatch.establisher_frame, context_record, &mut dispatcher)
        }
    }
}

/// This process, read through `ReadProcessMemory` so bad addresses fail
/// instead of faulting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    pub fn current() -> Self {
        Self
    }
}

impl Memory for ProcessMemory {
    fn is_readable(&self, address: u64, len: usize) -> bool {
        let mut scratch = [0u8; 256];
        let mut offset = 0;
        while offset < len {
            let chunk = (len - offset).min(scratch.len());
            let Some(at) = address.checked_add(offset as u64) else {
                return false;
            };
            if !self.read_raw(at, &mut scratch[..chunk]) {
                return false;
            }
            offset += chunk;
        }
        true
    }

    fn read_raw(&self, address: u64, buf: &mut [u8]) -> bool {
        let mut read = 0;
        // SAFETY: `buf` is valid for `buf.len()` bytes; the source is
        // checked by the kernel.
        let ok = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                address as usize as *const c_void,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut read,
            )
        };
        ok != 0 && read == buf.len()
    }
}

/// What the installed handler does with the exceptions it sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterceptorConfig {
    pub diagnostics: DiagnosticsConfig,
    pub stepper: StepperConfig,
    /// Exception codes to handle; empty means all of them.
    pub exception_codes: &'static [u32],
}

static INSTALLED: AtomicPtr<InterceptorConfig> = AtomicPtr::new(ptr::null_mut());

/// A first-chance exception observer that dispatches the faulting frame's
/// handler and resumes where it says. Removed again on drop.
#[derive(Debug)]
pub struct VectoredInterceptor {
    handle: *mut c_void,
}

impl VectoredInterceptor {
    /// Installs the observer. Returns `None` if one is already installed or
    /// the system refused.
    ///
    /// # Safety
    /// The observer calls personality routines of whichever frame faults,
    /// see [`SystemInvoker::new`].
    pub unsafe fn install(config: InterceptorConfig) -> Option<Self> {
        let state = Box::into_raw(Box::new(config));
        if INSTALLED
            .compare_exchange(ptr::null_mut(), state, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: never published.
            drop(unsafe { Box::from_raw(state) });
            return None;
        }

        // SAFETY: the handler has the right signature and lives forever.
        let handle = unsafe { AddVectoredExceptionHandler(1, vectored_handler) };
        if handle.is_null() {
            INSTALLED.store(ptr::null_mut(), Ordering::Release);
            // SAFETY: the handler was never registered, nothing else saw it.
            drop(unsafe { Box::from_raw(state) });
            return None;
        }

        info!("vectored interceptor installed");
        Some(Self { handle })
    }
}

impl Drop for VectoredInterceptor {
    fn drop(&mut self) {
        // SAFETY: the handle came from AddVectoredExceptionHandler.
        unsafe { RemoveVectoredExceptionHandler(self.handle) };
        // A handler may still be running on another thread, so the
        // configuration is leaked rather than freed.
        INSTALLED.store(ptr::null_mut(), Ordering::Release);
        info!("vectored interceptor removed");
    }
}

unsafe extern "system" fn vectored_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    let config = INSTALLED.load(Ordering::Acquire);
    if config.is_null() || info.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // SAFETY: published configurations are never freed.
    let config = unsafe { &*config };
    // SAFETY: the system hands us valid exception pointers.
    let pointers = unsafe { &*info };
    if pointers.ExceptionRecord.is_null() || pointers.ContextRecord.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    // SAFETY: checked for null above, exclusively ours for this call.
    let (exception, context) = unsafe { (&mut *pointers.ExceptionRecord, &mut *pointers.ContextRecord) };

    if exception.ExceptionFlags & EXCEPTION_NONCONTINUABLE != 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    if !config.exception_codes.is_empty() && !config.exception_codes.contains(&exception.ExceptionCode) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let snapshot = context.to_snapshot();
    let memory = ProcessMemory::current();
    let table = SystemFunctionTable;
    let platform = SystemVirtualUnwind;
    // SAFETY: install's contract.
    let invoker = unsafe { SystemInvoker::new() };
    let mut diag = Diagnostics::new(config.diagnostics);

    let unwinder = Unwinder::new(&memory, &table)
        .with_platform(&platform)
        .with_stepper_config(config.stepper);
    match unwinder.intercept(&invoker, &snapshot, exception, &mut diag) {
        Interception::Resume(resumed) => {
            apply_snapshot(context, &resumed);
            EXCEPTION_CONTINUE_EXECUTION
        }
        Interception::Defer => EXCEPTION_CONTINUE_SEARCH,
    }
}
