//! The register state of one frame.

/// x64 register numbers as used by unwind codes and the frame register field.
pub mod reg {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;

    const NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    pub fn name(register: u8) -> &'static str {
        NAMES.get(register as usize).copied().unwrap_or("???")
    }
}

/// Captured CPU state at one point in the call stack.
///
/// General registers are indexed by their architectural number. The stack
/// and frame pointer live in their own fields, so slots [`reg::RSP`] and
/// [`reg::RBP`] of `gpr` stay zero; go through [`register`](Self::register)
/// and [`set_register`](Self::set_register) to address them by number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
    pub gpr: [u64; 16],
    pub xmm: [u128; 16],
    /// RFLAGS. Stepping never changes it.
    pub flags: u32,
}

impl RegisterSnapshot {
    pub fn new(ip: u64, sp: u64) -> Self {
        Self {
            ip,
            sp,
            ..Self::default()
        }
    }

    pub fn register(&self, register: u8) -> u64 {
        match register & 0xf {
            reg::RSP => self.sp,
            reg::RBP => self.fp,
            r => self.gpr[r as usize],
        }
    }

    pub fn set_register(&mut self, register: u8, value: u64) {
        match register & 0xf {
            reg::RSP => self.sp = value,
            reg::RBP => self.fp = value,
            r => self.gpr[r as usize] = value,
        }
    }

    pub fn set_xmm(&mut self, register: u8, value: u128) {
        self.xmm[(register & 0xf) as usize] = value;
    }
}

/// Bit-exact conversion between a [`RegisterSnapshot`] and a host's native
/// thread context.
pub trait ContextAdapter: Sized {
    fn from_snapshot(snapshot: &RegisterSnapshot) -> Self;
    fn to_snapshot(&self) -> RegisterSnapshot;
}

impl ContextAdapter for RegisterSnapshot {
    fn from_snapshot(snapshot: &RegisterSnapshot) -> Self {
        *snapshot
    }

    fn to_snapshot(&self) -> RegisterSnapshot {
        *self
    }
}
