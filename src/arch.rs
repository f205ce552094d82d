#[cfg(target_arch = "x86_64")]
use core::arch::asm;

#[cfg(target_arch = "x86_64")]
use crate::snapshot::RegisterSnapshot;

/// Captures the registers of the calling code.
///
/// The instruction pointer points into this function and the stack pointer
/// is this function's, so the first step of a walk started here leaves
/// `capture_snapshot` itself. Volatile registers hold whatever the compiler
/// left in them.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub fn capture_snapshot() -> RegisterSnapshot {
    let mut snapshot = RegisterSnapshot::default();
    let ip: u64;
    let sp: u64;
    let fp: u64;
    let flags: u64;

    // SAFETY: the pointers cover 16 u64 and 16 u128 slots, which is exactly
    // what is written. The stack is balanced again when the block ends.
    unsafe {
        asm!(
            "mov [{gpr}+0*8], rax",
            "mov [{gpr}+1*8], rcx",
            "mov [{gpr}+2*8], rdx",
            "mov [{gpr}+3*8], rbx",
            // rsp and rbp have their own fields
            "mov [{gpr}+6*8], rsi",
            "mov [{gpr}+7*8], rdi",
            "mov [{gpr}+8*8], r8",
            "mov [{gpr}+9*8], r9",
            "mov [{gpr}+10*8], r10",
            "mov [{gpr}+11*8], r11",
            "mov [{gpr}+12*8], r12",
            "mov [{gpr}+13*8], r13",
            "mov [{gpr}+14*8], r14",
            "mov [{gpr}+15*8], r15",

            "movdqu [{xmm}+0*16], xmm0",
            "movdqu [{xmm}+1*16], xmm1",
            "movdqu [{xmm}+2*16], xmm2",
            "movdqu [{xmm}+3*16], xmm3",
            "movdqu [{xmm}+4*16], xmm4",
            "movdqu [{xmm}+5*16], xmm5",
            "movdqu [{xmm}+6*16], xmm6",
            "movdqu [{xmm}+7*16], xmm7",
            "movdqu [{xmm}+8*16], xmm8",
            "movdqu [{xmm}+9*16], xmm9",
            "movdqu [{xmm}+10*16], xmm10",
            "movdqu [{xmm}+11*16], xmm11",
            "movdqu [{xmm}+12*16], xmm12",
            "movdqu [{xmm}+13*16], xmm13",
            "movdqu [{xmm}+14*16], xmm14",
            "movdqu [{xmm}+15*16], xmm15",

            "lea {ip}, [rip + 0]", // must use rip as a base register
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            "pushfq",
            "pop {flags}",

            gpr = in(reg) snapshot.gpr.as_mut_ptr(),
            xmm = in(reg) snapshot.xmm.as_mut_ptr(),
            ip = out(reg) ip,
            sp = out(reg) sp,
            fp = out(reg) fp,
            flags = out(reg) flags,
        );
    }

    snapshot.ip = ip;
    snapshot.sp = sp;
    snapshot.fp = fp;
    snapshot.flags = flags as u32;
    snapshot
}
