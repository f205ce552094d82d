//! Decoding of x64 unwind descriptors (`UNWIND_INFO`).
//!
//! Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64>
//!
//! ```text
//! +0  version:3 flags:5
//! +1  size of prologue
//! +2  count of code slots
//! +3  frame register:4 frame offset:4 (scaled by 16)
//! +4  code slots, two bytes each, in reverse prologue order
//! ..  padding to a multiple of four bytes
//! ..  either a chained RUNTIME_FUNCTION (begin, end, unwind info)
//!     or the RVA of an exception handler followed by its handler data
//! ```
//!
//! All bounds are validated while decoding. Interpreting a decoded
//! [`UnwindDescriptor`] never touches the raw bytes again.

#[cfg(test)]
mod tests;

use alloc::vec::Vec;
use core::fmt;

use crate::{
    cursor::Cursor,
    error::{Result, UnwindError},
    memory::Memory,
    snapshot::reg,
    table::RuntimeFunction,
};

pub const HEADER_SIZE: usize = 4;
pub const SLOT_SIZE: usize = 2;

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;
const UWOP_SAVE_NONVOL: u8 = 4;
const UWOP_SAVE_NONVOL_FAR: u8 = 5;
const UWOP_SAVE_XMM128: u8 = 8;
const UWOP_SAVE_XMM128_FAR: u8 = 9;
const UWOP_PUSH_MACHFRAME: u8 = 10;

/// The five flag bits of the descriptor header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct DescriptorFlags(u8);

impl DescriptorFlags {
    /// `UNW_FLAG_EHANDLER`: the function has an exception filter.
    pub const EXCEPTION_HANDLER: Self = Self(0x1);
    /// `UNW_FLAG_UHANDLER`: the function has a termination handler.
    pub const TERMINATION_HANDLER: Self = Self(0x2);
    /// `UNW_FLAG_CHAININFO`: a chained descriptor follows the codes.
    pub const CHAINED: Self = Self(0x4);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x1f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Either handler flag.
    pub fn has_handler(self) -> bool {
        self.0 & (Self::EXCEPTION_HANDLER.0 | Self::TERMINATION_HANDLER.0) != 0
    }
}

impl core::ops::BitOr for DescriptorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DescriptorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::EXCEPTION_HANDLER) {
            set.entry(&"EHANDLER");
        }
        if self.contains(Self::TERMINATION_HANDLER) {
            set.entry(&"UHANDLER");
        }
        if self.contains(Self::CHAINED) {
            set.entry(&"CHAININFO");
        }
        set.finish()
    }
}

/// The frame register established by the prologue, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegister {
    pub register: u8,
    /// Offset from the stack pointer at establishment, in 16-byte units.
    pub scaled_offset: u8,
}

impl FrameRegister {
    pub fn offset(&self) -> u64 {
        u64::from(self.scaled_offset) * 16
    }
}

/// One decoded unwind code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindCode {
    /// Offset of the end of the prologue instruction this code undoes.
    pub prologue_offset: u8,
    pub op: UnwindOp,
}

/// Operand of `UWOP_ALLOC_LARGE`, which has two encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargeAllocation {
    /// Size divided by 8, in the next slot.
    Scaled(u16),
    /// Raw byte count over the next two slots.
    Bytes(u32),
}

impl LargeAllocation {
    pub fn size(self) -> u64 {
        match self {
            Self::Scaled(eights) => u64::from(eights) * 8,
            Self::Bytes(bytes) => u64::from(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindOp {
    /// `UWOP_PUSH_NONVOL`: the register was pushed; it is popped back.
    PushNonvolatile { register: u8 },
    /// `UWOP_ALLOC_SMALL`: 1 to 16 eight-byte slots.
    AllocSmall { slots: u8 },
    /// `UWOP_ALLOC_LARGE`. Any non-zero info selects the byte count form.
    AllocLarge(LargeAllocation),
    /// `UWOP_SET_FPREG`: the stack pointer is recovered from the frame
    /// register named in the descriptor header.
    SetFramePointer,
    /// `UWOP_SAVE_NONVOL`: saved at `sp + slots * 8`.
    SaveNonvolatile { register: u8, slots: u16 },
    /// `UWOP_SAVE_NONVOL_FAR`: saved at `sp + offset`.
    SaveNonvolatileFar { register: u8, offset: u32 },
    /// `UWOP_SAVE_XMM128`: saved at `sp + units * 16`.
    SaveXmm128 { register: u8, units: u16 },
    /// `UWOP_SAVE_XMM128_FAR`: saved at `sp + offset`.
    SaveXmm128Far { register: u8, offset: u32 },
    /// `UWOP_PUSH_MACHFRAME`: a hardware trap frame, optionally preceded by
    /// an error code.
    PushMachineFrame { error_code: bool },
    /// Any other kind. Occupies its own slot and does nothing.
    Unknown { kind: u8, info: u8 },
}

impl UnwindOp {
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }
}

impl fmt::Display for UnwindOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PushNonvolatile { register } => write!(f, "PUSH_NONVOL {}", reg::name(register)),
            Self::AllocSmall { slots } => write!(f, "ALLOC_SMALL {:#x}", u32::from(slots) * 8),
            Self::AllocLarge(size) => write!(f, "ALLOC_LARGE {:#x}", size.size()),
            Self::SetFramePointer => write!(f, "SET_FPREG"),
            Self::SaveNonvolatile { register, slots } => {
                write!(f, "SAVE_NONVOL {}, [sp+{:#x}]", reg::name(register), u32::from(slots) * 8)
            }
            Self::SaveNonvolatileFar { register, offset } => {
                write!(f, "SAVE_NONVOL_FAR {}, [sp+{offset:#x}]", reg::name(register))
            }
            Self::SaveXmm128 { register, units } => {
                write!(f, "SAVE_XMM128 xmm{register}, [sp+{:#x}]", u32::from(units) * 16)
            }
            Self::SaveXmm128Far { register, offset } => {
                write!(f, "SAVE_XMM128_FAR xmm{register}, [sp+{offset:#x}]")
            }
            Self::PushMachineFrame { error_code } => {
                write!(f, "PUSH_MACHFRAME error_code={}", u8::from(error_code))
            }
            Self::Unknown { kind, info } => write!(f, "UNKNOWN(op={kind}, info={info})"),
        }
    }
}

/// Where the handler of a descriptor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    /// Image-relative address of the personality routine.
    pub handler_rva: u32,
    /// Offset of the handler data (the scope table) from the start of the
    /// descriptor.
    pub data_offset: usize,
}

/// What follows the code slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trailer {
    None,
    /// Chain link: the function whose prologue this descriptor continues.
    Chained(RuntimeFunction),
    Handler(HandlerInfo),
}

/// A decoded unwind descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindDescriptor {
    /// Where the descriptor was read from, zero when decoded from a buffer.
    pub address: u64,
    pub version: u8,
    pub flags: DescriptorFlags,
    pub prologue_size: u8,
    /// Number of two-byte slots, operands included.
    pub slot_count: u8,
    pub frame_register: Option<FrameRegister>,
    /// Decoded codes in stored order.
    pub codes: Vec<UnwindCode>,
    pub trailer: Trailer,
}

/// Bytes taken by `count` code slots once padded to four bytes.
fn padded_codes_len(count: u8) -> usize {
    (usize::from(count) + 1) / 2 * 2 * SLOT_SIZE
}

impl UnwindDescriptor {
    /// Decodes a descriptor from a buffer holding at least the header, the
    /// code slots and, for chained or handler descriptors, the trailer.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Self::decode_at(raw, 0)
    }

    /// Like [`decode`](Self::decode); `address` only labels errors and the
    /// handler data location.
    #[instrument(level = "trace", skip(raw), fields(len = raw.len()))]
    pub fn decode_at(raw: &[u8], address: u64) -> Result<Self> {
        let malformed = |reason| UnwindError::Decode { address, reason };

        let mut header = Cursor::new(raw);
        let version_flags = header.read_u8().ok_or(malformed("truncated header"))?;
        let prologue_size = header.read_u8().ok_or(malformed("truncated header"))?;
        let slot_count = header.read_u8().ok_or(malformed("truncated header"))?;
        let frame = header.read_u8().ok_or(malformed("truncated header"))?;

        let version = version_flags & 0b111;
        let flags = DescriptorFlags::from_bits(version_flags >> 3);

        let frame_register = match frame & 0xf {
            0 => None,
            register => Some(FrameRegister {
                register,
                scaled_offset: frame >> 4,
            }),
        };

        let slots = header
            .read_bytes(usize::from(slot_count) * SLOT_SIZE)
            .ok_or(malformed("code slots exceed the buffer"))?;
        let codes = decode_codes(slots).map_err(malformed)?;

        let mut rest = Cursor::new(raw);
        if flags.contains(DescriptorFlags::CHAINED) || flags.has_handler() {
            rest.read_bytes(HEADER_SIZE + padded_codes_len(slot_count))
                .ok_or(malformed("truncated trailer"))?;
        }
        let trailer = if flags.contains(DescriptorFlags::CHAINED) {
            let bytes = rest
                .read_bytes(RuntimeFunction::SIZE)
                .ok_or(malformed("truncated chain link"))?;
            let mut link = [0; RuntimeFunction::SIZE];
            link.copy_from_slice(bytes);
            Trailer::Chained(RuntimeFunction::from_le_bytes(link))
        } else if flags.has_handler() {
            let handler_rva = rest.read_u32().ok_or(malformed("truncated handler address"))?;
            Trailer::Handler(HandlerInfo {
                handler_rva,
                data_offset: rest.position(),
            })
        } else {
            Trailer::None
        };

        let descriptor = Self {
            address,
            version,
            flags,
            prologue_size,
            slot_count,
            frame_register,
            codes,
            trailer,
        };
        trace!(?descriptor, "decoded");
        Ok(descriptor)
    }

    /// Reads and decodes the descriptor at `address`. Only as many bytes as
    /// the header says the descriptor has are read.
    #[instrument(level = "debug", skip(memory))]
    pub fn load<M: Memory + ?Sized>(memory: &M, address: u64) -> Result<Self> {
        let mut header = [0; HEADER_SIZE];
        memory.read_bytes(address, &mut header)?;

        let flags = DescriptorFlags::from_bits(header[0] >> 3);
        let trailer_len = if flags.contains(DescriptorFlags::CHAINED) {
            RuntimeFunction::SIZE
        } else if flags.has_handler() {
            4
        } else {
            0
        };
        let len = HEADER_SIZE + padded_codes_len(header[2]) + trailer_len;

        let raw = memory.read_vec(address, len)?;
        Self::decode_at(&raw, address)
    }

    pub fn chain(&self) -> Option<RuntimeFunction> {
        match self.trailer {
            Trailer::Chained(function) => Some(function),
            _ => None,
        }
    }

    pub fn handler(&self) -> Option<HandlerInfo> {
        match self.trailer {
            Trailer::Handler(handler) => Some(handler),
            _ => None,
        }
    }

    /// Absolute address of the handler data, for a descriptor that was
    /// loaded from memory.
    pub fn handler_data_address(&self) -> Option<u64> {
        self.handler()
            .map(|handler| self.address + handler.data_offset as u64)
    }

    /// Whether every code can be interpreted in software.
    pub fn is_fully_known(&self) -> bool {
        self.codes.iter().all(|code| code.op.is_known())
    }
}

/// Decodes the code slots. Operand slots must lie within `slots`.
fn decode_codes(slots: &[u8]) -> core::result::Result<Vec<UnwindCode>, &'static str> {
    const OPERAND_OOB: &str = "unwind code operand past the code count";

    let mut data = Cursor::new(slots);
    let mut codes = Vec::with_capacity(slots.len() / SLOT_SIZE);

    while !data.is_empty() {
        let prologue_offset = data.read_u8().ok_or(OPERAND_OOB)?;
        let op_info = data.read_u8().ok_or(OPERAND_OOB)?;
        let kind = op_info & 0xf;
        let info = op_info >> 4;

        let op = match kind {
            UWOP_PUSH_NONVOL => UnwindOp::PushNonvolatile { register: info },
            UWOP_ALLOC_LARGE => match info {
                0 => UnwindOp::AllocLarge(LargeAllocation::Scaled(
                    data.read_u16().ok_or(OPERAND_OOB)?,
                )),
                _ => UnwindOp::AllocLarge(LargeAllocation::Bytes(
                    data.read_u32().ok_or(OPERAND_OOB)?,
                )),
            },
            UWOP_ALLOC_SMALL => UnwindOp::AllocSmall { slots: info + 1 },
            UWOP_SET_FPREG => UnwindOp::SetFramePointer,
            UWOP_SAVE_NONVOL => UnwindOp::SaveNonvolatile {
                register: info,
                slots: data.read_u16().ok_or(OPERAND_OOB)?,
            },
            UWOP_SAVE_NONVOL_FAR => UnwindOp::SaveNonvolatileFar {
                register: info,
                offset: data.read_u32().ok_or(OPERAND_OOB)?,
            },
            UWOP_SAVE_XMM128 => UnwindOp::SaveXmm128 {
                register: info,
                units: data.read_u16().ok_or(OPERAND_OOB)?,
            },
            UWOP_SAVE_XMM128_FAR => UnwindOp::SaveXmm128Far {
                register: info,
                offset: data.read_u32().ok_or(OPERAND_OOB)?,
            },
            UWOP_PUSH_MACHFRAME => UnwindOp::PushMachineFrame {
                error_code: info != 0,
            },
            _ => UnwindOp::Unknown { kind, info },
        };

        codes.push(UnwindCode {
            prologue_offset,
            op,
        });
    }

    Ok(codes)
}
