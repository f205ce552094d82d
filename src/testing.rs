//! Builders for unwind metadata fixtures.

use alloc::vec::Vec;

use crate::{
    memory::SyntheticMemory,
    table::{FunctionEntry, RuntimeFunction, SliceFunctionTable},
};

pub(crate) const IMAGE_BASE: u64 = 0x1_4000_0000;
pub(crate) const XDATA_RVA: u32 = 0x8000;

pub(crate) const PUSH_NONVOL: u8 = 0;
pub(crate) const ALLOC_LARGE: u8 = 1;
pub(crate) const ALLOC_SMALL: u8 = 2;
pub(crate) const SET_FPREG: u8 = 3;
pub(crate) const SAVE_NONVOL: u8 = 4;
pub(crate) const SAVE_NONVOL_FAR: u8 = 5;
pub(crate) const SAVE_XMM128: u8 = 8;
pub(crate) const SAVE_XMM128_FAR: u8 = 9;
pub(crate) const PUSH_MACHFRAME: u8 = 10;

pub(crate) const EHANDLER: u8 = 0x1;
pub(crate) const CHAININFO: u8 = 0x4;

pub(crate) fn code(prologue_offset: u8, kind: u8, info: u8) -> [u8; 2] {
    [prologue_offset, (info << 4) | kind]
}

pub(crate) fn operand(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub(crate) fn wide_operand(value: u32) -> [[u8; 2]; 2] {
    let [a, b, c, d] = value.to_le_bytes();
    [[a, b], [c, d]]
}

/// A version 1 descriptor. `frame` is the raw register/offset byte. The
/// trailer goes after the codes, padded to four bytes.
pub(crate) fn descriptor(flags: u8, prologue: u8, frame: u8, slots: &[[u8; 2]], trailer: &[u8]) -> Vec<u8> {
    let mut bytes = alloc::vec![(flags << 3) | 1, prologue, slots.len() as u8, frame];
    for slot in slots {
        bytes.extend_from_slice(slot);
    }
    if slots.len() % 2 == 1 {
        bytes.extend_from_slice(&[0, 0]);
    }
    bytes.extend_from_slice(trailer);
    bytes
}

pub(crate) fn chain_link(function: RuntimeFunction) -> Vec<u8> {
    let mut bytes = Vec::new();
    for word in [function.begin, function.end, function.unwind_info] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Handler RVA, then the scope table with its leading word and count.
pub(crate) fn handler_trailer(handler_rva: u32, leading: u32, count: u32, entries: &[[u32; 4]]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for word in [handler_rva, leading, count] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    for entry in entries {
        for word in entry {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
    }
    bytes
}

/// A synthetic image at [`IMAGE_BASE`] plus whatever stack the test maps.
pub(crate) struct Image {
    pub(crate) memory: SyntheticMemory,
    pub(crate) functions: Vec<RuntimeFunction>,
    next_rva: u32,
}

impl Image {
    pub(crate) fn new() -> Self {
        Self {
            memory: SyntheticMemory::new(),
            functions: Vec::new(),
            next_rva: XDATA_RVA,
        }
    }

    /// Maps `bytes` in the image and returns their RVA.
    pub(crate) fn place(&mut self, bytes: Vec<u8>) -> u32 {
        let rva = self.next_rva;
        self.next_rva += (bytes.len() as u32 + 0xf) & !0xf;
        self.memory.map(IMAGE_BASE + u64::from(rva), bytes);
        rva
    }

    pub(crate) fn add_function(&mut self, begin: u32, end: u32, descriptor: Vec<u8>) -> RuntimeFunction {
        let unwind_info = self.place(descriptor);
        let function = RuntimeFunction {
            begin,
            end,
            unwind_info,
        };
        self.functions.push(function);
        self.functions.sort_by_key(|f| f.begin);
        function
    }

    pub(crate) fn entry(&self, function: RuntimeFunction) -> FunctionEntry {
        FunctionEntry {
            image_base: IMAGE_BASE,
            function,
        }
    }

    pub(crate) fn table(&self) -> SliceFunctionTable<'_> {
        SliceFunctionTable::new(IMAGE_BASE, &self.functions)
    }

    pub(crate) fn map_stack(&mut self, base: u64, words: &[u64]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.memory.map(base, bytes);
    }
}
