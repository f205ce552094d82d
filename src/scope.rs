//! Guarded regions of a function: the scope table stored as handler data
//! behind descriptors with an exception or termination handler.
//!
//! ```text
//! +0   leading word, kept as read
//! +4   entry count
//! +8   count x { begin, end, handler, target }, all image relative
//! ```
//!
//! Entries are scanned in table order and the first one whose range
//! contains the instruction pointer wins; the table is never sorted.

use alloc::vec::Vec;

use crate::{
    cursor::Cursor,
    descriptor::UnwindDescriptor,
    error::{Result, UnwindError},
    memory::Memory,
};

/// Upper bound on the entry count we are willing to believe.
pub const MAX_SCOPE_ENTRIES: u32 = 1024;

pub const HEADER_SIZE: usize = 8;
pub const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeEntry {
    pub begin: u32,
    pub end: u32,
    /// Filter or handler RVA; the constant 1 means "always handle".
    pub handler: u32,
    /// Continuation RVA, zero for a termination (`__finally`) handler.
    pub target: u32,
}

impl ScopeEntry {
    pub fn contains(&self, rva: u32) -> bool {
        (self.begin..self.end).contains(&rva)
    }

    pub fn is_termination(&self) -> bool {
        self.target == 0
    }
}

/// The entry that covers an instruction pointer and its position in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeMatch {
    pub index: usize,
    pub entry: ScopeEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeTable {
    pub address: u64,
    pub leading: u32,
    pub entries: Vec<ScopeEntry>,
}

impl ScopeTable {
    #[instrument(level = "debug", skip(memory))]
    pub fn load<M: Memory + ?Sized>(memory: &M, address: u64) -> Result<Self> {
        let malformed = |reason| UnwindError::MalformedScopeTable { address, reason };

        let mut header = [0; HEADER_SIZE];
        memory
            .read_bytes(address, &mut header)
            .map_err(|_| malformed("unreadable header"))?;
        let mut header = Cursor::new(&header);
        let leading = header.read_u32().ok_or(malformed("truncated header"))?;
        let count = header.read_u32().ok_or(malformed("truncated header"))?;

        if count > MAX_SCOPE_ENTRIES {
            warn!(count, "scope table at {address:#x} claims too many entries");
            return Err(malformed("entry count exceeds bound"));
        }

        let raw = memory
            .read_vec(address + HEADER_SIZE as u64, count as usize * ENTRY_SIZE)
            .map_err(|_| malformed("entries unreadable"))?;
        let mut data = Cursor::new(&raw);
        let mut entries = Vec::with_capacity(count as usize);
        while !data.is_empty() {
            let mut word = || data.read_u32().ok_or(malformed("truncated entry"));
            entries.push(ScopeEntry {
                begin: word()?,
                end: word()?,
                handler: word()?,
                target: word()?,
            });
        }

        trace!(leading, ?entries, "scope table");
        Ok(Self {
            address,
            leading,
            entries,
        })
    }

    pub fn find(&self, rva: u32) -> Option<ScopeMatch> {
        self.entries
            .iter()
            .position(|entry| entry.contains(rva))
            .map(|index| ScopeMatch {
                index,
                entry: self.entries[index],
            })
    }
}

/// Finds the guarded region of `descriptor` that contains `ip`.
///
/// A descriptor without a handler has no scope table, and an `ip` outside
/// every range is not an error: both resolve to `None`.
pub fn resolve_scope<M: Memory + ?Sized>(
    memory: &M,
    descriptor: &UnwindDescriptor,
    ip: u64,
    image_base: u64,
) -> Result<Option<ScopeMatch>> {
    let Some(address) = descriptor.handler_data_address() else {
        return Ok(None);
    };
    let table = ScopeTable::load(memory, address)?;

    let Some(rva) = ip
        .checked_sub(image_base)
        .and_then(|rva| u32::try_from(rva).ok())
    else {
        return Ok(None);
    };

    let found = table.find(rva);
    debug!(?found, "scope lookup for rva {rva:#x}");
    Ok(found)
}
