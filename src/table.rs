//! Locating the unwind metadata that covers an instruction pointer.

/// One `.pdata` record: a function's RVA range and the RVA of its unwind
/// descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

impl RuntimeFunction {
    pub const SIZE: usize = 12;

    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            begin: word(0),
            end: word(4),
            unwind_info: word(8),
        }
    }

    pub fn contains(&self, rva: u32) -> bool {
        (self.begin..self.end).contains(&rva)
    }
}

/// A [`RuntimeFunction`] together with the base of the image it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub image_base: u64,
    pub function: RuntimeFunction,
}

impl FunctionEntry {
    pub fn begin_address(&self) -> u64 {
        self.image_base + u64::from(self.function.begin)
    }

    pub fn descriptor_address(&self) -> u64 {
        self.image_base + u64::from(self.function.unwind_info)
    }
}

/// Instruction pointer to function entry lookup, owned by the host.
pub trait FunctionTable {
    fn lookup(&self, ip: u64) -> Option<FunctionEntry>;
}

impl<T: FunctionTable + ?Sized> FunctionTable for &T {
    fn lookup(&self, ip: u64) -> Option<FunctionEntry> {
        (**self).lookup(ip)
    }
}

/// Several images: the first table that knows the address wins.
impl<T: FunctionTable> FunctionTable for [T] {
    fn lookup(&self, ip: u64) -> Option<FunctionEntry> {
        self.iter().find_map(|table| table.lookup(ip))
    }
}

/// The `.pdata` of one loaded image: records sorted by `begin`.
#[derive(Debug, Clone, Copy)]
pub struct SliceFunctionTable<'a> {
    image_base: u64,
    functions: &'a [RuntimeFunction],
}

impl<'a> SliceFunctionTable<'a> {
    pub fn new(image_base: u64, functions: &'a [RuntimeFunction]) -> Self {
        Self {
            image_base,
            functions,
        }
    }
}

impl FunctionTable for SliceFunctionTable<'_> {
    fn lookup(&self, ip: u64) -> Option<FunctionEntry> {
        let rva = u32::try_from(ip.checked_sub(self.image_base)?).ok()?;

        // index of the first record that starts after `rva`
        let after = self.functions.partition_point(|f| f.begin <= rva);
        let function = *self.functions.get(after.checked_sub(1)?)?;

        debug!(rva, ?function, "binary search for {ip:#x}");

        function.contains(rva).then_some(FunctionEntry {
            image_base: self.image_base,
            function,
        })
    }
}
