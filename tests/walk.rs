use sehwind::{
    seh::EXCEPTION_RECORD, DispatchContext, Diagnostics, ErrorKind, HandlerInvoker,
    Interception, RegisterSnapshot, RuntimeFunction, SliceFunctionTable, SyntheticMemory, UnwindError,
    Unwinder, WalkEnd,
};

const IMAGE_BASE: u64 = 0x1_8000_0000;
const STACK: u64 = 0x40_0000;

const ALLOC_SMALL: u8 = 2;
const EHANDLER: u8 = 0x1;
const CHAININFO: u8 = 0x4;

fn descriptor(flags: u8, slots: &[[u8; 2]], trailer: &[u32]) -> Vec<u8> {
    let mut bytes = vec![(flags << 3) | 1, 0, slots.len() as u8, 0];
    for slot in slots {
        bytes.extend_from_slice(slot);
    }
    if slots.len() % 2 == 1 {
        bytes.extend_from_slice(&[0, 0]);
    }
    for word in trailer {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn alloc(size: u8) -> [u8; 2] {
    [0, (((size - 8) / 8) << 4) | ALLOC_SMALL]
}

struct Process {
    memory: SyntheticMemory,
    functions: Vec<RuntimeFunction>,
}

impl Process {
    /// `main` (chained, 0x20 + 0x10 bytes) calls `guarded` (0x18 bytes and a
    /// handler) calls `leaf` (no unwind info at all).
    fn new() -> Self {
        let mut memory = SyntheticMemory::new();

        let main_prologue = RuntimeFunction {
            begin: 0x1000,
            end: 0x1010,
            unwind_info: 0x9000,
        };
        memory.map(IMAGE_BASE + 0x9000, descriptor(0, &[alloc(0x20)], &[]));
        memory.map(
            IMAGE_BASE + 0x9010,
            descriptor(
                CHAININFO,
                &[alloc(0x10)],
                &[main_prologue.begin, main_prologue.end, main_prologue.unwind_info],
            ),
        );
        memory.map(
            IMAGE_BASE + 0x9040,
            descriptor(EHANDLER, &[alloc(0x18)], &[0x3000, 0, 1, 0x2000, 0x2080, 1, 0x2090]),
        );

        let functions = vec![
            main_prologue,
            RuntimeFunction {
                begin: 0x1010,
                end: 0x1100,
                unwind_info: 0x9010,
            },
            RuntimeFunction {
                begin: 0x2000,
                end: 0x2100,
                unwind_info: 0x9040,
            },
        ];

        // leaf: return address at sp
        // guarded: 3 slots, then the return address
        // main: 6 slots, then a null return address
        let mut stack = vec![IMAGE_BASE + 0x2040, 0, 0, 0, IMAGE_BASE + 0x1050];
        stack.extend([0; 6]);
        stack.push(0);
        memory.map(STACK, stack.iter().flat_map(|w| w.to_le_bytes()).collect::<Vec<_>>());

        Self { memory, functions }
    }

    fn table(&self) -> SliceFunctionTable<'_> {
        SliceFunctionTable::new(IMAGE_BASE, &self.functions)
    }
}

fn leaf_snapshot() -> RegisterSnapshot {
    RegisterSnapshot::new(0x7777_0000, STACK)
}

#[test]
fn walks_through_leaf_handler_and_chained_frames() {
    let process = Process::new();
    let table = process.table();
    let unwinder = Unwinder::new(&process.memory, &table);
    let mut diag = Diagnostics::default();

    let walk = unwinder.walk_full_stack(leaf_snapshot(), &mut diag);

    let frames: Vec<_> = walk.frames.iter().map(|f| (f.ip, f.sp)).collect();
    assert_eq!(
        frames,
        [
            (0x7777_0000, STACK),
            (IMAGE_BASE + 0x2040, STACK + 0x08),
            (IMAGE_BASE + 0x1050, STACK + 0x28),
        ]
    );
    assert_eq!(walk.end, WalkEnd::Sentinel);
    assert_eq!(walk.steps, 3);
    assert!(diag.last_error().is_empty());
}

#[test]
fn failures_leave_the_partial_walk_and_a_last_error() {
    let process = Process::new();
    let table = process.table();
    let unwinder = Unwinder::new(&process.memory, &table);
    let mut diag = Diagnostics::default();

    // main's frame runs off the end of the mapped stack
    let start = RegisterSnapshot::new(IMAGE_BASE + 0x1050, STACK + 0x40);
    let walk = unwinder.walk_full_stack(start, &mut diag);

    assert_eq!(walk.frames, [start]);
    let WalkEnd::Failed(err) = &walk.end else {
        panic!("{:?}", walk.end);
    };
    assert_eq!(err.kind(), ErrorKind::MemoryAccess);

    let last = diag.last_error();
    assert_eq!(last.code, err.code());
    assert_eq!(last.address, Some(STACK + 0x70));
    assert!(last.message.contains("cannot read 8 bytes"), "{}", last.message);
}

#[test]
fn null_stack_pointer_is_rejected() {
    let process = Process::new();
    let table = process.table();
    let unwinder = Unwinder::new(&process.memory, &table);
    let mut diag = Diagnostics::default();

    let result = unwinder.step_one_frame(&RegisterSnapshot::new(IMAGE_BASE + 0x2040, 0), &mut diag);

    assert_eq!(result, Err(UnwindError::InvalidStackPointer));
    assert_eq!(diag.last_error().code, UnwindError::InvalidStackPointer.code());
}

#[test]
fn guarded_frame_resolves_its_scope() {
    let process = Process::new();
    let table = process.table();
    let unwinder = Unwinder::new(&process.memory, &table);
    let mut diag = Diagnostics::default();

    let scope = unwinder
        .resolve_scope(IMAGE_BASE + 0x2040, &mut diag)
        .unwrap()
        .unwrap();
    assert_eq!(scope.index, 0);
    assert_eq!(scope.entry.target, 0x2090);

    assert_eq!(unwinder.resolve_scope(IMAGE_BASE + 0x20f0, &mut diag), Ok(None));
}

/// Jumps to the guarded range's target, the way a C-specific handler does.
struct JumpToTarget;

impl HandlerInvoker for JumpToTarget {
    type Context = RegisterSnapshot;
    type Exception = EXCEPTION_RECORD;

    fn invoke(
        &self,
        handler: u64,
        _exception: &mut EXCEPTION_RECORD,
        context: &mut RegisterSnapshot,
        dispatch: &DispatchContext,
    ) -> i32 {
        assert_eq!(handler, IMAGE_BASE + 0x3000);
        context.ip = dispatch.image_base + 0x2090;
        0
    }
}

#[test]
fn interceptor_resumes_at_the_handlers_choice() {
    let mut process = Process::new();
    // the handler's code
    process.memory.map(IMAGE_BASE + 0x3000, [0xc3u8; 16]);
    let table = process.table();
    let unwinder = Unwinder::new(&process.memory, &table);
    let mut diag = Diagnostics::default();
    let mut exception = EXCEPTION_RECORD::new(0xc000_0005, IMAGE_BASE + 0x2040);

    let faulting = RegisterSnapshot::new(IMAGE_BASE + 0x2040, STACK + 0x08);
    match unwinder.intercept(&JumpToTarget, &faulting, &mut exception, &mut diag) {
        Interception::Resume(resumed) => {
            assert_eq!(resumed.ip, IMAGE_BASE + 0x2090);
            assert_eq!(resumed.sp, STACK + 0x08);
        }
        Interception::Defer => panic!("deferred: {:?}", diag.last_error()),
    }

    // a leaf has nothing to dispatch to
    let leaf = leaf_snapshot();
    assert_eq!(
        unwinder.intercept(&JumpToTarget, &leaf, &mut exception, &mut diag),
        Interception::Defer
    );
}
