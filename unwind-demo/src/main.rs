use sehwind::{
    Destination, Diagnostics, DiagnosticsConfig, RegisterSnapshot, RuntimeFunction,
    SliceFunctionTable, SyntheticMemory, Unwinder, WalkEnd,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const IMAGE_BASE: u64 = 0x1_4000_0000;
const STACK: u64 = 0x7ff0_0000;

const PUSH_NONVOL: u8 = 0;
const ALLOC_SMALL: u8 = 2;
const RBX: u8 = 3;

fn code(prologue_offset: u8, op: u8, info: u8) -> [u8; 2] {
    [prologue_offset, (info << 4) | op]
}

fn unwind_info(flags: u8, prologue: u8, codes: &[[u8; 2]], trailer: &[u32]) -> Vec<u8> {
    let mut bytes = vec![(flags << 3) | 1, prologue, codes.len() as u8, 0];
    for code in codes {
        bytes.extend_from_slice(code);
    }
    if codes.len() % 2 == 1 {
        bytes.extend_from_slice(&[0, 0]);
    }
    for word in trailer {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Three functions, `outer` calls `middle` calls `inner`. `middle` has an
/// exception handler with one guarded range.
fn image() -> (SyntheticMemory, Vec<RuntimeFunction>) {
    let mut memory = SyntheticMemory::new();
    let mut functions = Vec::new();
    let descriptors = [
        (0x1000, 0x1100, 0x8000, unwind_info(0, 4, &[code(4, ALLOC_SMALL, 2)], &[])),
        (
            0x1100,
            0x1200,
            0x8010,
            unwind_info(
                1,
                5,
                &[code(5, ALLOC_SMALL, 1), code(1, PUSH_NONVOL, RBX)],
                &[0x1300, 0, 1, 0x1110, 0x1180, 1, 0x1190],
            ),
        ),
        (0x1200, 0x1280, 0x8040, unwind_info(0, 4, &[code(4, ALLOC_SMALL, 3)], &[])),
    ];
    for (begin, end, unwind_info, bytes) in descriptors {
        memory.map(IMAGE_BASE + u64::from(unwind_info), bytes);
        functions.push(RuntimeFunction {
            begin,
            end,
            unwind_info,
        });
    }

    let stack = [
        0,
        0,
        0,
        0,
        IMAGE_BASE + 0x1150,
        0,
        0,
        0xb0b,
        IMAGE_BASE + 0x1080,
        0,
        0,
        0,
        0,
    ];
    memory.map(STACK, stack.iter().flat_map(|w: &u64| w.to_le_bytes()).collect::<Vec<_>>());

    (memory, functions)
}

fn synthetic() {
    let (memory, functions) = image();
    let table = SliceFunctionTable::new(IMAGE_BASE, &functions);
    let unwinder = Unwinder::new(&memory, &table);
    let mut diag = Diagnostics::new(DiagnosticsConfig {
        level: LevelFilter::DEBUG,
        destination: Destination::Tracing,
        timestamps: false,
    });

    let start = RegisterSnapshot::new(IMAGE_BASE + 0x1240, STACK);
    let walk = unwinder.walk_full_stack(start, &mut diag);
    for (i, frame) in walk.frames.iter().enumerate() {
        println!("#{i} ip={:#x} sp={:#x} rbx={:#x}", frame.ip, frame.sp, frame.gpr[RBX as usize]);
    }
    println!("ended with {:?} after {} steps", walk.end, walk.steps);

    if let Ok(Some(scope)) = unwinder.resolve_scope(IMAGE_BASE + 0x1150, &mut diag) {
        println!("middle is guarded by scope #{}: {:x?}", scope.index, scope.entry);
    }

    // a stack pointer nothing is mapped at
    let walk = unwinder.walk_full_stack(RegisterSnapshot::new(start.ip, 0x1000), &mut diag);
    if let WalkEnd::Failed(err) = &walk.end {
        println!("walk failed after {} frames: {err}", walk.frames.len());
    }
    let last = diag.last_error();
    println!("last error: code={} address={:x?} message={:?}", last.code, last.address, last.message);
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn live() {
    use sehwind::sys::{ProcessMemory, SystemFunctionTable, SystemVirtualUnwind};

    let memory = ProcessMemory::current();
    let unwinder = Unwinder::new(&memory, &SystemFunctionTable).with_platform(&SystemVirtualUnwind);
    let mut diag = Diagnostics::default();

    let walk = unwinder.walk_full_stack(sehwind::capture_snapshot(), &mut diag);
    for (i, frame) in walk.frames.iter().enumerate() {
        println!("#{i} ip={:#x} sp={:#x}", frame.ip, frame.sp);
    }
    println!("ended with {:?}", walk.end);
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn live() {
    #[cfg(target_arch = "x86_64")]
    {
        let snapshot = sehwind::capture_snapshot();
        println!("captured ip={:#x} sp={:#x}, no function tables to walk with here", snapshot.ip, snapshot.sp);
    }
}

fn main() {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::TRACE.into())
            .from_env()
            .unwrap(),
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    synthetic();
    live();
}
