use super::{
    DescriptorFlags, FrameRegister, HandlerInfo, LargeAllocation, Trailer, UnwindCode,
    UnwindDescriptor, UnwindOp,
};
use crate::{
    error::UnwindError,
    memory::SyntheticMemory,
    snapshot::reg,
    table::RuntimeFunction,
    testing::*,
};

#[test]
fn parse_simple_descriptor() {
    #[rustfmt::skip]
    let data = [
        0x01, 0x04, 0x01, 0x00,
        0x04, 0x22,
    ];

    let descriptor = UnwindDescriptor::decode(&data).unwrap();

    assert_eq!(
        descriptor,
        UnwindDescriptor {
            address: 0,
            version: 1,
            flags: DescriptorFlags::default(),
            prologue_size: 4,
            slot_count: 1,
            frame_register: None,
            codes: vec![UnwindCode {
                prologue_offset: 4,
                op: UnwindOp::AllocSmall { slots: 3 }
            }],
            trailer: Trailer::None,
        }
    );

    // dumpbin /unwindinfo:
    /*
    Unwind version: 1
    Unwind flags: None
    Size of prologue: 0x04
    Count of codes: 1
    Unwind codes:
      04: ALLOC_SMALL, size=0x18
    */
}

#[test]
fn parse_typical_msvc_prologue() {
    // push rbp; push rdi; sub rsp, 0x1e0; lea rbp, [rsp+0x20];
    // mov [rsp+0x200], rbx; movaps [rsp+0x1d0], xmm6
    let data = descriptor(
        0,
        0x1f,
        0x25,
        &[
            code(0x1f, SAVE_XMM128, 6),
            operand(0x1d),
            code(0x17, SAVE_NONVOL, reg::RBX),
            operand(0x40),
            code(0x0f, SET_FPREG, 0),
            code(0x0a, ALLOC_LARGE, 0),
            operand(0x3c),
            code(0x02, PUSH_NONVOL, reg::RDI),
            code(0x01, PUSH_NONVOL, reg::RBP),
        ],
        &[],
    );

    let descriptor = UnwindDescriptor::decode(&data).unwrap();

    assert_eq!(descriptor.slot_count, 9);
    assert_eq!(
        descriptor.frame_register,
        Some(FrameRegister {
            register: reg::RBP,
            scaled_offset: 2
        })
    );
    assert_eq!(descriptor.frame_register.unwrap().offset(), 0x20);
    let ops: Vec<_> = descriptor.codes.iter().map(|c| c.op).collect();
    assert_eq!(
        ops,
        [
            UnwindOp::SaveXmm128 { register: 6, units: 0x1d },
            UnwindOp::SaveNonvolatile { register: reg::RBX, slots: 0x40 },
            UnwindOp::SetFramePointer,
            UnwindOp::AllocLarge(LargeAllocation::Scaled(0x3c)),
            UnwindOp::PushNonvolatile { register: reg::RDI },
            UnwindOp::PushNonvolatile { register: reg::RBP },
        ]
    );
    assert!(descriptor.is_fully_known());
}

#[test]
fn wide_operands_span_two_slots() {
    let [lo, hi] = wide_operand(0x0012_3450);
    let [xlo, xhi] = wide_operand(0x0001_0000);
    let [slo, shi] = wide_operand(0x0008_0008);
    let data = descriptor(
        0,
        0x20,
        0,
        &[
            code(0x20, SAVE_XMM128_FAR, 15),
            xlo,
            xhi,
            code(0x18, SAVE_NONVOL_FAR, reg::R12),
            slo,
            shi,
            code(0x10, ALLOC_LARGE, 1),
            lo,
            hi,
        ],
        &[],
    );

    let descriptor = UnwindDescriptor::decode(&data).unwrap();

    let ops: Vec<_> = descriptor.codes.iter().map(|c| c.op).collect();
    assert_eq!(
        ops,
        [
            UnwindOp::SaveXmm128Far { register: 15, offset: 0x0001_0000 },
            UnwindOp::SaveNonvolatileFar { register: reg::R12, offset: 0x0008_0008 },
            UnwindOp::AllocLarge(LargeAllocation::Bytes(0x0012_3450)),
        ]
    );
    assert_eq!(LargeAllocation::Bytes(0x0012_3450).size(), 0x0012_3450);
    assert_eq!(LargeAllocation::Scaled(0x3c).size(), 0x3c * 8);
}

#[test]
fn alloc_small_covers_one_to_sixteen_slots() {
    for info in 0..16 {
        let data = descriptor(0, 0, 0, &[code(0, ALLOC_SMALL, info)], &[]);
        let descriptor = UnwindDescriptor::decode(&data).unwrap();
        assert_eq!(descriptor.codes[0].op, UnwindOp::AllocSmall { slots: info + 1 });
    }
}

#[test]
fn unknown_kinds_are_single_slot_no_ops() {
    let data = descriptor(
        0,
        0,
        0,
        &[code(0, 6, 3), code(0, 7, 0), code(0, 11, 1), code(0, ALLOC_SMALL, 0)],
        &[],
    );

    let descriptor = UnwindDescriptor::decode(&data).unwrap();

    assert_eq!(descriptor.codes.len(), 4);
    assert_eq!(descriptor.codes[0].op, UnwindOp::Unknown { kind: 6, info: 3 });
    assert_eq!(descriptor.codes[2].op, UnwindOp::Unknown { kind: 11, info: 1 });
    assert_eq!(descriptor.codes[3].op, UnwindOp::AllocSmall { slots: 1 });
    assert!(!descriptor.is_fully_known());
}

#[test]
fn code_count_past_buffer_is_rejected() {
    #[rustfmt::skip]
    let data = [
        0x01, 0x00, 0x03, 0x00,
        0x00, 0x02,
        0x00, 0x02,
    ];

    let err = UnwindDescriptor::decode(&data).unwrap_err();
    assert_eq!(
        err,
        UnwindError::Decode {
            address: 0,
            reason: "code slots exceed the buffer"
        }
    );
}

#[test]
fn operand_past_code_count_is_rejected() {
    // The operand bytes exist in the buffer but lie outside the declared
    // slot count, so they must not be consumed.
    let mut data = descriptor(0, 0, 0, &[code(0, SAVE_NONVOL, reg::RBX)], &[]);
    assert_eq!(data.len(), 8);
    data[6] = 0x10;

    let err = UnwindDescriptor::decode(&data).unwrap_err();
    assert!(matches!(err, UnwindError::Decode { .. }), "{err:?}");

    let data = descriptor(0, 0, 0, &[code(0, ALLOC_LARGE, 1), operand(0x10)], &[]);
    assert!(UnwindDescriptor::decode(&data).is_err());
}

#[test]
fn truncated_header_is_rejected() {
    assert!(UnwindDescriptor::decode(&[0x01, 0x00, 0x00]).is_err());
    assert!(UnwindDescriptor::decode(&[]).is_err());
}

#[test]
fn version_is_kept_as_data() {
    #[rustfmt::skip]
    let data = [
        0x00, 0x00, 0x01, 0x00,
        0x00, 0x02, 0x00, 0x00,
    ];
    let descriptor = UnwindDescriptor::decode(&data).unwrap();
    assert_eq!(descriptor.version, 0);
    assert_eq!(descriptor.codes[0].op, UnwindOp::AllocSmall { slots: 1 });

    assert_eq!(UnwindDescriptor::decode(&[0x03, 0x00, 0x00, 0x00]).unwrap().version, 3);
}

#[test]
fn any_nonzero_alloc_large_info_is_a_byte_count() {
    let data = descriptor(0, 0, 0, &[code(0, ALLOC_LARGE, 2), operand(0x1234), operand(1)], &[]);
    let descriptor = UnwindDescriptor::decode(&data).unwrap();
    assert_eq!(
        descriptor.codes[0].op,
        UnwindOp::AllocLarge(LargeAllocation::Bytes(0x1_1234))
    );
}

#[test]
fn chain_link_follows_padded_codes() {
    let parent = RuntimeFunction {
        begin: 0x1000,
        end: 0x1080,
        unwind_info: 0x8040,
    };
    let data = descriptor(CHAININFO, 0, 0, &[code(0, ALLOC_SMALL, 1)], &chain_link(parent));
    assert_eq!(data.len(), 4 + 4 + 12);

    let descriptor = UnwindDescriptor::decode(&data).unwrap();

    assert!(descriptor.flags.contains(DescriptorFlags::CHAINED));
    assert_eq!(descriptor.chain(), Some(parent));
    assert_eq!(descriptor.handler(), None);
}

#[test]
fn truncated_chain_link_is_rejected() {
    let data = descriptor(CHAININFO, 0, 0, &[], &[0; 8]);
    assert_eq!(
        UnwindDescriptor::decode(&data),
        Err(UnwindError::Decode {
            address: 0,
            reason: "truncated chain link"
        })
    );
}

#[test]
fn chained_descriptor_without_padding_is_rejected() {
    // five codes and nothing after them, not even the padding slot
    let mut data = vec![(CHAININFO << 3) | 1, 0, 5, 0];
    for _ in 0..5 {
        data.extend_from_slice(&code(0, ALLOC_SMALL, 0));
    }
    assert_eq!(
        UnwindDescriptor::decode(&data),
        Err(UnwindError::Decode {
            address: 0,
            reason: "truncated trailer"
        })
    );
}

#[test]
fn handler_descriptor_without_padding_is_rejected() {
    #[rustfmt::skip]
    let data = [
        (EHANDLER << 3) | 1, 0x00, 0x01, 0x00,
        0x00, 0x02,
    ];
    assert_eq!(
        UnwindDescriptor::decode(&data),
        Err(UnwindError::Decode {
            address: 0,
            reason: "truncated trailer"
        })
    );
}

#[test]
fn handler_trailer_locates_handler_data() {
    let trailer = handler_trailer(0x2000, 0, 0, &[]);
    let data = descriptor(EHANDLER, 0, 0, &[code(0, ALLOC_SMALL, 0)], &trailer);

    let descriptor = UnwindDescriptor::decode_at(&data, 0x5000).unwrap();

    assert!(descriptor.flags.has_handler());
    assert_eq!(
        descriptor.handler(),
        Some(HandlerInfo {
            handler_rva: 0x2000,
            data_offset: 12
        })
    );
    assert_eq!(descriptor.handler_data_address(), Some(0x500c));
}

#[test]
fn load_reads_only_what_the_header_declares() {
    let data = descriptor(0, 2, 0, &[code(2, PUSH_NONVOL, reg::RBX)], &[]);
    let mut memory = SyntheticMemory::new();
    // Exactly header + padded codes, nothing mapped behind it.
    memory.map(0x7000, data);

    let descriptor = UnwindDescriptor::load(&memory, 0x7000).unwrap();
    assert_eq!(descriptor.address, 0x7000);
    assert_eq!(
        descriptor.codes,
        [UnwindCode {
            prologue_offset: 2,
            op: UnwindOp::PushNonvolatile { register: reg::RBX }
        }]
    );
}

#[test]
fn load_from_unmapped_memory_fails_cleanly() {
    let memory = SyntheticMemory::new();
    assert_eq!(
        UnwindDescriptor::load(&memory, 0x7000),
        Err(UnwindError::UnreadableMemory {
            address: 0x7000,
            len: 4
        })
    );
}

#[test]
fn codes_render_like_dumpbin() {
    assert_eq!(
        UnwindOp::SaveNonvolatile { register: reg::RBX, slots: 2 }.to_string(),
        "SAVE_NONVOL rbx, [sp+0x10]"
    );
    assert_eq!(UnwindOp::AllocSmall { slots: 3 }.to_string(), "ALLOC_SMALL 0x18");
    assert_eq!(
        format!("{:?}", DescriptorFlags::EXCEPTION_HANDLER | DescriptorFlags::CHAINED),
        r#"{"EHANDLER", "CHAININFO"}"#
    );
}
