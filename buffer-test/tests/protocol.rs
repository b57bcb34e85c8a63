use buffer_test::alloc::{self, CaseInputs};
use buffer_test::backend::emulated::{EmulatedDevice, EmulatedProfile, JournalEntry};
use buffer_test::backend::{Buffer, BufferBarrier};
use buffer_test::layout;
use buffer_test::{
    probe, AddressingMode, AllocationSource, DataType, DispatchProtocol, IndexWidth, Phase,
    RawScalar, Shape, TestCase, Verdict,
};

fn case(mode: AddressingMode, data_type: DataType, source: AllocationSource) -> TestCase {
    let channels = match data_type {
        DataType::Float32 => 3,
        DataType::Uint8 => 12,
    };
    TestCase {
        shape: Shape::new(4, 4, 4, channels),
        data_type,
        addressing_mode: mode,
        index_width: IndexWidth::Bits32,
        allocation_source: source,
    }
}

#[test]
fn test_program_rebuilt_only_when_variant_changes() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();

    let float_case = case(AddressingMode::StorageBuffer, DataType::Float32, AllocationSource::DeviceUpload);
    for _ in 0..2 {
        let inputs = alloc::allocate(&device, &float_case, &caps).unwrap();
        let result = protocol.run_case(&float_case, &inputs).unwrap();
        assert_eq!(result.verdict, Verdict::Pass);
    }
    assert_eq!(protocol.program_builds(), 1);

    let byte_case = case(AddressingMode::StorageBuffer, DataType::Uint8, AllocationSource::DeviceUpload);
    let inputs = alloc::allocate(&device, &byte_case, &caps).unwrap();
    let result = protocol.run_case(&byte_case, &inputs).unwrap();
    assert_eq!(result.value, RawScalar::U32(42));
    assert_eq!(result.verdict, Verdict::Pass);
    assert_eq!(protocol.program_builds(), 2);
    assert_eq!(
        device
            .journal()
            .count(|e| matches!(e, JournalEntry::ProgramBuilt(_))),
        2
    );
    assert_eq!(protocol.phase(), Phase::Idle);
}

#[test]
fn test_array_mode_ignores_other_channels() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();
    let array_case = case(
        AddressingMode::StorageBufferArray,
        DataType::Float32,
        AllocationSource::DeviceUpload,
    );

    let inputs = alloc::allocate(&device, &array_case, &caps).unwrap();
    let channels = inputs.channels().unwrap();
    assert_eq!(channels.len(), 3);
    channels[0].poke(0, &[0xFF; 256]);
    channels[1].poke(0, &[0xAB; 256]);
    // Everything in the last channel but its final element.
    channels[2].poke(0, &[0x00; 252]);

    let result = protocol.run_case(&array_case, &inputs).unwrap();
    assert_eq!(result.value, RawScalar::F32(42.0));
    assert_eq!(result.verdict, Verdict::Pass);
}

#[test]
fn test_array_mode_reads_last_channel_final_element() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();
    let array_case = case(
        AddressingMode::StorageBufferArray,
        DataType::Float32,
        AllocationSource::DeviceUpload,
    );

    let inputs = alloc::allocate(&device, &array_case, &caps).unwrap();
    let last = &inputs.channels().unwrap()[2];
    last.poke(252, &13.0f32.to_le_bytes());

    let result = protocol.run_case(&array_case, &inputs).unwrap();
    assert_eq!(result.value, RawScalar::F32(13.0));
    assert_eq!(result.verdict, Verdict::Fail);
}

#[test]
fn test_uniform_barrier_once_per_dispatch() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();
    let bra_case = case(
        AddressingMode::BufferReferenceArray,
        DataType::Float32,
        AllocationSource::DeviceUpload,
    );

    for _ in 0..3 {
        let inputs = alloc::allocate(&device, &bra_case, &caps).unwrap();
        assert_eq!(protocol.run_case(&bra_case, &inputs).unwrap().verdict, Verdict::Pass);
    }

    let entries = device.journal().entries();
    let mut uniform_barriers = 0;
    let mut dispatches = 0;
    for entry in &entries {
        match entry {
            JournalEntry::Begin => uniform_barriers = 0,
            JournalEntry::Barrier { buffer, barrier } if *barrier == BufferBarrier::TRANSFER_TO_UNIFORM_READ => {
                assert_eq!(*buffer, "Address uniform");
                uniform_barriers += 1;
            }
            JournalEntry::Dispatch => {
                assert_eq!(uniform_barriers, 1);
                dispatches += 1;
            }
            _ => {}
        }
    }
    assert_eq!(dispatches, 3);
}

#[test]
fn test_submissions_and_waits_alternate() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();

    let cases = [
        case(AddressingMode::StorageBuffer, DataType::Float32, AllocationSource::DeviceUpload),
        case(AddressingMode::BufferReference, DataType::Float32, AllocationSource::HostImport),
        case(AddressingMode::BufferReferenceArray, DataType::Uint8, AllocationSource::HostImport),
        case(AddressingMode::StorageBufferArray, DataType::Float32, AllocationSource::DeviceUpload),
    ];
    for c in &cases {
        let inputs = alloc::allocate(&device, c, &caps).unwrap();
        assert_eq!(protocol.run_case(c, &inputs).unwrap().verdict, Verdict::Pass, "{}", c);
    }

    let sync: Vec<JournalEntry> = device
        .journal()
        .entries()
        .into_iter()
        .filter(|e| matches!(e, JournalEntry::Submit | JournalEntry::FenceWaited))
        .collect();
    assert_eq!(sync.len(), 2 * cases.len());
    for pair in sync.chunks(2) {
        assert_eq!(pair, [JournalEntry::Submit, JournalEntry::FenceWaited]);
    }

    let windows = protocol.windows();
    assert_eq!(windows.len(), cases.len());
    for pair in windows.windows(2) {
        assert!(pair[0].submitted <= pair[0].signaled);
        assert!(pair[0].signaled <= pair[1].submitted);
    }
    assert_eq!(
        device.journal().count(|e| matches!(e, JournalEntry::Hazard { .. })),
        0
    );
}

#[test]
fn test_host_import_is_aligned_and_holds_sentinel() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let import_case = case(AddressingMode::StorageBuffer, DataType::Uint8, AllocationSource::HostImport);

    let inputs = alloc::allocate(&device, &import_case, &caps).unwrap();
    let input = inputs.single().unwrap();
    assert!(input.is_host_imported());
    let memory = input.host_memory().unwrap();
    assert_eq!(memory.len() % 4096, 0);
    assert_eq!(memory.as_ptr().as_ptr() as usize % 4096, 0);
    assert_eq!(input.buffer().size(), 4096);

    // 4 * 4 * 4 * 12 one-byte elements, then untouched padding.
    let bytes = input.buffer().peek();
    assert_eq!(layout::read_element(DataType::Uint8, &bytes, 766), Some(7.0));
    assert_eq!(layout::read_element(DataType::Uint8, &bytes, 767), Some(42.0));
    assert_eq!(bytes[768], 0);
}

#[test]
fn test_failed_case_returns_protocol_to_idle() {
    let mut profile = EmulatedProfile::new("emu");
    profile.features.shader_64bit_indexing = false;
    let device = EmulatedDevice::new(profile);
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();

    // Forced past the capability gate: the device refuses to build the program.
    let wide = TestCase {
        index_width: IndexWidth::Bits64,
        ..case(AddressingMode::StorageBuffer, DataType::Float32, AllocationSource::DeviceUpload)
    };
    let inputs = alloc::allocate(&device, &wide, &caps).unwrap();
    assert!(protocol.run_case(&wide, &inputs).is_err());
    assert_eq!(protocol.phase(), Phase::Idle);

    let narrow = case(AddressingMode::StorageBuffer, DataType::Float32, AllocationSource::DeviceUpload);
    let inputs = alloc::allocate(&device, &narrow, &caps).unwrap();
    assert_eq!(protocol.run_case(&narrow, &inputs).unwrap().verdict, Verdict::Pass);
}

#[test]
fn test_mismatched_inputs_are_a_protocol_error() {
    let device = EmulatedDevice::new(EmulatedProfile::new("emu"));
    let caps = probe(&device);
    let mut protocol = DispatchProtocol::new(&device).unwrap();

    let single = case(AddressingMode::StorageBuffer, DataType::Float32, AllocationSource::DeviceUpload);
    let array = TestCase {
        addressing_mode: AddressingMode::StorageBufferArray,
        ..single
    };
    let inputs = alloc::allocate(&device, &single, &caps).unwrap();
    assert!(matches!(inputs, CaseInputs::Single(_)));
    assert!(matches!(
        protocol.run_case(&array, &inputs),
        Err(buffer_test::Error::Protocol(_))
    ));
}
