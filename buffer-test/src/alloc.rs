use buffer_test_types::{AddressingMode, AllocationSource, DataType, TestCase};
use tracing::{debug, info_span};

use crate::backend::{BufferDesc, BufferUsage, Device};
use crate::host_memory::HostAllocation;
use crate::layout;
use crate::probe::{format_size, Capabilities};
use crate::Error;

pub const RESIDENT_BUFFERS: u64 = 3;

pub const DEFAULT_IMPORT_ALIGNMENT: u64 = 4096;

// Field order matters: the buffer is dropped before the host memory it wraps.
pub struct InputBuffer<B> {
    buffer: B,
    host_memory: Option<HostAllocation>,
}

impl<B> InputBuffer<B> {
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn is_host_imported(&self) -> bool {
        self.host_memory.is_some()
    }

    pub fn host_memory(&self) -> Option<&HostAllocation> {
        self.host_memory.as_ref()
    }
}

pub enum CaseInputs<B> {
    Single(InputBuffer<B>),
    Channels(Vec<B>),
}

impl<B> CaseInputs<B> {
    pub fn buffer_count(&self) -> usize {
        match self {
            CaseInputs::Single(_) => 1,
            CaseInputs::Channels(buffers) => buffers.len(),
        }
    }

    pub fn single(&self) -> Option<&InputBuffer<B>> {
        match self {
            CaseInputs::Single(input) => Some(input),
            CaseInputs::Channels(_) => None,
        }
    }

    pub fn channels(&self) -> Option<&[B]> {
        match self {
            CaseInputs::Single(_) => None,
            CaseInputs::Channels(buffers) => Some(buffers),
        }
    }
}

pub fn check_allocation(caps: &Capabilities, what: &str, size: u64) -> Result<(), Error> {
    let limits = &caps.limits;
    if size > limits.max_memory_allocation_size {
        return Err(Error::Allocation {
            what: format!("{} exceeds max memory allocation size", what),
            requested: size,
            limit: limits.max_memory_allocation_size,
        });
    }
    if size > limits.max_storage_buffer_range {
        return Err(Error::Allocation {
            what: format!("{} exceeds max storage buffer range", what),
            requested: size,
            limit: limits.max_storage_buffer_range,
        });
    }
    Ok(())
}

fn check_allocation_count(caps: &Capabilities, inputs: u64) -> Result<(), Error> {
    if let Some(max) = caps.limits.max_memory_allocation_count {
        let requested = inputs + RESIDENT_BUFFERS;
        if requested > max as u64 {
            return Err(Error::Allocation {
                what: "buffer count exceeds max memory allocation count".into(),
                requested,
                limit: max as u64,
            });
        }
    }
    Ok(())
}

fn input_usage(mode: AddressingMode) -> BufferUsage {
    match mode {
        AddressingMode::BufferReference | AddressingMode::BufferReferenceArray => {
            BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::DEVICE_ADDRESS
        }
        AddressingMode::StorageBuffer | AddressingMode::StorageBufferArray => {
            BufferUsage::STORAGE | BufferUsage::COPY_DST
        }
    }
}

pub fn allocate<D: Device>(
    device: &D,
    case: &TestCase,
    caps: &Capabilities,
) -> Result<CaseInputs<D::Buffer>, Error> {
    let _span = info_span!("allocate", case = %case).entered();
    let domain = case
        .domain()
        .ok_or_else(|| Error::InvalidConfig(format!("domain of {} overflows", case.shape)))?;
    let data_type = case.data_type;

    if case.addressing_mode == AddressingMode::StorageBufferArray {
        let channel_bytes = domain.channel_byte_len(data_type).ok_or_else(|| {
            Error::InvalidConfig(format!("channel size of {} overflows", case.shape))
        })?;
        check_allocation(caps, "channel buffer", channel_bytes)?;
        check_allocation_count(caps, case.shape.channels as u64)?;
        return allocate_channels(device, case, channel_bytes, domain.element_count_3d)
            .map(CaseInputs::Channels);
    }

    let byte_len = domain
        .byte_len(data_type)
        .ok_or_else(|| Error::InvalidConfig(format!("size of {} overflows", case.shape)))?;
    check_allocation_count(caps, 1)?;

    let desc = BufferDesc {
        label: "Input",
        size: byte_len,
        usage: input_usage(case.addressing_mode),
    };

    let input = match case.allocation_source {
        AllocationSource::DeviceUpload => {
            check_allocation(caps, "input buffer", byte_len)?;
            upload(device, &desc, data_type, domain.element_count)?
        }
        AllocationSource::HostImport => {
            let alignment = caps
                .limits
                .min_imported_host_pointer_alignment
                .unwrap_or(DEFAULT_IMPORT_ALIGNMENT);
            let padded = byte_len.checked_next_multiple_of(alignment).unwrap_or(u64::MAX);
            check_allocation(caps, "imported input buffer", padded)?;
            import(device, desc, data_type, domain.element_count, alignment)?
        }
    };
    Ok(CaseInputs::Single(input))
}

fn upload<D: Device>(
    device: &D,
    desc: &BufferDesc,
    data_type: DataType,
    element_count: u64,
) -> Result<InputBuffer<D::Buffer>, Error> {
    let len = usize::try_from(desc.size).map_err(|_| Error::Allocation {
        what: "host staging".into(),
        requested: desc.size,
        limit: usize::MAX as u64,
    })?;
    let mut staging = vec![0u8; len];
    layout::fill_input(data_type, &mut staging, element_count, true);
    debug!(size = %format_size(desc.size), "input_upload");
    let buffer = device.create_buffer_init(desc, &staging)?;
    drop(staging);
    Ok(InputBuffer {
        buffer,
        host_memory: None,
    })
}

fn import<D: Device>(
    device: &D,
    mut desc: BufferDesc,
    data_type: DataType,
    element_count: u64,
    alignment: u64,
) -> Result<InputBuffer<D::Buffer>, Error> {
    let mut memory = HostAllocation::new(desc.size, alignment)?;
    let ptr = memory.as_ptr();
    layout::fill_input(data_type, memory.as_mut_slice(), element_count, true);

    desc.size = memory.len();
    debug!(size = %format_size(desc.size), alignment, "input_host_import");
    // The allocation moves into the InputBuffer next to the buffer and outlives it.
    let buffer = unsafe { device.import_host_memory(&desc, ptr, memory.len())? };
    Ok(InputBuffer {
        buffer,
        host_memory: Some(memory),
    })
}

fn allocate_channels<D: Device>(
    device: &D,
    case: &TestCase,
    channel_bytes: u64,
    element_count_3d: u64,
) -> Result<Vec<D::Buffer>, Error> {
    let channels = case.shape.channels;
    let len = usize::try_from(channel_bytes).map_err(|_| Error::Allocation {
        what: "host staging".into(),
        requested: channel_bytes,
        limit: usize::MAX as u64,
    })?;
    let desc = BufferDesc {
        label: "Input channel",
        size: channel_bytes,
        usage: input_usage(case.addressing_mode),
    };

    let mut staging = vec![0u8; len];
    layout::fill_input(case.data_type, &mut staging, element_count_3d, false);
    debug!(channels, size = %format_size(channel_bytes), "input_channels_upload");

    let mut buffers = Vec::with_capacity(channels as usize);
    for _ in 1..channels {
        buffers.push(device.create_buffer_init(&desc, &staging)?);
    }
    layout::place_sentinel(case.data_type, &mut staging);
    buffers.push(device.create_buffer_init(&desc, &staging)?);
    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceFeatures, DeviceLimits};
    use buffer_test_types::{IndexWidth, Shape};

    fn capabilities(max_size: u64, max_range: u64, max_count: Option<u32>) -> Capabilities {
        Capabilities {
            features: DeviceFeatures::default(),
            limits: DeviceLimits {
                max_memory_allocation_count: max_count,
                max_storage_buffer_range: max_range,
                max_memory_allocation_size: max_size,
                max_storage_buffers_per_stage: 8,
                min_imported_host_pointer_alignment: None,
            },
            heaps: vec![],
        }
    }

    #[test]
    fn test_check_allocation_limits() {
        let caps = capabilities(1024, 512, None);
        assert!(check_allocation(&caps, "input", 512).is_ok());
        assert!(matches!(
            check_allocation(&caps, "input", 513),
            Err(Error::Allocation { limit: 512, .. })
        ));
        assert!(matches!(
            check_allocation(&caps, "input", 2048),
            Err(Error::Allocation { limit: 1024, .. })
        ));
    }

    #[test]
    fn test_allocation_count_includes_resident_buffers() {
        let caps = capabilities(u64::MAX, u64::MAX, Some(4));
        assert!(check_allocation_count(&caps, 1).is_ok());
        assert!(matches!(
            check_allocation_count(&caps, 2),
            Err(Error::Allocation { requested: 5, limit: 4, .. })
        ));
        assert!(check_allocation_count(&capabilities(0, 0, None), 1_000).is_ok());
    }

    #[test]
    fn test_address_modes_request_device_addresses() {
        assert!(input_usage(AddressingMode::BufferReferenceArray).contains(BufferUsage::DEVICE_ADDRESS));
        assert!(!input_usage(AddressingMode::StorageBuffer).contains(BufferUsage::DEVICE_ADDRESS));
    }

    #[test]
    fn test_oversized_case_is_rejected_before_device_calls() {
        let case = TestCase {
            shape: Shape::new(250, 352, 20, 700),
            data_type: DataType::Float32,
            addressing_mode: AddressingMode::StorageBuffer,
            index_width: IndexWidth::Bits32,
            allocation_source: AllocationSource::DeviceUpload,
        };
        let caps = capabilities(1 << 30, 1 << 30, None);
        let domain = case.domain().unwrap();
        let err = check_allocation(&caps, "input buffer", domain.byte_len(case.data_type).unwrap());
        assert!(matches!(err, Err(Error::Allocation { requested: 4_928_000_000, .. })));
    }
}
