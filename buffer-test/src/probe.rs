use std::fmt;

use buffer_test_types::{AddressingMode, AllocationSource, DataType, IndexWidth, TestCase};
use tracing::warn;

use crate::backend::{Device, DeviceFeatures, DeviceLimits, MemoryPropertyFlags, MemoryProperties};

const FLAG_NAMES: [(MemoryPropertyFlags, &str); 4] = [
    (MemoryPropertyFlags::DEVICE_LOCAL, "device local"),
    (MemoryPropertyFlags::HOST_VISIBLE, "host visible"),
    (MemoryPropertyFlags::HOST_COHERENT, "host coherent"),
    (MemoryPropertyFlags::HOST_CACHED, "host cached"),
];

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapReport {
    pub index: u32,
    pub size: u64,
    /// Union of the property flags of every memory type on this heap.
    pub type_flags: MemoryPropertyFlags,
    pub heap_device_local: bool,
}

impl HeapReport {
    pub fn is_consistent(&self) -> bool {
        self.type_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL) == self.heap_device_local
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory heap #{}: {}", self.index, format_size(self.size))?;
        let names: Vec<&str> = FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.type_flags.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if !names.is_empty() {
            write!(f, " ({})", names.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    No64BitIndexing,
    No8BitStorage,
    NoHostMemoryImport,
    NoBufferDeviceAddress,
    NoStorageBufferArrays,
    TooManyChannelBindings { channels: u32, limit: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::No64BitIndexing => f.write_str("no shader 64-bit indexing"),
            SkipReason::No8BitStorage => f.write_str("no 8-bit storage access"),
            SkipReason::NoHostMemoryImport => f.write_str("no external host memory import"),
            SkipReason::NoBufferDeviceAddress => f.write_str("no buffer device address"),
            SkipReason::NoStorageBufferArrays => f.write_str("no storage buffer arrays"),
            SkipReason::TooManyChannelBindings { channels, limit } => write!(
                f,
                "{} channel bindings exceed the per-stage limit of {}",
                channels, limit
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Capabilities {
    pub features: DeviceFeatures,
    pub limits: DeviceLimits,
    pub heaps: Vec<HeapReport>,
}

impl Capabilities {
    /// Whether the device can run `case` at all; a mismatch is a skip, never a failure.
    pub fn admits(&self, case: &TestCase) -> Result<(), SkipReason> {
        let features = &self.features;
        if case.index_width == IndexWidth::Bits64 && !features.shader_64bit_indexing {
            return Err(SkipReason::No64BitIndexing);
        }
        if case.data_type == DataType::Uint8 && !features.storage_8bit {
            return Err(SkipReason::No8BitStorage);
        }
        if case.allocation_source == AllocationSource::HostImport && !features.external_host_memory {
            return Err(SkipReason::NoHostMemoryImport);
        }
        match case.addressing_mode {
            AddressingMode::BufferReference | AddressingMode::BufferReferenceArray
                if !features.buffer_device_address =>
            {
                Err(SkipReason::NoBufferDeviceAddress)
            }
            AddressingMode::StorageBufferArray => {
                if !features.storage_buffer_array {
                    return Err(SkipReason::NoStorageBufferArrays);
                }
                let limit = self.limits.max_storage_buffers_per_stage;
                // One slot is taken by the output buffer.
                if case.shape.channels as u64 + 1 > limit as u64 {
                    return Err(SkipReason::TooManyChannelBindings {
                        channels: case.shape.channels,
                        limit,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn inconsistent_heaps(&self) -> impl Iterator<Item = &HeapReport> {
        self.heaps.iter().filter(|heap| !heap.is_consistent())
    }

    pub fn report_lines(&self) -> Vec<String> {
        let limits = &self.limits;
        let features = &self.features;
        let yes_no = |b: bool| if b { "Yes" } else { "No" };

        let mut lines = vec![
            format!(
                "Max memory allocations: {}",
                limits
                    .max_memory_allocation_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unknown".into())
            ),
            format!(
                "Max storage buffer range: {}",
                format_size(limits.max_storage_buffer_range)
            ),
            format!(
                "Max memory allocation size: {}",
                format_size(limits.max_memory_allocation_size)
            ),
            format!(
                "Supports shader 64-bit indexing: {}",
                yes_no(features.shader_64bit_indexing)
            ),
            format!("Supports 8-bit storage: {}", yes_no(features.storage_8bit)),
            format!(
                "Supports host memory import: {}",
                yes_no(features.external_host_memory)
            ),
            format!(
                "Supports buffer device address: {}",
                yes_no(features.buffer_device_address)
            ),
            format!(
                "Supports storage buffer arrays: {} (max {} per stage)",
                yes_no(features.storage_buffer_array),
                limits.max_storage_buffers_per_stage
            ),
        ];
        if self.heaps.is_empty() {
            lines.push("Memory heaps: not reported by backend".into());
        }
        lines.extend(self.heaps.iter().map(|heap| heap.to_string()));
        lines.extend(self.inconsistent_heaps().map(|heap| {
            format!(
                "Memory heap #{}: mismatching heap and type flags (heap device local: {}, types device local: {})",
                heap.index,
                yes_no(heap.heap_device_local),
                yes_no(heap.type_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL))
            )
        }));
        lines
    }
}

pub fn summarize_heaps(properties: &MemoryProperties) -> Vec<HeapReport> {
    properties
        .heaps
        .iter()
        .enumerate()
        .map(|(index, heap)| {
            let type_flags = properties
                .types
                .iter()
                .filter(|ty| ty.heap_index as usize == index)
                .fold(MemoryPropertyFlags::empty(), |acc, ty| acc | ty.flags);
            HeapReport {
                index: index as u32,
                size: heap.size,
                type_flags: MemoryPropertyFlags(type_flags.0 & 0xF),
                heap_device_local: heap.device_local,
            }
        })
        .collect()
}

pub fn probe<D: Device>(device: &D) -> Capabilities {
    let heaps = summarize_heaps(&device.memory_properties());
    let caps = Capabilities {
        features: device.features(),
        limits: device.limits(),
        heaps,
    };
    for heap in caps.inconsistent_heaps() {
        warn!(
            heap = heap.index,
            heap_device_local = heap.heap_device_local,
            type_flags = heap.type_flags.0,
            "Encountered memory heap with mismatching heap and type flags"
        );
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryHeap, MemoryType};
    use buffer_test_types::Shape;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            max_memory_allocation_count: Some(4096),
            max_storage_buffer_range: u32::MAX as u64,
            max_memory_allocation_size: 1 << 32,
            max_storage_buffers_per_stage: 8,
            min_imported_host_pointer_alignment: None,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(4_928_000_000), "4.59 GiB");
    }

    #[test]
    fn test_heap_flags_are_unioned_per_heap() {
        let properties = MemoryProperties {
            heaps: vec![
                MemoryHeap { size: 8 << 30, device_local: true },
                MemoryHeap { size: 16 << 30, device_local: false },
            ],
            types: vec![
                MemoryType { heap_index: 0, flags: MemoryPropertyFlags::DEVICE_LOCAL },
                MemoryType {
                    heap_index: 1,
                    flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                },
                MemoryType {
                    heap_index: 1,
                    flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                },
            ],
        };
        let heaps = summarize_heaps(&properties);
        assert_eq!(heaps.len(), 2);
        assert!(heaps.iter().all(HeapReport::is_consistent));
        assert_eq!(heaps[0].to_string(), "Memory heap #0: 8.00 GiB (device local)");
        assert_eq!(
            heaps[1].to_string(),
            "Memory heap #1: 16.00 GiB (host visible, host coherent, host cached)"
        );
    }

    #[test]
    fn test_mismatched_heap_is_flagged() {
        let properties = MemoryProperties {
            heaps: vec![MemoryHeap { size: 1 << 30, device_local: true }],
            types: vec![MemoryType { heap_index: 0, flags: MemoryPropertyFlags::HOST_VISIBLE }],
        };
        let caps = Capabilities {
            features: DeviceFeatures::default(),
            limits: limits(),
            heaps: summarize_heaps(&properties),
        };
        assert_eq!(caps.inconsistent_heaps().count(), 1);
        let lines = caps.report_lines();
        assert_eq!(
            lines.last().unwrap(),
            "Memory heap #0: mismatching heap and type flags (heap device local: Yes, types device local: No)"
        );
    }

    #[test]
    fn test_gating() {
        let caps = Capabilities {
            features: DeviceFeatures {
                storage_buffer_array: true,
                ..Default::default()
            },
            limits: limits(),
            heaps: vec![],
        };
        let base = TestCase {
            shape: Shape::new(4, 4, 4, 3),
            data_type: DataType::Float32,
            addressing_mode: AddressingMode::StorageBuffer,
            index_width: IndexWidth::Bits32,
            allocation_source: AllocationSource::DeviceUpload,
        };
        assert_eq!(caps.admits(&base), Ok(()));
        assert_eq!(
            caps.admits(&TestCase { index_width: IndexWidth::Bits64, ..base }),
            Err(SkipReason::No64BitIndexing)
        );
        assert_eq!(
            caps.admits(&TestCase { data_type: DataType::Uint8, ..base }),
            Err(SkipReason::No8BitStorage)
        );
        assert_eq!(
            caps.admits(&TestCase { allocation_source: AllocationSource::HostImport, ..base }),
            Err(SkipReason::NoHostMemoryImport)
        );
        assert_eq!(
            caps.admits(&TestCase { addressing_mode: AddressingMode::BufferReferenceArray, ..base }),
            Err(SkipReason::NoBufferDeviceAddress)
        );
        assert_eq!(
            caps.admits(&TestCase { addressing_mode: AddressingMode::StorageBufferArray, ..base }),
            Ok(())
        );
        let wide = TestCase {
            shape: Shape::new(4, 4, 4, 700),
            addressing_mode: AddressingMode::StorageBufferArray,
            ..base
        };
        assert_eq!(
            caps.admits(&wide),
            Err(SkipReason::TooManyChannelBindings { channels: 700, limit: 8 })
        );
    }

    #[test]
    fn test_report_without_heaps() {
        let caps = Capabilities {
            features: DeviceFeatures::default(),
            limits: limits(),
            heaps: vec![],
        };
        let lines = caps.report_lines();
        assert!(lines.contains(&"Memory heaps: not reported by backend".to_string()));
        assert!(lines.contains(&"Supports shader 64-bit indexing: No".to_string()));
        assert!(lines.contains(&"Max memory allocations: 4096".to_string()));
        assert!(!lines.iter().any(|l| l.contains("mismatching")));
    }
}
