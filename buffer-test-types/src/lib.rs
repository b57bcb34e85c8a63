use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Uint8,
}

impl DataType {
    pub const ALL: [DataType; 2] = [DataType::Float32, DataType::Uint8];

    /// Element stride in bytes.
    pub const fn size(self) -> u64 {
        match self {
            DataType::Float32 => 4,
            DataType::Uint8 => 1,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Uint8 => "uint8",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    StorageBuffer,
    StorageBufferArray,
    BufferReference,
    BufferReferenceArray,
}

impl AddressingMode {
    pub const ALL: [AddressingMode; 4] = [
        AddressingMode::StorageBuffer,
        AddressingMode::StorageBufferArray,
        AddressingMode::BufferReference,
        AddressingMode::BufferReferenceArray,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            AddressingMode::StorageBuffer => "Storage buffer",
            AddressingMode::StorageBufferArray => "Storage buffer array",
            AddressingMode::BufferReference => "Buffer reference",
            AddressingMode::BufferReferenceArray => "Buffer reference array",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexWidth {
    Bits32,
    Bits64,
}

impl IndexWidth {
    pub const ALL: [IndexWidth; 2] = [IndexWidth::Bits32, IndexWidth::Bits64];

    pub const fn bits(self) -> u32 {
        match self {
            IndexWidth::Bits32 => 32,
            IndexWidth::Bits64 => 64,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    DeviceUpload,
    HostImport,
}

impl AllocationSource {
    pub const ALL: [AllocationSource; 2] =
        [AllocationSource::DeviceUpload, AllocationSource::HostImport];

    pub const fn label(self) -> &'static str {
        match self {
            AllocationSource::DeviceUpload => "device upload",
            AllocationSource::HostImport => "host import",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub channels: u32,
}

impl Shape {
    pub const fn new(x: u32, y: u32, z: u32, channels: u32) -> Self {
        Self { x, y, z, channels }
    }

    /// Element counts of the domain, or `None` when they overflow `u64`.
    pub fn domain(&self) -> Option<LogicalDomain> {
        let element_count_3d = (self.x as u64)
            .checked_mul(self.y as u64)?
            .checked_mul(self.z as u64)?;
        let element_count = element_count_3d.checked_mul(self.channels as u64)?;
        Some(LogicalDomain {
            element_count_3d,
            element_count,
        })
    }

    pub fn with_channel_multiplier(self, multiplier: u32) -> Option<Shape> {
        Some(Shape {
            channels: self.channels.checked_mul(multiplier)?,
            ..self
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}", self.x, self.y, self.z, self.channels)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LogicalDomain {
    pub element_count_3d: u64,
    pub element_count: u64,
}

impl LogicalDomain {
    pub fn last_index(&self) -> u64 {
        self.element_count.saturating_sub(1)
    }

    pub fn byte_len(&self, data_type: DataType) -> Option<u64> {
        self.element_count.checked_mul(data_type.size())
    }

    pub fn channel_byte_len(&self, data_type: DataType) -> Option<u64> {
        self.element_count_3d.checked_mul(data_type.size())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestCase {
    pub shape: Shape,
    pub data_type: DataType,
    pub addressing_mode: AddressingMode,
    pub index_width: IndexWidth,
    pub allocation_source: AllocationSource,
}

impl TestCase {
    /// Array-of-buffers mode only exists for 32-bit floats backed by device uploads.
    pub fn is_structurally_valid(&self) -> bool {
        !(self.addressing_mode == AddressingMode::StorageBufferArray
            && (self.data_type == DataType::Uint8
                || self.allocation_source == AllocationSource::HostImport))
    }

    pub fn domain(&self) -> Option<LogicalDomain> {
        self.shape.domain()
    }

    pub fn name(&self) -> String {
        let width = match self.index_width {
            IndexWidth::Bits32 => "",
            IndexWidth::Bits64 => " (64-bit)",
        };
        format!(
            "{}{} [{}, {}, {}]",
            self.addressing_mode.label(),
            width,
            self.data_type.label(),
            self.allocation_source.label(),
            self.shape
        )
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Bit of the Vulkan backend in `wgpu::Backends`.
pub const VULKAN_BACKEND_BITS: u32 = 1 << 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub shapes: Vec<Shape>,
    pub data_types: Vec<DataType>,
    pub addressing_modes: Vec<AddressingMode>,
    pub index_widths: Vec<IndexWidth>,
    pub allocation_sources: Vec<AllocationSource>,
    /// Channel multiplier applied to UInt8 cases so they span as many bytes as Float32.
    pub uint8_channel_multiplier: u32,
    pub fence_timeout_ms: u64,
    pub backends_bits: Option<u32>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            // ~4.59 GiB per Float32 input.
            shapes: vec![Shape::new(250, 352, 20, 700)],
            data_types: DataType::ALL.to_vec(),
            addressing_modes: AddressingMode::ALL.to_vec(),
            index_widths: IndexWidth::ALL.to_vec(),
            allocation_sources: AllocationSource::ALL.to_vec(),
            uint8_channel_multiplier: 4,
            fence_timeout_ms: 60_000,
            backends_bits: Some(VULKAN_BACKEND_BITS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(mode: AddressingMode, data_type: DataType, source: AllocationSource) -> TestCase {
        TestCase {
            shape: Shape::new(4, 4, 4, 3),
            data_type,
            addressing_mode: mode,
            index_width: IndexWidth::Bits32,
            allocation_source: source,
        }
    }

    #[test]
    fn test_domain_counts() {
        let domain = Shape::new(250, 352, 20, 700).domain().unwrap();
        assert_eq!(domain.element_count_3d, 1_760_000);
        assert_eq!(domain.element_count, 1_232_000_000);
        assert_eq!(domain.last_index(), 1_231_999_999);
        assert_eq!(domain.byte_len(DataType::Float32), Some(4_928_000_000));
        assert_eq!(domain.channel_byte_len(DataType::Float32), Some(7_040_000));
    }

    #[test]
    fn test_domain_overflow_is_none() {
        let shape = Shape::new(u32::MAX, u32::MAX, u32::MAX, 2);
        assert!(shape.domain().is_none());
    }

    #[test]
    fn test_uint8_multiplier_keeps_byte_footprint() {
        let shape = Shape::new(512, 512, 512, 5);
        let float_bytes = shape.domain().unwrap().byte_len(DataType::Float32).unwrap();
        let widened = shape.with_channel_multiplier(4).unwrap();
        let byte_bytes = widened.domain().unwrap().byte_len(DataType::Uint8).unwrap();
        assert_eq!(float_bytes, byte_bytes);
    }

    #[test]
    fn test_structural_exclusions() {
        use AddressingMode::*;
        assert!(!case(StorageBufferArray, DataType::Uint8, AllocationSource::DeviceUpload)
            .is_structurally_valid());
        assert!(!case(StorageBufferArray, DataType::Float32, AllocationSource::HostImport)
            .is_structurally_valid());
        assert!(case(StorageBufferArray, DataType::Float32, AllocationSource::DeviceUpload)
            .is_structurally_valid());
        assert!(case(BufferReferenceArray, DataType::Uint8, AllocationSource::HostImport)
            .is_structurally_valid());
    }

    #[test]
    fn test_case_names() {
        let mut c = case(
            AddressingMode::BufferReferenceArray,
            DataType::Float32,
            AllocationSource::DeviceUpload,
        );
        assert_eq!(c.name(), "Buffer reference array [float32, device upload, 4x4x4x3]");
        c.index_width = IndexWidth::Bits64;
        c.data_type = DataType::Uint8;
        assert_eq!(c.name(), "Buffer reference array (64-bit) [uint8, device upload, 4x4x4x3]");

        let wider = TestCase {
            shape: Shape::new(4, 4, 4, 12),
            ..c
        };
        assert_ne!(wider.name(), c.name());
    }

    #[test]
    fn test_config_json_names() {
        let json = serde_json::to_string(&HarnessConfig::default()).unwrap();
        assert!(json.contains("\"storage_buffer_array\""));
        assert!(json.contains("\"bits64\""));
        assert!(json.contains("\"host_import\""));
    }
}
