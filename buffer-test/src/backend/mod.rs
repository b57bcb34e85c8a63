use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;

use crate::variant::ProgramConfig;
use crate::Error;

pub mod emulated;
pub mod native;
pub(crate) mod wgsl;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceType {
    DiscreteGpu,
    IntegratedGpu,
    VirtualGpu,
    Cpu,
    Other,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::DiscreteGpu => "discrete GPU",
            DeviceType::IntegratedGpu => "integrated GPU",
            DeviceType::VirtualGpu => "virtual GPU",
            DeviceType::Cpu => "CPU",
            DeviceType::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub device_type: DeviceType,
    pub backend: String,
    pub driver: String,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}", self.name, self.device_type, self.backend)?;
        if !self.driver.is_empty() {
            write!(f, ", {}", self.driver)?;
        }
        f.write_str(")")
    }
}

/// Property flags of a memory type, using the Vulkan bit positions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryPropertyFlags(pub u32);

impl MemoryPropertyFlags {
    pub const DEVICE_LOCAL: Self = Self(1 << 0);
    pub const HOST_VISIBLE: Self = Self(1 << 1);
    pub const HOST_COHERENT: Self = Self(1 << 2);
    pub const HOST_CACHED: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemoryPropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub heap_index: u32,
    pub flags: MemoryPropertyFlags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub heaps: Vec<MemoryHeap>,
    pub types: Vec<MemoryType>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub shader_64bit_indexing: bool,
    pub storage_8bit: bool,
    pub external_host_memory: bool,
    pub buffer_device_address: bool,
    pub storage_buffer_array: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// `None` when the backend does not expose the allocation count.
    pub max_memory_allocation_count: Option<u32>,
    pub max_storage_buffer_range: u64,
    pub max_memory_allocation_size: u64,
    pub max_storage_buffers_per_stage: u32,
    pub min_imported_host_pointer_alignment: Option<u64>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const STORAGE: Self = Self(1 << 0);
    pub const UNIFORM: Self = Self(1 << 1);
    pub const COPY_SRC: Self = Self(1 << 2);
    pub const COPY_DST: Self = Self(1 << 3);
    pub const MAP_READ: Self = Self(1 << 4);
    pub const DEVICE_ADDRESS: Self = Self(1 << 5);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    TransferWrite,
    TransferRead,
    ShaderRead,
    ShaderWrite,
    UniformRead,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Transfer,
    ComputeShader,
}

/// A buffer memory barrier: producer access/stage to consumer access/stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub src_access: Access,
    pub dst_access: Access,
    pub src_stage: Stage,
    pub dst_stage: Stage,
}

impl BufferBarrier {
    pub const TRANSFER_TO_SHADER_WRITE: Self = Self {
        src_access: Access::TransferWrite,
        dst_access: Access::ShaderWrite,
        src_stage: Stage::Transfer,
        dst_stage: Stage::ComputeShader,
    };

    pub const TRANSFER_TO_UNIFORM_READ: Self = Self {
        src_access: Access::TransferWrite,
        dst_access: Access::UniformRead,
        src_stage: Stage::Transfer,
        dst_stage: Stage::ComputeShader,
    };

    pub const SHADER_WRITE_TO_TRANSFER_READ: Self = Self {
        src_access: Access::ShaderWrite,
        dst_access: Access::TransferRead,
        src_stage: Stage::ComputeShader,
        dst_stage: Stage::Transfer,
    };

    pub fn label(&self) -> String {
        format!("barrier {:?}->{:?}", self.src_access, self.dst_access)
    }
}

pub enum InputBinding<'a, B> {
    Storage(&'a B),
    StorageArray(&'a [B]),
    /// Raw device address handed to the program inline.
    Address(u64),
    /// Uniform buffer holding the device address.
    AddressUniform(&'a B),
}

pub struct Bindings<'a, B> {
    pub output: &'a B,
    pub input: InputBinding<'a, B>,
}

pub trait Instance {
    type Adapter: Adapter;

    fn adapters(&self) -> Vec<Self::Adapter>;
}

pub trait Adapter {
    type Device: Device;

    fn info(&self) -> AdapterInfo;
    fn open(self) -> Result<Self::Device, Error>;
}

pub trait Buffer {
    fn size(&self) -> u64;
    fn device_address(&self) -> Option<u64>;
    fn map_read(&self, len: u64) -> Result<Vec<u8>, Error>;
}

pub trait Fence {
    fn wait(&mut self) -> Result<(), Error>;
    fn reset(&mut self);
    fn is_signaled(&self) -> bool;
}

pub trait CommandContext {
    type Buffer: Buffer;
    type Program;

    fn begin(&mut self) -> Result<(), Error>;
    fn update_buffer(&mut self, dst: &Self::Buffer, offset: u64, data: &[u8]) -> Result<(), Error>;
    fn buffer_barrier(&mut self, barrier: BufferBarrier, buffer: &Self::Buffer);
    fn bind(
        &mut self,
        program: &Self::Program,
        bindings: Bindings<'_, Self::Buffer>,
    ) -> Result<(), Error>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), Error>;
    fn copy_buffer(&mut self, src: &Self::Buffer, dst: &Self::Buffer, size: u64);
    fn end(&mut self) -> Result<(), Error>;
}

pub trait Device {
    type Buffer: Buffer;
    type Program;
    type Commands: CommandContext<Buffer = Self::Buffer, Program = Self::Program>;
    type Fence: Fence;

    fn memory_properties(&self) -> MemoryProperties;
    fn features(&self) -> DeviceFeatures;
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer, Error>;
    fn create_buffer_init(&self, desc: &BufferDesc, contents: &[u8]) -> Result<Self::Buffer, Error>;

    /// Wraps host memory as a device buffer without copying it. Panics when
    /// `ptr` or `len` is not a multiple of the minimum import alignment.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay allocated and unaliased for as long as the
    /// returned buffer exists and any GPU work reading it is pending.
    unsafe fn import_host_memory(
        &self,
        desc: &BufferDesc,
        ptr: NonNull<u8>,
        len: u64,
    ) -> Result<Self::Buffer, Error>;

    fn build_program(&self, config: &ProgramConfig) -> Result<Self::Program, Error>;
    fn create_command_context(&self) -> Result<Self::Commands, Error>;
    fn create_fence(&self) -> Result<Self::Fence, Error>;
    fn submit(&self, commands: &mut Self::Commands, fence: &mut Self::Fence) -> Result<(), Error>;
}
