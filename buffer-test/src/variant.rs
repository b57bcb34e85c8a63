use buffer_test_types::{AddressingMode, DataType, IndexWidth, Shape, TestCase};
use tracing::debug;

use crate::backend::DeviceFeatures;
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub addressing_mode: AddressingMode,
    pub index_width: IndexWidth,
    pub data_type: DataType,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Storage,
    StorageArray,
    Address,
    AddressUniform,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderExtension {
    Shader64BitIndexing,
    BufferDeviceAddress,
    Storage8Bit,
    DescriptorIndexing,
}

impl ShaderExtension {
    pub fn supported_by(self, features: &DeviceFeatures) -> bool {
        match self {
            ShaderExtension::Shader64BitIndexing => features.shader_64bit_indexing,
            ShaderExtension::BufferDeviceAddress => features.buffer_device_address,
            ShaderExtension::Storage8Bit => features.storage_8bit,
            ShaderExtension::DescriptorIndexing => features.storage_buffer_array,
        }
    }
}

struct ModeEntry {
    mode: AddressingMode,
    binding: BindingKind,
    extension: Option<ShaderExtension>,
}

static MODE_TABLE: [ModeEntry; 4] = [
    ModeEntry {
        mode: AddressingMode::StorageBuffer,
        binding: BindingKind::Storage,
        extension: None,
    },
    ModeEntry {
        mode: AddressingMode::StorageBufferArray,
        binding: BindingKind::StorageArray,
        extension: Some(ShaderExtension::DescriptorIndexing),
    },
    ModeEntry {
        mode: AddressingMode::BufferReference,
        binding: BindingKind::Address,
        extension: Some(ShaderExtension::BufferDeviceAddress),
    },
    ModeEntry {
        mode: AddressingMode::BufferReferenceArray,
        binding: BindingKind::AddressUniform,
        extension: Some(ShaderExtension::BufferDeviceAddress),
    },
];

fn mode_entry(mode: AddressingMode) -> &'static ModeEntry {
    // MODE_TABLE covers every AddressingMode variant.
    MODE_TABLE
        .iter()
        .find(|entry| entry.mode == mode)
        .unwrap_or(&MODE_TABLE[0])
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProgramConfig {
    pub key: VariantKey,
    pub shape: Shape,
    pub binding: BindingKind,
    pub extensions: Vec<ShaderExtension>,
    pub use_64bit_indexing: bool,
}

impl ProgramConfig {
    pub fn requires(&self, extension: ShaderExtension) -> bool {
        self.extensions.contains(&extension)
    }

    pub fn missing_extensions(&self, features: &DeviceFeatures) -> Vec<ShaderExtension> {
        self.extensions
            .iter()
            .copied()
            .filter(|ext| !ext.supported_by(features))
            .collect()
    }
}

pub fn select_variant(case: &TestCase) -> VariantKey {
    VariantKey {
        addressing_mode: case.addressing_mode,
        index_width: case.index_width,
        data_type: case.data_type,
    }
}

pub fn program_config(case: &TestCase) -> ProgramConfig {
    let key = select_variant(case);
    let entry = mode_entry(key.addressing_mode);

    let mut extensions = Vec::new();
    if let Some(ext) = entry.extension {
        extensions.push(ext);
    }
    if key.data_type == DataType::Uint8 {
        extensions.push(ShaderExtension::Storage8Bit);
    }
    let use_64bit_indexing = key.index_width == IndexWidth::Bits64;
    if use_64bit_indexing {
        extensions.push(ShaderExtension::Shader64BitIndexing);
    }

    ProgramConfig {
        key,
        shape: case.shape,
        binding: entry.binding,
        extensions,
        use_64bit_indexing,
    }
}

/// Capacity-one program cache with program/data dirty tracking.
pub struct ProgramSlot<P> {
    config: Option<ProgramConfig>,
    program: Option<P>,
    program_dirty: bool,
    data_dirty: bool,
    builds: u64,
}

impl<P> Default for ProgramSlot<P> {
    fn default() -> Self {
        Self {
            config: None,
            program: None,
            program_dirty: false,
            data_dirty: false,
            builds: 0,
        }
    }
}

impl<P> ProgramSlot<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_variant(&mut self, config: ProgramConfig) {
        if self.config.as_ref() == Some(&config) {
            return;
        }
        debug!(key = ?config.key, shape = %config.shape, "program_variant_changed");
        self.config = Some(config);
        self.program = None;
        self.program_dirty = true;
        self.data_dirty = true;
    }

    pub fn set_inputs(&mut self) {
        self.data_dirty = true;
    }

    pub fn is_program_dirty(&self) -> bool {
        self.program_dirty
    }

    pub fn is_data_dirty(&self) -> bool {
        self.data_dirty
    }

    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn config(&self) -> Option<&ProgramConfig> {
        self.config.as_ref()
    }

    pub fn prepare(
        &mut self,
        build: impl FnOnce(&ProgramConfig) -> Result<P, Error>,
    ) -> Result<&P, Error> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::Protocol("no program variant selected".into()))?;
        if self.program_dirty || self.program.is_none() {
            self.program = Some(build(config)?);
            self.program_dirty = false;
            self.builds += 1;
        }
        self.data_dirty = false;
        self.program
            .as_ref()
            .ok_or_else(|| Error::Protocol("program slot is empty".into()))
    }
}
