use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::time::Duration;

use buffer_test_types::DataType;
use tracing::{debug, trace, warn};

use super::{
    Access, AdapterInfo, Bindings, BufferBarrier, BufferDesc, BufferUsage, DeviceFeatures,
    DeviceLimits, DeviceType, InputBinding, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
    MemoryType,
};
use crate::variant::{BindingKind, ProgramConfig, VariantKey};
use crate::Error;

/// First device address handed out; zero is never a valid address.
pub const ADDRESS_BASE: u64 = 0x1_0000_0000;
const ADDRESS_ALIGNMENT: u64 = 0x1_0000;

#[derive(Clone, Debug, PartialEq)]
pub enum JournalEntry {
    BufferCreated { label: &'static str, size: u64 },
    ProgramBuilt(VariantKey),
    Begin,
    UpdateBuffer { buffer: &'static str, len: u64 },
    Barrier { buffer: &'static str, barrier: BufferBarrier },
    Bind(BindingKind),
    Dispatch,
    Copy { src: &'static str, dst: &'static str, size: u64 },
    End,
    Submit,
    FenceWaited,
    FenceReset,
    Hazard { buffer: &'static str, detail: String },
}

/// Shared, append-only log of everything a device was asked to do.
#[derive(Clone, Debug, Default)]
pub struct Journal(Rc<RefCell<Vec<JournalEntry>>>);

impl Journal {
    fn push(&self, entry: JournalEntry) {
        trace!(?entry, "journal");
        self.0.borrow_mut().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.borrow().clone()
    }

    pub fn count(&self, pred: impl Fn(&JournalEntry) -> bool) -> usize {
        self.0.borrow().iter().filter(|e| pred(e)).count()
    }
}

#[derive(Clone, Debug)]
pub struct EmulatedProfile {
    pub name: String,
    pub device_type: DeviceType,
    pub features: DeviceFeatures,
    pub limits: DeviceLimits,
    pub memory: MemoryProperties,
    /// Bits kept of byte offsets computed by 32-bit programs.
    pub offset_bits_32: u32,
    /// Fences never signal; every wait reports a timeout.
    pub stall_fences: bool,
    pub fence_timeout: Duration,
    pub journal: Journal,
}

impl EmulatedProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type: DeviceType::VirtualGpu,
            features: DeviceFeatures {
                shader_64bit_indexing: true,
                storage_8bit: true,
                external_host_memory: true,
                buffer_device_address: true,
                storage_buffer_array: true,
            },
            limits: DeviceLimits {
                max_memory_allocation_count: Some(4096),
                max_storage_buffer_range: 1 << 40,
                max_memory_allocation_size: 1 << 40,
                max_storage_buffers_per_stage: 1024,
                min_imported_host_pointer_alignment: Some(4096),
            },
            memory: default_memory(),
            offset_bits_32: 32,
            stall_fences: false,
            fence_timeout: Duration::from_secs(1),
            journal: Journal::default(),
        }
    }
}

fn default_memory() -> MemoryProperties {
    MemoryProperties {
        heaps: vec![
            MemoryHeap {
                size: 8 << 30,
                device_local: true,
            },
            MemoryHeap {
                size: 16 << 30,
                device_local: false,
            },
        ],
        types: vec![
            MemoryType {
                heap_index: 0,
                flags: MemoryPropertyFlags::DEVICE_LOCAL,
            },
            MemoryType {
                heap_index: 1,
                flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            },
            MemoryType {
                heap_index: 1,
                flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT
                    | MemoryPropertyFlags::HOST_CACHED,
            },
        ],
    }
}

pub struct EmulatedInstance {
    profiles: Vec<EmulatedProfile>,
}

impl EmulatedInstance {
    pub fn new(profiles: Vec<EmulatedProfile>) -> Self {
        Self { profiles }
    }
}

impl super::Instance for EmulatedInstance {
    type Adapter = EmulatedAdapter;

    fn adapters(&self) -> Vec<EmulatedAdapter> {
        self.profiles
            .iter()
            .cloned()
            .map(|profile| EmulatedAdapter { profile })
            .collect()
    }
}

pub struct EmulatedAdapter {
    profile: EmulatedProfile,
}

impl super::Adapter for EmulatedAdapter {
    type Device = EmulatedDevice;

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.profile.name.clone(),
            device_type: self.profile.device_type,
            backend: "Emulated".into(),
            driver: String::new(),
        }
    }

    fn open(self) -> Result<EmulatedDevice, Error> {
        Ok(EmulatedDevice::new(self.profile))
    }
}

enum Backing {
    Owned(RefCell<Vec<u8>>),
    Imported { ptr: NonNull<u8>, len: usize },
}

struct PendingWrite {
    access: Access,
    offset: usize,
    data: Vec<u8>,
}

struct BufferState {
    label: &'static str,
    size: u64,
    usage: BufferUsage,
    backing: Backing,
    pending: RefCell<Vec<PendingWrite>>,
    address: Option<u64>,
    live: Rc<Cell<u32>>,
}

impl Drop for BufferState {
    fn drop(&mut self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

impl BufferState {
    fn with_visible<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.backing {
            Backing::Owned(bytes) => f(&bytes.borrow()),
            // The importer keeps the allocation alive while the buffer exists.
            Backing::Imported { ptr, len } => {
                f(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *len) })
            }
        }
    }

    fn read_visible(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        self.with_visible(|bytes| bytes.get(start..end).map(<[u8]>::to_vec))
    }

    fn write_visible(&self, offset: usize, data: &[u8]) {
        match &self.backing {
            Backing::Owned(bytes) => {
                let mut bytes = bytes.borrow_mut();
                let end = (offset + data.len()).min(bytes.len());
                if offset < end {
                    bytes[offset..end].copy_from_slice(&data[..end - offset]);
                }
            }
            Backing::Imported { ptr, len } => {
                let end = (offset + data.len()).min(*len);
                if offset < end {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            data.as_ptr(),
                            ptr.as_ptr().add(offset),
                            end - offset,
                        )
                    };
                }
            }
        }
    }

    /// Queues a device write; it becomes visible on a matching barrier.
    fn stage(&self, journal: &Journal, access: Access, offset: usize, data: Vec<u8>) {
        let mut pending = self.pending.borrow_mut();
        if let Some(other) = pending.iter().find(|w| w.access != access) {
            journal.push(JournalEntry::Hazard {
                buffer: self.label,
                detail: format!("{:?} after unsynchronized {:?}", access, other.access),
            });
        }
        pending.push(PendingWrite {
            access,
            offset,
            data,
        });
    }

    /// Makes pending writes visible, all of them when `access` is `None`.
    fn commit(&self, access: Option<Access>) {
        let writes: Vec<PendingWrite> = {
            let mut pending = self.pending.borrow_mut();
            let (matching, rest): (Vec<PendingWrite>, Vec<PendingWrite>) = pending
                .drain(..)
                .partition(|w| access.map_or(true, |a| w.access == a));
            *pending = rest;
            matching
        };
        for write in writes {
            self.write_visible(write.offset, &write.data);
        }
    }

    /// Device read; unsynchronized pending writes are a hazard.
    fn observe(&self, journal: &Journal, reader: Access) {
        if let Some(write) = self.pending.borrow().first() {
            journal.push(JournalEntry::Hazard {
                buffer: self.label,
                detail: format!("{:?} before {:?} was made visible", reader, write.access),
            });
        }
    }
}

pub struct EmulatedBuffer {
    state: Rc<BufferState>,
}

impl EmulatedBuffer {
    pub fn peek(&self) -> Vec<u8> {
        self.state.with_visible(<[u8]>::to_vec)
    }

    pub fn poke(&self, offset: usize, data: &[u8]) {
        self.state.write_visible(offset, data);
    }
}

impl super::Buffer for EmulatedBuffer {
    fn size(&self) -> u64 {
        self.state.size
    }

    fn device_address(&self) -> Option<u64> {
        self.state.address
    }

    fn map_read(&self, len: u64) -> Result<Vec<u8>, Error> {
        if !self.state.usage.contains(BufferUsage::MAP_READ) {
            return Err(Error::Protocol(format!(
                "{} buffer is not host mappable",
                self.state.label
            )));
        }
        self.state.read_visible(0, len as usize).ok_or_else(|| {
            Error::Device(format!(
                "map of {} bytes exceeds {} buffer of {}",
                len, self.state.label, self.state.size
            ))
        })
    }
}

pub struct EmulatedProgram {
    config: Rc<ProgramConfig>,
}

pub struct EmulatedFence {
    journal: Journal,
    in_flight: bool,
    signaled: bool,
    timeout: Duration,
}

impl super::Fence for EmulatedFence {
    /// Submissions complete synchronously, so a stalled fence reports the
    /// timeout without sleeping.
    fn wait(&mut self) -> Result<(), Error> {
        if self.signaled {
            self.in_flight = false;
            self.journal.push(JournalEntry::FenceWaited);
            Ok(())
        } else if self.in_flight {
            Err(Error::SyncTimeout(self.timeout))
        } else {
            Err(Error::Protocol("wait on a fence with no submission".into()))
        }
    }

    fn reset(&mut self) {
        self.signaled = false;
        self.journal.push(JournalEntry::FenceReset);
    }

    fn is_signaled(&self) -> bool {
        self.signaled
    }
}

enum BoundInput {
    Storage(Rc<BufferState>),
    Array(Vec<Rc<BufferState>>),
    Address(u64),
    AddressUniform(Rc<BufferState>),
}

enum Command {
    Update {
        dst: Rc<BufferState>,
        offset: usize,
        data: Vec<u8>,
    },
    Barrier {
        barrier: BufferBarrier,
        buffer: Rc<BufferState>,
    },
    Bind {
        program: Rc<ProgramConfig>,
        output: Rc<BufferState>,
        input: BoundInput,
    },
    Dispatch,
    Copy {
        src: Rc<BufferState>,
        dst: Rc<BufferState>,
        size: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RecordState {
    Initial,
    Recording,
    Ended,
}

pub struct EmulatedCommands {
    journal: Journal,
    commands: Vec<Command>,
    state: RecordState,
    bound: bool,
    deferred: Option<Error>,
}

impl EmulatedCommands {
    fn recording(&self) -> Result<(), Error> {
        if self.state == RecordState::Recording {
            Ok(())
        } else {
            Err(Error::Protocol("command context is not recording".into()))
        }
    }

    fn defer(&mut self, error: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }
}

impl super::CommandContext for EmulatedCommands {
    type Buffer = EmulatedBuffer;
    type Program = EmulatedProgram;

    fn begin(&mut self) -> Result<(), Error> {
        self.commands.clear();
        self.state = RecordState::Recording;
        self.bound = false;
        self.deferred = None;
        self.journal.push(JournalEntry::Begin);
        Ok(())
    }

    fn update_buffer(&mut self, dst: &EmulatedBuffer, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.recording()?;
        let state = &dst.state;
        if !state.usage.contains(BufferUsage::COPY_DST) {
            return Err(Error::Protocol(format!("{} buffer is not a copy destination", state.label)));
        }
        if offset + data.len() as u64 > state.size {
            return Err(Error::Protocol(format!(
                "update of {} bytes at {} overruns {} buffer",
                data.len(),
                offset,
                state.label
            )));
        }
        self.journal.push(JournalEntry::UpdateBuffer {
            buffer: state.label,
            len: data.len() as u64,
        });
        self.commands.push(Command::Update {
            dst: state.clone(),
            offset: offset as usize,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn buffer_barrier(&mut self, barrier: BufferBarrier, buffer: &EmulatedBuffer) {
        if let Err(e) = self.recording() {
            self.defer(e);
            return;
        }
        self.journal.push(JournalEntry::Barrier {
            buffer: buffer.state.label,
            barrier,
        });
        self.commands.push(Command::Barrier {
            barrier,
            buffer: buffer.state.clone(),
        });
    }

    fn bind(&mut self, program: &EmulatedProgram, bindings: Bindings<'_, EmulatedBuffer>) -> Result<(), Error> {
        self.recording()?;
        let expected = program.config.binding;
        let input = match (expected, bindings.input) {
            (BindingKind::Storage, InputBinding::Storage(b)) => BoundInput::Storage(b.state.clone()),
            (BindingKind::StorageArray, InputBinding::StorageArray(bs)) => {
                BoundInput::Array(bs.iter().map(|b| b.state.clone()).collect())
            }
            (BindingKind::Address, InputBinding::Address(address)) => BoundInput::Address(address),
            (BindingKind::AddressUniform, InputBinding::AddressUniform(b)) => {
                BoundInput::AddressUniform(b.state.clone())
            }
            (expected, _) => {
                return Err(Error::Protocol(format!(
                    "input binding does not match {:?} program",
                    expected
                )))
            }
        };
        self.journal.push(JournalEntry::Bind(expected));
        self.commands.push(Command::Bind {
            program: program.config.clone(),
            output: bindings.output.state.clone(),
            input,
        });
        self.bound = true;
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), Error> {
        self.recording()?;
        if !self.bound {
            return Err(Error::Protocol("dispatch without bound program".into()));
        }
        if (x, y, z) != (1, 1, 1) {
            return Err(Error::Unsupported(format!(
                "dispatch of {}x{}x{} workgroups",
                x, y, z
            )));
        }
        self.journal.push(JournalEntry::Dispatch);
        self.commands.push(Command::Dispatch);
        Ok(())
    }

    fn copy_buffer(&mut self, src: &EmulatedBuffer, dst: &EmulatedBuffer, size: u64) {
        if let Err(e) = self.recording() {
            self.defer(e);
            return;
        }
        self.journal.push(JournalEntry::Copy {
            src: src.state.label,
            dst: dst.state.label,
            size,
        });
        self.commands.push(Command::Copy {
            src: src.state.clone(),
            dst: dst.state.clone(),
            size: size as usize,
        });
    }

    fn end(&mut self) -> Result<(), Error> {
        if let Some(e) = self.deferred.take() {
            self.state = RecordState::Initial;
            return Err(e);
        }
        self.recording()?;
        self.state = RecordState::Ended;
        self.journal.push(JournalEntry::End);
        Ok(())
    }
}

pub struct EmulatedDevice {
    profile: EmulatedProfile,
    live: Rc<Cell<u32>>,
    addresses: RefCell<HashMap<u64, Weak<BufferState>>>,
    next_address: Cell<u64>,
}

impl EmulatedDevice {
    pub fn new(profile: EmulatedProfile) -> Self {
        debug!(name = %profile.name, "emulated device opened");
        Self {
            profile,
            live: Rc::new(Cell::new(0)),
            addresses: RefCell::new(HashMap::new()),
            next_address: Cell::new(ADDRESS_BASE),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.profile.journal
    }

    pub fn live_buffers(&self) -> u32 {
        self.live.get()
    }

    fn new_buffer(&self, desc: &BufferDesc, backing: Backing) -> Result<EmulatedBuffer, Error> {
        let address = if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
            if !self.profile.features.buffer_device_address {
                return Err(Error::Unsupported("buffer device address".into()));
            }
            let address = self.next_address.get();
            let span = desc
                .size
                .max(1)
                .checked_next_multiple_of(ADDRESS_ALIGNMENT)
                .and_then(|s| address.checked_add(s))
                .ok_or_else(|| Error::Device("device address space exhausted".into()))?;
            self.next_address.set(span);
            Some(address)
        } else {
            None
        };

        let state = Rc::new(BufferState {
            label: desc.label,
            size: desc.size,
            usage: desc.usage,
            backing,
            pending: RefCell::new(Vec::new()),
            address,
            live: self.live.clone(),
        });
        self.live.set(self.live.get() + 1);

        if let Some(address) = address {
            let mut addresses = self.addresses.borrow_mut();
            addresses.retain(|_, weak| weak.strong_count() > 0);
            addresses.insert(address, Rc::downgrade(&state));
        }
        self.profile.journal.push(JournalEntry::BufferCreated {
            label: desc.label,
            size: desc.size,
        });
        Ok(EmulatedBuffer { state })
    }

    fn admit(&self, desc: &BufferDesc) -> Result<(), Error> {
        let limits = &self.profile.limits;
        if desc.size > limits.max_memory_allocation_size {
            return Err(Error::Allocation {
                what: format!("{} buffer", desc.label),
                requested: desc.size,
                limit: limits.max_memory_allocation_size,
            });
        }
        if let Some(max) = limits.max_memory_allocation_count {
            if self.live.get() >= max {
                return Err(Error::Allocation {
                    what: "device memory allocations".into(),
                    requested: self.live.get() as u64 + 1,
                    limit: max as u64,
                });
            }
        }
        Ok(())
    }

    fn resolve(&self, address: u64) -> Option<Rc<BufferState>> {
        self.addresses.borrow().get(&address).and_then(Weak::upgrade)
    }

    fn byte_offset(&self, config: &ProgramConfig, coords: [u32; 4], dims: [u32; 3]) -> u64 {
        let [x, y, z, c] = coords;
        let [xs, ys, zs] = dims;
        let stride = config.key.data_type.size();
        if config.use_64bit_indexing {
            let index = (c as u64)
                .wrapping_mul(zs as u64)
                .wrapping_add(z as u64)
                .wrapping_mul(ys as u64)
                .wrapping_add(y as u64)
                .wrapping_mul(xs as u64)
                .wrapping_add(x as u64);
            index.wrapping_mul(stride)
        } else {
            let index = c
                .wrapping_mul(zs)
                .wrapping_add(z)
                .wrapping_mul(ys)
                .wrapping_add(y)
                .wrapping_mul(xs)
                .wrapping_add(x);
            let offset = index as u64 * stride;
            match self.profile.offset_bits_32 {
                bits if bits >= 64 => offset,
                bits => offset & ((1u64 << bits) - 1),
            }
        }
    }

    fn load(&self, buffer: Option<&BufferState>, data_type: DataType, offset: u64) -> [u8; 4] {
        let Some(buffer) = buffer else {
            return [0; 4];
        };
        buffer.observe(&self.profile.journal, Access::ShaderRead);
        match data_type {
            DataType::Float32 => buffer
                .read_visible(offset, 4)
                .and_then(|b| b.try_into().ok())
                .unwrap_or([0; 4]),
            DataType::Uint8 => {
                let byte = buffer.read_visible(offset, 1).map_or(0, |b| b[0]);
                (byte as u32).to_le_bytes()
            }
        }
    }

    fn execute(&self, config: &ProgramConfig, output: &BufferState, input: &BoundInput) {
        let shape = config.shape;
        let data_type = config.key.data_type;
        let coords = [
            shape.x.saturating_sub(1),
            shape.y.saturating_sub(1),
            shape.z.saturating_sub(1),
            shape.channels.saturating_sub(1),
        ];
        let dims = [shape.x, shape.y, shape.z];
        let journal = &self.profile.journal;

        let word = match input {
            BoundInput::Storage(buffer) => {
                let offset = self.byte_offset(config, coords, dims);
                self.load(Some(&**buffer), data_type, offset)
            }
            BoundInput::Array(channels) => {
                let [x, y, z, c] = coords;
                let offset = self.byte_offset(config, [x, y, z, 0], dims);
                self.load(channels.get(c as usize).map(|b| &**b), data_type, offset)
            }
            BoundInput::Address(address) => {
                let target = self.resolve(*address);
                if target.is_none() {
                    warn!(address, "program dereferenced an unmapped device address");
                }
                let offset = self.byte_offset(config, coords, dims);
                self.load(target.as_deref(), data_type, offset)
            }
            BoundInput::AddressUniform(uniform) => {
                uniform.observe(journal, Access::UniformRead);
                let address = uniform
                    .read_visible(0, 8)
                    .and_then(|b| b.try_into().ok())
                    .map_or(0, u64::from_le_bytes);
                let target = self.resolve(address);
                if target.is_none() {
                    warn!(address, "program dereferenced an unmapped device address");
                }
                let offset = self.byte_offset(config, coords, dims);
                self.load(target.as_deref(), data_type, offset)
            }
        };
        output.stage(journal, Access::ShaderWrite, 0, word.to_vec());
    }
}

impl super::Device for EmulatedDevice {
    type Buffer = EmulatedBuffer;
    type Program = EmulatedProgram;
    type Commands = EmulatedCommands;
    type Fence = EmulatedFence;

    fn memory_properties(&self) -> MemoryProperties {
        self.profile.memory.clone()
    }

    fn features(&self) -> DeviceFeatures {
        self.profile.features
    }

    fn limits(&self) -> DeviceLimits {
        self.profile.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<EmulatedBuffer, Error> {
        self.admit(desc)?;
        let len = usize::try_from(desc.size).map_err(|_| Error::Allocation {
            what: format!("{} buffer", desc.label),
            requested: desc.size,
            limit: usize::MAX as u64,
        })?;
        self.new_buffer(desc, Backing::Owned(RefCell::new(vec![0u8; len])))
    }

    fn create_buffer_init(&self, desc: &BufferDesc, contents: &[u8]) -> Result<EmulatedBuffer, Error> {
        if contents.len() as u64 > desc.size {
            return Err(Error::Protocol(format!(
                "{} bytes of contents for {} buffer of {}",
                contents.len(),
                desc.label,
                desc.size
            )));
        }
        let buffer = self.create_buffer(desc)?;
        buffer.state.write_visible(0, contents);
        Ok(buffer)
    }

    unsafe fn import_host_memory(
        &self,
        desc: &BufferDesc,
        ptr: NonNull<u8>,
        len: u64,
    ) -> Result<EmulatedBuffer, Error> {
        if !self.profile.features.external_host_memory {
            return Err(Error::Unsupported("host memory import".into()));
        }
        if let Some(alignment) = self.profile.limits.min_imported_host_pointer_alignment {
            assert!(
                ptr.as_ptr() as usize as u64 % alignment == 0 && len % alignment == 0,
                "imported host memory is not aligned to {} bytes",
                alignment
            );
        }
        self.admit(desc)?;
        let len = usize::try_from(len)
            .map_err(|_| Error::Device("imported length does not fit usize".into()))?;
        self.new_buffer(desc, Backing::Imported { ptr, len })
    }

    fn build_program(&self, config: &ProgramConfig) -> Result<EmulatedProgram, Error> {
        let missing = config.missing_extensions(&self.profile.features);
        if !missing.is_empty() {
            return Err(Error::Unsupported(format!("shader extensions {:?}", missing)));
        }
        self.profile.journal.push(JournalEntry::ProgramBuilt(config.key));
        Ok(EmulatedProgram {
            config: Rc::new(config.clone()),
        })
    }

    fn create_command_context(&self) -> Result<EmulatedCommands, Error> {
        Ok(EmulatedCommands {
            journal: self.profile.journal.clone(),
            commands: Vec::new(),
            state: RecordState::Initial,
            bound: false,
            deferred: None,
        })
    }

    fn create_fence(&self) -> Result<EmulatedFence, Error> {
        Ok(EmulatedFence {
            journal: self.profile.journal.clone(),
            in_flight: false,
            signaled: false,
            timeout: self.profile.fence_timeout,
        })
    }

    fn submit(&self, commands: &mut EmulatedCommands, fence: &mut EmulatedFence) -> Result<(), Error> {
        if commands.state != RecordState::Ended {
            return Err(Error::Protocol("submit of a command stream that was not ended".into()));
        }
        if fence.signaled || fence.in_flight {
            return Err(Error::Protocol("fence must be unsignaled and idle at submission".into()));
        }
        let journal = &self.profile.journal;
        journal.push(JournalEntry::Submit);

        // Recorded commands hold the inputs alive only until the replay is done.
        let recorded = std::mem::take(&mut commands.commands);
        commands.state = RecordState::Initial;

        let mut touched: Vec<Rc<BufferState>> = Vec::new();
        let mut bound: Option<(Rc<ProgramConfig>, Rc<BufferState>, BoundInput)> = None;
        for command in recorded {
            match command {
                Command::Update { dst, offset, data } => {
                    dst.stage(journal, Access::TransferWrite, offset, data);
                    touched.push(dst);
                }
                Command::Barrier { barrier, buffer } => buffer.commit(Some(barrier.src_access)),
                Command::Bind {
                    program,
                    output,
                    input,
                } => bound = Some((program, output, input)),
                Command::Dispatch => {
                    if let Some((program, output, input)) = &bound {
                        self.execute(program, output, input);
                        touched.push(output.clone());
                    }
                }
                Command::Copy { src, dst, size } => {
                    src.observe(journal, Access::TransferRead);
                    let data = src.read_visible(0, size).unwrap_or_else(|| vec![0; size]);
                    dst.stage(journal, Access::TransferWrite, 0, data);
                    touched.push(dst);
                }
            }
        }
        // Completion makes every write available to the host.
        for buffer in &touched {
            buffer.commit(None);
        }

        fence.in_flight = true;
        fence.signaled = !self.profile.stall_fences;
        Ok(())
    }
}
