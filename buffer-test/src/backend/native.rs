use std::num::NonZeroU32;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use pollster::block_on;
use quanta::Clock;
use tracing::{debug, info, info_span, warn};
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    Backends, BindGroup, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType,
    BufferBindingType, BufferDescriptor, BufferUsages, CommandBuffer, CommandEncoder,
    CommandEncoderDescriptor, ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor,
    DeviceDescriptor, ErrorFilter, Features, InstanceDescriptor, Maintain, MapMode,
    PipelineCompilationOptions, PipelineLayoutDescriptor, ShaderModuleDescriptor, ShaderSource,
    ShaderStages,
};

use super::wgsl::{self, INPUT_BINDING, OUTPUT_BINDING};
use super::{
    AdapterInfo, Bindings, BufferBarrier, BufferDesc, BufferUsage, DeviceFeatures, DeviceLimits,
    DeviceType, InputBinding, MemoryProperties,
};
use crate::variant::{BindingKind, ProgramConfig};
use crate::Error;

const BINDING_ARRAY_FEATURES: Features =
    Features::STORAGE_RESOURCE_BINDING_ARRAY.union(Features::BUFFER_BINDING_ARRAY);

fn spin_backoff(spin_count: &mut u32) {
    *spin_count += 1;
    if *spin_count < 100 {
        std::hint::spin_loop();
    } else if *spin_count < 1000 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(50));
    }
}

fn device_type(ty: wgpu::DeviceType) -> DeviceType {
    match ty {
        wgpu::DeviceType::DiscreteGpu => DeviceType::DiscreteGpu,
        wgpu::DeviceType::IntegratedGpu => DeviceType::IntegratedGpu,
        wgpu::DeviceType::VirtualGpu => DeviceType::VirtualGpu,
        wgpu::DeviceType::Cpu => DeviceType::Cpu,
        wgpu::DeviceType::Other => DeviceType::Other,
    }
}

fn buffer_usages(usage: BufferUsage) -> BufferUsages {
    let mut usages = BufferUsages::empty();
    for (ours, theirs) in [
        (BufferUsage::STORAGE, BufferUsages::STORAGE),
        (BufferUsage::UNIFORM, BufferUsages::UNIFORM),
        (BufferUsage::COPY_SRC, BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, BufferUsages::COPY_DST),
        (BufferUsage::MAP_READ, BufferUsages::MAP_READ),
    ] {
        if usage.contains(ours) {
            usages |= theirs;
        }
    }
    usages
}

pub struct NativeInstance {
    instance: wgpu::Instance,
    backends: Backends,
    fence_timeout: Duration,
}

impl NativeInstance {
    pub fn new(backends: Backends, fence_timeout: Duration) -> Self {
        let instance = wgpu::Instance::new(InstanceDescriptor {
            backends,
            ..Default::default()
        });
        Self {
            instance,
            backends,
            fence_timeout,
        }
    }
}

impl super::Instance for NativeInstance {
    type Adapter = NativeAdapter;

    fn adapters(&self) -> Vec<NativeAdapter> {
        let adapters = self.instance.enumerate_adapters(self.backends);
        info!(count = adapters.len(), backends = ?self.backends, "adapters enumerated");
        adapters
            .into_iter()
            .map(|adapter| NativeAdapter {
                adapter,
                fence_timeout: self.fence_timeout,
            })
            .collect()
    }
}

pub struct NativeAdapter {
    adapter: wgpu::Adapter,
    fence_timeout: Duration,
}

impl super::Adapter for NativeAdapter {
    type Device = NativeDevice;

    fn info(&self) -> AdapterInfo {
        let info = self.adapter.get_info();
        AdapterInfo {
            name: info.name,
            device_type: device_type(info.device_type),
            backend: format!("{:?}", info.backend),
            driver: [info.driver, info.driver_info]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    fn open(self) -> Result<NativeDevice, Error> {
        let _span = info_span!("device_open", name = %self.adapter.get_info().name).entered();
        let features = self.adapter.features() & BINDING_ARRAY_FEATURES;
        let limits = self.adapter.limits();

        let (device, queue) = block_on(self.adapter.request_device(
            &DeviceDescriptor {
                label: Some("buffer-test"),
                required_features: features,
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| Error::Device(format!("request_device: {}", e)))?;
        info!(?features, "device created");

        Ok(NativeDevice {
            device: Arc::new(device),
            queue,
            features,
            limits,
            fence_timeout: self.fence_timeout,
        })
    }
}

pub struct NativeDevice {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    features: Features,
    limits: wgpu::Limits,
    fence_timeout: Duration,
}

impl NativeDevice {
    /// Runs `f` inside an error scope and turns a captured error into `Error::Device`.
    fn scoped<T>(&self, filter: ErrorFilter, what: &str, f: impl FnOnce() -> T) -> Result<T, Error> {
        self.device.push_error_scope(filter);
        let value = f();
        match block_on(self.device.pop_error_scope()) {
            None => Ok(value),
            Some(e) => Err(Error::Device(format!("{}: {}", what, e))),
        }
    }

    fn check_size(&self, desc: &BufferDesc) -> Result<u64, Error> {
        let size = desc
            .size
            .checked_next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
            .unwrap_or(u64::MAX);
        if size > self.limits.max_buffer_size {
            return Err(Error::Allocation {
                what: format!("{} buffer exceeds max buffer size", desc.label),
                requested: size,
                limit: self.limits.max_buffer_size,
            });
        }
        Ok(size)
    }
}

pub struct NativeBuffer {
    buffer: wgpu::Buffer,
    device: Arc<wgpu::Device>,
}

impl super::Buffer for NativeBuffer {
    fn size(&self) -> u64 {
        self.buffer.size()
    }

    fn device_address(&self) -> Option<u64> {
        None
    }

    fn map_read(&self, len: u64) -> Result<Vec<u8>, Error> {
        if len > self.buffer.size() {
            return Err(Error::Device(format!(
                "map of {} bytes exceeds buffer of {}",
                len,
                self.buffer.size()
            )));
        }
        let slice = self.buffer.slice(..len);
        let (tx, rx) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::Device("map callback dropped".into()))?
            .map_err(|e| Error::Device(format!("map_async: {}", e)))?;

        let data = slice.get_mapped_range().to_vec();
        self.buffer.unmap();
        Ok(data)
    }
}

pub struct NativeProgram {
    pipeline: Arc<ComputePipeline>,
    layout: BindGroupLayout,
    binding: BindingKind,
}

pub struct NativeFence {
    device: Arc<wgpu::Device>,
    signaled: Arc<AtomicBool>,
    in_flight: bool,
    timeout: Duration,
}

impl super::Fence for NativeFence {
    fn wait(&mut self) -> Result<(), Error> {
        if !self.in_flight && !self.is_signaled() {
            return Err(Error::Protocol("wait on a fence with no submission".into()));
        }
        let clock = Clock::new();
        let start = clock.now();
        let mut spin_count = 0u32;
        while !self.signaled.load(Ordering::Acquire) {
            self.device.poll(Maintain::Poll);
            if clock.now().duration_since(start) > self.timeout {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "fence_timeout");
                return Err(Error::SyncTimeout(self.timeout));
            }
            spin_backoff(&mut spin_count);
        }
        self.in_flight = false;
        debug!(spins = spin_count, "fence_signaled");
        Ok(())
    }

    fn reset(&mut self) {
        self.signaled.store(false, Ordering::Release);
    }

    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

pub struct NativeCommands {
    device: Arc<wgpu::Device>,
    encoder: Option<CommandEncoder>,
    finished: Option<CommandBuffer>,
    bound: Option<(Arc<ComputePipeline>, BindGroup)>,
    /// Upload sources referenced by the current recording.
    staging: Vec<wgpu::Buffer>,
    /// First recording error from a call that cannot return one.
    deferred: Option<Error>,
}

impl NativeCommands {
    fn encoder(&mut self) -> Result<&mut CommandEncoder, Error> {
        self.encoder
            .as_mut()
            .ok_or_else(|| Error::Protocol("command context is not recording".into()))
    }

    fn defer(&mut self, error: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }
}

impl super::CommandContext for NativeCommands {
    type Buffer = NativeBuffer;
    type Program = NativeProgram;

    fn begin(&mut self) -> Result<(), Error> {
        self.encoder = Some(self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("Case Encoder"),
        }));
        self.finished = None;
        self.bound = None;
        self.staging.clear();
        self.deferred = None;
        Ok(())
    }

    fn update_buffer(&mut self, dst: &NativeBuffer, offset: u64, data: &[u8]) -> Result<(), Error> {
        let staging = self.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("Update staging"),
            contents: data,
            usage: BufferUsages::COPY_SRC,
        });
        let len = data.len() as u64;
        self.encoder()?
            .copy_buffer_to_buffer(&staging, 0, &dst.buffer, offset, len);
        self.staging.push(staging);
        Ok(())
    }

    fn buffer_barrier(&mut self, barrier: BufferBarrier, _buffer: &NativeBuffer) {
        match self.encoder() {
            Ok(encoder) => encoder.insert_debug_marker(&barrier.label()),
            Err(e) => self.defer(e),
        }
    }

    fn bind(&mut self, program: &NativeProgram, bindings: Bindings<'_, NativeBuffer>) -> Result<(), Error> {
        let output = BindGroupEntry {
            binding: OUTPUT_BINDING,
            resource: bindings.output.buffer.as_entire_binding(),
        };
        let bind_group = match (program.binding, bindings.input) {
            (BindingKind::Storage, InputBinding::Storage(input)) => {
                self.device.create_bind_group(&BindGroupDescriptor {
                    label: Some("Case Bind Group"),
                    layout: &program.layout,
                    entries: &[
                        output,
                        BindGroupEntry {
                            binding: INPUT_BINDING,
                            resource: input.buffer.as_entire_binding(),
                        },
                    ],
                })
            }
            (BindingKind::StorageArray, InputBinding::StorageArray(channels)) => {
                let views: Vec<_> = channels
                    .iter()
                    .map(|channel| channel.buffer.as_entire_buffer_binding())
                    .collect();
                self.device.create_bind_group(&BindGroupDescriptor {
                    label: Some("Case Bind Group"),
                    layout: &program.layout,
                    entries: &[
                        output,
                        BindGroupEntry {
                            binding: INPUT_BINDING,
                            resource: BindingResource::BufferArray(&views),
                        },
                    ],
                })
            }
            (BindingKind::Address | BindingKind::AddressUniform, _) => {
                return Err(Error::Unsupported("buffer device addresses".into()))
            }
            (binding, _) => {
                return Err(Error::Protocol(format!(
                    "input binding does not match {:?} program",
                    binding
                )))
            }
        };
        self.bound = Some((program.pipeline.clone(), bind_group));
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), Error> {
        let (pipeline, bind_group) = self
            .bound
            .take()
            .ok_or_else(|| Error::Protocol("dispatch without bound program".into()))?;
        {
            let mut pass = self.encoder()?.begin_compute_pass(&ComputePassDescriptor {
                label: Some("Index Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.bound = Some((pipeline, bind_group));
        Ok(())
    }

    fn copy_buffer(&mut self, src: &NativeBuffer, dst: &NativeBuffer, size: u64) {
        match self.encoder() {
            Ok(encoder) => encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, size),
            Err(e) => self.defer(e),
        }
    }

    fn end(&mut self) -> Result<(), Error> {
        if let Some(e) = self.deferred.take() {
            self.encoder = None;
            return Err(e);
        }
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| Error::Protocol("end without begin".into()))?;
        self.finished = Some(encoder.finish());
        Ok(())
    }
}

impl super::Device for NativeDevice {
    type Buffer = NativeBuffer;
    type Program = NativeProgram;
    type Commands = NativeCommands;
    type Fence = NativeFence;

    fn memory_properties(&self) -> MemoryProperties {
        // wgpu does not expose memory heaps.
        MemoryProperties::default()
    }

    fn features(&self) -> DeviceFeatures {
        DeviceFeatures {
            shader_64bit_indexing: false,
            // Bytes are read out of packed words, so no device feature is needed.
            storage_8bit: true,
            external_host_memory: false,
            buffer_device_address: false,
            storage_buffer_array: self.features.contains(BINDING_ARRAY_FEATURES),
        }
    }

    fn limits(&self) -> DeviceLimits {
        DeviceLimits {
            max_memory_allocation_count: None,
            max_storage_buffer_range: self.limits.max_storage_buffer_binding_size as u64,
            max_memory_allocation_size: self.limits.max_buffer_size,
            max_storage_buffers_per_stage: self.limits.max_storage_buffers_per_shader_stage,
            min_imported_host_pointer_alignment: None,
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeBuffer, Error> {
        let size = self.check_size(desc)?;
        let buffer = self.scoped(ErrorFilter::OutOfMemory, desc.label, || {
            self.device.create_buffer(&BufferDescriptor {
                label: Some(desc.label),
                size,
                usage: buffer_usages(desc.usage),
                mapped_at_creation: false,
            })
        })?;
        Ok(NativeBuffer {
            buffer,
            device: self.device.clone(),
        })
    }

    fn create_buffer_init(&self, desc: &BufferDesc, contents: &[u8]) -> Result<NativeBuffer, Error> {
        self.check_size(desc)?;
        let buffer = self.scoped(ErrorFilter::OutOfMemory, desc.label, || {
            self.device.create_buffer_init(&BufferInitDescriptor {
                label: Some(desc.label),
                contents,
                usage: buffer_usages(desc.usage),
            })
        })?;
        Ok(NativeBuffer {
            buffer,
            device: self.device.clone(),
        })
    }

    unsafe fn import_host_memory(
        &self,
        _desc: &BufferDesc,
        _ptr: NonNull<u8>,
        _len: u64,
    ) -> Result<NativeBuffer, Error> {
        Err(Error::Unsupported("host memory import".into()))
    }

    fn build_program(&self, config: &ProgramConfig) -> Result<NativeProgram, Error> {
        let missing = config.missing_extensions(&self.features());
        if !missing.is_empty() {
            return Err(Error::Unsupported(format!("shader extensions {:?}", missing)));
        }
        let source = wgsl::generate(config)?;
        let _span = info_span!("build_program", key = ?config.key, shape = %config.shape).entered();

        let count = match config.binding {
            BindingKind::StorageArray => Some(
                NonZeroU32::new(config.shape.channels)
                    .ok_or_else(|| Error::InvalidConfig("zero channels".into()))?,
            ),
            _ => None,
        };
        let storage = |binding, read_only, count| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count,
        };

        let (pipeline, layout) = self.scoped(ErrorFilter::Validation, "program", || {
            let shader = self.device.create_shader_module(ShaderModuleDescriptor {
                label: Some("Index Program"),
                source: ShaderSource::Wgsl(source.as_str().into()),
            });
            let layout = self.device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("Index Bind Group Layout"),
                entries: &[
                    storage(OUTPUT_BINDING, false, None),
                    storage(INPUT_BINDING, true, count),
                ],
            });
            let pipeline_layout = self.device.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some("Index Pipeline Layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = self.device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some("Index Pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: "main",
                compilation_options: PipelineCompilationOptions::default(),
            });
            (pipeline, layout)
        })?;
        info!(source_len = source.len(), "program built");

        Ok(NativeProgram {
            pipeline: Arc::new(pipeline),
            layout,
            binding: config.binding,
        })
    }

    fn create_command_context(&self) -> Result<NativeCommands, Error> {
        Ok(NativeCommands {
            device: self.device.clone(),
            encoder: None,
            finished: None,
            bound: None,
            staging: Vec::new(),
            deferred: None,
        })
    }

    fn create_fence(&self) -> Result<NativeFence, Error> {
        Ok(NativeFence {
            device: self.device.clone(),
            signaled: Arc::new(AtomicBool::new(false)),
            in_flight: false,
            timeout: self.fence_timeout,
        })
    }

    fn submit(&self, commands: &mut NativeCommands, fence: &mut NativeFence) -> Result<(), Error> {
        let buffer = commands
            .finished
            .take()
            .ok_or_else(|| Error::Protocol("submit of a command stream that was not ended".into()))?;
        if fence.in_flight || fence.signaled.load(Ordering::Acquire) {
            return Err(Error::Protocol("fence must be unsignaled and idle at submission".into()));
        }
        fence.in_flight = true;
        self.queue.submit(Some(buffer));
        let signaled = fence.signaled.clone();
        self.queue.on_submitted_work_done(move || {
            signaled.store(true, Ordering::Release);
        });
        debug!("submitted");
        Ok(())
    }
}
