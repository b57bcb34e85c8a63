use buffer_test_types::TestCase;
use quanta::Instant;
use tracing::{debug, info_span, trace};

use crate::alloc::CaseInputs;
use crate::backend::{
    Bindings, Buffer, BufferBarrier, BufferDesc, BufferUsage, CommandContext, Device, Fence,
    InputBinding,
};
use crate::variant::{program_config, BindingKind, ProgramSlot};
use crate::verify::{verify_sentinel, RawScalar, Verdict};
use crate::Error;

pub const WORKGROUPS: (u32, u32, u32) = (1, 1, 1);

const OUTPUT_SIZE: u64 = 4;
const ADDRESS_SIZE: u64 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Recording,
    Dispatched,
    Synchronized,
    Verified,
}

#[derive(Copy, Clone, Debug)]
pub struct CaseResult {
    pub value: RawScalar,
    pub verdict: Verdict,
}

#[derive(Copy, Clone, Debug)]
pub struct SubmissionWindow {
    pub submitted: Instant,
    pub signaled: Instant,
}

pub struct DispatchProtocol<'d, D: Device> {
    device: &'d D,
    commands: D::Commands,
    fence: D::Fence,
    slot: ProgramSlot<D::Program>,
    output: D::Buffer,
    readback: D::Buffer,
    address_uniform: D::Buffer,
    phase: Phase,
    windows: Vec<SubmissionWindow>,
}

impl<'d, D: Device> DispatchProtocol<'d, D> {
    pub fn new(device: &'d D) -> Result<Self, Error> {
        let output = device.create_buffer(&BufferDesc {
            label: "Output",
            size: OUTPUT_SIZE,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        })?;
        let readback = device.create_buffer(&BufferDesc {
            label: "Output staging",
            size: OUTPUT_SIZE,
            usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
        })?;
        let address_uniform = device.create_buffer(&BufferDesc {
            label: "Address uniform",
            size: ADDRESS_SIZE,
            usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        })?;

        Ok(Self {
            device,
            commands: device.create_command_context()?,
            fence: device.create_fence()?,
            slot: ProgramSlot::new(),
            output,
            readback,
            address_uniform,
            phase: Phase::Idle,
            windows: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn program_builds(&self) -> u64 {
        self.slot.builds()
    }

    pub fn windows(&self) -> &[SubmissionWindow] {
        &self.windows
    }

    fn advance(&mut self, next: Phase) -> Result<(), Error> {
        let legal = matches!(
            (self.phase, next),
            (Phase::Idle, Phase::Recording)
                | (Phase::Recording, Phase::Dispatched)
                | (Phase::Dispatched, Phase::Synchronized)
                | (Phase::Synchronized, Phase::Verified)
                | (Phase::Verified, Phase::Idle)
        );
        if !legal {
            return Err(Error::Protocol(format!(
                "illegal transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        trace!(from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        Ok(())
    }

    pub fn run_case(
        &mut self,
        case: &TestCase,
        inputs: &CaseInputs<D::Buffer>,
    ) -> Result<CaseResult, Error> {
        let _span = info_span!("dispatch", case = %case).entered();
        let result = self.run_case_inner(case, inputs);
        if result.is_err() {
            self.phase = Phase::Idle;
        }
        result
    }

    fn run_case_inner(
        &mut self,
        case: &TestCase,
        inputs: &CaseInputs<D::Buffer>,
    ) -> Result<CaseResult, Error> {
        let config = program_config(case);
        let binding = config.binding;
        self.slot.set_variant(config);
        self.slot.set_inputs();

        self.advance(Phase::Recording)?;
        self.commands.begin()?;

        // A stale result from the previous case must never be read back.
        self.commands.update_buffer(&self.output, 0, &[0u8; OUTPUT_SIZE as usize])?;
        self.commands
            .buffer_barrier(BufferBarrier::TRANSFER_TO_SHADER_WRITE, &self.output);

        let device = self.device;
        let rebind = self.slot.is_data_dirty();
        let program = self.slot.prepare(|config| device.build_program(config))?;

        let input = match (binding, inputs) {
            (BindingKind::Storage, CaseInputs::Single(input)) => InputBinding::Storage(input.buffer()),
            (BindingKind::StorageArray, CaseInputs::Channels(buffers)) => {
                InputBinding::StorageArray(buffers.as_slice())
            }
            (BindingKind::Address, CaseInputs::Single(input)) => {
                InputBinding::Address(device_address(input.buffer())?)
            }
            (BindingKind::AddressUniform, CaseInputs::Single(input)) => {
                // The uniform keeps the last address written; only new inputs rewrite it.
                if rebind {
                    let address = device_address(input.buffer())?;
                    self.commands
                        .update_buffer(&self.address_uniform, 0, &address.to_le_bytes())?;
                    self.commands.buffer_barrier(
                        BufferBarrier::TRANSFER_TO_UNIFORM_READ,
                        &self.address_uniform,
                    );
                }
                InputBinding::AddressUniform(&self.address_uniform)
            }
            (binding, inputs) => {
                return Err(Error::Protocol(format!(
                    "{:?} binding cannot use {} input buffer(s)",
                    binding,
                    inputs.buffer_count()
                )))
            }
        };

        self.commands.bind(
            program,
            Bindings {
                output: &self.output,
                input,
            },
        )?;
        let (x, y, z) = WORKGROUPS;
        self.commands.dispatch(x, y, z)?;

        self.commands
            .buffer_barrier(BufferBarrier::SHADER_WRITE_TO_TRANSFER_READ, &self.output);
        self.commands.copy_buffer(&self.output, &self.readback, OUTPUT_SIZE);
        self.commands.end()?;

        if self.fence.is_signaled() {
            return Err(Error::Protocol("fence still signaled at submission".into()));
        }
        let submitted = Instant::now();
        self.device.submit(&mut self.commands, &mut self.fence)?;
        self.advance(Phase::Dispatched)?;

        self.fence.wait()?;
        let signaled = Instant::now();
        self.windows.push(SubmissionWindow { submitted, signaled });
        self.advance(Phase::Synchronized)?;

        self.fence.reset();
        let bytes = self.readback.map_read(OUTPUT_SIZE)?;
        let value = RawScalar::decode(case.data_type, &bytes)?;
        let verdict = verify_sentinel(value);
        self.advance(Phase::Verified)?;
        debug!(%value, ?verdict, "case_verified");

        self.advance(Phase::Idle)?;
        Ok(CaseResult { value, verdict })
    }
}

fn device_address<B: Buffer>(buffer: &B) -> Result<u64, Error> {
    buffer
        .device_address()
        .ok_or_else(|| Error::Unsupported("input buffer has no device address".into()))
}
