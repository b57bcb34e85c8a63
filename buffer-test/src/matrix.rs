use std::io::Write;

use buffer_test_types::{DataType, HarnessConfig, TestCase};
use tracing::{info, info_span, warn};

use crate::alloc;
use crate::backend::{Adapter, AdapterInfo, Device, DeviceType, Instance};
use crate::dispatch::DispatchProtocol;
use crate::probe::{format_size, probe};
use crate::verify::{CaseRecord, Outcome, Summary, Transcript, Verdict};
use crate::Error;

pub fn enumerate(config: &HarnessConfig) -> Vec<TestCase> {
    let mut cases = Vec::new();
    for &base_shape in &config.shapes {
        for &data_type in &config.data_types {
            let shape = match data_type {
                DataType::Float32 => Some(base_shape),
                DataType::Uint8 => base_shape.with_channel_multiplier(config.uint8_channel_multiplier),
            };
            let Some(shape) = shape else {
                warn!(shape = %base_shape, "channel multiplier overflows, shape dropped");
                continue;
            };
            for &allocation_source in &config.allocation_sources {
                for &index_width in &config.index_widths {
                    for &addressing_mode in &config.addressing_modes {
                        let case = TestCase {
                            shape,
                            data_type,
                            addressing_mode,
                            index_width,
                            allocation_source,
                        };
                        if case.is_structurally_valid() {
                            cases.push(case);
                        }
                    }
                }
            }
        }
    }
    cases
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceReport {
    pub device: String,
    pub summary: Summary,
    pub aborted: Option<String>,
}

pub fn run_all<I: Instance, W: Write>(
    instance: &I,
    config: &HarnessConfig,
    transcript: &mut Transcript<W>,
) -> Result<Vec<DeviceReport>, Error> {
    let cases = enumerate(config);
    info!(cases = cases.len(), "test matrix enumerated");

    let adapters = instance.adapters();
    if adapters.is_empty() {
        transcript.line("No devices found")?;
    }

    let mut reports = Vec::new();
    for adapter in adapters {
        let info = adapter.info();
        if info.device_type == DeviceType::Cpu {
            info!(device = %info.name, "skipping CPU device");
            transcript.line(format!("Skipping CPU device {}", info.name))?;
            continue;
        }

        let _span = info_span!("device", name = %info.name).entered();
        // Adapters may share a name, so the pass owns the records written from here on.
        let first_record = transcript.records().len();
        let aborted = match adapter.open() {
            Ok(device) => match run_device(&device, &info, &cases, transcript) {
                Ok(()) => None,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(format!("failed to open device: {}", e)),
        };
        if let Some(message) = &aborted {
            warn!(device = %info.name, error = %message, "device pass aborted");
            transcript.line(format!("Device pass aborted: {}", message))?;
        }

        let summary = transcript.summary_since(first_record);
        transcript.line(format!(
            "Summary for {}: {} passed, {} failed, {} skipped",
            info.name, summary.passed, summary.failed, summary.skipped
        ))?;
        transcript.line("")?;
        reports.push(DeviceReport {
            device: info.name,
            summary,
            aborted,
        });
    }
    Ok(reports)
}

fn run_device<D: Device, W: Write>(
    device: &D,
    info: &AdapterInfo,
    cases: &[TestCase],
    transcript: &mut Transcript<W>,
) -> Result<(), Error> {
    transcript.line(format!("Device: {}", info))?;
    let caps = probe(device);
    for line in caps.report_lines() {
        transcript.line(line)?;
    }
    transcript.line("")?;

    let mut protocol = DispatchProtocol::new(device)?;
    for case in cases {
        let record = |value, outcome| CaseRecord {
            device: info.name.clone(),
            case: *case,
            value,
            outcome,
        };

        if let Err(reason) = caps.admits(case) {
            transcript.record(record(None, Outcome::Skipped(reason)))?;
            continue;
        }

        let size = case
            .domain()
            .and_then(|d| d.byte_len(case.data_type))
            .unwrap_or(0);
        transcript.line(format!(
            "Starting test case '{}' (allocation size {})...",
            case.name(),
            format_size(size)
        ))?;

        let inputs = match alloc::allocate(device, case, &caps) {
            Ok(inputs) => inputs,
            Err(e) => {
                transcript.record(record(None, Outcome::Errored(e.to_string())))?;
                return Err(e);
            }
        };

        let result = protocol.run_case(case, &inputs);
        // The fence has signaled (or the pass is over), so the inputs can go.
        drop(inputs);
        match result {
            Ok(result) => {
                let outcome = match result.verdict {
                    Verdict::Pass => Outcome::Passed,
                    Verdict::Fail => Outcome::Failed,
                };
                transcript.record(record(Some(result.value), outcome))?;
            }
            Err(e) => {
                transcript.record(record(None, Outcome::Errored(e.to_string())))?;
                return Err(e);
            }
        }
    }
    Ok(())
}
