use std::fmt;
use std::io::Write;

use buffer_test_types::{DataType, TestCase};
use tracing::info;

use crate::layout::SENTINEL;
use crate::probe::SkipReason;
use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RawScalar {
    F32(f32),
    U32(u32),
}

impl RawScalar {
    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Self, Error> {
        let word: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Device(format!("readback returned {} bytes", bytes.len())))?;
        Ok(match data_type {
            DataType::Float32 => RawScalar::F32(f32::from_le_bytes(word)),
            DataType::Uint8 => RawScalar::U32(u32::from_le_bytes(word)),
        })
    }
}

impl fmt::Display for RawScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawScalar::F32(v) => write!(f, "{}", v),
            RawScalar::U32(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

pub fn verify(raw: RawScalar, expected: u8) -> Verdict {
    let matches = match raw {
        RawScalar::F32(v) => v == expected as f32,
        RawScalar::U32(v) => v == expected as u32,
    };
    if matches {
        Verdict::Pass
    } else {
        Verdict::Fail
    }
}

pub fn verify_sentinel(raw: RawScalar) -> Verdict {
    verify(raw, SENTINEL)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Passed,
    Failed,
    Skipped(SkipReason),
    /// The case could not run; the message names the error.
    Errored(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("Passed"),
            Outcome::Failed => f.write_str("Failed"),
            Outcome::Skipped(reason) => write!(f, "Skipped ({})", reason),
            Outcome::Errored(message) => write!(f, "Failed ({})", message),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaseRecord {
    pub device: String,
    pub case: TestCase,
    pub value: Option<RawScalar>,
    pub outcome: Outcome,
}

impl fmt::Display for CaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test case '{}': {}", self.case.name(), self.outcome)?;
        if let Some(value) = self.value {
            write!(f, " ({})", value)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    fn add(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Passed => self.passed += 1,
            Outcome::Failed | Outcome::Errored(_) => self.failed += 1,
            Outcome::Skipped(_) => self.skipped += 1,
        }
    }
}

pub struct Transcript<W: Write> {
    out: W,
    records: Vec<CaseRecord>,
}

impl<W: Write> Transcript<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            records: Vec::new(),
        }
    }

    pub fn line(&mut self, text: impl AsRef<str>) -> Result<(), Error> {
        writeln!(self.out, "{}", text.as_ref()).map_err(Error::Io)
    }

    pub fn record(&mut self, record: CaseRecord) -> Result<(), Error> {
        info!(device = %record.device, case = %record.case, outcome = %record.outcome, "test_case_result");
        self.line(record.to_string())?;
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[CaseRecord] {
        &self.records
    }

    pub fn summary(&self) -> Summary {
        self.summary_since(0)
    }

    pub fn summary_since(&self, first: usize) -> Summary {
        let mut summary = Summary::default();
        for record in self.records.iter().skip(first) {
            summary.add(&record.outcome);
        }
        summary
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_test_types::{AddressingMode, AllocationSource, IndexWidth, Shape};

    fn case() -> TestCase {
        TestCase {
            shape: Shape::new(2, 2, 2, 2),
            data_type: DataType::Float32,
            addressing_mode: AddressingMode::StorageBuffer,
            index_width: IndexWidth::Bits64,
            allocation_source: AllocationSource::DeviceUpload,
        }
    }

    #[test]
    fn test_exact_comparison() {
        assert_eq!(verify_sentinel(RawScalar::F32(42.0)), Verdict::Pass);
        assert_eq!(verify_sentinel(RawScalar::F32(42.000004)), Verdict::Fail);
        assert_eq!(verify_sentinel(RawScalar::F32(7.0)), Verdict::Fail);
        assert_eq!(verify_sentinel(RawScalar::U32(42)), Verdict::Pass);
        assert_eq!(verify_sentinel(RawScalar::U32(0)), Verdict::Fail);
    }

    #[test]
    fn test_decode_by_data_type() {
        let bytes = 42.0f32.to_le_bytes();
        assert_eq!(RawScalar::decode(DataType::Float32, &bytes).unwrap(), RawScalar::F32(42.0));
        let bytes = 42u32.to_le_bytes();
        assert_eq!(RawScalar::decode(DataType::Uint8, &bytes).unwrap(), RawScalar::U32(42));
        assert!(RawScalar::decode(DataType::Uint8, &[1, 2]).is_err());
    }

    #[test]
    fn test_transcript_lines_and_summary() {
        let mut transcript = Transcript::new(Vec::new());
        transcript
            .record(CaseRecord {
                device: "gpu0".into(),
                case: case(),
                value: Some(RawScalar::F32(42.0)),
                outcome: Outcome::Passed,
            })
            .unwrap();
        transcript
            .record(CaseRecord {
                device: "gpu0".into(),
                case: case(),
                value: None,
                outcome: Outcome::Skipped(SkipReason::No64BitIndexing),
            })
            .unwrap();
        let summary = transcript.summary();
        assert_eq!(summary, Summary { passed: 1, failed: 0, skipped: 1 });
        assert_eq!(transcript.summary_since(1), Summary { passed: 0, failed: 0, skipped: 1 });
        assert_eq!(transcript.summary_since(2), Summary::default());
        let text = String::from_utf8(transcript.into_inner()).unwrap();
        assert!(text.contains("Test case 'Storage buffer (64-bit) [float32, device upload, 2x2x2x2]': Passed (42)"));
        assert!(text.contains("Skipped (no shader 64-bit indexing)"));
    }
}
