use std::fmt::Write;

use buffer_test_types::DataType;

use crate::variant::{BindingKind, ProgramConfig};
use crate::Error;

pub(crate) const OUTPUT_BINDING: u32 = 0;
pub(crate) const INPUT_BINDING: u32 = 1;

// WGSL has neither 64-bit indices nor raw device addresses, so those
// variants are rejected here.
pub(crate) fn generate(config: &ProgramConfig) -> Result<String, Error> {
    if config.use_64bit_indexing {
        return Err(Error::Unsupported("64-bit indexing in WGSL".into()));
    }
    let data_type = config.key.data_type;
    let shape = config.shape;
    let word = match data_type {
        DataType::Float32 => "f32",
        DataType::Uint8 => "u32",
    };

    let mut src = String::new();
    // fmt::Write into a String cannot fail.
    let _ = writeln!(src, "const XS: u32 = {}u;", shape.x);
    let _ = writeln!(src, "const YS: u32 = {}u;", shape.y);
    let _ = writeln!(src, "const ZS: u32 = {}u;", shape.z);
    let _ = writeln!(src, "const MEMBER_COUNT: u32 = {}u;", shape.channels);
    src.push('\n');
    let _ = writeln!(
        src,
        "@group(0) @binding({}) var<storage, read_write> output: array<{}>;",
        OUTPUT_BINDING, word
    );

    let (index, words) = match config.binding {
        BindingKind::Storage => {
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read> input: array<{}>;",
                INPUT_BINDING, word
            );
            ("let index = ((c * ZS + z) * YS + y) * XS + x;", "input")
        }
        BindingKind::StorageArray => {
            let _ = writeln!(src, "\nstruct Channel {{\n    data: array<{}>,\n}}\n", word);
            let _ = writeln!(
                src,
                "@group(0) @binding({}) var<storage, read> input: binding_array<Channel, {}>;",
                INPUT_BINDING, shape.channels
            );
            ("let index = (z * YS + y) * XS + x;", "input[c].data")
        }
        BindingKind::Address | BindingKind::AddressUniform => {
            return Err(Error::Unsupported(
                "buffer device addresses in WGSL".into(),
            ))
        }
    };

    let store = match data_type {
        DataType::Float32 => format!("output[0] = {}[index];", words),
        DataType::Uint8 => format!(
            "let packed = {}[index / 4u];\n    output[0] = (packed >> ((index % 4u) * 8u)) & 0xFFu;",
            words
        ),
    };

    // Coordinates go through the invocation id so that 32-bit wraparound
    // happens at run time instead of failing constant evaluation.
    let _ = write!(
        src,
        "
@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
    let x = XS - 1u + id.x;
    let y = YS - 1u + id.y;
    let z = ZS - 1u + id.z;
    let c = MEMBER_COUNT - 1u;
    {}
    {}
}}
",
        index, store
    );
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::program_config;
    use buffer_test_types::{AddressingMode, AllocationSource, IndexWidth, Shape, TestCase};

    fn config(mode: AddressingMode, data_type: DataType, width: IndexWidth) -> ProgramConfig {
        program_config(&TestCase {
            shape: Shape::new(250, 352, 20, 700),
            data_type,
            addressing_mode: mode,
            index_width: width,
            allocation_source: AllocationSource::DeviceUpload,
        })
    }

    #[test]
    fn test_storage_float_program() {
        let src = generate(&config(
            AddressingMode::StorageBuffer,
            DataType::Float32,
            IndexWidth::Bits32,
        ))
        .unwrap();
        assert!(src.contains("const XS: u32 = 250u;"));
        assert!(src.contains("const MEMBER_COUNT: u32 = 700u;"));
        assert!(src.contains("var<storage, read> input: array<f32>;"));
        assert!(src.contains("@workgroup_size(1)"));
        assert!(src.contains("fn main("));
        assert!(src.contains("output[0] = input[index];"));
    }

    #[test]
    fn test_byte_program_extracts_from_words() {
        let src = generate(&config(
            AddressingMode::StorageBuffer,
            DataType::Uint8,
            IndexWidth::Bits32,
        ))
        .unwrap();
        assert!(src.contains("array<u32>"));
        assert!(src.contains("index / 4u"));
        assert!(src.contains("& 0xFFu"));
    }

    #[test]
    fn test_array_program_binds_every_channel() {
        let src = generate(&config(
            AddressingMode::StorageBufferArray,
            DataType::Float32,
            IndexWidth::Bits32,
        ))
        .unwrap();
        assert!(src.contains("binding_array<Channel, 700>"));
        assert!(src.contains("output[0] = input[c].data[index];"));
        assert!(src.contains("let index = (z * YS + y) * XS + x;"));
    }

    #[test]
    fn test_unexpressible_variants_rejected() {
        assert!(matches!(
            generate(&config(
                AddressingMode::StorageBuffer,
                DataType::Float32,
                IndexWidth::Bits64
            )),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            generate(&config(
                AddressingMode::BufferReference,
                DataType::Float32,
                IndexWidth::Bits32
            )),
            Err(Error::Unsupported(_))
        ));
    }
}
