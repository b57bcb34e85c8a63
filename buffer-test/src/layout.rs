use buffer_test_types::DataType;

/// Value the device must read back from the final element.
pub const SENTINEL: u8 = 42;
/// Value of every other element.
pub const FILLER: u8 = 7;

fn encode(data_type: DataType, value: u8) -> ([u8; 4], usize) {
    match data_type {
        DataType::Float32 => ((value as f32).to_le_bytes(), 4),
        DataType::Uint8 => ([value, 0, 0, 0], 1),
    }
}

pub fn fill(data_type: DataType, bytes: &mut [u8]) {
    match data_type {
        DataType::Float32 => {
            let filler = (FILLER as f32).to_le_bytes();
            for element in bytes.chunks_exact_mut(4) {
                element.copy_from_slice(&filler);
            }
        }
        DataType::Uint8 => bytes.fill(FILLER),
    }
}

pub fn write_element(data_type: DataType, bytes: &mut [u8], index: u64, value: u8) -> bool {
    let (encoded, len) = encode(data_type, value);
    let start = match index.checked_mul(data_type.size()).and_then(|o| usize::try_from(o).ok()) {
        Some(start) => start,
        None => return false,
    };
    match bytes.get_mut(start..start + len) {
        Some(dst) => {
            dst.copy_from_slice(&encoded[..len]);
            true
        }
        None => false,
    }
}

pub fn place_sentinel(data_type: DataType, bytes: &mut [u8]) -> bool {
    let count = bytes.len() as u64 / data_type.size();
    count > 0 && write_element(data_type, bytes, count - 1, SENTINEL)
}

/// Bytes past the last element (alignment padding) are left untouched.
pub fn fill_input(data_type: DataType, bytes: &mut [u8], element_count: u64, with_sentinel: bool) {
    let used = (element_count * data_type.size()) as usize;
    let used = used.min(bytes.len());
    let region = &mut bytes[..used];
    fill(data_type, region);
    if with_sentinel {
        place_sentinel(data_type, region);
    }
}

pub fn read_element(data_type: DataType, bytes: &[u8], index: u64) -> Option<f64> {
    let start = usize::try_from(index.checked_mul(data_type.size())?).ok()?;
    match data_type {
        DataType::Float32 => {
            let raw: [u8; 4] = bytes.get(start..start + 4)?.try_into().ok()?;
            Some(f32::from_le_bytes(raw) as f64)
        }
        DataType::Uint8 => bytes.get(start).map(|&b| b as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_input_has_single_sentinel_at_end() {
        let mut bytes = vec![0u8; 16 * 4];
        fill_input(DataType::Float32, &mut bytes, 16, true);
        for i in 0..15 {
            assert_eq!(read_element(DataType::Float32, &bytes, i), Some(7.0));
        }
        assert_eq!(read_element(DataType::Float32, &bytes, 15), Some(42.0));
    }

    #[test]
    fn test_byte_input_without_sentinel() {
        let mut bytes = vec![0u8; 10];
        fill_input(DataType::Uint8, &mut bytes, 10, false);
        assert!(bytes.iter().all(|&b| b == FILLER));
    }

    #[test]
    fn test_padding_left_untouched() {
        // 5 bytes of data in an 8-byte aligned allocation.
        let mut bytes = vec![0xEEu8; 8];
        fill_input(DataType::Uint8, &mut bytes, 5, true);
        assert_eq!(&bytes[..5], &[7, 7, 7, 7, 42]);
        assert_eq!(&bytes[5..], &[0xEE, 0xEE, 0xEE]);
    }

    #[test]
    fn test_write_element_out_of_range() {
        let mut bytes = vec![0u8; 8];
        assert!(!write_element(DataType::Float32, &mut bytes, 2, SENTINEL));
        assert!(write_element(DataType::Float32, &mut bytes, 1, SENTINEL));
        assert_eq!(read_element(DataType::Float32, &bytes, 1), Some(42.0));
    }
}
