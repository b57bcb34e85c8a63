use buffer_test_types::{DataType, HarnessConfig};

use crate::Error;

pub fn validate(config: &HarnessConfig) -> Result<(), Error> {
    // Every axis of the matrix needs at least one value
    if config.shapes.is_empty() {
        return Err(Error::InvalidConfig("No shapes configured".into()));
    }
    if config.data_types.is_empty() {
        return Err(Error::InvalidConfig("No data types configured".into()));
    }
    if config.addressing_modes.is_empty() {
        return Err(Error::InvalidConfig("No addressing modes configured".into()));
    }
    if config.index_widths.is_empty() {
        return Err(Error::InvalidConfig("No index widths configured".into()));
    }
    if config.allocation_sources.is_empty() {
        return Err(Error::InvalidConfig("No allocation sources configured".into()));
    }

    if config.uint8_channel_multiplier == 0 {
        return Err(Error::InvalidConfig(
            "UInt8 channel multiplier must be at least 1".into(),
        ));
    }
    if config.fence_timeout_ms == 0 {
        return Err(Error::InvalidConfig("Fence timeout must be positive".into()));
    }

    for shape in &config.shapes {
        if shape.x == 0 || shape.y == 0 || shape.z == 0 || shape.channels == 0 {
            return Err(Error::InvalidConfig(format!(
                "Shape {} has a zero extent",
                shape
            )));
        }
        for &data_type in &config.data_types {
            let widened = match data_type {
                DataType::Float32 => Some(*shape),
                DataType::Uint8 => shape.with_channel_multiplier(config.uint8_channel_multiplier),
            };
            let bytes = widened
                .and_then(|s| s.domain())
                .and_then(|d| d.byte_len(data_type));
            if bytes.is_none() {
                return Err(Error::InvalidConfig(format!(
                    "Shape {} overflows the {} byte size",
                    shape,
                    data_type.label()
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer_test_types::Shape;

    #[test]
    fn test_default_is_valid() {
        assert!(validate(&HarnessConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_axis_rejected() {
        let config = HarnessConfig {
            index_widths: vec![],
            ..HarnessConfig::default()
        };
        assert!(matches!(validate(&config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_extent_rejected() {
        let config = HarnessConfig {
            shapes: vec![Shape::new(4, 0, 4, 4)],
            ..HarnessConfig::default()
        };
        assert!(matches!(validate(&config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_multiplier_overflow_rejected() {
        let config = HarnessConfig {
            shapes: vec![Shape::new(2, 2, 2, u32::MAX / 2)],
            data_types: vec![DataType::Uint8],
            uint8_channel_multiplier: 4,
            ..HarnessConfig::default()
        };
        assert!(matches!(validate(&config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = HarnessConfig {
            fence_timeout_ms: 0,
            ..HarnessConfig::default()
        };
        assert!(validate(&config).is_err());
    }
}
