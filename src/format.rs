//! Tile algebra and data-format helpers.

use crate::error::ConfigError;

/// Elements moved per tile transfer, on or off chip. Fixed by the accelerator.
pub const TILE_SIZE: u64 = 1024;

/// DRAM accesses issued by a gather reader must land on this byte boundary.
pub const DRAM_ACCESS_ALIGN: u64 = 32;

/// Width of one gather index, always `UInt32`.
pub const INDEX_ELEM_BYTES: u64 = 4;

/// Default circular-buffer depth (double-buffering).
pub const DEFAULT_TILES_PER_CB: usize = 2;

/// The element formats `Current` knows how to move and compute on.
///
/// A representative set of the formats the synthesizer and the functional
/// mock device both support. Extending it means adding a `bytes_per_elem`
/// arm and an encode/decode arm below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DataFormat {
    Float16B,
    Float32,
    UInt32,
}

impl DataFormat {
    pub fn bytes_per_elem(self) -> u64 {
        match self {
            DataFormat::Float16B => 2,
            DataFormat::Float32 => 4,
            DataFormat::UInt32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataFormat::Float16B => "Float16_b",
            DataFormat::Float32 => "Float32",
            DataFormat::UInt32 => "UInt32",
        }
    }

    /// Round a value through this format's representable precision, the way
    /// a real write-back to a narrower on-device format would.
    pub fn round_trip(self, value: f64) -> f64 {
        match self {
            DataFormat::Float16B => half::bf16::from_f64(value).to_f64(),
            DataFormat::Float32 => value as f32 as f64,
            DataFormat::UInt32 => value.round(),
        }
    }
}

pub fn validate_format(format: DataFormat) -> Result<(), ConfigError> {
    match format.bytes_per_elem() {
        2 | 4 => Ok(()),
        other => Err(ConfigError::UnsupportedFormat(format!(
            "{} ({} bytes/elem)",
            format.name(),
            other
        ))),
    }
}

/// Ceiling division, used throughout for tile-count and page-size math.
pub fn div_ceil(a: u64, b: u64) -> u64 {
    debug_assert!(b != 0, "division by zero");
    (a + b - 1) / b
}

/// Number of tiles needed to carry `element_count` elements.
pub fn tile_count_for_elements(element_count: u64) -> u64 {
    div_ceil(element_count, TILE_SIZE)
}

/// Bytes occupied by one full tile in the given format.
pub fn tile_bytes(format: DataFormat) -> u64 {
    TILE_SIZE * format.bytes_per_elem()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_elem_matches_invariant() {
        for f in [DataFormat::Float16B, DataFormat::Float32, DataFormat::UInt32] {
            assert!(validate_format(f).is_ok());
            assert!(f.bytes_per_elem() == 2 || f.bytes_per_elem() == 4);
        }
    }

    #[test]
    fn tile_count_rounds_up() {
        assert_eq!(tile_count_for_elements(1), 1);
        assert_eq!(tile_count_for_elements(TILE_SIZE), 1);
        assert_eq!(tile_count_for_elements(TILE_SIZE + 1), 2);
        assert_eq!(tile_count_for_elements(0), 0);
    }

    #[test]
    fn div_ceil_exact_and_rounded() {
        assert_eq!(div_ceil(10, 5), 2);
        assert_eq!(div_ceil(11, 5), 3);
    }
}
