//! Stream descriptors.

use crate::error::{ConfigError, ShapeError};
use crate::format::{validate_format, DataFormat, TILE_SIZE};

/// Newtype index into a [`crate::graph::Map`]'s stream arena. A `Map` owns
/// its streams by value and hands the caller back an opaque id instead of a
/// borrow, so there is no lifetime to thread through the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

/// A host-provided linear buffer of `element_count` values in `format`.
#[derive(Debug, Clone)]
pub struct Stream {
    pub host_buffer: Vec<f64>,
    pub element_count: u64,
    pub format: DataFormat,
}

impl Stream {
    pub fn new(host_buffer: Vec<f64>, format: DataFormat) -> Self {
        let element_count = host_buffer.len() as u64;
        Self {
            host_buffer,
            element_count,
            format,
        }
    }

    pub(crate) fn validate(&self, id: StreamId) -> Result<(), crate::error::Error> {
        validate_format(self.format).map_err(crate::error::Error::Config)?;
        if self.element_count == 0 {
            return Err(ShapeError::EmptyStream(id).into());
        }
        if (self.host_buffer.len() as u64) < self.element_count {
            return Err(crate::error::Error::Internal(format!(
                "stream host_buffer has {} elements but element_count is {}",
                self.host_buffer.len(),
                self.element_count
            )));
        }
        Ok(())
    }
}

/// Where a [`GatherStream`]'s data buffer lives while kernels consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Dram,
    Scratch,
}

/// A stream whose output is produced by indexing into a data buffer using a
/// separate index buffer: each output token is assembled from
/// `accesses_per_token` raw lookups into `data`, at offsets named by
/// `indices`.
#[derive(Debug, Clone)]
pub struct GatherStream {
    pub data: Vec<f64>,
    pub data_element_count: u64,
    pub format: DataFormat,
    pub indices: Vec<u32>,
    pub storage_tier: StorageTier,
    pub accesses_per_token: u64,
}

impl GatherStream {
    pub fn new(
        data: Vec<f64>,
        format: DataFormat,
        indices: Vec<u32>,
        storage_tier: StorageTier,
        accesses_per_token: u64,
    ) -> Self {
        let data_element_count = data.len() as u64;
        Self {
            data,
            data_element_count,
            format,
            indices,
            storage_tier,
            accesses_per_token,
        }
    }

    pub fn index_count(&self) -> u64 {
        self.indices.len() as u64
    }

    pub(crate) fn validate(&self, _id: StreamId) -> Result<(), crate::error::Error> {
        validate_format(self.format).map_err(crate::error::Error::Config)?;
        if self.accesses_per_token == 0 {
            return Err(ConfigError::UnsupportedFormat(
                "accesses_per_token must be >= 1".to_string(),
            )
            .into());
        }
        if TILE_SIZE % self.accesses_per_token != 0 {
            return Err(
                ShapeError::AccessesPerTokenNotTileDivisor(self.accesses_per_token).into(),
            );
        }
        if self.index_count() % self.accesses_per_token != 0 {
            return Err(ShapeError::IndexCountNotDivisible {
                index_count: self.index_count(),
                accesses_per_token: self.accesses_per_token,
            }
            .into());
        }
        for (i, &idx) in self.indices.iter().enumerate() {
            if idx as u64 >= self.data_element_count {
                return Err(ShapeError::IndexOutOfBounds {
                    index: i,
                    value: idx,
                    data_element_count: self.data_element_count,
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_element_count * self.format.bytes_per_elem()
    }
}

/// Either kind of user-facing stream, stored uniformly in a [`crate::graph::Map`]'s
/// arena.
#[derive(Debug, Clone)]
pub enum StreamEntry {
    Plain(Stream),
    Gather(GatherStream),
}

impl StreamEntry {
    pub fn format(&self) -> DataFormat {
        match self {
            StreamEntry::Plain(s) => s.format,
            StreamEntry::Gather(g) => g.format,
        }
    }

    pub(crate) fn validate(&self, id: StreamId) -> Result<(), crate::error::Error> {
        match self {
            StreamEntry::Plain(s) => s.validate(id),
            StreamEntry::Gather(g) => g.validate(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_rejects_odd_accesses_per_token_divisor() {
        let g = GatherStream::new(
            vec![0.0; 8],
            DataFormat::Float16B,
            vec![0; 9],
            StorageTier::Dram,
            3,
        );
        // 1024 % 3 != 0
        assert!(matches!(
            g.validate(StreamId(0)),
            Err(crate::error::Error::Shape(
                ShapeError::AccessesPerTokenNotTileDivisor(3)
            ))
        ));
    }

    #[test]
    fn gather_rejects_index_count_not_divisible() {
        let g = GatherStream::new(
            vec![0.0; 8],
            DataFormat::Float16B,
            vec![0; 5],
            StorageTier::Dram,
            2,
        );
        assert!(matches!(
            g.validate(StreamId(0)),
            Err(crate::error::Error::Shape(
                ShapeError::IndexCountNotDivisible { .. }
            ))
        ));
    }
}
