//! Error kinds raised by compilation and execution.
//!
//! Every public entry point in this crate returns `Result<T, Error>`. None of
//! them panic or assert on caller-controlled input.

use thiserror::Error;

use crate::kernel::KernelId;
use crate::stream::StreamId;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("tiles_per_cb must be >= 2 (double-buffering), got {0}")]
    TilesPerCbTooSmall(usize),
    #[error("max_parallelization_factor must be >= 1, got {0}")]
    ParallelizationFactorZero,
    #[error("unsupported data format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("kernel {kernel:?} has no port named {port:?}")]
    UnknownPort { kernel: KernelId, port: String },
    #[error("kernel {kernel:?} input port {port:?} is already bound")]
    DuplicateInputBinding { kernel: KernelId, port: String },
    #[error("kernel {kernel:?} output port {port:?} already has an outbound edge")]
    DuplicateOutputBinding { kernel: KernelId, port: String },
    #[error("kernel {kernel:?} input port {port:?} was never bound")]
    DisconnectedInput { kernel: KernelId, port: String },
    #[error("connecting would create a cycle through kernel {0:?}")]
    Cycle(KernelId),
    #[error("a connection must have exactly one stream endpoint and one kernel-port endpoint, or be kernel-to-kernel")]
    InvalidEndpoints,
    #[error("unknown stream id {0:?}")]
    UnknownStream(StreamId),
    #[error("unknown kernel id {0:?}")]
    UnknownKernel(KernelId),
    #[error("no program has been executed on this Map yet")]
    NotExecuted,
    #[error("gather stream {0:?} already has accesses_per_token ({1}) ports bound; no access slot left for another connection")]
    GatherFanoutExceeded(StreamId, u64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("edge endpoints disagree on format: {source:?} vs {sink:?}")]
    FormatMismatch { source: String, sink: String },
    #[error("kernel {kernel:?} input edges disagree on tile count: {a} vs {b}")]
    TileCountMismatch { kernel: KernelId, a: u64, b: u64 },
    #[error("gather stream index_count ({index_count}) is not a multiple of accesses_per_token ({accesses_per_token})")]
    IndexCountNotDivisible {
        index_count: u64,
        accesses_per_token: u64,
    },
    #[error("accesses_per_token ({0}) does not evenly divide TILE_SIZE")]
    AccessesPerTokenNotTileDivisor(u64),
    #[error("stream {0:?} has element_count == 0")]
    EmptyStream(StreamId),
    #[error("gather index[{index}] = {value} is out of bounds for data_element_count {data_element_count}")]
    IndexOutOfBounds {
        index: usize,
        value: u32,
        data_element_count: u64,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("DRAM allocation failed for stream {0:?}: {1}")]
    DramAllocation(StreamId, String),
    #[error("gather stream {0:?} requested Scratch tier but data_bytes ({1}) exceeds max_scratch_per_core ({2})")]
    ScratchCapacity(StreamId, usize, usize),
    #[error("out of circular buffer ids on core {core:?} ({space} space)")]
    OutOfCbIds { core: (usize, usize), space: String },
    #[error("graph needs {needed} cores but the device mesh only has {available}")]
    NotEnoughCores { needed: usize, available: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("undefined identifier {0:?} in compute expression")]
    UndefinedIdentifier(String),
    #[error("unknown output port {0:?} assigned in compute expression")]
    UnknownOutput(String),
    #[error("output port {0:?} has no assigning statement")]
    MissingOutput(String),
    #[error("unbalanced parentheses in compute expression")]
    UnbalancedParens,
    #[error("unexpected token {0:?} at position {1}")]
    UnexpectedToken(String, usize),
    #[error("unexpected end of expression")]
    UnexpectedEof,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("device call {call} failed: {detail}")]
    Call { call: String, detail: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
