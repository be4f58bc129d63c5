//! `current`: a dataflow graph compiler and runtime for a tiled spatial
//! accelerator.
//!
//! A [`graph::Map`] is built up from [`stream::Stream`]/[`stream::GatherStream`]
//! sources and sinks connected through [`kernel::Kernel`] compute nodes, then
//! compiled (validated, tile-counted, parallelized, resource-planned,
//! synthesized) and finally executed against a [`device::DeviceApi`].
//!
//! ```text
//! Stream ---\                 /--- Stream
//!            Kernel -- Kernel
//! Stream ---/                 \--- Stream
//! ```
//!
//! Enable the `testing` feature for [`testing::MockDeviceApi`], a functional
//! in-memory device that lets the whole pipeline run without real hardware.

pub mod device;
pub mod error;
pub mod expr;
pub mod format;
pub mod graph;
pub mod kernel;
pub mod stream;
pub mod synth;

mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::{DeviceApi, DeviceConfig};
pub use error::Error;
pub use format::DataFormat;
pub use graph::{Endpoint, Map, MapConfig};
pub use kernel::{Kernel, Port};
pub use stream::{GatherStream, Stream, StorageTier};
