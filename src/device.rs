//! The host SDK surface this crate drives, modeled as a trait so the runtime
//! orchestrator never depends on a concrete device.

use crate::error::DeviceError;
use crate::format::DataFormat;
use crate::graph::CoreCoord;

/// Static facts about the device mesh this `Map` compiles for. Supplied by
/// whatever opens the device (the real host SDK, or [`crate::testing::MockDeviceApi`]
/// for tests).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct DeviceConfig {
    pub mesh: (usize, usize),
    pub scratch_capacity_per_core: usize,
    pub scratch_reserved_base: usize,
    pub dram_interleave_unit: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // Matches `MockDeviceApi`'s capacity so a `Map` can be built in unit
        // tests without a caller-supplied config.
        Self {
            mesh: (8, 8),
            scratch_capacity_per_core: 1 << 20,
            scratch_reserved_base: 1 << 12,
            dram_interleave_unit: 1 << 16,
        }
    }
}

/// Opaque handle to a host-SDK DRAM or scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Opaque handle to a host-SDK circular buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbHandle(pub u32);

/// Opaque handle to a registered kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTier {
    Dram,
    Scratch,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub page_size: u64,
    pub tier: BufferTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    DataMovement0,
    DataMovement1,
    Compute,
}

/// The external accelerator host SDK. Out of scope to implement for real —
/// this crate only calls through it.
pub trait DeviceApi {
    fn scratch_capacity_per_core(&self) -> usize;
    fn scratch_reserved_base(&self) -> usize;

    fn program_create(&mut self) -> Result<(), DeviceError>;

    fn buffer_create(&mut self, desc: BufferDesc) -> Result<BufferHandle, DeviceError>;
    fn buffer_release(&mut self, handle: BufferHandle) -> Result<(), DeviceError>;
    /// DRAM address the host SDK's interleaved allocator chose for `handle`.
    fn buffer_address(&self, handle: BufferHandle) -> u64;
    /// NoC `(x, y)` of the DRAM bank backing `handle`.
    fn buffer_noc_coords(&self, handle: BufferHandle) -> (u32, u32);

    fn circular_buffer_create(
        &mut self,
        core: CoreCoord,
        id: u32,
        capacity: u64,
        page_size: u64,
        format: DataFormat,
    ) -> Result<CbHandle, DeviceError>;
    fn circular_buffer_release(&mut self, handle: CbHandle) -> Result<(), DeviceError>;

    fn kernel_register(
        &mut self,
        core: CoreCoord,
        processor: Processor,
        source: String,
    ) -> Result<KernelHandle, DeviceError>;

    fn set_runtime_args(
        &mut self,
        kernel: KernelHandle,
        core: CoreCoord,
        args: Vec<u32>,
    ) -> Result<(), DeviceError>;

    fn enqueue_write_buffer(
        &mut self,
        buffer: BufferHandle,
        host_data: &[f64],
        format: DataFormat,
    ) -> Result<(), DeviceError>;
    fn enqueue_read_buffer(
        &mut self,
        buffer: BufferHandle,
        element_count: u64,
        format: DataFormat,
    ) -> Result<Vec<f64>, DeviceError>;

    fn write_to_device_scratch(
        &mut self,
        core: CoreCoord,
        address: usize,
        data: &[f64],
        format: DataFormat,
    ) -> Result<(), DeviceError>;
    fn read_from_device_scratch(
        &mut self,
        core: CoreCoord,
        address: usize,
        element_count: u64,
        format: DataFormat,
    ) -> Result<Vec<f64>, DeviceError>;

    fn enqueue_program(&mut self) -> Result<(), DeviceError>;
    fn finish(&mut self) -> Result<(), DeviceError>;

    /// Notified of each DRAM buffer the runtime creates, alongside the
    /// owner/role it backs. Real host SDKs have no use for this — a buffer
    /// handle is opaque to them — so the default is a no-op. A functional
    /// mock overrides it to correlate handles back to the graph without
    /// parsing kernel source text.
    fn observe_buffer(
        &mut self,
        _owner: crate::graph::DramOwner,
        _role: crate::graph::DramRole,
        _handle: BufferHandle,
    ) {
    }

    /// Notified of the structured [`crate::synth::KernelIr`] synthesized for
    /// `core`, right alongside the opaque source text registered through
    /// `kernel_register`. A real device only ever sees the text; a
    /// functional mock can use this to interpret the program directly
    /// instead of re-deriving it from strings.
    fn observe_kernel_ir(&mut self, _core: CoreCoord, _ir: &crate::synth::KernelIr) {}
}
