//! The graph (`Map`): topology, validation, and the compile/execute pipeline.

mod counts;
mod parallel;
mod resources;

pub use resources::{
    CbSpace, CbSpec, DramBufferSpec, DramOwner, DramRole, ResourcePlan, ScratchBufferSpec,
};

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::device::{DeviceApi, DeviceConfig};
use crate::error::{ConfigError, Error, GraphError};
use crate::format::DataFormat;
use crate::kernel::{Kernel, KernelId};
use crate::stream::{GatherStream, Stream, StreamEntry, StreamId};
use crate::synth::{self, CoreProgram};

/// One side of a [`Edge`]: either a user stream or a named port on a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Stream(StreamId),
    Kernel(KernelId, String),
}

impl Endpoint {
    pub fn stream(id: StreamId) -> Self {
        Endpoint::Stream(id)
    }

    pub fn kernel(id: KernelId, port: impl Into<String>) -> Self {
        Endpoint::Kernel(id, port.into())
    }
}

/// Newtype index into a `Map`'s edge arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) u32);

/// A `(col, row)` position in the device's core mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreCoord {
    pub col: usize,
    pub row: usize,
}

/// A contiguous tile range of an [`Edge`] assigned to one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSlice {
    pub tile_start: u64,
    pub tile_count: u64,
    pub core: CoreCoord,
}

/// A typed connection between two [`Endpoint`]s, sealed by `propagate_counts`
/// and `plan_parallelization`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source: Endpoint,
    pub sink: Endpoint,
    pub format: DataFormat,
    pub tile_count: Option<u64>,
    pub work_slices: Vec<WorkSlice>,
    /// Which of a `GatherStream`'s `accesses_per_token` raw lookups this edge
    /// reads, assigned in connection order. `0` for every edge not sourced
    /// from a gather stream with `accesses_per_token > 1`. A kernel wired to
    /// consume `k` accesses binds `k` input ports to the same gather stream,
    /// one `add_connection` call per port, in slot order — this gives each
    /// port a distinct raw value per output token while the compute language
    /// stays purely elementwise.
    pub access_slot: u64,
}

impl Edge {
    pub fn core_count(&self) -> usize {
        self.work_slices
            .iter()
            .filter(|s| s.tile_count > 0)
            .count()
    }
}

/// Per-`Map` compile options.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct MapConfig {
    pub max_parallelization_factor: usize,
    pub tiles_per_cb: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_parallelization_factor: 1,
            tiles_per_cb: crate::format::DEFAULT_TILES_PER_CB,
        }
    }
}

/// The graph of streams and kernels, and the pipeline that compiles and runs it.
///
/// `Map` owns its kernels and streams in two arenas and refers to them by
/// [`KernelId`]/[`StreamId`] rather than by reference, so it carries no
/// lifetime parameter.
pub struct Map {
    kernels: Vec<Kernel>,
    streams: Vec<StreamEntry>,
    edges: Vec<Edge>,
    input_bound: HashMap<(KernelId, String), EdgeId>,
    output_bound: HashMap<(KernelId, String), EdgeId>,
    config: MapConfig,
    device_config: DeviceConfig,
    resource_plan: Option<ResourcePlan>,
    programs: Option<Vec<CoreProgram>>,
    executed: bool,
    buffer_handles: HashMap<(DramOwner, resources::DramRole), crate::device::BufferHandle>,
}

impl Map {
    #[instrument(skip_all)]
    pub fn new(config: MapConfig, device_config: Option<DeviceConfig>) -> Result<Self, Error> {
        if config.tiles_per_cb < 2 {
            return Err(ConfigError::TilesPerCbTooSmall(config.tiles_per_cb).into());
        }
        if config.max_parallelization_factor < 1 {
            return Err(ConfigError::ParallelizationFactorZero.into());
        }
        info!(
            max_parallelization_factor = config.max_parallelization_factor,
            tiles_per_cb = config.tiles_per_cb,
            "new Map"
        );
        Ok(Self {
            kernels: Vec::new(),
            streams: Vec::new(),
            edges: Vec::new(),
            input_bound: HashMap::new(),
            output_bound: HashMap::new(),
            config,
            device_config: device_config.unwrap_or_default(),
            resource_plan: None,
            programs: None,
            executed: false,
            buffer_handles: HashMap::new(),
        })
    }

    pub fn add_kernel(&mut self, kernel: Kernel) -> KernelId {
        let id = KernelId(self.kernels.len() as u32);
        self.kernels.push(kernel);
        id
    }

    pub fn add_stream(&mut self, stream: Stream) -> StreamId {
        let id = StreamId(self.streams.len() as u32);
        self.streams.push(StreamEntry::Plain(stream));
        id
    }

    pub fn add_gather_stream(&mut self, gather: GatherStream) -> StreamId {
        let id = StreamId(self.streams.len() as u32);
        self.streams.push(StreamEntry::Gather(gather));
        id
    }

    pub fn kernel(&self, id: KernelId) -> Result<&Kernel, Error> {
        self.kernels
            .get(id.0 as usize)
            .ok_or(Error::Graph(GraphError::UnknownKernel(id)))
    }

    pub fn stream(&self, id: StreamId) -> Result<&StreamEntry, Error> {
        self.streams
            .get(id.0 as usize)
            .ok_or(Error::Graph(GraphError::UnknownStream(id)))
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0 as usize]
    }

    pub(crate) fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub(crate) fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub(crate) fn streams(&self) -> &[StreamEntry] {
        &self.streams
    }

    pub(crate) fn config(&self) -> MapConfig {
        self.config
    }

    pub(crate) fn device_config(&self) -> &DeviceConfig {
        &self.device_config
    }

    fn endpoint_format(&self, endpoint: &Endpoint, want_output: bool) -> Result<DataFormat, Error> {
        match endpoint {
            Endpoint::Stream(id) => Ok(self.stream(*id)?.format()),
            Endpoint::Kernel(id, port) => {
                let kernel = self.kernel(*id)?;
                let found = if want_output {
                    kernel.output_port(port)
                } else {
                    kernel.input_port(port)
                };
                found
                    .map(|p| p.format)
                    .ok_or_else(|| {
                        GraphError::UnknownPort {
                            kernel: *id,
                            port: port.clone(),
                        }
                        .into()
                    })
            }
        }
    }

    /// Creates kernel↔kernel reachability to reject a connection that would
    /// close a cycle among kernels.
    fn creates_cycle(&self, from_kernel: KernelId, to_kernel: KernelId) -> bool {
        if from_kernel == to_kernel {
            return true;
        }
        let mut stack = vec![to_kernel];
        let mut seen = std::collections::HashSet::new();
        while let Some(k) = stack.pop() {
            if k == from_kernel {
                return true;
            }
            if !seen.insert(k) {
                continue;
            }
            for edge in &self.edges {
                if let Endpoint::Kernel(src, _) = &edge.source {
                    if *src == k {
                        if let Endpoint::Kernel(dst, _) = &edge.sink {
                            stack.push(*dst);
                        }
                    }
                }
            }
        }
        false
    }

    /// Connects `from` (a stream, or a kernel's output port) to `to` (a
    /// stream, or a kernel's input port), taking a single [`Endpoint`] value
    /// on each side rather than overloading on stream-vs-kernel.
    #[instrument(skip(self))]
    pub fn add_connection(&mut self, from: Endpoint, to: Endpoint) -> Result<EdgeId, Error> {
        if matches!(from, Endpoint::Stream(_)) && matches!(to, Endpoint::Stream(_)) {
            return Err(GraphError::InvalidEndpoints.into());
        }

        let source_format = self.endpoint_format(&from, true)?;
        let sink_format = self.endpoint_format(&to, false)?;
        if source_format != sink_format {
            return Err(crate::error::ShapeError::FormatMismatch {
                source: format!("{:?}", source_format),
                sink: format!("{:?}", sink_format),
            }
            .into());
        }

        if let Endpoint::Kernel(id, port) = &to {
            let key = (*id, port.clone());
            if self.input_bound.contains_key(&key) {
                return Err(GraphError::DuplicateInputBinding {
                    kernel: *id,
                    port: port.clone(),
                }
                .into());
            }
        }
        if let Endpoint::Kernel(id, port) = &from {
            let key = (*id, port.clone());
            if self.output_bound.contains_key(&key) {
                return Err(GraphError::DuplicateOutputBinding {
                    kernel: *id,
                    port: port.clone(),
                }
                .into());
            }
        }

        if let (Endpoint::Kernel(from_k, _), Endpoint::Kernel(to_k, _)) = (&from, &to) {
            if self.creates_cycle(*from_k, *to_k) {
                return Err(GraphError::Cycle(*to_k).into());
            }
        }

        let access_slot = if let Endpoint::Stream(sid) = &from {
            if let StreamEntry::Gather(g) = self.stream(*sid)? {
                let slot = self
                    .edges
                    .iter()
                    .filter(|e| matches!(&e.source, Endpoint::Stream(s) if s == sid))
                    .count() as u64;
                if slot >= g.accesses_per_token {
                    return Err(GraphError::GatherFanoutExceeded(*sid, g.accesses_per_token).into());
                }
                slot
            } else {
                0
            }
        } else {
            0
        };

        let id = EdgeId(self.edges.len() as u32);
        if let Endpoint::Kernel(k, port) = &to {
            self.input_bound.insert((*k, port.clone()), id);
        }
        if let Endpoint::Kernel(k, port) = &from {
            self.output_bound.insert((*k, port.clone()), id);
        }
        self.edges.push(Edge {
            source: from,
            sink: to,
            format: source_format,
            tile_count: None,
            work_slices: Vec::new(),
            access_slot,
        });
        debug!(edge = id.0, access_slot, "connection added");
        Ok(id)
    }

    /// Confirms every kernel input port is bound. Format agreement and
    /// acyclicity are already enforced at `add_connection` time; this is the
    /// remaining topology check the source performs just before compiling.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<(), Error> {
        for (idx, kernel) in self.kernels.iter().enumerate() {
            let id = KernelId(idx as u32);
            for port in &kernel.input_ports {
                if !self.input_bound.contains_key(&(id, port.name.clone())) {
                    return Err(GraphError::DisconnectedInput {
                        kernel: id,
                        port: port.name.clone(),
                    }
                    .into());
                }
            }
        }
        for (idx, entry) in self.streams.iter().enumerate() {
            entry.validate(StreamId(idx as u32))?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn propagate_counts(&mut self) -> Result<(), Error> {
        counts::propagate_counts(self)
    }

    #[instrument(skip(self))]
    pub fn plan_parallelization(&mut self) -> Result<(), Error> {
        parallel::plan_parallelization(self)
    }

    #[instrument(skip(self))]
    pub fn plan_resources(&mut self) -> Result<(), Error> {
        let plan = resources::plan_resources(self)?;
        self.resource_plan = Some(plan);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn generate_device_kernels(&mut self) -> Result<(), Error> {
        let plan = self
            .resource_plan
            .as_ref()
            .ok_or_else(|| Error::Internal("plan_resources must run before synthesis".into()))?;
        let programs = synth::synthesize_kernels(self, plan)?;
        self.programs = Some(programs);
        Ok(())
    }

    pub fn resource_plan(&self) -> Option<&ResourcePlan> {
        self.resource_plan.as_ref()
    }

    pub fn programs(&self) -> Option<&[CoreProgram]> {
        self.programs.as_deref()
    }

    pub(crate) fn mark_executed(&mut self) {
        self.executed = true;
    }

    pub(crate) fn set_buffer_handle(
        &mut self,
        owner: DramOwner,
        role: resources::DramRole,
        handle: crate::device::BufferHandle,
    ) {
        self.buffer_handles.insert((owner, role), handle);
    }

    pub(crate) fn buffer_handle(
        &self,
        owner: DramOwner,
        role: resources::DramRole,
    ) -> Option<crate::device::BufferHandle> {
        self.buffer_handles.get(&(owner, role)).copied()
    }

    pub(crate) fn require_executed(&self) -> Result<(), Error> {
        if self.executed {
            Ok(())
        } else {
            Err(GraphError::NotExecuted.into())
        }
    }

    /// Runs validate → propagate_counts → plan_parallelization →
    /// plan_resources → synthesize_kernels → upload → launch → download
    /// against the given device.
    #[instrument(skip_all)]
    pub fn execute(&mut self, device: &mut dyn DeviceApi) -> Result<(), Error> {
        crate::runtime::execute(self, device)
    }

    pub fn read_stream(&self, device: &mut dyn DeviceApi, id: StreamId) -> Result<Vec<f64>, Error> {
        crate::runtime::read_stream(self, device, id)
    }

    pub fn read_gather_stream(
        &self,
        device: &mut dyn DeviceApi,
        id: StreamId,
        include_indices: bool,
    ) -> Result<(Vec<f64>, Option<Vec<u32>>), Error> {
        crate::runtime::read_gather_stream(self, device, id, include_indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;

    fn simple_map() -> (Map, StreamId, KernelId, StreamId) {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0, 2.0, 3.0], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("pass")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 3], DataFormat::Float32));
        (map, s0, k0, s1)
    }

    #[test]
    fn add_connection_wires_stream_kernel_stream() {
        let (mut map, s0, k0, s1) = simple_map();
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1))
            .unwrap();
        assert!(map.validate().is_ok());
    }

    #[test]
    fn duplicate_input_binding_errors() {
        let (mut map, s0, k0, _s1) = simple_map();
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        let s2 = map.add_stream(Stream::new(vec![1.0], DataFormat::Float32));
        let err = map
            .add_connection(Endpoint::stream(s2), Endpoint::kernel(k0, "in0"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Graph(GraphError::DuplicateInputBinding { .. })
        ));
    }

    #[test]
    fn disconnected_input_fails_validate() {
        let (map, _s0, _k0, _s1) = simple_map();
        assert!(matches!(
            map.validate(),
            Err(Error::Graph(GraphError::DisconnectedInput { .. }))
        ));
    }

    #[test]
    fn format_mismatch_rejected() {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0], DataFormat::Float32));
        let k0 = map.add_kernel(Kernel::new("k").with_input("in0", DataFormat::UInt32));
        let err = map
            .add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap_err();
        assert!(matches!(err, Error::Shape(crate::error::ShapeError::FormatMismatch { .. })));
    }

    #[test]
    fn gather_fanout_assigns_access_slots_in_order() {
        use crate::stream::{GatherStream, StorageTier};
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let g = map.add_gather_stream(GatherStream::new(
            vec![0.0; 8],
            DataFormat::Float32,
            vec![0; 4],
            StorageTier::Dram,
            2,
        ));
        let k0 = map.add_kernel(
            Kernel::new("avg2")
                .with_input("in0", DataFormat::Float32)
                .with_input("in1", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let e0 = map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in0")).unwrap();
        let e1 = map.add_connection(Endpoint::stream(g), Endpoint::kernel(k0, "in1")).unwrap();
        assert_eq!(map.edge(e0).access_slot, 0);
        assert_eq!(map.edge(e1).access_slot, 1);

        let k1 = map.add_kernel(Kernel::new("extra").with_input("in0", DataFormat::Float32));
        let err = map
            .add_connection(Endpoint::stream(g), Endpoint::kernel(k1, "in0"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Graph(GraphError::GatherFanoutExceeded(_, 2))
        ));
    }

    #[test]
    fn self_loop_kernel_to_kernel_is_a_cycle() {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let k0 = map.add_kernel(
            Kernel::new("k")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let err = map
            .add_connection(Endpoint::kernel(k0, "out0"), Endpoint::kernel(k0, "in0"))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::Cycle(_))));
    }
}
