//! Kernel synthesis: builds a structured [`KernelIr`] per core, then renders
//! it to reader/compute/writer source text.
//!
//! Emission is IR-first: two `Map`s built from equal graphs produce equal
//! `KernelIr` values (and therefore equal hashes and equal text), since the
//! IR never carries a device-assigned address — those are runtime arguments,
//! not part of the compiled source.

mod emit;

use std::collections::HashMap;

use crate::error::Error;
use crate::expr::{self, Ast, BinOp};
use crate::format::DRAM_ACCESS_ALIGN;
use crate::graph::{CoreCoord, DramOwner, Endpoint, Map, ResourcePlan};
use crate::kernel::{Kernel, KernelId};
use crate::stream::{StorageTier, StreamEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Plain,
    GatherDram {
        accesses_per_token: u64,
        index_cb_id: u32,
    },
    GatherScratch {
        accesses_per_token: u64,
        index_cb_id: u32,
        scratch_base: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReaderInput {
    pub port: String,
    pub cb_id: u32,
    pub tile_count: u64,
    /// Offset, in tiles, of this core's slice within the edge's full tile
    /// range. Baked into the emitted source as a literal (synthesis is
    /// already per-core), and kept structurally here for
    /// [`crate::testing::MockDeviceApi`].
    pub tile_start: u64,
    pub kind: InputKind,
    /// Which of a gather stream's `accesses_per_token` raw lookups this
    /// input reads (`0` when not applicable); see
    /// [`crate::graph::Edge::access_slot`].
    pub access_slot: u64,
    /// The edge this input transports, so the runtime can look up which
    /// DRAM buffer (a stream's, or a kernel-to-kernel intermediate) backs it.
    pub edge: crate::graph::EdgeId,
    /// The DRAM buffer backing this input's data, independent of `kind`
    /// (a gather input's data/index buffers both live under the owning
    /// stream; a plain input's buffer is either its source stream's or, for
    /// a kernel-to-kernel edge, the edge's own intermediate buffer).
    pub owner: DramOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriterOutput {
    pub port: String,
    pub cb_id: u32,
    pub tile_count: u64,
    pub tile_start: u64,
    pub edge: crate::graph::EdgeId,
    pub owner: DramOwner,
}

/// One elementwise tile-ALU operation, the result of lowering a parsed
/// [`crate::expr::Ast`]. A flat, stack-machine form the emitter renders to
/// text and [`crate::testing::MockDeviceApi`] interprets directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComputeOp {
    LoadInput(String),
    LoadConst(u64),
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    StoreOutput(String),
}

fn lower_ast(ast: &Ast, ops: &mut Vec<ComputeOp>) {
    match ast {
        Ast::Num(n) => ops.push(ComputeOp::LoadConst(n.to_bits())),
        Ast::Ref(name) => ops.push(ComputeOp::LoadInput(name.clone())),
        Ast::Unary(inner) => {
            lower_ast(inner, ops);
            ops.push(ComputeOp::Neg);
        }
        Ast::Binary(op, l, r) => {
            lower_ast(l, ops);
            lower_ast(r, ops);
            ops.push(match op {
                BinOp::Add => ComputeOp::Add,
                BinOp::Sub => ComputeOp::Sub,
                BinOp::Mul => ComputeOp::Mul,
                BinOp::Div => ComputeOp::Div,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputeIr {
    pub tile_count: u64,
    pub input_cbs: Vec<(String, u32)>,
    pub output_cbs: Vec<(String, u32)>,
    pub ops: Vec<ComputeOp>,
}

fn build_compute_ir(
    kernel: &Kernel,
    tile_count: u64,
    input_cbs: Vec<(String, u32)>,
    output_cbs: Vec<(String, u32)>,
) -> Result<ComputeIr, Error> {
    let mut ops = Vec::new();
    match &kernel.compute_expression {
        Some(src) => {
            let input_names: Vec<String> = kernel.input_ports.iter().map(|p| p.name.clone()).collect();
            let output_names: Vec<String> = kernel.output_ports.iter().map(|p| p.name.clone()).collect();
            let program = expr::parse_and_check(src, &input_names, &output_names)?;
            for stmt in &program.statements {
                lower_ast(&stmt.expr, &mut ops);
                ops.push(ComputeOp::StoreOutput(stmt.output.clone()));
            }
        }
        None => {
            // Passthrough: each output port receives its positionally
            // corresponding input port's tile unchanged.
            for (inp, out) in kernel.input_ports.iter().zip(kernel.output_ports.iter()) {
                ops.push(ComputeOp::LoadInput(inp.name.clone()));
                ops.push(ComputeOp::StoreOutput(out.name.clone()));
            }
        }
    }
    Ok(ComputeIr {
        tile_count,
        input_cbs,
        output_cbs,
        ops,
    })
}

/// The structured intermediate for one core's three programs, consumed by
/// [`emit`] to produce source text and by [`crate::testing::MockDeviceApi`]
/// to interpret directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelIr {
    pub reader_inputs: Vec<ReaderInput>,
    pub compute: ComputeIr,
    pub writer_outputs: Vec<WriterOutput>,
}

/// The three source strings plus runtime argument vector for one core.
#[derive(Debug, Clone)]
pub struct CoreProgram {
    pub core: CoreCoord,
    pub kernel: KernelId,
    pub ir: KernelIr,
    pub reader_source: String,
    pub compute_source: String,
    pub writer_source: String,
}

fn cores_for_kernel(map: &Map, kernel_id: KernelId) -> Vec<CoreCoord> {
    let mut cores: Vec<CoreCoord> = map
        .edges()
        .iter()
        .filter(|e| {
            matches!(&e.source, Endpoint::Kernel(k, _) if *k == kernel_id)
                || matches!(&e.sink, Endpoint::Kernel(k, _) if *k == kernel_id)
        })
        .flat_map(|e| e.work_slices.iter().filter(|s| s.tile_count > 0).map(|s| s.core))
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();
    cores.sort_by_key(|c| (c.row, c.col));
    cores
}

fn gather_input_kind(
    entry: &StreamEntry,
    stream_id: crate::stream::StreamId,
    core: CoreCoord,
    edge_id: crate::graph::EdgeId,
    plan: &ResourcePlan,
) -> Result<InputKind, Error> {
    match entry {
        StreamEntry::Plain(_) => Ok(InputKind::Plain),
        StreamEntry::Gather(g) => {
            let index_cb_id = plan
                .aux_cb_for(core, edge_id)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "no aux index cb planned for gather edge {:?} at {:?}",
                        edge_id, core
                    ))
                })?
                .id;
            match g.storage_tier {
                StorageTier::Dram => Ok(InputKind::GatherDram {
                    accesses_per_token: g.accesses_per_token,
                    index_cb_id,
                }),
                StorageTier::Scratch => Ok(InputKind::GatherScratch {
                    accesses_per_token: g.accesses_per_token,
                    index_cb_id,
                    scratch_base: plan
                        .scratch_buffers
                        .iter()
                        .find(|s| s.stream == stream_id && s.core == core)
                        .map(|s| s.base)
                        .unwrap_or(0),
                }),
            }
        }
    }
}

/// Builds one [`KernelIr`] (and renders its text) per populated core.
pub fn synthesize_kernels(map: &Map, plan: &ResourcePlan) -> Result<Vec<CoreProgram>, Error> {
    let mut core_to_kernel: HashMap<CoreCoord, KernelId> = HashMap::new();
    for idx in 0..map.kernels().len() {
        let kernel_id = KernelId(idx as u32);
        for core in cores_for_kernel(map, kernel_id) {
            core_to_kernel.insert(core, kernel_id);
        }
    }

    let mut programs = Vec::new();
    let mut cores: Vec<CoreCoord> = core_to_kernel.keys().copied().collect();
    cores.sort_by_key(|c| (c.row, c.col));

    for core in cores {
        let kernel_id = core_to_kernel[&core];
        let kernel = map.kernel(kernel_id)?;

        let mut reader_inputs = Vec::new();
        let mut input_cbs = Vec::new();
        let mut output_tile_count = 0u64;

        for (eid_idx, edge) in map.edges().iter().enumerate() {
            let edge_id = crate::graph::EdgeId(eid_idx as u32);
            if let Endpoint::Kernel(k, port) = &edge.sink {
                if *k != kernel_id {
                    continue;
                }
                let Some(slice) = edge.work_slices.iter().find(|s| s.core == core && s.tile_count > 0) else {
                    continue;
                };
                let cb = plan.cb_for(core, edge_id).ok_or_else(|| {
                    Error::Internal(format!("no reader cb planned for edge {} at {:?}", eid_idx, core))
                })?;
                let (kind, owner) = match &edge.source {
                    Endpoint::Stream(sid) => (
                        gather_input_kind(map.stream(*sid)?, *sid, core, edge_id, plan)?,
                        DramOwner::Stream(*sid),
                    ),
                    Endpoint::Kernel(_, _) => (InputKind::Plain, DramOwner::Edge(edge_id)),
                };
                reader_inputs.push(ReaderInput {
                    port: port.clone(),
                    cb_id: cb.id,
                    tile_count: slice.tile_count,
                    tile_start: slice.tile_start,
                    kind,
                    access_slot: edge.access_slot,
                    edge: edge_id,
                    owner,
                });
                input_cbs.push((port.clone(), cb.id));
            }
        }

        let mut writer_outputs = Vec::new();
        let mut output_cbs = Vec::new();
        for (eid_idx, edge) in map.edges().iter().enumerate() {
            let edge_id = crate::graph::EdgeId(eid_idx as u32);
            if let Endpoint::Kernel(k, port) = &edge.source {
                if *k != kernel_id {
                    continue;
                }
                let Some(slice) = edge.work_slices.iter().find(|s| s.core == core && s.tile_count > 0) else {
                    continue;
                };
                let cb = plan.cb_for(core, edge_id).ok_or_else(|| {
                    Error::Internal(format!("no writer cb planned for edge {} at {:?}", eid_idx, core))
                })?;
                let owner = match &edge.sink {
                    Endpoint::Stream(sid) => DramOwner::Stream(*sid),
                    Endpoint::Kernel(_, _) => DramOwner::Edge(edge_id),
                };
                writer_outputs.push(WriterOutput {
                    port: port.clone(),
                    cb_id: cb.id,
                    tile_count: slice.tile_count,
                    tile_start: slice.tile_start,
                    edge: edge_id,
                    owner,
                });
                output_cbs.push((port.clone(), cb.id));
                output_tile_count = slice.tile_count;
            }
        }

        reader_inputs.sort_by(|a, b| a.port.cmp(&b.port));
        input_cbs.sort();
        writer_outputs.sort_by(|a, b| a.port.cmp(&b.port));
        output_cbs.sort();

        let tile_count = if output_tile_count > 0 {
            output_tile_count
        } else {
            reader_inputs.iter().map(|r| r.tile_count).max().unwrap_or(0)
        };

        let compute = build_compute_ir(kernel, tile_count, input_cbs, output_cbs)?;
        let ir = KernelIr {
            reader_inputs,
            compute,
            writer_outputs,
        };

        let reader_source = emit::emit_reader(&ir);
        let compute_source = emit::emit_compute(&ir);
        let writer_source = emit::emit_writer(&ir);

        programs.push(CoreProgram {
            core,
            kernel: kernel_id,
            ir,
            reader_source,
            compute_source,
            writer_source,
        });
    }

    debug_assert!(DRAM_ACCESS_ALIGN == 32, "gather alignment constant moved");
    Ok(programs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::format::DataFormat;
    use crate::graph::{Endpoint, MapConfig};
    use crate::kernel::Kernel;
    use crate::stream::Stream;

    fn build_saxpy_map() -> Map {
        let mut map = Map::new(MapConfig::default(), Some(DeviceConfig::default())).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 1024], DataFormat::Float32));
        let s1 = map.add_stream(Stream::new(vec![1.0; 1024], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("saxpy")
                .with_input("in0", DataFormat::Float32)
                .with_input("in1", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32)
                .with_compute("out0 = in0 * 2.0 + in1;"),
        );
        let s2 = map.add_stream(Stream::new(vec![0.0; 1024], DataFormat::Float32));
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0")).unwrap();
        map.add_connection(Endpoint::stream(s1), Endpoint::kernel(k0, "in1")).unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s2)).unwrap();
        map
    }

    #[test]
    fn synthesis_is_deterministic() {
        let mut a = build_saxpy_map();
        a.validate().unwrap();
        a.propagate_counts().unwrap();
        a.plan_parallelization().unwrap();
        a.plan_resources().unwrap();
        a.generate_device_kernels().unwrap();

        let mut b = build_saxpy_map();
        b.validate().unwrap();
        b.propagate_counts().unwrap();
        b.plan_parallelization().unwrap();
        b.plan_resources().unwrap();
        b.generate_device_kernels().unwrap();

        let pa = a.programs().unwrap();
        let pb = b.programs().unwrap();
        assert_eq!(pa.len(), pb.len());
        for (x, y) in pa.iter().zip(pb.iter()) {
            assert_eq!(x.ir, y.ir);
            assert_eq!(x.reader_source, y.reader_source);
            assert_eq!(x.compute_source, y.compute_source);
            assert_eq!(x.writer_source, y.writer_source);
        }
    }
}
