//! The runtime orchestrator: the only part of this crate that actually
//! talks to a device.
//!
//! Everything above this module — validation, count propagation,
//! parallelization, resource planning, synthesis — is pure computation over
//! a [`Map`]. This module is where that plan gets executed against a
//! [`DeviceApi`]: buffers get created, host data crosses to DRAM (and
//! scratch), kernels and circular buffers get registered, and the program
//! runs.

use crate::device::{BufferDesc, BufferTier, DeviceApi, Processor};
use crate::error::{DeviceError, Error};
use crate::format::DataFormat;
use crate::graph::{DramOwner, DramRole, Edge, Endpoint, Map};
use crate::stream::{StorageTier, StreamEntry, StreamId};

fn call<T>(call: &str, result: Result<T, DeviceError>) -> Result<T, Error> {
    result.map_err(|e| {
        Error::Device(DeviceError::Call {
            call: call.to_string(),
            detail: e.to_string(),
        })
    })
}

fn create_dram_buffers(map: &mut Map, device: &mut dyn DeviceApi) -> Result<(), Error> {
    let plan = map.resource_plan().unwrap().clone();
    for spec in &plan.dram_buffers {
        let handle = call(
            "buffer_create",
            device.buffer_create(BufferDesc {
                size: spec.total_size,
                page_size: spec.page_size,
                tier: BufferTier::Dram,
            }),
        )?;
        device.observe_buffer(spec.owner, spec.role, handle);
        map.set_buffer_handle(spec.owner, spec.role, handle);
    }
    Ok(())
}

/// Uploads every stream's host data (and every gather stream's indices) to
/// DRAM, and broadcasts Scratch-tier gather data to each consuming core's
/// scratch region.
fn upload(map: &Map, device: &mut dyn DeviceApi) -> Result<(), Error> {
    let plan = map.resource_plan().unwrap();
    for (idx, entry) in map.streams().iter().enumerate() {
        let id = StreamId(idx as u32);
        match entry {
            StreamEntry::Plain(s) => {
                let handle = map
                    .buffer_handle(DramOwner::Stream(id), DramRole::Data)
                    .ok_or_else(|| Error::Internal(format!("no DRAM buffer for stream {:?}", id)))?;
                call(
                    "enqueue_write_buffer",
                    device.enqueue_write_buffer(
                        handle,
                        &s.host_buffer[..s.element_count as usize],
                        s.format,
                    ),
                )?;
            }
            StreamEntry::Gather(g) => {
                let index_handle = map
                    .buffer_handle(DramOwner::Stream(id), DramRole::Index)
                    .ok_or_else(|| Error::Internal(format!("no index buffer for stream {:?}", id)))?;
                let indices: Vec<f64> = g.indices.iter().map(|&i| i as f64).collect();
                call(
                    "enqueue_write_buffer",
                    device.enqueue_write_buffer(index_handle, &indices, DataFormat::UInt32),
                )?;
                match g.storage_tier {
                    StorageTier::Dram => {
                        let data_handle = map
                            .buffer_handle(DramOwner::Stream(id), DramRole::Data)
                            .ok_or_else(|| {
                                Error::Internal(format!("no data buffer for gather stream {:?}", id))
                            })?;
                        call(
                            "enqueue_write_buffer",
                            device.enqueue_write_buffer(
                                data_handle,
                                &g.data[..g.data_element_count as usize],
                                g.format,
                            ),
                        )?;
                    }
                    StorageTier::Scratch => {
                        for scratch in plan.scratch_buffers.iter().filter(|s| s.stream == id) {
                            call(
                                "write_to_device_scratch",
                                device.write_to_device_scratch(
                                    scratch.core,
                                    scratch.base,
                                    &g.data[..g.data_element_count as usize],
                                    g.format,
                                ),
                            )?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn create_circular_buffers(map: &Map, device: &mut dyn DeviceApi) -> Result<(), Error> {
    let plan = map.resource_plan().unwrap();
    for cb in &plan.circular_buffers {
        call(
            "circular_buffer_create",
            device.circular_buffer_create(cb.core, cb.id, cb.capacity, cb.page_size, cb.format),
        )?;
    }
    Ok(())
}

/// DRAM address + NoC coords for whatever backs one side of `edge`.
fn dram_location(
    map: &Map,
    device: &dyn DeviceApi,
    edge: &Edge,
    edge_id: crate::graph::EdgeId,
    want_source_side: bool,
) -> Result<(u64, u32, u32), Error> {
    let owner = match if want_source_side {
        &edge.source
    } else {
        &edge.sink
    } {
        Endpoint::Stream(id) => DramOwner::Stream(*id),
        Endpoint::Kernel(_, _) => DramOwner::Edge(edge_id),
    };
    let handle = map
        .buffer_handle(owner, DramRole::Data)
        .ok_or_else(|| Error::Internal(format!("no DRAM buffer backing edge {:?}", edge_id)))?;
    let addr = device.buffer_address(handle);
    let (x, y) = device.buffer_noc_coords(handle);
    Ok((addr, x, y))
}

fn register_kernels(map: &Map, device: &mut dyn DeviceApi) -> Result<(), Error> {
    let programs = map
        .programs()
        .ok_or_else(|| Error::Internal("generate_device_kernels must run before execute".into()))?;

    for program in programs {
        device.observe_kernel_ir(program.core, &program.ir);

        let reader_handle = call(
            "kernel_register",
            device.kernel_register(program.core, Processor::DataMovement0, program.reader_source.clone()),
        )?;
        let mut reader_args = Vec::new();
        for input in &program.ir.reader_inputs {
            let edge = map.edge(input.edge);
            match input.kind {
                crate::synth::InputKind::Plain => {
                    let (addr, x, y) = dram_location(map, device, edge, input.edge, true)?;
                    reader_args.extend([addr as u32, x, y]);
                }
                crate::synth::InputKind::GatherDram { .. } => {
                    let Endpoint::Stream(sid) = &edge.source else {
                        return Err(Error::Internal("gather input must come from a stream".into()));
                    };
                    let index_handle = map
                        .buffer_handle(DramOwner::Stream(*sid), DramRole::Index)
                        .ok_or_else(|| Error::Internal("no index buffer for gather stream".into()))?;
                    let index_addr = device.buffer_address(index_handle);
                    let (ix, iy) = device.buffer_noc_coords(index_handle);
                    let data_handle = map
                        .buffer_handle(DramOwner::Stream(*sid), DramRole::Data)
                        .ok_or_else(|| Error::Internal("no data buffer for DRAM-tier gather stream".into()))?;
                    let data_addr = device.buffer_address(data_handle);
                    let (dx, dy) = device.buffer_noc_coords(data_handle);
                    reader_args.extend([index_addr as u32, ix, iy, data_addr as u32, dx, dy]);
                }
                crate::synth::InputKind::GatherScratch { .. } => {
                    let Endpoint::Stream(sid) = &edge.source else {
                        return Err(Error::Internal("gather input must come from a stream".into()));
                    };
                    let index_handle = map
                        .buffer_handle(DramOwner::Stream(*sid), DramRole::Index)
                        .ok_or_else(|| Error::Internal("no index buffer for gather stream".into()))?;
                    let index_addr = device.buffer_address(index_handle);
                    let (ix, iy) = device.buffer_noc_coords(index_handle);
                    reader_args.extend([index_addr as u32, ix, iy]);
                }
            }
        }
        call(
            "set_runtime_args",
            device.set_runtime_args(reader_handle, program.core, reader_args),
        )?;

        let compute_handle = call(
            "kernel_register",
            device.kernel_register(program.core, Processor::Compute, program.compute_source.clone()),
        )?;
        call(
            "set_runtime_args",
            device.set_runtime_args(compute_handle, program.core, Vec::new()),
        )?;

        let writer_handle = call(
            "kernel_register",
            device.kernel_register(program.core, Processor::DataMovement1, program.writer_source.clone()),
        )?;
        let mut writer_args = Vec::new();
        for output in &program.ir.writer_outputs {
            let edge = map.edge(output.edge);
            let (addr, x, y) = dram_location(map, device, edge, output.edge, false)?;
            writer_args.extend([addr as u32, x, y]);
        }
        call(
            "set_runtime_args",
            device.set_runtime_args(writer_handle, program.core, writer_args),
        )?;
    }
    Ok(())
}

/// Runs the full compile/execute pipeline against `device`: validate,
/// propagate counts, plan parallelization, plan resources, synthesize
/// kernels, then upload, register, launch, and wait.
pub fn execute(map: &mut Map, device: &mut dyn DeviceApi) -> Result<(), Error> {
    map.validate()?;
    map.propagate_counts()?;
    map.plan_parallelization()?;
    map.plan_resources()?;
    map.generate_device_kernels()?;

    call("program_create", device.program_create())?;
    create_dram_buffers(map, device)?;
    upload(map, device)?;
    create_circular_buffers(map, device)?;
    register_kernels(map, device)?;

    call("enqueue_program", device.enqueue_program())?;
    call("finish", device.finish())?;
    map.mark_executed();
    Ok(())
}

/// Blocking-reads a plain stream's sink buffer back from DRAM.
pub fn read_stream(map: &Map, device: &mut dyn DeviceApi, id: StreamId) -> Result<Vec<f64>, Error> {
    map.require_executed()?;
    let entry = map.stream(id)?;
    let StreamEntry::Plain(s) = entry else {
        return Err(Error::Internal("read_stream called on a gather stream".into()));
    };
    let handle = map
        .buffer_handle(DramOwner::Stream(id), DramRole::Data)
        .ok_or_else(|| Error::Internal(format!("no DRAM buffer for stream {:?}", id)))?;
    call(
        "enqueue_read_buffer",
        device.enqueue_read_buffer(handle, s.element_count, s.format),
    )
}

/// Blocking-reads a gather stream's own data buffer (wherever it lives —
/// DRAM or a consuming core's scratch) and, if asked, its index buffer.
/// Unlike `read_stream`, this reads the stream's *source* content, since a
/// gather stream is ordinarily an input; it exists for inspecting what the
/// device actually holds, independent of any kernel that consumes it.
pub fn read_gather_stream(
    map: &Map,
    device: &mut dyn DeviceApi,
    id: StreamId,
    include_indices: bool,
) -> Result<(Vec<f64>, Option<Vec<u32>>), Error> {
    map.require_executed()?;
    let entry = map.stream(id)?;
    let StreamEntry::Gather(g) = entry else {
        return Err(Error::Internal("read_gather_stream called on a plain stream".into()));
    };

    let data = match g.storage_tier {
        StorageTier::Dram => {
            let handle = map
                .buffer_handle(DramOwner::Stream(id), DramRole::Data)
                .ok_or_else(|| Error::Internal(format!("no DRAM buffer for gather stream {:?}", id)))?;
            call(
                "enqueue_read_buffer",
                device.enqueue_read_buffer(handle, g.data_element_count, g.format),
            )?
        }
        StorageTier::Scratch => {
            let plan = map.resource_plan().unwrap();
            let scratch = plan
                .scratch_buffers
                .iter()
                .find(|s| s.stream == id)
                .ok_or_else(|| Error::Internal(format!("no scratch buffer for gather stream {:?}", id)))?;
            call(
                "read_from_device_scratch",
                device.read_from_device_scratch(
                    scratch.core,
                    scratch.base,
                    g.data_element_count,
                    g.format,
                ),
            )?
        }
    };

    let indices = if include_indices {
        let index_handle = map
            .buffer_handle(DramOwner::Stream(id), DramRole::Index)
            .ok_or_else(|| Error::Internal("no index buffer for gather stream".into()))?;
        let raw = call(
            "enqueue_read_buffer",
            device.enqueue_read_buffer(index_handle, g.index_count(), DataFormat::UInt32),
        )?;
        Some(raw.into_iter().map(|v| v as u32).collect())
    } else {
        None
    };

    Ok((data, indices))
}
