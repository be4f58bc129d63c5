//! Resource planning: DRAM buffers, scratch buffers, circular buffer id
//! spaces.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, ResourceError};
use crate::format::{tile_bytes, DataFormat, INDEX_ELEM_BYTES, TILE_SIZE};
use crate::stream::{StorageTier, StreamEntry, StreamId};

use super::{CoreCoord, EdgeId, Endpoint, Map};

/// Reader-visible circular buffer ids start at 0; writer-visible ids start
/// here, so a reader and writer kernel on the same core never collide.
pub const WRITER_CB_ID_BASE: u32 = 16;
/// Aux (index) circular buffer ids start above the writer space, so a
/// gather reader's index buffer never collides with a data buffer id.
pub const AUX_CB_ID_BASE: u32 = WRITER_CB_ID_BASE + MAX_CB_IDS_PER_SPACE;
const MAX_CB_IDS_PER_SPACE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DramRole {
    Data,
    Index,
}

/// What a [`DramBufferSpec`] backs: a user stream/gather stream, or an
/// intermediate buffer carrying one kernel's output to another kernel's
/// input. Kernel-to-kernel edges need one too, since two chained kernels
/// always land on different cores (one compute kernel per core) and cores
/// only share data through an explicit DRAM round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DramOwner {
    Stream(StreamId),
    Edge(EdgeId),
}

#[derive(Debug, Clone)]
pub struct DramBufferSpec {
    pub owner: DramOwner,
    pub role: DramRole,
    pub page_size: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone)]
pub struct ScratchBufferSpec {
    pub stream: StreamId,
    pub core: CoreCoord,
    pub base: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbSpace {
    Reader,
    Writer,
    /// Holds the raw `u32` index tile(s) a gather reader fetches before it
    /// can resolve its data lookups; one per gather-sourced reader input.
    Aux,
}

#[derive(Debug, Clone)]
pub struct CbSpec {
    pub core: CoreCoord,
    pub id: u32,
    pub space: CbSpace,
    pub edge: EdgeId,
    pub format: DataFormat,
    pub page_size: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ResourcePlan {
    pub dram_buffers: Vec<DramBufferSpec>,
    pub scratch_buffers: Vec<ScratchBufferSpec>,
    pub circular_buffers: Vec<CbSpec>,
}

impl ResourcePlan {
    pub fn cb_for(&self, core: CoreCoord, edge: EdgeId) -> Option<&CbSpec> {
        self.circular_buffers
            .iter()
            .find(|cb| cb.core == core && cb.edge == edge && cb.space != CbSpace::Aux)
    }

    /// The auxiliary index circular buffer a gather-sourced reader input
    /// uses to fetch its raw index tile(s) before resolving data lookups.
    pub fn aux_cb_for(&self, core: CoreCoord, edge: EdgeId) -> Option<&CbSpec> {
        self.circular_buffers
            .iter()
            .find(|cb| cb.core == core && cb.edge == edge && cb.space == CbSpace::Aux)
    }

    pub fn dram_for_stream(&self, id: StreamId, role: DramRole) -> Option<&DramBufferSpec> {
        self.dram_buffers
            .iter()
            .find(|b| b.owner == DramOwner::Stream(id) && b.role == role)
    }

    pub fn dram_for_edge(&self, id: EdgeId) -> Option<&DramBufferSpec> {
        self.dram_buffers
            .iter()
            .find(|b| b.owner == DramOwner::Edge(id))
    }
}

fn plan_dram(map: &Map) -> Result<Vec<DramBufferSpec>, Error> {
    let mut specs = Vec::new();
    for (idx, entry) in map.streams().iter().enumerate() {
        let id = StreamId(idx as u32);
        match entry {
            StreamEntry::Plain(s) => {
                let page = tile_bytes(s.format);
                let tiles = crate::format::tile_count_for_elements(s.element_count);
                specs.push(DramBufferSpec {
                    owner: DramOwner::Stream(id),
                    role: DramRole::Data,
                    page_size: page,
                    total_size: page * tiles.max(1),
                });
            }
            StreamEntry::Gather(g) => {
                let index_page = TILE_SIZE * INDEX_ELEM_BYTES;
                let index_tiles = crate::format::tile_count_for_elements(g.index_count());
                specs.push(DramBufferSpec {
                    owner: DramOwner::Stream(id),
                    role: DramRole::Index,
                    page_size: index_page,
                    total_size: index_page * index_tiles.max(1),
                });
                if g.storage_tier == StorageTier::Dram {
                    let page = tile_bytes(g.format);
                    let tiles = crate::format::tile_count_for_elements(g.data_element_count);
                    specs.push(DramBufferSpec {
                        owner: DramOwner::Stream(id),
                        role: DramRole::Data,
                        page_size: page,
                        total_size: page * tiles.max(1),
                    });
                }
            }
        }
    }

    // Kernel-to-kernel edges need an intermediate DRAM round-trip too: the
    // two kernels always land on different cores (one compute kernel per
    // core), and cores only share data through DRAM or a scratch broadcast.
    for (i, edge) in map.edges().iter().enumerate() {
        if matches!(
            (&edge.source, &edge.sink),
            (Endpoint::Kernel(_, _), Endpoint::Kernel(_, _))
        ) {
            let tiles = edge.tile_count.ok_or_else(|| {
                Error::Internal("plan_resources requires propagate_counts first".into())
            })?;
            let page = tile_bytes(edge.format);
            specs.push(DramBufferSpec {
                owner: DramOwner::Edge(EdgeId(i as u32)),
                role: DramRole::Data,
                page_size: page,
                total_size: page * tiles.max(1),
            });
        }
    }
    Ok(specs)
}

fn plan_scratch(map: &Map) -> Result<Vec<ScratchBufferSpec>, Error> {
    let mut specs = Vec::new();
    let capacity = map.device_config().scratch_capacity_per_core;
    let reserved = map.device_config().scratch_reserved_base;
    let usable = capacity.saturating_sub(reserved);

    for (idx, entry) in map.streams().iter().enumerate() {
        let id = StreamId(idx as u32);
        let StreamEntry::Gather(g) = entry else {
            continue;
        };
        if g.storage_tier != StorageTier::Scratch {
            continue;
        }
        let data_bytes = g.data_bytes() as usize;
        if data_bytes > usable {
            return Err(ResourceError::ScratchCapacity(id, data_bytes, usable).into());
        }
        let consuming_cores: HashSet<CoreCoord> = map
            .edges()
            .iter()
            .filter(|e| matches!(&e.source, Endpoint::Stream(s) if *s == id))
            .flat_map(|e| e.work_slices.iter().filter(|s| s.tile_count > 0).map(|s| s.core))
            .collect();
        for core in consuming_cores {
            specs.push(ScratchBufferSpec {
                stream: id,
                core,
                base: reserved,
                size: data_bytes,
            });
        }
    }
    Ok(specs)
}

fn plan_circular_buffers(map: &Map) -> Result<Vec<CbSpec>, Error> {
    let mut specs = Vec::new();
    let tiles_per_cb = map.config().tiles_per_cb as u64;

    let mut reader_next: HashMap<CoreCoord, u32> = HashMap::new();
    let mut writer_next: HashMap<CoreCoord, u32> = HashMap::new();
    let mut aux_next: HashMap<CoreCoord, u32> = HashMap::new();

    for (i, edge) in map.edges().iter().enumerate() {
        let edge_id = EdgeId(i as u32);
        let is_reader_side = matches!(&edge.sink, Endpoint::Kernel(_, _));
        let is_writer_side = matches!(&edge.source, Endpoint::Kernel(_, _));
        let gather_source = match &edge.source {
            Endpoint::Stream(sid) => match map.stream(*sid)? {
                StreamEntry::Gather(g) => Some(g),
                StreamEntry::Plain(_) => None,
            },
            Endpoint::Kernel(_, _) => None,
        };

        for slice in edge.work_slices.iter().filter(|s| s.tile_count > 0) {
            let capacity = tiles_per_cb * tile_bytes(edge.format);
            if is_reader_side {
                let next = reader_next.entry(slice.core).or_insert(0);
                if *next >= MAX_CB_IDS_PER_SPACE {
                    return Err(ResourceError::OutOfCbIds {
                        core: (slice.core.col, slice.core.row),
                        space: "reader".into(),
                    }
                    .into());
                }
                specs.push(CbSpec {
                    core: slice.core,
                    id: *next,
                    space: CbSpace::Reader,
                    edge: edge_id,
                    format: edge.format,
                    page_size: tile_bytes(edge.format),
                    capacity,
                });
                *next += 1;
            }
            if is_writer_side {
                let next = writer_next.entry(slice.core).or_insert(WRITER_CB_ID_BASE);
                if *next >= WRITER_CB_ID_BASE + MAX_CB_IDS_PER_SPACE {
                    return Err(ResourceError::OutOfCbIds {
                        core: (slice.core.col, slice.core.row),
                        space: "writer".into(),
                    }
                    .into());
                }
                specs.push(CbSpec {
                    core: slice.core,
                    id: *next,
                    space: CbSpace::Writer,
                    edge: edge_id,
                    format: edge.format,
                    page_size: tile_bytes(edge.format),
                    capacity,
                });
                *next += 1;
            }
            if is_reader_side {
                if let Some(g) = gather_source {
                    let next = aux_next.entry(slice.core).or_insert(AUX_CB_ID_BASE);
                    if *next >= AUX_CB_ID_BASE + MAX_CB_IDS_PER_SPACE {
                        return Err(ResourceError::OutOfCbIds {
                            core: (slice.core.col, slice.core.row),
                            space: "aux".into(),
                        }
                        .into());
                    }
                    let index_page = tile_bytes(DataFormat::UInt32);
                    specs.push(CbSpec {
                        core: slice.core,
                        id: *next,
                        space: CbSpace::Aux,
                        edge: edge_id,
                        format: DataFormat::UInt32,
                        page_size: index_page,
                        capacity: tiles_per_cb * g.accesses_per_token * index_page,
                    });
                    *next += 1;
                }
            }
        }
    }
    Ok(specs)
}

pub(super) fn plan_resources(map: &Map) -> Result<ResourcePlan, Error> {
    Ok(ResourcePlan {
        dram_buffers: plan_dram(map)?,
        scratch_buffers: plan_scratch(map)?,
        circular_buffers: plan_circular_buffers(map)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::graph::{Endpoint, MapConfig};
    use crate::kernel::Kernel;
    use crate::stream::Stream;

    #[test]
    fn cb_capacity_is_at_least_double_buffered() {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 1024], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("k")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 1024], DataFormat::Float32));
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1))
            .unwrap();
        map.propagate_counts().unwrap();
        map.plan_parallelization().unwrap();
        map.plan_resources().unwrap();
        let plan = map.resource_plan().unwrap();
        for cb in &plan.circular_buffers {
            assert!(cb.capacity >= 2 * tile_bytes(cb.format));
        }
    }
}
