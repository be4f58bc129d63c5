//! Parallelization planning: splitting edge tile counts across cores.

use tracing::warn;

use crate::error::{Error, ResourceError};
use crate::kernel::KernelId;

use super::{CoreCoord, EdgeId, Endpoint, Map, WorkSlice};

/// Splits `tile_count` into `core_count` contiguous slices differing by at
/// most 1, the first slices taking the remainder so the *last* slice is the
/// smallest (spec's tie-break). Slices beyond the edge's natural `P'` are
/// zero-length placeholders so every edge incident to a kernel reports the
/// same slice count.
fn balanced_slices(tile_count: u64, natural_p: usize, core_count: usize, cores: &[CoreCoord]) -> Vec<WorkSlice> {
    let base = tile_count / natural_p as u64;
    let rem = tile_count % natural_p as u64;
    let mut slices = Vec::with_capacity(core_count);
    let mut cursor = 0u64;
    for i in 0..natural_p {
        let size = if (i as u64) < rem { base + 1 } else { base };
        slices.push(WorkSlice {
            tile_start: cursor,
            tile_count: size,
            core: cores[i],
        });
        cursor += size;
    }
    for core in cores.iter().take(core_count).skip(natural_p) {
        slices.push(WorkSlice {
            tile_start: cursor,
            tile_count: 0,
            core: *core,
        });
    }
    slices
}

fn core_from_index(index: usize, cols: usize, rows: usize) -> Result<CoreCoord, Error> {
    let col = index % cols;
    let row = index / cols;
    if row >= rows {
        return Err(ResourceError::NotEnoughCores {
            needed: index + 1,
            available: cols * rows,
        }
        .into());
    }
    Ok(CoreCoord { col, row })
}

pub(super) fn plan_parallelization(map: &mut Map) -> Result<(), Error> {
    let p = map.config().max_parallelization_factor;
    let (cols, rows) = map.device_config().mesh;
    let n_kernels = map.kernels().len();

    let mut next_core_index = 0usize;

    for idx in 0..n_kernels {
        let kernel_id = KernelId(idx as u32);
        let incident: Vec<EdgeId> = map
            .edges()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                let touches = matches!(&e.source, Endpoint::Kernel(k, _) if *k == kernel_id)
                    || matches!(&e.sink, Endpoint::Kernel(k, _) if *k == kernel_id);
                touches.then_some(EdgeId(i as u32))
            })
            .collect();
        if incident.is_empty() {
            continue;
        }

        let mut kernel_p = 1usize;
        for eid in &incident {
            let t = map.edge(*eid).tile_count.ok_or_else(|| {
                Error::Internal("plan_parallelization requires propagate_counts first".into())
            })?;
            let natural = p.min(t.max(1) as usize).max(1);
            if natural > kernel_p {
                kernel_p = natural;
            }
        }
        if p > 1 {
            for eid in &incident {
                let t = map.edge(*eid).tile_count.unwrap();
                if t == 1 {
                    warn!(kernel = idx, edge = eid.0, "tile_count == 1 with max_parallelization_factor > 1; using a single core");
                }
            }
        }

        let cores: Vec<CoreCoord> = (0..kernel_p)
            .map(|i| core_from_index(next_core_index + i, cols, rows))
            .collect::<Result<_, _>>()?;
        next_core_index += kernel_p;

        for eid in incident {
            let t = map.edge(eid).tile_count.unwrap();
            let natural = p.min(t.max(1) as usize).max(1);
            let slices = balanced_slices(t, natural, kernel_p, &cores);
            map.edges_mut()[eid.0 as usize].work_slices = slices;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::graph::{Endpoint, MapConfig};
    use crate::kernel::Kernel;
    use crate::stream::Stream;

    #[test]
    fn balanced_split_smallest_last() {
        let cores = [
            CoreCoord { col: 0, row: 0 },
            CoreCoord { col: 1, row: 0 },
            CoreCoord { col: 2, row: 0 },
        ];
        let slices = balanced_slices(10, 3, 3, &cores);
        let sizes: Vec<u64> = slices.iter().map(|s| s.tile_count).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(sizes.iter().sum::<u64>(), 10);
    }

    #[test]
    fn plan_assigns_distinct_cores_per_kernel() {
        let mut map = Map::new(
            MapConfig {
                max_parallelization_factor: 4,
                tiles_per_cb: 2,
            },
            None,
        )
        .unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 4096], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("a")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let k1 = map.add_kernel(
            Kernel::new("b")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 4096], DataFormat::Float32));
        let e0 = map
            .add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::kernel(k1, "in0"))
            .unwrap();
        let e2 = map
            .add_connection(Endpoint::kernel(k1, "out0"), Endpoint::stream(s1))
            .unwrap();
        map.propagate_counts().unwrap();
        map.plan_parallelization().unwrap();
        assert_eq!(map.edge(e0).work_slices.len(), 4);
        let cores_a: Vec<_> = map.edge(e0).work_slices.iter().map(|s| s.core).collect();
        let cores_b: Vec<_> = map.edge(e2).work_slices.iter().map(|s| s.core).collect();
        assert_ne!(cores_a, cores_b);
    }
}
