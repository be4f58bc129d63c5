//! Tile-count propagation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Error, ShapeError};
use crate::format::tile_count_for_elements;
use crate::kernel::KernelId;
use crate::stream::StreamEntry;

use super::{Edge, EdgeId, Endpoint, Map};

fn kernel_topo_order(map: &Map) -> Result<Vec<KernelId>, Error> {
    let n = map.kernels().len();
    let mut indegree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in map.edges() {
        if let (Endpoint::Kernel(src, _), Endpoint::Kernel(dst, _)) = (&edge.source, &edge.sink) {
            adj[src.0 as usize].push(dst.0 as usize);
            indegree[dst.0 as usize] += 1;
        }
    }
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(k) = queue.pop_front() {
        order.push(KernelId(k as u32));
        for &next in &adj[k] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if order.len() != n {
        return Err(Error::Internal(
            "kernel graph has a cycle that add_connection should have rejected".into(),
        ));
    }
    Ok(order)
}

fn edges_touching(map: &Map, kernel: KernelId, as_sink: bool) -> Vec<EdgeId> {
    map.edges()
        .iter()
        .enumerate()
        .filter_map(|(i, e)| {
            let endpoint = if as_sink { &e.sink } else { &e.source };
            match endpoint {
                Endpoint::Kernel(id, _) if *id == kernel => Some(EdgeId(i as u32)),
                _ => None,
            }
        })
        .collect()
}

/// Assigns a `tile_count` to every edge: stream-sourced edges directly from
/// their element/index counts, kernel-sourced edges by propagating forward
/// in kernel topological order.
pub(super) fn propagate_counts(map: &mut Map) -> Result<(), Error> {
    let n_edges = map.edges().len();
    let mut tile_counts: Vec<Option<u64>> = vec![None; n_edges];

    for (i, edge) in map.edges().iter().enumerate() {
        if let Endpoint::Stream(id) = &edge.source {
            let tc = match map.stream(*id)? {
                StreamEntry::Plain(s) => tile_count_for_elements(s.element_count),
                StreamEntry::Gather(g) => {
                    let tokens = g.index_count() / g.accesses_per_token;
                    tile_count_for_elements(tokens)
                }
            };
            tile_counts[i] = Some(tc);
        }
    }

    let order = kernel_topo_order(map)?;
    let mut seen: HashSet<KernelId> = HashSet::new();
    for kernel_id in order {
        seen.insert(kernel_id);
        let input_edges = edges_touching(map, kernel_id, true);
        let mut resolved: HashMap<EdgeId, u64> = HashMap::new();
        for eid in &input_edges {
            let tc = tile_counts[eid.0 as usize].ok_or_else(|| {
                Error::Internal(format!(
                    "edge {:?} feeding kernel {:?} has no tile count yet",
                    eid, kernel_id
                ))
            })?;
            resolved.insert(*eid, tc);
        }
        if resolved.is_empty() {
            continue;
        }
        let min = *resolved.values().min().unwrap();
        let max = *resolved.values().max().unwrap();
        if min != max {
            return Err(ShapeError::TileCountMismatch {
                kernel: kernel_id,
                a: min,
                b: max,
            }
            .into());
        }
        let output_tile_count = min;
        for eid in edges_touching(map, kernel_id, false) {
            tile_counts[eid.0 as usize] = Some(output_tile_count);
        }
    }

    for (i, edge) in edge_iter_mut(map).enumerate() {
        edge.tile_count = Some(tile_counts[i].ok_or_else(|| {
            Error::Internal(format!("edge {} never received a tile count", i))
        })?);
    }
    Ok(())
}

fn edge_iter_mut(map: &mut Map) -> std::slice::IterMut<'_, Edge> {
    map.edges_mut().iter_mut()
}

impl Map {
    pub(super) fn edges_mut(&mut self) -> &mut Vec<Edge> {
        &mut self.edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DataFormat;
    use crate::graph::MapConfig;
    use crate::kernel::Kernel;
    use crate::stream::Stream;

    #[test]
    fn stream_edge_gets_ceil_tile_count() {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 2000], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("k")
                .with_input("in0", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        let s1 = map.add_stream(Stream::new(vec![0.0; 2000], DataFormat::Float32));
        let e0 = map
            .add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s1))
            .unwrap();
        map.propagate_counts().unwrap();
        assert_eq!(map.edge(e0).tile_count, Some(2));
    }

    #[test]
    fn mismatched_input_tile_counts_error() {
        let mut map = Map::new(MapConfig::default(), None).unwrap();
        let s0 = map.add_stream(Stream::new(vec![1.0; 1024], DataFormat::Float32));
        let s1 = map.add_stream(Stream::new(vec![1.0; 2048], DataFormat::Float32));
        let k0 = map.add_kernel(
            Kernel::new("k")
                .with_input("in0", DataFormat::Float32)
                .with_input("in1", DataFormat::Float32)
                .with_output("out0", DataFormat::Float32),
        );
        map.add_connection(Endpoint::stream(s0), Endpoint::kernel(k0, "in0"))
            .unwrap();
        map.add_connection(Endpoint::stream(s1), Endpoint::kernel(k0, "in1"))
            .unwrap();
        let s2 = map.add_stream(Stream::new(vec![0.0; 1024], DataFormat::Float32));
        map.add_connection(Endpoint::kernel(k0, "out0"), Endpoint::stream(s2))
            .unwrap();
        let err = map.propagate_counts().unwrap_err();
        assert!(matches!(
            err,
            Error::Shape(ShapeError::TileCountMismatch { .. })
        ));
    }
}
