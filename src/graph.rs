//! Rendergraph resolver.
//!
//! No graph library: contribution pruning and subgraph isolation are both
//! expressed as bitset operations over a flat pass list rather than graph
//! traversal, using plain `u64` bitsets instead of pulling in `petgraph`.

use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::handle::ResourceHandle;
use crate::pass::RenderPass;
use crate::settings::settings;

/// Graph-wide bitfields are sized by a compile-time maximum. A single
/// `u64` covers exactly 64 distinct resources per frame;
/// `MAX_RESOURCES` is double that. Exceeding it is reported as
/// [`GraphError::TooManyResources`] rather than silently truncated.
pub const MAX_RESOURCES: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceBitset(u64);

impl ResourceBitset {
    pub fn empty() -> ResourceBitset {
        ResourceBitset(0)
    }

    pub fn with_bit(index: usize) -> ResourceBitset {
        ResourceBitset(1u64 << index)
    }

    pub fn set(&mut self, index: usize) {
        self.0 |= 1u64 << index;
    }

    pub fn union(self, other: ResourceBitset) -> ResourceBitset {
        ResourceBitset(self.0 | other.0)
    }

    pub fn intersects(self, other: ResourceBitset) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn difference(self, other: ResourceBitset) -> ResourceBitset {
        ResourceBitset(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

struct GraphNode {
    pass: RenderPass,
    reads: ResourceBitset,
    writes: ResourceBitset,
    is_root: bool,
}

/// One isolated subgraph's affinity mask: a bit per surviving pass index
/// that belongs to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubgraphMask(u64);

impl SubgraphMask {
    pub fn contains(&self, pass_index: usize) -> bool {
        (self.0 & (1u64 << pass_index)) != 0
    }
}

pub struct ResolvedGraph {
    /// Surviving passes in their original relative order.
    pub passes: Vec<RenderPass>,
    pub subgraphs: Vec<SubgraphMask>,
}

/// Assigns each distinct resource handle an index 0..N.
fn assign_resource_indices(passes: &[RenderPass]) -> Result<HashMap<ResourceHandle, usize>> {
    let mut indices = HashMap::new();
    for pass in passes {
        for use_ in &pass.data().uses {
            if !indices.contains_key(&use_.handle) {
                let next = indices.len();
                if next >= MAX_RESOURCES {
                    return Err(GraphError::TooManyResources { max: MAX_RESOURCES });
                }
                indices.insert(use_.handle, next);
            }
        }
    }
    Ok(indices)
}

fn build_nodes(passes: Vec<RenderPass>, indices: &HashMap<ResourceHandle, usize>) -> Vec<GraphNode> {
    passes
        .into_iter()
        .map(|pass| {
            let mut reads = ResourceBitset::empty();
            let mut writes = ResourceBitset::empty();
            let is_root = pass.data().is_root;
            for use_ in &pass.data().uses {
                let bit = indices[&use_.handle];
                if use_.is_read {
                    reads.set(bit);
                }
                if use_.is_write {
                    writes.set(bit);
                }
            }
            GraphNode { pass, reads, writes, is_root }
        })
        .collect()
}

/// Runs the resolver: uniqueness, root marking, contribution pruning, and
/// subgraph isolation, emitting a dot file if requested. Extent patching
/// against a concrete swapchain size is a separate step, see
/// [`resolve_and_patch`].
pub fn resolve(passes: Vec<RenderPass>) -> Result<ResolvedGraph> {
    let indices = assign_resource_indices(&passes)?;
    let mut nodes = build_nodes(passes, &indices);

    // Contribution pruning, iterated bottom-to-top.
    let mut read_accum = ResourceBitset::empty();
    let mut contributes = vec![false; nodes.len()];
    for i in (0..nodes.len()).rev() {
        let writes = nodes[i].writes;
        let reads = nodes[i].reads;
        let is_root = nodes[i].is_root && !writes.intersects(read_accum);
        // A root that writes into a currently-monitored read demotes
        // itself to non-root: a later (in iteration order, i.e. a
        // subsequent) root already depends on it through that read.
        nodes[i].is_root = is_root;
        let node_contributes = is_root || writes.intersects(read_accum);
        contributes[i] = node_contributes;
        if node_contributes {
            read_accum = read_accum.difference(writes).union(reads);
        }
    }

    let surviving_indices: Vec<usize> = (0..nodes.len()).filter(|&i| contributes[i]).collect();

    if settings().print_extended_debug_messages() {
        log::debug!(
            "rendergraph resolve: {} of {} passes survived contribution pruning",
            surviving_indices.len(),
            nodes.len()
        );
    }

    // Subgraph isolation. Walk backwards from each surviving root,
    // accumulating the reads/writes of everything it transitively depends
    // on, then merge roots whose accumulated sets cross-intersect.
    let root_positions: Vec<usize> = surviving_indices.iter().copied().filter(|&i| nodes[i].is_root).collect();

    let mut root_reads: Vec<ResourceBitset> = Vec::with_capacity(root_positions.len());
    let mut root_writes: Vec<ResourceBitset> = Vec::with_capacity(root_positions.len());
    let mut node_root: HashMap<usize, usize> = HashMap::new();

    for (root_key, &root_index) in root_positions.iter().enumerate() {
        let mut accum_reads = nodes[root_index].reads;
        let mut accum_writes = nodes[root_index].writes;
        node_root.insert(root_index, root_key);
        // Walk backwards: any earlier surviving node whose writes
        // intersect the accumulated reads joins this root's tree.
        for &i in surviving_indices.iter().rev() {
            if i >= root_index {
                continue;
            }
            if nodes[i].writes.intersects(accum_reads) {
                accum_reads = accum_reads.union(nodes[i].reads);
                accum_writes = accum_writes.union(nodes[i].writes);
                node_root.entry(i).or_insert(root_key);
            }
        }
        root_reads.push(accum_reads);
        root_writes.push(accum_writes);
    }

    // Union-find over root indices, merging any pair whose accumulated
    // reads/writes cross-intersect.
    let mut parent: Vec<usize> = (0..root_positions.len()).collect();
    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }
    for a in 0..root_positions.len() {
        for b in (a + 1)..root_positions.len() {
            if root_reads[a].intersects(root_writes[b]) || root_reads[b].intersects(root_writes[a]) {
                let ra = find(&mut parent, a);
                let rb = find(&mut parent, b);
                if ra != rb {
                    parent[ra] = rb;
                }
            }
        }
    }

    let mut mask_by_root: HashMap<usize, SubgraphMask> = HashMap::new();
    for (position, &node_index) in surviving_indices.iter().enumerate() {
        let root_key = match node_root.get(&node_index) {
            Some(&k) => k,
            // A surviving pass not claimed by any root's backward walk
            // (shouldn't happen given pruning, but fail safe into its own
            // singleton subgraph rather than panicking).
            None => continue,
        };
        let merged_root = find(&mut parent, root_key);
        mask_by_root.entry(merged_root).or_insert_with(SubgraphMask::default).0 |= 1u64 << position;
    }

    let subgraphs: Vec<SubgraphMask> = mask_by_root.into_values().collect();

    let resolved_passes: Vec<RenderPass> = surviving_indices.into_iter().map(|i| nodes[i].pass.share()).collect();

    if settings().take_dot_file_request() {
        emit_dot_file(&resolved_passes, &subgraphs);
    }

    Ok(ResolvedGraph { passes: resolved_passes, subgraphs })
}

static DOT_FILE_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Writes a `graph_<n>.dot` alongside the process, grouping passes into
/// their isolated subgraphs as GraphViz clusters. Best-effort: a write
/// failure is logged and swallowed, since this is a debugging aid, not
/// part of frame submission.
fn emit_dot_file(passes: &[RenderPass], subgraphs: &[SubgraphMask]) {
    use std::fmt::Write as _;

    let n = DOT_FILE_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut dot = String::new();
    let _ = writeln!(dot, "digraph rendergraph_{} {{", n);
    for (cluster_index, mask) in subgraphs.iter().enumerate() {
        let _ = writeln!(dot, "  subgraph cluster_{} {{", cluster_index);
        for (position, pass) in passes.iter().enumerate() {
            if mask.contains(position) {
                let _ = writeln!(dot, "    \"{}\";", pass.data().name);
            }
        }
        let _ = writeln!(dot, "  }}");
    }
    let _ = writeln!(dot, "}}");

    let path = format!("graph_{}.dot", n);
    if let Err(e) = std::fs::write(&path, dot) {
        log::warn!("failed to write rendergraph dot file {}: {}", path, e);
    }
}

/// Runs [`resolve`] and then patches every surviving graphics pass's
/// zero extent from the swapchain's current size.
pub fn resolve_and_patch(passes: Vec<RenderPass>, swapchain_extent: (u32, u32)) -> Result<ResolvedGraph> {
    let resolved = resolve(passes)?;
    for pass in &resolved.passes {
        if pass.data().framebuffer_settings().is_some() {
            pass.data_mut().patch_extent(swapchain_extent)?;
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{buffer_resource, image_resource};
    use crate::pass::QueueKind;
    use ash::vk;

    fn pass_reading_writing(name: &str, reads: &[ResourceHandle], writes: &[ResourceHandle], is_root: bool) -> RenderPass {
        let pass = RenderPass::new(name, QueueKind::Graphics).set_is_root(is_root);
        for r in reads {
            pass.data_mut().use_resource(*r, vk::AccessFlags::SHADER_READ);
        }
        for w in writes {
            pass.data_mut().use_resource(*w, vk::AccessFlags::SHADER_WRITE);
        }
        pass
    }

    #[test]
    fn pruning_drops_the_unused_writer() {
        let x = buffer_resource("X");
        let y = buffer_resource("Y");
        let swapchain = ResourceHandle::swapchain_image("present");

        let a = pass_reading_writing("A", &[], &[x], false);
        let b = pass_reading_writing("B", &[], &[y], false);
        let c = pass_reading_writing("C", &[y], &[swapchain], false);

        let resolved = resolve(vec![a, b, c]).unwrap();
        let names: Vec<String> = resolved.passes.iter().map(|p| p.data().name.clone()).collect();
        assert_eq!(names, vec!["B", "C"]);
        assert_eq!(resolved.subgraphs.len(), 1);
    }

    #[test]
    fn two_roots_are_isolated_subgraphs() {
        let u = image_resource("U");
        let v = image_resource("V");
        let p1 = pass_reading_writing("P1", &[], &[u], true);
        let p2 = pass_reading_writing("P2", &[], &[v], true);

        let resolved = resolve(vec![p1, p2]).unwrap();
        assert_eq!(resolved.passes.len(), 2);
        assert_eq!(resolved.subgraphs.len(), 2);
    }

    #[test]
    fn two_roots_sharing_a_dependency_merge() {
        let b = buffer_resource("B");
        let x = image_resource("X");
        let y = image_resource("Y");

        let p0 = pass_reading_writing("P0", &[], &[b], false);
        let p1 = pass_reading_writing("P1", &[b], &[x], true);
        let p2 = pass_reading_writing("P2", &[b], &[y], true);

        let resolved = resolve(vec![p0, p1, p2]).unwrap();
        assert_eq!(resolved.passes.len(), 3);
        assert_eq!(resolved.subgraphs.len(), 1, "shared read of B should merge both roots into one subgraph");
    }

    #[test]
    fn too_many_distinct_resources_is_reported_not_truncated() {
        let mut passes = Vec::new();
        for i in 0..(MAX_RESOURCES + 1) {
            let handle = buffer_resource(&format!("r{}", i));
            passes.push(pass_reading_writing(&format!("pass{}", i), &[], &[handle], true));
        }
        assert!(resolve(passes).is_err());
    }
}
