// Append-only tree sequence builder
//
// Shared between the matching orchestrator (which commits epochs) and the
// per-thread matchers (which read committed structure while matching).
// Writes happen only in the single-threaded commit phase; reads happen
// concurrently during matching. The orchestrator enforces that phase
// separation with an RwLock around this type.
//
// Node ids are assigned sequentially by add_node and never reused. Edges
// arrive as one add_path call per child, left-to-right, so the flat edge
// table stays grouped by child in id order.

use crate::error::{Result, TreeweaveError};

/// Flag marking a node as a sample in dumped tables.
pub const NODE_IS_SAMPLE: u32 = 1;

#[derive(Debug, Clone, Copy)]
struct NodeRecord {
    time: f64,
    flags: u32,
}

#[derive(Debug, Clone, Copy)]
struct EdgeRecord {
    left: u32,
    right: u32,
    parent: i32,
    child: i32,
}

/// One mutation at a site: the node it is attributed to and the allele it
/// introduces (0 for a reversion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationState {
    pub node: i32,
    pub derived_state: u8,
}

/// Contiguous slice of the flat edge table holding one child's path.
#[derive(Debug, Clone, Copy, Default)]
struct PathRange {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
pub struct TreeSequenceBuilder {
    sequence_length: f64,
    positions: Vec<f64>,
    recombination_rate: Vec<f64>,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    // Per-node range into `edges`; empty for the root and for nodes whose
    // path has not been committed yet.
    paths: Vec<PathRange>,
    // Per-site mutation lists, in commit order within a site.
    mutations: Vec<Vec<MutationState>>,
    num_mutations: usize,
}

impl TreeSequenceBuilder {
    /// Create a builder for `positions.len()` sites with initial capacity
    /// for `max_nodes` nodes and `max_edges` edges. Capacity grows by
    /// doubling on overflow; the initial request fails with
    /// `ResourceExhaustion` rather than aborting when it cannot be
    /// satisfied.
    pub fn new(
        sequence_length: f64,
        positions: Vec<f64>,
        recombination_rate: Vec<f64>,
        max_nodes: usize,
        max_edges: usize,
    ) -> Result<Self> {
        if recombination_rate.len() != positions.len() {
            return Err(TreeweaveError::config(format!(
                "recombination rate array has {} entries for {} sites",
                recombination_rate.len(),
                positions.len()
            )));
        }
        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(max_nodes)
            .map_err(|_| TreeweaveError::ResourceExhaustion {
                what: "nodes",
                requested: max_nodes,
            })?;
        let mut paths = Vec::new();
        paths
            .try_reserve_exact(max_nodes)
            .map_err(|_| TreeweaveError::ResourceExhaustion {
                what: "nodes",
                requested: max_nodes,
            })?;
        let mut edges = Vec::new();
        edges
            .try_reserve_exact(max_edges)
            .map_err(|_| TreeweaveError::ResourceExhaustion {
                what: "edges",
                requested: max_edges,
            })?;
        let num_sites = positions.len();
        Ok(Self {
            sequence_length,
            positions,
            recombination_rate,
            nodes,
            edges,
            paths,
            mutations: vec![Vec::new(); num_sites],
            num_mutations: 0,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_mutations(&self) -> usize {
        self.num_mutations
    }

    pub fn num_sites(&self) -> usize {
        self.positions.len()
    }

    pub fn sequence_length(&self) -> f64 {
        self.sequence_length
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    pub fn recombination_rate(&self) -> &[f64] {
        &self.recombination_rate
    }

    pub fn node_time(&self, node: i32) -> f64 {
        self.nodes[node as usize].time
    }

    fn ensure_node_capacity(&mut self, additional: usize) -> Result<()> {
        let needed = self.nodes.len() + additional;
        if needed > self.nodes.capacity() {
            let target = needed.max(self.nodes.capacity() * 2);
            let grow = target - self.nodes.len();
            self.nodes
                .try_reserve_exact(grow)
                .and_then(|_| self.paths.try_reserve_exact(grow))
                .map_err(|_| TreeweaveError::ResourceExhaustion {
                    what: "nodes",
                    requested: target,
                })?;
        }
        Ok(())
    }

    fn ensure_edge_capacity(&mut self, additional: usize) -> Result<()> {
        let needed = self.edges.len() + additional;
        if needed > self.edges.capacity() {
            let target = needed.max(self.edges.capacity() * 2);
            self.edges
                .try_reserve_exact(target - self.edges.len())
                .map_err(|_| TreeweaveError::ResourceExhaustion {
                    what: "edges",
                    requested: target,
                })?;
        }
        Ok(())
    }

    /// Append a node and return its id. Ids are sequential from zero.
    pub fn add_node(&mut self, time: f64, flags: u32) -> Result<i32> {
        self.ensure_node_capacity(1)?;
        let id = self.nodes.len() as i32;
        self.nodes.push(NodeRecord { time, flags });
        self.paths.push(PathRange::default());
        Ok(id)
    }

    /// Commit the full copying path for one child in a single call.
    /// Edges must be left-ascending, non-empty intervals within the site
    /// axis, and the child must not already have a path.
    pub fn add_path(&mut self, child: i32, left: &[u32], right: &[u32], parent: &[i32]) -> Result<()> {
        let size = left.len();
        assert_eq!(right.len(), size);
        assert_eq!(parent.len(), size);
        let child_ix = child as usize;
        assert!(child_ix < self.nodes.len(), "path for unknown node {child}");
        assert_eq!(self.paths[child_ix].len, 0, "node {child} already has a path");
        let num_sites = self.num_sites() as u32;
        for j in 0..size {
            assert!(left[j] < right[j], "empty edge interval for node {child}");
            assert!(right[j] <= num_sites, "edge beyond site axis for node {child}");
            if j > 0 {
                assert!(left[j] >= right[j - 1], "unordered path for node {child}");
            }
        }
        self.ensure_edge_capacity(size)?;
        let offset = self.edges.len();
        for j in 0..size {
            self.edges.push(EdgeRecord {
                left: left[j],
                right: right[j],
                parent: parent[j],
                child,
            });
        }
        self.paths[child_ix] = PathRange { offset, len: size };
        Ok(())
    }

    /// Bulk-insert mutations. Sites and nodes are parallel arrays; derived
    /// states are allele codes (0 for a reversion).
    pub fn add_mutations(&mut self, site: &[u32], node: &[i32], derived_state: &[u8]) {
        let size = site.len();
        assert_eq!(node.len(), size);
        assert_eq!(derived_state.len(), size);
        for j in 0..size {
            let s = site[j] as usize;
            assert!(s < self.mutations.len(), "mutation at unknown site {s}");
            self.mutations[s].push(MutationState {
                node: node[j],
                derived_state: derived_state[j],
            });
        }
        self.num_mutations += size;
    }

    /// Parent of `node` at `site`, following the committed copying path.
    /// None for the root and for nodes without a committed path covering
    /// the site.
    pub fn parent_at(&self, node: i32, site: u32) -> Option<i32> {
        let range = self.paths[node as usize];
        if range.len == 0 {
            return None;
        }
        let edges = &self.edges[range.offset..range.offset + range.len];
        // Edges are left-ascending and non-overlapping; binary search the
        // last edge starting at or before the site.
        let ix = edges.partition_point(|e| e.left <= site);
        if ix == 0 {
            return None;
        }
        let edge = edges[ix - 1];
        (site < edge.right).then_some(edge.parent)
    }

    /// Mutations at a site as (node, derived_state) pairs in commit order.
    pub fn mutations_at(&self, site: u32) -> &[MutationState] {
        &self.mutations[site as usize]
    }

    /// True if any mutation has been committed at the site.
    pub fn site_has_mutation(&self, site: u32) -> bool {
        !self.mutations[site as usize].is_empty()
    }

    /// Allele carried by `node` at `site`: the derived state of the nearest
    /// mutation on the path from the node to the root, ancestral (0)
    /// otherwise.
    pub fn allele_at(&self, node: i32, site: u32) -> u8 {
        let mutations = &self.mutations[site as usize];
        if mutations.is_empty() {
            return 0;
        }
        let mut current = Some(node);
        while let Some(u) = current {
            if let Some(record) = mutations.iter().find(|m| m.node == u) {
                return record.derived_state;
            }
            current = self.parent_at(u, site);
        }
        0
    }

    // -- dump/restore -----------------------------------------------------

    /// Dump node columns as (flags, time).
    pub fn dump_nodes(&self) -> (Vec<u32>, Vec<f64>) {
        let flags = self.nodes.iter().map(|n| n.flags).collect();
        let time = self.nodes.iter().map(|n| n.time).collect();
        (flags, time)
    }

    /// Dump edge columns as (left, right, parent, child), grouped by child
    /// in id order.
    pub fn dump_edges(&self) -> (Vec<u32>, Vec<u32>, Vec<i32>, Vec<i32>) {
        let mut left = Vec::with_capacity(self.edges.len());
        let mut right = Vec::with_capacity(self.edges.len());
        let mut parent = Vec::with_capacity(self.edges.len());
        let mut child = Vec::with_capacity(self.edges.len());
        for range in &self.paths {
            for e in &self.edges[range.offset..range.offset + range.len] {
                left.push(e.left);
                right.push(e.right);
                parent.push(e.parent);
                child.push(e.child);
            }
        }
        (left, right, parent, child)
    }

    /// Dump mutation columns as (site, node, derived_state, parent), in
    /// site order. The parent column points at the previous mutation at the
    /// same site, -1 for the first.
    pub fn dump_mutations(&self) -> (Vec<u32>, Vec<i32>, Vec<u8>, Vec<i32>) {
        let mut site = Vec::with_capacity(self.num_mutations);
        let mut node = Vec::with_capacity(self.num_mutations);
        let mut derived_state = Vec::with_capacity(self.num_mutations);
        let mut parent = Vec::with_capacity(self.num_mutations);
        for (s, records) in self.mutations.iter().enumerate() {
            let first = site.len() as i32;
            for (k, m) in records.iter().enumerate() {
                site.push(s as u32);
                node.push(m.node);
                derived_state.push(m.derived_state);
                parent.push(if k == 0 { -1 } else { first + k as i32 - 1 });
            }
        }
        (site, node, derived_state, parent)
    }

    /// Restore node columns into an empty builder.
    pub fn restore_nodes(&mut self, time: &[f64], flags: &[u32]) -> Result<()> {
        assert!(self.nodes.is_empty(), "restore into a non-empty builder");
        assert_eq!(time.len(), flags.len());
        self.ensure_node_capacity(time.len())?;
        for j in 0..time.len() {
            self.nodes.push(NodeRecord {
                time: time[j],
                flags: flags[j],
            });
            self.paths.push(PathRange::default());
        }
        Ok(())
    }

    /// Restore edge columns. Edges must be grouped by child; each child's
    /// group becomes its committed path.
    pub fn restore_edges(
        &mut self,
        left: &[u32],
        right: &[u32],
        parent: &[i32],
        child: &[i32],
    ) -> Result<()> {
        assert!(self.edges.is_empty(), "restore into a non-empty builder");
        let size = left.len();
        assert_eq!(right.len(), size);
        assert_eq!(parent.len(), size);
        assert_eq!(child.len(), size);
        let mut j = 0;
        while j < size {
            let c = child[j];
            let start = j;
            while j < size && child[j] == c {
                j += 1;
            }
            if self.paths[c as usize].len != 0 {
                return Err(TreeweaveError::inconsistent(format!(
                    "edges for node {c} are not contiguous in restored table"
                )));
            }
            self.add_path(c, &left[start..j], &right[start..j], &parent[start..j])?;
        }
        Ok(())
    }

    /// Restore mutation columns. Derived states arrive as allele codes;
    /// the parent column is recomputed on the next dump.
    pub fn restore_mutations(&mut self, site: &[u32], node: &[i32], derived_state: &[u8]) {
        assert!(self.num_mutations == 0, "restore into a non-empty builder");
        self.add_mutations(site, node, derived_state);
    }
}
