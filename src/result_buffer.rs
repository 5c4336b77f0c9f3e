// Columnar result batches for the matching pipeline
//
// One ResultBuffer per worker slot collects the edges and mutations
// produced by that worker's matches within an epoch. Buffers are merged
// with `combine` once per epoch and cleared (capacity retained) for the
// next one. Edges and mutations grow independently so a mutation-heavy
// epoch does not over-allocate edge columns.

/// Default growth chunk, in records.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Growable columnar batch of edge and mutation records.
#[derive(Debug)]
pub struct ResultBuffer {
    chunk_size: usize,
    // edges
    left: Vec<u32>,
    right: Vec<u32>,
    parent: Vec<i32>,
    child: Vec<i32>,
    // mutations
    site: Vec<u32>,
    node: Vec<i32>,
    derived_state: Vec<u8>,
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create a buffer whose columns grow in units of `chunk_size` records.
    ///
    /// # Panics
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be > 0");
        Self {
            chunk_size,
            left: Vec::with_capacity(chunk_size),
            right: Vec::with_capacity(chunk_size),
            parent: Vec::with_capacity(chunk_size),
            child: Vec::with_capacity(chunk_size),
            site: Vec::with_capacity(chunk_size),
            node: Vec::with_capacity(chunk_size),
            derived_state: Vec::with_capacity(chunk_size),
        }
    }

    pub fn num_edges(&self) -> usize {
        self.left.len()
    }

    pub fn num_mutations(&self) -> usize {
        self.site.len()
    }

    pub fn left(&self) -> &[u32] {
        &self.left
    }

    pub fn right(&self) -> &[u32] {
        &self.right
    }

    pub fn parent(&self) -> &[i32] {
        &self.parent
    }

    pub fn child(&self) -> &[i32] {
        &self.child
    }

    pub fn site(&self) -> &[u32] {
        &self.site
    }

    pub fn node(&self) -> &[i32] {
        &self.node
    }

    pub fn derived_state(&self) -> &[u8] {
        &self.derived_state
    }

    /// Ensure room for `additional` edge records without reallocating
    /// more than once. Growth is by max(additional, chunk_size).
    fn check_edges_size(&mut self, additional: usize) {
        let spare = self.left.capacity() - self.left.len();
        if additional > spare {
            let grow = additional.max(self.chunk_size);
            self.left.reserve_exact(grow);
            self.right.reserve_exact(grow);
            self.parent.reserve_exact(grow);
            self.child.reserve_exact(grow);
        }
    }

    fn check_mutations_size(&mut self, additional: usize) {
        let spare = self.site.capacity() - self.site.len();
        if additional > spare {
            let grow = additional.max(self.chunk_size);
            self.site.reserve_exact(grow);
            self.node.reserve_exact(grow);
            self.derived_state.reserve_exact(grow);
        }
    }

    /// Append a batch of edges sharing a single child id.
    ///
    /// `left`, `right` and `parent` must have equal lengths; the child id
    /// is broadcast across the batch.
    pub fn add_edges(&mut self, left: &[u32], right: &[u32], parent: &[i32], child: i32) {
        let size = left.len();
        assert_eq!(right.len(), size);
        assert_eq!(parent.len(), size);
        self.check_edges_size(size);
        self.left.extend_from_slice(left);
        self.right.extend_from_slice(right);
        self.parent.extend_from_slice(parent);
        self.child.extend(std::iter::repeat(child).take(size));
    }

    /// Append a batch of mutations attributed to a single node.
    ///
    /// When `derived_state` is `None` every record gets derived state 1
    /// (derived allele present); otherwise it must parallel `site`.
    pub fn add_mutations(&mut self, site: &[u32], node: i32, derived_state: Option<&[u8]>) {
        let size = site.len();
        if let Some(states) = derived_state {
            assert_eq!(states.len(), size);
        }
        self.check_mutations_size(size);
        self.site.extend_from_slice(site);
        self.node.extend(std::iter::repeat(node).take(size));
        match derived_state {
            Some(states) => self.derived_state.extend_from_slice(states),
            None => self.derived_state.extend(std::iter::repeat(1u8).take(size)),
        }
    }

    /// Append a single reversion to the ancestral state.
    pub fn add_back_mutation(&mut self, site: u32, node: i32) {
        self.check_mutations_size(1);
        self.site.push(site);
        self.node.push(node);
        self.derived_state.push(0);
    }

    /// Reset both record counts to zero, retaining backing storage so the
    /// buffer can be reused across epochs without reallocation churn.
    pub fn clear(&mut self) {
        self.left.clear();
        self.right.clear();
        self.parent.clear();
        self.child.clear();
        self.site.clear();
        self.node.clear();
        self.derived_state.clear();
    }

    /// Concatenate the supplied buffers into a new buffer, preserving each
    /// input's internal record order. The edge region is sized to the exact
    /// total; the mutation region reuses the same figure as an upper bound.
    pub fn combine(buffers: &[&ResultBuffer]) -> ResultBuffer {
        let total_edges: usize = buffers.iter().map(|b| b.num_edges()).sum();
        let mut combined = ResultBuffer::with_chunk_size(total_edges.max(1));
        for buffer in buffers {
            combined.check_edges_size(buffer.num_edges());
            combined.left.extend_from_slice(&buffer.left);
            combined.right.extend_from_slice(&buffer.right);
            combined.parent.extend_from_slice(&buffer.parent);
            combined.child.extend_from_slice(&buffer.child);
            combined.check_mutations_size(buffer.num_mutations());
            combined.site.extend_from_slice(&buffer.site);
            combined.node.extend_from_slice(&buffer.node);
            combined
                .derived_state
                .extend_from_slice(&buffer.derived_state);
        }
        combined
    }
}

impl Default for ResultBuffer {
    fn default() -> Self {
        Self::new()
    }
}
