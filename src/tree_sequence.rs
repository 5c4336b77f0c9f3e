// Dumped tree sequence tables and snapshot persistence
//
// Tables are the durable form of the builder state: written as checkpoint
// artifacts during ancestor matching, as the hand-off between the ancestor
// and sample phases, and as the final output. Coordinates stay on the site
// axis; the sites table carries the physical positions. Mutation derived
// states are stored as ASCII digits and decoded back to allele codes on
// restore.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeweaveError};
use crate::tree_sequence_builder::{TreeSequenceBuilder, NODE_IS_SAMPLE};

/// Columnar node/edge/site/mutation tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeSequenceTables {
    pub sequence_length: f64,
    pub nodes_flags: Vec<u32>,
    pub nodes_time: Vec<f64>,
    pub edges_left: Vec<u32>,
    pub edges_right: Vec<u32>,
    pub edges_parent: Vec<i32>,
    pub edges_child: Vec<i32>,
    pub sites_position: Vec<f64>,
    /// ASCII-encoded states, parallel to the mutation columns.
    pub mutations_site: Vec<u32>,
    pub mutations_node: Vec<i32>,
    pub mutations_derived_state: Vec<u8>,
    pub mutations_parent: Vec<i32>,
}

impl TreeSequenceTables {
    pub fn num_nodes(&self) -> usize {
        self.nodes_time.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges_left.len()
    }

    pub fn num_sites(&self) -> usize {
        self.sites_position.len()
    }

    pub fn num_mutations(&self) -> usize {
        self.mutations_site.len()
    }

    /// Dump the builder's current state.
    pub fn from_builder(builder: &TreeSequenceBuilder) -> Self {
        let (nodes_flags, nodes_time) = builder.dump_nodes();
        let (edges_left, edges_right, edges_parent, edges_child) = builder.dump_edges();
        let (mutations_site, mutations_node, derived, mutations_parent) = builder.dump_mutations();
        Self {
            sequence_length: builder.sequence_length(),
            nodes_flags,
            nodes_time,
            edges_left,
            edges_right,
            edges_parent,
            edges_child,
            sites_position: builder.positions().to_vec(),
            mutations_site,
            mutations_node,
            mutations_derived_state: derived.iter().map(|a| a + b'0').collect(),
            mutations_parent,
        }
    }

    /// Rebuild builder state from these tables. Derived states are decoded
    /// from ASCII back to allele codes.
    pub fn restore_into(&self, builder: &mut TreeSequenceBuilder) -> Result<()> {
        if builder.num_sites() != self.num_sites() {
            return Err(TreeweaveError::inconsistent(format!(
                "restored tables have {} sites, builder expects {}",
                self.num_sites(),
                builder.num_sites()
            )));
        }
        builder.restore_nodes(&self.nodes_time, &self.nodes_flags)?;
        builder.restore_edges(
            &self.edges_left,
            &self.edges_right,
            &self.edges_parent,
            &self.edges_child,
        )?;
        let alleles: Vec<u8> = self
            .mutations_derived_state
            .iter()
            .map(|c| c.wrapping_sub(b'0'))
            .collect();
        builder.restore_mutations(&self.mutations_site, &self.mutations_node, &alleles);
        log::info!(
            "restored {} nodes; {} edges; {} sites; {} mutations",
            self.num_nodes(),
            self.num_edges(),
            self.num_sites(),
            self.num_mutations()
        );
        Ok(())
    }

    /// Serialize to `path`, writing through a tempfile in the same
    /// directory and renaming into place so a checkpoint is never observed
    /// half-written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let encoded = bincode::serialize(self).map_err(|e| TreeweaveError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tmp.write_all(&encoded)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| TreeweaveError::Io(e.error))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        bincode::deserialize(&bytes).map_err(|e| TreeweaveError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Reduce the tables to the lineage of the given samples: nodes
    /// reachable from a sample by following child-to-parent edges are
    /// retained and renumbered (order preserved); edges and mutations
    /// referencing dropped nodes are removed. Sample nodes keep the sample
    /// flag, interior nodes lose it.
    pub fn simplify(&self, samples: &[i32]) -> TreeSequenceTables {
        let num_nodes = self.num_nodes();
        let mut reachable = vec![false; num_nodes];
        let mut stack: Vec<i32> = samples.to_vec();
        while let Some(u) = stack.pop() {
            if reachable[u as usize] {
                continue;
            }
            reachable[u as usize] = true;
            for j in 0..self.num_edges() {
                if self.edges_child[j] == u && !reachable[self.edges_parent[j] as usize] {
                    stack.push(self.edges_parent[j]);
                }
            }
        }

        let mut node_map = vec![-1i32; num_nodes];
        let mut nodes_flags = Vec::new();
        let mut nodes_time = Vec::new();
        let is_sample: Vec<bool> = {
            let mut v = vec![false; num_nodes];
            for &s in samples {
                v[s as usize] = true;
            }
            v
        };
        for u in 0..num_nodes {
            if reachable[u] {
                node_map[u] = nodes_time.len() as i32;
                nodes_flags.push(if is_sample[u] { NODE_IS_SAMPLE } else { 0 });
                nodes_time.push(self.nodes_time[u]);
            }
        }

        let mut edges_left = Vec::new();
        let mut edges_right = Vec::new();
        let mut edges_parent = Vec::new();
        let mut edges_child = Vec::new();
        for j in 0..self.num_edges() {
            let p = self.edges_parent[j] as usize;
            let c = self.edges_child[j] as usize;
            if reachable[p] && reachable[c] {
                edges_left.push(self.edges_left[j]);
                edges_right.push(self.edges_right[j]);
                edges_parent.push(node_map[p]);
                edges_child.push(node_map[c]);
            }
        }

        let mut mutations_site = Vec::new();
        let mut mutations_node = Vec::new();
        let mut mutations_derived_state = Vec::new();
        let mut mutations_parent = Vec::new();
        let mut mutation_map = vec![-1i32; self.num_mutations()];
        for j in 0..self.num_mutations() {
            let u = self.mutations_node[j] as usize;
            if reachable[u] {
                mutation_map[j] = mutations_site.len() as i32;
                mutations_site.push(self.mutations_site[j]);
                mutations_node.push(node_map[u]);
                mutations_derived_state.push(self.mutations_derived_state[j]);
                let old_parent = self.mutations_parent[j];
                mutations_parent.push(if old_parent < 0 {
                    -1
                } else {
                    mutation_map[old_parent as usize]
                });
            }
        }

        TreeSequenceTables {
            sequence_length: self.sequence_length,
            nodes_flags,
            nodes_time,
            edges_left,
            edges_right,
            edges_parent,
            edges_child,
            sites_position: self.sites_position.clone(),
            mutations_site,
            mutations_node,
            mutations_derived_state,
            mutations_parent,
        }
    }
}
