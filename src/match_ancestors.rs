// Ancestor matching: epoch-scheduled growth of the tree sequence
//
// Ancestors arrive oldest first; contiguous runs of equal time form
// epochs. Every ancestor in an epoch is matched independently against the
// structure committed by older epochs, then the whole epoch commits at
// once: one add_path per new node (edges reversed into root-to-leaf
// order), one add_mutations call for the epoch, buffers and statistics
// reset. Nothing of an epoch is visible to matching until the epoch
// barrier has passed, so node ids stay monotonic across epochs and
// matching never observes partially-committed state.
//
// Checkpoints are whole-epoch snapshots written at clean boundaries; a
// resumed run derives its starting epoch from the restored node times and
// continues the haplotype stream from the restored node count.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::ancestor_store::AncestorStore;
use crate::error::{Result, TreeweaveError};
use crate::input_data::InputData;
use crate::matching::{MatchOrchestrator, MatcherPool, WorkItem, WorkKind};
use crate::result_buffer::ResultBuffer;
use crate::tree_sequence::TreeSequenceTables;
use crate::tree_sequence_builder::NODE_IS_SAMPLE;

#[derive(Debug, Clone)]
pub struct MatchAncestorsOptions {
    pub num_threads: usize,
    pub error_probability: f64,
    /// Checkpoint/output target. Required for resume.
    pub output_path: Option<PathBuf>,
    /// Minutes between checkpoints; None disables periodic checkpoints.
    pub checkpoint_interval_mins: Option<f64>,
    pub resume: bool,
    pub traceback_file_pattern: Option<String>,
}

impl Default for MatchAncestorsOptions {
    fn default() -> Self {
        Self {
            num_threads: 0,
            error_probability: 0.0,
            output_path: None,
            checkpoint_interval_mins: None,
            resume: false,
            traceback_file_pattern: None,
        }
    }
}

impl std::fmt::Debug for AncestorScheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AncestorScheduler")
            .field("epoch_slices", &self.epoch_slices)
            .field("start_epoch", &self.start_epoch)
            .field("output_path", &self.output_path)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .finish_non_exhaustive()
    }
}

pub struct AncestorScheduler<'a> {
    orchestrator: MatchOrchestrator,
    store: &'a AncestorStore,
    haplotypes: Box<dyn Iterator<Item = Vec<u8>> + 'a>,
    /// Half-open ancestor-id ranges, one per epoch, oldest first.
    epoch_slices: Vec<(usize, usize)>,
    start_epoch: usize,
    output_path: Option<PathBuf>,
    checkpoint_interval: Option<Duration>,
    last_output_time: Instant,
}

impl<'a> AncestorScheduler<'a> {
    pub fn new(
        input: &InputData,
        store: &'a AncestorStore,
        options: MatchAncestorsOptions,
    ) -> Result<Self> {
        if store.num_sites() != input.num_sites() {
            return Err(TreeweaveError::inconsistent(format!(
                "ancestor store has {} sites, input has {}",
                store.num_sites(),
                input.num_sites()
            )));
        }
        if store.num_ancestors() == 0 {
            return Err(TreeweaveError::config("ancestor store is empty"));
        }
        let orchestrator = MatchOrchestrator::new(
            input.sequence_length(),
            input.position(),
            input.recombination_rate(),
            options.error_probability,
            options.num_threads,
            options.traceback_file_pattern.clone(),
        )?;

        let epoch_slices = epoch_slices(store.time());
        if epoch_slices[0] != (0, 1) {
            return Err(TreeweaveError::config(
                "ancestor store must begin with a unique oldest root ancestor",
            ));
        }

        let (start_epoch, first_ancestor) = if options.resume {
            let path = options.output_path.as_ref().ok_or_else(|| {
                TreeweaveError::config("resume requires an output path to restore from")
            })?;
            log::info!("resuming build from {}", path.display());
            let tables = TreeSequenceTables::load(path)?;
            orchestrator.restore(&tables)?;
            let first_ancestor = tables.num_nodes();
            if first_ancestor == 0 || first_ancestor > store.num_ancestors() {
                return Err(TreeweaveError::inconsistent(format!(
                    "restored tree sequence has {} nodes for {} ancestors",
                    first_ancestor,
                    store.num_ancestors()
                )));
            }
            // The youngest restored node time identifies the newest fully
            // committed epoch; resumption starts at the next one.
            let youngest = tables
                .nodes_time
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            let start_epoch =
                epoch_slices.partition_point(|&(s, _)| store.time()[s] >= youngest);
            if start_epoch < epoch_slices.len() && epoch_slices[start_epoch].0 != first_ancestor {
                return Err(TreeweaveError::inconsistent(format!(
                    "restored node count {} does not sit on an epoch boundary \
                     (expected ancestor {})",
                    first_ancestor, epoch_slices[start_epoch].0
                )));
            }
            log::info!("resuming at epoch {start_epoch} ancestor {first_ancestor}");
            (start_epoch, first_ancestor)
        } else {
            // Insert the oldest ancestor as the root of everything.
            let mut builder = orchestrator.builder().write().expect("builder lock poisoned");
            builder.add_node(store.time()[0], NODE_IS_SAMPLE)?;
            (1, 1)
        };

        Ok(Self {
            orchestrator,
            store,
            haplotypes: Box::new(store.haplotypes_from(first_ancestor)),
            epoch_slices,
            start_epoch,
            output_path: options.output_path,
            checkpoint_interval: options
                .checkpoint_interval_mins
                .map(|mins| Duration::from_secs_f64(mins * 60.0)),
            last_output_time: Instant::now(),
        })
    }

    pub fn num_epochs(&self) -> usize {
        self.epoch_slices.len()
    }

    /// Run all remaining epochs and return the assembled tree sequence,
    /// persisting it to the output path when one is configured.
    pub fn match_ancestors(mut self) -> Result<TreeSequenceTables> {
        log::info!(
            "starting ancestor matching for {} epochs",
            self.num_epochs() - self.start_epoch
        );
        let pool = self.orchestrator.spawn_pool();
        for epoch in self.start_epoch..self.epoch_slices.len() {
            self.match_epoch(epoch, &pool)?;
        }
        if let Some(pool) = pool {
            pool.shutdown();
        }
        let tables = self.store_output()?;
        log::info!("finished ancestor matching");
        Ok(tables)
    }

    /// Dispatch, barrier and commit for a single epoch.
    pub(crate) fn match_epoch(&mut self, epoch: usize, pool: &Option<MatcherPool>) -> Result<()> {
        let (a_start, a_end) = self.epoch_slices[epoch];
        let count = a_end - a_start;
        let current_time = self.store.time()[a_start];
        let node_base = {
            let builder = self
                .orchestrator
                .builder()
                .read()
                .expect("builder lock poisoned");
            log::info!(
                "epoch {epoch}: time={current_time} nanc={count} edges={}",
                builder.num_edges()
            );
            builder.num_nodes() as i32
        };

        // Node ids for the whole epoch are pre-allocated in ancestor order.
        for (offset, ancestor_id) in (a_start..a_end).enumerate() {
            let haplotype = self.haplotypes.next().ok_or_else(|| {
                TreeweaveError::inconsistent("ancestor haplotype stream ended early")
            })?;
            let mut item = WorkItem {
                node_id: node_base + offset as i32,
                haplotype,
                start: self.store.start(ancestor_id),
                end: self.store.end(ancestor_id),
                kind: WorkKind::Ancestor {
                    focal_sites: self.store.focal_sites(ancestor_id).to_vec(),
                },
            };
            match pool {
                Some(pool) => pool.dispatch(item)?,
                None => self.orchestrator.process_work_item(&mut item, 0)?,
            }
        }
        // Barrier: nothing from this epoch commits until every dispatched
        // match has completed.
        if let Some(pool) = pool {
            pool.wait(count)?;
        }
        self.complete_epoch(epoch, node_base, count)
    }

    fn complete_epoch(&mut self, epoch: usize, node_base: i32, count: usize) -> Result<()> {
        let current_time = self.store.time()[self.epoch_slices[epoch].0];

        let mut slots: Vec<_> = (0..self.orchestrator.num_slots())
            .map(|j| self.orchestrator.lock_slot(j))
            .collect();
        let buffers: Vec<&ResultBuffer> = slots.iter().map(|s| &s.results).collect();
        let epoch_results = ResultBuffer::combine(&buffers);

        let traceback_sum: f64 = slots.iter().map(|s| s.traceback_size_sum).sum();
        let num_matches: u64 = slots.iter().map(|s| s.num_matches).sum();

        {
            let mut builder = self
                .orchestrator
                .builder()
                .write()
                .expect("builder lock poisoned");
            for j in 0..count {
                let child = node_base + j as i32;
                let node_id = builder.add_node(current_time, NODE_IS_SAMPLE)?;
                debug_assert_eq!(node_id, child);
                let indices: Vec<usize> = (0..epoch_results.num_edges())
                    .filter(|&k| epoch_results.child()[k] == child)
                    .collect();
                // The matcher emits edges rightmost-first; the builder
                // wants them left-to-right.
                let left: Vec<u32> = indices.iter().rev().map(|&k| epoch_results.left()[k]).collect();
                let right: Vec<u32> =
                    indices.iter().rev().map(|&k| epoch_results.right()[k]).collect();
                let parent: Vec<i32> =
                    indices.iter().rev().map(|&k| epoch_results.parent()[k]).collect();
                builder.add_path(child, &left, &right, &parent)?;
            }
            builder.add_mutations(
                epoch_results.site(),
                epoch_results.node(),
                epoch_results.derived_state(),
            );
            log::debug!(
                "finished epoch time={current_time} with {count} ancestors; \
                 mean_tb_size={:.2} edges={}",
                if num_matches > 0 {
                    traceback_sum / num_matches as f64
                } else {
                    0.0
                },
                builder.num_edges()
            );
        }

        for slot in slots.iter_mut() {
            slot.results.clear();
            slot.reset_stats();
        }
        drop(slots);

        self.maybe_checkpoint()
    }

    fn maybe_checkpoint(&mut self) -> Result<()> {
        let (Some(interval), Some(path)) = (self.checkpoint_interval, self.output_path.as_ref())
        else {
            return Ok(());
        };
        if self.last_output_time.elapsed() >= interval {
            let tables = self.orchestrator.tables();
            tables.save(path)?;
            self.last_output_time = Instant::now();
            log::info!("saved checkpoint {}", path.display());
        }
        Ok(())
    }

    fn store_output(&self) -> Result<TreeSequenceTables> {
        let tables = self.orchestrator.tables();
        if let Some(path) = &self.output_path {
            tables.save(path)?;
            log::info!("saved tree sequence to {}", path.display());
        }
        Ok(tables)
    }
}

/// Partition a non-increasing time array into half-open runs of equal
/// value with a single linear scan. The ranges are contiguous and
/// exhaustive over the ancestor id space.
fn epoch_slices(time: &[f64]) -> Vec<(usize, usize)> {
    let mut slices = Vec::new();
    let mut start = 0;
    for j in 1..time.len() {
        if time[j] != time[j - 1] {
            slices.push((start, j));
            start = j;
        }
    }
    if !time.is_empty() {
        slices.push((start, time.len()));
    }
    slices
}
