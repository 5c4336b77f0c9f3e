// Matching orchestrator base
//
// Owns the shared tree sequence builder and the per-thread worker slots,
// and provides the pipeline plumbing both schedulers run on: a bounded
// work queue feeding a fixed pool of persistent worker threads, with
// per-item completion acknowledgements forming the epoch barrier.
//
// Phase discipline is the whole concurrency model. During matching,
// workers hold read locks on the builder and exclusive (uncontended)
// locks on their own slot; the builder is only written during the
// single-threaded commit phase, strictly between barriers. A worker that
// fails, or dies mid-item, reports through the acknowledgement channel so
// the barrier wait can never hang.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{Result, TreeweaveError};
use crate::matcher::{PathSegment, TreeMatcher};
use crate::result_buffer::ResultBuffer;
use crate::tree_sequence::TreeSequenceTables;
use crate::tree_sequence_builder::TreeSequenceBuilder;
use crate::UNKNOWN_ALLELE;

// Initial builder capacity; doubles as needed and is quickly big enough
// even for very large instances.
const INITIAL_MAX_NODES: usize = 64 * 1024;
const INITIAL_MAX_EDGES: usize = 64 * 1024;

// Bounded queue depth per worker thread; producers block when the queue
// fills, throttling dispatch to worker throughput.
const QUEUE_DEPTH_PER_THREAD: usize = 8;

/// Thread-local matching state: everything one worker touches during a
/// match, so no item needs a lock shared with another worker.
pub(crate) struct WorkerSlot {
    pub(crate) matcher: TreeMatcher,
    pub(crate) results: ResultBuffer,
    pub(crate) match_scratch: Vec<u8>,
    pub(crate) traceback_size_sum: f64,
    pub(crate) num_matches: u64,
}

impl WorkerSlot {
    fn new(error_probability: f64, num_sites: usize) -> Self {
        Self {
            matcher: TreeMatcher::new(error_probability),
            results: ResultBuffer::new(),
            match_scratch: vec![0u8; num_sites],
            traceback_size_sum: 0.0,
            num_matches: 0,
        }
    }

    pub(crate) fn reset_stats(&mut self) {
        self.traceback_size_sum = 0.0;
        self.num_matches = 0;
    }
}

/// One haplotype to match: an ancestor (with focal sites and a restricted
/// span) or a sample (full span, residual mismatches become mutations).
pub(crate) struct WorkItem {
    pub(crate) node_id: i32,
    pub(crate) haplotype: Vec<u8>,
    pub(crate) start: u32,
    pub(crate) end: u32,
    pub(crate) kind: WorkKind,
}

pub(crate) enum WorkKind {
    Ancestor { focal_sites: Vec<u32> },
    Sample,
}

#[derive(Clone)]
pub struct MatchOrchestrator {
    builder: Arc<RwLock<TreeSequenceBuilder>>,
    slots: Arc<Vec<Mutex<WorkerSlot>>>,
    num_threads: usize,
    num_sites: usize,
    traceback_file_pattern: Option<String>,
}

impl MatchOrchestrator {
    pub fn new(
        sequence_length: f64,
        positions: &[f64],
        recombination_rate: &[f64],
        error_probability: f64,
        num_threads: usize,
        traceback_file_pattern: Option<String>,
    ) -> Result<Self> {
        let num_sites = positions.len();
        let builder = TreeSequenceBuilder::new(
            sequence_length,
            positions.to_vec(),
            recombination_rate.to_vec(),
            INITIAL_MAX_NODES,
            INITIAL_MAX_EDGES,
        )?;
        log::debug!(
            "allocated tree sequence builder with max_nodes={INITIAL_MAX_NODES} \
             max_edges={INITIAL_MAX_EDGES}"
        );
        let num_slots = num_threads.max(1);
        let slots = (0..num_slots)
            .map(|_| Mutex::new(WorkerSlot::new(error_probability, num_sites)))
            .collect();
        log::info!("setting match error probability to {error_probability}");
        Ok(Self {
            builder: Arc::new(RwLock::new(builder)),
            slots: Arc::new(slots),
            num_threads,
            num_sites,
            traceback_file_pattern,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn builder(&self) -> &Arc<RwLock<TreeSequenceBuilder>> {
        &self.builder
    }

    pub(crate) fn lock_slot(&self, thread_index: usize) -> MutexGuard<'_, WorkerSlot> {
        self.slots[thread_index]
            .lock()
            .expect("worker slot poisoned")
    }

    /// Match one haplotype and record the resulting edges in the slot's
    /// buffer. The only synchronization here is the slot's own mutex
    /// (uncontended by construction) and a builder read lock.
    pub(crate) fn find_path(
        &self,
        child_id: i32,
        haplotype: &[u8],
        start: u32,
        end: u32,
        thread_index: usize,
    ) -> Result<Vec<PathSegment>> {
        let mut slot = self.lock_slot(thread_index);
        let slot = &mut *slot;
        let builder = self.builder.read().expect("builder lock poisoned");
        let segments =
            slot.matcher
                .find_path(&builder, haplotype, start, end, &mut slot.match_scratch);
        drop(builder);

        let left: Vec<u32> = segments.iter().map(|s| s.left).collect();
        let right: Vec<u32> = segments.iter().map(|s| s.right).collect();
        let parent: Vec<i32> = segments.iter().map(|s| s.parent).collect();
        slot.results.add_edges(&left, &right, &parent, child_id);
        slot.traceback_size_sum += slot.matcher.mean_traceback_size();
        slot.num_matches += 1;
        log::debug!(
            "matched node {child_id}; num_edges={} tb_size={:.2} match_mem={}B",
            segments.len(),
            slot.matcher.mean_traceback_size(),
            slot.matcher.total_memory()
        );
        if let Some(ref pattern) = self.traceback_file_pattern {
            self.dump_traceback(pattern, child_id, haplotype, start, end, &segments)?;
        }
        Ok(segments)
    }

    /// Process one work item on the given slot.
    pub(crate) fn process_work_item(&self, item: &mut WorkItem, thread_index: usize) -> Result<()> {
        match item.kind {
            WorkKind::Ancestor { ref focal_sites } => {
                {
                    let mut slot = self.lock_slot(thread_index);
                    slot.results.add_mutations(focal_sites, item.node_id, None);
                }
                debug_assert!(item.haplotype[..item.start as usize]
                    .iter()
                    .all(|&a| a == UNKNOWN_ALLELE));
                debug_assert!(item.haplotype[item.end as usize..]
                    .iter()
                    .all(|&a| a == UNKNOWN_ALLELE));
                debug_assert!(focal_sites.iter().all(|&s| item.haplotype[s as usize] == 1));
                log::debug!(
                    "finding path for node {}; start={} end={} num_focal_sites={}",
                    item.node_id,
                    item.start,
                    item.end,
                    focal_sites.len()
                );
                self.find_path(item.node_id, &item.haplotype, item.start, item.end, thread_index)?;
                // Reset the forced focal sites so the copied haplotype is
                // comparable to the match and the recorded mutations carry
                // the information.
                for &s in focal_sites {
                    item.haplotype[s as usize] = 0;
                }
                Ok(())
            }
            WorkKind::Sample => {
                self.find_path(item.node_id, &item.haplotype, item.start, item.end, thread_index)?;
                let mut slot = self.lock_slot(thread_index);
                let slot = &mut *slot;
                let mut diff_sites = Vec::new();
                let mut derived = Vec::new();
                for t in item.start..item.end {
                    let observed = item.haplotype[t as usize];
                    if observed != slot.match_scratch[t as usize] {
                        diff_sites.push(t);
                        derived.push(observed);
                    }
                }
                slot.results
                    .add_mutations(&diff_sites, item.node_id, Some(&derived));
                Ok(())
            }
        }
    }

    fn dump_traceback(
        &self,
        pattern: &str,
        child_id: i32,
        haplotype: &[u8],
        start: u32,
        end: u32,
        segments: &[PathSegment],
    ) -> Result<()> {
        let filename = pattern.replace("{}", &child_id.to_string());
        let mut f = std::fs::File::create(&filename)?;
        writeln!(f, "node\t{child_id}")?;
        writeln!(f, "span\t{start}\t{end}")?;
        let hap: String = haplotype
            .iter()
            .map(|&a| if a == UNKNOWN_ALLELE { '.' } else { (b'0' + a) as char })
            .collect();
        writeln!(f, "haplotype\t{hap}")?;
        for s in segments {
            writeln!(f, "edge\t{}\t{}\t{}", s.left, s.right, s.parent)?;
        }
        log::debug!("dumped traceback debug to {filename}");
        Ok(())
    }

    /// Rebuild builder state from dumped tables; fails eagerly if the
    /// tables disagree with this orchestrator's site axis.
    pub fn restore(&self, tables: &TreeSequenceTables) -> Result<()> {
        let mut builder = self.builder.write().expect("builder lock poisoned");
        tables.restore_into(&mut builder)
    }

    /// Dump the builder's current state.
    pub fn tables(&self) -> TreeSequenceTables {
        let builder = self.builder.read().expect("builder lock poisoned");
        TreeSequenceTables::from_builder(&builder)
    }

    /// Spawn the persistent worker pool, or None in sequential mode.
    pub(crate) fn spawn_pool(&self) -> Option<MatcherPool> {
        if self.num_threads <= 1 {
            return None;
        }
        Some(MatcherPool::spawn(self.clone()))
    }
}

/// Acknowledgement of one completed work item.
type Ack = std::result::Result<(), TreeweaveError>;

/// Fixed pool of persistent worker threads consuming a bounded queue.
/// Workers live across epochs; the pool is torn down once, by dropping
/// the work sender and joining.
pub(crate) struct MatcherPool {
    work_tx: Option<Sender<WorkItem>>,
    ack_rx: Receiver<Ack>,
    handles: Vec<JoinHandle<()>>,
}

impl MatcherPool {
    fn spawn(orchestrator: MatchOrchestrator) -> Self {
        let num_threads = orchestrator.num_threads;
        let (work_tx, work_rx) = bounded::<WorkItem>(QUEUE_DEPTH_PER_THREAD * num_threads);
        let (ack_tx, ack_rx) = unbounded::<Ack>();
        let handles = (0..num_threads)
            .map(|thread_index| {
                let orchestrator = orchestrator.clone();
                let work_rx = work_rx.clone();
                let ack_tx = ack_tx.clone();
                thread::Builder::new()
                    .name(format!("match-worker-{thread_index}"))
                    .spawn(move || worker_loop(orchestrator, work_rx, ack_tx, thread_index))
                    .expect("failed to spawn match worker")
            })
            .collect();
        log::info!("started {num_threads} match worker threads");
        Self {
            work_tx: Some(work_tx),
            ack_rx,
            handles,
        }
    }

    /// Enqueue one item; blocks while the queue is full.
    pub(crate) fn dispatch(&self, item: WorkItem) -> Result<()> {
        self.work_tx
            .as_ref()
            .expect("pool already shut down")
            .send(item)
            .map_err(|_| TreeweaveError::worker(0, "all match workers exited"))
    }

    /// Epoch barrier: wait for `count` acknowledgements. The first failed
    /// acknowledgement aborts the wait (remaining in-flight items finish
    /// on their own and are discarded with the pool).
    pub(crate) fn wait(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            match self.ack_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(TreeweaveError::worker(
                        0,
                        "match workers exited before completing the epoch",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Shut the pool down: close the queue and join every worker.
    pub(crate) fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.work_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        log::debug!("match worker pool shut down");
    }
}

impl Drop for MatcherPool {
    // An aborted run drains the queue and joins the workers rather than
    // leaking threads holding the shared builder.
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.teardown();
        }
    }
}

fn worker_loop(
    orchestrator: MatchOrchestrator,
    work_rx: Receiver<WorkItem>,
    ack_tx: Sender<Ack>,
    thread_index: usize,
) {
    while let Ok(mut item) = work_rx.recv() {
        let guard = AckGuard {
            ack_tx: &ack_tx,
            thread_index,
            armed: true,
        };
        let result = orchestrator.process_work_item(&mut item, thread_index);
        guard.complete(result);
    }
    log::debug!("match-worker-{thread_index} exiting");
}

/// Guarantees exactly one acknowledgement per work item: if the match
/// panics, the drop handler reports a worker failure instead of leaving
/// the barrier waiting forever.
struct AckGuard<'a> {
    ack_tx: &'a Sender<Ack>,
    thread_index: usize,
    armed: bool,
}

impl AckGuard<'_> {
    fn complete(mut self, result: Result<()>) {
        self.armed = false;
        let ack = result.map_err(|e| TreeweaveError::worker(self.thread_index, e.to_string()));
        let _ = self.ack_tx.send(ack);
    }
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.ack_tx.send(Err(TreeweaveError::worker(
                self.thread_index,
                "worker panicked during match",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator(num_sites: usize, num_threads: usize) -> MatchOrchestrator {
        let positions: Vec<f64> = (0..num_sites).map(|j| j as f64).collect();
        let rates = vec![0.05; num_sites];
        MatchOrchestrator::new(num_sites as f64, &positions, &rates, 1e-3, num_threads, None)
            .unwrap()
    }

    #[test]
    fn find_path_appends_to_slot_buffer() {
        let orch = orchestrator(4, 0);
        {
            let mut builder = orch.builder().write().unwrap();
            builder.add_node(2.0, 0).unwrap();
        }
        let hap = vec![0, 0, 0, 0];
        orch.find_path(1, &hap, 0, 4, 0).unwrap();
        let slot = orch.lock_slot(0);
        assert_eq!(slot.results.num_edges(), 1);
        assert_eq!(slot.results.child(), &[1]);
        assert_eq!(slot.num_matches, 1);
    }

    #[test]
    fn sample_item_records_residual_mutations() {
        let orch = orchestrator(4, 0);
        {
            let mut builder = orch.builder().write().unwrap();
            builder.add_node(2.0, 0).unwrap();
        }
        let mut item = WorkItem {
            node_id: 1,
            haplotype: vec![0, 1, 0, 1],
            start: 0,
            end: 4,
            kind: WorkKind::Sample,
        };
        orch.process_work_item(&mut item, 0).unwrap();
        let slot = orch.lock_slot(0);
        // the root panel is all ancestral, both 1s are residual mutations
        assert_eq!(slot.results.num_mutations(), 2);
        assert_eq!(slot.results.site(), &[1, 3]);
        assert_eq!(slot.results.derived_state(), &[1, 1]);
    }

    #[test]
    fn ancestor_item_resets_focal_sites() {
        let orch = orchestrator(4, 0);
        {
            let mut builder = orch.builder().write().unwrap();
            builder.add_node(3.0, 0).unwrap();
        }
        let mut item = WorkItem {
            node_id: 1,
            haplotype: vec![0, 1, 0, 0],
            start: 0,
            end: 4,
            kind: WorkKind::Ancestor {
                focal_sites: vec![1],
            },
        };
        orch.process_work_item(&mut item, 0).unwrap();
        assert_eq!(item.haplotype, vec![0, 0, 0, 0]);
        let slot = orch.lock_slot(0);
        assert_eq!(slot.results.num_mutations(), 1);
        assert_eq!(slot.results.site(), &[1]);
        assert_eq!(slot.results.node(), &[1]);
        // the copied haplotype reads ancestral at the focal site; only the
        // recorded mutation carries the derived state
        assert_eq!(slot.match_scratch[1], 0);
    }

    #[test]
    fn worker_panic_surfaces_as_failure_not_deadlock() {
        let orch = orchestrator(4, 2);
        {
            let mut builder = orch.builder().write().unwrap();
            builder.add_node(2.0, 0).unwrap();
        }
        let pool = orch.spawn_pool().unwrap();
        // an empty span trips the matcher's assertion inside the worker
        pool.dispatch(WorkItem {
            node_id: 1,
            haplotype: vec![0, 0, 0, 0],
            start: 2,
            end: 2,
            kind: WorkKind::Sample,
        })
        .unwrap();
        let err = pool.wait(1).unwrap_err();
        assert!(matches!(err, TreeweaveError::WorkerFailure { .. }));
        pool.shutdown();
    }

    #[test]
    fn pool_barrier_counts_acks() {
        let orch = orchestrator(4, 2);
        {
            let mut builder = orch.builder().write().unwrap();
            builder.add_node(2.0, 0).unwrap();
        }
        let pool = orch.spawn_pool().unwrap();
        for j in 0..8 {
            pool.dispatch(WorkItem {
                node_id: 1 + j,
                haplotype: vec![0, 0, 0, 0],
                start: 0,
                end: 4,
                kind: WorkKind::Sample,
            })
            .unwrap();
        }
        pool.wait(8).unwrap();
        let matches: u64 = (0..orch.num_slots())
            .map(|j| orch.lock_slot(j).num_matches)
            .sum();
        assert_eq!(matches, 8);
        pool.shutdown();
    }
}
