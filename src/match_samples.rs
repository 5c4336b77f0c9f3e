// Sample matching: the final epoch
//
// Matches every real sample haplotype against a finished ancestor tree
// sequence. Samples form a single epoch at time 0: the same dispatch /
// barrier / commit machinery as ancestor matching, but with the full site
// axis as the span and no focal sites. Residual differences between the
// observed haplotype and the matched copy are committed as per-site
// mutations, back mutations included. Finalization optionally reduces the
// tables to the sample lineage.

use crate::error::{Result, TreeweaveError};
use crate::input_data::InputData;
use crate::matching::{MatchOrchestrator, WorkItem, WorkKind};
use crate::result_buffer::ResultBuffer;
use crate::tree_sequence::TreeSequenceTables;
use crate::tree_sequence_builder::NODE_IS_SAMPLE;

#[derive(Debug, Clone, Default)]
pub struct MatchSamplesOptions {
    pub num_threads: usize,
    pub error_probability: f64,
    pub traceback_file_pattern: Option<String>,
}

impl std::fmt::Debug for SampleScheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleScheduler")
            .field("sample_ids", &self.sample_ids)
            .finish_non_exhaustive()
    }
}

pub struct SampleScheduler<'a> {
    orchestrator: MatchOrchestrator,
    input: &'a InputData,
    sample_ids: Vec<i32>,
}

impl<'a> SampleScheduler<'a> {
    pub fn new(
        input: &'a InputData,
        ancestor_tables: &TreeSequenceTables,
        options: MatchSamplesOptions,
    ) -> Result<Self> {
        if ancestor_tables.num_sites() != input.num_sites() {
            return Err(TreeweaveError::inconsistent(format!(
                "ancestor tree sequence has {} sites, input has {}",
                ancestor_tables.num_sites(),
                input.num_sites()
            )));
        }
        if ancestor_tables.num_nodes() == 0 {
            return Err(TreeweaveError::inconsistent(
                "ancestor tree sequence has no nodes",
            ));
        }
        let orchestrator = MatchOrchestrator::new(
            input.sequence_length(),
            input.position(),
            input.recombination_rate(),
            options.error_probability,
            options.num_threads,
            options.traceback_file_pattern,
        )?;
        orchestrator.restore(ancestor_tables)?;

        // Samples occupy one contiguous id block after all ancestor nodes.
        let first = ancestor_tables.num_nodes() as i32;
        let sample_ids: Vec<i32> = (first..first + input.num_samples() as i32).collect();
        Ok(Self {
            orchestrator,
            input,
            sample_ids,
        })
    }

    pub fn sample_ids(&self) -> &[i32] {
        &self.sample_ids
    }

    /// Match and commit all samples.
    pub fn match_samples(&mut self) -> Result<()> {
        let num_samples = self.input.num_samples();
        let num_sites = self.input.num_sites() as u32;
        log::info!("started matching for {num_samples} samples");

        let pool = self.orchestrator.spawn_pool();
        let mut dispatched = 0;
        for (j, haplotype) in self.input.sample_haplotypes().enumerate() {
            let mut item = WorkItem {
                node_id: self.sample_ids[j],
                haplotype,
                start: 0,
                end: num_sites,
                kind: WorkKind::Sample,
            };
            match &pool {
                Some(pool) => pool.dispatch(item)?,
                None => self.orchestrator.process_work_item(&mut item, 0)?,
            }
            dispatched += 1;
        }
        if let Some(pool) = &pool {
            pool.wait(dispatched)?;
        }
        self.commit()?;
        if let Some(pool) = pool {
            pool.shutdown();
        }
        log::info!("finished sample matching");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let mut slots: Vec<_> = (0..self.orchestrator.num_slots())
            .map(|j| self.orchestrator.lock_slot(j))
            .collect();
        let buffers: Vec<&ResultBuffer> = slots.iter().map(|s| &s.results).collect();
        let results = ResultBuffer::combine(&buffers);

        let mut builder = self
            .orchestrator
            .builder()
            .write()
            .expect("builder lock poisoned");
        for &sample_id in &self.sample_ids {
            let node_id = builder.add_node(0.0, NODE_IS_SAMPLE)?;
            debug_assert_eq!(node_id, sample_id);
            let indices: Vec<usize> = (0..results.num_edges())
                .filter(|&k| results.child()[k] == sample_id)
                .collect();
            let left: Vec<u32> = indices.iter().rev().map(|&k| results.left()[k]).collect();
            let right: Vec<u32> = indices.iter().rev().map(|&k| results.right()[k]).collect();
            let parent: Vec<i32> = indices.iter().rev().map(|&k| results.parent()[k]).collect();
            builder.add_path(sample_id, &left, &right, &parent)?;
        }
        builder.add_mutations(results.site(), results.node(), results.derived_state());
        drop(builder);

        for slot in slots.iter_mut() {
            slot.results.clear();
            slot.reset_stats();
        }
        Ok(())
    }

    /// Dump the final tables, optionally reduced to the sample lineage.
    pub fn finalise(&self, simplify: bool) -> Result<TreeSequenceTables> {
        log::info!("finalising tree sequence");
        let tables = self.orchestrator.tables();
        if simplify {
            log::info!(
                "running simplify on {} nodes and {} edges",
                tables.num_nodes(),
                tables.num_edges()
            );
            let simplified = tables.simplify(&self.sample_ids);
            log::info!(
                "finished simplify; now have {} nodes and {} edges",
                simplified.num_nodes(),
                simplified.num_edges()
            );
            return Ok(simplified);
        }
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ancestor_builder::AncestorBuilder;
    use crate::match_ancestors::{AncestorScheduler, MatchAncestorsOptions};
    use crate::tree_sequence_builder::NODE_IS_SAMPLE;

    fn fixture() -> (InputData, TreeSequenceTables) {
        let genotypes = vec![
            vec![1, 1, 0, 0],
            vec![1, 1, 0, 0],
            vec![0, 0, 1, 1],
            vec![1, 1, 1, 0],
            vec![0, 1, 1, 1],
            vec![0, 0, 1, 1],
            vec![1, 0, 0, 1],
            vec![1, 1, 1, 1],
            vec![0, 1, 1, 0],
            vec![1, 1, 0, 1],
        ];
        let position: Vec<f64> = (0..10).map(|j| j as f64 * 10.0).collect();
        let rate = vec![0.05; 10];
        let input = InputData::new(genotypes, position, rate, 100.0).unwrap();
        let store = AncestorBuilder::new(&input).build().unwrap();
        let tables = AncestorScheduler::new(&input, &store, MatchAncestorsOptions::default())
            .unwrap()
            .match_ancestors()
            .unwrap();
        (input, tables)
    }

    #[test]
    fn samples_get_contiguous_id_block_at_time_zero() {
        let (input, ancestor_tables) = fixture();
        let mut scheduler =
            SampleScheduler::new(&input, &ancestor_tables, MatchSamplesOptions::default())
                .unwrap();
        scheduler.match_samples().unwrap();
        let tables = scheduler.finalise(false).unwrap();

        let first = ancestor_tables.num_nodes();
        assert_eq!(tables.num_nodes(), first + input.num_samples());
        for j in 0..input.num_samples() {
            assert_eq!(tables.nodes_time[first + j], 0.0);
            assert_eq!(tables.nodes_flags[first + j], NODE_IS_SAMPLE);
        }
        // every sample has a committed path covering the full axis
        for &sample_id in scheduler.sample_ids() {
            let mut covered = 0u32;
            for k in 0..tables.num_edges() {
                if tables.edges_child[k] == sample_id {
                    covered += tables.edges_right[k] - tables.edges_left[k];
                }
            }
            assert_eq!(covered, input.num_sites() as u32);
        }
    }

    #[test]
    fn committed_genotypes_reproduce_observations() {
        // the matched copy plus residual mutations must equal the input
        let (input, ancestor_tables) = fixture();
        let mut scheduler =
            SampleScheduler::new(&input, &ancestor_tables, MatchSamplesOptions::default())
                .unwrap();
        scheduler.match_samples().unwrap();

        let builder = scheduler.orchestrator.builder().read().unwrap();
        for (j, haplotype) in input.sample_haplotypes().enumerate() {
            let sample_id = scheduler.sample_ids()[j];
            for site in 0..input.num_sites() as u32 {
                assert_eq!(
                    builder.allele_at(sample_id, site),
                    haplotype[site as usize],
                    "sample {j} site {site}"
                );
            }
        }
    }

    #[test]
    fn single_and_multi_threaded_sample_runs_agree() {
        let (input, ancestor_tables) = fixture();
        let run = |threads: usize| {
            let mut scheduler = SampleScheduler::new(
                &input,
                &ancestor_tables,
                MatchSamplesOptions {
                    num_threads: threads,
                    ..Default::default()
                },
            )
            .unwrap();
            scheduler.match_samples().unwrap();
            scheduler.finalise(false).unwrap()
        };
        let sequential = run(0);
        let threaded = run(2);

        let edge_set = |t: &TreeSequenceTables| {
            let mut edges: Vec<(u32, u32, i32, i32)> = (0..t.num_edges())
                .map(|k| {
                    (
                        t.edges_left[k],
                        t.edges_right[k],
                        t.edges_parent[k],
                        t.edges_child[k],
                    )
                })
                .collect();
            edges.sort_unstable();
            edges
        };
        let mutation_set = |t: &TreeSequenceTables| {
            let mut muts: Vec<(u32, i32, u8)> = (0..t.num_mutations())
                .map(|k| {
                    (
                        t.mutations_site[k],
                        t.mutations_node[k],
                        t.mutations_derived_state[k],
                    )
                })
                .collect();
            muts.sort_unstable();
            muts
        };
        assert_eq!(edge_set(&sequential), edge_set(&threaded));
        assert_eq!(mutation_set(&sequential), mutation_set(&threaded));
    }

    #[test]
    fn simplify_retains_all_samples() {
        let (input, ancestor_tables) = fixture();
        let mut scheduler =
            SampleScheduler::new(&input, &ancestor_tables, MatchSamplesOptions::default())
                .unwrap();
        scheduler.match_samples().unwrap();
        let simplified = scheduler.finalise(true).unwrap();
        let sample_count = simplified
            .nodes_flags
            .iter()
            .filter(|&&f| f == NODE_IS_SAMPLE)
            .count();
        assert_eq!(sample_count, input.num_samples());
        assert!(simplified.num_nodes() <= ancestor_tables.num_nodes() + input.num_samples());
    }

    #[test]
    fn node_count_zero_is_rejected() {
        let (input, mut tables) = fixture();
        tables.nodes_time.clear();
        tables.nodes_flags.clear();
        let err =
            SampleScheduler::new(&input, &tables, MatchSamplesOptions::default()).unwrap_err();
        assert!(matches!(err, TreeweaveError::StructuralInconsistency { .. }));
    }
}
