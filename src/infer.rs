// End-to-end inference
//
// Convenience wrapper running the full pipeline in memory: discover
// ancestors, match them into a tree sequence, then match the real samples
// against it and simplify down to the sample lineage.

use crate::ancestor_builder::AncestorBuilder;
use crate::error::Result;
use crate::input_data::InputData;
use crate::match_ancestors::{AncestorScheduler, MatchAncestorsOptions};
use crate::match_samples::{MatchSamplesOptions, SampleScheduler};
use crate::tree_sequence::TreeSequenceTables;

#[derive(Debug, Clone, Default)]
pub struct InferOptions {
    pub num_threads: usize,
    /// Error probability applied when matching samples; ancestor matching
    /// always runs with zero error.
    pub sample_error: f64,
    pub simplify: bool,
}

pub fn infer(input: &InputData, options: &InferOptions) -> Result<TreeSequenceTables> {
    let store = AncestorBuilder::new(input).build()?;

    let ancestor_tables = AncestorScheduler::new(
        input,
        &store,
        MatchAncestorsOptions {
            num_threads: options.num_threads,
            ..Default::default()
        },
    )?
    .match_ancestors()?;

    let mut sample_scheduler = SampleScheduler::new(
        input,
        &ancestor_tables,
        MatchSamplesOptions {
            num_threads: options.num_threads,
            error_probability: options.sample_error,
            ..Default::default()
        },
    )?;
    sample_scheduler.match_samples()?;
    sample_scheduler.finalise(options.simplify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_sequence_builder::NODE_IS_SAMPLE;

    #[test]
    fn infer_produces_sample_rooted_tables() {
        let genotypes = vec![
            vec![1, 1, 0, 0],
            vec![0, 1, 1, 0],
            vec![1, 1, 1, 0],
            vec![0, 0, 1, 1],
        ];
        let position: Vec<f64> = (0..4).map(|j| j as f64).collect();
        let input = InputData::new(genotypes, position, vec![0.05; 4], 4.0).unwrap();
        let tables = infer(
            &input,
            &InferOptions {
                simplify: true,
                ..Default::default()
            },
        )
        .unwrap();
        let samples = tables
            .nodes_flags
            .iter()
            .filter(|&&f| f == NODE_IS_SAMPLE)
            .count();
        assert_eq!(samples, input.num_samples());
        assert!(tables.num_edges() > 0);
    }
}
