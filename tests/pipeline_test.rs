// End-to-end pipeline tests over synthetic genotype instances:
// build ancestors, match them epoch by epoch, match samples, and check
// the committed structure against the observed data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treeweave::ancestor_builder::AncestorBuilder;
use treeweave::error::TreeweaveError;
use treeweave::input_data::InputData;
use treeweave::match_ancestors::{AncestorScheduler, MatchAncestorsOptions};
use treeweave::match_samples::{MatchSamplesOptions, SampleScheduler};
use treeweave::tree_sequence::TreeSequenceTables;
use treeweave::tree_sequence_builder::TreeSequenceBuilder;

/// Random genotype matrix with clustered variation so ancestors exist.
fn synthetic_input(num_samples: usize, num_sites: usize, seed: u64) -> InputData {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut genotypes = Vec::with_capacity(num_sites);
    for _ in 0..num_sites {
        // pick a random subset size so frequencies vary
        let carriers = rng.gen_range(0..=num_samples);
        let mut row = vec![0u8; num_samples];
        for s in 0..carriers {
            row[s] = 1;
        }
        // shuffle carriers around
        for s in 0..num_samples {
            let t = rng.gen_range(0..num_samples);
            row.swap(s, t);
        }
        genotypes.push(row);
    }
    let position: Vec<f64> = (0..num_sites).map(|j| (j as f64 + 1.0) * 7.0).collect();
    let rate = vec![0.05; num_sites];
    let sequence_length = (num_sites as f64 + 1.0) * 7.0;
    InputData::new(genotypes, position, rate, sequence_length).unwrap()
}

fn run_pipeline(input: &InputData, num_threads: usize) -> (TreeSequenceTables, Vec<i32>) {
    let store = AncestorBuilder::new(input).build().unwrap();
    let ancestor_tables = AncestorScheduler::new(
        input,
        &store,
        MatchAncestorsOptions {
            num_threads,
            ..Default::default()
        },
    )
    .unwrap()
    .match_ancestors()
    .unwrap();

    let mut scheduler = SampleScheduler::new(
        input,
        &ancestor_tables,
        MatchSamplesOptions {
            num_threads,
            ..Default::default()
        },
    )
    .unwrap();
    scheduler.match_samples().unwrap();
    let sample_ids = scheduler.sample_ids().to_vec();
    (scheduler.finalise(false).unwrap(), sample_ids)
}

fn edge_set(t: &TreeSequenceTables) -> Vec<(u32, u32, i32, i32)> {
    let mut edges: Vec<_> = (0..t.num_edges())
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
}

fn mutation_set(t: &TreeSequenceTables) -> Vec<(u32, i32, u8)> {
    let mut muts: Vec<_> = (0..t.num_mutations())
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
}

#[test]
fn pipeline_reproduces_observed_genotypes() {
    let input = synthetic_input(6, 20, 17);
    let (tables, sample_ids) = run_pipeline(&input, 0);

    // decode the committed structure and read each sample back
    let mut builder = TreeSequenceBuilder::new(
        input.sequence_length(),
        input.position().to_vec(),
        input.recombination_rate().to_vec(),
        1024,
        4096,
    )
    .unwrap();
    tables.restore_into(&mut builder).unwrap();

    for (j, haplotype) in input.sample_haplotypes().enumerate() {
        for site in 0..input.num_sites() as u32 {
            assert_eq!(
                builder.allele_at(sample_ids[j], site),
                haplotype[site as usize],
                "sample {j} disagrees at site {site}"
            );
        }
    }
}

#[test]
fn sequential_and_threaded_pipelines_agree() {
    let input = synthetic_input(4, 10, 23);
    let (sequential, _) = run_pipeline(&input, 0);
    let (threaded, _) = run_pipeline(&input, 4);

    assert_eq!(sequential.nodes_time, threaded.nodes_time);
    assert_eq!(edge_set(&sequential), edge_set(&threaded));
    assert_eq!(mutation_set(&sequential), mutation_set(&threaded));
}

#[test]
fn huge_capacity_request_fails_with_resource_exhaustion() {
    let big = 1usize << 62;
    let err = TreeSequenceBuilder::new(1.0, vec![0.0], vec![0.0], big, 1).unwrap_err();
    assert!(matches!(err, TreeweaveError::ResourceExhaustion { .. }));
    let err = TreeSequenceBuilder::new(1.0, vec![0.0], vec![0.0], 1, big).unwrap_err();
    assert!(matches!(err, TreeweaveError::ResourceExhaustion { .. }));
}

#[test]
fn ancestor_checkpoints_are_resumable() {
    let input = synthetic_input(5, 16, 41);
    let store = AncestorBuilder::new(&input).build().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.trees");

    // checkpoint after every epoch
    let first = AncestorScheduler::new(
        &input,
        &store,
        MatchAncestorsOptions {
            output_path: Some(path.clone()),
            checkpoint_interval_mins: Some(0.0),
            ..Default::default()
        },
    )
    .unwrap()
    .match_ancestors()
    .unwrap();

    // resuming from the completed checkpoint changes nothing
    let resumed = AncestorScheduler::new(
        &input,
        &store,
        MatchAncestorsOptions {
            output_path: Some(path.clone()),
            resume: true,
            ..Default::default()
        },
    )
    .unwrap()
    .match_ancestors()
    .unwrap();

    assert_eq!(first.nodes_time, resumed.nodes_time);
    assert_eq!(edge_set(&first), edge_set(&resumed));
    assert_eq!(mutation_set(&first), mutation_set(&resumed));

    let on_disk = TreeSequenceTables::load(&path).unwrap();
    assert_eq!(edge_set(&on_disk), edge_set(&first));
}

#[test]
fn simplified_output_keeps_every_sample_reachable() {
    let input = synthetic_input(4, 12, 59);
    let store = AncestorBuilder::new(&input).build().unwrap();
    let ancestor_tables = AncestorScheduler::new(&input, &store, MatchAncestorsOptions::default())
        .unwrap()
        .match_ancestors()
        .unwrap();
    let mut scheduler =
        SampleScheduler::new(&input, &ancestor_tables, MatchSamplesOptions::default()).unwrap();
    scheduler.match_samples().unwrap();
    let simplified = scheduler.finalise(true).unwrap();

    // every retained edge interval is sane and every sample keeps a path
    for k in 0..simplified.num_edges() {
        assert!(simplified.edges_left[k] < simplified.edges_right[k]);
    }
    let samples: Vec<usize> = simplified
        .nodes_flags
        .iter()
        .enumerate()
        .filter(|(_, &f)| f == 1)
        .map(|(j, _)| j)
        .collect();
    assert_eq!(samples.len(), input.num_samples());
    for s in samples {
        let covered: u32 = (0..simplified.num_edges())
            .filter(|&k| simplified.edges_child[k] == s as i32)
            .map(|k| simplified.edges_right[k] - simplified.edges_left[k])
            .sum();
        assert_eq!(covered, input.num_sites() as u32);
    }
}
