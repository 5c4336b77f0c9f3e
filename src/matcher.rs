// Li-Stephens Viterbi matching against the committed tree sequence
//
// One matcher per worker slot. A match finds the most likely copying path
// of a haplotype through the nodes already committed to the builder,
// allowing recombination between nodes (per-site switch probability from
// the recombination rate array) and mutation away from the copied state
// (the error probability). All tie-breaks are deterministic: staying beats
// switching, and the lowest node id wins, so results are independent of
// thread interleaving.
//
// Node alleles are resolved through the builder: the nearest mutation on
// the child-to-parent chain at a site decides the state, ancestral at the
// root. The traceback stores, per site, the sparse list of nodes for which
// switching beat staying, which is the figure behind the
// mean_traceback_size statistic.

use crate::tree_sequence_builder::TreeSequenceBuilder;
use crate::UNKNOWN_ALLELE;

// Probability floors keep the log-space recursion finite when callers ask
// for error probability 0.
const MIN_MUTATION_PROBA: f64 = 1e-10;
const MAX_MUTATION_PROBA: f64 = 0.5;
const MIN_RECOMBINATION_PROBA: f64 = 1e-10;
const MAX_RECOMBINATION_PROBA: f64 = 1.0 - 1e-10;

/// One copying segment: the haplotype copies from `parent` on
/// `[left, right)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathSegment {
    pub left: u32,
    pub right: u32,
    pub parent: i32,
}

pub struct TreeMatcher {
    error_probability: f64,
    mean_traceback_size: f64,
    total_memory: usize,
}

impl TreeMatcher {
    pub fn new(error_probability: f64) -> Self {
        Self {
            error_probability,
            mean_traceback_size: 0.0,
            total_memory: 0,
        }
    }

    /// Average per-site traceback list length of the last match.
    pub fn mean_traceback_size(&self) -> f64 {
        self.mean_traceback_size
    }

    /// Approximate bytes held by the last match's traceback.
    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    /// Find the most likely copying path for `haplotype` over
    /// `[start, end)` and fill `match_scratch` with the copied alleles
    /// (UNKNOWN_ALLELE outside the span). Segments are returned
    /// rightmost-first; every segment lies within the span.
    pub fn find_path(
        &mut self,
        builder: &TreeSequenceBuilder,
        haplotype: &[u8],
        start: u32,
        end: u32,
        match_scratch: &mut [u8],
    ) -> Vec<PathSegment> {
        let num_nodes = builder.num_nodes();
        assert!(num_nodes > 0, "cannot match against an empty tree sequence");
        assert!(start < end && end as usize <= builder.num_sites());
        debug_assert!(haplotype[start as usize..end as usize]
            .iter()
            .all(|&a| a != UNKNOWN_ALLELE));

        let mu = self
            .error_probability
            .clamp(MIN_MUTATION_PROBA, MAX_MUTATION_PROBA);
        let rates = builder.recombination_rate();

        let num_span_sites = (end - start) as usize;
        let mut likelihood = vec![0.0f64; num_nodes];
        let mut alleles = vec![0u8; num_nodes];
        // Per site: nodes whose best move was a switch, and the node they
        // switched from.
        let mut switch_lists: Vec<Vec<i32>> = Vec::with_capacity(num_span_sites);
        let mut switch_targets: Vec<i32> = Vec::with_capacity(num_span_sites);

        for t in start..end {
            let site_ix = (t - start) as usize;
            for u in 0..num_nodes {
                alleles[u] = builder.allele_at(u as i32, t);
            }
            let emit = |u: usize| -> f64 {
                if haplotype[t as usize] == alleles[u] {
                    (1.0 - mu).ln()
                } else {
                    mu.ln()
                }
            };
            if site_ix == 0 {
                // uniform prior over nodes
                let prior = -(num_nodes as f64).ln();
                for u in 0..num_nodes {
                    likelihood[u] = prior + emit(u);
                }
                switch_lists.push(Vec::new());
                switch_targets.push(-1);
                continue;
            }

            let rho = rates[t as usize].clamp(MIN_RECOMBINATION_PROBA, MAX_RECOMBINATION_PROBA);
            let stay = (1.0 - rho + rho / num_nodes as f64).ln();
            let switch = (rho / num_nodes as f64).ln();

            let best_prev = argmax(&likelihood);
            let best_prev_likelihood = likelihood[best_prev as usize];
            let mut switched = Vec::new();
            for u in 0..num_nodes {
                let stay_score = likelihood[u] + stay;
                let switch_score = best_prev_likelihood + switch;
                if switch_score > stay_score {
                    likelihood[u] = switch_score + emit(u);
                    switched.push(u as i32);
                } else {
                    likelihood[u] = stay_score + emit(u);
                }
            }
            switch_lists.push(switched);
            switch_targets.push(best_prev);
        }

        let traceback_entries: usize = switch_lists.iter().map(|l| l.len()).sum();
        self.mean_traceback_size = traceback_entries as f64 / num_span_sites as f64;
        self.total_memory = traceback_entries * std::mem::size_of::<i32>()
            + num_nodes * (std::mem::size_of::<f64>() + 1);

        // Trace back from the final argmax, emitting a segment at every
        // recombination.
        let mut segments = Vec::new();
        let mut current = argmax(&likelihood);
        let mut right = end;
        for t in (start + 1..end).rev() {
            let site_ix = (t - start) as usize;
            if switch_lists[site_ix].contains(&current) {
                segments.push(PathSegment {
                    left: t,
                    right,
                    parent: current,
                });
                right = t;
                current = switch_targets[site_ix];
            }
        }
        segments.push(PathSegment {
            left: start,
            right,
            parent: current,
        });

        // Fill the scratch with the copied alleles.
        for a in match_scratch.iter_mut() {
            *a = UNKNOWN_ALLELE;
        }
        for segment in &segments {
            for t in segment.left..segment.right {
                match_scratch[t as usize] = builder.allele_at(segment.parent, t);
            }
        }
        segments
    }
}

/// Index of the maximum likelihood; the lowest node id wins ties.
fn argmax(likelihood: &[f64]) -> i32 {
    let mut best = 0usize;
    for (u, &l) in likelihood.iter().enumerate() {
        if l > likelihood[best] {
            best = u;
        }
    }
    best as i32
}
