// Ancestor discovery
//
// Builds the synthetic ancestor haplotypes that seed tree sequence
// inference. Sites whose derived allele is carried by more than one sample
// are grouped by carrier frequency; sites sharing an identical carrier set
// within a frequency class become the focal sites of a single ancestor.
// The ancestor haplotype is the running consensus of its carriers,
// extended outward from the focal span: carriers that disagree with the
// consensus are dropped, and a direction ends once fewer than half of the
// original carriers remain. Ancestor time equals the carrier count, so
// higher-frequency (older) ancestors sort first.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::ancestor_store::AncestorStore;
use crate::error::Result;
use crate::input_data::InputData;
use crate::UNKNOWN_ALLELE;

/// Focal-site group: one ancestor to be built.
#[derive(Debug, Clone)]
struct AncestorDescriptor {
    frequency: usize,
    focal_sites: Vec<u32>,
}

/// A built ancestor, pending insertion into the store.
struct BuiltAncestor {
    time: f64,
    start: u32,
    end: u32,
    focal_sites: Vec<u32>,
    haplotype: Vec<u8>,
}

pub struct AncestorBuilder<'a> {
    data: &'a InputData,
}

impl<'a> AncestorBuilder<'a> {
    pub fn new(data: &'a InputData) -> Self {
        Self { data }
    }

    /// Discover and build all ancestors, oldest first. The store always
    /// begins with the root ancestor (all ancestral, older than every
    /// discovered ancestor).
    pub fn build(&self) -> Result<AncestorStore> {
        let descriptors = self.ancestor_descriptors();
        log::info!(
            "building {} ancestors from {} sites",
            descriptors.len() + 1,
            self.data.num_sites()
        );

        let built: Vec<BuiltAncestor> = descriptors
            .par_iter()
            .map(|d| self.make_ancestor(d))
            .collect();

        let num_sites = self.data.num_sites();
        let oldest_time = built.first().map_or(1.0, |a| a.time + 1.0);
        let mut store = AncestorStore::new(num_sites);
        store.add_ancestor(oldest_time, 0, num_sites as u32, Vec::new(), vec![0; num_sites])?;
        for a in built {
            store.add_ancestor(a.time, a.start, a.end, a.focal_sites, a.haplotype)?;
        }
        log::info!("finished building {} ancestors", store.num_ancestors());
        Ok(store)
    }

    /// Group inference sites into ancestor descriptors, ordered oldest
    /// (most frequent) first. Sites with fewer than two carriers are
    /// uninformative for ancestors and are left for sample matching.
    fn ancestor_descriptors(&self) -> Vec<AncestorDescriptor> {
        let mut by_carriers: HashMap<(usize, Vec<u8>), Vec<u32>> = HashMap::new();
        for (site, genotypes) in self.data.site_genotypes().enumerate() {
            let frequency = genotypes.iter().filter(|&&g| g == 1).count();
            if frequency > 1 {
                by_carriers
                    .entry((frequency, genotypes.to_vec()))
                    .or_default()
                    .push(site as u32);
            }
        }
        let mut descriptors: Vec<AncestorDescriptor> = by_carriers
            .into_iter()
            .map(|((frequency, _), focal_sites)| AncestorDescriptor {
                frequency,
                focal_sites,
            })
            .collect();
        descriptors.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then(a.focal_sites[0].cmp(&b.focal_sites[0]))
        });
        descriptors
    }

    /// Build one ancestor haplotype by consensus among the focal carriers.
    fn make_ancestor(&self, descriptor: &AncestorDescriptor) -> BuiltAncestor {
        let num_sites = self.data.num_sites();
        let focal = &descriptor.focal_sites;
        let first_focal = focal[0] as usize;
        let last_focal = *focal.last().unwrap() as usize;

        let carriers: Vec<usize> = self
            .data
            .genotypes_at(first_focal)
            .iter()
            .enumerate()
            .filter(|(_, &g)| g == 1)
            .map(|(s, _)| s)
            .collect();
        let min_carriers = (carriers.len() + 1) / 2;

        let mut haplotype = vec![UNKNOWN_ALLELE; num_sites];
        for &s in focal {
            haplotype[s as usize] = 1;
        }
        // interior: consensus over the full carrier set
        for site in first_focal..=last_focal {
            if haplotype[site] == UNKNOWN_ALLELE {
                haplotype[site] = consensus(self.data.genotypes_at(site), &carriers);
            }
        }

        let end = self.extend(&mut haplotype, &carriers, min_carriers, last_focal, true);
        let start = self.extend(&mut haplotype, &carriers, min_carriers, first_focal, false);

        BuiltAncestor {
            time: descriptor.frequency as f64,
            start,
            end,
            focal_sites: focal.clone(),
            haplotype,
        }
    }

    /// Extend the haplotype outward from a focal boundary, shrinking the
    /// carrier set as it diverges. Returns the exclusive end (rightward)
    /// or inclusive start (leftward) of the defined span.
    fn extend(
        &self,
        haplotype: &mut [u8],
        carriers: &[usize],
        min_carriers: usize,
        from: usize,
        rightward: bool,
    ) -> u32 {
        let num_sites = self.data.num_sites();
        let mut live: Vec<usize> = carriers.to_vec();
        let mut boundary = if rightward { from + 1 } else { from };
        loop {
            let site = if rightward {
                if boundary >= num_sites {
                    break;
                }
                boundary
            } else {
                if boundary == 0 {
                    break;
                }
                boundary - 1
            };
            let genotypes = self.data.genotypes_at(site);
            let allele = consensus(genotypes, &live);
            live.retain(|&s| genotypes[s] == allele);
            if live.len() < min_carriers {
                break;
            }
            haplotype[site] = allele;
            if rightward {
                boundary += 1;
            } else {
                boundary -= 1;
            }
        }
        boundary as u32
    }
}

/// Majority allele among the given samples; ties resolve ancestral.
fn consensus(genotypes: &[u8], samples: &[usize]) -> u8 {
    let derived = samples.iter().filter(|&&s| genotypes[s] == 1).count();
    u8::from(2 * derived > samples.len())
}
