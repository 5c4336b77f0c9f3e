// Ancestor haplotype storage
//
// Holds the synthetic ancestors produced by discovery, oldest first:
// per-ancestor time, the defined [start, end) span, the focal sites forced
// to the derived allele, and the full-length haplotype (UNKNOWN_ALLELE
// outside the span). Haplotype iteration can begin at any index so a
// resumed ancestor-matching run can skip what is already committed.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeweaveError};
use crate::UNKNOWN_ALLELE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AncestorStore {
    time: Vec<f64>,
    start: Vec<u32>,
    end: Vec<u32>,
    focal_sites: Vec<Vec<u32>>,
    haplotypes: Vec<Vec<u8>>,
    num_sites: usize,
}

impl AncestorStore {
    pub fn new(num_sites: usize) -> Self {
        Self {
            time: Vec::new(),
            start: Vec::new(),
            end: Vec::new(),
            focal_sites: Vec::new(),
            haplotypes: Vec::new(),
            num_sites,
        }
    }

    /// Append one ancestor. Ancestors must arrive oldest first (times
    /// non-increasing); the haplotype must be defined exactly on
    /// [start, end) with focal sites carrying the derived allele.
    pub fn add_ancestor(
        &mut self,
        time: f64,
        start: u32,
        end: u32,
        focal_sites: Vec<u32>,
        haplotype: Vec<u8>,
    ) -> Result<()> {
        if haplotype.len() != self.num_sites {
            return Err(TreeweaveError::config(format!(
                "ancestor haplotype has {} sites, store expects {}",
                haplotype.len(),
                self.num_sites
            )));
        }
        if start >= end || end as usize > self.num_sites {
            return Err(TreeweaveError::config(format!(
                "invalid ancestor span [{start}, {end})"
            )));
        }
        if let Some(&last) = self.time.last() {
            if time > last {
                return Err(TreeweaveError::config(format!(
                    "ancestor time {time} is younger than predecessor {last}"
                )));
            }
        }
        debug_assert!(haplotype[..start as usize]
            .iter()
            .all(|&a| a == UNKNOWN_ALLELE));
        debug_assert!(haplotype[end as usize..]
            .iter()
            .all(|&a| a == UNKNOWN_ALLELE));
        debug_assert!(focal_sites.iter().all(|&s| haplotype[s as usize] == 1));
        self.time.push(time);
        self.start.push(start);
        self.end.push(end);
        self.focal_sites.push(focal_sites);
        self.haplotypes.push(haplotype);
        Ok(())
    }

    pub fn num_ancestors(&self) -> usize {
        self.time.len()
    }

    pub fn num_sites(&self) -> usize {
        self.num_sites
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn start(&self, ancestor: usize) -> u32 {
        self.start[ancestor]
    }

    pub fn end(&self, ancestor: usize) -> u32 {
        self.end[ancestor]
    }

    pub fn focal_sites(&self, ancestor: usize) -> &[u32] {
        &self.focal_sites[ancestor]
    }

    /// Haplotypes from `first` onwards, one owned vector per ancestor.
    pub fn haplotypes_from(&self, first: usize) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.haplotypes[first..].iter().cloned()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let encoded = bincode::serialize(self).map_err(|e| TreeweaveError::Snapshot {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        tmp.write_all(&encoded)?;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn haplotype(num_sites: usize, start: u32, end: u32, derived: &[u32]) -> Vec<u8> {
        let mut h = vec![UNKNOWN_ALLELE; num_sites];
        for s in start..end {
            h[s as usize] = 0;
        }
        for &s in derived {
            h[s as usize] = 1;
        }
        h
    }

    #[test]
    fn rejects_increasing_time() {
        let mut store = AncestorStore::new(4);
        store
            .add_ancestor(3.0, 0, 4, vec![], haplotype(4, 0, 4, &[]))
            .unwrap();
        let err = store
            .add_ancestor(5.0, 0, 4, vec![1], haplotype(4, 0, 4, &[1]))
            .unwrap_err();
        assert!(matches!(err, TreeweaveError::Config { .. }));
    }

    #[test]
    fn iteration_can_start_mid_store() {
        let mut store = AncestorStore::new(3);
        store
            .add_ancestor(4.0, 0, 3, vec![], haplotype(3, 0, 3, &[]))
            .unwrap();
        store
            .add_ancestor(3.0, 0, 3, vec![0], haplotype(3, 0, 3, &[0]))
            .unwrap();
        store
            .add_ancestor(2.0, 1, 3, vec![2], haplotype(3, 1, 3, &[2]))
            .unwrap();
        let rest: Vec<Vec<u8>> = store.haplotypes_from(2).collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0][0], UNKNOWN_ALLELE);
    }

    #[test]
    fn store_round_trip() {
        let mut store = AncestorStore::new(3);
        store
            .add_ancestor(2.0, 0, 3, vec![1], haplotype(3, 0, 3, &[1]))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ancestors.bin");
        store.save(&path).unwrap();
        let loaded = AncestorStore::load(&path).unwrap();
        assert_eq!(loaded.num_ancestors(), 1);
        assert_eq!(loaded.focal_sites(0), &[1]);
    }
}
