// Genotype input handling
//
// Site-major genotype matrix with per-site positions and recombination
// rates. Files are plain text, one site per line, with transparent gzip
// decompression selected by the .gz extension:
//
//   ##sequence_length=<float>
//   <position> <recombination_rate> <alleles, e.g. 0110>
//
// Sites must be position-ordered and every line must carry one allele per
// sample.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::error::{Result, TreeweaveError};

/// In-memory genotype matrix and site metadata.
#[derive(Debug, Clone)]
pub struct InputData {
    sequence_length: f64,
    position: Vec<f64>,
    recombination_rate: Vec<f64>,
    // site-major: genotypes[site][sample]
    genotypes: Vec<Vec<u8>>,
    num_samples: usize,
}

impl InputData {
    /// Build from in-memory arrays. `genotypes` is site-major.
    pub fn new(
        genotypes: Vec<Vec<u8>>,
        position: Vec<f64>,
        recombination_rate: Vec<f64>,
        sequence_length: f64,
    ) -> Result<Self> {
        if genotypes.is_empty() {
            return Err(TreeweaveError::config("no sites in input"));
        }
        if position.len() != genotypes.len() || recombination_rate.len() != genotypes.len() {
            return Err(TreeweaveError::config(format!(
                "{} sites but {} positions and {} recombination rates",
                genotypes.len(),
                position.len(),
                recombination_rate.len()
            )));
        }
        let num_samples = genotypes[0].len();
        if num_samples == 0 {
            return Err(TreeweaveError::config("no samples in input"));
        }
        for (j, row) in genotypes.iter().enumerate() {
            if row.len() != num_samples {
                return Err(TreeweaveError::config(format!(
                    "site {j} has {} genotypes, expected {num_samples}",
                    row.len()
                )));
            }
        }
        for j in 1..position.len() {
            if position[j] <= position[j - 1] {
                return Err(TreeweaveError::config(format!(
                    "positions not strictly increasing at site {j}"
                )));
            }
        }
        if sequence_length <= *position.last().unwrap() {
            return Err(TreeweaveError::config(
                "sequence length does not cover the last site",
            ));
        }
        Ok(Self {
            sequence_length,
            position,
            recombination_rate,
            genotypes,
            num_samples,
        })
    }

    /// Load from a text file (gzip-compressed if the path ends in .gz).
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let reader = BufReader::new(reader);

        let mut sequence_length = None;
        let mut position = Vec::new();
        let mut recombination_rate = Vec::new();
        let mut genotypes = Vec::new();

        for (ix, line) in reader.lines().enumerate() {
            let line_no = ix + 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(value) = line.strip_prefix("##sequence_length=") {
                sequence_length = Some(value.parse::<f64>().map_err(|_| {
                    TreeweaveError::parse(line_no, format!("bad sequence length {value:?}"))
                })?);
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let pos: f64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| TreeweaveError::parse(line_no, "missing position"))?;
            let rate: f64 = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| TreeweaveError::parse(line_no, "missing recombination rate"))?;
            let alleles = fields
                .next()
                .ok_or_else(|| TreeweaveError::parse(line_no, "missing genotypes"))?;
            let mut row = Vec::with_capacity(alleles.len());
            for c in alleles.bytes() {
                match c {
                    b'0' => row.push(0),
                    b'1' => row.push(1),
                    _ => {
                        return Err(TreeweaveError::parse(
                            line_no,
                            format!("invalid allele {:?}", c as char),
                        ))
                    }
                }
            }
            position.push(pos);
            recombination_rate.push(rate);
            genotypes.push(row);
        }

        let sequence_length = sequence_length
            .unwrap_or_else(|| position.last().copied().unwrap_or(0.0).floor() + 1.0);
        Self::new(genotypes, position, recombination_rate, sequence_length)
    }

    pub fn num_sites(&self) -> usize {
        self.genotypes.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn sequence_length(&self) -> f64 {
        self.sequence_length
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn recombination_rate(&self) -> &[f64] {
        &self.recombination_rate
    }

    /// Per-site genotype vectors in site order.
    pub fn site_genotypes(&self) -> impl Iterator<Item = &[u8]> {
        self.genotypes.iter().map(|g| g.as_slice())
    }

    pub fn genotypes_at(&self, site: usize) -> &[u8] {
        &self.genotypes[site]
    }

    /// Per-sample haplotype vectors over the site axis, materialized one
    /// at a time from the site-major matrix.
    pub fn sample_haplotypes(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..self.num_samples).map(move |sample| {
            self.genotypes
                .iter()
                .map(|site_row| site_row[sample])
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn demo() -> InputData {
        InputData::new(
            vec![
                vec![0, 1, 1, 0],
                vec![1, 1, 0, 0],
                vec![0, 0, 1, 1],
            ],
            vec![1.0, 5.0, 9.0],
            vec![0.01, 0.01, 0.01],
            10.0,
        )
        .unwrap()
    }

    #[test]
    fn haplotypes_transpose_site_major_matrix() {
        let data = demo();
        let haps: Vec<Vec<u8>> = data.sample_haplotypes().collect();
        assert_eq!(haps.len(), 4);
        assert_eq!(haps[0], vec![0, 1, 0]);
        assert_eq!(haps[2], vec![1, 0, 1]);
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = InputData::new(
            vec![vec![0, 1], vec![1]],
            vec![1.0, 2.0],
            vec![0.0, 0.0],
            3.0,
        )
        .unwrap_err();
        assert!(matches!(err, TreeweaveError::Config { .. }));
    }

    #[test]
    fn rejects_unsorted_positions() {
        let err = InputData::new(
            vec![vec![0, 1], vec![1, 0]],
            vec![5.0, 2.0],
            vec![0.0, 0.0],
            6.0,
        )
        .unwrap_err();
        assert!(matches!(err, TreeweaveError::Config { .. }));
    }

    #[test]
    fn loads_text_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "##sequence_length=10").unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "1.0 0.01 0110").unwrap();
        writeln!(f, "5.0 0.02 1100").unwrap();
        drop(f);

        let data = InputData::load(&path).unwrap();
        assert_eq!(data.num_sites(), 2);
        assert_eq!(data.num_samples(), 4);
        assert_eq!(data.genotypes_at(1), &[1, 1, 0, 0]);
        assert_eq!(data.recombination_rate(), &[0.01, 0.02]);
        assert_eq!(data.sequence_length(), 10.0);
    }

    #[test]
    fn load_rejects_bad_allele() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.txt");
        std::fs::write(&path, "1.0 0.01 01x0\n").unwrap();
        let err = InputData::load(&path).unwrap_err();
        assert!(matches!(err, TreeweaveError::Parse { line: 1, .. }));
    }
}
