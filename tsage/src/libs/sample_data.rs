use std::path::{Path, PathBuf};

use color_eyre::{
    eyre::{ensure, eyre},
    Result,
};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::TsageError::FinalisedSampleDataError;
use crate::io::{read_json, write_json};
use crate::structs::TreeSequence;

/// Phased biallelic or multiallelic haploid genotypes keyed by site.
///
/// Sites are appended in position order with [`SampleData::add_site`] until
/// [`SampleData::finalise`] seals the container. A sealed container is read-only, and
/// [`SampleData::copy`] gives back an unsealed copy to modify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleData {
    #[serde(skip)]
    path: Option<PathBuf>,
    sequence_length: f64,
    individuals_time: Vec<f64>,
    sites_position: Vec<f64>,
    sites_alleles: Vec<Vec<String>>,
    sites_time: Vec<Option<f64>>,
    sites_genotypes: Array2<u8>,
    finalised: bool,
}

impl SampleData {
    pub fn new(sequence_length: f64, individuals_time: Vec<f64>) -> Self {
        let n = individuals_time.len();
        Self {
            path: None,
            sequence_length,
            individuals_time,
            sites_position: Vec::new(),
            sites_alleles: Vec::new(),
            sites_time: Vec::new(),
            sites_genotypes: Array2::zeros((0, n)),
            finalised: false,
        }
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn add_site(
        &mut self,
        position: f64,
        genotypes: ArrayView1<u8>,
        alleles: Vec<String>,
        time: Option<f64>,
    ) -> Result<usize> {
        if self.finalised {
            return Err(eyre!(FinalisedSampleDataError));
        }
        ensure!(
            genotypes.len() == self.num_samples(),
            "Site at {position} has {} genotypes, expected {}",
            genotypes.len(),
            self.num_samples()
        );
        ensure!(
            (0.0..self.sequence_length).contains(&position),
            "Site position {position} out of bounds of [0, {})",
            self.sequence_length
        );
        if let Some(&last) = self.sites_position.last() {
            ensure!(
                position > last,
                "Sites must be added in increasing position order: {position} <= {last}"
            );
        }
        ensure!(
            genotypes.iter().all(|&g| (g as usize) < alleles.len()),
            "Site at {position} has a genotype without a matching allele"
        );

        self.sites_genotypes.push_row(genotypes)?;
        self.sites_position.push(position);
        self.sites_alleles.push(alleles);
        self.sites_time.push(time);

        Ok(self.sites_position.len() - 1)
    }

    /// Seal the container, writing it to its path when one was given
    pub fn finalise(&mut self) -> Result<()> {
        self.finalised = true;
        if let Some(path) = &self.path {
            write_json(path, self)?;
        }
        Ok(())
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    /// Unsealed copy of the data, optionally backed by a new path
    pub fn copy(&self, path: Option<PathBuf>) -> Self {
        Self {
            path,
            finalised: false,
            ..self.clone()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut data: SampleData = read_json(path.as_ref())?;
        data.path = Some(path.as_ref().to_path_buf());
        Ok(data)
    }

    pub fn sequence_length(&self) -> f64 {
        self.sequence_length
    }

    pub fn num_samples(&self) -> usize {
        self.individuals_time.len()
    }

    pub fn num_sites(&self) -> usize {
        self.sites_position.len()
    }

    pub fn sites_position(&self) -> &[f64] {
        &self.sites_position
    }

    pub fn sites_alleles(&self) -> &[Vec<String>] {
        &self.sites_alleles
    }

    /// Known site times, NaN where unknown
    pub fn sites_time(&self) -> Vec<f64> {
        self.sites_time
            .iter()
            .map(|t| t.unwrap_or(f64::NAN))
            .collect()
    }

    pub fn individuals_time(&self) -> &[f64] {
        &self.individuals_time
    }

    /// Genotype matrix of shape `(sites, samples)`
    pub fn sites_genotypes(&self) -> &Array2<u8> {
        &self.sites_genotypes
    }

    /// Sealed copy holding only the given sites
    pub fn subset(&self, sites: &[usize]) -> Result<Self> {
        ensure!(
            sites.iter().all(|&s| s < self.num_sites()),
            "Site subset out of bounds of {} sites",
            self.num_sites()
        );
        ensure!(
            sites.windows(2).all(|w| w[0] < w[1]),
            "Site subset must be sorted and unique"
        );

        let mut subset = Self::new(self.sequence_length, self.individuals_time.clone());
        for &s in sites {
            subset.add_site(
                self.sites_position[s],
                self.sites_genotypes.row(s),
                self.sites_alleles[s].clone(),
                self.sites_time[s],
            )?;
        }
        subset.finalise()?;
        Ok(subset)
    }

    /// Sealed sample data with the genotypes of every site in the tree sequence
    pub fn from_tree_sequence(ts: &TreeSequence, use_sites_time: bool) -> Result<Self> {
        let individuals_time = ts
            .samples()
            .iter()
            .map(|&s| ts.nodes()[s].time)
            .collect::<Vec<f64>>();
        let mut data = Self::new(ts.sequence_length(), individuals_time);

        let genotypes = ts.genotype_matrix();
        for (i, (site, row)) in ts
            .sites()
            .iter()
            .zip(genotypes.axis_iter(Axis(0)))
            .enumerate()
        {
            let mut alleles = vec![site.ancestral_state.clone()];
            for &m in ts.site_mutations(i) {
                let derived = &ts.mutations()[m].derived_state;
                if !alleles.contains(derived) {
                    alleles.push(derived.clone());
                }
            }
            let time = match use_sites_time {
                true => ts
                    .site_mutations(i)
                    .iter()
                    .map(|&m| ts.nodes()[ts.mutations()[m].node].time)
                    .reduce(f64::max),
                false => None,
            };
            data.add_site(site.position, row, alleles, time)?;
        }

        data.finalise()?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::structs::fixtures::two_tree_ts;

    fn alleles() -> Vec<String> {
        vec!["0".to_string(), "1".to_string()]
    }

    #[test]
    fn test_add_site_after_finalise() {
        let mut data = SampleData::new(100.0, vec![0.0; 4]);
        data.add_site(1.0, array![0, 1, 1, 0].view(), alleles(), None)
            .unwrap();
        data.finalise().unwrap();

        let result = data.add_site(2.0, array![0, 1, 1, 0].view(), alleles(), None);
        assert!(result.is_err());

        let mut copy = data.copy(None);
        assert!(!copy.is_finalised());
        copy.add_site(2.0, array![1, 1, 1, 0].view(), alleles(), Some(3.0))
            .unwrap();
        assert_eq!(copy.num_sites(), 2);
        assert_eq!(data.num_sites(), 1);
        assert!(copy.sites_time()[0].is_nan());
        assert_eq!(copy.sites_time()[1], 3.0);
    }

    #[test]
    fn test_add_site_checks() {
        let mut data = SampleData::new(100.0, vec![0.0; 4]);
        assert!(data
            .add_site(1.0, array![0, 1, 1].view(), alleles(), None)
            .is_err());
        assert!(data
            .add_site(100.0, array![0, 1, 1, 0].view(), alleles(), None)
            .is_err());
        assert!(data
            .add_site(1.0, array![0, 2, 1, 0].view(), alleles(), None)
            .is_err());
        data.add_site(5.0, array![0, 1, 1, 0].view(), alleles(), None)
            .unwrap();
        assert!(data
            .add_site(4.0, array![0, 1, 1, 0].view(), alleles(), None)
            .is_err());
    }

    #[test]
    fn test_from_tree_sequence_and_subset() {
        let ts = two_tree_ts();
        let data = SampleData::from_tree_sequence(&ts, false).unwrap();
        assert!(data.is_finalised());
        assert_eq!(data.num_sites(), 3);
        assert_eq!(data.num_samples(), 4);
        assert_eq!(data.sites_genotypes().row(1).to_vec(), vec![1, 1, 1, 0]);

        let subset = data.subset(&[0, 2]).unwrap();
        assert_eq!(subset.sites_position(), &[10.0, 70.4]);
        assert_eq!(subset.sites_genotypes().row(1).to_vec(), vec![0, 0, 0, 1]);
        assert!(data.subset(&[2, 0]).is_err());
    }
}
