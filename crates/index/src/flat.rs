use std::cmp::Ordering;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbour {
    /// Insertion position of the vector.
    pub id: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

pub trait VectorIndex {
    fn dim(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Appends vectors; each must have exactly `dim` entries.
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()>;
    fn reset(&mut self);
    /// Up to `k` nearest vectors, closest first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbour>>;
}

/// Exhaustive L2 search over a contiguous buffer.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    fn vector(&self, id: usize) -> &[f32] {
        &self.data[id * self.dim..(id + 1) * self.dim]
    }
}

impl VectorIndex for FlatL2Index {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            bail!("vector has {} entries, index expects {}", bad.len(), self.dim);
        }
        self.data.reserve(vectors.len() * self.dim);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.data.clear();
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        if query.len() != self.dim {
            bail!("query has {} entries, index expects {}", query.len(), self.dim);
        }
        let mut hits: Vec<Neighbour> = (0..self.len())
            .map(|id| Neighbour {
                id,
                distance: squared_l2(self.vector(id), query),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_first_and_ties_keep_insertion_order() {
        let mut index = FlatL2Index::new(2);
        index
            .add(&[vec![5.0, 5.0], vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]])
            .unwrap();
        let hits = index.search(&[0.0, 0.0], 3).unwrap();
        let ids: Vec<usize> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        let mut index = FlatL2Index::new(1);
        index.add(&[vec![1.0], vec![2.0]]).unwrap();
        assert_eq!(index.search(&[0.0], 10).unwrap().len(), 2);
    }

    #[test]
    fn reset_empties_the_index() {
        let mut index = FlatL2Index::new(3);
        index.add(&[vec![0.0; 3]]).unwrap();
        assert_eq!(index.len(), 1);
        index.reset();
        assert!(index.is_empty());
        assert!(index.search(&[0.0; 3], 5).unwrap().is_empty());
    }

    #[test]
    fn rejects_wrong_dimensions() {
        let mut index = FlatL2Index::new(3);
        assert!(index.add(&[vec![0.0; 2]]).is_err());
        assert!(index.is_empty());
        assert!(index.search(&[0.0; 4], 1).is_err());
    }
}
