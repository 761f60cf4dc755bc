//! Variable-to-variable coupling restrictions.

use crate::dof_error::DofMapError;

/// Square boolean matrix: entry `(i, j)` says whether DOFs of variable `i`
/// couple to DOFs of variable `j`.
///
/// Ghosting functors attach one to an element to restrict coupling; the
/// absence of a matrix means full coupling.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CouplingMatrix {
    size: usize,
    entries: Vec<bool>,
}

impl CouplingMatrix {
    /// No variable couples to any other.
    pub fn empty(size: usize) -> Self {
        Self {
            size,
            entries: vec![false; size * size],
        }
    }

    /// Every variable couples to every other.
    pub fn full(size: usize) -> Self {
        Self {
            size,
            entries: vec![true; size * size],
        }
    }

    /// Each variable couples only to itself.
    pub fn diagonal(size: usize) -> Self {
        let mut m = Self::empty(size);
        for i in 0..size {
            m.entries[i * size + i] = true;
        }
        m
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        i < self.size && j < self.size && self.entries[i * self.size + j]
    }

    pub fn set(&mut self, i: usize, j: usize, value: bool) -> Result<(), DofMapError> {
        if i >= self.size || j >= self.size {
            return Err(DofMapError::VariableIndexOutOfRange {
                index: i.max(j),
                len: self.size,
            });
        }
        self.entries[i * self.size + j] = value;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|&e| e)
    }

    /// Elementwise OR; the result is as large as the larger operand.
    pub fn union(&self, other: &CouplingMatrix) -> CouplingMatrix {
        let size = self.size.max(other.size);
        let mut out = Self::empty(size);
        for i in 0..size {
            for j in 0..size {
                out.entries[i * size + j] = self.get(i, j) || other.get(i, j);
            }
        }
        out
    }

    /// Variables `j` coupled to row variable `i`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&j| self.get(i, j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_elementwise_or() {
        let mut a = CouplingMatrix::empty(2);
        a.set(0, 1, true).unwrap();
        let b = CouplingMatrix::diagonal(2);
        let u = a.union(&b);
        assert!(u.get(0, 0) && u.get(0, 1) && u.get(1, 1));
        assert!(!u.get(1, 0));
        assert!(!u.is_full());
        assert_eq!(u.row(0).collect::<Vec<_>>(), vec![0, 1]);
        assert!(a.set(2, 0, true).is_err());
    }
}
