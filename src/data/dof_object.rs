//! Raw global DOF indices stored per DofObject (node or element).
//!
//! Each active DofObject visible on the rank carries one [`VarDofs`] slot per
//! registered variable: the first global index of that variable's DOFs on the
//! object and how many there are. Indices of one variable on one object are
//! always contiguous.

use std::ops::Range;

use hashbrown::HashMap;

use crate::dof_error::DofMapError;
use crate::topology::ids::{DofId, DofObjectId};

/// Contiguous run of one variable's DOFs on one object.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct VarDofs {
    pub first: DofId,
    pub n: u32,
}

impl VarDofs {
    pub const EMPTY: VarDofs = VarDofs { first: 0, n: 0 };

    pub fn new(first: DofId, n: u32) -> Self {
        Self { first, n }
    }

    pub fn indices(&self) -> Range<DofId> {
        self.first..self.first + self.n as DofId
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

/// Global index table of all active DofObjects visible on this rank.
#[derive(Clone, Debug, Default)]
pub struct DofObjectTable {
    n_vars: usize,
    entries: HashMap<DofObjectId, Vec<VarDofs>>,
}

impl DofObjectTable {
    pub fn new(n_vars: usize) -> Self {
        Self {
            n_vars,
            entries: HashMap::new(),
        }
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    /// Register `obj` as active with empty slots for every variable.
    pub fn activate(&mut self, obj: DofObjectId) -> &mut [VarDofs] {
        let n_vars = self.n_vars;
        self.entries
            .entry(obj)
            .or_insert_with(|| vec![VarDofs::EMPTY; n_vars])
    }

    /// Replace every slot of `obj`.
    pub fn set_all(&mut self, obj: DofObjectId, slots: Vec<VarDofs>) -> Result<(), DofMapError> {
        if slots.len() != self.n_vars {
            return Err(DofMapError::ElementDofSizeMismatch {
                expected: self.n_vars,
                got: slots.len(),
            });
        }
        self.entries.insert(obj, slots);
        Ok(())
    }

    pub fn get(&self, obj: DofObjectId) -> Option<&[VarDofs]> {
        self.entries.get(&obj).map(Vec::as_slice)
    }

    pub fn contains(&self, obj: DofObjectId) -> bool {
        self.entries.contains_key(&obj)
    }

    /// Global indices of variable `var` on `obj`.
    pub fn dof_indices(&self, obj: DofObjectId, var: usize) -> Result<Range<DofId>, DofMapError> {
        let slots = self.get(obj).ok_or(DofMapError::MissingDofs(obj))?;
        slots
            .get(var)
            .map(VarDofs::indices)
            .ok_or(DofMapError::VariableIndexOutOfRange {
                index: var,
                len: self.n_vars,
            })
    }

    /// Every global index on `obj`, variables in order.
    pub fn all_dof_indices(&self, obj: DofObjectId) -> Result<Vec<DofId>, DofMapError> {
        let slots = self.get(obj).ok_or(DofMapError::MissingDofs(obj))?;
        Ok(slots.iter().flat_map(VarDofs::indices).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DofObjectId, &Vec<VarDofs>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ids::NodeId;

    #[test]
    fn slots_and_lookup() {
        let mut t = DofObjectTable::new(2);
        let n = DofObjectId::Node(NodeId::new(3).unwrap());
        t.activate(n)[1] = VarDofs::new(10, 2);
        assert_eq!(t.dof_indices(n, 0).unwrap(), 0..0);
        assert_eq!(t.dof_indices(n, 1).unwrap(), 10..12);
        assert_eq!(t.all_dof_indices(n).unwrap(), vec![10, 11]);
        assert!(t.dof_indices(n, 2).is_err());

        let missing = DofObjectId::Node(NodeId::new(4).unwrap());
        assert_eq!(
            t.dof_indices(missing, 0),
            Err(DofMapError::MissingDofs(missing))
        );
        assert!(t.set_all(missing, vec![VarDofs::EMPTY]).is_err());
    }
}
