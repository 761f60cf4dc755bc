//! Sparsity pattern of the global matrix for locally owned rows.
//!
//! Every local active element couples its DOFs with those of each element
//! the coupling functors return for it (itself included), filtered by the
//! variable coupling matrices. Entries landing in rows owned elsewhere are
//! shipped to their owners in one exchange. Counts are split into the
//! diagonal block (`n_nz`, columns in the local range) and the
//! off-diagonal block (`n_oz`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use itertools::iproduct;

use crate::algs::communicator::{Communicator, DofMapCommTags};
use crate::algs::exchange::all_to_all;
use crate::algs::numbering::Numbering;
use crate::algs::wire::{kind, WireReader, WireRowHdr, WireU64, WireWriter};
use crate::data::constraints::DofConstraints;
use crate::data::coupling::CouplingMatrix;
use crate::data::element_constraints::constrain_nothing;
use crate::data::variable::VariableRegistry;
use crate::dof_error::DofMapError;
use crate::ghosting::GhostingFunctorSet;
use crate::topology::ids::{DofId, Rank};
use crate::topology::mesh::{MeshElement, MeshView};

/// Nonzero structure of the locally owned rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparsityPattern {
    row_range: Range<DofId>,
    n_nz: Vec<usize>,
    n_oz: Vec<usize>,
    graph: Option<Vec<BTreeSet<DofId>>>,
}

impl SparsityPattern {
    fn from_rows(row_range: Range<DofId>, rows: Vec<BTreeSet<DofId>>) -> Self {
        let mut p = Self {
            row_range,
            n_nz: Vec::new(),
            n_oz: Vec::new(),
            graph: Some(rows),
        };
        p.recount();
        p
    }

    /// Recompute `n_nz`/`n_oz` from the stored graph.
    pub fn recount(&mut self) {
        let Some(graph) = &self.graph else {
            return;
        };
        let range = self.row_range.clone();
        self.n_nz = graph
            .iter()
            .map(|cols| cols.iter().filter(|c| range.contains(c)).count())
            .collect();
        self.n_oz = graph
            .iter()
            .zip(&self.n_nz)
            .map(|(cols, nz)| cols.len() - nz)
            .collect();
    }

    pub fn row_range(&self) -> Range<DofId> {
        self.row_range.clone()
    }

    pub fn n_local_rows(&self) -> usize {
        self.n_nz.len()
    }

    /// Nonzeros per local row in the diagonal block.
    pub fn n_nz(&self) -> &[usize] {
        &self.n_nz
    }

    /// Nonzeros per local row outside the diagonal block.
    pub fn n_oz(&self) -> &[usize] {
        &self.n_oz
    }

    pub fn has_graph(&self) -> bool {
        self.graph.is_some()
    }

    /// Sorted column indices of global row `row`, if the graph is kept and
    /// the row is local.
    pub fn row(&self, row: DofId) -> Option<&BTreeSet<DofId>> {
        let i = row.checked_sub(self.row_range.start)? as usize;
        self.graph.as_ref()?.get(i)
    }

    /// Add `(row, col)` and keep the counts in step. Returns whether the
    /// entry is new; `false` as well for a non-local row or a dropped graph.
    pub fn insert(&mut self, row: DofId, col: DofId) -> bool {
        if !self.row_range.contains(&row) {
            return false;
        }
        let i = (row - self.row_range.start) as usize;
        let Some(cols) = self.graph.as_mut().and_then(|g| g.get_mut(i)) else {
            return false;
        };
        if !cols.insert(col) {
            return false;
        }
        if self.row_range.contains(&col) {
            self.n_nz[i] += 1;
        } else {
            self.n_oz[i] += 1;
        }
        true
    }

    /// Direct access for augmenters that manage counts themselves.
    pub fn parts_mut(
        &mut self,
    ) -> (
        Option<&mut Vec<BTreeSet<DofId>>>,
        &mut Vec<usize>,
        &mut Vec<usize>,
    ) {
        (self.graph.as_mut(), &mut self.n_nz, &mut self.n_oz)
    }

    pub fn drop_graph(&mut self) {
        self.graph = None;
    }

    /// Largest row length, for bandwidth summaries.
    pub fn max_row_length(&self) -> usize {
        self.n_nz
            .iter()
            .zip(&self.n_oz)
            .map(|(a, b)| a + b)
            .max()
            .unwrap_or(0)
    }
}

/// User hook run on the freshly built pattern (graph present). Must keep
/// `n_nz`/`n_oz` consistent with whatever it adds; [`SparsityPattern::insert`]
/// does so.
pub trait AugmentSparsityPattern: Send + Sync {
    fn augment_sparsity_pattern(&self, pattern: &mut SparsityPattern);
}

/// Closure form of [`AugmentSparsityPattern`].
pub type SparsityFn = Box<dyn Fn(&mut SparsityPattern) + Send + Sync>;

/// Extra sparsity entries attached to a DOF map.
#[derive(Default)]
pub struct SparsityHooks {
    pub object: Option<Box<dyn AugmentSparsityPattern>>,
    pub function: Option<SparsityFn>,
}

impl SparsityHooks {
    pub fn is_empty(&self) -> bool {
        self.object.is_none() && self.function.is_none()
    }

    fn run(&self, pattern: &mut SparsityPattern) {
        if let Some(obj) = &self.object {
            obj.augment_sparsity_pattern(pattern);
        }
        if let Some(f) = &self.function {
            f(pattern);
        }
    }
}

impl fmt::Debug for SparsityHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparsityHooks")
            .field("object", &self.object.is_some())
            .field("function", &self.function.is_some())
            .finish()
    }
}

/// A sparse matrix that can be sized from a pattern.
pub trait PreallocatedMatrix {
    fn preallocate(&mut self, pattern: &SparsityPattern) -> Result<(), DofMapError>;
}

/// Everything the builder reads.
pub struct SparsityInputs<'a> {
    pub mesh: &'a dyn MeshView,
    pub numbering: &'a Numbering,
    pub variables: &'a VariableRegistry,
    pub functors: &'a GhostingFunctorSet,
    pub constraints: &'a DofConstraints,
    /// System-wide variable coupling; `None` couples everything.
    pub dof_coupling: Option<&'a CouplingMatrix>,
    pub calculate_constrained: bool,
    pub keep_graph: bool,
}

fn element_dofs(
    numbering: &Numbering,
    elem: &MeshElement,
    n_vars: usize,
) -> Result<Vec<Vec<DofId>>, DofMapError> {
    (0..n_vars)
        .map(|v| numbering.element_dof_indices(elem, v))
        .collect()
}

fn couples(cm: Option<&CouplingMatrix>, i: usize, j: usize) -> bool {
    cm.is_none_or(|m| m.get(i, j))
}

/// Build the pattern for this rank's rows. Collective.
pub fn build_sparsity<C: Communicator>(
    inputs: &SparsityInputs<'_>,
    hooks: &SparsityHooks,
    comm: &C,
    tags: &DofMapCommTags,
) -> Result<SparsityPattern, DofMapError> {
    let me = comm.rank();
    let numbering = inputs.numbering;
    let local = numbering.local_range(me);
    let n_vars = inputs.variables.n_variables();

    let mut rows: BTreeMap<DofId, BTreeSet<DofId>> = BTreeMap::new();
    let mut add_block = |row_dofs: &[DofId], col_dofs: &[DofId]| -> Result<(), DofMapError> {
        let (mut r, mut c) = (row_dofs.to_vec(), col_dofs.to_vec());
        if inputs.calculate_constrained {
            constrain_nothing(inputs.constraints, &mut r)?;
            constrain_nothing(inputs.constraints, &mut c)?;
        }
        for &row in &r {
            rows.entry(row).or_default().extend(c.iter().copied());
        }
        Ok(())
    };

    for elem in inputs.mesh.active_local_elements(me) {
        let mine = element_dofs(numbering, elem, n_vars)?;
        let mut coupled = inputs.functors.coupled_elements(inputs.mesh, &[elem.id], None);
        coupled.remove(&elem.id);

        for (i, j) in iproduct!(0..n_vars, 0..n_vars) {
            if couples(inputs.dof_coupling, i, j) {
                add_block(&mine[i], &mine[j])?;
            }
        }
        for (other, cm) in coupled {
            let other = inputs.mesh.element_or_err(other)?;
            let theirs = element_dofs(numbering, other, n_vars)?;
            let cm = cm.as_deref().or(inputs.dof_coupling);
            for (i, j) in iproduct!(0..n_vars, 0..n_vars) {
                if couples(cm, i, j) {
                    add_block(&mine[i], &theirs[j])?;
                    add_block(&theirs[j], &mine[i])?;
                }
            }
        }
    }

    // Ship rows owned elsewhere.
    let mut remote: BTreeMap<Rank, Vec<(DofId, BTreeSet<DofId>)>> = BTreeMap::new();
    let mut local_rows: Vec<BTreeSet<DofId>> = vec![BTreeSet::new(); (local.end - local.start) as usize];
    for (row, cols) in rows {
        if local.contains(&row) {
            local_rows[(row - local.start) as usize].extend(cols);
        } else {
            remote.entry(numbering.dof_owner(row)?).or_default().push((row, cols));
        }
    }
    let outgoing = remote
        .into_iter()
        .map(|(r, entries)| {
            let mut w = WireWriter::new(kind::SPARSITY_ROWS, entries.len());
            for (row, cols) in entries {
                w.push(WireRowHdr::new(row, cols.len()));
                for c in cols {
                    w.push(WireU64::of(c));
                }
            }
            (r, w.finish())
        })
        .collect();
    for (peer, buf) in all_to_all(comm, tags.sparsity, outgoing)? {
        if buf.is_empty() {
            continue;
        }
        let (mut r, n) = WireReader::open(&buf, kind::SPARSITY_ROWS)?;
        for _ in 0..n {
            let hdr: WireRowHdr = r.take()?;
            let row = hdr.row();
            if !local.contains(&row) {
                return Err(DofMapError::WireFormat(format!(
                    "rank {peer} sent sparsity row {row} outside {local:?}"
                )));
            }
            let slot = &mut local_rows[(row - local.start) as usize];
            for _ in 0..hdr.n_cols() {
                slot.insert(r.take::<WireU64>()?.get());
            }
        }
        r.finish()?;
    }

    for (i, cols) in local_rows.iter_mut().enumerate() {
        cols.insert(local.start + i as DofId);
    }

    let mut pattern = SparsityPattern::from_rows(local, local_rows);
    hooks.run(&mut pattern);
    if !inputs.keep_graph {
        pattern.drop_graph();
    }
    log::debug!(
        "rank {me}: sparsity for {} rows, max row length {}",
        pattern.n_local_rows(),
        pattern.max_row_length()
    );
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::numbering::{distribute_dofs, NumberingOrder};
    use crate::data::constraints::ConstraintOrigin;
    use crate::data::variable::FeType;
    use crate::topology::mesh::{ElemKind, InMemoryMesh};

    fn strip(n: u64) -> InMemoryMesh {
        let mut mesh = InMemoryMesh::new(1);
        for i in 0..=n {
            mesh.add_node(i + 1, [i as f64, 0.0, 0.0]).unwrap();
        }
        for i in 0..n {
            mesh.add_element(i + 1, ElemKind::Edge2, &[i + 1, i + 2])
                .unwrap();
        }
        mesh.find_neighbors();
        mesh
    }

    fn setup(mesh: &InMemoryMesh) -> (VariableRegistry, Numbering) {
        let mut vars = VariableRegistry::new();
        vars.add_variable("u", FeType::lagrange(1), None).unwrap();
        let num = distribute_dofs(
            mesh,
            &vars,
            NumberingOrder::VariableMajor,
            &NoComm,
            &DofMapCommTags::default(),
        )
        .unwrap();
        (vars, num)
    }

    #[test]
    fn tridiagonal_on_a_strip() {
        let mesh = strip(3);
        let (vars, num) = setup(&mesh);
        let functors = GhostingFunctorSet::new();
        let constraints = DofConstraints::new();
        let inputs = SparsityInputs {
            mesh: &mesh,
            numbering: &num,
            variables: &vars,
            functors: &functors,
            constraints: &constraints,
            dof_coupling: None,
            calculate_constrained: false,
            keep_graph: true,
        };
        let p = build_sparsity(&inputs, &SparsityHooks::default(), &NoComm, &DofMapCommTags::default())
            .unwrap();
        assert_eq!(p.n_nz(), &[2, 3, 3, 2]);
        assert_eq!(p.n_oz(), &[0, 0, 0, 0]);
        assert_eq!(p.row(1).unwrap().iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn constrained_expansion_adds_master_couplings() {
        let mesh = strip(3);
        let (vars, num) = setup(&mesh);
        let functors = GhostingFunctorSet::new();
        let mut constraints = DofConstraints::new();
        // DOF 0 follows DOF 3 (a periodic-style identification).
        constraints
            .add_constraint_row(0, BTreeMap::from([(3, 1.0)]), 0.0, ConstraintOrigin::Periodic, true)
            .unwrap();
        let mut inputs = SparsityInputs {
            mesh: &mesh,
            numbering: &num,
            variables: &vars,
            functors: &functors,
            constraints: &constraints,
            dof_coupling: None,
            calculate_constrained: false,
            keep_graph: true,
        };
        let tags = DofMapCommTags::default();
        let plain = build_sparsity(&inputs, &SparsityHooks::default(), &NoComm, &tags).unwrap();
        assert!(!plain.row(1).unwrap().contains(&3));
        inputs.calculate_constrained = true;
        let expanded = build_sparsity(&inputs, &SparsityHooks::default(), &NoComm, &tags).unwrap();
        assert!(expanded.row(1).unwrap().contains(&3));
        assert!(expanded.row(3).unwrap().contains(&1));
    }

    struct Corner;
    impl AugmentSparsityPattern for Corner {
        fn augment_sparsity_pattern(&self, pattern: &mut SparsityPattern) {
            pattern.insert(0, 3);
        }
    }

    #[test]
    fn hooks_see_the_graph_and_keep_counts() {
        let mesh = strip(3);
        let (vars, num) = setup(&mesh);
        let functors = GhostingFunctorSet::new();
        let constraints = DofConstraints::new();
        let inputs = SparsityInputs {
            mesh: &mesh,
            numbering: &num,
            variables: &vars,
            functors: &functors,
            constraints: &constraints,
            dof_coupling: None,
            calculate_constrained: false,
            keep_graph: false,
        };
        let hooks = SparsityHooks {
            object: Some(Box::new(Corner)),
            function: Some(Box::new(|p: &mut SparsityPattern| {
                p.insert(3, 0);
            })),
        };
        let p = build_sparsity(&inputs, &hooks, &NoComm, &DofMapCommTags::default()).unwrap();
        assert_eq!(p.n_nz(), &[3, 3, 3, 3]);
        assert!(!p.has_graph());
    }
}
