//! Constraint graph: DOF and node constraint rows and their resolution.
//!
//! A constraint row expresses one constrained DOF as an affine combination
//! of master DOFs, `x_d = Σ c_m x_m + rhs`. Rows may reference masters that
//! are themselves constrained; [`DofConstraints::process`] substitutes until
//! every row refers only to unconstrained DOFs. Rows are stored in an arena
//! keyed by the constrained id and resolved by fixed-point passes, so cyclic
//! input is reported instead of looping.
//!
//! Node constraints follow the same shape with a point offset in place of
//! the scalar right-hand side.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::debug_invariants::DebugInvariants;
use crate::dof_error::DofMapError;
use crate::topology::ids::{DofId, NodeId, Point, QoiIndex};

/// Master DOF → coefficient.
pub type DofConstraintRow = BTreeMap<DofId, f64>;

/// Master node → coefficient.
pub type NodeConstraintRow = BTreeMap<NodeId, f64>;

/// Where a constraint row came from. Lower priority values win when two
/// ranks disagree about the same DOF.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ConstraintOrigin {
    User,
    HangingNode,
    Periodic,
    /// Index of the Dirichlet boundary in registration order.
    Dirichlet(u32),
}

impl ConstraintOrigin {
    pub fn priority(self) -> u32 {
        match self {
            ConstraintOrigin::User => 0,
            ConstraintOrigin::HangingNode => 1,
            ConstraintOrigin::Periodic => 2,
            ConstraintOrigin::Dirichlet(k) => 3 + k,
        }
    }

    pub fn from_priority(p: u32) -> Self {
        match p {
            0 => ConstraintOrigin::User,
            1 => ConstraintOrigin::HangingNode,
            2 => ConstraintOrigin::Periodic,
            k => ConstraintOrigin::Dirichlet(k - 3),
        }
    }
}

/// One constrained DOF: coefficients, primal offset and per-QoI adjoint offsets.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DofConstraint {
    pub row: DofConstraintRow,
    pub rhs: f64,
    /// Missing entries mean a homogeneous adjoint constraint.
    pub adjoint_rhs: BTreeMap<QoiIndex, f64>,
    pub origin: ConstraintOrigin,
}

impl DofConstraint {
    pub fn new(row: DofConstraintRow, rhs: f64, origin: ConstraintOrigin) -> Self {
        Self {
            row,
            rhs,
            adjoint_rhs: BTreeMap::new(),
            origin,
        }
    }

    /// Offset for `qoi`, or the primal offset for `None`.
    pub fn rhs_for(&self, qoi: Option<QoiIndex>) -> f64 {
        match qoi {
            None => self.rhs,
            Some(q) => self.adjoint_rhs.get(&q).copied().unwrap_or(0.0),
        }
    }
}

/// One constrained node: coefficients and position offset.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeConstraint {
    pub row: NodeConstraintRow,
    pub offset: Point,
}

// ===== Shared resolution machinery =========================================

trait AffineRow: Clone {
    type Key: Ord + Copy;
    fn terms(&self) -> &BTreeMap<Self::Key, f64>;
    fn terms_mut(&mut self) -> &mut BTreeMap<Self::Key, f64>;
    /// `self.constant += coeff * other.constant`
    fn add_scaled_constant(&mut self, other: &Self, coeff: f64);
}

impl AffineRow for DofConstraint {
    type Key = DofId;
    fn terms(&self) -> &BTreeMap<DofId, f64> {
        &self.row
    }
    fn terms_mut(&mut self) -> &mut BTreeMap<DofId, f64> {
        &mut self.row
    }
    fn add_scaled_constant(&mut self, other: &Self, coeff: f64) {
        self.rhs += coeff * other.rhs;
        for (&q, &v) in &other.adjoint_rhs {
            *self.adjoint_rhs.entry(q).or_insert(0.0) += coeff * v;
        }
    }
}

impl AffineRow for NodeConstraint {
    type Key = NodeId;
    fn terms(&self) -> &BTreeMap<NodeId, f64> {
        &self.row
    }
    fn terms_mut(&mut self) -> &mut BTreeMap<NodeId, f64> {
        &mut self.row
    }
    fn add_scaled_constant(&mut self, other: &Self, coeff: f64) {
        for (a, b) in self.offset.iter_mut().zip(other.offset) {
            *a += coeff * b;
        }
    }
}

/// First key found on a dependency cycle, via iterative DFS with on-stack marks.
fn find_loop<R: AffineRow>(rows: &BTreeMap<R::Key, R>) -> Option<R::Key> {
    #[derive(PartialEq)]
    enum Mark {
        OnStack,
        Done,
    }
    let children = |k: &R::Key| -> Vec<R::Key> {
        rows.get(k)
            .map(|r| r.terms().keys().copied().collect())
            .unwrap_or_default()
    };

    let mut marks: BTreeMap<R::Key, Mark> = BTreeMap::new();
    for &start in rows.keys() {
        if marks.contains_key(&start) {
            continue;
        }
        marks.insert(start, Mark::OnStack);
        let mut stack = vec![(start, children(&start))];
        loop {
            let (node, next) = match stack.last_mut() {
                None => break,
                Some((node, pending)) => (*node, pending.pop()),
            };
            match next {
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
                Some(child) => match marks.get(&child) {
                    Some(Mark::OnStack) => return Some(child),
                    Some(Mark::Done) => {}
                    None if rows.contains_key(&child) => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child, children(&child)));
                    }
                    None => {}
                },
            }
        }
    }
    None
}

/// Substitute constrained masters until no row references a constrained key.
///
/// Each pass rewrites every row against the previous pass' rows, so an
/// acyclic graph of depth `d` settles in `d` passes. Returns the number of
/// passes, or a key on a cycle.
fn resolve_rows<R: AffineRow>(rows: &mut BTreeMap<R::Key, R>) -> Result<usize, R::Key> {
    let max_passes = rows.len() + 1;
    for pass in 0..max_passes {
        let mut updates = Vec::new();
        for (&key, entry) in rows.iter() {
            if !entry.terms().keys().any(|m| rows.contains_key(m)) {
                continue;
            }
            let mut next = entry.clone();
            next.terms_mut().clear();
            for (&m, &c) in entry.terms() {
                match rows.get(&m) {
                    Some(master) => {
                        for (&mm, &cc) in master.terms() {
                            *next.terms_mut().entry(mm).or_insert(0.0) += c * cc;
                        }
                        next.add_scaled_constant(master, c);
                    }
                    None => *next.terms_mut().entry(m).or_insert(0.0) += c,
                }
            }
            if next.terms().contains_key(&key) {
                return Err(key);
            }
            next.terms_mut().retain(|_, c| *c != 0.0);
            updates.push((key, next));
        }
        if updates.is_empty() {
            return Ok(pass);
        }
        for (k, e) in updates {
            rows.insert(k, e);
        }
    }
    let stuck = rows
        .iter()
        .find(|(_, r)| r.terms().keys().any(|m| rows.contains_key(m)))
        .map(|(&k, _)| k);
    match stuck {
        Some(k) => Err(k),
        None => Ok(max_passes),
    }
}

// ===== DOF constraints =====================================================

/// All DOF constraint rows known on this rank.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DofConstraints {
    rows: BTreeMap<DofId, DofConstraint>,
}

impl DofConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a primal row for `dof`.
    ///
    /// With `forbid_overwrite`, an existing row for `dof` is an error;
    /// otherwise it is replaced, keeping any adjoint offsets already set.
    pub fn add_constraint_row(
        &mut self,
        dof: DofId,
        row: DofConstraintRow,
        rhs: f64,
        origin: ConstraintOrigin,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        if row.contains_key(&dof) {
            return Err(DofMapError::SelfReferencingConstraint { dof });
        }
        match self.rows.get_mut(&dof) {
            Some(_) if forbid_overwrite => Err(DofMapError::ConstraintOverwrite { dof }),
            Some(existing) => {
                existing.row = row;
                existing.rhs = rhs;
                existing.origin = origin;
                Ok(())
            }
            None => {
                self.rows.insert(dof, DofConstraint::new(row, rhs, origin));
                Ok(())
            }
        }
    }

    /// Attach an adjoint offset for `qoi` to `dof`.
    ///
    /// The coefficients are shared with the primal row. If `dof` has no
    /// primal row yet, `row` becomes one with a zero primal offset unless
    /// `forbid_overwrite` is set, in which case that is an error.
    pub fn add_adjoint_constraint_row(
        &mut self,
        qoi: QoiIndex,
        dof: DofId,
        row: DofConstraintRow,
        rhs: f64,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        if row.contains_key(&dof) {
            return Err(DofMapError::SelfReferencingConstraint { dof });
        }
        match self.rows.get_mut(&dof) {
            Some(existing) => {
                existing.adjoint_rhs.insert(qoi, rhs);
                Ok(())
            }
            None if forbid_overwrite => Err(DofMapError::MissingPrimalConstraint { dof }),
            None => {
                let mut c = DofConstraint::new(row, 0.0, ConstraintOrigin::User);
                c.adjoint_rhs.insert(qoi, rhs);
                self.rows.insert(dof, c);
                Ok(())
            }
        }
    }

    /// Insert `c` unless a row with equal or higher precedence already exists.
    /// Returns whether the table changed.
    pub fn merge(&mut self, dof: DofId, c: DofConstraint) -> bool {
        match self.rows.get(&dof) {
            Some(existing) if existing.origin.priority() <= c.origin.priority() => false,
            _ => {
                self.rows.insert(dof, c);
                true
            }
        }
    }

    /// Insert `c`, replacing whatever is there. Returns whether the table changed.
    pub fn replace(&mut self, dof: DofId, c: DofConstraint) -> bool {
        match self.rows.get(&dof) {
            Some(existing) if *existing == c => false,
            _ => {
                self.rows.insert(dof, c);
                true
            }
        }
    }

    pub fn remove(&mut self, dof: DofId) -> Option<DofConstraint> {
        self.rows.remove(&dof)
    }

    pub fn get(&self, dof: DofId) -> Option<&DofConstraint> {
        self.rows.get(&dof)
    }

    pub fn is_constrained(&self, dof: DofId) -> bool {
        self.rows.contains_key(&dof)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DofId, &DofConstraint)> {
        self.rows.iter().map(|(&d, c)| (d, c))
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Adjoint offset of `dof` for `qoi`; `None` if `dof` is unconstrained.
    pub fn adjoint_constraint_value(&self, qoi: QoiIndex, dof: DofId) -> Option<f64> {
        self.rows.get(&dof).map(|c| c.rhs_for(Some(qoi)))
    }

    /// Whether any row carries a non-zero adjoint offset for `qoi`.
    pub fn has_heterogeneous_adjoint_constraints(&self, qoi: QoiIndex) -> bool {
        self.rows
            .values()
            .any(|c| c.adjoint_rhs.get(&qoi).is_some_and(|&v| v != 0.0))
    }

    /// Every DOF referenced as a master that is not itself constrained.
    pub fn unconstrained_masters(&self) -> BTreeSet<DofId> {
        self.rows
            .values()
            .flat_map(|c| c.row.keys().copied())
            .filter(|m| !self.rows.contains_key(m))
            .collect()
    }

    /// Every DOF referenced as a master.
    pub fn all_masters(&self) -> BTreeSet<DofId> {
        self.rows
            .values()
            .flat_map(|c| c.row.keys().copied())
            .collect()
    }

    /// After [`DofConstraints::process`], no row may name a constrained master.
    pub fn validate_resolved(&self) -> Result<(), DofMapError> {
        match self.unresolved_row() {
            Some(dof) => Err(DofMapError::UnresolvedConstraint { dof }),
            None => Ok(()),
        }
    }

    fn unresolved_row(&self) -> Option<DofId> {
        self.rows
            .iter()
            .find(|(_, c)| c.row.keys().any(|m| self.rows.contains_key(m)))
            .map(|(&d, _)| d)
    }

    /// Error if some DOF transitively depends on itself.
    pub fn check_for_constraint_loops(&self) -> Result<(), DofMapError> {
        match find_loop(&self.rows) {
            Some(dof) => Err(DofMapError::ConstraintLoop { dof }),
            None => Ok(()),
        }
    }

    /// Resolve every row to unconstrained masters. Idempotent.
    ///
    /// With `check_loops`, a DFS cycle check runs first; the fixed-point
    /// iteration reports cycles on its own either way. On error the rows
    /// are left as they were.
    pub fn process(&mut self, check_loops: bool) -> Result<usize, DofMapError> {
        if check_loops {
            self.check_for_constraint_loops()?;
        }
        let mut rows = self.rows.clone();
        let passes = resolve_rows(&mut rows).map_err(|dof| DofMapError::ConstraintLoop { dof })?;
        self.rows = rows;
        crate::debug_invariants!(self.validate_resolved(), "resolved DOF constraint table");
        log::debug!(
            "resolved {} constraint rows in {} passes",
            self.rows.len(),
            passes
        );
        Ok(passes)
    }
}

impl fmt::Display for DofConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (dof, c) in &self.rows {
            write!(f, "Constraints for DOF {dof}:")?;
            for (m, coeff) in &c.row {
                write!(f, " ({m},{coeff})")?;
            }
            write!(f, " rhs: {}", c.rhs)?;
            for (q, v) in &c.adjoint_rhs {
                write!(f, " qoi {q} rhs: {v}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl DebugInvariants for DofConstraints {
    const TABLE: &'static str = "DOF constraint table";

    fn validate_invariants(&self) -> Result<(), DofMapError> {
        for (&dof, c) in &self.rows {
            if c.row.contains_key(&dof) {
                return Err(DofMapError::SelfReferencingConstraint { dof });
            }
        }
        Ok(())
    }
}

// ===== Node constraints ====================================================

/// All node constraint rows known on this rank.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeConstraints {
    rows: BTreeMap<NodeId, NodeConstraint>,
}

impl NodeConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node_constraint_row(
        &mut self,
        node: NodeId,
        row: NodeConstraintRow,
        offset: Point,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        if row.contains_key(&node) {
            return Err(DofMapError::SelfReferencingNodeConstraint { node });
        }
        if forbid_overwrite && self.rows.contains_key(&node) {
            return Err(DofMapError::NodeConstraintOverwrite { node });
        }
        self.rows.insert(node, NodeConstraint { row, offset });
        Ok(())
    }

    pub fn get(&self, node: NodeId) -> Option<&NodeConstraint> {
        self.rows.get(&node)
    }

    pub fn is_constrained(&self, node: NodeId) -> bool {
        self.rows.contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeConstraint)> {
        self.rows.iter().map(|(&n, c)| (n, c))
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn check_for_constraint_loops(&self) -> Result<(), DofMapError> {
        match find_loop(&self.rows) {
            Some(node) => Err(DofMapError::NodeConstraintLoop { node }),
            None => Ok(()),
        }
    }

    /// Resolve every row to unconstrained master nodes.
    pub fn process(&mut self, check_loops: bool) -> Result<usize, DofMapError> {
        if check_loops {
            self.check_for_constraint_loops()?;
        }
        let mut rows = self.rows.clone();
        let passes =
            resolve_rows(&mut rows).map_err(|node| DofMapError::NodeConstraintLoop { node })?;
        self.rows = rows;
        Ok(passes)
    }
}

impl DebugInvariants for NodeConstraints {
    const TABLE: &'static str = "node constraint table";

    fn validate_invariants(&self) -> Result<(), DofMapError> {
        for (&node, c) in &self.rows {
            if c.row.contains_key(&node) {
                return Err(DofMapError::SelfReferencingNodeConstraint { node });
            }
        }
        Ok(())
    }
}
