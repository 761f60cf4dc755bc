//! `DofMap`: the per-system owner of DOF numbering, constraints, send list
//! and sparsity.
//!
//! Setup runs as a fixed sequence of collective phases:
//!
//! ```text
//! distribute_dofs → create_dof_constraints → scatter → gather
//!     → process_constraints → prepare_send_list → compute_sparsity
//! ```
//!
//! [`DofMap::reinit_constraints`] runs the constraint phases in order.
//! Each phase checks [`DofMapState`] and leaves the map unchanged on error.

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::ops::Range;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::algs::communicator::{Communicator, DofMapCommTags};
use crate::algs::constraint_exchange;
use crate::algs::exchange::allreduce_sum;
use crate::algs::numbering::{self, Numbering, NumberingOrder};
use crate::algs::sparsity::{
    self, AugmentSparsityPattern, PreallocatedMatrix, SparsityHooks, SparsityInputs,
    SparsityPattern,
};
use crate::data::boundary::{BoundaryConditions, BuildContext, DirichletBoundary, PeriodicBoundary};
use crate::data::constraints::{
    ConstraintOrigin, DofConstraintRow, DofConstraints, NodeConstraintRow, NodeConstraints,
};
use crate::data::coupling::CouplingMatrix;
use crate::data::element_constraints::{self as ec, DofValues};
use crate::data::hanging_nodes::create_hanging_node_constraints;
use crate::data::variable::{FeType, Variable, VariableGroup, VariableRegistry};
use crate::debug_invariants::DebugInvariants;
use crate::dof_error::DofMapError;
use crate::ghosting::GhostingFunctorSet;
use crate::topology::ids::{BoundaryId, DofId, DofObjectId, ElemId, NodeId, Point, QoiIndex, Rank, SubdomainId};
use crate::topology::mesh::{MeshElement, MeshView};

/// Tunables of one DOF map.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DofMapOptions {
    pub numbering: NumberingOrder,
    /// Adding a row for an already constrained DOF is an error.
    pub forbid_constraint_overwrite: bool,
    /// Run the explicit cycle check before resolving constraints.
    pub error_on_constraint_loop: bool,
    /// Redistribute constrained couplings onto masters when sizing sparsity.
    pub constrained_sparsity_construction: bool,
    /// Keep the column graph of the sparsity pattern, not just the counts.
    pub need_full_sparsity_pattern: bool,
    /// Write `-c` into master columns of constrained element rows.
    pub asymmetric_constraint_rows: bool,
    /// Distance below which a periodic image matches a partner node.
    pub periodic_tolerance: f64,
}

impl Default for DofMapOptions {
    fn default() -> Self {
        Self {
            numbering: NumberingOrder::VariableMajor,
            forbid_constraint_overwrite: true,
            error_on_constraint_loop: true,
            constrained_sparsity_construction: false,
            need_full_sparsity_pattern: false,
            asymmetric_constraint_rows: true,
            periodic_tolerance: 1e-10,
        }
    }
}

impl DofMapOptions {
    pub fn with_numbering(mut self, order: NumberingOrder) -> Self {
        self.numbering = order;
        self
    }

    pub fn with_constrained_sparsity(mut self, on: bool) -> Self {
        self.constrained_sparsity_construction = on;
        self
    }

    pub fn with_full_sparsity_pattern(mut self, on: bool) -> Self {
        self.need_full_sparsity_pattern = on;
        self
    }
}

/// Lifecycle of a [`DofMap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DofMapState {
    Uninitialized,
    Numbered,
    Constrained,
    Ready,
}

impl DofMapState {
    fn name(self) -> &'static str {
        match self {
            DofMapState::Uninitialized => "Uninitialized",
            DofMapState::Numbered => "Numbered",
            DofMapState::Constrained => "Constrained",
            DofMapState::Ready => "Ready",
        }
    }
}

/// User hook that adds DOFs to the send list before it is frozen.
pub trait AugmentSendList: Send + Sync {
    fn augment_send_list(&self, send_list: &mut Vec<DofId>);
}

/// Closure form of [`AugmentSendList`].
pub type SendListFn = Box<dyn Fn(&mut Vec<DofId>) + Send + Sync>;

#[derive(Default)]
struct SendListHooks {
    object: Option<Box<dyn AugmentSendList>>,
    function: Option<SendListFn>,
}

impl fmt::Debug for SendListHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendListHooks")
            .field("object", &self.object.is_some())
            .field("function", &self.function.is_some())
            .finish()
    }
}

/// DOF numbering and constraints of one system on one rank.
#[derive(Debug)]
pub struct DofMap {
    options: DofMapOptions,
    tags: DofMapCommTags,
    variables: VariableRegistry,
    ghosting: GhostingFunctorSet,
    boundaries: BoundaryConditions,
    dof_coupling: Option<Arc<CouplingMatrix>>,

    state: DofMapState,
    rank: Rank,
    size: usize,
    numbering: Numbering,
    user_constraints: DofConstraints,
    user_node_constraints: NodeConstraints,
    constraints: DofConstraints,
    node_constraints: NodeConstraints,
    stashed: Option<DofConstraints>,
    send_list: Vec<DofId>,
    send_list_hooks: SendListHooks,
    sparsity: Option<Arc<SparsityPattern>>,
    sparsity_hooks: SparsityHooks,
}

impl Default for DofMap {
    fn default() -> Self {
        Self::new(DofMapOptions::default())
    }
}

impl DofMap {
    pub fn new(options: DofMapOptions) -> Self {
        Self::with_tags(options, DofMapCommTags::default())
    }

    /// Use distinct tags when several maps exchange over one communicator.
    pub fn with_tags(options: DofMapOptions, tags: DofMapCommTags) -> Self {
        Self {
            options,
            tags,
            variables: VariableRegistry::new(),
            ghosting: GhostingFunctorSet::new(),
            boundaries: BoundaryConditions::default(),
            dof_coupling: None,
            state: DofMapState::Uninitialized,
            rank: 0,
            size: 1,
            numbering: Numbering::default(),
            user_constraints: DofConstraints::new(),
            user_node_constraints: NodeConstraints::new(),
            constraints: DofConstraints::new(),
            node_constraints: NodeConstraints::new(),
            stashed: None,
            send_list: Vec::new(),
            send_list_hooks: SendListHooks::default(),
            sparsity: None,
            sparsity_hooks: SparsityHooks::default(),
        }
    }

    pub fn options(&self) -> &DofMapOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut DofMapOptions {
        &mut self.options
    }

    pub fn state(&self) -> DofMapState {
        self.state
    }

    fn require(&self, at_least: DofMapState) -> Result<(), DofMapError> {
        if self.state < at_least {
            return Err(DofMapError::InvalidState {
                expected: at_least.name(),
                found: self.state.name(),
            });
        }
        Ok(())
    }

    fn check_dof(&self, dof: DofId) -> Result<(), DofMapError> {
        if self.state >= DofMapState::Numbered && dof >= self.numbering.n_dofs {
            return Err(DofMapError::DofOutOfRange {
                dof,
                n_dofs: self.numbering.n_dofs,
            });
        }
        Ok(())
    }

    fn check_processor(&self, p: Rank) -> Result<(), DofMapError> {
        if p >= self.size {
            return Err(DofMapError::ProcessorOutOfRange {
                rank: p,
                size: self.size,
            });
        }
        Ok(())
    }

    // ----- variables -------------------------------------------------------

    fn require_unnumbered(&self) -> Result<(), DofMapError> {
        if self.state != DofMapState::Uninitialized {
            return Err(DofMapError::InvalidState {
                expected: DofMapState::Uninitialized.name(),
                found: self.state.name(),
            });
        }
        Ok(())
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        active_subdomains: Option<BTreeSet<SubdomainId>>,
    ) -> Result<usize, DofMapError> {
        self.require_unnumbered()?;
        self.variables.add_variable(name, fe_type, active_subdomains)
    }

    pub fn add_variables(
        &mut self,
        names: &[&str],
        fe_type: FeType,
        active_subdomains: Option<BTreeSet<SubdomainId>>,
    ) -> Result<usize, DofMapError> {
        self.require_unnumbered()?;
        self.variables.add_variables(names, fe_type, active_subdomains)
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.variables
    }

    pub fn n_variables(&self) -> usize {
        self.variables.n_variables()
    }

    pub fn n_variable_groups(&self) -> usize {
        self.variables.n_variable_groups()
    }

    pub fn variable(&self, i: usize) -> Result<&Variable, DofMapError> {
        self.variables.variable(i)
    }

    pub fn variable_group(&self, g: usize) -> Result<&VariableGroup, DofMapError> {
        self.variables.variable_group(g)
    }

    pub fn variable_type(&self, i: usize) -> Result<FeType, DofMapError> {
        self.variables.variable_type(i)
    }

    pub fn variable_order(&self, i: usize) -> Result<u32, DofMapError> {
        self.variables.variable_order(i)
    }

    pub fn variable_group_order(&self, g: usize) -> Result<u32, DofMapError> {
        self.variables.variable_group_order(g)
    }

    pub fn has_blocked_representation(&self) -> bool {
        self.variables.has_blocked_representation()
    }

    pub fn block_size(&self) -> usize {
        self.variables.block_size()
    }

    // ----- ghosting --------------------------------------------------------

    pub fn ghosting(&self) -> &GhostingFunctorSet {
        &self.ghosting
    }

    /// Registration and removal of coupling/algebraic functors.
    pub fn ghosting_mut(&mut self) -> &mut GhostingFunctorSet {
        self.sparsity = None;
        &mut self.ghosting
    }

    /// Restrict which variables couple to which (`None` = all).
    pub fn set_dof_coupling(&mut self, coupling: Option<Arc<CouplingMatrix>>) -> Result<(), DofMapError> {
        if let Some(cm) = &coupling {
            if cm.size() != self.variables.n_variables() {
                return Err(DofMapError::InvalidVariableConfiguration(format!(
                    "coupling matrix of size {} for {} variables",
                    cm.size(),
                    self.variables.n_variables()
                )));
            }
        }
        self.ghosting.set_default_coupling(coupling.clone());
        self.dof_coupling = coupling;
        self.sparsity = None;
        Ok(())
    }

    pub fn dof_coupling(&self) -> Option<&Arc<CouplingMatrix>> {
        self.dof_coupling.as_ref()
    }

    // ----- boundaries ------------------------------------------------------

    pub fn add_dirichlet_boundary(&mut self, bc: DirichletBoundary) {
        self.boundaries.add_dirichlet_boundary(bc);
    }

    pub fn remove_dirichlet_boundary(&mut self, bc: &DirichletBoundary) -> bool {
        self.boundaries.remove_dirichlet_boundary(bc)
    }

    pub fn add_adjoint_dirichlet_boundary(&mut self, qoi: QoiIndex, bc: DirichletBoundary) {
        self.boundaries.add_adjoint_dirichlet_boundary(qoi, bc);
    }

    pub fn remove_adjoint_dirichlet_boundary(&mut self, qoi: QoiIndex, bc: &DirichletBoundary) -> bool {
        self.boundaries.remove_adjoint_dirichlet_boundary(qoi, bc)
    }

    pub fn has_adjoint_dirichlet_boundaries(&self, qoi: QoiIndex) -> bool {
        self.boundaries.has_adjoint_dirichlet_boundaries(qoi)
    }

    pub fn add_periodic_boundary(&mut self, pb: PeriodicBoundary, with_inverse: bool) {
        self.boundaries.add_periodic_boundary(pb, with_inverse);
    }

    pub fn is_periodic_boundary(&self, bid: BoundaryId) -> bool {
        self.boundaries.is_periodic_boundary(bid)
    }

    pub fn check_dirichlet_bcid_consistency(&self, mesh: &dyn MeshView) -> Result<(), DofMapError> {
        self.boundaries.check_dirichlet_bcid_consistency(mesh)
    }

    pub fn boundaries(&self) -> &BoundaryConditions {
        &self.boundaries
    }

    // ----- numbering -------------------------------------------------------

    /// Number every DOF visible on this rank and build the algebraic send
    /// list. Collective. Returns the global DOF count.
    pub fn distribute_dofs<C: Communicator>(
        &mut self,
        mesh: &dyn MeshView,
        comm: &C,
    ) -> Result<DofId, DofMapError> {
        let numbering = numbering::distribute_dofs(
            mesh,
            &self.variables,
            self.options.numbering,
            comm,
            &self.tags,
        )?;
        let send_list = algebraic_send_list(mesh, &numbering, &self.variables, &self.ghosting, comm.rank())?;

        self.rank = comm.rank();
        self.size = comm.size();
        self.numbering = numbering;
        self.send_list = send_list;
        self.constraints.clear();
        self.node_constraints.clear();
        self.stashed = None;
        self.sparsity = None;
        self.state = DofMapState::Numbered;
        log::debug!(
            "rank {}: distributed {} DOFs, {} local, send list {}",
            self.rank,
            self.numbering.n_dofs,
            self.n_local_dofs(),
            self.send_list.len()
        );
        Ok(self.numbering.n_dofs)
    }

    pub fn n_dofs(&self) -> DofId {
        self.numbering.n_dofs
    }

    pub fn n_scalar_dofs(&self) -> DofId {
        self.numbering.n_scalar_dofs
    }

    pub fn n_local_dofs(&self) -> DofId {
        let r = self.local_dof_range();
        r.end - r.start
    }

    pub fn n_dofs_on_processor(&self, p: Rank) -> Result<DofId, DofMapError> {
        Ok(self.end_dof(p)? - self.first_dof(p)?)
    }

    pub fn first_dof(&self, p: Rank) -> Result<DofId, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.check_processor(p)?;
        Ok(self.numbering.first_dof[p])
    }

    pub fn end_dof(&self, p: Rank) -> Result<DofId, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.check_processor(p)?;
        Ok(self.numbering.end_dof[p])
    }

    /// `[first_dof, end_dof)` of this rank.
    pub fn local_dof_range(&self) -> Range<DofId> {
        self.numbering.local_range(self.rank)
    }

    pub fn dof_owner(&self, dof: DofId) -> Result<Rank, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.numbering.dof_owner(dof)
    }

    /// Whether this rank owns `dof`.
    pub fn local_index(&self, dof: DofId) -> bool {
        self.local_dof_range().contains(&dof)
    }

    /// Whether `dof` is owned here or on the send list.
    pub fn semilocal_index(&self, dof: DofId) -> bool {
        self.local_index(dof) || self.send_list.binary_search(&dof).is_ok()
    }

    pub fn all_semilocal_indices(&self, dofs: &[DofId]) -> bool {
        dofs.iter().all(|&d| self.semilocal_index(d))
    }

    /// Whether every DOF of `elem` (and every master of a constrained one)
    /// can be read on this rank.
    pub fn is_evaluable(&self, elem: &MeshElement) -> Result<bool, DofMapError> {
        let mut dofs = self.dof_indices(elem)?;
        ec::constrain_nothing(&self.constraints, &mut dofs)?;
        Ok(self.all_semilocal_indices(&dofs))
    }

    /// All DOFs of `elem`, variable by variable.
    pub fn dof_indices(&self, elem: &MeshElement) -> Result<Vec<DofId>, DofMapError> {
        self.require(DofMapState::Numbered)?;
        let mut out = Vec::new();
        for v in 0..self.variables.n_variables() {
            out.extend(self.numbering.element_dof_indices(elem, v)?);
        }
        Ok(out)
    }

    /// DOFs of variable `var` on `elem` in the element's local basis order.
    pub fn dof_indices_for_variable(
        &self,
        elem: &MeshElement,
        var: usize,
    ) -> Result<Vec<DofId>, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.variables.variable(var)?;
        self.numbering.element_dof_indices(elem, var)
    }

    /// All DOFs on `node`, variable by variable.
    pub fn node_dof_indices(&self, node: NodeId) -> Result<Vec<DofId>, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.numbering.table.all_dof_indices(DofObjectId::Node(node))
    }

    pub fn scalar_dof_indices(&self, var: usize) -> Result<Vec<DofId>, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.variables.variable(var)?;
        match self.numbering.scalar_dofs.get(var) {
            Some(Some(r)) => Ok(r.clone().collect()),
            _ => Err(DofMapError::InvalidVariableConfiguration(format!(
                "variable {var} is not a SCALAR variable"
            ))),
        }
    }

    /// Sorted owned DOFs of variable `var`.
    pub fn local_variable_indices(
        &self,
        mesh: &dyn MeshView,
        var: usize,
    ) -> Result<Vec<DofId>, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.variables.variable(var)?;
        let range = self.local_dof_range();
        let mut out = BTreeSet::new();
        for elem in mesh.active_elements() {
            out.extend(
                self.numbering
                    .element_dof_indices(elem, var)?
                    .into_iter()
                    .filter(|d| range.contains(d)),
            );
        }
        if let Some(Some(r)) = self.numbering.scalar_dofs.get(var) {
            out.extend(r.clone().filter(|d| range.contains(d)));
        }
        Ok(out.into_iter().collect())
    }

    // ----- send list -------------------------------------------------------

    pub fn attach_extra_send_list_object(&mut self, hook: Box<dyn AugmentSendList>) {
        self.send_list_hooks.object = Some(hook);
    }

    pub fn attach_extra_send_list_function(&mut self, hook: SendListFn) {
        self.send_list_hooks.function = Some(hook);
    }

    /// Sort, deduplicate and run user augmentation. Freezes the map.
    pub fn prepare_send_list(&mut self) -> Result<(), DofMapError> {
        self.require(DofMapState::Numbered)?;
        if let Some(obj) = &self.send_list_hooks.object {
            obj.augment_send_list(&mut self.send_list);
        }
        if let Some(f) = &self.send_list_hooks.function {
            f(&mut self.send_list);
        }
        let range = self.local_dof_range();
        let n_dofs = self.numbering.n_dofs;
        if let Some(&bad) = self.send_list.iter().find(|&&d| d >= n_dofs) {
            return Err(DofMapError::DofOutOfRange { dof: bad, n_dofs });
        }
        self.send_list.retain(|d| !range.contains(d));
        self.send_list.sort_unstable();
        self.send_list.dedup();
        self.state = DofMapState::Ready;
        Ok(())
    }

    pub fn clear_send_list(&mut self) {
        self.send_list.clear();
    }

    /// Rebuild the send list from the algebraic ghosting functors and the
    /// current constraints.
    pub fn reinit_send_list(&mut self, mesh: &dyn MeshView) -> Result<(), DofMapError> {
        self.require(DofMapState::Numbered)?;
        let mut list = algebraic_send_list(mesh, &self.numbering, &self.variables, &self.ghosting, self.rank)?;
        let range = self.local_dof_range();
        list.extend(self.constraints.all_masters().into_iter().filter(|d| !range.contains(d)));
        self.send_list = list;
        self.prepare_send_list()
    }

    pub fn get_send_list(&self) -> &[DofId] {
        &self.send_list
    }

    // ----- constraints -----------------------------------------------------

    fn build_context<'a>(&'a self, mesh: &'a dyn MeshView) -> BuildContext<'a> {
        BuildContext {
            mesh,
            dofs: &self.numbering.table,
            variables: &self.variables,
            local_range: self.local_dof_range(),
        }
    }

    /// Rebuild every locally derivable constraint: user rows, then hanging
    /// nodes, periodic boundaries, Dirichlet boundaries (in registration
    /// order) and adjoint Dirichlet offsets. Returns the local row count.
    pub fn create_dof_constraints(
        &mut self,
        mesh: &dyn MeshView,
        time: f64,
    ) -> Result<usize, DofMapError> {
        self.require(DofMapState::Numbered)?;
        self.boundaries.check_dirichlet_bcid_consistency(mesh)?;

        let mut dofs = self.user_constraints.clone();
        let mut nodes = self.user_node_constraints.clone();
        let ctx = self.build_context(mesh);
        let hanging = create_hanging_node_constraints(&ctx, &mut dofs, &mut nodes)?;
        let periodic = self
            .boundaries
            .create_periodic_constraints(&ctx, self.options.periodic_tolerance, &mut dofs)?;
        let dirichlet = self.boundaries.create_dirichlet_constraints(&ctx, time, &mut dofs)?;
        let adjoint = self
            .boundaries
            .create_adjoint_dirichlet_constraints(&ctx, time, &mut dofs)?;
        log::debug!(
            "rank {}: {} user, {hanging} hanging, {periodic} periodic, {dirichlet} Dirichlet, {adjoint} adjoint rows",
            self.rank,
            self.user_constraints.len()
        );

        self.constraints = dofs;
        self.node_constraints = nodes;
        self.sparsity = None;
        self.state = DofMapState::Numbered;
        Ok(self.constraints.len())
    }

    /// Push local rows to the ranks that need them. Collective.
    pub fn scatter_constraints<C: Communicator>(&mut self, comm: &C) -> Result<usize, DofMapError> {
        self.require(DofMapState::Numbered)?;
        constraint_exchange::scatter_constraints(comm, &self.tags, &self.numbering, &mut self.constraints)
    }

    /// Pull rows for send-list DOFs and their masters until closure. Collective.
    pub fn gather_constraints<C: Communicator>(&mut self, comm: &C) -> Result<usize, DofMapError> {
        self.require(DofMapState::Numbered)?;
        let wanted: BTreeSet<DofId> = self.send_list.iter().copied().collect();
        constraint_exchange::gather_constraints(
            comm,
            &self.tags,
            &self.numbering,
            &mut self.constraints,
            &wanted,
        )
    }

    /// Resolve every row to unconstrained masters and put the non-local
    /// masters on the send list.
    pub fn process_constraints(&mut self) -> Result<(), DofMapError> {
        self.require(DofMapState::Numbered)?;
        let check = self.options.error_on_constraint_loop;
        let mut nodes = self.node_constraints.clone();
        nodes.process(check)?;
        self.constraints.process(check)?;
        self.node_constraints = nodes;
        self.constraints.debug_assert_invariants();
        self.node_constraints.debug_assert_invariants();

        let range = self.local_dof_range();
        self.send_list.extend(
            self.constraints
                .unconstrained_masters()
                .into_iter()
                .filter(|d| !range.contains(d)),
        );
        self.send_list.sort_unstable();
        self.send_list.dedup();
        self.sparsity = None;
        self.state = DofMapState::Constrained;
        Ok(())
    }

    /// create → scatter → gather → process. Collective.
    pub fn reinit_constraints<C: Communicator>(
        &mut self,
        mesh: &dyn MeshView,
        comm: &C,
        time: f64,
    ) -> Result<(), DofMapError> {
        self.create_dof_constraints(mesh, time)?;
        self.scatter_constraints(comm)?;
        self.gather_constraints(comm)?;
        self.process_constraints()
    }

    /// User row for `dof`; kept across [`DofMap::create_dof_constraints`].
    pub fn add_constraint_row(
        &mut self,
        dof: DofId,
        row: DofConstraintRow,
        rhs: f64,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        self.check_dof(dof)?;
        for &m in row.keys() {
            self.check_dof(m)?;
        }
        self.constraints
            .add_constraint_row(dof, row.clone(), rhs, ConstraintOrigin::User, forbid_overwrite)?;
        self.user_constraints
            .add_constraint_row(dof, row, rhs, ConstraintOrigin::User, false)?;
        self.sparsity = None;
        Ok(())
    }

    /// Homogeneous user row.
    pub fn add_homogeneous_constraint_row(
        &mut self,
        dof: DofId,
        row: DofConstraintRow,
    ) -> Result<(), DofMapError> {
        let forbid = self.options.forbid_constraint_overwrite;
        self.add_constraint_row(dof, row, 0.0, forbid)
    }

    pub fn add_adjoint_constraint_row(
        &mut self,
        qoi: QoiIndex,
        dof: DofId,
        row: DofConstraintRow,
        rhs: f64,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        self.check_dof(dof)?;
        let had_row = self.constraints.is_constrained(dof);
        self.constraints
            .add_adjoint_constraint_row(qoi, dof, row.clone(), rhs, forbid_overwrite)?;
        // Offsets on generated rows are rebuilt with them; only user rows are kept.
        if self.user_constraints.is_constrained(dof) || !had_row {
            self.user_constraints
                .add_adjoint_constraint_row(qoi, dof, row, rhs, false)?;
        }
        Ok(())
    }

    pub fn add_node_constraint_row(
        &mut self,
        node: NodeId,
        row: NodeConstraintRow,
        offset: Point,
        forbid_overwrite: bool,
    ) -> Result<(), DofMapError> {
        self.node_constraints
            .add_node_constraint_row(node, row.clone(), offset, forbid_overwrite)?;
        self.user_node_constraints
            .add_node_constraint_row(node, row, offset, false)
    }

    pub fn is_constrained_dof(&self, dof: DofId) -> bool {
        self.constraints.is_constrained(dof)
    }

    pub fn is_constrained_node(&self, node: NodeId) -> bool {
        self.node_constraints.is_constrained(node)
    }

    /// Constrained DOFs across all ranks. Collective.
    pub fn n_constrained_dofs<C: Communicator>(&self, comm: &C) -> Result<DofId, DofMapError> {
        allreduce_sum(comm, self.tags.reduce, self.n_local_constrained_dofs())
    }

    pub fn n_local_constrained_dofs(&self) -> DofId {
        let range = self.local_dof_range();
        self.constraints
            .iter()
            .filter(|(d, _)| range.contains(d))
            .count() as DofId
    }

    pub fn n_constrained_nodes(&self) -> usize {
        self.node_constraints.len()
    }

    pub fn has_heterogeneous_adjoint_constraints(&self, qoi: QoiIndex) -> bool {
        self.constraints.has_heterogeneous_adjoint_constraints(qoi)
    }

    pub fn adjoint_constraint_value(&self, qoi: QoiIndex, dof: DofId) -> Option<f64> {
        self.constraints.adjoint_constraint_value(qoi, dof)
    }

    pub fn get_dof_constraints(&self) -> &DofConstraints {
        &self.constraints
    }

    pub fn get_node_constraints(&self) -> &NodeConstraints {
        &self.node_constraints
    }

    /// Printable rows of the DOFs this rank owns.
    pub fn get_local_constraints(&self) -> String {
        let range = self.local_dof_range();
        let mut local = DofConstraints::new();
        for (d, c) in self.constraints.iter().filter(|(d, _)| range.contains(d)) {
            local.replace(d, c.clone());
        }
        local.to_string()
    }

    pub fn check_for_constraint_loops(&self) -> Result<(), DofMapError> {
        self.constraints.check_for_constraint_loops()
    }

    /// Move the current constraints aside, leaving none active.
    ///
    /// The caller guarantees that whatever replaces them does not reach
    /// beyond the send list and sparsity already computed.
    pub fn stash_dof_constraints(&mut self) -> Result<(), DofMapError> {
        if self.stashed.as_ref().is_some_and(|s| !s.is_empty()) {
            return Err(DofMapError::StashMisuse("constraints already stashed"));
        }
        self.stashed = Some(std::mem::take(&mut self.constraints));
        Ok(())
    }

    /// Restore stashed constraints; the active set must be empty.
    pub fn unstash_dof_constraints(&mut self) -> Result<(), DofMapError> {
        if !self.constraints.is_empty() {
            return Err(DofMapError::StashMisuse("unstash over live constraints"));
        }
        let stashed = self
            .stashed
            .take()
            .ok_or(DofMapError::StashMisuse("nothing stashed"))?;
        self.constraints = stashed;
        Ok(())
    }

    /// Exchange the active and stashed constraint sets. With nothing
    /// stashed, the active set trades places with an empty one.
    pub fn swap_dof_constraints(&mut self) -> Result<(), DofMapError> {
        let stashed = self.stashed.get_or_insert_with(DofConstraints::new);
        std::mem::swap(stashed, &mut self.constraints);
        Ok(())
    }

    // ----- element-level constraint application ----------------------------

    pub fn build_constraint_matrix(
        &self,
        dofs: &mut Vec<DofId>,
    ) -> Result<Option<DMatrix<f64>>, DofMapError> {
        ec::build_constraint_matrix(&self.constraints, dofs)
    }

    pub fn build_constraint_matrix_and_vector(
        &self,
        dofs: &mut Vec<DofId>,
        qoi: Option<QoiIndex>,
    ) -> Result<Option<(DMatrix<f64>, DVector<f64>)>, DofMapError> {
        ec::build_constraint_matrix_and_vector(&self.constraints, dofs, qoi)
    }

    pub fn constrain_nothing(&self, dofs: &mut Vec<DofId>) -> Result<(), DofMapError> {
        ec::constrain_nothing(&self.constraints, dofs)
    }

    pub fn constrain_element_matrix(
        &self,
        k: &mut DMatrix<f64>,
        dofs: &mut Vec<DofId>,
    ) -> Result<(), DofMapError> {
        ec::constrain_element_matrix(&self.constraints, k, dofs, self.options.asymmetric_constraint_rows)
    }

    pub fn constrain_element_matrix_rect(
        &self,
        k: &mut DMatrix<f64>,
        row_dofs: &mut Vec<DofId>,
        col_dofs: &mut Vec<DofId>,
    ) -> Result<(), DofMapError> {
        ec::constrain_element_matrix_rect(
            &self.constraints,
            k,
            row_dofs,
            col_dofs,
            self.options.asymmetric_constraint_rows,
        )
    }

    pub fn constrain_element_vector(
        &self,
        f: &mut DVector<f64>,
        dofs: &mut Vec<DofId>,
    ) -> Result<(), DofMapError> {
        ec::constrain_element_vector(&self.constraints, f, dofs)
    }

    pub fn constrain_element_matrix_and_vector(
        &self,
        k: &mut DMatrix<f64>,
        f: &mut DVector<f64>,
        dofs: &mut Vec<DofId>,
    ) -> Result<(), DofMapError> {
        ec::constrain_element_matrix_and_vector(
            &self.constraints,
            k,
            f,
            dofs,
            self.options.asymmetric_constraint_rows,
        )
    }

    pub fn heterogenously_constrain_element_matrix_and_vector(
        &self,
        k: &mut DMatrix<f64>,
        f: &mut DVector<f64>,
        dofs: &mut Vec<DofId>,
        qoi: Option<QoiIndex>,
    ) -> Result<(), DofMapError> {
        ec::heterogenously_constrain_element_matrix_and_vector(
            &self.constraints,
            k,
            f,
            dofs,
            self.options.asymmetric_constraint_rows,
            qoi,
        )
    }

    pub fn heterogenously_constrain_element_vector(
        &self,
        k: &DMatrix<f64>,
        f: &mut DVector<f64>,
        dofs: &mut Vec<DofId>,
        qoi: Option<QoiIndex>,
    ) -> Result<(), DofMapError> {
        ec::heterogenously_constrain_element_vector(
            &self.constraints,
            k,
            f,
            dofs,
            self.options.asymmetric_constraint_rows,
            qoi,
        )
    }

    pub fn constrain_element_dyad_matrix(
        &self,
        v: &mut DVector<f64>,
        w: &mut DVector<f64>,
        dofs: &mut Vec<DofId>,
    ) -> Result<(), DofMapError> {
        ec::constrain_element_dyad_matrix(&self.constraints, v, w, dofs)
    }

    // ----- global enforcement ---------------------------------------------

    pub fn enforce_constraints_exactly<V: DofValues + ?Sized>(
        &self,
        v: &mut V,
        homogeneous: bool,
    ) -> Result<(), DofMapError> {
        ec::enforce_constraints_exactly(&self.constraints, v, self.local_dof_range(), None, homogeneous)
    }

    pub fn enforce_adjoint_constraints_exactly<V: DofValues + ?Sized>(
        &self,
        v: &mut V,
        qoi: QoiIndex,
    ) -> Result<(), DofMapError> {
        ec::enforce_constraints_exactly(&self.constraints, v, self.local_dof_range(), Some(qoi), false)
    }

    pub fn enforce_constraints_on_residual<V: DofValues + ?Sized, S: DofValues + ?Sized>(
        &self,
        residual: &mut V,
        solution: &S,
        homogeneous: bool,
    ) -> Result<(), DofMapError> {
        ec::enforce_constraints_on_residual(
            &self.constraints,
            residual,
            solution,
            self.local_dof_range(),
            homogeneous,
        )
    }

    // ----- sparsity --------------------------------------------------------

    pub fn attach_extra_sparsity_object(&mut self, hook: Box<dyn AugmentSparsityPattern>) {
        self.sparsity_hooks.object = Some(hook);
        self.sparsity = None;
    }

    pub fn attach_extra_sparsity_function(&mut self, hook: sparsity::SparsityFn) {
        self.sparsity_hooks.function = Some(hook);
        self.sparsity = None;
    }

    /// Build (or reuse) the sparsity pattern of the local rows. Collective.
    ///
    /// With constrained construction on, the constraints must be processed
    /// first; the expansion reads the resolved rows.
    pub fn compute_sparsity<C: Communicator>(
        &mut self,
        mesh: &dyn MeshView,
        comm: &C,
    ) -> Result<Arc<SparsityPattern>, DofMapError> {
        if self.options.constrained_sparsity_construction {
            self.require(DofMapState::Constrained)?;
        } else {
            self.require(DofMapState::Numbered)?;
        }
        if let Some(p) = &self.sparsity {
            return Ok(p.clone());
        }
        let inputs = SparsityInputs {
            mesh,
            numbering: &self.numbering,
            variables: &self.variables,
            functors: &self.ghosting,
            constraints: &self.constraints,
            dof_coupling: self.dof_coupling.as_deref(),
            calculate_constrained: self.options.constrained_sparsity_construction,
            keep_graph: self.options.need_full_sparsity_pattern,
        };
        let pattern = Arc::new(sparsity::build_sparsity(&inputs, &self.sparsity_hooks, comm, &self.tags)?);
        self.sparsity = Some(pattern.clone());
        Ok(pattern)
    }

    pub fn computed_sparsity_already(&self) -> bool {
        self.sparsity.is_some()
    }

    pub fn get_sparsity_pattern(&self) -> Option<Arc<SparsityPattern>> {
        self.sparsity.clone()
    }

    /// Diagonal-block nonzeros per local row; empty before `compute_sparsity`.
    pub fn get_n_nz(&self) -> &[usize] {
        self.sparsity.as_deref().map(SparsityPattern::n_nz).unwrap_or(&[])
    }

    /// Off-diagonal-block nonzeros per local row; empty before `compute_sparsity`.
    pub fn get_n_oz(&self) -> &[usize] {
        self.sparsity.as_deref().map(SparsityPattern::n_oz).unwrap_or(&[])
    }

    pub fn clear_sparsity(&mut self) {
        self.sparsity = None;
    }

    pub fn update_sparsity_pattern(&self, matrix: &mut dyn PreallocatedMatrix) -> Result<(), DofMapError> {
        let p = self.sparsity.as_deref().ok_or(DofMapError::InvalidState {
            expected: "sparsity computed",
            found: "no sparsity pattern",
        })?;
        matrix.preallocate(p)
    }

    /// Size every matrix from the one shared pattern.
    pub fn update_sparsity_patterns(
        &self,
        matrices: &mut [&mut dyn PreallocatedMatrix],
    ) -> Result<(), DofMapError> {
        for m in matrices.iter_mut() {
            self.update_sparsity_pattern(&mut **m)?;
        }
        Ok(())
    }

    // ----- diagnostics and lifecycle --------------------------------------

    /// Human-readable summary. Not a stable format.
    pub fn get_info(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "DofMap state {:?}, rank {} of {}", self.state, self.rank, self.size);
        let _ = writeln!(
            s,
            "  n_dofs {} ({} scalar), local [{}, {})",
            self.numbering.n_dofs,
            self.numbering.n_scalar_dofs,
            self.local_dof_range().start,
            self.local_dof_range().end
        );
        for (p, (f, e)) in self.numbering.first_dof.iter().zip(&self.numbering.end_dof).enumerate() {
            let _ = writeln!(s, "  rank {p}: [{f}, {e})");
        }
        for v in self.variables.variables() {
            let _ = writeln!(
                s,
                "  variable {} `{}`: {:?} order {}",
                v.number(),
                v.name(),
                v.fe_type().family,
                v.fe_type().order
            );
        }
        let _ = writeln!(s, "  send list: {} DOFs", self.send_list.len());
        let _ = writeln!(
            s,
            "  constraints: {} rows ({} local), {} node rows",
            self.constraints.len(),
            self.n_local_constrained_dofs(),
            self.node_constraints.len()
        );
        if let Some(p) = &self.sparsity {
            let rows = p.n_local_rows().max(1) as f64;
            let avg_nz = p.n_nz().iter().sum::<usize>() as f64 / rows;
            let avg_oz = p.n_oz().iter().sum::<usize>() as f64 / rows;
            let _ = writeln!(
                s,
                "  sparsity: max row {}, avg on-rank {avg_nz:.2}, avg off-rank {avg_oz:.2}",
                p.max_row_length()
            );
        }
        s
    }

    pub fn print_info(&self) {
        log::info!("{}", self.get_info());
    }

    /// Back to `Uninitialized`. Variables, ghosting functors, boundaries
    /// and attached hooks survive.
    pub fn clear(&mut self) {
        self.state = DofMapState::Uninitialized;
        self.rank = 0;
        self.size = 1;
        self.numbering = Numbering::default();
        self.constraints.clear();
        self.node_constraints.clear();
        self.user_constraints.clear();
        self.user_node_constraints.clear();
        self.stashed = None;
        self.send_list.clear();
        self.sparsity = None;
    }
}

/// Non-owned DOFs on local elements and on the elements the algebraic
/// functors ghost for them.
fn algebraic_send_list(
    mesh: &dyn MeshView,
    numbering: &Numbering,
    variables: &VariableRegistry,
    ghosting: &GhostingFunctorSet,
    rank: Rank,
) -> Result<Vec<DofId>, DofMapError> {
    let local: Vec<ElemId> = mesh.active_local_elements(rank).map(|e| e.id).collect();
    let mut elems: BTreeSet<ElemId> = local.iter().copied().collect();
    elems.extend(ghosting.algebraic_elements(mesh, &local, Some(rank)).into_keys());
    let range = numbering.local_range(rank);
    let mut out = BTreeSet::new();
    for id in elems {
        let elem = mesh.element_or_err(id)?;
        for v in 0..variables.n_variables() {
            out.extend(
                numbering
                    .element_dof_indices(elem, v)?
                    .into_iter()
                    .filter(|d| !range.contains(d)),
            );
        }
    }
    Ok(out.into_iter().collect())
}
