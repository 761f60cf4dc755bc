//! Dirichlet and periodic boundary objects and the constraint rows they produce.
//!
//! Boundaries select mesh nodes through the boundary ids attached to element
//! sides. Only nodal (continuous Lagrange) DOFs are constrained here.
//! Dirichlet boundaries are applied in registration order and never touch a
//! DOF that is already constrained, so the first boundary to claim a DOF
//! wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use nalgebra::Vector3;

use crate::data::constraints::{ConstraintOrigin, DofConstraintRow, DofConstraints};
use crate::data::dof_object::DofObjectTable;
use crate::data::variable::VariableRegistry;
use crate::dof_error::DofMapError;
use crate::topology::ids::{BoundaryId, DofId, DofObjectId, NodeId, Point, QoiIndex};
use crate::topology::mesh::MeshView;

/// Prescribed value as a function of position and time.
pub type BoundaryValueFn = Arc<dyn Fn(&Point, f64) -> f64 + Send + Sync>;

/// Prescribed values for some variables on some boundary ids.
#[derive(Clone)]
pub struct DirichletBoundary {
    pub boundary_ids: BTreeSet<BoundaryId>,
    pub variables: Vec<usize>,
    value: BoundaryValueFn,
}

impl DirichletBoundary {
    pub fn new(
        boundary_ids: impl IntoIterator<Item = BoundaryId>,
        variables: impl IntoIterator<Item = usize>,
        value: impl Fn(&Point, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            boundary_ids: boundary_ids.into_iter().collect(),
            variables: variables.into_iter().collect(),
            value: Arc::new(value),
        }
    }

    /// A boundary holding every selected DOF at `value`.
    pub fn constant(
        boundary_ids: impl IntoIterator<Item = BoundaryId>,
        variables: impl IntoIterator<Item = usize>,
        value: f64,
    ) -> Self {
        Self::new(boundary_ids, variables, move |_, _| value)
    }

    pub fn value_at(&self, point: &Point, time: f64) -> f64 {
        (self.value)(point, time)
    }

    /// Same boundary ids and variables; the value function is not compared.
    pub fn same_target(&self, other: &DirichletBoundary) -> bool {
        self.boundary_ids == other.boundary_ids && self.variables == other.variables
    }
}

impl fmt::Debug for DirichletBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirichletBoundary")
            .field("boundary_ids", &self.boundary_ids)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Identifies nodes on `my_boundary` with their translates on `paired_boundary`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeriodicBoundary {
    pub my_boundary: BoundaryId,
    pub paired_boundary: BoundaryId,
    /// Maps a point on `my_boundary` onto `paired_boundary`.
    pub translation: [f64; 3],
    pub variables: Vec<usize>,
}

impl PeriodicBoundary {
    pub fn new(
        my_boundary: BoundaryId,
        paired_boundary: BoundaryId,
        translation: [f64; 3],
        variables: impl IntoIterator<Item = usize>,
    ) -> Self {
        Self {
            my_boundary,
            paired_boundary,
            translation,
            variables: variables.into_iter().collect(),
        }
    }

    /// The same pairing seen from the other side.
    pub fn inverse(&self) -> Self {
        Self {
            my_boundary: self.paired_boundary,
            paired_boundary: self.my_boundary,
            translation: self.translation.map(|t| -t),
            variables: self.variables.clone(),
        }
    }

    pub fn image(&self, p: &Point) -> Point {
        (Vector3::from(*p) + Vector3::from(self.translation)).into()
    }
}

/// Everything row construction needs to look up.
pub struct BuildContext<'a> {
    pub mesh: &'a dyn MeshView,
    pub dofs: &'a DofObjectTable,
    pub variables: &'a VariableRegistry,
    /// Global indices owned by this rank.
    pub local_range: Range<DofId>,
}

impl BuildContext<'_> {
    /// Nodal DOFs of `var` on `node`, empty when the variable is not nodal
    /// or not active there.
    pub fn nodal_dofs(&self, node: NodeId, var: usize) -> Result<Vec<DofId>, DofMapError> {
        let fe = self.variables.variable_type(var)?;
        if !fe.is_continuous() {
            return Ok(Vec::new());
        }
        let obj = DofObjectId::Node(node);
        if !self.dofs.contains(obj) {
            return Ok(Vec::new());
        }
        Ok(self.dofs.dof_indices(obj, var)?.collect())
    }

    /// Nodes on sides carrying any of `bids`, with their coordinates.
    pub fn boundary_nodes(
        &self,
        bids: &BTreeSet<BoundaryId>,
    ) -> Result<BTreeMap<NodeId, Point>, DofMapError> {
        let mut out = BTreeMap::new();
        for elem in self.mesh.active_elements() {
            for side in 0..elem.kind.n_sides() {
                if !bids.iter().any(|&b| elem.side_has_boundary(side, b)) {
                    continue;
                }
                for n in elem.side_node_ids(side) {
                    let node = self.mesh.node_or_err(n)?;
                    out.insert(n, node.point);
                }
            }
        }
        Ok(out)
    }
}

/// Registered boundary objects of one system.
#[derive(Clone, Debug, Default)]
pub struct BoundaryConditions {
    dirichlet: Vec<DirichletBoundary>,
    adjoint_dirichlet: BTreeMap<QoiIndex, Vec<DirichletBoundary>>,
    periodic: Vec<PeriodicBoundary>,
}

impl BoundaryConditions {
    pub fn add_dirichlet_boundary(&mut self, bc: DirichletBoundary) {
        self.dirichlet.push(bc);
    }

    /// Remove the first boundary targeting the same ids and variables.
    pub fn remove_dirichlet_boundary(&mut self, bc: &DirichletBoundary) -> bool {
        match self.dirichlet.iter().position(|b| b.same_target(bc)) {
            Some(i) => {
                self.dirichlet.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn add_adjoint_dirichlet_boundary(&mut self, qoi: QoiIndex, bc: DirichletBoundary) {
        self.adjoint_dirichlet.entry(qoi).or_default().push(bc);
    }

    pub fn remove_adjoint_dirichlet_boundary(
        &mut self,
        qoi: QoiIndex,
        bc: &DirichletBoundary,
    ) -> bool {
        let Some(list) = self.adjoint_dirichlet.get_mut(&qoi) else {
            return false;
        };
        match list.iter().position(|b| b.same_target(bc)) {
            Some(i) => {
                list.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn has_adjoint_dirichlet_boundaries(&self, qoi: QoiIndex) -> bool {
        self.adjoint_dirichlet
            .get(&qoi)
            .is_some_and(|l| !l.is_empty())
    }

    /// `pb.my_boundary` carries the slave DOFs; the inverse only covers
    /// nodes the forward pair leaves free.
    pub fn add_periodic_boundary(&mut self, pb: PeriodicBoundary, with_inverse: bool) {
        let inverse = with_inverse.then(|| pb.inverse());
        self.periodic.push(pb);
        self.periodic.extend(inverse);
    }

    pub fn is_periodic_boundary(&self, bid: BoundaryId) -> bool {
        self.periodic
            .iter()
            .any(|p| p.my_boundary == bid || p.paired_boundary == bid)
    }

    pub fn dirichlet_boundaries(&self) -> &[DirichletBoundary] {
        &self.dirichlet
    }

    pub fn periodic_boundaries(&self) -> &[PeriodicBoundary] {
        &self.periodic
    }

    /// Every Dirichlet boundary id must exist somewhere in the mesh.
    pub fn check_dirichlet_bcid_consistency(&self, mesh: &dyn MeshView) -> Result<(), DofMapError> {
        let present = mesh.boundary_ids();
        let all = self
            .dirichlet
            .iter()
            .chain(self.adjoint_dirichlet.values().flatten());
        for bc in all {
            if let Some(&missing) = bc.boundary_ids.iter().find(|b| !present.contains(b)) {
                return Err(DofMapError::MissingDirichletBoundaryId(missing));
            }
        }
        Ok(())
    }

    fn check_variables(&self, ctx: &BuildContext<'_>, vars: &[usize]) -> Result<(), DofMapError> {
        for &v in vars {
            ctx.variables.variable(v)?;
        }
        Ok(())
    }

    /// Rows pinning Dirichlet DOFs to their prescribed values at `time`.
    pub fn create_dirichlet_constraints(
        &self,
        ctx: &BuildContext<'_>,
        time: f64,
        constraints: &mut DofConstraints,
    ) -> Result<usize, DofMapError> {
        let mut added = 0;
        for (k, bc) in self.dirichlet.iter().enumerate() {
            self.check_variables(ctx, &bc.variables)?;
            for (node, point) in ctx.boundary_nodes(&bc.boundary_ids)? {
                let value = bc.value_at(&point, time);
                for &var in &bc.variables {
                    for dof in ctx.nodal_dofs(node, var)? {
                        if constraints.is_constrained(dof) {
                            continue;
                        }
                        constraints.add_constraint_row(
                            dof,
                            DofConstraintRow::new(),
                            value,
                            ConstraintOrigin::Dirichlet(k as u32),
                            true,
                        )?;
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }

    /// Adjoint offsets from adjoint Dirichlet boundaries, first boundary per QoI wins.
    pub fn create_adjoint_dirichlet_constraints(
        &self,
        ctx: &BuildContext<'_>,
        time: f64,
        constraints: &mut DofConstraints,
    ) -> Result<usize, DofMapError> {
        let mut added = 0;
        for (&qoi, list) in &self.adjoint_dirichlet {
            let mut claimed: BTreeSet<DofId> = BTreeSet::new();
            for bc in list {
                self.check_variables(ctx, &bc.variables)?;
                for (node, point) in ctx.boundary_nodes(&bc.boundary_ids)? {
                    let value = bc.value_at(&point, time);
                    for &var in &bc.variables {
                        for dof in ctx.nodal_dofs(node, var)? {
                            if !claimed.insert(dof) {
                                continue;
                            }
                            constraints.add_adjoint_constraint_row(
                                qoi,
                                dof,
                                DofConstraintRow::new(),
                                value,
                                false,
                            )?;
                            added += 1;
                        }
                    }
                }
            }
        }
        Ok(added)
    }

    /// Rows identifying each node on a periodic boundary with its image.
    ///
    /// A slave whose partner cannot be found is an error only if this rank
    /// owns the slave DOF; otherwise the owner builds that row.
    pub fn create_periodic_constraints(
        &self,
        ctx: &BuildContext<'_>,
        tolerance: f64,
        constraints: &mut DofConstraints,
    ) -> Result<usize, DofMapError> {
        let mut added = 0;
        for pb in &self.periodic {
            self.check_variables(ctx, &pb.variables)?;
            let slaves = ctx.boundary_nodes(&BTreeSet::from([pb.my_boundary]))?;
            let partners = ctx.boundary_nodes(&BTreeSet::from([pb.paired_boundary]))?;

            for (node, point) in slaves {
                let target = Vector3::from(pb.image(&point));
                let partner = partners
                    .iter()
                    .find(|(_, q)| (Vector3::from(**q) - target).norm() <= tolerance)
                    .map(|(&n, _)| n);

                for &var in &pb.variables {
                    let slave_dofs = ctx.nodal_dofs(node, var)?;
                    let master_dofs = match partner {
                        Some(p) => ctx.nodal_dofs(p, var)?,
                        None => Vec::new(),
                    };
                    if master_dofs.len() != slave_dofs.len() {
                        if slave_dofs.iter().any(|d| ctx.local_range.contains(d)) {
                            return Err(DofMapError::PeriodicPartnerMissing {
                                node,
                                boundary: pb.paired_boundary,
                            });
                        }
                        log::warn!(
                            "periodic partner of non-owned node {node} not visible; leaving it to the owner"
                        );
                        continue;
                    }
                    for (&slave, &master) in slave_dofs.iter().zip(&master_dofs) {
                        if slave == master || constraints.is_constrained(slave) {
                            continue;
                        }
                        let closes_cycle = constraints
                            .get(master)
                            .is_some_and(|c| c.row.contains_key(&slave));
                        if closes_cycle {
                            continue;
                        }
                        constraints.add_constraint_row(
                            slave,
                            DofConstraintRow::from([(master, 1.0)]),
                            0.0,
                            ConstraintOrigin::Periodic,
                            true,
                        )?;
                        added += 1;
                    }
                }
            }
        }
        Ok(added)
    }
}
