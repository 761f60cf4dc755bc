//! Hanging-node constraint rows from non-conforming refinement.
//!
//! A node of a refined element that lies on the interior of a coarser
//! neighbor's side carries no independent value: it interpolates the coarse
//! side. For first-order Lagrange fields that interpolant is linear on a
//! segment, barycentric on a triangle and bilinear on a parallelogram, with
//! the coarse side's vertices as masters.

use std::collections::BTreeSet;

use nalgebra::{Matrix2, Vector2, Vector3};

use crate::data::boundary::BuildContext;
use crate::data::constraints::{
    ConstraintOrigin, DofConstraintRow, DofConstraints, NodeConstraintRow, NodeConstraints,
};
use crate::dof_error::DofMapError;
use crate::topology::ids::{NodeId, Point};
use crate::topology::mesh::MeshElement;

const WEIGHT_EPS: f64 = 1e-12;

/// Interpolation weights of `x` with respect to the vertices of a coarse side.
///
/// `vertices` holds 2 (segment), 3 (triangle) or 4 (parallelogram, cyclic
/// order) points. Returns `None` for other counts or degenerate sides.
pub fn hanging_node_weights(vertices: &[Point], x: &Point) -> Option<Vec<f64>> {
    let v: Vec<Vector3<f64>> = vertices.iter().map(|p| Vector3::from(*p)).collect();
    let x = Vector3::from(*x);
    match v.len() {
        2 => {
            let e = v[1] - v[0];
            let len2 = e.norm_squared();
            if len2 == 0.0 {
                return None;
            }
            let t = (x - v[0]).dot(&e) / len2;
            Some(vec![1.0 - t, t])
        }
        3 => {
            let (a, b) = solve_planar(&v[0], &(v[1] - v[0]), &(v[2] - v[0]), &x)?;
            Some(vec![1.0 - a - b, a, b])
        }
        4 => {
            let (u, w) = solve_planar(&v[0], &(v[1] - v[0]), &(v[3] - v[0]), &x)?;
            Some(vec![
                (1.0 - u) * (1.0 - w),
                u * (1.0 - w),
                u * w,
                (1.0 - u) * w,
            ])
        }
        _ => None,
    }
}

/// Coordinates `(a, b)` with `x ≈ origin + a e1 + b e2` in the least-squares sense.
fn solve_planar(
    origin: &Vector3<f64>,
    e1: &Vector3<f64>,
    e2: &Vector3<f64>,
    x: &Vector3<f64>,
) -> Option<(f64, f64)> {
    let g = Matrix2::new(e1.dot(e1), e1.dot(e2), e1.dot(e2), e2.dot(e2));
    let r = x - origin;
    let sol = g.lu().solve(&Vector2::new(r.dot(e1), r.dot(e2)))?;
    Some((sol[0], sol[1]))
}

/// Coarse side facing `fine` across its side `side`, if the neighbor there
/// is an active, coarser element.
fn coarse_side<'m>(
    ctx: &BuildContext<'m>,
    fine: &MeshElement,
    side: usize,
) -> Result<Option<(&'m MeshElement, usize)>, DofMapError> {
    let Some(nb_id) = fine.neighbor(side) else {
        return Ok(None);
    };
    let Some(nb) = ctx.mesh.element(nb_id) else {
        return Ok(None);
    };
    if !nb.active || nb.level >= fine.level {
        return Ok(None);
    }
    let back = (0..nb.kind.n_sides()).find(|&s| {
        nb.neighbor(s)
            .is_some_and(|anc| ctx.mesh.is_ancestor_or_self(anc, fine.id))
    });
    match back {
        Some(s) => Ok(Some((nb, s))),
        None => {
            log::warn!(
                "element {} side {side}: coarse neighbor {} has no side facing it",
                fine.id,
                nb.id
            );
            Ok(None)
        }
    }
}

/// Build DOF rows for every hanging node visible on this rank, plus the
/// matching node constraint rows. Returns the number of DOF rows added.
pub fn create_hanging_node_constraints(
    ctx: &BuildContext<'_>,
    dof_constraints: &mut DofConstraints,
    node_constraints: &mut NodeConstraints,
) -> Result<usize, DofMapError> {
    let continuous: Vec<usize> = ctx
        .variables
        .variables()
        .iter()
        .filter(|v| v.fe_type().is_continuous())
        .map(|v| v.number())
        .collect();

    let mut added = 0;
    for fine in ctx.mesh.active_elements() {
        for side in 0..fine.kind.n_sides() {
            let Some((coarse, coarse_s)) = coarse_side(ctx, fine, side)? else {
                continue;
            };
            let masters = coarse.side_node_ids(coarse_s);
            let master_set: BTreeSet<NodeId> = masters.iter().copied().collect();
            let master_pts = masters
                .iter()
                .map(|&n| ctx.mesh.node_or_err(n).map(|node| node.point))
                .collect::<Result<Vec<_>, _>>()?;

            for hanging in fine.side_node_ids(side) {
                if master_set.contains(&hanging) {
                    continue;
                }
                let x = ctx.mesh.node_or_err(hanging)?.point;
                let Some(weights) = hanging_node_weights(&master_pts, &x) else {
                    log::warn!("cannot interpolate hanging node {hanging} on element {}", coarse.id);
                    continue;
                };
                let terms: Vec<(NodeId, f64)> = masters
                    .iter()
                    .copied()
                    .zip(weights)
                    .filter(|(_, w)| w.abs() > WEIGHT_EPS)
                    .collect();

                if !node_constraints.is_constrained(hanging) {
                    node_constraints.add_node_constraint_row(
                        hanging,
                        terms.iter().copied().collect::<NodeConstraintRow>(),
                        [0.0; 3],
                        true,
                    )?;
                }

                for &var in &continuous {
                    let order = ctx.variables.variable_order(var)?;
                    if order != 1 {
                        return Err(DofMapError::UnsupportedHangingNodeOrder {
                            variable: var,
                            order,
                        });
                    }
                    let Some(&slave) = ctx.nodal_dofs(hanging, var)?.first() else {
                        continue;
                    };
                    if dof_constraints.is_constrained(slave) {
                        continue;
                    }
                    let mut row = DofConstraintRow::new();
                    let mut complete = true;
                    for &(m, w) in &terms {
                        match ctx.nodal_dofs(m, var)?.first() {
                            Some(&d) => {
                                row.insert(d, w);
                            }
                            None => complete = false,
                        }
                    }
                    if !complete {
                        log::warn!("hanging node {hanging}: variable {var} missing on a master node");
                        continue;
                    }
                    dof_constraints.add_constraint_row(
                        slave,
                        row,
                        0.0,
                        ConstraintOrigin::HangingNode,
                        true,
                    )?;
                    added += 1;
                }
            }
        }
    }
    log::debug!("built {added} hanging-node constraint rows");
    Ok(added)
}
