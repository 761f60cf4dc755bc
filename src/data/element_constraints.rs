//! Applying constraints to element matrices/vectors and to global vectors.
//!
//! For an element DOF list containing constrained DOFs, the constraint
//! matrix `C` maps values on the expanded list (original DOFs followed by
//! any masters not already present) to values on the original list, and `H`
//! carries the offsets: `x_orig = C x_expanded + H`. Element contributions
//! are then eliminated as `K' = Cᵀ K C`, `F' = Cᵀ (F - K H)`.
//!
//! An element without constrained DOFs is left untouched bit for bit.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use hashbrown::HashMap;
use nalgebra::{DMatrix, DVector};

use crate::data::constraints::DofConstraints;
use crate::dof_error::DofMapError;
use crate::topology::ids::{DofId, QoiIndex};

/// Read/write access to a global vector by DOF index.
pub trait DofValues {
    /// `None` if the entry is not stored here.
    fn value(&self, dof: DofId) -> Option<f64>;
    fn set_value(&mut self, dof: DofId, value: f64) -> Result<(), DofMapError>;
}

impl DofValues for Vec<f64> {
    fn value(&self, dof: DofId) -> Option<f64> {
        self.get(dof as usize).copied()
    }
    fn set_value(&mut self, dof: DofId, value: f64) -> Result<(), DofMapError> {
        let slot = self
            .get_mut(dof as usize)
            .ok_or(DofMapError::MissingVectorEntry(dof))?;
        *slot = value;
        Ok(())
    }
}

impl DofValues for DVector<f64> {
    fn value(&self, dof: DofId) -> Option<f64> {
        self.get(dof as usize).copied()
    }
    fn set_value(&mut self, dof: DofId, value: f64) -> Result<(), DofMapError> {
        let slot = self
            .get_mut(dof as usize)
            .ok_or(DofMapError::MissingVectorEntry(dof))?;
        *slot = value;
        Ok(())
    }
}

/// Sparse storage of owned plus ghosted entries.
impl DofValues for BTreeMap<DofId, f64> {
    fn value(&self, dof: DofId) -> Option<f64> {
        self.get(&dof).copied()
    }
    fn set_value(&mut self, dof: DofId, value: f64) -> Result<(), DofMapError> {
        self.insert(dof, value);
        Ok(())
    }
}

fn check_square(k: &DMatrix<f64>, n: usize) -> Result<(), DofMapError> {
    if k.nrows() != n || k.ncols() != n {
        return Err(DofMapError::ElementDofSizeMismatch {
            expected: n,
            got: if k.nrows() != n { k.nrows() } else { k.ncols() },
        });
    }
    Ok(())
}

fn check_len(f: &DVector<f64>, n: usize) -> Result<(), DofMapError> {
    if f.len() != n {
        return Err(DofMapError::ElementDofSizeMismatch {
            expected: n,
            got: f.len(),
        });
    }
    Ok(())
}

fn build_recursive(
    constraints: &DofConstraints,
    dofs: &mut Vec<DofId>,
    qoi: Option<QoiIndex>,
    depth: usize,
) -> Result<Option<(DMatrix<f64>, DVector<f64>)>, DofMapError> {
    if !dofs.iter().any(|&d| constraints.is_constrained(d)) {
        return Ok(None);
    }
    let orig_n = dofs.len();
    let present: BTreeSet<DofId> = dofs.iter().copied().collect();
    let new_masters: BTreeSet<DofId> = dofs
        .iter()
        .filter_map(|&d| constraints.get(d))
        .flat_map(|c| c.row.keys().copied())
        .filter(|m| !present.contains(m))
        .collect();
    dofs.extend(new_masters);

    let mut pos: HashMap<DofId, usize> = HashMap::with_capacity(dofs.len());
    for (i, &d) in dofs.iter().enumerate() {
        pos.entry(d).or_insert(i);
    }

    let mut c = DMatrix::<f64>::zeros(orig_n, dofs.len());
    let mut h = DVector::<f64>::zeros(orig_n);
    let mut unresolved = None;
    for i in 0..orig_n {
        match constraints.get(dofs[i]) {
            Some(row) => {
                for (m, &coeff) in &row.row {
                    if let Some(&j) = pos.get(m) {
                        c[(i, j)] = coeff;
                    }
                    if unresolved.is_none() && constraints.is_constrained(*m) {
                        unresolved = Some(*m);
                    }
                }
                h[i] = row.rhs_for(qoi);
            }
            None => c[(i, i)] = 1.0,
        }
    }

    if let Some(dof) = unresolved {
        if depth > constraints.len() {
            return Err(DofMapError::ConstraintLoop { dof });
        }
        if let Some((c2, h2)) = build_recursive(constraints, dofs, qoi, depth + 1)? {
            h += &c * &h2;
            c = &c * &c2;
        }
    }
    Ok(Some((c, h)))
}

/// Expand `dofs` with missing masters and return `C`, or `None` (and leave
/// `dofs` unchanged) if no DOF in the list is constrained.
pub fn build_constraint_matrix(
    constraints: &DofConstraints,
    dofs: &mut Vec<DofId>,
) -> Result<Option<DMatrix<f64>>, DofMapError> {
    Ok(build_recursive(constraints, dofs, None, 0)?.map(|(c, _)| c))
}

/// Like [`build_constraint_matrix`], also returning the offsets `H` for the
/// primal problem (`qoi = None`) or one adjoint problem.
pub fn build_constraint_matrix_and_vector(
    constraints: &DofConstraints,
    dofs: &mut Vec<DofId>,
    qoi: Option<QoiIndex>,
) -> Result<Option<(DMatrix<f64>, DVector<f64>)>, DofMapError> {
    build_recursive(constraints, dofs, qoi, 0)
}

/// Expand `dofs` exactly as the constraining routines would, without
/// touching any numbers.
pub fn constrain_nothing(
    constraints: &DofConstraints,
    dofs: &mut Vec<DofId>,
) -> Result<(), DofMapError> {
    build_recursive(constraints, dofs, None, 0).map(|_| ())
}

/// Replace constrained rows with the constraint equation: identity on the
/// diagonal and, for asymmetric rows, `-c` in the master columns.
fn write_constraint_rows(
    constraints: &DofConstraints,
    k: &mut DMatrix<f64>,
    row_dofs: &[DofId],
    col_dofs: &[DofId],
    asymmetric: bool,
) {
    for (i, &d) in row_dofs.iter().enumerate() {
        let Some(row) = constraints.get(d) else {
            continue;
        };
        k.row_mut(i).fill(0.0);
        for (j, &cd) in col_dofs.iter().enumerate() {
            if cd == d {
                k[(i, j)] = 1.0;
            }
            if asymmetric {
                if let Some(&coeff) = row.row.get(&cd) {
                    k[(i, j)] = -coeff;
                }
            }
        }
    }
}

fn write_constraint_rhs(
    constraints: &DofConstraints,
    f: &mut DVector<f64>,
    dofs: &[DofId],
    offsets: Option<Option<QoiIndex>>,
    asymmetric: bool,
) {
    for (i, &d) in dofs.iter().enumerate() {
        if let Some(row) = constraints.get(d) {
            f[i] = match offsets {
                Some(qoi) if asymmetric => row.rhs_for(qoi),
                _ => 0.0,
            };
        }
    }
}

/// `K ← Cᵀ K C` with constrained rows replaced; `dofs` is expanded.
pub fn constrain_element_matrix(
    constraints: &DofConstraints,
    k: &mut DMatrix<f64>,
    dofs: &mut Vec<DofId>,
    asymmetric: bool,
) -> Result<(), DofMapError> {
    check_square(k, dofs.len())?;
    let Some(c) = build_constraint_matrix(constraints, dofs)? else {
        return Ok(());
    };
    *k = c.transpose() * &*k * &c;
    write_constraint_rows(constraints, k, dofs, dofs, asymmetric);
    Ok(())
}

/// Rectangular variant: `K ← Rᵀ K C` for independent row and column lists.
pub fn constrain_element_matrix_rect(
    constraints: &DofConstraints,
    k: &mut DMatrix<f64>,
    row_dofs: &mut Vec<DofId>,
    col_dofs: &mut Vec<DofId>,
    asymmetric: bool,
) -> Result<(), DofMapError> {
    if k.nrows() != row_dofs.len() || k.ncols() != col_dofs.len() {
        return Err(DofMapError::ElementDofSizeMismatch {
            expected: row_dofs.len() * col_dofs.len(),
            got: k.nrows() * k.ncols(),
        });
    }
    let r = build_constraint_matrix(constraints, row_dofs)?;
    let c = build_constraint_matrix(constraints, col_dofs)?;
    if r.is_none() && c.is_none() {
        return Ok(());
    }
    if let Some(r) = &r {
        *k = r.transpose() * &*k;
    }
    if let Some(c) = &c {
        *k = &*k * c;
    }
    write_constraint_rows(constraints, k, row_dofs, col_dofs, asymmetric);
    Ok(())
}

/// `F ← Cᵀ F` with constrained entries zeroed.
pub fn constrain_element_vector(
    constraints: &DofConstraints,
    f: &mut DVector<f64>,
    dofs: &mut Vec<DofId>,
) -> Result<(), DofMapError> {
    check_len(f, dofs.len())?;
    let Some(c) = build_constraint_matrix(constraints, dofs)? else {
        return Ok(());
    };
    *f = c.transpose() * &*f;
    write_constraint_rhs(constraints, f, dofs, None, false);
    Ok(())
}

/// Homogeneous elimination of a matrix and vector together.
pub fn constrain_element_matrix_and_vector(
    constraints: &DofConstraints,
    k: &mut DMatrix<f64>,
    f: &mut DVector<f64>,
    dofs: &mut Vec<DofId>,
    asymmetric: bool,
) -> Result<(), DofMapError> {
    check_square(k, dofs.len())?;
    check_len(f, dofs.len())?;
    let Some(c) = build_constraint_matrix(constraints, dofs)? else {
        return Ok(());
    };
    let ct = c.transpose();
    *f = &ct * &*f;
    *k = &ct * &*k * &c;
    write_constraint_rows(constraints, k, dofs, dofs, asymmetric);
    write_constraint_rhs(constraints, f, dofs, None, false);
    Ok(())
}

/// Heterogeneous elimination: `F ← Cᵀ (F - K H)`, `K ← Cᵀ K C`.
///
/// With asymmetric rows the constrained entries of `F` hold the offsets, so
/// the solve reproduces inhomogeneous constraints directly.
pub fn heterogenously_constrain_element_matrix_and_vector(
    constraints: &DofConstraints,
    k: &mut DMatrix<f64>,
    f: &mut DVector<f64>,
    dofs: &mut Vec<DofId>,
    asymmetric: bool,
    qoi: Option<QoiIndex>,
) -> Result<(), DofMapError> {
    check_square(k, dofs.len())?;
    check_len(f, dofs.len())?;
    let Some((c, h)) = build_constraint_matrix_and_vector(constraints, dofs, qoi)? else {
        return Ok(());
    };
    let ct = c.transpose();
    *f = &ct * (&*f - &*k * &h);
    *k = &ct * &*k * &c;
    write_constraint_rows(constraints, k, dofs, dofs, asymmetric);
    write_constraint_rhs(constraints, f, dofs, Some(qoi), asymmetric);
    Ok(())
}

/// Heterogeneous elimination of the vector only; `k` is read, not modified.
pub fn heterogenously_constrain_element_vector(
    constraints: &DofConstraints,
    k: &DMatrix<f64>,
    f: &mut DVector<f64>,
    dofs: &mut Vec<DofId>,
    asymmetric: bool,
    qoi: Option<QoiIndex>,
) -> Result<(), DofMapError> {
    check_square(k, dofs.len())?;
    check_len(f, dofs.len())?;
    let Some((c, h)) = build_constraint_matrix_and_vector(constraints, dofs, qoi)? else {
        return Ok(());
    };
    *f = c.transpose() * (&*f - k * &h);
    write_constraint_rhs(constraints, f, dofs, Some(qoi), asymmetric);
    Ok(())
}

/// Constrain the outer product `v wᵀ` by transforming its factors.
pub fn constrain_element_dyad_matrix(
    constraints: &DofConstraints,
    v: &mut DVector<f64>,
    w: &mut DVector<f64>,
    dofs: &mut Vec<DofId>,
) -> Result<(), DofMapError> {
    check_len(v, dofs.len())?;
    check_len(w, dofs.len())?;
    let Some(r) = build_constraint_matrix(constraints, dofs)? else {
        return Ok(());
    };
    let rt = r.transpose();
    *v = &rt * &*v;
    *w = &rt * &*w;
    for (i, &d) in dofs.iter().enumerate() {
        if constraints.is_constrained(d) {
            v[i] = 0.0;
        }
    }
    Ok(())
}

/// Overwrite every constrained entry in `owned` with the value its row
/// prescribes. `qoi` selects adjoint offsets; `homogeneous` drops offsets.
///
/// Every owned constrained DOF must be stored in `v`.
pub fn enforce_constraints_exactly<V: DofValues + ?Sized>(
    constraints: &DofConstraints,
    v: &mut V,
    owned: Range<DofId>,
    qoi: Option<QoiIndex>,
    homogeneous: bool,
) -> Result<(), DofMapError> {
    let mut updates = Vec::new();
    for (dof, row) in constraints.iter() {
        if !owned.contains(&dof) {
            continue;
        }
        if v.value(dof).is_none() {
            return Err(DofMapError::MissingVectorEntry(dof));
        }
        let mut exact = if homogeneous { 0.0 } else { row.rhs_for(qoi) };
        for (&m, &coeff) in &row.row {
            exact += coeff * v.value(m).ok_or(DofMapError::MissingVectorEntry(m))?;
        }
        updates.push((dof, exact));
    }
    for (dof, value) in updates {
        v.set_value(dof, value)?;
    }
    Ok(())
}

/// Set constrained residual entries to the constraint defect
/// `x_d - Σ c x_m - rhs` evaluated at `solution`.
pub fn enforce_constraints_on_residual<V: DofValues + ?Sized, S: DofValues + ?Sized>(
    constraints: &DofConstraints,
    residual: &mut V,
    solution: &S,
    owned: Range<DofId>,
    homogeneous: bool,
) -> Result<(), DofMapError> {
    for (dof, row) in constraints.iter() {
        if !owned.contains(&dof) {
            continue;
        }
        let mut defect = solution
            .value(dof)
            .ok_or(DofMapError::MissingVectorEntry(dof))?;
        if !homogeneous {
            defect -= row.rhs;
        }
        for (&m, &coeff) in &row.row {
            defect -= coeff * solution.value(m).ok_or(DofMapError::MissingVectorEntry(m))?;
        }
        residual.set_value(dof, defect)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::constraints::{ConstraintOrigin, DofConstraintRow};
    use approx::assert_relative_eq;

    fn hanging() -> DofConstraints {
        // x2 = 0.5 x0 + 0.5 x1
        let mut c = DofConstraints::new();
        c.add_constraint_row(
            2,
            DofConstraintRow::from([(0, 0.5), (1, 0.5)]),
            0.0,
            ConstraintOrigin::HangingNode,
            true,
        )
        .unwrap();
        c
    }

    #[test]
    fn unconstrained_element_is_untouched() {
        let c = hanging();
        let k0 = DMatrix::from_row_slice(2, 2, &[1.5, -0.25, -0.25, 2.0]);
        let f0 = DVector::from_vec(vec![0.1, 0.3]);
        let (mut k, mut f) = (k0.clone(), f0.clone());
        let mut dofs = vec![5, 6];
        constrain_element_matrix_and_vector(&c, &mut k, &mut f, &mut dofs, true).unwrap();
        assert_eq!(dofs, vec![5, 6]);
        assert_eq!(k, k0);
        assert_eq!(f, f0);
    }

    #[test]
    fn missing_masters_are_appended_sorted() {
        let c = hanging();
        let mut dofs = vec![3, 2];
        let cm = build_constraint_matrix(&c, &mut dofs).unwrap().unwrap();
        assert_eq!(dofs, vec![3, 2, 0, 1]);
        assert_eq!(cm.shape(), (2, 4));
        assert_eq!(cm[(0, 0)], 1.0);
        assert_eq!(cm[(1, 2)], 0.5);
        assert_eq!(cm[(1, 3)], 0.5);

        let mut same = vec![3, 2];
        constrain_nothing(&c, &mut same).unwrap();
        assert_eq!(same, dofs);
    }

    #[test]
    fn elimination_folds_into_masters() {
        let c = hanging();
        let mut k = DMatrix::from_element(1, 1, 4.0);
        let mut f = DVector::from_element(1, 2.0);
        let mut dofs = vec![2];
        constrain_element_matrix_and_vector(&c, &mut k, &mut f, &mut dofs, true).unwrap();
        assert_eq!(dofs, vec![2, 0, 1]);
        // Constrained row: x2 - 0.5 x0 - 0.5 x1 = 0
        assert_eq!(k.row(0).iter().copied().collect::<Vec<_>>(), vec![1.0, -0.5, -0.5]);
        assert_relative_eq!(k[(1, 1)], 1.0);
        assert_relative_eq!(k[(1, 2)], 1.0);
        assert_eq!(f[0], 0.0);
        assert_relative_eq!(f[1], 1.0);

        let mut k_sym = DMatrix::from_element(1, 1, 4.0);
        let mut d = vec![2];
        constrain_element_matrix(&c, &mut k_sym, &mut d, false).unwrap();
        assert_eq!(k_sym.row(0).iter().copied().collect::<Vec<_>>(), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn heterogeneous_rows_carry_offsets() {
        let mut c = DofConstraints::new();
        c.add_constraint_row(0, DofConstraintRow::new(), 7.0, ConstraintOrigin::Dirichlet(0), true)
            .unwrap();
        let mut k = DMatrix::from_row_slice(2, 2, &[2.0, -1.0, -1.0, 2.0]);
        let mut f = DVector::from_vec(vec![0.0, 0.0]);
        let mut dofs = vec![0, 1];
        heterogenously_constrain_element_matrix_and_vector(&c, &mut k, &mut f, &mut dofs, true, None)
            .unwrap();
        assert_eq!(k, DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 2.0]));
        // F1 = 0 - K10 * 7
        assert_relative_eq!(f[1], 7.0);
        assert_relative_eq!(f[0], 7.0);
        let x = k.lu().solve(&f).unwrap();
        assert_relative_eq!(x[0], 7.0);
        assert_relative_eq!(x[1], 3.5);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let c = hanging();
        let mut k = DMatrix::zeros(2, 2);
        let mut dofs = vec![2];
        assert!(matches!(
            constrain_element_matrix(&c, &mut k, &mut dofs, true),
            Err(DofMapError::ElementDofSizeMismatch { .. })
        ));
    }

    #[test]
    fn exact_enforcement_and_residual() {
        let mut c = hanging();
        c.add_constraint_row(3, DofConstraintRow::new(), 2.0, ConstraintOrigin::Dirichlet(0), true)
            .unwrap();
        let mut v = vec![1.0, 3.0, 0.0, 0.0];
        enforce_constraints_exactly(&c, &mut v, 0..4, None, false).unwrap();
        assert_eq!(v, vec![1.0, 3.0, 2.0, 2.0]);

        let mut r = vec![9.0; 4];
        enforce_constraints_on_residual(&c, &mut r, &v, 0..4, false).unwrap();
        assert_eq!(r, vec![9.0, 9.0, 0.0, 0.0]);

        let mut sparse = BTreeMap::from([(2, 5.0)]);
        assert_eq!(
            enforce_constraints_exactly(&c, &mut sparse, 0..4, None, true),
            Err(DofMapError::MissingVectorEntry(0))
        );

        // Masters present, but the owned Dirichlet entry is not stored.
        let mut no_slot = BTreeMap::from([(0, 1.0), (1, 3.0), (2, 0.0)]);
        assert_eq!(
            enforce_constraints_exactly(&c, &mut no_slot, 0..4, None, false),
            Err(DofMapError::MissingVectorEntry(3))
        );
        assert_eq!(no_slot[&2], 0.0);
        let mut off_rank = BTreeMap::from([(0, 1.0), (1, 3.0), (2, 0.0)]);
        enforce_constraints_exactly(&c, &mut off_rank, 0..3, None, false).unwrap();
        assert_eq!(off_rank[&2], 2.0);
    }
}
