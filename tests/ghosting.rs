mod common;

use std::sync::Arc;

use common::{partition, run_world, strip};
use mesh_dofmap::ghosting::GhostedElements;
use mesh_dofmap::prelude::*;
use serial_test::serial;

/// Couples element `e` with element `n + 1 - e`, like a reflection operator.
#[derive(Debug)]
struct Mirror {
    n: u64,
}

impl GhostingFunctor for Mirror {
    fn ghost_elements(
        &self,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements {
        elems
            .iter()
            .filter_map(|e| ElemId::new(self.n + 1 - e.get()).ok())
            .filter_map(|m| mesh.element(m))
            .filter(|m| proc != Some(m.owner))
            .map(|m| (m.id, None))
            .collect()
    }

    fn name(&self) -> &str {
        "Mirror"
    }
}

fn mirrored_world() -> Vec<(Vec<DofId>, Vec<usize>, Vec<usize>)> {
    let mut mesh = strip(6);
    partition(&mut mesh, |e| if e.get() <= 3 { 0 } else { 1 });
    run_world(2, move |comm| {
        let mut dm = DofMap::default();
        dm.add_variable("u", FeType::lagrange(1), None).unwrap();
        dm.ghosting_mut().remove_default_ghosting();
        dm.ghosting_mut()
            .add_coupling_functor(Box::new(Mirror { n: 6 }), true);
        let view = mesh
            .partitioned_view(comm.rank(), &dm.ghosting().mesh_ghosting_functors())
            .unwrap();
        dm.distribute_dofs(&view, &comm).unwrap();
        dm.prepare_send_list().unwrap();
        let p = dm.compute_sparsity(&view, &comm).unwrap();
        (dm.get_send_list().to_vec(), p.n_nz().to_vec(), p.n_oz().to_vec())
    })
}

#[test]
#[serial]
fn coupling_functor_widens_send_list_and_sparsity() {
    let out = mirrored_world();
    assert_eq!(out[0].0, vec![4, 5, 6]);
    assert_eq!(out[1].0, vec![0, 1, 2, 3]);
    // Node 1 (DOF 0) couples to the far end of the strip.
    assert_eq!(out[0].1[0], 2);
    assert_eq!(out[0].2[0], 2);
    // And the far end (DOF 6) back to it.
    assert_eq!(*out[1].1.last().unwrap(), 2);
    assert_eq!(*out[1].2.last().unwrap(), 2);
}

#[test]
fn algebraic_functors_do_not_drive_coupling() {
    let mesh = strip(4);
    let mut set = GhostingFunctorSet::new();
    set.remove_default_ghosting();
    let id = set.add_algebraic_functor(Box::new(Mirror { n: 4 }), false);
    assert!(set.mesh_ghosting_functors().is_empty());

    let local = [ElemId::new(1).unwrap()];
    let found = set.algebraic_elements(&mesh, &local, None);
    assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![ElemId::new(4).unwrap()]);
    assert!(set.coupled_elements(&mesh, &local, None).is_empty());

    assert!(set.remove_algebraic_functor(id));
    assert!(set.algebraic_elements(&mesh, &local, None).is_empty());
}

#[test]
fn default_coupling_restriction_is_shared_with_sparsity() {
    let mesh = strip(3);
    let mut dm = DofMap::default();
    dm.add_variables(&["u", "v"], FeType::lagrange(1), None).unwrap();
    dm.set_dof_coupling(Some(Arc::new(CouplingMatrix::diagonal(2)))).unwrap();
    assert!(dm.ghosting().default_coupling().coupling().is_some());
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    let p = dm.compute_sparsity(&mesh, &NoComm).unwrap();
    // Each row sees only its own variable: 2 or 3 nodes.
    assert_eq!(p.n_nz().iter().sum::<usize>(), 2 * (2 + 3 + 3 + 2));

    assert!(matches!(
        dm.set_dof_coupling(Some(Arc::new(CouplingMatrix::full(3)))),
        Err(DofMapError::InvalidVariableConfiguration(_))
    ));
}
