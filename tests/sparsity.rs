mod common;

use std::collections::BTreeMap;

use common::{grid_node, partition, quad_grid, run_world, strip};
use mesh_dofmap::prelude::*;
use serial_test::serial;

fn node(i: u64) -> NodeId {
    NodeId::new(i).unwrap()
}

#[derive(Default)]
struct RecordingMatrix {
    rows: usize,
    nnz: usize,
}

impl PreallocatedMatrix for RecordingMatrix {
    fn preallocate(&mut self, pattern: &SparsityPattern) -> Result<(), DofMapError> {
        self.rows = pattern.n_local_rows();
        self.nnz = pattern.n_nz().iter().chain(pattern.n_oz()).sum();
        Ok(())
    }
}

#[test]
fn quad_grid_rows_count_their_node_patch() {
    let mesh = quad_grid(2, 2);
    let mut dm = DofMap::default();
    dm.add_variable("u", FeType::lagrange(1), None).unwrap();
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    let pattern = dm.compute_sparsity(&mesh, &NoComm).unwrap();

    let row_of = |i, j| dm.node_dof_indices(node(grid_node(2, i, j))).unwrap()[0] as usize;
    assert_eq!(pattern.n_nz()[row_of(1, 1)], 9);
    assert_eq!(pattern.n_nz()[row_of(0, 0)], 4);
    assert_eq!(pattern.n_nz()[row_of(1, 0)], 6);
    assert_eq!(pattern.n_nz().iter().sum::<usize>(), 49);
    assert!(pattern.n_oz().iter().all(|&o| o == 0));
    assert!(!pattern.has_graph());
}

#[test]
fn nonzeros_cover_every_touching_element() {
    let mesh = quad_grid(3, 2);
    let mut dm = DofMap::default();
    dm.add_variables(&["u", "v"], FeType::lagrange(1), None).unwrap();
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    dm.compute_sparsity(&mesh, &NoComm).unwrap();

    let mut touching: BTreeMap<DofId, usize> = BTreeMap::new();
    for elem in mesh.elements().filter(|e| e.active) {
        for d in dm.dof_indices(elem).unwrap() {
            *touching.entry(d).or_default() += 1;
        }
    }
    for (d, n_elems) in touching {
        let i = d as usize;
        assert!(dm.get_n_nz()[i] + dm.get_n_oz()[i] >= n_elems, "row {d}");
        assert!(dm.get_n_nz()[i] <= dm.n_local_dofs() as usize);
    }
}

#[test]
fn constrained_construction_adds_master_columns() {
    let mesh = strip(4);
    let build = |constrained: bool| {
        let mut dm = DofMap::new(
            DofMapOptions::default()
                .with_constrained_sparsity(constrained)
                .with_full_sparsity_pattern(true),
        );
        dm.add_variable("u", FeType::lagrange(1), None).unwrap();
        dm.distribute_dofs(&mesh, &NoComm).unwrap();
        dm.add_constraint_row(0, BTreeMap::from([(4, 1.0)]), 0.0, true).unwrap();
        dm.process_constraints().unwrap();
        dm.compute_sparsity(&mesh, &NoComm).unwrap()
    };
    let plain = build(false);
    let expanded = build(true);
    assert_eq!(plain.n_nz()[0], 2);
    assert_eq!(expanded.n_nz()[0], 3);
    assert!(expanded.row(1).unwrap().contains(&4));
    assert!(expanded.row(4).unwrap().contains(&0));
    assert!(!plain.row(1).unwrap().contains(&4));
}

#[test]
fn constrained_construction_waits_for_processed_constraints() {
    let mesh = strip(3);
    let mut dm = DofMap::new(DofMapOptions::default().with_constrained_sparsity(true));
    dm.add_variable("u", FeType::lagrange(1), None).unwrap();
    dm.add_dirichlet_boundary(DirichletBoundary::constant([1], [0], 1.0));
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    assert!(matches!(
        dm.compute_sparsity(&mesh, &NoComm),
        Err(DofMapError::InvalidState { expected: "Constrained", .. })
    ));
    assert!(!dm.computed_sparsity_already());

    dm.create_dof_constraints(&mesh, 0.0).unwrap();
    assert!(dm.compute_sparsity(&mesh, &NoComm).is_err());
    dm.process_constraints().unwrap();
    let pattern = dm.compute_sparsity(&mesh, &NoComm).unwrap();
    assert_eq!(pattern.n_local_rows(), 4);
}

#[test]
fn extra_function_hook_sees_the_pattern() {
    let mesh = strip(3);
    let mut dm = DofMap::new(DofMapOptions::default().with_full_sparsity_pattern(true));
    dm.add_variable("u", FeType::lagrange(1), None).unwrap();
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    dm.attach_extra_sparsity_function(Box::new(|p: &mut SparsityPattern| {
        // Couple the two ends, as a periodic operator would.
        p.insert(0, 3);
        p.insert(3, 0);
    }));
    let pattern = dm.compute_sparsity(&mesh, &NoComm).unwrap();
    assert_eq!(pattern.n_nz()[0], 3);
    assert_eq!(pattern.n_nz()[3], 3);

    let mut a = RecordingMatrix::default();
    let mut b = RecordingMatrix::default();
    let mut both: [&mut dyn PreallocatedMatrix; 2] = [&mut a, &mut b];
    dm.update_sparsity_patterns(&mut both).unwrap();
    assert_eq!((a.rows, a.nnz), (4, 12));
    assert_eq!((b.rows, b.nnz), (4, 12));
}

#[test]
fn update_before_compute_is_an_error() {
    let mesh = strip(2);
    let mut dm = DofMap::default();
    dm.add_variable("u", FeType::lagrange(1), None).unwrap();
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    let mut m = RecordingMatrix::default();
    assert!(matches!(
        dm.update_sparsity_pattern(&mut m),
        Err(DofMapError::InvalidState { .. })
    ));
}

#[test]
#[serial]
fn distributed_rows_match_the_serial_counts() {
    let mut mesh = strip(4);
    partition(&mut mesh, |e| if e.get() <= 2 { 0 } else { 1 });
    let out = run_world(2, move |comm| {
        let mut dm = DofMap::default();
        dm.add_variable("u", FeType::lagrange(1), None).unwrap();
        let view = mesh
            .partitioned_view(comm.rank(), &dm.ghosting().mesh_ghosting_functors())
            .unwrap();
        dm.distribute_dofs(&view, &comm).unwrap();
        let p = dm.compute_sparsity(&view, &comm).unwrap();
        (p.n_nz().to_vec(), p.n_oz().to_vec())
    });
    assert_eq!(out[0], (vec![2, 3, 2], vec![0, 0, 1]));
    assert_eq!(out[1], (vec![2, 2], vec![1, 0]));
    let total: Vec<usize> = out
        .iter()
        .flat_map(|(nz, oz)| nz.iter().zip(oz).map(|(a, b)| a + b))
        .collect();
    assert_eq!(total, vec![2, 3, 3, 3, 2]);
}
