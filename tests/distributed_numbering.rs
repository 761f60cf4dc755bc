mod common;

use common::{partition, quad_grid, run_world, strip};
use mesh_dofmap::prelude::*;
use proptest::prelude::*;
use serial_test::serial;

/// Number `mesh` on `n` ranks; returns (n_dofs, first, end, send list) per rank.
fn number_on(
    mesh: InMemoryMesh,
    n: usize,
    order: NumberingOrder,
    defaults: bool,
) -> Vec<(DofId, Vec<DofId>, Vec<DofId>, Vec<DofId>)> {
    run_world(n, move |comm| {
        let mut dm = DofMap::new(DofMapOptions::default().with_numbering(order));
        dm.add_variable("u", FeType::lagrange(1), None).unwrap();
        if !defaults {
            dm.ghosting_mut().remove_default_ghosting();
        }
        let view = mesh
            .partitioned_view(comm.rank(), &dm.ghosting().mesh_ghosting_functors())
            .unwrap();
        let n_dofs = dm.distribute_dofs(&view, &comm).unwrap();
        dm.prepare_send_list().unwrap();
        let first = (0..comm.size()).map(|p| dm.first_dof(p).unwrap()).collect();
        let end = (0..comm.size()).map(|p| dm.end_dof(p).unwrap()).collect();
        (n_dofs, first, end, dm.get_send_list().to_vec())
    })
}

#[test]
#[serial]
fn two_ranks_four_elements_send_list_is_neighbor_owned_dofs() {
    let mut mesh = strip(4);
    partition(&mut mesh, |e| if e.get() <= 2 { 0 } else { 1 });
    let out = number_on(mesh, 2, NumberingOrder::VariableMajor, false);

    let total_nodes = 5;
    for (n_dofs, first, end, _) in &out {
        assert_eq!(*n_dofs, total_nodes);
        assert_eq!(first, &vec![0, 3]);
        assert_eq!(end, &vec![3, 5]);
    }
    let local_sum: DofId = out[0].2.iter().zip(&out[0].1).map(|(e, f)| e - f).sum();
    assert_eq!(local_sum, total_nodes);

    // Rank 0 owns the shared node 3 (DOF 2); rank 1 reads it.
    assert!(out[0].3.is_empty());
    assert_eq!(out[1].3, vec![2]);
}

#[test]
#[serial]
fn default_algebraic_ghosting_adds_one_element_layer() {
    let mut mesh = strip(4);
    partition(&mut mesh, |e| if e.get() <= 2 { 0 } else { 1 });
    let out = number_on(mesh, 2, NumberingOrder::VariableMajor, true);
    assert_eq!(out[0].3, vec![3]);
    assert_eq!(out[1].3, vec![1, 2]);
}

#[test]
#[serial]
fn ghost_dofs_agree_with_their_owner() {
    let mut mesh = quad_grid(3, 2);
    partition(&mut mesh, |e| ((e.get() - 1) % 3) as Rank);
    let global = mesh.clone();
    let per_rank = run_world(3, move |comm| {
        let mut dm = DofMap::default();
        dm.add_variables(&["u", "v"], FeType::lagrange(1), None).unwrap();
        let view = global
            .partitioned_view(comm.rank(), &dm.ghosting().mesh_ghosting_functors())
            .unwrap();
        dm.distribute_dofs(&view, &comm).unwrap();
        view.nodes()
            .map(|n| (n.id, dm.node_dof_indices(n.id).unwrap()))
            .collect::<Vec<_>>()
    });
    let mut seen = std::collections::BTreeMap::new();
    for rank in per_rank {
        for (node, dofs) in rank {
            assert_eq!(dofs.len(), 2);
            let prev = seen.entry(node).or_insert_with(|| dofs.clone());
            assert_eq!(prev, &dofs, "node {node} numbered differently on two ranks");
        }
    }
    assert_eq!(seen.len(), 12);
    let mut all: Vec<DofId> = seen.values().flatten().copied().collect();
    all.sort_unstable();
    assert_eq!(all, (0..24).collect::<Vec<_>>());
}

#[test]
#[serial]
fn scalar_block_trails_the_last_rank() {
    let mut mesh = strip(4);
    partition(&mut mesh, |e| if e.get() <= 2 { 0 } else { 1 });
    let out = run_world(2, move |comm| {
        let mut dm = DofMap::default();
        dm.add_variable("u", FeType::lagrange(1), None).unwrap();
        dm.add_variable("lambda", FeType::scalar(1), None).unwrap();
        let view = mesh
            .partitioned_view(comm.rank(), &dm.ghosting().mesh_ghosting_functors())
            .unwrap();
        dm.distribute_dofs(&view, &comm).unwrap();
        (dm.n_dofs(), dm.n_local_dofs(), dm.scalar_dof_indices(1).unwrap())
    });
    assert_eq!(out[0], (6, 3, vec![5]));
    assert_eq!(out[1], (6, 3, vec![5]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    #[serial]
    fn ranges_partition_the_dofs(
        n_elems in 1u64..12,
        n_ranks in 1usize..4,
        node_major in any::<bool>(),
        cuts in proptest::collection::vec(0usize..4, 12),
    ) {
        let mut mesh = strip(n_elems);
        partition(&mut mesh, |e| cuts[(e.get() - 1) as usize] % n_ranks);
        let order = if node_major { NumberingOrder::NodeMajor } else { NumberingOrder::VariableMajor };
        let out = number_on(mesh, n_ranks, order, true);

        for (n_dofs, first, end, send_list) in &out {
            prop_assert_eq!(*n_dofs, n_elems + 1);
            prop_assert_eq!(first[0], 0);
            prop_assert_eq!(end[n_ranks - 1], *n_dofs);
            for p in 1..n_ranks {
                prop_assert_eq!(first[p], end[p - 1]);
            }
            prop_assert!(send_list.windows(2).all(|w| w[0] < w[1]));
        }
        // Every rank sees identical ranges.
        for w in out.windows(2) {
            prop_assert_eq!(&w[0].1, &w[1].1);
        }
    }
}

#[test]
fn dof_owner_matches_the_containing_range() {
    let mesh = quad_grid(2, 2);
    let mut dm = DofMap::default();
    dm.add_variable("u", FeType::lagrange(1), None).unwrap();
    dm.distribute_dofs(&mesh, &NoComm).unwrap();
    for d in 0..dm.n_dofs() {
        assert_eq!(dm.dof_owner(d).unwrap(), 0);
        assert!(dm.local_index(d));
    }
    assert!(matches!(
        dm.dof_owner(dm.n_dofs()),
        Err(DofMapError::DofOutOfRange { .. })
    ));
    assert!(matches!(
        dm.first_dof(1),
        Err(DofMapError::ProcessorOutOfRange { .. })
    ));
}
