use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use mesh_dofmap::prelude::*;

fn quad_grid(n: u64) -> InMemoryMesh {
    let node = |i: u64, j: u64| j * (n + 1) + i + 1;
    let mut mesh = InMemoryMesh::new(2);
    for j in 0..=n {
        for i in 0..=n {
            mesh.add_node(node(i, j), [i as f64, j as f64, 0.0])
                .expect("valid node");
        }
    }
    for j in 0..n {
        for i in 0..n {
            let id = mesh
                .add_element(
                    j * n + i + 1,
                    ElemKind::Quad4,
                    &[node(i, j), node(i + 1, j), node(i + 1, j + 1), node(i, j + 1)],
                )
                .expect("valid element");
            if i == 0 {
                mesh.add_boundary(id, 3, 1).expect("valid side");
            }
        }
    }
    mesh.find_neighbors();
    mesh
}

fn fresh_map() -> DofMap {
    let mut dm = DofMap::default();
    dm.add_variables(&["u", "v"], FeType::lagrange(1), None)
        .expect("variables");
    dm.add_dirichlet_boundary(DirichletBoundary::constant([1], [0, 1], 0.0));
    dm
}

fn bench_numbering(c: &mut Criterion) {
    let mut group = c.benchmark_group("numbering");

    for &n in &[16u64, 48u64] {
        let mesh = quad_grid(n);

        group.bench_with_input(BenchmarkId::new("distribute_dofs", n), &mesh, |b, mesh| {
            b.iter(|| {
                let mut dm = fresh_map();
                black_box(dm.distribute_dofs(mesh, &NoComm).expect("numbering"));
            });
        });

        group.bench_with_input(BenchmarkId::new("constraints_and_sparsity", n), &mesh, |b, mesh| {
            b.iter(|| {
                let mut dm = fresh_map();
                dm.distribute_dofs(mesh, &NoComm).expect("numbering");
                dm.reinit_constraints(mesh, &NoComm, 0.0).expect("constraints");
                black_box(dm.compute_sparsity(mesh, &NoComm).expect("sparsity"));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_numbering);
criterion_main!(benches);
