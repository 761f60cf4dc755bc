//! Meshes and a one-thread-per-rank driver shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use mesh_dofmap::prelude::*;

/// `n` unit segments along x. Boundary 1 on the left end, 2 on the right.
pub fn strip(n: u64) -> InMemoryMesh {
    let mut mesh = InMemoryMesh::new(1);
    for i in 0..=n {
        mesh.add_node(i + 1, [i as f64, 0.0, 0.0]).unwrap();
    }
    for i in 0..n {
        mesh.add_element(i + 1, ElemKind::Edge2, &[i + 1, i + 2])
            .unwrap();
    }
    mesh.add_boundary(ElemId::new(1).unwrap(), 0, 1).unwrap();
    mesh.add_boundary(ElemId::new(n).unwrap(), 1, 2).unwrap();
    mesh.find_neighbors();
    mesh
}

pub fn grid_node(nx: u64, i: u64, j: u64) -> u64 {
    j * (nx + 1) + i + 1
}

/// `nx` by `ny` unit quads. Boundaries 1..=4: bottom, right, top, left.
pub fn quad_grid(nx: u64, ny: u64) -> InMemoryMesh {
    let mut mesh = InMemoryMesh::new(2);
    for j in 0..=ny {
        for i in 0..=nx {
            mesh.add_node(grid_node(nx, i, j), [i as f64, j as f64, 0.0])
                .unwrap();
        }
    }
    for j in 0..ny {
        for i in 0..nx {
            let id = mesh
                .add_element(
                    j * nx + i + 1,
                    ElemKind::Quad4,
                    &[
                        grid_node(nx, i, j),
                        grid_node(nx, i + 1, j),
                        grid_node(nx, i + 1, j + 1),
                        grid_node(nx, i, j + 1),
                    ],
                )
                .unwrap();
            if j == 0 {
                mesh.add_boundary(id, 0, 1).unwrap();
            }
            if i == nx - 1 {
                mesh.add_boundary(id, 1, 2).unwrap();
            }
            if j == ny - 1 {
                mesh.add_boundary(id, 2, 3).unwrap();
            }
            if i == 0 {
                mesh.add_boundary(id, 3, 4).unwrap();
            }
        }
    }
    mesh.find_neighbors();
    mesh
}

/// Assign element owners and derive node owners.
pub fn partition(mesh: &mut InMemoryMesh, owner_of: impl Fn(&ElemId) -> Rank) {
    let ids: Vec<ElemId> = mesh.elements().map(|e| e.id).collect();
    for id in ids {
        mesh.set_owner(id, owner_of(&id)).unwrap();
    }
    mesh.assign_node_owners_by_min_rank();
}

/// Run `f` on `n` ranks, one thread each, results ordered by rank.
pub fn run_world<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ThreadComm) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = ThreadComm::world(n)
        .into_iter()
        .map(|comm| {
            let f = Arc::clone(&f);
            std::thread::spawn(move || f(comm))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
