//! Geometric coupling through side-neighbor layers.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::data::coupling::CouplingMatrix;
use crate::ghosting::{GhostedElements, GhostingFunctor};
use crate::topology::ids::{ElemId, Rank};
use crate::topology::mesh::{MeshElement, MeshView};

/// Couples each element to itself and to `layers` rings of side neighbors.
///
/// With `layers == 0` this is the default coupling functor (DOFs on one
/// element couple to each other); with `layers == 1` it is the default
/// algebraic functor (one ring of neighbors is ghosted).
#[derive(Clone, Debug, Default)]
pub struct DefaultCoupling {
    coupling: Option<Arc<CouplingMatrix>>,
    layers: u32,
}

impl DefaultCoupling {
    pub fn new(layers: u32) -> Self {
        Self {
            coupling: None,
            layers,
        }
    }

    pub fn with_coupling(mut self, coupling: Option<Arc<CouplingMatrix>>) -> Self {
        self.coupling = coupling;
        self
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn coupling(&self) -> Option<&Arc<CouplingMatrix>> {
        self.coupling.as_ref()
    }
}

/// Active elements across each side of `elem`. A refined neighbor
/// contributes its active descendants that share a node with `elem`.
fn active_side_neighbors(mesh: &dyn MeshView, elem: &MeshElement) -> Vec<ElemId> {
    let mut out = Vec::new();
    for side in 0..elem.kind.n_sides() {
        let Some(nb) = elem.neighbor(side).and_then(|id| mesh.element(id)) else {
            continue;
        };
        if nb.active {
            out.push(nb.id);
            continue;
        }
        let nodes: BTreeSet<_> = elem.nodes.iter().copied().collect();
        out.extend(
            mesh.active_elements()
                .filter(|x| x.id != elem.id && x.nodes.iter().any(|n| nodes.contains(n)))
                .filter(|x| mesh.is_ancestor_or_self(nb.id, x.id))
                .map(|x| x.id),
        );
    }
    out
}

impl GhostingFunctor for DefaultCoupling {
    fn ghost_elements(
        &self,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements {
        let mut seen: BTreeSet<ElemId> = elems.iter().copied().collect();
        let mut frontier: Vec<ElemId> = elems.to_vec();
        for _ in 0..self.layers {
            let mut next = Vec::new();
            for id in &frontier {
                let Some(elem) = mesh.element(*id) else {
                    continue;
                };
                for nb in active_side_neighbors(mesh, elem) {
                    if seen.insert(nb) {
                        next.push(nb);
                    }
                }
            }
            frontier = next;
        }

        seen.into_iter()
            .filter_map(|id| mesh.element(id))
            .filter(|e| e.active && proc.is_none_or(|p| e.owner != p))
            .map(|e| (e.id, self.coupling.clone()))
            .collect()
    }

    fn name(&self) -> &str {
        "DefaultCoupling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::mesh::{ElemKind, InMemoryMesh};

    fn strip() -> InMemoryMesh {
        let mut mesh = InMemoryMesh::new(1);
        for i in 0..5u64 {
            mesh.add_node(i + 1, [i as f64, 0.0, 0.0]).unwrap();
        }
        for i in 0..4u64 {
            mesh.add_element(i + 1, ElemKind::Edge2, &[i + 1, i + 2])
                .unwrap();
        }
        mesh.find_neighbors();
        for e in 3..=4 {
            mesh.set_owner(ElemId::new(e).unwrap(), 1).unwrap();
        }
        mesh
    }

    fn ids(g: &GhostedElements) -> Vec<u64> {
        g.keys().map(|e| e.get()).collect()
    }

    #[test]
    fn zero_layers_is_self_coupling() {
        let mesh = strip();
        let local = [ElemId::new(1).unwrap(), ElemId::new(2).unwrap()];
        let f = DefaultCoupling::new(0);
        assert_eq!(ids(&f.ghost_elements(&mesh, &local, None)), vec![1, 2]);
        assert!(f.ghost_elements(&mesh, &local, Some(0)).is_empty());
    }

    #[test]
    fn layers_walk_side_neighbors_and_filter_by_owner() {
        let mesh = strip();
        let local = [ElemId::new(1).unwrap(), ElemId::new(2).unwrap()];
        assert_eq!(
            ids(&DefaultCoupling::new(1).ghost_elements(&mesh, &local, Some(0))),
            vec![3]
        );
        assert_eq!(
            ids(&DefaultCoupling::new(2).ghost_elements(&mesh, &local, Some(0))),
            vec![3, 4]
        );
    }
}
