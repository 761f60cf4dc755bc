//! The mesh collaborator as seen by the DOF map.
//!
//! Mesh storage, partitioning and refinement live outside this crate; the
//! DOF map only needs read access to the elements and nodes visible on the
//! current rank, their owners, parent/child links and side topology. That
//! access goes through [`MeshView`].
//!
//! [`InMemoryMesh`] is a small owned implementation used by tests and by
//! callers that assemble a mesh by hand. It can carve out the per-rank view
//! of a globally described mesh with [`InMemoryMesh::partitioned_view`].

use std::collections::{BTreeMap, BTreeSet};

use crate::dof_error::DofMapError;
use crate::ghosting::GhostingFunctor;
use crate::topology::ids::{BoundaryId, ElemId, NodeId, Point, Rank, SubdomainId};

/// Geometric element kinds understood by the side tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ElemKind {
    Edge2,
    Tri3,
    Quad4,
    Tet4,
    Hex8,
}

const EDGE2_SIDES: [&[usize]; 2] = [&[0], &[1]];
const TRI3_SIDES: [&[usize]; 3] = [&[0, 1], &[1, 2], &[2, 0]];
const QUAD4_SIDES: [&[usize]; 4] = [&[0, 1], &[1, 2], &[2, 3], &[3, 0]];
const TET4_SIDES: [&[usize]; 4] = [&[0, 2, 1], &[0, 1, 3], &[1, 2, 3], &[2, 0, 3]];
const HEX8_SIDES: [&[usize]; 6] = [
    &[0, 3, 2, 1],
    &[0, 1, 5, 4],
    &[1, 2, 6, 5],
    &[2, 3, 7, 6],
    &[3, 0, 4, 7],
    &[4, 5, 6, 7],
];

impl ElemKind {
    /// Topological dimension.
    pub fn dim(self) -> usize {
        match self {
            ElemKind::Edge2 => 1,
            ElemKind::Tri3 | ElemKind::Quad4 => 2,
            ElemKind::Tet4 | ElemKind::Hex8 => 3,
        }
    }

    /// Number of nodes.
    pub fn n_nodes(self) -> usize {
        match self {
            ElemKind::Edge2 => 2,
            ElemKind::Tri3 => 3,
            ElemKind::Quad4 | ElemKind::Tet4 => 4,
            ElemKind::Hex8 => 8,
        }
    }

    fn sides(self) -> &'static [&'static [usize]] {
        match self {
            ElemKind::Edge2 => &EDGE2_SIDES,
            ElemKind::Tri3 => &TRI3_SIDES,
            ElemKind::Quad4 => &QUAD4_SIDES,
            ElemKind::Tet4 => &TET4_SIDES,
            ElemKind::Hex8 => &HEX8_SIDES,
        }
    }

    /// Number of sides (codimension-1 faces).
    pub fn n_sides(self) -> usize {
        self.sides().len()
    }

    /// Local node indices on `side`, in cyclic order.
    pub fn side_nodes(self, side: usize) -> &'static [usize] {
        self.sides().get(side).copied().unwrap_or(&[])
    }
}

/// A mesh node visible on this rank.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MeshNode {
    pub id: NodeId,
    pub point: Point,
    pub owner: Rank,
}

/// A mesh element visible on this rank.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MeshElement {
    pub id: ElemId,
    pub kind: ElemKind,
    pub nodes: Vec<NodeId>,
    pub owner: Rank,
    pub subdomain: SubdomainId,
    pub parent: Option<ElemId>,
    pub level: u32,
    /// Leaf of the refinement tree, i.e. currently carrying DOFs.
    pub active: bool,
    /// Neighbor across each side; may be coarser than this element.
    pub neighbors: Vec<Option<ElemId>>,
    /// Boundary ids attached to each side.
    pub side_boundaries: Vec<Vec<BoundaryId>>,
}

impl MeshElement {
    /// Node ids on `side`, in cyclic order.
    pub fn side_node_ids(&self, side: usize) -> Vec<NodeId> {
        self.kind
            .side_nodes(side)
            .iter()
            .filter_map(|&i| self.nodes.get(i).copied())
            .collect()
    }

    /// Whether `side` carries boundary id `bid`.
    pub fn side_has_boundary(&self, side: usize, bid: BoundaryId) -> bool {
        self.side_boundaries
            .get(side)
            .is_some_and(|ids| ids.contains(&bid))
    }

    /// Neighbor across `side`, if any.
    pub fn neighbor(&self, side: usize) -> Option<ElemId> {
        self.neighbors.get(side).copied().flatten()
    }
}

/// Read-only access to the part of the mesh visible on the current rank.
pub trait MeshView {
    /// Spatial dimension of the mesh.
    fn mesh_dimension(&self) -> usize;

    /// Every boundary id used anywhere in the (global) mesh.
    fn boundary_ids(&self) -> &BTreeSet<BoundaryId>;

    /// Element lookup.
    fn element(&self, id: ElemId) -> Option<&MeshElement>;

    /// Node lookup.
    fn node(&self, id: NodeId) -> Option<&MeshNode>;

    /// All visible elements (local, ghost and inactive ancestors), ordered by id.
    fn elements(&self) -> Box<dyn Iterator<Item = &MeshElement> + '_>;

    /// All visible nodes, ordered by id.
    fn nodes(&self) -> Box<dyn Iterator<Item = &MeshNode> + '_>;

    /// Element lookup that fails loudly.
    fn element_or_err(&self, id: ElemId) -> Result<&MeshElement, DofMapError> {
        self.element(id).ok_or(DofMapError::UnknownElement(id))
    }

    /// Node lookup that fails loudly.
    fn node_or_err(&self, id: NodeId) -> Result<&MeshNode, DofMapError> {
        self.node(id).ok_or(DofMapError::UnknownNode(id))
    }

    /// Visible active elements.
    fn active_elements(&self) -> Box<dyn Iterator<Item = &MeshElement> + '_> {
        Box::new(self.elements().filter(|e| e.active))
    }

    /// Active elements owned by `rank`.
    fn active_local_elements(&self, rank: Rank) -> Box<dyn Iterator<Item = &MeshElement> + '_> {
        Box::new(self.elements().filter(move |e| e.active && e.owner == rank))
    }

    /// Map from node to the visible active elements containing it.
    fn node_to_elements(&self) -> BTreeMap<NodeId, Vec<ElemId>> {
        let mut map: BTreeMap<NodeId, Vec<ElemId>> = BTreeMap::new();
        for elem in self.active_elements() {
            for &n in &elem.nodes {
                map.entry(n).or_default().push(elem.id);
            }
        }
        map
    }

    /// Whether `ancestor` is `elem` or one of its parents.
    fn is_ancestor_or_self(&self, ancestor: ElemId, elem: ElemId) -> bool {
        let mut cur = Some(elem);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.element(id).and_then(|e| e.parent);
        }
        false
    }
}

/// Owned mesh used to describe a global mesh or one rank's view of it.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct InMemoryMesh {
    dim: usize,
    nodes: BTreeMap<NodeId, MeshNode>,
    elements: BTreeMap<ElemId, MeshElement>,
    boundary_ids: BTreeSet<BoundaryId>,
}

impl InMemoryMesh {
    /// Create an empty mesh of spatial dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Insert a node owned by rank 0.
    pub fn add_node(&mut self, id: u64, point: Point) -> Result<NodeId, DofMapError> {
        let id = NodeId::new(id)?;
        self.nodes.insert(
            id,
            MeshNode {
                id,
                point,
                owner: 0,
            },
        );
        Ok(id)
    }

    /// Insert an active level-0 element owned by rank 0.
    pub fn add_element(
        &mut self,
        id: u64,
        kind: ElemKind,
        nodes: &[u64],
    ) -> Result<ElemId, DofMapError> {
        if nodes.len() != kind.n_nodes() {
            return Err(DofMapError::ElementDofSizeMismatch {
                expected: kind.n_nodes(),
                got: nodes.len(),
            });
        }
        let id = ElemId::new(id)?;
        let mut node_ids = Vec::with_capacity(nodes.len());
        for &raw in nodes {
            let n = NodeId::new(raw)?;
            if !self.nodes.contains_key(&n) {
                return Err(DofMapError::UnknownNode(n));
            }
            node_ids.push(n);
        }
        self.elements.insert(
            id,
            MeshElement {
                id,
                kind,
                nodes: node_ids,
                owner: 0,
                subdomain: 0,
                parent: None,
                level: 0,
                active: true,
                neighbors: vec![None; kind.n_sides()],
                side_boundaries: vec![Vec::new(); kind.n_sides()],
            },
        );
        Ok(id)
    }

    /// Insert a child of `parent`; the parent becomes inactive.
    pub fn add_child(
        &mut self,
        parent: ElemId,
        id: u64,
        kind: ElemKind,
        nodes: &[u64],
    ) -> Result<ElemId, DofMapError> {
        let (level, owner, subdomain) = {
            let p = self
                .elements
                .get(&parent)
                .ok_or(DofMapError::UnknownElement(parent))?;
            (p.level + 1, p.owner, p.subdomain)
        };
        let child = self.add_element(id, kind, nodes)?;
        if let Some(c) = self.elements.get_mut(&child) {
            c.parent = Some(parent);
            c.level = level;
            c.owner = owner;
            c.subdomain = subdomain;
        }
        if let Some(p) = self.elements.get_mut(&parent) {
            p.active = false;
        }
        Ok(child)
    }

    fn element_mut(&mut self, id: ElemId) -> Result<&mut MeshElement, DofMapError> {
        self.elements
            .get_mut(&id)
            .ok_or(DofMapError::UnknownElement(id))
    }

    /// Set the owning rank of an element.
    pub fn set_owner(&mut self, elem: ElemId, owner: Rank) -> Result<(), DofMapError> {
        self.element_mut(elem)?.owner = owner;
        Ok(())
    }

    /// Set the owning rank of a node.
    pub fn set_node_owner(&mut self, node: NodeId, owner: Rank) -> Result<(), DofMapError> {
        self.nodes
            .get_mut(&node)
            .ok_or(DofMapError::UnknownNode(node))?
            .owner = owner;
        Ok(())
    }

    /// Set the subdomain tag of an element.
    pub fn set_subdomain(
        &mut self,
        elem: ElemId,
        subdomain: SubdomainId,
    ) -> Result<(), DofMapError> {
        self.element_mut(elem)?.subdomain = subdomain;
        Ok(())
    }

    /// Attach boundary id `bid` to `side` of `elem`.
    pub fn add_boundary(
        &mut self,
        elem: ElemId,
        side: usize,
        bid: BoundaryId,
    ) -> Result<(), DofMapError> {
        let e = self.element_mut(elem)?;
        let n_sides = e.kind.n_sides();
        let ids = e
            .side_boundaries
            .get_mut(side)
            .ok_or(DofMapError::ElementDofSizeMismatch {
                expected: n_sides,
                got: side,
            })?;
        if !ids.contains(&bid) {
            ids.push(bid);
        }
        self.boundary_ids.insert(bid);
        Ok(())
    }

    /// Explicitly set the neighbor across `side` of `elem`.
    pub fn set_neighbor(
        &mut self,
        elem: ElemId,
        side: usize,
        neighbor: Option<ElemId>,
    ) -> Result<(), DofMapError> {
        let e = self.element_mut(elem)?;
        let n_sides = e.kind.n_sides();
        let slot = e
            .neighbors
            .get_mut(side)
            .ok_or(DofMapError::ElementDofSizeMismatch {
                expected: n_sides,
                got: side,
            })?;
        *slot = neighbor;
        Ok(())
    }

    /// Discover neighbor links.
    ///
    /// Sides with identical vertex sets are linked to the finest unrelated
    /// element not finer than the querying one. Active sides left without a
    /// conforming partner inherit the neighbor of the ancestor side they lie
    /// on, which yields the coarser neighbor of a hanging side.
    pub fn find_neighbors(&mut self) {
        let mut by_key: BTreeMap<Vec<NodeId>, Vec<ElemId>> = BTreeMap::new();
        for e in self.elements.values() {
            for s in 0..e.kind.n_sides() {
                let mut key = e.side_node_ids(s);
                key.sort_unstable();
                by_key.entry(key).or_default().push(e.id);
            }
        }

        let mut links: Vec<(ElemId, usize, ElemId)> = Vec::new();
        for e in self.elements.values() {
            for s in 0..e.kind.n_sides() {
                let mut key = e.side_node_ids(s);
                key.sort_unstable();
                let best = by_key
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .filter(|&&c| c != e.id)
                    .filter(|&&c| !self.is_ancestor_or_self(c, e.id))
                    .filter(|&&c| !self.is_ancestor_or_self(e.id, c))
                    .filter_map(|c| self.elements.get(c))
                    .filter(|c| c.level <= e.level)
                    .max_by_key(|c| c.level);
                if let Some(nb) = best {
                    links.push((e.id, s, nb.id));
                }
            }
        }
        for (e, s, nb) in links {
            if let Some(el) = self.elements.get_mut(&e) {
                el.neighbors[s] = Some(nb);
            }
        }

        let mut inherited: Vec<(ElemId, usize, ElemId)> = Vec::new();
        for e in self.elements.values().filter(|e| e.active) {
            for s in 0..e.kind.n_sides() {
                if e.neighbors[s].is_some() {
                    continue;
                }
                let side_nodes: BTreeSet<NodeId> = e.side_node_ids(s).into_iter().collect();
                let mut cur = e.parent.and_then(|p| self.elements.get(&p));
                while let Some(anc) = cur {
                    let anc_side: BTreeSet<NodeId> = anc.side_node_ids(s).into_iter().collect();
                    if side_nodes.is_disjoint(&anc_side) {
                        break;
                    }
                    if let Some(nb) = anc.neighbor(s) {
                        if self.elements.get(&nb).is_some_and(|n| n.active) {
                            inherited.push((e.id, s, nb));
                        }
                        break;
                    }
                    cur = anc.parent.and_then(|p| self.elements.get(&p));
                }
            }
        }
        for (e, s, nb) in inherited {
            if let Some(el) = self.elements.get_mut(&e) {
                el.neighbors[s] = Some(nb);
            }
        }
    }

    /// Give every node to the lowest rank owning an active element that contains it.
    pub fn assign_node_owners_by_min_rank(&mut self) {
        let mut owners: BTreeMap<NodeId, Rank> = BTreeMap::new();
        for e in self.elements.values().filter(|e| e.active) {
            for &n in &e.nodes {
                owners
                    .entry(n)
                    .and_modify(|o| *o = (*o).min(e.owner))
                    .or_insert(e.owner);
            }
        }
        for (n, owner) in owners {
            if let Some(node) = self.nodes.get_mut(&n) {
                node.owner = owner;
            }
        }
    }

    /// Build the view of this (global) mesh seen by `rank`.
    ///
    /// The view holds the rank's active elements, every active element that
    /// shares a node with them, whatever `ghosting` asks for, and all
    /// ancestors of those. Neighbor links to elements outside the view are
    /// cleared.
    pub fn partitioned_view(
        &self,
        rank: Rank,
        ghosting: &[&dyn GhostingFunctor],
    ) -> Result<InMemoryMesh, DofMapError> {
        let node_elems = self.node_to_elements();
        let local: Vec<ElemId> = self
            .active_local_elements(rank)
            .map(|e| e.id)
            .collect();

        let mut keep: BTreeSet<ElemId> = local.iter().copied().collect();
        for id in &local {
            let elem = self.element_or_err(*id)?;
            for n in &elem.nodes {
                if let Some(touching) = node_elems.get(n) {
                    keep.extend(touching.iter().copied());
                }
            }
        }
        for functor in ghosting {
            keep.extend(functor.ghost_elements(self, &local, Some(rank)).into_keys());
        }
        let mut with_ancestors = keep.clone();
        for id in &keep {
            let mut cur = self.element(*id).and_then(|e| e.parent);
            while let Some(p) = cur {
                with_ancestors.insert(p);
                cur = self.element(p).and_then(|e| e.parent);
            }
        }

        let mut view = InMemoryMesh::new(self.dim);
        view.boundary_ids = self.boundary_ids.clone();
        for id in &with_ancestors {
            let mut elem = self.element_or_err(*id)?.clone();
            for nb in elem.neighbors.iter_mut() {
                if nb.is_some_and(|n| !with_ancestors.contains(&n)) {
                    *nb = None;
                }
            }
            for n in &elem.nodes {
                let node = self.node_or_err(*n)?;
                view.nodes.insert(*n, node.clone());
            }
            view.elements.insert(*id, elem);
        }
        Ok(view)
    }
}

impl MeshView for InMemoryMesh {
    fn mesh_dimension(&self) -> usize {
        self.dim
    }

    fn boundary_ids(&self) -> &BTreeSet<BoundaryId> {
        &self.boundary_ids
    }

    fn element(&self, id: ElemId) -> Option<&MeshElement> {
        self.elements.get(&id)
    }

    fn node(&self, id: NodeId) -> Option<&MeshNode> {
        self.nodes.get(&id)
    }

    fn elements(&self) -> Box<dyn Iterator<Item = &MeshElement> + '_> {
        Box::new(self.elements.values())
    }

    fn nodes(&self) -> Box<dyn Iterator<Item = &MeshNode> + '_> {
        Box::new(self.nodes.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(n_elems: u64) -> InMemoryMesh {
        let mut mesh = InMemoryMesh::new(1);
        for i in 0..=n_elems {
            mesh.add_node(i + 1, [i as f64, 0.0, 0.0]).unwrap();
        }
        for i in 0..n_elems {
            mesh.add_element(i + 1, ElemKind::Edge2, &[i + 1, i + 2])
                .unwrap();
        }
        mesh.find_neighbors();
        mesh
    }

    #[test]
    fn conforming_neighbors_are_linked() {
        let mesh = strip(3);
        let e2 = mesh.element(ElemId::new(2).unwrap()).unwrap();
        assert_eq!(e2.neighbor(0), Some(ElemId::new(1).unwrap()));
        assert_eq!(e2.neighbor(1), Some(ElemId::new(3).unwrap()));
        let e1 = mesh.element(ElemId::new(1).unwrap()).unwrap();
        assert_eq!(e1.neighbor(0), None);
    }

    #[test]
    fn node_owner_is_min_rank() {
        let mut mesh = strip(4);
        for (e, owner) in [(1, 0), (2, 0), (3, 1), (4, 1)] {
            mesh.set_owner(ElemId::new(e).unwrap(), owner).unwrap();
        }
        mesh.assign_node_owners_by_min_rank();
        let owners: Vec<Rank> = mesh.nodes().map(|n| n.owner).collect();
        assert_eq!(owners, vec![0, 0, 0, 1, 1]);
    }

    #[test]
    fn partitioned_view_keeps_one_ghost_layer() {
        let mut mesh = strip(4);
        for (e, owner) in [(1, 0), (2, 0), (3, 1), (4, 1)] {
            mesh.set_owner(ElemId::new(e).unwrap(), owner).unwrap();
        }
        mesh.assign_node_owners_by_min_rank();
        let view = mesh.partitioned_view(0, &[]).unwrap();
        let ids: Vec<u64> = view.elements().map(|e| e.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let e3 = view.element(ElemId::new(3).unwrap()).unwrap();
        assert_eq!(e3.neighbor(1), None);
    }

    #[test]
    fn hanging_side_inherits_coarse_neighbor() {
        // Two unit quads; the left one refined into four children.
        let mut mesh = InMemoryMesh::new(2);
        let pts = [
            (1, [0.0, 0.0]),
            (2, [1.0, 0.0]),
            (3, [2.0, 0.0]),
            (4, [0.0, 1.0]),
            (5, [1.0, 1.0]),
            (6, [2.0, 1.0]),
            (7, [0.5, 0.0]),
            (8, [1.0, 0.5]),
            (9, [0.5, 1.0]),
            (10, [0.0, 0.5]),
            (11, [0.5, 0.5]),
        ];
        for (id, [x, y]) in pts {
            mesh.add_node(id, [x, y, 0.0]).unwrap();
        }
        let left = mesh.add_element(1, ElemKind::Quad4, &[1, 2, 5, 4]).unwrap();
        let right = mesh.add_element(2, ElemKind::Quad4, &[2, 3, 6, 5]).unwrap();
        mesh.add_child(left, 3, ElemKind::Quad4, &[1, 7, 11, 10]).unwrap();
        let c1 = mesh.add_child(left, 4, ElemKind::Quad4, &[7, 2, 8, 11]).unwrap();
        let c2 = mesh.add_child(left, 5, ElemKind::Quad4, &[11, 8, 5, 9]).unwrap();
        mesh.add_child(left, 6, ElemKind::Quad4, &[10, 11, 9, 4]).unwrap();
        mesh.find_neighbors();

        assert_eq!(mesh.element(c1).unwrap().neighbor(1), Some(right));
        assert_eq!(mesh.element(c2).unwrap().neighbor(1), Some(right));
        assert_eq!(mesh.element(right).unwrap().neighbor(3), Some(left));
        assert_eq!(mesh.element(c2).unwrap().neighbor(0), Some(c1));
    }
}
