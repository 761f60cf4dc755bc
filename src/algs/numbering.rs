//! Distributed DOF numbering.
//!
//! Each rank numbers the DOFs on the objects it owns into a contiguous
//! local block, the blocks are stacked in rank order through an allgather
//! of local counts, and global scalar variables take a trailing block on the
//! last rank. Ghost objects then receive their indices from their owners in
//! one request/reply round.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::algs::communicator::{Communicator, DofMapCommTags};
use crate::algs::exchange::{all_to_all, allgather_u64};
use crate::algs::wire::{kind, WireDofStart, WireObjectKey, WireReader, WireWriter};
use crate::data::dof_object::{DofObjectTable, VarDofs};
use crate::data::variable::VariableRegistry;
use crate::dof_error::DofMapError;
use crate::topology::ids::{DofId, DofObjectId, NodeId, Rank, SubdomainId};
use crate::topology::mesh::{MeshElement, MeshView};

/// Layout of DOFs inside a rank's block.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NumberingOrder {
    /// All DOFs of variable 0, then variable 1, ...
    #[default]
    VariableMajor,
    /// All variables of one node or element together.
    NodeMajor,
}

/// Result of [`distribute_dofs`].
#[derive(Clone, Debug, Default)]
pub struct Numbering {
    pub table: DofObjectTable,
    /// `first_dof[p]` for every rank `p`.
    pub first_dof: Vec<DofId>,
    /// `end_dof[p]` for every rank `p`.
    pub end_dof: Vec<DofId>,
    pub n_dofs: DofId,
    pub n_scalar_dofs: DofId,
    /// Global indices of each scalar variable, `None` for field variables.
    pub scalar_dofs: Vec<Option<Range<DofId>>>,
}

impl Numbering {
    pub fn local_range(&self, rank: Rank) -> Range<DofId> {
        match (self.first_dof.get(rank), self.end_dof.get(rank)) {
            (Some(&f), Some(&e)) => f..e,
            _ => 0..0,
        }
    }

    /// The rank whose block contains `dof`.
    pub fn dof_owner(&self, dof: DofId) -> Result<Rank, DofMapError> {
        if dof >= self.n_dofs {
            return Err(DofMapError::DofOutOfRange {
                dof,
                n_dofs: self.n_dofs,
            });
        }
        // Empty blocks share their start with the next rank; take the last
        // rank starting at or before `dof` whose block is non-empty.
        let p = self.end_dof.partition_point(|&e| e <= dof);
        Ok(p)
    }

    /// Indices of variable `var` on `elem`: its nodes' DOFs in local node
    /// order, then the element's own DOFs. Scalar variables yield their
    /// global block.
    pub fn element_dof_indices(
        &self,
        elem: &MeshElement,
        var: usize,
    ) -> Result<Vec<DofId>, DofMapError> {
        if let Some(Some(r)) = self.scalar_dofs.get(var) {
            return Ok(r.clone().collect());
        }
        let mut out = Vec::new();
        for &n in &elem.nodes {
            out.extend(self.table.dof_indices(DofObjectId::Node(n), var)?);
        }
        out.extend(self.table.dof_indices(DofObjectId::Elem(elem.id), var)?);
        Ok(out)
    }
}

/// Subdomains touching each visible node through active elements.
fn node_subdomains(mesh: &dyn MeshView) -> BTreeMap<NodeId, BTreeSet<SubdomainId>> {
    let mut out: BTreeMap<NodeId, BTreeSet<SubdomainId>> = BTreeMap::new();
    for e in mesh.active_elements() {
        for &n in &e.nodes {
            out.entry(n).or_default().insert(e.subdomain);
        }
    }
    out
}

/// DOF count of every variable on `obj`.
fn dof_counts(
    mesh: &dyn MeshView,
    vars: &VariableRegistry,
    subdomains: &BTreeMap<NodeId, BTreeSet<SubdomainId>>,
    obj: DofObjectId,
) -> Result<Vec<u32>, DofMapError> {
    let mut counts = Vec::with_capacity(vars.n_variables());
    match obj {
        DofObjectId::Node(n) => {
            let sids = subdomains.get(&n);
            for v in vars.variables() {
                let active = sids.is_some_and(|s| s.iter().any(|&sid| v.active_on_subdomain(sid)));
                counts.push(if active { v.fe_type().n_dofs_per_node() } else { 0 });
            }
        }
        DofObjectId::Elem(e) => {
            let elem = mesh.element_or_err(e)?;
            for v in vars.variables() {
                let active = v.active_on_subdomain(elem.subdomain);
                let n = v.fe_type().n_dofs_per_elem(elem.kind.dim());
                counts.push(if active { n } else { 0 });
            }
        }
    }
    Ok(counts)
}

/// Visible active objects in traversal order: for each active element by
/// id, its nodes in local order, then the element itself.
fn active_objects(mesh: &dyn MeshView) -> Vec<DofObjectId> {
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let mut out = Vec::new();
    for e in mesh.active_elements() {
        for &n in &e.nodes {
            if seen.insert(n) {
                out.push(DofObjectId::Node(n));
            }
        }
        out.push(DofObjectId::Elem(e.id));
    }
    out
}

fn object_owner(mesh: &dyn MeshView, obj: DofObjectId) -> Result<Rank, DofMapError> {
    match obj {
        DofObjectId::Node(n) => Ok(mesh.node_or_err(n)?.owner),
        DofObjectId::Elem(e) => Ok(mesh.element_or_err(e)?.owner),
    }
}

/// Number every DOF visible on this rank. Collective.
pub fn distribute_dofs<C: Communicator>(
    mesh: &dyn MeshView,
    vars: &VariableRegistry,
    order: NumberingOrder,
    comm: &C,
    tags: &DofMapCommTags,
) -> Result<Numbering, DofMapError> {
    let me = comm.rank();
    let size = comm.size();
    let n_vars = vars.n_variables();
    let subdomains = node_subdomains(mesh);

    let mut owned: Vec<(DofObjectId, Vec<u32>)> = Vec::new();
    let mut ghosts: BTreeMap<Rank, Vec<DofObjectId>> = BTreeMap::new();
    for obj in active_objects(mesh) {
        let owner = object_owner(mesh, obj)?;
        if owner >= size {
            return Err(DofMapError::ProcessorOutOfRange { rank: owner, size });
        }
        if owner == me {
            owned.push((obj, dof_counts(mesh, vars, &subdomains, obj)?));
        } else {
            ghosts.entry(owner).or_default().push(obj);
        }
    }

    // Local block, offsets relative to this rank's first DOF.
    let mut table = DofObjectTable::new(n_vars);
    let mut next: DofId = 0;
    match order {
        NumberingOrder::VariableMajor => {
            for (obj, _) in &owned {
                table.activate(*obj);
            }
            for v in 0..n_vars {
                for (obj, counts) in &owned {
                    if counts[v] > 0 {
                        table.activate(*obj)[v] = VarDofs::new(next, counts[v]);
                        next += counts[v] as DofId;
                    }
                }
            }
        }
        NumberingOrder::NodeMajor => {
            for (obj, counts) in &owned {
                let slots = table.activate(*obj);
                for (v, &n) in counts.iter().enumerate() {
                    if n > 0 {
                        slots[v] = VarDofs::new(next, n);
                        next += n as DofId;
                    }
                }
            }
        }
    }

    let scalar_sizes: Vec<Option<DofId>> = vars
        .variables()
        .iter()
        .map(|v| v.fe_type().is_scalar().then_some(v.fe_type().order as DofId))
        .collect();
    let n_scalar_dofs: DofId = scalar_sizes.iter().flatten().sum();
    let local_count = next + if me + 1 == size { n_scalar_dofs } else { 0 };

    let counts = allgather_u64(comm, tags.reduce, local_count)?;
    let mut first_dof = Vec::with_capacity(size);
    let mut end_dof = Vec::with_capacity(size);
    let mut acc = 0;
    for c in counts {
        first_dof.push(acc);
        acc += c;
        end_dof.push(acc);
    }
    let n_dofs = acc;
    let my_first = first_dof[me];

    for (obj, _) in &owned {
        let shifted = table
            .get(*obj)
            .map(|s| {
                s.iter()
                    .map(|d| if d.is_empty() { *d } else { VarDofs::new(d.first + my_first, d.n) })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        table.set_all(*obj, shifted)?;
    }

    let mut scalar_dofs = Vec::with_capacity(n_vars);
    let mut s = n_dofs - n_scalar_dofs;
    for sz in &scalar_sizes {
        scalar_dofs.push(sz.map(|n| {
            let r = s..s + n;
            s += n;
            r
        }));
    }

    fetch_ghost_indices(mesh, comm, tags, n_vars, &ghosts, &mut table)?;

    log::debug!(
        "rank {me}: {} owned DOFs in [{}, {}), {} total, {} ghost objects",
        local_count,
        first_dof[me],
        end_dof[me],
        n_dofs,
        ghosts.values().map(Vec::len).sum::<usize>()
    );

    Ok(Numbering {
        table,
        first_dof,
        end_dof,
        n_dofs,
        n_scalar_dofs,
        scalar_dofs,
    })
}

/// Ask owners for the indices of `ghosts` and record the replies.
fn fetch_ghost_indices<C: Communicator>(
    mesh: &dyn MeshView,
    comm: &C,
    tags: &DofMapCommTags,
    n_vars: usize,
    ghosts: &BTreeMap<Rank, Vec<DofObjectId>>,
    table: &mut DofObjectTable,
) -> Result<(), DofMapError> {
    let requests = ghosts
        .iter()
        .map(|(&owner, objs)| {
            let mut w = WireWriter::new(kind::DOF_REQUEST, objs.len());
            for obj in objs {
                let (k, id) = obj.to_wire();
                w.push(WireObjectKey::new(k, id, 0));
            }
            (owner, w.finish())
        })
        .collect();
    let incoming = all_to_all(comm, tags.ghost_dofs, requests)?;

    let mut replies = BTreeMap::new();
    for (peer, buf) in incoming {
        if buf.is_empty() {
            continue;
        }
        let (mut r, n) = WireReader::open(&buf, kind::DOF_REQUEST)?;
        let mut w = WireWriter::new(kind::DOF_REPLY, n);
        for _ in 0..n {
            let key: WireObjectKey = r.take()?;
            let obj = DofObjectId::from_wire(key.kind(), key.id())?;
            match table.get(obj) {
                Some(slots) if mesh_owns(mesh, comm.rank(), obj) => {
                    w.push(WireObjectKey::new(key.kind(), key.id(), slots.len() as u32));
                    for s in slots {
                        w.push(WireDofStart::new(s.first, s.n));
                    }
                }
                _ => w.push(WireObjectKey::new(key.kind(), key.id(), 0)),
            }
        }
        r.finish()?;
        replies.insert(peer, w.finish());
    }
    let answers = all_to_all(comm, tags.ghost_dofs, replies)?;

    for (owner, objs) in ghosts {
        let buf = answers.get(owner).map(Vec::as_slice).unwrap_or_default();
        let (mut r, n) = WireReader::open(buf, kind::DOF_REPLY)?;
        if n != objs.len() {
            return Err(DofMapError::WireFormat(format!(
                "rank {owner} answered {n} of {} DOF requests",
                objs.len()
            )));
        }
        for &obj in objs {
            let key: WireObjectKey = r.take()?;
            let got = DofObjectId::from_wire(key.kind(), key.id())?;
            if got != obj || key.n_vars() as usize != n_vars {
                return Err(DofMapError::MissingRemoteDofs { owner: *owner, object: obj });
            }
            let mut slots = Vec::with_capacity(n_vars);
            for _ in 0..n_vars {
                let s: WireDofStart = r.take()?;
                slots.push(VarDofs::new(s.first(), s.n()));
            }
            table.set_all(obj, slots)?;
        }
        r.finish()?;
    }
    Ok(())
}

fn mesh_owns(mesh: &dyn MeshView, me: Rank, obj: DofObjectId) -> bool {
    object_owner(mesh, obj).is_ok_and(|o| o == me)
}
