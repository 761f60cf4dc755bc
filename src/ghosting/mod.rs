//! Ghosting functors: which off-process elements (and DOFs) must be visible.
//!
//! *Coupling* functors drive matrix sparsity, *algebraic* functors drive
//! vector ghosting. Every coupling functor is implicitly algebraic too.
//!
//! Functors are registered either exclusively (`Box`, owned by the set) or
//! shared (`Arc`, the caller keeps a handle). A functor flagged `to_mesh` is
//! also reported to the mesh partition layer through
//! [`GhostingFunctorSet::mesh_ghosting_functors`]; opting out means the
//! caller guarantees the mesh already ghosts at least as broadly.

pub mod default_coupling;

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::Arc;

use crate::data::coupling::CouplingMatrix;
use crate::topology::ids::{ElemId, Rank};
use crate::topology::mesh::MeshView;

pub use default_coupling::DefaultCoupling;

/// Elements to ghost, each with an optional coupling restriction.
/// `None` means full coupling.
pub type GhostedElements = BTreeMap<ElemId, Option<Arc<CouplingMatrix>>>;

/// Declares which elements must be visible for a range of local elements.
pub trait GhostingFunctor: Send + Sync + fmt::Debug {
    /// Elements coupled to `elems`. With `proc = Some(p)`, elements owned by
    /// `p` are left out; with `None`, nothing is filtered.
    fn ghost_elements(
        &self,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements;

    fn name(&self) -> &str {
        "GhostingFunctor"
    }
}

/// Union `from` into `into`. Coupling matrices of elements present in both
/// are OR-ed; a missing matrix (full coupling) wins over any partial one.
pub fn merge_ghosted_elements(into: &mut GhostedElements, from: GhostedElements) {
    for (elem, cm) in from {
        match into.entry(elem) {
            Entry::Vacant(v) => {
                v.insert(cm);
            }
            Entry::Occupied(mut o) => {
                let merged = match (o.get(), cm) {
                    (None, _) | (_, None) => None,
                    (Some(a), Some(b)) if Arc::ptr_eq(a, &b) || **a == *b => Some(b),
                    (Some(a), Some(b)) => Some(Arc::new(a.union(&b))),
                };
                o.insert(merged);
            }
        }
    }
}

/// Handle returned on registration, used for removal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctorId(u64);

enum Slot {
    Owned(Box<dyn GhostingFunctor>),
    Shared(Arc<dyn GhostingFunctor>),
}

impl Slot {
    fn get(&self) -> &dyn GhostingFunctor {
        match self {
            Slot::Owned(b) => b.as_ref(),
            Slot::Shared(a) => a.as_ref(),
        }
    }
}

struct Registered {
    id: FunctorId,
    slot: Slot,
    to_mesh: bool,
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.slot {
            Slot::Owned(_) => "owned",
            Slot::Shared(_) => "shared",
        };
        f.debug_struct("Registered")
            .field("id", &self.id)
            .field("functor", &self.slot.get())
            .field("kind", &kind)
            .field("to_mesh", &self.to_mesh)
            .finish()
    }
}

/// Coupling and algebraic functors of one DOF map, defaults included.
#[derive(Debug)]
pub struct GhostingFunctorSet {
    coupling: Vec<Registered>,
    algebraic: Vec<Registered>,
    default_coupling: DefaultCoupling,
    default_algebraic: DefaultCoupling,
    use_defaults: bool,
    next_id: u64,
}

impl Default for GhostingFunctorSet {
    fn default() -> Self {
        Self {
            coupling: Vec::new(),
            algebraic: Vec::new(),
            default_coupling: DefaultCoupling::new(0),
            default_algebraic: DefaultCoupling::new(1),
            use_defaults: true,
            next_id: 0,
        }
    }
}

impl GhostingFunctorSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, slot: Slot, to_mesh: bool, coupling: bool) -> FunctorId {
        let id = FunctorId(self.next_id);
        self.next_id += 1;
        let entry = Registered { id, slot, to_mesh };
        if coupling {
            self.coupling.push(entry);
        } else {
            self.algebraic.push(entry);
        }
        id
    }

    /// Register a coupling functor owned by the set.
    pub fn add_coupling_functor(
        &mut self,
        functor: Box<dyn GhostingFunctor>,
        to_mesh: bool,
    ) -> FunctorId {
        self.register(Slot::Owned(functor), to_mesh, true)
    }

    /// Register a coupling functor shared with the caller.
    pub fn add_shared_coupling_functor(
        &mut self,
        functor: Arc<dyn GhostingFunctor>,
        to_mesh: bool,
    ) -> FunctorId {
        self.register(Slot::Shared(functor), to_mesh, true)
    }

    /// Register an algebraic functor owned by the set.
    pub fn add_algebraic_functor(
        &mut self,
        functor: Box<dyn GhostingFunctor>,
        to_mesh: bool,
    ) -> FunctorId {
        self.register(Slot::Owned(functor), to_mesh, false)
    }

    /// Register an algebraic functor shared with the caller.
    pub fn add_shared_algebraic_functor(
        &mut self,
        functor: Arc<dyn GhostingFunctor>,
        to_mesh: bool,
    ) -> FunctorId {
        self.register(Slot::Shared(functor), to_mesh, false)
    }

    pub fn remove_coupling_functor(&mut self, id: FunctorId) -> bool {
        let before = self.coupling.len();
        self.coupling.retain(|r| r.id != id);
        before != self.coupling.len()
    }

    pub fn remove_algebraic_functor(&mut self, id: FunctorId) -> bool {
        let before = self.algebraic.len();
        self.algebraic.retain(|r| r.id != id);
        before != self.algebraic.len()
    }

    /// Drop both default functors, e.g. for explicit-only solves.
    pub fn remove_default_ghosting(&mut self) {
        self.use_defaults = false;
    }

    pub fn add_default_ghosting(&mut self) {
        self.use_defaults = true;
    }

    pub fn has_default_ghosting(&self) -> bool {
        self.use_defaults
    }

    /// Restrict the default coupling functor to `coupling` (`None` = full).
    pub fn set_default_coupling(&mut self, coupling: Option<Arc<CouplingMatrix>>) {
        self.default_coupling = DefaultCoupling::new(0).with_coupling(coupling.clone());
        self.default_algebraic = DefaultCoupling::new(1).with_coupling(coupling);
    }

    pub fn default_coupling(&self) -> &DefaultCoupling {
        &self.default_coupling
    }

    /// Functors that determine sparsity.
    pub fn coupling_functors(&self) -> Vec<&dyn GhostingFunctor> {
        let mut out: Vec<&dyn GhostingFunctor> = Vec::new();
        if self.use_defaults {
            out.push(&self.default_coupling);
        }
        out.extend(self.coupling.iter().map(|r| r.slot.get()));
        out
    }

    /// Functors that determine vector ghosting (coupling functors included).
    pub fn algebraic_functors(&self) -> Vec<&dyn GhostingFunctor> {
        let mut out = self.coupling_functors();
        if self.use_defaults {
            out.push(&self.default_algebraic);
        }
        out.extend(self.algebraic.iter().map(|r| r.slot.get()));
        out
    }

    /// Functors the mesh partition layer must honor when choosing ghosts.
    pub fn mesh_ghosting_functors(&self) -> Vec<&dyn GhostingFunctor> {
        let mut out: Vec<&dyn GhostingFunctor> = Vec::new();
        if self.use_defaults {
            out.push(&self.default_coupling);
            out.push(&self.default_algebraic);
        }
        out.extend(
            self.coupling
                .iter()
                .chain(&self.algebraic)
                .filter(|r| r.to_mesh)
                .map(|r| r.slot.get()),
        );
        out
    }

    fn gather(
        functors: Vec<&dyn GhostingFunctor>,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements {
        let mut out = GhostedElements::new();
        for f in functors {
            let found = f.ghost_elements(mesh, elems, proc);
            let (visible, missing): (Vec<_>, Vec<_>) = found
                .into_iter()
                .partition(|(e, _)| mesh.element(*e).is_some());
            if !missing.is_empty() {
                log::warn!(
                    "{} requested {} elements not visible in the mesh view",
                    f.name(),
                    missing.len()
                );
            }
            merge_ghosted_elements(&mut out, visible.into_iter().collect());
        }
        out
    }

    /// Merged output of every coupling functor.
    pub fn coupled_elements(
        &self,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements {
        Self::gather(self.coupling_functors(), mesh, elems, proc)
    }

    /// Merged output of every algebraic functor.
    pub fn algebraic_elements(
        &self,
        mesh: &dyn MeshView,
        elems: &[ElemId],
        proc: Option<Rank>,
    ) -> GhostedElements {
        Self::gather(self.algebraic_functors(), mesh, elems, proc)
    }
}
