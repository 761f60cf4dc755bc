//! # mesh-dofmap
//!
//! Distributed degree-of-freedom bookkeeping for finite-element meshes split
//! across ranks: a globally consistent DOF numbering with contiguous
//! per-rank ranges, a constraint graph (hanging nodes, periodic and
//! Dirichlet boundaries, user rows) resolved to unconstrained masters,
//! cross-rank constraint exchange, ghosting functors, and sparsity
//! patterns for preallocating distributed matrices.
//!
//! ## Setup sequence
//!
//! ```text
//! DofMap::distribute_dofs      number owned objects, stack rank blocks, fetch ghosts
//! DofMap::reinit_constraints   create → scatter → gather → process
//! DofMap::prepare_send_list    sort, dedup, user augmentation
//! DofMap::compute_sparsity     per-row n_nz / n_oz (and optionally the graph)
//! ```
//!
//! Every collective phase takes a [`Communicator`](algs::communicator::Communicator):
//! [`NoComm`](algs::communicator::NoComm) for serial runs,
//! [`ThreadComm`](algs::communicator::ThreadComm) for one-thread-per-rank
//! runs inside a process, and `MpiComm` with the `mpi-support` feature.
//!
//! The mesh is consumed through [`MeshView`](topology::mesh::MeshView);
//! [`InMemoryMesh`](topology::mesh::InMemoryMesh) is a small owned
//! implementation with partitioned per-rank views.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod dof_error;
pub mod dof_map;
pub mod ghosting;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use dof_error::DofMapError;
pub use dof_map::{DofMap, DofMapOptions, DofMapState};

/// The most-used traits and types.
pub mod prelude {
    pub use crate::algs::communicator::{CommTag, Communicator, DofMapCommTags, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::numbering::NumberingOrder;
    pub use crate::algs::sparsity::{AugmentSparsityPattern, PreallocatedMatrix, SparsityPattern};
    pub use crate::data::boundary::{DirichletBoundary, PeriodicBoundary};
    pub use crate::data::constraints::{
        ConstraintOrigin, DofConstraint, DofConstraintRow, DofConstraints, NodeConstraintRow,
    };
    pub use crate::data::coupling::CouplingMatrix;
    pub use crate::data::element_constraints::DofValues;
    pub use crate::data::variable::{FeFamily, FeType};
    pub use crate::dof_error::DofMapError;
    pub use crate::dof_map::{AugmentSendList, DofMap, DofMapOptions, DofMapState};
    pub use crate::ghosting::{DefaultCoupling, GhostingFunctor, GhostingFunctorSet};
    pub use crate::topology::ids::{DofId, DofObjectId, ElemId, NodeId, Rank};
    pub use crate::topology::mesh::{ElemKind, InMemoryMesh, MeshView};
}
