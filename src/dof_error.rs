//! DofMapError: unified error type for mesh-dofmap public APIs.
//!
//! Every phase of DOF distribution, constraint processing and sparsity
//! construction reports failures through this type. Contract violations
//! (bad indices, calling phases out of order) and data-consistency
//! violations (constraint loops, forbidden overwrites, unknown boundary
//! ids) are both fatal for the run: callers are expected to abort rather
//! than continue with a numbering that would be numerically wrong.

use thiserror::Error;

use crate::topology::ids::{BoundaryId, DofId, DofObjectId, ElemId, NodeId, Rank};

/// Unified error type for mesh-dofmap operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DofMapError {
    /// Attempted to construct an entity id with the reserved value 0.
    #[error("entity id must be non-zero (0 is reserved as invalid)")]
    InvalidEntityId,
    /// A variable index beyond the number of registered variables.
    #[error("variable index {index} out of range (have {len} variables)")]
    VariableIndexOutOfRange { index: usize, len: usize },
    /// A variable-group index beyond the number of registered groups.
    #[error("variable group index {index} out of range (have {len} groups)")]
    VariableGroupOutOfRange { index: usize, len: usize },
    /// A processor id beyond the communicator size.
    #[error("processor {rank} out of range (communicator size {size})")]
    ProcessorOutOfRange { rank: Rank, size: usize },
    /// A DOF index outside `[0, n_dofs)`.
    #[error("DOF {dof} out of range (n_dofs = {n_dofs})")]
    DofOutOfRange { dof: DofId, n_dofs: DofId },
    /// Variable registration is degenerate or inconsistent.
    #[error("invalid variable configuration: {0}")]
    InvalidVariableConfiguration(String),
    /// Element matrix/vector size does not match the DOF list.
    #[error("element DOF size mismatch: expected {expected}, got {got}")]
    ElementDofSizeMismatch { expected: usize, got: usize },
    /// An operation was invoked before its prerequisites ran.
    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    /// The mesh view does not contain the element.
    #[error("element {0} is not visible in the mesh view")]
    UnknownElement(ElemId),
    /// The mesh view does not contain the node.
    #[error("node {0} is not visible in the mesh view")]
    UnknownNode(NodeId),
    /// A DOF object has no global indices assigned on this rank.
    #[error("no DOF indices known for {0}")]
    MissingDofs(DofObjectId),
    /// The owning processor did not report indices for a ghost object.
    #[error("rank {owner} did not return DOF indices for {object}")]
    MissingRemoteDofs { owner: Rank, object: DofObjectId },
    /// A DOF transitively depends on itself through constraint rows.
    #[error("constraint loop detected involving DOF {dof}")]
    ConstraintLoop { dof: DofId },
    /// A processed row still names a constrained master.
    #[error("constraint row for DOF {dof} is not resolved to free masters")]
    UnresolvedConstraint { dof: DofId },
    /// A constraint row was inserted for an already-constrained DOF while overwriting is forbidden.
    #[error("DOF {dof} is already constrained and overwriting is forbidden")]
    ConstraintOverwrite { dof: DofId },
    /// An adjoint value was given for a DOF without a primal row while overwriting is forbidden.
    #[error("DOF {dof} has no primal constraint row to attach an adjoint value to")]
    MissingPrimalConstraint { dof: DofId },
    /// A node constraint row was inserted for an already-constrained node while overwriting is forbidden.
    #[error("node {node} is already constrained and overwriting is forbidden")]
    NodeConstraintOverwrite { node: NodeId },
    /// A constraint row references the DOF it constrains.
    #[error("constraint row for DOF {dof} references itself")]
    SelfReferencingConstraint { dof: DofId },
    /// A node constraint row references the node it constrains.
    #[error("node constraint row for node {node} references itself")]
    SelfReferencingNodeConstraint { node: NodeId },
    /// A node transitively depends on itself through node constraint rows.
    #[error("node constraint loop detected involving node {node}")]
    NodeConstraintLoop { node: NodeId },
    /// A Dirichlet boundary names an id that does not occur in the mesh.
    #[error("Dirichlet boundary id {0} is not present in the mesh")]
    MissingDirichletBoundaryId(BoundaryId),
    /// A periodic image node could not be located for a locally owned node.
    #[error("periodic partner of node {node} on boundary {boundary} not found")]
    PeriodicPartnerMissing { node: NodeId, boundary: BoundaryId },
    /// Hanging-node rows are only built for first-order continuous variables.
    #[error("hanging-node constraints unsupported for variable {variable} of order {order}")]
    UnsupportedHangingNodeOrder { variable: usize, order: u32 },
    /// A vector passed to constraint enforcement lacks a required entry.
    #[error("vector has no entry for DOF {0}")]
    MissingVectorEntry(DofId),
    /// A stash/unstash call found the destination non-empty.
    #[error("constraint stash misuse: {0}")]
    StashMisuse(&'static str),
    /// Communication with a neighbor failed.
    #[error("communication error with rank {neighbor}: {detail}")]
    CommError { neighbor: Rank, detail: String },
    /// A received buffer did not decode.
    #[error("wire format error: {0}")]
    WireFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn comm_error_carries_a_message_not_a_cause() {
        let e = DofMapError::CommError {
            neighbor: 3,
            detail: "receive did not complete".into(),
        };
        assert_eq!(
            e.to_string(),
            "communication error with rank 3: receive did not complete"
        );
        assert!(e.source().is_none());
    }
}
