//! Strong handles for mesh entities and global DOF indices.
//!
//! Nodes and elements are identified by opaque, non-zero `u64` ids handed out
//! by the mesh collaborator. Global degrees of freedom are plain `u64`
//! indices into the dense range `[0, n_dofs)`.

use std::{fmt, num::NonZeroU64};

use crate::dof_error::DofMapError;

/// Global degree-of-freedom index.
pub type DofId = u64;

/// Processor (rank) index.
pub type Rank = usize;

/// Subdomain tag carried by an element.
pub type SubdomainId = u16;

/// Boundary tag carried by an element side.
pub type BoundaryId = i16;

/// Index of a quantity of interest for adjoint constraint values.
pub type QoiIndex = u32;

/// A point in physical space.
pub type Point = [f64; 3];

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Create a handle from a raw, non-zero id.
            #[inline]
            pub fn new(raw: u64) -> Result<Self, DofMapError> {
                NonZeroU64::new(raw)
                    .map($name)
                    .ok_or(DofMapError::InvalidEntityId)
            }

            /// Raw id value.
            #[inline]
            pub const fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.get()).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.get())
            }
        }
    };
}

entity_id!(
    /// Mesh node handle. `0` is reserved as invalid.
    NodeId
);

entity_id!(
    /// Mesh element handle. `0` is reserved as invalid.
    ElemId
);

/// A mesh entity that may carry degrees of freedom.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum DofObjectId {
    /// DOFs living on a node (e.g. continuous Lagrange values).
    Node(NodeId),
    /// DOFs living in an element interior (e.g. discontinuous monomials).
    Elem(ElemId),
}

impl DofObjectId {
    const NODE_KIND: u32 = 1;
    const ELEM_KIND: u32 = 2;

    /// Wire encoding `(kind, raw id)`.
    pub fn to_wire(self) -> (u32, u64) {
        match self {
            DofObjectId::Node(n) => (Self::NODE_KIND, n.get()),
            DofObjectId::Elem(e) => (Self::ELEM_KIND, e.get()),
        }
    }

    /// Decode from `(kind, raw id)`.
    pub fn from_wire(kind: u32, raw: u64) -> Result<Self, DofMapError> {
        match kind {
            Self::NODE_KIND => Ok(DofObjectId::Node(NodeId::new(raw)?)),
            Self::ELEM_KIND => Ok(DofObjectId::Elem(ElemId::new(raw)?)),
            other => Err(DofMapError::WireFormat(format!(
                "unknown DOF object kind {other}"
            ))),
        }
    }
}

impl fmt::Display for DofObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DofObjectId::Node(n) => write!(f, "node {n}"),
            DofObjectId::Elem(e) => write!(f, "elem {e}"),
        }
    }
}
