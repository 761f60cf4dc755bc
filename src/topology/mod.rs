//! Mesh-side identifiers and the read-only mesh collaborator.

pub mod ids;
pub mod mesh;
