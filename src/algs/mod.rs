//! Communication and the collective algorithms of the DOF map.

pub mod communicator;
pub mod constraint_exchange;
pub mod exchange;
pub mod numbering;
pub mod sparsity;
pub mod wire;

pub use numbering::{distribute_dofs, Numbering, NumberingOrder};
pub use sparsity::{build_sparsity, SparsityPattern};
