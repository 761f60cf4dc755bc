//! Variables, per-object DOF storage, constraints and boundary objects.

pub mod boundary;
pub mod constraints;
pub mod coupling;
pub mod dof_object;
pub mod element_constraints;
pub mod hanging_nodes;
pub mod variable;

pub use constraints::{DofConstraint, DofConstraints, NodeConstraints};
pub use coupling::CouplingMatrix;
pub use variable::{FeFamily, FeType, VariableRegistry};
