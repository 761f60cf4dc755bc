//! Consistency checks on the constraint tables.
//!
//! Checks are compiled in for debug builds, and for release builds with
//! `--features check-invariants`. Otherwise [`debug_invariants!`] expands to
//! nothing and the tables are trusted.

use crate::dof_error::DofMapError;

/// A DOF map table that can verify its own structure.
pub trait DebugInvariants {
    /// Table name reported when a check fails.
    const TABLE: &'static str;

    /// Return the first violated invariant.
    fn validate_invariants(&self) -> Result<(), DofMapError>;

    /// Panic on a violated invariant when checks are compiled in.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), Self::TABLE);
    }
}

/// Run a fallible table check and panic naming the table if it fails.
#[macro_export]
macro_rules! debug_invariants {
    ($check:expr, $table:expr) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(e) = $check {
            panic!("[dof tables] {} is inconsistent: {}", $table, e);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Table(Option<u64>);

    impl DebugInvariants for Table {
        const TABLE: &'static str = "test table";

        fn validate_invariants(&self) -> Result<(), DofMapError> {
            match self.0 {
                Some(dof) => Err(DofMapError::SelfReferencingConstraint { dof }),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn consistent_table_passes() {
        Table(None).debug_assert_invariants();
    }

    #[test]
    #[cfg(any(debug_assertions, feature = "check-invariants"))]
    #[should_panic(expected = "test table is inconsistent")]
    fn broken_table_panics_with_its_name() {
        Table(Some(4)).debug_assert_invariants();
    }
}
