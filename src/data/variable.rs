//! Variable registry: per-variable and per-group finite-element type bookkeeping.
//!
//! Variables are registered once at setup. Consecutive variables that share
//! an FE type and subdomain restriction form a [`VariableGroup`], which lets
//! the numbering lay their DOFs out in blocks.

use std::collections::BTreeSet;

use crate::dof_error::DofMapError;
use crate::topology::ids::SubdomainId;

/// Finite-element family; metadata only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FeFamily {
    /// Continuous nodal basis, one DOF per node.
    Lagrange,
    /// Discontinuous complete polynomial basis, all DOFs on the element.
    Monomial,
    /// Global unknowns attached to no mesh entity.
    Scalar,
}

/// FE family plus polynomial order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FeType {
    pub family: FeFamily,
    pub order: u32,
}

impl FeType {
    pub const fn new(family: FeFamily, order: u32) -> Self {
        Self { family, order }
    }

    pub const fn lagrange(order: u32) -> Self {
        Self::new(FeFamily::Lagrange, order)
    }

    pub const fn monomial(order: u32) -> Self {
        Self::new(FeFamily::Monomial, order)
    }

    /// `n` global scalar unknowns.
    pub const fn scalar(n: u32) -> Self {
        Self::new(FeFamily::Scalar, n)
    }

    /// DOFs carried by each node touched by an element of this type.
    pub fn n_dofs_per_node(&self) -> u32 {
        match self.family {
            FeFamily::Lagrange => 1,
            FeFamily::Monomial | FeFamily::Scalar => 0,
        }
    }

    /// DOFs carried by each element interior in `dim` dimensions.
    pub fn n_dofs_per_elem(&self, dim: usize) -> u32 {
        match self.family {
            FeFamily::Monomial => binomial(self.order as u64 + dim as u64, dim as u64) as u32,
            FeFamily::Lagrange | FeFamily::Scalar => 0,
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.family == FeFamily::Lagrange
    }

    pub fn is_scalar(&self) -> bool {
        self.family == FeFamily::Scalar
    }

    fn validate(&self) -> Result<(), DofMapError> {
        match self.family {
            FeFamily::Lagrange | FeFamily::Scalar if self.order == 0 => {
                Err(DofMapError::InvalidVariableConfiguration(format!(
                    "{:?} variables need order >= 1",
                    self.family
                )))
            }
            _ => Ok(()),
        }
    }
}

fn binomial(n: u64, k: u64) -> u64 {
    (0..k).fold(1, |acc, i| acc * (n - i) / (i + 1))
}

/// One named scalar unknown field.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Variable {
    name: String,
    number: usize,
    fe_type: FeType,
    /// `None` means active everywhere.
    active_subdomains: Option<BTreeSet<SubdomainId>>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn number(&self) -> usize {
        self.number
    }
    pub fn fe_type(&self) -> FeType {
        self.fe_type
    }
    pub fn active_subdomains(&self) -> Option<&BTreeSet<SubdomainId>> {
        self.active_subdomains.as_ref()
    }
    pub fn active_on_subdomain(&self, sid: SubdomainId) -> bool {
        self.active_subdomains
            .as_ref()
            .is_none_or(|s| s.contains(&sid))
    }
}

/// A maximal run of consecutive variables with identical FE type and
/// subdomain restriction.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VariableGroup {
    first_variable: usize,
    n_variables: usize,
    fe_type: FeType,
    active_subdomains: Option<BTreeSet<SubdomainId>>,
}

impl VariableGroup {
    pub fn first_variable(&self) -> usize {
        self.first_variable
    }
    pub fn n_variables(&self) -> usize {
        self.n_variables
    }
    pub fn variables(&self) -> std::ops::Range<usize> {
        self.first_variable..self.first_variable + self.n_variables
    }
    pub fn fe_type(&self) -> FeType {
        self.fe_type
    }
}

/// Registry of all variables of one system.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VariableRegistry {
    variables: Vec<Variable>,
    groups: Vec<VariableGroup>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one variable; returns its number.
    pub fn add_variable(
        &mut self,
        name: &str,
        fe_type: FeType,
        active_subdomains: Option<BTreeSet<SubdomainId>>,
    ) -> Result<usize, DofMapError> {
        self.add_variables(&[name], fe_type, active_subdomains)
            .map(|g| self.groups[g].first_variable + self.groups[g].n_variables - 1)
    }

    /// Register a run of co-typed variables; returns the index of the group
    /// they joined.
    pub fn add_variables(
        &mut self,
        names: &[&str],
        fe_type: FeType,
        active_subdomains: Option<BTreeSet<SubdomainId>>,
    ) -> Result<usize, DofMapError> {
        fe_type.validate()?;
        if names.is_empty() {
            return Err(DofMapError::InvalidVariableConfiguration(
                "empty variable group".into(),
            ));
        }
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(DofMapError::InvalidVariableConfiguration(
                    "variable names must be non-empty".into(),
                ));
            }
            if self.variable_number(name).is_some() || names[..i].contains(name) {
                return Err(DofMapError::InvalidVariableConfiguration(format!(
                    "variable `{name}` registered twice"
                )));
            }
        }

        let joins_last = self
            .groups
            .last()
            .is_some_and(|g| g.fe_type == fe_type && g.active_subdomains == active_subdomains);
        if !joins_last {
            self.groups.push(VariableGroup {
                first_variable: self.variables.len(),
                n_variables: 0,
                fe_type,
                active_subdomains: active_subdomains.clone(),
            });
        }
        let g = self.groups.len() - 1;
        for name in names {
            self.variables.push(Variable {
                name: (*name).to_owned(),
                number: self.variables.len(),
                fe_type,
                active_subdomains: active_subdomains.clone(),
            });
            self.groups[g].n_variables += 1;
        }
        Ok(g)
    }

    pub fn n_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn n_variable_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn groups(&self) -> &[VariableGroup] {
        &self.groups
    }

    pub fn variable(&self, index: usize) -> Result<&Variable, DofMapError> {
        self.variables
            .get(index)
            .ok_or(DofMapError::VariableIndexOutOfRange {
                index,
                len: self.variables.len(),
            })
    }

    pub fn variable_group(&self, index: usize) -> Result<&VariableGroup, DofMapError> {
        self.groups
            .get(index)
            .ok_or(DofMapError::VariableGroupOutOfRange {
                index,
                len: self.groups.len(),
            })
    }

    pub fn variable_number(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub fn variable_type(&self, index: usize) -> Result<FeType, DofMapError> {
        self.variable(index).map(Variable::fe_type)
    }

    pub fn variable_order(&self, index: usize) -> Result<u32, DofMapError> {
        self.variable(index).map(|v| v.fe_type.order)
    }

    pub fn variable_group_order(&self, index: usize) -> Result<u32, DofMapError> {
        self.variable_group(index).map(|g| g.fe_type.order)
    }

    /// All variables live in one multi-variable group.
    pub fn has_blocked_representation(&self) -> bool {
        self.groups.len() == 1 && self.variables.len() > 1
    }

    pub fn block_size(&self) -> usize {
        if self.has_blocked_representation() {
            self.variables.len()
        } else {
            1
        }
    }

    pub fn clear(&mut self) {
        self.variables.clear();
        self.groups.clear();
    }
}
