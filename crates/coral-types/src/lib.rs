//! # coral-types: Core model types for Coral
//!
//! This crate contains shared types used across the Coral system:
//! - Entity IDs ([`SlaveId`], [`VariableId`], [`StepId`])
//! - Simulation time ([`TimePoint`], [`TimeDuration`], [`ETERNITY`])
//! - Scalar values and variable metadata ([`ScalarValue`], [`DataType`],
//!   [`Causality`], [`Variability`], [`VariableDescription`])
//! - Slave metadata ([`SlaveTypeDescription`], [`SlaveDescription`])
//! - Variable wiring ([`Variable`], [`VariableSetting`])
//! - The communication error taxonomy ([`CommError`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod error;

pub use error::CommError;

// ============================================================================
// Entity IDs - All Copy (cheap 2- or 4-byte values)
// ============================================================================

/// Unique identifier for a slave within one execution.
///
/// IDs are assigned by the master; `SlaveId(0)` is reserved and never
/// assigned to a live slave.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SlaveId(u16);

impl SlaveId {
    /// The reserved "no slave" value.
    pub const INVALID: SlaveId = SlaveId(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns true if this is a valid, assignable slave ID.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SlaveId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<SlaveId> for u16 {
    fn from(id: SlaveId) -> Self {
        id.0
    }
}

/// Identifier for a variable, unique within one slave type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct VariableId(u16);

impl VariableId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }
}

impl Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for VariableId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<VariableId> for u16 {
    fn from(id: VariableId) -> Self {
        id.0
    }
}

/// Monotonic tag on every step command and every published sample.
///
/// The first step of an execution has ID 0; each accepted step increments
/// the ID by exactly one. "No step yet" is represented as `Option<StepId>`
/// rather than a sentinel value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StepId(u32);

impl StepId {
    pub const ZERO: StepId = StepId(0);

    /// Tag used for samples published before the first time step, during
    /// the priming of freshly connected slaves.
    pub const PRE_SIMULATION: StepId = StepId(u32::MAX);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The step that follows this one.
    pub fn next(self) -> StepId {
        StepId(self.0 + 1)
    }
}

impl Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StepId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<StepId> for u32 {
    fn from(id: StepId) -> Self {
        id.0
    }
}

// ============================================================================
// Simulation time
// ============================================================================

/// A point in simulation time, in seconds.
pub type TimePoint = f64;

/// A duration in simulation time, in seconds.
pub type TimeDuration = f64;

/// The stop time of an execution that has no stop time.
pub const ETERNITY: TimePoint = f64::INFINITY;

// ============================================================================
// Scalar values and variable metadata
// ============================================================================

/// The data type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Real,
    Integer,
    Boolean,
    String,
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Real => "real",
            DataType::Integer => "integer",
            DataType::Boolean => "boolean",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// The causality of a variable, as defined by FMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Causality {
    Parameter,
    CalculatedParameter,
    Input,
    Output,
    Local,
}

impl Display for Causality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Causality::Parameter => "parameter",
            Causality::CalculatedParameter => "calculated parameter",
            Causality::Input => "input",
            Causality::Output => "output",
            Causality::Local => "local",
        };
        f.write_str(name)
    }
}

/// The variability of a variable, as defined by FMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variability {
    Constant,
    Fixed,
    Tunable,
    Discrete,
    Continuous,
}

impl Display for Variability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variability::Constant => "constant",
            Variability::Fixed => "fixed",
            Variability::Tunable => "tunable",
            Variability::Discrete => "discrete",
            Variability::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

/// The value of a variable at some point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Real(f64),
    Integer(i32),
    Boolean(bool),
    String(String),
}

impl ScalarValue {
    /// Returns the data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Real(_) => DataType::Real,
            ScalarValue::Integer(_) => DataType::Integer,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::String(_) => DataType::String,
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Real(v) => write!(f, "{v}"),
            ScalarValue::Integer(v) => write!(f, "{v}"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::String(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Real(value)
    }
}

impl From<i32> for ScalarValue {
    fn from(value: i32) -> Self {
        ScalarValue::Integer(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Boolean(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

/// Metadata for one variable of a slave type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDescription {
    /// ID, unique within the slave type.
    pub id: VariableId,
    /// Name, unique within the slave type.
    pub name: String,
    pub data_type: DataType,
    pub causality: Causality,
    pub variability: Variability,
}

// ============================================================================
// Slave metadata
// ============================================================================

/// A description of one type of slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveTypeDescription {
    /// Human-readable type name.
    pub name: String,
    /// Globally unique identifier of the type.
    pub uuid: Uuid,
    pub description: String,
    pub author: String,
    pub version: String,
    /// Variables, in the order declared by the model.
    pub variables: Vec<VariableDescription>,
}

impl SlaveTypeDescription {
    /// Looks up a variable description by ID.
    pub fn variable(&self, id: VariableId) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Looks up a variable description by name.
    pub fn variable_by_name(&self, name: &str) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Returns an iterator over the output variables of the type.
    pub fn outputs(&self) -> impl Iterator<Item = &VariableDescription> {
        self.variables
            .iter()
            .filter(|v| v.causality == Causality::Output)
    }
}

/// A description of one slave in one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveDescription {
    pub id: SlaveId,
    /// Name of the slave, unique within the execution.
    pub name: String,
    pub type_description: SlaveTypeDescription,
}

// ============================================================================
// Variable wiring
// ============================================================================

/// A qualified variable reference: one variable of one slave, globally
/// unique within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub slave: SlaveId,
    pub id: VariableId,
}

impl Variable {
    pub const fn new(slave: SlaveId, id: VariableId) -> Self {
        Self { slave, id }
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.slave, self.id)
    }
}

/// A new value and/or connection for one of a slave's variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSetting {
    /// The variable to modify.
    pub variable: VariableId,
    /// A value to assign, if any.
    pub value: Option<ScalarValue>,
    /// A remote output to connect this variable to, if any.
    pub connected_output: Option<Variable>,
}

impl VariableSetting {
    /// A setting which only assigns a value.
    pub fn value(variable: VariableId, value: impl Into<ScalarValue>) -> Self {
        Self {
            variable,
            value: Some(value.into()),
            connected_output: None,
        }
    }

    /// A setting which only connects the variable to a remote output.
    pub fn connection(variable: VariableId, output: Variable) -> Self {
        Self {
            variable,
            value: None,
            connected_output: Some(output),
        }
    }

    /// A setting which both assigns a value and makes a connection.
    pub fn value_and_connection(
        variable: VariableId,
        value: impl Into<ScalarValue>,
        output: Variable,
    ) -> Self {
        Self {
            variable,
            value: Some(value.into()),
            connected_output: Some(output),
        }
    }
}

/// Why a proposed connection between two variables is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The two variables have different data types.
    #[error("data type mismatch: expected {expected}, got {actual}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    /// The causalities of the two variables cannot be coupled.
    #[error("cannot connect a variable with causality \"{output}\" to a variable with causality \"{input}\"")]
    CausalityMismatch { input: Causality, output: Causality },
}

/// Checks whether `output` may legally be connected to `input`.
///
/// Types must match, and the causality pairing must be one of:
/// input ⇐ output, input ⇐ calculated-parameter, or
/// parameter ⇐ calculated-parameter.
pub fn validate_connection(
    input: &VariableDescription,
    output: &VariableDescription,
) -> Result<(), ConnectionError> {
    if input.data_type != output.data_type {
        return Err(ConnectionError::DataTypeMismatch {
            expected: input.data_type,
            actual: output.data_type,
        });
    }
    let compatible = match input.causality {
        Causality::Input => matches!(
            output.causality,
            Causality::Output | Causality::CalculatedParameter
        ),
        Causality::Parameter => output.causality == Causality::CalculatedParameter,
        _ => false,
    };
    if compatible {
        Ok(())
    } else {
        Err(ConnectionError::CausalityMismatch {
            input: input.causality,
            output: output.causality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn var(id: u16, data_type: DataType, causality: Causality) -> VariableDescription {
        VariableDescription {
            id: VariableId::new(id),
            name: format!("v{id}"),
            data_type,
            causality,
            variability: Variability::Continuous,
        }
    }

    #[test]
    fn slave_id_zero_is_invalid() {
        assert!(!SlaveId::INVALID.is_valid());
        assert!(SlaveId::new(1).is_valid());
    }

    #[test]
    fn step_id_next_increments_by_one() {
        assert_eq!(StepId::ZERO.next(), StepId::new(1));
        assert_eq!(StepId::new(41).next(), StepId::new(42));
    }

    #[test]
    fn scalar_value_reports_its_data_type() {
        assert_eq!(ScalarValue::Real(1.0).data_type(), DataType::Real);
        assert_eq!(ScalarValue::Integer(1).data_type(), DataType::Integer);
        assert_eq!(ScalarValue::Boolean(true).data_type(), DataType::Boolean);
        assert_eq!(
            ScalarValue::from("x").data_type(),
            DataType::String
        );
    }

    #[test]
    fn type_description_variable_lookup() {
        let td = SlaveTypeDescription {
            name: "spring".into(),
            uuid: Uuid::nil(),
            description: String::new(),
            author: String::new(),
            version: "1.0".into(),
            variables: vec![
                var(0, DataType::Real, Causality::Output),
                var(1, DataType::Real, Causality::Input),
            ],
        };
        assert_eq!(td.variable(VariableId::new(1)).unwrap().name, "v1");
        assert!(td.variable(VariableId::new(9)).is_none());
        assert_eq!(td.variable_by_name("v0").unwrap().id, VariableId::new(0));
        assert_eq!(td.outputs().count(), 1);
    }

    #[test_case(Causality::Input, Causality::Output => true; "input from output")]
    #[test_case(Causality::Input, Causality::CalculatedParameter => true; "input from calculated parameter")]
    #[test_case(Causality::Parameter, Causality::CalculatedParameter => true; "parameter from calculated parameter")]
    #[test_case(Causality::Parameter, Causality::Output => false; "parameter from output")]
    #[test_case(Causality::Input, Causality::Input => false; "input from input")]
    #[test_case(Causality::Local, Causality::Output => false; "local from output")]
    fn connection_causality_rules(input: Causality, output: Causality) -> bool {
        validate_connection(
            &var(0, DataType::Real, input),
            &var(1, DataType::Real, output),
        )
        .is_ok()
    }

    #[test]
    fn connection_rejects_type_mismatch() {
        let err = validate_connection(
            &var(0, DataType::Real, Causality::Input),
            &var(1, DataType::Integer, Causality::Output),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::DataTypeMismatch {
                expected: DataType::Real,
                actual: DataType::Integer,
            }
        );
    }
}
