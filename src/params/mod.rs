//! Parameter model: one typed interface over every engine parameter of a test.
//!
//! Views are transient. They cache only the description, numeric kind and hold
//! type; every value read or write goes straight to the engine.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::{EngineError, EngineHandle, HoldType, ParamKind};

/// Appended to a formatted value when it equals the engine default.
pub const DEFAULT_MARKER: &str = "*";

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("parameter {index} of test {test_id} is {expected}, got a {found} value")]
    TypeMismatch {
        test_id: usize,
        index: usize,
        expected: ParamKind,
        found: ParamKind,
    },

    #[error("list index {list_index} out of range for parameter {index} of test {test_id} (size {size})")]
    InvalidIndex {
        test_id: usize,
        index: usize,
        list_index: usize,
        size: usize,
    },

    #[error("parameter {index} of test {test_id} is not list-held")]
    NotAList { test_id: usize, index: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A parameter value tagged with its numeric kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn kind(&self) -> ParamKind {
        match self {
            Value::Int(_) => ParamKind::Integer,
            Value::Float(_) => ParamKind::Float,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Parses `"12"` as `Int` and anything with a fraction or exponent as `Float`.
impl FromStr for Value {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(v) = s.parse::<i64>() {
            return Ok(Value::Int(v));
        }
        s.parse::<f64>().map(Value::Float)
    }
}

/// Serializable snapshot of one parameter, as shown to a user.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSnapshot {
    pub index: usize,
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub hold: HoldType,
    pub value: Value,
    pub formatted: String,
}

/// View over one (handle, test, parameter) triple.
#[derive(Clone)]
pub struct ParamView {
    handle: Arc<EngineHandle>,
    test_id: usize,
    index: usize,
    kind: ParamKind,
    hold: HoldType,
    description: String,
}

impl std::fmt::Debug for ParamView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamView")
            .field("test_id", &self.test_id)
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("hold", &self.hold)
            .field("description", &self.description)
            .finish()
    }
}

impl ParamView {
    pub fn new(handle: Arc<EngineHandle>, test_id: usize, index: usize) -> Result<Self, ParamError> {
        let engine = handle.engine()?;
        let description = engine.param_description(test_id, index)?;
        let kind = engine.param_kind(test_id, index)?;
        let hold = engine.param_hold_type(test_id, index)?;
        Ok(Self {
            handle,
            test_id,
            index,
            kind,
            hold,
            description,
        })
    }

    pub fn test_id(&self) -> usize {
        self.test_id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn hold_type(&self) -> HoldType {
        self.hold
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn name(&self) -> Result<String, ParamError> {
        Ok(self.handle.engine()?.param_name(self.test_id, self.index)?)
    }

    pub fn min(&self) -> Result<Value, ParamError> {
        let engine = self.handle.engine()?;
        Ok(match self.kind {
            ParamKind::Integer => Value::Int(engine.int_min(self.test_id, self.index)?),
            ParamKind::Float => Value::Float(engine.float_min(self.test_id, self.index)?),
        })
    }

    pub fn max(&self) -> Result<Value, ParamError> {
        let engine = self.handle.engine()?;
        Ok(match self.kind {
            ParamKind::Integer => Value::Int(engine.int_max(self.test_id, self.index)?),
            ParamKind::Float => Value::Float(engine.float_max(self.test_id, self.index)?),
        })
    }

    /// Current engine-reported value.
    pub fn value(&self) -> Result<Value, ParamError> {
        let engine = self.handle.engine()?;
        Ok(match self.kind {
            ParamKind::Integer => Value::Int(engine.int_value(self.test_id, self.index)?),
            ParamKind::Float => Value::Float(engine.float_value(self.test_id, self.index)?),
        })
    }

    pub fn default_value(&self) -> Result<Value, ParamError> {
        let engine = self.handle.engine()?;
        Ok(match self.kind {
            ParamKind::Integer => Value::Int(engine.int_default(self.test_id, self.index)?),
            ParamKind::Float => Value::Float(engine.float_default(self.test_id, self.index)?),
        })
    }

    /// Write through to the engine. Clamping and rounding are the engine's business.
    pub fn set_value(&self, value: Value) -> Result<(), ParamError> {
        let engine = self.handle.engine()?;
        match (self.kind, value) {
            (ParamKind::Integer, Value::Int(v)) => engine.set_int_value(self.test_id, self.index, v)?,
            (ParamKind::Float, Value::Float(v)) => {
                engine.set_float_value(self.test_id, self.index, v)?
            }
            (expected, value) => {
                return Err(ParamError::TypeMismatch {
                    test_id: self.test_id,
                    index: self.index,
                    expected,
                    found: value.kind(),
                })
            }
        }
        debug!(test_id = self.test_id, index = self.index, %value, "Parameter set");
        Ok(())
    }

    fn require_list(&self) -> Result<(), ParamError> {
        match self.hold {
            HoldType::List => Ok(()),
            HoldType::Range => Err(ParamError::NotAList {
                test_id: self.test_id,
                index: self.index,
            }),
        }
    }

    pub fn list_size(&self) -> Result<usize, ParamError> {
        self.require_list()?;
        Ok(self.handle.engine()?.list_size(self.test_id, self.index)?)
    }

    pub fn list_current_index(&self) -> Result<usize, ParamError> {
        self.require_list()?;
        Ok(self.handle.engine()?.list_current_index(self.test_id, self.index)?)
    }

    pub fn list_default_index(&self) -> Result<usize, ParamError> {
        self.require_list()?;
        Ok(self.handle.engine()?.list_default_index(self.test_id, self.index)?)
    }

    pub fn list_entry_name(&self, list_index: usize) -> Result<String, ParamError> {
        self.require_list()?;
        Ok(self
            .handle
            .engine()?
            .list_name(self.test_id, self.index, list_index)?)
    }

    pub fn set_list_index(&self, list_index: usize) -> Result<(), ParamError> {
        let size = self.list_size()?;
        if list_index >= size {
            return Err(ParamError::InvalidIndex {
                test_id: self.test_id,
                index: self.index,
                list_index,
                size,
            });
        }
        self.handle
            .engine()?
            .set_list_current_index(self.test_id, self.index, list_index)?;
        debug!(test_id = self.test_id, index = self.index, list_index, "List parameter set");
        Ok(())
    }

    /// Restore the engine-declared default.
    pub fn reset(&self) -> Result<(), ParamError> {
        Ok(self.handle.engine()?.reset_param(self.test_id, self.index)?)
    }

    /// The user-visible rendering: `%d` or three-decimal fixed point for
    /// ranges, the entry name for lists, plus [`DEFAULT_MARKER`] at the default.
    pub fn format_value(&self) -> Result<String, ParamError> {
        let marker = |at_default: bool| if at_default { DEFAULT_MARKER } else { "" };
        match self.hold {
            HoldType::Range => {
                let engine = self.handle.engine()?;
                Ok(match self.kind {
                    ParamKind::Integer => {
                        let value = engine.int_value(self.test_id, self.index)?;
                        let default = engine.int_default(self.test_id, self.index)?;
                        format!("{}{}", value, marker(value == default))
                    }
                    ParamKind::Float => {
                        let value = engine.float_value(self.test_id, self.index)?;
                        let default = engine.float_default(self.test_id, self.index)?;
                        format!("{:.3}{}", value, marker(value == default))
                    }
                })
            }
            HoldType::List => {
                let current = self.list_current_index()?;
                let default = self.list_default_index()?;
                let name = self.list_entry_name(current)?;
                Ok(format!("{}{}", name, marker(current == default)))
            }
        }
    }

    pub fn snapshot(&self) -> Result<ParamSnapshot, ParamError> {
        Ok(ParamSnapshot {
            index: self.index,
            name: self.name()?,
            description: self.description.clone(),
            kind: self.kind,
            hold: self.hold,
            value: self.value()?,
            formatted: self.format_value()?,
        })
    }
}

/// Outcome of [`ParameterModel::reset_all`].
#[derive(Debug, Default)]
pub struct ResetSummary {
    pub reset: usize,
    pub failed: Vec<(usize, ParamError)>,
}

impl ResetSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Typed accessor over the parameters of one engine handle.
#[derive(Clone)]
pub struct ParameterModel {
    handle: Arc<EngineHandle>,
}

impl ParameterModel {
    pub fn new(handle: Arc<EngineHandle>) -> Self {
        Self { handle }
    }

    pub fn param_count(&self, test_id: usize) -> Result<usize, ParamError> {
        Ok(self.handle.engine()?.param_count(test_id)?)
    }

    pub fn view(&self, test_id: usize, index: usize) -> Result<ParamView, ParamError> {
        ParamView::new(Arc::clone(&self.handle), test_id, index)
    }

    /// All parameters of a test, in engine-declared index order.
    pub fn describe(&self, test_id: usize) -> Result<Vec<ParamView>, ParamError> {
        (0..self.param_count(test_id)?)
            .map(|index| self.view(test_id, index))
            .collect()
    }

    pub fn get(&self, test_id: usize, index: usize) -> Result<Value, ParamError> {
        self.view(test_id, index)?.value()
    }

    pub fn set(&self, test_id: usize, index: usize, value: Value) -> Result<(), ParamError> {
        self.view(test_id, index)?.set_value(value)
    }

    pub fn set_list_index(
        &self,
        test_id: usize,
        index: usize,
        list_index: usize,
    ) -> Result<(), ParamError> {
        self.view(test_id, index)?.set_list_index(list_index)
    }

    pub fn reset(&self, test_id: usize, index: usize) -> Result<(), ParamError> {
        self.view(test_id, index)?.reset()
    }

    pub fn format_value(&self, test_id: usize, index: usize) -> Result<String, ParamError> {
        self.view(test_id, index)?.format_value()
    }

    /// Reset every parameter of a test in index order. A failure on one index
    /// is recorded and the remaining indices are still reset.
    pub fn reset_all(&self, test_id: usize) -> Result<ResetSummary, ParamError> {
        let count = self.param_count(test_id)?;
        let mut summary = ResetSummary::default();
        for index in 0..count {
            match self.handle.engine()?.reset_param(test_id, index) {
                Ok(()) => summary.reset += 1,
                Err(e) => {
                    warn!(test_id, index, error = %e, "Failed to reset parameter");
                    summary.failed.push((index, e.into()));
                }
            }
        }
        debug!(test_id, reset = summary.reset, failed = summary.failed.len(), "Parameters reset");
        Ok(summary)
    }
}
