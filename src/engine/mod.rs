//! Engine boundary: the opaque benchmark engine and the handle that owns it.
//!
//! The engine is an external component. The host only sees the lifecycle calls
//! (`init`/`run`/`close`), the introspection calls (`status`/`progress`/logs)
//! and the per-parameter accessors declared by [`Engine`].

pub mod sim;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("engine handle is closed or was never created")]
    InvalidHandle,

    #[error("unknown test id {test_id}")]
    UnknownTest { test_id: usize },

    #[error("test {test_id} has no parameter {index}")]
    UnknownParam { test_id: usize, index: usize },

    #[error("parameter {index} of test {test_id} does not support {op}")]
    Unsupported {
        test_id: usize,
        index: usize,
        op: &'static str,
    },

    #[error("engine fault: {0}")]
    Fault(String),
}

/// Engine-reported execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStatus::Idle => write!(f, "idle"),
            EngineStatus::Running => write!(f, "running"),
            EngineStatus::Done => write!(f, "done"),
            EngineStatus::Error => write!(f, "error"),
        }
    }
}

/// Numeric kind of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Integer,
    Float,
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Float => write!(f, "float"),
        }
    }
}

/// Value-space shape of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldType {
    Range,
    List,
}

/// How long an [`EngineHandle`] lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleLifetime {
    /// One handle, created with the orchestrator and reused for every test.
    #[default]
    Shared,
    /// The handle is closed after each run; the next access creates a new one.
    PerInvocation,
}

/// Immutable description of one test the engine offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestDescriptor {
    pub id: usize,
    pub name: String,
}

/// The benchmark engine contract.
///
/// All calls are synchronous and may block. Implementations serialize
/// internally: `status`, `progress` and the log calls are made from the
/// progress poller while `run` is blocked on another thread.
pub trait Engine: Send + Sync {
    fn test_count(&self) -> usize;
    fn test_name(&self, test_id: usize) -> Result<String, EngineError>;

    fn init(&self, test_id: usize) -> Result<(), EngineError>;
    /// Blocks until the current test completes or fails.
    fn run(&self) -> Result<(), EngineError>;
    fn status(&self) -> EngineStatus;
    /// Percentage in `0..=100`.
    fn progress(&self) -> u8;
    fn has_logs(&self) -> bool;
    /// Drains one buffered log chunk; empty when nothing is pending.
    fn read_log(&self) -> String;
    fn result(&self) -> String;
    fn close(&self);

    fn param_count(&self, test_id: usize) -> Result<usize, EngineError>;
    fn param_kind(&self, test_id: usize, index: usize) -> Result<ParamKind, EngineError>;
    fn param_hold_type(&self, test_id: usize, index: usize) -> Result<HoldType, EngineError>;
    fn param_name(&self, test_id: usize, index: usize) -> Result<String, EngineError>;
    fn param_description(&self, test_id: usize, index: usize) -> Result<String, EngineError>;
    fn reset_param(&self, test_id: usize, index: usize) -> Result<(), EngineError>;

    fn int_min(&self, test_id: usize, index: usize) -> Result<i64, EngineError>;
    fn int_max(&self, test_id: usize, index: usize) -> Result<i64, EngineError>;
    fn int_value(&self, test_id: usize, index: usize) -> Result<i64, EngineError>;
    fn int_default(&self, test_id: usize, index: usize) -> Result<i64, EngineError>;
    fn set_int_value(&self, test_id: usize, index: usize, value: i64) -> Result<(), EngineError>;

    fn float_min(&self, test_id: usize, index: usize) -> Result<f64, EngineError>;
    fn float_max(&self, test_id: usize, index: usize) -> Result<f64, EngineError>;
    fn float_value(&self, test_id: usize, index: usize) -> Result<f64, EngineError>;
    fn float_default(&self, test_id: usize, index: usize) -> Result<f64, EngineError>;
    fn set_float_value(&self, test_id: usize, index: usize, value: f64)
        -> Result<(), EngineError>;

    fn list_size(&self, test_id: usize, index: usize) -> Result<usize, EngineError>;
    fn list_current_index(&self, test_id: usize, index: usize) -> Result<usize, EngineError>;
    fn list_default_index(&self, test_id: usize, index: usize) -> Result<usize, EngineError>;
    fn list_name(&self, test_id: usize, index: usize, entry: usize)
        -> Result<String, EngineError>;
    fn set_list_current_index(
        &self,
        test_id: usize,
        index: usize,
        entry: usize,
    ) -> Result<(), EngineError>;
}

/// Creates engine instances. One call yields one handle's worth of engine.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Engine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn Engine>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Engine>, EngineError> {
        self()
    }
}

/// Exclusive owner of one live engine instance.
///
/// Every call checks the handle is still open; after [`EngineHandle::close`]
/// all calls fail with [`EngineError::InvalidHandle`].
pub struct EngineHandle {
    engine: Box<dyn Engine>,
    open: AtomicBool,
}

impl EngineHandle {
    pub fn create(factory: &dyn EngineFactory) -> Result<Self, EngineError> {
        let engine = factory.create()?;
        info!(tests = engine.test_count(), "Engine handle created");
        Ok(Self {
            engine,
            open: AtomicBool::new(true),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Borrow the engine if the handle is still open.
    pub fn engine(&self) -> Result<&dyn Engine, EngineError> {
        if self.is_open() {
            Ok(self.engine.as_ref())
        } else {
            Err(EngineError::InvalidHandle)
        }
    }

    pub fn tests(&self) -> Result<Vec<TestDescriptor>, EngineError> {
        let engine = self.engine()?;
        (0..engine.test_count())
            .map(|id| {
                Ok(TestDescriptor {
                    id,
                    name: engine.test_name(id)?,
                })
            })
            .collect()
    }

    pub fn init(&self, test_id: usize) -> Result<(), EngineError> {
        self.engine()?.init(test_id)
    }

    pub fn run(&self) -> Result<(), EngineError> {
        self.engine()?.run()
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.engine()?.status())
    }

    pub fn progress(&self) -> Result<u8, EngineError> {
        Ok(self.engine()?.progress().min(100))
    }

    pub fn has_logs(&self) -> Result<bool, EngineError> {
        Ok(self.engine()?.has_logs())
    }

    pub fn read_log(&self) -> Result<String, EngineError> {
        Ok(self.engine()?.read_log())
    }

    pub fn result(&self) -> Result<String, EngineError> {
        Ok(self.engine()?.result())
    }

    /// Invalidate the handle. The engine's own `close` runs exactly once.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.engine.close();
            debug!("Engine handle closed");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}
