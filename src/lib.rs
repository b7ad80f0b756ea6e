//! benchhost -- host-side harness for an external benchmark engine.
//!
//! This crate drives an opaque engine through its run lifecycle, reports
//! progress incrementally over an in-process notification bus, and exposes
//! the engine's tunable parameters through a uniform typed model.

pub mod config;
pub mod engine;
pub mod notify;
pub mod orchestrator;
pub mod params;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

pub use engine::{Engine, EngineError, EngineFactory, EngineHandle, EngineStatus, HandleLifetime};
pub use notify::{NotificationBus, NotificationEvent};
pub use orchestrator::{Orchestrator, StartOutcome};
pub use params::{ParamError, ParamView, ParameterModel, Value};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build an orchestrator over the built-in simulated engine.
pub fn simulated_orchestrator(config: &config::HarnessConfig) -> Result<Arc<Orchestrator>> {
    let time_scale = config.engine.time_scale;
    let factory = move || -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(engine::sim::SimulatedEngine::new(time_scale)))
    };
    tracing::info!(
        lifetime = ?config.orchestrator.handle_lifetime,
        time_scale,
        "Initializing orchestrator with simulated engine"
    );
    let orchestrator = Orchestrator::new(
        Arc::new(factory),
        config.orchestrator.settings(),
        Arc::new(NotificationBus::new()),
    )?;
    Ok(Arc::new(orchestrator))
}
