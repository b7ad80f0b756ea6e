//! Built-in simulated engine.
//!
//! Declares the benchmark catalog (test names and their parameters) and walks
//! through the run lifecycle on a timer. It renders no audio; `run` only
//! advances progress, emits log chunks and produces a summary result.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use super::{Engine, EngineError, EngineStatus, HoldType, ParamKind};
use crate::lock;

const SAMPLE_RATES: [i64; 7] = [8000, 11025, 16000, 22050, 44100, 48000, 96000];
const FRAMES_PER_BURST: [i64; 12] = [8, 16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024];
const DURATIONS: [f64; 20] = [
    1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 45.0, 60.0, 90.0, 120.0, 180.0, 240.0, 300.0,
    600.0, 1200.0, 1800.0, 2400.0, 3600.0,
];
const NUM_VOICES: [i64; 29] = [
    1, 5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 90, 100, 125, 150, 175,
    200, 250, 300, 350, 400, 450, 500,
];

/// Number of progress steps a simulated run is split into.
const RUN_STEPS: u8 = 20;

/// Entries of a list-held parameter.
#[derive(Debug, Clone)]
pub enum Entries {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl Entries {
    fn len(&self) -> usize {
        match self {
            Entries::Int(v) => v.len(),
            Entries::Float(v) => v.len(),
        }
    }

    fn label(&self, entry: usize) -> String {
        match self {
            Entries::Int(v) => v.get(entry).map(ToString::to_string),
            Entries::Float(v) => v.get(entry).map(ToString::to_string),
        }
        .unwrap_or_default()
    }

    fn nearest(&self, target: f64) -> usize {
        let distance = |i: usize| match self {
            Entries::Int(v) => (v[i] as f64 - target).abs(),
            Entries::Float(v) => (v[i] - target).abs(),
        };
        (0..self.len())
            .min_by(|&a, &b| distance(a).total_cmp(&distance(b)))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
enum Holder {
    IntRange { min: i64, max: i64, default: i64, value: i64 },
    FloatRange { min: f64, max: f64, default: f64, value: f64 },
    List {
        entries: Entries,
        labels: Option<Vec<String>>,
        default: usize,
        current: usize,
    },
}

/// One declared parameter of a simulated test.
#[derive(Debug, Clone)]
pub struct ParamDef {
    name: &'static str,
    description: &'static str,
    holder: Holder,
}

impl ParamDef {
    pub fn int_range(
        name: &'static str,
        description: &'static str,
        default: i64,
        min: i64,
        max: i64,
    ) -> Self {
        Self {
            name,
            description,
            holder: Holder::IntRange { min, max, default, value: default.clamp(min, max) },
        }
    }

    pub fn float_range(
        name: &'static str,
        description: &'static str,
        default: f64,
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            name,
            description,
            holder: Holder::FloatRange { min, max, default, value: default.clamp(min, max) },
        }
    }

    /// `default` must index into `entries`.
    pub fn list(
        name: &'static str,
        description: &'static str,
        entries: Entries,
        default: usize,
    ) -> Self {
        let default = default.min(entries.len().saturating_sub(1));
        Self {
            name,
            description,
            holder: Holder::List { entries, labels: None, default, current: default },
        }
    }

    /// Display names for list entries, in entry order.
    pub fn labelled(mut self, names: Vec<String>) -> Self {
        if let Holder::List { labels, .. } = &mut self.holder {
            *labels = Some(names);
        }
        self
    }

    fn kind(&self) -> ParamKind {
        match &self.holder {
            Holder::IntRange { .. } | Holder::List { entries: Entries::Int(_), .. } => {
                ParamKind::Integer
            }
            Holder::FloatRange { .. } | Holder::List { entries: Entries::Float(_), .. } => {
                ParamKind::Float
            }
        }
    }

    fn compact(&self) -> String {
        let value = match &self.holder {
            Holder::IntRange { value, .. } => value.to_string(),
            Holder::FloatRange { value, .. } => value.to_string(),
            Holder::List { entries, current, .. } => entries.label(*current),
        };
        format!("{} : {}", self.description, value)
    }
}

/// A simulated test and its declared parameters, in index order.
#[derive(Debug, Clone)]
pub struct TestDef {
    pub name: &'static str,
    pub params: Vec<ParamDef>,
}

fn common_params() -> Vec<ParamDef> {
    let mut params = vec![
        ParamDef::list("sample_rate", "Sample Rate", Entries::Int(SAMPLE_RATES.to_vec()), 5),
        ParamDef::list(
            "frames_per_burst",
            "Frames per Burst",
            Entries::Int(FRAMES_PER_BURST.to_vec()),
            5,
        ),
        ParamDef::int_range("audio_level", "Audio Level: 1=callback, 2=audible", 1, 1, 2),
        ParamDef::int_range("note_on_delay", "Note On Delay Seconds", 0, 0, 300),
        ParamDef::list("num_seconds", "Number of Seconds", Entries::Float(DURATIONS.to_vec()), 3),
    ];

    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as i64;
    let mut cores = vec![-1];
    let mut labels = vec!["UNSPECIFIED".to_string()];
    for cpu in 0..cpus {
        cores.push(cpu);
        labels.push(cpu.to_string());
    }
    params.push(
        ParamDef::list("core_affinity", "Core Affinity", Entries::Int(cores), 0).labelled(labels),
    );
    params
}

fn changing_voice_params() -> Vec<ParamDef> {
    let mut params = common_params();
    params.push(ParamDef::list("num_voices", "Number of Voices", Entries::Int(NUM_VOICES.to_vec()), 2));
    let mut high = vec![0];
    high.extend_from_slice(&NUM_VOICES);
    params.push(ParamDef::list("num_voices_high", "Number of Voices High", Entries::Int(high), 0));
    params
}

/// The benchmark catalog, in test id order.
pub fn catalog() -> Vec<TestDef> {
    let mut voice_mark = common_params();
    let loads = (1..=20).map(|i| f64::from(i) / 20.0).collect();
    voice_mark.push(ParamDef::list("target_cpu_load", "Target CPU Load", Entries::Float(loads), 9));

    let mut utilization_mark = common_params();
    utilization_mark.push(ParamDef::list(
        "num_voices",
        "Number of Voices",
        Entries::Int(NUM_VOICES.to_vec()),
        2,
    ));

    vec![
        TestDef { name: "AutomatedSuite", params: common_params() },
        TestDef { name: "ClockRamp", params: changing_voice_params() },
        TestDef { name: "JitterMark", params: changing_voice_params() },
        TestDef { name: "LatencyMark", params: changing_voice_params() },
        TestDef { name: "UtilizationMark", params: utilization_mark },
        TestDef { name: "VoiceMark", params: voice_mark },
    ]
}

struct SimState {
    tests: Vec<TestDef>,
    current: Option<usize>,
    status: EngineStatus,
    result: String,
}

/// Stand-in engine with the full benchmark catalog.
pub struct SimulatedEngine {
    time_scale: f64,
    state: Mutex<SimState>,
    progress: AtomicU8,
    logs: Mutex<VecDeque<String>>,
}

impl SimulatedEngine {
    /// `time_scale` multiplies the declared test duration; `0.0` runs instantly.
    pub fn new(time_scale: f64) -> Self {
        Self::with_catalog(time_scale, catalog())
    }

    pub fn with_catalog(time_scale: f64, tests: Vec<TestDef>) -> Self {
        Self {
            time_scale: time_scale.max(0.0),
            state: Mutex::new(SimState {
                tests,
                current: None,
                status: EngineStatus::Idle,
                result: String::new(),
            }),
            progress: AtomicU8::new(0),
            logs: Mutex::new(VecDeque::new()),
        }
    }

    fn log(&self, chunk: String) {
        lock(&self.logs).push_back(chunk);
    }

    fn with_param<T>(
        &self,
        test_id: usize,
        index: usize,
        f: impl FnOnce(&mut ParamDef) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut state = lock(&self.state);
        let test = state
            .tests
            .get_mut(test_id)
            .ok_or(EngineError::UnknownTest { test_id })?;
        let param = test
            .params
            .get_mut(index)
            .ok_or(EngineError::UnknownParam { test_id, index })?;
        f(param)
    }

    fn int_field(
        &self,
        test_id: usize,
        index: usize,
        pick: fn(&Holder) -> Option<i64>,
    ) -> Result<i64, EngineError> {
        self.with_param(test_id, index, |p| {
            pick(&p.holder).ok_or(EngineError::Unsupported { test_id, index, op: "integer access" })
        })
    }

    fn float_field(
        &self,
        test_id: usize,
        index: usize,
        pick: fn(&Holder) -> Option<f64>,
    ) -> Result<f64, EngineError> {
        self.with_param(test_id, index, |p| {
            pick(&p.holder).ok_or(EngineError::Unsupported { test_id, index, op: "float access" })
        })
    }

    fn list_field(
        &self,
        test_id: usize,
        index: usize,
        pick: fn(&Holder) -> Option<usize>,
    ) -> Result<usize, EngineError> {
        self.with_param(test_id, index, |p| {
            pick(&p.holder).ok_or(EngineError::Unsupported { test_id, index, op: "list access" })
        })
    }
}

fn int_entries(holder: &Holder) -> Option<(&Vec<i64>, usize, usize)> {
    match holder {
        Holder::List { entries: Entries::Int(v), default, current, .. } => Some((v, *default, *current)),
        _ => None,
    }
}

fn float_entries(holder: &Holder) -> Option<(&Vec<f64>, usize, usize)> {
    match holder {
        Holder::List { entries: Entries::Float(v), default, current, .. } => Some((v, *default, *current)),
        _ => None,
    }
}

impl Engine for SimulatedEngine {
    fn test_count(&self) -> usize {
        lock(&self.state).tests.len()
    }

    fn test_name(&self, test_id: usize) -> Result<String, EngineError> {
        lock(&self.state)
            .tests
            .get(test_id)
            .map(|t| t.name.to_string())
            .ok_or(EngineError::UnknownTest { test_id })
    }

    fn init(&self, test_id: usize) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        if test_id >= state.tests.len() {
            return Err(EngineError::UnknownTest { test_id });
        }
        state.current = Some(test_id);
        state.status = EngineStatus::Idle;
        state.result.clear();
        self.progress.store(0, Ordering::Release);
        Ok(())
    }

    fn run(&self) -> Result<(), EngineError> {
        let (name, summary, seconds, step) = {
            let mut state = lock(&self.state);
            let Some(test_id) = state.current else {
                state.status = EngineStatus::Error;
                state.result = "run requested before init".to_string();
                return Err(EngineError::Fault(state.result.clone()));
            };
            let test = &state.tests[test_id];
            let seconds = test
                .params
                .iter()
                .find(|p| p.name == "num_seconds")
                .and_then(|p| float_entries(&p.holder))
                .and_then(|(v, _, current)| v.get(current).copied())
                .unwrap_or(1.0);
            let summary: Vec<String> = test
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| format!(" [{}] {}", i, p.compact()))
                .collect();
            let name = test.name;
            let step =
                match Duration::try_from_secs_f64(seconds * self.time_scale / f64::from(RUN_STEPS)) {
                    Ok(step) => step,
                    Err(e) => {
                        state.status = EngineStatus::Error;
                        state.result = format!("cannot schedule {} seconds: {}", seconds, e);
                        return Err(EngineError::Fault(state.result.clone()));
                    }
                };
            state.status = EngineStatus::Running;
            (name, summary.join("\n"), seconds, step)
        };

        debug!(test = name, seconds, "Simulated run started");
        self.log(format!(" Group : {}\n{}\n", name, summary));

        for i in 1..=RUN_STEPS {
            if !step.is_zero() {
                std::thread::sleep(step);
            }
            let pct = i * (100 / RUN_STEPS);
            self.progress.store(pct, Ordering::Release);
            if pct % 25 == 0 {
                self.log(format!("{} progress {}%\n", name, pct));
            }
        }

        let mut state = lock(&self.state);
        state.result = format!("{} completed in {} simulated seconds\n{}", name, seconds, summary);
        state.status = EngineStatus::Done;
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        lock(&self.state).status
    }

    fn progress(&self) -> u8 {
        self.progress.load(Ordering::Acquire)
    }

    fn has_logs(&self) -> bool {
        !lock(&self.logs).is_empty()
    }

    fn read_log(&self) -> String {
        lock(&self.logs).pop_front().unwrap_or_default()
    }

    fn result(&self) -> String {
        lock(&self.state).result.clone()
    }

    fn close(&self) {
        lock(&self.logs).clear();
        let mut state = lock(&self.state);
        state.current = None;
        state.status = EngineStatus::Idle;
    }

    fn param_count(&self, test_id: usize) -> Result<usize, EngineError> {
        lock(&self.state)
            .tests
            .get(test_id)
            .map(|t| t.params.len())
            .ok_or(EngineError::UnknownTest { test_id })
    }

    fn param_kind(&self, test_id: usize, index: usize) -> Result<ParamKind, EngineError> {
        self.with_param(test_id, index, |p| Ok(p.kind()))
    }

    fn param_hold_type(&self, test_id: usize, index: usize) -> Result<HoldType, EngineError> {
        self.with_param(test_id, index, |p| {
            Ok(match p.holder {
                Holder::List { .. } => HoldType::List,
                _ => HoldType::Range,
            })
        })
    }

    fn param_name(&self, test_id: usize, index: usize) -> Result<String, EngineError> {
        self.with_param(test_id, index, |p| Ok(p.name.to_string()))
    }

    fn param_description(&self, test_id: usize, index: usize) -> Result<String, EngineError> {
        self.with_param(test_id, index, |p| Ok(p.description.to_string()))
    }

    fn reset_param(&self, test_id: usize, index: usize) -> Result<(), EngineError> {
        self.with_param(test_id, index, |p| {
            match &mut p.holder {
                Holder::IntRange { default, value, .. } => *value = *default,
                Holder::FloatRange { default, value, .. } => *value = *default,
                Holder::List { default, current, .. } => *current = *default,
            }
            Ok(())
        })
    }

    fn int_min(&self, test_id: usize, index: usize) -> Result<i64, EngineError> {
        self.int_field(test_id, index, |h| match h {
            Holder::IntRange { min, .. } => Some(*min),
            _ => int_entries(h).and_then(|(v, _, _)| v.iter().copied().min()),
        })
    }

    fn int_max(&self, test_id: usize, index: usize) -> Result<i64, EngineError> {
        self.int_field(test_id, index, |h| match h {
            Holder::IntRange { max, .. } => Some(*max),
            _ => int_entries(h).and_then(|(v, _, _)| v.iter().copied().max()),
        })
    }

    fn int_value(&self, test_id: usize, index: usize) -> Result<i64, EngineError> {
        self.int_field(test_id, index, |h| match h {
            Holder::IntRange { value, .. } => Some(*value),
            _ => int_entries(h).and_then(|(v, _, current)| v.get(current).copied()),
        })
    }

    fn int_default(&self, test_id: usize, index: usize) -> Result<i64, EngineError> {
        self.int_field(test_id, index, |h| match h {
            Holder::IntRange { default, .. } => Some(*default),
            _ => int_entries(h).and_then(|(v, default, _)| v.get(default).copied()),
        })
    }

    fn set_int_value(&self, test_id: usize, index: usize, value: i64) -> Result<(), EngineError> {
        self.with_param(test_id, index, |p| match &mut p.holder {
            Holder::IntRange { min, max, value: current, .. } => {
                *current = value.clamp(*min, *max);
                Ok(())
            }
            Holder::List { entries: entries @ Entries::Int(_), current, .. } => {
                *current = entries.nearest(value as f64);
                Ok(())
            }
            _ => Err(EngineError::Unsupported { test_id, index, op: "integer write" }),
        })
    }

    fn float_min(&self, test_id: usize, index: usize) -> Result<f64, EngineError> {
        self.float_field(test_id, index, |h| match h {
            Holder::FloatRange { min, .. } => Some(*min),
            _ => float_entries(h).and_then(|(v, _, _)| v.iter().copied().reduce(f64::min)),
        })
    }

    fn float_max(&self, test_id: usize, index: usize) -> Result<f64, EngineError> {
        self.float_field(test_id, index, |h| match h {
            Holder::FloatRange { max, .. } => Some(*max),
            _ => float_entries(h).and_then(|(v, _, _)| v.iter().copied().reduce(f64::max)),
        })
    }

    fn float_value(&self, test_id: usize, index: usize) -> Result<f64, EngineError> {
        self.float_field(test_id, index, |h| match h {
            Holder::FloatRange { value, .. } => Some(*value),
            _ => float_entries(h).and_then(|(v, _, current)| v.get(current).copied()),
        })
    }

    fn float_default(&self, test_id: usize, index: usize) -> Result<f64, EngineError> {
        self.float_field(test_id, index, |h| match h {
            Holder::FloatRange { default, .. } => Some(*default),
            _ => float_entries(h).and_then(|(v, default, _)| v.get(default).copied()),
        })
    }

    fn set_float_value(&self, test_id: usize, index: usize, value: f64) -> Result<(), EngineError> {
        self.with_param(test_id, index, |p| match &mut p.holder {
            Holder::FloatRange { min, max, value: current, .. } => {
                *current = value.clamp(*min, *max);
                Ok(())
            }
            Holder::List { entries: entries @ Entries::Float(_), current, .. } => {
                *current = entries.nearest(value);
                Ok(())
            }
            _ => Err(EngineError::Unsupported { test_id, index, op: "float write" }),
        })
    }

    fn list_size(&self, test_id: usize, index: usize) -> Result<usize, EngineError> {
        self.list_field(test_id, index, |h| match h {
            Holder::List { entries, .. } => Some(entries.len()),
            _ => None,
        })
    }

    fn list_current_index(&self, test_id: usize, index: usize) -> Result<usize, EngineError> {
        self.list_field(test_id, index, |h| match h {
            Holder::List { current, .. } => Some(*current),
            _ => None,
        })
    }

    fn list_default_index(&self, test_id: usize, index: usize) -> Result<usize, EngineError> {
        self.list_field(test_id, index, |h| match h {
            Holder::List { default, .. } => Some(*default),
            _ => None,
        })
    }

    fn list_name(&self, test_id: usize, index: usize, entry: usize) -> Result<String, EngineError> {
        self.with_param(test_id, index, |p| match &p.holder {
            Holder::List { entries, labels, .. } if entry < entries.len() => Ok(labels
                .as_ref()
                .and_then(|l| l.get(entry).cloned())
                .unwrap_or_else(|| entries.label(entry))),
            Holder::List { .. } => Err(EngineError::Fault(format!("list entry {} out of range", entry))),
            _ => Err(EngineError::Unsupported { test_id, index, op: "list access" }),
        })
    }

    fn set_list_current_index(&self, test_id: usize, index: usize, entry: usize) -> Result<(), EngineError> {
        self.with_param(test_id, index, |p| match &mut p.holder {
            Holder::List { entries, current, .. } if entry < entries.len() => {
                *current = entry;
                Ok(())
            }
            Holder::List { .. } => Err(EngineError::Fault(format!("list entry {} out of range", entry))),
            _ => Err(EngineError::Unsupported { test_id, index, op: "list write" }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(engine: &SimulatedEngine, test_id: usize, name: &str) -> usize {
        let count = engine.param_count(test_id).unwrap();
        (0..count)
            .find(|&i| engine.param_name(test_id, i).unwrap() == name)
            .unwrap()
    }

    #[test]
    fn test_catalog_order() {
        let engine = SimulatedEngine::new(0.0);
        let names: Vec<String> = (0..engine.test_count())
            .map(|i| engine.test_name(i).unwrap())
            .collect();
        assert_eq!(
            names,
            ["AutomatedSuite", "ClockRamp", "JitterMark", "LatencyMark", "UtilizationMark", "VoiceMark"]
        );
        assert_eq!(engine.test_name(6), Err(EngineError::UnknownTest { test_id: 6 }));
    }

    #[test]
    fn test_list_defaults() {
        let engine = SimulatedEngine::new(0.0);
        let rate = index_of(&engine, 0, "sample_rate");
        assert_eq!(engine.param_hold_type(0, rate).unwrap(), HoldType::List);
        assert_eq!(engine.int_value(0, rate).unwrap(), 48000);
        assert_eq!(engine.list_default_index(0, rate).unwrap(), 5);

        let load = index_of(&engine, 5, "target_cpu_load");
        assert_eq!(engine.param_kind(5, load).unwrap(), ParamKind::Float);
        assert!((engine.float_value(5, load).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_range_setter_clamps() {
        let engine = SimulatedEngine::new(0.0);
        let level = index_of(&engine, 0, "audio_level");
        engine.set_int_value(0, level, 9).unwrap();
        assert_eq!(engine.int_value(0, level).unwrap(), 2);
        engine.reset_param(0, level).unwrap();
        assert_eq!(engine.int_value(0, level).unwrap(), 1);
    }

    #[test]
    fn test_list_setter_picks_nearest_entry() {
        let engine = SimulatedEngine::new(0.0);
        let rate = index_of(&engine, 0, "sample_rate");
        engine.set_int_value(0, rate, 44000).unwrap();
        assert_eq!(engine.int_value(0, rate).unwrap(), 44100);
        assert_eq!(engine.list_current_index(0, rate).unwrap(), 4);
    }

    #[test]
    fn test_kind_mismatch_is_unsupported() {
        let engine = SimulatedEngine::new(0.0);
        let secs = index_of(&engine, 0, "num_seconds");
        assert!(matches!(
            engine.int_value(0, secs),
            Err(EngineError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_core_affinity_labels() {
        let engine = SimulatedEngine::new(0.0);
        let affinity = index_of(&engine, 0, "core_affinity");
        assert_eq!(engine.list_name(0, affinity, 0).unwrap(), "UNSPECIFIED");
        assert_eq!(engine.list_name(0, affinity, 1).unwrap(), "0");
    }

    #[test]
    fn test_unschedulable_duration_is_a_fault() {
        let engine = SimulatedEngine::new(1e30);
        engine.init(0).unwrap();
        assert!(matches!(engine.run(), Err(EngineError::Fault(_))));
        assert_eq!(engine.status(), EngineStatus::Error);
        assert!(engine.result().starts_with("cannot schedule"));

        let engine = SimulatedEngine::new(f64::INFINITY);
        engine.init(0).unwrap();
        assert!(engine.run().is_err());
    }

    #[test]
    fn test_instant_run_lifecycle() {
        let engine = SimulatedEngine::new(0.0);
        assert!(engine.run().is_err());
        assert_eq!(engine.status(), EngineStatus::Error);

        engine.init(5).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.status(), EngineStatus::Done);
        assert_eq!(engine.progress(), 100);
        assert!(engine.result().starts_with("VoiceMark completed"));

        let mut chunks = Vec::new();
        while engine.has_logs() {
            chunks.push(engine.read_log());
        }
        assert!(chunks[0].contains("Group : VoiceMark"));
        assert!(chunks.iter().any(|c| c.contains("progress 100%")));
        assert_eq!(engine.read_log(), "");
    }
}
