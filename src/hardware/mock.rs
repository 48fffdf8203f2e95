//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockChamber` - Simulated 3-axis positioner, optionally with realistic timing
//! - `MockAnalyzer` - Simulated network analyzer with scripted fault injection
//!
//! Both record every call they receive so tests can assert on the exact protocol
//! the run engine followed. Faults queued with `fail_next_*` are raised by the next
//! matching call, one fault per call.

use async_trait::async_trait;
use num_complex::Complex64;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};
use crate::experiment::acquisition::{SParameter, TracePoint};
use crate::experiment::mesh::{linspace, Point3D};
use crate::hardware::capabilities::{Axis, MeasurementSetup, MotionController, NetworkAnalyzer};
use crate::timing::ManualClock;

/// VISA status returned when a measurement name is unknown.
const VI_ERROR_INV_OBJECT: i32 = -1_073_807_346;

const SPEED_OF_LIGHT_MM_PER_S: f64 = 299_792_458_000.0;

// =============================================================================
// MockChamber - Simulated Positioner
// =============================================================================

/// Motion request received by [`MockChamber`].
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCall {
    /// Absolute move to a coordinate.
    Absolute(Point3D),
    /// Relative move by a delta.
    Relative(Point3D),
    /// Homing cycle.
    Home(Vec<Axis>),
}

/// Mock 3-axis positioner.
///
/// Moves complete instantly unless a speed is configured, in which case the move
/// sleeps for the straight-line travel time.
///
/// # Example
///
/// ```rust,ignore
/// let chamber = MockChamber::new();
/// chamber.move_absolute(Point3D::new(10.0, 0.0, 0.0), 1000.0).await?;
/// assert_eq!(chamber.position().await, Point3D::new(10.0, 0.0, 0.0));
/// ```
pub struct MockChamber {
    position: Arc<RwLock<Point3D>>,
    speed_mm_per_sec: Option<f64>,
    calls: Arc<Mutex<Vec<MotionCall>>>,
    faults: Arc<Mutex<VecDeque<DeviceError>>>,
    manual_clock: Option<(ManualClock, Duration)>,
}

impl MockChamber {
    /// Create new mock positioner at the origin with instant moves.
    pub fn new() -> Self {
        Self {
            position: Arc::new(RwLock::new(Point3D::default())),
            speed_mm_per_sec: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(VecDeque::new())),
            manual_clock: None,
        }
    }

    /// Simulate travel time at a fixed speed.
    pub fn with_speed(mut self, speed_mm_per_sec: f64) -> Self {
        self.speed_mm_per_sec = Some(speed_mm_per_sec);
        self
    }

    /// Advance `clock` by `per_move` on every completed move.
    pub fn with_manual_clock(mut self, clock: ManualClock, per_move: Duration) -> Self {
        self.manual_clock = Some((clock, per_move));
        self
    }

    /// Make the next motion call fail with `error`.
    pub async fn fail_next_move(&self, error: DeviceError) {
        self.faults.lock().await.push_back(error);
    }

    /// Current position.
    pub async fn position(&self) -> Point3D {
        *self.position.read().await
    }

    /// Completed motion calls in order.
    pub async fn calls(&self) -> Vec<MotionCall> {
        self.calls.lock().await.clone()
    }

    async fn travel(&self, target: Point3D) -> DeviceResult<()> {
        if let Some(fault) = self.faults.lock().await.pop_front() {
            return Err(fault);
        }

        let current = *self.position.read().await;
        if let Some(speed) = self.speed_mm_per_sec {
            let dx = target.x - current.x;
            let dy = target.y - current.y;
            let dz = target.z - current.z;
            let distance = (dx * dx + dy * dy + dz * dz).sqrt();
            let delay = Duration::from_secs_f64(distance / speed);
            debug!("MockChamber: Moving {} -> {} ({:?})", current, target, delay);
            sleep(delay).await;
        }
        if let Some((clock, per_move)) = &self.manual_clock {
            clock.advance(*per_move);
        }

        *self.position.write().await = target;
        Ok(())
    }
}

impl Default for MockChamber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotionController for MockChamber {
    async fn move_absolute(&self, target: Point3D, _speed: f64) -> DeviceResult<()> {
        self.travel(target).await?;
        self.calls.lock().await.push(MotionCall::Absolute(target));
        Ok(())
    }

    async fn move_relative(&self, delta: Point3D, _speed: f64) -> DeviceResult<()> {
        let current = self.position().await;
        let target = Point3D::new(current.x + delta.x, current.y + delta.y, current.z + delta.z);
        self.travel(target).await?;
        self.calls.lock().await.push(MotionCall::Relative(delta));
        Ok(())
    }

    async fn home_axes(&self, axes: &[Axis]) -> DeviceResult<()> {
        let mut target = self.position().await;
        for axis in axes {
            match axis {
                Axis::X => target.x = 0.0,
                Axis::Y => target.y = 0.0,
                Axis::Z => target.z = 0.0,
            }
        }
        self.travel(target).await?;
        self.calls.lock().await.push(MotionCall::Home(axes.to_vec()));
        Ok(())
    }
}

// =============================================================================
// MockAnalyzer - Simulated Network Analyzer
// =============================================================================

/// Request received by [`MockAnalyzer`], recorded whether or not it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerCall {
    /// `preset_and_clear`.
    PresetAndClear,
    /// `add_measurement`.
    AddMeasurement(MeasurementSetup),
    /// `trigger_measurement`.
    Trigger(String),
    /// `read_trace`.
    ReadTrace(String, SParameter),
    /// `reset_interface_in_charge`.
    ResetInterface(String),
}

type TriggerHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Mock vector network analyzer.
///
/// Traces are synthesized per measurement. When linked to a [`MockChamber`] the
/// synthetic response depends on the antenna distance from the chamber origin,
/// otherwise on the trigger count.
pub struct MockAnalyzer {
    measurements: Arc<RwLock<HashMap<String, MeasurementSetup>>>,
    calls: Arc<Mutex<Vec<AnalyzerCall>>>,
    trigger_faults: Arc<Mutex<VecDeque<DeviceError>>>,
    read_faults: Arc<Mutex<VecDeque<DeviceError>>>,
    triggers: AtomicUsize,
    stage: Option<Arc<MockChamber>>,
    trigger_hook: Option<TriggerHook>,
    sweep_time: Option<Duration>,
    manual_clock: Option<(ManualClock, Duration)>,
}

impl MockAnalyzer {
    /// Create an analyzer with no measurements defined.
    pub fn new() -> Self {
        Self {
            measurements: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            trigger_faults: Arc::new(Mutex::new(VecDeque::new())),
            read_faults: Arc::new(Mutex::new(VecDeque::new())),
            triggers: AtomicUsize::new(0),
            stage: None,
            trigger_hook: None,
            sweep_time: None,
            manual_clock: None,
        }
    }

    /// Derive responses from the position of `stage`.
    pub fn with_stage(mut self, stage: Arc<MockChamber>) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Call `hook` with the running trigger count after every successful trigger.
    pub fn with_trigger_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.trigger_hook = Some(Arc::new(hook));
        self
    }

    /// Sleep for `duration` on every trigger.
    pub fn with_sweep_time(mut self, duration: Duration) -> Self {
        self.sweep_time = Some(duration);
        self
    }

    /// Advance `clock` by `per_trigger` on every successful trigger.
    pub fn with_manual_clock(mut self, clock: ManualClock, per_trigger: Duration) -> Self {
        self.manual_clock = Some((clock, per_trigger));
        self
    }

    /// Make the next trigger fail with `error`.
    pub async fn fail_next_trigger(&self, error: DeviceError) {
        self.trigger_faults.lock().await.push_back(error);
    }

    /// Make the next trace read fail with `error`.
    pub async fn fail_next_read(&self, error: DeviceError) {
        self.read_faults.lock().await.push_back(error);
    }

    /// All calls received, in order.
    pub async fn calls(&self) -> Vec<AnalyzerCall> {
        self.calls.lock().await.clone()
    }

    /// Currently defined measurements by name.
    pub async fn measurements(&self) -> HashMap<String, MeasurementSetup> {
        self.measurements.read().await.clone()
    }

    /// Number of successful triggers.
    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    async fn record(&self, call: AnalyzerCall) {
        self.calls.lock().await.push(call);
    }

    async fn synthesize(&self, setup: &MeasurementSetup) -> Vec<TracePoint> {
        let distance = match &self.stage {
            Some(stage) => {
                let p = stage.position().await;
                (p.x * p.x + p.y * p.y + p.z * p.z).sqrt()
            }
            None => self.trigger_count() as f64,
        };
        let (gain, offset): (f64, f64) = match setup.parameter {
            SParameter::S11 => (0.1, 0.0),
            SParameter::S12 => (1.0, 90.0),
            SParameter::S22 => (0.2, 180.0),
        };
        linspace(setup.freq_start_hz, setup.freq_stop_hz, setup.points)
            .into_iter()
            .map(|f| {
                let amplitude = gain / (1.0 + distance / 100.0);
                let phase = -2.0 * PI * f * distance / SPEED_OF_LIGHT_MM_PER_S + offset.to_radians();
                let value = Complex64::from_polar(amplitude, phase);
                TracePoint::new(f, value.re, value.im)
            })
            .collect()
    }

    async fn measurement(&self, name: &str) -> DeviceResult<MeasurementSetup> {
        self.measurements
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                DeviceError::instrument(
                    VI_ERROR_INV_OBJECT,
                    format!("measurement '{name}' is not defined"),
                )
            })
    }
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAnalyzer for MockAnalyzer {
    async fn preset_and_clear(&self) -> DeviceResult<()> {
        self.record(AnalyzerCall::PresetAndClear).await;
        self.measurements.write().await.clear();
        Ok(())
    }

    async fn add_measurement(&self, setup: &MeasurementSetup) -> DeviceResult<()> {
        self.record(AnalyzerCall::AddMeasurement(setup.clone())).await;
        self.measurements
            .write()
            .await
            .insert(setup.name.clone(), setup.clone());
        Ok(())
    }

    async fn trigger_measurement(&self, name: &str) -> DeviceResult<()> {
        self.record(AnalyzerCall::Trigger(name.to_string())).await;
        if let Some(fault) = self.trigger_faults.lock().await.pop_front() {
            return Err(fault);
        }
        self.measurement(name).await?;

        if let Some(duration) = self.sweep_time {
            sleep(duration).await;
        }
        if let Some((clock, per_trigger)) = &self.manual_clock {
            clock.advance(*per_trigger);
        }

        let count = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.trigger_hook {
            hook(count);
        }
        Ok(())
    }

    async fn read_trace(&self, name: &str, parameter: SParameter) -> DeviceResult<Vec<TracePoint>> {
        self.record(AnalyzerCall::ReadTrace(name.to_string(), parameter))
            .await;
        if let Some(fault) = self.read_faults.lock().await.pop_front() {
            return Err(fault);
        }
        let setup = self.measurement(name).await?;
        Ok(self.synthesize(&setup).await)
    }

    async fn reset_interface_in_charge(&self, resource: &str) -> DeviceResult<()> {
        debug!("MockAnalyzer: interface reset on {}", resource);
        self.record(AnalyzerCall::ResetInterface(resource.to_string()))
            .await;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
