//! Scan run engine.
//!
//! [`ScanOrchestrator`] drives the positioner and the analyzer through every point
//! of a mesh, one point at a time:
//!
//! ```text
//! Idle ──start()──▶ Running ───────────────────────────────▶ Completed
//!                     │  per point:                      ├─▶ Interrupted (stop requested)
//!                     │  Moving → Triggering → Reading   └─▶ Fatal (result not written)
//!                     │         → Recording
//! ```
//!
//! A point only counts once every requested parameter has been read. Faults during
//! the move or the acquisition are classified and retried on the same point as
//! decided by [`RetryTracker`]; generic faults are also written to the
//! [`FaultJournal`]. The stop flag is polled before each point and between retry
//! attempts, never in the middle of one. Whatever has been recorded when the loop
//! ends is written to disk.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::acquisition::{AcquisitionTask, SampleRecord};
use super::events::{Completion, PositionUpdate, ScanEvent};
use super::mesh::{generate, MeshConfig, MeshPoint, Point3D};
use super::progress::ProgressTracker;
use crate::config::{ChamberEnvelope, Settings};
use crate::data::fault_journal::FaultJournal;
use crate::data::storage::{ResultAssembler, ScanHeader, ScanResult};
use crate::error::{AppResult, DeviceError, DeviceResult, ScanError};
use crate::error_recovery::{RetryPolicy, RetryState, RetryTracker};
use crate::hardware::capabilities::{apply_acquisition_task, Axis, MotionController, NetworkAnalyzer};
use crate::metadata::{RunMetadata, RunMetadataBuilder};
use crate::timing::{format_duration, Clock, SystemClock};

const EVENT_CAPACITY: usize = 1024;

/// Step of the per-point cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointPhase {
    /// Positioner moving to the point.
    Moving,
    /// Analyzer sweeping.
    Triggering,
    /// Trace being read back.
    Reading,
    /// Samples being stored.
    Recording,
}

/// Run engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Not started.
    Idle,
    /// Acquiring points.
    Running(PointPhase),
    /// Every point acquired and written.
    Completed,
    /// Stopped on request; acquired points were written.
    Interrupted,
    /// The result could not be written, or acquired samples could not be
    /// recorded. Collected rows are still written when possible.
    Fatal,
}

impl ScanState {
    /// True for `Completed`, `Interrupted` and `Fatal`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Interrupted | ScanState::Fatal
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Running(phase) => write!(f, "Running ({phase:?})"),
            ScanState::Completed => write!(f, "Completed"),
            ScanState::Interrupted => write!(f, "Interrupted"),
            ScanState::Fatal => write!(f, "Fatal"),
        }
    }
}

/// Cooperative stop request shared between a run and its controller.
///
/// Requesting a stop is idempotent and may happen from any thread.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Fresh, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop at the next check.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a run needs besides the hardware.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    /// Mesh to traverse.
    pub mesh: MeshConfig,
    /// Analyzer configuration.
    pub task: AcquisitionTask,
    /// Chamber coordinate stored as the origin of the result.
    pub zero: Point3D,
    /// Positioner speed in mm/min.
    pub jog_speed: f64,
    /// Reachable volume, checked before the run starts.
    pub envelope: Option<ChamberEnvelope>,
    /// VISA resource used for interface resets.
    pub resource: String,
    /// Prefix of analyzer measurement names.
    pub measurement_prefix: String,
    /// Apply `task` to the analyzer before the first point.
    pub configure_on_start: bool,
    /// Home all axes before the first point.
    pub home_before_scan: bool,
    /// Fault retry policy.
    pub retry: RetryPolicy,
    /// Directory receiving the result file.
    pub output_dir: PathBuf,
    /// Header metadata. The run id and start time are reassigned on every start.
    pub metadata: RunMetadata,
}

impl ScanPlan {
    /// Plan with default instrument and positioner settings.
    pub fn new(mesh: MeshConfig, task: AcquisitionTask, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mesh,
            task,
            zero: Point3D::default(),
            jog_speed: 1500.0,
            envelope: None,
            resource: "GPIB0::16::INSTR".to_string(),
            measurement_prefix: "chamber".to_string(),
            configure_on_start: true,
            home_before_scan: false,
            retry: RetryPolicy::default(),
            output_dir: output_dir.into(),
            metadata: RunMetadata::default(),
        }
    }

    /// Plan described by loaded settings.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let metadata = RunMetadataBuilder::new()
            .experiment_name(&settings.application.name)
            .build();
        Ok(Self {
            mesh: settings.mesh.clone(),
            task: settings.acquisition_task()?,
            zero: settings.chamber.zero,
            jog_speed: settings.chamber.jog_speed,
            envelope: Some(settings.chamber.envelope),
            resource: settings.instrument.resource.clone(),
            measurement_prefix: settings.instrument.measurement_prefix.clone(),
            configure_on_start: settings.instrument.configure_on_start,
            home_before_scan: settings.chamber.home_before_scan,
            retry: settings.recovery.clone(),
            output_dir: settings.storage.output_dir.clone(),
            metadata,
        })
    }

    /// Set the result origin.
    pub fn with_zero(mut self, zero: Point3D) -> Self {
        self.zero = zero;
        self
    }

    /// Set the jog speed.
    pub fn with_jog_speed(mut self, speed: f64) -> Self {
        self.jog_speed = speed;
        self
    }

    /// Check the traversal against an envelope before starting.
    pub fn with_envelope(mut self, envelope: ChamberEnvelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether to configure the analyzer before the first point.
    pub fn with_configure_on_start(mut self, configure: bool) -> Self {
        self.configure_on_start = configure;
        self
    }

    /// Whether to home before the first point.
    pub fn with_homing(mut self, home: bool) -> Self {
        self.home_before_scan = home;
        self
    }

    /// Set the header metadata.
    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn check(&self) -> AppResult<Vec<MeshPoint>> {
        self.mesh.validate().map_err(ScanError::Precondition)?;
        self.task
            .validate()
            .map_err(|e| ScanError::Precondition(e.to_string()))?;
        if !(self.jog_speed.is_finite() && self.jog_speed > 0.0) {
            return Err(ScanError::Precondition(format!(
                "jog speed must be positive, got {}",
                self.jog_speed
            )));
        }
        self.retry.validate().map_err(ScanError::Precondition)?;
        if !self.zero.is_finite() {
            return Err(ScanError::Precondition("zero position must be finite".into()));
        }
        if self.output_dir.is_file() {
            return Err(ScanError::Precondition(format!(
                "output path {} is a file",
                self.output_dir.display()
            )));
        }
        let points = generate(&self.mesh);
        if let Some(envelope) = &self.envelope {
            envelope.check(&points)?;
        }
        Ok(points)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// `Completed` or `Interrupted`.
    pub state: ScanState,
    /// Written result file.
    pub result_file: PathBuf,
    /// The written result.
    pub result: ScanResult,
    /// Points in the mesh.
    pub total_points: usize,
    /// Fault retries over the run.
    pub total_retries: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
}

/// Drives one scan.
///
/// ```rust,ignore
/// let orchestrator = ScanOrchestrator::new(chamber, analyzer);
/// let mut events = orchestrator.subscribe();
/// let handle = orchestrator.start(plan).await?;
/// // ... handle.stop() from elsewhere ...
/// let outcome = handle.wait().await?;
/// ```
pub struct ScanOrchestrator {
    motion: Arc<dyn MotionController>,
    analyzer: Arc<dyn NetworkAnalyzer>,
    clock: Arc<dyn Clock>,
    journal: FaultJournal,
    events: broadcast::Sender<ScanEvent>,
    state: watch::Sender<ScanState>,
    stop: StopSignal,
}

impl ScanOrchestrator {
    /// Orchestrator using real time and no fault journal file.
    pub fn new(motion: Arc<dyn MotionController>, analyzer: Arc<dyn NetworkAnalyzer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ScanState::Idle);
        Self {
            motion,
            analyzer,
            clock: Arc::new(SystemClock),
            journal: FaultJournal::disabled(),
            events,
            state,
            stop: StopSignal::new(),
        }
    }

    /// Use `clock` for back-off and ETA.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record generic faults to `journal`.
    pub fn with_fault_journal(mut self, journal: FaultJournal) -> Self {
        self.journal = journal;
        self
    }

    /// Share an externally created stop flag.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Event stream; subscribe before `start` to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Stop flag for this run.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Check preconditions, prepare the hardware and spawn the run.
    ///
    /// Invalid plans, an envelope violation, or a failure to configure the
    /// analyzer or home the positioner are reported here and the run never
    /// enters `Running`.
    pub async fn start(self, mut plan: ScanPlan) -> AppResult<ScanHandle> {
        let points = plan.check()?;
        // A plan may be started more than once; each start is its own run.
        plan.metadata = plan.metadata.for_new_run();

        if plan.configure_on_start {
            self.emit(ScanEvent::log("Configuring analyzer"));
            apply_acquisition_task(
                self.analyzer.as_ref(),
                &plan.task,
                &plan.measurement_prefix,
            )
            .await
            .map_err(|e| ScanError::Precondition(format!("analyzer configuration failed: {e}")))?;
        }

        if plan.home_before_scan {
            self.emit(ScanEvent::log("Homing all axes"));
            self.motion
                .home_axes(&Axis::ALL)
                .await
                .map_err(|e| ScanError::Precondition(format!("homing failed: {e}")))?;
            self.emit(ScanEvent::Position(PositionUpdate::absolute(Point3D::default())));
        }

        info!(
            run_id = %plan.metadata.run_id,
            points = points.len(),
            traversal = %plan.mesh.traversal,
            parameters = ?plan.task.parameters,
            "Starting scan"
        );

        let handle_events = self.events.clone();
        let state_rx = self.state.subscribe();
        let stop = self.stop.clone();
        let task = tokio::spawn(async move { self.run(plan, points).await });

        Ok(ScanHandle {
            stop,
            events: handle_events,
            state: state_rx,
            task,
        })
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn log(&self, message: String) {
        debug!("{}", message);
        self.emit(ScanEvent::log(message));
    }

    fn set_phase(&self, phase: PointPhase) {
        self.state.send_replace(ScanState::Running(phase));
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
        self.emit(ScanEvent::State { state });
    }

    async fn run(self, plan: ScanPlan, points: Vec<MeshPoint>) -> AppResult<ScanOutcome> {
        let started = self.clock.now();
        let total_points = points.len();
        let header = ScanHeader::new(
            plan.metadata.clone(),
            &plan.mesh,
            &plan.task,
            plan.zero,
            plan.jog_speed,
        );
        let mut assembler = ResultAssembler::new(header);
        let mut progress = ProgressTracker::new(
            total_points,
            plan.mesh.layer_size(),
            plan.mesh.layer_count(),
        );
        let mut retry = RetryTracker::new(plan.retry.clone());
        let mut interrupted = false;
        let mut rejected = None;

        self.set_state(ScanState::Running(PointPhase::Moving));

        'points: for (index, point) in points.iter().enumerate() {
            if self.stop.is_requested() {
                interrupted = true;
                break;
            }

            let records = loop {
                match self.acquire_point(&plan, index, point).await {
                    Ok(records) => break records,
                    Err(err) => {
                        self.recover(&plan, index, point, err, &mut retry).await;
                        if self.stop.is_requested() {
                            warn!(point_index = index, "Stop requested while retrying point");
                            interrupted = true;
                            break 'points;
                        }
                    }
                }
            };

            self.set_phase(PointPhase::Recording);
            if let Err(e) = assembler.extend(records) {
                error!(point_index = index, error = %e, "Samples rejected, ending run");
                rejected = Some(e);
                break;
            }

            let retries = retry.on_success();
            let update = progress.complete(index, self.clock.now(), retries, retry.total_retries());
            info!(
                point_index = index,
                done = update.points_done,
                total = total_points,
                eta_seconds = update.eta_seconds,
                retries,
                "Point acquired"
            );
            self.emit(ScanEvent::Progress(update));
        }

        let elapsed = self.clock.now().saturating_duration_since(started);
        if interrupted {
            info!(
                points_done = progress.points_done(),
                total = total_points,
                "Scan interrupted"
            );
            self.log(format!(
                "Stopped after {} of {} points",
                progress.points_done(),
                total_points
            ));
        }

        let result = assembler.finalize(elapsed, !interrupted && rejected.is_none());
        let output_dir = plan.output_dir.clone();
        let written = tokio::task::spawn_blocking(move || {
            let path = result.write_to_dir(&output_dir);
            (result, path)
        })
        .await;

        let (result, result_file) = match written {
            Ok((result, Ok(path))) => (result, path),
            Ok((_, Err(e))) => return Err(self.fatal(e.to_string())),
            Err(e) => return Err(self.fatal(e.to_string())),
        };

        if let Some(e) = rejected {
            self.set_state(ScanState::Fatal);
            self.log(format!(
                "Run ended after {} points, partial result in {}: {e}",
                progress.points_done(),
                result_file.display()
            ));
            return Err(e);
        }

        let state = if interrupted {
            ScanState::Interrupted
        } else {
            ScanState::Completed
        };
        self.set_state(state);
        self.emit(ScanEvent::Completed(Completion {
            result_file: result_file.clone(),
            duration_formatted: format_duration(elapsed),
            interrupted,
        }));
        info!(
            file = %result_file.display(),
            elapsed = %format_duration(elapsed),
            total_retries = retry.total_retries(),
            %state,
            "Scan finished"
        );

        Ok(ScanOutcome {
            state,
            result_file,
            result,
            total_points,
            total_retries: retry.total_retries(),
            elapsed,
        })
    }

    fn fatal(&self, detail: String) -> ScanError {
        error!(%detail, "Result could not be written");
        self.set_state(ScanState::Fatal);
        self.log(format!("Result could not be written: {detail}"));
        ScanError::Storage(detail)
    }

    /// Move to a point and read every requested parameter.
    async fn acquire_point(
        &self,
        plan: &ScanPlan,
        index: usize,
        point: &MeshPoint,
    ) -> DeviceResult<Vec<SampleRecord>> {
        self.set_phase(PointPhase::Moving);
        if let Some(approach) = point.approach {
            self.log(format!("Point {}: approaching from {}", index + 1, approach));
            self.motion.move_absolute(approach, plan.jog_speed).await?;
            self.emit(ScanEvent::Position(PositionUpdate::absolute(approach)));
        }
        self.log(format!("Point {}: moving to {}", index + 1, point.position));
        self.motion
            .move_absolute(point.position, plan.jog_speed)
            .await?;
        self.emit(ScanEvent::Position(PositionUpdate::absolute(point.position)));

        let relative = point.position.relative_to(&plan.zero);
        let mut records = Vec::with_capacity(plan.task.parameters.len() * plan.task.points);
        for &parameter in &plan.task.parameters {
            let name = plan.task.measurement_name(&plan.measurement_prefix, parameter);

            self.set_phase(PointPhase::Triggering);
            self.log(format!("Point {}: measuring {}", index + 1, parameter));
            self.analyzer.trigger_measurement(&name).await?;

            self.set_phase(PointPhase::Reading);
            let trace = self.analyzer.read_trace(&name, parameter).await?;
            records.extend(
                trace
                    .iter()
                    .map(|bin| SampleRecord::from_trace(index, relative, parameter, bin)),
            );
        }
        Ok(records)
    }

    /// Handle one fault; on return the point is ready to be retried.
    async fn recover(
        &self,
        plan: &ScanPlan,
        index: usize,
        point: &MeshPoint,
        err: DeviceError,
        retry: &mut RetryTracker,
    ) {
        let kind = err.fault_kind();
        let state = retry.on_fault(kind);
        warn!(
            point_index = index,
            position = %point.position,
            code = ?err.code(),
            kind = ?kind,
            attempt = retry.point_retries(),
            error = %err,
            "Fault while acquiring point"
        );
        self.log(format!(
            "Point {}: {} (retry {}, {} total)",
            index + 1,
            err,
            retry.point_retries(),
            retry.total_retries()
        ));

        let recovery = match state {
            RetryState::Attempting => Ok(()),
            RetryState::RecoveringContention => {
                self.log("Resetting instrument interface and reconfiguring".to_string());
                self.reset_and_reconfigure(plan).await
            }
            RetryState::RecoveringTimeout => {
                self.log(format!(
                    "{} consecutive timeouts, reconfiguring instrument",
                    plan.retry.timeout_threshold
                ));
                self.reconfigure(plan).await
            }
            RetryState::BackingOff => {
                self.journal_fault(index, point, &err.to_string()).await;
                self.clock.sleep(plan.retry.backoff_delay).await;
                Ok(())
            }
        };

        if let Err(e) = recovery {
            warn!(point_index = index, error = %e, "Recovery failed, backing off");
            self.journal_fault(index, point, &format!("recovery failed: {e}"))
                .await;
            self.clock.sleep(plan.retry.backoff_delay).await;
        }
        retry.on_recovered();
    }

    async fn reset_and_reconfigure(&self, plan: &ScanPlan) -> DeviceResult<()> {
        self.analyzer
            .reset_interface_in_charge(&plan.resource)
            .await?;
        self.reconfigure(plan).await
    }

    async fn reconfigure(&self, plan: &ScanPlan) -> DeviceResult<()> {
        apply_acquisition_task(
            self.analyzer.as_ref(),
            &plan.task,
            &plan.measurement_prefix,
        )
        .await
    }

    async fn journal_fault(&self, index: usize, point: &MeshPoint, detail: &str) {
        if let Err(e) = self.journal.append(index, point.position, detail).await {
            error!(error = %e, "Could not append to fault journal");
        }
    }
}

/// Control handle for a spawned run.
pub struct ScanHandle {
    stop: StopSignal,
    events: broadcast::Sender<ScanEvent>,
    state: watch::Receiver<ScanState>,
    task: JoinHandle<AppResult<ScanOutcome>>,
}

impl ScanHandle {
    /// Request a stop. Takes effect before the next point or retry.
    pub fn stop(&self) {
        self.stop.request();
    }

    /// Stop flag of the run, for use from other tasks.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Subscribe to events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// State watcher.
    pub fn watch_state(&self) -> watch::Receiver<ScanState> {
        self.state.clone()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> AppResult<ScanOutcome> {
        self.task
            .await
            .map_err(|e| ScanError::Task(e.to_string()))?
    }
}
