//! Fault injection: contention, timeouts and generic faults are retried on the
//! same point without losing or duplicating samples.

use chamber_scan::data::FaultJournal;
use chamber_scan::error::DeviceError;
use chamber_scan::error_recovery::RetryPolicy;
use chamber_scan::experiment::{
    AcquisitionTask, AxisRange, MeshConfig, Point3D, ScanEvent, ScanOrchestrator, ScanPlan,
    ScanState, SParameter,
};
use chamber_scan::hardware::mock::{AnalyzerCall, MockAnalyzer, MockChamber, MotionCall};
use chamber_scan::timing::ManualClock;
use std::sync::Arc;
use std::time::Duration;

const RESOURCE: &str = "GPIB0::16::INSTR";

fn plan(dir: &std::path::Path) -> ScanPlan {
    let mesh = MeshConfig::new(
        AxisRange::new(0.0, 10.0, 2),
        AxisRange::fixed(0.0),
        AxisRange::fixed(0.0),
    );
    let task = AcquisitionTask::new(vec![SParameter::S11, SParameter::S22], 1e9, 2e9, 3).unwrap();
    ScanPlan::new(mesh, task, dir)
}

fn is_read(call: &AnalyzerCall) -> bool {
    matches!(call, AnalyzerCall::ReadTrace(..))
}

#[tokio::test]
async fn test_contention_on_read_resets_and_reconfigures_before_retry() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let chamber = Arc::new(MockChamber::new());
    let analyzer = Arc::new(MockAnalyzer::new().with_stage(chamber.clone()));
    analyzer.fail_next_read(DeviceError::contention()).await;

    let orchestrator = ScanOrchestrator::new(chamber.clone(), analyzer.clone())
        .with_clock(Arc::new(clock.clone()));
    let mut rx = orchestrator.subscribe();
    let outcome = orchestrator
        .start(plan(dir.path()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.state, ScanState::Completed);
    assert_eq!(outcome.total_retries, 1);
    // Contention never backs off.
    assert!(clock.sleeps().is_empty());

    let calls = analyzer.calls().await;
    let failed_read = calls.iter().position(is_read).unwrap();
    let next_read = failed_read + 1 + calls[failed_read + 1..].iter().position(is_read).unwrap();
    let between = &calls[failed_read + 1..next_read];
    assert_eq!(between[0], AnalyzerCall::ResetInterface(RESOURCE.to_string()));
    assert_eq!(between[1], AnalyzerCall::PresetAndClear);
    assert!(matches!(&between[2], AnalyzerCall::AddMeasurement(s) if s.parameter == SParameter::S11 && s.manual_trigger));
    assert!(matches!(&between[3], AnalyzerCall::AddMeasurement(s) if s.parameter == SParameter::S22));
    assert_eq!(between[4], AnalyzerCall::Trigger("chamber_S11".to_string()));

    // The point is retried from the move.
    let moves = chamber.calls().await;
    assert_eq!(
        moves,
        vec![
            MotionCall::Absolute(Point3D::new(0.0, 0.0, 0.0)),
            MotionCall::Absolute(Point3D::new(0.0, 0.0, 0.0)),
            MotionCall::Absolute(Point3D::new(10.0, 0.0, 0.0)),
        ]
    );

    // Both parameters of the faulted point are recorded exactly once.
    let rows = &outcome.result.rows;
    assert_eq!(rows.len(), 2 * 3);
    assert!(rows.iter().all(|r| r.len() == 8));
    assert_eq!(rows.iter().filter(|r| r[0] == 0.0).count(), 3);

    let retries: Vec<(u32, u64)> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            ScanEvent::Progress(p) => Some((p.retries, p.total_retries)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 1), (0, 1)]);
}

#[tokio::test]
async fn test_third_consecutive_timeout_reconfigures_without_reset() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let chamber = Arc::new(MockChamber::new());
    let analyzer = Arc::new(MockAnalyzer::new());
    for _ in 0..3 {
        analyzer.fail_next_trigger(DeviceError::timeout()).await;
    }

    let orchestrator = ScanOrchestrator::new(chamber.clone(), analyzer.clone())
        .with_clock(Arc::new(clock.clone()));
    let outcome = orchestrator
        .start(plan(dir.path()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.state, ScanState::Completed);
    assert_eq!(outcome.total_retries, 3);
    assert_eq!(outcome.result.rows.len(), 6);
    assert!(clock.sleeps().is_empty());

    let calls = analyzer.calls().await;
    assert!(!calls
        .iter()
        .any(|c| matches!(c, AnalyzerCall::ResetInterface(_))));
    // Once at start, once after the third timeout.
    let presets: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == AnalyzerCall::PresetAndClear)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(presets.len(), 2);
    let triggers_before_recovery = calls[..presets[1]]
        .iter()
        .filter(|c| matches!(c, AnalyzerCall::Trigger(_)))
        .count();
    assert_eq!(triggers_before_recovery, 3);

    // Three failed attempts plus the successful one at the first point.
    let first = Point3D::new(0.0, 0.0, 0.0);
    let moves_to_first = chamber
        .calls()
        .await
        .iter()
        .filter(|c| **c == MotionCall::Absolute(first))
        .count();
    assert_eq!(moves_to_first, 4);
}

#[tokio::test]
async fn test_timeout_streak_broken_by_other_fault() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new();
    let chamber = Arc::new(MockChamber::new());
    let analyzer = Arc::new(MockAnalyzer::new());
    analyzer.fail_next_trigger(DeviceError::timeout()).await;
    analyzer.fail_next_trigger(DeviceError::timeout()).await;
    analyzer
        .fail_next_trigger(DeviceError::instrument(-1_073_807_360, "I/O error"))
        .await;
    analyzer.fail_next_trigger(DeviceError::timeout()).await;

    let orchestrator = ScanOrchestrator::new(chamber, analyzer.clone())
        .with_clock(Arc::new(clock.clone()));
    let outcome = orchestrator
        .start(plan(dir.path()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.total_retries, 4);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    let presets = analyzer
        .calls()
        .await
        .iter()
        .filter(|c| **c == AnalyzerCall::PresetAndClear)
        .count();
    assert_eq!(presets, 1);
}

#[tokio::test]
async fn test_generic_faults_are_journaled_and_backed_off() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("faults.log");
    let clock = ManualClock::new();
    let chamber = Arc::new(MockChamber::new());
    chamber
        .fail_next_move(DeviceError::Motion("axis Y stalled".into()))
        .await;
    chamber
        .fail_next_move(DeviceError::Motion("axis Y stalled".into()))
        .await;
    let analyzer = Arc::new(MockAnalyzer::new());

    let orchestrator = ScanOrchestrator::new(chamber.clone(), analyzer.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_fault_journal(FaultJournal::new(&journal_path));
    let plan = plan(&dir.path().join("results")).with_retry_policy(RetryPolicy {
        timeout_threshold: 3,
        backoff_delay: Duration::from_millis(250),
    });
    let outcome = orchestrator.start(plan).await.unwrap().wait().await.unwrap();

    assert_eq!(outcome.state, ScanState::Completed);
    assert_eq!(outcome.total_retries, 2);
    assert_eq!(outcome.result.header.points_acquired, 2);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(250), Duration::from_millis(250)]
    );

    let journal = std::fs::read_to_string(&journal_path).unwrap();
    let lines: Vec<_> = journal.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        assert!(line.contains("\tpoint=0\t(0.000, 0.000, 0.000)\t"));
        assert!(line.ends_with("Motion fault: axis Y stalled"));
    }

    // Generic faults never touch the instrument configuration.
    let presets = analyzer
        .calls()
        .await
        .iter()
        .filter(|c| **c == AnalyzerCall::PresetAndClear)
        .count();
    assert_eq!(presets, 1);
}
