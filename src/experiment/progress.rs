//! Progress and ETA bookkeeping.

use std::time::Instant;

use super::events::ProgressUpdate;
use crate::timing::format_duration;

/// Tracks completed points and estimates the remaining time.
///
/// The first completed point only fixes the reference instant and reports an ETA
/// of zero. Afterwards the mean time per point is `elapsed / (done - 1)`.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_points: usize,
    points_per_layer: usize,
    total_layers: usize,
    done: usize,
    first_completed_at: Option<Instant>,
}

impl ProgressTracker {
    /// Tracker for a mesh with the given layout.
    pub fn new(total_points: usize, points_per_layer: usize, total_layers: usize) -> Self {
        Self {
            total_points,
            points_per_layer: points_per_layer.max(1),
            total_layers,
            done: 0,
            first_completed_at: None,
        }
    }

    /// Points completed so far.
    pub fn points_done(&self) -> usize {
        self.done
    }

    /// Record completion of `point_index` at `now`.
    pub fn complete(
        &mut self,
        point_index: usize,
        now: Instant,
        retries: u32,
        total_retries: u64,
    ) -> ProgressUpdate {
        self.done += 1;
        let remaining = self.total_points.saturating_sub(self.done);

        let eta_seconds = match self.first_completed_at {
            None => {
                self.first_completed_at = Some(now);
                0
            }
            Some(first) => {
                let elapsed = now.saturating_duration_since(first).as_secs_f64();
                let per_point = elapsed / (self.done - 1) as f64;
                (per_point * remaining as f64).round() as u64
            }
        };

        let layer_index = point_index / self.points_per_layer;
        let point_in_layer_index = point_index % self.points_per_layer;
        let status_text = format!(
            "Point {}/{} (layer {}/{}, point {}/{}), ETA {}",
            self.done,
            self.total_points,
            layer_index + 1,
            self.total_layers,
            point_in_layer_index + 1,
            self.points_per_layer,
            format_duration(std::time::Duration::from_secs(eta_seconds)),
        );

        ProgressUpdate {
            total_points: self.total_points,
            points_done: self.done,
            total_layers: self.total_layers,
            layer_index,
            points_per_layer: self.points_per_layer,
            point_in_layer_index,
            status_text,
            eta_seconds,
            retries,
            total_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_point_reports_zero_eta() {
        let mut tracker = ProgressTracker::new(10, 5, 2);
        let update = tracker.complete(0, Instant::now(), 0, 0);
        assert_eq!(update.eta_seconds, 0);
        assert_eq!(update.points_done, 1);
        assert_eq!(update.layer_index, 0);
    }

    #[test]
    fn test_eta_uses_mean_after_first_point() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(10, 5, 2);
        tracker.complete(0, start, 0, 0);
        let update = tracker.complete(1, start + Duration::from_secs(2), 0, 0);
        // 2 s per point, 8 remaining
        assert_eq!(update.eta_seconds, 16);

        let update = tracker.complete(2, start + Duration::from_secs(5), 1, 1);
        // 2.5 s per point, 7 remaining
        assert_eq!(update.eta_seconds, 18);
        assert_eq!(update.retries, 1);
    }

    #[test]
    fn test_eta_non_increasing_for_uniform_points() {
        let start = Instant::now();
        let mut tracker = ProgressTracker::new(20, 4, 5);
        let mut previous = None;
        for i in 0..20 {
            let update = tracker.complete(i, start + Duration::from_secs(3 * i as u64), 0, 0);
            if let Some(prev) = previous {
                assert!(update.eta_seconds <= prev, "eta rose at point {i}");
            }
            if i > 0 {
                previous = Some(update.eta_seconds);
            }
        }
        assert_eq!(tracker.points_done(), 20);
    }

    #[test]
    fn test_layer_indices() {
        let mut tracker = ProgressTracker::new(6, 3, 2);
        let now = Instant::now();
        let update = tracker.complete(4, now, 0, 0);
        assert_eq!(update.layer_index, 1);
        assert_eq!(update.point_in_layer_index, 1);
        assert!(update.status_text.contains("layer 2/2"));
    }
}
