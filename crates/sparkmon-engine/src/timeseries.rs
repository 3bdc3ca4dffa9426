//! Chart series derived on read from task intervals and executor capacity.

use crate::capacity::CapacityTracker;
use sparkmon_core::views::{ScheduledRegion, TimeSeriesView};
use sparkmon_core::EpochMillis;

/// Concurrent task count after all starts and ends at each distinct
/// timestamp. Tasks without a start, or that ended the instant they started,
/// never held a slot and are skipped. Unfinished tasks stay counted.
pub fn task_concurrency<I>(intervals: I) -> Vec<(EpochMillis, u64)>
where
    I: IntoIterator<Item = (EpochMillis, Option<EpochMillis>)>,
{
    let mut deltas: Vec<(EpochMillis, i64)> = Vec::new();
    for (start, end) in intervals {
        match end {
            Some(end) if end <= start => continue,
            Some(end) => {
                deltas.push((start, 1));
                deltas.push((end, -1));
            }
            None => deltas.push((start, 1)),
        }
    }
    deltas.sort_unstable();

    let mut samples: Vec<(EpochMillis, u64)> = Vec::new();
    let mut level: i64 = 0;
    for (ts, delta) in deltas {
        level = (level + delta).max(0);
        match samples.last_mut() {
            Some(last) if last.0 == ts => last.1 = level as u64,
            _ => samples.push((ts, level as u64)),
        }
    }
    samples
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningSplit {
    pub running: Vec<u64>,
    pub scheduled: Vec<ScheduledRegion>,
}

/// Splits task samples into the part that fits the available slots and the
/// regions where tasks queue above capacity. A region opens on the capacity
/// line as it stood at the previous sample and closes on the capacity line of
/// the sample where tasks fit again. A region still open at the last sample
/// is emitted open.
pub fn split_running_scheduled<F>(samples: &[(EpochMillis, u64)], capacity: F) -> RunningSplit
where
    F: Fn(EpochMillis) -> u64,
{
    let mut split = RunningSplit::default();
    let mut open: Option<ScheduledRegion> = None;
    let mut previous_capacity: Option<u64> = None;

    for &(ts, tasks) in samples {
        let cap = capacity(ts);
        split.running.push(tasks.min(cap));

        if tasks > cap {
            let region = open.get_or_insert_with(|| ScheduledRegion {
                x: vec![ts],
                y: vec![previous_capacity.unwrap_or(cap)],
            });
            region.x.push(ts);
            region.y.push(tasks);
        } else if let Some(mut region) = open.take() {
            region.x.push(ts);
            region.y.push(cap);
            if region.x.first() != region.x.last() {
                split.scheduled.push(region);
            }
        }
        previous_capacity = Some(cap);
    }

    if let Some(region) = open {
        split.scheduled.push(region);
    }
    split
}

/// Capacity as step points covering `[start, end]`: the level at `start`, every
/// change inside the window, and the level at `end`.
pub fn executor_series(
    capacity: &CapacityTracker,
    start: EpochMillis,
    end: EpochMillis,
) -> (Vec<EpochMillis>, Vec<u64>) {
    let mut xs = vec![start];
    let mut ys = vec![capacity.capacity_at(start)];
    for (ts, level) in capacity.steps() {
        if ts > start && ts <= end {
            xs.push(ts);
            ys.push(level);
        }
    }
    if xs.last().is_some_and(|last| *last < end) {
        xs.push(end);
        ys.push(capacity.capacity_at(end));
    }
    (xs, ys)
}

/// A job boundary drawn on the chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMarker {
    pub at: EpochMillis,
    pub text: String,
}

pub fn build_time_series<I>(
    intervals: I,
    mut markers: Vec<JobMarker>,
    capacity: &CapacityTracker,
) -> TimeSeriesView
where
    I: IntoIterator<Item = (EpochMillis, Option<EpochMillis>)>,
{
    let samples = task_concurrency(intervals);
    markers.sort_by_key(|marker| marker.at);

    let first = samples
        .first()
        .map(|sample| sample.0)
        .into_iter()
        .chain(markers.first().map(|marker| marker.at))
        .min();
    let last = samples
        .last()
        .map(|sample| sample.0)
        .into_iter()
        .chain(markers.last().map(|marker| marker.at))
        .max();
    let (Some(start), Some(end)) = (first, last) else {
        return TimeSeriesView::default();
    };

    let split = split_running_scheduled(&samples, |ts| capacity.capacity_at(ts));
    let (executor_x, executor_y) = executor_series(capacity, start, end);

    TimeSeriesView {
        task_x: samples.iter().map(|sample| sample.0).collect(),
        task_y: samples.iter().map(|sample| sample.1).collect(),
        running_y: split.running,
        scheduled: split.scheduled,
        executor_x,
        executor_y,
        job_marker_x: markers.iter().map(|marker| marker.at).collect(),
        job_marker_y: vec![0; markers.len()],
        job_marker_text: markers.into_iter().map(|marker| marker.text).collect(),
    }
}
