//! Job progress across the stages of a pipeline.

use crate::classifier::RUNNING_PROGRESS_CAP;

/// Progress at which the stage at `position` (0-based) of `total` starts.
pub fn stage_baseline(position: u32, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let position = (position as usize).min(total);
    (RUNNING_PROGRESS_CAP as usize * position / total) as u8
}

/// Progress a job reaches when the stage at `position` completes.
///
/// Non-final stages stop at their share of 90; only the final stage's
/// verified success reaches 100.
pub fn completion_mark(position: u32, total: usize) -> u8 {
    if position as usize + 1 >= total {
        100
    } else {
        stage_baseline(position + 1, total)
    }
}

/// Progress after `done` of `total` batch items inside a stage running
/// between `baseline` and the running cap.
pub fn batch_progress(baseline: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return baseline;
    }
    let span = RUNNING_PROGRESS_CAP.saturating_sub(baseline) as usize;
    baseline + (span * done.min(total) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_stage_marks() {
        assert_eq!(stage_baseline(0, 4), 0);
        assert_eq!(completion_mark(0, 4), 22);
        assert_eq!(completion_mark(1, 4), 45);
        assert_eq!(completion_mark(2, 4), 67);
        assert_eq!(completion_mark(3, 4), 100);
        assert_eq!(stage_baseline(3, 4), 67);
    }

    #[test]
    fn single_stage_goes_straight_to_done() {
        assert_eq!(stage_baseline(0, 1), 0);
        assert_eq!(completion_mark(0, 1), 100);
    }

    #[test]
    fn batch_progress_stays_below_cap() {
        assert_eq!(batch_progress(0, 0, 10), 0);
        assert_eq!(batch_progress(0, 5, 10), 45);
        assert_eq!(batch_progress(0, 10, 10), 90);
        assert_eq!(batch_progress(45, 1, 2), 67);
        assert_eq!(batch_progress(30, 3, 0), 30);
    }
}
