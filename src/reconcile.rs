//! Iteration reconciliation.
//!
//! Eval blocks in the log carry no iteration number of their own. Their
//! index is derived structurally: eval sample *k* happened at
//! `eval_start_iter + k * eval_interval`. This is only correct when every
//! eval metric has the same number of samples, which callers must check
//! first; the reconciler itself cannot detect a misalignment.

use tracing::warn;

/// Produce exactly `count` iteration numbers starting at `start_iter`,
/// stepping by `interval`.
///
/// `None` when the schedule leaves the `i64` range.
pub fn reconcile_eval_iterations(count: usize, start_iter: i64, interval: i64) -> Option<Vec<i64>> {
    (0..count)
        .map(|k| {
            i64::try_from(k)
                .ok()?
                .checked_mul(interval)?
                .checked_add(start_iter)
        })
        .collect()
}

/// Synthesized train index used when the log has no iteration lines.
pub fn sequential_iterations(count: usize, start_iter: i64) -> Option<Vec<i64>> {
    reconcile_eval_iterations(count, start_iter, 1)
}

/// How many eval samples a run that reached `last_train_iter` should hold.
///
/// Returns 0 when the run ended before the first eval.
pub fn expected_eval_count(last_train_iter: i64, start_iter: i64, interval: i64) -> usize {
    if interval <= 0 || last_train_iter < start_iter {
        return 0;
    }
    // Widened so extreme settings cannot overflow.
    let span = i128::from(last_train_iter) - i128::from(start_iter);
    usize::try_from(span / i128::from(interval) + 1).unwrap_or(usize::MAX)
}

/// Compare the observed eval count against the train iterations and warn
/// when the eval start/interval settings look miscalibrated.
///
/// One missing trailing eval is tolerated: the log may stop between the
/// last train block and its eval.
pub fn check_eval_calibration(
    observed: usize,
    last_train_iter: i64,
    start_iter: i64,
    interval: i64,
) -> bool {
    let expected = expected_eval_count(last_train_iter, start_iter, interval);
    let consistent = observed == expected || observed + 1 == expected;
    if !consistent {
        warn!(
            observed,
            expected,
            last_train_iter,
            eval_start_iter = start_iter,
            eval_interval = interval,
            "eval sample count does not fit the train iterations; check eval_start_iter and eval_interval"
        );
    }
    consistent
}
