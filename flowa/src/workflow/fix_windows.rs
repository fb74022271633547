//! Whether an evaluation reuses misfit windows
//!
//! | Policy | Fixed when |
//! |---|---|
//! | `true` / `false` | always / never |
//! | `ITER` | every step except step 0 |
//! | `ONCE` | everywhere except step 0 of the starting iteration |
//!
//! The very first evaluation (iteration 1, step 0) has nothing to reuse and
//! never fixes windows.

use crate::config::FixWindows;

/// Decide the fixed-window flag for one evaluation
pub fn fix_windows(iteration: u32, step_count: u32, begin: u32, policy: FixWindows) -> bool {
    if iteration == 1 && step_count == 0 {
        return false;
    }
    match policy {
        FixWindows::Fixed(flag) => flag,
        FixWindows::Iter => step_count != 0,
        FixWindows::Once => !(iteration == begin && step_count == 0),
    }
}
