//! Derives a parent's progress from its children's stored records.

use serde::Serialize;

use crate::models::{ProgressRecord, MAX_PROGRESS};

/// Result of one aggregation pass over a parent's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    pub total_items: usize,
    /// Rounded mean of child progress.
    pub progress: u8,
    pub all_completed: bool,
}

/// Summarize child records. `None` when there are no children, in which
/// case the parent must be left untouched.
///
/// This is the rounded mean of the children's progress with one exception:
/// the aggregate never claims 100% while a child is incomplete. A mean that
/// rounds to 100 without every child completed (for example a lesson saved
/// with `progress: 100` but no completion flag) is reported as 99, so a
/// parent at 100 always means every child is done.
pub fn summarize<'a, I>(children: I) -> Option<AggregateSummary>
where
    I: IntoIterator<Item = &'a ProgressRecord>,
{
    let mut total_items = 0usize;
    let mut sum = 0u64;
    let mut all_completed = true;

    for child in children {
        total_items += 1;
        sum += child.progress as u64;
        all_completed &= child.is_completed;
    }

    if total_items == 0 {
        return None;
    }

    let mean = (sum as f64 / total_items as f64).round() as u8;
    let progress = if mean >= MAX_PROGRESS && !all_completed {
        MAX_PROGRESS - 1
    } else {
        mean
    };

    Some(AggregateSummary {
        total_items,
        progress,
        all_completed,
    })
}
