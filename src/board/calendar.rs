//! Calendar bucketing: tasks by due day within a month, and per-month
//! totals within a year.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use super::models::{Task, TaskStatus};
use crate::errors::BoardError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarMonth {
    pub year: i32,
    pub month: u32,
    pub days: Vec<CalendarDay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthSummary {
    pub month: u32,
    pub total: usize,
    pub completed: usize,
    pub open: usize,
}

/// First and last day of a month.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), BoardError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| BoardError::Validation(format!("Invalid month {}-{}", year, month)))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(|| BoardError::Validation(format!("Year {} out of range", year)))?;
    Ok((first, next - Duration::days(1)))
}

/// Monday through Sunday of the week containing `date`.
pub fn week_range(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
    (monday, monday + Duration::days(6))
}

/// Every day of the month with the tasks due on it. Within a day, higher
/// priority comes first, then lower id. Tasks due outside the month or
/// without a due date are ignored.
pub fn month_view(
    tasks: impl IntoIterator<Item = Task>,
    year: i32,
    month: u32,
) -> Result<CalendarMonth, BoardError> {
    let (first, last) = month_bounds(year, month)?;
    let mut days: Vec<CalendarDay> = first
        .iter_days()
        .take_while(|d| *d <= last)
        .map(|date| CalendarDay {
            date,
            tasks: Vec::new(),
        })
        .collect();

    for task in tasks {
        let Some(due) = task.due_date else { continue };
        if due < first || due > last {
            continue;
        }
        days[(due.day() - 1) as usize].tasks.push(task);
    }
    for day in &mut days {
        day.tasks
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    }

    Ok(CalendarMonth { year, month, days })
}

/// Twelve month summaries for `year`, counted by due month. Canceled
/// tasks count toward `total` only.
pub fn year_summary<'a>(tasks: impl IntoIterator<Item = &'a Task>, year: i32) -> Vec<MonthSummary> {
    let mut months: Vec<MonthSummary> = (1..=12)
        .map(|month| MonthSummary {
            month,
            total: 0,
            completed: 0,
            open: 0,
        })
        .collect();
    for task in tasks {
        let Some(due) = task.due_date else { continue };
        if due.year() != year {
            continue;
        }
        let summary = &mut months[(due.month() - 1) as usize];
        summary.total += 1;
        if task.status == TaskStatus::Completed {
            summary.completed += 1;
        }
        if !task.status.is_closed() {
            summary.open += 1;
        }
    }
    months
}
