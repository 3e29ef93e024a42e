//! Expansion of a run configuration into ingestion tasks.

use chrono::NaiveDate;

use crate::config::Config;
use crate::error::ConfigError;
use crate::task::{Route, Task};
use crate::window::TimeWindow;

/// Cartesian product `dates x routes x windows`, in that nesting order.
///
/// Pure and deterministic: identical inputs give identical keys in
/// identical order. Duplicate keys are kept only once.
#[must_use]
pub fn plan(dates: &[NaiveDate], routes: &[Route], windows: &[TimeWindow]) -> Vec<Task> {
    let mut seen = std::collections::HashSet::new();
    let mut tasks = Vec::with_capacity(dates.len() * routes.len() * windows.len());
    for &date in dates {
        for route in routes {
            for &window in windows {
                let task = Task::new(date, route.clone(), window);
                if seen.insert(task.key()) {
                    tasks.push(task);
                }
            }
        }
    }
    tasks
}

/// Plan every task of a validated configuration.
pub fn plan_config(config: &Config) -> Result<Vec<Task>, ConfigError> {
    config.validate()?;
    Ok(plan(&config.dates(), &config.routes, &config.time_windows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn w(from: &str, to: &str) -> TimeWindow {
        TimeWindow::parse(from, to).unwrap()
    }

    #[test]
    fn product_in_nesting_order() {
        let tasks = plan(
            &[d(1), d(2)],
            &[Route::new("PAD", "BRI"), Route::new("VIC", "GTW")],
            &[w("0600", "0859"), w("0900", "1159")],
        );
        assert_eq!(tasks.len(), 8);
        assert_eq!(tasks[0].key(), "2025-08-01_PAD_BRI_0600_0859");
        assert_eq!(tasks[1].key(), "2025-08-01_PAD_BRI_0900_1159");
        assert_eq!(tasks[2].key(), "2025-08-01_VIC_GTW_0600_0859");
        assert_eq!(tasks[7].key(), "2025-08-02_VIC_GTW_0900_1159");
        assert!(tasks.iter().all(|t| t.depth == 0));
    }

    #[test]
    fn duplicate_inputs_collapse() {
        let tasks = plan(
            &[d(1)],
            &[Route::new("PAD", "BRI"), Route::new("pad", "bri")],
            &[w("0600", "0659")],
        );
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn empty_input_yields_empty_plan() {
        assert!(plan(&[], &[Route::new("PAD", "BRI")], &[w("0600", "0659")]).is_empty());
    }

    #[test]
    fn plan_config_validates_first() {
        assert!(plan_config(&Config::default()).is_err());
    }
}
