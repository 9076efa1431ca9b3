use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::schedule::StepId;

#[derive(Debug, Clone, Copy)]
pub struct StepExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Timings of every step that ran.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<StepId, StepExecution>,
}

const LABEL_WIDTH: usize = 40;
const CHART_WIDTH: usize = 50;

impl Diagnostics {
    /// Wall-clock time from the first step starting to the last one finishing.
    pub fn total(&self) -> Duration {
        let Some(start) = self.execution_times.values().map(|t| t.start).min() else {
            return Duration::ZERO;
        };
        self.execution_times
            .values()
            .map(|t| (t.start + t.duration).duration_since(start))
            .max()
            .unwrap_or_default()
    }

    /// Renders a text waterfall chart, one row per step ordered by start time.
    ///
    /// ```text
    /// init|app#schema       |##                          |  120µs
    /// build|app#schema      |  ##########                |  1.52ms
    /// ```
    pub fn render_waterfall(&self) -> String {
        let mut steps: Vec<_> = self.execution_times.iter().collect();
        if steps.is_empty() {
            return String::from("No steps ran\n");
        }
        steps.sort_by(|(a_id, a), (b_id, b)| {
            a.start
                .cmp(&b.start)
                .then_with(|| a_id.to_string().cmp(&b_id.to_string()))
        });

        let global_start = steps[0].1.start;
        let total_micros = self.total().as_micros().max(1) as f64;

        let mut buffer = String::new();
        for (id, exec) in steps {
            let offset = exec.start.duration_since(global_start).as_micros() as f64;
            let length = exec.duration.as_micros() as f64;

            let from = ((offset / total_micros) * CHART_WIDTH as f64) as usize;
            let width = (((length / total_micros) * CHART_WIDTH as f64) as usize).max(1);
            let from = from.min(CHART_WIDTH - 1);
            let width = width.min(CHART_WIDTH - from);

            let mut label = id.to_string();
            if label.len() > LABEL_WIDTH {
                let cut = (0..=LABEL_WIDTH - 1)
                    .rev()
                    .find(|&i| label.is_char_boundary(i))
                    .unwrap_or(0);
                label.truncate(cut);
                label.push('~');
            }

            let _ = writeln!(
                buffer,
                "{label:<LABEL_WIDTH$} |{:from$}{:#<width$}{:rest$}| {}",
                "",
                "",
                "",
                format_duration(length),
                rest = CHART_WIDTH - from - width,
            );
        }

        buffer
    }
}

fn format_duration(micros: f64) -> String {
    if micros < 1000.0 {
        format!("{micros:.0}µs")
    } else {
        format!("{:.2}ms", micros / 1000.0)
    }
}
