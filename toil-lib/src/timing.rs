use std::time::{Duration, Instant};

const PROGRESS_WIDTH: usize = 6;
const ELAPSED_WIDTH: usize = 13;

/// Wall-clock accounting of the tool invocations of a job,
/// in invocation order
#[derive(Default)]
pub struct Timing {
    entries: Vec<Entry>,
}

struct Entry {
    label: String,
    elapsed: Duration,
}

impl Timing {
    pub fn begin(&mut self, label: impl ToString) -> Timer {
        Timer(label.to_string(), Instant::now())
    }

    pub fn finish(&mut self, timer: Timer) -> Duration {
        let elapsed = timer.1.elapsed();

        self.entries.push(Entry {
            label: timer.0,
            elapsed,
        });

        elapsed
    }

    pub fn total(&self) -> Duration {
        self.entries.iter().map(|entry| entry.elapsed).sum()
    }

    pub fn print_table(&self) {
        let max_label_length = self
            .entries
            .iter()
            .map(|entry| entry.label.len())
            .max()
            .unwrap_or_default()
            .max("Tools".len());
        let total_elapsed = self.total();

        println!(
            "T{:<max_label_length$}  {:>ELAPSED_WIDTH$} {:>PROGRESS_WIDTH$}",
            "ools", "Elapsed", "%",
        );

        for entry in &self.entries {
            println!(
                "│{:<max_label_length$}  {} {}",
                entry.label,
                fmt_elapsed(entry.elapsed),
                fmt_progress(entry.elapsed, total_elapsed),
            );
        }

        println!(
            "{}",
            "─".repeat(1 + max_label_length + 2 + ELAPSED_WIDTH + 1 + PROGRESS_WIDTH),
        );
        println!(
            "T{:<max_label_length$}  {} {}",
            "otal",
            fmt_elapsed(total_elapsed),
            fmt_progress(total_elapsed, total_elapsed)
        );
        println!();
    }
}

pub struct Timer(String, Instant);

impl Timer {
    pub fn label(&self) -> &str {
        &self.0
    }
}

/// Format a template of `000h00m00.00s`, removing
/// leading zeros for spaces if the duration is
/// too small
pub fn fmt_elapsed(duration: Duration) -> String {
    let total_seconds = duration.as_secs_f32();
    let total_minutes = total_seconds as u64 / 60;
    let total_hours = total_minutes / 60;

    // Only pad zeros if next unit exists
    let seconds = if total_minutes >= 1 {
        format!("{:0>5.2}s", total_seconds % 60.0)
    } else {
        format!("{:>5.2}s", total_seconds % 60.0)
    };

    let minutes = if total_minutes >= 1 {
        // Only pad zeros if next unit exists
        if total_hours >= 1 {
            format!("{:0>2}m", total_minutes % 60)
        } else {
            format!("{:>2}m", total_minutes % 60)
        }
    } else {
        " ".repeat(3)
    };

    let hours = if total_hours >= 1 {
        format!("{total_hours:>3}h")
    } else {
        " ".repeat(4)
    };

    format!("{hours}{minutes}{seconds}")
}

fn fmt_progress(elapsed: Duration, total: Duration) -> String {
    let pct = elapsed.as_secs_f32() / total.as_secs_f32() * 100.0;

    format!("{pct:>5.1}%")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(fmt_elapsed(Duration::from_secs_f32(2.5)), "        2.50s");
        assert_eq!(fmt_elapsed(Duration::from_secs(90)), "     1m30.00s");
        assert_eq!(fmt_elapsed(Duration::from_secs(3600 + 30 * 60 + 15)), "  1h30m15.00s");
    }

    #[test]
    fn progress_formatting() {
        assert_eq!(
            fmt_progress(Duration::from_secs(25), Duration::from_secs(100)),
            " 25.0%"
        );
    }

    #[test]
    fn totals_accumulate_in_order() {
        let mut timing = Timing::default();

        let outer = timing.begin("bwa");
        let inner = timing.begin("sort");
        timing.finish(inner);
        timing.finish(outer);

        assert_eq!(timing.entries.len(), 2);
        assert_eq!(timing.entries[0].label, "sort");
        assert_eq!(timing.entries[1].label, "bwa");
        assert!(timing.total() >= timing.entries[0].elapsed);
    }
}
