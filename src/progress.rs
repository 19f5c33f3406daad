use std::io::{self, Write};
use std::time::{Duration, Instant};

pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    /// Progress plus requests per second since `since`, followed by `detail`.
    pub fn rate(
        &self,
        label: &str,
        current: usize,
        total: usize,
        requests: usize,
        since: Instant,
        detail: &str,
    ) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let per_sec = requests_per_second(requests, since.elapsed());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[{ts}] {} | {per_sec:.2} req/s | {detail}",
            progress_line(label, current, total)
        );
    }
}

fn progress_line(label: &str, current: usize, total: usize) -> String {
    let total = total.max(1);
    let current = current.min(total);
    let pct = (current as f64 / total as f64) * 100.0;
    format!("{label} {current}/{total} ({pct:5.1}%)")
}

fn requests_per_second(requests: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return 0.0;
    }
    requests as f64 / secs
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
