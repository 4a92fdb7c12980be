//! Build timing utilities.

use std::time::Instant;

/// A simple timer for measuring pipeline step durations.
#[derive(Debug)]
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given step name.
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    /// Finish the timer and log the elapsed time.
    pub fn finish(self) {
        tracing::info!(step = %self.name, elapsed = %format_elapsed(self.start.elapsed().as_secs_f64()), "step complete");
    }
}

/// Render seconds the way build logs show them: `[1.2s]` or `[3.4m]`.
pub fn format_elapsed(secs: f64) -> String {
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
