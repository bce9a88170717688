// =============================================================================
// Log Buffer — bounded ring of recent formatted log lines
// =============================================================================
//
// `GET /bot/status` returns the last 50 log lines alongside state and
// config. Rather than re-parse stdout, a `tracing_subscriber::Layer`
// captures each event's formatted line directly into a shared ring buffer at
// emit time, the same `parking_lot`-guarded-state idiom the rest of the
// engine uses for anything read by both the scheduler and the HTTP layer.
// =============================================================================

use std::collections::VecDeque;
use std::fmt::Write as _;

use parking_lot::Mutex;
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const MAX_LINES: usize = 50;

#[derive(Clone)]
pub struct LogBuffer {
    lines: std::sync::Arc<Mutex<VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            lines: std::sync::Arc::new(Mutex::new(VecDeque::with_capacity(MAX_LINES))),
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Oldest-first snapshot of the last `MAX_LINES` log lines.
    pub fn recent(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

struct LineVisitor {
    message: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else if !self.message.is_empty() {
            let _ = write!(self.message, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogBuffer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor { message: String::new() };
        event.record(&mut visitor);

        let now = chrono::Utc::now().to_rfc3339();
        let level = event.metadata().level();
        let target = event.metadata().target();
        self.push(format!("{now} {level} {target}: {}", visitor.message));
    }
}
