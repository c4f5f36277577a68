use std::sync::{Arc, Mutex};

use crate::routecache::PendingStats;

/// Host callback receiving the rendered status line.
pub type StatusFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct Board {
    phase: Option<String>,
    stats: Option<PendingStats>,
}

impl Board {
    fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(phase) = &self.phase {
            parts.push(phase.clone());
        }
        if let Some(stats) = &self.stats {
            parts.push(format!(
                "{} unsent tracks totalling {} unsent datapoints",
                stats.unsent_tracks, stats.unsent_datapoints
            ));
        }
        parts.join(", ")
    }
}

/// Combines the connection phase and the pending volume into one
/// human-readable line, forwarding every change to the host callback.
#[derive(Clone)]
pub struct StatusReporter {
    board: Arc<Mutex<Board>>,
    sink: Option<StatusFn>,
}

impl StatusReporter {
    pub fn new(sink: Option<StatusFn>) -> Self {
        Self {
            board: Arc::new(Mutex::new(Board::default())),
            sink,
        }
    }

    pub fn set_phase(&self, phase: impl Into<String>) {
        let rendered = {
            let mut board = self.board.lock().unwrap_or_else(|e| e.into_inner());
            board.phase = Some(phase.into());
            board.render()
        };
        self.publish(&rendered);
    }

    /// Returns true when the statistics differ from the last reported ones.
    pub fn set_stats(&self, stats: PendingStats) -> bool {
        let rendered = {
            let mut board = self.board.lock().unwrap_or_else(|e| e.into_inner());
            if board.stats == Some(stats) {
                return false;
            }
            board.stats = Some(stats);
            board.render()
        };
        self.publish(&rendered);
        true
    }

    pub fn current(&self) -> String {
        self.board
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .render()
    }

    fn publish(&self, status: &str) {
        if let Some(sink) = &self.sink {
            sink(status);
        }
    }
}
