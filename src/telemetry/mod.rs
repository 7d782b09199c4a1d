//! Telemetry for Atelier
//!
//! Two halves: `init_tracing` installs the process-wide `tracing` subscriber,
//! and `TelemetryCollector` keeps in-process counters of worker and pipeline
//! events that the CLI can summarise.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::errors::{AtelierError, Result};
use crate::tasks::types::{ErrorKind, TaskId};

/// Events kept in memory before the oldest are dropped
const MAX_EVENTS: usize = 1000;

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins over the configured level. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| AtelierError::Config(format!("invalid log level {:?}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| AtelierError::Config(format!("failed to install tracing subscriber: {}", e)))
}

/// Telemetry event types
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    // Worker events
    TaskStarted {
        task_id: TaskId,
        task: String,
        attempt: u32,
        timestamp: Instant,
    },
    TaskSucceeded {
        task_id: TaskId,
        task: String,
        duration_ms: u64,
        timestamp: Instant,
    },
    TaskFailed {
        task_id: TaskId,
        task: String,
        kind: ErrorKind,
        duration_ms: u64,
        timestamp: Instant,
    },
    TaskRetried {
        task_id: TaskId,
        task: String,
        attempt: u32,
        countdown_ms: u64,
        timestamp: Instant,
    },
    TaskTimedOut {
        task_id: TaskId,
        task: String,
        limit_ms: u64,
        timestamp: Instant,
    },
    TaskRevoked {
        task_id: TaskId,
        timestamp: Instant,
    },

    // Pipeline events
    RetrievalFallback {
        reason: String,
        timestamp: Instant,
    },
    GenerationFallback {
        reason: String,
        timestamp: Instant,
    },
}

/// Telemetry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub tasks_started: usize,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub tasks_retried: usize,
    pub tasks_timed_out: usize,
    pub tasks_revoked: usize,
    pub retrieval_fallbacks: usize,
    pub generation_fallbacks: usize,
}

/// Telemetry collector
#[derive(Clone)]
pub struct TelemetryCollector {
    events: Arc<Mutex<VecDeque<TelemetryEvent>>>,
    stats: Arc<Mutex<TelemetryStats>>,
    start_time: Instant,
}

// A panic while holding one of these locks leaves plain counters behind,
// which are still safe to read.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryCollector {
    /// Create a new telemetry collector
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(Mutex::new(TelemetryStats::default())),
            start_time: Instant::now(),
        }
    }

    /// Record an event
    pub fn record(&self, event: TelemetryEvent) {
        {
            let mut stats = relock(&self.stats);
            match &event {
                TelemetryEvent::TaskStarted { .. } => stats.tasks_started += 1,
                TelemetryEvent::TaskSucceeded { .. } => stats.tasks_succeeded += 1,
                TelemetryEvent::TaskFailed { .. } => stats.tasks_failed += 1,
                TelemetryEvent::TaskRetried { .. } => stats.tasks_retried += 1,
                TelemetryEvent::TaskTimedOut { .. } => stats.tasks_timed_out += 1,
                TelemetryEvent::TaskRevoked { .. } => stats.tasks_revoked += 1,
                TelemetryEvent::RetrievalFallback { .. } => stats.retrieval_fallbacks += 1,
                TelemetryEvent::GenerationFallback { .. } => stats.generation_fallbacks += 1,
            }
        }

        let mut events = relock(&self.events);
        if events.len() == MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Get current statistics
    pub fn get_stats(&self) -> TelemetryStats {
        relock(&self.stats).clone()
    }

    /// Get elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get event count (bounded by the retention window)
    pub fn event_count(&self) -> usize {
        relock(&self.events).len()
    }

    /// Get recent events (last n)
    pub fn recent_events(&self, n: usize) -> Vec<TelemetryEvent> {
        let events = relock(&self.events);
        let start = events.len().saturating_sub(n);
        events.iter().skip(start).cloned().collect()
    }

    /// Share of finished tasks that succeeded
    pub fn task_success_rate(&self) -> f64 {
        let stats = relock(&self.stats);
        let total = stats.tasks_succeeded + stats.tasks_failed;
        if total == 0 {
            1.0
        } else {
            stats.tasks_succeeded as f64 / total as f64
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("stats", &self.get_stats())
            .finish()
    }
}

/// Simple telemetry display
pub struct TelemetryDisplay {
    collector: TelemetryCollector,
}

impl TelemetryDisplay {
    pub fn new(collector: TelemetryCollector) -> Self {
        Self { collector }
    }

    /// Summary lines for the end of a CLI run
    pub fn summary_lines(&self) -> Vec<String> {
        let stats = self.collector.get_stats();
        vec![
            format!("Duration:          {:?}", self.collector.elapsed()),
            format!("Tasks started:     {}", stats.tasks_started),
            format!(
                "Success rate:      {:.1}%",
                self.collector.task_success_rate() * 100.0
            ),
            format!("Retries:           {}", stats.tasks_retried),
            format!("Timeouts:          {}", stats.tasks_timed_out),
            format!(
                "Fallbacks:         {} retrieval, {} generation",
                stats.retrieval_fallbacks, stats.generation_fallbacks
            ),
        ]
    }

    /// Display summary statistics
    pub fn display_summary(&self) {
        eprintln!("\nSession Summary");
        eprintln!("─────────────────────────────────────");
        for line in self.summary_lines() {
            eprintln!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(task_id: TaskId) -> TelemetryEvent {
        TelemetryEvent::TaskStarted {
            task_id,
            task: "hello_task".to_string(),
            attempt: 1,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_collector_creation() {
        let collector = TelemetryCollector::new();
        assert_eq!(collector.event_count(), 0);
        assert_eq!(collector.get_stats(), TelemetryStats::default());
    }

    #[test]
    fn test_record_task_events() {
        let collector = TelemetryCollector::new();
        let id = TaskId::new();

        collector.record(started(id));
        collector.record(TelemetryEvent::TaskSucceeded {
            task_id: id,
            task: "hello_task".to_string(),
            duration_ms: 12,
            timestamp: Instant::now(),
        });

        let stats = collector.get_stats();
        assert_eq!(stats.tasks_started, 1);
        assert_eq!(stats.tasks_succeeded, 1);
        assert_eq!(stats.tasks_failed, 0);
        assert_eq!(collector.event_count(), 2);
    }

    #[test]
    fn test_task_success_rate() {
        let collector = TelemetryCollector::new();
        assert_eq!(collector.task_success_rate(), 1.0);

        for _ in 0..2 {
            collector.record(TelemetryEvent::TaskSucceeded {
                task_id: TaskId::new(),
                task: "t".to_string(),
                duration_ms: 1,
                timestamp: Instant::now(),
            });
        }
        collector.record(TelemetryEvent::TaskFailed {
            task_id: TaskId::new(),
            task: "t".to_string(),
            kind: ErrorKind::Timeout,
            duration_ms: 1,
            timestamp: Instant::now(),
        });

        let rate = collector.task_success_rate();
        assert!((rate - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_event_log_is_bounded() {
        let collector = TelemetryCollector::new();
        for _ in 0..(MAX_EVENTS + 10) {
            collector.record(started(TaskId::new()));
        }
        assert_eq!(collector.event_count(), MAX_EVENTS);
        assert_eq!(collector.get_stats().tasks_started, MAX_EVENTS + 10);
    }

    #[test]
    fn test_recent_events() {
        let collector = TelemetryCollector::new();
        let last = TaskId::new();
        for _ in 0..9 {
            collector.record(started(TaskId::new()));
        }
        collector.record(started(last));

        let recent = collector.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert!(matches!(recent[2], TelemetryEvent::TaskStarted { task_id, .. } if task_id == last));
    }

    #[test]
    fn test_fallback_counters() {
        let collector = TelemetryCollector::new();
        collector.record(TelemetryEvent::RetrievalFallback {
            reason: "index down".to_string(),
            timestamp: Instant::now(),
        });
        collector.record(TelemetryEvent::GenerationFallback {
            reason: "HTTP 429".to_string(),
            timestamp: Instant::now(),
        });

        let stats = collector.get_stats();
        assert_eq!(stats.retrieval_fallbacks, 1);
        assert_eq!(stats.generation_fallbacks, 1);
    }

    #[test]
    fn test_summary_lines() {
        let collector = TelemetryCollector::new();
        collector.record(started(TaskId::new()));
        let display = TelemetryDisplay::new(collector);
        let lines = display.summary_lines();
        assert!(lines.iter().any(|l| l.contains("Tasks started:     1")));
    }
}
