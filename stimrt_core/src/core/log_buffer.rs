use crate::communication::FrameQueue;
use crate::error::{StimError, StimResult};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Region name of the session's log queue
pub const LOG_QUEUE_REGION: &str = "logs";
pub const LOG_QUEUE_BYTES: usize = 1024 * 1024;

/// One log line produced by a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Wall-clock time, `%H:%M:%S%.3f`
    pub time: String,
    pub process: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(process: &str, level: log::Level, target: &str, message: impl Into<String>) -> Self {
        Self {
            time: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
            process: process.to_string(),
            level: level.to_string(),
            target: target.to_string(),
            message: message.into(),
        }
    }

    pub fn level(&self) -> log::Level {
        self.level.parse().unwrap_or(log::Level::Info)
    }

    /// Colored single-line rendering for console output
    pub fn render(&self) -> String {
        let level = match self.level() {
            log::Level::Error => "[ERROR]".red().bold(),
            log::Level::Warn => "[WARN]".yellow(),
            log::Level::Info => "[INFO]".blue(),
            log::Level::Debug => "[DEBUG]".bright_black(),
            log::Level::Trace => "[TRACE]".bright_black(),
        };
        format!(
            "{} {} {} {}",
            format!("[{}]", self.time).cyan(),
            level,
            format!("[{}]", self.process).yellow(),
            self.message
        )
    }
}

/// Many-producer, single-consumer queue of log records shared by a session.
///
/// Publishing never blocks; when the queue is full the record is dropped and
/// counted in the shared header.
#[derive(Debug, Clone)]
pub struct SharedLogQueue {
    queue: Arc<FrameQueue>,
}

impl SharedLogQueue {
    pub fn create(dir: &Path) -> StimResult<Self> {
        Ok(Self {
            queue: Arc::new(FrameQueue::create(dir, LOG_QUEUE_REGION, LOG_QUEUE_BYTES)?),
        })
    }

    pub fn open(dir: &Path) -> StimResult<Self> {
        Ok(Self {
            queue: Arc::new(FrameQueue::open(dir, LOG_QUEUE_REGION)?),
        })
    }

    pub fn publish(&self, record: &LogRecord) -> StimResult<()> {
        let frame = serde_json::to_vec(record)?;
        self.queue.push(&frame)
    }

    /// Publish without failing; a full queue only costs the record.
    ///
    /// Any other failure is reported on stderr, since this path may itself be
    /// the process's logger.
    pub fn publish_or_drop(&self, record: &LogRecord) {
        match self.publish(record) {
            Ok(()) | Err(StimError::ChannelFull(_)) => {}
            Err(e) => eprintln!(
                "stimrt: log record from {} lost: {} ({})",
                record.process, e, record.message
            ),
        }
    }

    /// Convenience for publishing a plain message
    pub fn emit(&self, process: &str, level: log::Level, message: impl Into<String>) {
        self.publish_or_drop(&LogRecord::new(process, level, "stimrt", message));
    }

    /// Records dropped on a full queue, across every producer of the session
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Take every queued record without blocking
    pub fn drain(&self) -> Vec<LogRecord> {
        self.queue
            .drain()
            .into_iter()
            .filter_map(|frame| serde_json::from_slice(&frame).ok())
            .collect()
    }
}

/// `log::Log` implementation forwarding records into the shared queue.
///
/// Installed by participant processes spawned as separate OS processes, so
/// their output reaches the Controller's console.
pub struct SharedLogger {
    process: String,
    queue: SharedLogQueue,
    level: log::LevelFilter,
}

impl SharedLogger {
    pub fn new(process: impl Into<String>, queue: SharedLogQueue, level: log::LevelFilter) -> Self {
        Self {
            process: process.into(),
            queue,
            level,
        }
    }

    /// Install as the global logger of this process
    pub fn install(self) -> StimResult<()> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))
            .map_err(|e| crate::error::StimError::Internal(format!("logger already set: {}", e)))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl log::Log for SharedLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = LogRecord::new(
            &self.process,
            record.level(),
            record.target(),
            record.args().to_string(),
        );
        self.queue.publish_or_drop(&entry);
    }

    fn flush(&self) {}
}
