//! Per-execution log retention.
//!
//! Log chunks relayed from worker sessions land here in arrival order
//! (the session guarantees per-execution causal order). Each execution
//! gets a bounded line buffer; overflow drops the oldest lines and is
//! never silent: the tail reports how many lines were lost.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::ids::ExecutionId;
use crate::protocol::LogStreamKind;

/// Bounded log buffer for one execution.
#[derive(Debug, Default)]
struct ExecutionLog {
    lines: VecDeque<String>,
    dropped: u64,
}

/// Collects and bounds execution logs.
pub struct LogSink {
    buffers: DashMap<ExecutionId, ExecutionLog>,
    max_lines: usize,
}

impl LogSink {
    /// Creates a sink retaining at most `max_lines` lines per execution.
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            max_lines: max_lines.max(1),
        }
    }

    /// Appends a log chunk for an execution.
    pub fn push(&self, execution_id: &ExecutionId, stream: LogStreamKind, content: &[u8]) {
        let tag = match stream {
            LogStreamKind::Stdout => "stdout",
            LogStreamKind::Stderr => "stderr",
        };
        let text = String::from_utf8_lossy(content);

        let mut buffer = self.buffers.entry(execution_id.clone()).or_default();
        for line in text.lines() {
            buffer.lines.push_back(format!("[{tag}] {line}"));
            while buffer.lines.len() > self.max_lines {
                buffer.lines.pop_front();
                buffer.dropped += 1;
            }
        }
    }

    /// Returns the last `n` retained lines, prefixed with a drop marker
    /// when earlier lines were lost.
    pub fn tail(&self, execution_id: &ExecutionId, n: usize) -> Vec<String> {
        let buffer = match self.buffers.get(execution_id) {
            Some(buffer) => buffer,
            None => return Vec::new(),
        };

        let skip = buffer.lines.len().saturating_sub(n);
        let mut tail: Vec<String> = Vec::with_capacity(n + 1);
        if buffer.dropped > 0 || skip > 0 {
            let hidden = buffer.dropped + skip as u64;
            tail.push(format!("[log-dropped] {hidden} earlier log lines not shown"));
        }
        tail.extend(buffer.lines.iter().skip(skip).cloned());
        tail
    }

    /// Number of lines lost to the buffer bound for an execution.
    pub fn dropped(&self, execution_id: &ExecutionId) -> u64 {
        self.buffers
            .get(execution_id)
            .map(|buffer| buffer.dropped)
            .unwrap_or(0)
    }

    /// Discards the buffer of a finished execution and returns its tail.
    pub fn take(&self, execution_id: &ExecutionId, n: usize) -> Vec<String> {
        let tail = self.tail(execution_id, n);
        self.buffers.remove(execution_id);
        tail
    }
}
