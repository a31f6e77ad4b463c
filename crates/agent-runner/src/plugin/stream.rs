//! Line framing and the streaming execution handle

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{extract_error_message, parse_json_line, ProtocolParser};
use crate::event::{join_text, DisplayEvent};
use crate::process::{OutputStream, ProcessResult, StreamingProcess};

/// Reassembles newline-delimited records from arbitrarily split chunks
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
    /// Prefix of `pending` already known to hold no newline
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(self.scanned + offset);
            self.pending.advance(1);
            self.scanned = 0;
            lines.push(decode_line(&line));
        }
        self.scanned = self.pending.len();
        lines
    }

    /// Trailing bytes after the last newline, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        self.scanned = 0;
        let line = decode_line(&rest);
        (!line.trim().is_empty()).then_some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.strip_suffix('\r').unwrap_or(&line).to_string()
}

/// Final outcome of one agent execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub process: ProcessResult,
    pub events: Vec<DisplayEvent>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.process.success
    }

    /// Concatenated assistant text
    pub fn text(&self) -> String {
        join_text(&self.events)
    }
}

/// A running agent execution.
///
/// Events can be consumed one by one with [`next_event`](Self::next_event)
/// while [`output_text`](Self::output_text) exposes the same events as text.
pub struct ExecutionHandle {
    events: mpsc::UnboundedReceiver<DisplayEvent>,
    seen: Arc<Mutex<Vec<DisplayEvent>>>,
    terminate_tx: Option<oneshot::Sender<()>>,
    result_rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn launch(process: StreamingProcess, parser: Box<dyn ProtocolParser>) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = EventSink {
            tx: event_tx,
            seen: Arc::clone(&seen),
        };
        tokio::spawn(async move {
            let result = drive(process, parser, sink, terminate_rx).await;
            let _ = result_tx.send(result);
        });

        Self {
            events,
            seen,
            terminate_tx: Some(terminate_tx),
            result_rx,
        }
    }

    /// Handle for an execution whose process could not be started
    pub(crate) fn failed(message: String) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let event = DisplayEvent::error(message.clone());
        let _ = event_tx.send(event.clone());
        let _ = result_tx.send(ExecutionResult {
            process: ProcessResult::spawn_failure(message),
            events: vec![event.clone()],
        });

        Self {
            events,
            seen: Arc::new(Mutex::new(vec![event])),
            terminate_tx: None,
            result_rx,
        }
    }

    /// Next parsed event; `None` once the agent's output is exhausted
    pub async fn next_event(&mut self) -> Option<DisplayEvent> {
        self.events.recv().await
    }

    /// Every event parsed so far
    pub fn events_so_far(&self) -> Vec<DisplayEvent> {
        self.seen.lock().clone()
    }

    /// Text of every event parsed so far
    pub fn output_text(&self) -> String {
        join_text(&self.seen.lock())
    }

    /// Stop the agent; the result still arrives through [`wait`](Self::wait)
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn wait(self) -> ExecutionResult {
        let seen = Arc::clone(&self.seen);
        self.result_rx.await.unwrap_or_else(|_| ExecutionResult {
            process: ProcessResult::spawn_failure("agent output reader exited unexpectedly"),
            events: seen.lock().clone(),
        })
    }
}

struct EventSink {
    tx: mpsc::UnboundedSender<DisplayEvent>,
    seen: Arc<Mutex<Vec<DisplayEvent>>>,
}

impl EventSink {
    fn emit(&self, events: Vec<DisplayEvent>) {
        for event in events {
            self.seen.lock().push(event.clone());
            // The consumer may only be waiting for the final result
            let _ = self.tx.send(event);
        }
    }
}

async fn drive(
    mut process: StreamingProcess,
    mut parser: Box<dyn ProtocolParser>,
    sink: EventSink,
    mut terminate_rx: oneshot::Receiver<()>,
) -> ExecutionResult {
    let mut buffer = LineBuffer::new();
    let mut terminate_open = true;

    loop {
        tokio::select! {
            chunk = process.next_chunk() => match chunk {
                Some(chunk) if chunk.stream == OutputStream::Stdout => {
                    for line in buffer.push(&chunk.data) {
                        sink.emit(parser.parse_line(&line));
                    }
                }
                // stderr is kept whole in the process result
                Some(_) => {}
                None => break,
            },
            request = &mut terminate_rx, if terminate_open => {
                terminate_open = false;
                if request.is_ok() {
                    process.terminate();
                }
            }
        }
    }

    if let Some(rest) = buffer.finish() {
        sink.emit(parser.parse_line(&rest));
    }
    sink.emit(parser.finish());

    let result = process.wait().await;
    if !result.success {
        debug!("Agent process failed: {:?}", result.error);
        sink.emit(vec![DisplayEvent::error(failure_message(&result))]);
    }

    let events = sink.seen.lock().clone();
    ExecutionResult {
        process: result,
        events,
    }
}

/// Describe a failed run, preferring what the agent itself printed on stderr
fn failure_message(result: &ProcessResult) -> String {
    let base = result
        .error
        .clone()
        .unwrap_or_else(|| "agent process failed".to_string());

    let detail = result
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| match parse_json_line(line) {
            Some(value) => extract_error_message(&value),
            None => line.to_string(),
        });

    match detail {
        Some(detail) if !result.timed_out => format!("{}: {}", base, detail),
        _ => base,
    }
}
