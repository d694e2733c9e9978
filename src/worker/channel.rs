//! Request/response channel over a worker's stdio pipes.
//!
//! One JSON envelope per line. At most one exchange is in flight per
//! channel: the IO half is behind an async mutex and each caller holds it
//! from write until its response line has been read. Correlation ids are
//! assigned under that lock, so the worker sees strictly increasing ids.
//!
//! An exchange abandoned by a timeout (or by a dropped caller) after its
//! command went out can leave a late response in the pipe, possibly half
//! read. Reads go through `read_until`, so the partial bytes stay buffered
//! and the next read completes the line. Such lines carry an older id and
//! are skipped. Lines without an id cannot be matched, so after an
//! abandoned exchange they are treated as a loss of sync.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use gpu_orchestrator_types::{
    Command, Envelope, MessageKind, Operation, ProtocolGeneration, ResponsePayload, WireResponse,
};
use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::error::{ProtocolError, WorkerError};

/// Channel over a spawned worker's pipes.
pub type PipeChannel = MessageChannel<ChildStdin, BufReader<ChildStdout>>;

const PREVIEW_CHARS: usize = 120;

struct ChannelIo<W, R> {
    writer: Option<W>,
    reader: R,
    line: Vec<u8>,
    /// Set while an exchange is between write and read. Still set when the
    /// next caller takes the lock means the previous one was dropped.
    in_exchange: bool,
}

pub struct MessageChannel<W, R> {
    label: String,
    io: Mutex<ChannelIo<W, R>>,
    next_id: AtomicU64,
    sent: AtomicU64,
    suspect: AtomicBool,
    closed: AtomicBool,
}

impl<W, R> MessageChannel<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(label: impl Into<String>, writer: W, reader: R) -> Self {
        Self {
            label: label.into(),
            io: Mutex::new(ChannelIo {
                writer: Some(writer),
                reader,
                line: Vec::new(),
                in_exchange: false,
            }),
            next_id: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            suspect: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Commands fully written to the worker.
    pub fn commands_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// True after an abandoned exchange until a correlated response arrives.
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.io.try_lock().is_err()
    }

    /// Write `command` and wait up to `deadline` for its response.
    ///
    /// The wait covers queueing behind other callers as well as the
    /// worker's processing time.
    pub async fn send(
        &self,
        command: &Command,
        deadline: Duration,
    ) -> Result<WireResponse, WorkerError> {
        let operation = command.operation();
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::protocol(operation, ProtocolError::Closed));
        }

        let written = AtomicBool::new(false);
        match tokio::time::timeout(deadline, self.exchange(command, &written)).await {
            Ok(result) => result.map_err(|source| WorkerError::protocol(operation, source)),
            Err(_) => {
                // A caller still queued for the pipes leaves nothing behind.
                if written.load(Ordering::SeqCst) {
                    self.suspect.store(true, Ordering::SeqCst);
                }
                warn!(
                    "[CHANNEL {}] '{operation}' timed out after {}ms",
                    self.label,
                    deadline.as_millis()
                );
                Err(WorkerError::Timeout {
                    operation: operation.to_string(),
                    timeout: deadline,
                })
            }
        }
    }

    async fn exchange(
        &self,
        command: &Command,
        written: &AtomicBool,
    ) -> Result<WireResponse, ProtocolError> {
        let mut io = self.io.lock().await;
        if io.in_exchange {
            warn!("[CHANNEL {}] Previous exchange was abandoned", self.label);
            self.suspect.store(true, Ordering::SeqCst);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let envelope = command
            .to_envelope(Some(id))
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut line =
            serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        line.push('\n');

        io.in_exchange = true;
        written.store(true, Ordering::SeqCst);
        let writer = io.writer.as_mut().ok_or(ProtocolError::Closed)?;
        writer.write_all(line.as_bytes()).await.map_err(pipe_error)?;
        writer.flush().await.map_err(pipe_error)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        debug!("[CHANNEL {}] -> {} id={id}", self.label, command.operation());

        let result = self.read_response(&mut io, id, command.operation()).await;
        io.in_exchange = false;
        result
    }

    async fn read_response(
        &self,
        io: &mut ChannelIo<W, R>,
        id: u64,
        operation: Operation,
    ) -> Result<WireResponse, ProtocolError> {
        loop {
            // Cancel safe: a read cut short keeps its bytes in `io.line`.
            let read = io
                .reader
                .read_until(b'\n', &mut io.line)
                .await
                .map_err(pipe_error)?;
            let raw = std::mem::take(&mut io.line);
            if read == 0 && raw.is_empty() {
                return Err(ProtocolError::StreamClosed);
            }
            let text = std::str::from_utf8(&raw)
                .map_err(|e| ProtocolError::Malformed(format!("invalid UTF-8: {e}")))?
                .trim();
            if text.is_empty() {
                return Err(ProtocolError::EmptyResponse);
            }
            let envelope: Envelope = serde_json::from_str(text)
                .map_err(|e| ProtocolError::Malformed(format!("{e}: {}", preview(text))))?;

            match envelope.kind {
                MessageKind::Event => {
                    debug!("[CHANNEL {}] event for '{}'", self.label, envelope.operation);
                    continue;
                }
                MessageKind::Request => {
                    return Err(ProtocolError::UnexpectedMessage(format!(
                        "request envelope for '{}'",
                        envelope.operation
                    )));
                }
                MessageKind::Response | MessageKind::Error => {}
            }

            match envelope.id {
                Some(got) if got < id => {
                    warn!(
                        "[CHANNEL {}] Discarding late response id={got} for '{}'",
                        self.label, envelope.operation
                    );
                    continue;
                }
                Some(got) if got > id => {
                    return Err(ProtocolError::CorrelationMismatch { expected: id, got });
                }
                Some(_) => self.suspect.store(false, Ordering::SeqCst),
                None if self.is_suspect() => return Err(ProtocolError::Desynchronized),
                None => {}
            }

            if envelope.operation != operation.as_str() {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "response for '{}' while waiting for '{operation}'",
                    envelope.operation
                )));
            }

            return decode_response(envelope);
        }
    }

    /// Close the write side so the worker sees EOF. Gives up after `wait`
    /// if another exchange is still holding the pipes.
    pub async fn close(&self, wait: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        match tokio::time::timeout(wait, self.io.lock()).await {
            Ok(mut io) => {
                if let Some(mut writer) = io.writer.take() {
                    let _ = writer.shutdown().await;
                }
                true
            }
            Err(_) => {
                debug!("[CHANNEL {}] Pipes busy, leaving stdin to the kill", self.label);
                false
            }
        }
    }
}

/// Turn a response or error envelope into a [`WireResponse`].
pub fn decode_response(envelope: Envelope) -> Result<WireResponse, ProtocolError> {
    let generation = ProtocolGeneration::from_version(&envelope.version);
    let is_error = envelope.kind == MessageKind::Error;
    let mut payload = match serde_json::from_value::<ResponsePayload>(envelope.payload.clone()) {
        Ok(payload) => payload,
        // Error envelopes sometimes carry a bare message instead of a payload.
        Err(_) if is_error => ResponsePayload::failure(match &envelope.payload {
            serde_json::Value::String(message) => message.clone(),
            other => other.to_string(),
        }),
        Err(e) => {
            return Err(ProtocolError::Malformed(format!(
                "bad payload for '{}': {e}",
                envelope.operation
            )))
        }
    };
    if is_error {
        payload.success = false;
    }
    Ok(WireResponse {
        operation: envelope.operation,
        id: envelope.id,
        generation,
        payload,
    })
}

fn pipe_error(e: std::io::Error) -> ProtocolError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
            ProtocolError::StreamClosed
        }
        _ => ProtocolError::Io(e.to_string()),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_orchestrator_types::{ProtocolGeneration, WorkerCommand};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type TestChannel = MessageChannel<WriteHalf<DuplexStream>, BufReader<ReadHalf<DuplexStream>>>;

    /// Orchestrator-side channel plus the worker-side line reader and writer.
    fn pair() -> (
        TestChannel,
        BufReader<ReadHalf<DuplexStream>>,
        WriteHalf<DuplexStream>,
    ) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        (
            MessageChannel::new("test", our_write, BufReader::new(our_read)),
            BufReader::new(their_read),
            their_write,
        )
    }

    fn status() -> Command {
        Command::new(WorkerCommand::Status, ProtocolGeneration::Enhanced)
    }

    async fn next_request(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Envelope {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn write_line(writer: &mut WriteHalf<DuplexStream>, value: serde_json::Value) {
        let mut line = value.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn reply(writer: &mut WriteHalf<DuplexStream>, request: &Envelope, data: serde_json::Value) {
        let envelope = Envelope::reply_to(request, &ResponsePayload::ok(data));
        write_line(writer, serde_json::to_value(&envelope).unwrap()).await;
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_response_is_correlated_and_counted() {
        let (channel, mut reader, mut writer) = pair();
        let worker = tokio::spawn(async move {
            let request = next_request(&mut reader).await;
            assert_eq!(request.kind, MessageKind::Request);
            assert_eq!(request.operation, "status");
            assert_eq!(request.version, "2.0");
            reply(&mut writer, &request, json!({"uptime_s": 1.0})).await;
            request.id
        });

        let response = channel.send(&status(), WAIT).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.data().unwrap()["uptime_s"], 1.0);
        assert_eq!(response.generation, Some(ProtocolGeneration::Enhanced));
        assert_eq!(response.id, worker.await.unwrap());
        assert_eq!(channel.commands_sent(), 1);
    }

    #[tokio::test]
    async fn test_error_envelope_becomes_failed_response() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let request = next_request(&mut reader).await;
            let envelope = Envelope::reply_to(&request, &ResponsePayload::failure("CUDA out of memory"));
            write_line(&mut writer, serde_json::to_value(&envelope).unwrap()).await;
        });

        let response = channel.send(&status(), WAIT).await.unwrap();
        assert!(!response.is_success());
        assert_eq!(response.error_message(), "CUDA out of memory");
    }

    #[tokio::test]
    async fn test_malformed_line_is_a_protocol_error() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let _ = next_request(&mut reader).await;
            writer.write_all(b"Traceback (most recent call last):\n").await.unwrap();
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::Malformed(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_line_is_a_protocol_error() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let _ = next_request(&mut reader).await;
            writer.write_all(b"\n").await.unwrap();
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::EmptyResponse, .. }
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_is_reported() {
        let (channel, mut reader, writer) = pair();
        tokio::spawn(async move {
            let _ = next_request(&mut reader).await;
            drop(writer);
            drop(reader);
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::StreamClosed, .. }
        ));
    }

    #[tokio::test]
    async fn test_events_are_skipped() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let request = next_request(&mut reader).await;
            let event = Envelope::event(&request, json!({"progress": 0.5}));
            write_line(&mut writer, serde_json::to_value(&event).unwrap()).await;
            reply(&mut writer, &request, json!({"done": true})).await;
        });

        let response = channel.send(&status(), WAIT).await.unwrap();
        assert_eq!(response.data().unwrap()["done"], true);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_discarded() {
        let (channel, mut reader, mut writer) = pair();

        let first = channel.send(&status(), Duration::from_millis(50)).await;
        assert!(matches!(first, Err(WorkerError::Timeout { .. })));
        assert!(channel.is_suspect());

        let worker = tokio::spawn(async move {
            let stale = next_request(&mut reader).await;
            let current = next_request(&mut reader).await;
            reply(&mut writer, &stale, json!({"which": "stale"})).await;
            reply(&mut writer, &current, json!({"which": "current"})).await;
        });

        let response = channel.send(&status(), WAIT).await.unwrap();
        assert_eq!(response.data().unwrap()["which"], "current");
        assert!(!channel.is_suspect());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_response_split_across_timeout_is_discarded() {
        let (channel, mut reader, mut writer) = pair();
        let (sent_head, head_written) = tokio::sync::oneshot::channel();
        let worker = tokio::spawn(async move {
            let stale = next_request(&mut reader).await;
            let envelope = Envelope::reply_to(&stale, &ResponsePayload::ok(json!({"which": "stale"})));
            let mut line = serde_json::to_string(&envelope).unwrap();
            line.push('\n');
            let (head, tail) = line.split_at(10);
            writer.write_all(head.as_bytes()).await.unwrap();
            sent_head.send(()).unwrap();

            let current = next_request(&mut reader).await;
            writer.write_all(tail.as_bytes()).await.unwrap();
            reply(&mut writer, &current, json!({"which": "current"})).await;
        });

        let first = channel.send(&status(), Duration::from_millis(100)).await;
        assert!(matches!(first, Err(WorkerError::Timeout { .. })));
        head_written.await.unwrap();

        let response = channel.send(&status(), WAIT).await.unwrap();
        assert_eq!(response.data().unwrap()["which"], "current");
        assert!(!channel.is_suspect());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let _ = next_request(&mut reader).await;
            writer.write_all(b"\xff\xfe{}\n").await.unwrap();
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::Malformed(ref m), .. } if m.contains("UTF-8")
        ));
    }

    #[tokio::test]
    async fn test_timeout_while_queued_does_not_mark_suspect() {
        let (channel, mut reader, mut writer) = pair();
        let channel = Arc::new(channel);
        let worker = tokio::spawn(async move {
            let first = next_request(&mut reader).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            reply(&mut writer, &first, json!({"which": "first"})).await;

            // This worker stops sending ids after the first reply.
            let _third = next_request(&mut reader).await;
            write_line(
                &mut writer,
                json!({"version": "2.0", "type": "response", "operation": "status", "payload": {"success": true, "data": {"which": "third"}}}),
            )
            .await;
        });

        let holder = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(&status(), WAIT).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = channel.send(&status(), Duration::from_millis(50)).await;
        assert!(matches!(queued, Err(WorkerError::Timeout { .. })));
        assert!(!channel.is_suspect());
        assert_eq!(channel.commands_sent(), 1);

        let first = holder.await.unwrap().unwrap();
        assert_eq!(first.data().unwrap()["which"], "first");
        let third = channel.send(&status(), WAIT).await.unwrap();
        assert_eq!(third.data().unwrap()["which"], "third");
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_id_free_line_after_timeout_is_desync() {
        let (channel, mut reader, mut writer) = pair();
        let first = channel.send(&status(), Duration::from_millis(50)).await;
        assert!(first.is_err());

        tokio::spawn(async move {
            let _stale = next_request(&mut reader).await;
            let _current = next_request(&mut reader).await;
            write_line(
                &mut writer,
                json!({"version": "2.0", "type": "response", "operation": "status", "payload": {"success": true}}),
            )
            .await;
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::Desynchronized, .. }
        ));
    }

    #[tokio::test]
    async fn test_future_id_is_a_mismatch() {
        let (channel, mut reader, mut writer) = pair();
        tokio::spawn(async move {
            let request = next_request(&mut reader).await;
            let mut envelope = Envelope::reply_to(&request, &ResponsePayload::ok(json!({})));
            envelope.id = request.id.map(|id| id + 5);
            write_line(&mut writer, serde_json::to_value(&envelope).unwrap()).await;
        });

        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::CorrelationMismatch { expected: 1, got: 6 }, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        let (channel, mut reader, mut writer) = pair();
        let channel = Arc::new(channel);

        // Answers each request only after checking nothing else was written
        // while it was outstanding.
        let worker = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..8 {
                let request = next_request(&mut reader).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(reader.buffer().is_empty(), "second request written before reply");
                reply(&mut writer, &request, json!({"echo": request.id})).await;
                seen.push(request.id.unwrap());
            }
            seen
        });

        let calls = (0..8).map(|_| {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(&status(), WAIT).await })
        });
        for call in futures_util::future::join_all(calls).await {
            let response = call.unwrap().unwrap();
            assert_eq!(response.data().unwrap()["echo"], json!(response.id));
        }

        let seen = worker.await.unwrap();
        assert_eq!(seen, (1..=8).collect::<Vec<u64>>());
        assert_eq!(channel.commands_sent(), 8);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_without_io() {
        let (channel, _reader, _writer) = pair();
        assert!(channel.close(Duration::from_millis(100)).await);
        let err = channel.send(&status(), WAIT).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol { source: ProtocolError::Closed, .. }
        ));
        assert_eq!(channel.commands_sent(), 0);
    }
}
