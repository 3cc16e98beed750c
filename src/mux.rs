/// Bounded-timeout multiplexed line reader over a child's two output streams.
///
/// One background task per stream moves complete lines into a bounded queue;
/// `read_one` polls both queues on a short quantum until the deadline, giving
/// the primary stream strict priority within each iteration.
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Lines buffered per stream before the reader task backpressures.
const LINE_QUEUE_DEPTH: usize = 64;

/// Floor for the poll quantum; a zero quantum would busy-spin `read_one`.
const MIN_POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Which of the child's two output streams produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    /// Main output channel, expected to carry structured protocol responses.
    Primary,
    /// Secondary output channel, expected to carry human-readable log text.
    Diagnostic,
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTag::Primary => write!(f, "stdout"),
            StreamTag::Diagnostic => write!(f, "stderr"),
        }
    }
}

/// One complete line observed on a stream. Immutable after creation.
#[derive(Debug, Clone)]
pub struct LineEvent {
    pub source: StreamTag,
    /// Line text without the trailing newline (or CRLF).
    pub text: String,
    pub observed_at: Instant,
}

/// Receiving end of one stream's line queue.
///
/// `closed` latches once the reader task has ended (EOF or read error) and
/// the queue is drained; the lane is then permanently not-ready.
struct StreamLane {
    rx: mpsc::Receiver<String>,
    closed: bool,
}

impl StreamLane {
    fn spawn<R>(tag: StreamTag, source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut reader = BufReader::new(source);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        tracing::debug!(stream = %tag, "stream reached EOF");
                        break;
                    }
                    Ok(_) => {
                        if !line.ends_with('\n') {
                            // Unterminated fragment at EOF; never surfaced.
                            tracing::debug!(
                                stream = %tag,
                                bytes = line.len(),
                                "discarding unterminated fragment"
                            );
                            break;
                        }
                        let text = line.trim_end_matches(['\n', '\r']).to_string();
                        if tx.send(text).await.is_err() {
                            // Mux dropped, nobody is listening.
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            stream = %tag,
                            error = %e,
                            "stream read error, demoting to not-ready"
                        );
                        break;
                    }
                }
            }
        });
        Self { rx, closed: false }
    }

    /// Non-blocking check for a queued line.
    fn poll_line(&mut self) -> Option<String> {
        if self.closed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(text) => Some(text),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }
}

/// Multiplexes two readable streams into a sequence of tagged line events.
///
/// Concurrent `read_one` calls against the same pair would race on queue
/// consumption; the `&mut self` receiver serializes them at compile time.
pub struct LineMux {
    primary: StreamLane,
    diagnostic: StreamLane,
    quantum: Duration,
}

impl LineMux {
    /// `quantum` bounds how long a single poll iteration may sleep; it
    /// should be small relative to the timeouts passed to `read_one`.
    /// Clamped to a 1 ms floor.
    pub fn new<P, D>(primary: P, diagnostic: D, quantum: Duration) -> Self
    where
        P: AsyncRead + Unpin + Send + 'static,
        D: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            primary: StreamLane::spawn(StreamTag::Primary, primary),
            diagnostic: StreamLane::spawn(StreamTag::Diagnostic, diagnostic),
            quantum: quantum.max(MIN_POLL_QUANTUM),
        }
    }

    /// Return the first complete line from either stream, or `None` once
    /// `timeout` elapses with nothing ready.
    ///
    /// The primary stream wins whenever both have a line queued in the same
    /// iteration. A stream that hits EOF or a read error stays silent for the
    /// rest of the call; the other keeps being polled. Worst-case return time
    /// is `timeout` plus one quantum of slack.
    pub async fn read_one(&mut self, timeout: Duration) -> Option<LineEvent> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(text) = self.primary.poll_line() {
                return Some(LineEvent {
                    source: StreamTag::Primary,
                    text,
                    observed_at: Instant::now(),
                });
            }
            if let Some(text) = self.diagnostic.poll_line() {
                return Some(LineEvent {
                    source: StreamTag::Diagnostic,
                    text,
                    observed_at: Instant::now(),
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.quantum.min(remaining)).await;
        }
        None
    }

    /// True once both streams have closed and their queues are drained.
    pub fn exhausted(&self) -> bool {
        self.primary.closed && self.diagnostic.closed
    }
}
