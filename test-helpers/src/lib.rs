//! Common helper functions for tests and benchmarks.
//!
//! The centerpiece is [`MockTransport`], a scripted serial device: chunks
//! queued up front are returned by successive reads, and write-triggered
//! replies let tests model interactive exchanges (wake newlines, `enable`
//! answered with a password challenge, pager SPACE acknowledgements).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use switchboard::model::JobTarget;
use switchboard::render::Variables;
use switchboard::session::{SerialSession, Transport};

/// Shared record of everything written to a mock transport.
pub type WriteLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Decodes a write log entry as UTF-8 for assertions.
pub fn written_strings(log: &WriteLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(|w| String::from_utf8_lossy(w).into_owned())
        .collect()
}

/// Counts writes equal to `needle` (e.g. pager SPACE acknowledgements).
pub fn count_writes(log: &WriteLog, needle: &str) -> usize {
    written_strings(log).iter().filter(|w| w == &needle).count()
}

/// A scripted serial device.
///
/// Reads pop pre-queued chunks in order; an empty queue reads as "no data
/// yet" (like a serial read timeout). A write whose bytes contain the next
/// pending trigger substring queues that trigger's reply chunks.
pub struct MockTransport {
    pending: VecDeque<Vec<u8>>,
    replies: VecDeque<(String, Vec<Vec<u8>>)>,
    writes: WriteLog,
}

impl MockTransport {
    /// Transport that plays back `chunks` on successive reads.
    pub fn scripted(chunks: &[&str]) -> (MockTransport, WriteLog) {
        let writes: WriteLog = Arc::default();
        (
            MockTransport {
                pending: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                replies: VecDeque::new(),
                writes: Arc::clone(&writes),
            },
            writes,
        )
    }

    /// Transport that answers writes: when a write contains `trigger`, the
    /// associated chunks become readable. Triggers fire in order, once each.
    pub fn reactive(replies: &[(&str, &[&str])]) -> (MockTransport, WriteLog) {
        let writes: WriteLog = Arc::default();
        (
            MockTransport {
                pending: VecDeque::new(),
                replies: replies
                    .iter()
                    .map(|(trigger, chunks)| {
                        (
                            trigger.to_string(),
                            chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                        )
                    })
                    .collect(),
                writes: Arc::clone(&writes),
            },
            writes,
        )
    }

    /// Queues another readable chunk.
    pub fn push_chunk(&mut self, chunk: &str) {
        self.pending.push_back(chunk.as_bytes().to_vec());
    }
}

impl Transport for MockTransport {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.pending.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            // Hand back what fits; requeue the remainder.
            let rest = chunk.split_off(buf.len());
            self.pending.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writes.lock().unwrap().push(data.to_vec());
        if let Some((trigger, _)) = self.replies.front() {
            if String::from_utf8_lossy(data).contains(trigger.as_str()) {
                let (_, chunks) = self.replies.pop_front().expect("front checked above");
                self.pending.extend(chunks);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A connected session over a scripted transport.
pub fn scripted_session(chunks: &[&str]) -> (SerialSession, WriteLog) {
    let (transport, writes) = MockTransport::scripted(chunks);
    (
        SerialSession::with_transport("mock", Box::new(transport)),
        writes,
    )
}

/// A connected session over a reactive transport.
pub fn reactive_session(replies: &[(&str, &[&str])]) -> (SerialSession, WriteLog) {
    let (transport, writes) = MockTransport::reactive(replies);
    (
        SerialSession::with_transport("mock", Box::new(transport)),
        writes,
    )
}

/// Variables map from literal pairs.
pub fn vars(pairs: &[(&str, &str)]) -> Variables {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}

/// A queued target for job tests.
pub fn target(port: &str, variables: Variables) -> JobTarget {
    JobTarget::new(port, variables)
}

/// Records the status transitions a target goes through, for monotonicity
/// assertions.
pub struct StatusRecorder {
    pub transitions: Mutex<Vec<(usize, switchboard::model::TargetStatus)>>,
}

impl StatusRecorder {
    #[must_use]
    pub fn new() -> Self {
        StatusRecorder {
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Distinct status sequence observed for one target index.
    pub fn sequence(&self, index: usize) -> Vec<switchboard::model::TargetStatus> {
        let mut out = Vec::new();
        for (idx, status) in self.transitions.lock().unwrap().iter() {
            if *idx == index && out.last() != Some(status) {
                out.push(*status);
            }
        }
        out
    }
}

impl Default for StatusRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl switchboard::job::JobObserver for StatusRecorder {
    fn target_updated(&self, _job_id: u64, index: usize, target: &JobTarget) {
        self.transitions
            .lock()
            .unwrap()
            .push((index, target.status));
    }
}
