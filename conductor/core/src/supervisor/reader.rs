//! Stream reader tasks
//!
//! One task per agent output stream. Each task owns its decoder, reads until
//! end-of-stream, and reports through [`ReaderContext`], which drops
//! everything once the generation it was spawned for has been torn down.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};

use crate::events::AgentEvent;
use crate::protocol::{FramingDecoder, StderrClassifier};

use super::Shared;

const READ_CHUNK_SIZE: usize = 4096;

/// A reader's link back to the supervisor
#[derive(Clone)]
pub(crate) struct ReaderContext {
    shared: Arc<Shared>,
    generation: u64,
}

impl ReaderContext {
    pub(crate) fn new(shared: Arc<Shared>, generation: u64) -> Self {
        Self { shared, generation }
    }

    /// Apply and publish decoded events
    ///
    /// Returns `false` when this reader's process has been replaced; nothing
    /// is published in that case.
    pub(crate) fn report(&self, events: Vec<AgentEvent>) -> bool {
        if events.is_empty() {
            return self.is_current();
        }
        let gate = self.shared.generation.read();
        if *gate != self.generation {
            return false;
        }
        for event in events {
            let transition = self.shared.machine.lock().observe(&event);
            self.shared.broadcaster.publish(&event);
            if let Some(state_event) = transition {
                self.shared.broadcaster.publish(&state_event);
            }
        }
        true
    }

    /// The agent's stdout closed
    pub(crate) fn stream_ended(&self) {
        let gate = self.shared.generation.read();
        if *gate != self.generation {
            return;
        }
        let notices = self.shared.machine.lock().disconnect();
        for event in &notices {
            self.shared.broadcaster.publish(event);
        }
        drop(gate);
        if !notices.is_empty() {
            debug!(generation = self.generation, "Agent stdout closed");
        }
    }

    fn is_current(&self) -> bool {
        *self.shared.generation.read() == self.generation
    }
}

/// Decode stdout until end-of-stream, then report the disconnect
pub(crate) async fn read_stdout<R>(stream: R, mut decoder: FramingDecoder, ctx: ReaderContext)
where
    R: AsyncRead + Unpin,
{
    let mut stream = stream;
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !ctx.report(decoder.push(&buf[..n])) {
                    debug!(generation = ctx.generation, "Stale stdout reader exiting");
                    return;
                }
            }
            Err(e) => {
                warn!(generation = ctx.generation, error = %e, "Failed to read agent stdout");
                break;
            }
        }
    }

    ctx.report(decoder.finish());
    ctx.stream_ended();
}

/// Classify stderr line by line until end-of-stream
pub(crate) async fn read_stderr<R>(stream: R, classifier: StderrClassifier, ctx: ReaderContext)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let events: Vec<AgentEvent> = classifier.classify_line(&text).into_iter().collect();
                if !ctx.report(events) {
                    debug!(generation = ctx.generation, "Stale stderr reader exiting");
                    return;
                }
            }
            Err(e) => {
                warn!(generation = ctx.generation, error = %e, "Failed to read agent stderr");
                break;
            }
        }
    }

    debug!(generation = ctx.generation, "Agent stderr closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::{Broadcaster, ChannelSink};
    use crate::events::SupervisorState;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn starting_shared() -> (Arc<Shared>, mpsc::Receiver<AgentEvent>) {
        let broadcaster = Broadcaster::new();
        let (sink, rx) = ChannelSink::pair(64);
        broadcaster.subscribe(sink);
        let shared = Arc::new(Shared::new(broadcaster));
        *shared.generation.write() = 1;
        shared.machine.lock().begin_start();
        (shared, rx)
    }

    #[tokio::test]
    async fn test_stdout_reader_drives_state() {
        let (shared, mut rx) = starting_shared();
        let ctx = ReaderContext::new(Arc::clone(&shared), 1);

        let input: &[u8] = b"Browser started\nhello__DONE__";
        read_stdout(input, FramingDecoder::default(), ctx).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                AgentEvent::ReadinessChanged(true),
                AgentEvent::StateChanged(SupervisorState::Ready),
                AgentEvent::output("hello"),
                AgentEvent::TaskDone,
                AgentEvent::system("process stopped"),
                AgentEvent::ReadinessChanged(false),
                AgentEvent::StateChanged(SupervisorState::Disconnected),
            ]
        );
        assert_eq!(shared.machine.lock().state(), SupervisorState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_reader_publishes_nothing() {
        let (shared, mut rx) = starting_shared();
        let ctx = ReaderContext::new(Arc::clone(&shared), 1);
        *shared.generation.write() = 2;

        let input: &[u8] = b"Browser started\n[error] late\n";
        read_stdout(input, FramingDecoder::default(), ctx).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(shared.machine.lock().state(), SupervisorState::Starting);
    }

    #[tokio::test]
    async fn test_stderr_reader_classifies_lines() {
        let (shared, mut rx) = starting_shared();
        let ctx = ReaderContext::new(Arc::clone(&shared), 1);

        let input: &[u8] = b"INFO\nTraceback (most recent call last):\nloading \xff page";
        read_stderr(input, StderrClassifier::default(), ctx).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                AgentEvent::error("Traceback (most recent call last):"),
                AgentEvent::output("loading \u{FFFD} page"),
            ]
        );
        assert_eq!(shared.machine.lock().state(), SupervisorState::Starting);
    }
}
