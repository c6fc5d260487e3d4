use std::io;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::events::EventPublisher;
use super::guard::GuardOutcome;
use super::guard::TimeoutGuard;
use super::prompt::PromptMarker;

const READ_CHUNK_SIZE: usize = 8192; // bytes per read
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

pub(crate) type InputWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedBuffer = Arc<StdMutex<Vec<u8>>>;

#[derive(Debug)]
pub(crate) enum ChannelError {
    Write(io::Error),
    /// Output ended before the next prompt.
    Closed { partial: String },
    /// The deadline passed before the next prompt.
    TimedOut { partial: String },
}

/// Frames command/response exchanges over a debugger's stdin and its merged
/// output stream.
pub(crate) struct CommandChannel {
    writer: Mutex<Option<InputWriter>>,
    reader: Arc<Mutex<OutputReader>>,
    buffer: SharedBuffer,
}

impl CommandChannel {
    pub(crate) fn new(
        writer: InputWriter,
        chunks: mpsc::Receiver<Vec<u8>>,
        marker: PromptMarker,
        events: EventPublisher,
    ) -> Self {
        let buffer: SharedBuffer = Arc::new(StdMutex::new(Vec::new()));
        let reader = OutputReader {
            chunks,
            buffer: Arc::clone(&buffer),
            marker,
            owed_prompts: 0,
            closed: false,
            events,
        };
        Self {
            writer: Mutex::new(Some(writer)),
            reader: Arc::new(Mutex::new(reader)),
            buffer,
        }
    }

    /// Writes `command` and returns everything printed before the next
    /// prompt that belongs to it.
    pub(crate) async fn send<E>(
        &self,
        command: &str,
        guard: TimeoutGuard,
        on_expire: E,
    ) -> Result<String, ChannelError>
    where
        E: FnOnce() + Send + 'static,
    {
        self.reader.lock().await.discard_unsolicited();
        self.write_line(command).await.map_err(ChannelError::Write)?;
        self.await_prompt(guard, on_expire).await
    }

    /// Reads up to the next prompt without writing anything first. Used for
    /// the banner the debugger prints at startup.
    pub(crate) async fn await_prompt<E>(
        &self,
        guard: TimeoutGuard,
        on_expire: E,
    ) -> Result<String, ChannelError>
    where
        E: FnOnce() + Send + 'static,
    {
        let reader = Arc::clone(&self.reader);
        let outcome = guard
            .run(
                async move { reader.lock().await.read_response().await },
                on_expire,
            )
            .await;
        match outcome {
            GuardOutcome::Completed(Ok(text)) => Ok(text),
            GuardOutcome::Completed(Err(partial)) => Err(ChannelError::Closed { partial }),
            GuardOutcome::Expired => Err(ChannelError::TimedOut {
                partial: self.snapshot(),
            }),
        }
    }

    /// Writes `command` without reading. The prompt it will eventually
    /// produce is skipped by the next [`CommandChannel::send`].
    pub(crate) async fn send_no_wait(&self, command: &str) -> Result<(), ChannelError> {
        self.write_line(command).await.map_err(ChannelError::Write)?;
        self.reader.lock().await.owe_prompt();
        Ok(())
    }

    /// Drops stdin so the debugger sees end of input.
    pub(crate) async fn close_input(&self) {
        self.writer.lock().await.take();
    }

    async fn write_line(&self, command: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "debugger input already closed",
            ));
        };
        debug!(command, "writing debugger command");
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn snapshot(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

struct OutputReader {
    chunks: mpsc::Receiver<Vec<u8>>,
    buffer: SharedBuffer,
    marker: PromptMarker,
    owed_prompts: usize,
    closed: bool,
    events: EventPublisher,
}

impl OutputReader {
    /// Waits for the prompt that answers the current command. On end of
    /// output, returns the bytes seen so far as the error.
    async fn read_response(&mut self) -> Result<String, String> {
        loop {
            if let Some(segment) = self.take_response() {
                return Ok(segment);
            }
            if self.closed {
                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let partial = String::from_utf8_lossy(&buffer).into_owned();
                buffer.clear();
                return Err(partial);
            }
            match self.chunks.recv().await {
                Some(chunk) => self.append(&chunk),
                None => self.closed = true,
            }
        }
    }

    /// Pops complete segments, skipping those that answer fire-and-forget
    /// commands, and returns the first one that is owed to nobody.
    fn take_response(&mut self) -> Option<String> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(pos) = self.marker.find_boundary(&buffer) {
            let mut segment: Vec<u8> = buffer.drain(..pos + self.marker.len()).collect();
            segment.truncate(pos);
            if self.owed_prompts > 0 {
                self.owed_prompts -= 1;
                trace!(remaining = self.owed_prompts, "skipped owed prompt");
                self.events.emit_unsolicited(&segment);
                continue;
            }
            return Some(String::from_utf8_lossy(&segment).into_owned());
        }
        None
    }

    /// Publishes output that arrived while no command was waiting so it
    /// cannot leak into the next response.
    fn discard_unsolicited(&mut self) {
        loop {
            match self.chunks.try_recv() {
                Ok(chunk) => self.append(&chunk),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        while self.owed_prompts > 0 {
            let Some(pos) = self.marker.find_boundary(&buffer) else {
                // The rest belongs to a command that has not finished yet.
                return;
            };
            let mut segment: Vec<u8> = buffer.drain(..pos + self.marker.len()).collect();
            segment.truncate(pos);
            self.owed_prompts -= 1;
            self.events.emit_unsolicited(&segment);
        }
        if !buffer.is_empty() {
            debug!(bytes = buffer.len(), "discarding unsolicited debugger output");
            self.events.emit_unsolicited(&buffer);
            buffer.clear();
        }
    }

    fn owe_prompt(&mut self) {
        self.owed_prompts += 1;
    }

    fn append(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }
}

/// Splits a byte stream into lines for observers that only care about
/// whole lines. Carriage returns are trimmed.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8], mut on_line: impl FnMut(&str)) {
        for &byte in chunk {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.pending);
                on_line(line.trim_end_matches('\r'));
                self.pending.clear();
            } else if self.pending.len() < MAX_PENDING_LINE_BYTES {
                self.pending.push(byte);
            }
        }
    }
}

/// Forwards `stream` into `tx` in fixed-size chunks until end of file,
/// feeding every complete line to `on_line` on the way.
pub(crate) fn spawn_pump<R, F>(
    mut stream: R,
    label: &'static str,
    tx: mpsc::Sender<Vec<u8>>,
    mut on_line: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(&str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineSplitter::default();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    lines.push(chunk, &mut on_line);
                    if tx.send(chunk.to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(stream = label, "failed to read debugger output: {err}");
                    break;
                }
            }
        }
        debug!(stream = label, "debugger output closed");
    })
}
