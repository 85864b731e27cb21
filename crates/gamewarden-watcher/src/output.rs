//! Line forwarding of the child's output streams.

use std::fmt;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

/// Where process output goes.
#[derive(Debug, Clone, Default)]
pub enum OutputSink {
    /// Output is not captured.
    #[default]
    Discard,
    /// Every line is logged under the `console` target.
    Log,
    /// Lines are sent over a channel.
    Channel(mpsc::UnboundedSender<OutputLine>),
}

impl OutputSink {
    /// Whether output must be piped at all.
    #[must_use]
    pub const fn captures(&self) -> bool {
        !matches!(self, Self::Discard)
    }

    fn deliver(&self, stream: Stream, line: String) -> bool {
        match self {
            Self::Discard => true,
            Self::Log => {
                match stream {
                    Stream::Stdout => tracing::info!(target: "console", "{line}"),
                    Stream::Stderr => tracing::warn!(target: "console", "{line}"),
                }
                true
            }
            Self::Channel(tx) => tx.send(OutputLine { stream, line }).is_ok(),
        }
    }
}

/// Spawn a reader that forwards `reader` line by line to `sink`.
///
/// The task ends at end of stream, on a read error, or when `cancel` fires.
/// If the receiving end of a channel sink goes away the stream is still
/// drained so the child never blocks on a full pipe.
pub fn forward<R>(
    reader: R,
    stream: Stream,
    sink: OutputSink,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::new();
        let mut deliver = true;

        loop {
            buffer.clear();
            tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read_until(b'\n', &mut buffer) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        if !deliver {
                            continue;
                        }
                        let line = String::from_utf8_lossy(&buffer);
                        let line = line.trim_end_matches(['\r', '\n']).to_string();
                        if !sink.deliver(stream, line) {
                            tracing::debug!(%stream, "Output receiver closed, draining");
                            deliver = false;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%stream, error = %e, "Error reading process output");
                        break;
                    }
                },
            }
        }
        tracing::trace!(%stream, "Output forwarding stopped");
    })
}
