/// Output drain: forwards subordinate output line by line to our stdout and
/// refreshes the activity clock on every line.
use crate::activity::ActivityRecorder;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// How the drain ended.
#[derive(Debug)]
pub enum DrainEnd {
    /// The subordinate closed its output (normally because it exited).
    Closed { lines: u64 },
    /// Reading the output failed before end-of-stream.
    Failed { lines: u64, error: StreamReadError },
}

/// Unexpected failure reading the subordinate's output stream.
#[derive(Debug)]
pub struct StreamReadError {
    source: std::io::Error,
}

impl std::fmt::Display for StreamReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to read subordinate output: {}", self.source)
    }
}

impl std::error::Error for StreamReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Consume `output` until end-of-stream, copying each line to `sink`.
///
/// Lines are forwarded as raw bytes, so non-UTF-8 output and a trailing
/// partial line pass through unchanged. A failing sink is reported once and
/// then ignored: the clock keeps being refreshed.
pub async fn drain<R, W>(output: R, mut sink: W, recorder: ActivityRecorder) -> DrainEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    let mut lines = 0u64;
    let mut sink_ok = true;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                tracing::debug!(lines, "subordinate output closed");
                return DrainEnd::Closed { lines };
            }
            Ok(_) => {
                recorder.touch();
                lines += 1;
                if sink_ok {
                    let written = async {
                        sink.write_all(&line).await?;
                        sink.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        tracing::warn!(error = %e, "failed to forward subordinate output, continuing to monitor");
                        sink_ok = false;
                    }
                }
            }
            Err(e) => {
                let error = StreamReadError { source: e };
                tracing::warn!(error = %error, lines, "subordinate output stream failed");
                return DrainEnd::Failed { lines, error };
            }
        }
    }
}
