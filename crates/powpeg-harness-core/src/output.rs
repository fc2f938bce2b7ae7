use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::warn;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>;

/// Destination for a child's stdout or stderr.
///
/// Cloning shares the same writer, so several runners can log into one file.
#[derive(Clone)]
pub struct OutputSink(SharedWriter);

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OutputSink")
    }
}

impl OutputSink {
    pub fn new(writer: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> OutputSink {
        OutputSink(Arc::new(Mutex::new(writer)))
    }

    pub fn stdout() -> OutputSink {
        Self::new(Box::new(tokio::io::stdout()))
    }

    pub fn stderr() -> OutputSink {
        Self::new(Box::new(tokio::io::stderr()))
    }

    pub fn discard() -> OutputSink {
        Self::new(Box::new(tokio::io::sink()))
    }

    /// Appends to `path`, creating it if needed
    pub async fn file(path: impl AsRef<Path>) -> std::io::Result<OutputSink> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(Box::new(file)))
    }

    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.0.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}

/// Copies `reader` into `sink` one line at a time, prefixing each line with
/// `[label]`. Returns when the reader hits EOF.
pub async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    sink: OutputSink,
    label: &str,
) -> std::io::Result<()> {
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(text) => sink.write_line(&format!("[{label}] {text}")).await?,
            Err(e) => {
                warn!(label, error = %e, "dropping undecodable output");
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll};

    /// Writer that records everything into a shared buffer.
    #[derive(Clone, Default)]
    struct Capture(Arc<StdMutex<Vec<u8>>>);

    impl AsyncWrite for Capture {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_forward_prefixes_each_line() {
        let capture = Capture::default();
        let sink = OutputSink::new(Box::new(capture.clone()));
        let input: &[u8] = b"Bitcoin Core starting\nInit message: Done loading\n";

        forward_lines(input, sink, "bitcoind").await.unwrap();

        let written = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert_eq!(
            written,
            "[bitcoind] Bitcoin Core starting\n[bitcoind] Init message: Done loading\n"
        );
    }

    #[tokio::test]
    async fn test_clones_share_writer() {
        let capture = Capture::default();
        let sink = OutputSink::new(Box::new(capture.clone()));
        let other = sink.clone();

        sink.write_line("a").await.unwrap();
        other.write_line("b").await.unwrap();

        assert_eq!(capture.0.lock().unwrap().as_slice(), b"a\nb\n");
    }

    #[tokio::test]
    async fn test_discard_accepts_writes() {
        OutputSink::discard().write_line("ignored").await.unwrap();
    }
}
