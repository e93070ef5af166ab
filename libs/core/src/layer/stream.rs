//! Streaming reads of volume content.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;

use crate::hypervisor::{Hypervisor, HypervisorError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Uncompressed content of a volume.
///
/// A background task downloads the volume into an in-memory pipe. If the
/// download fails, the error is returned by the read that would otherwise
/// report end of stream. Dropping the stream aborts the download.
pub struct LayerStream {
    reader: DuplexStream,
    task: Option<JoinHandle<Result<u64, HypervisorError>>>,
}

impl LayerStream {
    pub(crate) fn spawn(conn: Arc<dyn Hypervisor>, pool: String, name: String) -> Self {
        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(async move {
            let result = conn.volume_download(&pool, &name, &mut writer).await;
            drop(writer);
            result
        });
        Self {
            reader,
            task: Some(task),
        }
    }
}

impl AsyncRead for LayerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut self.reader).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // End of pipe: the download finished or failed.
        if let Some(task) = self.task.as_mut() {
            let joined = ready!(Pin::new(task).poll(cx));
            self.task = None;
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for LayerStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{MemoryHypervisor, VolumeDescriptor};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_stream_reads_large_content() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        hv.volume_create("p", &VolumeDescriptor::new("v")).await.unwrap();
        let data = vec![42u8; 3 * PIPE_CAPACITY + 17];
        hv.volume_upload("p", "v", &mut data.as_slice()).await.unwrap();

        let mut stream = LayerStream::spawn(hv, "p".to_string(), "v".to_string());
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_stream_surfaces_download_error() {
        let hv = Arc::new(MemoryHypervisor::new().with_pool("p"));
        let mut stream = LayerStream::spawn(hv, "p".to_string(), "missing".to_string());
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
