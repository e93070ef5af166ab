//! Destinations for prefixed provisioning output.

use std::io::Write;

use crate::buffer::SyncBuffer;

/// Where provisioning output lines go.
#[derive(Debug, Clone)]
pub enum Output {
    Stdout,
    Stderr,
    Buffer(SyncBuffer),
}

impl Output {
    /// Write `line` with a `prefix: ` in front. Each line is written in
    /// one call so lines from concurrent VMs never interleave.
    pub fn write_line(&self, prefix: &str, line: &str) {
        let text = format!("{prefix}: {line}\n");
        let result = match self {
            Output::Stdout => std::io::stdout().lock().write_all(text.as_bytes()),
            Output::Stderr => std::io::stderr().lock().write_all(text.as_bytes()),
            Output::Buffer(buf) => buf.clone().write_all(text.as_bytes()),
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Dropped provisioning output line");
        }
    }
}

/// Copy `reader` to `out` line by line with `prefix`.
pub(crate) async fn forward_lines<R>(reader: R, prefix: String, out: Output)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => out.write_line(&prefix, &line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, prefix = %prefix, "Output stream ended with error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_lines_prefixes_each_line() {
        let buf = SyncBuffer::new();
        forward_lines(
            std::io::Cursor::new(b"one\ntwo\n".to_vec()),
            "vm1".to_string(),
            Output::Buffer(buf.clone()),
        )
        .await;
        assert_eq!(buf.to_string_lossy(), "vm1: one\nvm1: two\n");
    }
}
