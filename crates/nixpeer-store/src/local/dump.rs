//! NAR production: runs the archive producer and streams its stdout.

use std::io;
use std::process::Stdio;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::store::{NarStream, StoreError};

/// Bytes per yielded chunk. Only the final chunk may be shorter.
pub const CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Spawn `command path` and stream what it writes to stdout.
///
/// The child is killed when the stream is dropped early, and terminated
/// and reaped once its output is exhausted.
pub fn dump(command: &[String], path: &str) -> Result<NarStream, StoreError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty dump command"))?;

    let mut child = Command::new(program)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("producer stdout not captured"))?;

    tracing::info!(path, "serving nar");

    let producer = Producer {
        child,
        stdout,
        path: path.to_string(),
    };

    Ok(futures::stream::unfold(Some(producer), |state| async move {
        let mut producer = state?;
        match producer.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(producer))),
            Ok(None) => {
                producer.finish().await;
                None
            }
            Err(e) => {
                producer.finish().await;
                Some((Err(StoreError::Io(e)), None))
            }
        }
    })
    .boxed())
}

struct Producer {
    child: Child,
    stdout: ChildStdout,
    path: String,
}

impl Producer {
    /// Fill one chunk, or return `None` at end of output.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        while buf.len() < CHUNK_SIZE {
            if self.stdout.read_buf(&mut buf).await? == 0 {
                break;
            }
        }
        Ok((!buf.is_empty()).then(|| buf.freeze()))
    }

    async fn finish(mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                tracing::warn!(path = %self.path, %status, "nar producer failed");
            }
            Ok(Some(_)) => {}
            _ => {
                // Still running after closing stdout; errors mean it already exited.
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
        tracing::debug!(path = %self.path, "served nar");
    }
}
