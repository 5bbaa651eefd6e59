//! Output capture for commands executed inside a container.
//!
//! A drain task owns the attached output (a demultiplexed chunk stream or a
//! pair of per-invocation pipes), copies it into memory and signals completion
//! exactly once. The exit code is only queried after that signal.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DrainError, Result};
use crate::types::ExecResult;

/// One frame of attached exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Everything a drain task collected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Option<Vec<u8>>,
    pub error: Option<DrainError>,
}

/// Handle to a running drain task. Dropping it aborts the task.
pub struct DrainTask {
    exec: String,
    done: oneshot::Receiver<CapturedOutput>,
    handle: JoinHandle<()>,
}

impl DrainTask {
    /// Block until the drain has consumed the whole stream.
    pub async fn wait(mut self) -> CapturedOutput {
        match (&mut self.done).await {
            Ok(output) => output,
            Err(_) => CapturedOutput {
                error: Some(DrainError {
                    exec: self.exec.clone(),
                    bytes_read: 0,
                    message: "drain task ended without signalling completion".to_string(),
                }),
                ..Default::default()
            },
        }
    }
}

impl Drop for DrainTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Drain a demultiplexed output stream into separate stdout/stderr buffers.
pub fn drain_stream<S, E>(exec: &str, stream: S) -> DrainTask
where
    S: Stream<Item = std::result::Result<OutputChunk, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (done_tx, done) = oneshot::channel();
    let exec_id = exec.to_string();

    let handle = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut error = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(OutputChunk::Stdout(bytes)) => stdout.extend_from_slice(&bytes),
                Ok(OutputChunk::Stderr(bytes)) => stderr.extend_from_slice(&bytes),
                Err(err) => {
                    error = Some(DrainError {
                        exec: exec_id.clone(),
                        bytes_read: stdout.len() + stderr.len(),
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }

        debug!(
            "Drained exec {}: {} stdout bytes, {} stderr bytes",
            exec_id,
            stdout.len(),
            stderr.len()
        );
        let _ = done_tx.send(CapturedOutput {
            stdout,
            stderr: Some(stderr),
            error,
        });
    });

    DrainTask {
        exec: exec.to_string(),
        done,
        handle,
    }
}

/// Drain per-invocation pipes. Both are read concurrently so neither can
/// block the producer by filling up.
pub fn drain_pipes<O, E>(exec: &str, stdout: O, stderr: Option<E>) -> DrainTask
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (done_tx, done) = oneshot::channel();
    let exec_id = exec.to_string();

    let handle = tokio::spawn(async move {
        let (out, err) = tokio::join!(read_all(stdout), async {
            match stderr {
                Some(reader) => Some(read_all(reader).await),
                None => None,
            }
        });

        let (stdout, out_error) = out;
        let (stderr, err_error) = match err {
            Some((bytes, error)) => (Some(bytes), error),
            None => (None, None),
        };
        let bytes_read = stdout.len() + stderr.as_ref().map_or(0, Vec::len);
        let error = out_error.or(err_error).map(|message| DrainError {
            exec: exec_id.clone(),
            bytes_read,
            message,
        });

        debug!("Drained exec {} pipes: {} bytes", exec_id, bytes_read);
        let _ = done_tx.send(CapturedOutput {
            stdout,
            stderr,
            error,
        });
    });

    DrainTask {
        exec: exec.to_string(),
        done,
        handle,
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> (Vec<u8>, Option<String>) {
    let mut buf = Vec::new();
    match reader.read_to_end(&mut buf).await {
        Ok(_) => (buf, None),
        Err(err) => (buf, Some(err.to_string())),
    }
}

/// Wait for the drain to finish, then query the exit code.
///
/// A drain failure does not hide the exit code: it is returned alongside it
/// in `ExecResult::drain_error`.
pub async fn capture<Q, Fut>(drain: DrainTask, exit_code: Q) -> Result<ExecResult>
where
    Q: FnOnce() -> Fut,
    Fut: Future<Output = Result<i64>>,
{
    let output = drain.wait().await;
    if let Some(err) = &output.error {
        warn!("{}", err);
    }

    let exit_code = exit_code().await?;
    Ok(ExecResult {
        exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        drain_error: output.error,
    })
}
