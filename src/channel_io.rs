//! Byte pipes over a russh channel.
//!
//! The channel is split and each half is served by its own task:
//! - the writer task sends bytes queued on `writer` as channel data
//! - the reader task makes channel data readable from `stdout` and extended
//!   data from `stderr`, and fires `exit` once the peer closes the channel
//!
//! Neither task waits on the other, so a stalled direction never stops the
//! opposite one from draining. Dropping every clone of `writer` sends EOF and
//! closes the channel.

use russh::{Channel, ChannelId, ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Buffer size of the in-process pipes.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Number of outbound writes queued before writers wait.
const WRITE_QUEUE: usize = 32;

/// Pipes attached to a running channel pump.
pub struct ChannelPipes {
    pub writer: mpsc::Sender<Vec<u8>>,
    pub stdout: DuplexStream,
    pub stderr: DuplexStream,
    pub exit: oneshot::Receiver<Option<u32>>,
    pub pump: Pump,
}

/// The reader and writer tasks of one channel.
pub struct Pump {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Pump {
    /// Stop both directions. Readers of the pipes see EOF.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Client-facing half of a gateway channel: what the user types and where
/// gateway output goes.
pub struct ClientIo {
    pub input: DuplexStream,
    pub output: mpsc::Sender<Vec<u8>>,
}

impl ClientIo {
    /// Queue `text` for the client. Fails once the channel is gone.
    pub async fn write(&self, text: &str) -> Result<(), ChannelClosed> {
        self.output
            .send(text.as_bytes().to_vec())
            .await
            .map_err(|_| ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

impl ChannelPipes {
    /// Spawn the reader and writer tasks for `channel`.
    pub fn spawn<S>(channel: Channel<S>) -> Self
    where
        S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    {
        let (writer, rx) = mpsc::channel(WRITE_QUEUE);
        let (stdout_tx, stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_tx, stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit) = oneshot::channel();

        let id = channel.id();
        let (read_half, write_half) = channel.split();
        let pump = Pump {
            reader: tokio::spawn(read_loop(id, read_half, stdout_tx, stderr_tx, exit_tx)),
            writer: tokio::spawn(write_loop(id, write_half, rx)),
        };

        Self {
            writer,
            stdout,
            stderr,
            exit,
            pump,
        }
    }

    /// Keep only the halves an interactive user needs.
    pub fn into_client(self) -> ClientIo {
        ClientIo {
            input: self.stdout,
            output: self.writer,
        }
    }
}

async fn read_loop(
    id: ChannelId,
    mut read_half: ChannelReadHalf,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit_tx: oneshot::Sender<Option<u32>>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut exit_status = None;

    loop {
        match read_half.wait().await {
            Some(ChannelMsg::Data { data }) => forward(&mut stdout, &data).await,
            Some(ChannelMsg::ExtendedData { data, .. }) => forward(&mut stderr, &data).await,
            Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                exit_status = Some(status);
            }
            Some(ChannelMsg::Eof) => {
                debug!("Channel {:?} EOF", id);
                stdout = None;
                stderr = None;
            }
            Some(ChannelMsg::Close) | None => {
                debug!("Channel {:?} closed by peer", id);
                break;
            }
            Some(_) => {}
        }
    }

    let _ = exit_tx.send(exit_status);
}

async fn write_loop<S>(
    id: ChannelId,
    write_half: ChannelWriteHalf<S>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.data(&bytes[..]).await {
            debug!("Channel {:?} write failed: {}", id, e);
            return;
        }
    }

    let _ = write_half.eof().await;
    let _ = write_half.close().await;
}

async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe {
        if writer.write_all(data).await.is_err() {
            // Reader went away; drop further output for this stream.
            *pipe = None;
        }
    }
}
