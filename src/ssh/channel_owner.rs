//! Shell Owner Task
//!
//! Same single-owner shape as the handle owner: one task owns the
//! `ShellChannel`, and the session talks to it through a `ShellController`.
//!
//! Remote output goes into a bounded queue. While a chunk is waiting for
//! room in that queue the task stops reading the channel, so a slow reader
//! pushes back on the server through SSH flow control. Input, resize and
//! close commands are still serviced in the meantime.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::TerminalSize;
use super::error::SshError;
use super::transport::{ChannelEvent, ShellChannel};

/// Commands sent to the Shell Owner Task
pub enum ShellCommand {
    /// Write bytes to the remote stdin
    Data {
        data: Vec<u8>,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },

    /// Window change request
    Resize {
        size: TerminalSize,
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },

    /// Send EOF, close the channel and stop. Replies with the first error.
    Close {
        reply_tx: oneshot::Sender<Result<(), SshError>>,
    },
}

/// Why the shell owner task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// `Close` command
    Closed,
    /// Remote EOF or channel close
    Remote,
    /// Every controller was dropped
    Abandoned,
}

/// Controller for sending commands to the Shell Owner Task
#[derive(Clone)]
pub struct ShellController {
    cmd_tx: mpsc::Sender<ShellCommand>,
    supports_resize: bool,
}

impl ShellController {
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ShellCommand::Data { data, reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ShellCommand::Resize { size, reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Close the channel. A task that already exited counts as closed.
    pub async fn close(&self) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ShellCommand::Close { reply_tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    pub fn supports_resize(&self) -> bool {
        self.supports_resize
    }

    /// Check if the Shell Owner Task is still running
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Shell Owner Task
///
/// Returns the controller, the receiving end of the output queue and the
/// task handle, which resolves to the reason the task stopped.
pub fn spawn_shell_owner_task(
    mut shell: Box<dyn ShellChannel>,
    label: String,
    output_capacity: usize,
) -> (ShellController, mpsc::Receiver<Vec<u8>>, JoinHandle<ShellExit>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(64);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(output_capacity.max(1));
    let supports_resize = shell.supports_resize();

    let task = tokio::spawn(async move {
        debug!("Shell owner task started for {}", label);

        // Output chunk waiting for queue space
        let mut pending: Option<Vec<u8>> = None;
        let mut output_open = true;

        let exit = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ShellCommand::Data { data, reply_tx }) => {
                        if reply_tx.is_closed() {
                            // The caller timed out; writing now would replay stale input
                            debug!("Dropping {} bytes of abandoned input for {}", data.len(), label);
                            continue;
                        }
                        let result = shell.write(&data).await;
                        if let Err(e) = &result {
                            warn!("Write to shell channel failed for {}: {}", label, e);
                        }
                        let _ = reply_tx.send(result);
                    }
                    Some(ShellCommand::Resize { size, reply_tx }) => {
                        debug!("Sending window_change {}x{} for {}", size.cols, size.rows, label);
                        let _ = reply_tx.send(shell.window_change(size).await);
                    }
                    Some(ShellCommand::Close { reply_tx }) => {
                        info!("Close command received for {}", label);
                        let _ = reply_tx.send(close_shell(shell.as_mut(), &label).await);
                        break ShellExit::Closed;
                    }
                    None => {
                        let _ = close_shell(shell.as_mut(), &label).await;
                        break ShellExit::Abandoned;
                    }
                },

                permit = output_tx.reserve(), if pending.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(chunk) = pending.take() {
                            permit.send(chunk);
                        }
                    }
                    Err(_) => {
                        // Nobody will read the output again; keep draining the channel
                        debug!("Output receiver dropped for {}", label);
                        pending = None;
                        output_open = false;
                    }
                },

                event = shell.next_event(), if pending.is_none() => match event {
                    Some(ChannelEvent::Data(data)) => {
                        if output_open && !data.is_empty() {
                            pending = Some(data);
                        }
                    }
                    Some(ChannelEvent::Eof) => {
                        info!("Shell channel EOF for {}", label);
                        let _ = close_shell(shell.as_mut(), &label).await;
                        break ShellExit::Remote;
                    }
                    Some(ChannelEvent::Closed) | None => {
                        info!("Shell channel closed for {}", label);
                        // Release our side too; errors are expected here
                        let _ = close_shell(shell.as_mut(), &label).await;
                        break ShellExit::Remote;
                    }
                },
            }
        };

        // Commands racing the exit see the task as gone
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                ShellCommand::Data { reply_tx, .. } | ShellCommand::Resize { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(SshError::Disconnected));
                }
                ShellCommand::Close { reply_tx } => {
                    let _ = reply_tx.send(Ok(()));
                }
            }
        }

        debug!("Shell owner task terminated for {} ({:?})", label, exit);
        exit
    });

    (
        ShellController {
            cmd_tx,
            supports_resize,
        },
        output_rx,
        task,
    )
}

/// EOF then close, logging every failure and returning the first
async fn close_shell(shell: &mut dyn ShellChannel, label: &str) -> Result<(), SshError> {
    let eof = shell.eof().await;
    if let Err(e) = &eof {
        debug!("Shell EOF failed for {}: {}", label, e);
    }
    let close = shell.close().await;
    if let Err(e) = &close {
        debug!("Shell close failed for {}: {}", label, e);
    }
    eof.and(close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Shell whose output is fed by the test; writes are echoed back
    struct ScriptedShell {
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        echo: mpsc::UnboundedSender<ChannelEvent>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ShellChannel for ScriptedShell {
        async fn next_event(&mut self) -> Option<ChannelEvent> {
            self.events.recv().await
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
            let _ = self.echo.send(ChannelEvent::Data(data.to_vec()));
            Ok(())
        }

        async fn window_change(&mut self, _size: TerminalSize) -> Result<(), SshError> {
            Ok(())
        }

        fn supports_resize(&self) -> bool {
            false
        }

        async fn eof(&mut self) -> Result<(), SshError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SshError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(SshError::ChannelError("already closed".into()))
        }
    }

    fn scripted() -> (
        Box<dyn ShellChannel>,
        mpsc::UnboundedSender<ChannelEvent>,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let shell = ScriptedShell {
            events: rx,
            echo: tx.clone(),
            closes: closes.clone(),
        };
        (Box::new(shell), tx, closes)
    }

    #[tokio::test]
    async fn test_write_is_echoed_and_close_reports_error() {
        let (shell, _remote, closes) = scripted();
        let (controller, mut output, task) = spawn_shell_owner_task(shell, "test".into(), 4);
        assert!(!controller.supports_resize());

        controller.write(b"ping".to_vec()).await.unwrap();
        assert_eq!(output.recv().await.unwrap(), b"ping".to_vec());

        assert!(controller.close().await.is_err());
        assert_eq!(task.await.unwrap(), ShellExit::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!controller.is_alive());

        // Closing a stopped task is fine
        assert!(controller.close().await.is_ok());
        assert!(matches!(
            controller.write(b"late".to_vec()).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_still_services_commands() {
        let (shell, remote, _closes) = scripted();
        let (controller, mut output, task) = spawn_shell_owner_task(shell, "test".into(), 1);

        for i in 0..10 {
            remote.send(ChannelEvent::Data(vec![i])).unwrap();
        }

        // Nobody is reading, yet resize and close still get answered
        tokio::time::timeout(Duration::from_secs(1), controller.resize(TerminalSize::new(100, 40)))
            .await
            .unwrap()
            .unwrap();

        let first = output.recv().await.unwrap();
        assert_eq!(first, vec![0]);

        let _ = tokio::time::timeout(Duration::from_secs(1), controller.close())
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), ShellExit::Closed);
    }

    /// Shell whose writes block until the gate opens
    struct GatedShell {
        gate: tokio::sync::watch::Receiver<bool>,
        written: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl ShellChannel for GatedShell {
        async fn next_event(&mut self) -> Option<ChannelEvent> {
            std::future::pending().await
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), SshError> {
            let _ = self.gate.wait_for(|open| *open).await;
            self.written.lock().push(data.to_vec());
            Ok(())
        }

        async fn window_change(&mut self, _size: TerminalSize) -> Result<(), SshError> {
            Ok(())
        }

        async fn eof(&mut self) -> Result<(), SshError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SshError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abandoned_input_is_not_written() {
        let (gate_tx, gate) = tokio::sync::watch::channel(false);
        let written = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let shell = GatedShell {
            gate,
            written: written.clone(),
        };
        let (controller, _output, task) = spawn_shell_owner_task(Box::new(shell), "test".into(), 4);

        let limit = Duration::from_millis(50);
        assert!(tokio::time::timeout(limit, controller.write(b"make\n".to_vec()))
            .await
            .is_err());
        assert!(tokio::time::timeout(limit, controller.write(b"make clean\n".to_vec()))
            .await
            .is_err());

        gate_tx.send_replace(true);
        controller.write(b"ls\n".to_vec()).await.unwrap();

        // The first write was already on the wire; the second one was given up
        assert_eq!(
            written.lock().clone(),
            vec![b"make\n".to_vec(), b"ls\n".to_vec()]
        );

        controller.close().await.unwrap();
        assert_eq!(task.await.unwrap(), ShellExit::Closed);
    }

    #[tokio::test]
    async fn test_remote_eof_ends_task_after_output() {
        let (shell, remote, closes) = scripted();
        let (_controller, mut output, task) = spawn_shell_owner_task(shell, "test".into(), 8);

        remote.send(ChannelEvent::Data(b"bye\n".to_vec())).unwrap();
        remote.send(ChannelEvent::Eof).unwrap();

        assert_eq!(task.await.unwrap(), ShellExit::Remote);
        assert_eq!(output.recv().await.unwrap(), b"bye\n".to_vec());
        assert!(output.recv().await.is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
