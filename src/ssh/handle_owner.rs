//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the russh `Handle`.
//!
//! Once authentication succeeds, exactly one task owns the
//! `Handle<ClientHandler>`. Everything else talks to it through a
//! `HandleController`, which sends commands over an mpsc channel. The
//! controller reports the connection as closed as soon as the task exits,
//! either because it was told to disconnect or because the underlying
//! connection went away.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the connection is still up
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for pty/shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection, replying once the disconnect was sent
    Disconnect { reply_tx: oneshot::Sender<()> },
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect and wait for the owner task to finish.
    /// Returns immediately if it already exited.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Disconnect { reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task, taking ownership of an authenticated handle
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(16);

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut disconnect_reply = None;

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if let Ok(channel) = result {
                            if let Err(Ok(channel)) = reply_tx.send(Ok(channel)) {
                                warn!("Caller dropped before receiving session channel for {}", label);
                                let _ = channel.close().await;
                            }
                        } else {
                            let _ = reply_tx.send(result);
                        }
                    }
                    Some(HandleCommand::Disconnect { reply_tx }) => {
                        info!("Disconnect requested for {}", label);
                        disconnect_reply = Some(reply_tx);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for {}", label);
                        break;
                    }
                },

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        info!("SSH connection for {} closed by remote", label);
                        break;
                    }
                }
            }
        }

        drain_pending_commands(&mut cmd_rx, &mut disconnect_reply);

        if !handle.is_closed() {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await
            {
                debug!("Disconnect for {} failed: {}", label, e);
            }
        }

        if let Some(reply_tx) = disconnect_reply {
            let _ = reply_tx.send(());
        }
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Close the queue and fail everything still in it
fn drain_pending_commands(
    cmd_rx: &mut mpsc::Receiver<HandleCommand>,
    disconnect_reply: &mut Option<oneshot::Sender<()>>,
) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect { reply_tx } => {
                // Answered with the first one once the disconnect went out
                match disconnect_reply {
                    Some(_) => {
                        let _ = reply_tx.send(());
                    }
                    None => *disconnect_reply = Some(reply_tx),
                }
            }
        }
    }
}
