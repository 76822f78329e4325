//! Server-side state for one registered client.
//!
//! Every session owns a writer task that is the only code allowed to touch
//! the connection's write half. Other tasks hand it whole lines through a
//! bounded queue, so a private message routed by one connection and a
//! roster update queued by another can never interleave bytes on the wire.
//!
//! A client that stops reading fills its queue; the next line that does not
//! fit aborts the session instead of letting the backlog grow.

use std::sync::Arc;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tracing::{debug, warn};

use crate::{error::DeliveryError, protocol::ServerLine, protocol::write_line};

pub type SessionId = u64;

/// Lines a session may have waiting before it is considered stuck.
pub const OUTBOUND_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// Closed on request; queued lines are still flushed.
    Closed,
    /// Write failure or backlog; queued lines are discarded.
    Aborted,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    outbound: mpsc::Sender<String>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl Session {
    /// Creates the session and starts the writer task that drains its
    /// outbound queue into `writer`.
    pub fn spawn<W>(id: SessionId, name: String, writer: W) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        let lifecycle = Arc::new(lifecycle);

        tokio::spawn(drain_outbound(
            name.clone(),
            writer,
            queue,
            Arc::clone(&lifecycle),
        ));

        Arc::new(Self {
            id,
            name,
            outbound,
            lifecycle,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues one line for this client.
    pub fn send(&self, line: &ServerLine) -> Result<(), DeliveryError> {
        self.enqueue(line.to_string())
    }

    pub(crate) fn enqueue(&self, line: String) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        match self.outbound.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    session = %self.name,
                    capacity = OUTBOUND_CAPACITY,
                    "client is not reading; dropping session"
                );
                abort(&self.lifecycle);
                Err(DeliveryError::Backlogged {
                    name: self.name.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    /// Marks the session closed. Lines already queued are still flushed
    /// before the write half is shut down. Returns `true` only for the call
    /// that actually closed it.
    pub fn close(&self) -> bool {
        self.lifecycle.send_if_modified(|state| {
            if *state != Lifecycle::Open {
                return false;
            }
            *state = Lifecycle::Closed;
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.lifecycle.borrow() != Lifecycle::Open
    }

    /// Resolves once the session has been closed, aborted after a failed
    /// write, or dropped for falling too far behind.
    pub async fn closed(&self) {
        wait_for(&mut self.lifecycle.subscribe(), |state| state != Lifecycle::Open).await;
    }

    fn closed_error(&self) -> DeliveryError {
        DeliveryError::Closed {
            name: self.name.clone(),
        }
    }
}

async fn wait_for(lifecycle: &mut watch::Receiver<Lifecycle>, done: impl Fn(Lifecycle) -> bool) {
    // Drop the borrow right away; holding it would stall the sender.
    let _ = lifecycle.wait_for(|state| done(*state)).await;
}

fn abort(lifecycle: &watch::Sender<Lifecycle>) {
    lifecycle.send_if_modified(|state| {
        if *state == Lifecycle::Aborted {
            return false;
        }
        *state = Lifecycle::Aborted;
        true
    });
}

async fn drain_outbound<W>(
    name: String,
    mut writer: W,
    mut queue: mpsc::Receiver<String>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closing = lifecycle.subscribe();
    let mut aborted = lifecycle.subscribe();

    loop {
        select! {
            biased;
            line = queue.recv() => {
                let Some(line) = line else { break };
                if !write_or_abort(&name, &mut writer, &line, &mut aborted, &lifecycle).await {
                    return;
                }
            }
            _ = wait_for(&mut closing, |state| state != Lifecycle::Open) => {
                if !flush_queued(&name, &mut writer, &mut queue, &mut aborted, &lifecycle).await {
                    return;
                }
                break;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = %name, error = ?err, "failed to shut down session writer");
    }
}

/// Writes one line unless the session is aborted first. Returns `false`
/// when the writer should give up.
async fn write_or_abort<W>(
    name: &str,
    writer: &mut W,
    line: &str,
    aborted: &mut watch::Receiver<Lifecycle>,
    lifecycle: &watch::Sender<Lifecycle>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    select! {
        biased;
        _ = wait_for(aborted, |state| state == Lifecycle::Aborted) => {
            debug!(session = %name, "session aborted; abandoning queued lines");
            false
        }
        result = write_line(writer, line) => {
            match result {
                Ok(()) => true,
                Err(err) => {
                    debug!(session = %name, error = ?err, "write failed; closing session");
                    abort(lifecycle);
                    false
                }
            }
        }
    }
}

async fn flush_queued<W>(
    name: &str,
    writer: &mut W,
    queue: &mut mpsc::Receiver<String>,
    aborted: &mut watch::Receiver<Lifecycle>,
    lifecycle: &watch::Sender<Lifecycle>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    queue.close();
    while let Some(line) = queue.recv().await {
        if !write_or_abort(name, writer, &line, aborted, lifecycle).await {
            return false;
        }
    }
    true
}
