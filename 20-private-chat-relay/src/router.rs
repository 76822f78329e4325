//! Per-connection protocol handling.
//!
//! A connection waits for its registration line, then routes every further
//! line until the client goes away or its session is closed. Teardown runs
//! once, after the read loop has ended, no matter which side ended it.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
};
use tracing::{debug, info};

use crate::{
    error::ProtocolError,
    protocol::{ClientLine, ServerLine, read_line},
    registry::Registry,
    session::{Session, SessionId},
};

/// What happened to a single line from a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the target and echoed to the sender.
    Delivered,
    /// The target is not registered, or went away before delivery.
    UnknownTarget,
    /// Plain or malformed line; nothing was sent.
    Discarded,
}

pub struct Router {
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs one client connection to completion.
    ///
    /// Returns `Ok(())` when the client disconnects normally or before
    /// registering, and an error for an empty registration line or a failed
    /// read. The registry has been cleaned up either way.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(name) = read_registration(&mut reader).await? else {
            debug!("connection closed before registration");
            return Ok(());
        };

        let session = self.join(name, writer).await;
        let outcome = self.run_session(&session, &mut reader).await;
        self.leave(&session).await;

        outcome
    }

    async fn join<W>(&self, name: String, writer: W) -> Arc<Session>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::spawn(self.next_id(), name, writer);

        if let Some(displaced) = self.registry.register(Arc::clone(&session)).await {
            info!(
                name = %session.name(),
                displaced = displaced.id(),
                "display name taken over by a new connection"
            );
        }
        info!(name = %session.name(), id = session.id(), "client joined");

        self.registry.broadcast_roster().await;
        session
    }

    async fn run_session<R>(&self, session: &Session, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            select! {
                line = read_line(reader) => {
                    match line.context("failed to read from client")? {
                        Some(line) => {
                            self.route(session, &line).await;
                        }
                        None => return Ok(()),
                    }
                }
                _ = session.closed() => {
                    debug!(name = %session.name(), "session closed; ending read loop");
                    return Ok(());
                }
            }
        }
    }

    /// Handles one line from a registered client.
    pub async fn route(&self, sender: &Session, line: &str) -> RouteOutcome {
        match ClientLine::parse(line) {
            Ok(ClientLine::Private { target, body }) => {
                self.deliver_private(sender, &target, body).await
            }
            Ok(ClientLine::Plain(text)) => {
                debug!(name = %sender.name(), %text, "ignoring plain line");
                RouteOutcome::Discarded
            }
            Err(err) => {
                debug!(name = %sender.name(), error = %err, "discarding malformed line");
                RouteOutcome::Discarded
            }
        }
    }

    async fn deliver_private(&self, sender: &Session, target: &str, body: String) -> RouteOutcome {
        let Some(recipient) = self.registry.lookup(target).await else {
            debug!(from = %sender.name(), to = %target, "dropping private message for unknown target");
            return RouteOutcome::UnknownTarget;
        };

        let message = ServerLine::Private {
            sender: sender.name().to_string(),
            body,
        };

        if let Err(err) = recipient.send(&message) {
            debug!(from = %sender.name(), error = %err, "target left before delivery");
            return RouteOutcome::UnknownTarget;
        }

        // The echo goes out even when the sender is the target.
        if let Err(err) = sender.send(&message) {
            debug!(error = %err, "failed to echo private message to sender");
        }

        RouteOutcome::Delivered
    }

    async fn leave(&self, session: &Session) {
        if self.registry.release(session).await {
            info!(name = %session.name(), id = session.id(), "client left");
        } else {
            debug!(
                name = %session.name(),
                id = session.id(),
                "displaced session disconnected"
            );
        }

        self.registry.broadcast_roster().await;
        session.close();
    }
}

async fn read_registration<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader)
        .await
        .context("failed to read registration line")?
    {
        None => Ok(None),
        Some(name) if name.is_empty() => Err(ProtocolError::EmptyName.into()),
        Some(name) => Ok(Some(name)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(Arc::new(Registry::new())))
    }

    fn session(id: SessionId, name: &str) -> (Arc<Session>, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(1024);
        (
            Session::spawn(id, name.into(), writer),
            BufReader::new(reader),
        )
    }

    async fn next_line(reader: &mut BufReader<DuplexStream>) -> Option<String> {
        timeout(Duration::from_secs(1), read_line(reader))
            .await
            .expect("timed out waiting for a line")
            .expect("read")
    }

    /// Closes the session and checks nothing was queued for it.
    async fn assert_nothing_queued(session: &Session, reader: &mut BufReader<DuplexStream>) {
        session.close();
        assert_eq!(next_line(reader).await, None);
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<Result<()>>,
    }

    impl Client {
        fn connect(router: &Arc<Router>) -> Self {
            let (client, server) = tokio::io::duplex(4096);
            let (server_reader, server_writer) = tokio::io::split(server);
            let router = Arc::clone(router);
            let task = tokio::spawn(async move {
                router
                    .serve(BufReader::new(server_reader), server_writer)
                    .await
            });
            let (reader, writer) = tokio::io::split(client);
            Self {
                reader: BufReader::new(reader),
                writer,
                task,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .expect("client write");
        }

        async fn hang_up(&mut self) {
            self.writer.shutdown().await.expect("client shutdown");
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(Duration::from_secs(1), read_line(&mut self.reader))
                .await
                .expect("timed out waiting for a line")
                .expect("read")
        }

        async fn finish(self) -> Result<()> {
            timeout(Duration::from_secs(1), self.task)
                .await
                .expect("serve should finish")
                .expect("serve task panicked")
        }
    }

    #[tokio::test]
    async fn private_message_reaches_target_and_sender_only() {
        let router = router();
        let (alice, mut alice_rx) = session(1, "alice");
        let (bob, mut bob_rx) = session(2, "bob");
        let (carol, mut carol_rx) = session(3, "carol");
        for session in [&alice, &bob, &carol] {
            router.registry().register(Arc::clone(session)).await;
        }

        let outcome = router.route(&alice, "Privado:bob:hello: world").await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(
            next_line(&mut bob_rx).await.as_deref(),
            Some("Privado:alice:hello: world")
        );
        assert_eq!(
            next_line(&mut alice_rx).await.as_deref(),
            Some("Privado:alice:hello: world")
        );
        assert_nothing_queued(&carol, &mut carol_rx).await;
    }

    #[tokio::test]
    async fn unknown_target_is_dropped_silently() {
        let router = router();
        let (alice, mut alice_rx) = session(1, "alice");
        router.registry().register(Arc::clone(&alice)).await;

        let outcome = router.route(&alice, "Privado:charlie:hi").await;

        assert_eq!(outcome, RouteOutcome::UnknownTarget);
        assert!(!alice.is_closed());
        assert_nothing_queued(&alice, &mut alice_rx).await;
    }

    #[tokio::test]
    async fn plain_and_malformed_lines_are_discarded() {
        let router = router();
        let (alice, mut alice_rx) = session(1, "alice");
        let (bob, mut bob_rx) = session(2, "bob");
        router.registry().register(Arc::clone(&alice)).await;
        router.registry().register(Arc::clone(&bob)).await;

        assert_eq!(
            router.route(&alice, "hello everyone").await,
            RouteOutcome::Discarded
        );
        assert_eq!(router.route(&alice, "Privado:bob").await, RouteOutcome::Discarded);
        assert_eq!(router.route(&alice, "").await, RouteOutcome::Discarded);

        assert_nothing_queued(&alice, &mut alice_rx).await;
        assert_nothing_queued(&bob, &mut bob_rx).await;
    }

    #[tokio::test]
    async fn message_to_self_is_delivered_and_echoed() {
        let router = router();
        let (alice, mut alice_rx) = session(1, "alice");
        router.registry().register(Arc::clone(&alice)).await;

        assert_eq!(
            router.route(&alice, "Privado:alice:note").await,
            RouteOutcome::Delivered
        );

        alice.close();
        assert_eq!(next_line(&mut alice_rx).await.as_deref(), Some("Privado:alice:note"));
        assert_eq!(next_line(&mut alice_rx).await.as_deref(), Some("Privado:alice:note"));
        assert_eq!(next_line(&mut alice_rx).await, None);
    }

    #[tokio::test]
    async fn closed_target_counts_as_unknown() {
        let router = router();
        let (alice, _alice_rx) = session(1, "alice");
        let (bob, _bob_rx) = session(2, "bob");
        router.registry().register(Arc::clone(&alice)).await;
        router.registry().register(Arc::clone(&bob)).await;
        bob.close();

        assert_eq!(
            router.route(&alice, "Privado:bob:too late").await,
            RouteOutcome::UnknownTarget
        );
    }

    #[tokio::test]
    async fn registration_broadcasts_roster_and_disconnect_cleans_up() {
        let router = router();

        let mut alice = Client::connect(&router);
        alice.send("alice").await;
        assert_eq!(alice.recv().await.as_deref(), Some("Clientes conectados:alice"));

        let mut bob = Client::connect(&router);
        bob.send("bob").await;
        assert_eq!(
            bob.recv().await.as_deref(),
            Some("Clientes conectados:alice, bob")
        );
        assert_eq!(
            alice.recv().await.as_deref(),
            Some("Clientes conectados:alice, bob")
        );

        bob.hang_up().await;
        assert_eq!(bob.recv().await, None);
        bob.finish().await.expect("clean disconnect");

        assert_eq!(alice.recv().await.as_deref(), Some("Clientes conectados:alice"));
        assert_eq!(router.registry().snapshot().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn empty_registration_is_rejected() {
        let router = router();
        let mut client = Client::connect(&router);
        client.send("").await;

        let err = client.finish().await.expect_err("empty name");
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::EmptyName)
        ));
        assert!(router.registry().is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_before_registration_registers_nothing() {
        let router = router();
        let (bob, mut bob_rx) = session(9, "bob");
        router.registry().register(Arc::clone(&bob)).await;

        let mut client = Client::connect(&router);
        client.hang_up().await;
        client.finish().await.expect("clean close");
        assert_eq!(router.registry().snapshot().await, vec!["bob"]);

        // The roster never changed, so bob is not sent one.
        bob.close();
        assert_eq!(next_line(&mut bob_rx).await, None);
    }

    #[tokio::test]
    async fn closing_the_session_ends_the_connection() {
        let router = router();
        let mut alice = Client::connect(&router);
        alice.send("alice").await;
        assert_eq!(alice.recv().await.as_deref(), Some("Clientes conectados:alice"));

        assert_eq!(router.registry().close_all().await, 1);

        assert_eq!(alice.recv().await, None);
        alice.finish().await.expect("clean close");
        assert!(router.registry().is_empty().await);
    }

    #[tokio::test]
    async fn displaced_session_leaving_keeps_successor() {
        let router = router();

        let mut first = Client::connect(&router);
        first.send("alice").await;
        assert_eq!(first.recv().await.as_deref(), Some("Clientes conectados:alice"));

        let mut second = Client::connect(&router);
        second.send("alice").await;
        assert_eq!(second.recv().await.as_deref(), Some("Clientes conectados:alice"));

        first.hang_up().await;
        first.finish().await.expect("clean disconnect");

        assert_eq!(second.recv().await.as_deref(), Some("Clientes conectados:alice"));
        let current = router.registry().lookup("alice").await.expect("still registered");
        assert_eq!(current.id(), 2);
    }
}
