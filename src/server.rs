//! ChatServer lifecycle state machine
//!
//! Owns the listening socket, the accept loop task, the live-client set,
//! the room registry and the client-id counter. All lifecycle transitions
//! are compare-and-swap guarded so concurrent callers of `run`/`stop`/
//! `shutdown` race safely: exactly one wins each transition.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::room::RoomRegistry;
use crate::session::ClientSession;
use crate::types::ClientId;

/// Notice broadcast to every live client when a graceful shutdown begins
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down... Please exit!";

/// Server lifecycle states
///
/// `Offline` is initial, `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Offline = 0,
    Starting = 1,
    Online = 2,
    Ending = 3,
    Ended = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Offline,
            1 => Self::Starting,
            2 => Self::Online,
            3 => Self::Ending,
            _ => Self::Ended,
        }
    }
}

/// Compare-and-swap guarded state cell
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ServerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Attempt the `from` -> `to` transition; only one concurrent caller wins
    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The multi-room chat server
///
/// Created once per process; `run` binds and starts accepting; ended by
/// `stop` (abrupt) or `shutdown` (graceful, then abrupt on timeout).
pub struct ChatServer {
    addr: SocketAddr,
    state: StateCell,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    clients: Arc<DashMap<ClientId, Arc<ClientSession>>>,
    rooms: Arc<RoomRegistry>,
    next_client_id: AtomicU64,
    cancel: CancellationToken,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    accept_spawned: AtomicBool,
    accept_done: watch::Sender<bool>,
}

impl ChatServer {
    /// Create a server that will bind to `addr` when `run` is called
    pub fn new(addr: SocketAddr) -> Self {
        let (accept_done, _) = watch::channel(false);
        Self {
            addr,
            state: StateCell::new(ServerState::Offline),
            local_addr: parking_lot::Mutex::new(None),
            clients: Arc::new(DashMap::new()),
            rooms: Arc::new(RoomRegistry::new()),
            next_client_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            accept_task: parking_lot::Mutex::new(None),
            accept_spawned: AtomicBool::new(false),
            accept_done,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.state.load()
    }

    /// Address the listener actually bound to, once Online
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of sessions currently registered in the live-client set
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Bind the listening socket and launch the accept loop
    ///
    /// Exactly one concurrent caller succeeds; all others observe
    /// `ServerError::AlreadyRunning`.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        debug!("Run called");
        if !self
            .state
            .transition(ServerState::Offline, ServerState::Starting)
        {
            info!("Could not start server");
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);
        self.state.store(ServerState::Online);

        let handle = tokio::spawn(self.clone().accept_loop(listener));
        *self.accept_task.lock() = Some(handle);
        self.accept_spawned.store(true, Ordering::Release);

        info!("Server started on {}", bound);
        Ok(())
    }

    /// Suspend the caller until the accept loop completes
    pub async fn join(&self) -> Result<(), ServerError> {
        let state = self.state.load();
        if state == ServerState::Offline || state == ServerState::Ended {
            info!("Server is not running");
            return Err(ServerError::NotRunning);
        }

        // Bounded spin: only while `run` is between winning the transition
        // and storing the accept task handle.
        while self.state.load() == ServerState::Starting
            || !self.accept_spawned.load(Ordering::Acquire)
        {
            tokio::task::yield_now().await;
        }

        let mut done = self.accept_done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Abrupt termination: no drain wait
    ///
    /// Valid from Online or Ending (the latter is the forced tail of a
    /// timed-out shutdown). Instructs every live client to exit and aborts
    /// the accept task, dropping the listener.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.state.load() == ServerState::Ending {
            if !self
                .state
                .transition(ServerState::Ending, ServerState::Ended)
            {
                info!("Could not stop server");
                return Err(ServerError::AlreadyEnded);
            }
        } else if !self
            .state
            .transition(ServerState::Online, ServerState::Ended)
        {
            info!("Could not stop server");
            return Err(ServerError::NotOnline);
        }

        let sessions: Vec<Arc<ClientSession>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();
        for session in &sessions {
            session.exit();
        }
        // Force-close every session: a loop blocked on a socket write never
        // dequeues `Stop`, and an abrupt stop does not wait for it.
        for session in &sessions {
            session.force_close();
        }
        self.clients.clear();

        if let Some(handle) = self.accept_task.lock().take() {
            handle.abort();
        }
        let _ = self.accept_done.send(true);

        info!("Server stopped");
        Ok(())
    }

    /// Graceful termination: stop accepting, notify and drain clients
    ///
    /// Valid only from Online. `timeout` bounds the drain; on expiry the
    /// server falls back to abrupt closing and still ends in `Ended`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        if !self
            .state
            .transition(ServerState::Online, ServerState::Ending)
        {
            info!("Could not shutdown server");
            return Err(ServerError::NotOnline);
        }

        info!("Shutdown started");
        self.cancel.cancel();

        let mut done = self.accept_done.subscribe();
        let drained = tokio::time::timeout(timeout, done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if drained {
            self.state.store(ServerState::Ended);
            info!("Shutdown complete");
            Ok(())
        } else {
            warn!("Shutdown drain timed out, ending abruptly");
            self.stop()?;
            info!("Shutdown after timeout");
            Ok(())
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.state.load() != ServerState::Online {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        // Re-check after resuming from accept: a connection
                        // fully accepted while shutdown begins must be
                        // dropped, not registered.
                        if self.state.load() != ServerState::Ending {
                            self.register_session(stream, peer);
                        }
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}, continuing", e);
                    }
                },
            }
        }

        if self.state.load() == ServerState::Ending {
            self.drain_clients().await;
        }

        let _ = self.accept_done.send(true);
        info!("Accept loop ended");
    }

    fn register_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1);
        info!("New client connected: {} from {}", id.display_name(), peer);

        let clients = self.clients.clone();
        let session = ClientSession::spawn(
            id,
            stream,
            self.rooms.clone(),
            Box::new(move |id| {
                clients.remove(&id);
            }),
        );
        self.clients.insert(id, session);
    }

    /// Notify every live client of the shutdown and wait for each to finish
    async fn drain_clients(&self) {
        info!("Server ending, notifying {} clients", self.clients.len());
        let sessions: Vec<Arc<ClientSession>> =
            self.clients.iter().map(|entry| entry.value().clone()).collect();

        for session in &sessions {
            let _ = session.write_to_remote(SHUTDOWN_NOTICE).await;
        }

        info!("Waiting for clients to end, before ending accept loop");
        for session in &sessions {
            session.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OK_MESSAGE;
    use crate::room::Room;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn started_server() -> Arc<ChatServer> {
        let server = Arc::new(ChatServer::new(test_addr()));
        server.run().await.unwrap();
        server
    }

    /// Synchronous-style line client used to validate server behavior
    struct TestClient {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(server: &ChatServer) -> Self {
            let addr = server.local_addr().expect("server is bound");
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut client = Self {
                lines: BufReader::new(read_half).lines(),
                writer: write_half,
            };
            let welcome = client.recv().await.expect("welcome banner");
            assert!(welcome.starts_with("Welcome to the chat server, client-"));
            client
        }

        async fn send(&mut self, line: &str) {
            // One write per line: a separately written terminator can
            // coalesce with the next command into a single server read.
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
        }

        async fn enter_room(&mut self, room: &str) {
            self.send(&format!("/enter {room}")).await;
            assert_eq!(self.recv().await.as_deref(), Some(OK_MESSAGE));
        }

        async fn leave_room(&mut self) {
            self.send("/leave").await;
            assert_eq!(self.recv().await.as_deref(), Some(OK_MESSAGE));
        }
    }

    #[tokio::test]
    async fn test_concurrent_run_only_one_succeeds() {
        let server = Arc::new(ChatServer::new(test_addr()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let server = server.clone();
            handles.push(tokio::spawn(async move { server.run().await }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(e) => assert!(matches!(e, ServerError::AlreadyRunning)),
            }
        }
        assert_eq!(successes, 1);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_join_before_start_fails() {
        let server = ChatServer::new(test_addr());
        assert!(matches!(server.join().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_join_after_stop_fails() {
        let server = started_server().await;
        server.stop().unwrap();
        assert!(matches!(server.join().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_join_after_shutdown_fails() {
        let server = started_server().await;
        server.shutdown(Duration::from_secs(100)).await.unwrap();
        assert_eq!(server.state(), ServerState::Ended);
        assert!(matches!(server.join().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_when_not_online_fails() {
        let server = ChatServer::new(test_addr());
        assert!(matches!(
            server.shutdown(Duration::from_secs(1)).await,
            Err(ServerError::NotOnline)
        ));
    }

    #[tokio::test]
    async fn test_simple_exchange_between_two_clients() {
        let server = started_server().await;
        let room = "test";

        let mut client1 = TestClient::connect(&server).await;
        let mut client2 = TestClient::connect(&server).await;
        client1.enter_room(room).await;
        client2.enter_room(room).await;

        let message = "abcd";
        client1.send(message).await;
        assert_eq!(
            client2.recv().await,
            Some(Room::format_message(room, "client-1", message))
        );

        client2.send(message).await;
        assert_eq!(
            client1.recv().await,
            Some(Room::format_message(room, "client-2", message))
        );

        client1.leave_room().await;
        client2.leave_room().await;

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_accounting() {
        let server = started_server().await;
        let room = "fanout";
        let message = "abcd";
        let clients_connected = 4;
        let messages_sent = 3;

        let mut clients = Vec::new();
        for _ in 0..clients_connected {
            let mut client = TestClient::connect(&server).await;
            client.enter_room(room).await;
            clients.push(client);
        }

        let mut received_per_client = vec![0usize; clients_connected];
        for _ in 0..messages_sent {
            for transmitter in 0..clients_connected {
                clients[transmitter].send(message).await;
                let expected = Room::format_message(
                    room,
                    &format!("client-{}", transmitter + 1),
                    message,
                );
                for receiver in 0..clients_connected {
                    if receiver == transmitter {
                        continue;
                    }
                    assert_eq!(clients[receiver].recv().await.as_deref(), Some(&*expected));
                    received_per_client[receiver] += 1;
                }
            }
        }

        let expected_per_client = messages_sent * (clients_connected - 1);
        for count in &received_per_client {
            assert_eq!(*count, expected_per_client);
        }
        let total: usize = received_per_client.iter().sum();
        assert_eq!(total, clients_connected * expected_per_client);

        server.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_the_session_alive() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        client.send("hello").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("[Error: Need to be inside a room to post messages]")
        );

        client.send("/leave").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("[Error: You are not in a room.]")
        );

        client.send("/dance").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("[Error: Unknown command.]")
        );

        // The session survived all of the above.
        client.enter_room("still-alive").await;

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_exit_command_closes_the_socket() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        client.send("/exit").await;
        assert_eq!(client.recv().await.as_deref(), Some(OK_MESSAGE));
        assert_eq!(client.recv().await, None);

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_notifies_and_drains_exiting_client() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        let client_task = tokio::spawn(async move {
            assert_eq!(client.recv().await.as_deref(), Some(SHUTDOWN_NOTICE));
            client.send("/exit").await;
            assert_eq!(client.recv().await.as_deref(), Some(OK_MESSAGE));
        });

        server.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.state(), ServerState::Ended);
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_timeout_forces_end_with_idle_client() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        // The client never exits, so the drain cannot complete in time.
        server.shutdown(Duration::from_millis(200)).await.unwrap();
        assert_eq!(server.state(), ServerState::Ended);

        assert_eq!(client.recv().await.as_deref(), Some(SHUTDOWN_NOTICE));
    }

    #[tokio::test]
    async fn test_consecutive_commands_parse_independently() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        // Back-to-back commands must each arrive as their own line; a
        // leftover terminator from one send must not prefix the next.
        client.enter_room("seq").await;
        client.leave_room().await;
        client.send("/dance").await;
        assert_eq!(
            client.recv().await.as_deref(),
            Some("[Error: Unknown command.]")
        );

        server.stop().unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_client_sockets_without_drain() {
        let server = started_server().await;
        let mut client = TestClient::connect(&server).await;

        server.stop().unwrap();
        assert_eq!(server.client_count(), 0);

        // The socket is force-closed: buffered lines may still arrive,
        // then a clean EOF or a reset.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.lines.next_line().await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        })
        .await
        .expect("socket was not closed after stop");
    }

    #[tokio::test]
    async fn test_zero_timeout_shutdown_still_ends() {
        let server = started_server().await;
        let _client = TestClient::connect(&server).await;

        server.shutdown(Duration::ZERO).await.unwrap();
        assert_eq!(server.state(), ServerState::Ended);
    }
}
