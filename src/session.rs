//! Per-connection client session actor
//!
//! Each accepted socket becomes a `ClientSession` running two tasks: a read
//! loop that turns socket lines into mailbox messages, and a processing
//! loop that owns all session state and dispatches messages one at a time.
//! The mailbox is the only channel between the two loops, the rooms and the
//! server shutdown sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::TakeTimeout;
use crate::mailbox::Mailbox;
use crate::net::{LineReader, LineWriter};
use crate::protocol::{self, ClientLine, OK_MESSAGE};
use crate::room::{Room, RoomRegistry};
use crate::types::ClientId;

/// Idle heartbeat for the processing loop's mailbox receive
const TAKE_MESSAGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Messages consumed by a session's processing loop
///
/// Exactly one consumer ever dequeues these: the session's own loop.
#[derive(Debug)]
pub enum ControlMessage {
    /// An incoming broadcast from a room this session belongs to
    RoomMessage { text: String, room: String },
    /// A line read from the remote socket
    RemoteLine(String),
    /// The remote input stream ended (socket closed or EOF)
    RemoteInputEnded,
    /// Server-initiated termination of this session
    Stop,
}

/// One client connection's actor and state
pub struct ClientSession {
    id: ClientId,
    name: String,
    mailbox: Mailbox<ControlMessage>,
    writer: tokio::sync::Mutex<LineWriter<OwnedWriteHalf>>,
    rooms: Arc<RoomRegistry>,
    /// Deregisters this session from the server's live-client set
    on_exit: Box<dyn Fn(ClientId) + Send + Sync>,
    exiting: AtomicBool,
    main_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Abort handle for the processing loop, usable even after `join`
    /// has consumed the join handle
    main_abort: parking_lot::Mutex<Option<AbortHandle>>,
    read_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Create a session for an accepted socket and start both of its loops
    pub fn spawn(
        id: ClientId,
        stream: TcpStream,
        rooms: Arc<RoomRegistry>,
        on_exit: Box<dyn Fn(ClientId) + Send + Sync>,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            id,
            name: id.display_name(),
            mailbox: Mailbox::new(),
            writer: tokio::sync::Mutex::new(LineWriter::new(write_half)),
            rooms,
            on_exit,
            exiting: AtomicBool::new(false),
            main_task: parking_lot::Mutex::new(None),
            main_abort: parking_lot::Mutex::new(None),
            read_task: parking_lot::Mutex::new(None),
        });

        let main_task = tokio::spawn(session.clone().processing_loop(read_half));
        *session.main_abort.lock() = Some(main_task.abort_handle());
        *session.main_task.lock() = Some(main_task);

        session
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a room broadcast for delivery to the remote client
    pub fn post_room_message(&self, text: String, room: &str) {
        self.mailbox.put(ControlMessage::RoomMessage {
            text,
            room: room.to_string(),
        });
    }

    /// Ask this session to terminate (server-initiated)
    pub fn exit(&self) {
        self.mailbox.put(ControlMessage::Stop);
    }

    /// Write one line directly to the remote socket
    pub async fn write_to_remote(&self, line: &str) -> std::io::Result<()> {
        self.writer.lock().await.write_line(line).await
    }

    /// Suspend the caller until both session loops have finished
    pub async fn join(&self) {
        let handle = self.main_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Forcibly terminate both loops, releasing the socket
    ///
    /// Used by the server's abrupt stop path; a loop blocked on a socket
    /// operation (e.g. writing to a non-reading peer) never dequeues `Stop`,
    /// so it is aborted outright.
    pub fn force_close(&self) {
        self.set_exiting();
        if let Some(handle) = self.read_task.lock().as_ref() {
            handle.abort();
        }
        if let Some(handle) = self.main_abort.lock().as_ref() {
            handle.abort();
        }
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn set_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    async fn processing_loop(self: Arc<Self>, read_half: OwnedReadHalf) {
        let welcome = format!("Welcome to the chat server, {}", self.name);
        if let Err(e) = self.write_to_remote(&welcome).await {
            warn!("Failed to greet {}: {}", self.name, e);
        }

        *self.read_task.lock() = Some(tokio::spawn(self.clone().read_loop(read_half)));

        // Mutated only by this loop, so it needs no lock.
        let mut current_room: Option<Arc<Room>> = None;

        while !self.is_exiting() {
            match self.mailbox.take(TAKE_MESSAGE_TIMEOUT).await {
                Ok(message) => {
                    if let Err(e) = self.dispatch(message, &mut current_room).await {
                        error!(
                            "Unexpected error while handling message for {}: {}, ending connection",
                            self.name, e
                        );
                        self.set_exiting();
                    }
                }
                Err(TakeTimeout) => {
                    debug!("Take timeout for {} reached, ignored", self.name);
                }
            }
        }

        // Closes the socket under the pending read.
        if let Some(handle) = self.read_task.lock().as_ref() {
            handle.abort();
        }
        debug!("Exiting main loop for {}", self.name);
    }

    async fn dispatch(
        self: &Arc<Self>,
        message: ControlMessage,
        current_room: &mut Option<Arc<Room>>,
    ) -> std::io::Result<()> {
        match message {
            ControlMessage::RoomMessage { text, room } => {
                debug!("Delivering message from room {} to {}", room, self.name);
                self.write_to_remote(&text).await?;
            }
            ControlMessage::RemoteLine(line) => {
                self.execute_command(&line, current_room).await?;
            }
            ControlMessage::RemoteInputEnded => {
                // Remote hangup is treated as a clean exit.
                self.client_exit(current_room).await?;
            }
            ControlMessage::Stop => {
                self.server_exit(current_room).await;
            }
        }
        Ok(())
    }

    async fn execute_command(
        self: &Arc<Self>,
        line: &str,
        current_room: &mut Option<Arc<Room>>,
    ) -> std::io::Result<()> {
        match protocol::parse_client(line) {
            ClientLine::Invalid(reason) => self.write_error(reason).await,
            ClientLine::Message(text) => self.post_to_room(&text, current_room).await,
            ClientLine::Enter(room_name) => self.enter_room(&room_name, current_room).await,
            ClientLine::Leave => self.leave_room(current_room).await,
            ClientLine::Exit => self.client_exit(current_room).await,
        }
    }

    async fn enter_room(
        self: &Arc<Self>,
        room_name: &str,
        current_room: &mut Option<Arc<Room>>,
    ) -> std::io::Result<()> {
        if let Some(previous) = current_room.take() {
            previous.leave(self);
        }
        let room = self.rooms.get_or_create_room(room_name);
        room.enter(self);
        info!("{} entered room {}", self.name, room.name());
        *current_room = Some(room);
        self.write_to_remote(OK_MESSAGE).await
    }

    async fn leave_room(&self, current_room: &mut Option<Arc<Room>>) -> std::io::Result<()> {
        match current_room.take() {
            None => self.write_error("You are not in a room.").await,
            Some(room) => {
                room.leave(self);
                info!("{} left room {}", self.name, room.name());
                self.write_to_remote(OK_MESSAGE).await
            }
        }
    }

    async fn post_to_room(
        &self,
        text: &str,
        current_room: &mut Option<Arc<Room>>,
    ) -> std::io::Result<()> {
        match current_room {
            None => {
                self.write_error("Need to be inside a room to post messages")
                    .await
            }
            Some(room) => {
                room.post(self, text);
                Ok(())
            }
        }
    }

    /// Clean exit requested by the remote client (`/exit` or hangup)
    async fn client_exit(&self, current_room: &mut Option<Arc<Room>>) -> std::io::Result<()> {
        if let Some(room) = current_room.take() {
            room.leave(self);
        }
        self.set_exiting();
        info!("Client {} exiting", self.name);
        self.write_to_remote(OK_MESSAGE).await?;
        self.writer.lock().await.shutdown().await
    }

    /// Termination requested by the server (`Stop` message)
    async fn server_exit(&self, current_room: &mut Option<Arc<Room>>) {
        if let Some(room) = current_room.take() {
            room.leave(self);
        }
        (self.on_exit)(self.id);
        self.set_exiting();
        info!("Client {} stopped by the server", self.name);
        // Best-effort notice: the remote end may already be gone.
        if let Err(e) = self.write_error("Server is exiting").await {
            debug!("Could not notify {} of server exit: {}", self.name, e);
        }
    }

    async fn write_error(&self, reason: &str) -> std::io::Result<()> {
        self.write_to_remote(&protocol::error_message(reason)).await
    }

    /// Read loop: one task per session turning socket lines into messages
    ///
    /// Ends on EOF or on any read error; neither crashes the session. The
    /// hangup notification is suppressed when the session is already
    /// exiting on its own.
    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf) {
        let mut reader = LineReader::new(read_half);
        loop {
            if self.is_exiting() {
                break;
            }
            match reader.read_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        debug!("Received line from {}: {}", self.name, line);
                        self.mailbox.put(ControlMessage::RemoteLine(line));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Unexpected error while reading from {}: {}", self.name, e);
                    break;
                }
            }
        }
        if !self.is_exiting() {
            self.mailbox.put(ControlMessage::RemoteInputEnded);
        }
        debug!("Exiting read loop for {}", self.name);
    }
}
