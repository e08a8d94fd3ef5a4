//! Chat client session.
//!
//! One socket, one identity. After registration three duties run until
//! logout: a receiver thread draining the socket, a heartbeat thread
//! keeping the server-side record alive, and the caller's command loop
//! feeding [`Session`] operations.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::str;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, RwLock,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::proto::{self, Chat, Inbound, PeerEntry, Request, Response, MAX_DATAGRAM};

/// How long to wait for the server's answer to one REGISTER attempt.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// How many REGISTER attempts before giving up on the server.
pub const REGISTER_ATTEMPTS: u32 = 3;

/// Interval between keepalive heartbeats.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

// Poll granularity for the two background duties, bounds how long a
// logout waits for them to notice the flag.
const RECV_POLL: Duration = Duration::from_secs(1);
const HEARTBEAT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    /// The server refused the registration. Name conflicts are not
    /// transient, so there is no retry for this.
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// Every registration attempt timed out.
    #[error("server did not respond after {attempts} attempts")]
    NoResponse { attempts: u32 },

    /// The username cannot appear on the wire.
    #[error("invalid username `{0}`")]
    InvalidUsername(String),

    /// The recipient is not in the local peer cache.
    #[error("user `{0}` is not known")]
    UnknownPeer(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Local copy of the last USERS listing, minus our own name.
///
/// Written only by the receiver duty, wholesale on every refresh; read
/// from the command path to resolve recipients. Entries may be stale
/// until the next refresh.
#[derive(Clone, Default)]
pub struct PeerCache {
    peers: Arc<RwLock<HashMap<String, SocketAddr>>>,
}

impl PeerCache {
    fn replace(&self, own_name: &str, entries: Vec<PeerEntry>) {
        let fresh = entries
            .into_iter()
            .filter(|e| e.username != own_name)
            .map(|e| (e.username, SocketAddr::new(e.addr, e.port)))
            .collect();

        *self.peers.write().unwrap() = fresh;
    }

    pub fn resolve(&self, username: &str) -> Option<SocketAddr> {
        self.peers.read().unwrap().get(username).copied()
    }

    /// Known usernames, sorted for display.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.peers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().unwrap().is_empty()
    }
}

/// A registered presence on one server.
///
/// # example
/// ```no_run
/// use roster::client::Session;
///
/// let mut session = Session::connect("127.0.0.1:9000", "alice").unwrap();
/// session.request_users().unwrap();
/// session.logout();
/// ```
pub struct Session {
    socket: UdpSocket,
    server_addr: SocketAddr,
    username: String,
    running: Arc<AtomicBool>,
    peers: PeerCache,
    receiver: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.logout();
    }
}

impl Session {
    /// Bind an ephemeral port, register `username` with the server and
    /// start the receiver and heartbeat duties. Fails fast on a name
    /// conflict, retries on silence.
    pub fn connect<A: ToSocketAddrs>(server_addr: A, username: &str) -> Result<Self, SessionError> {
        Self::connect_inner(server_addr, username, REGISTER_ATTEMPTS, REGISTER_TIMEOUT)
    }

    fn connect_inner<A: ToSocketAddrs>(
        server_addr: A,
        username: &str,
        attempts: u32,
        per_attempt: Duration,
    ) -> Result<Self, SessionError> {
        if !proto::valid_username(username) {
            return Err(SessionError::InvalidUsername(username.to_string()));
        }

        let server_addr = server_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "no address"))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;

        let mut session = Self {
            socket,
            server_addr,
            username: username.to_string(),
            running: Arc::new(AtomicBool::new(true)),
            peers: Default::default(),
            receiver: None,
            heartbeat: None,
        };

        if let Err(e) = session.register(attempts, per_attempt) {
            // never activated, nothing to announce on drop
            session.running.store(false, Relaxed);
            return Err(e);
        }

        session.spawn_receiver()?;
        session.spawn_heartbeat()?;

        // start with a populated roster
        session.request_users()?;

        Ok(session)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peers(&self) -> &PeerCache {
        &self.peers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    fn register(&self, attempts: u32, per_attempt: Duration) -> Result<(), SessionError> {
        let port = self.socket.local_addr()?.port();
        let req = Request::Register {
            username: self.username.clone(),
            port,
        }
        .encode();

        self.socket.set_read_timeout(Some(per_attempt))?;

        let mut buf = [0; MAX_DATAGRAM];
        for attempt in 1..=attempts {
            self.socket.send_to(req.as_bytes(), self.server_addr)?;

            let (n, addr) = match self.socket.recv_from(&mut buf) {
                Ok(ok) => ok,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    log::warn!("server did not respond, attempt {}/{}", attempt, attempts);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if addr != self.server_addr {
                continue;
            }

            let reply = match str::from_utf8(&buf[..n]) {
                Ok(s) => s,
                Err(_) => continue,
            };

            match Response::parse(reply) {
                Ok(Response::Success(text)) => {
                    log::info!("registered as {}: {}", self.username, text);
                    return Ok(());
                }
                Ok(Response::Error(reason)) => return Err(SessionError::Rejected(reason)),
                _ => continue,
            }
        }

        Err(SessionError::NoResponse { attempts })
    }

    fn spawn_receiver(&mut self) -> io::Result<()> {
        let socket = self.socket.try_clone()?;
        // short deadline so the loop can notice a logout
        socket.set_read_timeout(Some(RECV_POLL))?;

        let username = self.username.clone();
        let peers = self.peers.clone();
        let running = self.running.clone();

        self.receiver = Some(thread::spawn(move || {
            receiver_loop(socket, username, peers, running)
        }));

        Ok(())
    }

    fn spawn_heartbeat(&mut self) -> io::Result<()> {
        let socket = self.socket.try_clone()?;
        let req = Request::Heartbeat {
            username: self.username.clone(),
        }
        .encode();
        let server_addr = self.server_addr;
        let running = self.running.clone();

        self.heartbeat = Some(thread::spawn(move || {
            let mut last_beat: Option<Instant> = None;

            while running.load(Relaxed) {
                if last_beat.map_or(true, |t| t.elapsed() >= HEARTBEAT_PERIOD) {
                    if let Err(e) = socket.send_to(req.as_bytes(), server_addr) {
                        // a missed beat is not fatal, the next one may land
                        log::warn!("heartbeat send failed: {}", e);
                    }
                    last_beat = Some(Instant::now());
                }

                thread::sleep(HEARTBEAT_POLL);
            }
        }));

        Ok(())
    }

    /// Ask the server for a fresh USERS listing. The answer arrives on
    /// the receiver duty, which replaces the peer cache.
    pub fn request_users(&self) -> io::Result<()> {
        self.socket
            .send_to(Request::GetUsers.encode().as_bytes(), self.server_addr)?;
        Ok(())
    }

    /// Send a direct message. The recipient is resolved purely from the
    /// local peer cache, the server is never consulted for a send.
    pub fn send_chat(&self, recipient: &str, body: &str) -> Result<(), SessionError> {
        let addr = self
            .peers
            .resolve(recipient)
            .ok_or_else(|| SessionError::UnknownPeer(recipient.to_string()))?;

        let msg = Chat {
            sender: self.username.clone(),
            body: body.to_string(),
        }
        .encode();

        self.socket.send_to(msg.as_bytes(), addr)?;
        Ok(())
    }

    /// Announce the logout (best effort, unacknowledged) and stop both
    /// background duties. Terminal, and idempotent.
    pub fn logout(&mut self) {
        if !self.running.swap(false, Relaxed) {
            return;
        }

        let req = Request::Logout {
            username: self.username.clone(),
        }
        .encode();
        let _ = self.socket.send_to(req.as_bytes(), self.server_addr);

        if let Some(h) = self.receiver.take() {
            let _ = h.join();
        }
        if let Some(h) = self.heartbeat.take() {
            let _ = h.join();
        }
    }
}

fn receiver_loop(socket: UdpSocket, username: String, peers: PeerCache, running: Arc<AtomicBool>) {
    let mut buf = [0; MAX_DATAGRAM];

    while running.load(Relaxed) {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                if !running.load(Relaxed) {
                    // socket went away during teardown, clean stop
                    break;
                }
                log::warn!("receive error: {}", e);
                continue;
            }
        };

        let text = match str::from_utf8(&buf[..n]) {
            Ok(s) => s,
            Err(_) => {
                log::debug!("non-utf8 datagram from {}", addr);
                continue;
            }
        };

        match Inbound::parse(text) {
            Ok(Inbound::Reply(Response::Users(entries))) => {
                peers.replace(&username, entries);
                print_user_list(&peers);
            }
            Ok(Inbound::Reply(Response::Success(text)))
            | Ok(Inbound::Reply(Response::Error(text))) => {
                println!("Server: {}", text);
            }
            Ok(Inbound::Chat(chat)) => {
                println!("{}: {}", chat.sender, chat.body);
            }
            Err(e) => log::debug!("ignoring datagram from {}: {}", addr, e),
        }
    }
}

fn print_user_list(peers: &PeerCache) {
    let names = peers.usernames();
    if names.is_empty() {
        println!("No other users are online.");
        return;
    }

    println!("Online users:");
    for name in names {
        println!("- {}", name);
    }
}

pub const HELP_TEXT: &str = "Available commands:\n\
    /users - list online users\n\
    /msg <username> <message> - send a direct message\n\
    /quit or /exit - log out and exit\n\
    /help - show this message";

/// A parsed line of terminal input.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Users,
    Msg { to: String, body: String },
    Quit,
    Help,
}

impl Command {
    /// Parse one line of user input. The error side carries the guidance
    /// to print for input that is not a well-formed command.
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        let rest = match line.strip_prefix('/') {
            Some(rest) => rest,
            None => {
                return Err(
                    "Use /msg <username> <message> to send a message to a specific user."
                        .to_string(),
                )
            }
        };

        let (cmd, args) = match rest.split_once(char::is_whitespace) {
            Some((cmd, args)) => (cmd, args.trim()),
            None => (rest, ""),
        };

        match cmd.to_ascii_lowercase().as_str() {
            "users" => Ok(Command::Users),
            "msg" => match args.split_once(char::is_whitespace) {
                Some((to, body)) if !body.trim().is_empty() => Ok(Command::Msg {
                    to: to.to_string(),
                    body: body.trim().to_string(),
                }),
                _ => Err("Usage: /msg <username> <message>".to_string()),
            },
            "exit" | "quit" => Ok(Command::Quit),
            "help" => Ok(Command::Help),
            _ => Err("Unknown command. Type /help for available commands.".to_string()),
        }
    }
}
