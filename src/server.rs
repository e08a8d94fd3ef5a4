//! Udp presence server.
//!
//! Keeps the directory of online peers and answers discovery queries.
//! Chat traffic never passes through here, peers exchange it directly.

use std::io::Result;
use std::net::SocketAddr;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::{task, time};

use crate::directory::{AlreadyTaken, Directory};
use crate::proto::{ParseError, PeerEntry, Request, Response, MAX_DATAGRAM};

/// A peer silent for longer than this is considered gone.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the reaper sweeps for silent peers.
pub const REAP_PERIOD: Duration = Duration::from_secs(5);

/// Udp rendezvous server
///
/// Tracks which peers are online and where, so they can find each other.
pub struct Server {
    socket: Arc<UdpSocket>,
    directory: Directory,
    reap_period: Duration,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
            directory: Directory::new(CLIENT_TIMEOUT),
            reap_period: REAP_PERIOD,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Every datagram is handed to its own task so a slow
    /// handler cannot stall the socket; the reaper runs as a background
    /// task on a fixed tick.
    pub async fn run(self) -> Result<()> {
        let directory = self.directory.clone();
        let reap_period = self.reap_period;
        task::spawn(async move {
            let mut tick = time::interval(reap_period);
            loop {
                tick.tick().await;
                for username in directory.evict_expired() {
                    log::info!("expired {}", username);
                }
            }
        });

        let mut buf = [0; MAX_DATAGRAM];
        loop {
            let (n, addr) = self.socket.recv_from(&mut buf).await?;

            let datagram = match str::from_utf8(&buf[..n]) {
                Ok(s) => s.to_string(),
                Err(_) => {
                    log::debug!("non-utf8 datagram from {}", addr);
                    continue;
                }
            };

            let socket = self.socket.clone();
            let directory = self.directory.clone();
            task::spawn(async move {
                handle_datagram(socket, directory, datagram, addr).await;
            });
        }
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    directory: Directory,
    datagram: String,
    addr: SocketAddr,
) {
    let req = match Request::parse(&datagram) {
        Ok(req) => req,
        Err(ParseError::BadRegister) => {
            // registration is the one command that NACKs a bad payload
            let resp = Response::Error("Invalid registration format".to_string());
            send_response(&socket, resp, addr).await;
            return;
        }
        Err(e) => {
            log::debug!("dropping datagram from {}: {}", addr, e);
            return;
        }
    };

    match req {
        Request::Register { username, port } => {
            handle_register(&socket, &directory, username, port, addr).await
        }
        Request::GetUsers => handle_get_users(&socket, &directory, addr).await,
        Request::Heartbeat { username } => {
            log::trace!("heartbeat {}", username);
            directory.touch(&username);
        }
        Request::Logout { username } => {
            log::debug!("logout {}", username);
            directory.remove(&username);
        }
    }
}

async fn handle_register(
    socket: &UdpSocket,
    directory: &Directory,
    username: String,
    port: u16,
    addr: SocketAddr,
) {
    // the address comes from the packet source, only the port is claimed
    let resp = match directory.register(&username, addr.ip(), port) {
        Ok(()) => {
            log::info!("registered {} at {}:{}", username, addr.ip(), port);
            Response::Success("Registration successful".to_string())
        }
        Err(AlreadyTaken) => {
            log::debug!("register {}: name already taken", username);
            Response::Error("Username already taken".to_string())
        }
    };

    send_response(socket, resp, addr).await;
}

async fn handle_get_users(socket: &UdpSocket, directory: &Directory, addr: SocketAddr) {
    let entries = directory
        .snapshot()
        .into_iter()
        .map(|record| PeerEntry {
            username: record.username,
            addr: record.addr,
            port: record.port,
        })
        .collect();

    send_response(socket, Response::Users(entries), addr).await;
}

async fn send_response(socket: &UdpSocket, resp: Response, addr: SocketAddr) {
    let _ = socket.send_to(resp.encode().as_bytes(), addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server(timeout: Duration, reap_period: Duration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = Server {
            socket: Arc::new(socket),
            directory: Directory::new(timeout),
            reap_period,
        };
        let addr = server.local_addr().unwrap();
        task::spawn(async move { server.run().await });
        addr
    }

    async fn exchange(socket: &UdpSocket, server: SocketAddr, msg: &str) -> String {
        socket.send_to(msg.as_bytes(), server).await.unwrap();
        recv(socket).await
    }

    async fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0; MAX_DATAGRAM];
        let (n, _) = time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("no reply from server")
            .unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn register_then_query() {
        let server = spawn_server(CLIENT_TIMEOUT, REAP_PERIOD).await;
        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let reply = exchange(&alice, server, "REGISTER:alice,5000").await;
        assert_eq!(reply, "SUCCESS:Registration successful");

        let reply = exchange(&bob, server, "REGISTER:bob,6000").await;
        assert_eq!(reply, "SUCCESS:Registration successful");

        let reply = exchange(&alice, server, "GET_USERS:").await;
        let entries = match Response::parse(&reply) {
            Ok(Response::Users(entries)) => entries,
            other => panic!("unexpected reply {:?}", other),
        };

        // the requester is not filtered out
        assert_eq!(entries.len(), 2);
        let bob_entry = entries.iter().find(|e| e.username == "bob").unwrap();
        assert_eq!(
            bob_entry.addr,
            "127.0.0.1".parse::<std::net::IpAddr>().unwrap()
        );
        assert_eq!(bob_entry.port, 6000);
    }

    #[tokio::test]
    async fn duplicate_register_gets_exactly_one_success() {
        let server = spawn_server(CLIENT_TIMEOUT, REAP_PERIOD).await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        first.send_to(b"REGISTER:carol,5000", server).await.unwrap();
        second
            .send_to(b"REGISTER:carol,6000", server)
            .await
            .unwrap();

        let mut replies = vec![recv(&first).await, recv(&second).await];
        replies.sort();

        assert_eq!(
            replies,
            vec![
                "ERROR:Username already taken".to_string(),
                "SUCCESS:Registration successful".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_and_logout_send_no_reply() {
        let server = spawn_server(CLIENT_TIMEOUT, REAP_PERIOD).await;
        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        exchange(&alice, server, "REGISTER:alice,5000").await;

        // neither command is acknowledged, so the next datagram we see
        // must be the USERS reply
        alice.send_to(b"HEARTBEAT:alice", server).await.unwrap();
        alice.send_to(b"HEARTBEAT:ghost", server).await.unwrap();
        let reply = exchange(&alice, server, "GET_USERS:").await;
        assert!(reply.starts_with("USERS:"), "got {}", reply);
        assert!(reply.contains("alice"));

        alice.send_to(b"LOGOUT:alice", server).await.unwrap();
        let reply = exchange(&alice, server, "GET_USERS:").await;
        assert_eq!(reply, "USERS:");
    }

    #[tokio::test]
    async fn malformed_datagrams_do_not_kill_the_loop() {
        let server = spawn_server(CLIENT_TIMEOUT, REAP_PERIOD).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        socket.send_to(b"no separator here", server).await.unwrap();
        socket.send_to(b"BOGUS:payload", server).await.unwrap();
        socket.send_to(&[0xff, 0xfe, 0x00], server).await.unwrap();

        let reply = exchange(&socket, server, "GET_USERS:").await;
        assert_eq!(reply, "USERS:");
    }

    #[tokio::test]
    async fn bad_register_payload_is_nacked() {
        let server = spawn_server(CLIENT_TIMEOUT, REAP_PERIOD).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let reply = exchange(&socket, server, "REGISTER:alice").await;
        assert_eq!(reply, "ERROR:Invalid registration format");

        let reply = exchange(&socket, server, "REGISTER:alice,notaport").await;
        assert_eq!(reply, "ERROR:Invalid registration format");
    }

    #[tokio::test]
    async fn reaper_evicts_silent_peer() {
        let server = spawn_server(Duration::from_millis(200), Duration::from_millis(50)).await;
        let alice = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        exchange(&alice, server, "REGISTER:alice,5000").await;
        time::sleep(Duration::from_millis(500)).await;

        let reply = exchange(&alice, server, "GET_USERS:").await;
        assert_eq!(reply, "USERS:");
    }

    #[tokio::test]
    async fn heartbeat_keeps_peer_alive() {
        let server = spawn_server(Duration::from_millis(300), Duration::from_millis(50)).await;
        let bob = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        exchange(&bob, server, "REGISTER:bob,6000").await;
        for _ in 0..6 {
            time::sleep(Duration::from_millis(100)).await;
            bob.send_to(b"HEARTBEAT:bob", server).await.unwrap();
        }

        let reply = exchange(&bob, server, "GET_USERS:").await;
        assert!(reply.contains("bob"), "got {}", reply);
    }
}
