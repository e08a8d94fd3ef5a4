//! Wire messages and their text codec.
//!
//! Every datagram is a UTF-8 line of the form `COMMAND:payload`. All
//! parsing and serialization lives here; the rest of the crate only ever
//! sees the typed messages.

use std::net::IpAddr;
use thiserror::Error;

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM: usize = 1024;

/// Characters that cannot appear in a username, as they delimit the
/// wire format itself.
const SEPARATORS: [char; 3] = [':', ',', ';'];

pub fn valid_username(name: &str) -> bool {
    !name.is_empty() && !name.contains(SEPARATORS)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing command separator")]
    MissingSeparator,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid registration payload")]
    BadRegister,
    #[error("invalid chat payload")]
    BadChat,
}

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { username: String, port: u16 },
    GetUsers,
    Heartbeat { username: String },
    Logout { username: String },
}

impl Request {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let (cmd, payload) = s.split_once(':').ok_or(ParseError::MissingSeparator)?;

        match cmd {
            "REGISTER" => {
                let (username, port) = payload.split_once(',').ok_or(ParseError::BadRegister)?;
                if !valid_username(username) {
                    return Err(ParseError::BadRegister);
                }
                let port = port.parse().map_err(|_| ParseError::BadRegister)?;
                Ok(Request::Register {
                    username: username.to_string(),
                    port,
                })
            }
            "GET_USERS" => Ok(Request::GetUsers),
            "HEARTBEAT" => Ok(Request::Heartbeat {
                username: payload.to_string(),
            }),
            "LOGOUT" => Ok(Request::Logout {
                username: payload.to_string(),
            }),
            _ => Err(ParseError::UnknownCommand(cmd.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::Register { username, port } => format!("REGISTER:{},{}", username, port),
            Request::GetUsers => "GET_USERS:".to_string(),
            Request::Heartbeat { username } => format!("HEARTBEAT:{}", username),
            Request::Logout { username } => format!("LOGOUT:{}", username),
        }
    }
}

/// One entry of a USERS listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub username: String,
    pub addr: IpAddr,
    pub port: u16,
}

/// Server-to-client replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(String),
    Error(String),
    Users(Vec<PeerEntry>),
}

impl Response {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let (cmd, payload) = s.split_once(':').ok_or(ParseError::MissingSeparator)?;

        match cmd {
            "SUCCESS" => Ok(Response::Success(payload.to_string())),
            "ERROR" => Ok(Response::Error(payload.to_string())),
            "USERS" => Ok(Response::Users(parse_user_list(payload))),
            _ => Err(ParseError::UnknownCommand(cmd.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Response::Success(text) => format!("SUCCESS:{}", text),
            Response::Error(text) => format!("ERROR:{}", text),
            Response::Users(entries) => {
                let mut out = String::from("USERS:");
                for e in entries {
                    out.push_str(&format!("{},{},{};", e.username, e.addr, e.port));
                }
                out
            }
        }
    }
}

// Entries that do not parse are skipped, one bad record should not void
// the rest of the listing.
fn parse_user_list(payload: &str) -> Vec<PeerEntry> {
    payload
        .split(';')
        .filter(|part| !part.is_empty())
        .filter_map(|part| {
            let mut fields = part.split(',');
            let username = fields.next()?.to_string();
            let addr = fields.next()?.parse().ok()?;
            let port = fields.next()?.parse().ok()?;
            if fields.next().is_some() || !valid_username(&username) {
                return None;
            }
            Some(PeerEntry {
                username,
                addr,
                port,
            })
        })
        .collect()
}

/// A direct peer-to-peer message. Never touches the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub sender: String,
    pub body: String,
}

impl Chat {
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        // The body may itself contain colons, only the first one delimits.
        let (sender, body) = payload.split_once(':').ok_or(ParseError::BadChat)?;
        if !valid_username(sender) {
            return Err(ParseError::BadChat);
        }
        Ok(Chat {
            sender: sender.to_string(),
            body: body.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        format!("CHAT:{}:{}", self.sender, self.body)
    }
}

/// Anything a client socket can legitimately receive: a server reply or a
/// chat datagram from another peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Reply(Response),
    Chat(Chat),
}

impl Inbound {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.strip_prefix("CHAT:") {
            Some(payload) => Chat::parse(payload).map(Inbound::Chat),
            None => Response::parse(s).map(Inbound::Reply),
        }
    }
}
