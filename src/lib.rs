//!A UDP presence directory with direct peer-to-peer messaging.
//!
//!A rendezvous server keeps a directory of online peers, mapping each
//!username to the address the server observed and the port the peer announced.
//!Peers register once, then keep their record alive with periodic heartbeats;
//!a server-side reaper evicts anyone silent for too long.
//!
//!## How it works
//!A client registers its username and listening port, then queries the server
//!for the current user listing. Messages between peers travel directly from
//!socket to socket, the server never relays chat traffic.
//!
//!Everything rides on plain UDP and stays best effort: no delivery guarantee,
//!no ordering, no acknowledgment beyond the registration reply. Loss is
//!tolerated by retry and timeout.
//!
//!## Feature flags
//!For convenience, the crate includes both client and server code by default.
//!Mostly you only use one side, set features to `client` or `server` instead.
//!
//!```text
//!roster = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: blocking-socket chat session
//!- `server`: async rendezvous server

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod directory;
pub mod proto;
#[cfg(feature = "server")]
pub mod server;
