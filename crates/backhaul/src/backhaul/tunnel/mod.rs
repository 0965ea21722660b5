//! Reverse tunnel: public connections on the server are multiplexed as
//! `OPEN`/`DATA`/`CLOSE` frames over one control stream to the client, which
//! relays each of them to a fixed target.
//!
//! Server side: [`listener`] accepts public sockets, [`controller`] pumps
//! each one through a [`session`], [`service`] owns the registry and the
//! bound stream. Client side: [`router`] demultiplexes frames and spawns a
//! [`handler`] per connection. [`mux`] is shared by both ends and is the only
//! writer of the control stream.

pub mod client;
pub mod controller;
pub mod frame;
pub mod handler;
pub mod listener;
pub mod mux;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;
