//! Client library for the [Chatango](https://chatango.com) group-chat
//! service.
//!
//! Chatango speaks a line-oriented, colon-delimited command protocol over
//! WebSocket, sharded across around 85 servers that are looked up with an
//! in-house name digest. This crate covers the whole client side of that:
//! resolving the shard for a room, keeping one long-lived connection per
//! room (with keep-alive and reconnect), parsing inbound commands into
//! typed [`Event`]s, and maintaining the authoritative room state: the
//! participant roster, the bounded message history, moderator and ban
//! tables, and the two-phase message-id reconciliation.
//!
//! Join a single room with [`Room::listen`], or let a [`Client`] own several
//! rooms plus an optional PM session and read the merged event stream:
//!
//! ```no_run
//! use chatango_tokio::{Client, Event};
//!
//! # async fn run() -> chatango_tokio::Result<()> {
//! let mut client = Client::new("mybot", "hunter2");
//! client.run(&["examplegroup"], false).await?;
//! while let Some((room, event)) = client.next_event().await {
//!     if let Event::Message(msg) = event {
//!         println!("[{}] {}: {}", room, msg.user.name(), msg.body);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod error;
mod event;
mod hasher;
mod pm;
mod rest;
mod room;
mod server;
mod wire;

/// Struct and enum definitions of values in the Chatango model.
pub mod model;

pub use client::Client;
pub use connection::FrameReader;
pub use error::{Error, Result};
pub use event::{Event, EventBus};
pub use hasher::{chatango_digest, Hasher};
pub use model::{
    anon_name, Channel, Message, MessageFlags, ModeratorFlags, Styles, User, UserAttrs,
    UserRegistry,
};
pub use pm::{Pm, PM_NAME};
pub use rest::get_token;
pub use room::{BanRecord, Room, RoomFlags};
pub use server::get_server;
