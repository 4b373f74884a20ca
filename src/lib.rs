#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod id;
pub mod outbound;
pub mod plugin;
pub mod registry;
pub mod server;
pub mod signal;
pub mod timer;

pub use client::Client;
pub use codec::TypedMessage;
pub use config::EngineConfig;
pub use connection::{Connection, ConnectionState};
pub use engine::Engine;
pub use handler::{Callbacks, Event, Handler};
#[cfg(feature = "macros")]
pub use rivet_macros::TypedMessage;
pub use server::Server;
