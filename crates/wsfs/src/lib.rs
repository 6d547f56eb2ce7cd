#![forbid(unsafe_code)]
//! Asynchronous wsfs filesystem server library for Rust.
//!
//! This crate provides a tokio-based implementation of the server side of the
//! wsfs protocol: a compact binary protocol in which a client issues
//! filesystem commands (open, read, write, stat, ...) over a message
//! transport and receives status-coded responses.
//!
//! # Overview
//!
//! Each connection carries a stream of records. Every record is one command:
//!
//! ```text
//! client_mark[1] opcode[1] arguments...
//! ```
//!
//! The server decodes records strictly in order and runs each command's
//! handler on its own task, so a slow command never holds up the ones behind
//! it. Responses carry the client mark of their command back to the client;
//! their order on the wire is unspecified.
//!
//! # Getting Started
//!
//! 1. Implement the [`srv::Filesystem`] trait; commands you leave out answer
//!    [`Status::NotSupport`]
//! 2. Start the server with [`srv::srv_async`], or serve a single stream pair
//!    with [`srv::dispatch`]
//!
//! # Example
//!
//! ```no_run
//! use wsfs::{Result, ServerConfig, Status, srv::{Filesystem, Responder, srv_async}};
//! use async_trait::async_trait;
//!
//! struct MyFs;
//!
//! #[async_trait]
//! impl Filesystem for MyFs {
//!     async fn get_attr(&self, rsp: &Responder, path: &str) -> Result<()> {
//!         if path != "/" {
//!             return Err(Status::NotExists.into());
//!         }
//!         let mut reply = rsp.reply(Status::Ok)?;
//!         reply.put(&0o040755u32)?;
//!         rsp.send(reply).await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(MyFs, "tcp!127.0.0.1:7070", ServerConfig::default()).await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Arguments
//!
//! - integers are fixed width and little endian
//! - strings are UTF-8, terminated by one NUL byte
//! - a data argument comes last and runs to the end of the record; it is
//!   copied into a [`PooledBuf`] owned by the handler
//!
//! ## Framing
//!
//! Over TCP and unix sockets every record is preceded by its length as a
//! 32-bit little endian integer. See [`ServerConfig::framing`].
//!
//! ## Malformed records
//!
//! A record that cannot be decoded is answered with [`Status::Invalid`] and
//! the message [`BAD_COMMAND`], then the connection is closed. Handlers that
//! are already running finish first.
//!
//! # Error Handling
//!
//! Handlers return [`error::Error`]. Anything other than `Ok(())` is answered
//! with one response carrying [`error::Error::status`] and the error message.
//! [`Errno`] and [`std::io::Error`] convert into the matching [`Status`]:
//!
//! - `ENOENT` - [`Status::NotExists`]
//! - `EEXIST` - [`Status::Exists`]
//! - `EACCES` / `EPERM` - [`Status::Access`]
//! - `EBADF` - [`Status::InvalidFd`]
//! - `ENOTEMPTY` - [`Status::NotEmpty`]
//! - `ELOOP` - [`Status::Loop`]
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod config;
pub mod error;
pub mod fcall;
pub mod pool;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;
pub mod work;

pub use crate::config::ServerConfig;
pub use crate::error::{Errno, Error};
pub use crate::fcall::*;
pub use crate::pool::{BufferPool, PooledBuf};
pub use crate::utils::Result;
