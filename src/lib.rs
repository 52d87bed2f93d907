//! Cellular modem communication stack.
//!
//! Carries AT-command traffic and IP datagrams over a single serial link
//! by multiplexing the byte transport with the 3GPP 27.010 ("CMUX")
//! protocol. One DLCI channel keeps running AT-command conversations
//! while another carries a PPP-framed datagram stream toward the host
//! network stack.
//!
//! The building blocks compose freely; [`cellular::Cellular`] wires them
//! into a ready-made connection supervisor:
//!
//! - [`pipe::Pipe`] — uniform non-blocking byte channel with event
//!   callbacks.
//! - [`backend::uart::UartBackend`] — interrupt-driven serial transport.
//! - [`cmux::Cmux`] — 27.010 framer and per-DLCI channel pipes.
//! - [`chat::Chat`] — scripted AT-command runner.
//! - [`ppp::Ppp`] — HDLC-like PPP framing toward the network stack.
//!
//! Everything executes on a single cooperative [`work::Worker`] the
//! application pumps; interrupt-context code only touches ring buffers
//! and submits work.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod backend;
pub mod cellular;
pub mod chat;
pub mod cmux;
mod collections;
pub mod error;
pub mod pipe;
pub mod ppp;
pub mod work;

pub use self::error::{Error, Result};
pub use self::pipe::{Pipe, PipeEvent, PipeOps};
pub use self::work::Worker;
