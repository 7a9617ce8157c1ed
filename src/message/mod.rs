//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send`, `recv`
//! and `try_recv` operations for a given transport layer; an in-process
//! channel group and a pure-Rust TCP transport are included. Messages
//! exchanged by schedulers are `Message` envelopes, and a `Mailbox` sorts
//! them by step.
//!

mod backoff;
pub mod comm;
pub mod envelope;
pub mod local;
pub mod mailbox;
pub mod tcp;

pub use comm::Communicator;
pub use envelope::Message;
pub use local::ChannelCommunicator;
pub use mailbox::Mailbox;
pub use tcp::TcpCommunicator;
