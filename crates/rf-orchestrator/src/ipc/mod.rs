//! IPC server for admin clients
//!
//! Newline-delimited JSON over a localhost TCP socket. Every connected
//! client also receives the push events of the orchestrator.

mod server;

pub use server::IpcServer;
