//! Wire protocols for the companion-controller serial link.

pub mod ipc;
pub mod ipc_cmd;
