//! IPC: unix-socket protocol for the human interface and worker channel

pub mod client;
pub mod listener;
pub mod messages;

pub use client::IpcClient;
pub use listener::{ControlPlane, serve};
pub use messages::{DecisionView, IpcRequest, IpcResponse, StatusView};
