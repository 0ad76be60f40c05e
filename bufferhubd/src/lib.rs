use bufferhub::BufferHubError;
use thiserror::Error;

pub mod client;
pub mod config;
pub(crate) mod convert;
pub mod server;
pub(crate) mod session;
pub(crate) mod wire;

pub use client::HubClient;
pub use config::Config;
pub use server::Server;

#[derive(Error, Debug)]
pub enum HubdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
    #[error("Buffer hub error: {0}")]
    BufferHub(#[from] BufferHubError),
    #[error("Archive error: {0}")]
    Archive(#[from] rkyv::rancor::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connection closed")]
    Disconnected,
    #[error("Listener thread panicked")]
    ListenerPanicked,
}

pub type Result<T> = std::result::Result<T, HubdError>;
