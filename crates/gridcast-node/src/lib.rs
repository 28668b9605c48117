//! gridcast-node: the render-node daemon.
//!
//! Every node on the segment runs this same program. It discovers peers
//! over UDP broadcast, replicates the master's mapping document, and keeps
//! the shared `synced/` tree identical across the cluster.

pub mod cli;
pub mod messenger;
pub mod node;
pub mod player;
pub mod presence;
pub mod project;
pub mod receiver;
pub mod server;
pub mod session;
pub mod status;
pub mod sync;

pub use cli::Cli;
pub use node::Node;
