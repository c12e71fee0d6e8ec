pub mod broadcast;
pub mod config;
pub mod contracts;
pub mod error;
pub mod headers;
pub mod identifier;
pub mod instance;
pub mod join;
pub mod lease;
pub mod multicast;
pub mod partner;
pub mod persistence;
pub mod ping;
pub mod printout;
pub mod ring;
pub mod routing;
pub mod node;
pub mod token;
pub mod token_manager;

pub use config::Config;
pub use error::{FederationError, Result};
pub use identifier::{NodeId, NodeIdRange};
pub use instance::NodeInstance;
pub use node::Node;
