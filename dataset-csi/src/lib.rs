pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod locationdb;
pub mod mount;
pub mod node;
pub mod stage;

pub use config::{DriverConfig, IndexParams, StageParams};
pub use error::{CatalogError, LocationDbError, MountError, NodeError, StageError};
pub use node::NodeServer;
pub use stage::Stager;
