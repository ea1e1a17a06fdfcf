pub mod command;
pub mod config;
mod errors;
pub mod memory;
pub mod module;
pub mod patcher;
pub mod pattern;
pub mod protection;
pub mod resolver;
pub mod store;
pub use config::{PatchDefinition, PatchEntry, PatcherConfig};
pub use errors::PatchError;
pub use patcher::{PatchStatus, Patcher};
pub use resolver::{ScanResolver, SignatureResolver};
pub type Result<T> = std::result::Result<T, PatchError>;
