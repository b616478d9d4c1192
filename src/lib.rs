pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use config::ClientConfig;
pub use errors::{SparrowError, SparrowResult};
pub use state::{ClientSession, Collaborators};
