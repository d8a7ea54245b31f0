pub mod config;
pub mod models;
pub mod upload;

pub use config::*;
pub use models::*;
pub use upload::*;
