pub mod app;
pub mod config;
pub mod deploy;
pub mod error;
pub mod middleware;
pub mod server;
pub mod supervisor;

pub use error::StorefrontError;
