pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod middleware;
pub mod normalizer;
pub mod server;
pub mod upstream;

// Re-export commonly used types for easier access
pub use config::{Config, load_config};
pub use dispatcher::Dispatcher;
pub use errors::{AppError, AppResult};
pub use server::{AppState, create_app, start_server};
