// Export modules
pub mod attacks;
pub mod bitslice;
pub mod compute;
pub mod config;
pub mod error;
pub mod hitag2;
pub mod nonces;
pub mod utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
