#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod feed;
pub mod index;
pub mod query;
pub mod stats;

pub use cache::{CacheState, LookupCache};
pub use config::LookupConfig;
pub use error::{LookupError, Result};
