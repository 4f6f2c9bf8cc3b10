//! Configuration system for vantage.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/vantage/config.toml`
//! 3. User config: `~/.config/vantage/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! No file is required; every setting has a default.
//!
//! # Merge Behavior
//!
//! - **Lists** (whitelist, local_pki_anchors) are **merged** (appended)
//! - **Scalars** (listen, timeouts, switches) are **overridden** when set
//!
//! ```toml
//! [proxy]
//! listen = "127.0.0.1:2876"
//! whitelist = ["*.corp.example"]
//! upstream = "socks5://127.0.0.1:9050"
//!
//! [timeouts]
//! notary_query_ms = 8000
//!
//! [cache]
//! enabled = true
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    CacheConfig, Config, NotariesConfig, ProxySection, TimeoutsConfig, TrustConfig,
    DEFAULT_LISTEN,
};
