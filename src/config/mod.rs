//! Worker and per-site configuration.
//!
//! `WorkerSettings` is read once from the environment at startup and passed
//! by handle; `SiteConfig` is derived per job from the site row plus the
//! global settings table.

pub mod settings;
pub mod site;

pub use settings::WorkerSettings;
pub use site::{merge_blocklists, Blocklist, SiteConfig};
