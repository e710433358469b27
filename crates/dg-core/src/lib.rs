//! dg-core: Session policy, templating and configuration for dockgate
//!
//! This crate holds the data shared by every stage of a gateway session:
//! the per-connection [`SessionPolicy`], the environment it carries, the
//! `{{.Field}}` argument templates rendered against it, shell-word
//! splitting, and the gateway configuration file.

pub mod config;
pub mod env;
pub mod error;
pub mod policy;
pub mod template;
pub mod words;

pub use env::Environment;
pub use error::{ConfigError, SplitError, TemplateError};
pub use policy::{AuthMethod, PolicyPatch, SessionPolicy};
