//! # Clusterprofile Core
//!
//! Core library for loading per-cluster credential profiles.
//!
//! This crate provides:
//! - Profile definitions loaded from YAML ([`config`])
//! - The primary backend session with cache reuse, direct login and pivot
//!   delegation ([`session`])
//! - Secondary credential providers behind a type-tag registry ([`provider`])
//! - The plain-text credential cache with locked, atomic writes ([`cache`])
//! - The orchestrator tying them together ([`profile`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clusterprofile_core::{CacheFile, ClusterProfiles, TracingReporter, load_profiles};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let configs = load_profiles("/home/me/.clusterid/profiles".as_ref())?;
//! let profiles = ClusterProfiles::new(configs);
//!
//! let mut cache = CacheFile::open("/home/me/.clusterid/credentials")?;
//! let loaded = profiles
//!     .load("prod", cache.cache_mut(), &mut TracingReporter)
//!     .await?;
//! cache.commit()?;
//!
//! for line in &loaded.export_lines {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod credential;
pub mod error;
pub mod profile;
pub mod provider;
pub mod secret;
pub mod session;

// Re-export commonly used types at crate root
pub use backend::{BackendError, VaultClient};

pub use cache::{CacheError, CacheFile, CredentialCache};

pub use config::{
    ClusterConfig,
    ConfigError,
    MethodSettings,
    ProviderConfig,
    SessionConfig,
    load_profiles,
    parse_profiles,
};

pub use credential::{EnvVar, Lease};

pub use error::{ClusterProfileError, Result};

pub use profile::{
    ClusterProfiles,
    LoadedProfile,
    ProviderFailurePolicy,
    Reporter,
    RunEvent,
    TracingReporter,
};

pub use provider::{CredentialProvider, ProviderRegistry};

pub use secret::Secret;

pub use session::{PrimarySession, SessionState};
