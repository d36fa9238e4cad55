//! Profile orchestration.
//!
//! [`ClusterProfiles`] turns a profile name into the credential lines a shell
//! needs. A load run:
//!
//! 1. resolves the profile's [`ClusterConfig`] and its cached lines
//! 2. authenticates the primary session, following the pivot chain
//! 3. reuses or regenerates every configured provider, in declared order
//! 4. replaces the profile's cache entry with the merged lines
//!
//! All cache changes are staged on a copy of the [`CredentialCache`] and only
//! handed back when the whole run succeeds, so a failed run leaves the cache
//! untouched.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::cache::CredentialCache;
use crate::config::ClusterConfig;
use crate::credential::{parse_assignment, EnvVar, PROFILE_VAR};
use crate::error::{ClusterProfileError, Result};
use crate::provider::ProviderRegistry;
use crate::session::{PrimarySession, SESSION_VARS};

/// What happens when a secondary provider fails to generate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderFailurePolicy {
    /// Abort the run; nothing is written to the cache.
    #[default]
    Abort,
    /// Report the failure and continue without the provider's lines.
    Skip,
}

/// Notable steps of a load run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    SessionReused { profile: String },
    SessionAuthenticated { profile: String },
    PivotResolved { profile: String, pivot: String },
    ProviderReused { profile: String, kind: String },
    ProviderGenerated { profile: String, kind: String },
    /// The provider contributed nothing to the run.
    ProviderSkipped {
        profile: String,
        kind: String,
        reason: String,
    },
}

/// Sink for [`RunEvent`]s.
pub trait Reporter {
    fn report(&mut self, event: RunEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, event: RunEvent) {
        match event {
            RunEvent::SessionReused { profile } => {
                tracing::info!("Reusing cached session for {}", profile)
            }
            RunEvent::SessionAuthenticated { profile } => {
                tracing::info!("Authenticated session for {}", profile)
            }
            RunEvent::PivotResolved { profile, pivot } => {
                tracing::info!("Session for {} delegated through {}", profile, pivot)
            }
            RunEvent::ProviderReused { profile, kind } => {
                tracing::debug!("Reusing cached {} credentials for {}", kind, profile)
            }
            RunEvent::ProviderGenerated { profile, kind } => {
                tracing::debug!("Generated {} credentials for {}", kind, profile)
            }
            RunEvent::ProviderSkipped {
                profile,
                kind,
                reason,
            } => tracing::warn!("Skipping {} provider for {}: {}", kind, profile, reason),
        }
    }
}

impl Reporter for Vec<RunEvent> {
    fn report(&mut self, event: RunEvent) {
        self.push(event);
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedProfile {
    pub name: String,
    /// `export NAME="VALUE"` lines for the renderer.
    pub export_lines: Vec<String>,
    /// `NAME="VALUE"` lines now stored under `name`.
    pub cache_lines: Vec<String>,
}

/// Loaded profile definitions and the collaborators needed to run them.
pub struct ClusterProfiles {
    configs: HashMap<String, ClusterConfig>,
    registry: ProviderRegistry,
    http: reqwest::Client,
    failure_policy: ProviderFailurePolicy,
}

impl ClusterProfiles {
    /// Profiles with the built-in providers and the `Abort` policy.
    pub fn new(configs: HashMap<String, ClusterConfig>) -> Self {
        Self {
            configs,
            registry: ProviderRegistry::with_defaults(),
            http: reqwest::Client::new(),
            failure_policy: ProviderFailurePolicy::default(),
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_failure_policy(mut self, policy: ProviderFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn config(&self, profile: &str) -> Result<&ClusterConfig> {
        self.configs
            .get(profile)
            .ok_or_else(|| ClusterProfileError::ConfigNotFound {
                profile: profile.to_string(),
            })
    }

    /// Sorted names of all configured profiles.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.configs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Load a profile, reusing cached credentials where still valid.
    ///
    /// On success `cache` holds the new entry for `profile` (and for any pivot
    /// profile that was authenticated). On error `cache` is unchanged.
    pub async fn load(
        &self,
        profile: &str,
        cache: &mut CredentialCache,
        reporter: &mut dyn Reporter,
    ) -> Result<LoadedProfile> {
        let config = self.config(profile)?;
        let mut run = Run {
            profiles: self,
            staged: cache.clone(),
            sessions: HashMap::new(),
            reporter,
        };

        let mut chain = Vec::new();
        run.authenticate(profile, &mut chain).await?;
        let loaded = run.collect(config).await?;

        *cache = run.staged;
        Ok(loaded)
    }

    /// Cached lines of a configured profile; empty if nothing is cached.
    pub fn show<'c>(&self, profile: &str, cache: &'c CredentialCache) -> Result<&'c [String]> {
        self.config(profile)?;
        Ok(cache.lines(profile).unwrap_or_default())
    }

    /// Drop a profile's cached entry, whether or not it is still configured.
    pub fn remove(&self, profile: &str, cache: &mut CredentialCache) -> Result<()> {
        remove(profile, cache)
    }
}

/// Drop a profile's cached entry.
pub fn remove(profile: &str, cache: &mut CredentialCache) -> Result<()> {
    match cache.remove(profile) {
        Some(_) => {
            tracing::info!("Removed cached credentials for {}", profile);
            Ok(())
        }
        None => Err(ClusterProfileError::CacheEntryNotFound {
            profile: profile.to_string(),
        }),
    }
}

type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// State of one load run.
struct Run<'a> {
    profiles: &'a ClusterProfiles,
    staged: CredentialCache,
    sessions: HashMap<String, PrimarySession>,
    reporter: &'a mut dyn Reporter,
}

impl<'a> Run<'a> {
    /// Ensure `sessions` holds an authenticated session for `profile`.
    ///
    /// `chain` holds the profiles currently being resolved.
    fn authenticate<'r>(
        &'r mut self,
        profile: &'r str,
        chain: &'r mut Vec<String>,
    ) -> LocalBoxFuture<'r, Result<()>> {
        Box::pin(async move {
            if self.sessions.contains_key(profile) {
                return Ok(());
            }
            if chain.iter().any(|name| name == profile) {
                chain.push(profile.to_string());
                return Err(ClusterProfileError::PivotCycle {
                    chain: chain.join(" -> "),
                });
            }
            chain.push(profile.to_string());

            let profiles = self.profiles;
            let config = profiles.config(profile)?;
            let mut session =
                PrimarySession::new(profile, config.session.clone(), profiles.http.clone())?;

            let cached = self.staged.lines(profile).unwrap_or_default();
            if session.load_cached(cached) {
                self.reporter.report(RunEvent::SessionReused {
                    profile: profile.to_string(),
                });
            } else if let Some(pivot) = session.pivot_profile().map(str::to_string) {
                self.authenticate(&pivot, chain).await?;
                let pivot_lease = self.write_back_pivot(&pivot)?;
                session.authenticate_delegated(&pivot_lease).await?;
                self.reporter.report(RunEvent::PivotResolved {
                    profile: profile.to_string(),
                    pivot,
                });
            } else {
                session.authenticate().await?;
                self.reporter.report(RunEvent::SessionAuthenticated {
                    profile: profile.to_string(),
                });
            }

            chain.pop();
            self.sessions.insert(profile.to_string(), session);
            Ok(())
        })
    }

    /// Store the pivot session's variables under the pivot's own name and
    /// return its lease.
    fn write_back_pivot(&mut self, pivot: &str) -> Result<crate::credential::Lease> {
        let session = self
            .sessions
            .get(pivot)
            .ok_or_else(|| ClusterProfileError::ConfigNotFound {
                profile: pivot.to_string(),
            })?;
        let existing = self.staged.lines(pivot).unwrap_or_default();
        let merged = merge_session_lines(pivot, existing, &session.cache_lines());
        let lease = session.lease().clone();
        self.staged.replace(pivot, merged);
        Ok(lease)
    }

    /// Run the profile's providers and stage its merged entry.
    async fn collect(&mut self, config: &ClusterConfig) -> Result<LoadedProfile> {
        let profile = config.name.as_str();
        let session = self
            .sessions
            .get(profile)
            .ok_or_else(|| ClusterProfileError::ConfigNotFound {
                profile: profile.to_string(),
            })?;
        let vault = session.client();
        let cached = self.staged.lines(profile).unwrap_or_default().to_vec();

        let identity = EnvVar::new(PROFILE_VAR, profile);
        let mut export_lines = vec![identity.export_line()];
        let mut cache_lines = vec![identity.cache_line()];
        export_lines.extend(session.export_lines());
        cache_lines.extend(session.cache_lines());

        for provider_config in &config.providers {
            let kind = provider_config.kind.clone();
            let Some(mut provider) = self.profiles.registry.create(provider_config, &vault) else {
                self.reporter.report(RunEvent::ProviderSkipped {
                    profile: profile.to_string(),
                    kind,
                    reason: "unknown provider type".to_string(),
                });
                continue;
            };

            provider.load_cached(&cached);
            if provider.is_loaded() {
                self.reporter.report(RunEvent::ProviderReused {
                    profile: profile.to_string(),
                    kind: kind.clone(),
                });
            } else {
                match provider.generate().await {
                    Ok(()) => self.reporter.report(RunEvent::ProviderGenerated {
                        profile: profile.to_string(),
                        kind: kind.clone(),
                    }),
                    Err(e) if self.profiles.failure_policy == ProviderFailurePolicy::Skip => {
                        self.reporter.report(RunEvent::ProviderSkipped {
                            profile: profile.to_string(),
                            kind,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if provider.is_loaded() {
                export_lines.extend(provider.export_lines());
                cache_lines.extend(provider.cache_lines());
            } else {
                tracing::debug!("{} provider for {} produced no credentials", kind, profile);
            }
        }

        self.staged.replace(profile, cache_lines.clone());
        Ok(LoadedProfile {
            name: profile.to_string(),
            export_lines,
            cache_lines,
        })
    }
}

/// Replace the session variables of a cached entry, keeping everything else.
///
/// The identity line is rewritten first, followed by the session lines and
/// then the entry's remaining lines in their original order.
fn merge_session_lines(profile: &str, existing: &[String], session_lines: &[String]) -> Vec<String> {
    let mut merged = vec![EnvVar::new(PROFILE_VAR, profile).cache_line()];
    merged.extend_from_slice(session_lines);
    merged.extend(existing.iter().cloned().filter(|line| {
        parse_assignment(line)
            .is_none_or(|var| var.name != PROFILE_VAR && !SESSION_VARS.contains(&var.name.as_str()))
    }));
    merged
}
