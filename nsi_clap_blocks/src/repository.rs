//! Config for the namespace interface repository.

use std::time::Duration;

/// Default time an unreferenced namespace interface is kept before teardown.
pub const DEFAULT_INTERFACE_EXPIRATION: &str = "60s";

/// CLI config for the namespace interface repository.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct RepositoryConfig {
    /// How long a namespace interface is kept alive after its last user released it.
    ///
    /// A new request arriving inside this window reuses the existing interface instead of
    /// repeating the handshake with every shard owner. Zero tears interfaces down as soon as
    /// they are unreferenced.
    #[clap(
        long = "namespace-interface-expiration",
        env = "NSI_NAMESPACE_INTERFACE_EXPIRATION",
        default_value = DEFAULT_INTERFACE_EXPIRATION,
        value_parser = humantime::parse_duration,
        action
    )]
    pub interface_expiration: Duration,
}

impl RepositoryConfig {
    /// Config with the given expiration.
    pub fn with_expiration(interface_expiration: Duration) -> Self {
        Self {
            interface_expiration,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            interface_expiration: Duration::from_secs(60),
        }
    }
}
