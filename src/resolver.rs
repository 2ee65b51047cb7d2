//! Self-Address Resolution
//!
//! Resolves a node's own logical name to a routable address. The name
//! typically becomes resolvable only once the platform has finished wiring
//! the node's network identity, so resolution is retried at a fixed
//! interval for a bounded number of attempts. A fixed interval keeps the
//! worst-case startup latency predictable; exhausting the attempts is fatal
//! because a node that does not know its own address cannot be reached by
//! peers and must not register.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};

/// Name-resolution primitive mapping a logical name to candidate addresses.
///
/// Any backend works (DNS, a service registry); the agent only requires
/// this lookup contract.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Look up all candidate addresses for a logical name
    async fn lookup(&self, logical_name: &str) -> Result<Vec<IpAddr>>;
}

/// DNS-backed resolver using the system resolver
pub struct DnsResolver;

#[async_trait]
impl NameResolver for DnsResolver {
    async fn lookup(&self, logical_name: &str) -> Result<Vec<IpAddr>> {
        // lookup_host needs a port; it is discarded from the results.
        let addrs = tokio::net::lookup_host((logical_name, 0))
            .await
            .map_err(|e| Error::Resolve(logical_name.to_string(), e.to_string()))?;

        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Deterministically select one routable address from a candidate set.
///
/// Candidates are sorted so that repeated lookups returning the same set in
/// a different order select the same address. Unspecified addresses
/// (0.0.0.0 / ::) are never routable and are filtered out.
pub fn select_address(logical_name: &str, mut candidates: Vec<IpAddr>) -> Result<IpAddr> {
    candidates.retain(|a| !a.is_unspecified());
    if candidates.is_empty() {
        return Err(Error::NoRoutableAddress(logical_name.to_string()));
    }
    candidates.sort();
    Ok(candidates[0])
}

/// Resolve a logical name, retrying under transient unavailability.
///
/// Each failed attempt (lookup error or empty candidate set) is logged as a
/// retry. After `max_resolve_retries` failures the error is fatal and the
/// caller must terminate the process.
pub async fn resolve_with_retry(
    resolver: &dyn NameResolver,
    logical_name: &str,
    config: &DiscoveryConfig,
) -> Result<IpAddr> {
    let max_attempts = config.max_resolve_retries.max(1);

    for attempt in 1..=max_attempts {
        match resolver.lookup(logical_name).await {
            Ok(candidates) if !candidates.is_empty() => {
                let address = select_address(logical_name, candidates)?;
                tracing::info!(
                    "Resolved '{}' to {} (attempt {}/{})",
                    logical_name,
                    address,
                    attempt,
                    max_attempts
                );
                return Ok(address);
            }
            Ok(_) => {
                tracing::warn!(
                    "'{}' resolved to no addresses yet, retrying ({}/{})",
                    logical_name,
                    attempt,
                    max_attempts
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Resolution of '{}' failed: {}, retrying ({}/{})",
                    logical_name,
                    e,
                    attempt,
                    max_attempts
                );
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(config.resolve_retry_interval()).await;
        }
    }

    Err(Error::ResolveExhausted {
        name: logical_name.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Resolver that fails a scripted number of times, then returns a
    /// fixed candidate set.
    pub(crate) struct FlakyResolver {
        pub failures: u32,
        pub candidates: Vec<IpAddr>,
        pub calls: AtomicU32,
    }

    impl FlakyResolver {
        pub fn new(failures: u32, candidates: Vec<IpAddr>) -> Self {
            Self {
                failures,
                candidates,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl NameResolver for FlakyResolver {
        async fn lookup(&self, logical_name: &str) -> Result<Vec<IpAddr>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Resolve(
                    logical_name.to_string(),
                    "name not found".into(),
                ))
            } else {
                Ok(self.candidates.clone())
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fast_config(max_retries: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            max_resolve_retries: max_retries,
            resolve_retry_interval_ms: 5000,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_address_is_deterministic() {
        let a = select_address("n", vec![ip("10.0.0.2"), ip("10.0.0.1")]).unwrap();
        let b = select_address("n", vec![ip("10.0.0.1"), ip("10.0.0.2")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, ip("10.0.0.1"));
    }

    #[test]
    fn test_select_address_skips_unroutable() {
        let a = select_address("n", vec![ip("0.0.0.0"), ip("10.0.0.5")]).unwrap();
        assert_eq!(a, ip("10.0.0.5"));

        let err = select_address("n", vec![ip("0.0.0.0")]).unwrap_err();
        assert!(matches!(err, Error::NoRoutableAddress(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_succeeds_after_retries() {
        let resolver = FlakyResolver::new(29, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        let config = fast_config(30);

        let addr = resolve_with_retry(&resolver, "keycloak-2", &config)
            .await
            .unwrap();
        assert_eq!(addr, ip("10.0.0.7"));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_exhaustion_is_fatal() {
        let resolver = FlakyResolver::new(u32::MAX, vec![]);
        let config = fast_config(30);

        let start = tokio::time::Instant::now();
        let err = resolve_with_retry(&resolver, "keycloak-2", &config)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ResolveExhausted { attempts: 30, .. }
        ));
        assert!(err.is_fatal());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 30);
        // 30 attempts with 29 five-second waits between them
        assert_eq!(start.elapsed().as_secs(), 145);
    }

    #[tokio::test]
    async fn test_empty_candidates_count_as_failures() {
        let resolver = FlakyResolver::new(0, vec![]);
        let config = DiscoveryConfig {
            max_resolve_retries: 3,
            resolve_retry_interval_ms: 1,
            ..Default::default()
        };

        let err = resolve_with_retry(&resolver, "keycloak-2", &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResolveExhausted { attempts: 3, .. }));
    }
}
