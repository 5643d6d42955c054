//! Local simulation driving a limiter and a distributed cache
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::distributed::ShardStats;
use crate::cache::{Cache, CachePolicy, DistributedCache};
use crate::clock;
use crate::error::Result;
use crate::limiters::{Algorithm, Limiter, RateLimiter};
use crate::settings::{LimiterSettings, Settings};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientReport {
    pub client: String,
    pub admitted: usize,
    pub denied: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct LimiterReport {
    pub algorithm: Algorithm,
    pub settings: LimiterSettings,
    pub clients: Vec<ClientReport>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CacheReport {
    pub policy: CachePolicy,
    pub keys: usize,
    pub shards: Vec<ShardStats>,
    /// Node added after filling the cache
    pub added_node: String,
    /// Keys whose owner changed when `added_node` joined
    pub relocated_on_add: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub limiter: LimiterReport,
    pub cache: CacheReport,
}

/// Fire `requests_per_client` back-to-back calls for each client
pub async fn simulate_limiter(settings: &Settings) -> Result<LimiterReport> {
    let limiter = Limiter::from_settings(&settings.limiter)?;
    let mut clients = Vec::with_capacity(settings.clients);
    for i in 0..settings.clients {
        let client = format!("client-{}", i);
        let admitted = (0..settings.requests_per_client)
            .filter(|_| limiter.allow(&client))
            .count();
        let denied = settings.requests_per_client - admitted;
        debug!(
            "[{}] {} admitted {} denied {}",
            limiter.name(),
            client,
            admitted,
            denied
        );
        clients.push(ClientReport {
            client,
            admitted,
            denied,
        });
    }
    limiter.stop().await?;
    Ok(LimiterReport {
        algorithm: limiter.algorithm(),
        settings: settings.limiter.clone(),
        clients,
    })
}

/// Fill a sharded cache, then add one node and count relocated keys
pub fn simulate_cache(settings: &Settings) -> Result<CacheReport> {
    let cache: DistributedCache<usize> = DistributedCache::with_options(
        settings.cache_nodes,
        settings.cache_policy,
        settings.cache_capacity_per_node,
        settings.virtual_nodes,
        clock::system_clock(),
    )?;
    let keys: Vec<String> = (0..settings.cache_keys)
        .map(|i| format!("key_{}", i))
        .collect();
    let mut owners = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        cache.set(key, i, None);
        owners.push(cache.node_for(key)?);
    }
    let shards = cache.shard_stats();

    let added_node = format!("node-{}", settings.cache_nodes);
    cache.add_node(&added_node)?;
    let mut relocated_on_add = 0;
    for (key, owner) in keys.iter().zip(&owners) {
        if cache.node_for(key)? != *owner {
            relocated_on_add += 1;
        }
    }
    info!(
        "Adding {} relocated {} of {} keys",
        added_node,
        relocated_on_add,
        keys.len()
    );

    Ok(CacheReport {
        policy: settings.cache_policy,
        keys: keys.len(),
        shards,
        added_node,
        relocated_on_add,
    })
}

pub async fn run(settings: &Settings) -> Result<Report> {
    settings.validate()?;
    let limiter = simulate_limiter(settings).await?;
    let cache = simulate_cache(settings)?;
    Ok(Report { limiter, cache })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(algorithm: Algorithm) -> Settings {
        Settings {
            limiter: LimiterSettings::from_rate(algorithm, 10, Duration::from_secs(60)),
            clients: 2,
            requests_per_client: 15,
            cache_policy: CachePolicy::Lru,
            cache_nodes: 3,
            cache_capacity_per_node: 1_000,
            virtual_nodes: 100,
            cache_keys: 900,
            json: false,
        }
    }

    #[tokio::test]
    async fn every_algorithm_admits_exactly_the_limit() {
        for algorithm in Algorithm::ALL {
            let report = simulate_limiter(&settings(algorithm)).await.unwrap();
            assert_eq!(report.algorithm, algorithm);
            for client in report.clients {
                assert_eq!(client.admitted, 10, "{}", algorithm);
                assert_eq!(client.denied, 5, "{}", algorithm);
            }
        }
    }

    #[tokio::test]
    async fn report_serializes() {
        let report = run(&settings(Algorithm::SlidingCounter)).await.unwrap();
        assert_eq!(report.cache.shards.len(), 3);
        assert_eq!(
            report.cache.shards.iter().map(|s| s.entries).sum::<usize>(),
            900
        );
        assert!(report.cache.relocated_on_add < 900 / 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["limiter"]["algorithm"], "sliding-counter");
        assert_eq!(json["limiter"]["settings"]["algorithm"], "sliding-counter");
        assert_eq!(json["cache"]["added_node"], "node-3");
    }
}
