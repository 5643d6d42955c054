//! CLI for the wren simulation binary
//!
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::limiters::Algorithm;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[clap(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Rate limit settings: algorithm
    #[clap(
        long,
        default_value = "token-bucket",
        env("WREN_ALGORITHM"),
        help = "token-bucket, leaky-bucket, fixed-window, sliding-log or sliding-counter"
    )]
    pub algorithm: Algorithm,

    // Rate limit settings: max calls (over interval)
    #[clap(
        long,
        default_value = "10",
        env("WREN_MAX_CALLS"),
        help = "Max calls allowed per interval"
    )]
    pub max_calls: u32,

    // Rate limit settings: interval in milliseconds
    #[clap(
        long,
        default_value = "1000",
        env("WREN_INTERVAL_MS"),
        help = "Interval in milliseconds to check limit"
    )]
    pub interval_ms: u64,

    #[clap(
        long,
        default_value = "3",
        env("WREN_CLIENTS"),
        help = "Number of simulated clients"
    )]
    pub clients: usize,

    #[clap(
        long,
        default_value = "15",
        env("WREN_REQUESTS"),
        help = "Back-to-back requests fired per client"
    )]
    pub requests: usize,

    #[clap(
        long,
        default_value = "lru",
        env("WREN_CACHE_POLICY"),
        help = "Eviction policy of each cache node: 'lru' or 'lfu'"
    )]
    pub cache_policy: CachePolicy,

    #[clap(
        long,
        default_value = "3",
        env("WREN_CACHE_NODES"),
        help = "Number of distributed cache nodes"
    )]
    pub cache_nodes: usize,

    #[clap(
        long,
        default_value = "10000",
        env("WREN_CACHE_CAPACITY"),
        help = "Entries each cache node can hold"
    )]
    pub cache_capacity: usize,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_VIRTUAL_NODES,
        env("WREN_VIRTUAL_NODES"),
        help = "Ring positions per cache node"
    )]
    pub virtual_nodes: usize,

    #[clap(
        long,
        default_value = "10000",
        env("WREN_CACHE_KEYS"),
        help = "Keys written to the distributed cache"
    )]
    pub cache_keys: usize,

    #[clap(long, env("WREN_JSON"), help = "Print the report as JSON")]
    pub json: bool,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        let interval = Duration::from_millis(self.interval_ms);
        settings::Settings {
            limiter: settings::LimiterSettings::from_rate(self.algorithm, self.max_calls, interval),
            clients: self.clients,
            requests_per_client: self.requests,
            cache_policy: self.cache_policy,
            cache_nodes: self.cache_nodes,
            cache_capacity_per_node: self.cache_capacity,
            virtual_nodes: self.virtual_nodes,
            cache_keys: self.cache_keys,
            json: self.json,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::settings::LimiterSettings;

    #[test]
    fn defaults_build_valid_settings() {
        let cli = Cli::parse_from(["wren"]);
        assert_eq!(cli.algorithm, Algorithm::TokenBucket);
        let settings = cli.into_settings();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.virtual_nodes, settings::DEFAULT_VIRTUAL_NODES);
        assert!(!settings.json);
    }

    #[test]
    fn algorithm_and_interval_flags() {
        let cli = Cli::parse_from([
            "wren",
            "--algorithm",
            "sliding-log",
            "--max-calls",
            "5",
            "--interval-ms",
            "250",
            "--cache-policy",
            "lfu",
            "--json",
        ]);
        let settings = cli.into_settings();
        match settings.limiter {
            LimiterSettings::SlidingLog(window) => {
                assert_eq!(window.limit, 5);
                assert_eq!(window.window, Duration::from_millis(250));
            }
            other => panic!("unexpected limiter {:?}", other),
        }
        assert_eq!(settings.cache_policy, CachePolicy::Lfu);
        assert!(settings.json);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(Cli::try_parse_from(["wren", "--algorithm", "gcra"]).is_err());
    }
}
