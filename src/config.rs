//! Immutable configuration snapshot (spec.md §6) plus the CLI that builds
//! one. Grounded on `main.rs`'s `clap::Command` builder usage (named `arg!`
//! entries with defaults and value parsers, not the derive API, matching
//! how the teacher's own binary is wired).

use std::time::Duration;

use clap::{arg, value_parser, Command};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every tunable named in spec.md §6, frozen at startup. Nothing in the
/// core reads process environment or argv directly past this point.
#[derive(Clone, Debug)]
pub struct Config {
    pub ring_name: String,
    pub home_directory: String,
    pub listen_address: String,
    pub hood_size: usize,
    pub join_throttle_limit: usize,
    pub join_throttle_active_interval: Duration,
    pub neighborhood_query_retry_interval: Duration,
    pub routing_retry_count: u32,
    pub routing_retry_interval: Duration,
    pub holding_timeout: Duration,
    pub ping_interval: Duration,
    pub unknown_timeout: Duration,
    pub clock_drift_ratio: f64,
    pub broadcast_fanout: usize,
    pub multicast_propagation_factor: usize,
}

impl Config {
    pub fn command() -> Command {
        Command::new("ring-fabric-node")
            .version(VERSION)
            .author("Ring Fabric Contributors")
            .about("Peer-to-peer ring overlay node")
            .arg(arg!([home] "Path to home directory").required(true))
            .arg(arg!(--ring <NAME> "Ring name").default_value("default"))
            .arg(arg!(--listen <ADDR> "Address to listen on").default_value("0.0.0.0:8080"))
            .arg(
                arg!(--"hood-size" <N> "Target neighborhood size on each side")
                    .default_value("5")
                    .value_parser(value_parser!(usize)),
            )
            .arg(
                arg!(--"join-throttle-limit" <N> "Maximum concurrently admitted joins")
                    .default_value("3")
                    .value_parser(value_parser!(usize)),
            )
            .arg(
                arg!(--"join-throttle-active-interval-ms" <MS> "Window in which a join counts against the throttle")
                    .default_value("30000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"neighborhood-query-retry-interval-ms" <MS> "Delay between neighborhood query retries")
                    .default_value("5000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"routing-retry-count" <N> "Hop retry attempts before surfacing a routing failure")
                    .default_value("3")
                    .value_parser(value_parser!(u32)),
            )
            .arg(
                arg!(--"routing-retry-interval-ms" <MS> "Delay between hop retries")
                    .default_value("1000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"holding-timeout-ms" <MS> "How long a message may wait for its token range to arrive")
                    .default_value("15000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"ping-interval-ms" <MS> "Period between liveness probes")
                    .default_value("2000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"unknown-timeout-ms" <MS> "How long a partner may stay Unknown before escalating to arbitration")
                    .default_value("10000")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                arg!(--"clock-drift-ratio" <RATIO> "Per-second widening applied to a stale peer clock bound")
                    .default_value("0.0001")
                    .value_parser(value_parser!(f64)),
            )
            .arg(
                arg!(--"broadcast-fanout" <N> "Maximum simultaneous broadcast forward targets")
                    .default_value("4")
                    .value_parser(value_parser!(usize)),
            )
            .arg(
                arg!(--"multicast-propagation-factor" <N> "Subtree branching factor for multicast forwarding")
                    .default_value("3")
                    .value_parser(value_parser!(usize)),
            )
    }

    pub fn from_args() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Config {
            ring_name: matches.get_one::<String>("ring").cloned().unwrap_or_else(|| "default".into()),
            home_directory: matches.get_one::<String>("home").cloned().expect("home is required"),
            listen_address: matches.get_one::<String>("listen").cloned().unwrap(),
            hood_size: *matches.get_one::<usize>("hood-size").unwrap(),
            join_throttle_limit: *matches.get_one::<usize>("join-throttle-limit").unwrap(),
            join_throttle_active_interval: Duration::from_millis(
                *matches.get_one::<u64>("join-throttle-active-interval-ms").unwrap(),
            ),
            neighborhood_query_retry_interval: Duration::from_millis(
                *matches.get_one::<u64>("neighborhood-query-retry-interval-ms").unwrap(),
            ),
            routing_retry_count: *matches.get_one::<u32>("routing-retry-count").unwrap(),
            routing_retry_interval: Duration::from_millis(*matches.get_one::<u64>("routing-retry-interval-ms").unwrap()),
            holding_timeout: Duration::from_millis(*matches.get_one::<u64>("holding-timeout-ms").unwrap()),
            ping_interval: Duration::from_millis(*matches.get_one::<u64>("ping-interval-ms").unwrap()),
            unknown_timeout: Duration::from_millis(*matches.get_one::<u64>("unknown-timeout-ms").unwrap()),
            clock_drift_ratio: *matches.get_one::<f64>("clock-drift-ratio").unwrap(),
            broadcast_fanout: *matches.get_one::<usize>("broadcast-fanout").unwrap(),
            multicast_propagation_factor: *matches.get_one::<usize>("multicast-propagation-factor").unwrap(),
        }
    }

    #[cfg(test)]
    pub fn for_test(ring_name: &str, home_directory: &str) -> Self {
        Config {
            ring_name: ring_name.to_string(),
            home_directory: home_directory.to_string(),
            listen_address: "127.0.0.1:0".into(),
            hood_size: 2,
            join_throttle_limit: 3,
            join_throttle_active_interval: Duration::from_millis(30_000),
            neighborhood_query_retry_interval: Duration::from_millis(5_000),
            routing_retry_count: 3,
            routing_retry_interval: Duration::from_millis(1_000),
            holding_timeout: Duration::from_millis(15_000),
            ping_interval: Duration::from_millis(2_000),
            unknown_timeout: Duration::from_millis(10_000),
            clock_drift_ratio: 0.0001,
            broadcast_fanout: 4,
            multicast_propagation_factor: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_home_and_defaults() {
        let matches = Config::command()
            .try_get_matches_from(["ring-fabric-node", "/tmp/home"])
            .unwrap();
        let config = Config::from_matches(&matches);
        assert_eq!(config.home_directory, "/tmp/home");
        assert_eq!(config.ring_name, "default");
        assert_eq!(config.hood_size, 5);
    }

    #[test]
    fn overrides_take_effect() {
        let matches = Config::command()
            .try_get_matches_from(["ring-fabric-node", "/tmp/home", "--hood-size", "8", "--ring", "test-ring"])
            .unwrap();
        let config = Config::from_matches(&matches);
        assert_eq!(config.hood_size, 8);
        assert_eq!(config.ring_name, "test-ring");
    }
}
