use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use transport_rdma::RdmaTransportConfig;

/// Which session to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// CM handshake, write a message, read the whole buffer back.
    Cm,
    /// TCP rendezvous between two devices, then one write.
    Rendezvous,
    /// CM handshake followed by a chunked bulk write.
    Bulk,
}

/// Knobs for the in-process fabric the scenarios run on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct FabricConfig {
    pub qp_via_side_channel: bool,
    pub supports_reg_mr: bool,
    pub cm_exposes_context: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            qp_via_side_channel: false,
            supports_reg_mr: true,
            cm_exposes_context: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct BenchConfig {
    pub scenario: Scenario,
    pub iterations: usize,
    pub bulk_bytes: usize,
    pub chunk_size: usize,
    pub fabric: FabricConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            scenario: Scenario::Cm,
            iterations: 1,
            bulk_bytes: 1 << 20,
            chunk_size: 64 << 10,
            fabric: FabricConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(default)]
    pub transport: RdmaTransportConfig,
    #[serde(default)]
    pub bench: BenchConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let config: Config = toml::from_str(include_str!("../../../rcbench.toml")).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.bench.scenario, Scenario::Cm);
        assert!(config.transport.resolve_route);
    }

    #[test]
    fn test_sections_default() {
        let config: Config = toml::from_str(r#"log_level = "debug""#).unwrap();
        assert_eq!(config.bench, BenchConfig::default());
        assert_eq!(config.transport, RdmaTransportConfig::default());
        assert!(config.log_file.is_none());

        let bulk: Config = toml::from_str(
            r#"
            log_level = "info"
            [bench]
            scenario = "bulk"
            chunk_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(bulk.bench.scenario, Scenario::Bulk);
        assert_eq!(bulk.bench.chunk_size, 4096);
        assert_eq!(bulk.bench.iterations, 1);
    }
}
