//! Service configuration
//!
//! Layered load: built-in defaults, then a YAML file, then `LNS_`-prefixed
//! environment variables. The file is optional so a container can run on
//! environment variables alone.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use lorawan::NetId;

use crate::error::{LnsError, Result};
use crate::region::{as923, au915, cn470, eu868, us915, Cn470Plan, RegionName, RegionSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnsConfig {
    /// Identifier of the gateway this server fronts
    pub gateway_id: String,
    /// 24-bit network identifier used in join accepts
    pub network_id: NetId,
    /// Regions to try in order during frequency matching
    pub regions: Vec<RegionName>,
    /// Enforce the AS923 400 ms uplink dwell-time limit
    #[serde(default)]
    pub as923_dwell_time: bool,
    /// CN470 channel plan
    #[serde(default)]
    pub cn470_plan: Cn470Plan,
    /// Sliding TTL for device cache entries
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    /// Persist local frame counters every N uplinks
    #[serde(default = "default_fcnt_persist_interval")]
    pub fcnt_persist_interval: u32,
    /// Downlink-counter pre-advance for freshly loaded ABP devices
    #[serde(default = "default_abp_fcnt_down_margin")]
    pub abp_fcnt_down_margin: u32,
    /// Time reserved for packaging and sending a downlink
    #[serde(default = "default_budget_ms")]
    pub package_and_send_budget_ms: u64,
    /// Time reserved for one cloud-to-device queue poll
    #[serde(default = "default_budget_ms")]
    pub downlink_poll_budget_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_fcnt_persist_interval() -> u32 {
    10
}

fn default_abp_fcnt_down_margin() -> u32 {
    10
}

fn default_budget_ms() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LnsConfig {
    fn default() -> Self {
        Self {
            gateway_id: String::new(),
            network_id: NetId([0, 0, 0x13]),
            regions: vec![RegionName::Eu868],
            as923_dwell_time: false,
            cn470_plan: Cn470Plan::default(),
            cache_ttl_hours: default_cache_ttl_hours(),
            fcnt_persist_interval: default_fcnt_persist_interval(),
            abp_fcnt_down_margin: default_abp_fcnt_down_margin(),
            package_and_send_budget_ms: default_budget_ms(),
            downlink_poll_budget_ms: default_budget_ms(),
            log_level: default_log_level(),
        }
    }
}

impl LnsConfig {
    /// Load configuration from defaults, an optional YAML file and the
    /// `LNS_` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(LnsConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: LnsConfig = figment
            .merge(Env::prefixed("LNS_"))
            .extract()
            .map_err(|e| LnsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway_id.is_empty() {
            return Err(LnsError::Config("gateway_id must be set".into()));
        }
        if self.regions.is_empty() {
            return Err(LnsError::Config("at least one region must be configured".into()));
        }
        if self.fcnt_persist_interval == 0 {
            return Err(LnsError::Config("fcnt_persist_interval must be at least 1".into()));
        }
        Ok(())
    }

    /// Construct the configured regions, preserving order
    pub fn build_regions(&self) -> RegionSet {
        let regions = self
            .regions
            .iter()
            .map(|name| {
                std::sync::Arc::new(match name {
                    RegionName::Eu868 => eu868(),
                    RegionName::Us915 => us915(),
                    RegionName::Au915 => au915(),
                    RegionName::Cn470 => cn470(self.cn470_plan),
                    RegionName::As923 => as923(self.as923_dwell_time),
                })
            })
            .collect();
        RegionSet::new(regions)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 3600)
    }

    pub fn package_and_send_budget(&self) -> Duration {
        Duration::from_millis(self.package_and_send_budget_ms)
    }

    pub fn downlink_poll_budget(&self) -> Duration {
        Duration::from_millis(self.downlink_poll_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fail_without_gateway_id() {
        assert!(LnsConfig::default().validate().is_err());
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "gateway_id: gw-test\nnetwork_id: \"000013\"\nregions: [US915, AS923]\n"
        )
        .unwrap();

        let config = LnsConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.gateway_id, "gw-test");
        assert_eq!(config.regions, vec![RegionName::Us915, RegionName::As923]);
        assert_eq!(config.fcnt_persist_interval, 10);
    }

    #[test]
    fn region_order_is_preserved() {
        let config = LnsConfig {
            gateway_id: "gw".into(),
            regions: vec![RegionName::As923, RegionName::Us915],
            ..LnsConfig::default()
        };
        let set = config.build_regions();
        assert_eq!(set.names(), vec![RegionName::As923, RegionName::Us915]);
        // Both regions cover 923.2 MHz; configured order decides
        assert_eq!(set.select(923_200_000).unwrap().name, RegionName::As923);
    }

    #[test]
    fn rejects_empty_region_list() {
        let config = LnsConfig {
            gateway_id: "gw".into(),
            regions: vec![],
            ..LnsConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
