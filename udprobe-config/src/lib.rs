//! Typed configuration for the udprobe collector.
//!
//! Two on-disk formats are supported, see [`ConfigFormat`]: the standard format with named
//! ports, port groups, rate limits, target sets and tests, and the [legacy](LegacyCollectorConfig)
//! flat map of reflector IP to tags.
#![doc(issue_tracker_base_url = "https://github.com/chainbound/udprobe/issues/")]

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod legacy;
pub use legacy::LegacyCollectorConfig;

mod tags;
pub use tags::{TagSet, Tags, DST_HOSTNAME, SRC_HOSTNAME};

mod targets;
pub use targets::{TargetConfig, TargetSet, TargetsConfig};

/// The name used for every entity of the default configuration.
pub const DEFAULT_NAME: &str = "default";

/// The port reflectors listen on by default.
pub const DEFAULT_REFLECTOR_PORT: u16 = 8100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
    #[error("Unknown target set: {0}")]
    UnknownTargetSet(String),
    #[error("Unknown port group: {0}")]
    UnknownPortGroup(String),
    #[error("Unknown port: {0}")]
    UnknownPort(String),
    #[error("Unknown rate limit: {0}")]
    UnknownRateLimit(String),
    #[error("Port {0} is bound more than once")]
    DuplicateBind(SocketAddr),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// A local socket to send probes from, dedicated to one ToS value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    pub ip: IpAddr,
    pub port: u16,
    pub tos: u8,
    /// Probe timeout in milliseconds.
    pub timeout: u64,
}

impl PortConfig {
    pub const fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }
}

/// One member of a port group: `count` sockets created from the named port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortGroupConfig {
    pub port: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Probes per second.
    pub cps: f64,
}

/// A test probes every target of a target set from every port of a port group, paced by a
/// rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    pub targets: String,
    pub port_group: String,
    pub rate_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummarizationConfig {
    /// Summarization window in seconds.
    pub interval: u64,
    /// Number of result handler workers.
    pub handlers: usize,
}

impl SummarizationConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub bind: String,
}

/// The standard collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Global `src_hostname` tag, used for targets that don't set their own.
    #[serde(default)]
    pub hostname: Option<String>,
    pub summarization: SummarizationConfig,
    pub api: ApiConfig,
    pub ports: HashMap<String, PortConfig>,
    pub port_groups: HashMap<String, Vec<PortGroupConfig>>,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub tests: Vec<TestConfig>,
    pub targets: TargetsConfig,
}

impl Default for CollectorConfig {
    /// Probes a reflector on localhost from four ToS 0 ports, at 4 probes per second.
    fn default() -> Self {
        let ports = HashMap::from([(
            DEFAULT_NAME.to_string(),
            PortConfig { ip: Ipv4Addr::UNSPECIFIED.into(), port: 0, tos: 0, timeout: 1000 },
        )]);

        let port_groups = HashMap::from([(
            DEFAULT_NAME.to_string(),
            vec![PortGroupConfig { port: DEFAULT_NAME.to_string(), count: 4 }],
        )]);

        let rate_limits =
            HashMap::from([(DEFAULT_NAME.to_string(), RateLimitConfig { cps: 4.0 })]);

        let mut targets = TargetsConfig::default();
        targets.insert(
            DEFAULT_NAME,
            TargetSet(vec![TargetConfig::new(Ipv4Addr::LOCALHOST.into(), DEFAULT_REFLECTOR_PORT)
                .with_tag(DST_HOSTNAME, "localhost")]),
        );

        Self {
            hostname: None,
            summarization: SummarizationConfig { interval: 30, handlers: 2 },
            api: ApiConfig { bind: "0.0.0.0:5000".to_string() },
            ports,
            port_groups,
            rate_limits,
            tests: vec![TestConfig {
                targets: DEFAULT_NAME.to_string(),
                port_group: DEFAULT_NAME.to_string(),
                rate_limit: DEFAULT_NAME.to_string(),
            }],
            targets,
        }
    }
}

impl CollectorConfig {
    /// Parses a standard format configuration. Does not validate it.
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(data)?)
    }

    /// Reads, parses (in either format) and validates the configuration at `path`.
    /// `dst_port` only applies to legacy configurations.
    pub fn load(path: impl AsRef<Path>, dst_port: u16) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Loading config");

        let data = std::fs::read_to_string(path)?;
        let cfg = ConfigFormat::parse(&data)?.into_collector_config(dst_port);
        cfg.validate()?;

        Ok(cfg)
    }

    /// The global `src_hostname`, or an empty string.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or_default()
    }

    /// Builds the tag set of every configured target.
    pub fn tag_set(&self) -> TagSet {
        self.targets.tag_set(self.hostname())
    }

    /// Checks every named reference and value range. A configuration that passes can be turned
    /// into running tests without further errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.summarization.interval == 0 {
            return Err(ConfigError::Invalid("summarization interval must be positive".into()));
        }
        if self.summarization.handlers == 0 {
            return Err(ConfigError::Invalid("at least one result handler is required".into()));
        }

        for (name, rl) in &self.rate_limits {
            if !(rl.cps.is_finite() && rl.cps > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "rate limit {name}: cps must be positive, got {}",
                    rl.cps
                )));
            }
        }

        for (name, group) in &self.port_groups {
            for member in group {
                if !self.ports.contains_key(&member.port) {
                    return Err(ConfigError::UnknownPort(member.port.clone()));
                }
                if member.count == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "port group {name}: count for port {} must be positive",
                        member.port
                    )));
                }
            }
        }

        for test in &self.tests {
            self.test_parts(test)?;
        }

        let fixed = self.fixed_bind_addrs();
        for (i, addr) in fixed.iter().enumerate() {
            if fixed[i + 1..].iter().any(|other| binds_overlap(addr, other)) {
                return Err(ConfigError::DuplicateBind(*addr));
            }
        }

        Ok(())
    }

    /// The bind address of every socket the tests create on a fixed (non-zero) port, once per
    /// socket.
    pub fn fixed_bind_addrs(&self) -> Vec<SocketAddr> {
        self.tests
            .iter()
            .filter_map(|test| self.test_parts(test).ok())
            .flat_map(|(_, ports, _)| ports)
            .map(PortConfig::bind_addr)
            .filter(|addr| addr.port() != 0)
            .collect()
    }

    /// Resolves the named references of a test into the entities they point to.
    pub fn test_parts<'a>(
        &'a self,
        test: &TestConfig,
    ) -> Result<(&'a TargetSet, Vec<&'a PortConfig>, &'a RateLimitConfig), ConfigError> {
        let targets = self
            .targets
            .get(&test.targets)
            .ok_or_else(|| ConfigError::UnknownTargetSet(test.targets.clone()))?;

        let group = self
            .port_groups
            .get(&test.port_group)
            .ok_or_else(|| ConfigError::UnknownPortGroup(test.port_group.clone()))?;

        let mut ports = Vec::new();
        for member in group {
            let port = self
                .ports
                .get(&member.port)
                .ok_or_else(|| ConfigError::UnknownPort(member.port.clone()))?;
            for _ in 0..member.count {
                ports.push(port);
            }
        }

        let rate_limit = self
            .rate_limits
            .get(&test.rate_limit)
            .ok_or_else(|| ConfigError::UnknownRateLimit(test.rate_limit.clone()))?;

        Ok((targets, ports, rate_limit))
    }
}

/// Returns `true` if sockets bound to `a` and `b` would claim the same port.
pub fn binds_overlap(a: &SocketAddr, b: &SocketAddr) -> bool {
    a.port() != 0 &&
        a.port() == b.port() &&
        a.is_ipv4() == b.is_ipv4() &&
        (a.ip() == b.ip() || a.ip().is_unspecified() || b.ip().is_unspecified())
}

/// A parsed configuration file, in whichever format it was written.
///
/// Parsing tries the legacy format first, then the standard one. The first format that parses
/// wins; the two are never combined.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigFormat {
    Legacy(LegacyCollectorConfig),
    Standard(CollectorConfig),
}

impl ConfigFormat {
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        match LegacyCollectorConfig::parse(data) {
            Ok(legacy) => {
                tracing::info!(targets = legacy.0.len(), "Parsed legacy config");
                Ok(Self::Legacy(legacy))
            }
            Err(legacy_err) => {
                tracing::debug!(error = %legacy_err, "Not a legacy config, trying standard format");
                CollectorConfig::parse(data).map(Self::Standard)
            }
        }
    }

    pub fn into_collector_config(self, dst_port: u16) -> CollectorConfig {
        match self {
            Self::Legacy(legacy) => legacy.into_collector_config(dst_port),
            Self::Standard(cfg) => cfg,
        }
    }
}
