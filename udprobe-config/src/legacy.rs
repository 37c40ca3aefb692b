use std::{collections::BTreeMap, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::{
    tags::Tags,
    targets::{TargetConfig, TargetSet},
    CollectorConfig, ConfigError, DEFAULT_NAME,
};

/// The flat, pre-named-groups configuration format: a map of reflector IP to its tags.
///
/// ```yaml
/// 1.2.3.4:
///     dst_hostname: reflector-1
/// 127.0.0.1:
///     dst_hostname: localhost
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyCollectorConfig(pub BTreeMap<IpAddr, Tags>);

impl LegacyCollectorConfig {
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml_ng::from_str(data)?;
        if cfg.0.is_empty() {
            return Err(ConfigError::Invalid("legacy config contains no targets".to_string()));
        }

        Ok(cfg)
    }

    /// Converts to the standard format: the default configuration, with the default target
    /// set replaced by the legacy entries, all probed on `dst_port`.
    pub fn into_collector_config(self, dst_port: u16) -> CollectorConfig {
        let targets = self
            .0
            .into_iter()
            .map(|(ip, tags)| TargetConfig { ip, port: dst_port, tags })
            .collect();

        let mut cfg = CollectorConfig::default();
        cfg.targets.insert(DEFAULT_NAME, TargetSet(targets));
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r"
1.2.3.4:
    my_tag: my_value
    foo:    bar
127.0.0.1:
    tag1:   value1
    baz:    qux
";

    #[test]
    fn parses_flat_map() {
        let cfg = LegacyCollectorConfig::parse(EXAMPLE).unwrap();
        assert_eq!(cfg.0.len(), 2);
        assert_eq!(cfg.0[&"1.2.3.4".parse::<IpAddr>().unwrap()]["my_tag"], "my_value");
    }

    #[test]
    fn converts_with_destination_port() {
        let cfg = LegacyCollectorConfig::parse(EXAMPLE).unwrap().into_collector_config(1234);
        cfg.validate().unwrap();

        let targets = cfg.targets.get(DEFAULT_NAME).unwrap().resolved_targets();
        assert_eq!(targets, vec!["1.2.3.4:1234".parse().unwrap(), "127.0.0.1:1234".parse().unwrap()]);
        assert_eq!(cfg.tag_set().tag("127.0.0.1", "baz"), "qux");
    }

    #[test]
    fn rejects_non_ip_keys() {
        assert!(LegacyCollectorConfig::parse("summarization:\n  interval: 30\n").is_err());
    }
}
