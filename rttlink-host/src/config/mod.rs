use anyhow::bail;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use probe_rs::probe::WireProtocol;
use rttlink::{ProbeRsTransport, SessionConfig};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::logging::LevelFilter;

/// Prefix of environment variables overriding config values, e.g. `RTTLINK_RTT__UP_CHANNEL=1`.
const ENV_PREFIX: &str = "RTTLINK_";

/// A struct which holds all configs.
#[derive(Debug, Clone)]
pub struct Configs {
    figment: Figment,
}

/// The main struct holding all the possible config options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub general: General,
    pub probe: Probe,
    pub rtt: SessionConfig,
}

/// The general config struct holding all the possible general options.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    pub log_level: Option<LevelFilter>,
}

/// The probe config struct holding all the possible probe options.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Probe {
    pub index: usize,
    pub serial: Option<String>,
    pub chip: Option<String>,
    pub protocol: Option<WireProtocol>,
    pub speed: Option<u32>,
    pub ram: Option<Range<u32>>,
    pub core: usize,
}

impl Probe {
    pub fn transport(&self) -> ProbeRsTransport {
        ProbeRsTransport {
            probe_index: self.index,
            serial: self.serial.clone(),
            chip: self.chip.clone(),
            protocol: self.protocol,
            speed: self.speed,
            ram: self.ram.clone(),
            core: self.core,
        }
    }
}

impl Configs {
    pub fn new(conf_dir: &Path) -> Configs {
        // Start off by merging in the default configuration file.
        let mut figment = Figment::new().merge(Toml::string(include_str!("default.toml")));

        // Ordered list of config files, which are handled in the order specified here.
        let config_files = [
            // Project specific settings, normally part of a project's source repository.
            "RttLink",
            ".rttlink",
            // Personal settings that would NOT normally be part of a project's source repository.
            "RttLink.local",
            ".rttlink.local",
        ];

        for file in config_files {
            figment = figment.merge(Toml::file(conf_dir.join(format!("{file}.toml"))));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Configs { figment }
    }

    /// Merges an additional config file on top of everything loaded so far.
    pub fn merge(&mut self, conf_file: PathBuf) -> anyhow::Result<()> {
        match conf_file.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                self.figment = self.figment.clone().merge(Toml::file(conf_file));
                Ok(())
            }
            _ => bail!("File format not recognized from extension (supported: .toml)"),
        }
    }

    pub fn extract(&self) -> anyhow::Result<Config> {
        match self.figment.extract::<Config>() {
            Ok(config) => Ok(config),
            Err(figerr) => {
                // Join all the figment errors into a multiline string.
                bail!(
                    "Failed to parse supplied configuration:\n{}",
                    figerr
                        .into_iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<String>>()
                        .join("\n")
                );
            }
        }
    }

    #[cfg(test)]
    fn merge_string(self, toml: &str) -> Configs {
        Configs {
            figment: self.figment.merge(Toml::string(toml)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rttlink::ScanRegion;
    use std::time::Duration;

    // Every test runs inside a jail, which serializes access to the environment and gives each
    // test an empty working directory.

    #[test]
    fn default_config_matches_library_defaults() {
        figment::Jail::expect_with(|jail| {
            let config = Configs::new(jail.directory()).extract().unwrap();

            assert_eq!(config.rtt, SessionConfig::default());
            assert_eq!(config.probe.index, 0);
            assert_eq!(config.general.log_level, None);

            Ok(())
        });
    }

    #[test]
    fn later_layers_override_defaults() {
        figment::Jail::expect_with(|jail| {
            let config = Configs::new(jail.directory())
                .merge_string(
                    r#"
                    [rtt]
                    poll_interval = 10
                    scan_region = { exact = 0x20000400 }

                    [probe]
                    chip = "nRF52840_xxAA"
                    protocol = "Swd"
                    "#,
                )
                .extract()
                .unwrap();

            assert_eq!(config.rtt.poll_interval, Duration::from_millis(10));
            assert_eq!(config.rtt.idle_interval, Duration::from_millis(500));
            assert_eq!(config.rtt.scan_region, ScanRegion::Exact(0x2000_0400));
            assert_eq!(config.probe.chip.as_deref(), Some("nRF52840_xxAA"));
            assert_eq!(config.probe.protocol, Some(WireProtocol::Swd));

            Ok(())
        });
    }

    #[test]
    fn unknown_config_items_fail() {
        figment::Jail::expect_with(|jail| {
            let result = Configs::new(jail.directory())
                .merge_string(
                    r#"
                    [rtt]
                    bogus_invalid_item = "oops"
                    "#,
                )
                .extract();

            assert!(result.is_err());

            Ok(())
        });
    }

    #[test]
    fn environment_overrides_files() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "RttLink.toml",
                r#"
                [rtt]
                up_channel = 1
                down_channel = 1
                "#,
            )?;
            jail.set_env("RTTLINK_RTT__UP_CHANNEL", "2");

            let config = Configs::new(jail.directory()).extract().unwrap();

            assert_eq!(config.rtt.up_channel, 2);
            assert_eq!(config.rtt.down_channel, 1);

            Ok(())
        });
    }

    #[test]
    fn local_file_overrides_project_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("RttLink.toml", "[probe]\nspeed = 1000\n")?;
            jail.create_file(".rttlink.local.toml", "[probe]\nspeed = 4000\n")?;

            let config = Configs::new(jail.directory()).extract().unwrap();

            assert_eq!(config.probe.speed, Some(4000));

            Ok(())
        });
    }

    #[test]
    fn extra_file_must_be_toml() {
        // Existence of files is not tested here, so it is fine to use a file that does not exist
        let mut configs = Configs::new(Path::new("."));

        configs.merge("nonexistent-file.toml".into()).unwrap();
        configs.merge("nonexistent-file.yml".into()).unwrap_err();
    }
}
