//! YAML configuration shared by every subcommand.

use crate::Error;
use serde::{Deserialize, Serialize};
use shoal_storage::{pages, swapdir, transients};
use std::{
    fs::File,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub storage_directory: PathBuf,
    #[serde(default)]
    pub sync_directories: Option<bool>,
    #[serde(default)]
    pub pages: Option<PagesConfig>,
    #[serde(default)]
    pub transients: Option<TransientsConfig>,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PagesConfig {
    pub name: String,
    pub directory: PathBuf,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub capacity_bytes: u64,
}

fn default_page_size() -> usize {
    pages::DEFAULT_PAGE_SIZE.get()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransientsConfig {
    pub name: String,
    pub directory: PathBuf,
    pub entries: u32,
    pub window: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KindConfig {
    Rock,
    Ufs,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyConfig {
    Lru,
    Fifo,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DirectoryConfig {
    pub kind: KindConfig,
    pub partition: String,
    pub max_size: u64,
    /// Required for `rock` directories.
    #[serde(default)]
    pub slot_size: Option<u64>,
    /// Required for `ufs` directories.
    #[serde(default)]
    pub average_object_size: Option<u64>,
    #[serde(default)]
    pub max_object_size: Option<u64>,
    #[serde(default)]
    pub high_water: Option<u8>,
    #[serde(default)]
    pub low_water: Option<u8>,
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
}

fn non_zero_u64(value: u64, field: &str) -> Result<NonZeroU64, Error> {
    NonZeroU64::new(value).ok_or_else(|| Error::InvalidConfig(format!("{field} must be non-zero")))
}

impl Config {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Storage rooted at the configured directory.
    pub fn storage(&self) -> shoal_runtime::tokio::Storage {
        let mut cfg = shoal_runtime::tokio::Config::new(self.storage_directory.clone());
        if let Some(sync_directories) = self.sync_directories {
            cfg.sync_directories = sync_directories;
        }
        shoal_runtime::tokio::Storage::new(cfg)
    }
}

impl PagesConfig {
    pub fn to_config(&self) -> Result<pages::Config, Error> {
        Ok(pages::Config {
            name: self.name.clone(),
            directory: Some(self.directory.clone()),
            page_size: NonZeroUsize::new(self.page_size)
                .ok_or_else(|| Error::InvalidConfig("page_size must be non-zero".into()))?,
            capacity_bytes: non_zero_u64(self.capacity_bytes, "capacity_bytes")?,
        })
    }
}

impl TransientsConfig {
    pub fn to_config(&self) -> Result<transients::Config, Error> {
        let non_zero = |value, field: &str| {
            NonZeroU32::new(value)
                .ok_or_else(|| Error::InvalidConfig(format!("{field} must be non-zero")))
        };
        Ok(transients::Config {
            name: self.name.clone(),
            directory: Some(self.directory.clone()),
            entries: non_zero(self.entries, "entries")?,
            window: non_zero(self.window, "window")?,
        })
    }
}

impl DirectoryConfig {
    pub fn to_config(&self) -> Result<swapdir::Config, Error> {
        let max_size = non_zero_u64(self.max_size, "max_size")?;
        let mut cfg = match self.kind {
            KindConfig::Rock => {
                let slot_size = self.slot_size.ok_or_else(|| {
                    Error::InvalidConfig(format!("{}: rock requires slot_size", self.partition))
                })?;
                swapdir::Config::rock(
                    &self.partition,
                    max_size,
                    non_zero_u64(slot_size, "slot_size")?,
                )
            }
            KindConfig::Ufs => {
                let average = self.average_object_size.ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "{}: ufs requires average_object_size",
                        self.partition
                    ))
                })?;
                swapdir::Config::ufs(
                    &self.partition,
                    max_size,
                    non_zero_u64(average, "average_object_size")?,
                )
            }
        };
        if let Some(max) = self.max_object_size {
            cfg.max_object_size = Some(non_zero_u64(max, "max_object_size")?);
        }
        if let Some(high) = self.high_water {
            cfg.high_water = high;
        }
        if let Some(low) = self.low_water {
            cfg.low_water = low;
        }
        if let Some(policy) = self.policy {
            cfg.policy = match policy {
                PolicyConfig::Lru => swapdir::Policy::Lru,
                PolicyConfig::Fifo => swapdir::Policy::Fifo,
            };
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
storage_directory: /var/cache/shoal
pages:
  name: pages
  directory: /dev/shm
  page_size: 32768
  capacity_bytes: 268435456
transients:
  name: transients
  directory: /dev/shm
  entries: 4096
  window: 16
directories:
  - kind: rock
    partition: rock-0
    max_size: 1073741824
    slot_size: 16384
    policy: fifo
  - kind: ufs
    partition: ufs-0
    max_size: 1073741824
    average_object_size: 13312
    max_object_size: 4194304
    high_water: 90
    low_water: 80
"#;

    #[test]
    fn test_parse() {
        let config: Config = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.directories.len(), 2);

        let pages = config.pages.as_ref().unwrap().to_config().unwrap();
        assert_eq!(pages.page_size.get(), 32768);
        let transients = config.transients.as_ref().unwrap().to_config().unwrap();
        assert_eq!(transients.window.get(), 16);

        let rock = config.directories[0].to_config().unwrap();
        assert_eq!(rock.kind.to_string(), "rock");
        assert_eq!(rock.policy, swapdir::Policy::Fifo);
        assert_eq!(rock.high_water, swapdir::Config::HIGH_WATER);

        let ufs = config.directories[1].to_config().unwrap();
        assert_eq!(ufs.max_object_size.map(NonZeroU64::get), Some(4194304));
        assert_eq!((ufs.high_water, ufs.low_water), (90, 80));
    }

    #[test]
    fn test_default_page_size() {
        let pages: PagesConfig =
            serde_yaml::from_str("{name: pages, directory: /dev/shm, capacity_bytes: 1048576}")
                .unwrap();
        assert_eq!(pages.to_config().unwrap().page_size, pages::DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_missing_geometry() {
        let directory: DirectoryConfig =
            serde_yaml::from_str("{kind: rock, partition: rock-0, max_size: 1024}").unwrap();
        assert!(matches!(directory.to_config(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_rejected() {
        let directory: DirectoryConfig = serde_yaml::from_str(
            "{kind: ufs, partition: ufs-0, max_size: 0, average_object_size: 10}",
        )
        .unwrap();
        assert!(matches!(directory.to_config(), Err(Error::InvalidConfig(_))));
    }
}
