//! Rebuild every configured cache directory and report what was found.

use crate::{config::Config, Error};
use prometheus_client::{encoding::text::encode, registry::Registry};
use shoal_storage::swapdir::{Directory, SwapDir};
use std::path::Path;
use tracing::info;

pub const CMD: &str = "rebuild";

pub async fn rebuild(config_path: &Path, maintain: bool, metrics: bool) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    if config.directories.is_empty() {
        return Err(Error::InvalidConfig("no directories configured".into()));
    }
    let storage = config.storage();
    let mut registry = Registry::default();
    for directory in &config.directories {
        let cfg = directory.to_config()?;
        let mut dir = Directory::init(storage.clone(), cfg, None, &mut registry).await?;
        let stats = dir.rebuild().await?;
        println!("{}: {stats}", directory.partition);
        if maintain && dir.full() {
            let evicted = dir.maintain().await?;
            info!(partition = %directory.partition, evicted, "evicted objects");
        }
        println!("{}", dir.stat());
    }
    if metrics {
        let mut buffer = String::new();
        encode(&mut buffer, &registry)?;
        print!("{buffer}");
    }
    Ok(())
}
