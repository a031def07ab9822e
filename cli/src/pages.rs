//! Report the usage of a running page pool (and its transient table).

use crate::{config::Config, Error};
use prometheus_client::registry::Registry;
use shoal_storage::{
    pages::{PagePool, Purpose},
    transients::Transients,
};
use std::path::Path;

pub const CMD: &str = "pages";

pub fn pages(config_path: &Path) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let cfg = config
        .pages
        .as_ref()
        .ok_or_else(|| Error::InvalidConfig("no page pool configured".into()))?
        .to_config()?;
    let mut registry = Registry::default();
    let pool = PagePool::attach(cfg, &mut registry)?;
    println!(
        "pool {:08x}: {} of {} pages of {} bytes in use",
        pool.id(),
        pool.level(),
        pool.capacity(),
        pool.page_size()
    );
    for purpose in Purpose::ALL {
        println!(
            "  {purpose}: {} in use, limit {}, {} available",
            pool.level_of(purpose),
            pool.limit_of(purpose),
            pool.available(purpose)
        );
    }

    if let Some(transients) = &config.transients {
        let table = Transients::attach(transients.to_config()?, Some(pool), &mut registry)?;
        println!("transient table: {} slots", table.entries());
    }
    Ok(())
}
