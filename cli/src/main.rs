//! Shoal CLI

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;

mod config;
mod decode;
mod pages;
mod rebuild;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Errors that can occur when running a subcommand.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("swap header error: {0}")]
    SwapMeta(#[from] shoal_storage::swapmeta::Error),
    #[error("directory error: {0}")]
    SwapDir(#[from] shoal_storage::swapdir::Error),
    #[error("page pool error: {0}")]
    Pages(#[from] shoal_storage::pages::Error),
    #[error("transient table error: {0}")]
    Transients(#[from] shoal_storage::transients::Error),
    #[error("metrics encoding failed")]
    Metrics(#[from] std::fmt::Error),
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Entrypoint for the Shoal CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("shoal")
        .version(crate_version())
        .about("Inspect and maintain the storage of a shoal proxy cache.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(decode::CMD)
                .about("Print the swap header stored in a file (or a rock database slot).")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .help("Path to the file holding the header")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("offset")
                        .long("offset")
                        .default_value("0")
                        .help("Byte offset of the header")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("slot")
                        .long("slot")
                        .requires("slot-size")
                        .conflicts_with("offset")
                        .help("Rock database slot holding the header")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("slot-size")
                        .long("slot-size")
                        .help("Slot size of the rock database")
                        .value_parser(clap::builder::RangedU64ValueParser::<u64>::new().range(1..)),
                ),
        )
        .subcommand(
            Command::new(rebuild::CMD)
                .about("Rebuild every configured cache directory and print its usage.")
                .arg(config_arg())
                .arg(
                    Arg::new("maintain")
                        .long("maintain")
                        .help("Evict objects from directories above their high-water mark")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("metrics")
                        .long("metrics")
                        .help("Print the collected metrics")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new(pages::CMD)
                .about("Attach to a running page pool and print its usage.")
                .arg(config_arg()),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    let result = match matches.subcommand() {
        Some((decode::CMD, matches)) => {
            let file = matches.get_one::<PathBuf>("file").unwrap();
            let offset = match matches.get_one::<u64>("slot") {
                Some(slot) => {
                    let slot_size = *matches.get_one::<u64>("slot-size").unwrap();
                    slot.checked_mul(slot_size)
                        .and_then(|offset| {
                            offset.checked_add(shoal_storage::swapdir::rock::HEADER_SIZE)
                        })
                        .unwrap_or(u64::MAX)
                }
                None => *matches.get_one::<u64>("offset").unwrap(),
            };
            decode::decode(file, offset).await
        }
        Some((rebuild::CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            rebuild::rebuild(
                config_path,
                matches.get_flag("maintain"),
                matches.get_flag("metrics"),
            )
            .await
        }
        Some((pages::CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            pages::pages(config_path)
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return std::process::ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return std::process::ExitCode::FAILURE;
        }
    };
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error=?e, "command failed");
            std::process::ExitCode::FAILURE
        }
    }
}
