use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nomad::{tool, NodeConfig};

fn directory_arg() -> Arg {
    Arg::new("dir")
        .help("Nomad directory of a stopped node (defaults to storage_path from --config)")
        .required(false)
}

fn cli() -> Command {
    Command::new("nomad")
        .version("0.1.0")
        .about("Maintenance tool for nomad configuration logs")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Node configuration file (JSON)"),
        )
        .subcommand(
            Command::new("verify")
                .about("Check the hash chain without modifying anything")
                .arg(directory_arg()),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the materialized log state as JSON")
                .arg(directory_arg()),
        )
        .subcommand(
            Command::new("history")
                .about("Print the change history, oldest first")
                .arg(directory_arg()),
        )
        .subcommand(
            Command::new("backup")
                .about("Copy the append log aside")
                .arg(directory_arg())
                .arg(
                    Arg::new("label")
                        .long("label")
                        .default_value("manual")
                        .help("Label embedded in the backup file name"),
                ),
        )
        .subcommand(
            Command::new("reset")
                .about("Move the log aside and start from an empty state")
                .arg(directory_arg()),
        )
}

fn directory(matches: &ArgMatches, config: Option<&NodeConfig>) -> anyhow::Result<PathBuf> {
    match (matches.get_one::<String>("dir"), config) {
        (Some(dir), _) => Ok(PathBuf::from(dir)),
        (None, Some(config)) => Ok(config.storage_path.clone()),
        (None, None) => {
            anyhow::bail!("no directory given and no --config to take storage_path from")
        }
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let matches = cli().get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => Some(NodeConfig::load(path).with_context(|| format!("loading {}", path))?),
        None => None,
    };
    if let Some(config) = &config {
        info!("Using node {} at {}", config.node_name, config.storage_path.display());
    }

    match matches.subcommand() {
        Some(("verify", sub)) => {
            let dir = directory(sub, config.as_ref())?;
            let report = tool::verify(&dir)?;
            println!("records:        {}", report.records);
            println!("last hash:      {}", report.last_hash.as_deref().unwrap_or("-"));
            println!("latest marker:  {}", report.latest_marker.as_deref().unwrap_or("-"));
            if let Some(stale) = &report.stale_marker {
                println!("stale marker:   {}", stale);
            }
            for partial in &report.partial_markers {
                println!("partial marker: {}", partial);
            }
            if report.torn_record {
                println!("torn record after the last marker");
            }
            if report.trailing_bytes > 0 {
                println!("trailing bytes: {}", report.trailing_bytes);
            }
            if report.is_clean() {
                info!("{} is clean", dir.display());
            } else {
                warn!("{} needs repair; the next open will fix it", dir.display());
            }
        }
        Some(("dump", sub)) => {
            let dir = directory(sub, config.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&tool::dump(&dir)?)?);
        }
        Some(("history", sub)) => {
            let dir = directory(sub, config.as_ref())?;
            for change in tool::history(&dir)? {
                println!(
                    "v{:<4} {} {:<11} {} ({}@{}, {})",
                    change.version,
                    change.uuid,
                    change.state.as_str(),
                    change.change.summary,
                    change.creation_user,
                    change.creation_host,
                    change.creation_timestamp
                );
            }
        }
        Some(("backup", sub)) => {
            let dir = directory(sub, config.as_ref())?;
            let label = sub.get_one::<String>("label").map(String::as_str).unwrap_or("manual");
            match tool::backup(&dir, label)? {
                Some(path) => println!("{}", path.display()),
                None => warn!("{} has no log to back up", dir.display()),
            }
        }
        Some(("reset", sub)) => {
            let dir = directory(sub, config.as_ref())?;
            match tool::reset(&dir)? {
                Some(path) => info!("Previous log kept at {}", path.display()),
                None => info!("{} was already empty", dir.display()),
            }
        }
        _ => anyhow::bail!("unknown command"),
    }

    Ok(())
}
