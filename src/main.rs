//! recproxy CLI

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use recproxy::config::Config;
use recproxy::network::ProxyServer;
use recproxy::recording::RecordingHandler;
use recproxy::store::{AssetsStore, GitStore};

fn usage() -> ! {
    eprintln!("recproxy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: recproxy <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  start [--storage-location <dir>] [--port <port>]");
    eprintln!("                          Run the record/playback proxy");
    eprintln!("  restore <assets.json>   Check out the recordings an assets.json pins");
    eprintln!("  push <assets.json>      Commit and push recording changes, then pin them");
    eprintln!("  reset <assets.json>     Discard local recording changes");
    eprintln!();
    eprintln!("Every command accepts --config <file> for settings such as [git].");
    process::exit(1);
}

/// Options shared by every command, plus its positional arguments
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    storage_location: Option<PathBuf>,
    port: Option<u16>,
    positional: Vec<String>,
}

fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut args = args.iter();

    while let Some(arg) = args.next() {
        let mut value = || {
            args.next()
                .with_context(|| format!("{arg} requires a value"))
        };
        match arg.as_str() {
            "--config" | "-c" => options.config = Some(PathBuf::from(value()?)),
            "--storage-location" | "-l" => options.storage_location = Some(PathBuf::from(value()?)),
            "--port" | "-p" => {
                let raw = value()?;
                options.port = Some(raw.parse().with_context(|| format!("Invalid port {raw}"))?);
            }
            other if other.starts_with('-') => bail!("Unknown option: {other}"),
            other => options.positional.push(other.to_string()),
        }
    }
    Ok(options)
}

fn load_config(options: &Options) -> anyhow::Result<Config> {
    let mut config = match &options.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(location) = &options.storage_location {
        config.storage_location.clone_from(location);
    }
    if let Some(port) = options.port {
        config.listen_addr.set_port(port);
    }
    config.validate()?;
    Ok(config)
}

async fn start(args: &[String]) -> anyhow::Result<()> {
    let options = parse_options(args)?;
    if let Some(extra) = options.positional.first() {
        bail!("Unexpected argument: {extra}");
    }
    let config = load_config(&options)?;

    let store = GitStore::new(config.git.clone());
    store
        .check_version()
        .context("git is required for assets support; set git.skip_version_check to run without it")?;

    let recording = Arc::new(RecordingHandler::new(
        config.storage_location.clone(),
        Arc::new(store),
    )?);
    ProxyServer::new(config, recording).run().await?;
    Ok(())
}

fn assets_command(command: &str, args: &[String]) -> anyhow::Result<()> {
    let options = parse_options(args)?;
    let [path] = options.positional.as_slice() else {
        bail!("Usage: recproxy {command} <assets.json> [--config <file>]");
    };
    let config = load_config(&options)?;

    let store = GitStore::new(config.git);
    store.check_version()?;
    let path = Path::new(path);

    match command {
        "restore" => {
            let root = store.restore(path)?;
            info!("Recordings available at {}", root.display());
        }
        "push" => store.push(path)?,
        "reset" => store.reset(path)?,
        other => bail!("Unknown assets command: {other}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recproxy=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let command = args[1].as_str();
    match command {
        "start" => start(&args[2..]).await,
        "restore" | "push" | "reset" => {
            let args = args[2..].to_vec();
            let command = command.to_string();
            tokio::task::spawn_blocking(move || assets_command(&command, &args)).await?
        }
        "--help" | "-h" | "help" => usage(),
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'recproxy' for usage information.");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_options_splits_flags_and_positionals() {
        let options = parse_options(&args(&["sdk/assets.json", "--config", "proxy.toml"])).unwrap();
        assert_eq!(options.config, Some(PathBuf::from("proxy.toml")));
        assert_eq!(options.positional, vec!["sdk/assets.json".to_string()]);

        assert!(parse_options(&args(&["--bogus"])).is_err());
        assert!(parse_options(&args(&["--port"])).is_err());
    }

    #[test]
    fn test_assets_commands_use_configured_git_settings() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[git]\nretry_attempts = 7\nremote_base = \"file:///srv/assets\"\nuser_name = \"bot\""
        )
        .unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let options = parse_options(&args(&["assets.json", "-c", &path])).unwrap();
        let config = load_config(&options).unwrap();

        assert_eq!(config.git.retry_attempts, 7);
        assert_eq!(config.git.remote_base, "file:///srv/assets");
        assert_eq!(config.git.user_name.as_deref(), Some("bot"));
    }
}
