use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use rfs::{Config, Registry};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Copies and inspects files on any registered backend.
///
/// Files are addressed by url, e.g. `file:///tmp/data.bin` or `s3://bucket/key`.
#[derive(Parser)]
#[command(name = "rfs", version)]
struct Cli {
    /// TOML file holding backend settings
    #[arg(long, env = "RFS_CONFIG")]
    config: Option<PathBuf>,

    /// Backend setting overriding the config file, e.g. `-o region=eu-west-1`
    #[arg(short = 'o', long = "option", value_parser = parse_key_val)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Writes the content of a file to stdout
    Cat { url: Url },
    /// Copies a file between any two backends
    Cp { from: Url, to: Url },
    /// Lists the direct children of a directory
    Ls { url: Url },
    /// Prints the metadata of a file
    Stat { url: Url },
    /// Removes a file
    Rm {
        url: Url,
        /// Removes everything below the given path
        #[arg(short, long)]
        recursive: bool,
    },
    /// Prints every entry below a directory
    Walk {
        url: Url,
        /// Maximum number of levels to descend
        #[arg(long)]
        depth: Option<usize>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{}`", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config.as_ref() {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::new(),
    };
    for (key, value) in cli.options {
        config.insert(key, value);
    }

    let registry = Registry::default();
    match cli.command {
        Command::Cat { url } => cat(&registry, &config, &url).await,
        Command::Cp { from, to } => cp(&registry, &config, &from, &to).await,
        Command::Ls { url } => {
            let (backend, path) = registry.resolve(&url, &config).await?;
            for entry in backend.list_dir(&path).await? {
                println!("{}{}", entry.path, if entry.is_dir { "/" } else { "" });
            }
            Ok(())
        }
        Command::Stat { url } => {
            let (backend, path) = registry.resolve(&url, &config).await?;
            let metadata = backend.stat(&path).await?;
            println!("name:     {}", metadata.name());
            println!("size:     {}", metadata.size());
            println!("modified: {}", metadata.modified());
            println!("dir:      {}", metadata.is_dir());
            if let Some(etag) = metadata.etag() {
                println!("etag:     {}", etag);
            }
            Ok(())
        }
        Command::Rm { url, recursive } => {
            let (backend, path) = registry.resolve(&url, &config).await?;
            if recursive {
                backend.remove_all(&path).await?;
            } else {
                backend.remove(&path).await?;
            }
            Ok(())
        }
        Command::Walk { url, depth } => {
            let (backend, path) = registry.resolve(&url, &config).await?;
            let mut entries = backend.walk(&path, depth).await?;
            while let Some(entry) = entries.try_next().await? {
                println!("{}", entry.path);
            }
            Ok(())
        }
    }
}

async fn cat(registry: &Registry, config: &Config, url: &Url) -> anyhow::Result<()> {
    let mut reader = registry.open(url.as_str(), config).await?.into_reader()?;
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).await?;
    }
    stdout.flush().await?;
    reader.close()?;
    Ok(())
}

async fn cp(registry: &Registry, config: &Config, from: &Url, to: &Url) -> anyhow::Result<()> {
    if from == to {
        bail!("source and destination are the same");
    }
    let mut reader = registry.open(from.as_str(), config).await?.into_reader()?;
    let mut writer = registry.create(to.as_str(), config).await?.into_writer()?;

    let copied = rfs::backend::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("copying {} to {}", from, to))?;
    tracing::info!(copied, from = %from, to = %to, "copy finished");
    Ok(())
}
