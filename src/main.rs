//! Caphost - runtime for signed capability plugins.
//!
//! The binary serves the plugin manager over JSON-RPC and carries the
//! package tooling: key generation, packing and inspection.

#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caphost::core::HostConfig;
use caphost::plugin::{
    signing, BuiltinHost, HostRouter, PackageBuilder, PackageReader, PluginManager, PluginManifest,
    ProcessHost, MANIFEST_FILE, PACKAGE_EXTENSION,
};
use caphost::RpcServer;

/// Environment variables handed through to out-of-process plugins.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG"];

/// Runtime for signed, hot-loadable capability plugins
#[derive(Parser)]
#[command(name = "caphost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $CAPHOST_CONFIG, ./caphost.toml, then the user config dir)
    #[arg(short, long, global = true, env = "CAPHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the plugins directory and serve JSON-RPC
    Serve {
        /// TCP address to listen on (stdio when absent)
        #[arg(short, long)]
        listen: Option<String>,

        /// Start with an empty registry instead of discovering the plugins directory
        #[arg(long)]
        no_discover: bool,
    },

    /// Load every package in a directory and print the report
    Discover {
        /// Directory to scan (defaults to the configured plugins directory)
        dir: Option<PathBuf>,
    },

    /// Print the manifest and payload checksum of a package
    Inspect {
        /// Package file
        package: PathBuf,

        /// Also verify checksum and signature
        #[arg(long)]
        verify: bool,
    },

    /// Build a package from a directory holding manifest.json and payload files
    Pack {
        /// Plugin directory
        dir: PathBuf,

        /// Output file (defaults to <id>-<version>.xpkg)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Signing key file written by `keygen`
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Generate an ed25519 signing key
    Keygen {
        /// Where to write the private key
        #[arg(short, long)]
        out: PathBuf,

        /// Overwrite an existing key file
        #[arg(short, long)]
        force: bool,
    },

    /// Show effective configuration
    Config {
        /// Show the config file path only
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays free for RPC and command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Serve { listen, no_discover } => cmd_serve(config_path, listen, no_discover).await,
        Commands::Discover { dir } => cmd_discover(config_path, dir.as_deref()).await,
        Commands::Inspect { package, verify } => cmd_inspect(config_path, &package, verify).await,
        Commands::Pack { dir, out, key } => cmd_pack(&dir, out, key.as_deref()),
        Commands::Keygen { out, force } => cmd_keygen(&out, force),
        Commands::Config { path } => cmd_config(config_path, path),
    }
}

fn load_config(explicit: Option<&Path>) -> Result<HostConfig> {
    let (config, source) = HostConfig::load(explicit)?;
    match source {
        Some(path) => tracing::debug!(path = %path.display(), "loaded config"),
        None => tracing::debug!("using default config"),
    }
    Ok(config)
}

fn build_manager(config: &HostConfig) -> Result<Arc<PluginManager>> {
    let mut process = ProcessHost::new();
    for key in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            process = process.with_env(*key, value);
        }
    }
    let router = HostRouter::new(Arc::new(BuiltinHost::new()), Arc::new(process));
    let manager = PluginManager::from_config(config, Arc::new(router))?;
    Ok(Arc::new(manager))
}

/// Serve the manager until EOF on stdio or Ctrl+C.
async fn cmd_serve(config_path: Option<&Path>, listen: Option<String>, no_discover: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(&config)?;

    if !no_discover {
        let report = manager.discover(None).await?;
        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "initial discovery finished"
        );
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    let server = RpcServer::new(Arc::clone(&manager));
    let served = match listen.or_else(|| config.rpc.listen.clone()) {
        Some(addr) => server.listen(&addr, shutdown).await,
        None => server.serve_stdio(shutdown).await,
    };

    manager.shutdown().await;
    served.context("RPC server failed")
}

async fn cmd_discover(config_path: Option<&Path>, dir: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = build_manager(&config)?;

    let report = manager.discover(dir).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown().await;
    if !report.failed.is_empty() {
        bail!("{} package(s) failed to load", report.failed.len());
    }
    Ok(())
}

async fn cmd_inspect(config_path: Option<&Path>, package: &Path, verify: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let reader = PackageReader::new(config.reader_options()?);

    let (manifest, checksum) = reader
        .inspect(package)
        .with_context(|| format!("Failed to read {}", package.display()))?;

    println!("{} v{} ({})", manifest.name, manifest.version, manifest.id);
    if !manifest.description.is_empty() {
        println!("  {}", manifest.description);
    }
    if !manifest.provider.is_empty() {
        println!("  provider:     {}", manifest.provider);
    }
    for decl in &manifest.capabilities {
        if decl.models.is_empty() {
            println!("  capability:   {}", decl.capability);
        } else {
            println!("  capability:   {} [{}]", decl.capability, decl.models.join(", "));
        }
    }
    println!("  entrypoint:   {}", manifest.entrypoint_target());
    println!("  checksum:     {checksum}");
    println!("  signed:       {}", if manifest.signature.is_empty() { "no" } else { "yes" });

    if verify {
        let validated = reader.read(package).await?;
        println!(
            "  verified:     checksum ok, signature {}",
            if validated.is_signed() { "ok" } else { "not required" }
        );
    }
    Ok(())
}

fn cmd_pack(dir: &Path, out: Option<PathBuf>, key: Option<&Path>) -> Result<()> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = std::fs::read(&manifest_path)
        .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
    let manifest = PluginManifest::from_json(&raw)?;

    let key = match key {
        Some(path) => {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read key {}", path.display()))?;
            Some(signing::decode_signing_key(encoded.trim())?)
        }
        None => None,
    };

    let out = out.unwrap_or_else(|| {
        PathBuf::from(format!("{}-{}.{PACKAGE_EXTENSION}", manifest.id, manifest.version))
    });
    let sealed = PackageBuilder::new(manifest).dir(dir)?.write(&out, key.as_ref())?;

    println!("Packed {} v{} -> {}", sealed.id, sealed.version, out.display());
    println!("  checksum: {}", sealed.checksum);
    if key.is_some() {
        println!("  signed");
    }
    Ok(())
}

fn cmd_keygen(out: &Path, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", out.display());
    }

    let key = signing::generate_signing_key();
    let encoded = signing::encode_signing_key(&key);
    write_private(out, encoded.as_bytes())?;

    println!("Wrote signing key to {}", out.display());
    println!("Public key (add to [security].trusted_keys):");
    println!("{}", signing::encode_verifying_key(&key.verifying_key()));
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to create {}", path.display()))
}

fn cmd_config(config_path: Option<&Path>, show_path: bool) -> Result<()> {
    if show_path {
        let (_, source) = HostConfig::load(config_path)?;
        match source.or_else(|| HostConfig::config_dir().map(|d| d.join("config.toml"))) {
            Some(path) => println!("{}", path.display()),
            None => bail!("Could not determine config directory"),
        }
        return Ok(());
    }

    let config = load_config(config_path)?;
    println!("{}", config.to_toml()?);
    Ok(())
}
