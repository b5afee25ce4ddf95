#![forbid(unsafe_code)]
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mpk::archive::{self, MpkPackage};
use mpk::config::Config;
use mpk::inspect::inspect;
use mpk::package::{PackageOptions, package};
use mpk::runtime::Runtime;
use mpk::signature::{generate_keypair, load_private_key, load_public_key};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mpk", version, author, about = "Build, sign, install and run MPK packages")]
struct Cli {
    /// Config file (default: $MPK_CONFIG or ~/.mpk/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured install directory
    #[arg(long, global = true, env = "MPK_INSTALL_DIR")]
    install_dir: Option<PathBuf>,
    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package a folder (manifest.json, code/, assets/, config/) into a .mpk
    Package {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// PKCS#8 PEM private key used to sign the package
        #[arg(short, long)]
        key: Option<PathBuf>,
    },
    /// Show manifest, members and signature state of a package
    Inspect {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check a file against the MPK container rules
    Validate {
        #[arg(short, long)]
        path: PathBuf,
        /// Also require a signature made by this public key
        #[arg(long)]
        pubkey: Option<PathBuf>,
    },
    /// Generate an RSA key pair (PKCS#8 private, SPKI public)
    Keygen {
        #[arg(long)]
        secret: PathBuf,
        #[arg(long)]
        public: PathBuf,
        #[arg(long, default_value_t = 2048)]
        bits: usize,
    },
    /// Sign a package in place, or into --output
    Sign {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(short, long)]
        key: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Verify a package signature
    Verify {
        #[arg(short, long)]
        path: PathBuf,
        #[arg(long)]
        pubkey: PathBuf,
    },
    /// Install a package into the install directory
    Install {
        #[arg(short, long)]
        path: PathBuf,
    },
    Uninstall { app_id: String },
    /// List installed apps
    List,
    /// Show details of an installed app
    Info {
        app_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Load an installed app and run it (simulated)
    Run { app_id: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_runtime(config: Option<&Path>, install_dir: Option<PathBuf>) -> Result<Runtime> {
    let mut config = Config::load(config).context("Failed to load config")?;
    if let Some(dir) = install_dir {
        config.install_dir = dir;
    }
    Runtime::open(config).context("Failed to open runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Package { input, output, key } => {
            let pkg = package(PackageOptions {
                input,
                output: output.clone(),
                key,
            })?;
            println!(
                "Created .mpk file at {} ({}, {})",
                output.display(),
                pkg.manifest().app_id(),
                pkg.signature_state().label()
            );
        }
        Commands::Inspect { path, json } => {
            let report = inspect(&path).with_context(|| format!("Failed to inspect {:?}", path))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_text());
            }
        }
        Commands::Validate { path, pubkey } => {
            let report = archive::validate(&path);
            for w in &report.warnings {
                println!("warning: {w}");
            }
            for e in &report.errors {
                println!("error: {e}");
            }
            if !report.valid {
                bail!("{} is not a valid MPK", path.display());
            }
            if let Some(pubkey) = pubkey {
                let key = load_public_key(&pubkey)?;
                if !MpkPackage::load(&path)?.verify(&key)? {
                    bail!("{} is not signed by {}", path.display(), pubkey.display());
                }
            }
            println!("{} is a valid MPK", path.display());
        }
        Commands::Keygen {
            secret,
            public,
            bits,
        } => {
            generate_keypair(bits, &secret, &public).context("Failed to generate key pair")?;
            println!("Wrote {} and {}", secret.display(), public.display());
        }
        Commands::Sign { path, key, output } => {
            let key = load_private_key(&key)?;
            let mut pkg = MpkPackage::load(&path).with_context(|| format!("Failed to load {:?}", path))?;
            pkg.sign(&key);
            let output = output.unwrap_or(path);
            pkg.save(&output)?;
            println!("Signed {}", output.display());
        }
        Commands::Verify { path, pubkey } => {
            let key = load_public_key(&pubkey)?;
            let pkg = MpkPackage::load(&path).with_context(|| format!("Failed to load {:?}", path))?;
            if !pkg.verify(&key)? {
                bail!(
                    "signature verification failed for {} ({})",
                    path.display(),
                    pkg.signature_state().label()
                );
            }
            println!("Signature OK: {}", path.display());
        }
        Commands::Install { path } => {
            let mut rt = open_runtime(config, cli.install_dir)?;
            let app_id = rt
                .install_app(&path)
                .with_context(|| format!("Failed to install {:?}", path))?;
            println!("Installed {app_id}");
        }
        Commands::Uninstall { app_id } => {
            let mut rt = open_runtime(config, cli.install_dir)?;
            rt.uninstall_app(&app_id)?;
            println!("Uninstalled {app_id}");
        }
        Commands::List => {
            let rt = open_runtime(config, cli.install_dir)?;
            let apps = rt.list_installed_apps();
            if apps.is_empty() {
                println!("No apps installed");
            }
            for (app_id, entry) in apps {
                println!(
                    "{app_id}\t{}\t{}\t{}",
                    entry.app_name,
                    entry.version,
                    entry.install_date.to_rfc3339()
                );
            }
        }
        Commands::Info { app_id, json } => {
            let rt = open_runtime(config, cli.install_dir)?;
            let info = rt.installed_app_info(&app_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("App ID:    {}", info.app_id);
                println!("Name:      {}", info.manifest.name);
                println!("Version:   {}", info.manifest.version);
                println!("Installed: {}", info.entry.install_date.to_rfc3339());
                println!("Signature: {}", info.signature);
                println!("Files:");
                for f in &info.files {
                    println!("  {f}");
                }
            }
        }
        Commands::Run { app_id } => {
            let mut rt = open_runtime(config, cli.install_dir)?;
            rt.load_app(&app_id)
                .with_context(|| format!("Failed to load {app_id}"))?;
            let report = rt.run_app(&app_id)?;
            println!(
                "Started {} [{}] entry={} ({} bytes)",
                report.app_id,
                report.code_type,
                report.entry_point,
                report.entry_size
            );
            for (k, v) in &report.env {
                println!("  {k}={v}");
            }
            rt.cleanup();
        }
    }

    Ok(())
}
