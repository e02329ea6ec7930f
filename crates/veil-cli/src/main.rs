use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use veil_watch::archive::{self, ENCRYPTED_SUFFIX};
use veil_watch::{placement, Config};

/// Environment variable holding the archive password.
const PASSWORD_ENV: &str = "ORIGINALS_ENCRYPTION_PASSWORD";

#[derive(Parser)]
#[command(name = "veil", about = "Veil face anonymization pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process everything in the input directory once, then exit
    Run,
    /// Print the face record stored with a detection output
    Inspect {
        /// Detection output image (JPEG with EXIF, or any image with a sidecar)
        file: PathBuf,
    },
    /// Decrypt an archived original
    Decrypt {
        /// Encrypted archive file (`original_<name>.enc`)
        file: PathBuf,
        /// Where to write the plaintext (default: input path without `.enc`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = Config::from_env().context("invalid configuration")?;
            let mut watcher = veil_watch::bootstrap(&config).context("startup failed")?;
            let summary = watcher.drain().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed > 0 {
                std::process::exit(2);
            }
        }
        Commands::Inspect { file } => match placement::load_record(&file)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => bail!("no face record found for {}", file.display()),
        },
        Commands::Decrypt { file, output } => {
            let password = std::env::var(PASSWORD_ENV)
                .ok()
                .filter(|p| !p.is_empty())
                .with_context(|| format!("{PASSWORD_ENV} is not set"))?;
            let output = match output {
                Some(path) => path,
                None => default_decrypt_output(&file)?,
            };
            let sealed = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let plain = archive::decrypt(&password, &sealed)?;
            std::fs::write(&output, plain).with_context(|| format!("writing {}", output.display()))?;
            println!("{}", output.display());
        }
        Commands::Config => {
            let config = Config::from_env().context("invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// `original_a.jpg.enc` decrypts to `original_a.jpg` next to it.
fn default_decrypt_output(file: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file name: {}", file.display()))?;
    match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(plain) if !plain.is_empty() => Ok(file.with_file_name(plain)),
        _ => bail!("{} has no {ENCRYPTED_SUFFIX} suffix; pass --output", file.display()),
    }
}
