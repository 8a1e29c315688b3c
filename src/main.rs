use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keywarden::prelude::*;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "keywarden")]
#[command(about = "Admin SSH key custody and rotation")]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/keywarden/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new admin key, replacing the current one
    Generate {
        /// Modulus size: 2048, 3072 or 4096 (default from config)
        #[arg(long)]
        bits: Option<u32>,
    },

    /// Re-encrypt the admin key under the configured encryption secret.
    /// Previous secrets and the fallback key file come from config/env.
    RotateSecret,

    /// Check that the stored key pair is consistent
    Verify,

    /// Write the admin private key (PKCS#1 PEM, mode 0600) to a file
    Export {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show the lifecycle state of the admin key
    Status,

    /// List active ssh-rsa keys
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::debug!("{} ({}): {:?}", e.error_type(), e.error_code(), e.technical_details());
            eprintln!("error: {}", e.user_friendly_message());
            if let Some(remediation) = e.suggested_remediation() {
                eprintln!("hint: {}", remediation);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> KeyCustodyResult<()> {
    let config = match &cli.config {
        Some(path) => AdminKeyConfig::load_from(path)?,
        None => AdminKeyConfig::load()?,
    };
    config.validate()?;

    let store = Arc::new(JsonFileKeyStore::new(&config.store_path));
    log::debug!("Using key store {}", store.path().display());

    let name = config.name.clone();
    let coordinator = Arc::new(KeyRotationCoordinator::new(config, store));

    match cli.command {
        Commands::Generate { bits } => {
            let bits = match bits {
                Some(bits) => ModulusBits::try_from(bits)?,
                None => coordinator.config().modulus_bits,
            };
            let comment = coordinator.config().comment.clone();

            let mut job = coordinator.spawn_regenerate(bits, &comment)?;
            eprintln!("Generating {} key '{}'...", bits, name);
            let record = loop {
                match job.poll() {
                    JobStatus::Pending => thread::sleep(POLL_INTERVAL),
                    JobStatus::Finished(result) => break result?,
                }
            };

            println!("{}", record.public_key);
            eprintln!("Generated '{}' ({})", record.name, record.fingerprint);
            eprintln!("Hosts provisioned with the previous key must be re-keyed.");
        }

        Commands::RotateSecret => {
            let config = coordinator.config();
            let result =
                coordinator.rotate_secret(&config.previous_secrets, &config.encryption_secret)?;
            println!(
                "Rotated '{}' via {} ({})",
                result.name, result.source, result.record.fingerprint
            );
        }

        Commands::Verify => {
            let record = coordinator.check_before_use(&name)?;
            println!("'{}' is consistent ({})", record.name, record.fingerprint);
        }

        Commands::Export { out } => {
            let credential = coordinator.request_admin_credential(&name)?;
            credential.write_private_key(&out)?;
            println!("{}", credential.public_key_line());
            eprintln!("Private key written to {}", out.display());
        }

        Commands::Status => {
            let state = coordinator.state(&name)?;
            println!("{}: {}", name, state);
            if let Some(record) = coordinator
                .list_keys()?
                .into_iter()
                .find(|record| record.name == name)
            {
                println!("  fingerprint: {}", record.fingerprint);
                println!("  created:     {}", record.created_at.to_rfc3339());
                println!("  updated:     {}", record.updated_at.to_rfc3339());
            }
        }

        Commands::List => {
            for record in coordinator.list_keys()? {
                println!(
                    "{}\t{}\t{}",
                    record.name,
                    record.fingerprint,
                    record.updated_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
