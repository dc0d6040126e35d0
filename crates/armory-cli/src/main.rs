use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use armory_core::session::ScanContext;
use armory_core::types::NewWeapon;
use armory_core::{Subject, TransactionKind, WeaponStatus};
use clap::{Parser, Subcommand};
use serde_json::Value;

mod client;
mod scan;

use client::{encode_image, ApiClient};
use scan::ScanOptions;

#[derive(Parser)]
#[command(name = "armory", about = "Armory custody CLI", version)]
struct Cli {
    /// Base URL of armoryd
    #[arg(long, env = "ARMORY_URL", default_value = "http://127.0.0.1:8470")]
    url: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or replace) a subject's face template
    Register {
        subject: String,
        /// Photo of the subject (JPEG or PNG)
        image: PathBuf,
        #[arg(long)]
        operator: Option<String>,
    },
    /// Verify a probe image against a subject's template
    Verify { subject: String, image: PathBuf },
    /// Find the best-matching subject for a probe image
    Identify { image: PathBuf },
    /// Look up a weapon by QR code
    Weapon { code: String },
    /// Check a weapon out to a subject
    Checkout(TransactionArgs),
    /// Return a weapon to the armory
    Checkin(TransactionArgs),
    /// Hand a fielded weapon to another subject
    Reassign(TransactionArgs),
    /// List active face templates
    Faces,
    /// Deactivate a subject's template
    Deactivate { subject: String },
    /// Pull templates from the central registry
    Sync,
    /// Show custody history
    Transactions {
        #[arg(long)]
        weapon: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show recent verification attempts
    Attempts {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show daemon configuration and store counts
    Status,
    /// Add or update a member of personnel
    AddSubject {
        id_number: String,
        first_name: String,
        last_name: String,
        #[arg(long, default_value = "")]
        rank: String,
        #[arg(long)]
        inactive: bool,
    },
    /// Add a weapon to the registry
    AddWeapon {
        serial_number: String,
        model: String,
        /// Generated from the serial number when omitted
        #[arg(long)]
        qr_code: Option<String>,
    },
    /// List registered weapons
    Weapons,
    /// Replay a directory of camera frames through the kiosk flow
    Scan {
        #[arg(long)]
        weapon: String,
        #[arg(long)]
        subject: String,
        #[arg(long, value_parser = parse_kind, default_value = "check_out")]
        kind: TransactionKind,
        /// Directory of JPEG/PNG frames, replayed in file-name order
        #[arg(long)]
        frames: PathBuf,
        #[arg(long, default_value_t = 2)]
        retries: u32,
        /// Overrides the daemon's debounce_frames
        #[arg(long)]
        debounce: Option<u32>,
        /// Overrides the daemon's min_face_px
        #[arg(long)]
        min_face_px: Option<f32>,
        /// Overrides the daemon's reset_delay_ms
        #[arg(long)]
        reset_delay_ms: Option<u64>,
    },
}

#[derive(clap::Args)]
struct TransactionArgs {
    subject: String,
    /// Weapon QR code
    weapon: String,
    /// Probe image of the subject
    image: PathBuf,
    #[arg(long)]
    notes: Option<String>,
}

fn parse_kind(s: &str) -> Result<TransactionKind, String> {
    TransactionKind::parse(s).ok_or_else(|| format!("unknown transaction kind: {s}"))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn transact(client: &ApiClient, kind: TransactionKind, args: TransactionArgs) -> Result<()> {
    let image = encode_image(&args.image)?;
    let resp = client
        .transaction(&args.subject, &args.weapon, kind, image, args.notes.as_deref())
        .await?;
    print_json(&resp)?;
    if !resp["transaction_success"].as_bool().unwrap_or(false) {
        bail!("{}", resp["message"].as_str().unwrap_or("transaction failed"));
    }
    Ok(())
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
    let client = ApiClient::new(cli.url.clone(), Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::Register {
            subject,
            image,
            operator,
        } => {
            let image = encode_image(&image)?;
            print_json(&client.register(&subject, image, operator.as_deref()).await?)?;
        }
        Commands::Verify { subject, image } => {
            let resp = client.verify(&subject, encode_image(&image)?).await?;
            print_json(&resp)?;
            if !resp["verified"].as_bool().unwrap_or(false) {
                bail!("face not verified for {subject}");
            }
        }
        Commands::Identify { image } => {
            print_json(&client.identify(encode_image(&image)?).await?)?;
        }
        Commands::Weapon { code } => print_json(&client.weapon_info(&code).await?)?,
        Commands::Checkout(args) => transact(&client, TransactionKind::CheckOut, args).await?,
        Commands::Checkin(args) => transact(&client, TransactionKind::CheckIn, args).await?,
        Commands::Reassign(args) => transact(&client, TransactionKind::Reassign, args).await?,
        Commands::Faces => print_json(&client.list_faces().await?)?,
        Commands::Deactivate { subject } => print_json(&client.deactivate(&subject).await?)?,
        Commands::Sync => {
            let resp = client.sync().await?;
            println!(
                "synced: {} ok, {} failed",
                resp["success_count"].as_u64().unwrap_or(0),
                resp["fail_count"].as_u64().unwrap_or(0)
            );
        }
        Commands::Transactions { weapon, limit } => {
            print_json(&client.transactions(weapon.as_deref(), limit).await?)?;
        }
        Commands::Attempts { limit } => print_json(&client.attempts(limit).await?)?,
        Commands::Status => print_json(&client.status().await?)?,
        Commands::AddSubject {
            id_number,
            first_name,
            last_name,
            rank,
            inactive,
        } => {
            let subject = Subject {
                id_number,
                first_name,
                last_name,
                rank,
                active: !inactive,
            };
            print_json(&client.add_subject(&subject).await?)?;
        }
        Commands::AddWeapon {
            serial_number,
            model,
            qr_code,
        } => {
            let weapon = NewWeapon {
                serial_number,
                model,
                qr_code,
                status: WeaponStatus::Available,
            };
            print_json(&client.add_weapon(&weapon).await?)?;
        }
        Commands::Weapons => print_json(&client.list_weapons().await?)?,
        Commands::Scan {
            weapon,
            subject,
            kind,
            frames,
            retries,
            debounce,
            min_face_px,
            reset_delay_ms,
        } => {
            let status = client.status().await.context("fetching daemon settings")?;
            let daemon = &status["daemon"];
            let options = ScanOptions {
                debounce_frames: debounce
                    .or_else(|| daemon["debounce_frames"].as_u64().map(|v| v as u32))
                    .unwrap_or(3),
                min_face_px: min_face_px
                    .or_else(|| daemon["min_face_px"].as_f64().map(|v| v as f32))
                    .unwrap_or(100.0),
                reset_delay: Duration::from_millis(
                    reset_delay_ms
                        .or_else(|| daemon["reset_delay_ms"].as_u64())
                        .unwrap_or(3000),
                ),
                retries,
            };

            let frames = scan::load_frames(&frames)?;
            if frames.is_empty() {
                bail!("no JPEG or PNG frames found");
            }
            let context = ScanContext {
                weapon_code: weapon,
                subject_id: subject,
                kind,
            };
            let report = scan::replay(&client, context, &frames, &options).await?;
            println!(
                "{}: {} (attempts: {}, frames: {}/{})",
                if report.success { "OK" } else { "FAILED" },
                report.message,
                report.attempts,
                report.frames_used,
                frames.len()
            );
            if !report.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
