//! unifi-relay CLI - talk to a UniFi console through the vendor cloud relay.
//!
//! This is the main binary entry point. See the `unifi_relay` library for
//! the core functionality.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use unifi_relay::{CloudAccess, CloudDevice, LoginOutcome, RelayConfig, VoucherSpec};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "unifi-relay")]
#[command(version)]
#[command(about = "Reach a UniFi console through the cloud relay")]
struct Cli {
    /// Account user name
    #[arg(long, env = "UNIFI_USERNAME", global = true)]
    username: Option<String>,
    /// Account password
    #[arg(long, env = "UNIFI_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
    /// Second-factor token; prompted for when missing and required
    #[arg(long, global = true)]
    mfa_token: Option<String>,
    /// Console id (default: first listed)
    #[arg(long, global = true)]
    device: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List consoles registered with the account
    Devices,
    /// Hotspot vouchers
    Vouchers {
        #[command(subcommand)]
        action: VoucherAction,
    },
    /// GET a path on the console (e.g. /proxy/network/api/s/default/stat/health)
    Get {
        /// Absolute request path
        path: String,
    },
    /// POST a JSON body to a path on the console
    Post {
        /// Absolute request path
        path: String,
        /// Request body (JSON)
        body: String,
    },
}

#[derive(Subcommand)]
enum VoucherAction {
    /// List vouchers
    List,
    /// Create vouchers
    Create {
        /// Number of vouchers
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Uses per voucher, 0 for unlimited
        #[arg(long, default_value_t = 0)]
        quota: u32,
        /// Lifetime in minutes
        #[arg(long, default_value_t = unifi_relay::constants::DEFAULT_VOUCHER_EXPIRE_MINUTES)]
        expire: u32,
        /// Note shown in the controller
        #[arg(long)]
        note: Option<String>,
    },
    /// Revoke a voucher by id
    Revoke {
        /// Voucher `_id`
        id: String,
    },
}

/// Sign in, answering a second-factor challenge if one comes back.
async fn sign_in(cloud: &CloudAccess, cli: &Cli) -> Result<()> {
    let username = cli
        .username
        .as_deref()
        .context("No user name: set UNIFI_USERNAME or pass --username")?;
    let password = cli
        .password
        .as_deref()
        .context("No password: set UNIFI_PASSWORD or pass --password")?;

    match cloud.login(username, password).await? {
        LoginOutcome::Authenticated => Ok(()),
        LoginOutcome::MfaRequired(factors) => {
            eprintln!("Second factor required:");
            for factor in &factors {
                let marker = if factor.preferred { " (default)" } else { "" };
                eprintln!("  {}{marker}", factor.description());
            }
            let token = match &cli.mfa_token {
                Some(token) => token.clone(),
                None => prompt_mfa_token()?,
            };
            cloud.verify_mfa(&token).await
        }
    }
}

fn prompt_mfa_token() -> Result<String> {
    if !atty::is(atty::Stream::Stdin) {
        bail!("Second factor required: pass --mfa-token");
    }
    eprint!("2FA token: ");
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let token = input.trim().to_string();
    if token.is_empty() {
        bail!("No 2FA token entered");
    }
    Ok(token)
}

async fn pick_device(cloud: &CloudAccess, requested: Option<&str>) -> Result<String> {
    if let Some(id) = requested {
        return Ok(id.to_string());
    }
    let devices = cloud.devices().await?;
    let first = devices.first().context("No consoles registered with this account")?;
    log::info!("Using console {}", first.id);
    Ok(first.id.clone())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_device_command(device: &CloudDevice, command: Commands) -> Result<serde_json::Value> {
    let value = match command {
        Commands::Devices => bail!("devices does not talk to a console"),
        Commands::Vouchers { action } => match action {
            VoucherAction::List => device.vouchers().await?,
            VoucherAction::Create {
                count,
                quota,
                expire,
                note,
            } => {
                let spec = VoucherSpec {
                    count,
                    quota,
                    expire_minutes: expire,
                    note,
                };
                device.create_voucher(&spec).await?
            }
            VoucherAction::Revoke { id } => device.revoke_voucher(&id).await?,
        },
        Commands::Get { path } => device.get(&path).await?,
        Commands::Post { path, body } => {
            let body: serde_json::Value =
                serde_json::from_str(&body).context("Request body is not valid JSON")?;
            device.post(&path, &body).await?
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::load()?;
    let cloud = CloudAccess::new(config.cloud_settings())?;
    sign_in(&cloud, &cli).await?;

    match cli.command {
        Commands::Devices => {
            let devices = cloud.devices().await?;
            print_json(&serde_json::to_value(devices)?)
        }
        command => {
            let id = pick_device(&cloud, cli.device.as_deref()).await?;
            let device = CloudDevice::from_cloud(&cloud, &id, config.device_settings()).await?;
            let result = run_device_command(&device, command).await;
            device.close().await;
            print_json(&result?)
        }
    }
}
