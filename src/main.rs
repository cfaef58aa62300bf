//! cbctl - command line companion for the platform SDK
//!
//! Logs in as any role, publishes and subscribes. Useful for checking a
//! system's credentials and watching broker traffic.

use bytes::Bytes;
use cb_sdk::prelude::*;
use cb_sdk::observability::init_default_logging;
use cb_sdk::transport::mqtt::parse_qos;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tracing::{error, info};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Command line client for the ClearBlade platform
#[derive(Parser)]
#[command(name = "cbctl")]
#[command(about = "Authenticate, publish and subscribe against a ClearBlade platform")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    identity: Identity,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Admin,
    User,
    Device,
}

#[derive(Args)]
struct Identity {
    /// Role to act as
    #[arg(long, value_enum, default_value = "user", global = true)]
    role: RoleArg,

    #[arg(long, env = "CB_SYSTEM_KEY", global = true)]
    system_key: Option<String>,

    #[arg(long, env = "CB_SYSTEM_SECRET", global = true, hide_env_values = true)]
    system_secret: Option<String>,

    #[arg(long, env = "CB_EMAIL", global = true)]
    email: Option<String>,

    #[arg(long, env = "CB_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// Existing token; skips the login call
    #[arg(long, env = "CB_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[arg(long, env = "CB_DEVICE_NAME", global = true)]
    device_name: Option<String>,

    #[arg(long, env = "CB_ACTIVE_KEY", global = true, hide_env_values = true)]
    active_key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and report the outcome
    Auth {
        /// Log in through the auth broker instead of HTTP (users only)
        #[arg(long)]
        via_mqtt: bool,
    },
    /// Publish one message
    Publish {
        topic: String,
        message: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Print messages matching a filter until Ctrl-C
    Subscribe {
        filter: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(cli.command, &cli.identity, config).await {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> CliResult<SdkConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(SdkConfig::load_from_file(path)?)
        }
        None => {
            let default_path = Path::new("cbctl.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                return Ok(SdkConfig::load_from_file(default_path)?);
            }
            Ok(SdkConfig::default())
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> CliResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| format!("--{name} is required for this role").into())
}

/// Build the role client and log it in unless a token was supplied
async fn connect_role(
    identity: &Identity,
    config: SdkConfig,
    via_mqtt: bool,
) -> CliResult<Box<dyn RoleClient>> {
    let client: Box<dyn RoleClient> = match identity.role {
        RoleArg::Admin => {
            let email = required(&identity.email, "email")?;
            let admin = match &identity.token {
                Some(token) => AdminClient::with_token(config, token.as_str(), email)?,
                None => {
                    let admin =
                        AdminClient::new(config, email, required(&identity.password, "password")?)?;
                    let auth = admin.authenticate().await?;
                    if auth.is_two_factor {
                        return Err("two-factor login is not supported by cbctl".into());
                    }
                    admin
                }
            };
            match (&identity.system_key, &identity.system_secret) {
                (Some(key), Some(secret)) => Box::new(admin.with_system(key.as_str(), secret.as_str())),
                _ => Box::new(admin),
            }
        }
        RoleArg::User => {
            let key = required(&identity.system_key, "system-key")?;
            let secret = required(&identity.system_secret, "system-secret")?;
            let email = required(&identity.email, "email")?;
            match &identity.token {
                Some(token) => Box::new(UserClient::with_token(config, key, secret, email, token.as_str())?),
                None => {
                    let password = required(&identity.password, "password")?;
                    let user = UserClient::new(config, key, secret, email, password)?;
                    if via_mqtt {
                        user.authenticate_mqtt(MqttAuthRequest::new(email, password))
                            .await?;
                    } else {
                        user.authenticate().await?;
                    }
                    Box::new(user)
                }
            }
        }
        RoleArg::Device => {
            let key = required(&identity.system_key, "system-key")?;
            let secret = required(&identity.system_secret, "system-secret")?;
            let name = required(&identity.device_name, "device-name")?;
            match &identity.token {
                Some(token) => Box::new(DeviceClient::with_token(config, key, secret, name, token.as_str())?),
                None => {
                    let active_key = required(&identity.active_key, "active-key")?;
                    let device = DeviceClient::new(config, key, secret, name, active_key)?;
                    device.authenticate().await?;
                    Box::new(device)
                }
            }
        }
    };

    Ok(client)
}

async fn run(command: Commands, identity: &Identity, config: SdkConfig) -> CliResult<()> {
    match command {
        Commands::Auth { via_mqtt } => {
            if via_mqtt && !matches!(identity.role, RoleArg::User) {
                return Err("--via-mqtt is only available for users".into());
            }
            let client = connect_role(identity, config, via_mqtt).await?;
            let authenticated = match identity.role {
                RoleArg::Device => client.token().await.is_some(),
                _ => {
                    let preamble = client.preamble();
                    let response = client
                        .dispatch(Request::post(format!("{preamble}/checkauth")))
                        .await?;
                    response.is_success()
                }
            };
            println!("{} authenticated: {}", client.role(), authenticated);
        }
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => {
            let qos = parse_qos(qos)?;
            let client = connect_role(identity, config, false).await?;
            client.initialize_mqtt(MqttInit::new()).await?;
            client
                .publish_retained(&topic, Bytes::from(message), qos, retain)
                .await?;
            info!(topic = %topic, "Message published");
            client.disconnect().await?;
        }
        Commands::Subscribe { filter, qos, count } => {
            let qos = parse_qos(qos)?;
            let client = connect_role(identity, config, false).await?;
            client.initialize_mqtt(MqttInit::new()).await?;
            let mut records = client.subscribe(&filter, qos).await?;

            let mut received = 0usize;
            loop {
                tokio::select! {
                    record = records.recv() => {
                        let Some(record) = record else {
                            info!("Subscription channel closed");
                            break;
                        };
                        println!("{}\t{}", record.topic, String::from_utf8_lossy(&record.payload));
                        received += 1;
                        if count.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl-C, shutting down");
                        break;
                    }
                }
            }

            if let Err(e) = client.unsubscribe(&filter).await {
                error!("Failed to unsubscribe: {}", e);
            }
            client.disconnect().await?;
        }
    }
    Ok(())
}
