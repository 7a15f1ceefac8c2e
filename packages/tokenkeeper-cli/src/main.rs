//! Tokenkeeper CLI - Keep an OAuth access token valid on a headless machine
//!
//! This binary is a thin front end over `tokenkeeper-core` that can:
//! - Sign in using the OAuth device flow
//! - Print a fresh access token for scripts
//! - Refresh or discard stored credentials
//! - Keep the token fresh in the foreground (for systemd integration)

mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokenkeeper_core::{auth, config, AuthError, AuthInstructions, AuthState, CredentialManager};

#[derive(Parser)]
#[command(name = "tokenkeeper")]
#[command(version)]
#[command(about = "Device-flow sign-in and encrypted token storage for headless clients")]
#[command(long_about = "
Tokenkeeper signs a machine in to an OAuth 2.0 protected API using the
device authorization grant, stores the tokens encrypted under a key bound
to this machine, and refreshes the access token before it expires.

Quick start:
  1. Sign in:           tokenkeeper login
  2. Use the token:     curl -H \"Authorization: Bearer $(tokenkeeper token)\" ...
  3. Keep it fresh:     tokenkeeper watch
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in using the device flow and wait for it to complete
    #[command(alias = "connect")]
    Login {
        /// Do not try to open the verification page in a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Print a valid access token, refreshing it first if needed
    Token,

    /// Show sign-in status
    Status,

    /// Force a refresh of the access token
    Refresh,

    /// Delete the stored credentials
    #[command(alias = "disconnect")]
    Logout,

    /// Keep the access token fresh until interrupted
    Watch {
        /// Check interval in minutes (1 to 1440)
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..=1440))]
        interval: u64,
    },

    /// Show configuration paths and settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tokenkeeper={},tokenkeeper_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Login { no_browser } => cmd_login(&cli, no_browser).await,
        Commands::Token => cmd_token(&cli).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Refresh => cmd_refresh(&cli).await,
        Commands::Logout => cmd_logout(&cli).await,
        Commands::Watch { interval } => watch::run_watch(open_manager()?, interval).await,
        Commands::Config => cmd_config(&cli),
    }
}

fn open_manager() -> Result<CredentialManager> {
    Ok(CredentialManager::new(config::load_auth_config())?)
}

/// Turn a core error into the operator-facing message
fn fail(err: AuthError) -> anyhow::Error {
    anyhow::anyhow!(err.user_message())
}

fn print_instructions(instructions: &AuthInstructions) {
    eprintln!();
    eprintln!("To sign in, visit:\n\n    {}\n", instructions.verification_uri);
    eprintln!("and enter the code:\n\n    {}\n", instructions.user_code);
    eprintln!(
        "The code expires at {}.",
        instructions.expires_at.format("%H:%M:%S UTC")
    );
}

async fn cmd_login(cli: &Cli, no_browser: bool) -> Result<()> {
    let manager = open_manager()?;

    // Check if already signed in
    if manager.initialize().await.map_err(fail)? == AuthState::Authenticated {
        let status = manager.status().await;
        match cli.format {
            OutputFormat::Text => {
                println!("Already signed in.");
                println!("Use 'tokenkeeper logout' to sign out first.");
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "status": "already_signed_in",
                    "expires_at": status.expires_at,
                }));
            }
        }
        return Ok(());
    }

    let instructions = manager.start_device_flow().await.map_err(fail)?;

    match cli.format {
        OutputFormat::Text => {
            print_instructions(&instructions);
            if !no_browser {
                auth::open_verification_page(&instructions);
            }
            eprintln!();
            eprintln!("Waiting for authorization...");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "awaiting_authorization",
                "verification_uri": instructions.verification_uri,
                "user_code": instructions.user_code,
                "expires_in": instructions.expires_in_seconds,
            }));
        }
    }

    tokio::select! {
        result = manager.wait_for_authorization() => result.map_err(fail)?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            eprintln!("Interrupted. Run 'tokenkeeper login' again to resume with the same code.");
            return Ok(());
        }
    }

    let status = manager.status().await;
    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("Signed in.");
            if let Some(expires_at) = status.expires_at {
                println!("Access token valid until {}", expires_at.to_rfc3339());
            }
            println!();
            println!("Print the token with: tokenkeeper token");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "signed_in",
                "expires_at": status.expires_at,
                "has_refresh_token": status.has_refresh_token,
            }));
        }
    }

    Ok(())
}

async fn cmd_token(cli: &Cli) -> Result<()> {
    let manager = open_manager()?;

    match manager.get_valid_access_token().await {
        Ok(token) => {
            match cli.format {
                OutputFormat::Text => println!("{}", token),
                OutputFormat::Json => {
                    let status = manager.status().await;
                    println!("{}", serde_json::json!({
                        "access_token": token,
                        "token_type": status.token_type,
                        "expires_at": status.expires_at,
                    }));
                }
            }
            Ok(())
        }
        Err(AuthError::AuthenticationRequired(instructions)) => {
            match cli.format {
                OutputFormat::Text => {
                    eprintln!("Not signed in.");
                    print_instructions(&instructions);
                    eprintln!();
                    eprintln!("Then run 'tokenkeeper login' to finish signing in.");
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({
                        "status": "authentication_required",
                        "instructions": instructions,
                    }));
                }
            }
            std::process::exit(2);
        }
        Err(e) => Err(fail(e)),
    }
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let manager = open_manager()?;
    manager.initialize().await.map_err(fail)?;
    let status = manager.status().await;
    let (tokens_path, device_code_path) = manager.storage_paths();

    match cli.format {
        OutputFormat::Text => {
            println!("Status:  {}", status.state);
            if let Some(expires_at) = status.expires_at {
                let remaining = expires_at - chrono::Utc::now();
                if remaining.num_seconds() > 0 {
                    println!("Expires: {} (in {} min)", expires_at.to_rfc3339(), remaining.num_minutes());
                } else {
                    println!("Expires: {} (expired)", expires_at.to_rfc3339());
                }
                println!("Refresh: {}", if status.has_refresh_token { "available" } else { "none" });
            }
            if let Some(pending) = &status.pending {
                println!("Pending: code {} at {}", pending.user_code, pending.verification_uri);
            }
            if status.state == AuthState::NoCredentials {
                println!();
                println!("Run 'tokenkeeper login' to sign in.");
            }
            println!();
            println!("Storage: {}", tokens_path.display());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": status,
                "tokens_path": tokens_path,
                "device_code_path": device_code_path,
            }));
        }
    }

    Ok(())
}

async fn cmd_refresh(cli: &Cli) -> Result<()> {
    let manager = open_manager()?;
    let tokens = manager.refresh_access_token().await.map_err(fail)?;

    match cli.format {
        OutputFormat::Text => {
            println!("Access token refreshed, valid until {}", tokens.expires_at.to_rfc3339());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "refreshed",
                "expires_at": tokens.expires_at,
                "has_refresh_token": tokens.refresh_token.is_some(),
            }));
        }
    }

    Ok(())
}

async fn cmd_logout(cli: &Cli) -> Result<()> {
    let manager = open_manager()?;

    // Storage that cannot be decrypted is still removed
    let state = match manager.initialize().await {
        Ok(state) => Some(state),
        Err(e @ AuthError::StorageCorrupted { .. }) => {
            tracing::warn!("{}", e);
            None
        }
        Err(e) => return Err(fail(e)),
    };

    if state == Some(AuthState::NoCredentials) {
        match cli.format {
            OutputFormat::Text => println!("Not signed in."),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "status": "not_signed_in",
                }));
            }
        }
        return Ok(());
    }

    manager.sign_out().await.map_err(fail)?;

    match cli.format {
        OutputFormat::Text => println!("Signed out. Local credentials deleted."),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "signed_out",
            }));
        }
    }

    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let auth_config = config::load_auth_config();
    let config_path = config::get_config_file_path_string();

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:        {}", config_path);
            println!("Client ID:          {}", auth_config.client_id);
            println!("Scope:              {}", auth_config.scope);
            println!("Device code URL:    {} (from {})", auth_config.device_code_url, auth_config.source);
            println!("Token URL:          {}", auth_config.token_url);
            println!("Credential storage: {}", auth_config.storage_dir.display());
            println!("Refresh buffer:     {}s", auth_config.expiry_buffer.as_secs());
            println!();
            println!("Environment variables:");
            println!("  TOKENKEEPER_CLIENT_ID     - Override client ID");
            println!("  TOKENKEEPER_SCOPE         - Override requested scopes");
            println!("  TOKENKEEPER_AUTHORITY_URL - Override authority base URL");
            println!("  TOKENKEEPER_STORAGE_DIR   - Override credential directory");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "client_id": auth_config.client_id,
                "scope": auth_config.scope,
                "device_code_url": auth_config.device_code_url,
                "token_url": auth_config.token_url,
                "endpoint_source": format!("{}", auth_config.source),
                "storage_dir": auth_config.storage_dir,
                "expiry_buffer_secs": auth_config.expiry_buffer.as_secs(),
                "max_poll_attempts": auth_config.max_poll_attempts,
            }));
        }
    }

    Ok(())
}
