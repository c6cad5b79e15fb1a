//! Tern Mail - command line and sync daemon

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tern_core::config::Config;
use tern_core::normalize;
use tern_core::{EmailAddress, ProviderKind, ProviderTokens, SendParams, UserIdentity};
use tern_oauth::ProviderOAuth;
use time::OffsetDateTime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

use app::TernApp;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the provider consent URL for linking a mailbox
    Authorize {
        /// google, microsoft or aurinko
        provider: ProviderKind,
        /// Aurinko backing service
        #[arg(long, default_value = "Google")]
        service_type: String,
    },
    /// Register a mailbox with tokens from an OAuth callback and run its first sync
    Link {
        provider: ProviderKind,
        /// Owning user
        #[arg(long)]
        user: String,
        /// Primary address of the owning user
        #[arg(long)]
        user_email: String,
        /// Authorization code to exchange
        #[arg(long, conflicts_with = "access_token")]
        code: Option<String>,
        /// PKCE verifier printed by `authorize`
        #[arg(long, requires = "code", default_value = "")]
        verifier: String,
        #[arg(long, required_unless_present = "code")]
        access_token: Option<String>,
        #[arg(long, requires = "access_token")]
        refresh_token: Option<String>,
        /// Access token lifetime in seconds
        #[arg(long, requires = "access_token")]
        expires_in: Option<i64>,
    },
    /// Sync one account now
    Sync { account: String },
    /// Sync every account on the configured interval until Ctrl-C
    Daemon,
    /// List linked accounts with their sync state
    Accounts {
        #[arg(long)]
        user: Option<String>,
    },
    /// Clear the sync cursor so the next run bootstraps again
    Reset {
        account: String,
        /// Also delete the stored mail
        #[arg(long)]
        purge: bool,
    },
    /// Delete an account and all of its mail
    DeleteAccount { account: String },
    /// Send a message through the account's provider
    Send {
        account: String,
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long)]
        bcc: Vec<String>,
        #[arg(long, default_value = "")]
        subject: String,
        /// HTML body
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long)]
        in_reply_to: Option<String>,
        #[arg(long)]
        thread: Option<String>,
    },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| Config::default().config_file_path());
    let mut config = Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))?;
    config.apply_env();
    if let Some(data_dir) = &args.data_dir {
        config.app.data_dir = data_dir.clone();
    }
    Ok(config)
}

fn init_logging(debug: bool, config: &Config) {
    let level = if debug { "debug" } else { config.app.log_level.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_addresses(values: &[String]) -> Vec<EmailAddress> {
    values.iter().map(|value| normalize::parse_address(value)).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(args.debug, &config);

    info!("Starting Tern Mail v{}", tern_core::VERSION);

    if let Err(e) = run(args.command, config).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let mut app = TernApp::new(config).await?;

    match command {
        Command::Authorize { provider, service_type } => {
            let providers = &app.config().providers;
            let client = match provider {
                ProviderKind::Google => &providers.google,
                ProviderKind::Microsoft => &providers.microsoft,
                ProviderKind::Aurinko => &providers.aurinko,
            };
            let oauth = ProviderOAuth::new(provider, client, providers)?.with_service_type(service_type);
            let auth = oauth.authorization_url()?;
            println!("url:      {}", auth.url);
            println!("state:    {}", auth.state);
            if !auth.code_verifier.is_empty() {
                println!("verifier: {}", auth.code_verifier);
            }
        }
        Command::Link {
            provider,
            user,
            user_email,
            code,
            verifier,
            access_token,
            refresh_token,
            expires_in,
        } => {
            let tokens = match (code, access_token) {
                (Some(code), _) => app
                    .oauth()
                    .get(provider)?
                    .exchange_code(&code, &verifier)
                    .await?
                    .into_provider_tokens(),
                (None, Some(access_token)) => ProviderTokens {
                    access_token,
                    refresh_token,
                    expires_at: expires_in.map(|s| OffsetDateTime::now_utc() + time::Duration::seconds(s)),
                },
                (None, None) => bail!("Either --code or --access-token is required"),
            };
            let owner = UserIdentity {
                user_id: user,
                primary_email: user_email,
            };

            let manager = app.sync_manager();
            let account = manager.link_account(&owner, provider, tokens).await?;
            println!("Linked {} ({})", account.id, account.display_name);

            // Queued behind the initial sync started by linking
            let outcome = manager.enqueue(&account.id).await?;
            println!("Synced {} messages", outcome.messages_processed);
        }
        Command::Sync { account } => {
            let outcome = app.sync_manager().sync_now(&account).await?;
            println!(
                "{}: {} messages in {} pages ({} inserted, {} updated, {} failed, {} malformed){}",
                outcome.account_id,
                outcome.messages_processed,
                outcome.pages,
                outcome.inserted,
                outcome.updated,
                outcome.failed,
                outcome.malformed,
                if outcome.restarted { ", cursor expired and restarted" } else { "" },
            );
        }
        Command::Daemon => {
            let manager = app.sync_manager_mut();
            manager.start_background_sync()?;
            info!("Daemon running, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
            manager.stop_background_sync().await?;

            let stats = manager.get_stats().await;
            info!(
                total = stats.total_syncs,
                succeeded = stats.successful_syncs,
                failed = stats.failed_syncs,
                messages = stats.total_messages_synced,
                "Sync statistics"
            );
        }
        Command::Accounts { user } => {
            let db = app.database();
            for account in db.list_accounts(user.as_deref()).await? {
                let counts = db.mail_counts(&account.id).await?;
                println!(
                    "{}\t{}\t{}\t{} emails\t{} threads\tcursor={}\tlast_synced={}{}",
                    account.id,
                    account.user_id,
                    account.sync_status.as_str(),
                    counts.emails,
                    counts.threads,
                    account.cursor.delta_token.as_deref().unwrap_or("-"),
                    account
                        .last_synced_at
                        .map(|t| t.unix_timestamp().to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    account
                        .last_sync_error
                        .map(|e| format!("\terror={}", e))
                        .unwrap_or_default(),
                );
            }
        }
        Command::Reset { account, purge } => {
            let db = app.database();
            db.require_account(&account).await?;
            db.reset_cursor(&account).await?;
            if purge {
                let report = db.purge_mail(&account).await?;
                println!(
                    "Purged {} emails, {} threads, {} addresses",
                    report.emails, report.threads, report.addresses
                );
            }
            let outcome = app.sync_manager().sync_now(&account).await?;
            println!("Resynced {} messages", outcome.messages_processed);
        }
        Command::DeleteAccount { account } => {
            let report = app.database().delete_account(&account).await?;
            println!(
                "Deleted {} attachments, {} recipients, {} emails, {} threads, {} addresses, {} account",
                report.attachments, report.recipients, report.emails, report.threads, report.addresses, report.accounts
            );
        }
        Command::Send {
            account,
            to,
            cc,
            bcc,
            subject,
            body,
            in_reply_to,
            thread,
        } => {
            let params = SendParams {
                to: parse_addresses(&to),
                cc: parse_addresses(&cc),
                bcc: parse_addresses(&bcc),
                subject,
                body,
                references: in_reply_to.iter().cloned().collect(),
                in_reply_to,
                thread_id: thread,
                ..SendParams::default()
            };
            let sent = app.sync_manager().send_message(&account, &params).await?;
            println!("Sent {}", sent.id.as_deref().unwrap_or("(no id reported)"));
        }
    }

    Ok(())
}
