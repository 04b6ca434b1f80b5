use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use weatherwatch_core::{
    Config, Dispatcher, ProviderId, Registry, ResendPolicy, RunReport, Schedule, SqliteStore,
    SubscriptionStore, Validator, WeatherProvider, mailer::mailer_from_config,
    provider::default_provider_from_config, scheduler::run_scheduled,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weatherwatch", version, about = "Email alerts when the weather meets your conditions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    /// Alert on every run while the condition holds.
    EveryRun,
    /// Alert once until the condition clears.
    OncePerActivation,
}

impl From<PolicyArg> for ResendPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::EveryRun => ResendPolicy::EveryRun,
            PolicyArg::OncePerActivation => ResendPolicy::OncePerActivation,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "weatherapi".
        provider: String,
    },

    /// Show current weather for a city.
    Weather {
        city: String,
    },

    /// Register a user who can own subscriptions.
    Register {
        #[arg(long)]
        name: String,

        #[arg(long)]
        email: String,
    },

    /// Subscribe a registered user to a weather condition.
    Subscribe {
        #[arg(long)]
        email: String,

        #[arg(long)]
        city: String,

        /// e.g. "temperature:>:30", "humidity:<=:40" or "main:Rain".
        #[arg(long)]
        condition: String,
    },

    /// Delete a subscription and its notification history.
    Unsubscribe {
        id: i64,
    },

    /// List subscriptions, optionally for one user.
    Subscriptions {
        #[arg(long)]
        email: Option<String>,
    },

    /// Show sent notifications, newest first.
    Notifications {
        #[arg(long)]
        subscription: Option<i64>,
    },

    /// Evaluate all subscriptions once and send due alerts.
    Run {
        /// Overrides `dispatch.resend` from the config file.
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
    },

    /// Run on the configured schedule until interrupted.
    Serve {
        /// Overrides `dispatch.resend` from the config file.
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Run every N seconds instead of the configured schedule.
        #[arg(long)]
        every_secs: Option<u64>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider)?,
            Command::Weather { city } => {
                let config = Config::load()?;
                let provider = default_provider_from_config(&config)?;
                let snap = provider
                    .current(&city)
                    .await
                    .with_context(|| format!("Failed to fetch weather for '{city}'"))?;
                println!("{}", snap.city);
                println!("  main:        {} ({})", snap.main, snap.description);
                println!("  temperature: {:.1} °C", snap.temperature_c);
                println!("  feels_like:  {:.1} °C", snap.feels_like_c);
                println!("  humidity:    {} %", snap.humidity_pct);
                println!(
                    "  observed:    {}",
                    snap.observed_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
                );
            }
            Command::Register { name, email } => {
                let registry = registry(&Config::load()?).await?;
                let user = registry.register_user(&name, &email).await?;
                println!("Registered user #{} <{}>", user.id, user.email);
            }
            Command::Subscribe {
                email,
                city,
                condition,
            } => {
                let registry = registry(&Config::load()?).await?;
                let sub = registry.subscribe(&email, &city, &condition).await?;
                println!(
                    "Subscription #{} created: {} in {}",
                    sub.id, sub.condition, sub.city
                );
            }
            Command::Unsubscribe { id } => {
                let registry = registry(&Config::load()?).await?;
                registry.unsubscribe(id).await?;
                println!("Subscription #{id} deleted");
            }
            Command::Subscriptions { email } => {
                let config = Config::load()?;
                let subs = match email {
                    Some(email) => registry(&config).await?.subscriptions_for(&email).await?,
                    None => open_store(&config).await?.list_subscriptions().await?,
                };
                if subs.is_empty() {
                    println!("No subscriptions.");
                }
                for sub in subs {
                    println!(
                        "#{:<5} {:<28} {:<20} {}",
                        sub.id, sub.owner_email, sub.city, sub.condition
                    );
                }
            }
            Command::Notifications { subscription } => {
                let store = open_store(&Config::load()?).await?;
                let records = store.notifications(subscription).await?;
                if records.is_empty() {
                    println!("No notifications sent.");
                }
                for n in records {
                    println!(
                        "#{:<5} subscription #{:<5} user #{:<5} {}",
                        n.id,
                        n.subscription_id,
                        n.owner_id,
                        n.sent_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            Command::Run { policy } => {
                let config = Config::load()?;
                let dispatcher = dispatcher(&config, policy).await?;
                let report = dispatcher.run_once().await?;
                print_report(&report);
            }
            Command::Serve { policy, every_secs } => {
                let config = Config::load()?;
                let schedule = match every_secs {
                    Some(0) => anyhow::bail!("--every-secs must be greater than zero"),
                    Some(secs) => Schedule::Every(Duration::from_secs(secs)),
                    None => config.schedule()?,
                };
                let dispatcher = dispatcher(&config, policy).await?;
                let cancel = shutdown_signal();
                run_scheduled(&dispatcher, schedule, cancel).await;
                info!("weatherwatch stopped");
            }
        }

        Ok(())
    }
}

fn configure(provider: &str) -> Result<()> {
    let id = ProviderId::try_from(provider)?;
    // Environment overrides are not written back to the file.
    let mut config = Config::load_file()?;

    let api_key = inquire::Password::new(&format!("API key for {id}:"))
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;
    config.upsert_provider_api_key(id, api_key.trim().to_string());

    if config.default_provider.as_deref() != Some(id.as_str()) {
        let make_default = inquire::Confirm::new(&format!("Use {id} as the default provider?"))
            .with_default(true)
            .prompt()
            .context("Failed to read answer")?;
        if make_default {
            config.set_default_provider(id);
        }
    }

    config.save()?;
    println!(
        "Saved configuration to {}",
        Config::config_file_path()?.display()
    );
    Ok(())
}

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let path = config.database_path()?;
    SqliteStore::open(&path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

async fn registry(config: &Config) -> Result<Registry> {
    let store = open_store(config).await?;
    let provider: Arc<dyn WeatherProvider> = Arc::from(default_provider_from_config(config)?);
    Ok(Registry::new(store, provider, Validator::default()))
}

async fn dispatcher(config: &Config, policy: Option<PolicyArg>) -> Result<Dispatcher> {
    let store = open_store(config).await?;
    let provider: Arc<dyn WeatherProvider> = Arc::from(default_provider_from_config(config)?);
    let mailer = Arc::from(mailer_from_config(config)?);
    let policy = policy.map(ResendPolicy::from).unwrap_or(config.dispatch.resend);

    Ok(Dispatcher::new(Arc::new(store), provider, mailer).with_policy(policy))
}

fn print_report(report: &RunReport) {
    println!(
        "Checked {} subscription(s): {} met, {} sent, {} recorded, {} suppressed, {} skipped",
        report.subscriptions,
        report.met,
        report.sent,
        report.recorded,
        report.suppressed,
        report.skipped()
    );
    if report.unrecorded > 0 {
        println!(
            "Warning: {} notification(s) were sent but could not be recorded",
            report.unrecorded
        );
    }
}

/// Cancelled on SIGINT (Ctrl+C) or SIGTERM.
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        }

        trigger.cancel();
    });

    token
}
