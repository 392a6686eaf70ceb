use crate::config::Config;
use crate::controller::Controller;
use crate::settings::SettingsStore;
use crate::victron::ess::VictronESS;
use crate::victron::VictronGx;
use chrono::{Local, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod battery_life;
mod config;
mod controller;
mod dynamic_ess;
mod port;
mod settings;
mod victron;

#[derive(Parser, Debug)]
#[command(version, about = "Battery protection and scheduled ESS control for Victron systems")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "ve_dynamic_ess.json")]
    config: PathBuf,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = match &args.log {
        Some(f) => EnvFilter::try_new(f)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ve_dynamic_ess=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)?;
    info!("Connecting to {}", config.address);

    let source =
        VictronGx::connect(config.address, config.system_unit, config.vebus_unit).await?;
    let sink =
        VictronESS::new(config.address, config.system_unit, config.override_register).await?;
    let store = SettingsStore::new(&config.settings_path);
    let mut ctr = Controller::new(&config, source, sink, store)?;

    let mut poll = interval(Duration::from_secs(config.poll_interval_secs));
    let period = Duration::from_secs(config.battery_life_interval_secs);
    let mut battery_life = interval_at(Instant::now() + period, period);
    let mut dynamic_ess = interval(Duration::from_secs(config.dynamic_ess_interval_secs));
    for i in [&mut poll, &mut battery_life, &mut dynamic_ess] {
        i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            _ = poll.tick() => ctr.poll(Utc::now()).await,
            _ = battery_life.tick() => ctr.on_battery_life_timer(Local::now()),
            _ = dynamic_ess.tick() => ctr.on_dynamic_ess_timer(Utc::now()).await,
        }
    }
}
