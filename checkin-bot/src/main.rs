use anyhow::Context;
use dotenv::dotenv;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod captcha;
mod clock;
mod config;
mod db;
mod engine;
mod error;
mod models;
mod retry;
mod runner;
mod session_manager;
mod sites;
#[cfg(test)]
mod test_support;

use captcha::CaptchaSolver;
use clock::{Clock, Delay, PeriodCalendar, SystemClock, TokioDelay};
use config::{Config, RunMode};
use db::Database;
use engine::{CheckinEngine, EngineSettings};
use runner::Runner;
use session_manager::{EnvCredentials, SessionManager};
use sites::SiteRegistry;

/// Exit status for configuration and startup failures
const EXIT_STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn run() -> anyhow::Result<u8> {
    let config = Config::from_env().context("invalid configuration")?;

    let targets = config::load_targets(&config.targets_file)?;
    let presets = sites::load_site_presets(&config.sites_file)?;

    log::info!("Data directory: {}", config.data_dir.display());
    log::info!("Initializing database at {}", config.database_url);
    let db = Arc::new(Database::new(&config.database_url).context("failed to open state store")?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let delay: Arc<dyn Delay> = Arc::new(TokioDelay);

    let client = sites::build_http_client(&config).context("failed to build HTTP client")?;

    // The solver is reached directly, never through the site proxy
    let captcha = match &config.captcha {
        Some(captcha_config) => {
            let solver_client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .context("failed to build captcha client")?;
            log::info!("Captcha solver enabled at {}", captcha_config.api_url);
            Some(Arc::new(CaptchaSolver::new(solver_client, captcha_config, delay.clone())))
        }
        None => None,
    };

    let registry = Arc::new(SiteRegistry::from_presets(presets, client, &config, captcha));
    log::info!("Registered {} sites", registry.len());
    for target in targets.iter().filter(|t| t.enabled) {
        if registry.get(&target.site).is_none() {
            log::warn!("Target {} uses unknown site '{}'", target.key, target.site);
        }
    }

    let session_store = config.persist_sessions.then(|| db.clone());
    let sessions = Arc::new(SessionManager::new(
        registry.clone(),
        Arc::new(EnvCredentials),
        session_store,
        clock.clone(),
        config.session_ttl,
    ));

    let engine = Arc::new(CheckinEngine::new(
        db,
        sessions,
        registry,
        clock,
        delay,
        PeriodCalendar::new(config.timezone_offset),
        EngineSettings::from_config(&config),
    ));
    let runner = Runner::new(engine, targets, config.max_concurrency);

    let cancel = CancellationToken::new();
    spawn_shutdown_watcher(cancel.clone(), config.run_deadline);

    let report = match config.run_mode {
        RunMode::Once => runner.run_cycle(&cancel).await,
        RunMode::Loop => {
            let schedule = config.cron_schedule()?;
            log::info!("Running on schedule '{}'", config.schedule);
            runner.run_loop(&schedule, &cancel).await
        }
    };

    Ok(report.exit_code())
}

/// Cancel on Ctrl-C, SIGTERM or the run deadline, whichever comes first
fn spawn_shutdown_watcher(cancel: CancellationToken, deadline: Option<Duration>) {
    tokio::spawn(async move {
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        let deadline_reached = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = interrupted => log::warn!("Interrupt received, stopping"),
            _ = terminate_signal() => log::warn!("SIGTERM received, stopping"),
            _ = deadline_reached => log::warn!("Run deadline reached, stopping"),
        }

        cancel.cancel();
    });
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
