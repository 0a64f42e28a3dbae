//! tigger-daemon — the headless ActiveTigger process: loads config, bootstraps
//! the root user on first boot, wires up the persistence/queue/component
//! stack, and runs the reaper loop until interrupted.
//!
//! There is no HTTP/REST surface here (spec.md §1 Non-goals) — this binary
//! is the orchestration engine on its own, the way `at-daemon`'s
//! `run_with_listener` would be if you deleted everything downstream of
//! `Daemon::new`.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tigger_core::auth::hash_password;
use tigger_core::config::Config;
use tigger_core::db::Db;
use tigger_core::types::User;
use tigger_features::Features;
use tigger_languagemodels::LanguageModels;
use tigger_orchestrator::Orchestrator;
use tigger_quickmodels::QuickModels;
use tigger_queue::Queue;
use tigger_schemes::Schemes;
use tracing::info;

mod reaper;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tigger_core::logging::init("info");

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    std::fs::create_dir_all(&config.paths.data).context("failed to create data directory")?;
    std::fs::create_dir_all(&config.paths.models).context("failed to create model directory")?;

    let db_path = config.paths.data.join(&config.paths.database_url);
    let db = Arc::new(Db::new(&db_path).await.context("failed to open database")?);

    bootstrap_root_user(&db, &config).await?;

    let queue = Arc::new(Queue::new(config.queue.n_workers_cpu, config.queue.n_workers_gpu));
    let schemes = Arc::new(Schemes::new(db.clone()));
    let features = Arc::new(Features::new(db.clone(), queue.clone()));
    let quickmodels = Arc::new(QuickModels::new(db.clone(), queue.clone(), config.paths.models.clone()));
    let languagemodels = Arc::new(LanguageModels::new(db.clone(), queue.clone(), features.clone()));
    let _orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        queue.clone(),
        schemes,
        features,
        quickmodels,
        languagemodels,
        config.queue.max_loaded_projects,
    ));

    info!(
        max_loaded_projects = config.queue.max_loaded_projects,
        n_workers_cpu = config.queue.n_workers_cpu,
        n_workers_gpu = config.queue.n_workers_gpu,
        "tigger-daemon ready"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper_handle = tokio::spawn(reaper::run(queue, config.queue.update_timeout_secs, shutdown_rx));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;

    Ok(())
}

/// Prompts for a root password on first boot (or reads `ROOT_PASSWORD`),
/// hashes it, and writes the `root` user row. A no-op once `root` exists.
async fn bootstrap_root_user(db: &Db, config: &Config) -> Result<()> {
    if db.get_user("root").await?.is_some() {
        return Ok(());
    }

    let password = match &config.auth.root_password {
        Some(p) => p.clone(),
        None => prompt_root_password()?,
    };
    let password_hash = hash_password(&password).context("root password does not meet the minimum requirements")?;

    db.add_user(&User {
        user_name: "root".to_string(),
        password_hash,
        role: "manager".to_string(),
        created_by: None,
        mail: None,
        created_at: chrono::Utc::now(),
        deactivated_at: None,
    })
    .await?;
    info!("root user created");
    Ok(())
}

fn prompt_root_password() -> Result<String> {
    loop {
        print!("Set a root password (min 6 characters): ");
        std::io::stdout().flush()?;
        let mut first = String::new();
        std::io::stdin().read_line(&mut first)?;
        let first = first.trim().to_string();

        print!("Confirm root password: ");
        std::io::stdout().flush()?;
        let mut second = String::new();
        std::io::stdin().read_line(&mut second)?;
        let second = second.trim().to_string();

        if first.len() < 6 {
            eprintln!("password must be at least 6 characters");
            continue;
        }
        if first != second {
            eprintln!("passwords did not match, try again");
            continue;
        }
        return Ok(first);
    }
}
