use chrono::Utc;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::args::{Cli, Commands, ConfigSubcommands};
use crate::config::{AppConfig, ConfigPersister};
use crate::core::error::{Result, StoreError};
use crate::permission::{PermissionPatch, PermissionStore};
use crate::sync::{DocumentBus, FileStorage};

/// `check` status for a name outside the permission set, kept apart from the
/// status for a denied permission.
pub const EXIT_UNKNOWN_PERMISSION: u8 = 2;

/// Builds the store one process uses as its context, backed by the shared
/// storage file.
pub fn open_store(cli: &Cli, config: &AppConfig) -> Result<(PermissionStore, Arc<FileStorage>)> {
    let mut config = config.clone();
    if let Some(preset) = cli.preset {
        config.preset = Some(preset);
        config.permissions.clear();
    }

    let path = cli
        .storage
        .clone()
        .unwrap_or_else(|| config.storage_path());
    let storage = Arc::new(FileStorage::new(path));

    let store = PermissionStore::builder(Arc::clone(&storage) as _, Arc::new(DocumentBus::new()))
        .schema(config.schema()?)
        .storage_key(config.storage_key())
        .event_name(config.event_name())
        .build();

    Ok((store, storage))
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<ExitCode> {
    match &cli.command {
        Commands::Config { command } => run_config(command),
        Commands::Show => {
            let (store, _) = open_store(&cli, &config)?;
            println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { name } => {
            let (store, _) = open_store(&cli, &config)?;
            if !store.schema().contains(name) {
                eprintln!("✗ {}", StoreError::UnknownPermission(name.clone()));
                return Ok(ExitCode::from(EXIT_UNKNOWN_PERMISSION));
            }
            let granted = store.has(name);
            println!("{name}: {}", if granted { "granted" } else { "denied" });
            Ok(if granted {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Set { assignments } => {
            let (store, _) = open_store(&cli, &config)?;
            let patch: PermissionPatch = assignments
                .iter()
                .map(|(name, value)| (name.as_str(), *value))
                .collect();
            store.update(&patch)?;
            println!("{}", store.snapshot());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset => {
            let (store, _) = open_store(&cli, &config)?;
            store.reset()?;
            println!("{}", store.snapshot());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch { interval_ms, count } => {
            let (store, storage) = open_store(&cli, &config)?;
            let interval = interval_ms
                .filter(|ms| *ms > 0)
                .map_or_else(|| config.poll_interval(), Duration::from_millis);
            watch(&store, &storage, interval, *count).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_config(command: &ConfigSubcommands) -> Result<ExitCode> {
    match command {
        ConfigSubcommands::Init => match AppConfig::init_default() {
            Ok(path) => {
                println!("✓ Created config file at {}", path.display());
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("✗ Failed to create config: {e}");
                Ok(ExitCode::FAILURE)
            }
        },
        ConfigSubcommands::Where => match AppConfig::get_config_path() {
            Some(path) => {
                println!("{}", path.display());
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("✗ Could not determine config path");
                Ok(ExitCode::FAILURE)
            }
        },
        ConfigSubcommands::UsePreset { preset } => {
            let persister = ConfigPersister::with_default_path()?;
            let switch = persister.use_preset(*preset)?;
            println!("✓ Using preset '{preset}' ({})", persister.path().display());
            if !switch.removed_permissions.is_empty() {
                println!(
                    "  Removed custom permissions: {}",
                    switch.removed_permissions.join(", ")
                );
            }
            if let Some(key) = &switch.removed_storage_key {
                println!(
                    "  Removed storage_key '{key}', now using '{}'",
                    preset.storage_key()
                );
            }
            if let Some(key) = &switch.kept_storage_key {
                eprintln!(
                    "! Keeping storage_key '{key}'; records under it may use another permission set"
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Polls the storage file and prints the record every time another process
/// changes it. Stops after `limit` changes, or on Ctrl-C.
pub async fn watch(
    store: &PermissionStore,
    storage: &FileStorage,
    interval: Duration,
    limit: Option<usize>,
) -> Result<()> {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let subscription = store.subscribe(move |record| {
        counter.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(record).unwrap_or_else(|_| record.to_string());
        println!("[{}] {json}", Utc::now().to_rfc3339());
    });

    tracing::info!(
        path = %storage.path().display(),
        interval_ms = interval.as_millis() as u64,
        "Watching for permission changes"
    );
    println!("{}", serde_json::to_string(&store.snapshot())?);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = storage.poll_changes() {
                    tracing::warn!("Failed to poll storage: {}", e);
                }
                if limit.is_some_and(|limit| seen.load(Ordering::SeqCst) >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscription.unsubscribe();
    Ok(())
}
