//! autonav - memento loop entry point
//!
//! Runs the plan/implement/commit loop against the configured harness.

use std::sync::Arc;

use autonav::config::Config;
use autonav::git::Git;
use autonav::harness::registry::HarnessRegistry;
use autonav::memento::{LoggingObserver, MementoLoop};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autonav=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: harness={} code_dir={}",
        config.harness,
        config.code_dir.display()
    );

    let registry = HarnessRegistry::with_builtin(config.harness.clone());
    let harness = registry.selected()?;

    let git = Arc::new(Git::new(&config.code_dir));
    let memento = MementoLoop::new(harness, git, config.memento_options())
        .with_observer(Arc::new(LoggingObserver));

    let outcome = memento.run().await;
    registry.shutdown_all().await;

    match outcome {
        Ok(result) => {
            info!(
                "Memento finished: success={} iterations={} commits={} (+{} -{} in {} files)",
                result.success,
                result.iterations,
                result.commits.len(),
                result.stats.insertions,
                result.stats.deletions,
                result.stats.files_changed
            );
            if let Some(message) = &result.completion_message {
                info!("{}", message);
            }
            if !result.success {
                anyhow::bail!("Iteration cap reached before the task was complete");
            }
            Ok(())
        }
        Err(e) => {
            error!("Memento loop failed: {}", e);
            Err(e.into())
        }
    }
}
