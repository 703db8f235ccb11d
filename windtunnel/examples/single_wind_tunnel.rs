//! Single wind tunnel run against the in-memory backend.
//!
//! Builds the fixture template, starts a pool, submits one case, waits for
//! it, downloads its outputs and finally reconciles the job log.
//!
//! Run with `RUST_LOG=windtunnel=debug` for per-poll status output.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use windtunnel::*;
use windtunnel_testkit::{example_parameters, example_wind_tunnel, InMemoryBackend, Workspace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("windtunnel=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let workspace = Workspace::new()?;
    let backend = InMemoryBackend::new().with_queued_polls(2);
    let config = workspace.config();

    let bus = InProcEventBus::new(64).shared();
    let mut events = bus.as_ref().map(|bus| bus.subscribe());

    let pool = MachinePool::with_events(config.pool.spec()?, backend.shared(), bus.clone());
    let pool_id = pool.start().await?;
    println!("[POOL] started {pool_id} ({})", pool.spec().sizing());

    let scenario = WindTunnelScenario::new(
        example_wind_tunnel(),
        workspace.template(),
        config.clone(),
        Arc::new(backend.clone()),
    )
    .with_events(bus);

    let task = scenario
        .simulate(&workspace.mesh(), &example_parameters(), Some(&pool))
        .await?;
    println!("[TASK] submitted {}", task.id());

    let wait = config
        .wait
        .options()
        .with_poll_interval(Duration::from_millis(20));
    let status = task.wait(wait).await?;
    println!("[TASK] finished with status {status}");

    if status == TaskStatus::Success {
        if let Some(input_dir) = task.input_dir() {
            let outputs = task
                .download_outputs(&input_dir.join("downloaded_outputs"))
                .await?;
            println!("[TASK] outputs in {}", outputs.display());
        }
    }
    pool.stop().await?;

    if let Some(job_log) = &config.job_log {
        let reconciler = Reconciler::new(backend.shared(), config.reconcile.options());
        let report = reconciler.reconcile_log(job_log).await?;
        println!("[RECONCILE] {report}");
    }

    if let Some(events) = events.as_mut() {
        while let Ok(event) = events.try_recv() {
            println!("[EVENT] {}", serde_json::to_string(&event.payload)?);
        }
    }

    Ok(())
}
