mod config;
mod core;
mod features;
mod state;

use std::sync::Arc;

use tracing::info;

use config::WorkerConfig;
use core::hostnet::HostNetProgrammer;
use core::objectstore::ObjectStoreClient;
use core::subnet::SubnetAllocator;
use features::vms::manager::VmManager;
use features::vms::recovery;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(WorkerConfig::from_env());
    tokio::fs::create_dir_all(config.sandboxes_dir()).await?;
    tokio::fs::create_dir_all(config.templates_dir()).await?;

    let subnet = Arc::new(SubnetAllocator::new(config.subnet_prefix_octet, config.subnet_pool_size, config.tap_prefix.clone()));
    let hostnet = Arc::new(HostNetProgrammer::new(config.egress_iface.clone()));
    let object_store = Arc::new(ObjectStoreClient::new(config.object_store_url.clone(), config.cache_dir.clone()));

    let private_prefix_cidr = format!("{}.0.0.0/8", config.subnet_prefix_octet);
    if let Err(e) = hostnet.enable_forwarding(&private_prefix_cidr).await {
        tracing::warn!(error = %e, "failed to enable ip forwarding at startup");
    }

    recovery::cleanup_orphans(&config.hypervisor_bin, &subnet).await;
    match recovery::scan_sandboxes(&config.sandboxes_dir()).await {
        Ok(recovered) => {
            for r in &recovered {
                info!(sandbox_id = %r.id, state = ?r.state, "recovered sandbox directory on startup");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to scan sandboxes directory on startup"),
    }

    let manager = Arc::new(VmManager::new(config.clone(), subnet, hostnet, object_store));
    let router = Arc::new(features::router::SandboxRouter::new(manager.clone()));

    let autosave_manager = manager.clone();
    let autosave_interval = std::time::Duration::from_secs(config.autosave_interval_secs);
    let autosave_concurrency = config.autosave_concurrency;
    tokio::spawn(async move {
        features::autosave::run(autosave_manager, autosave_interval, autosave_concurrency).await;
    });

    let state = AppState { config: config.clone(), manager, router };
    let app = features::router(state);

    info!(bind = %config.bind, "worker listening");
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
