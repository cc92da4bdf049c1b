//! Service wiring and server startup.
//!
//! Every store and collector is an explicit service object owned by
//! [`OmServices`]; tests substitute by constructing services against an
//! in-memory store. Collectors are spawned once at startup.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::apistat::ApiLatencyAggregator;
use crate::auth::AuthGuard;
use crate::command::CmdRunner;
use crate::config::OmConfig;
use crate::deploy::DeployEngine;
use crate::errstat::ErrSigAggregator;
use crate::gitenv::GitEnv;
use crate::hoststat::HostCollector;
use crate::logindex::LogIndex;
use crate::memstat::MemStat;
use crate::pubsub::PubSub;
use crate::store::Store;
use crate::supervisor::AppSupervisor;
use crate::threadstat::ThreadCollector;

pub struct OmServices {
    pub config: OmConfig,
    pub store: Store,
    pub bus: PubSub,
    pub cmd: CmdRunner,
    pub logs: LogIndex,
    pub supervisor: Arc<AppSupervisor>,
    pub gitenv: Arc<GitEnv>,
    pub deploy: Arc<DeployEngine>,
    pub host: Arc<HostCollector>,
    pub threads: Arc<ThreadCollector>,
    pub errstat: Arc<ErrSigAggregator>,
    pub apistat: Arc<ApiLatencyAggregator>,
    pub memstat: Arc<MemStat>,
    pub auth: Arc<AuthGuard>,
}

impl OmServices {
    pub fn new(config: OmConfig) -> Result<Arc<Self>> {
        let store = Store::open(&config.db_path)?;
        Ok(Self::with_store(config, store))
    }

    /// Wire every service against the given store; tests pass an
    /// in-memory one.
    pub fn with_store(config: OmConfig, store: Store) -> Arc<Self> {
        let bus = PubSub::new();
        let cmd = CmdRunner::new(bus.clone());
        let logs = LogIndex::new(config.root_dir.clone());
        let supervisor = Arc::new(AppSupervisor::new(
            config.clone(),
            &store,
            bus.clone(),
            cmd.clone(),
        ));
        let gitenv = Arc::new(GitEnv::new(&store, cmd.clone()));
        let deploy = Arc::new(DeployEngine::new(
            config.clone(),
            &store,
            bus.clone(),
            cmd.clone(),
            gitenv.clone(),
            supervisor.clone(),
        ));
        let host = Arc::new(HostCollector::new(&config, &store));
        let threads = Arc::new(ThreadCollector::new(&config, &store));
        let errstat = Arc::new(ErrSigAggregator::new(&config, &store, logs.clone()));
        let apistat = Arc::new(ApiLatencyAggregator::new(&config, &store, logs.clone()));
        let memstat = Arc::new(MemStat::new(&store));
        let auth = Arc::new(AuthGuard::new(config.om_key.clone(), &store));

        Arc::new(Self {
            config,
            store,
            bus,
            cmd,
            logs,
            supervisor,
            gitenv,
            deploy,
            host,
            threads,
            errstat,
            apistat,
            memstat,
            auth,
        })
    }

    /// Start the deploy worker and every collector loop.
    pub fn spawn_collectors(self: &Arc<Self>) {
        self.deploy.spawn();
        self.host.spawn();
        self.threads.spawn();
        self.errstat.spawn();
        self.apistat.spawn();
        self.memstat.spawn();
        info!("collectors started");
    }
}

pub async fn run_server(config: OmConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parse listen address")?;
    let services = OmServices::new(config)?;
    services.spawn_collectors();

    let app = crate::api::router(services);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "opsidecar listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_store_wires_services() {
        let services =
            OmServices::with_store(OmConfig::default(), Store::in_memory().unwrap());
        // the shared bus really is shared: a publish through the services
        // handle reaches a subscriber taken from the same bus
        let mut rx = services.bus.subscribe("t");
        services.bus.publish("t", serde_json::json!(1));
        assert!(rx.try_recv().is_ok());
    }
}
