use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::azure::client::ArmScaleSetClient;
use crate::azure::skus::SkuCache;
use crate::azure::ArmClient;
use crate::config::Config;
use crate::k8s::bootstrap::SecretBootstrap;
use crate::k8s::store::KubeStore;
use crate::k8s::Controller;
use crate::scaleset::image::DefaultImageResolver;
use crate::scaleset::pass::Collaborators;
use crate::server::spawn_server;

/// The application object of the operator.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<()>,
    /// The join handle of the K8s controller.
    controller: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s & cloud clients.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let arm = ArmClient::new(&config).context("error initializing resource manager client")?;

        let store = Arc::new(KubeStore::new(client.clone()));
        let deps = Collaborators {
            cloud: Arc::new(ArmScaleSetClient::new(arm.clone())),
            capabilities: Arc::new(SkuCache::new(arm.clone())),
            images: Arc::new(DefaultImageResolver),
            bootstrap: Arc::new(SecretBootstrap::new(client.clone())),
            machines: store.clone(),
            pools: store,
            subscription_id: arm.subscription_id().into(),
        };

        // Spawn various core tasks.
        let server = spawn_server(&config, shutdown_tx.clone());
        let controller = Controller::new(client, config, deps, shutdown_tx.clone()).spawn();

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            controller,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("fleet operator is shutting down");
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining http server task");
        }
        if let Err(err) = self.controller.await.context("error joining k8s controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down k8s controller");
        }

        tracing::debug!("fleet operator shutdown complete");
        Ok(())
    }
}
