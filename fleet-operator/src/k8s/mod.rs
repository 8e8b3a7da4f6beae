//! Kubernetes controller.
//!
//! This controller observes FleetPool & FleetMachine objects in its namespace, caches the latest
//! version of each, and drives reconciliation passes over them. Passes for one object are
//! serialized, passes for different objects run concurrently. The outcome of each pass decides
//! when the object is looked at again.

pub mod bootstrap;
mod queue;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_core::crd::{FleetMachine, FleetPool};
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use kube::Resource;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::config::Config;
use crate::k8s::queue::{Key, WorkQueue};
use crate::scaleset::pass::{self, Collaborators, Requeue};

/// The app name used by the operator.
pub const APP_NAME: &str = "fleet-operator";
/// The default timeout to use for K8s API calls.
pub const API_TIMEOUT: Duration = Duration::from_secs(5);
/// The delay before a watcher is polled again after an error.
const WATCHER_ERROR_DELAY: Duration = Duration::from_secs(10);

const METRIC_PASSES_IN_FLIGHT: &str = "fleet_passes_in_flight";

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// A unit of work for the controller.
#[derive(Debug)]
enum Task {
    /// A delayed re-enqueue of the given object has fired.
    Requeue(Key, u64),
    /// A pass over the given object is done.
    Done(Key, Requeue),
}

/// Kubernetes controller for watching Fleet CRs.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The collaborators of all reconciliation passes.
    deps: Collaborators,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A channel of controller tasks.
    tasks_tx: mpsc::Sender<Task>,
    /// A channel of controller tasks.
    tasks_rx: ReceiverStream<Task>,
    /// Pass bookkeeping.
    queue: WorkQueue,

    /// All known pools.
    pools: HashMap<Arc<String>, FleetPool>,
    /// All known tracking records.
    machines: HashMap<Arc<String>, FleetMachine>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, deps: Collaborators, shutdown_tx: broadcast::Sender<()>) -> Self {
        pass::register_metrics();
        metrics::register_gauge!(METRIC_PASSES_IN_FLIGHT, metrics::Unit::Count, "reconciliation passes currently running");
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Self {
            client,
            config,
            deps,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            queue: WorkQueue::default(),
            pools: Default::default(),
            machines: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let params = ListParams::default();
        let pools: Api<FleetPool> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pools_watcher = watcher(pools, params.clone());
        let machines: Api<FleetMachine> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let machines_watcher = watcher(machines, params);
        tokio::pin!(pools_watcher, machines_watcher);

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = pools_watcher.next() => self.handle_pool_event(k8s_event_res).await,
                Some(k8s_event_res) = machines_watcher.next() => self.handle_machine_event(k8s_event_res).await,
                Some(task) = self.tasks_rx.next() => self.handle_task(task),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(in_flight = self.queue.in_flight(), "k8s controller shutdown");
        Ok(())
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::Requeue(key, token) => {
                if self.queue.take_scheduled(&key, token) {
                    self.enqueue(key);
                }
            }
            Task::Done(key, requeue) => {
                if self.queue.finish(&key) {
                    self.start_pass(key);
                } else {
                    self.schedule(key, requeue);
                }
                metrics::gauge!(METRIC_PASSES_IN_FLIGHT, self.queue.in_flight() as f64);
            }
        }
    }

    /// Request a pass over the given object.
    fn enqueue(&mut self, key: Key) {
        if self.queue.enqueue(&key) {
            self.start_pass(key);
            metrics::gauge!(METRIC_PASSES_IN_FLIGHT, self.queue.in_flight() as f64);
        }
    }

    /// Spawn a pass over the given object, which reports back once done.
    ///
    /// The cache only decides whether a pass is due. The pass itself reads the object afresh, as
    /// the status written by the previous pass may not have been observed by the watcher yet.
    fn start_pass(&mut self, key: Key) {
        let known = match &key {
            Key::Pool(name) => self.pools.contains_key(name),
            Key::Machine(name) => self.machines.contains_key(name),
        };
        if !known {
            self.queue.forget(&key);
            self.queue.finish(&key);
            return;
        }
        let (deps, tx) = (self.deps.clone(), self.tasks_tx.clone());
        let namespace = self.config.namespace.clone();
        tokio::spawn(async move {
            let requeue = match &key {
                Key::Pool(name) => pass::run_pool(&deps, &namespace, name).await,
                Key::Machine(name) => pass::run_machine(&deps, &namespace, name).await,
            };
            let _res = tx.send(Task::Done(key, requeue)).await;
        });
    }

    /// Schedule the next pass over the given object according to the outcome of the last one.
    fn schedule(&mut self, key: Key, requeue: Requeue) {
        let delay = match requeue {
            Requeue::After(delay) => delay,
            Requeue::Resync => self.config.resync_period(),
            Requeue::Never => return,
        };
        let token = self.queue.schedule(&key);
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _res = tx.send(Task::Requeue(key, token)).await;
        });
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pool Events ///////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `FleetPool` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_pool_event(&mut self, res: EventResult<FleetPool>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from FleetPool k8s watcher");
                tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.pool_applied(obj),
            Event::Deleted(obj) => self.pool_deleted(obj),
            Event::Restarted(objs) => {
                let live: Vec<String> = objs.iter().filter_map(|obj| obj.meta().name.clone()).collect();
                let gone: Vec<FleetPool> = self
                    .pools
                    .iter()
                    .filter(|(name, _)| !live.contains(&**name))
                    .map(|(_, pool)| pool.clone())
                    .collect();
                gone.into_iter().for_each(|pool| self.pool_deleted(pool));
                objs.into_iter().for_each(|pool| self.pool_applied(pool));
            }
        }
    }

    fn pool_applied(&mut self, pool: FleetPool) {
        let name_str = match pool.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.pools.get_key_value(name_str) {
            Some((key, old)) => {
                // Status writes of our own passes are not a reason for another pass.
                if !pool_changed(old, &pool) {
                    self.pools.insert(key.clone(), pool);
                    return;
                }
                Arc::clone(key)
            }
            None => Arc::new(name_str.clone()),
        };
        self.pools.insert(name.clone(), pool);
        self.enqueue(Key::Pool(name));
    }

    fn pool_deleted(&mut self, pool: FleetPool) {
        if let Some(name) = pool.meta().name.as_ref() {
            if let Some((name, _pool)) = self.pools.remove_entry(name) {
                self.queue.forget(&Key::Pool(name));
            }
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Machine Events ////////////////////////////////////////////////////////////
impl Controller {
    /// Handle `FleetMachine` watcher event.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_machine_event(&mut self, res: EventResult<FleetMachine>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from FleetMachine k8s watcher");
                tokio::time::sleep(WATCHER_ERROR_DELAY).await;
                return;
            }
        };
        match event {
            Event::Applied(obj) => self.machine_applied(obj),
            Event::Deleted(obj) => self.machine_deleted(obj),
            Event::Restarted(objs) => {
                let live: Vec<String> = objs.iter().filter_map(|obj| obj.meta().name.clone()).collect();
                let gone: Vec<FleetMachine> = self
                    .machines
                    .iter()
                    .filter(|(name, _)| !live.contains(&**name))
                    .map(|(_, machine)| machine.clone())
                    .collect();
                gone.into_iter().for_each(|machine| self.machine_deleted(machine));
                objs.into_iter().for_each(|machine| self.machine_applied(machine));
            }
        }
    }

    fn machine_applied(&mut self, machine: FleetMachine) {
        let name_str = match machine.meta().name.as_ref() {
            Some(name_str) => name_str,
            None => return, // Not actually possible as K8s requires name.
        };
        let name = match self.machines.get_key_value(name_str) {
            Some((key, old)) => {
                if !machine_changed(old, &machine) {
                    self.machines.insert(key.clone(), machine);
                    return;
                }
                Arc::clone(key)
            }
            None => Arc::new(name_str.clone()),
        };
        self.machines.insert(name.clone(), machine);
        self.enqueue(Key::Machine(name));
    }

    fn machine_deleted(&mut self, machine: FleetMachine) {
        if let Some(name) = machine.meta().name.as_ref() {
            if let Some((name, _machine)) = self.machines.remove_entry(name) {
                self.queue.forget(&Key::Machine(name));
            }
        }
    }
}

/// Check if the given pool changed in a way which calls for a new pass.
fn pool_changed(old: &FleetPool, new: &FleetPool) -> bool {
    old.spec != new.spec
        || old.meta().generation != new.meta().generation
        || old.meta().deletion_timestamp != new.meta().deletion_timestamp
        || old.meta().finalizers != new.meta().finalizers
}

/// Check if the given tracking record changed in a way which calls for a new pass.
fn machine_changed(old: &FleetMachine, new: &FleetMachine) -> bool {
    old.spec != new.spec
        || old.meta().deletion_timestamp != new.meta().deletion_timestamp
        || old.meta().finalizers != new.meta().finalizers
}
