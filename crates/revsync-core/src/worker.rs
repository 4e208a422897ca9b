//! Background task that drives a [`SyncEngine`] and the handle UI code
//! talks to.
//!
//! The worker keeps receiving commands while a gateway call is in flight,
//! so operations enqueued meanwhile are already queued when the call
//! settles and reconciliation runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::actions::Mutation;
use crate::connectivity::{ConnectivityOracle, NetworkStatus};
use crate::engine::{QueueEvent, SyncEngine};
use crate::error::ErrorCode;
use crate::gateway::EntityGateway;
use crate::queue::Operation;
use crate::store::RowStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("sync worker stopped")]
    Stopped,
}

impl WorkerError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::WorkerStopped
    }
}

#[derive(Debug)]
enum Command {
    Enqueue(Operation),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable front end of a running worker.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    sequence: Arc<AtomicU64>,
    events: broadcast::Sender<QueueEvent>,
}

impl SyncHandle {
    /// Queue a mutation whose optimistic write has already been applied.
    ///
    /// Never fails. If the worker is gone the operation is dropped and the
    /// loss is logged.
    pub fn enqueue(&self, mutation: Mutation) -> Operation {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let op = Operation::new(
            seq,
            mutation.op_type,
            mutation.target,
            mutation.payload,
            Some(mutation.snapshot),
        );
        if self.commands.send(Command::Enqueue(op.clone())).is_err() {
            error!(
                code = %ErrorCode::WorkerStopped,
                seq,
                op = %op.op_type,
                "sync worker stopped, operation not queued"
            );
        }
        op
    }

    /// Resolve once the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker exits first.
    pub async fn flush(&self) -> Result<(), WorkerError> {
        let (done, wait) = oneshot::channel();
        self.commands
            .send(Command::Flush(done))
            .map_err(|_| WorkerError::Stopped)?;
        wait.await.map_err(|_| WorkerError::Stopped)
    }

    /// Ask the worker to stop once the current operation has settled.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker already exited.
    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.commands
            .send(Command::Shutdown)
            .map_err(|_| WorkerError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

pub struct SyncWorker<S, G> {
    engine: SyncEngine<S, G>,
    commands: mpsc::UnboundedReceiver<Command>,
    network: Option<NetworkStatus>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    stopping: bool,
}

impl<S, G> SyncWorker<S, G>
where
    S: RowStore + Send + 'static,
    G: EntityGateway + 'static,
{
    /// Start a worker that treats the network as always available.
    ///
    /// The join handle yields the engine back after shutdown.
    pub fn spawn(engine: SyncEngine<S, G>) -> (SyncHandle, JoinHandle<SyncEngine<S, G>>) {
        Self::start(engine, None)
    }

    /// Start a worker that only dispatches while `network` reports online
    /// and resumes by itself when it comes back.
    pub fn spawn_with_network(
        engine: SyncEngine<S, G>,
        network: NetworkStatus,
    ) -> (SyncHandle, JoinHandle<SyncEngine<S, G>>) {
        Self::start(engine, Some(network))
    }

    fn start(
        engine: SyncEngine<S, G>,
        network: Option<NetworkStatus>,
    ) -> (SyncHandle, JoinHandle<SyncEngine<S, G>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SyncHandle {
            commands: tx,
            sequence: engine.sequence(),
            events: engine.event_sender(),
        };
        let worker = Self {
            engine,
            commands: rx,
            network,
            flush_waiters: Vec::new(),
            stopping: false,
        };
        (handle, tokio::spawn(worker.run()))
    }

    fn online(&self) -> bool {
        self.network.as_ref().is_none_or(ConnectivityOracle::is_online)
    }

    async fn run(mut self) -> SyncEngine<S, G> {
        info!(queued = self.engine.queue().len(), "sync worker started");
        while !self.stopping {
            if self.online() {
                if let Some(ticket) = self.engine.begin_dispatch() {
                    let call = ticket.execute();
                    tokio::pin!(call);
                    let outcome = loop {
                        tokio::select! {
                            outcome = &mut call => break outcome,
                            Some(command) = self.commands.recv() => self.handle(command),
                        }
                    };
                    // commands sent before the call returned belong before settle
                    while let Ok(command) = self.commands.try_recv() {
                        self.handle(command);
                    }
                    if let Err(err) = self.engine.settle(outcome) {
                        error!(code = %err.code(), error = %err, "failed to settle operation");
                    }
                    self.release_flushed();
                    continue;
                }
            }
            self.release_flushed();

            let watching = self.network.is_some();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                changed = wait_for_change(self.network.as_mut()), if watching => {
                    if !changed {
                        debug!("network status source closed");
                        self.network = None;
                    }
                }
            }
        }
        info!(queued = self.engine.queue().len(), "sync worker stopped");
        self.engine
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue(op) => self.engine.push(op),
            Command::Flush(done) => self.flush_waiters.push(done),
            Command::Shutdown => self.stopping = true,
        }
    }

    fn release_flushed(&mut self) {
        if self.engine.queue().is_empty() {
            for done in self.flush_waiters.drain(..) {
                let _ = done.send(());
            }
        }
    }
}

async fn wait_for_change(network: Option<&mut NetworkStatus>) -> bool {
    match network {
        Some(network) => network.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::LocalActions;
    use crate::connectivity::network_status;
    use crate::gateway::InMemoryGateway;
    use crate::model::TempIdGenerator;
    use crate::retry::RetryPolicy;
    use crate::store::{MemoryStore, SharedStore};

    fn setup() -> (SharedStore<MemoryStore>, Arc<InMemoryGateway>, LocalActions) {
        (
            SharedStore::new(MemoryStore::new()),
            Arc::new(InMemoryGateway::new()),
            LocalActions::new(TempIdGenerator::seeded("tmp-", 7)),
        )
    }

    #[tokio::test]
    async fn flush_waits_for_the_queue_to_empty() {
        let (mut store, server, actions) = setup();
        let engine = SyncEngine::new(store.clone(), Arc::clone(&server))
            .with_policy(RetryPolicy::no_retry());
        let (handle, join) = SyncWorker::spawn(engine);

        let project = actions.create_project(&mut store, "Trial").expect("create");
        let temp = project.target.row_key();
        handle.enqueue(project);
        handle.flush().await.expect("flush");

        assert_eq!(store.get_row("projects", &temp).expect("get"), None);
        assert!(store.get_row("projects", "srv-1").expect("get").is_some());

        handle.shutdown().expect("shutdown");
        let engine = join.await.expect("join");
        assert!(engine.queue().is_empty());
        assert!(handle.flush().await.is_err());
    }

    #[tokio::test]
    async fn offline_worker_holds_the_queue_until_back_online() {
        let (mut store, server, actions) = setup();
        let (setter, status) = network_status(false);
        let engine = SyncEngine::new(store.clone(), Arc::clone(&server));
        let (handle, join) = SyncWorker::spawn_with_network(engine, status);

        handle.enqueue(actions.create_project(&mut store, "Offline").expect("create"));
        // a flush cannot complete while offline
        let flushed = tokio::time::timeout(std::time::Duration::from_millis(50), handle.flush()).await;
        assert!(flushed.is_err());
        assert!(server.calls().is_empty());

        setter.set_online(true);
        handle.flush().await.expect("flush");
        assert_eq!(server.calls().len(), 1);

        handle.shutdown().expect("shutdown");
        join.await.expect("join");
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_worker() {
        let (store, server, _actions) = setup();
        let (handle, join) = SyncWorker::spawn(SyncEngine::new(store, server));
        drop(handle);
        let engine = join.await.expect("join");
        assert!(engine.queue().is_empty());
    }
}
