//! Task wrapper that serializes access to a [`CollectionUpdater`].
//!
//! Local writes, peer envelopes and peer-join notifications arrive from
//! different tasks; the updater is not reentrant, so one task owns it and
//! everything else talks to it through a [`CollectionHandle`].

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::model::Entry;
use crate::store::LocalStorage;
use crate::updater::{CollectionUpdater, MergeOutcome};
use crate::{AsyncStore, Cid, Identity};

const COMMAND_BUFFER: usize = 64;

/// Point-in-time view of a collection.
#[derive(Debug, Clone)]
pub struct CollectionView {
    pub address: Option<Cid>,
    pub index: IndexMap<String, Entry>,
    pub num_entries: usize,
    pub clock: u64,
}

/// Commands sent to the task driving a collection.
#[derive(Debug)]
pub enum Command {
    Add {
        objects: Vec<Value>,
        done_tx: oneshot::Sender<()>,
    },
    Merge {
        collection: Value,
        outcome_tx: oneshot::Sender<MergeOutcome>,
    },
    PeerJoined {
        peer: String,
    },
    View {
        view_tx: oneshot::Sender<CollectionView>,
    },
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("collection task has stopped")]
    Stopped,
}

/// Cloneable sender side of a running collection.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    command_tx: mpsc::Sender<Command>,
}

impl CollectionHandle {
    /// Moves an initialized updater onto its own task.
    pub fn spawn<S, L, I>(updater: CollectionUpdater<S, L, I>) -> Self
    where
        S: AsyncStore + 'static,
        L: LocalStorage + 'static,
        I: Identity + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_collection(updater, command_rx));
        Self { command_tx }
    }

    async fn send(&self, command: Command) -> Result<(), HandleError> {
        self.command_tx.send(command).await.map_err(|_| HandleError::Stopped)
    }

    /// Adds objects and waits until they are committed.
    pub async fn add(&self, objects: Vec<Value>) -> Result<(), HandleError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Add { objects, done_tx }).await?;
        done_rx.await.map_err(|_| HandleError::Stopped)
    }

    pub async fn merge(&self, collection: Value) -> Result<MergeOutcome, HandleError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.send(Command::Merge { collection, outcome_tx }).await?;
        outcome_rx.await.map_err(|_| HandleError::Stopped)
    }

    pub async fn peer_joined(&self, peer: impl Into<String>) -> Result<(), HandleError> {
        self.send(Command::PeerJoined { peer: peer.into() }).await
    }

    pub async fn view(&self) -> Result<CollectionView, HandleError> {
        let (view_tx, view_rx) = oneshot::channel();
        self.send(Command::View { view_tx }).await?;
        view_rx.await.map_err(|_| HandleError::Stopped)
    }

    /// Closes the collection. The task exits once queued commands drain.
    pub async fn close(&self) -> Result<(), HandleError> {
        self.send(Command::Close).await
    }
}

/// Drives an updater until [`Command::Close`] arrives or every handle is
/// dropped. The updater is closed in both cases.
pub async fn run_collection<S, L, I>(
    mut updater: CollectionUpdater<S, L, I>,
    mut command_rx: mpsc::Receiver<Command>,
) where
    S: AsyncStore,
    L: LocalStorage,
    I: Identity,
{
    while let Some(cmd) = command_rx.recv().await {
        match cmd {
            Command::Add { objects, done_tx } => {
                updater.add(objects).await;
                let _ = done_tx.send(());
            }
            Command::Merge { collection, outcome_tx } => {
                let outcome = updater.merge(&collection).await;
                let _ = outcome_tx.send(outcome);
            }
            Command::PeerJoined { peer } => updater.on_peer_joined(&peer),
            Command::View { view_tx } => {
                let _ = view_tx.send(CollectionView {
                    address: updater.address(),
                    index: updater.index().clone(),
                    num_entries: updater.num_entries(),
                    clock: updater.clock(),
                });
            }
            Command::Close => break,
        }
    }
    log::debug!("collection {:?} task stopping", updater.name());
    updater.close();
}
