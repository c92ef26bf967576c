//! Optimistic vote toggling.
//!
//! [`MutationCoordinator::toggle`] flips the cached vote immediately, sends
//! the request in the background and reconciles when it answers. Each toggle
//! on an entity takes the next generation number; only a response for the
//! newest generation may write to the cache. Older responses are dropped,
//! whatever order they arrive in, so two quick toggles always settle on the
//! server's answer to the second one.
//!
//! The maps below are behind short synchronous locks so they can be shared
//! across runtime threads. No lock is held while a request is in flight.

use crate::error::ApiError;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The part of an entity a vote toggle changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteState {
    pub vote_count: u64,
    pub viewer_has_voted: bool,
}

impl VoteState {
    /// The state after the viewer flips their vote.
    pub fn toggled(self) -> Self {
        if self.viewer_has_voted {
            Self {
                vote_count: self.vote_count.saturating_sub(1),
                viewer_has_voted: false,
            }
        } else {
            Self {
                vote_count: self.vote_count + 1,
                viewer_has_voted: true,
            }
        }
    }
}

/// A votable item as the client currently believes it to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: EntityId,
    pub vote_count: u64,
    pub viewer_has_voted: bool,
}

impl Entity {
    pub fn new(id: EntityId, votes: VoteState) -> Self {
        Self {
            id,
            vote_count: votes.vote_count,
            viewer_has_voted: votes.viewer_has_voted,
        }
    }

    pub fn votes(&self) -> VoteState {
        VoteState {
            vote_count: self.vote_count,
            viewer_has_voted: self.viewer_has_voted,
        }
    }

    fn set_votes(&mut self, votes: VoteState) {
        self.vote_count = votes.vote_count;
        self.viewer_has_voted = votes.viewer_has_voted;
    }
}

/// Application-owned entity cache. Clones share the same entries.
#[derive(Clone, Default)]
pub struct EntityCache {
    entries: Arc<Mutex<HashMap<EntityId, Entity>>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, entity: Entity) {
        self.lock().insert(entity.id.clone(), entity);
    }

    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &EntityId) -> Option<Entity> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Apply `f` to the entity's votes; returns the state before the change.
    fn update(&self, id: &EntityId, f: impl FnOnce(VoteState) -> VoteState) -> Option<VoteState> {
        let mut entries = self.lock();
        let entity = entries.get_mut(id)?;
        let before = entity.votes();
        entity.set_votes(f(before));
        Some(before)
    }

    /// Overwrite votes if the entity is still cached.
    fn write(&self, id: &EntityId, votes: VoteState) {
        if let Some(entity) = self.lock().get_mut(id) {
            entity.set_votes(votes);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, Entity>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Server side of the toggle: flips the viewer's vote and returns the
/// authoritative result.
pub trait VoteBackend: Send + Sync + 'static {
    fn toggle_vote(
        &self,
        id: &EntityId,
    ) -> impl Future<Output = Result<VoteState, ApiError>> + Send;
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("no cached entity with id {id}")]
    UnknownEntity { id: EntityId },
    #[error("vote on {id} failed: {source}")]
    Rejected {
        id: EntityId,
        #[source]
        source: ApiError,
    },
    #[error("vote on {id} did not complete: {message}")]
    Interrupted { id: EntityId, message: String },
}

/// How a toggle settled when no error needs reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The server's state was written to the cache.
    Committed(VoteState),
    /// A newer toggle on the same entity took over; this response was ignored.
    Superseded,
}

/// A snapshot taken before an optimistic write.
#[derive(Debug, Clone)]
struct PendingMutation {
    id: EntityId,
    generation: u64,
    snapshot: VoteState,
}

/// Handle to a toggle whose request is in flight. Dropping it does not
/// cancel anything; reconciliation still happens.
pub struct PendingToggle {
    id: EntityId,
    generation: u64,
    optimistic: VoteState,
    handle: JoinHandle<Result<Reconciled, MutationError>>,
}

impl PendingToggle {
    pub fn entity_id(&self) -> &EntityId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The state written to the cache before the request was sent.
    pub fn optimistic(&self) -> VoteState {
        self.optimistic
    }

    /// Wait for the response and its reconciliation.
    pub async fn settled(self) -> Result<Reconciled, MutationError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(MutationError::Interrupted {
                id: self.id,
                message: e.to_string(),
            }),
        }
    }
}

pub struct MutationCoordinator<B> {
    backend: Arc<B>,
    cache: EntityCache,
    generations: Arc<Mutex<HashMap<EntityId, u64>>>,
}

impl<B: VoteBackend> MutationCoordinator<B> {
    pub fn new(backend: Arc<B>, cache: EntityCache) -> Self {
        Self {
            backend,
            cache,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Latest generation handed out for `id` (0 if never toggled).
    pub fn generation(&self, id: &EntityId) -> u64 {
        lock(&self.generations).get(id).copied().unwrap_or(0)
    }

    /// Flip the viewer's vote on `id` now and confirm it with the server.
    ///
    /// Returns once the optimistic state is in the cache. Fails only when the
    /// entity is not cached; server failures are reported by
    /// [`PendingToggle::settled`].
    pub fn toggle(&self, id: &EntityId) -> Result<PendingToggle, MutationError> {
        let (pending, optimistic) = {
            let mut generations = lock(&self.generations);
            let snapshot = self
                .cache
                .update(id, VoteState::toggled)
                .ok_or_else(|| MutationError::UnknownEntity { id: id.clone() })?;
            let generation = generations.entry(id.clone()).or_insert(0);
            *generation += 1;
            let pending = PendingMutation {
                id: id.clone(),
                generation: *generation,
                snapshot,
            };
            (pending, snapshot.toggled())
        };
        tracing::debug!(
            id = %pending.id,
            generation = pending.generation,
            votes = optimistic.vote_count,
            voted = optimistic.viewer_has_voted,
            "optimistic toggle applied"
        );

        let backend = Arc::clone(&self.backend);
        let cache = self.cache.clone();
        let generations = Arc::clone(&self.generations);
        let task_pending = pending.clone();
        let handle = tokio::spawn(async move {
            let result = backend.toggle_vote(&task_pending.id).await;
            reconcile(&generations, &cache, &task_pending, result)
        });

        Ok(PendingToggle {
            id: pending.id,
            generation: pending.generation,
            optimistic,
            handle,
        })
    }
}

fn reconcile(
    generations: &Mutex<HashMap<EntityId, u64>>,
    cache: &EntityCache,
    pending: &PendingMutation,
    result: Result<VoteState, ApiError>,
) -> Result<Reconciled, MutationError> {
    let generations = lock(generations);
    let latest = generations.get(&pending.id).copied().unwrap_or(0);
    let is_latest = pending.generation == latest;

    match result {
        Ok(server) if is_latest => {
            cache.write(&pending.id, server);
            tracing::debug!(id = %pending.id, generation = pending.generation, "toggle committed");
            Ok(Reconciled::Committed(server))
        }
        Ok(_) => {
            tracing::debug!(
                id = %pending.id,
                generation = pending.generation,
                latest,
                "discarding superseded toggle response"
            );
            Ok(Reconciled::Superseded)
        }
        Err(source) if is_latest => {
            cache.write(&pending.id, pending.snapshot);
            tracing::warn!(id = %pending.id, error = %source, "toggle failed, rolled back");
            Err(MutationError::Rejected {
                id: pending.id.clone(),
                source,
            })
        }
        Err(source) => {
            tracing::warn!(
                id = %pending.id,
                generation = pending.generation,
                latest,
                error = %source,
                "superseded toggle failed"
            );
            Ok(Reconciled::Superseded)
        }
    }
}

fn lock(map: &Mutex<HashMap<EntityId, u64>>) -> MutexGuard<'_, HashMap<EntityId, u64>> {
    map.lock().unwrap_or_else(|p| p.into_inner())
}
