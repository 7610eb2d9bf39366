//! Collaboration acceptance, revocation and library propagation.
//!
//! Accepting an invitation grants the invitee the profile record at once,
//! then shares the owner's record libraries (recipes, custom items,
//! shopping items by default) record set by record set. A set that keeps
//! failing is handed to a background reconciliation task instead of
//! blocking the acceptance. Revoking removes the profile grant first and
//! only removes library grants once no other accepted collaboration links
//! the two users.

use crate::config::SharingConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{Query, RemoteStore};
use crate::retry::RetryPolicy;
use crate::status::{SyncState, SyncStatusRegistry};
use hearth_types::{
    ChildProfile, Collaboration, CollaborationStatus, OperationId, RawRecord, RecordId,
    RecordPayload, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempts at a single record write that keeps losing to concurrent edits.
const CONFLICT_RETRIES: usize = 3;

/// All records of one collection owned by `owner`, as seen by `grantee`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordSet {
    pub owner: UserId,
    pub grantee: UserId,
    pub collection: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Grant,
    Revoke,
}

impl Access {
    /// Applies this change to `record`. Returns true if it changed.
    fn apply(self, record: &mut RawRecord, grantee: &UserId) -> bool {
        match self {
            Access::Grant => record.shared_with.insert(grantee.clone()),
            Access::Revoke => record.shared_with.remove(grantee),
        }
    }
}

/// Result of propagating a grant or revoke to record libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Record sets updated before the call returned.
    pub completed: Vec<RecordSet>,
    /// Record sets handed to background reconciliation.
    pub deferred: Vec<RecordSet>,
}

impl PropagationReport {
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

enum Round {
    Applied,
    Stale,
}

/// Drives the collaboration state machine for one signed-in user.
pub struct SharingCoordinator {
    user: UserId,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    registry: Arc<SyncStatusRegistry>,
    config: SharingConfig,
    tasks: Mutex<HashMap<RecordSet, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SharingCoordinator {
    pub fn new(
        user: UserId,
        remote: Arc<dyn RemoteStore>,
        retry: RetryPolicy,
        registry: Arc<SyncStatusRegistry>,
        config: SharingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            user,
            remote,
            retry,
            registry,
            config,
            tasks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<RecordSet, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    async fn load(&self, collaboration_id: RecordId) -> SyncResult<Collaboration> {
        let raw = self
            .retry
            .run(|| self.remote.get(Collaboration::COLLECTION, collaboration_id))
            .await?;
        Ok(raw.decode::<Collaboration>()?.payload)
    }

    /// Accepts a pending invitation addressed to this user.
    pub async fn accept_invitation(
        self: &Arc<Self>,
        collaboration_id: RecordId,
    ) -> SyncResult<PropagationReport> {
        self.ensure_open()?;
        let mut collaboration = self.load(collaboration_id).await?;
        if collaboration.invitee_id != self.user {
            return Err(SyncError::Authorization(format!(
                "{} is not the invitee of {collaboration_id}",
                self.user
            )));
        }
        collaboration.transition(CollaborationStatus::Accepted)?;

        // The store only lets the invitee join the profile once an accepted
        // collaboration exists, so the status goes first.
        self.write_status(collaboration_id, CollaborationStatus::Accepted)
            .await?;
        if let Err(err) = self
            .update_access(
                ChildProfile::COLLECTION,
                collaboration.profile_record_id(),
                &collaboration.invitee_id,
                Access::Grant,
            )
            .await
        {
            warn!("Profile grant for {} failed: {}", collaboration_id, err);
            self.rollback_status(collaboration_id, CollaborationStatus::Pending)
                .await;
            return Err(err);
        }
        info!(
            "{} accepted collaboration {} on profile {}",
            self.user, collaboration_id, collaboration.profile_id
        );

        let sets = self.library_sets(&collaboration);
        let mut report = PropagationReport::default();
        let mut failure = None;
        for set in sets {
            match self.run_set(&set, Access::Grant).await {
                Ok(_) => report.completed.push(set),
                Err(err) if self.config.atomic_propagation => {
                    failure = Some(err);
                    break;
                }
                Err(err) => {
                    warn!(
                        "Sharing {} of {} with {} deferred: {}",
                        set.collection, set.owner, set.grantee, err
                    );
                    self.schedule(set.clone(), Access::Grant);
                    report.deferred.push(set);
                }
            }
        }

        if let Some(err) = failure {
            warn!(
                "Collaboration {} propagation failed, rolling back: {}",
                collaboration_id, err
            );
            // Grants another accepted collaboration still needs are kept.
            let still_shared = self
                .shares_excluding(
                    &collaboration.inviter_id,
                    &collaboration.invitee_id,
                    Some(collaboration_id),
                )
                .await
                .unwrap_or_else(|e| {
                    warn!("Could not check other collaborations, keeping grants: {}", e);
                    true
                });
            if !still_shared {
                for set in report.completed.iter().rev() {
                    if let Err(e) = self.run_set(set, Access::Revoke).await {
                        warn!("Rollback of {} for {} failed: {}", set.collection, set.grantee, e);
                    }
                }
            }
            if let Err(e) = self
                .update_access(
                    ChildProfile::COLLECTION,
                    collaboration.profile_record_id(),
                    &collaboration.invitee_id,
                    Access::Revoke,
                )
                .await
            {
                warn!("Rollback of profile grant failed: {}", e);
            }
            self.rollback_status(collaboration_id, CollaborationStatus::Pending)
                .await;
            return Err(err);
        }

        Ok(report)
    }

    /// Declines a pending invitation addressed to this user.
    pub async fn decline_invitation(&self, collaboration_id: RecordId) -> SyncResult<()> {
        self.ensure_open()?;
        let mut collaboration = self.load(collaboration_id).await?;
        if collaboration.invitee_id != self.user {
            return Err(SyncError::Authorization(format!(
                "{} is not the invitee of {collaboration_id}",
                self.user
            )));
        }
        collaboration.transition(CollaborationStatus::Declined)?;
        self.write_status(collaboration_id, CollaborationStatus::Declined)
            .await?;
        info!("{} declined collaboration {}", self.user, collaboration_id);
        Ok(())
    }

    /// Revokes an accepted collaboration. Either party may revoke.
    pub async fn revoke_access(
        self: &Arc<Self>,
        collaboration_id: RecordId,
    ) -> SyncResult<PropagationReport> {
        self.ensure_open()?;
        let mut collaboration = self.load(collaboration_id).await?;
        if self.user != collaboration.inviter_id && self.user != collaboration.invitee_id {
            return Err(SyncError::Authorization(format!(
                "{} is not part of {collaboration_id}",
                self.user
            )));
        }
        collaboration.transition(CollaborationStatus::Revoked)?;

        let profile_id = collaboration.profile_record_id();
        self.update_access(
            ChildProfile::COLLECTION,
            profile_id,
            &collaboration.invitee_id,
            Access::Revoke,
        )
        .await?;
        if let Err(err) = self
            .write_status(collaboration_id, CollaborationStatus::Revoked)
            .await
        {
            warn!("Revoking {} failed, restoring profile grant: {}", collaboration_id, err);
            if let Err(e) = self
                .update_access(
                    ChildProfile::COLLECTION,
                    profile_id,
                    &collaboration.invitee_id,
                    Access::Grant,
                )
                .await
            {
                warn!("Restoring profile grant failed: {}", e);
            }
            return Err(err);
        }
        info!(
            "{} revoked collaboration {} on profile {}",
            self.user, collaboration_id, collaboration.profile_id
        );

        let mut report = PropagationReport::default();
        if self
            .shares_excluding(
                &collaboration.inviter_id,
                &collaboration.invitee_id,
                Some(collaboration_id),
            )
            .await?
        {
            debug!(
                "{} and {} still collaborate, keeping library grants",
                collaboration.inviter_id, collaboration.invitee_id
            );
            return Ok(report);
        }

        for set in self.library_sets(&collaboration) {
            self.cancel(&set);
            match self.run_set(&set, Access::Revoke).await {
                Ok(_) => report.completed.push(set),
                Err(err) => {
                    warn!(
                        "Unsharing {} of {} from {} deferred: {}",
                        set.collection, set.owner, set.grantee, err
                    );
                    self.schedule(set.clone(), Access::Revoke);
                    report.deferred.push(set);
                }
            }
        }
        Ok(report)
    }

    /// Returns true if an accepted collaboration links `a` and `b` in
    /// either direction.
    pub async fn still_shares(&self, a: &UserId, b: &UserId) -> SyncResult<bool> {
        self.shares_excluding(a, b, None).await
    }

    async fn shares_excluding(
        &self,
        a: &UserId,
        b: &UserId,
        excluding: Option<RecordId>,
    ) -> SyncResult<bool> {
        for owner in [a, b] {
            let records = self
                .retry
                .run(|| {
                    self.remote
                        .list(Collaboration::COLLECTION, Query::OwnedBy(owner.clone()))
                })
                .await?;
            let found = records
                .iter()
                .filter(|raw| Some(raw.id) != excluding)
                .filter_map(|raw| raw.decode::<Collaboration>().ok())
                .any(|c| c.payload.status.is_active() && c.payload.connects(a, b));
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn library_sets(&self, collaboration: &Collaboration) -> Vec<RecordSet> {
        let inviter = &collaboration.inviter_id;
        let invitee = &collaboration.invitee_id;
        let mut pairs = vec![(inviter, invitee)];
        if self.config.bidirectional {
            pairs.push((invitee, inviter));
        }

        pairs
            .into_iter()
            .flat_map(|(owner, grantee)| {
                self.config
                    .shareable_collections
                    .iter()
                    .map(move |collection| RecordSet {
                        owner: owner.clone(),
                        grantee: grantee.clone(),
                        collection: collection.clone(),
                    })
            })
            .collect()
    }

    async fn write_status(
        &self,
        collaboration_id: RecordId,
        status: CollaborationStatus,
    ) -> SyncResult<()> {
        self.retry
            .run(|| async move {
                let raw = self
                    .remote
                    .get(Collaboration::COLLECTION, collaboration_id)
                    .await?;
                let mut record = raw.decode::<Collaboration>()?;
                if record.payload.status == status {
                    return Ok(());
                }
                record.payload.status = status;
                self.remote
                    .write(Collaboration::COLLECTION, record.into_raw()?)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn rollback_status(&self, collaboration_id: RecordId, status: CollaborationStatus) {
        if let Err(e) = self.write_status(collaboration_id, status).await {
            warn!(
                "Restoring collaboration {} to {} failed: {}",
                collaboration_id, status, e
            );
        }
    }

    /// Grants or revokes `grantee` on a single record, under the retry
    /// policy.
    async fn update_access(
        &self,
        collection: &str,
        id: RecordId,
        grantee: &UserId,
        access: Access,
    ) -> SyncResult<()> {
        self.retry
            .run(|| async move {
                let record = self.remote.get(collection, id).await?;
                self.set_access(collection, record, grantee, access).await?;
                Ok(())
            })
            .await
    }

    async fn set_access(
        &self,
        collection: &str,
        mut record: RawRecord,
        grantee: &UserId,
        access: Access,
    ) -> SyncResult<bool> {
        for _ in 0..CONFLICT_RETRIES {
            if !access.apply(&mut record, grantee) {
                return Ok(false);
            }
            match self.remote.write(collection, record.clone()).await {
                Ok(_) => return Ok(true),
                Err(SyncError::Conflict(_)) => match self.remote.get(collection, record.id).await {
                    Ok(fresh) => record = fresh,
                    Err(SyncError::NotFound(_)) => return Ok(false),
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::Conflict(format!(
            "{collection}/{} kept changing while updating access",
            record.id
        )))
    }

    async fn apply_set(&self, set: &RecordSet, access: Access) -> SyncResult<usize> {
        let records = self
            .remote
            .list(&set.collection, Query::OwnedBy(set.owner.clone()))
            .await?;
        let mut changed = 0;
        for record in records {
            if self
                .set_access(&set.collection, record, &set.grantee, access)
                .await?
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn run_set(&self, set: &RecordSet, access: Access) -> SyncResult<usize> {
        let changed = self.retry.run(|| self.apply_set(set, access)).await?;
        debug!(
            "{:?} {} of {} for {}: {} records updated",
            access, set.collection, set.owner, set.grantee, changed
        );
        Ok(changed)
    }

    fn schedule(self: &Arc<Self>, set: RecordSet, access: Access) {
        let operation_id = OperationId::new();
        self.registry.begin(operation_id, None);
        let task = tokio::spawn(reconcile(
            Arc::downgrade(self),
            operation_id,
            set.clone(),
            access,
            self.config.reconciliation_interval(),
            self.config.max_reconciliation_rounds.max(1),
        ));
        if let Some(previous) = self.tasks().insert(set, task) {
            previous.abort();
        }
    }

    fn cancel(&self, set: &RecordSet) {
        if let Some(task) = self.tasks().remove(set) {
            task.abort();
        }
    }

    async fn reconcile_round(&self, set: &RecordSet, access: Access) -> SyncResult<Round> {
        let shares = self.still_shares(&set.owner, &set.grantee).await?;
        if shares != (access == Access::Grant) {
            return Ok(Round::Stale);
        }
        self.run_set(set, access).await?;
        Ok(Round::Applied)
    }

    /// Record sets with a reconciliation still running.
    pub fn pending_reconciliations(&self) -> Vec<RecordSet> {
        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        tasks.keys().cloned().collect()
    }

    /// Aborts every running reconciliation.
    pub fn cancel_reconciliations(&self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }

    /// Cancels reconciliations and rejects further calls. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_reconciliations();
    }
}

impl Drop for SharingCoordinator {
    fn drop(&mut self) {
        self.cancel_reconciliations();
    }
}

async fn reconcile(
    coordinator: Weak<SharingCoordinator>,
    operation_id: OperationId,
    set: RecordSet,
    access: Access,
    interval: std::time::Duration,
    rounds: u32,
) {
    for round in 1..=rounds {
        tokio::time::sleep(interval).await;
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };

        match coordinator.reconcile_round(&set, access).await {
            Ok(Round::Applied) => {
                info!(
                    "Reconciled {:?} of {} for {} after {} rounds",
                    access, set.collection, set.grantee, round
                );
                coordinator
                    .registry
                    .record(operation_id, SyncState::Succeeded, None);
                return;
            }
            Ok(Round::Stale) => {
                debug!(
                    "Dropping {:?} of {} for {}: collaboration changed",
                    access, set.collection, set.grantee
                );
                coordinator
                    .registry
                    .record(operation_id, SyncState::Succeeded, None);
                return;
            }
            Err(err) => {
                warn!(
                    "Reconciliation round {}/{} for {} failed: {}",
                    round, rounds, set.collection, err
                );
                coordinator.registry.record_retry(
                    operation_id,
                    err.to_string(),
                    Instant::now() + interval,
                );
            }
        }
    }

    if let Some(coordinator) = coordinator.upgrade() {
        warn!(
            "Giving up {:?} of {} for {} after {} rounds",
            access, set.collection, set.grantee, rounds
        );
        coordinator.registry.record(
            operation_id,
            SyncState::Failed,
            Some(format!("reconciliation gave up after {rounds} rounds")),
        );
    }
}
