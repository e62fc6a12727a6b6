//! Reconciliation engine.
//!
//! One pass brings the gateway's forwarding table in line with a
//! [`DesiredConfig`]: enumerate the remote table, stage every entry we own
//! for removal, reject desired ports held by foreign entries, then delete
//! the staged entries and re-add the desired rules. Entries whose
//! description does not exactly equal our ownership tag are never touched.
//!
//! The engine is not reentrant; callers serialize passes (see the daemon's
//! reconcile lock).

use std::sync::Arc;

use crate::config::{DesiredConfig, MappingRule};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{GatewayControl, GatewaySession, RemoteMappingEntry};

/// Transient-error budget per table index during enumeration.
pub const MAX_RETRY_ON_ERR: u32 = 5;

/// Entries staged for deletion during one pass. Exclusively owned by that
/// pass and dropped on every exit path.
#[derive(Debug, Default)]
struct RemovalCandidates {
    entries: Vec<RemoteMappingEntry>,
}

impl RemovalCandidates {
    fn push(&mut self, entry: RemoteMappingEntry) {
        self.entries.push(entry);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What one pass did, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Mappings of ours deleted from the gateway.
    pub removed: usize,
    /// Desired rules added to the gateway.
    pub added: usize,
}

/// The enumerate → filter → apply state machine over one gateway session.
pub struct SyncEngine {
    control: Arc<dyn GatewayControl>,
    session: GatewaySession,
    lease_seconds: u32,
}

impl SyncEngine {
    /// Build an engine over one established gateway session.
    pub fn new(
        control: Arc<dyn GatewayControl>,
        session: GatewaySession,
        lease_seconds: u32,
    ) -> Self {
        Self {
            control,
            session,
            lease_seconds,
        }
    }

    /// The session this engine reconciles against.
    pub fn session(&self) -> &GatewaySession {
        &self.session
    }

    /// Run a full reconciliation pass against `desired`.
    ///
    /// On [`SyncError::ApplyFailed`] partial state is possible: our stale
    /// entries were already removed and rules before the failing one were
    /// already added. There is deliberately no rollback.
    pub async fn apply(&self, desired: &DesiredConfig) -> SyncResult<SyncOutcome> {
        let candidates = self.enumerate(&desired.rules).await?;
        tracing::debug!(
            stale = candidates.len(),
            desired = desired.rules.len(),
            "reconciliation pass starting apply phase"
        );

        let removed = self.remove_candidates(candidates).await;

        let mut added = 0;
        for rule in &desired.rules {
            self.control
                .add_mapping(rule, self.session.lan_addr, &self.session.tag, self.lease_seconds)
                .await
                .map_err(|source| SyncError::ApplyFailed {
                    eport: rule.eport.clone(),
                    source,
                })?;
            tracing::info!(
                eport = %rule.eport,
                iport = %rule.iport,
                proto = %rule.proto,
                lease = self.lease_seconds,
                "mapping added"
            );
            added += 1;
        }

        Ok(SyncOutcome { removed, added })
    }

    /// Tear down every mapping tagged as ours; the add phase is skipped.
    /// Used before process exit when the operator disables forwarding.
    pub async fn teardown(&self) -> SyncResult<SyncOutcome> {
        let candidates = self.enumerate(&[]).await?;
        let removed = self.remove_candidates(candidates).await;
        Ok(SyncOutcome { removed, added: 0 })
    }

    /// Walk the remote table from index 0 until the out-of-range answer.
    ///
    /// Stages our entries for removal and rejects any desired rule whose
    /// external port is held by an entry we do not own, before anything
    /// is mutated.
    async fn enumerate(&self, desired: &[MappingRule]) -> SyncResult<RemovalCandidates> {
        let mut candidates = RemovalCandidates::default();
        let mut index = 0u32;
        loop {
            let Some(entry) = self.get_entry_with_retry(index).await? else {
                break;
            };
            tracing::debug!(
                index,
                proto = %entry.proto,
                eport = %entry.eport,
                client = %entry.internal_client,
                iport = %entry.iport,
                desc = %entry.description,
                lease = entry.lease_seconds,
                "remote table entry"
            );

            if entry.description == self.session.tag {
                candidates.push(entry);
            } else if let Some(rule) = desired.iter().find(|rule| rule.eport == entry.eport) {
                tracing::error!(
                    eport = %rule.eport,
                    owner = %entry.description,
                    "desired external port is held by another device"
                );
                return Err(SyncError::PortConflict {
                    eport: rule.eport.clone(),
                });
            }
            index += 1;
        }
        Ok(candidates)
    }

    /// Read one index, retrying the same index on transient errors up to
    /// [`MAX_RETRY_ON_ERR`] times.
    async fn get_entry_with_retry(
        &self,
        index: u32,
    ) -> SyncResult<Option<RemoteMappingEntry>> {
        let mut attempts = 0u32;
        loop {
            match self.control.get_entry(index).await {
                Ok(entry) => return Ok(entry),
                Err(err) => {
                    attempts += 1;
                    if attempts > MAX_RETRY_ON_ERR {
                        tracing::error!(index, %err, "enumeration retry budget exhausted");
                        return Err(SyncError::RetryExhausted {
                            index,
                            retries: MAX_RETRY_ON_ERR,
                        });
                    }
                    tracing::warn!(index, attempt = attempts, %err, "transient error reading table entry, retrying");
                }
            }
        }
    }

    /// Best-effort cleanup of our stale entries. Failures are logged and
    /// skipped; this is not a transaction.
    async fn remove_candidates(&self, candidates: RemovalCandidates) -> usize {
        let mut removed = 0;
        for entry in &candidates.entries {
            match self.control.delete_mapping(&entry.eport, entry.proto).await {
                Ok(()) => {
                    tracing::info!(eport = %entry.eport, proto = %entry.proto, "stale mapping removed");
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(eport = %entry.eport, proto = %entry.proto, %err, "failed to remove stale mapping");
                }
            }
        }
        removed
    }
}
