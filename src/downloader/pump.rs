//! Admission control
//!
//! A transfer holds a slot from the moment it is QUEUED until it reaches a
//! terminal status. Pumping a domain promotes its oldest pending transfers
//! while both the global and the per-domain caps leave room.

use tracing::{debug, info, instrument, warn};

use super::engine::Engine;
use super::error::Result;
use super::models::Transfer;
use super::queue::Task;

/// Number of transfers that may still be admitted for a domain
pub fn available_slots(
    max_total: u64,
    max_per_domain: u64,
    global_active: u64,
    domain_active: u64,
) -> u64 {
    max_total
        .saturating_sub(global_active)
        .min(max_per_domain.saturating_sub(domain_active))
}

impl Engine {
    /// Promotes pending transfers of `domain` up to capacity and schedules a
    /// start task for each. Returns the keys promoted by this call.
    #[instrument(skip(self))]
    pub async fn pump(&self, domain: &str) -> Result<Vec<String>> {
        let _admission = self.pump_lock.lock().await;

        let global_active = Transfer::count_active(&self.db, None).await?;
        let domain_active = Transfer::count_active(&self.db, Some(domain)).await?;
        let slots = available_slots(
            self.settings.max_transfers_total,
            self.settings.max_transfers_per_domain,
            global_active,
            domain_active,
        );
        if slots == 0 {
            debug!(global_active, domain_active, "No free slots");
            return Ok(Vec::new());
        }

        let candidates = Transfer::pending_for_domain(&self.db, domain, slots).await?;
        let mut promoted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match Transfer::promote(&self.db, &candidate.key).await {
                Ok(Some(transfer)) => {
                    self.scheduler.schedule(Task::Start {
                        transfer: transfer.key.clone(),
                    });
                    promoted.push(transfer.key);
                }
                // Canceled or promoted elsewhere since it was selected
                Ok(None) => debug!(transfer = %candidate.key, "Candidate no longer pending"),
                Err(e) => warn!(transfer = %candidate.key, error = %e, "Promotion failed, skipping"),
            }
        }

        if !promoted.is_empty() {
            info!(count = promoted.len(), global_active, domain_active, "Admitted transfers");
        }
        Ok(promoted)
    }

    /// Pumps every domain that has pending transfers
    pub async fn pump_all(&self) -> Result<usize> {
        let mut total = 0;
        for domain in Transfer::pending_domains(&self.db).await? {
            match self.pump(&domain).await {
                Ok(promoted) => total += promoted.len(),
                Err(e) => warn!(domain = %domain, error = %e, "Pump failed"),
            }
        }
        Ok(total)
    }
}
