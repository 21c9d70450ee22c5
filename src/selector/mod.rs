//! Channel selection with a fixed retry budget.
//!
//! Each iteration draws one channel at random from the highest-priority tier
//! of the eligible set, runs its credential check, and hands it back. Retries
//! are immediate.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adaptors::RelayError;
use crate::auth::CredentialManager;
use crate::store::{Channel, ChannelStore, VendorType};

pub const DEFAULT_RETRY_TIMES: u32 = 3;

enum Draw {
    Pick(Channel),
    /// Drew the channel that just failed
    Skip(i64),
    Empty,
}

/// Highest-priority tier, ignoring a failed channel that sits alone on top
fn candidate_tier<'a>(candidates: &'a [Channel], failed: Option<i64>) -> Vec<&'a Channel> {
    let top_tier = |pool: Vec<&'a Channel>| -> Vec<&'a Channel> {
        let Some(top) = pool.iter().map(|c| c.priority).max() else {
            return Vec::new();
        };
        pool.into_iter().filter(|c| c.priority == top).collect()
    };

    let tier = top_tier(candidates.iter().collect());
    let failed_alone = tier.len() == 1 && Some(tier[0].id) == failed && candidates.len() > 1;
    if failed_alone {
        return top_tier(candidates.iter().filter(|c| Some(c.id) != failed).collect());
    }
    tier
}

fn draw(candidates: &[Channel], failed: Option<i64>) -> Draw {
    let tier = candidate_tier(candidates, failed);
    let mut rng = rand::thread_rng();
    let Some(channel) = tier.choose(&mut rng) else {
        return Draw::Empty;
    };
    // The failed channel is still the answer when nothing else serves the model
    if Some(channel.id) == failed && candidates.len() > 1 {
        return Draw::Skip(channel.id);
    }
    Draw::Pick((*channel).clone())
}

pub struct ChannelSelector {
    store: Arc<dyn ChannelStore>,
    credentials: Arc<CredentialManager>,
    retry_times: u32,
}

impl ChannelSelector {
    pub fn new(store: Arc<dyn ChannelStore>, credentials: Arc<CredentialManager>, retry_times: u32) -> Self {
        Self {
            store,
            credentials,
            retry_times: retry_times.max(1),
        }
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    /// Pick a usable channel for `(tenant, vendor, model)`, avoiding
    /// `previously_failed` when another candidate exists.
    pub async fn select_channel(
        &self,
        tenant_id: i64,
        vendor: VendorType,
        model: &str,
        previously_failed: Option<i64>,
    ) -> Result<Channel, RelayError> {
        let mut last_error: Option<RelayError> = None;

        for attempt in 1..=self.retry_times {
            let candidates = match self.store.find_eligible_channels(tenant_id, vendor, model).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("⚠️  Channel lookup failed (attempt {}/{}): {}", attempt, self.retry_times, e);
                    last_error = Some(e.into());
                    continue;
                }
            };

            let channel = match draw(&candidates, previously_failed) {
                Draw::Pick(channel) => channel,
                Draw::Skip(id) => {
                    debug!("Skipping previously failed channel {} (attempt {})", id, attempt);
                    continue;
                }
                Draw::Empty => {
                    last_error = Some(RelayError::NotFound(format!(
                        "no enabled {} channel serves model '{}' for tenant {}",
                        vendor, model, tenant_id
                    )));
                    continue;
                }
            };

            let outcome = match self.credentials.ensure_channel(&channel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        "⚠️  Credentials unavailable for channel {} (attempt {}/{}): {}",
                        channel.id, attempt, self.retry_times, e
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if !outcome.channel_changed() {
                info!("📡 Selected channel {} ({}) for {}", channel.id, channel.name, model);
                return Ok(channel);
            }

            match self.store.get_channel(channel.id).await {
                Ok(Some(fresh)) => {
                    info!("📡 Selected channel {} ({}) for {} after {:?}", fresh.id, fresh.name, model, outcome);
                    return Ok(fresh);
                }
                Ok(None) => last_error = Some(RelayError::NotFound(format!("channel {} disappeared", channel.id))),
                Err(e) => last_error = Some(e.into()),
            }
        }

        let last = last_error.unwrap_or_else(|| {
            RelayError::NotFound(format!("only the failed channel serves model '{}'", model))
        });
        warn!("❌ No channel for {} after {} attempts: {}", model, self.retry_times, last);
        Err(RelayError::exhausted(self.retry_times, last))
    }
}
