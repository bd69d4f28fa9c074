use std::time::Duration;

use anyhow::{Context, Result};
use shared::{
    domain::{KeyPackageRecord, Timestamp},
    event::{EventKind, UnsignedEvent},
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::context::SyncContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Inside the cooldown window; nothing was checked.
    Throttled,
    Sufficient,
    Replenished { generated: usize, republished: usize },
}

/// Keeps at least `min_count` unconsumed key packages held and advertised.
///
/// Each credential is stored before its advertisement is published. Advertisements
/// that failed to publish stay in the pool and are retried before any new
/// credential is generated.
pub struct CredentialRotation {
    ctx: SyncContext,
    cooldown: Duration,
    last_replenished: Mutex<Option<Instant>>,
    run_lock: Mutex<()>,
}

impl CredentialRotation {
    pub fn new(ctx: SyncContext) -> Self {
        let cooldown = ctx.settings.rotation_cooldown();
        Self {
            ctx,
            cooldown,
            last_replenished: Mutex::new(None),
            run_lock: Mutex::new(()),
        }
    }

    /// Tops the pool up to `min_count` before returning. Returns how many were generated.
    pub async fn ensure_published(&self, min_count: usize) -> Result<usize> {
        let _running = self.run_lock.lock().await;
        self.republish_pending().await?;
        let held = self.ctx.store.count_available_key_packages().await?;
        if held >= min_count {
            debug!(held, min_count, "key package pool sufficient");
            return Ok(0);
        }
        let generated = self.generate(min_count - held).await?;
        self.publish_relay_list().await;
        info!(held, generated, "key package pool filled");
        Ok(generated)
    }

    /// Replenishes after consumption, at most once per cooldown window. Advertisements
    /// that failed to publish earlier are retried before anything new is generated.
    pub async fn rotate_if_needed(&self, min_count: usize) -> Result<RotationOutcome> {
        let _running = self.run_lock.lock().await;
        {
            let last = self.last_replenished.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.cooldown {
                    debug!("key package rotation throttled");
                    return Ok(RotationOutcome::Throttled);
                }
            }
        }

        let republished = self.republish_pending().await?;
        let held = self.ctx.store.count_available_key_packages().await?;
        let generated = if held < min_count {
            self.generate(min_count - held).await?
        } else {
            0
        };
        if generated + republished == 0 {
            return Ok(RotationOutcome::Sufficient);
        }

        *self.last_replenished.lock().await = Some(Instant::now());
        info!(held, generated, republished, "key package pool replenished");
        Ok(RotationOutcome::Replenished {
            generated,
            republished,
        })
    }

    async fn generate(&self, count: usize) -> Result<usize> {
        let identity = self.ctx.signer.public_key();
        let relays = &self.ctx.settings.relays;
        for _ in 0..count {
            let credential = self
                .ctx
                .protocol
                .generate_join_credential(&identity, relays)
                .await
                .context("failed to generate key package")?;
            let advertisement = self
                .ctx
                .signer
                .sign(credential.advertisement)
                .await
                .context("failed to sign key package advertisement")?;
            let record = KeyPackageRecord {
                id: credential.id,
                advertisement,
                published: false,
                consumed: false,
                created_at: Timestamp::now(),
            };
            self.ctx
                .store
                .add_key_package(&record)
                .await
                .context("failed to store key package")?;
            self.publish(&record).await?;
        }
        Ok(count)
    }

    /// Retries advertisements whose earlier publish failed. Returns how many went out.
    async fn republish_pending(&self) -> Result<usize> {
        let pending = self.ctx.store.list_unpublished_key_packages().await?;
        let mut published = 0;
        for record in pending.iter().filter(|record| !record.consumed) {
            if self.publish(record).await? {
                published += 1;
            }
        }
        Ok(published)
    }

    async fn publish(&self, record: &KeyPackageRecord) -> Result<bool> {
        match self
            .ctx
            .transport
            .publish(&self.ctx.settings.relays, &record.advertisement)
            .await
        {
            Ok(report) if report.is_accepted() => {
                self.ctx.store.mark_key_package_published(&record.id).await?;
                Ok(true)
            }
            Ok(report) => {
                warn!(key_package = %record.id, rejections = %report.rejections(), "key package advertisement rejected");
                Ok(false)
            }
            Err(err) => {
                warn!(key_package = %record.id, error = %err, "key package advertisement publish failed");
                Ok(false)
            }
        }
    }

    async fn publish_relay_list(&self) {
        let relays = &self.ctx.settings.relays;
        let list = relays.iter().fold(
            UnsignedEvent::new(self.ctx.signer.public_key(), EventKind::KeyPackageRelayList, ""),
            |event, relay| event.tag(vec!["relay".into(), relay.clone()]),
        );
        let signed = match self.ctx.signer.sign(list).await {
            Ok(signed) => signed,
            Err(err) => {
                warn!(error = %err, "failed to sign key package relay list");
                return;
            }
        };
        match self.ctx.transport.publish(relays, &signed).await {
            Ok(report) if report.is_accepted() => debug!("key package relay list published"),
            Ok(report) => warn!(rejections = %report.rejections(), "key package relay list rejected"),
            Err(err) => warn!(error = %err, "key package relay list publish failed"),
        }
    }
}

#[cfg(test)]
#[path = "tests/key_packages_tests.rs"]
mod tests;
