//! Register and deregister batches of proxy configuration items.
//!
//! Registration follows input order; deregistration walks the batch in
//! reverse so items referencing others by `@id` go first.

use std::sync::Arc;

use serde_json::Value;

use crate::observability::metrics;
use crate::proxy::item::{id_path, ItemKind, ProxyConfigItem};
use crate::proxy::{ProxyApi, ProxyError, WriteOutcome};
use crate::resilience::ConflictRetry;

/// What one attempt at an item achieved.
enum Step {
    Done,
    Unchanged,
    Conflict,
}

impl From<WriteOutcome> for Step {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Applied => Step::Done,
            WriteOutcome::Conflict => Step::Conflict,
        }
    }
}

/// Drives the proxy API towards a batch's desired state.
#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn ProxyApi>,
    retry: ConflictRetry,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ProxyApi>) -> Self {
        Self {
            api,
            retry: ConflictRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ConflictRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Register (`register = true`) or deregister the batch.
    ///
    /// Every item is classified before anything is sent, so a malformed
    /// batch has no effect.
    pub async fn reconcile(
        &self,
        items: &[ProxyConfigItem],
        register: bool,
    ) -> Result<(), ProxyError> {
        let mut batch = items
            .iter()
            .map(|item| item.kind().map(|kind| (item, kind)))
            .collect::<Result<Vec<_>, _>>()?;
        if !register {
            batch.reverse();
        }

        for (item, kind) in batch {
            if !register && item.register_only {
                tracing::debug!(mount = %item.mount, "Leaving register-only item in place");
                continue;
            }
            self.apply(item, &kind, register).await?;
        }
        Ok(())
    }

    async fn apply(
        &self,
        item: &ProxyConfigItem,
        kind: &ItemKind,
        register: bool,
    ) -> Result<(), ProxyError> {
        let mut attempt = 1;
        loop {
            let step = match (kind, register) {
                (ItemKind::Aggregate { id }, true) => self.register_aggregate(item, id).await?,
                (ItemKind::Aggregate { id }, false) => self.deregister_aggregate(id).await?,
                (ItemKind::Scalar, true) => self.register_scalar(item).await?,
                (ItemKind::Scalar, false) => self.deregister_scalar(item).await?,
            };
            match step {
                Step::Done => {
                    tracing::info!(mount = %item.mount, register, "Proxy config applied");
                    return Ok(());
                }
                Step::Unchanged => {
                    tracing::debug!(mount = %item.mount, register, "Proxy config already in place");
                    return Ok(());
                }
                Step::Conflict => {
                    metrics::record_proxy_conflict();
                    if !self.retry.allows(attempt) {
                        return Err(ProxyError::TooManyConflicts {
                            path: item.mount.clone(),
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(mount = %item.mount, attempt, "ETag conflict, retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn register_aggregate(&self, item: &ProxyConfigItem, id: &str) -> Result<Step, ProxyError> {
        let path = id_path(id);
        let current = self.api.get(&path).await?;
        if current.present {
            if current.body == item.config {
                return Ok(Step::Unchanged);
            }
            return Ok(self.api.patch(current.etag.as_deref(), &path, &item.config).await?.into());
        }
        let mount = item.mount_path();
        let parent = self.api.get(&mount).await?;
        Ok(self
            .api
            .post(parent.etag.as_deref(), &mount, &item.config)
            .await?
            .into())
    }

    async fn deregister_aggregate(&self, id: &str) -> Result<Step, ProxyError> {
        let path = id_path(id);
        let current = self.api.get(&path).await?;
        if !current.present {
            return Ok(Step::Unchanged);
        }
        Ok(self.api.delete(current.etag.as_deref(), &path).await?.into())
    }

    async fn register_scalar(&self, item: &ProxyConfigItem) -> Result<Step, ProxyError> {
        let mount = item.mount_path();
        let current = self.api.get(&mount).await?;
        if !current.present {
            let body = Value::Array(vec![item.config.clone()]);
            return Ok(self.api.post(current.etag.as_deref(), &mount, &body).await?.into());
        }
        let Value::Array(members) = &current.body else {
            return Err(ProxyError::NotAnArray { path: mount });
        };
        if members.contains(&item.config) {
            return Ok(Step::Unchanged);
        }
        Ok(self
            .api
            .post(current.etag.as_deref(), &mount, &item.config)
            .await?
            .into())
    }

    async fn deregister_scalar(&self, item: &ProxyConfigItem) -> Result<Step, ProxyError> {
        let mount = item.mount_path();
        let current = self.api.get(&mount).await?;
        if !current.present {
            return Ok(Step::Unchanged);
        }
        let Value::Array(members) = &current.body else {
            return Err(ProxyError::NotAnArray { path: mount });
        };
        if !members.contains(&item.config) {
            return Ok(Step::Unchanged);
        }
        let remaining: Vec<Value> = members.iter().filter(|m| **m != item.config).cloned().collect();
        Ok(self
            .api
            .patch(current.etag.as_deref(), &mount, &Value::Array(remaining))
            .await?
            .into())
    }
}
