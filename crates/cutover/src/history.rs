// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded ledger of deployments.
//!
//! The history is a JSON array stored at `{prefix}/history.json`, oldest
//! first. `add` and `rollback_to` only change the in-memory list; `save`
//! commits it. Saving first copies the newest event's configuration to
//! `current.json` and only then writes the truncated list, so the current
//! pointer never names a configuration missing from storage.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::identity::IdentityProvider;
use crate::launch_config::{LaunchConfig, LaunchConfigStore};

/// Default number of events kept on save.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// One deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHistoryEvent {
    /// Deployment label.
    pub revision: String,
    /// When the event was added.
    pub deployed_at: DateTime<Utc>,
    /// Who added it.
    pub deployed_by: String,
    /// Hash of the launch configuration.
    pub hash: String,
}

/// Deployment history of one environment.
pub struct ContainerHistory {
    events: Vec<ContainerHistoryEvent>,
    max_size: usize,
    store: LaunchConfigStore,
    identity: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for ContainerHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHistory")
            .field("events", &self.events)
            .field("max_size", &self.max_size)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ContainerHistory {
    /// Empty history.
    pub fn new(store: LaunchConfigStore, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            events: Vec::new(),
            max_size: DEFAULT_MAX_SIZE,
            store,
            identity,
        }
    }

    /// Keep at most `max_size` events when saving (minimum 1).
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    /// Load the persisted history.
    ///
    /// Returns [`Error::EmptyHistory`] when nothing was persisted yet.
    pub async fn load(
        store: LaunchConfigStore,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        let key = store.history_key();
        let bytes = store
            .object_store()
            .get(store.bucket(), &key)
            .await?
            .ok_or(Error::EmptyHistory)?;
        let events: Vec<ContainerHistoryEvent> = serde_json::from_slice(&bytes)?;
        let mut history = Self::new(store, identity);
        history.events = events;
        Ok(history)
    }

    /// Load the persisted history, starting empty for a fresh environment.
    pub async fn load_or_new(
        store: LaunchConfigStore,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self> {
        match Self::load(store.clone(), identity.clone()).await {
            Err(Error::EmptyHistory) => Ok(Self::new(store, identity)),
            other => other,
        }
    }

    /// Events, oldest first.
    pub fn events(&self) -> &[ContainerHistoryEvent] {
        &self.events
    }

    /// Most recent event.
    pub fn current(&self) -> Option<&ContainerHistoryEvent> {
        self.events.last()
    }

    /// Event for a configuration hash.
    pub fn find(&self, hash: &str) -> Option<&ContainerHistoryEvent> {
        self.events.iter().find(|e| e.hash == hash)
    }

    /// Launch configuration an event refers to.
    pub async fn launch_config(&self, event: &ContainerHistoryEvent) -> Result<LaunchConfig> {
        self.store.load_by_hash(&event.hash).await
    }

    /// Persist a configuration and append an event for it.
    ///
    /// The history itself is not written until [`save`](Self::save).
    pub async fn add(&mut self, config: &LaunchConfig) -> Result<ContainerHistoryEvent> {
        let hash = self.store.save(config).await?;
        let deployed_by = self.identity.current_user().await?;

        let event = ContainerHistoryEvent {
            revision: config.revision.clone(),
            deployed_at: Utc::now(),
            deployed_by,
            hash,
        };
        self.events.push(event.clone());
        Ok(event)
    }

    /// Point `current.json` at the newest event, then write the bounded list.
    pub async fn save(&mut self) -> Result<()> {
        let newest = self.events.last().ok_or(Error::EmptyHistory)?;
        let object_store = self.store.object_store();
        let bucket = self.store.bucket();

        object_store
            .copy(
                bucket,
                &self.store.container_key(&newest.hash),
                bucket,
                &self.store.current_key(),
            )
            .await?;

        if self.events.len() > self.max_size {
            let dropped = self.events.len() - self.max_size;
            self.events.drain(..dropped);
        }

        let mut body = serde_json::to_vec(&self.events)?;
        body.push(b'\n');
        object_store
            .put(bucket, &self.store.history_key(), Bytes::from(body))
            .await?;

        if let Some(current) = self.events.last() {
            info!(
                hash = %current.hash,
                revision = %current.revision,
                events = self.events.len(),
                "Saved container history"
            );
        }
        Ok(())
    }

    /// Drop every event after the one for `hash`, returning that event.
    pub fn rollback_to(&mut self, hash: &str) -> Result<ContainerHistoryEvent> {
        let Some(i) = self.events.iter().position(|e| e.hash == hash) else {
            warn!(hash, "Rollback target not in history");
            return Err(Error::NotInHistory(hash.to_string()));
        };
        self.events.truncate(i + 1);
        Ok(self.events[i].clone())
    }
}
