// src/services/notification_store.rs
//! Bounded, newest-first notification log with an unread counter.
//!
//! The counter always equals the number of unread entries in the window.
//! Mutations that the backend must agree with (`mark_read`, `mark_all_read`,
//! `delete`) wait for the backend's confirmation before touching local state,
//! so a rejected call leaves the log exactly as it was.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing;

use crate::{
    errors::SparrowResult,
    models::notification::Notification,
    services::backend::NotificationApi,
};

pub const DEFAULT_CAPACITY: usize = 100;

struct StoreState {
    entries: VecDeque<Notification>,  // newest first
    unread: usize,
}

impl StoreState {
    fn position(&self, id: i64) -> Option<usize> {
        self.entries.iter().position(|n| n.id == id)
    }

    fn evict_overflow(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            if let Some(evicted) = self.entries.pop_back() {
                if !evicted.is_read {
                    self.unread = self.unread.saturating_sub(1);
                }
                tracing::trace!("Evicted notification {} from the window", evicted.id);
            }
        }
    }
}

pub struct NotificationStore {
    api: Arc<dyn NotificationApi>,
    capacity: usize,
    state: RwLock<StoreState>,
}

impl NotificationStore {
    pub fn new(api: Arc<dyn NotificationApi>, capacity: usize) -> Self {
        Self {
            api,
            capacity: capacity.max(1),
            state: RwLock::new(StoreState {
                entries: VecDeque::new(),
                unread: 0,
            }),
        }
    }

    /// Insert a pushed notification at the head. Returns `false` if an entry
    /// with the same id is already present.
    pub fn prepend(&self, notification: Notification) -> bool {
        let mut state = self.state.write();
        if state.position(notification.id).is_some() {
            tracing::debug!("Ignoring duplicate notification {}", notification.id);
            return false;
        }
        if !notification.is_read {
            state.unread += 1;
        }
        state.entries.push_front(notification);
        state.evict_overflow(self.capacity);
        true
    }

    /// Returns `Ok(false)` when there was nothing to do (unknown id or
    /// already read).
    pub async fn mark_read(&self, id: i64) -> SparrowResult<bool> {
        let needs_update = {
            let state = self.state.read();
            state
                .position(id)
                .map(|idx| !state.entries[idx].is_read)
                .unwrap_or(false)
        };
        if !needs_update {
            return Ok(false);
        }

        self.api.mark_read(id).await?;

        let mut state = self.state.write();
        let flipped = match state.position(id) {
            Some(idx) => state.entries[idx].mark_read_at(Utc::now()),
            None => false,
        };
        if flipped {
            state.unread = state.unread.saturating_sub(1);
            tracing::debug!("Notification {} marked as read", id);
        }
        Ok(flipped)
    }

    /// Only entries already held when the call is issued are flipped; anything
    /// pushed while the backend call is in flight stays unread.
    pub async fn mark_all_read(&self, user_id: i64) -> SparrowResult<()> {
        let issued: HashSet<i64> = {
            let state = self.state.read();
            state.entries.iter().map(|n| n.id).collect()
        };

        if let Err(e) = self.api.mark_all_read(user_id).await {
            tracing::warn!("Mark all read rejected for user {}: {}", user_id, e);
            return Err(e);
        }

        let now = Utc::now();
        let mut state = self.state.write();
        let mut flipped = 0;
        for notification in state.entries.iter_mut() {
            if issued.contains(&notification.id) && notification.mark_read_at(now) {
                flipped += 1;
            }
        }
        state.unread = state.unread.saturating_sub(flipped);
        tracing::info!(
            "Marked {} notifications as read for user {}",
            flipped,
            user_id
        );
        Ok(())
    }

    /// Returns whether a local entry was removed.
    pub async fn delete(&self, id: i64) -> SparrowResult<bool> {
        self.api.delete(id).await?;

        let mut state = self.state.write();
        let Some(idx) = state.position(id) else {
            return Ok(false);
        };
        if let Some(removed) = state.entries.remove(idx) {
            if !removed.is_read {
                state.unread = state.unread.saturating_sub(1);
            }
        }
        tracing::debug!("Notification {} deleted", id);
        Ok(true)
    }

    /// Merge one page of history. Entries already present (for example from a
    /// push that raced the fetch) are kept as they are; new ones are slotted
    /// in by creation time. Returns how many entries were added.
    pub async fn refresh(&self, user_id: i64, page: u32, size: u32) -> SparrowResult<usize> {
        let fetched = self.api.fetch_page(user_id, page, size).await?;

        let mut state = self.state.write();
        let mut added = 0;
        for notification in fetched.content {
            if state.position(notification.id).is_some() {
                continue;
            }
            let idx = state
                .entries
                .iter()
                .position(|existing| existing.created_at < notification.created_at)
                .unwrap_or(state.entries.len());
            if !notification.is_read {
                state.unread += 1;
            }
            state.entries.insert(idx, notification);
            added += 1;
        }
        state.evict_overflow(self.capacity);

        tracing::info!(
            "Refreshed notifications page {} for user {}: {} new",
            page,
            user_id,
            added
        );
        Ok(added)
    }

    /// Server-side unread total. Informational only; the local counter is
    /// never overwritten with it.
    pub async fn backend_unread_count(&self, user_id: i64) -> SparrowResult<u64> {
        self.api.unread_count(user_id).await
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.state.read().entries.iter().cloned().collect()
    }

    pub fn get(&self, id: i64) -> Option<Notification> {
        let state = self.state.read();
        state.position(id).map(|idx| state.entries[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unread_count(&self) -> usize {
        self.state.read().unread
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
