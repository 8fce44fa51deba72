//! Reminder scheduler: a sorted in-memory queue, mirrored into the fact
//! store's `reminders` table on every status transition so a restart can
//! recover anything left "marked-triggered" across a crash — ticked every
//! 60s.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenet_memory::FactStore;
use tenet_tools::ReminderRequest;
use tracing::{info, warn};
use uuid::Uuid;

/// 0 = pending, 1 = marked-triggered (delivery attempted or in flight),
/// 2 = delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Triggered,
    Delivered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub message: String,
    pub trigger_at: DateTime<Utc>,
    pub status: ReminderStatus,
}

impl Reminder {
    pub fn new(message: impl Into<String>, trigger_at: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), message: message.into(), trigger_at, status: ReminderStatus::Pending }
    }
}

/// Window that absorbs missed ticks: a reminder becomes due once
/// `triggerAt <= now + window`.
const TICK_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// External collaborator: delivers a reminder to the user (chat message,
/// notification, etc). `Ok` means delivered.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, message: &str) -> anyhow::Result<()>;
}

/// Sorted queue kept ordered by `trigger_at` ascending; insertion via binary
/// search so the tick scan can stop at the first not-yet-due reminder.
pub struct ReminderScheduler {
    queue: Vec<Reminder>,
}

impl Default for ReminderScheduler {
    fn default() -> Self {
        Self { queue: Vec::new() }
    }
}

impl ReminderScheduler {
    /// Rebuild the queue from the fact store's `reminders` table at startup,
    /// sorted by `trigger_at` ascending. Returns an empty scheduler if the
    /// table is empty (first run).
    pub fn load(store: &FactStore) -> Result<Self> {
        let mut queue: Vec<Reminder> = store
            .all_reminders()?
            .into_iter()
            .map(|bytes| serde_json::from_slice(&bytes))
            .collect::<std::result::Result<_, _>>()?;
        queue.sort_by(|a, b| a.trigger_at.cmp(&b.trigger_at));
        Ok(Self { queue })
    }

    pub fn insert(&mut self, store: &FactStore, reminder: Reminder) -> Result<()> {
        persist_reminder(store, &reminder)?;
        let pos = self
            .queue
            .binary_search_by(|r| r.trigger_at.cmp(&reminder.trigger_at))
            .unwrap_or_else(|p| p);
        self.queue.insert(pos, reminder);
        Ok(())
    }

    pub fn clear(&mut self, store: &FactStore) -> Result<()> {
        store.clear_reminders()?;
        self.queue.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn list(&self) -> &[Reminder] {
        &self.queue
    }

    /// Apply an incoming tool request, translating `Create`/`Clear` into
    /// queue mutations.
    pub fn apply_request(&mut self, store: &FactStore, request: ReminderRequest) -> Result<()> {
        match request {
            ReminderRequest::Create { message, trigger_at } => self.insert(store, Reminder::new(message, trigger_at)),
            ReminderRequest::Clear => self.clear(store),
        }
    }

    /// One 60s tick: collect reminders due within the window, mark each
    /// `Triggered` before attempting delivery, and advance to `Delivered`
    /// only on send success. A send failure leaves the reminder at
    /// `Triggered` for the next tick to retry. Every status transition is
    /// persisted before moving to the next reminder, so a crash mid-tick
    /// leaves the store consistent with the in-memory queue.
    pub async fn tick(&mut self, store: &FactStore, now: DateTime<Utc>, sink: &dyn NotificationSink) {
        let due_cutoff = now + TICK_WINDOW;
        for reminder in self.queue.iter_mut() {
            if reminder.status != ReminderStatus::Pending || reminder.trigger_at > due_cutoff {
                continue;
            }
            reminder.status = ReminderStatus::Triggered;
            if let Err(err) = persist_reminder(store, reminder) {
                warn!(id = %reminder.id, ?err, "failed to persist triggered reminder");
            }
            match sink.deliver(&reminder.message).await {
                Ok(()) => {
                    reminder.status = ReminderStatus::Delivered;
                    if let Err(err) = persist_reminder(store, reminder) {
                        warn!(id = %reminder.id, ?err, "failed to persist delivered reminder");
                    }
                    info!(id = %reminder.id, "reminder delivered");
                }
                Err(err) => {
                    warn!(id = %reminder.id, ?err, "reminder delivery failed, will retry next tick");
                }
            }
        }
    }

    /// Startup crash recovery: any reminder left `Triggered` with a past
    /// `trigger_at` didn't confirm delivery before the prior shutdown.
    /// Re-dispatch with a literal "(recuperado)" prefix on the whole
    /// reminder line, matching the recovery message format; only advance to
    /// `Delivered` on success, guaranteeing at-least-once recovery delivery.
    pub async fn recover(&mut self, store: &FactStore, now: DateTime<Utc>, sink: &dyn NotificationSink) {
        for reminder in self.queue.iter_mut() {
            if reminder.status != ReminderStatus::Triggered || reminder.trigger_at > now {
                continue;
            }
            let recovered_message = format!("(recuperado) Recordatorio: {}", reminder.message);
            match sink.deliver(&recovered_message).await {
                Ok(()) => {
                    reminder.status = ReminderStatus::Delivered;
                    if let Err(err) = persist_reminder(store, reminder) {
                        warn!(id = %reminder.id, ?err, "failed to persist recovered reminder");
                    }
                    info!(id = %reminder.id, "orphaned reminder recovered and delivered");
                }
                Err(err) => {
                    warn!(id = %reminder.id, ?err, "reminder recovery delivery failed");
                }
            }
        }
    }
}

fn persist_reminder(store: &FactStore, reminder: &Reminder) -> Result<()> {
    let bytes = serde_json::to_vec(reminder)?;
    store.put_reminder(&reminder.id.to_string(), &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingSink {
        delivered: Arc<std::sync::Mutex<Vec<String>>>,
        fail_next: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, message: &str) -> anyhow::Result<()> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated delivery failure");
            }
            self.delivered.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn sink() -> (RecordingSink, Arc<std::sync::Mutex<Vec<String>>>) {
        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        (RecordingSink { delivered: delivered.clone(), fail_next: Arc::new(AtomicUsize::new(0)) }, delivered)
    }

    fn temp_store() -> (tempfile::TempDir, FactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FactStore::open(dir.path().join("facts.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_keeps_queue_sorted_by_trigger_at() {
        let (_dir, store) = temp_store();
        let mut scheduler = ReminderScheduler::default();
        let now = Utc::now();
        scheduler.insert(&store, Reminder::new("third", now + chrono::Duration::minutes(30))).unwrap();
        scheduler.insert(&store, Reminder::new("first", now + chrono::Duration::minutes(5))).unwrap();
        scheduler.insert(&store, Reminder::new("second", now + chrono::Duration::minutes(15))).unwrap();
        let messages: Vec<&str> = scheduler.queue.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn tick_delivers_reminders_within_window() {
        let (_dir, store) = temp_store();
        let mut scheduler = ReminderScheduler::default();
        let now = Utc::now();
        scheduler.insert(&store, Reminder::new("due soon", now + chrono::Duration::minutes(2))).unwrap();
        scheduler.insert(&store, Reminder::new("far away", now + chrono::Duration::hours(2))).unwrap();
        let (s, delivered) = sink();
        scheduler.tick(&store, now, &s).await;
        assert_eq!(*delivered.lock().unwrap(), vec!["due soon".to_string()]);
    }

    #[tokio::test]
    async fn failed_delivery_stays_triggered_for_retry() {
        let (_dir, store) = temp_store();
        let mut scheduler = ReminderScheduler::default();
        let now = Utc::now();
        scheduler.insert(&store, Reminder::new("flaky", now)).unwrap();
        let (s, _delivered) = sink();
        s.fail_next.store(1, Ordering::SeqCst);
        scheduler.tick(&store, now, &s).await;
        assert_eq!(scheduler.queue[0].status, ReminderStatus::Triggered);
    }

    #[tokio::test]
    async fn recovery_redelivers_orphaned_triggered_reminders_with_marker() {
        let (_dir, store) = temp_store();
        let mut scheduler = ReminderScheduler::default();
        let now = Utc::now();
        let mut r = Reminder::new("stuck", now - chrono::Duration::minutes(10));
        r.status = ReminderStatus::Triggered;
        scheduler.insert(&store, r).unwrap();
        let (s, delivered) = sink();
        scheduler.recover(&store, now, &s).await;
        assert_eq!(delivered.lock().unwrap()[0], "(recuperado) Recordatorio: stuck");
        assert_eq!(scheduler.queue[0].status, ReminderStatus::Delivered);
    }

    #[tokio::test]
    async fn apply_request_clear_empties_queue() {
        let (_dir, store) = temp_store();
        let mut scheduler = ReminderScheduler::default();
        scheduler.insert(&store, Reminder::new("x", Utc::now())).unwrap();
        scheduler.apply_request(&store, ReminderRequest::Clear).unwrap();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn load_restores_queue_from_store_sorted() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        {
            let mut scheduler = ReminderScheduler::default();
            scheduler.insert(&store, Reminder::new("second", now + chrono::Duration::minutes(10))).unwrap();
            scheduler.insert(&store, Reminder::new("first", now + chrono::Duration::minutes(5))).unwrap();
        }
        let reloaded = ReminderScheduler::load(&store).unwrap();
        let messages: Vec<&str> = reloaded.list().iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn triggered_status_survives_reload_after_failed_delivery() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        {
            let mut scheduler = ReminderScheduler::default();
            scheduler.insert(&store, Reminder::new("flaky", now)).unwrap();
            let (s, _delivered) = sink();
            s.fail_next.store(1, Ordering::SeqCst);
            scheduler.tick(&store, now, &s).await;
        }
        let reloaded = ReminderScheduler::load(&store).unwrap();
        assert_eq!(reloaded.list()[0].status, ReminderStatus::Triggered);
    }
}
