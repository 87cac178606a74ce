//! Persistence contract for reminders plus an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::reminder::{OwnerId, Reminder};

/// Simple CRUD over reminders. Listings return only `Scheduled` reminders,
/// soonest first.
pub trait ReminderStore: Send + Sync {
    fn save(&self, reminder: &Reminder) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<Reminder>>;
    /// Returns whether a reminder was removed.
    fn delete(&self, id: &str) -> Result<bool>;
    fn list_active(&self, owner: OwnerId) -> Result<Vec<Reminder>>;
    fn list_all_active(&self) -> Result<Vec<Reminder>>;
}

impl<T: ReminderStore + ?Sized> ReminderStore for Arc<T> {
    fn save(&self, reminder: &Reminder) -> Result<()> {
        (**self).save(reminder)
    }

    fn load(&self, id: &str) -> Result<Option<Reminder>> {
        (**self).load(id)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        (**self).delete(id)
    }

    fn list_active(&self, owner: OwnerId) -> Result<Vec<Reminder>> {
        (**self).list_active(owner)
    }

    fn list_all_active(&self) -> Result<Vec<Reminder>> {
        (**self).list_all_active()
    }
}

/// Sort and filter helper shared by store implementations.
pub fn active_sorted<'a>(
    reminders: impl IntoIterator<Item = &'a Reminder>,
    owner: Option<OwnerId>,
) -> Vec<Reminder> {
    let mut out: Vec<Reminder> = reminders
        .into_iter()
        .filter(|r| r.is_scheduled() && owner.is_none_or(|o| r.owner_id == o))
        .cloned()
        .collect();
    out.sort_by_key(|r| r.next_fire());
    out
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    reminders: Mutex<HashMap<String, Reminder>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReminderStore for MemoryStore {
    fn save(&self, reminder: &Reminder) -> Result<()> {
        let mut map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(reminder.id.clone(), reminder.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(id).cloned())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.remove(id).is_some())
    }

    fn list_active(&self, owner: OwnerId) -> Result<Vec<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(active_sorted(map.values(), Some(owner)))
    }

    fn list_all_active(&self) -> Result<Vec<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(active_sorted(map.values(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimezoneSpec;
    use chrono::{Duration, Utc};

    #[test]
    fn lists_only_scheduled_for_owner_soonest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let tz = TimezoneSpec::utc();
        let late = Reminder::once(1, "late", tz, now + Duration::hours(2), now);
        let soon = Reminder::once(1, "soon", tz, now + Duration::hours(1), now);
        let other = Reminder::once(2, "other", tz, now + Duration::minutes(5), now);
        let mut done = Reminder::once(1, "done", tz, now + Duration::minutes(1), now);
        done.mark_done(now);
        for r in [&late, &soon, &other, &done] {
            store.save(r).unwrap();
        }

        let titles: Vec<String> = store
            .list_active(1)
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["Soon", "Late"]);
        assert_eq!(store.list_all_active().unwrap().len(), 3);
        assert!(store.delete(&soon.id).unwrap());
        assert!(!store.delete(&soon.id).unwrap());
        assert_eq!(store.load(&late.id).unwrap(), Some(late));
    }
}
