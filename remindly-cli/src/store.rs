use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use remindly_core::store::active_sorted;
use remindly_core::{Error, OwnerId, Reminder, ReminderStore};

/// Reminders kept in memory and rewritten to one JSON file on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    reminders: Mutex<HashMap<String, Reminder>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> remindly_core::Result<Self> {
        let path = path.into();
        let reminders = if path.exists() {
            let text = fs::read_to_string(&path)?;
            let list: Vec<Reminder> = if text.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&text)?
            };
            list.into_iter().map(|r| (r.id.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            reminders: Mutex::new(reminders),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &HashMap<String, Reminder>) -> remindly_core::Result<()> {
        let mut list: Vec<&Reminder> = map.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let json = serde_json::to_string_pretty(&list)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write aside, then rename over the old file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            Error::Storage(format!("replace {}: {e}", self.path.display()))
        })
    }
}

impl ReminderStore for FileStore {
    fn save(&self, reminder: &Reminder) -> remindly_core::Result<()> {
        let mut map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        // Memory changes only once the file has.
        let mut next = map.clone();
        next.insert(reminder.id.clone(), reminder.clone());
        self.persist(&next)?;
        *map = next;
        Ok(())
    }

    fn load(&self, id: &str) -> remindly_core::Result<Option<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(id).cloned())
    }

    fn delete(&self, id: &str) -> remindly_core::Result<bool> {
        let mut map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        if !map.contains_key(id) {
            return Ok(false);
        }
        let mut next = map.clone();
        next.remove(id);
        self.persist(&next)?;
        *map = next;
        Ok(true)
    }

    fn list_active(&self, owner: OwnerId) -> remindly_core::Result<Vec<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(active_sorted(map.values(), Some(owner)))
    }

    fn list_all_active(&self) -> remindly_core::Result<Vec<Reminder>> {
        let map = self.reminders.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(active_sorted(map.values(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone, Utc};
    use remindly_core::{RecurrenceRule, TimezoneSpec};

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reminders.json");
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap();
        let tz = TimezoneSpec::Fixed(180);

        let once = Reminder::once(1, "чай", tz, now + Duration::hours(1), now);
        let rule = RecurrenceRule::daily(tz).at(NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        let daily = Reminder::recurring(1, "таблетка", rule, now + Duration::hours(8), now);
        let mut done = Reminder::once(2, "старое", tz, now, now);
        done.mark_done(now);

        let store = FileStore::open(&path).unwrap();
        for r in [&once, &daily, &done] {
            store.save(r).unwrap();
        }
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.load(&daily.id).unwrap(), Some(daily.clone()));
        assert_eq!(reopened.list_all_active().unwrap(), vec![once.clone(), daily]);
        assert!(reopened.list_active(2).unwrap().is_empty());

        assert!(reopened.delete(&once.id).unwrap());
        assert!(!reopened.delete(&once.id).unwrap());
        assert_eq!(FileStore::open(&path).unwrap().load(&once.id).unwrap(), None);
    }

    #[test]
    fn missing_or_empty_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reminders.json");
        assert!(FileStore::open(&path).unwrap().list_all_active().unwrap().is_empty());

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "  \n").unwrap();
        assert!(FileStore::open(&path).unwrap().list_all_active().unwrap().is_empty());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reminders.json");
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 7, 0, 0).unwrap();
        let tz = TimezoneSpec::Fixed(180);
        let kept = Reminder::once(1, "чай", tz, now + Duration::hours(1), now);
        let store = FileStore::open(&path).unwrap();
        store.save(&kept).unwrap();

        // A directory where the temp file goes makes every write fail.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let mut edited = kept.clone();
        edited.title = "кофе".into();
        let fresh = Reminder::once(1, "звонок", tz, now + Duration::hours(2), now);

        assert!(store.save(&edited).is_err());
        assert!(store.save(&fresh).is_err());
        assert!(store.delete(&kept.id).is_err());
        assert_eq!(store.load(&kept.id).unwrap(), Some(kept.clone()));
        assert_eq!(store.load(&fresh.id).unwrap(), None);
        assert_eq!(store.list_all_active().unwrap(), vec![kept.clone()]);
        assert_eq!(FileStore::open(&path).unwrap().list_all_active().unwrap(), vec![kept]);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reminders.json");
        fs::write(&path, "{not json").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
