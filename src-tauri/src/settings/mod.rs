//! Key-value settings persisted as a JSON object on disk.
//!
//! Surrounding UI stores keep their state here between sessions. Every write
//! rewrites the whole file through a temporary sibling and a rename.

pub mod error;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use error::{Result, SettingsError};

pub const SETTINGS_FILE: &str = "settings.json";

pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    /// Opens the store at `path`, starting empty when the file is missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(raw) if raw.trim().is_empty() => Map::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        info!("Loaded {} setting(s) from {}", values.len(), path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub async fn open_in(data_dir: &Path) -> Result<Self> {
        Self::open(data_dir.join(SETTINGS_FILE)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let values = self.values.lock().await;
        let value = values
            .get(key)
            .cloned()
            .ok_or_else(|| SettingsError::SettingNotFound(key.to_string()))?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_setting_or<T: DeserializeOwned>(&self, key: &str, default_value: T) -> Result<T> {
        match self.get_setting(key).await {
            Err(SettingsError::SettingNotFound(_)) => Ok(default_value),
            other => other,
        }
    }

    pub async fn get_setting_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        self.get_setting_or(key, T::default()).await
    }

    /// Like [`get_setting`](Self::get_setting), with a missing key as `None`.
    pub async fn find_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_setting(key).await {
            Ok(value) => Ok(Some(value)),
            Err(SettingsError::SettingNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.commit(|values| {
            values.insert(key.to_string(), value);
            Ok(())
        })
        .await?;
        debug!("Stored setting {key}");
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool> {
        let mut values = self.values.lock().await;
        if !values.contains_key(key) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.remove(key);
        self.persist(&next).await?;
        *values = next;
        Ok(true)
    }

    pub async fn setting_exists(&self, key: &str) -> bool {
        self.values.lock().await.contains_key(key)
    }

    pub async fn list_settings(&self) -> Map<String, Value> {
        self.values.lock().await.clone()
    }

    pub async fn count_settings(&self) -> usize {
        self.values.lock().await.len()
    }

    /// Removes every setting and returns how many there were.
    pub async fn clear_settings(&self) -> Result<usize> {
        self.commit(|values| {
            let removed = values.len();
            values.clear();
            Ok(removed)
        })
        .await
    }

    /// Deep-merges `new_value` into the stored object. Non-object values
    /// replace what was stored.
    pub async fn merge_settings(&self, key: &str, new_value: Value) -> Result<()> {
        self.commit(|values| {
            match values.get_mut(key) {
                Some(current) => merge_value(current, new_value),
                None => {
                    values.insert(key.to_string(), new_value);
                }
            }
            Ok(())
        })
        .await
    }

    /// Sets `value` at a dot-separated `path` inside the setting, creating
    /// intermediate objects as needed.
    pub async fn set_nested_setting(&self, key: &str, path: &str, value: Value) -> Result<()> {
        let segments = split_path(path)?;
        let invalid = || SettingsError::InvalidPath(path.to_string());
        self.commit(|values| {
            let mut node = values
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));

            let (last, parents) = segments.split_last().ok_or_else(invalid)?;
            for segment in parents {
                node = node
                    .as_object_mut()
                    .ok_or_else(invalid)?
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            node.as_object_mut()
                .ok_or_else(invalid)?
                .insert(last.to_string(), value);
            Ok(())
        })
        .await
    }

    pub async fn get_nested_setting<T: DeserializeOwned>(&self, key: &str, path: &str) -> Result<T> {
        let segments = split_path(path)?;
        let values = self.values.lock().await;
        let mut node = values
            .get(key)
            .ok_or_else(|| SettingsError::SettingNotFound(key.to_string()))?;
        for segment in segments {
            node = node
                .get(segment)
                .ok_or_else(|| SettingsError::InvalidPath(path.to_string()))?;
        }
        Ok(serde_json::from_value(node.clone())?)
    }

    /// Applies `change` to a copy of the settings. The copy replaces the
    /// in-memory map only once it is on disk.
    async fn commit<R>(&self, change: impl FnOnce(&mut Map<String, Value>) -> Result<R>) -> Result<R> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        let outcome = change(&mut next)?;
        self.persist(&next).await?;
        *values = next;
        Ok(outcome)
    }

    async fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(values)?;
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, data).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments = path.split('.').collect::<Vec<_>>();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(SettingsError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn merge_value(current: &mut Value, incoming: Value) {
    match (current, incoming) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match current.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (current, incoming) => *current = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open_in(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_setting_is_typed_error() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get_setting::<Value>("theme").await,
            Err(SettingsError::SettingNotFound(key)) if key == "theme"
        ));
        assert_eq!(store.get_setting_or("theme", "dark".to_string()).await.unwrap(), "dark");
        assert_eq!(store.get_setting_or_default::<String>("theme").await.unwrap(), "");
        assert_eq!(store.find_setting::<String>("theme").await.unwrap(), None);

        store.set_setting("theme", "light").await.unwrap();
        assert_eq!(
            store.find_setting::<String>("theme").await.unwrap().as_deref(),
            Some("light")
        );
        assert!(matches!(
            store.find_setting::<bool>("theme").await,
            Err(SettingsError::JsonSerialization(_))
        ));
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let (dir, store) = store().await;
        store.set_setting("left-sidebar.width", &280).await.unwrap();
        store.set_setting("theme", "light").await.unwrap();
        drop(store);

        let reopened = SettingsStore::open_in(dir.path()).await.unwrap();
        assert_eq!(reopened.get_setting::<u32>("left-sidebar.width").await.unwrap(), 280);
        assert_eq!(reopened.get_setting::<String>("theme").await.unwrap(), "light");
        assert_eq!(reopened.count_settings().await, 2);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let (_dir, store) = store().await;
        store.set_setting("a", &1).await.unwrap();
        store.set_setting("b", &2).await.unwrap();

        assert!(store.delete_setting("a").await.unwrap());
        assert!(!store.delete_setting("a").await.unwrap());
        assert!(!store.setting_exists("a").await);
        assert_eq!(store.clear_settings().await.unwrap(), 1);
        assert!(store.list_settings().await.is_empty());
    }

    #[tokio::test]
    async fn merge_is_deep_for_objects() {
        let (_dir, store) = store().await;
        store
            .set_setting("layout", &json!({ "left": { "open": true, "width": 200 } }))
            .await
            .unwrap();

        store
            .merge_settings("layout", json!({ "left": { "width": 320 }, "right": { "open": false } }))
            .await
            .unwrap();

        assert_eq!(
            store.get_setting::<Value>("layout").await.unwrap(),
            json!({ "left": { "open": true, "width": 320 }, "right": { "open": false } })
        );

        store.merge_settings("layout", json!(5)).await.unwrap();
        assert_eq!(store.get_setting::<Value>("layout").await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn nested_paths() {
        let (_dir, store) = store().await;
        store
            .set_nested_setting("dock", "panels.events.visible", json!(true))
            .await
            .unwrap();

        assert!(store
            .get_nested_setting::<bool>("dock", "panels.events.visible")
            .await
            .unwrap());
        assert!(matches!(
            store.get_nested_setting::<Value>("dock", "panels.chart").await,
            Err(SettingsError::InvalidPath(_))
        ));
        assert!(matches!(
            store
                .set_nested_setting("dock", "panels.events.visible.deeper", json!(1))
                .await,
            Err(SettingsError::InvalidPath(_))
        ));
        assert!(matches!(
            store.set_nested_setting("dock", "panels..x", json!(1)).await,
            Err(SettingsError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn failed_writes_leave_values_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let store = SettingsStore::open_in(&sub).await.unwrap();
        store.set_setting("theme", "dark").await.unwrap();
        store.set_setting("layout", &json!({ "left": 1 })).await.unwrap();

        std::fs::remove_dir_all(&sub).unwrap();
        std::fs::write(&sub, "not a directory").unwrap();

        assert!(store.set_setting("theme", "light").await.is_err());
        assert!(store.delete_setting("theme").await.is_err());
        assert!(store.merge_settings("layout", json!({ "right": 2 })).await.is_err());
        assert!(store
            .set_nested_setting("layout", "left", json!(3))
            .await
            .is_err());
        assert!(store
            .set_nested_setting("fresh", "a.b", json!(true))
            .await
            .is_err());
        assert!(store.clear_settings().await.is_err());

        assert_eq!(store.get_setting::<String>("theme").await.unwrap(), "dark");
        assert_eq!(
            store.get_setting::<Value>("layout").await.unwrap(),
            json!({ "left": 1 })
        );
        assert!(!store.setting_exists("fresh").await);
        assert_eq!(store.count_settings().await, 2);
    }
}
