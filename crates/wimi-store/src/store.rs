use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;
use wimi_core::{WimiError, WimiResult};

/// Which record of a plan is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The workflow context snapshot.
    Status,
    /// Every approval request issued for the plan.
    Approvals,
}

impl RecordKind {
    fn file_name(self) -> &'static str {
        match self {
            RecordKind::Status => "status.json",
            RecordKind::Approvals => "approvals.json",
        }
    }
}

/// Key-value persistence keyed by plan id.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Read a record. `Ok(None)` if it was never written.
    async fn get(&self, plan_id: &str, kind: RecordKind) -> WimiResult<Option<serde_json::Value>>;
    /// Write (replace) a record.
    async fn set(&self, plan_id: &str, kind: RecordKind, value: serde_json::Value) -> WimiResult<()>;
    /// Remove every record of a plan.
    async fn delete(&self, plan_id: &str) -> WimiResult<()>;
    /// Plan ids with at least one record, sorted.
    async fn list(&self) -> WimiResult<Vec<String>>;
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryPlanStore {
    records: RwLock<HashMap<(String, RecordKind), serde_json::Value>>,
}

impl InMemoryPlanStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn get(&self, plan_id: &str, kind: RecordKind) -> WimiResult<Option<serde_json::Value>> {
        Ok(self
            .records
            .read()
            .await
            .get(&(plan_id.to_string(), kind))
            .cloned())
    }

    async fn set(&self, plan_id: &str, kind: RecordKind, value: serde_json::Value) -> WimiResult<()> {
        self.records
            .write()
            .await
            .insert((plan_id.to_string(), kind), value);
        Ok(())
    }

    async fn delete(&self, plan_id: &str) -> WimiResult<()> {
        self.records.write().await.retain(|(id, _), _| id != plan_id);
        Ok(())
    }

    async fn list(&self) -> WimiResult<Vec<String>> {
        let ids: BTreeSet<String> = self
            .records
            .read()
            .await
            .keys()
            .map(|(id, _)| id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }
}

/// File-based store: `<dir>/<plan_id>/status.json` and `approvals.json`.
pub struct FilePlanStore {
    dir: PathBuf,
}

impl FilePlanStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(dir: PathBuf) -> WimiResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn plan_dir(&self, plan_id: &str) -> WimiResult<PathBuf> {
        if plan_id.is_empty()
            || !plan_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(WimiError::Store(format!("invalid plan id '{plan_id}'")));
        }
        Ok(self.dir.join(plan_id))
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn get(&self, plan_id: &str, kind: RecordKind) -> WimiResult<Option<serde_json::Value>> {
        let path = self.plan_dir(plan_id)?.join(kind.file_name());
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&data).map_err(|e| {
            WimiError::Store(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    async fn set(&self, plan_id: &str, kind: RecordKind, value: serde_json::Value) -> WimiResult<()> {
        let dir = self.plan_dir(plan_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(kind.file_name());
        let tmp = dir.join(format!("{}.tmp", kind.file_name()));
        let json = serde_json::to_string_pretty(&value)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(plan_id = %plan_id, kind = ?kind, "Plan record written");
        Ok(())
    }

    async fn delete(&self, plan_id: &str) -> WimiResult<()> {
        let dir = self.plan_dir(plan_id)?;
        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn list(&self) -> WimiResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_get_set() {
        let store = InMemoryPlanStore::new();
        assert!(store.get("plan_1", RecordKind::Status).await.unwrap().is_none());

        store
            .set("plan_1", RecordKind::Status, json!({"status": "created"}))
            .await
            .unwrap();
        store
            .set("plan_1", RecordKind::Approvals, json!([]))
            .await
            .unwrap();
        store
            .set("plan_2", RecordKind::Status, json!({"status": "failed"}))
            .await
            .unwrap();

        let value = store.get("plan_1", RecordKind::Status).await.unwrap().unwrap();
        assert_eq!(value["status"], "created");
        assert_eq!(store.list().await.unwrap(), vec!["plan_1", "plan_2"]);

        store.delete("plan_1").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["plan_2"]);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(tmp.path().join("plans")).await.unwrap();

        store
            .set("plan_abc", RecordKind::Status, json!({"status": "executing", "step": 2}))
            .await
            .unwrap();
        store
            .set("plan_abc", RecordKind::Status, json!({"status": "completed", "step": 4}))
            .await
            .unwrap();

        let value = store.get("plan_abc", RecordKind::Status).await.unwrap().unwrap();
        assert_eq!(value["status"], "completed");
        assert!(store.get("plan_abc", RecordKind::Approvals).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap(), vec!["plan_abc"]);

        store.delete("plan_abc").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(tmp.path().to_path_buf()).await.unwrap();
        let err = store
            .set("../escape", RecordKind::Status, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WimiError::Store(_)));
    }
}
