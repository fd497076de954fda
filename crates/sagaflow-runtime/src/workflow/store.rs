use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use sagaflow_core::workflow::RunStatus;
use sagaflow_core::{FlowError, Result};

use super::state::WorkflowRun;

/// Which runs [`RunStore::list`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub workflow: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<RunStatus>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Runs that have not reached a terminal state.
    pub fn incomplete() -> Self {
        Self {
            statuses: vec![
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Compensating,
            ],
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, run: &WorkflowRun) -> bool {
        let workflow_ok = self
            .workflow
            .as_deref()
            .map(|w| w == run.workflow_name)
            .unwrap_or(true);
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&run.status);
        workflow_ok && status_ok
    }

    /// Sort by creation time and apply the limit.
    fn finish(&self, mut runs: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            runs.truncate(limit);
        }
        runs
    }
}

/// Durable storage for workflow run records.
#[async_trait]
pub trait RunStore: Send + Sync + 'static {
    /// Persist a new run. Fails if the id already exists.
    async fn insert(&self, run: &WorkflowRun) -> Result<()>;

    /// Create or overwrite a run.
    async fn save(&self, run: &WorkflowRun) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>>;

    /// Runs matching `filter`, oldest first.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>>;

    /// Remove a run. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

fn duplicate(id: Uuid) -> FlowError {
    FlowError::InvalidState(format!("workflow run {} already exists", id))
}

/// Process-local store. Records live as long as the store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, WorkflowRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &WorkflowRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(duplicate(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let runs = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(filter.finish(runs))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.runs.write().await.remove(&id).is_some())
    }
}

/// One JSON document per run in a directory.
///
/// Writes go to a temporary file that is renamed over the record, so a
/// crash never leaves a half-written run behind.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Open a store, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_error("create run directory", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn write(&self, run: &WorkflowRun) -> Result<()> {
        let path = self.path(run.id);
        let tmp = self.dir.join(format!("{}.json.tmp", run.id));
        let bytes = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| store_error("write run", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_error("commit run", &path, e))?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<WorkflowRun>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                FlowError::Store(format!("corrupt run record {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_error("read run", path, e)),
        }
    }
}

fn store_error(action: &str, path: &Path, e: std::io::Error) -> FlowError {
    FlowError::Store(format!("Failed to {} at {}: {}", action, path.display(), e))
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, run: &WorkflowRun) -> Result<()> {
        let path = self.path(run.id);
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| store_error("check run", &path, e))?;
        if exists {
            return Err(duplicate(run.id));
        }
        self.write(run).await
    }

    async fn save(&self, run: &WorkflowRun) -> Result<()> {
        self.write(run).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        self.read(&self.path(id)).await
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| store_error("list runs", &self.dir, e))?;

        let mut runs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_error("list runs", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(run)) if filter.matches(&run) => runs.push(run),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable run record");
                }
            }
        }
        Ok(filter.finish(runs))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let path = self.path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_error("delete run", &path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn run(workflow: &str) -> WorkflowRun {
        WorkflowRun::new(Uuid::new_v4(), workflow, 1, json!({}), Map::new())
    }

    async fn exercise(store: &dyn RunStore) {
        let mut a = run("alpha");
        let b = run("beta");
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let err = store.insert(&a).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidState(_)));

        a.start().unwrap();
        store.save(&a).await.unwrap();
        let loaded = store.load(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);

        let running = store
            .list(&RunFilter::all().with_status(RunStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let incomplete = store.list(&RunFilter::incomplete()).await.unwrap();
        assert_eq!(incomplete.len(), 2);

        let beta = store
            .list(&RunFilter::all().with_workflow("beta"))
            .await
            .unwrap();
        assert_eq!(beta.len(), 1);
        assert_eq!(store.list(&RunFilter::all().with_limit(1)).await.unwrap().len(), 1);

        assert!(store.delete(b.id).await.unwrap());
        assert!(!store.delete(b.id).await.unwrap());
        assert!(store.load(b.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryRunStore::new();
        exercise(&store).await;
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path().join("runs")).await.unwrap();
        exercise(&store).await;

        let files: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileRunStore::open(dir.path()).await.unwrap();
        let run = run("alpha");
        first.insert(&run).await.unwrap();

        let second = FileRunStore::open(dir.path()).await.unwrap();
        assert_eq!(second.load(run.id).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        store.insert(&run("alpha")).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        assert_eq!(store.list(&RunFilter::all()).await.unwrap().len(), 1);
    }
}
