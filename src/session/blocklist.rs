use crate::error::AppError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument, warn};

/// Where the blocklist lives between restarts.
#[async_trait]
pub trait BlocklistBackend: Send + Sync + std::fmt::Debug {
    /// Returns the stored set, or `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<Vec<String>>, AppError>;
    async fn save(&self, names: &[String]) -> Result<(), AppError>;
}

/// Keeps the blocklist for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryBackend;

#[async_trait]
impl BlocklistBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<Vec<String>>, AppError> {
        Ok(None)
    }

    async fn save(&self, _names: &[String]) -> Result<(), AppError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlocklistFile {
    blocked_commands: Vec<String>,
}

/// Persists the blocklist as `{"blockedCommands": [...]}`.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BlocklistBackend for JsonFileBackend {
    async fn load(&self) -> Result<Option<Vec<String>>, AppError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let file: BlocklistFile = serde_json::from_slice(&bytes).map_err(|e| {
                    AppError::Persistence(format!("Invalid blocklist file {}: {}", self.path.display(), e))
                })?;
                Ok(Some(file.blocked_commands))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Persistence(format!(
                "Failed to read blocklist file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, names: &[String]) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&BlocklistFile {
            blocked_commands: names.to_vec(),
        })?;
        // Write-then-rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::Persistence(format!("Failed to replace blocklist file {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), count = names.len(), "Blocklist persisted");
        Ok(())
    }
}

fn env_assignment() -> &'static Regex {
    static ENV_ASSIGNMENT: OnceLock<Regex> = OnceLock::new();
    ENV_ASSIGNMENT.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("env assignment pattern is valid")
    })
}

/// The command name a blocklist entry is matched against: the first
/// whitespace-delimited word, skipping leading `NAME=value` assignments.
pub fn command_token(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| !env_assignment().is_match(word))
}

/// Process-wide set of command names whose execution is refused.
#[derive(Debug)]
pub struct BlocklistStore {
    names: StdRwLock<HashSet<String>>,
    backend: Arc<dyn BlocklistBackend>,
    persist_lock: TokioMutex<()>,
}

impl BlocklistStore {
    /// Loads the stored set from `backend`; when nothing is stored yet, seeds it
    /// with `initial` and writes that back.
    pub async fn open(backend: Arc<dyn BlocklistBackend>, initial: &[String]) -> Result<Self, AppError> {
        let (names, seeded) = match backend.load().await? {
            Some(stored) => (stored, false),
            None => (initial.to_vec(), true),
        };
        let names: HashSet<String> = names
            .iter()
            .filter_map(|name| command_token(name).map(String::from))
            .collect();

        let store = Self {
            names: StdRwLock::new(names),
            backend,
            persist_lock: TokioMutex::new(()),
        };
        if seeded {
            store.persist().await?;
        }
        info!(count = store.list().len(), "Blocklist loaded");
        Ok(store)
    }

    pub fn in_memory(initial: &[String]) -> Self {
        Self {
            names: StdRwLock::new(
                initial
                    .iter()
                    .filter_map(|name| command_token(name).map(String::from))
                    .collect(),
            ),
            backend: Arc::new(MemoryBackend),
            persist_lock: TokioMutex::new(()),
        }
    }

    fn normalize(name: &str) -> Result<String, AppError> {
        command_token(name)
            .map(String::from)
            .ok_or_else(|| AppError::InvalidArgument("command name must not be empty".to_string()))
    }

    #[instrument(skip(self))]
    pub async fn block(&self, name: &str) -> Result<String, AppError> {
        let token = Self::normalize(name)?;
        if self.commit(|names| names.insert(token.clone())).await? {
            info!(command = %token, "Command blocked");
        }
        Ok(token)
    }

    #[instrument(skip(self))]
    pub async fn unblock(&self, name: &str) -> Result<String, AppError> {
        let token = Self::normalize(name)?;
        if self.commit(|names| names.remove(&token)).await? {
            info!(command = %token, "Command unblocked");
        }
        Ok(token)
    }

    /// Exact-match lookup of a single command name.
    pub fn is_blocked(&self, name: &str) -> bool {
        self.read_names(|names| names.contains(name))
    }

    /// Checks the token of a full command line. A path-qualified token
    /// (`/bin/rm`) is also checked by its final component.
    pub fn blocked_token<'a>(&self, command: &'a str) -> Option<&'a str> {
        let token = command_token(command)?;
        let base = Path::new(token)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(token);
        self.read_names(|names| names.contains(token) || names.contains(base))
            .then_some(token)
    }

    /// Sorted snapshot; later mutations do not affect it.
    pub fn list(&self) -> Vec<String> {
        let set: BTreeSet<String> = self.read_names(|names| names.iter().cloned().collect());
        set.into_iter().collect()
    }

    fn read_names<R>(&self, f: impl FnOnce(&HashSet<String>) -> R) -> R {
        match self.names.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_names<R>(&self, f: impl FnOnce(&mut HashSet<String>) -> R) -> R {
        match self.names.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Applies `change` to a copy of the set, saves the copy and only then
    /// makes it live. A failed save leaves the active set untouched. Returns
    /// whether the set changed.
    async fn commit(&self, change: impl FnOnce(&mut HashSet<String>) -> bool) -> Result<bool, AppError> {
        let _guard = self.persist_lock.lock().await;
        let mut candidate = self.read_names(|names| names.clone());
        if !change(&mut candidate) {
            return Ok(false);
        }
        let sorted: BTreeSet<&String> = candidate.iter().collect();
        let snapshot: Vec<String> = sorted.into_iter().cloned().collect();
        if let Err(e) = self.backend.save(&snapshot).await {
            warn!(error = %e, "Failed to persist blocklist, change discarded");
            return Err(e);
        }
        self.write_names(|names| *names = candidate);
        Ok(true)
    }

    async fn persist(&self) -> Result<(), AppError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.list();
        if let Err(e) = self.backend.save(&snapshot).await {
            warn!(error = %e, "Failed to persist blocklist");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_token() {
        assert_eq!(command_token("rm -rf /tmp/x"), Some("rm"));
        assert_eq!(command_token("   ls"), Some("ls"));
        assert_eq!(command_token("FOO=1 BAR=baz rm -rf /"), Some("rm"));
        assert_eq!(command_token("echo a=b"), Some("echo"));
        assert_eq!(command_token("   "), None);
    }

    #[tokio::test]
    async fn test_block_unblock_are_idempotent() {
        let store = BlocklistStore::in_memory(&[]);
        assert_eq!(store.block("rm").await.unwrap(), "rm");
        store.block("rm").await.unwrap();
        assert_eq!(store.list(), names(&["rm"]));

        store.unblock("rm").await.unwrap();
        store.unblock("rm").await.unwrap();
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_block_reduces_command_line_to_token() {
        let store = BlocklistStore::in_memory(&[]);
        assert_eq!(store.block("curl -s http://example.com").await.unwrap(), "curl");
        assert!(store.is_blocked("curl"));
        assert!(matches!(store.block("  ").await.unwrap_err(), AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_matching_is_exact_not_substring() {
        let store = BlocklistStore::in_memory(&names(&["rm"]));
        assert_eq!(store.blocked_token("rm -rf /tmp/x"), Some("rm"));
        assert_eq!(store.blocked_token("/bin/rm -rf /tmp/x"), Some("/bin/rm"));
        assert_eq!(store.blocked_token("FOO=bar rm x"), Some("rm"));
        assert_eq!(store.blocked_token("rmdir foo"), None);
        assert_eq!(store.blocked_token("echo rm"), None);
        assert!(!store.is_blocked("r"));
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let store = BlocklistStore::in_memory(&names(&["b", "a"]));
        let snapshot = store.list();
        store.block("c").await.unwrap();
        assert_eq!(snapshot, names(&["a", "b"]));
        assert_eq!(store.list(), names(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_json_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("blocklist.json");

        let store = BlocklistStore::open(Arc::new(JsonFileBackend::new(&path)), &names(&["sudo"]))
            .await
            .unwrap();
        assert!(path.exists(), "seeded blocklist should be written");
        store.block("curl").await.unwrap();
        store.unblock("sudo").await.unwrap();
        drop(store);

        // Stored contents win over the initial seed on reopen.
        let reopened = BlocklistStore::open(Arc::new(JsonFileBackend::new(&path)), &names(&["dd"]))
            .await
            .unwrap();
        assert_eq!(reopened.list(), names(&["curl"]));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.json");
        std::fs::write(&path, "not json").unwrap();
        let err = BlocklistStore::open(Arc::new(JsonFileBackend::new(&path)), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
    }

    #[derive(Debug)]
    struct ReadOnlyBackend;

    #[async_trait]
    impl BlocklistBackend for ReadOnlyBackend {
        async fn load(&self) -> Result<Option<Vec<String>>, AppError> {
            Ok(Some(names(&["sudo"])))
        }

        async fn save(&self, _names: &[String]) -> Result<(), AppError> {
            Err(AppError::Persistence("read-only storage".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_save_leaves_set_unchanged() {
        let store = BlocklistStore::open(Arc::new(ReadOnlyBackend), &[]).await.unwrap();

        let err = store.unblock("sudo").await.unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert!(store.is_blocked("sudo"));

        let err = store.block("curl").await.unwrap_err();
        assert!(matches!(err, AppError::Persistence(_)));
        assert!(!store.is_blocked("curl"));
        assert_eq!(store.list(), names(&["sudo"]));

        // No-op changes never touch storage.
        store.block("sudo").await.unwrap();
        store.unblock("curl").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_mutations_all_land() {
        let store = Arc::new(BlocklistStore::in_memory(&[]));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.block(&format!("cmd{i}")).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.list().len(), 16);
    }
}
