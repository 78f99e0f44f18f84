//! In-process relay for tests and embedding.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    normalize_object_path, split_prefix, Relay, RelayError, RelayOperation, RelayResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    faults: HashMap<RelayOperation, VecDeque<RelayError>>,
    calls: Vec<(RelayOperation, String)>,
}

/// Relay backed by a shared in-memory map.
///
/// Clones share the same objects, so one instance can stand in for the
/// cloud bucket seen by several devices.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: RelayOperation, error: RelayError) {
        self.state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Stored blob at `path`, if any.
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(path).cloned()
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Store a blob directly, bypassing fault injection.
    pub fn insert(&self, path: &str, blob: Vec<u8>) {
        self.state().objects.insert(path.to_string(), blob);
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<(RelayOperation, String)> {
        self.state().calls.clone()
    }

    fn begin(
        &self,
        operation: RelayOperation,
        path: &str,
    ) -> RelayResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        state.calls.push((operation, path.to_string()));
        if let Some(error) = state
            .faults
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        Ok(state)
    }
}

impl Relay for MemoryRelay {
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()> {
        let path = normalize_object_path(path)?;
        let mut state = self.begin(RelayOperation::Put, &path)?;
        state.objects.insert(path, blob);
        Ok(())
    }

    async fn get(&self, path: &str) -> RelayResult<Vec<u8>> {
        let path = normalize_object_path(path)?;
        let state = self.begin(RelayOperation::Get, &path)?;
        state
            .objects
            .get(&path)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(path.clone()))
    }

    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let (dir, name_prefix) = split_prefix(prefix);
        let state = self.begin(RelayOperation::List, prefix)?;
        let paths = state
            .objects
            .keys()
            .filter(|path| {
                let (parent, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                parent == dir && name.starts_with(name_prefix)
            })
            .cloned()
            .collect();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        let path = normalize_object_path(path)?;
        let mut state = self.begin(RelayOperation::Delete, &path)?;
        state.objects.remove(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let relay = MemoryRelay::new();
        relay.put("inbox/b-2.json", b"b".to_vec()).await.unwrap();
        relay.put("inbox/a-1.json", b"a".to_vec()).await.unwrap();
        relay.put("inbox/archive/c-3.json", b"c".to_vec()).await.unwrap();
        relay.put("master.json", b"m".to_vec()).await.unwrap();

        assert_eq!(relay.get("master.json").await.unwrap(), b"m");
        assert_eq!(
            relay.list("inbox/").await.unwrap(),
            vec!["inbox/a-1.json", "inbox/b-2.json"]
        );
        assert_eq!(relay.list("inbox/b").await.unwrap(), vec!["inbox/b-2.json"]);

        relay.delete("inbox/a-1.json").await.unwrap();
        relay.delete("inbox/a-1.json").await.unwrap();
        assert!(relay.get("inbox/a-1.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let relay = MemoryRelay::new();
        relay.fail_next(RelayOperation::Put, RelayError::Transient("offline".to_string()));

        assert!(matches!(
            relay.put("master.json", Vec::new()).await,
            Err(RelayError::Transient(_))
        ));
        assert!(relay.object("master.json").is_none());
        relay.put("master.json", Vec::new()).await.unwrap();
        assert_eq!(relay.paths(), vec!["master.json"]);
        assert_eq!(relay.calls().len(), 2);
    }

    #[tokio::test]
    async fn clones_share_objects() {
        let relay = MemoryRelay::new();
        let other = relay.clone();
        relay.put("pairing/active.txt", b"token".to_vec()).await.unwrap();
        assert_eq!(other.get("pairing/active.txt").await.unwrap(), b"token");
    }
}
