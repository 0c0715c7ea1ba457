//! GroupRepository — read/write-through cache for the root application tree.
//!
//! The repository keeps a single shared future holding the current root
//! group. Reads await it; writes atomically swap in a fresh promise before
//! touching the store and complete it with the new group on success, or
//! from the previous future on failure (revert). The mutex guards only the
//! pointer swap and is never held across an await, so readers never block
//! on store I/O they did not ask for.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use berth_core::{AppId, Group, RunSpec, Timestamp};

use crate::error::{StoreError, StoreResult};
use crate::store::{PersistentStore, StoredGroup};

/// Invoked with the new root before anything is persisted; an error aborts
/// the write.
pub type PreStoreHook = Box<dyn Fn(&Group) -> StoreResult<()> + Send + Sync>;

type RootShared = Shared<BoxFuture<'static, Result<Group, Arc<StoreError>>>>;

/// Versioned repository for the root group and its apps.
pub struct GroupRepository {
    store: PersistentStore,
    root: Mutex<Option<RootShared>>,
    pre_store: Option<PreStoreHook>,
}

impl GroupRepository {
    pub fn new(store: PersistentStore) -> Self {
        GroupRepository {
            store,
            root: Mutex::new(None),
            pre_store: None,
        }
    }

    pub fn with_pre_store_hook(mut self, hook: PreStoreHook) -> Self {
        self.pre_store = Some(hook);
        self
    }

    /// The current root group.
    ///
    /// Served from the cache when it holds a successful value or an
    /// in-progress load; a failed or absent cache entry triggers a fresh
    /// fetch from the store.
    pub async fn root(&self) -> Result<Group, Arc<StoreError>> {
        let shared = {
            let mut cell = self.root.lock().unwrap();
            match cell.as_ref() {
                Some(shared) if !matches!(shared.peek(), Some(Err(_))) => shared.clone(),
                _ => {
                    let store = self.store.clone();
                    let fresh: RootShared = async move {
                        load_root(store).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *cell = Some(fresh.clone());
                    fresh
                }
            }
        };
        shared.await
    }

    /// A historic root group, resolved against its referenced app versions.
    pub async fn root_version(&self, version: &Timestamp) -> StoreResult<Option<Group>> {
        match self.store.root_version(version)? {
            Some(stored) => Ok(Some(stored.resolve(&self.store).await?)),
            None => Ok(None),
        }
    }

    /// Persist a new root group atomically with its changed apps.
    ///
    /// Readers started after this call observe the new group (or the old
    /// one again if the write fails); they never observe a half-written
    /// tree. App deletions are best-effort.
    pub async fn store_root(
        &self,
        group: Group,
        updated_apps: Vec<RunSpec>,
        deleted_apps: Vec<AppId>,
    ) -> StoreResult<()> {
        if let Some(hook) = &self.pre_store {
            hook(&group)?;
        }

        // Swap in an uncompleted promise, remembering the old future.
        let (tx, rx) = oneshot::channel::<Result<Group, Arc<StoreError>>>();
        let pending: RootShared = async move {
            rx.await.unwrap_or_else(|_| {
                Err(Arc::new(StoreError::Internal(
                    "root promise dropped".to_string(),
                )))
            })
        }
        .boxed()
        .shared();
        let previous = {
            let mut cell = self.root.lock().unwrap();
            cell.replace(pending)
        };

        let result = self.persist(&group, &updated_apps, &deleted_apps);

        match result {
            Ok(()) => {
                debug!(version = %group.version, "root group stored");
                let _ = tx.send(Ok(group));
                Ok(())
            }
            Err(e) => {
                // Revert: complete the promise from the previous value so
                // readers see the pre-write root again.
                let prior = match previous {
                    Some(shared) => shared.await,
                    None => load_root(self.store.clone()).await.map_err(Arc::new),
                };
                let _ = tx.send(prior);
                Err(e)
            }
        }
    }

    fn persist(
        &self,
        group: &Group,
        updated_apps: &[RunSpec],
        deleted_apps: &[AppId],
    ) -> StoreResult<()> {
        for app in updated_apps {
            self.store.store_app(app)?;
        }
        for id in deleted_apps {
            if let Err(e) = self.store.delete_current_app(id) {
                warn!(app_id = %id, error = %e, "failed to delete app, continuing");
            }
        }
        self.store.store_root(&StoredGroup::from_group(group))
    }

    // ── App reads and writes ───────────────────────────────────────

    pub fn get(&self, app_id: &AppId) -> StoreResult<Option<RunSpec>> {
        self.store.app(app_id)
    }

    pub fn get_version(&self, app_id: &AppId, version: &Timestamp) -> StoreResult<Option<RunSpec>> {
        self.store.app_version(app_id, version)
    }

    pub fn store_app(&self, spec: &RunSpec) -> StoreResult<()> {
        self.store.store_app(spec)
    }

    pub fn delete_current(&self, app_id: &AppId) -> StoreResult<bool> {
        self.store.delete_current_app(app_id)
    }

    /// All app ids with a current definition.
    pub fn ids(&self) -> StoreResult<Vec<AppId>> {
        self.store.app_ids()
    }
}

/// Load the current root from the store, resolving referenced apps. A store
/// without a root yet yields an empty root group.
async fn load_root(store: PersistentStore) -> StoreResult<Group> {
    match store.root()? {
        Some(stored) => stored.resolve(&store).await,
        None => Ok(Group::empty_root(Timestamp::at_millis(0))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::VersionInfo;

    fn repo() -> GroupRepository {
        GroupRepository::new(PersistentStore::open_in_memory().unwrap())
    }

    fn spec(id: &str, millis: i64) -> RunSpec {
        let mut spec = RunSpec::new(AppId::parse(id).unwrap(), 2);
        spec.version_info = VersionInfo::for_new_config(Timestamp::at_millis(millis));
        spec
    }

    fn group_with(apps: Vec<RunSpec>, millis: i64) -> Group {
        let mut group = Group::empty_root(Timestamp::at_millis(millis));
        for app in apps {
            group.put_app(app);
        }
        group
    }

    #[tokio::test]
    async fn empty_store_yields_empty_root() {
        let repo = repo();
        let root = repo.root().await.unwrap();
        assert!(root.apps.is_empty());
        assert!(root.groups.is_empty());
    }

    #[tokio::test]
    async fn read_after_write_for_root() {
        let repo = repo();
        let app = spec("/web", 1000);
        let group = group_with(vec![app.clone()], 1000);

        repo.store_root(group.clone(), vec![app.clone()], vec![])
            .await
            .unwrap();

        let root = repo.root().await.unwrap();
        assert_eq!(root, group);

        // And again, served from the cache.
        let again = repo.root().await.unwrap();
        assert_eq!(again, group);
    }

    #[tokio::test]
    async fn rejected_hook_leaves_cache_untouched() {
        let repo = repo().with_pre_store_hook(Box::new(|_| {
            Err(StoreError::HookRejected("no writes today".to_string()))
        }));

        let before = repo.root().await.unwrap();
        let app = spec("/web", 1000);
        let result = repo
            .store_root(group_with(vec![app.clone()], 1000), vec![app], vec![])
            .await;
        assert!(matches!(result, Err(StoreError::HookRejected(_))));

        let after = repo.root().await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn successive_writes_win_in_order() {
        let repo = repo();
        let v1 = spec("/web", 1000);
        let v2 = spec("/web", 2000);

        repo.store_root(group_with(vec![v1.clone()], 1000), vec![v1], vec![])
            .await
            .unwrap();
        repo.store_root(group_with(vec![v2.clone()], 2000), vec![v2.clone()], vec![])
            .await
            .unwrap();

        let root = repo.root().await.unwrap();
        assert_eq!(root.version, Timestamp::at_millis(2000));
        assert_eq!(root.app(&v2.id).unwrap().version(), Timestamp::at_millis(2000));
    }

    #[tokio::test]
    async fn deleted_apps_leave_the_tree() {
        let repo = repo();
        let web = spec("/web", 1000);
        let old = spec("/old", 1000);
        repo.store_root(
            group_with(vec![web.clone(), old.clone()], 1000),
            vec![web.clone(), old.clone()],
            vec![],
        )
        .await
        .unwrap();

        repo.store_root(
            group_with(vec![web.clone()], 2000),
            vec![],
            vec![old.id.clone()],
        )
        .await
        .unwrap();

        let root = repo.root().await.unwrap();
        assert!(root.app(&old.id).is_none());
        assert!(repo.get(&old.id).unwrap().is_none());
        // Historic versions survive current deletion.
        assert!(repo
            .get_version(&old.id, &Timestamp::at_millis(1000))
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn historic_roots_resolve() {
        let repo = repo();
        let v1 = spec("/web", 1000);
        repo.store_root(group_with(vec![v1.clone()], 1000), vec![v1.clone()], vec![])
            .await
            .unwrap();
        let v2 = spec("/web", 2000);
        repo.store_root(group_with(vec![v2.clone()], 2000), vec![v2], vec![])
            .await
            .unwrap();

        let historic = repo
            .root_version(&Timestamp::at_millis(1000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(historic.app(&v1.id).unwrap().version(), Timestamp::at_millis(1000));
    }

    #[tokio::test]
    async fn ids_lists_current_apps() {
        let repo = repo();
        let web = spec("/web", 1000);
        let db = spec("/db", 1000);
        repo.store_root(
            group_with(vec![web.clone(), db.clone()], 1000),
            vec![web, db],
            vec![],
        )
        .await
        .unwrap();

        let mut ids: Vec<String> = repo.ids().unwrap().iter().map(|id| id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["/db", "/web"]);
    }
}
