//! PersistentStore — redb-backed versioned entity storage.
//!
//! Entities are addressed by `(kind, path, version)`. Every kind has a
//! current row per path; versioned kinds additionally keep one row per
//! version, keyed `{path}@{rfc3339}`. Values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing). Read-after-write holds per
//! key; cross-key atomicity is not offered.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use berth_core::{AppId, DeploymentPlan, Group, RunSpec, Timestamp};

use crate::error::{StoreError, StoreResult};
use crate::tables::{APPS, APP_VERSIONS, PLANS, ROOT, ROOT_VERSIONS};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// The entity kinds the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    App,
    RootGroup,
    Plan,
}

impl EntityKind {
    fn current_table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            EntityKind::App => APPS,
            EntityKind::RootGroup => ROOT,
            EntityKind::Plan => PLANS,
        }
    }

    fn versions_table(
        self,
    ) -> Option<TableDefinition<'static, &'static str, &'static [u8]>> {
        match self {
            EntityKind::App => Some(APP_VERSIONS),
            EntityKind::RootGroup => Some(ROOT_VERSIONS),
            EntityKind::Plan => None,
        }
    }
}

/// A group as persisted: apps are stored by reference `(id, version)` and
/// resolved on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGroup {
    pub id: AppId,
    pub app_refs: BTreeMap<AppId, Timestamp>,
    pub groups: Vec<StoredGroup>,
    pub dependencies: Vec<AppId>,
    pub version: Timestamp,
}

impl StoredGroup {
    pub fn from_group(group: &Group) -> StoredGroup {
        StoredGroup {
            id: group.id.clone(),
            app_refs: group
                .apps
                .iter()
                .map(|(id, spec)| (id.clone(), spec.version()))
                .collect(),
            groups: group.groups.values().map(StoredGroup::from_group).collect(),
            dependencies: group.dependencies.clone(),
            version: group.version,
        }
    }

    /// Resolve app references concurrently. Apps that fail to load are
    /// omitted with a warning; the resolved group keeps the stored version
    /// stamp.
    pub async fn resolve(&self, store: &PersistentStore) -> StoreResult<Group> {
        let fetches = self.app_refs.iter().map(|(id, version)| {
            let store = store.clone();
            let id = id.clone();
            let version = *version;
            async move { (id.clone(), store.app_version(&id, &version)) }
        });
        let fetched = futures::future::join_all(fetches).await;

        let mut apps = BTreeMap::new();
        for (id, result) in fetched {
            match result {
                Ok(Some(spec)) => {
                    apps.insert(id, spec);
                }
                Ok(None) => {
                    warn!(app_id = %id, "referenced app version missing, omitting");
                }
                Err(e) => {
                    warn!(app_id = %id, error = %e, "failed to load app, omitting");
                }
            }
        }

        let mut groups = BTreeMap::new();
        for stored in &self.groups {
            let resolved = Box::pin(stored.resolve(store)).await?;
            groups.insert(resolved.id.clone(), resolved);
        }

        Ok(Group {
            id: self.id.clone(),
            apps,
            groups,
            dependencies: self.dependencies.clone(),
            version: self.version,
        })
    }
}

/// Thread-safe versioned store backed by redb.
#[derive(Clone)]
pub struct PersistentStore {
    db: Arc<Database>,
}

impl PersistentStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "persistent store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory persistent store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(APP_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(ROOT).map_err(map_err!(Table))?;
        txn.open_table(ROOT_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic (kind, path, version) surface ──────────────────────

    fn version_key(path: &str, version: &Timestamp) -> String {
        format!("{path}@{}", version.as_rfc3339())
    }

    /// Store the current row and, for versioned kinds, the version row.
    pub fn put(
        &self,
        kind: EntityKind,
        path: &str,
        version: Option<&Timestamp>,
        value: &[u8],
    ) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(kind.current_table())
                .map_err(map_err!(Table))?;
            table.insert(path, value).map_err(map_err!(Write))?;
        }
        if let (Some(def), Some(version)) = (kind.versions_table(), version) {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(Self::version_key(path, version).as_str(), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(?kind, %path, "entity stored");
        Ok(())
    }

    pub fn get(&self, kind: EntityKind, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(kind.current_table())
            .map_err(map_err!(Table))?;
        Ok(table
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    pub fn get_version(
        &self,
        kind: EntityKind,
        path: &str,
        version: &Timestamp,
    ) -> StoreResult<Option<Vec<u8>>> {
        let def = match kind.versions_table() {
            Some(def) => def,
            None => return Ok(None),
        };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(table
            .get(Self::version_key(path, version).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Remove the current row; version rows are kept. Returns true if it
    /// existed.
    pub fn delete_current(&self, kind: EntityKind, path: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn
                .open_table(kind.current_table())
                .map_err(map_err!(Table))?;
            existed = table.remove(path).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn delete_version(
        &self,
        kind: EntityKind,
        path: &str,
        version: &Timestamp,
    ) -> StoreResult<bool> {
        let def = match kind.versions_table() {
            Some(def) => def,
            None => return Ok(false),
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table
                .remove(Self::version_key(path, version).as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All version stamps stored for a path, ascending.
    pub fn versions(&self, kind: EntityKind, path: &str) -> StoreResult<Vec<Timestamp>> {
        let def = match kind.versions_table() {
            Some(def) => def,
            None => return Ok(Vec::new()),
        };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let prefix = format!("{path}@");
        let mut versions = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value().to_string();
            if let Some(stamp) = key.strip_prefix(&prefix) {
                if let Ok(ts) = Timestamp::parse(stamp) {
                    versions.push(ts);
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// All current paths of a kind.
    pub fn ids(&self, kind: EntityKind) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(kind.current_table())
            .map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Store an app as the current definition and under its version stamp.
    pub fn store_app(&self, spec: &RunSpec) -> StoreResult<()> {
        let value = serde_json::to_vec(spec).map_err(map_err!(Serialize))?;
        self.put(
            EntityKind::App,
            &spec.id.to_string(),
            Some(&spec.version()),
            &value,
        )
    }

    pub fn app(&self, id: &AppId) -> StoreResult<Option<RunSpec>> {
        self.get(EntityKind::App, &id.to_string())?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .transpose()
    }

    pub fn app_version(&self, id: &AppId, version: &Timestamp) -> StoreResult<Option<RunSpec>> {
        self.get_version(EntityKind::App, &id.to_string(), version)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .transpose()
    }

    pub fn app_versions(&self, id: &AppId) -> StoreResult<Vec<Timestamp>> {
        self.versions(EntityKind::App, &id.to_string())
    }

    pub fn delete_current_app(&self, id: &AppId) -> StoreResult<bool> {
        self.delete_current(EntityKind::App, &id.to_string())
    }

    pub fn app_ids(&self) -> StoreResult<Vec<AppId>> {
        let mut ids = Vec::new();
        for raw in self.ids(EntityKind::App)? {
            match AppId::parse(&raw) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(%raw, error = %e, "skipping unparseable app id"),
            }
        }
        Ok(ids)
    }

    // ── Root group ─────────────────────────────────────────────────

    pub fn store_root(&self, group: &StoredGroup) -> StoreResult<()> {
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        self.put(EntityKind::RootGroup, "/", Some(&group.version), &value)
    }

    pub fn root(&self) -> StoreResult<Option<StoredGroup>> {
        self.get(EntityKind::RootGroup, "/")?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .transpose()
    }

    pub fn root_version(&self, version: &Timestamp) -> StoreResult<Option<StoredGroup>> {
        self.get_version(EntityKind::RootGroup, "/", version)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .transpose()
    }

    // ── Deployment plans ───────────────────────────────────────────

    pub fn store_plan(&self, plan: &DeploymentPlan) -> StoreResult<()> {
        let value = serde_json::to_vec(plan).map_err(map_err!(Serialize))?;
        self.put(EntityKind::Plan, &plan.id, None, &value)
    }

    pub fn plans(&self) -> StoreResult<Vec<DeploymentPlan>> {
        let mut plans = Vec::new();
        for id in self.ids(EntityKind::Plan)? {
            if let Some(bytes) = self.get(EntityKind::Plan, &id)? {
                let plan: DeploymentPlan =
                    serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    pub fn delete_plan(&self, plan_id: &str) -> StoreResult<bool> {
        self.delete_current(EntityKind::Plan, plan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::VersionInfo;

    fn test_store() -> PersistentStore {
        PersistentStore::open_in_memory().unwrap()
    }

    fn spec(id: &str, millis: i64) -> RunSpec {
        let mut spec = RunSpec::new(AppId::parse(id).unwrap(), 2);
        spec.version_info = VersionInfo::for_new_config(Timestamp::at_millis(millis));
        spec
    }

    #[test]
    fn app_read_after_write() {
        let store = test_store();
        let app = spec("/web", 1000);
        store.store_app(&app).unwrap();

        assert_eq!(store.app(&app.id).unwrap().unwrap(), app);
        assert_eq!(store.app_ids().unwrap(), vec![app.id.clone()]);
    }

    #[test]
    fn versions_accumulate_and_sort() {
        let store = test_store();
        store.store_app(&spec("/web", 2000)).unwrap();
        store.store_app(&spec("/web", 1000)).unwrap();

        let id = AppId::parse("/web").unwrap();
        let versions = store.app_versions(&id).unwrap();
        assert_eq!(
            versions,
            vec![Timestamp::at_millis(1000), Timestamp::at_millis(2000)]
        );

        // The current row is the last write, not the newest version.
        assert_eq!(store.app(&id).unwrap().unwrap().version(), Timestamp::at_millis(1000));
        let old = store
            .app_version(&id, &Timestamp::at_millis(2000))
            .unwrap()
            .unwrap();
        assert_eq!(old.version(), Timestamp::at_millis(2000));
    }

    #[test]
    fn delete_current_keeps_versions() {
        let store = test_store();
        let app = spec("/web", 1000);
        store.store_app(&app).unwrap();

        assert!(store.delete_current_app(&app.id).unwrap());
        assert!(store.app(&app.id).unwrap().is_none());
        assert_eq!(store.app_versions(&app.id).unwrap().len(), 1);

        assert!(store
            .delete_version(EntityKind::App, "/web", &Timestamp::at_millis(1000))
            .unwrap());
        assert!(store.app_versions(&app.id).unwrap().is_empty());
    }

    #[test]
    fn plans_are_current_only() {
        let store = test_store();
        let plan = DeploymentPlan::compute(
            Group::empty_root(Timestamp::at_millis(0)),
            {
                let mut g = Group::empty_root(Timestamp::at_millis(1));
                g.put_app(spec("/web", 1000));
                g
            },
            Timestamp::at_millis(1),
        );
        store.store_plan(&plan).unwrap();

        let loaded = store.plans().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], plan);

        assert!(store.delete_plan(&plan.id).unwrap());
        assert!(store.plans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stored_group_resolves_referenced_versions() {
        let store = test_store();
        let app = spec("/prod/web", 1000);
        store.store_app(&app).unwrap();

        let mut group = Group::empty_root(Timestamp::at_millis(1));
        group.put_app(app.clone());
        let stored = StoredGroup::from_group(&group);
        store.store_root(&stored).unwrap();

        let resolved = store.root().unwrap().unwrap().resolve(&store).await.unwrap();
        assert_eq!(resolved.version, Timestamp::at_millis(1));
        assert_eq!(resolved.app(&app.id).unwrap(), &app);
    }

    #[tokio::test]
    async fn missing_app_is_omitted_with_warning() {
        let store = test_store();
        let mut group = Group::empty_root(Timestamp::at_millis(1));
        group.put_app(spec("/gone", 1000));
        store.store_root(&StoredGroup::from_group(&group)).unwrap();

        let resolved = store.root().unwrap().unwrap().resolve(&store).await.unwrap();
        assert!(resolved.apps.is_empty());
    }
}
