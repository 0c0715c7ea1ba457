//! redb table definitions for the Berth state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Current rows are keyed by path; version rows are keyed
//! `{path}@{rfc3339}`.

use redb::TableDefinition;

/// Current app definition per path.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Historic app definitions keyed by `{path}@{version}`.
pub const APP_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("app_versions");

/// The current stored root group (single row keyed `/`).
pub const ROOT: TableDefinition<&str, &[u8]> = TableDefinition::new("root_group");

/// Historic root groups keyed by `/@{version}`.
pub const ROOT_VERSIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("root_group_versions");

/// Deployment plans keyed by plan id; current-only, never versioned.
pub const PLANS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_plans");
