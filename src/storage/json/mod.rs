//! JSON flat-file backend.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   global.lock               (optional) blocks every lock acquisition
//!   meta/meta.json            {version, create_date, last_update}
//!   tmp/                      staging area for atomic writes
//!   <collection>/<id>.json    one canonical record per file
//!   <collection>/_index.json  [{id, <indexed properties>}...]
//! ```
//!
//! Every mutation holds the collection's index lock (and the record lock when
//! the record already exists), so a record file and its index entry always
//! change within one lock scope. Writes go to `tmp/` first and are renamed into
//! place.

mod meta;

pub use meta::{InitCheck, JsonMigration, MIGRATIONS, StepFuture, init_checks, run_migrations_with};

use crate::config::BackendType;
use crate::models::{Metadata, Page};
use crate::observability::{EventBus, Notification};
use crate::storage::lock::{INDEX_ID, LockManager, Resource, is_safe_id};
use crate::storage::paging::paginate;
use crate::storage::query::{Query, SortOrder, compare_values};
use crate::storage::record::{self, Row};
use crate::storage::schema::{EntityKind, ResolvedField};
use crate::storage::traits::{NotificationCallback, StorageBackend};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "_index.json";
const META_DIR: &str = "meta";
const META_FILE: &str = "meta.json";
const TMP_DIR: &str = "tmp";

/// A record selected by a query, with its full body once loaded.
struct Candidate {
    entry: Value,
    record: Option<Value>,
}

/// JSON flat-file storage backend.
#[derive(Clone)]
pub struct JsonBackend {
    root: PathBuf,
    locks: LockManager,
    events: EventBus,
}

impl JsonBackend {
    /// Creates a backend rooted at `root`. Nothing is touched until
    /// [`init`](StorageBackend::init).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            locks: LockManager::new(root.clone()),
            root,
            events: EventBus::default(),
        }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the lock manager of this store.
    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn collection_dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn index_path(&self, kind: EntityKind) -> PathBuf {
        self.collection_dir(kind).join(INDEX_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_DIR).join(META_FILE)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    fn record_path(&self, kind: EntityKind, id: &str) -> Result<PathBuf> {
        self.locks.data_path(&Resource::record(kind, id))
    }

    /// Reads and parses a JSON file; `None` if it does not exist.
    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::operation(
                    "json_read_file",
                    format!("{}: {e}", path.display()),
                ));
            },
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Error::operation("json_parse_file", format!("{}: {e}", path.display()))
        })
    }

    /// Writes a JSON file atomically through the staging directory.
    async fn write_json(&self, path: &Path, value: &impl Serialize) -> Result<()> {
        let contents =
            serde_json::to_vec_pretty(value).map_err(|e| Error::operation("json_serialize", e))?;

        let tmp_dir = self.tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| Error::operation("json_create_tmp_dir", e))?;
        let staged = tmp_dir.join(format!("{}.json", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&staged, contents)
            .await
            .map_err(|e| Error::operation("json_write_file", e))?;
        if let Err(e) = tokio::fs::rename(&staged, path).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(Error::operation(
                "json_rename_file",
                format!("{}: {e}", path.display()),
            ));
        }
        Ok(())
    }

    async fn remove_file(path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::operation(
                "json_remove_file",
                format!("{}: {e}", path.display()),
            )),
        }
    }

    async fn read_index(&self, kind: EntityKind) -> Result<Vec<Value>> {
        Ok(Self::read_json(&self.index_path(kind))
            .await?
            .unwrap_or_default())
    }

    async fn write_index(&self, kind: EntityKind, entries: &[Value]) -> Result<()> {
        self.write_json(&self.index_path(kind), &entries).await
    }

    /// Loads the record behind an index entry.
    async fn load_indexed(&self, kind: EntityKind, entry: &Value) -> Result<Value> {
        let id = record::record_id(entry)?;
        let path = self.record_path(kind, id)?;
        Self::read_json(&path).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "{kind} '{id}' is indexed but {} is missing",
                path.display()
            ))
        })
    }

    /// Lists the ids of all record files in a collection directory.
    pub(crate) async fn record_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.collection_dir(kind)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::operation("json_read_collection", e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::operation("json_read_collection", e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem != INDEX_ID {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Regenerates a collection's `_index.json` from its record files.
    pub(crate) async fn rebuild_index(&self, kind: EntityKind) -> Result<usize> {
        let schema = kind.schema();
        self.locks
            .with_lock(&Resource::index(kind), || async {
                let mut entries = Vec::new();
                for id in self.record_ids(kind).await? {
                    let path = self.record_path(kind, &id)?;
                    let Some(record) = Self::read_json::<Value>(&path).await? else {
                        continue;
                    };
                    entries.push(record::split(schema, &record)?.index_entry(schema));
                }
                self.write_index(kind, &entries).await?;
                Ok(entries.len())
            })
            .await
    }

    /// Overwrites a record file and its index entry without validation of
    /// existence. Callers hold the relevant locks.
    async fn write_record(&self, kind: EntityKind, row: Row) -> Result<()> {
        let schema = kind.schema();
        let entry = row.index_entry(schema);
        let id = row.id.clone();
        let record = record::merge(schema, row);

        self.write_json(&self.record_path(kind, &id)?, &record)
            .await?;

        let mut entries = self.read_index(kind).await?;
        match entries
            .iter_mut()
            .find(|e| e.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.write_index(kind, &entries).await
    }

    /// Writes store metadata under the meta lock.
    pub(crate) async fn write_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.locks
            .with_lock(&Resource::meta(), || async {
                self.write_json(&self.meta_path(), metadata).await
            })
            .await
    }

    /// Resolves the value a filter or ordering refers to.
    async fn field_value(
        &self,
        resolved: ResolvedField<'_>,
        candidate: &Candidate,
        joined: &mut HashMap<(EntityKind, String), Option<Value>>,
    ) -> Result<Option<Value>> {
        Ok(match resolved {
            ResolvedField::Id => candidate.entry.get("id").cloned(),
            ResolvedField::Property(p) => candidate.entry.get(p.field).cloned(),
            ResolvedField::Payload(key) => candidate
                .record
                .as_ref()
                .and_then(|r| r.get(key))
                .cloned(),
            ResolvedField::Joined(join) => {
                let Some(related_id) = candidate
                    .entry
                    .get(join.local_field)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    return Ok(None);
                };
                let key = (join.kind, related_id);
                if !joined.contains_key(&key) {
                    let related = self.get(join.kind, &key.1).await?;
                    joined.insert(key.clone(), related);
                }
                joined
                    .get(&key)
                    .and_then(Option::as_ref)
                    .and_then(|r| r.get(join.remote_key))
                    .cloned()
            },
        })
    }

    /// Evaluates filters and ordering; returns every match in order.
    async fn matching(&self, kind: EntityKind, query: &Query) -> Result<Vec<Candidate>> {
        let schema = kind.schema();
        let filters = query
            .filters
            .iter()
            .map(|f| schema.resolve(&f.field).map(|r| (f, r)))
            .collect::<Result<Vec<_>>>()?;
        let order = match &query.order_by {
            Some((field, order)) => Some((schema.resolve(field)?, *order)),
            None => None,
        };

        // Indexed properties are answered from `_index.json` alone.
        let needs_records = filters
            .iter()
            .map(|(_, r)| r)
            .chain(order.as_ref().map(|(r, _)| r))
            .any(|r| matches!(r, ResolvedField::Payload(_)));

        let mut candidates = Vec::new();
        for entry in self.read_index(kind).await? {
            let record = if needs_records {
                Some(self.load_indexed(kind, &entry).await?)
            } else {
                None
            };
            candidates.push(Candidate { entry, record });
        }

        let mut joined = HashMap::new();
        let mut selected = Vec::with_capacity(candidates.len());
        'candidates: for candidate in candidates {
            for (filter, resolved) in &filters {
                let value = self.field_value(*resolved, &candidate, &mut joined).await?;
                if !filter.matches(value.as_ref()) {
                    continue 'candidates;
                }
            }
            let sort_key = match &order {
                Some((resolved, _)) => self.field_value(*resolved, &candidate, &mut joined).await?,
                None => candidate.entry.get("id").cloned(),
            };
            selected.push((sort_key, candidate));
        }

        // Nulls first in either direction, then ids ascending on ties.
        let descending = matches!(order, Some((_, SortOrder::Desc)));
        selected.sort_by(|(a, x), (b, y)| {
            let a = a.as_ref().filter(|v| !v.is_null());
            let b = b.as_ref().filter(|v| !v.is_null());
            let by_key = match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) if descending => compare_values(Some(b), Some(a)),
                (Some(a), Some(b)) => compare_values(Some(a), Some(b)),
            };
            by_key.then_with(|| compare_values(x.entry.get("id"), y.entry.get("id")))
        });
        Ok(selected.into_iter().map(|(_, c)| c).collect())
    }
}

#[async_trait]
impl StorageBackend for JsonBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Json
    }

    async fn init(&self) -> Result<()> {
        for check in init_checks() {
            tracing::debug!(check = check.name, root = %self.root.display(), "Running init check");
            (check.run)(self).await?;
        }
        tracing::info!(root = %self.root.display(), "JSON store ready");
        Ok(())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Value>> {
        if !is_safe_id(id) {
            // An id that cannot be a filename cannot be stored either.
            return Ok(None);
        }
        Self::read_json(&self.record_path(kind, id)?).await
    }

    async fn upsert(&self, kind: EntityKind, record: Value) -> Result<()> {
        let row = record::split(kind.schema(), &record)?;
        let path = self.record_path(kind, &row.id)?;

        let mut resources = Vec::with_capacity(2);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            resources.push(Resource::record(kind, row.id.clone()));
        }
        resources.push(Resource::index(kind));

        let id = row.id.clone();
        self.locks
            .with_locked_list(&resources, || self.write_record(kind, row))
            .await?;
        tracing::debug!(kind = %kind, id = %id, "Saved record");
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let path = self.record_path(kind, id)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }

        let resources = [Resource::record(kind, id), Resource::index(kind)];
        self.locks
            .with_locked_list(&resources, || async {
                let mut entries = self.read_index(kind).await?;
                entries.retain(|e| e.get("id").and_then(Value::as_str) != Some(id));
                // The record lock guards the data file; remove it before the
                // index so a failure leaves at worst a stale index entry.
                Self::remove_file(&path).await?;
                self.write_index(kind, &entries).await
            })
            .await?;
        tracing::debug!(kind = %kind, id = %id, "Deleted record");
        Ok(true)
    }

    async fn delete_where(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        if query.filters.is_empty() {
            return Err(Error::Validation(format!(
                "refusing to delete all {kind} without a filter"
            )));
        }

        self.locks
            .with_lock(&Resource::index(kind), || async {
                let ids: Vec<String> = self
                    .matching(kind, &query.unpaged())
                    .await?
                    .iter()
                    .filter_map(|c| c.entry.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                if ids.is_empty() {
                    return Ok(0);
                }

                let resources: Vec<Resource> =
                    ids.iter().map(|id| Resource::record(kind, id)).collect();
                self.locks
                    .with_locked_list(&resources, || async {
                        for id in &ids {
                            Self::remove_file(&self.record_path(kind, id)?).await?;
                        }
                        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
                        let mut entries = self.read_index(kind).await?;
                        entries.retain(|e| {
                            e.get("id")
                                .and_then(Value::as_str)
                                .is_none_or(|id| !doomed.contains(id))
                        });
                        self.write_index(kind, &entries).await
                    })
                    .await?;
                tracing::debug!(kind = %kind, count = ids.len(), "Deleted matching records");
                Ok(ids.len())
            })
            .await
    }

    async fn index(&self, kind: EntityKind, query: &Query) -> Result<Page<Value>> {
        let matches = self.matching(kind, query).await?;
        let count = matches.len();

        let mut items = Vec::new();
        for candidate in paginate(matches, query.offset, query.limit) {
            let record = match candidate.record {
                Some(record) => record,
                None => self.load_indexed(kind, &candidate.entry).await?,
            };
            items.push(record);
        }

        Ok(Page {
            items,
            count,
            count_cached: false,
        })
    }

    async fn count(&self, kind: EntityKind, query: &Query) -> Result<usize> {
        Ok(self.matching(kind, &query.unpaged()).await?.len())
    }

    async fn metadata(&self) -> Result<Metadata> {
        Self::read_json(&self.meta_path()).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "store metadata {} (store not initialized)",
                self.meta_path().display()
            ))
        })
    }

    async fn wipe(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(Error::operation("json_wipe", e)),
        }
        tracing::info!(root = %self.root.display(), "Wiped JSON store");
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: &Value) -> Result<()> {
        self.events.publish(Notification {
            channel: channel.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str, callback: NotificationCallback) -> Result<()> {
        let mut receiver = self.events.subscribe(channel);
        tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                callback(payload);
            }
        });
        Ok(())
    }
}
