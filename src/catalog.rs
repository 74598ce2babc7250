use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactKind, ResourceId, Visibility};
use crate::error::DepotError;
use crate::store;

/// Authority under which catalog calls are made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogContext {
    pub user: String,
    pub ignore_auth: bool,
}

/// Elevated context used by background jobs and sweeps.
pub fn admin_context() -> CatalogContext {
    CatalogContext {
        user: "default".to_string(),
        ignore_auth: true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Owning organization (circle); selects the object-store bucket.
    pub owner_org: String,
    #[serde(default)]
    pub creator_user: Option<String>,
    #[serde(default)]
    pub private: bool,
}

impl DatasetRecord {
    pub fn visibility(&self) -> Visibility {
        Visibility::for_dataset(self.private)
    }
}

/// Where an artifact lives in the object store, if anywhere yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_available: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub package_id: String,
    pub name: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub artifacts: BTreeMap<ArtifactKind, ArtifactLocation>,
}

impl ResourceRecord {
    pub fn new(id: ResourceId, package_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            package_id: package_id.into(),
            name: name.into(),
            sha256: None,
            size: None,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn is_remote_available(&self, kind: ArtifactKind) -> bool {
        self.artifacts
            .get(&kind)
            .and_then(|location| location.s3_available)
            .unwrap_or(false)
    }

    pub fn s3_url(&self, kind: ArtifactKind) -> Option<&str> {
        self.artifacts
            .get(&kind)
            .and_then(|location| location.s3_url.as_deref())
    }
}

/// Partial update of a resource. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourcePatch {
    pub sha256: Option<String>,
    pub artifacts: BTreeMap<ArtifactKind, ArtifactLocation>,
}

impl ResourcePatch {
    pub fn remote(kind: ArtifactKind, url: impl Into<String>) -> Self {
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            kind,
            ArtifactLocation {
                s3_available: Some(true),
                s3_url: Some(url.into()),
            },
        );
        Self {
            sha256: None,
            artifacts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sha256.is_none() && self.artifacts.is_empty()
    }
}

/// Dataset and resource records, backed by the web application's database
/// in production.
pub trait Catalog: Send + Sync {
    fn find_dataset(
        &self,
        ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<DatasetRecord>, DepotError>;
    fn find_resource(
        &self,
        ctx: &CatalogContext,
        id: &ResourceId,
    ) -> Result<Option<ResourceRecord>, DepotError>;
    fn list_datasets(&self, ctx: &CatalogContext) -> Result<Vec<DatasetRecord>, DepotError>;
    /// Resources of one dataset, or of all datasets when `dataset_id` is `None`.
    fn list_resources(
        &self,
        ctx: &CatalogContext,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, DepotError>;
    fn create_dataset(
        &self,
        ctx: &CatalogContext,
        record: DatasetRecord,
    ) -> Result<DatasetRecord, DepotError>;
    fn create_resource(
        &self,
        ctx: &CatalogContext,
        record: ResourceRecord,
    ) -> Result<ResourceRecord, DepotError>;
    fn patch_resource(
        &self,
        ctx: &CatalogContext,
        id: &ResourceId,
        patch: &ResourcePatch,
    ) -> Result<ResourceRecord, DepotError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    datasets: BTreeMap<String, DatasetRecord>,
    #[serde(default)]
    resources: BTreeMap<ResourceId, ResourceRecord>,
}

fn require_write(ctx: &CatalogContext) -> Result<(), DepotError> {
    if ctx.ignore_auth {
        Ok(())
    } else {
        Err(DepotError::Catalog(format!(
            "user '{}' is not allowed to modify the catalog",
            ctx.user
        )))
    }
}

impl CatalogData {
    fn list_resources(&self, dataset_id: Option<&str>) -> Vec<ResourceRecord> {
        self.resources
            .values()
            .filter(|record| dataset_id.is_none_or(|id| record.package_id == id))
            .cloned()
            .collect()
    }

    fn create_dataset(&mut self, record: DatasetRecord) -> Result<DatasetRecord, DepotError> {
        if self.datasets.contains_key(&record.id) {
            return Err(DepotError::Catalog(format!(
                "dataset {} already exists",
                record.id
            )));
        }
        self.datasets.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn create_resource(&mut self, record: ResourceRecord) -> Result<ResourceRecord, DepotError> {
        if !self.datasets.contains_key(&record.package_id) {
            return Err(DepotError::DatasetNotFound(record.package_id.clone()));
        }
        if self.resources.contains_key(&record.id) {
            return Err(DepotError::Catalog(format!(
                "resource {} already exists",
                record.id
            )));
        }
        self.resources.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn patch_resource(
        &mut self,
        id: &ResourceId,
        patch: &ResourcePatch,
    ) -> Result<ResourceRecord, DepotError> {
        let record = self
            .resources
            .get_mut(id)
            .ok_or_else(|| DepotError::ResourceNotFound(id.to_string()))?;
        if let Some(sha256) = &patch.sha256 {
            record.sha256 = Some(sha256.clone());
        }
        for (kind, update) in &patch.artifacts {
            let location = record.artifacts.entry(*kind).or_default();
            if update.s3_available.is_some() {
                location.s3_available = update.s3_available;
            }
            if update.s3_url.is_some() {
                location.s3_url = update.s3_url.clone();
            }
        }
        Ok(record.clone())
    }
}

/// Catalog kept in memory; used for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    data: Mutex<CatalogData>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(
        &self,
        f: impl FnOnce(&mut CatalogData) -> Result<T, DepotError>,
    ) -> Result<T, DepotError> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| DepotError::Catalog("catalog lock poisoned".to_string()))?;
        f(&mut data)
    }
}

impl Catalog for MemoryCatalog {
    fn find_dataset(
        &self,
        _ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<DatasetRecord>, DepotError> {
        self.with_data(|data| Ok(data.datasets.get(id).cloned()))
    }

    fn find_resource(
        &self,
        _ctx: &CatalogContext,
        id: &ResourceId,
    ) -> Result<Option<ResourceRecord>, DepotError> {
        self.with_data(|data| Ok(data.resources.get(id).cloned()))
    }

    fn list_datasets(&self, _ctx: &CatalogContext) -> Result<Vec<DatasetRecord>, DepotError> {
        self.with_data(|data| Ok(data.datasets.values().cloned().collect()))
    }

    fn list_resources(
        &self,
        _ctx: &CatalogContext,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, DepotError> {
        self.with_data(|data| Ok(data.list_resources(dataset_id)))
    }

    fn create_dataset(
        &self,
        ctx: &CatalogContext,
        record: DatasetRecord,
    ) -> Result<DatasetRecord, DepotError> {
        require_write(ctx)?;
        self.with_data(|data| data.create_dataset(record))
    }

    fn create_resource(
        &self,
        ctx: &CatalogContext,
        record: ResourceRecord,
    ) -> Result<ResourceRecord, DepotError> {
        require_write(ctx)?;
        self.with_data(|data| data.create_resource(record))
    }

    fn patch_resource(
        &self,
        ctx: &CatalogContext,
        id: &ResourceId,
        patch: &ResourcePatch,
    ) -> Result<ResourceRecord, DepotError> {
        require_write(ctx)?;
        self.with_data(|data| data.patch_resource(id, patch))
    }
}

/// Catalog persisted as one JSON document. Every call re-reads the file, so
/// separate processes see each other's writes; writes replace it atomically.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonCatalog {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CatalogData, DepotError> {
        if !self.path.exists() {
            return Ok(CatalogData::default());
        }
        let content =
            fs::read_to_string(&self.path).map_err(|err| DepotError::Catalog(err.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| DepotError::Catalog(format!("{}: {err}", self.path.display())))
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogData) -> T) -> Result<T, DepotError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DepotError::Catalog("catalog lock poisoned".to_string()))?;
        Ok(f(&self.load()?))
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut CatalogData) -> Result<T, DepotError>,
    ) -> Result<T, DepotError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| DepotError::Catalog("catalog lock poisoned".to_string()))?;
        let mut data = self.load()?;
        let value = f(&mut data)?;
        let json = serde_json::to_vec_pretty(&data)
            .map_err(|err| DepotError::Catalog(err.to_string()))?;
        store::write_bytes_atomic(&self.path, &json)?;
        Ok(value)
    }
}

impl Catalog for JsonCatalog {
    fn find_dataset(
        &self,
        _ctx: &CatalogContext,
        id: &str,
    ) -> Result<Option<DatasetRecord>, DepotError> {
        self.read(|data| data.datasets.get(id).cloned())
    }

    fn find_resource(
        &self,
        _ctx: &CatalogContext,
        id: &ResourceId,
    ) -> Result<Option<ResourceRecord>, DepotError> {
        self.read(|data| data.resources.get(id).cloned())
    }

    fn list_datasets(&self, _ctx: &CatalogContext) -> Result<Vec<DatasetRecord>, DepotError> {
        self.read(|data| data.datasets.values().cloned().collect())
    }

    fn list_resources(
        &self,
        _ctx: &CatalogContext,
        dataset_id: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, DepotError> {
        self.read(|data| data.list_resources(dataset_id))
    }

    fn create_dataset(
        &self,
        ctx: &CatalogContext,
        record: DatasetRecord,
    ) -> Result<DatasetRecord, DepotError> {
        require_write(ctx)?;
        self.update(|data| data.create_dataset(record))
    }

    fn create_resource(
        &self,
        ctx: &CatalogContext,
        record: ResourceRecord,
    ) -> Result<ResourceRecord, DepotError> {
        require_write(ctx)?;
        self.update(|data| data.create_resource(record))
    }

    fn patch_resource(
        &self,
        ctx: &CatalogContext,
        id: &ResourceId,
        patch: &ResourcePatch,
    ) -> Result<ResourceRecord, DepotError> {
        require_write(ctx)?;
        self.update(|data| data.patch_resource(id, patch))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn dataset(id: &str) -> DatasetRecord {
        DatasetRecord {
            id: id.to_string(),
            name: id.to_string(),
            title: String::new(),
            owner_org: "org-1".to_string(),
            creator_user: None,
            private: false,
        }
    }

    fn resource_id() -> ResourceId {
        "fa1b2c3d-0000-4000-8000-000000000001".parse().unwrap()
    }

    #[test]
    fn json_catalog_persists_and_patches() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("catalog.json");
        let ctx = admin_context();

        let catalog = JsonCatalog::open(&path);
        catalog.create_dataset(&ctx, dataset("ds1")).unwrap();
        catalog
            .create_resource(&ctx, ResourceRecord::new(resource_id(), "ds1", "a.rtdc"))
            .unwrap();
        catalog
            .patch_resource(
                &ctx,
                &resource_id(),
                &ResourcePatch::remote(ArtifactKind::Condensed, "https://s3/x"),
            )
            .unwrap();

        let reopened = JsonCatalog::open(&path);
        let record = reopened.find_resource(&ctx, &resource_id()).unwrap().unwrap();
        assert!(record.is_remote_available(ArtifactKind::Condensed));
        assert!(!record.is_remote_available(ArtifactKind::Resource));
        assert_eq!(record.s3_url(ArtifactKind::Condensed), Some("https://s3/x"));
    }

    #[test]
    fn resource_requires_dataset() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .create_resource(
                &admin_context(),
                ResourceRecord::new(resource_id(), "missing", "a.rtdc"),
            )
            .unwrap_err();
        assert_matches!(err, DepotError::DatasetNotFound(_));
    }

    #[test]
    fn writes_need_elevated_context() {
        let catalog = MemoryCatalog::new();
        let ctx = CatalogContext {
            user: "alice".to_string(),
            ignore_auth: false,
        };
        let err = catalog.create_dataset(&ctx, dataset("ds1")).unwrap_err();
        assert_matches!(err, DepotError::Catalog(_));
    }
}
