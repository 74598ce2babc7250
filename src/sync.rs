//! Migration of resource artifacts from local block storage to the object
//! store.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::catalog::{
    Catalog, CatalogContext, DatasetRecord, ResourcePatch, ResourceRecord, admin_context,
};
use crate::checksum;
use crate::domain::{ArtifactKind, ResourceId};
use crate::error::DepotError;
use crate::object_store::ObjectStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Compare checksums even for artifacts the catalog marks as uploaded.
    pub verify_checksum: bool,
    pub delete_after_migration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Uploaded,
    /// Remote copy existed with a different checksum and was replaced.
    Replaced,
    /// Remote copy existed with a matching checksum.
    Verified,
    /// The catalog already lists the artifact as available.
    AlreadyAvailable,
    MissingLocal { path: PathBuf },
    TimedOut { message: String },
    Failed { message: String },
}

impl ArtifactOutcome {
    pub fn is_transfer(&self) -> bool {
        matches!(self, ArtifactOutcome::Uploaded | ArtifactOutcome::Replaced)
    }

    fn from_error(err: DepotError) -> Self {
        match err {
            DepotError::Timeout(message) => ArtifactOutcome::TimedOut { message },
            other => ArtifactOutcome::Failed {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
    pub resource: ResourceId,
    pub kind: ArtifactKind,
    #[serde(flatten)]
    pub outcome: ArtifactOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub artifacts: Vec<ArtifactReport>,
}

impl SyncSummary {
    pub fn uploads(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|report| report.outcome.is_transfer())
            .count()
    }

    pub fn failures(&self) -> usize {
        self.artifacts
            .iter()
            .filter(|report| {
                matches!(
                    report.outcome,
                    ArtifactOutcome::Failed { .. } | ArtifactOutcome::TimedOut { .. }
                )
            })
            .count()
    }
}

/// Uploads resource artifacts and records their remote location in the
/// catalog.
pub struct SyncEngine<'a, K: Catalog, S: ObjectStore> {
    catalog: &'a K,
    store: &'a S,
    resources_root: PathBuf,
    bucket_prefix: String,
}

impl<'a, K: Catalog, S: ObjectStore> SyncEngine<'a, K, S> {
    pub fn new(catalog: &'a K, store: &'a S, resources_root: &Path, bucket_prefix: &str) -> Self {
        Self {
            catalog,
            store,
            resources_root: resources_root.to_path_buf(),
            bucket_prefix: bucket_prefix.to_string(),
        }
    }

    /// Local block-storage path of a resource artifact.
    pub fn local_path(&self, id: &ResourceId, kind: ArtifactKind) -> PathBuf {
        let mut path = self.resources_root.join(id.sharded()).into_os_string();
        path.push(kind.local_suffix());
        PathBuf::from(path)
    }

    pub fn bucket(&self, dataset: &DatasetRecord) -> String {
        format!("{}{}", self.bucket_prefix, dataset.owner_org)
    }

    /// Migrates every resource of every dataset (or of one dataset).
    /// Failures are recorded per artifact; only an interrupt aborts.
    pub fn sweep(
        &self,
        dataset_id: Option<&str>,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncSummary, DepotError> {
        if options.delete_after_migration {
            return Err(DepotError::NotSupported(
                "deleting local resources after migration".to_string(),
            ));
        }
        let ctx = admin_context();
        let datasets = match dataset_id {
            Some(id) => vec![
                self.catalog
                    .find_dataset(&ctx, id)?
                    .ok_or_else(|| DepotError::DatasetNotFound(id.to_string()))?,
            ],
            None => self.catalog.list_datasets(&ctx)?,
        };

        let mut summary = SyncSummary::default();
        for dataset in &datasets {
            let resources = self.catalog.list_resources(&ctx, Some(&dataset.id))?;
            for resource in &resources {
                sink.event(ProgressEvent::progress(format!(
                    "Migrating {}/{}",
                    dataset.name, resource.id
                )));
                summary
                    .artifacts
                    .extend(self.sync_resource(&ctx, dataset, resource, options, sink)?);
            }
        }
        info!(
            uploads = summary.uploads(),
            failures = summary.failures(),
            "object store migration finished"
        );
        Ok(summary)
    }

    /// Syncs all artifact kinds of one resource.
    pub fn sync_resource(
        &self,
        ctx: &CatalogContext,
        dataset: &DatasetRecord,
        resource: &ResourceRecord,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<ArtifactReport>, DepotError> {
        let mut reports = Vec::new();
        for kind in ArtifactKind::ALL {
            let outcome = match self.sync_artifact(ctx, dataset, resource, kind, options) {
                Ok(outcome) => outcome,
                Err(DepotError::Interrupted) => return Err(DepotError::Interrupted),
                Err(err) => {
                    warn!(resource = %resource.id, %kind, error = %err, "artifact sync failed");
                    ArtifactOutcome::from_error(err)
                }
            };
            match &outcome {
                ArtifactOutcome::MissingLocal { path } => sink.event(ProgressEvent::log(
                    1,
                    format!("Missing {kind} for {}: {}", resource.id, path.display()),
                )),
                ArtifactOutcome::Failed { message } | ArtifactOutcome::TimedOut { message } => {
                    sink.event(ProgressEvent::log(
                        0,
                        format!("!!! {kind} of {}: {message}", resource.id),
                    ))
                }
                ArtifactOutcome::Uploaded | ArtifactOutcome::Replaced => sink.event(
                    ProgressEvent::log(1, format!("Uploaded {kind} of {}", resource.id)),
                ),
                _ => {}
            }
            reports.push(ArtifactReport {
                resource: resource.id.clone(),
                kind,
                outcome,
            });
        }
        Ok(reports)
    }

    pub fn sync_artifact(
        &self,
        ctx: &CatalogContext,
        dataset: &DatasetRecord,
        resource: &ResourceRecord,
        kind: ArtifactKind,
        options: SyncOptions,
    ) -> Result<ArtifactOutcome, DepotError> {
        if resource.is_remote_available(kind) && !options.verify_checksum {
            return Ok(ArtifactOutcome::AlreadyAvailable);
        }
        let local = self.local_path(&resource.id, kind);
        if !local.is_file() {
            return Ok(ArtifactOutcome::MissingLocal { path: local });
        }
        let local_sum = match (&resource.sha256, kind) {
            (Some(sum), ArtifactKind::Resource) => sum.clone(),
            _ => checksum::sha256_file(&local)?,
        };

        let bucket = self.bucket(dataset);
        let key = resource.id.object_key(kind);
        let mut outcome = ArtifactOutcome::Uploaded;
        if self.store.exists(&bucket, &key)? {
            let remote_sum = self.remote_sha256(&bucket, &key)?;
            if remote_sum == local_sum {
                debug!(bucket = %bucket, key = %key, "remote checksum matches");
                let url = self.store.url(&bucket, &key);
                self.record_location(ctx, resource, kind, &url, &local_sum)?;
                return Ok(ArtifactOutcome::Verified);
            }
            warn!(
                bucket = %bucket,
                key = %key,
                local = %local_sum,
                remote = %remote_sum,
                "remote checksum differs, uploading again"
            );
            outcome = ArtifactOutcome::Replaced;
        }

        let tags = dataset.visibility().tags();
        let url = self.store.put(&bucket, &key, &local, &tags)?;
        let uploaded_sum = self.remote_sha256(&bucket, &key)?;
        if uploaded_sum != local_sum {
            return Err(DepotError::Integrity {
                key: format!("{bucket}/{key}"),
                local: local_sum,
                remote: uploaded_sum,
            });
        }
        self.record_location(ctx, resource, kind, &url, &local_sum)?;
        info!(bucket = %bucket, key = %key, "uploaded artifact");
        Ok(outcome)
    }

    fn remote_sha256(&self, bucket: &str, key: &str) -> Result<String, DepotError> {
        let reader = self.store.open(bucket, key)?;
        checksum::sha256_reader(reader).map_err(|err| DepotError::ObjectStoreHttp(err.to_string()))
    }

    /// Patches the catalog only where the location is still unset, judged
    /// against a freshly read record.
    fn record_location(
        &self,
        ctx: &CatalogContext,
        resource: &ResourceRecord,
        kind: ArtifactKind,
        url: &str,
        sha256: &str,
    ) -> Result<(), DepotError> {
        let current = self
            .catalog
            .find_resource(ctx, &resource.id)?
            .ok_or_else(|| DepotError::ResourceNotFound(resource.id.to_string()))?;
        let mut patch = ResourcePatch::default();
        if !current.is_remote_available(kind) || current.s3_url(kind).is_none() {
            patch = ResourcePatch::remote(kind, url);
        }
        if kind == ArtifactKind::Resource && current.sha256.is_none() {
            patch.sha256 = Some(sha256.to_string());
        }
        if !patch.is_empty() {
            self.catalog.patch_resource(ctx, &resource.id, &patch)?;
        }
        Ok(())
    }
}

/// Context of a catalog event as seen by a subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventContext {
    pub is_background_job: bool,
}

/// Subscriber to resource lifecycle events emitted by the web application.
pub trait ResourceEventHandler {
    fn after_resource_create(
        &self,
        ctx: &EventContext,
        resource: &ResourceRecord,
    ) -> Result<(), DepotError>;
}

impl<K: Catalog, S: ObjectStore> ResourceEventHandler for SyncEngine<'_, K, S> {
    fn after_resource_create(
        &self,
        ctx: &EventContext,
        resource: &ResourceRecord,
    ) -> Result<(), DepotError> {
        if ctx.is_background_job {
            return Ok(());
        }
        let admin = admin_context();
        let dataset = self
            .catalog
            .find_dataset(&admin, &resource.package_id)?
            .ok_or_else(|| DepotError::DatasetNotFound(resource.package_id.clone()))?;
        let reports = self.sync_resource(
            &admin,
            &dataset,
            resource,
            SyncOptions::default(),
            &crate::output::NullSink,
        )?;
        debug!(
            resource = %resource.id,
            uploads = reports.iter().filter(|report| report.outcome.is_transfer()).count(),
            "synced new resource"
        );
        Ok(())
    }
}
