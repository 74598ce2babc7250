use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::catalog::{Catalog, admin_context};
use crate::config::ResolvedConfig;
use crate::convert::FormatConverter;
use crate::depotize::{DepotizeOptions, DepotizeSummary, Depotizer};
use crate::error::DepotError;
use crate::import::{ImportOptions, ImportSummary, InternalImporter};
use crate::object_store::ObjectStore;
use crate::oracle::FormatOracle;
use crate::store::Depot;
use crate::sync::{EventContext, ResourceEventHandler, SyncEngine, SyncOptions, SyncSummary};
use crate::user_depot::{UserDepot, UserDepotLinker};

#[derive(Debug, Clone, Serialize)]
pub struct ResourceListResult {
    pub resources: Vec<String>,
}

/// A line of operator-facing output.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
    /// Minimum verbosity at which the event is shown.
    pub level: u8,
    /// Progress lines are overwritten by the next event.
    pub transient: bool,
}

impl ProgressEvent {
    pub fn log(level: u8, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            level,
            transient: false,
        }
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
            level: 0,
            transient: true,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Entry point for every operator command. Collaborators are passed in so
/// tests can substitute them.
pub struct App<K: Catalog, S: ObjectStore> {
    config: ResolvedConfig,
    catalog: K,
    store: S,
}

impl<K: Catalog, S: ObjectStore> App<K, S> {
    pub fn new(config: ResolvedConfig, catalog: K, store: S) -> Self {
        Self {
            config,
            catalog,
            store,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn catalog(&self) -> &K {
        &self.catalog
    }

    pub fn object_store(&self) -> &S {
        &self.store
    }

    fn depot(&self) -> Depot {
        Depot::new(self.config.depot_root.clone())
    }

    fn sync_engine(&self) -> SyncEngine<'_, K, S> {
        SyncEngine::new(
            &self.catalog,
            &self.store,
            self.config.storage.resources.as_std_path(),
            &self.config.object_store.bucket_prefix,
        )
    }

    pub fn depotize<O: FormatOracle, C: FormatConverter>(
        &self,
        oracle: &O,
        converter: &C,
        path: &Path,
        options: DepotizeOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DepotizeSummary, DepotError> {
        let depotizer = Depotizer::new(
            oracle,
            converter,
            self.depot(),
            self.config.check.clone(),
            self.config.archive.clone(),
            options,
        );
        let summary = depotizer.run(path, sink)?;
        sink.event(ProgressEvent::log(0, "Done"));
        Ok(summary)
    }

    pub fn migrate_resources(
        &self,
        dataset: Option<&str>,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncSummary, DepotError> {
        let summary = self.sync_engine().sweep(dataset, options, sink)?;
        sink.event(ProgressEvent::log(0, "Done"));
        Ok(summary)
    }

    pub fn import_internal(
        &self,
        options: ImportOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ImportSummary, DepotError> {
        let depot = self.depot();
        let importer = InternalImporter::new(
            &self.catalog,
            &depot,
            self.config.storage.resources.as_std_path(),
        );
        let summary = importer.run(options, sink)?;
        sink.event(ProgressEvent::log(0, "Done"));
        Ok(summary)
    }

    pub fn list_all_resources(&self) -> Result<ResourceListResult, DepotError> {
        let resources = self
            .catalog
            .list_resources(&admin_context(), None)?
            .into_iter()
            .map(|record| record.id.to_string())
            .collect();
        Ok(ResourceListResult { resources })
    }
}

/// New resources are synced to the object store, then moved into the user
/// depot.
impl<K: Catalog, S: ObjectStore> ResourceEventHandler for App<K, S> {
    fn after_resource_create(
        &self,
        ctx: &EventContext,
        resource: &crate::catalog::ResourceRecord,
    ) -> Result<(), DepotError> {
        self.sync_engine().after_resource_create(ctx, resource)?;
        let linker = UserDepotLinker::new(
            &self.catalog,
            UserDepot::new(self.config.storage.user_depot.as_std_path()),
            self.config.storage.resources.as_std_path(),
        );
        linker.after_resource_create(ctx, resource)
    }
}
