use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::catalog::{Catalog, ResourceRecord, admin_context};
use crate::error::DepotError;
use crate::import::INTERNAL_ORG;
use crate::store;
use crate::sync::{EventContext, ResourceEventHandler};

pub const FIGSHARE_ORG: &str = "figshare-import";

/// Organizations whose data are imported (and linked) by hand.
pub const MANUAL_DEPOT_ORGS: [&str; 2] = [FIGSHARE_ORG, INTERNAL_ORG];

/// Human-readable depot of user uploads, `<root>/<user>/<dataset>/<resource>`.
#[derive(Debug, Clone)]
pub struct UserDepot {
    root: PathBuf,
}

impl UserDepot {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn path_for(&self, user: &str, dataset: &str, resource: &str) -> PathBuf {
        self.root.join(user).join(dataset).join(resource)
    }

    /// Moves `source` into the user depot and leaves a symlink at `source`.
    /// Returns the depot path, or `None` when nothing had to be done.
    pub fn link_resource(
        &self,
        source: &Path,
        org: &str,
        user: &str,
        dataset: &str,
        resource: &str,
    ) -> Result<Option<PathBuf>, DepotError> {
        if MANUAL_DEPOT_ORGS.contains(&org) {
            debug!(org = %org, "manual depot organization, not linking");
            return Ok(None);
        }
        let is_link = fs::symlink_metadata(source)
            .map(|meta| meta.file_type().is_symlink())
            .map_err(|_| DepotError::NotFound(source.to_path_buf()))?;
        if is_link {
            return Ok(None);
        }
        let dest = self.path_for(user, dataset, resource);
        store::move_file(source, &dest)?;
        symlink(&dest, source)?;
        info!(source = %source.display(), depot = %dest.display(), "linked user resource");
        Ok(Some(dest))
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<(), DepotError> {
    std::os::unix::fs::symlink(target, link).map_err(|err| DepotError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<(), DepotError> {
    store::copy_file_atomic(target, link)
}

/// Links newly created resources into the user depot.
pub struct UserDepotLinker<'a, K: Catalog> {
    catalog: &'a K,
    depot: UserDepot,
    resources_root: PathBuf,
}

impl<'a, K: Catalog> UserDepotLinker<'a, K> {
    pub fn new(catalog: &'a K, depot: UserDepot, resources_root: &Path) -> Self {
        Self {
            catalog,
            depot,
            resources_root: resources_root.to_path_buf(),
        }
    }
}

impl<K: Catalog> ResourceEventHandler for UserDepotLinker<'_, K> {
    fn after_resource_create(
        &self,
        _ctx: &EventContext,
        resource: &ResourceRecord,
    ) -> Result<(), DepotError> {
        let dataset = self
            .catalog
            .find_dataset(&admin_context(), &resource.package_id)?
            .ok_or_else(|| DepotError::DatasetNotFound(resource.package_id.clone()))?;
        let Some(user) = dataset.creator_user.as_deref() else {
            debug!(dataset = %dataset.id, "dataset has no creator, not linking");
            return Ok(());
        };
        let source = self.resources_root.join(resource.id.sharded());
        self.depot.link_resource(
            &source,
            &dataset.owner_org,
            user,
            &dataset.name,
            &resource.name,
        )?;
        Ok(())
    }
}
