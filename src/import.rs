use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::app::{ProgressEvent, ProgressSink};
use crate::catalog::{Catalog, DatasetRecord, ResourceRecord, admin_context};
use crate::checksum::{self, Sha256Sums};
use crate::domain::{ArtifactKind, DepotFile, DepotStem, ResourceId};
use crate::error::DepotError;
use crate::store::Depot;

/// Organization owning everything imported from the internal depot.
pub const INTERNAL_ORG: &str = "internal-guck";

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Stop after this many resource sets (0 or `None` = no limit).
    pub limit: Option<usize>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ImportOptions {
    fn includes(&self, date: NaiveDate) -> bool {
        self.start_date.is_none_or(|start| date >= start)
            && self.end_date.is_none_or(|end| date <= end)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub datasets_created: usize,
    pub datasets_skipped: usize,
    pub resources_created: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Files of one resource set that become catalog resources.
struct ResourceSet {
    stem: DepotStem,
    primary: PathBuf,
    condensed: PathBuf,
    members: Vec<PathBuf>,
    sums: Sha256Sums,
}

impl ResourceSet {
    fn load(sha256sums: &Path, stem: DepotStem) -> Result<Self, DepotError> {
        let dir = sha256sums
            .parent()
            .ok_or_else(|| DepotError::InvalidInput(sha256sums.display().to_string()))?;
        let sums = Sha256Sums::load(sha256sums)?;
        let mut members = Vec::new();
        let mut primary = None;
        let mut condensed = None;
        let mut names = fs::read_dir(dir)
            .map_err(|err| DepotError::Filesystem(err.to_string()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect::<Vec<_>>();
        names.sort();
        for name in names {
            let Some((found, file)) = DepotFile::parse(&name) else {
                continue;
            };
            if found != stem {
                continue;
            }
            let path = dir.join(&name);
            match file {
                DepotFile::Sha256Sums => {}
                DepotFile::Condensed { version } => {
                    if condensed.as_ref().is_none_or(|(latest, _)| version > *latest) {
                        condensed = Some((version, path));
                    }
                }
                DepotFile::Primary { version } => {
                    if primary.as_ref().is_none_or(|(latest, _)| version > *latest) {
                        primary = Some((version, path.clone()));
                    }
                    members.push(path);
                }
                DepotFile::Ancillary { .. } => members.push(path),
            }
        }
        let primary = primary.map(|(_, path)| path).ok_or_else(|| {
            DepotError::InvalidInput(format!("no dataset file for {}", sha256sums.display()))
        })?;
        let condensed = condensed.map(|(_, path)| path).ok_or_else(|| {
            DepotError::InvalidInput(format!("no condensed file for {}", sha256sums.display()))
        })?;
        Ok(Self {
            stem,
            primary,
            condensed,
            members,
            sums,
        })
    }

    fn checksum(&self, path: &Path) -> Result<String, DepotError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        self.sums
            .get(name)
            .map(str::to_string)
            .ok_or_else(|| DepotError::InvalidInput(format!("no sha256 sum for {name}")))
    }
}

#[cfg(unix)]
fn link(target: &Path, link: &Path) -> Result<(), DepotError> {
    std::os::unix::fs::symlink(target, link).map_err(|err| DepotError::Filesystem(err.to_string()))
}

#[cfg(not(unix))]
fn link(target: &Path, link: &Path) -> Result<(), DepotError> {
    crate::store::copy_file_atomic(target, link)
}

/// Imports resource sets from the internal depot into the catalog as
/// private datasets. Block storage gets symlinks to the depot files.
pub struct InternalImporter<'a, K: Catalog> {
    catalog: &'a K,
    depot: &'a Depot,
    resources_root: PathBuf,
}

impl<'a, K: Catalog> InternalImporter<'a, K> {
    pub fn new(catalog: &'a K, depot: &'a Depot, resources_root: &Path) -> Self {
        Self {
            catalog,
            depot,
            resources_root: resources_root.to_path_buf(),
        }
    }

    pub fn run(
        &self,
        options: ImportOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ImportSummary, DepotError> {
        let root = self.depot.root().as_std_path();
        if !root.is_dir() {
            return Err(DepotError::NotFound(root.to_path_buf()));
        }
        let limit = options.limit.filter(|limit| *limit > 0);
        let mut summary = ImportSummary::default();
        let mut visited = 0usize;
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some((stem, DepotFile::Sha256Sums)) = DepotFile::parse(name) else {
                continue;
            };
            if !options.includes(stem.date()) {
                continue;
            }
            visited += 1;
            sink.event(ProgressEvent::progress(format!("Importing {stem}")));
            match self.import_set(entry.path(), stem, &mut summary) {
                Ok(()) => {}
                Err(DepotError::Interrupted) => return Err(DepotError::Interrupted),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "import failed");
                    sink.event(ProgressEvent::log(
                        0,
                        format!("!!! {}: {err}", entry.path().display()),
                    ));
                    summary.failed.push((entry.path().to_path_buf(), err.to_string()));
                }
            }
            if limit.is_some_and(|limit| visited >= limit) {
                break;
            }
        }
        info!(
            created = summary.datasets_created,
            skipped = summary.datasets_skipped,
            resources = summary.resources_created,
            "internal import finished"
        );
        Ok(summary)
    }

    fn import_set(
        &self,
        sha256sums: &Path,
        stem: DepotStem,
        summary: &mut ImportSummary,
    ) -> Result<(), DepotError> {
        let ctx = admin_context();
        let set = ResourceSet::load(sha256sums, stem)?;
        let name = set.stem.to_string();
        let dataset_id = checksum::make_id(&[&set.checksum(&set.primary)?, &name]);

        if self.catalog.find_dataset(&ctx, &dataset_id)?.is_some() {
            debug!(dataset = %name, "dataset exists, skipping creation");
            summary.datasets_skipped += 1;
        } else {
            self.catalog.create_dataset(
                &ctx,
                DatasetRecord {
                    id: dataset_id.clone(),
                    name: name.clone(),
                    title: name.replace('_', " "),
                    owner_org: INTERNAL_ORG.to_string(),
                    creator_user: None,
                    private: true,
                },
            )?;
            summary.datasets_created += 1;
        }

        let primary_name = file_name(&set.primary);
        let primary_id = resource_id(&dataset_id, &primary_name, &set.checksum(&set.primary)?)?;
        if self.catalog.find_resource(&ctx, &primary_id)?.is_some() {
            debug!(dataset = %name, "resources exist, skipping import");
            return Ok(());
        }

        for member in &set.members {
            let member_name = file_name(member);
            let sum = set.checksum(member)?;
            let id = resource_id(&dataset_id, &member_name, &sum)?;
            let local = self.resources_root.join(id.sharded());
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).map_err(|err| DepotError::Filesystem(err.to_string()))?;
            }
            if *member == set.primary {
                let mut condensed = local.clone().into_os_string();
                condensed.push(ArtifactKind::Condensed.local_suffix());
                let condensed = PathBuf::from(condensed);
                if !condensed.exists() {
                    link(&set.condensed, &condensed)?;
                }
            }
            if !local.exists() {
                link(member, &local)?;
            }
            let size = fs::metadata(member)
                .map_err(|err| DepotError::Filesystem(err.to_string()))?
                .len();
            let mut record = ResourceRecord::new(id, dataset_id.clone(), member_name);
            record.sha256 = Some(sum);
            record.size = Some(size);
            self.catalog.create_resource(&ctx, record)?;
            summary.resources_created += 1;
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn resource_id(dataset_id: &str, name: &str, sum: &str) -> Result<ResourceId, DepotError> {
    checksum::make_id(&[dataset_id, name, sum]).parse()
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::output::NullSink;

    fn write_set(depot: &Depot, stem: &DepotStem) {
        let dir = depot.set_dir(stem);
        fs::create_dir_all(&dir).unwrap();
        let mut sums = Sha256Sums::default();
        for (name, content) in [
            (stem.primary_name(1), b"primary".as_slice()),
            (stem.condensed_name(1), b"condensed".as_slice()),
            (stem.ancillary_name(1, 1), b"png".as_slice()),
        ] {
            fs::write(dir.join(&name), content).unwrap();
            sums.insert(&name, &checksum::sha256_bytes(content));
        }
        sums.write(depot.sha256sums_path(stem).as_std_path()).unwrap();
    }

    #[test]
    fn import_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let depot = Depot::new(Utf8PathBuf::from_path_buf(temp.path().join("depot")).unwrap());
        let resources = temp.path().join("resources");
        let stem = DepotStem::new("2019-08-20", "11:26", "c083de").unwrap();
        write_set(&depot, &stem);

        let catalog = MemoryCatalog::new();
        let importer = InternalImporter::new(&catalog, &depot, &resources);
        let first = importer.run(ImportOptions::default(), &NullSink).unwrap();
        assert_eq!(first.datasets_created, 1);
        assert_eq!(first.resources_created, 2);
        assert!(first.failed.is_empty());

        let datasets = catalog.list_datasets(&admin_context()).unwrap();
        assert!(datasets[0].private);
        assert_eq!(datasets[0].owner_org, INTERNAL_ORG);
        let records = catalog.list_resources(&admin_context(), None).unwrap();
        let primary = records
            .iter()
            .find(|record| record.name == stem.primary_name(1))
            .unwrap();
        let local = resources.join(primary.id.sharded());
        assert_eq!(fs::read(&local).unwrap(), b"primary");
        assert_eq!(
            fs::read(format!("{}_condensed.rtdc", local.display())).unwrap(),
            b"condensed"
        );

        let second = importer.run(ImportOptions::default(), &NullSink).unwrap();
        assert_eq!(second.datasets_skipped, 1);
        assert_eq!(second.resources_created, 0);
    }

    #[test]
    fn date_window_filters_sets() {
        let temp = tempfile::tempdir().unwrap();
        let depot = Depot::new(Utf8PathBuf::from_path_buf(temp.path().join("depot")).unwrap());
        write_set(&depot, &DepotStem::new("2019-08-20", "1126", "c083de").unwrap());
        write_set(&depot, &DepotStem::new("2021-01-02", "0900", "aa00bb").unwrap());

        let catalog = MemoryCatalog::new();
        let importer = InternalImporter::new(&catalog, &depot, &temp.path().join("resources"));
        let summary = importer
            .run(
                ImportOptions {
                    limit: None,
                    start_date: NaiveDate::from_ymd_opt(2020, 1, 1),
                    end_date: None,
                },
                &NullSink,
            )
            .unwrap();
        assert_eq!(summary.datasets_created, 1);
        assert_eq!(
            catalog.list_datasets(&admin_context()).unwrap()[0].name,
            "2021-01-02_0900_aa00bb"
        );
    }
}
