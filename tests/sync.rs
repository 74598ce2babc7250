use std::fs;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use assert_matches::assert_matches;
use dcor_depot::catalog::{
    Catalog, DatasetRecord, JsonCatalog, MemoryCatalog, ResourceRecord, admin_context,
};
use dcor_depot::checksum;
use dcor_depot::domain::{ArtifactKind, ResourceId};
use dcor_depot::error::DepotError;
use dcor_depot::object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, Tags};
use dcor_depot::output::NullSink;
use dcor_depot::sync::{ArtifactOutcome, SyncEngine, SyncOptions, SyncSummary};

const RESOURCE: &str = "0ab1c2d3-aaaa-bbbb-cccc-1234567890ab";
const NEXT_RESOURCE: &str = "0ab1c2d4-aaaa-bbbb-cccc-1234567890ab";

struct Site {
    temp: tempfile::TempDir,
    catalog: JsonCatalog,
    store: FsObjectStore,
}

impl Site {
    fn new(private: bool) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let catalog = JsonCatalog::open(&temp.path().join("catalog.json"));
        let store = FsObjectStore::new(&temp.path().join("objects"));
        let ctx = admin_context();
        catalog
            .create_dataset(
                &ctx,
                DatasetRecord {
                    id: "ds-1".to_string(),
                    name: "blood-cells".to_string(),
                    title: "Blood cells".to_string(),
                    owner_org: "lab".to_string(),
                    creator_user: Some("alice".to_string()),
                    private,
                },
            )
            .unwrap();
        let id: ResourceId = RESOURCE.parse().unwrap();
        catalog
            .create_resource(&ctx, ResourceRecord::new(id, "ds-1", "M1.rtdc"))
            .unwrap();

        let site = Self {
            temp,
            catalog,
            store,
        };
        site.write_local("", b"primary bytes");
        site.write_local("_condensed.rtdc", b"condensed bytes");
        site
    }

    fn resources_root(&self) -> std::path::PathBuf {
        self.temp.path().join("resources")
    }

    fn write_local(&self, suffix: &str, content: &[u8]) {
        let path = self
            .resources_root()
            .join(format!("0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab{suffix}"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sweep(&self, options: SyncOptions) -> Result<SyncSummary, DepotError> {
        SyncEngine::new(&self.catalog, &self.store, &self.resources_root(), "circle-").sweep(
            None,
            options,
            &NullSink,
        )
    }

    fn record(&self) -> ResourceRecord {
        self.catalog
            .find_resource(&admin_context(), &RESOURCE.parse().unwrap())
            .unwrap()
            .unwrap()
    }
}

fn outcome(summary: &SyncSummary, kind: ArtifactKind) -> &ArtifactOutcome {
    &summary
        .artifacts
        .iter()
        .find(|report| report.kind == kind)
        .unwrap()
        .outcome
}

fn remote_sum(store: &FsObjectStore, key: &str) -> String {
    checksum::sha256_reader(store.open("circle-lab", key).unwrap()).unwrap()
}

#[test]
fn sweep_uploads_each_artifact_once() {
    let site = Site::new(false);

    let summary = site.sweep(SyncOptions::default()).unwrap();
    assert_eq!(summary.uploads(), 2);
    assert_eq!(summary.failures(), 0);
    assert_eq!(
        outcome(&summary, ArtifactKind::Resource),
        &ArtifactOutcome::Uploaded
    );
    assert_matches!(
        outcome(&summary, ArtifactKind::Preview),
        ArtifactOutcome::MissingLocal { .. }
    );

    let key = "resource/0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab";
    assert!(site.store.exists("circle-lab", key).unwrap());
    assert_eq!(
        remote_sum(&site.store, key),
        checksum::sha256_bytes(b"primary bytes")
    );
    assert_eq!(
        site.store.tags("circle-lab", key).unwrap().get("public"),
        Some(&"true".to_string())
    );

    let record = site.record();
    assert!(record.is_remote_available(ArtifactKind::Resource));
    assert!(record.is_remote_available(ArtifactKind::Condensed));
    assert!(!record.is_remote_available(ArtifactKind::Preview));
    assert_eq!(
        record.sha256.as_deref(),
        Some(checksum::sha256_bytes(b"primary bytes").as_str())
    );
    assert!(
        record
            .s3_url(ArtifactKind::Condensed)
            .is_some_and(|url| url.ends_with("condensed/0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab"))
    );

    let summary = site.sweep(SyncOptions::default()).unwrap();
    assert_eq!(summary.uploads(), 0);
    assert_eq!(
        outcome(&summary, ArtifactKind::Resource),
        &ArtifactOutcome::AlreadyAvailable
    );
}

#[test]
fn verify_checksum_compares_remote_copies() {
    let site = Site::new(false);
    site.sweep(SyncOptions::default()).unwrap();

    let verify = SyncOptions {
        verify_checksum: true,
        ..SyncOptions::default()
    };
    let summary = site.sweep(verify).unwrap();
    assert_eq!(
        outcome(&summary, ArtifactKind::Resource),
        &ArtifactOutcome::Verified
    );
    assert_eq!(
        outcome(&summary, ArtifactKind::Condensed),
        &ArtifactOutcome::Verified
    );

    // a regenerated condensed file differs from the remote copy
    site.write_local("_condensed.rtdc", b"regenerated condensed bytes");
    let summary = site.sweep(verify).unwrap();
    assert_eq!(
        outcome(&summary, ArtifactKind::Condensed),
        &ArtifactOutcome::Replaced
    );
    assert_eq!(
        remote_sum(
            &site.store,
            "condensed/0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab"
        ),
        checksum::sha256_bytes(b"regenerated condensed bytes")
    );
}

#[test]
fn private_datasets_are_not_tagged_public() {
    let site = Site::new(true);
    site.sweep(SyncOptions::default()).unwrap();
    let tags = site
        .store
        .tags("circle-lab", "resource/0ab/1c2/d3-aaaa-bbbb-cccc-1234567890ab")
        .unwrap();
    assert!(!tags.contains_key("public"));
}

#[test]
fn catalog_updates_survive_reopening() {
    let site = Site::new(false);
    site.sweep(SyncOptions::default()).unwrap();

    let reopened = JsonCatalog::open(site.catalog.path());
    let record = reopened
        .find_resource(&admin_context(), &RESOURCE.parse().unwrap())
        .unwrap()
        .unwrap();
    assert!(record.is_remote_available(ArtifactKind::Resource));
}

#[test]
fn sweep_rejects_deletion_and_unknown_datasets() {
    let site = Site::new(false);
    let delete = SyncOptions {
        delete_after_migration: true,
        ..SyncOptions::default()
    };
    assert_matches!(site.sweep(delete), Err(DepotError::NotSupported(_)));

    let err = SyncEngine::new(
        &site.catalog,
        &site.store,
        Path::new("/nonexistent"),
        "circle-",
    )
    .sweep(Some("ds-unknown"), SyncOptions::default(), &NullSink)
    .unwrap_err();
    assert_matches!(err, DepotError::DatasetNotFound(id) if id == "ds-unknown");
}

/// Memory store that garbles the stored bytes of one key, or fails the
/// upload of one key with an operator interrupt.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryObjectStore,
    garble: Option<String>,
    interrupt: Option<String>,
}

impl ObjectStore for FaultyStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError> {
        if self.interrupt.as_deref() == Some(key) {
            return Err(DepotError::Interrupted);
        }
        let url = self.inner.put(bucket, key, source, tags)?;
        if self.garble.as_deref() == Some(key) {
            self.inner.overwrite(bucket, key, b"garbled in transit")?;
        }
        Ok(url)
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, DepotError> {
        self.inner.get(bucket, key, range)
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError> {
        self.inner.open(bucket, key)
    }

    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError> {
        self.inner.tag(bucket, key, tags)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError> {
        self.inner.exists(bucket, key)
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        self.inner.url(bucket, key)
    }
}

/// Catalog with two public resources, both present on local storage.
fn two_resources(resources_root: &Path) -> (MemoryCatalog, ResourceId, ResourceId) {
    let catalog = MemoryCatalog::new();
    let ctx = admin_context();
    catalog
        .create_dataset(
            &ctx,
            DatasetRecord {
                id: "ds-1".to_string(),
                name: "blood-cells".to_string(),
                title: "Blood cells".to_string(),
                owner_org: "lab".to_string(),
                creator_user: None,
                private: false,
            },
        )
        .unwrap();
    let ids = [RESOURCE, NEXT_RESOURCE].map(|raw| {
        let id: ResourceId = raw.parse().unwrap();
        catalog
            .create_resource(&ctx, ResourceRecord::new(id.clone(), "ds-1", "M1.rtdc"))
            .unwrap();
        let local = resources_root.join(id.sharded());
        fs::create_dir_all(local.parent().unwrap()).unwrap();
        fs::write(&local, format!("primary {raw}")).unwrap();
        fs::write(
            format!("{}_condensed.rtdc", local.display()),
            format!("condensed {raw}"),
        )
        .unwrap();
        id
    });
    let [first, second] = ids;
    (catalog, first, second)
}

fn report<'a>(
    summary: &'a SyncSummary,
    id: &ResourceId,
    kind: ArtifactKind,
) -> &'a ArtifactOutcome {
    &summary
        .artifacts
        .iter()
        .find(|report| &report.resource == id && report.kind == kind)
        .unwrap()
        .outcome
}

#[test]
fn corrupted_upload_fails_artifact_and_sweep_continues() {
    let temp = tempfile::tempdir().unwrap();
    let (catalog, first, second) = two_resources(temp.path());
    let store = FaultyStore {
        garble: Some(first.object_key(ArtifactKind::Resource)),
        ..FaultyStore::default()
    };

    let summary = SyncEngine::new(&catalog, &store, temp.path(), "circle-")
        .sweep(None, SyncOptions::default(), &NullSink)
        .unwrap();
    assert_matches!(
        report(&summary, &first, ArtifactKind::Resource),
        ArtifactOutcome::Failed { message } if message.contains("checksum mismatch")
    );
    assert_eq!(
        report(&summary, &first, ArtifactKind::Condensed),
        &ArtifactOutcome::Uploaded
    );
    assert_eq!(
        report(&summary, &second, ArtifactKind::Resource),
        &ArtifactOutcome::Uploaded
    );
    assert_eq!(summary.failures(), 1);

    let ctx = admin_context();
    let record = catalog.find_resource(&ctx, &first).unwrap().unwrap();
    assert!(!record.is_remote_available(ArtifactKind::Resource));
    assert!(record.sha256.is_none());
    let record = catalog.find_resource(&ctx, &second).unwrap().unwrap();
    assert!(record.is_remote_available(ArtifactKind::Resource));
}

#[test]
fn interrupt_escapes_the_sweep() {
    let temp = tempfile::tempdir().unwrap();
    let (catalog, first, second) = two_resources(temp.path());
    let store = FaultyStore {
        interrupt: Some(second.object_key(ArtifactKind::Resource)),
        ..FaultyStore::default()
    };

    let err = SyncEngine::new(&catalog, &store, temp.path(), "circle-")
        .sweep(None, SyncOptions::default(), &NullSink)
        .unwrap_err();
    assert_matches!(err, DepotError::Interrupted);
    assert_eq!(store.inner.put_count(), 2);

    let ctx = admin_context();
    let record = catalog.find_resource(&ctx, &first).unwrap().unwrap();
    assert!(record.is_remote_available(ArtifactKind::Condensed));
    let record = catalog.find_resource(&ctx, &second).unwrap().unwrap();
    assert!(!record.is_remote_available(ArtifactKind::Resource));
    assert!(!record.is_remote_available(ArtifactKind::Condensed));
}
