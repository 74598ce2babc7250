use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::debug;

use crate::config::{ObjectStoreBackend, ObjectStoreSettings};
use crate::error::DepotError;
use crate::store;

pub type Tags = [(String, String)];

/// S3-like object storage. Buckets are created on first write.
pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `source` and returns the object's URL.
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError>;
    /// Object bytes, or the given byte range of them.
    fn get(&self, bucket: &str, key: &str, range: Option<Range<u64>>)
    -> Result<Vec<u8>, DepotError>;
    /// Streaming reader over the whole object.
    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError>;
    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError>;
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError>;
    fn url(&self, bucket: &str, key: &str) -> String;
}

/// Builds the store selected by configuration.
pub fn from_settings(settings: &ObjectStoreSettings) -> Result<Box<dyn ObjectStore>, DepotError> {
    match &settings.backend {
        ObjectStoreBackend::Filesystem(root) => {
            Ok(Box::new(FsObjectStore::new(root.as_std_path())))
        }
        ObjectStoreBackend::Http(endpoint) => {
            let token = std::env::var(&settings.token_env)
                .ok()
                .filter(|token| !token.trim().is_empty());
            Ok(Box::new(HttpObjectStore::new(
                endpoint,
                token,
                Duration::from_secs(settings.timeout_secs),
            )?))
        }
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for Box<S> {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError> {
        (**self).put(bucket, key, source, tags)
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, DepotError> {
        (**self).get(bucket, key, range)
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError> {
        (**self).open(bucket, key)
    }

    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError> {
        (**self).tag(bucket, key, tags)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError> {
        (**self).exists(bucket, key)
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        (**self).url(bucket, key)
    }
}

fn encode_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Object store on a local (or network) filesystem: one directory per
/// bucket, tags in a `<key>.tags.json` sidecar.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, DepotError> {
        if bucket.is_empty()
            || bucket.contains('/')
            || key.split('/').any(|part| part.is_empty() || part == "..")
        {
            return Err(DepotError::InvalidInput(format!(
                "invalid object location {bucket}/{key}"
            )));
        }
        Ok(self.root.join(bucket).join(key))
    }

    fn tags_path(object: &Path) -> PathBuf {
        let mut name = object.as_os_str().to_os_string();
        name.push(".tags.json");
        PathBuf::from(name)
    }

    /// Tags currently stored for an object.
    pub fn tags(&self, bucket: &str, key: &str) -> Result<BTreeMap<String, String>, DepotError> {
        let path = Self::tags_path(&self.object_path(bucket, key)?);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| DepotError::Filesystem(err.to_string()))
    }

    fn open_object(&self, bucket: &str, key: &str) -> Result<File, DepotError> {
        let path = self.object_path(bucket, key)?;
        File::open(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => DepotError::ObjectStoreStatus {
                status: 404,
                message: format!("no such object {bucket}/{key}"),
            },
            _ => DepotError::Filesystem(err.to_string()),
        })
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError> {
        let dest = self.object_path(bucket, key)?;
        store::copy_file_atomic(source, &dest)?;
        self.tag(bucket, key, tags)?;
        Ok(self.url(bucket, key))
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, DepotError> {
        let mut file = self.open_object(bucket, key)?;
        let mut buffer = Vec::new();
        let read = match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))
                    .map_err(|err| DepotError::Filesystem(err.to_string()))?;
                file.take(range.end.saturating_sub(range.start))
                    .read_to_end(&mut buffer)
            }
            None => file.read_to_end(&mut buffer),
        };
        read.map_err(|err| DepotError::Filesystem(err.to_string()))?;
        Ok(buffer)
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError> {
        Ok(Box::new(self.open_object(bucket, key)?))
    }

    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError> {
        let path = Self::tags_path(&self.object_path(bucket, key)?);
        let map = tags.iter().cloned().collect::<BTreeMap<_, _>>();
        let json =
            serde_json::to_vec_pretty(&map).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        store::write_bytes_atomic(&path, &json)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError> {
        Ok(self.object_path(bucket, key)?.is_file())
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.root.join(bucket).join(key).display())
    }
}

/// Path-style S3-compatible HTTP endpoint: `<endpoint>/<bucket>/<key>`.
#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self, DepotError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dcor-depot/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DepotError::ObjectStoreHttp(err.to_string()))?,
        );
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| DepotError::ObjectStoreHttp(err.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| DepotError::ObjectStoreHttp(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, DepotError> {
        request.send().map_err(map_http_error)
    }

    fn ensure_success(response: Response) -> Result<Response, DepotError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "object store request failed".to_string());
        Err(DepotError::ObjectStoreStatus { status, message })
    }
}

fn map_http_error(err: reqwest::Error) -> DepotError {
    if err.is_timeout() {
        DepotError::Timeout(err.to_string())
    } else {
        DepotError::ObjectStoreHttp(err.to_string())
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError> {
        let url = self.url(bucket, key);
        let file = File::open(source).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        let mut request = self.client.put(&url).body(file);
        if !tags.is_empty() {
            request = request.header("x-amz-tagging", encode_tags(tags));
        }
        Self::ensure_success(self.send(request)?)?;
        debug!(url = %url, "uploaded object");
        Ok(url)
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, DepotError> {
        let mut request = self.client.get(self.url(bucket, key));
        if let Some(range) = range {
            if range.end <= range.start {
                return Ok(Vec::new());
            }
            request = request.header(RANGE, format!("bytes={}-{}", range.start, range.end - 1));
        }
        let response = Self::ensure_success(self.send(request)?)?;
        let bytes = response.bytes().map_err(map_http_error)?;
        Ok(bytes.to_vec())
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError> {
        let response = Self::ensure_success(self.send(self.client.get(self.url(bucket, key)))?)?;
        Ok(Box::new(response))
    }

    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError> {
        let mut body = String::from("<Tagging><TagSet>");
        for (name, value) in tags {
            body.push_str(&format!("<Tag><Key>{name}</Key><Value>{value}</Value></Tag>"));
        }
        body.push_str("</TagSet></Tagging>");
        let request = self
            .client
            .put(format!("{}?tagging", self.url(bucket, key)))
            .body(body);
        Self::ensure_success(self.send(request)?)?;
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError> {
        let response = self.send(self.client.head(self.url(bucket, key)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Self::ensure_success(response).map(|_| true),
        }
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }
}

#[derive(Debug, Clone, Default)]
struct StoredObject {
    bytes: Vec<u8>,
    tags: BTreeMap<String, String>,
}

/// In-memory store that counts uploads.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    puts: Mutex<usize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().map(|count| *count).unwrap_or_default()
    }

    pub fn tags(&self, bucket: &str, key: &str) -> BTreeMap<String, String> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| {
                objects
                    .get(&(bucket.to_string(), key.to_string()))
                    .map(|object| object.tags.clone())
            })
            .unwrap_or_default()
    }

    /// Replaces stored bytes without counting an upload.
    pub fn overwrite(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), DepotError> {
        let mut objects = self.lock()?;
        objects
            .entry((bucket.to_string(), key.to_string()))
            .or_default()
            .bytes = bytes.to_vec();
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), StoredObject>>, DepotError>
    {
        self.objects
            .lock()
            .map_err(|_| DepotError::ObjectStoreHttp("object store lock poisoned".to_string()))
    }

    fn missing(bucket: &str, key: &str) -> DepotError {
        DepotError::ObjectStoreStatus {
            status: 404,
            message: format!("no such object {bucket}/{key}"),
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        tags: &Tags,
    ) -> Result<String, DepotError> {
        let bytes = fs::read(source).map_err(|err| DepotError::Filesystem(err.to_string()))?;
        self.lock()?.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                tags: tags.iter().cloned().collect(),
            },
        );
        if let Ok(mut count) = self.puts.lock() {
            *count += 1;
        }
        Ok(self.url(bucket, key))
    }

    fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, DepotError> {
        let objects = self.lock()?;
        let object = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Self::missing(bucket, key))?;
        let bytes = &object.bytes;
        Ok(match range {
            Some(range) => {
                let start = (range.start as usize).min(bytes.len());
                let end = (range.end as usize).clamp(start, bytes.len());
                bytes[start..end].to_vec()
            }
            None => bytes.clone(),
        })
    }

    fn open(&self, bucket: &str, key: &str) -> Result<Box<dyn Read + Send>, DepotError> {
        Ok(Box::new(io::Cursor::new(self.get(bucket, key, None)?)))
    }

    fn tag(&self, bucket: &str, key: &str, tags: &Tags) -> Result<(), DepotError> {
        let mut objects = self.lock()?;
        let object = objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Self::missing(bucket, key))?;
        object.tags = tags.iter().cloned().collect();
        Ok(())
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, DepotError> {
        Ok(self
            .lock()?
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{bucket}/{key}")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn fs_store_round_trip_with_tags() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("local.rtdc");
        fs::write(&source, b"0123456789").unwrap();
        let store = FsObjectStore::new(&temp.path().join("objects"));
        let tags = vec![("public".to_string(), "true".to_string())];

        assert!(!store.exists("circle-1", "resource/abc/def/0123").unwrap());
        let url = store
            .put("circle-1", "resource/abc/def/0123", &source, &tags)
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(store.exists("circle-1", "resource/abc/def/0123").unwrap());
        assert_eq!(
            store.get("circle-1", "resource/abc/def/0123", Some(2..5)).unwrap(),
            b"234"
        );
        assert_eq!(
            store.tags("circle-1", "resource/abc/def/0123").unwrap()["public"],
            "true"
        );
    }

    #[test]
    fn fs_store_rejects_escaping_keys() {
        let temp = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(temp.path());
        let err = store.exists("circle-1", "../outside").unwrap_err();
        assert_matches!(err, DepotError::InvalidInput(_));
    }

    #[test]
    fn missing_object_is_a_404() {
        let store = MemoryObjectStore::new();
        let err = store.get("b", "k", None).unwrap_err();
        assert_matches!(err, DepotError::ObjectStoreStatus { status: 404, .. });
    }

    #[test]
    fn tags_are_encoded_as_query() {
        let tags = vec![
            ("public".to_string(), "true".to_string()),
            ("owner".to_string(), "x".to_string()),
        ];
        assert_eq!(encode_tags(&tags), "public=true&owner=x");
    }
}
