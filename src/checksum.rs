use std::fs;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::DepotError;

const BUFFER_SIZE: usize = 1 << 20;

pub fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String, DepotError> {
    let file = fs::File::open(path)
        .map_err(|err| DepotError::Filesystem(format!("open {}: {err}", path.display())))?;
    sha256_reader(file).map_err(|err| DepotError::Filesystem(err.to_string()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Deterministic UUID-shaped identifier derived from `parts`.
pub fn make_id(parts: &[&str]) -> String {
    let digest = sha256_bytes(parts.join("\n").as_bytes());
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

/// Contents of a `.sha256sums` file: `<sha256hex>  <filename>` per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sha256Sums {
    entries: Vec<(String, String)>,
}

impl Sha256Sums {
    pub fn parse(content: &str) -> Result<Self, DepotError> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (sum, name) = line.split_once("  ").ok_or_else(|| {
                DepotError::InvalidInput(format!("malformed sha256sums line: {line}"))
            })?;
            entries.push((sum.to_string(), name.to_string()));
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, DepotError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .map_err(|err| DepotError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::parse(&content)
    }

    /// Checksum recorded for exactly `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry == name)
            .map(|(sum, _)| sum.as_str())
    }

    pub fn insert(&mut self, name: &str, sum: &str) {
        match self.entries.iter_mut().find(|(_, entry)| entry == name) {
            Some(entry) => entry.0 = sum.to_string(),
            None => self.entries.push((sum.to_string(), name.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, name)| name.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (sum, name) in &self.entries {
            out.push_str(sum);
            out.push_str("  ");
            out.push_str(name);
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<(), DepotError> {
        crate::store::write_bytes_atomic(path, self.render().as_bytes())
    }
}

/// Looks up the checksum of a depot member file in its set's
/// `<stem>.sha256sums` manifest.
pub fn load_sha256sum(path: &Path) -> Result<String, DepotError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DepotError::InvalidInput(format!("invalid file name: {}", path.display())))?;
    let stem = name.splitn(4, '_').take(3).collect::<Vec<_>>().join("_");
    let stem = stem.trim_end_matches(".sha256sums");
    let sums = Sha256Sums::load(&path.with_file_name(format!("{stem}.sha256sums")))?;
    sums.get(name)
        .map(str::to_string)
        .ok_or_else(|| DepotError::NotFound(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_bytes() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            sha256_reader(&b"abc"[..]).unwrap(),
            sha256_bytes(b"abc")
        );
    }

    #[test]
    fn sums_match_exact_filename() {
        let mut sums = Sha256Sums::parse(
            "aaa  2019-08-20_1126_c083de_v1.rtdc\nbbb  2019-08-20_1126_c083de_v1_condensed.rtdc\n",
        )
        .unwrap();
        assert_eq!(sums.get("2019-08-20_1126_c083de_v1.rtdc"), Some("aaa"));
        assert_eq!(sums.get("2019-08-20_1126_c083de_v1"), None);

        sums.insert("2019-08-20_1126_c083de_v1.rtdc", "ccc");
        sums.insert("2019-08-20_1126_c083de_v2.rtdc", "ddd");
        assert_eq!(
            sums.render(),
            "ccc  2019-08-20_1126_c083de_v1.rtdc\nbbb  2019-08-20_1126_c083de_v1_condensed.rtdc\nddd  2019-08-20_1126_c083de_v2.rtdc\n"
        );
    }

    #[test]
    fn load_sha256sum_next_to_member() {
        let temp = tempfile::tempdir().unwrap();
        let member = temp.path().join("2019-08-20_1126_c083de_v1.rtdc");
        fs::write(
            temp.path().join("2019-08-20_1126_c083de.sha256sums"),
            "abc123  2019-08-20_1126_c083de_v1.rtdc\n",
        )
        .unwrap();
        assert_eq!(load_sha256sum(&member).unwrap(), "abc123");
    }

    #[test]
    fn make_id_is_deterministic() {
        let first = make_id(&["a", "b"]);
        assert_eq!(first, make_id(&["a", "b"]));
        assert_ne!(first, make_id(&["a", "c"]));
        assert_eq!(first.len(), 36);
    }
}
