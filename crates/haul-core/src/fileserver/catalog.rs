//! Files the server is willing to hand out.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// A file registered with the server under `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    /// Length at registration; requests re-read the live length.
    pub length: u64,
}

impl ContentFile {
    pub fn from_path(id: impl Into<String>, path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            id: id.into(),
            path,
            name,
            length: meta.len(),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry<'a> {
    id: &'a str,
    name: &'a str,
    length: u64,
}

#[derive(Default)]
pub(crate) struct Catalog {
    files: BTreeMap<String, ContentFile>,
}

impl Catalog {
    pub fn insert(&mut self, file: ContentFile) {
        self.files.insert(file.id.clone(), file);
    }

    pub fn remove(&mut self, id: &str) -> Option<ContentFile> {
        self.files.remove(id)
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn get(&self, id: &str) -> Option<&ContentFile> {
        self.files.get(id)
    }

    pub fn all(&self) -> Vec<ContentFile> {
        self.files.values().cloned().collect()
    }

    /// JSON array of `{Id, Name, Length}`. Paged when `page >= 0` and `size > 0`.
    pub fn to_json(&self, page: i64, size: i64) -> String {
        let entries = self.files.values().map(|f| CatalogEntry {
            id: &f.id,
            name: &f.name,
            length: f.length,
        });
        let entries: Vec<CatalogEntry<'_>> = if page >= 0 && size > 0 {
            entries
                .skip((page as usize).saturating_mul(size as usize))
                .take(size as usize)
                .collect()
        } else {
            entries.collect()
        };
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str) -> ContentFile {
        ContentFile {
            id: id.to_string(),
            path: PathBuf::from(format!("/srv/{id}")),
            name: format!("{id}.bin"),
            length: 10,
        }
    }

    #[test]
    fn catalog_pages() {
        let mut c = Catalog::default();
        for id in ["a", "b", "c"] {
            c.insert(file(id));
        }
        let all: serde_json::Value = serde_json::from_str(&c.to_json(-1, -1)).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 3);
        let second: serde_json::Value = serde_json::from_str(&c.to_json(1, 2)).unwrap();
        let second = second.as_array().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0]["Id"], "c");
        assert_eq!(second[0]["Length"], 10);
    }

    #[test]
    fn from_path_reads_length_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("movie.mkv");
        std::fs::write(&p, b"12345").unwrap();
        let f = ContentFile::from_path("7", &p).unwrap();
        assert_eq!(f.length, 5);
        assert_eq!(f.name, "movie.mkv");
        assert!(ContentFile::from_path("8", dir.path()).is_err());
    }
}
