//! Rendered manifests on disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Manifest files from paths and directories, sorted, read lazily.
/// `-` stands for standard input.
#[derive(Debug, Clone, Default)]
pub struct FileSource {
    files: Vec<PathBuf>,
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    for entry in entries {
        let path = entry.with_context(|| format!("reading directory {}", dir.display()))?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()).is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str())) {
            out.push(path);
        }
    }
    Ok(())
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut files = Vec::new();
        for p in paths {
            let p = p.as_ref();
            if p == Path::new("-") || p.is_file() {
                files.push(p.to_path_buf());
                continue;
            }
            let mut found = Vec::new();
            walk(p, &mut found)?;
            found.sort();
            files.extend(found);
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] { &self.files }
}

fn read(path: &Path) -> Result<(String, Vec<u8>)> {
    if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf).context("reading standard input")?;
        return Ok(("stdin".to_string(), buf));
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok((path.display().to_string(), bytes))
}

impl IntoIterator for FileSource {
    type Item = Result<(String, Vec<u8>)>;
    type IntoIter = Box<dyn Iterator<Item = Self::Item>>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.files.into_iter().map(|p| read(&p)))
    }
}
