use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct Layout {
    raw_path: Utf8PathBuf,
    clean_path: Utf8PathBuf,
    store_path: Utf8PathBuf,
}

impl Layout {
    pub fn new(raw_path: Utf8PathBuf, clean_path: Utf8PathBuf, store_path: Utf8PathBuf) -> Self {
        Self {
            raw_path,
            clean_path,
            store_path,
        }
    }

    pub fn under(data_dir: &Utf8Path) -> Self {
        Self {
            raw_path: data_dir.join("raw").join("effectifs.csv"),
            clean_path: data_dir.join("clean").join("csv_clean.csv"),
            store_path: data_dir.join("effectifs.sqlite3"),
        }
    }

    pub fn raw_path(&self) -> &Utf8Path {
        &self.raw_path
    }

    pub fn clean_path(&self) -> &Utf8Path {
        &self.clean_path
    }

    pub fn store_path(&self) -> &Utf8Path {
        &self.store_path
    }
}

pub fn manifest_path_for(clean_path: &Utf8Path) -> Utf8PathBuf {
    let name = clean_path.file_name().unwrap_or("clean.csv");
    clean_path.with_file_name(format!("{name}.manifest.json"))
}

pub fn partial_path_for(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("output");
    path.with_file_name(format!("{name}.part"))
}

pub fn ensure_parent(path: &Utf8Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => fs::create_dir_all(parent.as_std_path()),
        _ => Ok(()),
    }
}

pub fn non_empty_file(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

pub fn modified(path: &Utf8Path) -> io::Result<SystemTime> {
    fs::metadata(path.as_std_path())?.modified()
}

pub fn remove_if_exists(path: &Utf8Path) -> io::Result<()> {
    match fs::remove_file(path.as_std_path()) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Utf8Path, value: &T) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_bytes_atomic(path, &content)
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.as_std_path(),
        _ => std::path::Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".effectifs-etl")
        .tempfile_in(dir)?;
    io::Write::write_all(&mut temp, content)?;
    temp.as_file().sync_all()?;
    temp.persist(path.as_std_path()).map_err(|err| err.error)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> io::Result<T> {
    let content = fs::read(path.as_std_path())?;
    serde_json::from_slice(&content).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
