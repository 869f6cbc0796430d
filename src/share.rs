//! Files offered to the network.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task, time};

/// One file offered to other servents.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedFile {
    /// Index announced in query hits and used in download requests.
    pub index: u32,
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Source of the files this servent shares.
pub trait SharedFiles: Send + Sync {
    /// Current list of shared files.
    fn list(&self) -> Vec<SharedFile>;

    /// Bring the list up to date with its backing store. May block.
    fn refresh(&self) {}

    /// Look up the file a download request refers to.
    fn find(&self, index: u32, name: &str) -> Option<SharedFile> {
        self.list()
            .into_iter()
            .find(|file| file.index == index && file.name == name)
    }

    /// Files whose name contains the search criteria, ignoring case.
    fn search(&self, criteria: &str) -> Vec<SharedFile> {
        let criteria = criteria.trim().to_lowercase();

        if criteria.is_empty() {
            return Vec::new();
        }

        self.list()
            .into_iter()
            .filter(|file| file.name.to_lowercase().contains(&criteria))
            .collect()
    }

    /// Number of shared files and their total size in kilobytes.
    fn stats(&self) -> (u32, u32) {
        let files = self.list();
        let bytes: u64 = files.iter().map(|file| file.size).sum();

        (saturate(files.len() as u64), saturate(bytes / 1024))
    }
}

impl SharedFiles for Vec<SharedFile> {
    fn list(&self) -> Vec<SharedFile> {
        self.clone()
    }
}

/// Shares the regular files found directly inside a directory.
///
/// The listing is cached and only re-read by [`SharedFiles::refresh`], which a running servent
/// calls periodically. Indices follow the sorted file names.
#[derive(Debug)]
pub struct SharedDirectory {
    path: PathBuf,
    files: Mutex<Vec<SharedFile>>,
}

impl SharedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(&self) -> io::Result<Vec<SharedFile>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;

            if !metadata.is_file() {
                continue;
            }

            if let Ok(name) = entry.file_name().into_string() {
                entries.push((name, metadata.len(), entry.path()));
            }
        }

        entries.sort();

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(index, (name, size, path))| SharedFile {
                index: index as u32,
                name,
                size,
                path,
            })
            .collect())
    }
}

impl SharedFiles for SharedDirectory {
    fn list(&self) -> Vec<SharedFile> {
        self.files.lock().unwrap().clone()
    }

    /// Re-read the directory. On failure the previous listing is kept.
    fn refresh(&self) {
        match self.scan() {
            Ok(files) => {
                log::trace!("Sharing {} files from {}", files.len(), self.path.display());
                *self.files.lock().unwrap() = files;
            }
            Err(error) => log::warn!(
                "Failed to read shared directory {}: {}",
                self.path.display(),
                error
            ),
        }
    }
}

/// Refresh the shared files off the async worker threads.
pub(crate) async fn refresh(shared: Arc<dyn SharedFiles>) {
    if let Err(error) = task::spawn_blocking(move || shared.refresh()).await {
        log::error!("Shared files refresh failed: {}", error);
    }
}

pub(crate) async fn run_refresh(shared: Arc<dyn SharedFiles>, interval: Duration) {
    loop {
        time::sleep(interval).await;
        refresh(shared.clone()).await;
    }
}

pub(crate) fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
