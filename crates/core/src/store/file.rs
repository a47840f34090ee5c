use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use super::{StoreBackend, StoreError};
use crate::types::OrganizationId;

/// One pretty-printed JSON file per organization inside `dir`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, organization: &OrganizationId) -> PathBuf {
        let name: String = organization
            .as_str()
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl StoreBackend for FileBackend {
    async fn read(&self, organization: &OrganizationId) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(organization)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, organization: &OrganizationId, bytes: Vec<u8>) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(organization);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(path = %path.display(), "Stored state written");
        Ok(())
    }

    async fn delete(&self, organization: &OrganizationId) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(organization)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
