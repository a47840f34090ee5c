use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{StoreBackend, StoreError};
use crate::types::OrganizationId;

/// Volatile backend; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<HashMap<OrganizationId, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes, bypassing serialization.
    pub fn insert_raw(&self, organization: &OrganizationId, bytes: Vec<u8>) {
        self.records.lock().insert(organization.clone(), bytes);
    }

    pub fn raw(&self, organization: &OrganizationId) -> Option<Vec<u8>> {
        self.records.lock().get(organization).cloned()
    }
}

impl StoreBackend for MemoryBackend {
    async fn read(&self, organization: &OrganizationId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.raw(organization))
    }

    async fn write(&self, organization: &OrganizationId, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.insert_raw(organization, bytes);
        Ok(())
    }

    async fn delete(&self, organization: &OrganizationId) -> Result<(), StoreError> {
        self.records.lock().remove(organization);
        Ok(())
    }
}
