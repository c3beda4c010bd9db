use std::path::PathBuf;

use anyhow::{anyhow, Result};
use contact_kernel_core::{
    ConsolidatedContact, ContactId, ContactRecord, IdentityFragment, KernelError, StoreError,
};
use contact_kernel_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Wire shape of an identify call: the phone arrives as a JSON number and is
/// normalized to its decimal string form before matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    pub email: Option<String>,
    pub phone_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteContactResult {
    pub contact_id: ContactId,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ContactKernelApi {
    db_path: PathBuf,
}

impl ContactKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore, KernelError> {
        let mut store = self
            .open_store()
            .map_err(|err| KernelError::Store(StoreError::Unavailable(format!("{err:#}"))))?;
        store
            .migrate()
            .map_err(|err| KernelError::Store(StoreError::Unavailable(format!("{err:#}"))))?;
        Ok(store)
    }

    /// Resolve one identity fragment to its consolidated contact view.
    ///
    /// Validation runs before the store is touched so callers can tell a
    /// rejected request apart from an internal failure.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when both contact fields are
    /// absent, [`KernelError::Store`] for retryable store failures, and
    /// [`KernelError::Inconsistency`] for fatal store-shape violations.
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse, KernelError> {
        let fragment = IdentityFragment::new(
            request.email,
            request.phone_number.map(|number| number.to_string()),
        );
        fragment.validate()?;

        let mut store = self.open_migrated_store()?;
        let contact = store.reconcile(&fragment)?;
        Ok(IdentifyResponse { contact })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Load every contact row in creation order, soft-deleted ones included.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_contacts()
    }

    /// Number of active (non-deleted) contacts.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn contact_count(&self) -> Result<i64> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.count_active()
    }

    /// Soft-delete one contact. This is the administrative path; the
    /// reconciliation core never deletes and never re-promotes what deletion
    /// orphans.
    ///
    /// # Errors
    /// Returns an error when the contact does not exist, is already deleted,
    /// or the store write fails.
    pub fn delete_contact(&self, contact_id: ContactId) -> Result<DeleteContactResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let deleted = store.soft_delete(contact_id)?;
        if !deleted {
            return Err(anyhow!("contact not found or already deleted: {contact_id}"));
        }
        Ok(DeleteContactResult { contact_id, deleted })
    }
}
