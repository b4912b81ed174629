use std::path::PathBuf;

use anyhow::Result;
use contact_identity_core::{Contact, ContactId, IdentityError, IdentityQuery, IdentityView};
use contact_identity_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, StoreOptions};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Phone numbers arrive either as JSON strings or as bare JSON numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PhoneNumberInput {
    Text(String),
    Number(serde_json::Number),
}

impl PhoneNumberInput {
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Number(value) => integral_text(&value).unwrap_or_else(|| value.to_string()),
        }
    }
}

/// Integral floats such as `1e3` or `123.0` render without a fraction.
fn integral_text(value: &serde_json::Number) -> Option<String> {
    if !value.is_f64() {
        return None;
    }
    value
        .as_f64()
        .filter(|number| number.is_finite() && number.fract() == 0.0 && number.abs() < 1e21)
        .map(|number| format!("{number:.0}"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "phoneNumber")]
    pub phone_number: Option<PhoneNumberInput>,
}

impl IdentifyRequest {
    /// Normalize the raw request into a validated query.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither an email nor a phone number is present.
    pub fn into_query(self) -> Result<IdentityQuery, IdentityError> {
        IdentityQuery::new(self.email, self.phone_number.map(PhoneNumberInput::into_text))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: IdentityView,
}

#[derive(Debug, Clone)]
pub struct IdentityApi {
    db_path: PathBuf,
    options: StoreOptions,
}

impl IdentityApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_options(db_path, StoreOptions::default())
    }

    #[must_use]
    pub fn with_options(db_path: PathBuf, options: StoreOptions) -> Self {
        Self { db_path, options }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_options(&self.db_path, self.options)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
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

    /// Reconcile one submitted (email, phone) pair.
    ///
    /// The request is validated before the database is touched.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`] when validation or reconciliation fails, or a
    /// store error when the database cannot be opened or migrated.
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse> {
        let query = request.into_query()?;
        let mut store = self.open_migrated_store()?;
        let contact = store.reconcile(&query)?;
        Ok(IdentifyResponse { contact })
    }

    /// Cluster view for the cluster the contact belongs to, or `None` for unknown contacts.
    ///
    /// # Errors
    /// Returns an error when lookup fails.
    pub fn contact_cluster(&self, id: ContactId) -> Result<Option<IdentityView>> {
        let store = self.open_migrated_store()?;
        store.cluster_of(id)
    }

    /// # Errors
    /// Returns an error when contacts cannot be loaded.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let store = self.open_migrated_store()?;
        store.list_contacts()
    }

    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated_store()?;
        let report = store.integrity_check()?;
        if !report.is_clean() {
            tracing::warn!(
                link_violations = report.link_violations.len(),
                foreign_key_violations = report.foreign_key_violations.len(),
                sequence_behind = report.sequence.behind,
                "integrity check found problems"
            );
        }
        Ok(report)
    }
}
