use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    link_violations, lookup_cluster, reconcile, Contact, ContactId, ContactStore, IdGenerator,
    IdentityError, IdentityQuery, IdentityView, LinkPrecedence, LinkViolation,
    CONTACT_ID_SEQUENCE,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Fixed-width UTC timestamps keep lexical and chronological order identical.
const TIMESTAMP_FORMAT: &str =
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY CHECK (id > 0),
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL AND linked_id <> id)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
CREATE INDEX IF NOT EXISTS idx_contacts_created_at ON contacts(created_at);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS id_sequences (
  name TEXT PRIMARY KEY,
  value INTEGER NOT NULL CHECK (value >= 0)
);

INSERT OR IGNORE INTO id_sequences(name, value)
SELECT 'contact_id', COALESCE(MAX(id), 0) FROM contacts;
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceStatus {
    pub name: String,
    pub value: Option<i64>,
    pub max_contact_id: i64,
    pub behind: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub link_violations: Vec<LinkViolation>,
    pub sequence: SequenceStatus,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.link_violations.is_empty()
            && !self.sequence.behind
    }
}

impl SqliteStore {
    /// Open a SQLite-backed contact store with default options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(
            path = %path.display(),
            busy_timeout_ms = options.busy_timeout_ms,
            "opened contact store"
        );
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;

        // Another connection may have migrated while we waited for the write lock.
        if current_schema_version(&tx)? >= version {
            return Ok(());
        }

        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Reconcile one (email, phone) pair as a single `BEGIN IMMEDIATE` transaction.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`] when reconciliation fails; every write made by
    /// the request is rolled back.
    pub fn reconcile(&mut self, query: &IdentityQuery) -> Result<IdentityView> {
        self.reconcile_with_clock(query, OffsetDateTime::now_utc)
    }

    /// Same as [`SqliteStore::reconcile`] with an explicit request timestamp.
    ///
    /// # Errors
    /// Returns an error wrapping [`IdentityError`] when reconciliation fails.
    pub fn reconcile_at(
        &mut self,
        query: &IdentityQuery,
        now: OffsetDateTime,
    ) -> Result<IdentityView> {
        self.reconcile_with_clock(query, || now)
    }

    /// The clock is read only once the write lock is held, so `created_at` follows commit order.
    fn reconcile_with_clock(
        &mut self,
        query: &IdentityQuery,
        clock: impl FnOnce() -> OffsetDateTime,
    ) -> Result<IdentityView> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reconciliation transaction")?;

        let result = {
            let scope = TransactionScope { conn: &tx };
            reconcile(&scope, &scope, query, clock())
        };

        match result {
            Ok(view) => {
                tx.commit().context("failed to commit reconciliation transaction")?;
                Ok(view)
            }
            Err(err) => {
                tracing::warn!(error = %err, "reconciliation rolled back");
                Err(err.into())
            }
        }
    }

    /// Cluster view for the cluster the given contact belongs to.
    ///
    /// # Errors
    /// Returns an error when lookups fail or the cluster has no resolvable primary.
    pub fn cluster_of(&self, id: ContactId) -> Result<Option<IdentityView>> {
        let tx = self.conn.unchecked_transaction().context("failed to start read transaction")?;
        let scope = TransactionScope { conn: &tx };
        let view = lookup_cluster(&scope, id)?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(view)
    }

    /// Load every persisted contact, soft-deleted rows included.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        select_contacts(
            &self.conn,
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at ASC, id ASC"),
            &[],
        )
    }

    /// Run quick-check, foreign-key-check, link-invariant and sequence health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let contacts = self.list_contacts()?;
        let sequence = self.sequence_status(&contacts)?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            link_violations: link_violations(&contacts),
            sequence,
            schema_status: self.schema_status()?,
        })
    }

    fn sequence_status(&self, contacts: &[Contact]) -> Result<SequenceStatus> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM id_sequences WHERE name = ?1",
                params![CONTACT_ID_SEQUENCE],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to read contact id sequence")?;
        let max_contact_id = contacts.iter().map(|contact| contact.id.0).max().unwrap_or(0);

        Ok(SequenceStatus {
            name: CONTACT_ID_SEQUENCE.to_string(),
            value,
            max_contact_id,
            behind: !matches!(value, Some(value) if value >= max_contact_id),
        })
    }
}

/// Store and id-generator view over one open transaction.
struct TransactionScope<'conn> {
    conn: &'conn Connection,
}

impl TransactionScope<'_> {
    fn contacts_where(&self, predicate: &str, values: &[Value]) -> Result<Vec<Contact>> {
        select_contacts(
            self.conn,
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND ({predicate})
                 ORDER BY created_at ASC, id ASC"
            ),
            values,
        )
    }

    fn execute(&self, sql: &str, values: &[Value]) -> Result<usize> {
        self.conn.execute(sql, params_from_iter(values.iter())).context("failed to update contacts")
    }
}

impl ContactStore for TransactionScope<'_> {
    fn find_active_matches(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        self.contacts_where(
            "email = ?1 OR phone_number = ?2",
            &[optional_text(email), optional_text(phone_number)],
        )
        .map_err(store_error)
    }

    fn load_clusters(&self, roots: &[ContactId]) -> Result<Vec<Contact>, IdentityError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = numbered_placeholders(1, roots.len());
        self.contacts_where(
            &format!("id IN ({placeholders}) OR linked_id IN ({placeholders})"),
            &id_values(roots),
        )
        .map_err(store_error)
    }

    fn get_active_contact(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
        self.contacts_where("id = ?1", &[Value::Integer(id.0)])
            .map(|contacts| contacts.into_iter().next())
            .map_err(store_error)
    }

    fn promote_to_primary(
        &self,
        id: ContactId,
        at: OffsetDateTime,
    ) -> Result<bool, IdentityError> {
        let changed = timestamp(at)
            .and_then(|at| {
                self.execute(
                    "UPDATE contacts
                     SET link_precedence = 'primary', linked_id = NULL, updated_at = ?2
                     WHERE id = ?1
                       AND deleted_at IS NULL
                       AND (link_precedence <> 'primary' OR linked_id IS NOT NULL)",
                    &[Value::Integer(id.0), Value::Text(at)],
                )
            })
            .map_err(store_error)?;
        Ok(changed > 0)
    }

    fn demote_primaries(
        &self,
        canonical: ContactId,
        roots: &[ContactId],
        at: OffsetDateTime,
    ) -> Result<usize, IdentityError> {
        if roots.is_empty() {
            return Ok(0);
        }

        let placeholders = numbered_placeholders(3, roots.len());
        timestamp(at)
            .and_then(|at| {
                let mut values = vec![Value::Integer(canonical.0), Value::Text(at)];
                values.extend(id_values(roots));
                self.execute(
                    &format!(
                        "UPDATE contacts
                         SET link_precedence = 'secondary', linked_id = ?1, updated_at = ?2
                         WHERE deleted_at IS NULL
                           AND link_precedence = 'primary'
                           AND id <> ?1
                           AND id IN ({placeholders})"
                    ),
                    &values,
                )
            })
            .map_err(store_error)
    }

    fn repoint_secondaries(
        &self,
        canonical: ContactId,
        roots: &[ContactId],
        at: OffsetDateTime,
    ) -> Result<usize, IdentityError> {
        if roots.is_empty() {
            return Ok(0);
        }

        let placeholders = numbered_placeholders(3, roots.len());
        timestamp(at)
            .and_then(|at| {
                let mut values = vec![Value::Integer(canonical.0), Value::Text(at)];
                values.extend(id_values(roots));
                self.execute(
                    &format!(
                        "UPDATE contacts
                         SET linked_id = ?1, updated_at = ?2
                         WHERE deleted_at IS NULL
                           AND linked_id <> ?1
                           AND linked_id IN ({placeholders})"
                    ),
                    &values,
                )
            })
            .map_err(store_error)
    }

    fn insert_contact(&self, contact: &Contact) -> Result<(), IdentityError> {
        insert_contact_row(self.conn, contact).map_err(store_error)
    }
}

impl IdGenerator for TransactionScope<'_> {
    fn next(&self, sequence: &str) -> Result<i64, IdentityError> {
        let value = self
            .conn
            .query_row(
                "UPDATE id_sequences SET value = value + 1 WHERE name = ?1 RETURNING value",
                params![sequence],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|err| IdentityError::IdGeneration(format!("sequence {sequence}: {err}")))?;

        value.ok_or_else(|| IdentityError::IdGeneration(format!("unknown sequence: {sequence}")))
    }
}

fn insert_contact_row(conn: &Connection, contact: &Contact) -> Result<()> {
    conn.execute(
        "INSERT INTO contacts(
            id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            contact.id.0,
            contact.email,
            contact.phone_number,
            contact.linked_id.map(|linked| linked.0),
            contact.link_precedence.as_str(),
            timestamp(contact.created_at)?,
            timestamp(contact.updated_at)?,
            contact.deleted_at.map(timestamp).transpose()?,
        ],
    )
    .with_context(|| format!("failed to insert contact {}", contact.id))?;
    Ok(())
}

fn select_contacts(conn: &Connection, sql: &str, values: &[Value]) -> Result<Vec<Contact>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare contact query")?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut contacts = Vec::new();

    while let Some(row) = rows.next()? {
        let precedence_raw: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        let deleted_at: Option<String> = row.get(7)?;

        contacts.push(Contact {
            id: ContactId(row.get(0)?),
            email: row.get(1)?,
            phone_number: row.get(2)?,
            linked_id: row.get::<_, Option<i64>>(3)?.map(ContactId),
            link_precedence: LinkPrecedence::parse(&precedence_raw)
                .ok_or_else(|| anyhow!("unknown link_precedence: {precedence_raw}"))?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            deleted_at: deleted_at.as_deref().map(parse_timestamp).transpose()?,
        });
    }

    Ok(contacts)
}

fn store_error(err: anyhow::Error) -> IdentityError {
    IdentityError::Store(format!("{err:#}"))
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

fn id_values(ids: &[ContactId]) -> Vec<Value> {
    ids.iter().map(|id| Value::Integer(id.0)).collect()
}

fn numbered_placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, timestamp(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    let format = time::format_description::parse(TIMESTAMP_FORMAT)
        .context("invalid timestamp format description")?;
    value.to_offset(UtcOffset::UTC).format(&format).context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
