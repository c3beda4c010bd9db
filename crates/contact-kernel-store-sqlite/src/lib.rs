use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use contact_kernel_core::{
    ConsolidatedContact, ContactId, ContactRecord, ContactStore, ContactUpdate, IdentityFragment,
    KernelError, LinkPrecedence, NewContact, StoreError, UpdateMatch,
};
use rusqlite::types::Value;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

// Timestamps are integer epoch microseconds so that ordered retrieval by
// creation time is a plain integer comparison.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT,
  phone_number TEXT,
  linked_id INTEGER REFERENCES contacts(id),
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  deleted_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
CREATE INDEX IF NOT EXISTS idx_contacts_created_at ON contacts(created_at);
";

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

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
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to create contacts schema")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration")?;
        Ok(())
    }

    /// Reconcile one fragment inside a single serializable unit of work.
    ///
    /// The IMMEDIATE transaction takes the writer lock before the first read,
    /// so concurrent requests carrying the same contact values serialize: the
    /// second observes the first's rows instead of creating a duplicate
    /// primary, and a merge's batch write is never observable half-applied.
    ///
    /// # Errors
    /// Propagates [`KernelError`] from the reconciliation core; a store that
    /// stays busy past its timeout surfaces as a retryable
    /// [`StoreError::Conflict`].
    pub fn reconcile(
        &mut self,
        fragment: &IdentityFragment,
    ) -> Result<ConsolidatedContact, KernelError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| KernelError::Store(to_store_error(&err)))?;
        let view = {
            let mut boundary = TxContactStore { tx: &tx };
            contact_kernel_core::reconcile(&mut boundary, fragment)?
        };
        tx.commit().map_err(|err| KernelError::Store(to_store_error(&err)))?;
        Ok(view)
    }

    /// Load every contact row, deleted ones included, in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at ASC, id ASC"
        );
        query_contacts(&self.conn, &sql, []).map_err(|err| anyhow!("failed to list contacts: {err}"))
    }

    /// Number of non-deleted contact rows.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_active(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM contacts WHERE deleted_at IS NULL", [], |row| {
                row.get(0)
            })
            .context("failed to count contacts")
    }

    /// Mark one contact deleted without removing its row. Deleted rows stay
    /// out of matching and chain assembly but remain for audit. Returns false
    /// when the id is unknown or already deleted.
    ///
    /// # Errors
    /// Returns an error when the update cannot be executed.
    pub fn soft_delete(&mut self, id: ContactId) -> Result<bool> {
        let now = timestamp_micros(OffsetDateTime::now_utc());
        let changed = self
            .conn
            .execute(
                "UPDATE contacts SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, id.0],
            )
            .with_context(|| format!("failed to soft-delete contact {id}"))?;
        Ok(changed > 0)
    }
}

/// [`ContactStore`] bound to one open transaction; every read and write of a
/// reconciliation goes through the same unit of work.
struct TxContactStore<'tx, 'conn> {
    tx: &'tx Transaction<'conn>,
}

impl ContactStore for TxContactStore<'_, '_> {
    fn find_matches(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL
               AND ((?1 IS NOT NULL AND email = ?1)
                 OR (?2 IS NOT NULL AND phone_number = ?2))"
        );
        query_contacts(self.tx, &sql, params![email, phone_number])
    }

    fn fetch_chain(&mut self, primary_id: ContactId) -> Result<Vec<ContactRecord>, StoreError> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
             ORDER BY created_at ASC, id ASC"
        );
        query_contacts(self.tx, &sql, params![primary_id.0])
    }

    fn oldest_among(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Option<ContactRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE deleted_at IS NULL AND id IN ({placeholders})
             ORDER BY created_at ASC, id ASC
             LIMIT 1"
        );
        let id_values = ids.iter().map(|id| id.0).collect::<Vec<_>>();
        let contacts = query_contacts(self.tx, &sql, rusqlite::params_from_iter(id_values))?;
        Ok(contacts.into_iter().next())
    }

    fn insert(&mut self, contact: NewContact) -> Result<ContactRecord, StoreError> {
        let micros = timestamp_micros(OffsetDateTime::now_utc());
        self.tx
            .execute(
                "INSERT INTO contacts(email, phone_number, linked_id, link_precedence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    contact.email,
                    contact.phone_number,
                    contact.linked_id.map(|id| id.0),
                    contact.link_precedence.as_str(),
                    micros,
                ],
            )
            .map_err(|err| to_store_error(&err))?;
        let id = ContactId(self.tx.last_insert_rowid());
        let assigned_at = from_timestamp_micros(micros)?;

        Ok(ContactRecord {
            id,
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: assigned_at,
            updated_at: assigned_at,
            deleted_at: None,
        })
    }

    fn batch_update(&mut self, updates: &[ContactUpdate]) -> Result<(), StoreError> {
        // Runs inside the reconcile transaction, so the whole batch commits
        // or rolls back as one unit.
        let now = timestamp_micros(OffsetDateTime::now_utc());
        for update in updates {
            apply_update(self.tx, update, now)?;
        }
        Ok(())
    }
}

fn apply_update(tx: &Transaction<'_>, update: &ContactUpdate, now: i64) -> Result<(), StoreError> {
    let (column, guard, ids) = match &update.matcher {
        UpdateMatch::PrimariesIn(ids) => ("id", " AND link_precedence = 'primary'", ids),
        UpdateMatch::LinkedTo(ids) => ("linked_id", "", ids),
    };
    if ids.is_empty() {
        return Ok(());
    }

    let mut sets = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(linked_id) = update.set_linked_id {
        values.push(Value::Integer(linked_id.0));
        sets.push(format!("linked_id = ?{}", values.len()));
    }
    if let Some(precedence) = update.set_link_precedence {
        values.push(Value::Text(precedence.as_str().to_string()));
        sets.push(format!("link_precedence = ?{}", values.len()));
    }
    values.push(Value::Integer(now));
    sets.push(format!("updated_at = ?{}", values.len()));

    let first_id_index = values.len() + 1;
    for id in ids {
        values.push(Value::Integer(id.0));
    }
    let placeholders = (first_id_index..=values.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "UPDATE contacts SET {} WHERE {column} IN ({placeholders}){guard}",
        sets.join(", ")
    );
    tx.execute(&sql, rusqlite::params_from_iter(values)).map_err(|err| to_store_error(&err))?;
    Ok(())
}

struct ContactRow {
    id: i64,
    email: Option<String>,
    phone_number: Option<String>,
    linked_id: Option<i64>,
    link_precedence: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

fn map_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRow> {
    Ok(ContactRow {
        id: row.get(0)?,
        email: row.get(1)?,
        phone_number: row.get(2)?,
        linked_id: row.get(3)?,
        link_precedence: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

fn decode_contact(row: ContactRow) -> Result<ContactRecord, StoreError> {
    let link_precedence = LinkPrecedence::parse(&row.link_precedence).ok_or_else(|| {
        StoreError::Unavailable(format!("unknown link_precedence: {}", row.link_precedence))
    })?;

    Ok(ContactRecord {
        id: ContactId(row.id),
        email: row.email,
        phone_number: row.phone_number,
        linked_id: row.linked_id.map(ContactId),
        link_precedence,
        created_at: from_timestamp_micros(row.created_at)?,
        updated_at: from_timestamp_micros(row.updated_at)?,
        deleted_at: row.deleted_at.map(from_timestamp_micros).transpose()?,
    })
}

fn query_contacts<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ContactRecord>, StoreError> {
    let mut stmt = conn.prepare(sql).map_err(|err| to_store_error(&err))?;
    let rows = stmt.query_map(params, map_contact_row).map_err(|err| to_store_error(&err))?;

    let mut contacts = Vec::new();
    for row in rows {
        contacts.push(decode_contact(row.map_err(|err| to_store_error(&err))?)?);
    }
    Ok(contacts)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read schema version")
}

fn to_store_error(err: &rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, _) = err {
        if matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StoreError::Conflict(err.to_string());
        }
    }
    StoreError::Unavailable(err.to_string())
}

fn timestamp_micros(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000).unwrap_or(i64::MAX)
}

fn from_timestamp_micros(value: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000)
        .map_err(|err| StoreError::Unavailable(format!("invalid stored timestamp {value}: {err}")))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}
