use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use billing_core::{
    AccountId, Capability, GroupId, Identity, IdentityRef, OperatorId, TariffId, TariffLink,
    TariffLinkId, INITIAL_VERSION,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Default bound on waiting for a competing writer.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(3);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS operators (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  login TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  display_name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operator_groups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS operator_group_members (
  group_id INTEGER NOT NULL,
  operator_id INTEGER NOT NULL,
  PRIMARY KEY (group_id, operator_id),
  FOREIGN KEY (group_id) REFERENCES operator_groups(id) ON DELETE CASCADE,
  FOREIGN KEY (operator_id) REFERENCES operators(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS group_capabilities (
  group_id INTEGER NOT NULL,
  capability TEXT NOT NULL CHECK (capability IN ('accounts.read','tariffs.read','tariffs.update')),
  PRIMARY KEY (group_id, capability),
  FOREIGN KEY (group_id) REFERENCES operator_groups(id) ON DELETE CASCADE
);

-- updated_by is a weak reference: no foreign key, resolved with a LEFT JOIN on read.
CREATE TABLE IF NOT EXISTS tariff_links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id INTEGER NOT NULL UNIQUE CHECK (account_id > 0),
  tariff_id INTEGER NOT NULL CHECK (tariff_id > 0),
  version INTEGER NOT NULL CHECK (version >= 1),
  updated_at TEXT NOT NULL,
  updated_by INTEGER
);

CREATE INDEX IF NOT EXISTS idx_group_members_operator ON operator_group_members(operator_id);
";

const LINK_SELECT_SQL: &str = r"
SELECT
  tl.id, tl.account_id, tl.tariff_id, tl.version, tl.updated_at, tl.updated_by,
  op.id, op.login
FROM tariff_links tl
LEFT JOIN operators op ON op.id = tl.updated_by";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Operator row including the stored password hash. Never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRecord {
    pub identity: Identity,
    pub password_hash: String,
}

/// Result of a compare-and-set on a tariff link version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { version: i64, updated_at: OffsetDateTime },
    /// The row exists but its version differs from the expected one.
    Conflict,
    NotFound,
}

impl SqliteStore {
    /// Open the store with [`DEFAULT_BUSY_TIMEOUT`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a SQLite-backed billing store. `busy_timeout` bounds how long a
    /// statement waits on a competing writer before failing with `SQLITE_BUSY`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
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
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
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
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_timestamp()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration v1")?;
        tracing::info!(version = 1, "applied billing schema migration");
        Ok(())
    }

    /// Create an operator. `password_hash` must already be a PHC hash string.
    ///
    /// # Errors
    /// Returns an error when the login is taken or the insert fails.
    pub fn insert_operator(
        &mut self,
        login: &str,
        password_hash: &str,
        display_name: &str,
    ) -> Result<Identity> {
        if login.trim().is_empty() {
            return Err(anyhow!("operator login MUST NOT be empty"));
        }

        let inserted = self.conn.execute(
            "INSERT INTO operators(login, password_hash, display_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![login, password_hash, display_name, now_timestamp()?],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                return Err(anyhow!("operator login already exists: {login}"));
            }
            Err(err) => return Err(err).context("failed to insert operator"),
        }

        Ok(Identity {
            id: OperatorId(self.conn.last_insert_rowid()),
            login: login.to_string(),
            display_name: display_name.to_string(),
        })
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored row cannot be decoded.
    pub fn operator_by_login(&self, login: &str) -> Result<Option<OperatorRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, login, display_name, password_hash
                 FROM operators WHERE login = ?1",
                params![login],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to look up operator by login")?;

        Ok(row.map(|(id, login, display_name, password_hash)| OperatorRecord {
            identity: Identity { id: OperatorId(id), login, display_name },
            password_hash,
        }))
    }

    /// Identity lookup used to resolve token subjects.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn operator_by_id(&self, id: OperatorId) -> Result<Option<Identity>> {
        self.conn
            .query_row(
                "SELECT id, login, display_name FROM operators WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok(Identity {
                        id: OperatorId(row.get(0)?),
                        login: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to look up operator by id")
    }

    /// # Errors
    /// Returns an error when the group name is taken or the insert fails.
    pub fn create_group(&mut self, name: &str, description: &str) -> Result<GroupId> {
        self.conn
            .execute(
                "INSERT INTO operator_groups(name, description) VALUES (?1, ?2)",
                params![name, description],
            )
            .with_context(|| format!("failed to create operator group {name}"))?;
        Ok(GroupId(self.conn.last_insert_rowid()))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn group_by_name(&self, name: &str) -> Result<Option<GroupId>> {
        self.conn
            .query_row("SELECT id FROM operator_groups WHERE name = ?1", params![name], |row| {
                row.get(0).map(GroupId)
            })
            .optional()
            .context("failed to look up operator group")
    }

    /// Add an operator to a group. Adding an existing member is a no-op.
    ///
    /// # Errors
    /// Returns an error when either side does not exist or the insert fails.
    pub fn add_group_member(&mut self, group: GroupId, operator: OperatorId) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO operator_group_members(group_id, operator_id) VALUES (?1, ?2)",
                params![group.0, operator.0],
            )
            .context("failed to add operator group member")?;
        Ok(())
    }

    /// Grant a capability to every member of a group. Re-granting is a no-op.
    ///
    /// # Errors
    /// Returns an error when the group does not exist or the insert fails.
    pub fn grant_capability(&mut self, group: GroupId, capability: Capability) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO group_capabilities(group_id, capability) VALUES (?1, ?2)",
                params![group.0, capability.as_str()],
            )
            .context("failed to grant group capability")?;
        Ok(())
    }

    /// Whether any group of `operator` carries `capability`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_capability(&self, operator: OperatorId, capability: Capability) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1
                    FROM operator_group_members gm
                    INNER JOIN group_capabilities gc ON gc.group_id = gm.group_id
                    WHERE gm.operator_id = ?1 AND gc.capability = ?2
                 )",
                params![operator.0, capability.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check operator capability")?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when the lookup fails or an unknown capability is stored.
    pub fn capabilities_for(&self, operator: OperatorId) -> Result<Vec<Capability>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT gc.capability
             FROM operator_group_members gm
             INNER JOIN group_capabilities gc ON gc.group_id = gm.group_id
             WHERE gm.operator_id = ?1
             ORDER BY gc.capability ASC",
        )?;
        let rows = stmt.query_map(params![operator.0], |row| row.get::<_, String>(0))?;

        let mut capabilities = Vec::new();
        for row in rows {
            let raw = row?;
            capabilities.push(Capability::parse(&raw).map_err(|err| anyhow!("{err}"))?);
        }
        Ok(capabilities)
    }

    /// Create a tariff link at [`INITIAL_VERSION`] with no tracked updater.
    ///
    /// # Errors
    /// Returns an error when the account already has a link or the insert fails.
    pub fn insert_tariff_link(
        &mut self,
        account_id: AccountId,
        tariff_id: TariffId,
    ) -> Result<TariffLink> {
        self.conn
            .execute(
                "INSERT INTO tariff_links(account_id, tariff_id, version, updated_at, updated_by)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![account_id.0, tariff_id.0, INITIAL_VERSION, now_timestamp()?],
            )
            .with_context(|| format!("failed to provision tariff link for account {account_id}"))?;

        let id = TariffLinkId(self.conn.last_insert_rowid());
        self.get_tariff_link(id)?
            .ok_or_else(|| anyhow!("tariff link {id} missing right after insert"))
    }

    /// Load a tariff link with its last updater resolved.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored timestamp is malformed.
    pub fn get_tariff_link(&self, id: TariffLinkId) -> Result<Option<TariffLink>> {
        let query = format!("{LINK_SELECT_SQL} WHERE tl.id = ?1");
        let row = self
            .conn
            .query_row(&query, params![id.0], LinkRow::from_row)
            .optional()
            .context("failed to load tariff link")?;
        row.map(LinkRow::into_link).transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or a stored timestamp is malformed.
    pub fn get_tariff_link_by_account(&self, account_id: AccountId) -> Result<Option<TariffLink>> {
        let query = format!("{LINK_SELECT_SQL} WHERE tl.account_id = ?1");
        let row = self
            .conn
            .query_row(&query, params![account_id.0], LinkRow::from_row)
            .optional()
            .context("failed to load tariff link by account")?;
        row.map(LinkRow::into_link).transpose()
    }

    /// Move a tariff link to `tariff_id` only if its stored version equals
    /// `expected_version`. The predicate and the write are one `UPDATE`
    /// statement; the existence probe that classifies a miss runs in the same
    /// write transaction, so no other writer can interleave.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started (including
    /// `SQLITE_BUSY` after the busy timeout) or a statement fails.
    pub fn conditional_update(
        &mut self,
        id: TariffLinkId,
        tariff_id: TariffId,
        expected_version: i64,
        acting: OperatorId,
    ) -> Result<UpdateOutcome> {
        let now = now_timestamp()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start tariff link update transaction")?;

        let applied = tx
            .query_row(
                "UPDATE tariff_links
                 SET tariff_id = ?1,
                     version = version + 1,
                     updated_at = MAX(updated_at, ?2),
                     updated_by = ?3
                 WHERE id = ?4 AND version = ?5
                 RETURNING version, updated_at",
                params![tariff_id.0, now, acting.0, id.0, expected_version],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to apply conditional tariff link update")?;

        let outcome = match applied {
            Some((version, updated_at)) => {
                UpdateOutcome::Applied { version, updated_at: parse_timestamp(&updated_at)? }
            }
            None => {
                let exists = tx
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM tariff_links WHERE id = ?1)",
                        params![id.0],
                        |row| row.get::<_, i64>(0),
                    )
                    .context("failed to probe tariff link existence")?;
                if exists == 1 {
                    UpdateOutcome::Conflict
                } else {
                    UpdateOutcome::NotFound
                }
            }
        };

        tx.commit().context("failed to commit tariff link update")?;
        tracing::debug!(link_id = id.0, expected_version, ?outcome, "conditional tariff link update");
        Ok(outcome)
    }
}

/// Whether `err` came from lock contention that outlived the busy timeout.
/// Such failures left no partial write behind and are safe to retry.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<rusqlite::Error>().is_some_and(|sqlite| {
            matches!(
                sqlite.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
        })
    })
}

struct LinkRow {
    id: i64,
    account_id: i64,
    tariff_id: i64,
    version: i64,
    updated_at: String,
    updated_by: Option<i64>,
    operator_id: Option<i64>,
    operator_login: Option<String>,
}

impl LinkRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            tariff_id: row.get(2)?,
            version: row.get(3)?,
            updated_at: row.get(4)?,
            updated_by: row.get(5)?,
            operator_id: row.get(6)?,
            operator_login: row.get(7)?,
        })
    }

    fn into_link(self) -> Result<TariffLink> {
        let updated_by_operator = match (self.operator_id, self.operator_login) {
            (Some(id), Some(login)) => Some(IdentityRef { id: OperatorId(id), login }),
            _ => None,
        };

        Ok(TariffLink {
            id: TariffLinkId(self.id),
            account_id: AccountId(self.account_id),
            tariff_id: TariffId(self.tariff_id),
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            updated_by: self.updated_by.map(OperatorId),
            updated_by_operator,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read schema version")
}

fn now_timestamp() -> Result<String> {
    format_timestamp(OffsetDateTime::now_utc())
}

// Fixed-width UTC text so that string order is chronological order; the
// conditional update relies on this for `MAX(updated_at, ?)`.
fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        raw,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored timestamp: {raw}"))
}
