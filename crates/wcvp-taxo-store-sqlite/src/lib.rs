use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use wcvp_taxo_core::{ChecklistEntry, TaxonId, TaxonomicStatus};

mod source;

pub use source::read_checklist_source;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS checklist_source (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  source_path TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  digest TEXT NOT NULL,
  entry_count INTEGER NOT NULL,
  cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checklist_entries (
  row_order INTEGER PRIMARY KEY,
  taxon_id TEXT NOT NULL UNIQUE,
  taxon_name TEXT NOT NULL,
  family TEXT NOT NULL,
  genus TEXT NOT NULL,
  species TEXT NOT NULL,
  infraspecies TEXT,
  authors TEXT,
  taxon_rank TEXT,
  taxonomic_status TEXT NOT NULL,
  accepted_taxon_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_checklist_entries_name ON checklist_entries(taxon_name);
CREATE INDEX IF NOT EXISTS idx_checklist_entries_accepted ON checklist_entries(accepted_taxon_id);
";

/// SQLite copy of a parsed checklist, keyed by the fingerprint of its source.
pub struct ChecklistCache {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub entry_count: usize,
    pub dangling_synonym_targets: usize,
    pub schema_status: SchemaStatus,
}

/// Identity of a checklist file on disk. A changed digest invalidates the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFingerprint {
    pub source_path: String,
    pub modified_at: String,
    pub size_bytes: u64,
    pub digest: String,
}

impl SourceFingerprint {
    /// Fingerprint `path` from its canonical location, modification time and size.
    ///
    /// # Errors
    /// Returns an error when the file metadata cannot be read.
    pub fn of(path: &Path) -> Result<Self> {
        let canonical = fs::canonicalize(path)
            .with_context(|| format!("failed to resolve checklist path {}", path.display()))?;
        let metadata = fs::metadata(&canonical)
            .with_context(|| format!("failed to read metadata of {}", canonical.display()))?;
        let modified = metadata
            .modified()
            .with_context(|| format!("failed to read mtime of {}", canonical.display()))?;

        let source_path = canonical.display().to_string();
        let modified_at = rfc3339_from_system(modified)?;
        let size_bytes = metadata.len();

        let mut hasher = Sha256::new();
        hasher.update(source_path.as_bytes());
        hasher.update(b"|");
        hasher.update(modified_at.as_bytes());
        hasher.update(b"|");
        hasher.update(size_bytes.to_string().as_bytes());
        let digest = format!("sha256:{:x}", hasher.finalize());

        Ok(Self { source_path, modified_at, size_bytes, digest })
    }
}

/// Checklist rows plus where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChecklist {
    pub entries: Vec<ChecklistEntry>,
    pub from_cache: bool,
    pub fingerprint: SourceFingerprint,
}

impl ChecklistCache {
    /// Open a checklist cache database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
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

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the file carries a newer schema.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Cached entries for `fingerprint`, in source order, or `None` when the
    /// cache is empty or was built from a different file state.
    ///
    /// # Errors
    /// Returns an error when cached rows cannot be read or decoded.
    pub fn load(&self, fingerprint: &SourceFingerprint) -> Result<Option<Vec<ChecklistEntry>>> {
        let cached: Option<(String, i64)> = self
            .conn
            .query_row("SELECT digest, entry_count FROM checklist_source WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .context("failed to read cached checklist fingerprint")?;

        let Some((digest, entry_count)) = cached else {
            return Ok(None);
        };
        if digest != fingerprint.digest {
            tracing::debug!(cached = %digest, current = %fingerprint.digest, "checklist cache is stale");
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT
                taxon_id, taxon_name, family, genus, species,
                infraspecies, authors, taxon_rank, taxonomic_status, accepted_taxon_id
             FROM checklist_entries
             ORDER BY row_order ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChecklistEntry {
                taxon_id: TaxonId(row.get(0)?),
                taxon_name: row.get(1)?,
                family: row.get(2)?,
                genus: row.get(3)?,
                species: row.get(4)?,
                infraspecies: row.get(5)?,
                authors: row.get(6)?,
                rank: row.get(7)?,
                taxonomic_status: TaxonomicStatus::parse(&row.get::<_, String>(8)?),
                accepted_taxon_id: row.get::<_, Option<String>>(9)?.map(TaxonId),
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode cached checklist entry")?);
        }

        if i64::try_from(entries.len()).ok() != Some(entry_count) {
            tracing::warn!(
                expected = entry_count,
                found = entries.len(),
                "checklist cache row count mismatch; rebuilding"
            );
            return Ok(None);
        }

        Ok(Some(entries))
    }

    /// Replace the cached checklist with `entries` in a single transaction.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn replace(
        &mut self,
        fingerprint: &SourceFingerprint,
        entries: &[ChecklistEntry],
    ) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM checklist_entries", [])
            .context("failed to clear cached checklist entries")?;
        tx.execute("DELETE FROM checklist_source", [])
            .context("failed to clear cached checklist fingerprint")?;

        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO checklist_entries(
                        row_order, taxon_id, taxon_name, family, genus, species,
                        infraspecies, authors, taxon_rank, taxonomic_status, accepted_taxon_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .context("failed to prepare checklist insert")?;
            for (row_order, entry) in entries.iter().enumerate() {
                insert
                    .execute(params![
                        i64::try_from(row_order).context("checklist too large to cache")?,
                        entry.taxon_id.as_str(),
                        entry.taxon_name,
                        entry.family,
                        entry.genus,
                        entry.species,
                        entry.infraspecies,
                        entry.authors,
                        entry.rank,
                        entry.taxonomic_status.as_str(),
                        entry.accepted_taxon_id.as_ref().map(TaxonId::as_str),
                    ])
                    .with_context(|| format!("failed to cache taxon_id {}", entry.taxon_id))?;
            }
        }

        tx.execute(
            "INSERT INTO checklist_source(
                id, source_path, modified_at, size_bytes, digest, entry_count, cached_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fingerprint.source_path,
                fingerprint.modified_at,
                i64::try_from(fingerprint.size_bytes).context("checklist file too large")?,
                fingerprint.digest,
                i64::try_from(entries.len()).context("checklist too large to cache")?,
                now_rfc3339()?,
            ],
        )
        .context("failed to record checklist fingerprint")?;

        tx.commit().context("failed to commit checklist cache")?;
        Ok(())
    }

    /// Run quick-check, synonym-target and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let entry_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM checklist_entries", [], |row| row.get(0))
            .context("failed to count cached checklist entries")?;

        let dangling: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM checklist_entries AS e
                 WHERE e.taxonomic_status IN ('Synonym', 'Homotypic_Synonym')
                   AND e.accepted_taxon_id IS NOT NULL
                   AND NOT EXISTS (
                     SELECT 1 FROM checklist_entries AS t WHERE t.taxon_id = e.accepted_taxon_id
                   )",
                [],
                |row| row.get(0),
            )
            .context("failed to check synonym targets")?;

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            entry_count: usize::try_from(entry_count).unwrap_or_default(),
            dangling_synonym_targets: usize::try_from(dangling).unwrap_or_default(),
            schema_status,
        })
    }
}

/// Cache file used when none is configured: the checklist path with a
/// `.sqlite3` extension.
#[must_use]
pub fn default_cache_path(source: &Path) -> PathBuf {
    source.with_extension("sqlite3")
}

/// Load checklist rows from `source`, going through the cache at `cache_path`
/// when one is given. A cache built from the same file state is reused;
/// otherwise the source is parsed and the cache rewritten.
///
/// # Errors
/// Returns an error when the source is missing or malformed, or the cache
/// cannot be opened, migrated, read, or written.
pub fn load_checklist(source: &Path, cache_path: Option<&Path>) -> Result<LoadedChecklist> {
    if !source.is_file() {
        return Err(anyhow!("checklist file does not exist: {}", source.display()));
    }
    let fingerprint = SourceFingerprint::of(source)?;

    let Some(cache_path) = cache_path else {
        let entries = read_checklist_source(source)?;
        tracing::info!(entries = entries.len(), "checklist parsed without cache");
        return Ok(LoadedChecklist { entries, from_cache: false, fingerprint });
    };

    let mut cache = ChecklistCache::open(cache_path)?;
    cache.migrate()?;

    if let Some(entries) = cache.load(&fingerprint)? {
        tracing::info!(
            entries = entries.len(),
            cache = %cache_path.display(),
            "checklist loaded from cache"
        );
        return Ok(LoadedChecklist { entries, from_cache: true, fingerprint });
    }

    let entries = read_checklist_source(source)?;
    cache.replace(&fingerprint, &entries)?;
    tracing::info!(
        entries = entries.len(),
        cache = %cache_path.display(),
        "checklist parsed and cache rebuilt"
    );
    Ok(LoadedChecklist { entries, from_cache: false, fingerprint })
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
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339_from_system(value: SystemTime) -> Result<String> {
    rfc3339(OffsetDateTime::from(value))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
