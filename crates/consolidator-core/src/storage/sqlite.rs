use rusqlite::{Connection, Result, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::debug;

const SCHEMA_VERSION: i64 = 2;

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.configure_pragmas()?;
        db.migrate_schema()?;
        Ok(db)
    }

    fn configure_pragmas(&self) -> Result<()> {
        // journal_mode returns a row, so it can't go through execute_batch.
        let _mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -16000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 16MB cache, 5s busy timeout)");
        Ok(())
    }

    /// Check schema version and migrate if needed.
    /// Derived analysis tables from an older layout are dropped (they are recomputable);
    /// inventory and catalog tables are never dropped.
    fn migrate_schema(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > 0 && version < SCHEMA_VERSION {
            debug!(
                "Schema version {} < {}, dropping derived analysis tables",
                version, SCHEMA_VERSION
            );
            self.conn.execute_batch(
                "DROP TABLE IF EXISTS analysis_activity;
                 DROP TABLE IF EXISTS overlap_pair_feature;
                 DROP TABLE IF EXISTS overlap_pair;
                 DROP TABLE IF EXISTS category_summary;
                 DROP TABLE IF EXISTS analysis_progress;",
            )?;
        }

        self.conn.execute_batch(include_str!("schema.sql"))?;
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// `BEGIN IMMEDIATE`: takes the write lock up front, so a read-then-write
    /// transaction waits on the busy timeout instead of failing with
    /// `SQLITE_BUSY_SNAPSHOT` when another connection commits in between.
    pub fn write_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }

    pub fn truncate_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM consolidation_recommendation;
             DELETE FROM analysis_activity;
             DELETE FROM analysis_progress;
             DELETE FROM category_summary;
             DELETE FROM overlap_pair_feature;
             DELETE FROM overlap_pair;
             DELETE FROM category_revision;
             DELETE FROM product_feature;
             DELETE FROM software_product;
             DELETE FROM feature_tag;
             DELETE FROM feature_category;",
        )?;
        debug!("All tables truncated");
        Ok(())
    }
}
