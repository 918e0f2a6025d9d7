//! SQLite cookie table.
//!
//! One row per persistent cookie, keyed by `(protocol, host, path, name)`. Times
//! are stored as doubles in seconds since the epoch.
//!
//! A [`CookieTable`] is created on the backing-store worker thread and must only
//! be used there; every entry point asserts this.
//!
//! ## Caveat
//! The `UPDATE` statement locates the row by `(name, host, path)` only and then
//! rewrites `protocol` as well. Updating a cookie whose protocol differs from the
//! stored row moves that row to the new protocol instead of touching the row of
//! the old protocol.

use std::path::Path;
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, OpenFlags, Row, Transaction};
use r2d2_sqlite::SqliteConnectionManager;

use crate::cookies::cookie::{is_ip_address, Cookie};
use crate::cookies::store::{PendingWrite, WriteAction};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS cookies (
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        host TEXT NOT NULL,
        path TEXT NOT NULL,
        expiry DOUBLE,
        lastAccessed DOUBLE,
        isSecure INTEGER,
        isHttpOnly INTEGER,
        creationTime DOUBLE,
        protocol TEXT NOT NULL,
        PRIMARY KEY (protocol, host, path, name)
    );";

const INSERT_SQL: &str = "INSERT OR REPLACE INTO cookies
        (name, value, host, path, expiry, lastAccessed, isSecure, isHttpOnly, creationTime, protocol)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const UPDATE_SQL: &str = "UPDATE cookies SET
        name = ?1, value = ?2, host = ?3, path = ?4, expiry = ?5, lastAccessed = ?6,
        isSecure = ?7, isHttpOnly = ?8, creationTime = ?9, protocol = ?10
        WHERE name = ?1 AND host = ?3 AND path = ?4";

const DELETE_SQL: &str =
    "DELETE FROM cookies WHERE name = ?1 AND host = ?2 AND path = ?3 AND protocol = ?4";

const SELECT_ALL_SQL: &str = "SELECT name, value, host, path, expiry, lastAccessed, isSecure,
        isHttpOnly, creationTime, protocol FROM cookies";

const SELECT_OLDEST_SQL: &str = "SELECT name, value, host, path, expiry, lastAccessed, isSecure,
        isHttpOnly, creationTime, protocol FROM cookies ORDER BY lastAccessed ASC LIMIT ?1";

fn to_secs(millis: i64) -> f64 {
    millis as f64 / 1000.0
}

fn to_millis(secs: f64) -> i64 {
    (secs * 1000.0).round() as i64
}

/// Durable cookie table owned by the backing-store worker.
pub struct CookieTable {
    pool: Pool<SqliteConnectionManager>,
    owner: ThreadId,
}

impl CookieTable {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(|c| {
                c.busy_timeout(Duration::from_millis(500))?;
                c.execute_batch(CREATE_TABLE_SQL)?;
                Ok(())
            });

        // Only the worker thread talks to the database.
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;

        Ok(Self {
            pool,
            owner: thread::current().id(),
        })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "cookie table used outside its worker thread"
        );
        Ok(self.pool.get()?)
    }

    /// Applies `batch` in order inside one transaction.
    ///
    /// A failing statement is logged and skipped; the others still commit.
    /// Returns the number of statements that succeeded.
    pub fn write_batch(&self, batch: Vec<PendingWrite>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut applied = 0;

        for PendingWrite { cookie, action } in batch {
            match Self::execute(&tx, &cookie, action) {
                Ok(_) => applied += 1,
                Err(e) => error!(
                    "Cookie {:?} of {} failed for '{}': {}",
                    action, cookie.domain, cookie.name, e
                ),
            }
        }

        tx.commit()?;
        Ok(applied)
    }

    fn execute(tx: &Transaction<'_>, cookie: &Cookie, action: WriteAction) -> Result<usize> {
        let rows = match action {
            WriteAction::Insert | WriteAction::Update => {
                let sql = if action == WriteAction::Insert {
                    INSERT_SQL
                } else {
                    UPDATE_SQL
                };
                let mut stmt = tx.prepare_cached(sql)?;
                stmt.execute(params![
                    cookie.name,
                    cookie.value,
                    cookie.domain,
                    cookie.path,
                    to_secs(cookie.expiry.unwrap_or(0)),
                    to_secs(cookie.last_accessed),
                    cookie.secure as i64,
                    cookie.http_only as i64,
                    to_secs(cookie.creation_time),
                    cookie.protocol,
                ])?
            }
            WriteAction::Delete => {
                let mut stmt = tx.prepare_cached(DELETE_SQL)?;
                stmt.execute(params![cookie.name, cookie.domain, cookie.path, cookie.protocol])?
            }
        };

        Ok(rows)
    }

    /// Reads every row, or the `limit` least recently accessed rows when
    /// `limit > 0`.
    pub fn load(&self, limit: usize) -> Result<Vec<Cookie>> {
        let conn = self.conn()?;

        let cookies: Vec<Cookie> = if limit > 0 {
            let mut stmt = conn.prepare_cached(SELECT_OLDEST_SQL)?;
            let rows = stmt.query_map([limit as i64], Self::cookie_from_row)?;
            let cookies = rows.collect::<Result<Vec<_>, _>>()?;
            cookies
        } else {
            let mut stmt = conn.prepare_cached(SELECT_ALL_SQL)?;
            let rows = stmt.query_map([], Self::cookie_from_row)?;
            let cookies = rows.collect::<Result<Vec<_>, _>>()?;
            cookies
        };

        debug!("Loaded {} cookies from database", cookies.len());
        Ok(cookies)
    }

    fn cookie_from_row(row: &Row<'_>) -> r2d2_sqlite::rusqlite::Result<Cookie> {
        let host: String = row.get(2)?;

        Ok(Cookie {
            name: row.get(0)?,
            value: row.get(1)?,
            domain_is_ip: is_ip_address(&host),
            domain: host,
            path: row.get(3)?,
            expiry: Some(to_millis(row.get::<_, f64>(4)?)),
            last_accessed: to_millis(row.get::<_, f64>(5)?),
            secure: row.get::<_, i64>(6)? != 0,
            http_only: row.get::<_, i64>(7)? != 0,
            creation_time: to_millis(row.get::<_, f64>(8)?),
            protocol: row.get(9)?,
            force_expired: false,
        })
    }

    /// Deletes every row.
    pub fn delete_all(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM cookies", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistent(name: &str, domain: &str, protocol: &str, accessed: i64) -> Cookie {
        let mut c = Cookie::new(name, "v", domain, "/", protocol, accessed);
        c.expiry = Some(9_000_000_000_000);
        c
    }

    fn write(table: &CookieTable, cookie: &Cookie, action: WriteAction) -> usize {
        table
            .write_batch(vec![PendingWrite {
                cookie: cookie.clone(),
                action,
            }])
            .unwrap()
    }

    #[test]
    fn insert_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();

        let mut c = persistent("id", ".example.com", "https", 1_234);
        c.secure = true;
        c.http_only = true;
        write(&table, &c, WriteAction::Insert);

        let loaded = table.load(0).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], c);
        assert!(!loaded[0].is_session());
    }

    #[test]
    fn insert_replaces_same_primary_key() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();

        let mut c = persistent("id", "example.com", "http", 1);
        write(&table, &c, WriteAction::Insert);
        c.value = "second".into();
        write(&table, &c, WriteAction::Insert);

        let loaded = table.load(0).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value, "second");
    }

    #[test]
    fn update_ignores_protocol_when_locating_row() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();

        let c = persistent("id", "example.com", "https", 1);
        write(&table, &c, WriteAction::Insert);

        let mut moved = c.clone();
        moved.protocol = "http".into();
        moved.value = "updated".into();
        assert_eq!(write(&table, &moved, WriteAction::Update), 1);

        let loaded = table.load(0).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].protocol, "http");
        assert_eq!(loaded[0].value, "updated");

        // Delete does match on protocol: the old protocol finds nothing.
        write(&table, &c, WriteAction::Delete);
        assert_eq!(table.load(0).unwrap().len(), 1);
        write(&table, &moved, WriteAction::Delete);
        assert!(table.load(0).unwrap().is_empty());
    }

    #[test]
    fn failing_statement_is_skipped_and_rest_commits() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();

        write(&table, &persistent("id", "example.com", "http", 1), WriteAction::Insert);
        write(&table, &persistent("id", "example.com", "https", 1), WriteAction::Insert);

        // Moving the http row to https collides with the https row's key.
        let mut colliding = persistent("id", "example.com", "https", 2);
        colliding.value = "collides".into();
        let other = persistent("other", "example.com", "http", 3);

        let applied = table
            .write_batch(vec![
                PendingWrite {
                    cookie: colliding,
                    action: WriteAction::Update,
                },
                PendingWrite {
                    cookie: other,
                    action: WriteAction::Insert,
                },
            ])
            .unwrap();
        assert_eq!(applied, 1);

        let loaded = table.load(0).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.iter().any(|c| c.name == "other"));
        assert!(loaded.iter().all(|c| c.value == "v"));
    }

    #[test]
    fn limited_load_returns_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();

        for (name, accessed) in [("c", 30), ("a", 10), ("b", 20)] {
            write(&table, &persistent(name, "example.com", "http", accessed), WriteAction::Insert);
        }

        let oldest: Vec<_> = table.load(2).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(oldest, ["a", "b"]);
    }

    #[test]
    fn delete_all_empties_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();
        write(&table, &persistent("a", "example.com", "http", 1), WriteAction::Insert);
        table.delete_all().unwrap();
        assert!(table.load(0).unwrap().is_empty());
    }

    #[test]
    fn ip_hosts_are_flagged_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let table = CookieTable::open(&dir.path().join("cookies.db")).unwrap();
        write(&table, &persistent("a", "10.0.0.1", "http", 1), WriteAction::Insert);
        assert!(table.load(0).unwrap()[0].domain_is_ip);
    }
}
