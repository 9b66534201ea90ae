//! Embedded relational store access: a small connection pool over
//! `rusqlite`, WAL + foreign keys + busy-timeout enabled per §3/§6, and
//! schema migrations managed by `refinery`.

pub mod models;
pub mod repo;

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

refinery::embed_migrations!("migrations");

/// A minimal connection pool: a fixed set of `rusqlite::Connection`s
/// guarded by a mutex-protected free list. SQLite only supports one
/// writer at a time regardless, so this exists to let readers proceed
/// concurrently without serializing through a single `Mutex<Connection>`.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Mutex<Vec<Connection>>>,
    path: Arc<str>,
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Pool,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.inner.lock().push(conn);
        }
    }
}

impl Pool {
    /// Open (creating if necessary) the database at `path` with `size`
    /// pooled connections, apply pragmas, and run pending migrations.
    pub fn open(path: &Path, size: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut first = Connection::open(path)?;
        configure(&first)?;
        migrations::runner().run(&mut first)?;

        let mut conns = Vec::with_capacity(size);
        conns.push(first);
        for _ in 1..size.max(1) {
            let conn = Connection::open(path)?;
            configure(&conn)?;
            conns.push(conn);
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(conns)),
            path: Arc::from(path.to_string_lossy().as_ref()),
        })
    }

    /// In-memory pool for tests: a single shared connection (SQLite
    /// `:memory:` databases are connection-local, so pooling would lose
    /// the data between checkouts).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        let mut conn = conn;
        migrations::runner().run(&mut conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(vec![conn])),
            path: Arc::from(":memory:"),
        })
    }

    /// Check out a connection, opening a fresh one if the pool is
    /// momentarily exhausted (bounded by callers never holding more than
    /// a couple connections at once in practice).
    pub fn get(&self) -> anyhow::Result<PooledConnection> {
        if let Some(conn) = self.inner.lock().pop() {
            return Ok(PooledConnection {
                conn: Some(conn),
                pool: self.clone(),
            });
        }
        let conn = if self.path.as_ref() == ":memory:" {
            anyhow::bail!("in-memory pool exhausted")
        } else {
            let conn = Connection::open(self.path.as_ref())?;
            configure(&conn)?;
            conn
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
        })
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=10000;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_run_idempotently() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='stock'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn pragmas_applied() {
        let pool = Pool::open_in_memory().unwrap();
        let conn = pool.get().unwrap();
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
    }
}
