use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use rusqlite::{Connection, OpenFlags};

/// How long a connection waits on a lock held by another connection or
/// process before giving up with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// An `r2d2::ManageConnection` for `rusqlite::Connection`s on a database file.
pub struct SqliteConnectionManager {
    path: PathBuf,
    flags: OpenFlags,
}

impl fmt::Debug for SqliteConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnectionManager")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnectionManager {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::default(),
        }
    }
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(&self.path, self.flags)?;

        // The busy timeout goes first so the journal mode switch itself waits
        // for other processes opening the same file.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(concat!(
            "PRAGMA journal_mode = WAL; ",
            "PRAGMA synchronous = NORMAL; ",
            "PRAGMA temp_store = memory; ",
            "PRAGMA foreign_keys = ON;"
        ))?;

        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch("")
    }

    fn has_broken(&self, _: &mut Connection) -> bool {
        false
    }
}
