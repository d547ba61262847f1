//! Bounded-memory set that overflows into a scratch SQLite database.
//!
//! Entries live in an insertion-ordered in-memory set until the configured
//! threshold is exceeded. At that point every entry is copied into a freshly
//! created database under the scratch directory and the set flips into fallback
//! mode for the rest of its life. Callers observe identical membership, length
//! and iteration semantics before and after the transition. The scratch
//! directory is removed on [`SpooledSet::close`] or drop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use rusqlite::{params, Connection, OptionalExtension};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::RuntimeOptions;
use crate::error::Result;
use crate::prim::Prim;

const PAGE_SIZE: i64 = 512;

struct DiskSet {
    conn: Connection,
    dir: TempDir,
    len: usize,
}

impl DiskSet {
    fn create(scratch: &Path) -> Result<Self> {
        std::fs::create_dir_all(scratch)?;
        let dir = tempfile::Builder::new()
            .prefix("spooled-")
            .tempdir_in(scratch)?;
        let conn = Connection::open(dir.path().join("spool.db"))?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute(
            "CREATE TABLE items (seq INTEGER PRIMARY KEY AUTOINCREMENT, key BLOB NOT NULL UNIQUE)",
            [],
        )?;
        Ok(Self { conn, dir, len: 0 })
    }

    fn insert(&mut self, item: &Prim) -> Result<bool> {
        let key = item.encode();
        let changed = self
            .conn
            .execute("INSERT OR IGNORE INTO items (key) VALUES (?1)", params![key])?;
        if changed > 0 {
            self.len += 1;
        }
        Ok(changed > 0)
    }

    fn remove(&mut self, item: &Prim) -> Result<bool> {
        let key = item.encode();
        let changed = self
            .conn
            .execute("DELETE FROM items WHERE key = ?1", params![key])?;
        if changed > 0 {
            self.len -= 1;
        }
        Ok(changed > 0)
    }

    fn contains(&self, item: &Prim) -> Result<bool> {
        let key = item.encode();
        let hit: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM items WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(hit.is_some())
    }

    fn page(&self, after: i64) -> Result<Vec<(i64, Prim)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT seq, key FROM items WHERE seq > ?1 ORDER BY seq LIMIT ?2")?;
        let rows = stmt.query_map(params![after, PAGE_SIZE], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, key) = row?;
            out.push((seq, Prim::decode(&key)?));
        }
        Ok(out)
    }

    fn close(self) -> Result<()> {
        let DiskSet { conn, dir, .. } = self;
        conn.close().map_err(|(_, err)| err)?;
        dir.close()?;
        Ok(())
    }
}

/// Set of [`Prim`] values with a transparent disk fallback.
pub struct SpooledSet {
    size: usize,
    scratch: PathBuf,
    mem: IndexSet<Prim>,
    disk: Option<DiskSet>,
    fallback: bool,
}

impl SpooledSet {
    /// Creates a set that keeps at most `size` entries in memory before spooling
    /// into a database under `scratch`.
    pub fn new(size: usize, scratch: impl Into<PathBuf>) -> Self {
        Self {
            size,
            scratch: scratch.into(),
            mem: IndexSet::new(),
            disk: None,
            fallback: false,
        }
    }

    /// Creates a set sized by runtime options.
    pub fn with_options(opts: &RuntimeOptions) -> Self {
        Self::new(opts.spool_threshold, opts.scratch_path())
    }

    /// Whether the set has migrated to disk. Never flips back.
    pub fn fallback(&self) -> bool {
        self.fallback
    }

    /// Scratch directory currently holding the fallback database.
    pub fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|disk| disk.dir.path())
    }

    /// Number of distinct entries.
    pub fn len(&self) -> usize {
        match &self.disk {
            Some(disk) => disk.len,
            None => self.mem.len(),
        }
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `item`, returning whether it was newly added.
    pub fn add(&mut self, item: Prim) -> Result<bool> {
        if let Some(disk) = self.disk.as_mut() {
            return disk.insert(&item);
        }
        let added = self.mem.insert(item);
        if self.mem.len() > self.size {
            self.spool()?;
        }
        Ok(added)
    }

    /// Removes `item` if present. Removing an absent entry is a no-op.
    pub fn discard(&mut self, item: &Prim) -> Result<bool> {
        match self.disk.as_mut() {
            Some(disk) => disk.remove(item),
            None => Ok(self.mem.shift_remove(item)),
        }
    }

    /// Membership test.
    pub fn contains(&self, item: &Prim) -> Result<bool> {
        match &self.disk {
            Some(disk) => disk.contains(item),
            None => Ok(self.mem.contains(item)),
        }
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> SpooledIter<'_> {
        SpooledIter {
            set: self,
            pos: 0,
            after: 0,
            buf: VecDeque::new(),
            done: false,
        }
    }

    /// Collects every entry, surfacing the first read failure.
    pub fn to_vec(&self) -> Result<Vec<Prim>> {
        self.iter().collect()
    }

    /// Releases the fallback database and its scratch directory.
    pub fn close(&mut self) -> Result<()> {
        self.mem.clear();
        if let Some(disk) = self.disk.take() {
            debug!(path = %disk.dir.path().display(), "storm.spool.close");
            disk.close()?;
        }
        Ok(())
    }

    fn spool(&mut self) -> Result<()> {
        let mut disk = DiskSet::create(&self.scratch)?;
        {
            let tx = disk.conn.transaction()?;
            {
                let mut stmt = tx.prepare("INSERT OR IGNORE INTO items (key) VALUES (?1)")?;
                for item in &self.mem {
                    stmt.execute(params![item.encode()])?;
                }
            }
            tx.commit()?;
        }
        let count: i64 = disk
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        disk.len = usize::try_from(count).unwrap_or(0);
        info!(
            entries = disk.len,
            path = %disk.dir.path().display(),
            "storm.spool.fallback"
        );
        self.mem = IndexSet::new();
        self.disk = Some(disk);
        self.fallback = true;
        Ok(())
    }
}

impl Drop for SpooledSet {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "storm.spool.teardown_failed");
        }
    }
}

impl std::fmt::Debug for SpooledSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpooledSet")
            .field("size", &self.size)
            .field("len", &self.len())
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Borrowing iterator over a [`SpooledSet`]; disk entries are read in pages.
pub struct SpooledIter<'a> {
    set: &'a SpooledSet,
    pos: usize,
    after: i64,
    buf: VecDeque<Prim>,
    done: bool,
}

impl Iterator for SpooledIter<'_> {
    type Item = Result<Prim>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(disk) = &self.set.disk else {
            let item = self.set.mem.get_index(self.pos)?.clone();
            self.pos += 1;
            return Some(Ok(item));
        };
        if self.buf.is_empty() && !self.done {
            match disk.page(self.after) {
                Ok(rows) => {
                    if (rows.len() as i64) < PAGE_SIZE {
                        self.done = true;
                    }
                    if let Some((seq, _)) = rows.last() {
                        self.after = *seq;
                    }
                    self.buf.extend(rows.into_iter().map(|(_, prim)| prim));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        self.buf.pop_front().map(Ok)
    }
}
