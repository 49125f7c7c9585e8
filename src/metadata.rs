//! Card metadata from the SQLite catalogue, read through a small bounded
//! connection pool.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::PoolError;

const CARD_QUERY: &str = "SELECT id, name, expansion, number, attribute, card_type, image_url \
     FROM card_csv WHERE image_url IS NOT NULL";

/// Catalogue row describing one printed card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMetadata {
    pub id: i64,
    pub name: String,
    pub expansion: Option<String>,
    pub number: Option<String>,
    pub attribute: Option<String>,
    pub card_type: Option<String>,
    pub image_url: Option<String>,
}

impl CardMetadata {
    /// One-line summary used in reports, e.g. `Pikachu (SV1 #025, Lightning)`.
    pub fn summary(&self) -> String {
        let mut details = Vec::new();
        match (&self.expansion, &self.number) {
            (Some(exp), Some(num)) => details.push(format!("{exp} #{num}")),
            (Some(exp), None) => details.push(exp.clone()),
            (None, Some(num)) => details.push(format!("#{num}")),
            (None, None) => {}
        }
        if let Some(attr) = &self.attribute {
            details.push(attr.clone());
        }
        if let Some(kind) = &self.card_type {
            details.push(kind.clone());
        }
        if details.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, details.join(", "))
        }
    }
}

/// Bounded pool of read-only SQLite connections.
///
/// A connection is opened on acquire and closed when its guard drops, so a
/// connection never outlives the thread that took it. The permit count bounds
/// how many are open at once.
#[derive(Debug)]
pub struct MetadataPool {
    db_path: PathBuf,
    max_connections: usize,
    in_use: Mutex<usize>,
    released: Condvar,
    busy_timeout: Duration,
}

impl MetadataPool {
    pub const DEFAULT_MAX_CONNECTIONS: usize = 5;

    pub fn open(db_path: impl Into<PathBuf>, max_connections: usize) -> Result<Self, PoolError> {
        let db_path = db_path.into();
        if !db_path.is_file() {
            return Err(PoolError::MissingDatabase(db_path));
        }
        Ok(Self {
            db_path,
            max_connections: max_connections.max(1),
            in_use: Mutex::new(0),
            released: Condvar::new(),
            busy_timeout: Duration::from_secs(5),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Connections currently handed out.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a connection is available.
    pub fn acquire(&self) -> Result<PooledConnection<'_>, PoolError> {
        self.take_permit(None)?;
        self.connect()
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<'_>, PoolError> {
        self.take_permit(Some(Instant::now() + timeout))?;
        self.connect()
    }

    fn take_permit(&self, deadline: Option<Instant>) -> Result<(), PoolError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.max_connections {
            in_use = match deadline {
                None => self
                    .released
                    .wait(in_use)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    self.released
                        .wait_timeout(in_use, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *in_use += 1;
        Ok(())
    }

    fn give_back(&self) {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        self.released.notify_one();
    }

    fn connect(&self) -> Result<PooledConnection<'_>, PoolError> {
        match self.open_connection() {
            Ok(conn) => Ok(PooledConnection {
                pool: self,
                conn: Some(conn),
                owner: thread::current().id(),
                _not_send: PhantomData,
            }),
            Err(e) => {
                self.give_back();
                Err(e)
            }
        }
    }

    fn open_connection(&self) -> Result<Connection, PoolError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "cache_size", 5000)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        Ok(conn)
    }
}

/// Scoped connection handle. Not `Send`: it must be dropped on the thread
/// that acquired it. Dropping closes the connection and frees the permit.
pub struct PooledConnection<'a> {
    pool: &'a MetadataPool,
    conn: Option<Connection>,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // only None during drop
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if thread::current().id() != self.owner {
                tracing::warn!("metadata connection released on a foreign thread");
            }
            if let Err((_, e)) = conn.close() {
                tracing::debug!(error = %e, "ignoring error while closing metadata connection");
            }
        }
        self.pool.give_back();
    }
}

/// All catalogue rows, with the lookups used to attach metadata to
/// reference images by file name.
#[derive(Debug, Clone, Default)]
pub struct CardCatalog {
    cards: Vec<CardMetadata>,
    by_id: HashMap<i64, usize>,
    /// (lowercased expansion, normalised number) -> index.
    by_number: HashMap<(String, String), usize>,
    /// (lowercased name, index), longest name first.
    names: Vec<(String, usize)>,
}

impl CardCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_cards(mut cards: Vec<CardMetadata>) -> Self {
        cards.sort_by_key(|c| c.id);
        let by_id = cards.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        let mut by_number = HashMap::new();
        for (i, card) in cards.iter().enumerate() {
            if let (Some(expansion), Some(number)) = (&card.expansion, &card.number) {
                by_number
                    .entry((expansion.trim().to_lowercase(), normalize_number(number)))
                    .or_insert(i);
            }
        }
        let mut names: Vec<(String, usize)> = cards
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.name.trim().is_empty())
            .map(|(i, c)| (c.name.trim().to_lowercase(), i))
            .collect();
        names.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));
        Self {
            cards,
            by_id,
            by_number,
            names,
        }
    }

    /// Read every catalogue row that has an image URL.
    pub fn load(pool: &MetadataPool) -> Result<Self, PoolError> {
        let conn = pool.acquire()?;
        let mut stmt = conn.prepare(CARD_QUERY)?;
        let rows = stmt.query_map([], card_from_row)?;
        let mut cards = Vec::new();
        for row in rows {
            match row {
                Ok(Some(card)) => cards.push(card),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable catalogue row"),
            }
        }
        drop(stmt);
        tracing::info!(cards = cards.len(), db = %pool.db_path().display(), "loaded card catalogue");
        Ok(Self::from_cards(cards))
    }

    /// Open the database and load it, falling back to an empty catalogue on
    /// any failure. Metadata is optional for recognition.
    pub fn load_or_empty(db_path: Option<&Path>) -> Self {
        let Some(db_path) = db_path else {
            return Self::empty();
        };
        let loaded = MetadataPool::open(db_path, MetadataPool::DEFAULT_MAX_CONNECTIONS)
            .and_then(|pool| Self::load(&pool));
        match loaded {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!(error = %e, "card metadata unavailable, continuing without it");
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&CardMetadata> {
        self.by_id.get(&id).map(|&i| &self.cards[i])
    }

    /// Metadata for a reference image named `<number>_<web id>_<name>_<type>`
    /// inside its expansion folder.
    ///
    /// Resolution order: expansion folder plus leading card number, then the
    /// longest card name contained in the stem (same expansion preferred),
    /// then a stem token equal to a catalogue id.
    pub fn lookup(&self, relative_path: &str) -> Option<&CardMetadata> {
        let mut parts = relative_path.rsplit('/');
        let file_name = parts.next().unwrap_or(relative_path);
        let folder = parts.next().map(str::to_lowercase);
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tokens: Vec<&str> = stem.split('_').map(str::trim).filter(|t| !t.is_empty()).collect();

        if let (Some(folder), Some(first)) = (&folder, tokens.first()) {
            if let Some(&i) = self.by_number.get(&(folder.clone(), normalize_number(first))) {
                return Some(&self.cards[i]);
            }
        }
        if let Some(card) = self.lookup_name(&stem, folder.as_deref()) {
            return Some(card);
        }
        tokens
            .iter()
            .filter_map(|token| token.parse::<i64>().ok())
            .find_map(|id| self.get(id))
    }

    fn lookup_name(&self, stem: &str, folder: Option<&str>) -> Option<&CardMetadata> {
        let stem = stem.to_lowercase();
        // 文件名里空格被写成下划线
        let spaced = stem.replace('_', " ");
        let mut hits = self
            .names
            .iter()
            .filter(|(name, _)| stem.contains(name.as_str()) || spaced.contains(name.as_str()));
        let &(ref longest, first) = hits.next()?;
        let in_folder = |i: usize| {
            folder.is_some_and(|f| {
                self.cards[i]
                    .expansion
                    .as_deref()
                    .is_some_and(|e| e.trim().eq_ignore_ascii_case(f))
            })
        };
        if in_folder(first) {
            return Some(&self.cards[first]);
        }
        let same_set = hits
            .take_while(|(name, _)| name.len() == longest.len())
            .find(|&&(_, i)| in_folder(i))
            .map(|&(_, i)| i);
        Some(&self.cards[same_set.unwrap_or(first)])
    }
}

/// `"025"` and `"25"` name the same card; non-numeric numbers compare
/// case-insensitively.
fn normalize_number(number: &str) -> String {
    let number = number.trim();
    if !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()) {
        let digits = number.trim_start_matches('0');
        if digits.is_empty() { "0".to_string() } else { digits.to_string() }
    } else {
        number.to_lowercase()
    }
}

fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    // 表结构来自 CSV 导入，列类型不可靠
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            let s = String::from_utf8_lossy(t).trim().to_string();
            (!s.is_empty()).then_some(s)
        }
    })
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Option<CardMetadata>> {
    let id = match row.get_ref(0)? {
        ValueRef::Integer(i) => i,
        ValueRef::Real(f) => f as i64,
        ValueRef::Text(t) => match String::from_utf8_lossy(t).trim().parse() {
            Ok(id) => id,
            Err(_) => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(CardMetadata {
        id,
        name: text_column(row, 1)?.unwrap_or_default(),
        expansion: text_column(row, 2)?,
        number: text_column(row, 3)?,
        attribute: text_column(row, 4)?,
        card_type: text_column(row, 5)?,
        image_url: text_column(row, 6)?,
    }))
}
