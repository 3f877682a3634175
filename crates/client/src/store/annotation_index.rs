// annotation_index table access: the durable local-id to server-id mapping.
//
// One row per (annotation_id, document_id). A page change rewrites the row in
// place; writes that would not change anything are skipped entirely.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{IndexError, QueryContext};
use crate::store::meta_db::MetaDb;

/// A row in the `annotation_index` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAnnotationRecord {
    pub annotation_id: String,
    /// Absent until a server confirmation has been observed.
    pub server_id: Option<String>,
    pub document_id: String,
    pub page_number: u32,
}

impl LocalAnnotationRecord {
    pub fn new(
        annotation_id: impl Into<String>,
        server_id: Option<String>,
        document_id: impl Into<String>,
        page_number: u32,
    ) -> Self {
        Self {
            annotation_id: annotation_id.into(),
            server_id,
            document_id: document_id.into(),
            page_number,
        }
    }
}

/// What `put` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Same triple already stored; only the missing server id was written.
    ServerIdFilled,
    /// The annotation was stored on another page and was moved in place.
    Moved { from: u32 },
    Unchanged,
}

impl PutOutcome {
    pub fn wrote(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// The local annotation index.
///
/// Misses are `Ok(None)` (or a zero count), never errors. Mutating calls take
/// `&mut self`; callers serialize access.
pub trait AnnotationIndex: Send {
    fn put(&mut self, record: &LocalAnnotationRecord) -> Result<PutOutcome, IndexError>;

    /// Exact match on all three keys.
    fn lookup_server_id(
        &self,
        annotation_id: &str,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<String>, IndexError>;

    fn lookup_page_number(
        &self,
        annotation_id: &str,
        document_id: &str,
    ) -> Result<Option<u32>, IndexError>;

    /// Returns `true` only if a row was rewritten.
    fn update_page_number(
        &mut self,
        annotation_id: &str,
        server_id: &str,
        document_id: &str,
        new_page_number: u32,
    ) -> Result<bool, IndexError>;

    fn remove(
        &mut self,
        annotation_id: &str,
        document_id: &str,
        page_number: u32,
    ) -> Result<usize, IndexError>;

    fn clear(&mut self) -> Result<usize, IndexError>;

    fn records_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<LocalAnnotationRecord>, IndexError>;

    /// Number of mutating statements executed since open.
    fn write_count(&self) -> u64;
}

/// SQLite-backed `AnnotationIndex`.
#[derive(Debug)]
pub struct SqliteAnnotationIndex {
    db: MetaDb,
    writes: u64,
}

impl SqliteAnnotationIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        Ok(Self::from_db(MetaDb::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Ok(Self::from_db(MetaDb::open_in_memory()?))
    }

    pub fn from_db(db: MetaDb) -> Self {
        Self { db, writes: 0 }
    }

    /// Every record, ordered by document then page.
    pub fn all_records(&self) -> Result<Vec<LocalAnnotationRecord>, IndexError> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT annotation_id, server_id, document_id, page_number \
                 FROM annotation_index \
                 ORDER BY document_id ASC, page_number ASC, annotation_id ASC",
            )
            .query_context("preparing the full index listing")?;

        let rows = stmt.query_map([], row_to_raw).query_context("listing the index")?;
        collect_records(rows)
    }

    fn conn(&self) -> &Connection {
        self.db.connection()
    }

    fn execute_write(
        &mut self,
        sql: &str,
        params: impl rusqlite::Params,
        action: &'static str,
    ) -> Result<usize, IndexError> {
        let changed = self.db.connection().execute(sql, params).query_context(action)?;
        self.writes += 1;
        Ok(changed)
    }

    fn stored_row(
        &self,
        annotation_id: &str,
        document_id: &str,
    ) -> Result<Option<(u32, Option<String>)>, IndexError> {
        let row = self
            .conn()
            .query_row(
                "SELECT page_number, server_id FROM annotation_index \
                 WHERE annotation_id = ?1 AND document_id = ?2",
                params![annotation_id, document_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .query_context("reading a stored annotation")?;

        match row {
            Some((page, server_id)) => Ok(Some((page_from_sql(page)?, server_id))),
            None => Ok(None),
        }
    }
}

impl AnnotationIndex for SqliteAnnotationIndex {
    fn put(&mut self, record: &LocalAnnotationRecord) -> Result<PutOutcome, IndexError> {
        let server_id = record.server_id.as_deref().filter(|id| !id.is_empty());

        match self.stored_row(&record.annotation_id, &record.document_id)? {
            None => {
                self.execute_write(
                    "INSERT INTO annotation_index \
                     (annotation_id, server_id, document_id, page_number) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.annotation_id,
                        server_id,
                        record.document_id,
                        record.page_number
                    ],
                    "inserting an annotation",
                )?;
                Ok(PutOutcome::Inserted)
            }
            Some((stored_page, stored_server_id)) if stored_page == record.page_number => {
                match (stored_server_id, server_id) {
                    (None, Some(server_id)) => {
                        self.execute_write(
                            "UPDATE annotation_index SET server_id = ?1 \
                             WHERE annotation_id = ?2 AND document_id = ?3",
                            params![server_id, record.annotation_id, record.document_id],
                            "filling a server id",
                        )?;
                        Ok(PutOutcome::ServerIdFilled)
                    }
                    _ => Ok(PutOutcome::Unchanged),
                }
            }
            Some((stored_page, _)) => {
                self.execute_write(
                    "UPDATE annotation_index \
                     SET page_number = ?1, server_id = COALESCE(?2, server_id) \
                     WHERE annotation_id = ?3 AND document_id = ?4",
                    params![
                        record.page_number,
                        server_id,
                        record.annotation_id,
                        record.document_id
                    ],
                    "moving an annotation",
                )?;
                Ok(PutOutcome::Moved { from: stored_page })
            }
        }
    }

    fn lookup_server_id(
        &self,
        annotation_id: &str,
        document_id: &str,
        page_number: u32,
    ) -> Result<Option<String>, IndexError> {
        let server_id = self
            .conn()
            .query_row(
                "SELECT server_id FROM annotation_index \
                 WHERE annotation_id = ?1 AND document_id = ?2 AND page_number = ?3",
                params![annotation_id, document_id, page_number],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .query_context("looking up a server id")?;

        Ok(server_id.flatten())
    }

    fn lookup_page_number(
        &self,
        annotation_id: &str,
        document_id: &str,
    ) -> Result<Option<u32>, IndexError> {
        Ok(self.stored_row(annotation_id, document_id)?.map(|(page, _)| page))
    }

    fn update_page_number(
        &mut self,
        annotation_id: &str,
        server_id: &str,
        document_id: &str,
        new_page_number: u32,
    ) -> Result<bool, IndexError> {
        let stored_page = self
            .conn()
            .query_row(
                "SELECT page_number FROM annotation_index \
                 WHERE annotation_id = ?1 AND server_id = ?2 AND document_id = ?3",
                params![annotation_id, server_id, document_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .query_context("reading a page number for update")?;

        match stored_page.map(page_from_sql).transpose()? {
            Some(page) if page != new_page_number => {
                let changed = self.execute_write(
                    "UPDATE annotation_index SET page_number = ?1 \
                     WHERE annotation_id = ?2 AND server_id = ?3 AND document_id = ?4",
                    params![new_page_number, annotation_id, server_id, document_id],
                    "updating a page number",
                )?;
                Ok(changed > 0)
            }
            _ => Ok(false),
        }
    }

    fn remove(
        &mut self,
        annotation_id: &str,
        document_id: &str,
        page_number: u32,
    ) -> Result<usize, IndexError> {
        self.execute_write(
            "DELETE FROM annotation_index \
             WHERE annotation_id = ?1 AND document_id = ?2 AND page_number = ?3",
            params![annotation_id, document_id, page_number],
            "removing an annotation",
        )
    }

    fn clear(&mut self) -> Result<usize, IndexError> {
        self.execute_write("DELETE FROM annotation_index", [], "clearing the index")
    }

    fn records_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<LocalAnnotationRecord>, IndexError> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT annotation_id, server_id, document_id, page_number \
                 FROM annotation_index \
                 WHERE document_id = ?1 \
                 ORDER BY page_number ASC, annotation_id ASC",
            )
            .query_context("preparing the document listing")?;

        let rows = stmt
            .query_map(params![document_id], row_to_raw)
            .query_context("listing a document's annotations")?;
        collect_records(rows)
    }

    fn write_count(&self) -> u64 {
        self.writes
    }
}

type RawRecord = (String, Option<String>, String, i64);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<RawRecord>>,
) -> Result<Vec<LocalAnnotationRecord>, IndexError> {
    rows.map(|row| {
        let (annotation_id, server_id, document_id, page) =
            row.query_context("decoding an annotation_index row")?;
        Ok(LocalAnnotationRecord {
            annotation_id,
            server_id,
            document_id,
            page_number: page_from_sql(page)?,
        })
    })
    .collect()
}

fn page_from_sql(value: i64) -> Result<u32, IndexError> {
    u32::try_from(value).map_err(|_| IndexError::InvalidPageNumber(value))
}
