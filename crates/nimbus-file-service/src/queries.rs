//! Schema and row mapping for the file service's tables.

use nimbus_core::{DatabaseResult, FileID, Migration, NodeHandle, QueryRow, Transaction};

use crate::info::{FileInfo, FileLocation};
use crate::range::FileRange;
use crate::range_tree::FileRangeTree;

pub(crate) const COMPONENT: &str = "file_service";

pub(crate) const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "files_and_ranges",
    sql: r#"
        CREATE TABLE file_ids (
            next INTEGER NOT NULL
        );
        INSERT INTO file_ids (next) VALUES (1);

        CREATE TABLE free_file_ids (
            id INTEGER PRIMARY KEY NOT NULL
        );

        CREATE TABLE files (
            id INTEGER PRIMARY KEY NOT NULL,
            handle INTEGER UNIQUE,
            parent_handle INTEGER,
            name TEXT NOT NULL DEFAULT '',
            accessed INTEGER NOT NULL,
            allocated_size INTEGER NOT NULL DEFAULT 0,
            dirty INTEGER NOT NULL DEFAULT 0,
            modified INTEGER NOT NULL,
            removed INTEGER NOT NULL DEFAULT 0,
            reported_size INTEGER NOT NULL DEFAULT 0,
            size INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE ranges (
            id INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
            "begin" INTEGER NOT NULL,
            "end" INTEGER NOT NULL,
            PRIMARY KEY (id, "begin")
        );

        CREATE INDEX files_by_access ON files (accessed);
    "#,
}];

pub(crate) const SELECT_FILE: &str = "SELECT id, handle, parent_handle, name, accessed, allocated_size, \
     dirty, modified, removed, reported_size, size FROM files WHERE id = :id";

pub(crate) const SELECT_FILE_BY_HANDLE: &str =
    "SELECT id FROM files WHERE handle = :handle AND removed = 0";

pub(crate) const SELECT_RANGES: &str =
    r#"SELECT "begin", "end" FROM ranges WHERE id = :id ORDER BY "begin""#;

pub(crate) const SELECT_RECLAIMABLE: &str = "SELECT id, allocated_size FROM files \
     WHERE accessed <= :accessed AND dirty = 0 AND removed = 0 AND allocated_size > 0 \
     ORDER BY accessed ASC, id ASC";

pub(crate) const SELECT_STORAGE_USED: &str =
    "SELECT COALESCE(SUM(allocated_size), 0) AS used FROM files";

pub(crate) const SELECT_REMOVED: &str = "SELECT id FROM files WHERE removed = 1";

/// Converts an unsigned quantity for storage, saturating at `i64::MAX`.
pub(crate) fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts a stored quantity back, treating negatives as zero.
pub(crate) fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn handle_to_sql(handle: NodeHandle) -> Option<i64> {
    (!handle.is_undef()).then(|| to_sql(handle.as_u64()))
}

fn handle_from_sql(value: Option<i64>) -> NodeHandle {
    value.map_or(NodeHandle::UNDEF, |v| NodeHandle::new(from_sql(v)))
}

/// Takes a recycled ID if one is free, otherwise the next fresh one.
pub(crate) fn allocate_id(tx: &Transaction<'_>) -> DatabaseResult<FileID> {
    let recycled = {
        let mut query = tx.query("SELECT MIN(id) AS id FROM free_file_ids");
        query.execute()?;
        match query.first() {
            Some(row) => row.field::<Option<i64>>("id")?,
            None => None,
        }
    };

    if let Some(id) = recycled {
        tx.query("DELETE FROM free_file_ids WHERE id = :id")
            .param(":id", id)
            .execute()?;
        return Ok(FileID::from_raw(from_sql(id)));
    }

    let next = {
        let mut query = tx.query("SELECT next FROM file_ids");
        query.execute()?;
        match query.first() {
            Some(row) => row.field::<i64>("next")?,
            None => 1,
        }
    };
    tx.query("UPDATE file_ids SET next = :next")
        .param(":next", next + 1)
        .execute()?;
    Ok(FileID::from_raw(from_sql(next)))
}

/// Deletes a file's rows and returns its ID to the free list.
pub(crate) fn release_id(tx: &Transaction<'_>, id: FileID) -> DatabaseResult<()> {
    tx.query("DELETE FROM ranges WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .execute()?;
    tx.query("DELETE FROM files WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .execute()?;
    tx.query("INSERT OR IGNORE INTO free_file_ids (id) VALUES (:id)")
        .param(":id", to_sql(id.as_u64()))
        .execute()?;
    Ok(())
}

pub(crate) fn insert_file(tx: &Transaction<'_>, info: &FileInfo) -> DatabaseResult<()> {
    tx.query(
        "INSERT INTO files (id, handle, parent_handle, name, accessed, allocated_size, dirty, \
         modified, removed, reported_size, size) VALUES (:id, :handle, :parent_handle, :name, \
         :accessed, :allocated_size, :dirty, :modified, :removed, :reported_size, :size)",
    )
    .param(":id", to_sql(info.id.as_u64()))
    .param(":handle", handle_to_sql(info.handle))
    .param(":parent_handle", handle_to_sql(info.location.parent))
    .param(":name", info.location.name.as_str())
    .param(":accessed", info.accessed)
    .param(":allocated_size", to_sql(info.allocated_size))
    .param(":dirty", info.dirty)
    .param(":modified", info.modified)
    .param(":removed", info.removed)
    .param(":reported_size", to_sql(info.reported_size))
    .param(":size", to_sql(info.size))
    .execute()?;
    Ok(())
}

/// Rewrites a file's content attributes. Location and the removed flag are
/// owned by node-event handling and are left alone.
pub(crate) fn update_file(tx: &Transaction<'_>, info: &FileInfo) -> DatabaseResult<()> {
    tx.query(
        "UPDATE files SET handle = :handle, accessed = :accessed, \
         allocated_size = :allocated_size, dirty = :dirty, modified = :modified, \
         reported_size = :reported_size, size = :size WHERE id = :id",
    )
    .param(":id", to_sql(info.id.as_u64()))
    .param(":handle", handle_to_sql(info.handle))
    .param(":accessed", info.accessed)
    .param(":allocated_size", to_sql(info.allocated_size))
    .param(":dirty", info.dirty)
    .param(":modified", info.modified)
    .param(":reported_size", to_sql(info.reported_size))
    .param(":size", to_sql(info.size))
    .execute()?;
    Ok(())
}

pub(crate) fn update_location(tx: &Transaction<'_>, id: FileID, location: &FileLocation) -> DatabaseResult<()> {
    tx.query("UPDATE files SET parent_handle = :parent_handle, name = :name WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .param(":parent_handle", handle_to_sql(location.parent))
        .param(":name", location.name.as_str())
        .execute()?;
    Ok(())
}

/// Marks a file removed and unbinds it so its handle can be reused.
pub(crate) fn mark_removed(tx: &Transaction<'_>, id: FileID) -> DatabaseResult<()> {
    tx.query("UPDATE files SET removed = 1, handle = NULL WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .execute()?;
    Ok(())
}

/// Unbinds and marks removed every other file bound to `handle`, returning their IDs.
pub(crate) fn take_handle(tx: &Transaction<'_>, id: FileID, handle: NodeHandle) -> DatabaseResult<Vec<FileID>> {
    let mut query = tx.query("SELECT id FROM files WHERE handle = :handle AND id != :id");
    query
        .param(":handle", handle_to_sql(handle))
        .param(":id", to_sql(id.as_u64()));
    query.execute()?;
    let replaced = query
        .rows()
        .map(|row| row.field::<i64>("id").map(|id| FileID::from_raw(from_sql(id))))
        .collect::<DatabaseResult<Vec<_>>>()?;
    for other in &replaced {
        mark_removed(tx, *other)?;
    }
    Ok(replaced)
}

pub(crate) fn set_accessed(tx: &Transaction<'_>, id: FileID, accessed: i64) -> DatabaseResult<()> {
    tx.query("UPDATE files SET accessed = MAX(accessed, :accessed) WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .param(":accessed", accessed)
        .execute()?;
    Ok(())
}

pub(crate) fn set_allocated_size(tx: &Transaction<'_>, id: FileID, allocated_size: u64) -> DatabaseResult<()> {
    tx.query("UPDATE files SET allocated_size = :allocated_size WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .param(":allocated_size", to_sql(allocated_size))
        .execute()?;
    Ok(())
}

pub(crate) fn file_from_row(row: &QueryRow<'_>) -> DatabaseResult<FileInfo> {
    Ok(FileInfo {
        id: FileID::from_raw(from_sql(row.field("id")?)),
        handle: handle_from_sql(row.field("handle")?),
        location: FileLocation {
            parent: handle_from_sql(row.field("parent_handle")?),
            name: row.field("name")?,
        },
        size: from_sql(row.field("size")?),
        modified: row.field("modified")?,
        accessed: row.field("accessed")?,
        allocated_size: from_sql(row.field("allocated_size")?),
        reported_size: from_sql(row.field("reported_size")?),
        dirty: row.field("dirty")?,
        removed: row.field("removed")?,
    })
}

pub(crate) fn load_ranges(
    tx: &Transaction<'_>,
    id: FileID,
    minimum_distance: u64,
) -> DatabaseResult<FileRangeTree> {
    let mut query = tx.query(SELECT_RANGES);
    query.param(":id", to_sql(id.as_u64()));
    query.execute()?;
    let mut tree = FileRangeTree::new(minimum_distance);
    for row in query.rows() {
        let range = FileRange::new(from_sql(row.field("begin")?), from_sql(row.field("end")?));
        if !range.is_empty() {
            let _ = tree.insert(range);
        }
    }
    Ok(tree)
}

/// Makes the stored rows touching `span` match `tree`.
pub(crate) fn sync_ranges(
    tx: &Transaction<'_>,
    id: FileID,
    tree: &FileRangeTree,
    span: FileRange,
) -> DatabaseResult<()> {
    tx.query(r#"DELETE FROM ranges WHERE id = :id AND "end" >= :begin AND "begin" <= :end"#)
        .param(":id", to_sql(id.as_u64()))
        .param(":begin", to_sql(span.begin()))
        .param(":end", to_sql(span.end()))
        .execute()?;
    for (range, ()) in tree.overlapping(span.extend(1)) {
        tx.query(r#"INSERT INTO ranges (id, "begin", "end") VALUES (:id, :begin, :end)"#)
            .param(":id", to_sql(id.as_u64()))
            .param(":begin", to_sql(range.begin()))
            .param(":end", to_sql(range.end()))
            .execute()?;
    }
    Ok(())
}

pub(crate) fn clear_ranges(tx: &Transaction<'_>, id: FileID) -> DatabaseResult<()> {
    tx.query("DELETE FROM ranges WHERE id = :id")
        .param(":id", to_sql(id.as_u64()))
        .execute()?;
    Ok(())
}
