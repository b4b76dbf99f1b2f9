//! Persistent Raft log, one row per entry in `raft_log`.
//!
//! Indexes are 1-based and contiguous. Entries below the truncation
//! watermark are gone but `get_term_for` still answers for the watermark
//! itself, and for the commit watermark.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{RaftError, Result};
use crate::raft::state::{EntryFlags, LogEntry};

use super::term;

/// Big-endian key so that blob ordering matches index ordering.
pub fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let index: i64 = row.get(0)?;
    let term: i64 = row.get(1)?;
    let entry: Vec<u8> = row.get(2)?;
    let flags: u8 = row.get(3)?;
    Ok(LogEntry {
        index: index as u64,
        term: term as u64,
        entry,
        flags: EntryFlags::from_u8(flags),
    })
}

fn insert_entry(conn: &Connection, entry: &LogEntry) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO raft_log (key, idx, term, entry, flags)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            index_key(entry.index).to_vec(),
            entry.index as i64,
            entry.term as i64,
            entry.entry,
            entry.flags as u8,
        ],
    )?;
    Ok(())
}

/// Delete every entry at or after `index`. Returns the number removed.
fn delete_from(conn: &Connection, index: u64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM raft_log WHERE key >= ?1",
        params![index_key(index).to_vec()],
    )?;
    Ok(removed)
}

pub fn get_entry(conn: &Connection, index: u64) -> Result<Option<LogEntry>> {
    let entry = conn
        .query_row(
            "SELECT idx, term, entry, flags FROM raft_log WHERE key = ?1",
            params![index_key(index).to_vec()],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Up to `take` consecutive entries starting at `from`.
pub fn get_entries(conn: &Connection, from: u64, take: usize) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT idx, term, entry, flags FROM raft_log
         WHERE key >= ?1 ORDER BY key LIMIT ?2",
    )?;
    let rows = stmt.query_map(
        params![index_key(from).to_vec(), take as i64],
        row_to_entry,
    )?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn stored_term(conn: &Connection, index: u64) -> Result<Option<u64>> {
    let term: Option<i64> = conn
        .query_row(
            "SELECT term FROM raft_log WHERE key = ?1",
            params![index_key(index).to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(term.map(|t| t as u64))
}

/// Term of the entry at `index`, or of the truncation/commit watermark when
/// `index` is exactly one of them. `None` when unknown.
pub fn get_term_for(conn: &Connection, index: u64) -> Result<Option<u64>> {
    if let Some(term) = stored_term(conn, index)? {
        return Ok(Some(term));
    }
    let (truncated_index, truncated_term) = term::last_truncated(conn)?;
    if index == truncated_index {
        return Ok(Some(truncated_term));
    }
    let commit = term::last_commit(conn)?;
    if index == commit.index {
        return Ok(Some(commit.term));
    }
    Ok(None)
}

/// `(min, max)` of the stored entries, both falling back to the truncation
/// watermark when the log is empty.
pub fn get_log_entries_range(conn: &Connection) -> Result<(u64, u64)> {
    let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(idx), MAX(idx) FROM raft_log",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match (min, max) {
        (Some(min), Some(max)) => Ok((min as u64, max as u64)),
        _ => {
            let (truncated, _) = term::last_truncated(conn)?;
            Ok((truncated, truncated))
        }
    }
}

pub fn get_first_entry_index(conn: &Connection) -> Result<u64> {
    Ok(get_log_entries_range(conn)?.0)
}

pub fn get_last_entry_index(conn: &Connection) -> Result<u64> {
    Ok(get_log_entries_range(conn)?.1)
}

/// `(index, term)` of the last entry, or of the truncation watermark.
pub fn get_last_entry(conn: &Connection) -> Result<(u64, u64)> {
    let last: Option<(i64, i64)> = conn
        .query_row(
            "SELECT idx, term FROM raft_log ORDER BY key DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match last {
        Some((index, term)) => Ok((index as u64, term as u64)),
        None => term::last_truncated(conn),
    }
}

pub fn get_last_entry_term(conn: &Connection) -> Result<u64> {
    Ok(get_last_entry(conn)?.1)
}

/// Append `entry` at `last + 1` in `term`. Leader only.
pub fn insert_to_leader_log(
    conn: &Connection,
    term: u64,
    entry: Vec<u8>,
    flags: EntryFlags,
) -> Result<u64> {
    let index = get_last_entry_index(conn)? + 1;
    insert_entry(conn, &LogEntry::new(index, term, entry, flags))?;
    Ok(index)
}

/// Write replicated entries. Entries already present with the same term are
/// skipped; a term conflict deletes the conflicting entry and everything
/// after it. Rewriting committed history is fatal. Returns the last entry
/// flagged `Topology` among those actually written.
pub fn append_to_log(conn: &Connection, entries: &[LogEntry]) -> Result<Option<LogEntry>> {
    let commit = term::last_commit(conn)?;
    let (truncated_index, truncated_term) = term::last_truncated(conn)?;
    let mut last_topology = None;

    for entry in entries {
        if entry.index <= commit.index {
            let existing = if entry.index == truncated_index {
                Some(truncated_term)
            } else if entry.index < truncated_index {
                // discarded history, nothing left to compare against
                continue;
            } else {
                get_term_for(conn, entry.index)?
            };
            if existing == Some(entry.term) {
                continue;
            }
            return Err(RaftError::FatalInvariant {
                index: entry.index,
                term: entry.term,
                commit_index: commit.index,
                commit_term: commit.term,
                message: format!(
                    "committed entry has term {:?} but leader sent term {}",
                    existing, entry.term
                ),
            });
        }

        match stored_term(conn, entry.index)? {
            Some(existing) if existing == entry.term => continue,
            Some(existing) => {
                let removed = delete_from(conn, entry.index)?;
                tracing::info!(
                    index = entry.index,
                    existing_term = existing,
                    new_term = entry.term,
                    removed,
                    "Truncated diverging log suffix"
                );
            }
            None => {
                let last = get_last_entry_index(conn)?;
                if entry.index != last + 1 {
                    return Err(RaftError::InvalidOperation(format!(
                        "cannot append entry {} after last index {last}, the log would have a gap",
                        entry.index
                    )));
                }
            }
        }

        insert_entry(conn, entry)?;
        if entry.flags == EntryFlags::Topology {
            last_topology = Some(entry.clone());
        }
    }

    Ok(last_topology)
}

/// Last entry flagged `Topology` with an index in `(after, upto]`.
pub fn last_topology_entry_between(
    conn: &Connection,
    after: u64,
    upto: u64,
) -> Result<Option<LogEntry>> {
    if upto <= after {
        return Ok(None);
    }
    let entry = conn
        .query_row(
            "SELECT idx, term, entry, flags FROM raft_log
             WHERE key > ?1 AND key <= ?2 AND flags = ?3
             ORDER BY key DESC LIMIT 1",
            params![
                index_key(after).to_vec(),
                index_key(upto).to_vec(),
                EntryFlags::Topology as u8
            ],
            row_to_entry,
        )
        .optional()?;
    Ok(entry)
}

/// Physically delete entries up to `min(upto, commit index)` and move the
/// truncation watermark there.
pub fn truncate_log_before(conn: &Connection, upto: u64) -> Result<()> {
    let commit = term::last_commit(conn)?;
    let upto = upto.min(commit.index);
    let (truncated, _) = term::last_truncated(conn)?;
    if upto <= truncated {
        return Ok(());
    }
    let Some(term_at) = get_term_for(conn, upto)? else {
        return Ok(());
    };
    conn.execute(
        "DELETE FROM raft_log WHERE key <= ?1",
        params![index_key(upto).to_vec()],
    )?;
    term::set_last_truncated(conn, upto, term_at)?;
    tracing::debug!(upto, term = term_at, "Truncated log prefix");
    Ok(())
}

/// Drop every entry and restart the log after `(index, term)`.
pub fn clear_log_entries_and_set_last_truncate(
    conn: &Connection,
    index: u64,
    term: u64,
) -> Result<()> {
    conn.execute("DELETE FROM raft_log", [])?;
    term::set_last_truncated(conn, index, term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RaftStorage;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, format!("cmd-{index}").into_bytes(), EntryFlags::Normal)
    }

    fn storage_with_entries(count: u64, term: u64) -> RaftStorage {
        let storage = RaftStorage::open_in_memory().unwrap();
        let entries: Vec<_> = (1..=count).map(|i| entry(i, term)).collect();
        storage
            .with_write(|conn| append_to_log(conn, &entries))
            .unwrap();
        storage
    }

    #[test]
    fn empty_log_falls_back_to_watermark() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage
            .with_read(|conn| {
                assert_eq!(get_log_entries_range(conn)?, (0, 0));
                assert_eq!(get_last_entry(conn)?, (0, 0));
                assert_eq!(get_term_for(conn, 0)?, Some(0));
                assert_eq!(get_term_for(conn, 1)?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn leader_log_appends_contiguously() {
        let storage = RaftStorage::open_in_memory().unwrap();
        let (first, second) = storage
            .with_write(|conn| {
                let first = insert_to_leader_log(conn, 1, b"a".to_vec(), EntryFlags::Noop)?;
                let second = insert_to_leader_log(conn, 2, b"b".to_vec(), EntryFlags::Normal)?;
                Ok((first, second))
            })
            .unwrap();
        assert_eq!((first, second), (1, 2));

        let stored = storage.with_read(|conn| get_entry(conn, 2)).unwrap().unwrap();
        assert_eq!(stored.term, 2);
        assert_eq!(stored.entry, b"b".to_vec());
        assert_eq!(stored.flags, EntryFlags::Normal);
        assert_eq!(
            storage.with_read(|conn| get_last_entry_term(conn)).unwrap(),
            2
        );
    }

    #[test]
    fn replaying_a_batch_is_a_no_op() {
        let storage = storage_with_entries(3, 1);
        storage
            .with_write(|conn| term::set_last_commit_index(conn, 2, 1))
            .unwrap();

        let batch: Vec<_> = (1..=3).map(|i| entry(i, 1)).collect();
        let topology = storage
            .with_write(|conn| append_to_log(conn, &batch))
            .unwrap();
        assert!(topology.is_none());

        storage
            .with_read(|conn| {
                assert_eq!(get_log_entries_range(conn)?, (1, 3));
                assert_eq!(term::last_commit(conn)?.index, 2);
                assert_eq!(get_entries(conn, 1, 10)?, batch);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn diverging_entry_truncates_suffix() {
        let storage = storage_with_entries(5, 1);
        storage
            .with_write(|conn| append_to_log(conn, &[entry(3, 2)]))
            .unwrap();

        storage
            .with_read(|conn| {
                assert_eq!(get_term_for(conn, 2)?, Some(1));
                assert_eq!(get_term_for(conn, 3)?, Some(2));
                assert_eq!(get_term_for(conn, 4)?, None);
                assert_eq!(get_term_for(conn, 5)?, None);
                assert_eq!(get_last_entry_index(conn)?, 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn rewriting_committed_history_is_fatal() {
        let storage = storage_with_entries(5, 1);
        storage
            .with_write(|conn| term::set_last_commit_index(conn, 4, 1))
            .unwrap();

        let result = storage.with_write(|conn| append_to_log(conn, &[entry(3, 2)]));
        match result {
            Err(RaftError::FatalInvariant {
                index,
                term,
                commit_index,
                commit_term,
                ..
            }) => {
                assert_eq!((index, term), (3, 2));
                assert_eq!((commit_index, commit_term), (4, 1));
            }
            other => panic!("expected fatal invariant, got {other:?}"),
        }
        // nothing was rewritten
        assert_eq!(
            storage.with_read(|conn| get_term_for(conn, 5)).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn finds_last_topology_entry_in_range() {
        let storage = storage_with_entries(2, 1);
        storage
            .with_write(|conn| {
                insert_to_leader_log(conn, 1, b"first".to_vec(), EntryFlags::Topology)?;
                insert_to_leader_log(conn, 1, b"cmd".to_vec(), EntryFlags::Normal)?;
                insert_to_leader_log(conn, 1, b"second".to_vec(), EntryFlags::Topology)?;
                Ok(())
            })
            .unwrap();

        storage
            .with_read(|conn| {
                assert_eq!(
                    last_topology_entry_between(conn, 0, 5)?.map(|e| e.index),
                    Some(5)
                );
                assert_eq!(
                    last_topology_entry_between(conn, 0, 4)?.map(|e| e.entry),
                    Some(b"first".to_vec())
                );
                assert!(last_topology_entry_between(conn, 3, 4)?.is_none());
                assert!(last_topology_entry_between(conn, 5, 5)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn gaps_are_rejected() {
        let storage = storage_with_entries(2, 1);
        let result = storage.with_write(|conn| append_to_log(conn, &[entry(4, 1)]));
        assert!(matches!(result, Err(RaftError::InvalidOperation(_))));
    }

    #[test]
    fn append_reports_latest_topology_entry() {
        let storage = RaftStorage::open_in_memory().unwrap();
        let batch = vec![
            LogEntry::new(1, 1, b"t1".to_vec(), EntryFlags::Topology),
            entry(2, 1),
            LogEntry::new(3, 1, b"t2".to_vec(), EntryFlags::Topology),
            entry(4, 1),
        ];
        let topology = storage
            .with_write(|conn| append_to_log(conn, &batch))
            .unwrap()
            .unwrap();
        assert_eq!(topology.index, 3);

        // already written, so nothing new to report
        let again = storage
            .with_write(|conn| append_to_log(conn, &batch))
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn truncate_before_stops_at_commit_index() {
        let storage = storage_with_entries(5, 1);
        storage
            .with_write(|conn| {
                term::set_last_commit_index(conn, 3, 1)?;
                truncate_log_before(conn, 10)
            })
            .unwrap();

        storage
            .with_read(|conn| {
                assert_eq!(term::last_truncated(conn)?, (3, 1));
                assert_eq!(get_log_entries_range(conn)?, (4, 5));
                assert_eq!(get_term_for(conn, 3)?, Some(1));
                assert_eq!(get_term_for(conn, 2)?, None);
                assert_eq!(get_first_entry_index(conn)?, 4);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn truncated_log_still_answers_for_watermark() {
        let storage = storage_with_entries(3, 2);
        storage
            .with_write(|conn| {
                term::set_last_commit_index(conn, 3, 2)?;
                truncate_log_before(conn, 3)
            })
            .unwrap();

        storage
            .with_read(|conn| {
                assert_eq!(get_log_entries_range(conn)?, (3, 3));
                assert_eq!(get_last_entry(conn)?, (3, 2));
                assert_eq!(get_term_for(conn, 3)?, Some(2));
                Ok(())
            })
            .unwrap();

        // re-sending committed history below the watermark is harmless
        let batch: Vec<_> = (1..=4).map(|i| entry(i, 2)).collect();
        storage
            .with_write(|conn| append_to_log(conn, &batch))
            .unwrap();
        assert_eq!(
            storage.with_read(|conn| get_last_entry_index(conn)).unwrap(),
            4
        );
    }

    #[test]
    fn clear_log_resets_to_watermark() {
        let storage = storage_with_entries(4, 1);
        storage
            .with_write(|conn| clear_log_entries_and_set_last_truncate(conn, 10, 3))
            .unwrap();
        storage
            .with_read(|conn| {
                assert_eq!(get_log_entries_range(conn)?, (10, 10));
                assert_eq!(get_term_for(conn, 10)?, Some(3));
                assert!(get_entry(conn, 1)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn index_keys_sort_numerically() {
        assert!(index_key(255) < index_key(256));
        assert!(index_key(1) < index_key(1 << 40));
    }
}
