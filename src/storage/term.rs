//! Term, vote, watermarks and node tag, kept in the `raft_state` table.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{RaftError, Result};
use crate::raft::state::CommitPoint;
use crate::topology::INITIAL_TAG;

pub(crate) const CURRENT_TERM: &str = "CurrentTerm";
pub(crate) const VOTED_FOR: &str = "VotedFor";
pub(crate) const LAST_COMMIT: &str = "LastCommit";
pub(crate) const LAST_TRUNCATED: &str = "LastTruncated";
pub(crate) const TOPOLOGY: &str = "Topology";
pub(crate) const TAG: &str = "Tag";

pub(crate) fn get_value(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>> {
    let value = conn
        .query_row(
            "SELECT value FROM raft_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn put_value(conn: &Connection, key: &str, value: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO raft_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn encode_pair(first: u64, second: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&first.to_be_bytes());
    buf[8..].copy_from_slice(&second.to_be_bytes());
    buf
}

fn decode_pair(value: &[u8]) -> (u64, u64) {
    if value.len() < 16 {
        return (0, 0);
    }
    (decode_u64(&value[..8]), decode_u64(&value[8..16]))
}

fn get_pair(conn: &Connection, key: &str) -> Result<(u64, u64)> {
    Ok(get_value(conn, key)?
        .map(|value| decode_pair(&value))
        .unwrap_or((0, 0)))
}

pub fn current_term(conn: &Connection) -> Result<u64> {
    Ok(get_value(conn, CURRENT_TERM)?
        .map(|value| decode_u64(&value))
        .unwrap_or(0))
}

fn decode_u64(value: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if value.len() >= 8 {
        buf.copy_from_slice(&value[..8]);
    }
    u64::from_be_bytes(buf)
}

pub fn voted_for(conn: &Connection) -> Result<Option<String>> {
    Ok(get_value(conn, VOTED_FOR)?
        .map(|value| String::from_utf8_lossy(&value).into_owned())
        .filter(|tag| !tag.is_empty()))
}

/// Overwrite the term and clear the vote. Monotonicity is the caller's job;
/// use [`found_about_higher_term`] or [`cast_vote_in_term`] instead.
pub(crate) fn set_current_term(conn: &Connection, term: u64) -> Result<()> {
    put_value(conn, CURRENT_TERM, &term.to_be_bytes())?;
    put_value(conn, VOTED_FOR, b"")
}

pub(crate) fn cast_vote(conn: &Connection, term: u64, voted_for: &str) -> Result<()> {
    put_value(conn, CURRENT_TERM, &term.to_be_bytes())?;
    put_value(conn, VOTED_FOR, voted_for.as_bytes())
}

/// Bump the term and clear the vote when `term` is newer. Returns whether
/// anything changed.
pub fn found_about_higher_term(conn: &Connection, term: u64) -> Result<bool> {
    if term <= current_term(conn)? {
        return Ok(false);
    }
    set_current_term(conn, term)?;
    Ok(true)
}

/// Record a vote in a strictly newer term.
pub fn cast_vote_in_term(conn: &Connection, term: u64, voted_for: &str) -> Result<()> {
    let current = current_term(conn)?;
    if term <= current {
        return Err(RaftError::Concurrency(format!(
            "cannot vote for {voted_for} in term {term}, current term is already {current}"
        )));
    }
    cast_vote(conn, term, voted_for)
}

pub fn last_commit(conn: &Connection) -> Result<CommitPoint> {
    let (index, term) = get_pair(conn, LAST_COMMIT)?;
    Ok(CommitPoint { index, term })
}

/// Move the commit watermark forward. Lower indexes, or the same index with
/// a different term, are programming errors.
pub fn set_last_commit_index(conn: &Connection, index: u64, term: u64) -> Result<()> {
    let current = last_commit(conn)?;
    if index < current.index {
        return Err(RaftError::InvalidOperation(format!(
            "commit index cannot move backwards from {} to {index}",
            current.index
        )));
    }
    if index == current.index && current.index != 0 && term != current.term {
        return Err(RaftError::InvalidOperation(format!(
            "commit index {index} already committed at term {}, got term {term}",
            current.term
        )));
    }
    put_value(conn, LAST_COMMIT, &encode_pair(index, term))
}

pub(crate) fn reset_last_commit(conn: &Connection, index: u64, term: u64) -> Result<()> {
    put_value(conn, LAST_COMMIT, &encode_pair(index, term))
}

pub fn last_truncated(conn: &Connection) -> Result<(u64, u64)> {
    get_pair(conn, LAST_TRUNCATED)
}

pub(crate) fn set_last_truncated(conn: &Connection, index: u64, term: u64) -> Result<()> {
    put_value(conn, LAST_TRUNCATED, &encode_pair(index, term))
}

pub fn tag(conn: &Connection) -> Result<String> {
    Ok(get_value(conn, TAG)?
        .map(|value| String::from_utf8_lossy(&value).into_owned())
        .unwrap_or_else(|| INITIAL_TAG.to_string()))
}

pub(crate) fn set_tag(conn: &Connection, tag: &str) -> Result<()> {
    put_value(conn, TAG, tag.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RaftStorage;

    #[test]
    fn fresh_store_defaults() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage
            .with_read(|conn| {
                assert_eq!(current_term(conn)?, 0);
                assert_eq!(voted_for(conn)?, None);
                assert_eq!(last_commit(conn)?, CommitPoint::default());
                assert_eq!(last_truncated(conn)?, (0, 0));
                assert_eq!(tag(conn)?, INITIAL_TAG);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cast_vote_requires_strictly_higher_term() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage
            .with_write(|conn| cast_vote_in_term(conn, 3, "A"))
            .unwrap();

        let same = storage.with_write(|conn| cast_vote_in_term(conn, 3, "B"));
        assert!(matches!(same, Err(RaftError::Concurrency(_))));
        let lower = storage.with_write(|conn| cast_vote_in_term(conn, 2, "B"));
        assert!(matches!(lower, Err(RaftError::Concurrency(_))));

        let (term, vote) = storage
            .with_read(|conn| Ok((current_term(conn)?, voted_for(conn)?)))
            .unwrap();
        assert_eq!(term, 3);
        assert_eq!(vote.as_deref(), Some("A"));
    }

    #[test]
    fn higher_term_clears_vote_and_never_decreases() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage
            .with_write(|conn| cast_vote_in_term(conn, 2, "A"))
            .unwrap();

        assert!(storage
            .with_write(|conn| found_about_higher_term(conn, 5))
            .unwrap());
        assert!(!storage
            .with_write(|conn| found_about_higher_term(conn, 4))
            .unwrap());

        let (term, vote) = storage
            .with_read(|conn| Ok((current_term(conn)?, voted_for(conn)?)))
            .unwrap();
        assert_eq!(term, 5);
        assert_eq!(vote, None);
    }

    #[test]
    fn commit_index_only_moves_forward() {
        let storage = RaftStorage::open_in_memory().unwrap();
        storage
            .with_write(|conn| set_last_commit_index(conn, 5, 2))
            .unwrap();

        let lower = storage.with_write(|conn| set_last_commit_index(conn, 4, 2));
        assert!(matches!(lower, Err(RaftError::InvalidOperation(_))));

        let other_term = storage.with_write(|conn| set_last_commit_index(conn, 5, 3));
        assert!(matches!(other_term, Err(RaftError::InvalidOperation(_))));

        storage
            .with_write(|conn| set_last_commit_index(conn, 5, 2))
            .unwrap();
        storage
            .with_write(|conn| set_last_commit_index(conn, 9, 3))
            .unwrap();
        let commit = storage.with_read(|conn| last_commit(conn)).unwrap();
        assert_eq!(commit, CommitPoint { index: 9, term: 3 });
    }

    #[test]
    fn pairs_are_big_endian() {
        let encoded = encode_pair(1, 258);
        assert_eq!(encoded[7], 1);
        assert_eq!(&encoded[14..], &[1, 2]);
        assert_eq!(decode_pair(&encoded), (1, 258));
    }
}
