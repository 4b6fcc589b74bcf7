//! Append-only, file-backed coupon store.
//!
//! Each coupon is one JSON object per line. The journal is replayed into an
//! in-memory index on open, and every insert is flushed and `fsync`ed before
//! it is reported as persisted. A trailing line cut short by a crash is
//! truncated away on open; any other malformed line is an error.

use crate::{
    error::{Error, Result},
    records::CouponStore,
    types::{Coupon, UserId},
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct Journal {
    file: File,
    /// Length of the journal up to the last complete record.
    len: u64,
    index: HashMap<UserId, Coupon>,
}

/// Durable [`CouponStore`] writing a JSON-lines journal.
///
/// All inserts go through one async mutex, which makes the uniqueness check
/// and the append a single step for every worker sharing the store.
pub struct JournalCouponStore {
    path: PathBuf,
    journal: Mutex<Journal>,
}

impl JournalCouponStore {
    /// Opens (or creates) the journal at `path` and replays it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Journal`] if the file cannot be read or written, or if
    /// a complete line does not decode as a coupon.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (index, len) = replay(&path, &contents)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if len < contents.len() as u64 {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                path = %path.display(),
                discarded = contents.len() as u64 - len,
                "Truncating incomplete trailing journal record"
            );
            file.set_len(len).await?;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(path = %path.display(), coupons = index.len(), "Coupon journal opened");

        Ok(Self {
            path,
            journal: Mutex::new(Journal { file, len, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decodes every complete line, returning the index and the byte length of
/// the valid prefix.
fn replay(path: &Path, contents: &[u8]) -> Result<(HashMap<UserId, Coupon>, u64)> {
    let mut index = HashMap::new();
    let mut offset = 0_usize;

    for (line_no, raw) in contents.split_inclusive(|b| *b == b'\n').enumerate() {
        if raw.last() != Some(&b'\n') {
            // Torn write from a crash mid-append.
            break;
        }
        offset += raw.len();

        let line = raw.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let coupon: Coupon = serde_json::from_slice(line).map_err(|e| {
            Error::Journal(format!("{}:{}: {e}", path.display(), line_no + 1))
        })?;
        index.entry(coupon.user_id).or_insert(coupon);
    }

    Ok((index, offset as u64))
}

impl CouponStore for JournalCouponStore {
    async fn exists_by_user_id(&self, user_id: UserId) -> Result<bool> {
        Ok(self.journal.lock().await.index.contains_key(&user_id))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(user_id = %coupon.user_id)))]
    async fn insert_if_absent(&self, coupon: Coupon) -> Result<bool> {
        let mut journal = self.journal.lock().await;
        if journal.index.contains_key(&coupon.user_id) {
            return Ok(false);
        }

        let mut record = serde_json::to_vec(&coupon)?;
        record.push(b'\n');

        let written = async {
            journal.file.write_all(&record).await?;
            journal.file.flush().await?;
            journal.file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            // Roll back a partial append so later records stay line-aligned.
            let len = journal.len;
            if let Err(_rollback) = journal.file.set_len(len).await {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to roll back partial journal write: {_rollback}");
            }
            return Err(e.into());
        }

        journal.len += record.len() as u64;
        journal.index.insert(coupon.user_id, coupon);
        Ok(true)
    }

    async fn get(&self, user_id: UserId) -> Result<Option<Coupon>> {
        Ok(self.journal.lock().await.index.get(&user_id).copied())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.journal.lock().await.index.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AdmissionEvent, CouponId};

    fn temp_journal() -> PathBuf {
        std::env::temp_dir().join(format!("coupon-journal-{}.jsonl", CouponId::generate()))
    }

    fn coupon(user: u64) -> Coupon {
        Coupon::issue(&AdmissionEvent::new(UserId::new(user), user))
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let path = temp_journal();
        let first = coupon(1);
        {
            let store = JournalCouponStore::open(&path).await.unwrap();
            assert!(store.insert_if_absent(first).await.unwrap());
            assert!(store.insert_if_absent(coupon(2)).await.unwrap());
            assert!(!store.insert_if_absent(coupon(1)).await.unwrap());
        }

        let store = JournalCouponStore::open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.get(UserId::new(1)).await.unwrap(), Some(first));
        assert!(!store.insert_if_absent(coupon(2)).await.unwrap());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let path = temp_journal();
        let kept = coupon(1);
        let mut contents = serde_json::to_vec(&kept).unwrap();
        contents.push(b'\n');
        contents.extend_from_slice(br#"{"id":"0000","user_"#);
        std::fs::write(&path, &contents).unwrap();

        let store = JournalCouponStore::open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.insert_if_absent(coupon(2)).await.unwrap());
        drop(store);

        let store = JournalCouponStore::open(&path).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupt_complete_line_is_rejected() {
        let path = temp_journal();
        std::fs::write(&path, b"not json\n").unwrap();

        let err = JournalCouponStore::open(&path).await.err().unwrap();
        assert!(matches!(err, Error::Journal(msg) if msg.contains(":1:")));

        let _ = std::fs::remove_file(path);
    }
}
