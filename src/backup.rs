//! Online backup to and restore from a database file.

use core::ptr::NonNull;

use crate::codec::{HostText, TextMode};
use crate::db::NativeDb;
use crate::error::Result;
use crate::host::BackupObserver;
use crate::provider::{BackupStep, OpenFlags, Sqlite3Backup};

const MAIN: &[u8] = b"main";

/// Connection opened on the external file for the duration of one copy.
struct TransientDb<'a, P: Sqlite3Backup> {
    api: &'a P,
    db: NonNull<P::Db>,
}

impl<'a, P: Sqlite3Backup> TransientDb<'a, P> {
    fn open(api: &'a P, path: &[u8], flags: OpenFlags) -> Result<Self> {
        let flags = if is_uri(path) { flags | OpenFlags::URI } else { flags };
        let db = unsafe { api.open(path, flags)? };
        Ok(Self { api, db })
    }
}

impl<P: Sqlite3Backup> Drop for TransientDb<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = unsafe { self.api.close(self.db) } {
            tracing::warn!(error = %err, "closing backup file connection failed");
        }
    }
}

fn is_uri(path: &[u8]) -> bool {
    path.len() >= 5 && path[..5].eq_ignore_ascii_case(b"file:")
}

/// Busy statuses tolerated before the copy gives up.
#[derive(Clone, Copy)]
enum BusyPolicy {
    Fail,
    Retry { attempts: u32, sleep_ms: u32 },
}

fn run_copy<P: Sqlite3Backup>(
    api: &P,
    dest: NonNull<P::Db>,
    dest_name: &[u8],
    source: NonNull<P::Db>,
    source_name: &[u8],
    pages: i32,
    busy: BusyPolicy,
    observer: Option<&dyn BackupObserver>,
) -> Result<()> {
    let backup = unsafe { api.backup_init(dest, dest_name, source, source_name)? };
    let mut busy_seen = 0u32;
    let outcome = loop {
        let step = unsafe { api.backup_step(backup, pages) };
        if let Some(observer) = observer {
            let remaining = unsafe { api.backup_remaining(backup) };
            let page_count = unsafe { api.backup_pagecount(backup) };
            observer.on_progress(remaining, page_count);
        }
        match step {
            Ok(BackupStep::More) => continue,
            Ok(BackupStep::Done) => break Ok(()),
            Err(err) if err.is_busy() => match busy {
                BusyPolicy::Retry { attempts, sleep_ms } if busy_seen < attempts => {
                    busy_seen += 1;
                    tracing::debug!(attempt = busy_seen, "backup source busy, retrying");
                    api.sleep(sleep_ms);
                }
                _ => break Err(err),
            },
            Err(err) => break Err(err),
        }
    };
    let finished = unsafe { api.backup_finish(backup) };
    outcome.and(finished)
}

impl<'p, P: Sqlite3Backup> NativeDb<'p, P> {
    /// Copy database `db_name` of this connection into the file at `dest_path`.
    ///
    /// The file is created when missing; a `file:` prefix opens it as a URI.
    pub fn backup(
        &self,
        db_name: HostText<'_>,
        dest_path: HostText<'_>,
        observer: Option<&dyn BackupObserver>,
        mode: TextMode,
    ) -> Result<()> {
        let source = self.db()?;
        let db_name = self.codec.encode(db_name, mode)?;
        let dest_path = self.codec.encode(dest_path, mode)?;
        let file = TransientDb::open(
            self.api,
            &dest_path,
            OpenFlags::READ_WRITE | OpenFlags::CREATE,
        )?;
        tracing::debug!(path = %String::from_utf8_lossy(&dest_path), "starting backup");
        run_copy(
            self.api,
            file.db,
            MAIN,
            source,
            &db_name,
            self.config.backup_step_pages,
            BusyPolicy::Fail,
            observer,
        )
    }

    /// Replace database `db_name` of this connection with the file at
    /// `source_path`, retrying a bounded number of times while the source is
    /// busy.
    pub fn restore(
        &self,
        db_name: HostText<'_>,
        source_path: HostText<'_>,
        observer: Option<&dyn BackupObserver>,
        mode: TextMode,
    ) -> Result<()> {
        let dest = self.db()?;
        let db_name = self.codec.encode(db_name, mode)?;
        let source_path = self.codec.encode(source_path, mode)?;
        let file = TransientDb::open(self.api, &source_path, OpenFlags::READ_ONLY)?;
        tracing::debug!(path = %String::from_utf8_lossy(&source_path), "starting restore");
        run_copy(
            self.api,
            dest,
            &db_name,
            file.db,
            MAIN,
            self.config.backup_step_pages,
            BusyPolicy::Retry {
                attempts: self.config.restore_busy_retries,
                sleep_ms: self.config.restore_retry_sleep_ms,
            },
            observer,
        )
    }
}
