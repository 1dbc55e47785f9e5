use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::books_repository::{BookRepository, BookRepositoryError, LocalBooksRepository};

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
}

/// Copies every book of `source` into `target`, keeping creation and update instants.
/// A book is skipped only when the target already holds one with the same title,
/// author and creation instant, i.e. a copy left over from an interrupted run.
pub async fn migrate_books(
    source: &dyn BookRepository,
    target: &dyn BookRepository,
) -> Result<MigrationReport, BookRepositoryError> {
    let present: HashSet<(String, String, DateTime<Utc>)> = target
        .get_all()
        .await?
        .into_iter()
        .map(|book| (book.title, book.author, book.created_at))
        .collect();

    let mut report = MigrationReport::default();
    for book in source.get_all().await? {
        if present.contains(&(book.title.clone(), book.author.clone(), book.created_at)) {
            tracing::debug!("Skipping \"{}\", already in target", book.title);
            report.skipped += 1;
            continue;
        }
        target.copy_in(book).await?;
        report.migrated += 1;
    }

    tracing::info!(
        "Migrated {} books, skipped {}",
        report.migrated,
        report.skipped
    );
    Ok(report)
}

/// Moves the device local collection into `target`, e.g. the remote account right
/// after signing in. The local slot is cleared once everything arrived, so later
/// runs have nothing to copy and books deleted in `target` stay deleted.
/// On failure the local books are kept.
pub async fn move_local_books(
    local: &LocalBooksRepository,
    target: &dyn BookRepository,
) -> Result<MigrationReport, BookRepositoryError> {
    let report = migrate_books(local, target).await?;
    local.clear()?;
    Ok(report)
}
