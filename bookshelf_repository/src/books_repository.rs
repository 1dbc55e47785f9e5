pub use book_row::BookRow;
pub use local_books_repository::{LocalBooksRepository, BOOKS_STORAGE_KEY};
pub use postgres_books_repository::{PostgresBooksRepository, PostgresBooksRepositoryConfig};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{Book, BookChange, BookId, BookPatch, ReadingStatus, RATING_RANGE};
use crate::key_value_store::StorageError;

mod book_row;
mod local_books_repository;
mod postgres_books_repository;

#[derive(thiserror::Error, Debug)]
pub enum BookRepositoryError {
    #[error("Book {0} already exists")]
    AlreadyExists(BookId),

    #[error("No authenticated user")]
    Unauthenticated,

    #[error("Rating {0} is outside of 1..=5")]
    InvalidRating(u8),

    #[error("Import rejected: {0}")]
    InvalidImport(String),

    #[error("Invalid book row: {0}")]
    InvalidRow(String),

    #[error("Storage failure {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to deserialize book: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

/// Storage contract shared by the local and the remote backend.
/// Callers hold an `Arc<dyn BookRepository>` and never care which one is active.
#[async_trait::async_trait]
pub trait BookRepository: Send + Sync {
    /// Lists all books visible to the caller
    async fn get_all(&self) -> Result<Vec<Book>, BookRepositoryError>;
    /// Stores a complete book, returns the stored record as the backend sees it
    async fn add(&self, book: Book) -> Result<Book, BookRepositoryError>;
    /// Applies the patch, returns the updated book or None if the book was not found
    async fn update(
        &self,
        book_id: BookId,
        patch: BookPatch,
    ) -> Result<Option<Book>, BookRepositoryError>;
    /// Returns true if the book was deleted and false if it was not found
    async fn delete(&self, book_id: BookId) -> Result<bool, BookRepositoryError>;
    /// Stores a book moved over from another backend. Unlike `add` the creation
    /// and update instants of the record are kept.
    async fn copy_in(&self, book: Book) -> Result<Book, BookRepositoryError> {
        self.add(book).await
    }
    /// Books of one shelf, in the same relative order as `get_all`
    async fn get_by_status(
        &self,
        status: ReadingStatus,
    ) -> Result<Vec<Book>, BookRepositoryError> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|book| book.status == status)
            .collect())
    }
}

/// Live notifications about changes made to the collection, possibly from other devices
#[async_trait::async_trait]
pub trait BookChangeFeed: Send + Sync {
    async fn subscribe(&self) -> Result<BookChangeSubscription, BookRepositoryError>;
}

/// Whole collection export and import
pub trait BookArchive {
    fn export(&self) -> String;
    /// Replaces the stored collection, returns the number of imported books
    fn import(&self, text: &str) -> Result<usize, BookRepositoryError>;
}

/// Handle to a running change feed. Dropping it stops delivery.
pub struct BookChangeSubscription {
    changes: mpsc::UnboundedReceiver<BookChange>,
    listener: JoinHandle<()>,
}

impl BookChangeSubscription {
    pub fn new(changes: mpsc::UnboundedReceiver<BookChange>, listener: JoinHandle<()>) -> Self {
        Self { changes, listener }
    }

    /// Waits for the next change, None once the feed is closed
    pub async fn next(&mut self) -> Option<BookChange> {
        self.changes.recv().await
    }

    pub fn try_next(&mut self) -> Option<BookChange> {
        self.changes.try_recv().ok()
    }

    /// Requests already sent to the backend are not affected
    pub fn unsubscribe(self) {}
}

impl Drop for BookChangeSubscription {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

pub(crate) fn check_rating(rating: Option<u8>) -> Result<(), BookRepositoryError> {
    match rating {
        Some(rating) if !RATING_RANGE.contains(&rating) => {
            Err(BookRepositoryError::InvalidRating(rating))
        }
        _ => Ok(()),
    }
}
