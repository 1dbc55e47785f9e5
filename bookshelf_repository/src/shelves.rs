use std::sync::Arc;

use crate::api::{create_book, Book, BookDraft, BookId, BookPatch, ReadingStatus, RATING_RANGE};
use crate::books_repository::{BookRepository, BookRepositoryError};
use crate::validation::{validate_book, ValidationReport, RATING_OUT_OF_RANGE};

#[derive(Debug, Default, Clone, Eq, PartialEq)]
/// The collection split by reading status, each shelf keeps the order it was listed in
pub struct Shelves {
    pub want_to_read: Vec<Book>,
    pub currently_reading: Vec<Book>,
    pub read: Vec<Book>,
}

impl Shelves {
    pub fn shelf(&self, status: ReadingStatus) -> &[Book] {
        match status {
            ReadingStatus::WantToRead => &self.want_to_read,
            ReadingStatus::CurrentlyReading => &self.currently_reading,
            ReadingStatus::Read => &self.read,
        }
    }

    pub fn len(&self) -> usize {
        self.want_to_read.len() + self.currently_reading.len() + self.read.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<Book>> for Shelves {
    fn from(books: Vec<Book>) -> Self {
        let mut shelves = Shelves::default();
        for book in books {
            match book.status {
                ReadingStatus::WantToRead => shelves.want_to_read.push(book),
                ReadingStatus::CurrentlyReading => shelves.currently_reading.push(book),
                ReadingStatus::Read => shelves.read.push(book),
            }
        }
        shelves
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LibraryError {
    #[error("Invalid book: {}", .0.errors.join(", "))]
    Invalid(ValidationReport),

    #[error("Book {0} not found")]
    NotFound(BookId),

    #[error(transparent)]
    Repository(#[from] BookRepositoryError),
}

/// What the screens talk to. User input is validated here and never reaches the
/// active backend unchecked.
pub struct Library {
    books_repository: Arc<dyn BookRepository>,
}

impl Library {
    pub fn new(books_repository: Arc<dyn BookRepository>) -> Self {
        Self { books_repository }
    }

    pub async fn shelves(&self) -> Result<Shelves, LibraryError> {
        Ok(self.books_repository.get_all().await?.into())
    }

    pub async fn add_book(&self, draft: BookDraft) -> Result<Book, LibraryError> {
        check_draft(&draft)?;
        let book = self.books_repository.add(create_book(draft)).await?;
        tracing::info!("Added \"{}\" to {}", book.title, book.status);
        Ok(book)
    }

    /// Replaces the editable values with the ones from the submitted form
    pub async fn edit_book(&self, book_id: BookId, draft: BookDraft) -> Result<Book, LibraryError> {
        check_draft(&draft)?;
        self.update(book_id, BookPatch::from_draft(&draft)).await
    }

    pub async fn move_to(
        &self,
        book_id: BookId,
        status: ReadingStatus,
    ) -> Result<Book, LibraryError> {
        self.update(book_id, BookPatch::status(status)).await
    }

    /// `None` clears the rating
    pub async fn rate(&self, book_id: BookId, rating: Option<u8>) -> Result<Book, LibraryError> {
        if let Some(rating) = rating {
            if !RATING_RANGE.contains(&rating) {
                return Err(LibraryError::Invalid(ValidationReport {
                    errors: vec![RATING_OUT_OF_RANGE.to_string()],
                }));
            }
        }
        self.update(book_id, BookPatch::rating(rating)).await
    }

    pub async fn remove_book(&self, book_id: BookId) -> Result<(), LibraryError> {
        if !self.books_repository.delete(book_id).await? {
            return Err(LibraryError::NotFound(book_id));
        }
        tracing::info!("Removed book {}", book_id);
        Ok(())
    }

    async fn update(&self, book_id: BookId, patch: BookPatch) -> Result<Book, LibraryError> {
        self.books_repository
            .update(book_id, patch)
            .await?
            .ok_or(LibraryError::NotFound(book_id))
    }
}

fn check_draft(draft: &BookDraft) -> Result<(), LibraryError> {
    let report = validate_book(draft);
    if report.is_valid() {
        Ok(())
    } else {
        Err(LibraryError::Invalid(report))
    }
}
