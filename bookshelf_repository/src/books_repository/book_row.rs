use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;

use crate::api::{Book, BookId, ReadingStatus, UserId, RATING_RANGE};
use crate::books_repository::BookRepositoryError;

/// Application field name paired with the remote column it is stored in
pub const FIELD_MAPPING: [(&str, &str); 10] = [
    ("id", "id"),
    ("title", "title"),
    ("author", "author"),
    ("coverUrl", "cover_url"),
    ("status", "status"),
    ("rating", "rating"),
    ("review", "review"),
    ("createdAt", "created_at"),
    ("updatedAt", "updated_at"),
    ("finishedAt", "finished_at"),
];

/// Remote only column, never part of the application record
pub const OWNER_COLUMN: &str = "owner_id";

pub fn remote_field(app_field: &str) -> Result<&'static str, BookRepositoryError> {
    FIELD_MAPPING
        .iter()
        .find(|(app, _)| *app == app_field)
        .map(|(_, remote)| *remote)
        .ok_or_else(|| BookRepositoryError::Other(format!("No column for field {app_field}")))
}

/// Columns selected whenever a full row is read back
pub fn book_columns() -> String {
    FIELD_MAPPING
        .iter()
        .map(|(_, remote)| *remote)
        .chain(std::iter::once(OWNER_COLUMN))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
/// Book as the remote backend stores it, one row per book owned by one user
pub struct BookRow {
    pub id: BookId,
    pub owner_id: UserId,
    pub title: String,
    pub author: String,
    pub cover_url: String,
    pub status: ReadingStatus,
    pub rating: Option<u8>,
    pub review: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BookRow {
    pub fn from_book(book: &Book, owner_id: UserId) -> Self {
        Self {
            id: book.id,
            owner_id,
            title: book.title.clone(),
            author: book.author.clone(),
            cover_url: book.cover_url.clone(),
            status: book.status,
            rating: book.rating,
            review: book.review.clone(),
            created_at: book.created_at,
            updated_at: book.updated_at,
            finished_at: book.finished_at,
        }
    }
}

impl From<BookRow> for Book {
    fn from(row: BookRow) -> Self {
        Book {
            id: row.id,
            title: row.title,
            author: row.author,
            cover_url: row.cover_url,
            status: row.status,
            rating: row.rating,
            review: row.review,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        }
    }
}

impl TryFrom<&Row> for BookRow {
    type Error = BookRepositoryError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        let status: String = row.try_get("status")?;
        let rating: Option<i16> = row.try_get("rating")?;

        let rating = rating
            .map(|rating| {
                u8::try_from(rating)
                    .ok()
                    .filter(|rating| RATING_RANGE.contains(rating))
                    .ok_or_else(|| {
                        BookRepositoryError::InvalidRow(format!("rating {rating} out of range"))
                    })
            })
            .transpose()?;

        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            title: row.try_get("title")?,
            author: row.try_get("author")?,
            cover_url: row.try_get("cover_url")?,
            status: status
                .parse()
                .map_err(|err| BookRepositoryError::InvalidRow(format!("{err}")))?,
            rating,
            review: row.try_get("review")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}
