use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use crate::api::{now, Book, BookId, BookPatch, ReadingStatus, RATING_RANGE};
use crate::books_repository::{check_rating, BookArchive, BookRepository, BookRepositoryError};
use crate::key_value_store::KeyValueStore;

/// Slot the whole collection is stored under
pub const BOOKS_STORAGE_KEY: &str = "bookshelf.books";

/// Single device backend keeping the full collection as one JSON array in a key-value slot.
/// Every operation reads, changes and rewrites the whole collection.
/// Reads never fail: an unreadable slot is logged and treated as an empty collection.
pub struct LocalBooksRepository {
    storage: Arc<dyn KeyValueStore>,
    key: String,
}

impl LocalBooksRepository {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(storage, BOOKS_STORAGE_KEY)
    }

    pub fn with_key(storage: Arc<dyn KeyValueStore>, key: &str) -> Self {
        Self {
            storage,
            key: key.to_string(),
        }
    }

    /// Drops the whole collection by removing its slot
    pub fn clear(&self) -> Result<(), BookRepositoryError> {
        self.storage.remove(&self.key)?;
        tracing::info!("Cleared books in {}", self.key);
        Ok(())
    }

    fn load(&self) -> Result<Vec<Book>, BookRepositoryError> {
        match self.storage.get(&self.key)? {
            Some(content) => Ok(serde_json::from_str(&content)?),
            None => Ok(vec![]),
        }
    }

    fn load_or_empty(&self) -> Vec<Book> {
        self.load().unwrap_or_else(|err| {
            tracing::warn!("Failed to read books from {}: {}", self.key, err);
            vec![]
        })
    }

    fn save(&self, books: &[Book]) -> Result<(), BookRepositoryError> {
        let content = serde_json::to_string(books)?;
        self.storage.set(&self.key, &content)?;
        Ok(())
    }
}

/// Merges the patch into the book the same way a JSON merge patch would,
/// then applies the status side effects
fn apply_patch(book: &Book, patch: &BookPatch) -> Result<Book, BookRepositoryError> {
    let mut merged = json!(book);
    json_patch::merge(&mut merged, &json!(patch));
    let mut updated: Book = serde_json::from_value(merged)?;

    let entered_read = updated.status == ReadingStatus::Read && book.status != ReadingStatus::Read;
    if entered_read && patch.finished_at.is_none() {
        updated.finished_at = Some(now());
    }
    updated.updated_at = now();
    Ok(updated)
}

#[async_trait::async_trait]
impl BookRepository for LocalBooksRepository {
    async fn get_all(&self) -> Result<Vec<Book>, BookRepositoryError> {
        Ok(self.load_or_empty())
    }

    async fn add(&self, book: Book) -> Result<Book, BookRepositoryError> {
        check_rating(book.rating)?;
        // a slot that cannot be read must not be overwritten
        let mut books = self.load()?;
        if books.iter().any(|stored| stored.id == book.id) {
            return Err(BookRepositoryError::AlreadyExists(book.id));
        }
        books.push(book.clone());
        self.save(&books)?;
        tracing::info!("Added book {}", book.id);
        Ok(book)
    }

    async fn update(
        &self,
        book_id: BookId,
        patch: BookPatch,
    ) -> Result<Option<Book>, BookRepositoryError> {
        check_rating(patch.rating.flatten())?;
        let mut books = match self.load() {
            Ok(books) => books,
            Err(err) => {
                tracing::warn!("Failed to read books before updating {}: {}", book_id, err);
                return Ok(None);
            }
        };

        if let Some(book) = books.iter_mut().find(|book| book.id == book_id) {
            let updated = apply_patch(book, &patch)?;
            *book = updated.clone();
            if let Err(err) = self.save(&books) {
                tracing::error!("Failed to save updated book {}: {}", book_id, err);
                return Ok(None);
            }
            Ok(Some(updated))
        } else {
            Ok(None)
        }
    }

    async fn delete(&self, book_id: BookId) -> Result<bool, BookRepositoryError> {
        let mut books = match self.load() {
            Ok(books) => books,
            Err(err) => {
                tracing::warn!("Failed to read books before deleting {}: {}", book_id, err);
                return Ok(false);
            }
        };

        let count_before = books.len();
        books.retain(|book| book.id != book_id);
        if books.len() == count_before {
            return Ok(false);
        }

        match self.save(&books) {
            Ok(()) => Ok(true),
            Err(err) => {
                tracing::error!("Failed to save books after deleting {}: {}", book_id, err);
                Ok(false)
            }
        }
    }
}

impl BookArchive for LocalBooksRepository {
    fn export(&self) -> String {
        serde_json::to_string_pretty(&self.load_or_empty()).unwrap_or_else(|err| {
            tracing::error!("Failed to export books: {}", err);
            "[]".to_string()
        })
    }

    fn import(&self, text: &str) -> Result<usize, BookRepositoryError> {
        let books: Vec<Book> = serde_json::from_str(text)
            .map_err(|err| BookRepositoryError::InvalidImport(err.to_string()))?;

        let mut seen_ids = HashSet::new();
        for book in books.iter() {
            if !seen_ids.insert(book.id) {
                return Err(BookRepositoryError::InvalidImport(format!(
                    "book {} appears more than once",
                    book.id
                )));
            }
            if let Some(rating) = book.rating.filter(|rating| !RATING_RANGE.contains(rating)) {
                return Err(BookRepositoryError::InvalidImport(format!(
                    "book {} has rating {}",
                    book.id, rating
                )));
            }
        }

        self.save(&books)?;
        tracing::info!("Imported {} books into {}", books.len(), self.key);
        Ok(books.len())
    }
}

#[cfg(test)]
mod local_books_repository_tests {
    use std::time::Duration;

    use chrono::DateTime;
    use serde_json::Value;

    use crate::api::{create_book, BookDraft};
    use crate::key_value_store::{FileKeyValueStore, InMemoryKeyValueStore};

    use super::*;

    fn repository() -> (Arc<InMemoryKeyValueStore>, LocalBooksRepository) {
        let storage = Arc::new(InMemoryKeyValueStore::default());
        let repo = LocalBooksRepository::new(storage.clone());
        (storage, repo)
    }

    fn book(title: &str, status: ReadingStatus) -> Book {
        create_book(BookDraft::new(title, "Author").with_status(status))
    }

    #[tokio::test]
    /// Adds a few books and checks that listing keeps insertion order
    /// and that shelves are subsets of the full list in the same order
    async fn test_add_books_and_list_them() {
        let (_storage, repo) = repository();
        assert_eq!(repo.get_all().await.unwrap(), vec![]);

        let books = vec![
            book("first", ReadingStatus::Read),
            book("second", ReadingStatus::WantToRead),
            book("third", ReadingStatus::Read),
            book("fourth", ReadingStatus::CurrentlyReading),
        ];
        for book in books.iter() {
            let stored = repo.add(book.clone()).await.expect("Failed to add book");
            assert_eq!(&stored, book);
        }

        let all = repo.get_all().await.unwrap();
        assert_eq!(all, books);

        for status in ReadingStatus::ALL {
            let shelf = repo.get_by_status(status).await.unwrap();
            let expected: Vec<Book> = all
                .iter()
                .filter(|book| book.status == status)
                .cloned()
                .collect();
            assert_eq!(shelf, expected);
        }
        let read = repo.get_by_status(ReadingStatus::Read).await.unwrap();
        assert_eq!(read, vec![books[0].clone(), books[2].clone()]);

        let duplicate = repo.add(books[0].clone()).await;
        assert!(matches!(
            duplicate,
            Err(BookRepositoryError::AlreadyExists(..))
        ));
        let out_of_range = repo
            .add(Book {
                rating: Some(6),
                ..book("bad", ReadingStatus::Read)
            })
            .await;
        assert!(matches!(
            out_of_range,
            Err(BookRepositoryError::InvalidRating(6))
        ));
        assert_eq!(repo.get_all().await.unwrap().len(), 4);
    }

    #[tokio::test]
    /// Walks a book through the shelves and checks the finished_at side effects
    /// 1. currently_reading -> read sets finished_at
    /// 2. unrelated change while read keeps finished_at
    /// 3. read -> read keeps finished_at
    /// 4. leaving read keeps finished_at
    async fn test_status_transitions() {
        let (_storage, repo) = repository();
        let added = repo
            .add(book("Dune", ReadingStatus::CurrentlyReading))
            .await
            .unwrap();
        assert_eq!(added.finished_at, None);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let finished = repo
            .update(added.id, BookPatch::status(ReadingStatus::Read))
            .await
            .unwrap()
            .expect("Book not found");
        assert_eq!(finished.status, ReadingStatus::Read);
        let finished_at = finished.finished_at.expect("finished_at not set");
        assert!(finished_at > added.created_at);
        assert!(finished.updated_at > added.updated_at);
        assert_eq!(finished.created_at, added.created_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reviewed = repo
            .update(
                added.id,
                BookPatch {
                    review: Some("Spice".to_string()),
                    ..BookPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reviewed.review, "Spice");
        assert_eq!(reviewed.finished_at, Some(finished_at));

        let read_again = repo
            .update(added.id, BookPatch::status(ReadingStatus::Read))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read_again.finished_at, Some(finished_at));

        let rereading = repo
            .update(added.id, BookPatch::status(ReadingStatus::CurrentlyReading))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rereading.status, ReadingStatus::CurrentlyReading);
        assert_eq!(rereading.finished_at, Some(finished_at));

        assert_eq!(repo.get_all().await.unwrap(), vec![rereading]);
    }

    #[tokio::test]
    /// Patches only touch supplied fields, null clears nullable ones
    async fn test_patch_fields() {
        let (_storage, repo) = repository();
        let not_existing = repo
            .update(BookId::new_v4(), BookPatch::default())
            .await
            .unwrap();
        assert_eq!(not_existing, None);

        let added = repo
            .add(create_book(BookDraft::new("T", "A").with_rating(3)))
            .await
            .unwrap();

        let retitled = repo
            .update(
                added.id,
                BookPatch {
                    title: Some("New title".to_string()),
                    cover_url: Some("https://covers.example/t.png".to_string()),
                    ..BookPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retitled.title, "New title");
        assert_eq!(retitled.author, "A");
        assert_eq!(retitled.rating, Some(3));
        assert!(retitled.has_cover());

        let unrated = repo
            .update(added.id, BookPatch::rating(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unrated.rating, None);
        assert_eq!(unrated.title, "New title");

        let backdated = DateTime::from_timestamp_millis(1_600_000_000_000).unwrap();
        let finished = repo
            .update(
                added.id,
                BookPatch {
                    status: Some(ReadingStatus::Read),
                    finished_at: Some(Some(backdated)),
                    ..BookPatch::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.finished_at, Some(backdated));

        let invalid = repo.update(added.id, BookPatch::rating(Some(0))).await;
        assert!(matches!(invalid, Err(BookRepositoryError::InvalidRating(0))));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_storage, repo) = repository();
        let kept = repo.add(book("kept", ReadingStatus::Read)).await.unwrap();
        let removed = repo
            .add(book("removed", ReadingStatus::Read))
            .await
            .unwrap();

        let before = repo.get_all().await.unwrap();
        assert!(!repo.delete(BookId::new_v4()).await.unwrap());
        assert_eq!(repo.get_all().await.unwrap(), before);

        assert!(repo.delete(removed.id).await.unwrap());
        assert_eq!(repo.get_all().await.unwrap(), vec![kept]);
        assert!(!repo.delete(removed.id).await.unwrap());
    }

    #[tokio::test]
    /// Export followed by import gives back the same collection for empty, single and many books
    async fn test_export_import_round_trip() {
        let collections = vec![
            vec![],
            vec![book("only", ReadingStatus::WantToRead)],
            vec![
                create_book(BookDraft {
                    review: Some("Loved it".to_string()),
                    cover_url: Some("https://covers.example/a.jpg".to_string()),
                    finished_at: Some(now()),
                    ..BookDraft::new("a", "b")
                        .with_status(ReadingStatus::Read)
                        .with_rating(5)
                }),
                book("no rating", ReadingStatus::CurrentlyReading),
                book("also none", ReadingStatus::WantToRead),
            ],
        ];

        for books in collections {
            let (_storage, source) = repository();
            source.import(&serde_json::to_string(&books).unwrap()).unwrap();
            assert_eq!(source.get_all().await.unwrap(), books);

            let exported = source.export();
            let (_storage, target) = repository();
            target.add(book("replaced", ReadingStatus::Read)).await.unwrap();

            assert_eq!(target.import(&exported).unwrap(), books.len());
            assert_eq!(target.get_all().await.unwrap(), books);
            assert_eq!(target.export(), exported);
        }
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_input() {
        let (_storage, repo) = repository();
        let existing = repo.add(book("existing", ReadingStatus::Read)).await.unwrap();

        let duplicated = serde_json::to_string(&vec![existing.clone(), existing.clone()]).unwrap();
        let bad_rating = serde_json::to_string(&vec![Book {
            rating: Some(9),
            ..existing.clone()
        }])
        .unwrap();

        for text in [
            "not json",
            "{}",
            r#"{"books": []}"#,
            "[1, 2, 3]",
            r#"[{"title": "no id"}]"#,
            r#"[{"id": "x", "title": "t", "author": "a", "status": "read", "createdAt": 1, "updatedAt": 1}]"#,
            r#"[{"id": "00000000-0000-0000-0000-000000000001", "title": "t", "author": "a", "status": "lost", "createdAt": 1, "updatedAt": 1}]"#,
            duplicated.as_str(),
            bad_rating.as_str(),
        ] {
            let result = repo.import(text);
            assert!(
                matches!(result, Err(BookRepositoryError::InvalidImport(..))),
                "import of {text} was not rejected"
            );
            assert_eq!(repo.get_all().await.unwrap(), vec![existing.clone()]);
        }
    }

    #[tokio::test]
    /// The slot holds a camelCase JSON array with epoch millisecond instants
    async fn test_stored_format() {
        let (storage, repo) = repository();
        let added = repo.add(book("format", ReadingStatus::Read)).await.unwrap();

        let raw = storage.get(BOOKS_STORAGE_KEY).unwrap().expect("Nothing stored");
        let stored: Value = serde_json::from_str(&raw).unwrap();
        let record = &stored.as_array().expect("Not an array")[0];
        let mut keys: Vec<&str> = record
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "author",
                "coverUrl",
                "createdAt",
                "finishedAt",
                "id",
                "rating",
                "review",
                "status",
                "title",
                "updatedAt"
            ]
        );
        assert_eq!(
            record["createdAt"].as_i64(),
            Some(added.created_at.timestamp_millis())
        );
        assert!(record["rating"].is_null());
        assert!(record["finishedAt"].is_null());
    }

    #[tokio::test]
    /// A disabled or full storage never makes reads fail,
    /// writes report failure and leave the collection as it was
    async fn test_storage_failures_are_absorbed() {
        let storage = Arc::new(InMemoryKeyValueStore::with_quota(1024));
        let repo = LocalBooksRepository::new(storage.clone());
        let stored = repo.add(book("fits", ReadingStatus::Read)).await.unwrap();

        let too_big = Book {
            review: "x".repeat(2048),
            ..book("too big", ReadingStatus::Read)
        };
        let result = repo.add(too_big).await;
        assert!(matches!(result, Err(BookRepositoryError::Storage(..))));
        assert_eq!(repo.get_all().await.unwrap(), vec![stored.clone()]);

        let update = repo
            .update(
                stored.id,
                BookPatch {
                    review: Some("x".repeat(2048)),
                    ..BookPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(update, None);
        assert_eq!(repo.get_all().await.unwrap(), vec![stored.clone()]);

        storage.set_unavailable(true);
        assert_eq!(repo.get_all().await.unwrap(), vec![]);
        assert_eq!(repo.get_by_status(ReadingStatus::Read).await.unwrap(), vec![]);
        assert!(!repo.delete(stored.id).await.unwrap());
        assert_eq!(
            repo.update(stored.id, BookPatch::status(ReadingStatus::WantToRead))
                .await
                .unwrap(),
            None
        );
        assert!(repo.add(book("lost", ReadingStatus::Read)).await.is_err());
        assert_eq!(repo.export(), "[]");

        storage.set_unavailable(false);
        assert_eq!(repo.get_all().await.unwrap(), vec![stored]);
    }

    #[tokio::test]
    /// A slot with garbage reads as empty but is not overwritten by the next add
    async fn test_corrupted_slot_is_not_overwritten() {
        let (storage, repo) = repository();
        storage.set(BOOKS_STORAGE_KEY, "{ definitely not books").unwrap();

        assert_eq!(repo.get_all().await.unwrap(), vec![]);
        assert!(repo.add(book("new", ReadingStatus::Read)).await.is_err());
        assert_eq!(
            storage.get(BOOKS_STORAGE_KEY).unwrap().as_deref(),
            Some("{ definitely not books")
        );
    }

    #[tokio::test]
    async fn test_file_backed_collection_survives_restart() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first = LocalBooksRepository::new(Arc::new(FileKeyValueStore::new(dir.path())));
        let added = first.add(book("persisted", ReadingStatus::Read)).await.unwrap();

        let second = LocalBooksRepository::new(Arc::new(FileKeyValueStore::new(dir.path())));
        assert_eq!(second.get_all().await.unwrap(), vec![added]);

        let other_slot =
            LocalBooksRepository::with_key(Arc::new(FileKeyValueStore::new(dir.path())), "other");
        assert_eq!(other_slot.get_all().await.unwrap(), vec![]);
    }
}
