use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, NoTls, Row, Statement};

use crate::api::{
    Book, BookChange, BookId, BookPatch, ChangeKind, Principal, ReadingStatus, UserId,
};
use crate::books_repository::book_row::{book_columns, remote_field, BookRow};
use crate::books_repository::{
    check_rating, BookChangeFeed, BookChangeSubscription, BookRepository, BookRepositoryError,
};

const CHANGES_CHANNEL: &str = "book_changes";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS books (
        id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        owner_id        UUID NOT NULL,
        title           TEXT NOT NULL DEFAULT '',
        author          TEXT NOT NULL DEFAULT '',
        cover_url       TEXT NOT NULL DEFAULT '',
        status          TEXT NOT NULL DEFAULT 'want_to_read'
                        CHECK (status IN ('want_to_read', 'currently_reading', 'read')),
        rating          SMALLINT CHECK (rating BETWEEN 1 AND 5),
        review          TEXT NOT NULL DEFAULT '',
        created_at      TIMESTAMPTZ NOT NULL DEFAULT date_trunc('milliseconds', now()),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT date_trunc('milliseconds', now()),
        finished_at     TIMESTAMPTZ
    );

    CREATE INDEX IF NOT EXISTS books_owner_created_at ON books (owner_id, created_at DESC);

    CREATE OR REPLACE FUNCTION books_refresh_updated_at() RETURNS trigger AS $$
    BEGIN
        NEW.updated_at = date_trunc('milliseconds', now());
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql;

    DROP TRIGGER IF EXISTS books_updated_at ON books;
    CREATE TRIGGER books_updated_at BEFORE UPDATE ON books
        FOR EACH ROW EXECUTE FUNCTION books_refresh_updated_at();

    CREATE OR REPLACE FUNCTION books_notify_change() RETURNS trigger AS $$
    DECLARE
        changed books;
    BEGIN
        IF TG_OP = 'DELETE' THEN
            changed := OLD;
        ELSE
            changed := NEW;
        END IF;
        PERFORM pg_notify(
            'book_changes',
            json_build_object('event', TG_OP, 'id', changed.id, 'owner_id', changed.owner_id)::text
        );
        RETURN NULL;
    END;
    $$ LANGUAGE plpgsql;

    DROP TRIGGER IF EXISTS books_changes ON books;
    CREATE TRIGGER books_changes AFTER INSERT OR UPDATE OR DELETE ON books
        FOR EACH ROW EXECUTE FUNCTION books_notify_change();
";

pub struct PostgresBooksRepositoryConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

impl PostgresBooksRepositoryConfig {
    fn connection_str(&self) -> String {
        format!(
            "postgresql://{}:{}@{}",
            self.username, self.password, self.hostname
        )
    }
}

/// Multi device backend. Every row belongs to one user and every statement
/// is limited to the rows of the signed in principal.
pub struct PostgresBooksRepository {
    client: Client,
    connection_str: String,
    principal: parking_lot::RwLock<Option<Principal>>,
}

impl PostgresBooksRepository {
    pub async fn init(config: PostgresBooksRepositoryConfig) -> anyhow::Result<Self> {
        let connection_str = config.connection_str();
        tracing::info!(
            "Connecting to postgres at {} as {}",
            config.hostname,
            config.username
        );
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("connection error: {}", e);
            }
        });

        client
            .batch_execute(SCHEMA)
            .await
            .context("Failed to setup books table")?;
        Ok(Self {
            client,
            connection_str,
            principal: Default::default(),
        })
    }

    /// Authentication is done by the provider, this only records who the caller is
    pub fn sign_in(&self, principal: Principal) {
        tracing::info!("Signed in as {}", principal.user_id);
        *self.principal.write() = Some(principal);
    }

    pub fn sign_out(&self) {
        if let Some(principal) = self.principal.write().take() {
            tracing::info!("Signed out {}", principal.user_id);
        }
    }

    pub fn principal(&self) -> Option<Principal> {
        *self.principal.read()
    }

    fn require_principal(&self) -> Result<Principal, BookRepositoryError> {
        self.principal()
            .ok_or(BookRepositoryError::Unauthenticated)
    }

    /// Without `keep_instants` the server stamps creation and update time
    async fn insert(&self, book: &Book, keep_instants: bool) -> Result<Book, BookRepositoryError> {
        let principal = self.require_principal()?;
        check_rating(book.rating)?;
        let row = BookRow::from_book(book, principal.user_id);
        let status = row.status.as_str();
        let rating = row.rating.map(i16::from);
        let created_at: Option<DateTime<Utc>> = keep_instants.then_some(row.created_at);
        let updated_at: Option<DateTime<Utc>> = keep_instants.then_some(row.updated_at);

        let stmt: Statement = self
            .client
            .prepare(&format!(
                "INSERT INTO books \
                 (owner_id, title, author, cover_url, status, rating, review, finished_at, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                 COALESCE($9, date_trunc('milliseconds', now())), \
                 COALESCE($10, date_trunc('milliseconds', now()))) \
                 RETURNING {}",
                book_columns()
            ))
            .await?;

        let rows = self
            .client
            .query(
                &stmt,
                &[
                    &row.owner_id,
                    &row.title,
                    &row.author,
                    &row.cover_url,
                    &status,
                    &rating,
                    &row.review,
                    &row.finished_at,
                    &created_at,
                    &updated_at,
                ],
            )
            .await?;

        let stored = BookRow::try_from(
            rows.first()
                .ok_or_else(|| BookRepositoryError::Other("Book not returned".to_string()))?,
        )?;
        tracing::info!("Added book {} for {}", stored.id, principal.user_id);
        Ok(stored.into())
    }
}

fn rows_to_books(rows: &[Row]) -> Result<Vec<Book>, BookRepositoryError> {
    rows.iter()
        .map(|row| Ok(BookRow::try_from(row)?.into()))
        .collect()
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Collects the SET clause of an update, `$1` and `$2` are reserved for book and owner
struct UpdateStatement {
    assignments: Vec<String>,
    params: Vec<SqlParam>,
}

impl UpdateStatement {
    fn new(book_id: BookId, owner_id: UserId) -> Self {
        Self {
            assignments: vec!["updated_at = date_trunc('milliseconds', now())".to_string()],
            params: vec![Box::new(book_id), Box::new(owner_id)],
        }
    }

    /// `field` is the application name, the column comes from the field mapping
    fn set(&mut self, field: &str, value: SqlParam) -> Result<(), BookRepositoryError> {
        let column = remote_field(field)?;
        self.params.push(value);
        self.assignments
            .push(format!("{} = ${}", column, self.params.len()));
        Ok(())
    }

    fn from_patch(
        book_id: BookId,
        owner_id: UserId,
        patch: &BookPatch,
    ) -> Result<Self, BookRepositoryError> {
        let mut statement = Self::new(book_id, owner_id);
        if let Some(title) = &patch.title {
            statement.set("title", Box::new(title.clone()))?;
        }
        if let Some(author) = &patch.author {
            statement.set("author", Box::new(author.clone()))?;
        }
        if let Some(cover_url) = &patch.cover_url {
            statement.set("coverUrl", Box::new(cover_url.clone()))?;
        }
        if let Some(status) = patch.status {
            statement.set("status", Box::new(status.as_str()))?;
        }
        if let Some(rating) = patch.rating {
            statement.set("rating", Box::new(rating.map(i16::from)))?;
        }
        if let Some(review) = &patch.review {
            statement.set("review", Box::new(review.clone()))?;
        }
        match patch.finished_at {
            Some(finished_at) => statement.set("finishedAt", Box::new(finished_at))?,
            // right hand sides see the row before the update
            None if patch.status == Some(ReadingStatus::Read) => statement.assignments.push(
                "finished_at = CASE WHEN status <> 'read' \
                 THEN date_trunc('milliseconds', now()) ELSE finished_at END"
                    .to_string(),
            ),
            None => {}
        }
        Ok(statement)
    }

    fn sql(&self) -> String {
        format!(
            "UPDATE books SET {} WHERE id = $1 AND owner_id = $2 RETURNING {}",
            self.assignments.join(", "),
            book_columns()
        )
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

#[async_trait::async_trait]
impl BookRepository for PostgresBooksRepository {
    async fn get_all(&self) -> Result<Vec<Book>, BookRepositoryError> {
        let principal = match self.principal() {
            Some(principal) => principal,
            None => return Ok(vec![]),
        };
        let stmt: Statement = self
            .client
            .prepare(&format!(
                "SELECT {} FROM books WHERE owner_id = $1 ORDER BY created_at DESC, id",
                book_columns()
            ))
            .await?;

        let rows = self.client.query(&stmt, &[&principal.user_id]).await?;
        rows_to_books(&rows)
    }

    async fn add(&self, book: Book) -> Result<Book, BookRepositoryError> {
        self.insert(&book, false).await
    }

    async fn copy_in(&self, book: Book) -> Result<Book, BookRepositoryError> {
        self.insert(&book, true).await
    }

    async fn update(
        &self,
        book_id: BookId,
        patch: BookPatch,
    ) -> Result<Option<Book>, BookRepositoryError> {
        let principal = self.require_principal()?;
        check_rating(patch.rating.flatten())?;

        let statement = UpdateStatement::from_patch(book_id, principal.user_id, &patch)?;
        let rows = self
            .client
            .query(statement.sql().as_str(), &statement.params())
            .await?;

        rows.first()
            .map(|row| Ok(BookRow::try_from(row)?.into()))
            .transpose()
    }

    async fn delete(&self, book_id: BookId) -> Result<bool, BookRepositoryError> {
        let principal = self.require_principal()?;
        let stmt: Statement = self
            .client
            .prepare("DELETE FROM books WHERE id = $1 AND owner_id = $2 RETURNING id")
            .await?;

        let rows = self
            .client
            .query(&stmt, &[&book_id, &principal.user_id])
            .await?;
        Ok(!rows.is_empty())
    }

    async fn get_by_status(
        &self,
        status: ReadingStatus,
    ) -> Result<Vec<Book>, BookRepositoryError> {
        let principal = match self.principal() {
            Some(principal) => principal,
            None => return Ok(vec![]),
        };
        let stmt: Statement = self
            .client
            .prepare(&format!(
                "SELECT {} FROM books WHERE owner_id = $1 AND status = $2 \
                 ORDER BY created_at DESC, id",
                book_columns()
            ))
            .await?;

        let rows = self
            .client
            .query(&stmt, &[&principal.user_id, &status.as_str()])
            .await?;
        rows_to_books(&rows)
    }
}

#[derive(Deserialize)]
/// Payload sent by the `books_notify_change` trigger
struct ChangeNotification {
    event: ChangeKind,
    id: BookId,
    owner_id: UserId,
}

#[async_trait::async_trait]
impl BookChangeFeed for PostgresBooksRepository {
    async fn subscribe(&self) -> Result<BookChangeSubscription, BookRepositoryError> {
        let owner_id = self.require_principal()?.user_id;

        // notifications arrive on the connection itself, so the feed gets its own one
        let (client, mut connection) = tokio_postgres::connect(&self.connection_str, NoTls).await?;
        let mut messages = Box::pin(stream::poll_fn(move |cx| connection.poll_message(cx)));

        let listen_query = format!("LISTEN {CHANGES_CHANNEL}");
        {
            let listen = client.batch_execute(&listen_query);
            tokio::pin!(listen);
            loop {
                tokio::select! {
                    result = &mut listen => {
                        result?;
                        break;
                    }
                    message = messages.next() => match message {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                        None => {
                            return Err(BookRepositoryError::Other(
                                "Change feed connection closed".to_string(),
                            ))
                        }
                    }
                }
            }
        }

        let (sender, changes) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            // LISTEN lasts as long as this client
            let _client = client;
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        match serde_json::from_str::<ChangeNotification>(notification.payload()) {
                            Ok(change) if change.owner_id == owner_id => {
                                let book_change = BookChange {
                                    kind: change.event,
                                    book_id: change.id,
                                };
                                if sender.send(book_change).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(err) => tracing::warn!(
                                "Ignoring unreadable book change {}: {}",
                                notification.payload(),
                                err
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!("Book change feed failed {}", err);
                        break;
                    }
                }
            }
            tracing::info!("Book change feed for {} closed", owner_id);
        });

        tracing::info!("Subscribed to book changes for {}", owner_id);
        Ok(BookChangeSubscription::new(changes, listener))
    }
}
