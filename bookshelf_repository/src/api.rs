use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;
use uuid::Uuid;

pub type BookId = Uuid;
pub type UserId = Uuid;

/// Ratings are whole stars
pub const RATING_RANGE: RangeInclusive<u8> = 1..=5;

/// Current instant truncated to milliseconds, the precision every stored instant uses
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[derive(
    Debug, Default, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
/// Shelf a book sits on
pub enum ReadingStatus {
    #[default]
    WantToRead,
    CurrentlyReading,
    Read,
}

impl ReadingStatus {
    pub const ALL: [ReadingStatus; 3] = [
        ReadingStatus::WantToRead,
        ReadingStatus::CurrentlyReading,
        ReadingStatus::Read,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::WantToRead => "want_to_read",
            ReadingStatus::CurrentlyReading => "currently_reading",
            ReadingStatus::Read => "read",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
#[error("Unknown reading status {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ReadingStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ReadingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Book record as the application and the local store see it.
/// Instants are serialized as epoch milliseconds.
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    /// Empty when the book has no cover and a placeholder should be drawn
    #[serde(default)]
    pub cover_url: String,
    pub status: ReadingStatus,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub review: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Book {
    pub fn has_cover(&self) -> bool {
        !self.cover_url.trim().is_empty()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// User supplied book data, e.g. the values of the add/edit form.
/// Nothing here is trusted until it went through `validate_book`.
pub struct BookDraft {
    pub id: Option<BookId>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub status: Option<String>,
    /// Any JSON number, fractions and negatives are left for validation to report
    pub rating: Option<Number>,
    pub review: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BookDraft {
    pub fn new(title: &str, author: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            author: Some(author.to_string()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ReadingStatus) -> Self {
        self.status = Some(status.as_str().to_string());
        self
    }

    pub fn with_rating(mut self, rating: i64) -> Self {
        self.rating = Some(Number::from(rating));
        self
    }

    /// Rating as a whole number of stars, None unless it is an integer in `0..=255`
    pub fn whole_rating(&self) -> Option<u8> {
        self.rating
            .as_ref()
            .and_then(Number::as_u64)
            .and_then(|rating| u8::try_from(rating).ok())
    }
}

/// Builds a complete book out of a draft, filling defaults for everything omitted.
/// Status and rating values that do not fit the model fall back to their defaults.
pub fn create_book(draft: BookDraft) -> Book {
    let now = now();
    let rating = draft
        .whole_rating()
        .filter(|rating| RATING_RANGE.contains(rating));
    Book {
        id: draft.id.unwrap_or_else(Uuid::new_v4),
        title: draft.title.unwrap_or_default(),
        author: draft.author.unwrap_or_default(),
        cover_url: draft.cover_url.unwrap_or_default(),
        status: draft
            .status
            .as_deref()
            .and_then(|status| status.parse().ok())
            .unwrap_or_default(),
        rating,
        review: draft.review.unwrap_or_default(),
        created_at: draft.created_at.map(|t| t.trunc_subsecs(3)).unwrap_or(now),
        updated_at: draft.updated_at.map(|t| t.trunc_subsecs(3)).unwrap_or(now),
        finished_at: draft.finished_at.map(|t| t.trunc_subsecs(3)),
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Partial update of a book. Absent fields are left untouched.
/// `rating` and `finished_at` distinguish "absent" (`None`) from "clear" (`Some(None)`).
/// Id and creation time are not part of a patch and can never change.
pub struct BookPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReadingStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub rating: Option<Option<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "present_millis")]
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl BookPatch {
    pub fn status(status: ReadingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn rating(rating: Option<u8>) -> Self {
        Self {
            rating: Some(rating),
            ..Self::default()
        }
    }

    /// Patch carrying every editable value of a submitted edit form.
    /// A form without rating clears the rating.
    pub fn from_draft(draft: &BookDraft) -> Self {
        Self {
            title: draft.title.clone(),
            author: draft.author.clone(),
            cover_url: draft.cover_url.clone(),
            status: draft
                .status
                .as_deref()
                .and_then(|status| status.parse().ok()),
            rating: Some(draft.whole_rating()),
            review: draft.review.clone(),
            finished_at: draft.finished_at.map(Some),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

// `null` has to land in `Some(None)`, a missing key stays `None` through `default`
fn deserialize_present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

mod present_millis {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Option<DateTime<Utc>>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value.as_ref().and_then(Option::as_ref) {
            Some(instant) => serializer.serialize_some(&instant.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<DateTime<Utc>>>, D::Error> {
        match Option::<i64>::deserialize(deserializer)? {
            None => Ok(Some(None)),
            Some(millis) => DateTime::from_timestamp_millis(millis)
                .map(|instant| Some(Some(instant)))
                .ok_or_else(|| D::Error::custom(format!("timestamp {millis} out of range"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Notification that a book of the signed in user changed on the backend
pub struct BookChange {
    pub kind: ChangeKind,
    pub book_id: BookId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
/// Authenticated user on whose behalf remote operations run.
/// Authentication itself happens at the backend provider.
pub struct Principal {
    pub user_id: UserId,
}
