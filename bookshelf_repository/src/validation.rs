use serde::Serialize;

use crate::api::{BookDraft, ReadingStatus, RATING_RANGE};

pub const TITLE_REQUIRED: &str = "Title is required";
pub const AUTHOR_REQUIRED: &str = "Author is required";
pub const RATING_OUT_OF_RANGE: &str = "Rating must be between 1 and 5";
pub const STATUS_UNKNOWN: &str = "Status must be one of want_to_read, currently_reading, read";

#[derive(Debug, Default, Clone, Serialize, Eq, PartialEq)]
/// Outcome of validating a draft, errors are in the order the checks ran
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks user supplied data before it reaches storage.
/// Every rule is checked, errors accumulate instead of stopping at the first one.
pub fn validate_book(draft: &BookDraft) -> ValidationReport {
    let mut errors = vec![];

    if is_blank(draft.title.as_deref()) {
        errors.push(TITLE_REQUIRED.to_string());
    }
    if is_blank(draft.author.as_deref()) {
        errors.push(AUTHOR_REQUIRED.to_string());
    }
    if draft.rating.is_some() {
        let in_range = draft
            .whole_rating()
            .map(|rating| RATING_RANGE.contains(&rating))
            .unwrap_or_default();
        if !in_range {
            errors.push(RATING_OUT_OF_RANGE.to_string());
        }
    }
    if let Some(status) = draft.status.as_deref() {
        if status.parse::<ReadingStatus>().is_err() {
            errors.push(STATUS_UNKNOWN.to_string());
        }
    }

    ValidationReport { errors }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|value| value.trim().is_empty()).unwrap_or(true)
}
