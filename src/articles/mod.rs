//! Articles - the dashboard's content model
//!
//! - Article: one document of the `articles` collection
//! - ArticleFeed: paged fetch, infinite scroll and client-side filtering

pub mod feed;

pub use feed::{ArticleFeed, FeedSnapshot, LoadOutcome};

use crate::sync::{Fields, RemoteError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: ArticleStatus,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Article {
    /// Parse a raw document from the remote store
    pub fn from_value(value: Value) -> Result<Self, FeedError> {
        serde_json::from_value(value).map_err(|e| FeedError::InvalidArticle(e.to_string()))
    }

    /// Build an article from the fields of a create
    pub fn from_fields(id: &str, data: &Fields) -> Result<Self, FeedError> {
        let mut object = data.clone();
        object.insert("id".to_string(), Value::String(id.to_string()));
        Self::from_value(Value::Object(object))
    }

    /// Merge a partial update; the id never changes
    pub fn apply_changes(&self, changes: &Fields) -> Result<Self, FeedError> {
        let mut object = match serde_json::to_value(self) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return Err(FeedError::InvalidArticle(self.id.clone())),
            Err(e) => return Err(FeedError::InvalidArticle(e.to_string())),
        };

        for (key, value) in changes {
            if key != "id" {
                object.insert(key.clone(), value.clone());
            }
        }

        Self::from_value(Value::Object(object))
    }

    /// Case-insensitive match against title, body and tags
    pub fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }

        self.title.to_lowercase().contains(&needle)
            || self.body.to_lowercase().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid article: {0}")]
    InvalidArticle(String),
}
