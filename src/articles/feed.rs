//! Article feed state machine
//!
//! Pages are fetched from the remote store with an opaque cursor and appended
//! (infinite scroll). Search and status filtering happen client-side over the
//! loaded articles. Queued writes can be folded in with
//! [`ArticleFeed::apply_local`] so offline edits show up immediately.

use super::{Article, ArticleStatus, FeedError};
use crate::cache::ArticleCache;
use crate::sync::{Mutation, PageRequest, RemoteStore, ARTICLES_COLLECTION};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { count: usize },
    /// Another load is in flight
    Busy,
    /// No more pages
    Exhausted,
    /// A reset happened while this page was loading; the page was discarded
    Stale,
}

/// Read-only view of the feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub loaded: usize,
    pub visible: usize,
    pub loading: bool,
    pub exhausted: bool,
    pub search: String,
    pub status_filter: Option<ArticleStatus>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct FeedState {
    articles: Vec<Article>,
    cursor: Option<String>,
    exhausted: bool,
    loading: bool,
    /// Bumped on reset so an in-flight page is not appended to a newer feed
    generation: u64,
    search: String,
    status_filter: Option<ArticleStatus>,
    last_error: Option<String>,
}

impl FeedState {
    fn is_visible(&self, article: &Article) -> bool {
        self.status_filter.map_or(true, |s| article.status == s)
            && article.matches_search(&self.search)
    }
}

pub struct ArticleFeed {
    remote: Arc<dyn RemoteStore>,
    cache: ArticleCache,
    page_size: usize,
    state: Mutex<FeedState>,
}

impl ArticleFeed {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: ArticleCache) -> Self {
        Self::with_page_size(remote, cache, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(remote: Arc<dyn RemoteStore>, cache: ArticleCache, page_size: usize) -> Self {
        Self {
            remote,
            cache,
            page_size: page_size.max(1),
            state: Mutex::new(FeedState::default()),
        }
    }

    /// Drop everything loaded and fetch the first page
    pub async fn load_first_page(&self) -> Result<LoadOutcome, FeedError> {
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.articles.clear();
            state.cursor = None;
            state.exhausted = false;
            state.loading = true;
            state.last_error = None;
            state.generation
        };

        self.fetch(generation, None).await
    }

    /// Fetch the next page; a no-op while loading or once exhausted
    pub async fn load_more(&self) -> Result<LoadOutcome, FeedError> {
        let (generation, cursor) = {
            let mut state = self.state.lock().await;
            if state.loading {
                return Ok(LoadOutcome::Busy);
            }
            if state.exhausted {
                return Ok(LoadOutcome::Exhausted);
            }
            state.loading = true;
            (state.generation, state.cursor.clone())
        };

        self.fetch(generation, cursor).await
    }

    async fn fetch(&self, generation: u64, cursor: Option<String>) -> Result<LoadOutcome, FeedError> {
        let request = PageRequest {
            limit: self.page_size,
            cursor,
        };
        let result = self.remote.list_entities(ARTICLES_COLLECTION, &request).await;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            log::debug!("Discarding stale article page");
            return Ok(LoadOutcome::Stale);
        }
        state.loading = false;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                log::warn!("Failed to load articles: {}", e);
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let mut loaded = Vec::with_capacity(page.items.len());
        for item in page.items {
            match Article::from_value(item) {
                Ok(article) => loaded.push(article),
                Err(e) => log::warn!("Skipping malformed article: {}", e),
            }
        }

        state.exhausted = page.next_cursor.is_none();
        state.cursor = page.next_cursor;
        state.articles.extend(loaded.iter().cloned());
        let total = state.articles.len();
        drop(state);

        self.cache.insert_many(&loaded).await;
        log::debug!("Loaded {} articles ({} total)", loaded.len(), total);

        Ok(LoadOutcome::Loaded {
            count: loaded.len(),
        })
    }

    pub async fn set_search(&self, search: impl Into<String>) {
        self.state.lock().await.search = search.into();
    }

    pub async fn set_status_filter(&self, status: Option<ArticleStatus>) {
        self.state.lock().await.status_filter = status;
    }

    /// Loaded articles passing the current search and filter
    pub async fn visible(&self) -> Vec<Article> {
        let state = self.state.lock().await;
        state
            .articles
            .iter()
            .filter(|a| state.is_visible(a))
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let state = self.state.lock().await;
        FeedSnapshot {
            loaded: state.articles.len(),
            visible: state.articles.iter().filter(|a| state.is_visible(a)).count(),
            loading: state.loading,
            exhausted: state.exhausted,
            search: state.search.clone(),
            status_filter: state.status_filter,
            last_error: state.last_error.clone(),
        }
    }

    /// Article by id, from the loaded feed or the cache
    pub async fn article(&self, id: &str) -> Option<Article> {
        let loaded = {
            let state = self.state.lock().await;
            state.articles.iter().find(|a| a.id == id).cloned()
        };
        match loaded {
            Some(article) => Some(article),
            None => self.cache.get(id).await,
        }
    }

    /// Reflect a write in the loaded feed before it reaches the remote store
    ///
    /// Creates are prepended under their client-chosen id. Updates to an
    /// article that is no longer loaded are applied to its cached copy.
    /// Returns whether the feed changed.
    pub async fn apply_local(&self, mutation: &Mutation) -> Result<bool, FeedError> {
        let mut state = self.state.lock().await;

        match mutation {
            Mutation::CreateArticle { id, data } => {
                let article = Article::from_fields(id, data)?;
                state.articles.insert(0, article.clone());
                drop(state);
                self.cache.insert(article).await;
                Ok(true)
            }
            Mutation::UpdateArticle { id, changes } => {
                let Some(index) = state.articles.iter().position(|a| &a.id == id) else {
                    drop(state);
                    if let Some(cached) = self.cache.get(id).await {
                        self.cache.insert(cached.apply_changes(changes)?).await;
                    }
                    return Ok(false);
                };
                let updated = state.articles[index].apply_changes(changes)?;
                state.articles[index] = updated.clone();
                drop(state);
                self.cache.insert(updated).await;
                Ok(true)
            }
            Mutation::DeleteArticle { id } => {
                let before = state.articles.len();
                state.articles.retain(|a| &a.id != id);
                let changed = state.articles.len() != before;
                drop(state);
                self.cache.remove(id).await;
                Ok(changed)
            }
            Mutation::UpdateProfile { .. } => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::{fields, MockRemote};
    use crate::sync::RemoteError;
    use serde_json::{json, Value};

    fn documents(count: usize) -> Vec<Value> {
        (1..=count)
            .map(|i| {
                json!({
                    "id": format!("a{}", i),
                    "title": format!("Article {}", i),
                    "status": if i % 2 == 0 { "published" } else { "draft" },
                })
            })
            .collect()
    }

    fn feed(remote: Arc<MockRemote>, page_size: usize) -> ArticleFeed {
        ArticleFeed::with_page_size(remote, ArticleCache::new(), page_size)
    }

    #[tokio::test]
    async fn test_paging_until_exhausted() {
        let remote = Arc::new(MockRemote::with_entities(documents(5)));
        let feed = feed(remote.clone(), 2);

        assert_eq!(feed.load_first_page().await.unwrap(), LoadOutcome::Loaded { count: 2 });
        assert_eq!(feed.load_more().await.unwrap(), LoadOutcome::Loaded { count: 2 });
        assert_eq!(feed.load_more().await.unwrap(), LoadOutcome::Loaded { count: 1 });
        assert_eq!(feed.load_more().await.unwrap(), LoadOutcome::Exhausted);

        let snapshot = feed.snapshot().await;
        assert_eq!(snapshot.loaded, 5);
        assert!(snapshot.exhausted);
        assert_eq!(remote.call_count(), 3);
    }

    #[tokio::test]
    async fn test_load_more_is_noop_while_loading() {
        let remote = Arc::new(MockRemote::with_entities(documents(4)));
        let gate = remote.hold();
        let feed = Arc::new(feed(remote.clone(), 2));

        let first = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.load_first_page().await })
        };
        while remote.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(feed.load_more().await.unwrap(), LoadOutcome::Busy);

        gate.add_permits(1);
        assert_eq!(
            first.await.unwrap().unwrap(),
            LoadOutcome::Loaded { count: 2 }
        );
        assert_eq!(remote.call_count(), 1);
    }

    #[tokio::test]
    async fn test_search_and_filter_are_client_side() {
        let remote = Arc::new(MockRemote::with_entities(documents(4)));
        let feed = feed(remote.clone(), 10);
        feed.load_first_page().await.unwrap();

        feed.set_status_filter(Some(ArticleStatus::Published)).await;
        let ids: Vec<String> = feed.visible().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a2".to_string(), "a4".to_string()]);

        feed.set_search("article 4").await;
        assert_eq!(feed.visible().await.len(), 1);

        feed.set_status_filter(None).await;
        feed.set_search("").await;
        assert_eq!(feed.visible().await.len(), 4);
        assert_eq!(remote.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_records_error() {
        let remote = Arc::new(MockRemote::with_entities(documents(2)));
        remote.fail_next(RemoteError::Network("offline".to_string()));
        let feed = feed(remote, 10);

        assert!(feed.load_first_page().await.is_err());

        let snapshot = feed.snapshot().await;
        assert!(!snapshot.loading);
        assert!(snapshot.last_error.is_some());

        // Can try again
        assert_eq!(feed.load_more().await.unwrap(), LoadOutcome::Loaded { count: 2 });
    }

    #[tokio::test]
    async fn test_apply_local_writes() {
        let remote = Arc::new(MockRemote::with_entities(documents(2)));
        let feed = feed(remote, 10);
        feed.load_first_page().await.unwrap();

        let created = feed
            .apply_local(&Mutation::CreateArticle {
                id: "local-1".to_string(),
                data: fields(json!({"title": "Offline draft"})),
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(feed.visible().await[0].id, "local-1");

        feed.apply_local(&Mutation::UpdateArticle {
            id: "a1".to_string(),
            changes: fields(json!({"title": "Renamed"})),
        })
        .await
        .unwrap();
        assert_eq!(feed.article("a1").await.unwrap().title, "Renamed");

        let deleted = feed
            .apply_local(&Mutation::DeleteArticle { id: "a2".to_string() })
            .await
            .unwrap();
        assert!(deleted);
        assert!(feed.article("a2").await.is_none());
        assert_eq!(feed.snapshot().await.loaded, 2);
    }

    #[tokio::test]
    async fn test_article_lookup_falls_back_to_cache() {
        let remote = Arc::new(MockRemote::with_entities(documents(2)));
        let feed = feed(remote.clone(), 10);
        feed.load_first_page().await.unwrap();

        // A failed reload leaves the feed empty; lookups are served from cache
        remote.fail_next(RemoteError::Network("offline".to_string()));
        assert!(feed.load_first_page().await.is_err());
        assert_eq!(feed.snapshot().await.loaded, 0);

        assert_eq!(feed.article("a2").await.unwrap().title, "Article 2");

        // Edits made while the article is not loaded land on the cached copy
        let changed = feed
            .apply_local(&Mutation::UpdateArticle {
                id: "a2".to_string(),
                changes: fields(json!({"title": "Edited offline"})),
            })
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(feed.article("a2").await.unwrap().title, "Edited offline");
        assert!(feed.article("a9").await.is_none());
    }
}
