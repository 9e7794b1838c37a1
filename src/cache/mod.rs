//! Article cache module - LRU cache for fast article access
//!
//! Keeps recently fetched articles in memory so the feed and detail views can
//! be served while offline:
//! - LRU eviction (least recently used)
//! - TTL (time-to-live) expiration
//! - Thread-safe async operations

use crate::articles::Article;
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Article cache configuration
pub struct ArticleCacheConfig {
    /// Maximum number of articles to cache
    pub max_capacity: u64,

    /// Time-to-live for cached articles (in seconds)
    pub ttl_secs: u64,

    /// Time-to-idle for cached articles (in seconds)
    pub tti_secs: u64,
}

impl Default for ArticleCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            ttl_secs: 3600,
            tti_secs: 900,
        }
    }
}

/// Articles keyed by remote id
#[derive(Clone)]
pub struct ArticleCache {
    cache: Arc<Cache<String, Article>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ArticleCache {
    pub fn new() -> Self {
        Self::with_config(ArticleCacheConfig::default())
    }

    pub fn with_config(config: ArticleCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .time_to_idle(Duration::from_secs(config.tti_secs))
            .build();

        Self {
            cache: Arc::new(cache),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Article> {
        match self.cache.get(id).await {
            Some(article) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(article)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn insert(&self, article: Article) {
        self.cache.insert(article.id.clone(), article).await;
    }

    pub async fn insert_many(&self, articles: &[Article]) {
        for article in articles {
            self.insert(article.clone()).await;
        }
    }

    pub async fn remove(&self, id: &str) {
        self.cache.invalidate(id).await;
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: self.cache.entry_count(),
        }
    }
}

impl Default for ArticleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    /// Hit rate (percentage)
    pub hit_rate: f64,
    pub entry_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::articles::ArticleStatus;

    fn article(id: &str) -> Article {
        Article {
            id: id.to_string(),
            title: format!("Article {}", id),
            body: "Body".to_string(),
            status: ArticleStatus::Published,
            author_id: Some("u1".to_string()),
            tags: vec!["rust".to_string()],
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_cache_insert_and_get() {
        let cache = ArticleCache::new();

        cache.insert(article("a1")).await;
        let retrieved = cache.get("a1").await;

        assert_eq!(retrieved.unwrap().title, "Article a1");
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let cache = ArticleCache::new();
        cache.insert(article("a1")).await;

        // Hit
        cache.get("a1").await;
        // Miss
        cache.get("a2").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_cache_remove() {
        let cache = ArticleCache::new();
        cache.insert_many(&[article("a1"), article("a2")]).await;

        cache.remove("a1").await;
        assert!(cache.get("a1").await.is_none());
        assert!(cache.get("a2").await.is_some());
        assert_eq!(cache.stats().await.entry_count, 1);
    }
}
