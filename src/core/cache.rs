//! 远程文件列表缓存
//!
//! 缓存对象存储的列表结果，避免同一轮同步中重复分页请求

use crate::storage::RemoteObject;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// 缓存条目
#[derive(Debug, Clone)]
struct CacheEntry {
    objects: Vec<RemoteObject>,
    /// 是否为完整列表（所有分页）
    complete: bool,
    cached_at: Instant,
}

/// 文件列表缓存
pub struct ListingCache {
    /// 有效期，0 表示不缓存
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 计算缓存键（地址 + bucket + 前缀）
    pub fn key(endpoint: &str, bucket: &str, prefix: &str) -> String {
        let hash = blake3::hash(format!("{}\n{}\n{}", endpoint, bucket, prefix).as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// 读取缓存；需要完整列表时，部分列表的缓存不会命中
    pub fn get(&self, key: &str, need_complete: bool) -> Option<Vec<RemoteObject>> {
        if self.ttl.is_zero() {
            return None;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;

        if entry.cached_at.elapsed() > self.ttl {
            debug!("列表缓存已过期 ({:?})", entry.cached_at.elapsed());
            entries.remove(key);
            return None;
        }
        if need_complete && !entry.complete {
            return None;
        }

        debug!(
            "从缓存加载 {} 个远程对象 (缓存于 {})",
            entry.objects.len(),
            format_age(entry.cached_at.elapsed())
        );
        Some(entry.objects.clone())
    }

    pub fn put(&self, key: &str, objects: Vec<RemoteObject>, complete: bool) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                CacheEntry {
                    objects,
                    complete,
                    cached_at: Instant::now(),
                },
            );
    }

    /// 上传或删除后使缓存失效
    pub fn invalidate(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// 格式化缓存时间
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{}秒前", secs)
    } else if secs < 3600 {
        format!("{}分钟前", secs / 60)
    } else {
        format!("{}小时前", secs / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects() -> Vec<RemoteObject> {
        vec![RemoteObject {
            name: "abc".into(),
            last_modified: 1,
            size: 2,
        }]
    }

    #[test]
    fn test_key() {
        let k1 = ListingCache::key("https://s3", "b", "p/");
        assert_eq!(k1, ListingCache::key("https://s3", "b", "p/"));
        assert_ne!(k1, ListingCache::key("https://s3", "b", "q/"));
        assert_ne!(k1, ListingCache::key("https://s3", "c", "p/"));
    }

    #[test]
    fn test_partial_listing_does_not_satisfy_full_request() {
        let cache = ListingCache::new(Duration::from_secs(60));
        cache.put("k", objects(), false);
        assert!(cache.get("k", true).is_none());
        assert_eq!(cache.get("k", false), Some(objects()));

        cache.put("k", objects(), true);
        assert_eq!(cache.get("k", true), Some(objects()));

        cache.invalidate("k");
        assert!(cache.get("k", false).is_none());
    }

    #[test]
    fn test_expiry_and_disabled() {
        let cache = ListingCache::new(Duration::from_millis(5));
        cache.put("k", objects(), true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k", true).is_none());

        let disabled = ListingCache::new(Duration::ZERO);
        disabled.put("k", objects(), true);
        assert!(disabled.get("k", true).is_none());
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_secs(5)), "5秒前");
        assert_eq!(format_age(Duration::from_secs(120)), "2分钟前");
        assert_eq!(format_age(Duration::from_secs(7200)), "2小时前");
    }
}
