//! In-memory shared-cache backend.
//!
//! Implements the full backend operation set over a single mutex-guarded
//! map. Used by the test suite and by single-process deployments that
//! want cached-query semantics without an external cache.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::backend::KvBackend;
use super::lock::mutex_lock;
use super::CacheError;

const SOURCE: &str = "cache::memory";

#[derive(Clone)]
enum Slot {
    Value(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(Vec<String>),
    ZSet(BTreeMap<String, f64>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, op: &'static str, body: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut entries = mutex_lock!(&self.entries, SOURCE, op);
        entries.retain(|_, entry| entry.expires_at.is_none_or(|at| at > Instant::now()));
        body(&mut entries)
    }
}

fn wrong_kind(key: &str) -> CacheError {
    CacheError::backend("memory", format!("key `{key}` holds another kind of value"))
}

fn list_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if start > stop || len == 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with("get", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Value(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.with("set", |entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.with("mget", |entries| {
            keys.iter()
                .map(|key| match entries.get(key) {
                    Some(Entry {
                        slot: Slot::Value(value),
                        ..
                    }) => Ok(Some(value.clone())),
                    Some(_) => Err(wrong_kind(key)),
                    None => Ok(None),
                })
                .collect()
        })
    }

    async fn mset(&self, pairs: &[(String, String)]) -> Result<(), CacheError> {
        self.with("mset", |entries| {
            for (key, value) in pairs {
                entries.insert(
                    key.clone(),
                    Entry {
                        slot: Slot::Value(value.clone()),
                        expires_at: None,
                    },
                );
            }
            Ok(())
        })
    }

    async fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        self.with("del", |entries| {
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.with("hmget", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Hash(bucket),
                ..
            }) => Ok(fields.iter().map(|f| bucket.get(f).cloned()).collect()),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(vec![None; fields.len()]),
        })
    }

    async fn hset(&self, key: &str, pairs: &[(String, String)]) -> Result<u64, CacheError> {
        self.with("hset", |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Hash(HashMap::new()),
                expires_at: None,
            });
            let Slot::Hash(bucket) = &mut entry.slot else {
                return Err(wrong_kind(key));
            };
            let mut added = 0;
            for (field, value) in pairs {
                if bucket.insert(field.clone(), value.clone()).is_none() {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        self.with("hgetall", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Hash(bucket),
                ..
            }) => Ok(bucket.clone()),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(HashMap::new()),
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        self.with("lpush", |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::List(VecDeque::new()),
                expires_at: None,
            });
            let Slot::List(list) = &mut entry.slot else {
                return Err(wrong_kind(key));
            };
            for value in values {
                list.push_front(value.clone());
            }
            Ok(list.len() as u64)
        })
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<u64, CacheError> {
        self.with("rpush", |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::List(VecDeque::new()),
                expires_at: None,
            });
            let Slot::List(list) = &mut entry.slot else {
                return Err(wrong_kind(key));
            };
            for value in values {
                list.push_back(value.clone());
            }
            Ok(list.len() as u64)
        })
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with("rpop", |entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.pop_back()),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(None),
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, CacheError> {
        self.with("lrange", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(match list_bounds(list.len(), start, stop) {
                Some((start, stop)) => list.iter().skip(start).take(stop - start + 1).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), CacheError> {
        self.with("lset", |entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => {
                let len = list.len() as i64;
                let index = if index < 0 { len + index } else { index };
                match list.get_mut(index.max(0) as usize) {
                    Some(slot) if index >= 0 => {
                        *slot = value.to_string();
                        Ok(())
                    }
                    _ => Err(CacheError::backend("memory", "index out of range")),
                }
            }
            Some(_) => Err(wrong_kind(key)),
            None => Err(CacheError::backend("memory", "no such key")),
        })
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, CacheError> {
        self.with("lrem", |entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => {
                let before = list.len();
                let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
                let mut removed = 0;
                if count >= 0 {
                    list.retain(|item| {
                        if removed < limit && item == value {
                            removed += 1;
                            false
                        } else {
                            true
                        }
                    });
                } else {
                    let mut kept: VecDeque<String> = VecDeque::with_capacity(before);
                    for item in list.iter().rev() {
                        if removed < limit && item == value {
                            removed += 1;
                        } else {
                            kept.push_front(item.clone());
                        }
                    }
                    *list = kept;
                }
                Ok((before - list.len()) as u64)
            }
            Some(_) => Err(wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), CacheError> {
        self.with("ltrim", |entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => {
                *list = match list_bounds(list.len(), start, stop) {
                    Some((start, stop)) => {
                        list.iter().skip(start).take(stop - start + 1).cloned().collect()
                    }
                    None => VecDeque::new(),
                };
                Ok(())
            }
            Some(_) => Err(wrong_kind(key)),
            None => Ok(()),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        self.with("llen", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, CacheError> {
        self.with("sadd", |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Set(Vec::new()),
                expires_at: None,
            });
            let Slot::Set(set) = &mut entry.slot else {
                return Err(wrong_kind(key));
            };
            let mut added = 0;
            for member in members {
                if !set.contains(member) {
                    set.push(member.clone());
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn spop(&self, key: &str, count: u64) -> Result<Vec<String>, CacheError> {
        self.with("spop", |entries| match entries.get_mut(key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => {
                let take = (count as usize).min(set.len());
                Ok(set.drain(..take).collect())
            }
            Some(_) => Err(wrong_kind(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        self.with("scard", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::Set(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn zadd(&self, key: &str, new_entries: &[(f64, String)]) -> Result<u64, CacheError> {
        self.with("zadd", |entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::ZSet(BTreeMap::new()),
                expires_at: None,
            });
            let Slot::ZSet(zset) = &mut entry.slot else {
                return Err(wrong_kind(key));
            };
            let mut added = 0;
            for (score, member) in new_entries {
                if zset.insert(member.clone(), *score).is_none() {
                    added += 1;
                }
            }
            Ok(added)
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        self.with("zcard", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::ZSet(zset),
                ..
            }) => Ok(zset.len() as u64),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<u64, CacheError> {
        self.with("zcount", |entries| match entries.get(key) {
            Some(Entry {
                slot: Slot::ZSet(zset),
                ..
            }) => Ok(zset.values().filter(|score| **score >= min && **score <= max).count() as u64),
            Some(_) => Err(wrong_kind(key)),
            None => Ok(0),
        })
    }

    async fn flush_db(&self) -> Result<(), CacheError> {
        self.with("flush_db", |entries| {
            entries.clear();
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.with("set_nx", |entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(true)
        })
    }

    async fn pttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.with("pttl", |entries| {
            Ok(entries.get(key).and_then(|entry| {
                entry
                    .expires_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
            }))
        })
    }

    async fn del_if_equal(&self, key: &str, value: &str) -> Result<bool, CacheError> {
        self.with("del_if_equal", |entries| {
            let matches = matches!(
                entries.get(key),
                Some(Entry { slot: Slot::Value(held), .. }) if held == value
            );
            if matches {
                entries.remove(key);
            }
            Ok(matches)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_and_release() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_nx("lock:a", "t1", Duration::from_secs(10))
            .await
            .expect("first"));
        assert!(!backend
            .set_nx("lock:a", "t2", Duration::from_secs(10))
            .await
            .expect("second"));
        assert!(!backend.del_if_equal("lock:a", "t2").await.expect("wrong token"));
        assert!(backend.del_if_equal("lock:a", "t1").await.expect("right token"));
        assert!(backend
            .set_nx("lock:a", "t3", Duration::from_secs(10))
            .await
            .expect("after release"));
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v", Some(Duration::ZERO))
            .await
            .expect("set");
        assert!(backend.get("k").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn negative_lrange_bounds() {
        let backend = MemoryBackend::new();
        let values: Vec<String> = (1..=5).map(|n| n.to_string()).collect();
        backend.rpush("l", &values).await.expect("rpush");
        assert_eq!(
            backend.lrange("l", -2, -1).await.expect("lrange"),
            vec!["4", "5"]
        );
        backend.ltrim("l", 1, 3).await.expect("ltrim");
        assert_eq!(
            backend.lrange("l", 0, -1).await.expect("lrange"),
            vec!["2", "3", "4"]
        );
    }

    #[tokio::test]
    async fn lrem_from_tail() {
        let backend = MemoryBackend::new();
        let values: Vec<String> =
            ["a", "b", "a", "c", "a"].iter().map(|s| s.to_string()).collect();
        backend.rpush("l", &values).await.expect("rpush");
        assert_eq!(backend.lrem("l", -2, "a").await.expect("lrem"), 2);
        assert_eq!(
            backend.lrange("l", 0, -1).await.expect("lrange"),
            vec!["a", "b", "c"]
        );
    }
}
