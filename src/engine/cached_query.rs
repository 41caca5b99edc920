//! Cached named queries.
//!
//! Each index keeps its matching primary keys in shared-cache page
//! buckets keyed `<Type>:<index>:<argHash>:<page>`; a page value carries
//! the capped total alongside its slice of ids. Misses recompute the full
//! id list with one `SELECT ID`; requests beyond the index cap fall
//! through to uncached execution.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Engine;
use crate::cache::keys::{arg_hash, query_page_key};
use crate::db::{Pager, Predicate, PredicateParam};
use crate::entity::{EntityDef, SqlValue};
use crate::error::StratumError;
use crate::schema::{CachedQueryDef, SchemaError, TableSchema, CACHED_QUERY_PAGE_SIZE};

const SOURCE: &str = "engine::cached_query";

#[derive(Debug, Serialize, Deserialize)]
struct PageData {
    total: u64,
    ids: Vec<u64>,
}

impl Engine {
    /// Run the named query, serving ids out of the shared cache when
    /// possible, and hydrate the result page. Returns the total number of
    /// matching rows (capped at the index maximum).
    pub async fn cached_search<E: EntityDef>(
        &mut self,
        out: &mut Vec<E>,
        index: &str,
        pager: &Pager,
        args: Vec<SqlValue>,
    ) -> Result<u64, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let query = cached_query(&schema, index)?.clone();

        let offset = pager.offset();
        let end = offset + u64::from(pager.page_size);
        if end > u64::from(query.max) {
            // Beyond the cap the index holds nothing; run it uncached.
            let predicate = query_predicate(&query, &args);
            let ids = self.query_ids(&schema, &predicate, Some(pager)).await?;
            let total = self.count_rows(&schema, &predicate).await?;
            self.load_by_ids(&ids, out, &[]).await?;
            return Ok(total);
        }

        let hash = arg_hash(&args);
        let (total, ids) = self
            .cached_ids(&schema, &query, hash, &args, offset, end)
            .await?;
        self.load_by_ids(&ids, out, &[]).await?;
        Ok(total)
    }

    /// Single-row variant of a cached query.
    pub async fn cached_search_one<E: EntityDef>(
        &mut self,
        entity: &mut E,
        index: &str,
        args: Vec<SqlValue>,
    ) -> Result<bool, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let query = cached_query(&schema, index)?.clone();
        let hash = arg_hash(&args);
        let (_, ids) = self.cached_ids(&schema, &query, hash, &args, 0, 1).await?;
        match ids.first() {
            Some(id) => self.load_by_id(*id, entity, &[]).await,
            None => Ok(false),
        }
    }

    /// Drop every cached page of the index for one argument tuple.
    pub async fn clear_cached_search<E: EntityDef>(
        &mut self,
        index: &str,
        args: Vec<SqlValue>,
    ) -> Result<(), StratumError> {
        self.clear_query_pages::<E>(index, args).await
    }

    /// Drop the cached result of a single-row index for one argument
    /// tuple. A `one`-flagged index only ever occupies the first bucket,
    /// so this shares the page deletion with [`Engine::clear_cached_search`].
    pub async fn clear_cached_search_one<E: EntityDef>(
        &mut self,
        index: &str,
        args: Vec<SqlValue>,
    ) -> Result<(), StratumError> {
        self.clear_query_pages::<E>(index, args).await
    }

    async fn clear_query_pages<E: EntityDef>(
        &mut self,
        index: &str,
        args: Vec<SqlValue>,
    ) -> Result<(), StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let query = cached_query(&schema, index)?.clone();
        let pool = shared_pool(&schema)?;
        let hash = arg_hash(&args);
        let keys: Vec<String> = (0..bucket_count(query.max))
            .map(|page| query_page_key(&schema.entity_name, &query.name, hash, page))
            .collect();
        self.registry().shared_cache(&pool)?.clone().del(&keys).await?;
        Ok(())
    }

    async fn cached_ids(
        &mut self,
        schema: &TableSchema,
        query: &CachedQueryDef,
        hash: u64,
        args: &[SqlValue],
        offset: u64,
        end: u64,
    ) -> Result<(u64, Vec<u64>), StratumError> {
        let pool = shared_pool(schema)?;
        let cache = self.registry().shared_cache(&pool)?.clone();
        let first_bucket = (offset / u64::from(CACHED_QUERY_PAGE_SIZE)) as u32;
        let last_bucket = (end.saturating_sub(1) / u64::from(CACHED_QUERY_PAGE_SIZE)) as u32;
        let keys: Vec<String> = (first_bucket..=last_bucket)
            .map(|page| query_page_key(&schema.entity_name, &query.name, hash, page))
            .collect();
        let hits = cache.mget(&keys).await?;

        let pages: Option<Vec<PageData>> = hits
            .into_iter()
            .map(|hit| hit.and_then(|packed| serde_json::from_str(&packed).ok()))
            .collect();
        let (total, window) = match pages {
            Some(pages) => {
                let total = pages.first().map(|page| page.total).unwrap_or(0);
                let mut window = Vec::new();
                for (bucket, page) in (first_bucket..=last_bucket).zip(pages) {
                    let bucket_start = u64::from(bucket) * u64::from(CACHED_QUERY_PAGE_SIZE);
                    for (position, id) in page.ids.iter().enumerate() {
                        let absolute = bucket_start + position as u64;
                        if absolute >= offset && absolute < end {
                            window.push(*id);
                        }
                    }
                }
                (total, window)
            }
            None => {
                let (total, all_ids) = self.recompute_index(schema, query, hash, args).await?;
                let window = all_ids
                    .iter()
                    .copied()
                    .skip(offset as usize)
                    .take((end - offset) as usize)
                    .collect();
                (total, window)
            }
        };
        debug!(
            target: SOURCE,
            entity = %schema.entity_name,
            index = %query.name,
            total,
            rows = window.len(),
            "cached search"
        );
        Ok((total, window))
    }

    /// Run the index `SELECT ID`, store every bucket and return the
    /// full id list.
    async fn recompute_index(
        &mut self,
        schema: &TableSchema,
        query: &CachedQueryDef,
        hash: u64,
        args: &[SqlValue],
    ) -> Result<(u64, Vec<u64>), StratumError> {
        let pool = shared_pool(schema)?;
        let schema_arc = self.registry().schema(&schema.entity_name)?.clone();
        let predicate = query_predicate(query, args);
        let limit = if query.one { 1 } else { query.max };
        let ids = self
            .query_ids(&schema_arc, &predicate, Some(&Pager::new(1, limit)))
            .await?;
        let total = ids.len() as u64;
        let mut pairs = Vec::new();
        let buckets = bucket_count(query.max);
        for page in 0..buckets {
            let start = page as usize * CACHED_QUERY_PAGE_SIZE as usize;
            if start >= ids.len() && page > 0 {
                break;
            }
            let slice: Vec<u64> = ids
                .iter()
                .copied()
                .skip(start)
                .take(CACHED_QUERY_PAGE_SIZE as usize)
                .collect();
            let packed = serde_json::to_string(&PageData { total, ids: slice })
                .map_err(crate::cache::CacheError::from)?;
            pairs.push((
                query_page_key(&schema.entity_name, &query.name, hash, page),
                packed,
            ));
        }
        self.registry()
            .shared_cache(&pool)?
            .clone()
            .mset(&pairs)
            .await?;
        Ok((total, ids))
    }
}

fn cached_query<'a>(
    schema: &'a TableSchema,
    index: &str,
) -> Result<&'a CachedQueryDef, SchemaError> {
    schema.cached_queries.get(index).ok_or_else(|| {
        SchemaError::invalid_tag(
            schema.entity_name.clone(),
            index,
            "no cached query with this name",
        )
    })
}

fn shared_pool(schema: &TableSchema) -> Result<String, SchemaError> {
    schema.shared_cache.clone().ok_or_else(|| {
        SchemaError::invalid_tag(
            schema.entity_name.clone(),
            "redisCache",
            "cached queries need a shared cache binding",
        )
    })
}

fn query_predicate(query: &CachedQueryDef, args: &[SqlValue]) -> Predicate {
    let template = match &query.order_by {
        Some(order) => format!("{} ORDER BY {}", query.query, order),
        None => query.query.clone(),
    };
    Predicate::new(
        &template,
        args.iter()
            .map(|value| PredicateParam::Value(value.clone())),
    )
}

fn bucket_count(max: u32) -> u32 {
    max.div_ceil(CACHED_QUERY_PAGE_SIZE).max(1)
}

/// Keys to drop when a mutation touches fields an index tracks: every
/// page of the argument tuples formed by the row's old and new values.
pub(crate) fn query_invalidation_keys(
    schema: &TableSchema,
    changed: &[String],
    old_row: Option<&[SqlValue]>,
    new_row: Option<&[SqlValue]>,
) -> Vec<String> {
    let mut keys = Vec::new();
    for query in schema.queries_tracking(changed) {
        for row in [old_row, new_row].into_iter().flatten() {
            let values: Option<Vec<SqlValue>> = query
                .predicate_fields
                .iter()
                .map(|field| schema.column_index(field).and_then(|i| row.get(i)).cloned())
                .collect();
            let Some(values) = values else {
                continue;
            };
            let hash = arg_hash(&values);
            for page in 0..bucket_count(query.max) {
                keys.push(query_page_key(&schema.entity_name, &query.name, hash, page));
            }
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::schema::ColumnDef;

    fn schema_with_index() -> TableSchema {
        TableSchema {
            entity_name: "User".to_string(),
            table_name: "User".to_string(),
            pool_name: "default".to_string(),
            columns: vec![
                ColumnDef {
                    name: "ID".to_string(),
                    definition: "`ID` bigint(20) unsigned NOT NULL".to_string(),
                    nullable: false,
                },
                ColumnDef {
                    name: "Name".to_string(),
                    definition: "`Name` varchar(40) DEFAULT NULL".to_string(),
                    nullable: true,
                },
                ColumnDef {
                    name: "Age".to_string(),
                    definition: "`Age` int(11) NOT NULL DEFAULT '0'".to_string(),
                    nullable: false,
                },
            ],
            indexes: BTreeMap::new(),
            ref_columns: Vec::new(),
            cached_queries: BTreeMap::from([(
                "IndexAge".to_string(),
                CachedQueryDef {
                    name: "IndexAge".to_string(),
                    query: "`Age` = ?".to_string(),
                    order_by: None,
                    predicate_fields: vec!["Age".to_string()],
                    tracked_fields: vec!["Age".to_string()],
                    one: false,
                    max: 2_000,
                },
            )]),
            has_fake_delete: false,
            local_cache: None,
            shared_cache: Some("default".to_string()),
            log_pool: None,
            dirty_queues: Vec::new(),
        }
    }

    #[test]
    fn invalidation_covers_old_and_new_tuples() {
        let schema = schema_with_index();
        let old_row = vec![SqlValue::Str("Ada".into()), SqlValue::Int(37)];
        let new_row = vec![SqlValue::Str("Ada".into()), SqlValue::Int(38)];
        let keys = query_invalidation_keys(
            &schema,
            &["Age".to_string()],
            Some(&old_row),
            Some(&new_row),
        );
        // Two tuples, two buckets each.
        assert_eq!(keys.len(), 4);
        let old_hash = arg_hash(&[SqlValue::Int(37)]);
        let new_hash = arg_hash(&[SqlValue::Int(38)]);
        assert!(keys.contains(&query_page_key("User", "IndexAge", old_hash, 0)));
        assert!(keys.contains(&query_page_key("User", "IndexAge", new_hash, 1)));
    }

    #[test]
    fn untracked_fields_do_not_invalidate() {
        let schema = schema_with_index();
        let row = vec![SqlValue::Str("Ada".into()), SqlValue::Int(37)];
        let keys = query_invalidation_keys(&schema, &["Name".to_string()], Some(&row), Some(&row));
        assert!(keys.is_empty());
    }

    #[test]
    fn caller_and_row_hashes_line_up() {
        // The hash of a caller-supplied argument tuple must match the
        // hash derived from the row image, or invalidation misses pages.
        let caller = arg_hash(&[SqlValue::UInt(37)]);
        let from_row = arg_hash(&[SqlValue::Int(37)]);
        assert_eq!(caller, from_row);
    }
}
