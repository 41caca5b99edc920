//! Read path: by-id loads and predicate searches through the cache
//! hierarchy.
//!
//! Lookups consult local LRU, then the shared cache, then the row store,
//! repopulating the layers above on the way back. A missing row is
//! negative-cached under the miss marker so repeated lookups stop at the
//! first layer; `no rows` is always a boolean outcome, never an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use super::Engine;
use crate::cache::keys::{pack_row, unpack_row, MISS_MARKER};
use crate::db::{Pager, Predicate};
use crate::entity::{Entity, EntityDef, SqlValue};
use crate::error::StratumError;
use crate::schema::TableSchema;

const SOURCE: &str = "engine::loader";

impl Engine {
    /// Load one entity by primary key. Returns `false` (and leaves the
    /// entity unloaded) when no row exists.
    pub async fn load_by_id<E: EntityDef>(
        &mut self,
        id: u64,
        entity: &mut E,
        refs: &[&str],
    ) -> Result<bool, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        if entity.meta().is_loaded() {
            // Already materialized; optionally warm its references.
            if !refs.is_empty() {
                let mut targets: Vec<&mut dyn Entity> = vec![entity];
                self.preload(&mut targets, &schema, refs).await?;
            }
            return Ok(true);
        }
        match self.load_row(&schema, id).await? {
            Some(row) => {
                entity.set_id(id);
                entity.apply_row(&row)?;
                entity.meta_mut().snapshot(row);
                if !refs.is_empty() {
                    let mut targets: Vec<&mut dyn Entity> = vec![entity];
                    self.preload(&mut targets, &schema, refs).await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Batched by-id load preserving input order; returns the ids that
    /// have no row.
    pub async fn load_by_ids<E: EntityDef>(
        &mut self,
        ids: &[u64],
        out: &mut Vec<E>,
        refs: &[&str],
    ) -> Result<Vec<u64>, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let rows = self.load_rows(&schema, ids).await?;
        out.clear();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            match rows.get(id) {
                Some(row) => {
                    let mut entity = E::default();
                    entity.set_id(*id);
                    entity.apply_row(row)?;
                    entity.meta_mut().snapshot(row.clone());
                    out.push(entity);
                }
                None => missing.push(*id),
            }
        }
        if !refs.is_empty() {
            let mut targets: Vec<&mut dyn Entity> =
                out.iter_mut().map(|entity| entity as &mut dyn Entity).collect();
            self.preload(&mut targets, &schema, refs).await?;
        }
        Ok(missing)
    }

    /// Execute a predicate search; soft-delete schemas implicitly filter
    /// `FakeDelete = 0`.
    pub async fn search<E: EntityDef>(
        &mut self,
        predicate: &Predicate,
        pager: Option<&Pager>,
        out: &mut Vec<E>,
        refs: &[&str],
    ) -> Result<(), StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let sql = select_sql(&schema, predicate.query(), pager);
        let rows = self
            .db(&schema.pool_name)?
            .query(&sql, predicate.params())
            .await?;
        out.clear();
        for row in rows {
            let id = row
                .first()
                .and_then(SqlValue::as_u64)
                .unwrap_or_default();
            let mut entity = E::default();
            entity.set_id(id);
            entity.apply_row(&row[1..])?;
            entity.meta_mut().snapshot(row[1..].to_vec());
            out.push(entity);
        }
        debug!(target: SOURCE, entity = %schema.entity_name, rows = out.len(), "search");
        if !refs.is_empty() {
            let mut targets: Vec<&mut dyn Entity> =
                out.iter_mut().map(|entity| entity as &mut dyn Entity).collect();
            self.preload(&mut targets, &schema, refs).await?;
        }
        Ok(())
    }

    /// `search` plus a `COUNT(*)` over the same predicate.
    pub async fn search_with_count<E: EntityDef>(
        &mut self,
        predicate: &Predicate,
        pager: Option<&Pager>,
        out: &mut Vec<E>,
        refs: &[&str],
    ) -> Result<u64, StratumError> {
        self.search(predicate, pager, out, refs).await?;
        let schema = self.registry().schema_of::<E>()?.clone();
        self.count_rows(&schema, predicate).await
    }

    /// First matching row; `false` when nothing matches.
    pub async fn search_one<E: EntityDef>(
        &mut self,
        predicate: &Predicate,
        entity: &mut E,
    ) -> Result<bool, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let sql = select_sql(&schema, predicate.query(), Some(&Pager::new(1, 1)));
        let row = self
            .db(&schema.pool_name)?
            .query_row(&sql, predicate.params())
            .await?;
        match row {
            Some(row) => {
                let id = row.first().and_then(SqlValue::as_u64).unwrap_or_default();
                entity.set_id(id);
                entity.apply_row(&row[1..])?;
                entity.meta_mut().snapshot(row[1..].to_vec());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Matching primary keys only.
    pub async fn search_ids<E: EntityDef>(
        &mut self,
        predicate: &Predicate,
        pager: Option<&Pager>,
    ) -> Result<Vec<u64>, StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        self.query_ids(&schema, predicate, pager).await
    }

    pub async fn search_ids_with_count<E: EntityDef>(
        &mut self,
        predicate: &Predicate,
        pager: Option<&Pager>,
    ) -> Result<(Vec<u64>, u64), StratumError> {
        let schema = self.registry().schema_of::<E>()?.clone();
        let ids = self.query_ids(&schema, predicate, pager).await?;
        let total = self.count_rows(&schema, predicate).await?;
        Ok((ids, total))
    }

    pub(crate) async fn query_ids(
        &mut self,
        schema: &Arc<TableSchema>,
        predicate: &Predicate,
        pager: Option<&Pager>,
    ) -> Result<Vec<u64>, StratumError> {
        let sql = id_select_sql(schema, predicate.query(), pager);
        let rows = self
            .db(&schema.pool_name)?
            .query(&sql, predicate.params())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.first().and_then(SqlValue::as_u64))
            .collect())
    }

    pub(crate) async fn count_rows(
        &mut self,
        schema: &Arc<TableSchema>,
        predicate: &Predicate,
    ) -> Result<u64, StratumError> {
        let (condition, _) = split_order(predicate.query());
        let mut sql = format!(
            "SELECT COUNT(*) FROM `{}` WHERE {}",
            schema.table_name,
            condition
        );
        if schema.has_fake_delete {
            sql.push_str(" AND `FakeDelete` = 0");
        }
        let row = self
            .db(&schema.pool_name)?
            .query_row(&sql, predicate.params())
            .await?;
        Ok(row
            .and_then(|row| row.first().and_then(SqlValue::as_u64))
            .unwrap_or(0))
    }

    /// One row through the cache hierarchy.
    pub(crate) async fn load_row(
        &mut self,
        schema: &Arc<TableSchema>,
        id: u64,
    ) -> Result<Option<Vec<SqlValue>>, StratumError> {
        let key = schema.cache_key(id);
        if let Some(pool) = &schema.local_cache
            && let Some(hit) = self.registry().local_cache(pool)?.get(&key)
        {
            return Ok(unpack_row(&hit));
        }
        if let Some(pool) = &schema.shared_cache {
            let cache = self.registry().shared_cache(pool)?.clone();
            if let Some(hit) = cache.get(&key).await? {
                if let Some(local_pool) = &schema.local_cache {
                    self.registry().local_cache(local_pool)?.set(&key, hit.clone());
                }
                return Ok(unpack_row(&hit));
            }
        }
        let sql = format!(
            "SELECT {} FROM `{}` WHERE `ID` = ?",
            data_select_list(schema),
            schema.table_name
        );
        let row = self
            .db(&schema.pool_name)?
            .query_row(&sql, &[SqlValue::UInt(id)])
            .await?;
        let packed = match &row {
            Some(row) => pack_row(row),
            None => MISS_MARKER.to_string(),
        };
        if let Some(pool) = &schema.shared_cache {
            self.registry()
                .shared_cache(pool)?
                .clone()
                .set(&key, &packed, None)
                .await?;
        }
        if let Some(pool) = &schema.local_cache {
            self.registry().local_cache(pool)?.set(&key, packed);
        }
        Ok(row)
    }

    /// Batched rows through the cache hierarchy: split ids into local
    /// hits, shared hits and store misses, one `IN` select for the rest.
    pub(crate) async fn load_rows(
        &mut self,
        schema: &Arc<TableSchema>,
        ids: &[u64],
    ) -> Result<HashMap<u64, Vec<SqlValue>>, StratumError> {
        let mut found: HashMap<u64, Vec<SqlValue>> = HashMap::new();
        let mut known_missing: HashSet<u64> = HashSet::new();
        let mut remaining: Vec<u64> = Vec::new();
        {
            let mut seen = HashSet::new();
            for id in ids {
                if seen.insert(*id) {
                    remaining.push(*id);
                }
            }
        }

        if let Some(pool) = &schema.local_cache {
            let cache = self.registry().local_cache(pool)?.clone();
            let keys: Vec<String> = remaining.iter().map(|id| schema.cache_key(*id)).collect();
            let hits = cache.mget(&keys);
            let mut next = Vec::new();
            for (id, hit) in remaining.into_iter().zip(hits) {
                match hit {
                    Some(packed) => match unpack_row(&packed) {
                        Some(row) => {
                            found.insert(id, row);
                        }
                        None => {
                            known_missing.insert(id);
                        }
                    },
                    None => next.push(id),
                }
            }
            remaining = next;
        }

        if let Some(pool) = &schema.shared_cache
            && !remaining.is_empty()
        {
            let cache = self.registry().shared_cache(pool)?.clone();
            let keys: Vec<String> = remaining.iter().map(|id| schema.cache_key(*id)).collect();
            let hits = cache.mget(&keys).await?;
            let mut next = Vec::new();
            let mut local_pairs = Vec::new();
            for ((id, key), hit) in remaining.into_iter().zip(keys).zip(hits) {
                match hit {
                    Some(packed) => {
                        local_pairs.push((key, packed.clone()));
                        match unpack_row(&packed) {
                            Some(row) => {
                                found.insert(id, row);
                            }
                            None => {
                                known_missing.insert(id);
                            }
                        }
                    }
                    None => next.push(id),
                }
            }
            if let Some(local_pool) = &schema.local_cache
                && !local_pairs.is_empty()
            {
                self.registry().local_cache(local_pool)?.mset(&local_pairs);
            }
            remaining = next;
        }

        if !remaining.is_empty() {
            let placeholders = vec!["?"; remaining.len()].join(",");
            let sql = format!(
                "SELECT `ID`,{} FROM `{}` WHERE `ID` IN ({placeholders})",
                data_select_list(schema),
                schema.table_name
            );
            let params: Vec<SqlValue> = remaining.iter().map(|id| SqlValue::UInt(*id)).collect();
            let rows = self.db(&schema.pool_name)?.query(&sql, &params).await?;
            let mut shared_pairs = Vec::new();
            let mut local_pairs = Vec::new();
            let mut fetched: HashSet<u64> = HashSet::new();
            for row in rows {
                let Some(id) = row.first().and_then(SqlValue::as_u64) else {
                    continue;
                };
                let data = row[1..].to_vec();
                let packed = pack_row(&data);
                let key = schema.cache_key(id);
                shared_pairs.push((key.clone(), packed.clone()));
                local_pairs.push((key, packed));
                fetched.insert(id);
                found.insert(id, data);
            }
            for id in &remaining {
                if !fetched.contains(id) {
                    let key = schema.cache_key(*id);
                    shared_pairs.push((key.clone(), MISS_MARKER.to_string()));
                    local_pairs.push((key, MISS_MARKER.to_string()));
                    known_missing.insert(*id);
                }
            }
            if let Some(pool) = &schema.shared_cache {
                self.registry()
                    .shared_cache(pool)?
                    .clone()
                    .mset(&shared_pairs)
                    .await?;
            }
            if let Some(pool) = &schema.local_cache {
                self.registry().local_cache(pool)?.mset(&local_pairs);
            }
        }

        Ok(found)
    }
}

pub(crate) fn data_select_list(schema: &TableSchema) -> String {
    schema
        .data_columns()
        .iter()
        .map(|column| format!("`{}`", column.name))
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a predicate at its `ORDER BY` so extra conditions can be
/// appended to the right place.
pub(crate) fn split_order(query: &str) -> (&str, Option<&str>) {
    match query.find(" ORDER BY ") {
        Some(position) => (&query[..position], Some(&query[position + " ORDER BY ".len()..])),
        None => (query, None),
    }
}

pub(crate) fn select_sql(schema: &TableSchema, predicate: &str, pager: Option<&Pager>) -> String {
    let (condition, order) = split_order(predicate);
    let mut sql = format!(
        "SELECT `ID`,{} FROM `{}` WHERE {}",
        data_select_list(schema),
        schema.table_name,
        condition
    );
    if schema.has_fake_delete {
        sql.push_str(" AND `FakeDelete` = 0");
    }
    if let Some(order) = order {
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
    }
    if let Some(pager) = pager {
        sql.push_str(&pager.limit_clause());
    }
    sql
}

pub(crate) fn id_select_sql(schema: &TableSchema, predicate: &str, pager: Option<&Pager>) -> String {
    let (condition, order) = split_order(predicate);
    let mut sql = format!("SELECT `ID` FROM `{}` WHERE {}", schema.table_name, condition);
    if schema.has_fake_delete {
        sql.push_str(" AND `FakeDelete` = 0");
    }
    if let Some(order) = order {
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
    }
    if let Some(pager) = pager {
        sql.push_str(&pager.limit_clause());
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_split() {
        assert_eq!(split_order("`Age` = ?"), ("`Age` = ?", None));
        assert_eq!(
            split_order("1 ORDER BY `Age` DESC"),
            ("1", Some("`Age` DESC"))
        );
    }
}
