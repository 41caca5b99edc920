//! Reference preloader.
//!
//! Paths are slash-separated reference traversals (`Author/Address`);
//! `*` expands to every reference field at its level. Each level issues
//! one batched row load per target schema, and a `(type, id)` working set
//! keeps cyclic reference graphs from recursing forever.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use super::Engine;
use crate::entity::Entity;
use crate::error::StratumError;
use crate::schema::{SchemaError, TableSchema};

impl Engine {
    pub(crate) async fn preload(
        &mut self,
        targets: &mut [&mut dyn Entity],
        schema: &Arc<TableSchema>,
        refs: &[&str],
    ) -> Result<(), StratumError> {
        let mut visited: HashSet<(String, u64)> = targets
            .iter()
            .map(|target| (schema.entity_name.clone(), target.id()))
            .collect();
        let paths: Vec<String> = refs.iter().map(|path| (*path).to_string()).collect();
        self.preload_level(targets, schema.clone(), paths, &mut visited)
            .await
    }

    fn preload_level<'a, 'b: 'a>(
        &'a mut self,
        targets: &'a mut [&'b mut dyn Entity],
        schema: Arc<TableSchema>,
        refs: Vec<String>,
        visited: &'a mut HashSet<(String, u64)>,
    ) -> BoxFuture<'a, Result<(), StratumError>> {
        Box::pin(async move {
            for (column, tails) in expand_paths(&schema, &refs) {
                let Some(reference) = schema
                    .ref_columns
                    .iter()
                    .find(|reference| reference.column == column)
                else {
                    return Err(SchemaError::invalid_tag(
                        schema.entity_name.clone(),
                        column,
                        "unknown reference path",
                    )
                    .into());
                };
                let target_schema = self.registry().schema(&reference.target_entity)?.clone();

                let mut wanted: Vec<(usize, u64)> = Vec::new();
                for (position, target) in targets.iter().enumerate() {
                    if let Some(id) = target.ref_id(&column)
                        && id != 0
                    {
                        wanted.push((position, id));
                    }
                }
                if wanted.is_empty() {
                    continue;
                }
                let mut unique: Vec<u64> = wanted.iter().map(|(_, id)| *id).collect();
                unique.sort_unstable();
                unique.dedup();
                let rows = self.load_rows(&target_schema, &unique).await?;

                let mut hydrated: Vec<(usize, Box<dyn Entity>)> = Vec::new();
                let mut fresh: Vec<usize> = Vec::new();
                for (parent, id) in wanted {
                    let Some(row) = rows.get(&id) else {
                        continue;
                    };
                    let mut boxed = self.registry().new_entity(&reference.target_entity)?;
                    boxed.set_id(id);
                    boxed.apply_row(row)?;
                    boxed.meta_mut().snapshot(row.clone());
                    if visited.insert((target_schema.entity_name.clone(), id)) {
                        fresh.push(hydrated.len());
                    }
                    hydrated.push((parent, boxed));
                }

                // Recurse only into ids first seen at this level; a cycle
                // back into the working set is hydrated shallow.
                if !tails.is_empty() && !fresh.is_empty() {
                    let mut sub: Vec<&mut dyn Entity> = hydrated
                        .iter_mut()
                        .enumerate()
                        .filter(|(position, _)| fresh.contains(position))
                        .map(|(_, (_, boxed))| boxed.as_mut())
                        .collect();
                    self.preload_level(&mut sub, target_schema.clone(), tails.clone(), visited)
                        .await?;
                }

                for (parent, boxed) in hydrated {
                    targets[parent].set_ref(&column, boxed.into_any());
                }
            }
            Ok(())
        })
    }
}

/// Group paths by their first segment, expanding `*` to every reference
/// column of the schema.
fn expand_paths(schema: &TableSchema, refs: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in refs {
        let (head, tail) = match path.split_once('/') {
            Some((head, tail)) => (head, Some(tail)),
            None => (path.as_str(), None),
        };
        let columns: Vec<String> = if head == "*" {
            schema
                .ref_columns
                .iter()
                .map(|reference| reference.column.clone())
                .collect()
        } else {
            vec![head.to_string()]
        };
        for column in columns {
            let entry = groups.entry(column).or_default();
            if let Some(tail) = tail {
                entry.push(tail.to_string());
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::schema::{ColumnDef, RefColumn};

    fn schema_with_refs(refs: &[&str]) -> TableSchema {
        TableSchema {
            entity_name: "Post".to_string(),
            table_name: "Post".to_string(),
            pool_name: "default".to_string(),
            columns: vec![ColumnDef {
                name: "ID".to_string(),
                definition: "`ID` bigint(20) unsigned NOT NULL".to_string(),
                nullable: false,
            }],
            indexes: BTreeMap::new(),
            ref_columns: refs
                .iter()
                .map(|column| RefColumn {
                    column: (*column).to_string(),
                    target_entity: "User".to_string(),
                    target_table: "User".to_string(),
                    foreign_key: None,
                })
                .collect(),
            cached_queries: BTreeMap::new(),
            has_fake_delete: false,
            local_cache: None,
            shared_cache: None,
            log_pool: None,
            dirty_queues: Vec::new(),
        }
    }

    #[test]
    fn star_expands_to_every_reference() {
        let schema = schema_with_refs(&["Author", "Editor"]);
        let groups = expand_paths(&schema, &["*".to_string()]);
        assert_eq!(groups.len(), 2);
        assert!(groups["Author"].is_empty());
        assert!(groups["Editor"].is_empty());
    }

    #[test]
    fn nested_paths_group_by_head() {
        let schema = schema_with_refs(&["Author"]);
        let groups = expand_paths(
            &schema,
            &["Author/Address".to_string(), "Author/Employer".to_string()],
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["Author"], vec!["Address", "Employer"]);
    }

    #[test]
    fn star_with_tail_recurses() {
        let schema = schema_with_refs(&["Author"]);
        let groups = expand_paths(&schema, &["*/*".to_string()]);
        assert_eq!(groups["Author"], vec!["*"]);
    }
}
