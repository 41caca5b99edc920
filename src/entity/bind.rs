//! Column-level diff between an entity and its persisted snapshot.

use super::{Entity, SqlValue};
use crate::schema::TableSchema;

/// Outcome of diffing one entity against its `db_data` snapshot.
pub(crate) struct DirtyState {
    /// Changed data columns as `(data-column index, new value)`.
    pub bind: Vec<(usize, SqlValue)>,
    /// Full current row image, declaration order.
    pub row: Vec<SqlValue>,
}

impl DirtyState {
    pub fn is_dirty(&self, entity: &dyn Entity) -> bool {
        !self.bind.is_empty() || !entity.meta().loaded || entity.meta().delete
    }
}

/// Compute the bind set for `entity`.
///
/// A never-loaded entity binds every column (it inserts whole); a loaded
/// one binds only the columns whose value moved away from the snapshot.
pub(crate) fn dirty_bind(schema: &TableSchema, entity: &dyn Entity) -> DirtyState {
    let row = entity.to_row();
    let columns = schema.data_columns();
    assert_eq!(
        row.len(),
        columns.len(),
        "`{}` row image has {} values for {} columns; declaration and to_row disagree",
        schema.entity_name,
        row.len(),
        columns.len(),
    );
    let meta = entity.meta();
    let bind = if !meta.loaded || meta.db_data.len() != row.len() {
        row.iter().cloned().enumerate().collect()
    } else {
        row.iter()
            .enumerate()
            .filter(|(index, value)| !meta.db_data[*index].eq_loose(value))
            .map(|(index, value)| (index, value.clone()))
            .collect()
    };
    DirtyState { bind, row }
}
