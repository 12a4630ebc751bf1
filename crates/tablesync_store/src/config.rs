//! Store configuration.

use std::collections::BTreeMap;
use tablesync_protocol::{TableId, TableSchema};

/// Immutable type restrictions injected into a row store.
///
/// Holds the schema of every table the store serves. Upserts are validated
/// against these schemas; there is no global registry to mutate.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    schemas: BTreeMap<TableId, TableSchema>,
}

impl StoreConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table schema.
    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.schemas.insert(schema.table_id.clone(), schema);
        self
    }

    /// Looks up a schema.
    pub fn schema(&self, table_id: &TableId) -> Option<&TableSchema> {
        self.schemas.get(table_id)
    }

    /// Iterates over configured tables.
    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.schemas.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesync_protocol::{ColumnDefinition, ElementDataType};

    #[test]
    fn config_builder() {
        let config = StoreConfig::new()
            .with_table(TableSchema::new(
                "a",
                vec![ColumnDefinition::new("x", ElementDataType::Integer)],
            ))
            .with_table(TableSchema::new("b", vec![]));

        assert_eq!(config.tables().count(), 2);
        assert!(config.schema(&"a".into()).is_some());
        assert!(config.schema(&"c".into()).is_none());
    }
}
