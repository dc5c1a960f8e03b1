//! Logical schema for the sync bookkeeping tables.
//!
//! The tables are declared once with logical column types and rendered into
//! DDL per backend by the dialect, so the two physical schemas cannot drift.

use tracing::{debug, info};

use fleetsync_common::Result;

use crate::dialect::{ColumnType, Dialect};
use crate::provider::Store;

/// Append-only audit trail of sync attempts.
pub const JOURNAL_TABLE: &str = "sync_journal";
/// Pending domain-change events awaiting broadcast.
pub const OUTBOX_TABLE: &str = "sync_outbox";
/// Divergent edits detected after reconnection.
pub const CONFLICTS_TABLE: &str = "sync_conflicts";
/// Local record changes awaiting push to the remote replica.
pub const CHANGES_TABLE: &str = "sync_changes";

/// A column of the logical schema.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    /// `DEFAULT FALSE` on boolean columns, `DEFAULT 0` on integer ones.
    pub default_zero: bool,
}

impl Column {
    const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            primary_key: false,
            default_zero: false,
        }
    }

    const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            primary_key: false,
            default_zero: false,
        }
    }

    const fn id(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Id,
            nullable: false,
            primary_key: true,
            default_zero: false,
        }
    }

    const fn flag(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Boolean,
            nullable: false,
            primary_key: false,
            default_zero: true,
        }
    }

    const fn counter(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Integer,
            nullable: false,
            primary_key: false,
            default_zero: true,
        }
    }
}

/// A secondary index.
#[derive(Debug, Clone, Copy)]
pub struct Index {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// A table of the logical schema.
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indexes: &'static [Index],
}

/// Every table this layer owns.
pub const SCHEMA: &[Table] = &[
    Table {
        name: JOURNAL_TABLE,
        columns: &[
            Column::id("id"),
            Column::required("entity_type", ColumnType::Text),
            Column::required("entity_id", ColumnType::Text),
            Column::required("operation", ColumnType::Text),
            Column::required("payload", ColumnType::Json),
            Column::required("sync_status", ColumnType::Text),
            Column::required("created_at", ColumnType::Timestamp),
        ],
        indexes: &[
            Index {
                name: "idx_sync_journal_created",
                columns: &["created_at"],
            },
            Index {
                name: "idx_sync_journal_status",
                columns: &["sync_status", "created_at"],
            },
        ],
    },
    Table {
        name: OUTBOX_TABLE,
        columns: &[
            Column::id("id"),
            Column::required("payload", ColumnType::Json),
            Column::flag("processed"),
            Column::optional("processed_at", ColumnType::Timestamp),
            Column::counter("attempts"),
            Column::optional("last_error", ColumnType::Text),
            Column::required("created_at", ColumnType::Timestamp),
        ],
        indexes: &[Index {
            name: "idx_sync_outbox_pending",
            columns: &["processed", "attempts", "created_at"],
        }],
    },
    Table {
        name: CONFLICTS_TABLE,
        columns: &[
            Column::id("id"),
            Column::required("table_name", ColumnType::Text),
            Column::required("record_id", ColumnType::Text),
            Column::optional("local_version", ColumnType::Json),
            Column::optional("remote_version", ColumnType::Json),
            Column::required("local_timestamp", ColumnType::Timestamp),
            Column::required("remote_timestamp", ColumnType::Timestamp),
            Column::required("conflict_type", ColumnType::Text),
            Column::flag("resolved"),
            Column::optional("resolved_at", ColumnType::Timestamp),
            Column::optional("resolved_by", ColumnType::Text),
            Column::optional("resolution_strategy", ColumnType::Text),
            Column::optional("winning_side", ColumnType::Text),
            Column::required("detected_at", ColumnType::Timestamp),
        ],
        indexes: &[
            Index {
                name: "idx_sync_conflicts_unresolved",
                columns: &["resolved", "detected_at"],
            },
            Index {
                name: "idx_sync_conflicts_record",
                columns: &["table_name", "record_id"],
            },
        ],
    },
    Table {
        name: CHANGES_TABLE,
        columns: &[
            Column::id("id"),
            Column::required("table_name", ColumnType::Text),
            Column::required("record_id", ColumnType::Text),
            Column::required("operation", ColumnType::Text),
            Column::optional("row_data", ColumnType::Json),
            Column::flag("pushed"),
            Column::required("created_at", ColumnType::Timestamp),
        ],
        indexes: &[Index {
            name: "idx_sync_changes_pending",
            columns: &["pushed", "created_at"],
        }],
    },
];

impl Table {
    /// `CREATE TABLE IF NOT EXISTS` for this table in the given dialect.
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", column.name, dialect.column_type(column.ty));
                if column.primary_key {
                    def.push_str(" PRIMARY KEY");
                } else if !column.nullable {
                    def.push_str(" NOT NULL");
                }
                if column.default_zero {
                    def.push_str(" DEFAULT ");
                    def.push_str(match column.ty {
                        ColumnType::Boolean => dialect.bool_literal(false),
                        _ => "0",
                    });
                }
                def
            })
            .collect::<Vec<_>>()
            .join(",\n    ");

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name, columns
        )
    }

    /// `CREATE INDEX IF NOT EXISTS` statements for this table.
    pub fn create_index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    index.name,
                    self.name,
                    index.columns.join(", ")
                )
            })
            .collect()
    }
}

/// All DDL statements for the schema, in dependency order.
pub fn ddl(dialect: Dialect) -> Vec<String> {
    SCHEMA
        .iter()
        .flat_map(|table| {
            std::iter::once(table.create_table_sql(dialect)).chain(table.create_index_sql())
        })
        .collect()
}

/// Verify or create the schema. Safe to call on every startup.
pub async fn ensure_schema(store: &dyn Store) -> Result<()> {
    let dialect = store.dialect();
    for statement in ddl(dialect) {
        debug!(backend = %dialect, "Applying DDL: {}", statement.lines().next().unwrap_or(""));
        store.execute(&statement, &[]).await?;
    }
    info!(backend = %dialect, tables = SCHEMA.len(), "Sync schema verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteStore;

    #[test]
    fn test_outbox_ddl_per_dialect() {
        let outbox = SCHEMA.iter().find(|t| t.name == OUTBOX_TABLE).unwrap();

        let pg = outbox.create_table_sql(Dialect::Postgres);
        assert!(pg.contains("payload JSONB NOT NULL"));
        assert!(pg.contains("processed BOOLEAN NOT NULL DEFAULT FALSE"));
        assert!(pg.contains("processed_at TIMESTAMPTZ,"));

        let sqlite = outbox.create_table_sql(Dialect::Sqlite);
        assert!(sqlite.contains("payload TEXT NOT NULL"));
        assert!(sqlite.contains("processed INTEGER NOT NULL DEFAULT 0"));
        assert!(sqlite.contains("attempts INTEGER NOT NULL DEFAULT 0"));
        assert!(pg.contains("attempts BIGINT NOT NULL DEFAULT 0"));
        assert!(sqlite.contains("created_at INTEGER NOT NULL"));
    }

    #[test]
    fn test_both_dialects_share_column_sets() {
        let pg = ddl(Dialect::Postgres);
        let sqlite = ddl(Dialect::Sqlite);
        assert_eq!(pg.len(), sqlite.len());
        for table in SCHEMA {
            for column in table.columns {
                assert!(pg.iter().any(|s| s.contains(column.name)));
                assert!(sqlite.iter().any(|s| s.contains(column.name)));
            }
        }
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        ensure_schema(&store).await.unwrap();
        ensure_schema(&store).await.unwrap();

        for table in SCHEMA {
            assert!(store.table_exists(table.name).await.unwrap());
        }
    }
}
