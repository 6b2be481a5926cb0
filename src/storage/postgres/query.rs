//! SQL generation.
//!
//! Every value reaches PostgreSQL as a bound parameter, including payload keys
//! (`t.data->>$n`). Only identifiers taken from the static schema table, the
//! validated schema name and integer paging values are spliced into the text.

use crate::models::Page;
use crate::storage::query::{Filter, Operator, Query, SortOrder, value_text};
use crate::storage::record::{self, Row};
use crate::storage::schema::{ColumnType, EntityKind, EntitySchema, ResolvedField};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use tokio_postgres::types::ToSql;

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// `TEXT` value.
    Text(Option<String>),
    /// `BIGINT` value.
    BigInt(Option<i64>),
    /// `JSONB` value.
    Json(Value),
}

impl SqlParam {
    /// Borrows the value for `tokio-postgres`.
    #[must_use]
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Text(v) => v,
            Self::BigInt(v) => v,
            Self::Json(v) => v,
        }
    }

    /// Stable text form, used for cache keys.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Text(v) => format!("t:{v:?}"),
            Self::BigInt(v) => format!("i:{v:?}"),
            Self::Json(v) => format!("j:{v}"),
        }
    }
}

/// SQL text plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// Statement text.
    pub sql: String,
    /// Parameters, `$1` first.
    pub params: Vec<SqlParam>,
}

impl SqlQuery {
    /// Parameters as `tokio-postgres` expects them.
    #[must_use]
    pub fn bind(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlParam::as_sql).collect()
    }
}

/// Row query and matching count query.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Page of rows.
    pub select: SqlQuery,
    /// `COUNT(*)` over the same filters, ignoring ordering and paging.
    pub count: SqlQuery,
}

/// Quotes an identifier.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualified table name.
#[must_use]
pub fn table_name(schema: &str, kind: EntityKind) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(kind.as_str()))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Accumulates joins, conditions and parameters for one statement.
struct Builder<'s> {
    schema: &'s str,
    kind: EntityKind,
    entity: &'static EntitySchema,
    joins: Vec<(&'static str, String)>,
    params: Vec<SqlParam>,
}

impl<'s> Builder<'s> {
    const fn new(schema: &'s str, kind: EntityKind) -> Self {
        Self {
            schema,
            kind,
            entity: kind.schema(),
            joins: Vec::new(),
            params: Vec::new(),
        }
    }

    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    /// Returns the alias of the join for a joined field, adding it if needed.
    fn join_alias(&mut self, name: &'static str, kind: EntityKind, local_field: &str) -> Result<String> {
        if let Some(position) = self.joins.iter().position(|(n, _)| *n == name) {
            return Ok(format!("j{position}"));
        }
        let local = self.entity.property(local_field).ok_or_else(|| {
            Error::Validation(format!(
                "join '{name}' refers to non-indexed field '{local_field}'"
            ))
        })?;
        let alias = format!("j{}", self.joins.len());
        let clause = format!(
            " LEFT JOIN {} {alias} ON {alias}.id = t.{}",
            table_name(self.schema, kind),
            quote_ident(local.column)
        );
        self.joins.push((name, clause));
        Ok(alias)
    }

    /// SQL expression for a field, as text unless it is a bigint column.
    fn expression(&mut self, field: &str) -> Result<(String, Option<ColumnType>)> {
        let resolved: ResolvedField<'_> = self.entity.resolve(field)?;
        Ok(match resolved {
            ResolvedField::Id => ("t.id".to_string(), Some(ColumnType::Text)),
            ResolvedField::Property(p) => (
                format!("t.{}", quote_ident(p.column)),
                Some(p.column_type),
            ),
            ResolvedField::Joined(join) => {
                let alias = self.join_alias(join.name, join.kind, join.local_field)?;
                let remote = join.kind.schema();
                if join.remote_key == "id" {
                    (format!("{alias}.id"), Some(ColumnType::Text))
                } else if let Some(p) = remote.property(join.remote_key) {
                    // Indexed fields are not kept in the remote payload.
                    (
                        format!("{alias}.{}", quote_ident(p.column)),
                        Some(p.column_type),
                    )
                } else {
                    let key = self.bind(SqlParam::Text(Some(join.remote_key.to_string())));
                    (format!("{alias}.data->>{key}"), None)
                }
            },
            ResolvedField::Payload(key) => {
                let key = self.bind(SqlParam::Text(Some(key.to_string())));
                (format!("t.data->>{key}"), None)
            },
        })
    }

    fn condition(&mut self, filter: &Filter) -> Result<String> {
        let (expr, column_type) = self.expression(&filter.field)?;
        let Some(text) = value_text(Some(&filter.value)) else {
            // Null never matches, as in the JSON backend.
            return Ok("FALSE".to_string());
        };

        Ok(match (filter.operator, column_type) {
            (Operator::Eq, Some(ColumnType::BigInt)) => match filter.value.as_i64() {
                Some(n) => format!("{expr} = {}", self.bind(SqlParam::BigInt(Some(n)))),
                None => format!(
                    "CAST({expr} AS TEXT) = {}",
                    self.bind(SqlParam::Text(Some(text)))
                ),
            },
            (Operator::Eq, _) => format!("{expr} = {}", self.bind(SqlParam::Text(Some(text)))),
            (Operator::Like, Some(ColumnType::BigInt)) => format!(
                "CAST({expr} AS TEXT) ILIKE {}",
                self.bind(SqlParam::Text(Some(format!("%{}%", escape_like(&text)))))
            ),
            (Operator::Like, _) => format!(
                "{expr} ILIKE {}",
                self.bind(SqlParam::Text(Some(format!("%{}%", escape_like(&text)))))
            ),
        })
    }

    fn where_clause(&mut self, query: &Query) -> Result<String> {
        let conditions = query
            .filters
            .iter()
            .map(|f| self.condition(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        })
    }

    fn from_clause(&self) -> String {
        let mut from = format!(" FROM {} t", table_name(self.schema, self.kind));
        for (_, clause) in &self.joins {
            from.push_str(clause);
        }
        from
    }

    fn column_list(&self) -> String {
        let mut columns = String::from("t.id");
        for property in self.entity.properties {
            let _ = write!(columns, ", t.{}", quote_ident(property.column));
        }
        columns.push_str(", t.data");
        columns
    }
}

/// Compiles an index query and its count query.
///
/// # Errors
///
/// Returns `Error::Validation` if a field name is not a plain identifier.
pub fn compile(schema: &str, kind: EntityKind, query: &Query) -> Result<CompiledQuery> {
    let mut builder = Builder::new(schema, kind);
    let where_clause = builder.where_clause(query)?;

    // Ordering may add joins and parameters; the count only needs the filters.
    let count_params = builder.params.clone();
    let count_joins = builder.joins.len();

    let order_clause = match &query.order_by {
        Some((field, order)) => {
            let (expr, _) = builder.expression(field)?;
            let direction = match order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            format!(" ORDER BY {expr} {direction} NULLS FIRST, t.id ASC")
        },
        None => " ORDER BY t.id ASC".to_string(),
    };

    let mut paging = String::new();
    if query.limit > 0 {
        let _ = write!(paging, " LIMIT {}", query.limit);
    }
    if query.offset > 0 {
        let _ = write!(paging, " OFFSET {}", query.offset);
    }

    let select = SqlQuery {
        sql: format!(
            "SELECT {}{}{where_clause}{order_clause}{paging}",
            builder.column_list(),
            builder.from_clause()
        ),
        params: builder.params.clone(),
    };

    builder.joins.truncate(count_joins);
    let count = SqlQuery {
        sql: format!("SELECT COUNT(*){}{where_clause}", builder.from_clause()),
        params: count_params,
    };

    Ok(CompiledQuery { select, count })
}

/// Compiles a delete of every row matching the query's filters.
///
/// # Errors
///
/// Returns `Error::Validation` if the query has no filters or names an
/// invalid field.
pub fn compile_delete(schema: &str, kind: EntityKind, query: &Query) -> Result<SqlQuery> {
    if query.filters.is_empty() {
        return Err(Error::Validation(format!(
            "refusing to delete all {kind} without a filter"
        )));
    }
    let mut builder = Builder::new(schema, kind);
    let where_clause = builder.where_clause(query)?;
    Ok(SqlQuery {
        sql: format!(
            "DELETE FROM {} WHERE id IN (SELECT t.id{}{where_clause})",
            table_name(schema, kind),
            builder.from_clause()
        ),
        params: builder.params,
    })
}

/// Compiles an upsert of one row.
#[must_use]
pub fn compile_upsert(schema: &str, kind: EntityKind, row: &Row) -> SqlQuery {
    let entity = kind.schema();
    let mut columns = vec!["id".to_string()];
    let mut params = vec![SqlParam::Text(Some(row.id.clone()))];

    for property in entity.properties {
        let value = row.columns.get(property.column);
        columns.push(quote_ident(property.column));
        params.push(match property.column_type {
            ColumnType::Text => {
                SqlParam::Text(value.and_then(Value::as_str).map(str::to_string))
            },
            ColumnType::BigInt => SqlParam::BigInt(value.and_then(Value::as_i64)),
        });
    }
    columns.push("data".to_string());
    params.push(SqlParam::Json(Value::Object(row.data.clone())));

    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .skip(1)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();

    SqlQuery {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
            table_name(schema, kind),
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        ),
        params,
    }
}

/// Compiles a primary-key lookup.
#[must_use]
pub fn compile_get(schema: &str, kind: EntityKind, id: &str) -> SqlQuery {
    let builder = Builder::new(schema, kind);
    SqlQuery {
        sql: format!(
            "SELECT {}{} WHERE t.id = $1",
            builder.column_list(),
            builder.from_clause()
        ),
        params: vec![SqlParam::Text(Some(id.to_string()))],
    }
}

/// Converts a result row back into a canonical record.
///
/// # Errors
///
/// Returns `Error::OperationFailed` if a column has an unexpected type.
pub fn row_to_record(kind: EntityKind, row: &tokio_postgres::Row) -> Result<Value> {
    let entity = kind.schema();
    let decode = |e: tokio_postgres::Error| Error::operation("postgres_decode_row", e);

    let id: String = row.try_get("id").map_err(decode)?;
    let mut columns = Map::new();
    for property in entity.properties {
        let value = match property.column_type {
            ColumnType::Text => row
                .try_get::<_, Option<String>>(property.column)
                .map_err(decode)?
                .map_or(Value::Null, Value::String),
            ColumnType::BigInt => row
                .try_get::<_, Option<i64>>(property.column)
                .map_err(decode)?
                .map_or(Value::Null, Value::from),
        };
        columns.insert(property.column.to_string(), value);
    }
    let data = match row.try_get::<_, Value>("data").map_err(decode)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    Ok(record::merge(entity, Row { id, columns, data }))
}

/// Converts result rows into a page.
///
/// # Errors
///
/// Returns the first row decoding error.
pub fn rows_to_page(
    kind: EntityKind,
    rows: &[tokio_postgres::Row],
    count: usize,
    count_cached: bool,
) -> Result<Page<Value>> {
    Ok(Page {
        items: rows
            .iter()
            .map(|row| row_to_record(kind, row))
            .collect::<Result<Vec<_>>>()?,
        count,
        count_cached,
    })
}
