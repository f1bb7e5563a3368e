//! `DatabaseWatcher`: owns one SQL connection, installs the per-table
//! trigger/metadata schema, and applies remote writes under
//! last-writer-wins.

pub mod handle;
pub mod schema;

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ErrorKind, SyncError};
use crate::transformer::CloudTransformer;
use crate::types::{
    CloudData, LocalData, ObjectKey, Payload, ResyncFlag, StoreResult, SyncField, TableConfig,
    TableMeta, TableState,
};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, SyncError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SyncError::State("malformed timestamp in shadow table"))
}

fn sql_value_to_json(v: ValueRef<'_>) -> serde_json::Value {
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::json!(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::json!(ObjectKey::encode_binary_pkey(b)),
    }
}

fn json_to_sql_value(v: &serde_json::Value) -> SqlValue {
    match v {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Bind a canonical `row_id` string to the SQL value matching the table's
/// recorded `pkey_type`. Binary primary keys are Base64 in `row_id`,
/// restored to raw bytes here.
fn pkey_to_sql_value(pkey_type: &str, row_id: &str) -> Result<SqlValue, SyncError> {
    match pkey_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT" | "BIGINT" => row_id
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|_| SyncError::State("row_id is not a valid integer pkey")),
        "BLOB" => ObjectKey::decode_binary_pkey(row_id)
            .map(SqlValue::Blob)
            .map_err(|_| SyncError::State("row_id is not valid base64 for a blob pkey")),
        "REAL" | "FLOAT" | "DOUBLE" => row_id
            .parse::<f64>()
            .map(SqlValue::Real)
            .map_err(|_| SyncError::State("row_id is not a valid real pkey")),
        _ => Ok(SqlValue::Text(row_id.to_string())),
    }
}

fn sql_value_ref_to_row_id(v: ValueRef<'_>) -> String {
    match v {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => ObjectKey::encode_binary_pkey(b),
    }
}

struct ColumnInfo {
    name: String,
    is_pk: bool,
}

/// `DatabaseWatcher` owns exactly one [`rusqlite::Connection`], exclusively.
/// It is not `Sync`; [`handle::WatcherHandle`] is the async wrapper that
/// runs one of these on a dedicated thread and posts work to it, so all SQL
/// for a database stays confined to a single thread regardless of how many
/// async tasks call in.
pub struct DatabaseWatcher {
    conn: Connection,
    transformer: Box<dyn CloudTransformer>,
    changed_tx: mpsc::UnboundedSender<String>,
}

impl DatabaseWatcher {
    pub fn new(
        conn: Connection,
        transformer: Box<dyn CloudTransformer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), SyncError> {
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            conn,
            transformer,
            changed_tx,
        };
        watcher.conn.execute_batch(schema::engine_schema_sql())?;
        Ok((watcher, changed_rx))
    }

    fn emit_changed(&self, table: &str) {
        let _ = self.changed_tx.send(table.to_string());
    }

    /// Run `f` with engine triggers disarmed: a guard row is inserted
    /// before `f` runs and removed afterward, all inside one transaction
    /// so application code never observes the guard active.
    fn with_guarded_tx<R>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!("INSERT INTO {} (active) VALUES (1)", schema::GUARD_TABLE),
            [],
        )?;
        let result = f(&tx);
        tx.execute(&format!("DELETE FROM {}", schema::GUARD_TABLE), [])?;
        let result = result?;
        tx.commit()?;
        Ok(result)
    }

    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", schema::quote_ident(table)))?;
        let rows = stmt.query_map([], |r| {
            Ok(ColumnInfo {
                name: r.get::<_, String>(1)?,
                is_pk: r.get::<_, i64>(5)? > 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn table_meta(&self, table: &str) -> Result<Option<TableMeta>, SyncError> {
        let row: Option<(String, String, String, String, Option<String>)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT table_name, pkey_name, pkey_type, state, last_sync FROM {} WHERE table_name = ?1",
                    schema::META_TABLE
                ),
                params![table],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()?;

        let Some((table_name, pkey_name, pkey_type, state, last_sync)) = row else {
            return Ok(None);
        };
        Ok(Some(TableMeta {
            table_name,
            pkey_name,
            pkey_type,
            state: if state == "Active" {
                TableState::Active
            } else {
                TableState::Inactive
            },
            last_sync: last_sync.map(|s| parse_ts(&s)).transpose()?,
        }))
    }

    fn table_meta_last_sync(&self, table: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT last_sync FROM {} WHERE table_name = ?1",
                    schema::META_TABLE
                ),
                params![table],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        raw.map(|s| parse_ts(&s)).transpose()
    }

    fn synced_fields(&self, table: &str) -> Result<SyncField, SyncError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT column FROM {} WHERE table_name = ?1",
            schema::FIELDS_TABLE
        ))?;
        let cols: Vec<String> = stmt
            .query_map(params![table], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        if cols.is_empty() {
            Ok(SyncField::all())
        } else {
            Ok(SyncField::only(cols))
        }
    }

    /// Register `cfg.table` for syncing: installs the shadow table and
    /// triggers, and marks every existing row Changed so the first upload
    /// pass picks them all up.
    #[tracing::instrument(skip(self, cfg), fields(table = %cfg.table))]
    pub fn add_table(&self, cfg: &TableConfig) -> Result<(), SyncError> {
        let existing = self.table_meta(&cfg.table)?;
        if let Some(meta) = &existing {
            if !cfg.force_recreate {
                self.conn.execute(
                    &format!(
                        "UPDATE {} SET state = 'Active' WHERE table_name = ?1",
                        schema::META_TABLE
                    ),
                    params![cfg.table],
                )?;
                let _ = meta;
                self.emit_changed(&cfg.table);
                return Ok(());
            }
        }

        let columns = self.table_columns(&cfg.table)?;
        if columns.is_empty() {
            return Err(SyncError::Schema {
                table: cfg.table.clone(),
                reason: "table does not exist".into(),
            });
        }
        let pk_columns: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_pk).collect();
        if pk_columns.len() != 1 {
            return Err(SyncError::Schema {
                table: cfg.table.clone(),
                reason: "composite or missing primary key is unsupported".into(),
            });
        }
        let pkey_name = pk_columns[0].name.clone();
        let pkey_type = self.column_decltype(&cfg.table, &pkey_name)?;

        self.with_guarded_tx(|tx| {
            tx.execute_batch(&schema::table_schema_sql(&cfg.table, &pkey_name, &pkey_type))?;

            let select_pk = format!(
                "SELECT {} FROM {}",
                schema::quote_ident(&pkey_name),
                schema::quote_ident(&cfg.table)
            );
            let mut stmt = tx.prepare(&select_pk)?;
            let now = now_rfc3339();
            let shadow = schema::quote_ident(&schema::shadow_table_name(&cfg.table));
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let row_id = sql_value_ref_to_row_id(row.get_ref(0)?);
                tx.execute(
                    &format!(
                        "INSERT INTO {shadow}(pkey, tstamp, changed) VALUES (?1, ?2, 'Changed')
                         ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Changed'"
                    ),
                    params![row_id, now],
                )?;
            }
            drop(rows);
            drop(stmt);

            tx.execute(
                &format!(
                    "INSERT INTO {} (table_name, pkey_name, pkey_type, state, last_sync)
                     VALUES (?1, ?2, ?3, 'Active', NULL)
                     ON CONFLICT(table_name) DO UPDATE SET
                        pkey_name = excluded.pkey_name,
                        pkey_type = excluded.pkey_type,
                        state = 'Active',
                        last_sync = NULL",
                    schema::META_TABLE
                ),
                params![cfg.table, pkey_name, pkey_type],
            )?;

            tx.execute(
                &format!("DELETE FROM {} WHERE table_name = ?1", schema::FIELDS_TABLE),
                params![cfg.table],
            )?;
            if let Some(fields) = &cfg.fields.0 {
                for col in fields {
                    tx.execute(
                        &format!(
                            "INSERT INTO {} (table_name, column) VALUES (?1, ?2)",
                            schema::FIELDS_TABLE
                        ),
                        params![cfg.table, col],
                    )?;
                }
            }
            Ok(())
        })?;

        self.emit_changed(&cfg.table);
        Ok(())
    }

    fn column_decltype(&self, table: &str, column: &str) -> Result<String, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", schema::quote_ident(table)))?;
        let rows = stmt.query_map([], |r| {
            let name: String = r.get(1)?;
            let ty: String = r.get(2)?;
            Ok((name, ty))
        })?;
        for row in rows {
            let (name, ty) = row?;
            if name == column {
                return Ok(if ty.is_empty() { "TEXT".to_string() } else { ty });
            }
        }
        Err(SyncError::Schema {
            table: table.to_string(),
            reason: format!("column {column} not found"),
        })
    }

    /// Deactivate a table, keeping its shadow and stopping further uploads.
    pub fn remove_table(&self, table: &str) -> Result<(), SyncError> {
        self.conn.execute(
            &format!(
                "UPDATE {} SET state = 'Inactive' WHERE table_name = ?1",
                schema::META_TABLE
            ),
            params![table],
        )?;
        Ok(())
    }

    /// Erase everything the engine owns for `table`: shadow, triggers,
    /// and bookkeeping rows, leaving the user's data untouched.
    pub fn unsync_table(&self, table: &str) -> Result<(), SyncError> {
        self.conn.execute_batch(&schema::drop_table_schema_sql(table))?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE table_name = ?1", schema::FIELDS_TABLE),
            params![table],
        )?;
        self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE table_name = ?1",
                schema::REFERENCES_TABLE
            ),
            params![table],
        )?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE table_name = ?1", schema::META_TABLE),
            params![table],
        )?;
        Ok(())
    }

    /// Like `unsync_table`, but leaves the meta row's Inactive marker so a
    /// later `reactivate` can recreate the schema.
    pub fn drop_table(&self, table: &str) -> Result<(), SyncError> {
        self.conn.execute_batch(&schema::drop_table_schema_sql(table))?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE table_name = ?1", schema::FIELDS_TABLE),
            params![table],
        )?;
        self.conn.execute(
            &format!(
                "UPDATE {} SET state = 'Inactive', last_sync = NULL WHERE table_name = ?1",
                schema::META_TABLE
            ),
            params![table],
        )?;
        Ok(())
    }

    /// Flip every Inactive table still present in meta back to Active,
    /// recreating its schema if it had been dropped.
    pub fn reactivate(&self) -> Result<Vec<String>, SyncError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT table_name, pkey_name, pkey_type FROM {} WHERE state = 'Inactive'",
            schema::META_TABLE
        ))?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let mut reactivated = Vec::new();
        for (table, pkey_name, pkey_type) in rows {
            let shadow_exists: bool = self
                .conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                    params![schema::shadow_table_name(&table)],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !shadow_exists {
                self.with_guarded_tx(|tx| {
                    tx.execute_batch(&schema::table_schema_sql(&table, &pkey_name, &pkey_type))?;
                    let select_pk = format!(
                        "SELECT {} FROM {}",
                        schema::quote_ident(&pkey_name),
                        schema::quote_ident(&table)
                    );
                    let mut pk_stmt = tx.prepare(&select_pk)?;
                    let shadow = schema::quote_ident(&schema::shadow_table_name(&table));
                    let now = now_rfc3339();
                    let mut rows = pk_stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        let row_id = sql_value_ref_to_row_id(row.get_ref(0)?);
                        tx.execute(
                            &format!(
                                "INSERT INTO {shadow}(pkey, tstamp, changed) VALUES (?1, ?2, 'Changed')
                                 ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Changed'"
                            ),
                            params![row_id, now],
                        )?;
                    }
                    Ok(())
                })?;
                self.conn.execute(
                    &format!(
                        "UPDATE {} SET state = 'Active', last_sync = NULL WHERE table_name = ?1",
                        schema::META_TABLE
                    ),
                    params![table],
                )?;
            } else {
                self.conn.execute(
                    &format!(
                        "UPDATE {} SET state = 'Active' WHERE table_name = ?1",
                        schema::META_TABLE
                    ),
                    params![table],
                )?;
            }
            self.emit_changed(&table);
            reactivated.push(table);
        }
        Ok(reactivated)
    }

    /// Erase every table's shadow and meta, preserving user data.
    pub fn drop_all(&self) -> Result<(), SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT table_name FROM {}", schema::META_TABLE))?;
        let tables: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        for table in &tables {
            self.conn.execute_batch(&schema::drop_table_schema_sql(table))?;
        }
        self.conn
            .execute(&format!("DELETE FROM {}", schema::FIELDS_TABLE), [])?;
        self.conn
            .execute(&format!("DELETE FROM {}", schema::REFERENCES_TABLE), [])?;
        self.conn.execute(&format!("DELETE FROM {}", schema::META_TABLE), [])?;
        Ok(())
    }

    /// Fetch the oldest pending local change for `table`, if any.
    pub fn load_next_pending(&self, table: &str) -> Result<Option<LocalData>, SyncError> {
        let meta = self.table_meta(table)?.ok_or(SyncError::State("table not registered"))?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(table));

        let next: Option<(String, String)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT pkey, tstamp FROM {shadow} WHERE changed = 'Changed' ORDER BY tstamp ASC LIMIT 1"
                ),
                [],
                |r| Ok((sql_value_ref_to_row_id(r.get_ref(0)?), r.get(1)?)),
            )
            .optional()?;

        let Some((row_id, tstamp_text)) = next else {
            return Ok(None);
        };
        let modified = parse_ts(&tstamp_text)?;
        let pk_value = pkey_to_sql_value(&meta.pkey_type, &row_id)?;

        let fields = self.synced_fields(table)?;
        let columns = self.table_columns(table)?;
        let qtable = schema::quote_ident(table);
        let qpkey = schema::quote_ident(&meta.pkey_name);

        let col_names: Vec<&str> = columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|c| fields.is_projected(c))
            .collect();
        let select_cols = col_names
            .iter()
            .map(|c| schema::quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let row_payload: Option<Payload> = if select_cols.is_empty() {
            None
        } else {
            self.conn
                .query_row(
                    &format!("SELECT {select_cols} FROM {qtable} WHERE {qpkey} = ?1"),
                    [&pk_value],
                    |r| {
                        let mut payload = Payload::new();
                        for (idx, name) in col_names.iter().enumerate() {
                            payload.insert(name.to_string(), sql_value_to_json(r.get_ref(idx)?));
                        }
                        Ok(payload)
                    },
                )
                .optional()?
        };

        let encrypted = match &row_payload {
            Some(p) => match self.transformer.encrypt(table, &row_id, p) {
                Ok(enc) => Some(enc),
                Err(e) => {
                    warn!(error = %e, table = %table, row_id = %row_id, "encrypt failed, marking row corrupted");
                    self.mark_corrupted(&ObjectKey::new(table, row_id), modified)?;
                    return self.load_next_pending(table);
                }
            },
            None => None,
        };

        Ok(Some(LocalData {
            cloud: CloudData {
                key: ObjectKey::new(table, row_id),
                data: encrypted,
                modified,
                version: None,
            },
            uploaded: None,
        }))
    }

    /// Apply an incoming remote write under last-writer-wins.
    #[tracing::instrument(skip(self, d), fields(table = %table, row_id = %d.key.row_id))]
    pub fn store_remote(&self, table: &str, d: &CloudData) -> Result<StoreResult, SyncError> {
        let meta = self.table_meta(table)?.ok_or(SyncError::State("table not registered"))?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(table));
        let pk_value = pkey_to_sql_value(&meta.pkey_type, &d.key.row_id)?;

        let existing: Option<(String, String)> = self
            .conn
            .query_row(
                &format!("SELECT tstamp, changed FROM {shadow} WHERE pkey = ?1"),
                [&pk_value],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((tstamp_text, changed_text)) = &existing {
            let local_tstamp = parse_ts(tstamp_text)?;
            if !crate::merge::remote_wins(local_tstamp, d.modified) {
                if changed_text != "Changed" {
                    self.conn.execute(
                        &format!("UPDATE {shadow} SET changed = 'Changed' WHERE pkey = ?1"),
                        [&pk_value],
                    )?;
                }
                debug!("rejecting stale remote write");
                return Ok(StoreResult::RejectedStale);
            }
        }

        if let Err(e) = self.apply_remote_write(table, &meta, d, &pk_value) {
            let _ = self.mark_corrupted(&d.key, d.modified);
            if e.classify() != ErrorKind::TransformFailure {
                warn!(error = %e, "store_remote failed, marking row corrupted");
                return Err(e);
            }
            warn!(error = %e, "decrypt failed, row marked corrupted");
        }

        self.advance_last_sync(table, d.modified)?;
        self.emit_changed(table);
        Ok(StoreResult::Applied)
    }

    fn apply_remote_write(
        &self,
        table: &str,
        meta: &TableMeta,
        d: &CloudData,
        pk_value: &SqlValue,
    ) -> Result<(), SyncError> {
        let decrypted = match &d.data {
            Some(payload) => Some(self.transformer.decrypt(table, &d.key.row_id, payload)?),
            None => None,
        };
        let fields = self.synced_fields(table)?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(table));
        let qtable = schema::quote_ident(table);
        let qpkey = schema::quote_ident(&meta.pkey_name);
        let tstamp = d.modified.to_rfc3339_opts(SecondsFormat::Millis, true);
        let pk_value = pk_value.clone();

        self.with_guarded_tx(|tx| {
            match &decrypted {
                None => {
                    tx.execute(&format!("DELETE FROM {qtable} WHERE {qpkey} = ?1"), [&pk_value])?;
                }
                Some(payload) => {
                    let projected = fields.project(payload);
                    if !projected.is_empty() {
                        let mut cols = vec![meta.pkey_name.clone()];
                        let mut placeholders = vec!["?1".to_string()];
                        let mut values: Vec<SqlValue> = vec![pk_value.clone()];
                        for (i, (col, val)) in projected.iter().enumerate() {
                            cols.push(col.clone());
                            placeholders.push(format!("?{}", i + 2));
                            values.push(json_to_sql_value(val));
                        }
                        let update_clause = projected
                            .keys()
                            .map(|c| format!("{} = excluded.{}", schema::quote_ident(c), schema::quote_ident(c)))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let col_list = cols
                            .iter()
                            .map(|c| schema::quote_ident(c))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let sql = format!(
                            "INSERT INTO {qtable} ({col_list}) VALUES ({})
                             ON CONFLICT({qpkey}) DO UPDATE SET {update_clause}",
                            placeholders.join(", ")
                        );
                        let params: Vec<&dyn rusqlite::ToSql> =
                            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                        tx.execute(&sql, params.as_slice())?;
                    }
                }
            }

            tx.execute(
                &format!(
                    "INSERT INTO {shadow}(pkey, tstamp, changed) VALUES (?1, ?2, 'Unchanged')
                     ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Unchanged'"
                ),
                params![pk_value, tstamp],
            )?;
            Ok(())
        })
    }

    fn advance_last_sync(&self, table: &str, modified: DateTime<Utc>) -> Result<(), SyncError> {
        let current = self.table_meta_last_sync(table)?;
        let next = match current {
            Some(c) if c >= modified => c,
            _ => modified,
        };
        self.conn.execute(
            &format!(
                "UPDATE {} SET last_sync = ?1 WHERE table_name = ?2",
                schema::META_TABLE
            ),
            params![next.to_rfc3339_opts(SecondsFormat::Millis, true), table],
        )?;
        Ok(())
    }

    /// Clear the Changed marker for a row once its upload is accepted,
    /// provided nothing has touched the row locally since.
    pub fn mark_uploaded(&self, key: &ObjectKey, accepted_modified: DateTime<Utc>) -> Result<(), SyncError> {
        let meta = self
            .table_meta(&key.table)?
            .ok_or(SyncError::State("table not registered"))?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(&key.table));
        let pk_value = pkey_to_sql_value(&meta.pkey_type, &key.row_id)?;

        let tstamp_text: Option<String> = self
            .conn
            .query_row(&format!("SELECT tstamp FROM {shadow} WHERE pkey = ?1"), [&pk_value], |r| r.get(0))
            .optional()?;
        let Some(tstamp_text) = tstamp_text else {
            return Ok(());
        };
        let tstamp = parse_ts(&tstamp_text)?;
        if tstamp == accepted_modified {
            self.conn.execute(
                &format!("UPDATE {shadow} SET changed = 'Unchanged' WHERE pkey = ?1"),
                [&pk_value],
            )?;
        }
        Ok(())
    }

    /// Mark a row Corrupted after its transform (encrypt/decrypt) failed.
    pub fn mark_corrupted(&self, key: &ObjectKey, tstamp: DateTime<Utc>) -> Result<(), SyncError> {
        let meta = self
            .table_meta(&key.table)?
            .ok_or(SyncError::State("table not registered"))?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(&key.table));
        let pk_value = pkey_to_sql_value(&meta.pkey_type, &key.row_id)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {shadow}(pkey, tstamp, changed) VALUES (?1, ?2, 'Corrupted')
                 ON CONFLICT(pkey) DO UPDATE SET changed = 'Corrupted'"
            ),
            params![pk_value, tstamp.to_rfc3339_opts(SecondsFormat::Millis, true)],
        )?;
        Ok(())
    }

    /// Apply the requested combination of resync flags to `table`.
    pub fn resync(&self, table: &str, flags: &HashSet<ResyncFlag>) -> Result<(), SyncError> {
        let meta = self.table_meta(table)?.ok_or(SyncError::State("table not registered"))?;
        let shadow = schema::quote_ident(&schema::shadow_table_name(table));

        if flags.contains(&ResyncFlag::Download) {
            self.conn.execute(
                &format!("UPDATE {} SET last_sync = NULL WHERE table_name = ?1", schema::META_TABLE),
                params![table],
            )?;
        }
        if flags.contains(&ResyncFlag::Upload) {
            let now = now_rfc3339();
            self.conn.execute(
                &format!("UPDATE {shadow} SET changed = 'Changed', tstamp = ?1"),
                params![now],
            )?;
        }
        if flags.contains(&ResyncFlag::CheckLocalData) {
            let qtable = schema::quote_ident(table);
            let qpkey = schema::quote_ident(&meta.pkey_name);
            let now = now_rfc3339();
            self.conn.execute(
                &format!(
                    "INSERT INTO {shadow}(pkey, tstamp, changed)
                     SELECT {qpkey}, ?1, 'Changed' FROM {qtable}
                     WHERE {qpkey} NOT IN (SELECT pkey FROM {shadow})"
                ),
                params![now],
            )?;
        }
        if flags.contains(&ResyncFlag::CleanLocalData) {
            self.conn.execute(
                &format!("UPDATE {shadow} SET changed = 'Changed' WHERE changed = 'Corrupted'"),
                [],
            )?;
        }
        if flags.contains(&ResyncFlag::ClearLocalData) {
            let qtable = schema::quote_ident(table);
            self.with_guarded_tx(|tx| {
                tx.execute(&format!("DELETE FROM {qtable}"), [])?;
                tx.execute(&format!("DELETE FROM {shadow}"), [])?;
                Ok(())
            })?;
        }
        self.emit_changed(table);
        Ok(())
    }

    /// The last successful download watermark for `table`.
    pub fn last_sync(&self, table: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.table_meta_last_sync(table)
    }

    pub fn table_state(&self, table: &str) -> Result<Option<TableState>, SyncError> {
        Ok(self.table_meta(table)?.map(|m| m.state))
    }

    /// Every ordinary user table in the database: everything in
    /// `sqlite_master` that isn't one of the engine's own reserved names.
    pub fn list_user_tables(&self) -> Result<Vec<String>, SyncError> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let names: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<Result<_, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| {
                n != schema::META_TABLE
                    && n != schema::FIELDS_TABLE
                    && n != schema::REFERENCES_TABLE
                    && n != schema::GUARD_TABLE
                    && !n.starts_with(schema::SHADOW_PREFIX)
            })
            .collect())
    }

    /// Tables already registered in meta, regardless of Active/Inactive.
    pub fn synced_tables(&self) -> Result<Vec<String>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT table_name FROM {}", schema::META_TABLE))?;
        let names = stmt.query_map([], |r| r.get(0))?.collect::<Result<_, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::IdentityTransformer;

    fn open_with_table() -> DatabaseWatcher {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE trips (key INTEGER PRIMARY KEY, value REAL);",
        )
        .unwrap();
        let (watcher, _rx) = DatabaseWatcher::new(conn, Box::new(IdentityTransformer)).unwrap();
        watcher
    }

    #[test]
    fn add_table_marks_existing_rows_changed_and_last_sync_null() {
        let watcher = open_with_table();
        watcher
            .conn
            .execute_batch("INSERT INTO trips(key, value) VALUES (0,0.0),(1,0.1);")
            .unwrap();
        watcher.add_table(&TableConfig::new("trips")).unwrap();

        assert_eq!(watcher.last_sync("trips").unwrap(), None);
        let pending_0 = watcher.load_next_pending("trips").unwrap().unwrap();
        assert_eq!(pending_0.cloud.key.row_id, "0");
    }

    #[test]
    fn rejects_composite_primary_key() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b INTEGER, PRIMARY KEY(a,b));")
            .unwrap();
        let (watcher, _rx) = DatabaseWatcher::new(conn, Box::new(IdentityTransformer)).unwrap();
        let err = watcher.add_table(&TableConfig::new("t")).unwrap_err();
        assert!(matches!(err, SyncError::Schema { .. }));
    }

    #[test]
    fn rejects_missing_table() {
        let conn = Connection::open_in_memory().unwrap();
        let (watcher, _rx) = DatabaseWatcher::new(conn, Box::new(IdentityTransformer)).unwrap();
        let err = watcher.add_table(&TableConfig::new("nope")).unwrap_err();
        assert!(matches!(err, SyncError::Schema { .. }));
    }

    #[test]
    fn trigger_marks_shadow_changed_on_insert() {
        let watcher = open_with_table();
        watcher.add_table(&TableConfig::new("trips")).unwrap();
        // Drain the implicit sync-needed signal from add_table.
        watcher
            .conn
            .execute("INSERT INTO trips(key, value) VALUES (42, 4.2)", [])
            .unwrap();
        let pending = watcher.load_next_pending("trips").unwrap();
        assert!(pending.is_some());
    }

    #[test]
    fn store_remote_tombstone_deletes_row() {
        let watcher = open_with_table();
        watcher
            .conn
            .execute("INSERT INTO trips(key, value) VALUES (2, 0.2)", [])
            .unwrap();
        watcher.add_table(&TableConfig::new("trips")).unwrap();

        let key = ObjectKey::new("trips", "2");
        let modified = Utc::now();
        let result = watcher
            .store_remote("trips", &CloudData::tombstone(key, modified))
            .unwrap();
        assert_eq!(result, StoreResult::Applied);

        let remaining: i64 = watcher
            .conn
            .query_row("SELECT COUNT(*) FROM trips WHERE key = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(watcher.last_sync("trips").unwrap(), Some(modified));
    }

    #[test]
    fn store_remote_rejects_stale_write() {
        let watcher = open_with_table();
        watcher.add_table(&TableConfig::new("trips")).unwrap();
        let key = ObjectKey::new("trips", "3");
        let newer = Utc::now();
        let older = newer - chrono::Duration::seconds(1);

        let mut payload = Payload::new();
        payload.insert("value".into(), serde_json::json!(0.3));
        watcher
            .store_remote(
                "trips",
                &CloudData {
                    key: key.clone(),
                    data: Some(payload.clone()),
                    modified: newer,
                    version: None,
                },
            )
            .unwrap();
        watcher.mark_uploaded(&key, newer).unwrap();

        let result = watcher
            .store_remote(
                "trips",
                &CloudData {
                    key: key.clone(),
                    data: Some(payload),
                    modified: older,
                    version: None,
                },
            )
            .unwrap();
        assert_eq!(result, StoreResult::RejectedStale);
        assert!(watcher.load_next_pending("trips").unwrap().is_some());
    }

    #[test]
    fn resync_clean_local_data_restores_corrupted_rows() {
        let watcher = open_with_table();
        watcher
            .conn
            .execute("INSERT INTO trips(key, value) VALUES (0, 0.0)", [])
            .unwrap();
        watcher.add_table(&TableConfig::new("trips")).unwrap();
        watcher.mark_uploaded(&ObjectKey::new("trips", "0"), Utc::now()).ok();
        watcher
            .mark_corrupted(&ObjectKey::new("trips", "0"), Utc::now())
            .unwrap();
        assert!(watcher.load_next_pending("trips").unwrap().is_none());

        let mut flags = HashSet::new();
        flags.insert(ResyncFlag::CleanLocalData);
        watcher.resync("trips", &flags).unwrap();

        assert!(watcher.load_next_pending("trips").unwrap().is_some());
    }
}
