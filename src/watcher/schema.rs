//! SQL text for the engine-owned schema, installed on first use, and the
//! per-table shadow table / trigger set.

/// Engine-reserved table name prefixes. These must never collide with a
/// user table.
pub const META_TABLE: &str = "_se_meta";
pub const FIELDS_TABLE: &str = "_se_fields";
pub const REFERENCES_TABLE: &str = "_se_references";
pub const GUARD_TABLE: &str = "_se_write_guard";
pub const SHADOW_PREFIX: &str = "_se_shadow_";
pub const TRIGGER_PREFIX: &str = "_se_trg_";

/// Quote a SQL identifier, doubling embedded quotes, so table/column names
/// supplied by the host application never need to be "safe" SQL fragments.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn shadow_table_name(table: &str) -> String {
    format!("{SHADOW_PREFIX}{table}")
}

fn trigger_name(table: &str, suffix: &str) -> String {
    format!("{TRIGGER_PREFIX}{table}_{suffix}")
}

/// The three engine-owned bookkeeping tables plus the write guard used to
/// make triggers inert during engine-driven writes.
pub fn engine_schema_sql() -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {meta} (
    table_name TEXT PRIMARY KEY,
    pkey_name TEXT NOT NULL,
    pkey_type TEXT NOT NULL,
    state TEXT NOT NULL CHECK(state IN ('Active','Inactive')),
    last_sync TEXT
);

CREATE TABLE IF NOT EXISTS {fields} (
    table_name TEXT NOT NULL,
    column TEXT NOT NULL,
    PRIMARY KEY (table_name, column)
);

CREATE TABLE IF NOT EXISTS {refs} (
    table_name TEXT NOT NULL,
    fk_table TEXT NOT NULL,
    fk_col TEXT NOT NULL,
    PRIMARY KEY (table_name, fk_table, fk_col)
);

-- Transient marker: while a row exists here, per-table triggers are inert.
-- Engine-driven writes insert/delete this row around their own mutations;
-- never touched by application code.
CREATE TABLE IF NOT EXISTS {guard} (
    active INTEGER NOT NULL
);
"#,
        meta = META_TABLE,
        fields = FIELDS_TABLE,
        refs = REFERENCES_TABLE,
        guard = GUARD_TABLE,
    )
}

/// Shadow table + INSERT/UPDATE/DELETE triggers for one synced table.
///
/// A primary-key change and an ordinary field change could in principle
/// be tracked by separate triggers, but SQLite's `AFTER UPDATE` already
/// fires for any column change (including the primary key, which appears
/// as `NEW.<pkey>`), so a single trigger covers both without loss of
/// fidelity.
pub fn table_schema_sql(table: &str, pkey_name: &str, pkey_type: &str) -> String {
    let shadow = quote_ident(&shadow_table_name(table));
    let qtable = quote_ident(table);
    let qpkey = quote_ident(pkey_name);
    let ins_trg = quote_ident(&trigger_name(table, "ins"));
    let upd_trg = quote_ident(&trigger_name(table, "upd"));
    let del_trg = quote_ident(&trigger_name(table, "del"));
    let guard = quote_ident(GUARD_TABLE);

    format!(
        r#"
CREATE TABLE IF NOT EXISTS {shadow} (
    pkey {pkey_type} PRIMARY KEY,
    tstamp TEXT NOT NULL,
    changed TEXT NOT NULL DEFAULT 'Changed'
);

CREATE TRIGGER IF NOT EXISTS {ins_trg}
AFTER INSERT ON {qtable}
WHEN NOT EXISTS (SELECT 1 FROM {guard})
BEGIN
    INSERT INTO {shadow}(pkey, tstamp, changed)
    VALUES (NEW.{qpkey}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), 'Changed')
    ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Changed';
END;

CREATE TRIGGER IF NOT EXISTS {upd_trg}
AFTER UPDATE ON {qtable}
WHEN NOT EXISTS (SELECT 1 FROM {guard})
BEGIN
    INSERT INTO {shadow}(pkey, tstamp, changed)
    VALUES (NEW.{qpkey}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), 'Changed')
    ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Changed';
END;

CREATE TRIGGER IF NOT EXISTS {del_trg}
AFTER DELETE ON {qtable}
WHEN NOT EXISTS (SELECT 1 FROM {guard})
BEGIN
    INSERT INTO {shadow}(pkey, tstamp, changed)
    VALUES (OLD.{qpkey}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), 'Changed')
    ON CONFLICT(pkey) DO UPDATE SET tstamp = excluded.tstamp, changed = 'Changed';
END;
"#,
        shadow = shadow,
        pkey_type = pkey_type,
        ins_trg = ins_trg,
        qtable = qtable,
        guard = guard,
        qpkey = qpkey,
        upd_trg = upd_trg,
        del_trg = del_trg,
    )
}

pub fn drop_table_schema_sql(table: &str) -> String {
    let shadow = quote_ident(&shadow_table_name(table));
    let ins_trg = quote_ident(&trigger_name(table, "ins"));
    let upd_trg = quote_ident(&trigger_name(table, "upd"));
    let del_trg = quote_ident(&trigger_name(table, "del"));
    format!(
        r#"
DROP TRIGGER IF EXISTS {ins_trg};
DROP TRIGGER IF EXISTS {upd_trg};
DROP TRIGGER IF EXISTS {del_trg};
DROP TABLE IF EXISTS {shadow};
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn shadow_table_name_uses_stable_prefix() {
        assert_eq!(shadow_table_name("trips"), "_se_shadow_trips");
    }
}
