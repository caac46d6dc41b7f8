//! Store structure: the current layout plus the history of layouts that older
//! builds created, expressed as a base and an ordered list of steps.
//!
//! Replaying `BASE` followed by every entry of `STEPS` must yield exactly the
//! structure created by `SCHEMA`; `evolve` checks this before touching a store.

/// Current layout, applied in one go to brand new stores.
pub const SCHEMA: &str = r#"
-- One row per indexed file
CREATE TABLE media_items (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    mtime TEXT NOT NULL,
    description TEXT,
    processed_at TEXT,
    attempted_at TEXT,   -- set when description failed or the file was missing
    backend TEXT,
    model TEXT,
    width INTEGER,
    height INTEGER
);

-- One row per (item, embedding model)
CREATE TABLE embeddings (
    id INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL,
    vector BLOB NOT NULL,  -- big-endian f32, no header
    created_at TEXT NOT NULL,
    model TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX idx_embeddings_item_model ON embeddings(item_id, model);
CREATE INDEX idx_embeddings_model_id ON embeddings(model, id);
"#;

/// Layout written by the first release.
pub const BASE: &str = r#"
CREATE TABLE migrations (
    name TEXT PRIMARY KEY
);

CREATE TABLE media_items (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    mtime TEXT NOT NULL,
    description TEXT,
    processed_at TEXT,
    attempted_at TEXT
);
"#;

/// A structural change from one released layout to the next.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const STEPS: &[Step] = &[
    Step {
        name: "drop legacy migrations table",
        sql: "DROP TABLE IF EXISTS migrations;",
    },
    Step {
        name: "record describing backend",
        sql: "ALTER TABLE media_items ADD COLUMN backend TEXT;",
    },
    Step {
        name: "create embeddings",
        sql: r#"
        CREATE TABLE embeddings (
            id INTEGER PRIMARY KEY,
            item_id INTEGER NOT NULL,
            vector BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    },
    Step {
        name: "key embeddings by model",
        sql: r#"
        ALTER TABLE media_items ADD COLUMN model TEXT;
        ALTER TABLE embeddings ADD COLUMN model TEXT NOT NULL DEFAULT '';
        CREATE UNIQUE INDEX idx_embeddings_item_model ON embeddings(item_id, model);
        CREATE INDEX idx_embeddings_model_id ON embeddings(model, id);
        "#,
    },
    Step {
        name: "store pixel dimensions",
        sql: r#"
        ALTER TABLE media_items ADD COLUMN width INTEGER;
        ALTER TABLE media_items ADD COLUMN height INTEGER;
        "#,
    },
];

/// Ledger of applied layouts. Excluded from fingerprints.
pub const HISTORY_TABLE: &str = "_schema_history";

pub const CREATE_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS _schema_history (
    id INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    digest TEXT NOT NULL
);
"#;
