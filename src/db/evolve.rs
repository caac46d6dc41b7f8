//! Fingerprint-chained schema evolution.
//!
//! A store is identified by a SHA-256 fingerprint of its structure. Known
//! fingerprints form a chain from the first released layout up to the current
//! one; `evolve` finds the store's position on the chain and applies the
//! remaining steps, each in its own transaction together with its ledger entry.

use chrono::Utc;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

use super::schema::{Step, BASE, CREATE_HISTORY, HISTORY_TABLE, SCHEMA, STEPS};
use crate::error::{Error, Result};

/// What `evolve` did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evolution {
    UpToDate,
    Created,
    Migrated { steps: usize },
}

#[derive(Debug, Clone)]
struct Link {
    step: Step,
    source: String,
    target: String,
}

/// The known layouts, with the fingerprint before and after every step.
#[derive(Debug, Clone)]
pub struct Chain {
    schema: &'static str,
    current: String,
    links: Vec<Link>,
}

impl Chain {
    /// Replays `base` and `steps` on a scratch in-memory store to derive the
    /// fingerprints, and checks that the chain ends at `schema`.
    pub fn build(base: &str, steps: &[Step], schema: &'static str) -> Result<Self> {
        let scratch = Connection::open_in_memory()?;
        scratch.execute_batch(base)?;
        let mut source = fingerprint(&scratch)?;

        let mut links = Vec::with_capacity(steps.len());
        for step in steps {
            scratch.execute_batch(step.sql)?;
            let target = fingerprint(&scratch)?;
            links.push(Link {
                step: *step,
                source: std::mem::replace(&mut source, target.clone()),
                target,
            });
        }

        let fresh = Connection::open_in_memory()?;
        fresh.execute_batch(schema)?;
        let current = fingerprint(&fresh)?;

        if source != current {
            return Err(Error::SchemaIncompatible(format!(
                "migration chain ends at {} but the current structure is {}",
                short(&source),
                short(&current)
            )));
        }

        Ok(Self {
            schema,
            current,
            links,
        })
    }

    /// The chain this build ships with.
    pub fn shipped() -> Result<Self> {
        Self::build(BASE, STEPS, SCHEMA)
    }

    pub fn current(&self) -> &str {
        &self.current
    }
}

/// Brings the store up to the current structure. `file` is the database file
/// backing `conn`; when set, a copy is written next to it before any step runs.
pub fn evolve(conn: &mut Connection, file: Option<&Path>) -> Result<Evolution> {
    evolve_with(conn, &Chain::shipped()?, file)
}

pub fn evolve_with(conn: &mut Connection, chain: &Chain, file: Option<&Path>) -> Result<Evolution> {
    conn.execute_batch(CREATE_HISTORY)?;

    let live = fingerprint(conn)?;
    let recorded = last_recorded(conn)?;

    if let Some(recorded) = &recorded {
        if *recorded != live {
            return Err(Error::SchemaIncompatible(format!(
                "ledger records structure {} but the store has {}",
                short(recorded),
                short(&live)
            )));
        }
    }

    if live == chain.current {
        if recorded.is_none() {
            record(conn, &live)?;
        }
        return Ok(Evolution::UpToDate);
    }

    if is_empty(conn)? {
        let tx = conn.transaction()?;
        tx.execute_batch(chain.schema)?;
        let created = fingerprint(&tx)?;
        if created != chain.current {
            return Err(Error::SchemaIncompatible(format!(
                "new store has structure {}, expected {}",
                short(&created),
                short(&chain.current)
            )));
        }
        record(&tx, &created)?;
        tx.commit()?;
        info!(digest = %short(&created), "Created store");
        return Ok(Evolution::Created);
    }

    let start = chain
        .links
        .iter()
        .position(|link| link.source == live)
        .ok_or_else(|| {
            Error::SchemaIncompatible(format!(
                "unrecognised store structure {} (written by a newer build?)",
                short(&live)
            ))
        })?;

    if let Some(file) = file {
        backup(conn, file)?;
    }

    let pending = &chain.links[start..];
    for link in pending {
        let tx = conn.transaction()?;
        tx.execute_batch(link.step.sql)?;
        let got = fingerprint(&tx)?;
        if got != link.target {
            return Err(Error::SchemaIncompatible(format!(
                "step '{}' produced {} instead of {}",
                link.step.name,
                short(&got),
                short(&link.target)
            )));
        }
        record(&tx, &got)?;
        tx.commit()?;
        info!(step = link.step.name, digest = %short(&got), "Applied schema step");
    }

    Ok(Evolution::Migrated {
        steps: pending.len(),
    })
}

/// SHA-256 over a canonical description of every user table (columns in
/// declaration order, indexes sorted by name), view and trigger.
pub fn fingerprint(conn: &Connection) -> Result<String> {
    let mut objects = conn.prepare(
        r#"
        SELECT type, name, sql FROM sqlite_master
        WHERE type IN ('table', 'view', 'trigger')
          AND name NOT LIKE 'sqlite_%'
          AND name != ?1
        ORDER BY type, name
        "#,
    )?;
    let objects = objects
        .query_map([HISTORY_TABLE], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut canon = String::new();
    for (kind, name, sql) in objects {
        if kind != "table" {
            let sql = sql.unwrap_or_default();
            let sql = sql.split_whitespace().collect::<Vec<_>>().join(" ");
            let _ = writeln!(canon, "{kind} {name} {sql}");
            continue;
        }

        let _ = writeln!(canon, "table {name}");
        let mut columns = conn.prepare(
            r#"SELECT cid, name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )?;
        let mut rows = columns.query([&name])?;
        while let Some(row) = rows.next()? {
            let _ = writeln!(
                canon,
                "  column {} {} {} notnull={} default={} pk={}",
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                row.get::<_, i64>(5)?,
            );
        }

        let mut indexes = conn.prepare(
            r#"SELECT name, "unique", origin FROM pragma_index_list(?1) ORDER BY name"#,
        )?;
        let indexes = indexes
            .query_map([&name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (index, unique, origin) in indexes {
            let mut info = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
            let columns = info
                .query_map([&index], |row| row.get::<_, Option<String>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(canon, "  index {index} unique={unique} origin={origin} ({columns})");
        }
    }

    Ok(format!("{:x}", Sha256::digest(canon.as_bytes())))
}

fn is_empty(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM sqlite_master
        WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' AND name != ?1
        "#,
        [HISTORY_TABLE],
        |row| row.get(0),
    )?;
    Ok(count == 0)
}

fn last_recorded(conn: &Connection) -> Result<Option<String>> {
    let digest = conn.query_row(
        "SELECT digest FROM _schema_history ORDER BY id DESC LIMIT 1",
        [],
        |row| row.get(0),
    );
    match digest {
        Ok(digest) => Ok(Some(digest)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn record(conn: &Connection, digest: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO _schema_history (applied_at, digest) VALUES (?1, ?2)",
        rusqlite::params![Utc::now(), digest],
    )?;
    Ok(())
}

/// Copies the database to `<file>.<timestamp>.bak` before it is modified.
fn backup(conn: &Connection, file: &Path) -> Result<()> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let target = file.with_file_name(format!("{name}.{stamp}.bak"));

    if target.exists() {
        warn!(path = %target.display(), "Backup already exists, keeping it");
        return Ok(());
    }

    conn.execute("VACUUM INTO ?1", [target.to_string_lossy().to_string()])?;
    info!(path = %target.display(), "Backed up store before migrating");
    Ok(())
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}
