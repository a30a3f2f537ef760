use anyhow::{Context, Result};
use csv::Writer;
use rusqlite::{Connection, OptionalExtension, params};
use std::{fs, path::Path};

use crate::{
    common::{ensure_parent_dir, now_unix_seconds, tmp_path_for},
    model::ResolvedRecord,
};

/// Resolved names keyed by policy number. Only successful lookups are stored.
pub struct PatientCache {
    conn: Connection,
}

impl PatientCache {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening cache DB {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory cache DB")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS patients (
                insurance_number TEXT PRIMARY KEY,
                surname TEXT NOT NULL,
                given_name TEXT NOT NULL,
                patronymic TEXT NOT NULL,
                fetched_at_unix INTEGER NOT NULL
            );
            ",
        )
        .context("Failed initializing patient cache schema")?;
        Ok(Self { conn })
    }

    pub fn upsert(&self, record: &ResolvedRecord) -> Result<()> {
        upsert_with(&self.conn, record)
    }

    pub fn upsert_many(&mut self, records: &[ResolvedRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting patient cache transaction")?;
        for record in records {
            upsert_with(&tx, record)?;
        }
        tx.commit()
            .context("Failed committing patient cache transaction")?;
        Ok(records.len())
    }

    pub fn contains(&self, insurance_number: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM patients WHERE insurance_number = ?1",
                [insurance_number],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed patient cache lookup for {insurance_number}"))?;
        Ok(found.is_some())
    }

    pub fn get(&self, insurance_number: &str) -> Result<Option<ResolvedRecord>> {
        self.conn
            .query_row(
                "
                SELECT insurance_number, surname, given_name, patronymic
                FROM patients WHERE insurance_number = ?1
                ",
                [insurance_number],
                read_record,
            )
            .optional()
            .with_context(|| format!("Failed patient cache lookup for {insurance_number}"))
    }

    pub fn all(&self) -> Result<Vec<ResolvedRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT insurance_number, surname, given_name, patronymic
                FROM patients ORDER BY insurance_number
                ",
            )
            .context("Failed preparing patient cache scan")?;
        let rows = stmt
            .query_map([], read_record)
            .context("Failed querying patient cache")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed reading patient cache row")?);
        }
        Ok(records)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM patients", [], |row| row.get(0))
            .context("Failed counting patient cache rows")?;
        Ok(count as usize)
    }

    pub fn clear(&self) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM patients", [])
            .context("Failed clearing patient cache")?;
        Ok(removed)
    }

    pub fn export_csv(&self, output_path: &Path) -> Result<usize> {
        ensure_parent_dir(output_path)?;
        let tmp_path = tmp_path_for(output_path, "patients_cache.csv");

        let mut writer = Writer::from_path(&tmp_path).with_context(|| {
            format!("Failed creating temp cache export {}", tmp_path.display())
        })?;
        writer
            .write_record([
                "insurance_number",
                "surname",
                "given_name",
                "patronymic",
                "fetched_at_unix",
            ])
            .context("Failed writing cache export header")?;

        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT insurance_number, surname, given_name, patronymic, fetched_at_unix
                FROM patients ORDER BY insurance_number
                ",
            )
            .context("Failed preparing cache export query")?;
        let mut rows = stmt.query([]).context("Failed querying cache export rows")?;
        let mut written = 0usize;
        while let Some(row) = rows.next().context("Failed iterating cache export rows")? {
            let insurance_number: String = row.get(0).context("Failed reading insurance_number")?;
            let surname: String = row.get(1).context("Failed reading surname")?;
            let given_name: String = row.get(2).context("Failed reading given_name")?;
            let patronymic: String = row.get(3).context("Failed reading patronymic")?;
            let fetched_at_unix: i64 = row.get(4).context("Failed reading fetched_at_unix")?;
            writer
                .write_record([
                    insurance_number,
                    surname,
                    given_name,
                    patronymic,
                    fetched_at_unix.to_string(),
                ])
                .context("Failed writing cache export row")?;
            written += 1;
        }
        writer
            .flush()
            .context("Failed flushing cache export writer")?;
        drop(writer);

        fs::rename(&tmp_path, output_path).with_context(|| {
            format!(
                "Failed moving temp cache export {} to {}",
                tmp_path.display(),
                output_path.display()
            )
        })?;
        Ok(written)
    }
}

fn upsert_with(conn: &Connection, record: &ResolvedRecord) -> Result<()> {
    conn.execute(
        "
        INSERT INTO patients (insurance_number, surname, given_name, patronymic, fetched_at_unix)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(insurance_number) DO UPDATE SET
            surname = excluded.surname,
            given_name = excluded.given_name,
            patronymic = excluded.patronymic,
            fetched_at_unix = excluded.fetched_at_unix
        ",
        params![
            record.insurance_number,
            record.surname,
            record.given_name,
            record.patronymic,
            now_unix_seconds()
        ],
    )
    .with_context(|| {
        format!(
            "Failed updating patient cache for {}",
            record.insurance_number
        )
    })?;
    Ok(())
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResolvedRecord> {
    Ok(ResolvedRecord {
        insurance_number: row.get(0)?,
        surname: row.get(1)?,
        given_name: row.get(2)?,
        patronymic: row.get(3)?,
    })
}
