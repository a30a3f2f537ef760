use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, Writer};
use std::{collections::HashSet, fs, path::Path};

use crate::{
    cache::PatientCache,
    common::ensure_parent_dir,
    constants::{GIVEN_NAME_HEADER, IMPORT_INSURANCE_HEADER, PATRONYMIC_HEADER, SURNAME_HEADER},
    model::ResolvedRecord,
    patients_file::sniff_delimiter,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Complete rows in the input file.
    pub found: usize,
    pub added: usize,
    /// Cache size after the import.
    pub total: usize,
}

pub fn read_import_file(path: &Path) -> Result<Vec<ResolvedRecord>> {
    let raw =
        fs::read(path).with_context(|| format!("Failed reading import file {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
        .delimiter(sniff_delimiter(&raw))
        .flexible(true)
        .from_reader(raw.as_slice());
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("Failed reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();

    let column = |name: &str| -> Result<usize> {
        match headers.iter().position(|h| *h == name.to_lowercase()) {
            Some(index) => Ok(index),
            None => bail!("Column \"{name}\" not found in {}", path.display()),
        }
    };
    let insurance = column(IMPORT_INSURANCE_HEADER)?;
    let surname = column(SURNAME_HEADER)?;
    let given_name = column(GIVEN_NAME_HEADER)?;
    let patronymic = column(PATRONYMIC_HEADER)?;

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row
            .with_context(|| format!("Failed reading row {} of {}", line + 2, path.display()))?;
        let cell = |index: usize| row.get(index).unwrap_or_default().trim();
        if cell(insurance).is_empty() || cell(surname).is_empty() || cell(given_name).is_empty() {
            continue;
        }
        records.push(ResolvedRecord::new(
            cell(insurance),
            cell(surname),
            cell(given_name),
            cell(patronymic),
        ));
    }
    Ok(records)
}

/// Adds names the cache does not know yet; existing entries are left alone.
pub fn import_names(cache: &mut PatientCache, path: &Path) -> Result<ImportReport> {
    let records = read_import_file(path)?;
    let found = records.len();

    let mut seen = HashSet::new();
    let mut fresh = Vec::new();
    for record in records {
        if !seen.insert(record.insurance_number.clone()) {
            continue;
        }
        if cache.contains(&record.insurance_number)? {
            continue;
        }
        fresh.push(record);
    }
    let added = cache.upsert_many(&fresh)?;
    let total = cache.len()?;
    println!("Import: found {found}, added {added}, cache now holds {total}.");
    Ok(ImportReport {
        found,
        added,
        total,
    })
}

pub fn write_import_example(path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut writer = Writer::from_path(path)
        .with_context(|| format!("Failed creating import example {}", path.display()))?;
    writer
        .write_record([
            IMPORT_INSURANCE_HEADER,
            SURNAME_HEADER,
            GIVEN_NAME_HEADER,
            PATRONYMIC_HEADER,
        ])
        .context("Failed writing import example header")?;
    for row in [
        ["2752930829000110", "Гаас", "Елена", "Николаевна"],
        ["2748540839000021", "Сатлыкова", "Наталья", ""],
    ] {
        writer
            .write_record(row)
            .context("Failed writing import example row")?;
    }
    writer
        .flush()
        .context("Failed flushing import example writer")?;
    println!("Wrote import example to {}.", path.display());
    Ok(())
}
