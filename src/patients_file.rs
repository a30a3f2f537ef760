use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::{Mutex, PoisonError},
};

use crate::{
    common::{ensure_parent_dir, tmp_path_for},
    constants::{
        GIVEN_NAME_HEADER, INITIALS_HEADER, INSURANCE_HEADER, PATRONYMIC_HEADER, SURNAME_HEADER,
    },
    legacy_export::RawTable,
    merge::{PatientTable, RowId},
    model::{LookupKey, ResolvedRecord},
};

/// Alternative header for a column, e.g. `ENP` exported as `Полис`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnAlias {
    pub name: String,
    pub alt_name: String,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
    insurance: usize,
    initials: usize,
    surname: usize,
    given_name: usize,
    patronymic: usize,
}

/// Attached-patients table kept as CSV, one lock per row.
pub struct PatientsFile {
    headers: Vec<String>,
    rows: Vec<Mutex<Vec<String>>>,
    columns: Columns,
    delimiter: u8,
}

impl PatientsFile {
    pub fn open(path: &Path, aliases: &[ColumnAlias]) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("Failed reading patients file {}", path.display()))?;
        let delimiter = sniff_delimiter(&raw);
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(raw.as_slice());

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed reading header of {}", path.display()))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("Failed reading row {} of {}", line + 2, path.display())
            })?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        let mut file = Self::from_rows(headers, rows, aliases)
            .with_context(|| format!("Invalid patients file {}", path.display()))?;
        file.delimiter = delimiter;
        Ok(file)
    }

    pub fn from_table(table: RawTable, aliases: &[ColumnAlias]) -> Result<Self> {
        Self::from_rows(table.headers, table.rows, aliases)
    }

    pub fn from_rows(
        mut headers: Vec<String>,
        mut rows: Vec<Vec<String>>,
        aliases: &[ColumnAlias],
    ) -> Result<Self> {
        for row in &mut rows {
            row.resize(headers.len(), String::new());
        }

        if find_column(&headers, INSURANCE_HEADER, aliases).is_none() {
            bail!("Insurance number column \"{INSURANCE_HEADER}\" not found");
        }
        let Some(initials) = find_column(&headers, INITIALS_HEADER, aliases) else {
            bail!("Initials column \"{INITIALS_HEADER}\" not found");
        };

        // Missing name columns go right after the initials, in surname/name/patronymic order.
        let mut anchor = initials;
        for header in [SURNAME_HEADER, GIVEN_NAME_HEADER, PATRONYMIC_HEADER] {
            anchor = match find_column(&headers, header, aliases) {
                Some(index) => index,
                None => {
                    let at = anchor + 1;
                    headers.insert(at, header.to_string());
                    for row in &mut rows {
                        row.insert(at, String::new());
                    }
                    at
                }
            };
        }

        let column = |name: &str| {
            find_column(&headers, name, aliases)
                .with_context(|| format!("Column \"{name}\" vanished while fixing structure"))
        };
        let columns = Columns {
            insurance: column(INSURANCE_HEADER)?,
            initials: column(INITIALS_HEADER)?,
            surname: column(SURNAME_HEADER)?,
            given_name: column(GIVEN_NAME_HEADER)?,
            patronymic: column(PATRONYMIC_HEADER)?,
        };

        Ok(Self {
            headers,
            rows: rows.into_iter().map(Mutex::new).collect(),
            columns,
            delimiter: b',',
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, row: RowId) -> Option<Vec<String>> {
        self.rows
            .get(row)
            .map(|r| r.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Keys still awaiting a name, one per policy number, at most `limit`.
    pub fn unknown_keys(&self, limit: usize) -> Vec<LookupKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for row in self.rows_missing_names() {
            if keys.len() >= limit {
                break;
            }
            if let Some(key) = self.read_key(row) {
                if seen.insert(key.insurance_number.clone()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub fn count_missing_names(&self) -> usize {
        self.rows_missing_names().len()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        ensure_parent_dir(path)?;
        let tmp_path = tmp_path_for(path, "patients.csv");
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&tmp_path)
            .with_context(|| format!("Failed creating temp patients file {}", tmp_path.display()))?;
        writer
            .write_record(&self.headers)
            .context("Failed writing patients file header")?;
        for row in &self.rows {
            let row = row.lock().unwrap_or_else(PoisonError::into_inner);
            writer
                .write_record(row.iter())
                .context("Failed writing patients file row")?;
        }
        writer
            .flush()
            .context("Failed flushing patients file writer")?;
        drop(writer);

        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed moving temp patients file {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    fn is_unnamed(&self, row: &[String]) -> bool {
        let c = self.columns;
        !row[c.insurance].trim().is_empty()
            && !row[c.initials].trim().is_empty()
            && row[c.surname].trim().is_empty()
    }
}

impl PatientTable for PatientsFile {
    fn rows_missing_names(&self) -> Vec<RowId> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| self.is_unnamed(&row.lock().unwrap_or_else(PoisonError::into_inner)))
            .map(|(index, _)| index)
            .collect()
    }

    fn read_key(&self, row: RowId) -> Option<LookupKey> {
        let row = self.rows.get(row)?.lock().unwrap_or_else(PoisonError::into_inner);
        let insurance = row[self.columns.insurance].trim();
        let initials = row[self.columns.initials].trim();
        if insurance.is_empty() || initials.is_empty() {
            return None;
        }
        Some(LookupKey::new(insurance, initials))
    }

    fn write_name_fields(&self, row: RowId, record: &ResolvedRecord) -> bool {
        let Some(row) = self.rows.get(row) else {
            return false;
        };
        let mut row = row.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_unnamed(&row) {
            return false;
        }
        row[self.columns.surname] = record.surname.clone();
        row[self.columns.given_name] = record.given_name.clone();
        row[self.columns.patronymic] = record.patronymic.clone();
        true
    }
}

fn find_column(headers: &[String], name: &str, aliases: &[ColumnAlias]) -> Option<usize> {
    let mut candidates = vec![name.to_string()];
    for alias in aliases {
        if alias.name.eq_ignore_ascii_case(name) || alias.alt_name.eq_ignore_ascii_case(name) {
            candidates.push(alias.name.clone());
            candidates.push(alias.alt_name.clone());
        }
    }
    headers.iter().position(|header| {
        candidates
            .iter()
            .any(|candidate| header.trim().to_lowercase() == candidate.trim().to_lowercase())
    })
}

/// Picks `;`, tab or `,` by frequency on the header line.
pub(crate) fn sniff_delimiter(raw: &[u8]) -> u8 {
    let header = raw.split(|b| *b == b'\n').next().unwrap_or_default();
    [b';', b'\t', b',']
        .into_iter()
        .max_by_key(|d| header.iter().filter(|b| *b == d).count())
        .filter(|d| header.contains(d))
        .unwrap_or(b',')
}
