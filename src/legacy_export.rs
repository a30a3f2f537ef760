use anyhow::{Context, Result, bail};
use std::io::{Cursor, Read};

/// Header plus string cells, the shape the patients table is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

pub trait LegacyExportConverter {
    fn convert(&self, bytes: &[u8]) -> Result<RawTable>;
}

/// The registry export ships one file inside a zip archive.
pub fn extract_first_entry(zip_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(zip_bytes)).context("Failed reading export archive")?;
    if archive.is_empty() {
        bail!("Export archive is empty");
    }
    let mut entry = archive
        .by_index(0)
        .context("Failed opening first export archive entry")?;
    let mut out = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut out)
        .with_context(|| format!("Failed extracting {}", entry.name()))?;
    Ok(out)
}

const HEADER_TERMINATOR: u8 = 0x0D;
const DESCRIPTOR_LEN: usize = 32;

#[derive(Debug, Clone)]
struct FieldDescriptor {
    name: String,
    kind: u8,
    length: usize,
}

/// dBase III reader for the registry export; text fields are code page 866.
pub struct DbfConverter;

impl LegacyExportConverter for DbfConverter {
    fn convert(&self, bytes: &[u8]) -> Result<RawTable> {
        if bytes.len() < DESCRIPTOR_LEN {
            bail!("dBase file is too short ({} bytes)", bytes.len());
        }
        let record_count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        let record_len = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;
        if header_len <= DESCRIPTOR_LEN || header_len > bytes.len() || record_len == 0 {
            bail!("dBase header is corrupt (header {header_len}, record {record_len})");
        }
        let data_end = record_count
            .checked_mul(record_len)
            .and_then(|len| len.checked_add(header_len));
        if data_end.is_none_or(|end| end > bytes.len()) {
            bail!(
                "dBase file declares {record_count} records of {record_len} bytes but has {} bytes",
                bytes.len()
            );
        }

        let fields = read_descriptors(&bytes[DESCRIPTOR_LEN..header_len])?;
        let declared: usize = 1 + fields.iter().map(|f| f.length).sum::<usize>();
        if declared > record_len {
            bail!("dBase fields need {declared} bytes but records are {record_len}");
        }

        let mut rows = Vec::with_capacity(record_count);
        for index in 0..record_count {
            let start = header_len + index * record_len;
            let Some(record) = bytes.get(start..start + record_len) else {
                bail!("dBase file ends inside record {index} of {record_count}");
            };
            if record[0] == b'*' {
                continue;
            }
            let mut offset = 1;
            let mut row = Vec::with_capacity(fields.len());
            for field in &fields {
                let raw = &record[offset..offset + field.length];
                row.push(render_field(field, raw));
                offset += field.length;
            }
            rows.push(row);
        }

        Ok(RawTable {
            headers: fields.into_iter().map(|f| f.name).collect(),
            rows,
        })
    }
}

fn read_descriptors(area: &[u8]) -> Result<Vec<FieldDescriptor>> {
    let mut fields = Vec::new();
    for chunk in area.chunks(DESCRIPTOR_LEN) {
        if chunk[0] == HEADER_TERMINATOR {
            break;
        }
        if chunk.len() < DESCRIPTOR_LEN {
            bail!("Truncated dBase field descriptor");
        }
        let name_end = chunk[..11].iter().position(|b| *b == 0).unwrap_or(11);
        fields.push(FieldDescriptor {
            name: decode_cp866(&chunk[..name_end]).trim().to_string(),
            kind: chunk[11],
            length: chunk[16] as usize,
        });
    }
    if fields.is_empty() {
        bail!("dBase file declares no fields");
    }
    Ok(fields)
}

fn render_field(field: &FieldDescriptor, raw: &[u8]) -> String {
    match field.kind {
        b'D' => {
            let text = decode_cp866(raw);
            let text = text.trim();
            if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
                format!("{}.{}.{}", &text[6..8], &text[4..6], &text[..4])
            } else {
                String::new()
            }
        }
        b'L' => match raw.first().copied().unwrap_or(b'?') {
            b'T' | b't' | b'Y' | b'y' => "true".to_string(),
            b'F' | b'f' | b'N' | b'n' => "false".to_string(),
            _ => String::new(),
        },
        _ => decode_cp866(raw).trim().to_string(),
    }
}

/// 0xB0..=0xDF: shading and box-drawing characters.
const CP866_BOX: [char; 48] = [
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐',
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧',
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀',
];

const CP866_HIGH: [char; 16] = [
    'Ё', 'ё', 'Є', 'є', 'Ї', 'ї', 'Ў', 'ў', '°', '∙', '·', '√', '№', '¤', '■', '\u{a0}',
];

pub fn decode_cp866(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x00..=0x7F => b as char,
            0x80..=0xAF => char::from_u32(0x0410 + (b - 0x80) as u32).unwrap_or('\u{fffd}'),
            0xB0..=0xDF => CP866_BOX[(b - 0xB0) as usize],
            0xE0..=0xEF => char::from_u32(0x0440 + (b - 0xE0) as u32).unwrap_or('\u{fffd}'),
            0xF0..=0xFF => CP866_HIGH[(b - 0xF0) as usize],
        })
        .collect()
}
