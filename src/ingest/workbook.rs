//! Minimal `.xlsx` reader and sheet remover.
//!
//! An xlsx file is a zip of XML parts. Only what claim ingestion needs is
//! read: the sheet list, shared strings and cell values. Removing a sheet
//! rewrites the parts that reference it, rebuilds the shared string table
//! from the sheets that remain and copies every other entry unchanged.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const ROOT_RELS_PART: &str = "_rels/.rels";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

/// Rows rendered per sheet in an admin preview
const MAX_PREVIEW_ROWS: usize = 500;

/// Decompressed size cap for a single XML part
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WorkbookError {
    #[error("Not a valid xlsx file: {0}")]
    Zip(#[from] ZipError),

    #[error("Failed to read workbook: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed workbook XML in {part}: {message}")]
    Xml { part: String, message: String },

    #[error("Workbook part {0} is missing")]
    MissingPart(String),

    #[error("Workbook part {part} expands beyond {limit} bytes")]
    PartTooLarge { part: String, limit: u64 },

    #[error("Sheet index {0} out of range")]
    NoSuchSheet(usize),

    #[error("Workbook must keep at least one sheet besides \"{0}\"")]
    LastSheet(String),
}

type Result<T> = std::result::Result<T, WorkbookError>;

fn xml_error(part: &str, message: impl ToString) -> WorkbookError {
    WorkbookError::Xml {
        part: part.to_string(),
        message: message.to_string(),
    }
}

/// Value of a single cell as stored in the file
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    /// Numeric cell, kept as the stored text so no precision is lost
    Number(String),
    Bool(bool),
    Error(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) | CellValue::Number(s) | CellValue::Error(s) => s.clone(),
            CellValue::Bool(true) => "TRUE".to_string(),
            CellValue::Bool(false) => "FALSE".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    /// Zero-based column
    pub column: u32,
    pub value: CellValue,
}

#[derive(Debug, Clone)]
pub struct SheetRow {
    /// Zero-based row
    pub index: u32,
    pub cells: Vec<Cell>,
}

impl SheetRow {
    pub fn get(&self, column: u32) -> &CellValue {
        self.cells
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.value)
            .unwrap_or(&CellValue::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<SheetRow>,
}

impl Sheet {
    /// Name/value pairs from columns A and B, skipping rows without a name
    pub fn key_values(&self) -> Vec<(String, CellValue)> {
        self.rows
            .iter()
            .filter(|row| !row.get(0).is_empty())
            .map(|row| (row.get(0).display(), row.get(1).clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetPreview {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
struct SheetEntry {
    name: String,
    rel_id: String,
    /// Zip path of the worksheet part
    path: String,
}

/// A parsed workbook over borrowed file bytes.
pub struct Workbook<'a> {
    data: &'a [u8],
    sheets: Vec<SheetEntry>,
    shared_path: String,
    shared_strings: Vec<String>,
    date1904: bool,
}

impl<'a> Workbook<'a> {
    pub fn open(data: &'a [u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(data))?;

        let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_PART.to_string()))?;
        let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_RELS_PART.to_string()))?;

        let relationships = parse_relationships(&rels_xml, WORKBOOK_RELS_PART)?;
        let (declared, date1904) = parse_workbook(&workbook_xml)?;

        let mut sheets = Vec::with_capacity(declared.len());
        for (name, rel_id) in declared {
            let rel = relationships
                .iter()
                .find(|r| r.id == rel_id)
                .ok_or_else(|| xml_error(WORKBOOK_RELS_PART, format!("no relationship {}", rel_id)))?;
            sheets.push(SheetEntry {
                name,
                rel_id,
                path: resolve_target("xl", &rel.target),
            });
        }

        let shared_path = relationships
            .iter()
            .find(|r| r.kind.ends_with("/sharedStrings"))
            .map(|r| resolve_target("xl", &r.target))
            .unwrap_or_else(|| "xl/sharedStrings.xml".to_string());
        let shared_strings = match read_part(&mut archive, &shared_path)? {
            Some(xml) => parse_shared_strings(&xml, &shared_path)?,
            None => Vec::new(),
        };

        Ok(Self {
            data,
            sheets,
            shared_path,
            shared_strings,
            date1904,
        })
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Serial dates count from 1904-01-01 instead of 1900
    pub fn date1904(&self) -> bool {
        self.date1904
    }

    pub fn position(&self, predicate: impl Fn(&str) -> bool) -> Option<usize> {
        self.sheets.iter().position(|s| predicate(&s.name))
    }

    pub fn read_sheet(&self, index: usize) -> Result<Sheet> {
        let entry = self.sheets.get(index).ok_or(WorkbookError::NoSuchSheet(index))?;
        let mut archive = ZipArchive::new(Cursor::new(self.data))?;
        let xml = read_part(&mut archive, &entry.path)?
            .ok_or_else(|| WorkbookError::MissingPart(entry.path.clone()))?;

        Ok(Sheet {
            name: entry.name.clone(),
            rows: parse_sheet(&xml, &entry.path, &self.shared_strings)?,
        })
    }

    /// Every sheet as rows of display strings
    pub fn preview(&self) -> Result<Vec<SheetPreview>> {
        (0..self.sheets.len())
            .map(|index| {
                let sheet = self.read_sheet(index)?;
                Ok(SheetPreview {
                    name: sheet.name,
                    rows: dense_rows(&sheet.rows),
                })
            })
            .collect()
    }

    /// Re-serialize the workbook without one sheet.
    ///
    /// Defined names local to the sheet, its relationship, content type
    /// override, worksheet part, rels and the parts only it points to
    /// (comments, tables, drawings) go with it. The shared string table is
    /// rebuilt from the remaining sheets and their `t="s"` indices remapped,
    /// so no text of the removed sheet survives. The calculation chain and
    /// the extended properties part (which lists sheet titles) are dropped;
    /// Excel rebuilds both.
    pub fn without_sheet(&self, index: usize) -> Result<Vec<u8>> {
        let entry = self.sheets.get(index).ok_or(WorkbookError::NoSuchSheet(index))?;
        if self.sheets.len() == 1 {
            return Err(WorkbookError::LastSheet(entry.name.clone()));
        }

        let mut archive = ZipArchive::new(Cursor::new(self.data))?;
        let workbook_xml = read_part(&mut archive, WORKBOOK_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_PART.to_string()))?;
        let rels_xml = read_part(&mut archive, WORKBOOK_RELS_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(WORKBOOK_RELS_PART.to_string()))?;
        let root_rels_xml = read_part(&mut archive, ROOT_RELS_PART)?;
        let content_types_xml = read_part(&mut archive, CONTENT_TYPES_PART)?
            .ok_or_else(|| WorkbookError::MissingPart(CONTENT_TYPES_PART.to_string()))?;

        let mut removed: HashSet<String> = HashSet::new();
        removed.insert(entry.path.clone());
        removed.insert(rels_path_for(&entry.path));

        let mut still_used: HashSet<String> = HashSet::new();
        for (i, sheet) in self.sheets.iter().enumerate() {
            if i != index {
                still_used.extend(sheet_targets(&mut archive, &sheet.path)?);
            }
        }
        for target in sheet_targets(&mut archive, &entry.path)? {
            if !still_used.contains(&target) {
                removed.insert(rels_path_for(&target));
                removed.insert(target);
            }
        }

        let mut rewritten: HashMap<String, Vec<u8>> = HashMap::new();
        if let Some(shared_xml) = read_part(&mut archive, &self.shared_path)? {
            let mut kept_sheets = Vec::with_capacity(self.sheets.len() - 1);
            let mut used = BTreeSet::new();
            let mut references = 0usize;
            for (i, sheet) in self.sheets.iter().enumerate() {
                if i == index {
                    continue;
                }
                let xml = read_part(&mut archive, &sheet.path)?
                    .ok_or_else(|| WorkbookError::MissingPart(sheet.path.clone()))?;
                references += collect_shared_refs(&xml, &sheet.path, &mut used)?;
                kept_sheets.push((sheet.path.as_str(), xml));
            }
            used.retain(|i| *i < self.shared_strings.len());

            let mapping: HashMap<usize, usize> = used
                .iter()
                .enumerate()
                .map(|(new, old)| (*old, new))
                .collect();
            for (path, xml) in kept_sheets {
                rewritten.insert(path.to_string(), remap_shared_refs(&xml, path, &mapping)?);
            }
            rewritten.insert(
                self.shared_path.clone(),
                filter_shared_strings(&shared_xml, &self.shared_path, &used, references)?,
            );
        }

        for rel in parse_relationships(&rels_xml, WORKBOOK_RELS_PART)? {
            if rel.kind.ends_with("/calcChain") {
                removed.insert(resolve_target("xl", &rel.target));
            }
        }
        if let Some(xml) = &root_rels_xml {
            for rel in parse_relationships(xml, ROOT_RELS_PART)? {
                if rel.kind.ends_with("/extended-properties") {
                    removed.insert(resolve_target("", &rel.target));
                }
            }
        }

        let remaining = self.sheets.len() - 1;
        let new_workbook = rewrite_workbook(&workbook_xml, index, remaining)?;
        let new_rels = rewrite_xml(&rels_xml, WORKBOOK_RELS_PART, |e| {
            if local_name(e) != b"Relationship" {
                return Ok(Action::Keep);
            }
            let id = attr(e, b"Id", WORKBOOK_RELS_PART)?.unwrap_or_default();
            let kind = attr(e, b"Type", WORKBOOK_RELS_PART)?.unwrap_or_default();
            Ok(if id == entry.rel_id || kind.ends_with("/calcChain") {
                Action::Drop
            } else {
                Action::Keep
            })
        })?;
        let new_root_rels = match &root_rels_xml {
            Some(xml) => Some(rewrite_xml(xml, ROOT_RELS_PART, |e| {
                if local_name(e) != b"Relationship" {
                    return Ok(Action::Keep);
                }
                let kind = attr(e, b"Type", ROOT_RELS_PART)?.unwrap_or_default();
                Ok(if kind.ends_with("/extended-properties") {
                    Action::Drop
                } else {
                    Action::Keep
                })
            })?),
            None => None,
        };
        let new_content_types = rewrite_xml(&content_types_xml, CONTENT_TYPES_PART, |e| {
            if local_name(e) != b"Override" {
                return Ok(Action::Keep);
            }
            let part = attr(e, b"PartName", CONTENT_TYPES_PART)?.unwrap_or_default();
            Ok(if removed.contains(part.trim_start_matches('/')) {
                Action::Drop
            } else {
                Action::Keep
            })
        })?;

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            let name = file.name().to_string();

            let replacement = match name.as_str() {
                WORKBOOK_PART => Some(&new_workbook),
                WORKBOOK_RELS_PART => Some(&new_rels),
                CONTENT_TYPES_PART => Some(&new_content_types),
                ROOT_RELS_PART => new_root_rels.as_ref(),
                other => rewritten.get(other),
            };

            if removed.contains(&name) {
                continue;
            } else if let Some(content) = replacement {
                drop(file);
                writer.start_file(name, options)?;
                writer.write_all(content)?;
            } else {
                writer.raw_copy_file(file)?;
            }
        }

        Ok(writer.finish()?.into_inner())
    }
}

fn read_part(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Option<String>> {
    read_part_limited(archive, name, MAX_PART_BYTES)
}

fn read_part_limited(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
    limit: u64,
) -> Result<Option<String>> {
    let file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = Vec::new();
    file.take(limit + 1).read_to_end(&mut content)?;
    if content.len() as u64 > limit {
        return Err(WorkbookError::PartTooLarge {
            part: name.to_string(),
            limit,
        });
    }
    String::from_utf8(content)
        .map(Some)
        .map_err(|e| xml_error(name, e))
}

/// Internal parts a worksheet's rels point to
fn sheet_targets(archive: &mut ZipArchive<Cursor<&[u8]>>, sheet_path: &str) -> Result<Vec<String>> {
    let rels_path = rels_path_for(sheet_path);
    let Some(xml) = read_part(archive, &rels_path)? else {
        return Ok(Vec::new());
    };
    let base = sheet_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    Ok(parse_relationships(&xml, &rels_path)?
        .into_iter()
        .filter(|rel| !rel.external)
        .map(|rel| resolve_target(base, &rel.target))
        .collect())
}

/// Zip path of a relationship target relative to `base`
fn resolve_target(base: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }

    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// `xl/worksheets/sheet1.xml` -> `xl/worksheets/_rels/sheet1.xml.rels`
fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

// ---------------------------------------------------------------------------
// XML helpers
// ---------------------------------------------------------------------------

fn local_name<'e>(e: &'e BytesStart<'_>) -> &'e [u8] {
    let name = e.name().into_inner();
    match name.iter().rposition(|b| *b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

fn unescape_bytes(bytes: &[u8], part: &str) -> Result<String> {
    let raw = std::str::from_utf8(bytes).map_err(|e| xml_error(part, e))?;
    quick_xml::escape::unescape(raw)
        .map(|s| s.into_owned())
        .map_err(|e| xml_error(part, e))
}

/// Attribute value by local name, unescaped
fn attr(e: &BytesStart<'_>, name: &[u8], part: &str) -> Result<Option<String>> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| xml_error(part, err))?;
        if attribute.key.local_name().as_ref() == name {
            return unescape_bytes(&attribute.value, part).map(Some);
        }
    }
    Ok(None)
}

/// Replacement text of `&name;`
fn resolve_entity(name: &str) -> Option<String> {
    let resolved = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)?
        }
    };
    Some(resolved.to_string())
}

/// Append character data of a text-like event
fn push_text(out: &mut String, event: &Event<'_>, part: &str) -> Result<()> {
    match event {
        Event::Text(text) => out.push_str(&unescape_bytes(text, part)?),
        Event::CData(data) => {
            out.push_str(std::str::from_utf8(data).map_err(|e| xml_error(part, e))?)
        }
        Event::GeneralRef(reference) => {
            let name = std::str::from_utf8(reference).map_err(|e| xml_error(part, e))?;
            let resolved = resolve_entity(name)
                .ok_or_else(|| xml_error(part, format!("unknown entity &{};", name)))?;
            out.push_str(&resolved);
        }
        _ => {}
    }
    Ok(())
}

struct Relationship {
    id: String,
    kind: String,
    target: String,
    external: bool,
}

fn parse_relationships(xml: &str, part: &str) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_str(xml);
    let mut relationships = Vec::new();

    loop {
        match reader.read_event().map_err(|e| xml_error(part, e))? {
            Event::Start(e) | Event::Empty(e) if local_name(&e) == b"Relationship" => {
                relationships.push(Relationship {
                    id: attr(&e, b"Id", part)?.unwrap_or_default(),
                    kind: attr(&e, b"Type", part)?.unwrap_or_default(),
                    target: attr(&e, b"Target", part)?.unwrap_or_default(),
                    external: attr(&e, b"TargetMode", part)?.as_deref() == Some("External"),
                });
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(relationships)
}

/// Sheet (name, relationship id) pairs in tab order, and the date1904 flag
fn parse_workbook(xml: &str) -> Result<(Vec<(String, String)>, bool)> {
    let mut reader = Reader::from_str(xml);
    let mut sheets = Vec::new();
    let mut date1904 = false;

    loop {
        match reader.read_event().map_err(|e| xml_error(WORKBOOK_PART, e))? {
            Event::Start(e) | Event::Empty(e) => match local_name(&e) {
                b"sheet" => {
                    let name = attr(&e, b"name", WORKBOOK_PART)?.unwrap_or_default();
                    let rel_id = attr(&e, b"id", WORKBOOK_PART)?
                        .ok_or_else(|| xml_error(WORKBOOK_PART, format!("sheet {} has no r:id", name)))?;
                    sheets.push((name, rel_id));
                }
                b"workbookPr" => {
                    date1904 = matches!(
                        attr(&e, b"date1904", WORKBOOK_PART)?.as_deref(),
                        Some("1") | Some("true")
                    );
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok((sheets, date1904))
}

fn parse_shared_strings(xml: &str, part: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(part, e))?;
        match &event {
            Event::Start(e) => match local_name(e) {
                b"si" => current.clear(),
                b"rPh" => in_phonetic = true,
                b"t" => in_text = !in_phonetic,
                _ => {}
            },
            Event::Empty(e) if local_name(e) == b"si" => strings.push(String::new()),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {}
            },
            Event::Text(_) | Event::CData(_) | Event::GeneralRef(_) if in_text => {
                push_text(&mut current, &event, part)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

/// Zero-based column of a cell reference like `AB12`
fn column_index(reference: &str) -> Option<u32> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut column: u32 = 0;
    for letter in letters {
        column = column
            .checked_mul(26)?
            .checked_add((letter.to_ascii_uppercase() - b'A' + 1) as u32)?;
    }
    Some(column - 1)
}

fn parse_sheet(xml: &str, part: &str, shared_strings: &[String]) -> Result<Vec<SheetRow>> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Vec<SheetRow> = Vec::new();

    let mut row: Option<SheetRow> = None;
    let mut next_row: u32 = 0;
    let mut next_column: u32 = 0;

    let mut cell_column: u32 = 0;
    let mut cell_type = String::new();
    let mut buffer = String::new();
    let mut in_cell = false;
    let mut in_value = false;
    let mut in_inline = false;
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(part, e))?;
        match &event {
            Event::Start(e) | Event::Empty(e) if local_name(e) == b"row" => {
                let index = attr(e, b"r", part)?
                    .and_then(|r| r.parse::<u32>().ok())
                    .map(|r| r.saturating_sub(1))
                    .unwrap_or(next_row);
                next_row = index + 1;
                next_column = 0;
                if matches!(event, Event::Start(_)) {
                    row = Some(SheetRow {
                        index,
                        cells: Vec::new(),
                    });
                }
            }
            Event::Start(e) if local_name(e) == b"c" => {
                cell_column = attr(e, b"r", part)?
                    .as_deref()
                    .and_then(column_index)
                    .unwrap_or(next_column);
                next_column = cell_column + 1;
                cell_type = attr(e, b"t", part)?.unwrap_or_default();
                buffer.clear();
                in_cell = true;
            }
            Event::Empty(e) if local_name(e) == b"c" => {
                next_column = attr(e, b"r", part)?
                    .as_deref()
                    .and_then(column_index)
                    .unwrap_or(next_column)
                    + 1;
            }
            Event::Start(e) if in_cell => match local_name(e) {
                b"v" => in_value = true,
                b"is" => in_inline = true,
                b"rPh" => in_phonetic = true,
                b"t" => in_text = in_inline && !in_phonetic,
                _ => {}
            },
            Event::Text(_) | Event::CData(_) | Event::GeneralRef(_) if in_value || in_text => {
                push_text(&mut buffer, &event, part)?;
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"is" => in_inline = false,
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                b"c" if in_cell => {
                    in_cell = false;
                    let value = cell_value(&cell_type, &buffer, shared_strings);
                    if let Some(row) = row.as_mut() {
                        if value != CellValue::Empty {
                            row.cells.push(Cell {
                                column: cell_column,
                                value,
                            });
                        }
                    }
                }
                b"row" => {
                    if let Some(done) = row.take() {
                        rows.push(done);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn cell_value(cell_type: &str, raw: &str, shared_strings: &[String]) -> CellValue {
    match cell_type {
        "s" => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i))
            .map(|s| CellValue::Text(s.clone()))
            .unwrap_or(CellValue::Empty),
        "inlineStr" | "str" | "d" => CellValue::Text(raw.to_string()),
        "b" => CellValue::Bool(raw.trim() == "1"),
        "e" => CellValue::Error(raw.to_string()),
        _ if raw.trim().is_empty() => CellValue::Empty,
        _ => CellValue::Number(raw.trim().to_string()),
    }
}

fn dense_rows(rows: &[SheetRow]) -> Vec<Vec<String>> {
    let mut dense: Vec<Vec<String>> = Vec::new();
    for row in rows.iter().filter(|r| (r.index as usize) < MAX_PREVIEW_ROWS) {
        let index = row.index as usize;
        if dense.len() <= index {
            dense.resize(index + 1, Vec::new());
        }
        let width = row.cells.iter().map(|c| c.column as usize + 1).max().unwrap_or(0);
        let mut values = vec![String::new(); width];
        for cell in &row.cells {
            values[cell.column as usize] = cell.value.display();
        }
        dense[index] = values;
    }
    dense
}

enum Action {
    Keep,
    Drop,
    Replace(BytesStart<'static>),
}

/// Stream an XML part, letting `decide` keep, drop or rewrite each element.
/// A dropped start tag drops everything up to its end tag.
fn rewrite_xml(
    xml: &str,
    part: &str,
    mut decide: impl FnMut(&BytesStart<'_>) -> Result<Action>,
) -> Result<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(part, e))?;
        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        let output = match event {
            Event::Eof => break,
            Event::Start(e) => match decide(&e)? {
                Action::Keep => Event::Start(e),
                Action::Drop => {
                    skip_depth = 1;
                    continue;
                }
                Action::Replace(new) => Event::Start(new),
            },
            Event::Empty(e) => match decide(&e)? {
                Action::Keep => Event::Empty(e),
                Action::Drop => continue,
                Action::Replace(new) => Event::Empty(new),
            },
            other => other,
        };
        writer.write_event(output).map_err(|e| xml_error(part, e))?;
    }

    Ok(writer.into_inner())
}

/// Copy of `e` with some attribute values replaced
fn with_attributes(e: &BytesStart<'_>, changes: &[(&[u8], String)], part: &str) -> Result<BytesStart<'static>> {
    let mut updated = e.clone().into_owned();
    updated.clear_attributes();
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| xml_error(part, err))?;
        let key = attribute.key.as_ref();
        match changes.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => updated.push_attribute((key, value.as_bytes())),
            None => updated.push_attribute((key, attribute.value.as_ref())),
        }
    }
    Ok(updated)
}

/// Shared string indices a sheet uses; returns how many cells reference the table
fn collect_shared_refs(xml: &str, part: &str, used: &mut BTreeSet<usize>) -> Result<usize> {
    let mut reader = Reader::from_str(xml);
    let mut shared_cell = false;
    let mut in_value = false;
    let mut references = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(part, e))?;
        match &event {
            Event::Start(e) if local_name(e) == b"c" => {
                shared_cell = attr(e, b"t", part)?.as_deref() == Some("s");
            }
            Event::Start(e) if local_name(e) == b"v" => in_value = shared_cell,
            Event::Text(text) if in_value => {
                if let Ok(index) = unescape_bytes(text, part)?.trim().parse::<usize>() {
                    used.insert(index);
                    references += 1;
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(references)
}

/// Rewrite `t="s"` cell values through `mapping`. Indices the table no
/// longer holds point one past its end, as they did before.
fn remap_shared_refs(xml: &str, part: &str, mapping: &HashMap<usize, usize>) -> Result<Vec<u8>> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut shared_cell = false;
    let mut in_value = false;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(part, e))?;
        match &event {
            Event::Eof => break,
            Event::Start(e) if local_name(e) == b"c" => {
                shared_cell = attr(e, b"t", part)?.as_deref() == Some("s");
            }
            Event::Start(e) if local_name(e) == b"v" => in_value = shared_cell,
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => shared_cell = false,
                _ => {}
            },
            Event::Text(text) if in_value => {
                let raw = unescape_bytes(text, part)?;
                if let Ok(old) = raw.trim().parse::<usize>() {
                    let new = mapping.get(&old).copied().unwrap_or(mapping.len());
                    let value = new.to_string();
                    writer
                        .write_event(Event::Text(BytesText::new(&value)))
                        .map_err(|e| xml_error(part, e))?;
                    continue;
                }
            }
            _ => {}
        }
        writer.write_event(event).map_err(|e| xml_error(part, e))?;
    }

    Ok(writer.into_inner())
}

/// Keep only the `<si>` items in `used` and fix the table's counters
fn filter_shared_strings(xml: &str, part: &str, used: &BTreeSet<usize>, references: usize) -> Result<Vec<u8>> {
    let mut ordinal = 0usize;

    rewrite_xml(xml, part, |e| match local_name(e) {
        b"sst" => {
            let mut changes: Vec<(&[u8], String)> = Vec::new();
            if attr(e, b"count", part)?.is_some() {
                changes.push((b"count".as_slice(), references.to_string()));
            }
            if attr(e, b"uniqueCount", part)?.is_some() {
                changes.push((b"uniqueCount".as_slice(), used.len().to_string()));
            }
            Ok(Action::Replace(with_attributes(e, &changes, part)?))
        }
        b"si" => {
            let current = ordinal;
            ordinal += 1;
            Ok(if used.contains(&current) {
                Action::Keep
            } else {
                Action::Drop
            })
        }
        _ => Ok(Action::Keep),
    })
}

fn rewrite_workbook(xml: &str, removed: usize, remaining: usize) -> Result<Vec<u8>> {
    let mut sheet_index = 0usize;

    rewrite_xml(xml, WORKBOOK_PART, |e| match local_name(e) {
        b"sheet" => {
            let current = sheet_index;
            sheet_index += 1;
            Ok(if current == removed {
                Action::Drop
            } else {
                Action::Keep
            })
        }
        b"definedName" => {
            let local = attr(e, b"localSheetId", WORKBOOK_PART)?.and_then(|v| v.parse::<usize>().ok());
            match local {
                Some(id) if id == removed => Ok(Action::Drop),
                Some(id) if id > removed => Ok(Action::Replace(with_attributes(
                    e,
                    &[(b"localSheetId".as_slice(), (id - 1).to_string())],
                    WORKBOOK_PART,
                )?)),
                _ => Ok(Action::Keep),
            }
        }
        b"workbookView" => {
            let mut changes: Vec<(&[u8], String)> = Vec::new();
            for key in [b"activeTab".as_slice(), b"firstSheet".as_slice()] {
                let value = attr(e, key, WORKBOOK_PART)?.and_then(|v| v.parse::<usize>().ok());
                if let Some(tab) = value {
                    let shifted = if tab > removed || tab >= remaining {
                        tab.saturating_sub(1)
                    } else {
                        tab
                    };
                    changes.push((key, shifted.to_string()));
                }
            }
            if changes.is_empty() {
                Ok(Action::Keep)
            } else {
                Ok(Action::Replace(with_attributes(e, &changes, WORKBOOK_PART)?))
            }
        }
        _ => Ok(Action::Keep),
    })
}
