//! File-format parsing for extraction: CSV, XLSX, DOCX, PDF, image and
//! video sniffing.
//!
//! Every parser returns `MalformedInput` when the bytes are not the claimed
//! type. Parsers are synchronous and CPU-bound; the extractor runs them on
//! the blocking pool.

use std::io::Read;

use quick_xml::events::{BytesStart, Event};
use serde::Serialize;

use etl_harness_core::error::{EtlError, Result};
use etl_harness_core::frame::{Cell, CsvOptions, Frame};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum cells read from one worksheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 1_000_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

fn ooxml_err(e: impl std::fmt::Display) -> EtlError {
    EtlError::malformed(format!("OOXML: {}", e))
}

// ============ CSV ============

pub fn csv_frame(bytes: &[u8]) -> Result<Frame> {
    Frame::from_csv(bytes, &CsvOptions::default())
}

// ============ ZIP helpers ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(|e| ooxml_err(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry.take(max_bytes).read_to_end(&mut out).map_err(ooxml_err)?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml_err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(a.value.as_ref()).into_owned())
}

// ============ DOCX ============

/// Text of `word/document.xml`, one paragraph per blank-line-separated block.
pub fn docx_text(bytes: &[u8]) -> Result<String> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => {
                    if !out.is_empty() && !out.ends_with("\n\n") {
                        out.push_str("\n\n");
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => out.push('\t'),
                b"br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

// ============ XLSX ============

/// Parse one worksheet (1-based `sheet`, default the first) into a frame.
/// The first row is the header.
pub fn xlsx_frame(bytes: &[u8], sheet: Option<usize>) -> Result<Frame> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let sheet_names = list_worksheet_names(&archive);
    if sheet_names.is_empty() {
        return Err(ooxml_err("workbook has no worksheets"));
    }
    let index = sheet.unwrap_or(1);
    let name = index
        .checked_sub(1)
        .and_then(|i| sheet_names.get(i))
        .ok_or_else(|| {
            EtlError::invalid(format!(
                "sheet {} does not exist (workbook has {})",
                index,
                sheet_names.len()
            ))
        })?
        .clone();
    let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
    let rows = read_sheet_rows(&xml, &shared_strings)?;
    rows_to_frame(rows)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.push(current.take().unwrap_or_default()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Zero-based column index of a cell reference such as `AB12`.
fn column_index(reference: &str) -> Option<usize> {
    let letters: String = reference.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut idx = 0usize;
    for c in letters.chars() {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(idx - 1)
}

fn read_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<(usize, Cell)>>> {
    let mut rows = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut row: Option<Vec<(usize, Cell)>> = None;
    let mut next_col = 0usize;
    let mut col = 0usize;
    let mut cell_type = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = Some(Vec::new());
                    next_col = 0;
                }
                b"c" => {
                    col = attr(&e, b"r").and_then(|r| column_index(&r)).unwrap_or(next_col);
                    next_col = col + 1;
                    cell_type = attr(&e, b"t").unwrap_or_default();
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                let c = attr(&e, b"r").and_then(|r| column_index(&r)).unwrap_or(next_col);
                next_col = c + 1;
            }
            Ok(Event::Text(te)) if in_value => {
                value.push_str(te.unescape().map_err(ooxml_err)?.as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let cell = match cell_type.as_str() {
                        "s" => {
                            let idx: usize = value
                                .trim()
                                .parse()
                                .map_err(|_| ooxml_err(format!("bad shared string index '{}'", value)))?;
                            let s = shared
                                .get(idx)
                                .ok_or_else(|| ooxml_err(format!("shared string {} out of range", idx)))?;
                            Cell::infer(s)
                        }
                        "e" => Cell::Text(value.clone()),
                        _ => Cell::infer(value.trim()),
                    };
                    if let Some(r) = row.as_mut() {
                        r.push((col, cell));
                    }
                    cells += 1;
                    if cells > XLSX_MAX_CELLS_PER_SHEET {
                        return Err(EtlError::malformed(format!(
                            "worksheet exceeds {} cells",
                            XLSX_MAX_CELLS_PER_SHEET
                        )));
                    }
                }
                b"row" => {
                    if let Some(r) = row.take() {
                        rows.push(r);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn rows_to_frame(rows: Vec<Vec<(usize, Cell)>>) -> Result<Frame> {
    let mut iter = rows.into_iter();
    let header = iter
        .next()
        .ok_or_else(|| EtlError::malformed("worksheet is empty"))?;
    let data: Vec<Vec<(usize, Cell)>> = iter.collect();
    let width = header
        .iter()
        .chain(data.iter().flatten())
        .map(|(c, _)| c + 1)
        .max()
        .unwrap_or(0);
    if width == 0 {
        return Err(EtlError::malformed("worksheet is empty"));
    }

    let mut columns: Vec<String> = (1..=width).map(|i| format!("column_{}", i)).collect();
    for (c, cell) in header {
        let name = cell.render();
        if !name.trim().is_empty() {
            columns[c] = name.trim().to_string();
        }
    }
    let grid = data
        .into_iter()
        .map(|cells| {
            let mut row = vec![Cell::Null; width];
            for (c, cell) in cells {
                row[c] = cell;
            }
            row
        })
        .collect();
    Frame::new(columns, grid)
}

// ============ PDF ============

pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    if !bytes.starts_with(b"%PDF-") {
        return Err(EtlError::malformed("not a PDF document (missing %PDF- header)"));
    }
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| EtlError::malformed(format!("PDF: {}", e)))
}

// ============ Images and video ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub format: &'static str,
    pub content_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

fn be16(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 2).map(|s| u32::from(u16::from_be_bytes([s[0], s[1]])))
}

fn le16(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 2).map(|s| u32::from(u16::from_le_bytes([s[0], s[1]])))
}

fn be32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4).map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn le32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

/// Walk JPEG segments to the first start-of-frame marker.
fn jpeg_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 4 <= b.len() {
        if b[pos] != 0xFF {
            return None;
        }
        let marker = b[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        let len = be16(b, pos + 2)? as usize;
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let height = be16(b, pos + 5)?;
            let width = be16(b, pos + 7)?;
            return Some((width, height));
        }
        pos += 2 + len;
    }
    None
}

pub fn sniff_image(b: &[u8]) -> Result<MediaInfo> {
    let info = if b.starts_with(b"\x89PNG\r\n\x1a\n") {
        MediaInfo {
            format: "png",
            content_type: "image/png",
            width: be32(b, 16),
            height: be32(b, 20),
        }
    } else if b.starts_with(&[0xFF, 0xD8, 0xFF]) {
        let dims = jpeg_dimensions(b);
        MediaInfo {
            format: "jpeg",
            content_type: "image/jpeg",
            width: dims.map(|d| d.0),
            height: dims.map(|d| d.1),
        }
    } else if b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a") {
        MediaInfo {
            format: "gif",
            content_type: "image/gif",
            width: le16(b, 6),
            height: le16(b, 8),
        }
    } else if b.starts_with(b"BM") && b.len() >= 26 {
        MediaInfo {
            format: "bmp",
            content_type: "image/bmp",
            width: le32(b, 18),
            height: le32(b, 22).map(|h| (h as i32).unsigned_abs()),
        }
    } else if b.len() >= 12 && &b[0..4] == b"RIFF" && &b[8..12] == b"WEBP" {
        MediaInfo {
            format: "webp",
            content_type: "image/webp",
            width: None,
            height: None,
        }
    } else {
        return Err(EtlError::malformed("bytes are not a recognized image format"));
    };
    Ok(info)
}

pub fn sniff_video(b: &[u8]) -> Result<MediaInfo> {
    let (format, content_type) = if b.len() >= 12 && &b[4..8] == b"ftyp" {
        if &b[8..12] == b"qt  " {
            ("mov", "video/quicktime")
        } else {
            ("mp4", "video/mp4")
        }
    } else if b.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        let head = &b[..b.len().min(64)];
        if head.windows(4).any(|w| w == b"webm") {
            ("webm", "video/webm")
        } else {
            ("mkv", "video/x-matroska")
        }
    } else if b.len() >= 12 && &b[0..4] == b"RIFF" && &b[8..12] == b"AVI " {
        ("avi", "video/x-msvideo")
    } else {
        return Err(EtlError::malformed("bytes are not a recognized video format"));
    };
    Ok(MediaInfo {
        format,
        content_type,
        width: None,
        height: None,
    })
}
