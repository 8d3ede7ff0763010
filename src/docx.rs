//! Minimal OOXML (.docx) writer.
//!
//! A .docx file is a zip of XML parts; this module emits exactly the subset
//! the school documents need: paragraphs of runs (bold/italic/size,
//! alignment, tabs and line breaks), simple grid tables, one fixed font per
//! document, and page margins in centimeters.

use std::io::{Cursor, Write};

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const WPML_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone)]
pub struct Run {
    text: String,
    bold: bool,
    italic: bool,
    size_pt: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Paragraph {
    runs: Vec<Run>,
    align: Align,
}

impl Paragraph {
    pub fn new() -> Self {
        Paragraph {
            runs: Vec::new(),
            align: Align::Left,
        }
    }

    pub fn centered() -> Self {
        Paragraph {
            runs: Vec::new(),
            align: Align::Center,
        }
    }

    pub fn right_aligned() -> Self {
        Paragraph {
            runs: Vec::new(),
            align: Align::Right,
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.runs.push(Run {
            text: text.into(),
            bold: false,
            italic: false,
            size_pt: None,
        });
        self
    }

    pub fn bold(mut self, text: impl Into<String>) -> Self {
        self.runs.push(Run {
            text: text.into(),
            bold: true,
            italic: false,
            size_pt: None,
        });
        self
    }

    pub fn italic(mut self, text: impl Into<String>) -> Self {
        self.runs.push(Run {
            text: text.into(),
            bold: false,
            italic: true,
            size_pt: None,
        });
        self
    }

    pub fn sized_bold(mut self, text: impl Into<String>, size_pt: u32) -> Self {
        self.runs.push(Run {
            text: text.into(),
            bold: true,
            italic: false,
            size_pt: Some(size_pt),
        });
        self
    }

    pub fn plain_text(&self) -> String {
        self.runs.iter().map(|r| r.text.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// HTML projection of the same paragraph, for on-screen report pages.
    pub fn to_html(&self) -> String {
        let mut out = String::from(match self.align {
            Align::Left => "<p>",
            Align::Center => r#"<p style="text-align: center">"#,
            Align::Right => r#"<p style="text-align: right">"#,
        });
        for run in &self.runs {
            if run.bold {
                out.push_str("<strong>");
            }
            if run.italic {
                out.push_str("<em>");
            }
            let escaped = escape_xml(&run.text);
            out.push_str(&escaped.replace('\n', "<br>").replace('\t', "&emsp;"));
            if run.italic {
                out.push_str("</em>");
            }
            if run.bold {
                out.push_str("</strong>");
            }
        }
        out.push_str("</p>");
        out
    }
}

impl Default for Paragraph {
    fn default() -> Self {
        Paragraph::new()
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    /// First row is the header (rendered bold, centered).
    pub rows: Vec<Vec<String>>,
    pub col_widths_cm: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum Block {
    Para(Paragraph),
    Table(Table),
    PageBreak,
}

/// One document: fixed base font, margins, block sequence.
pub struct Document {
    font: String,
    size_pt: u32,
    /// left, right, top, bottom
    margins_cm: (f64, f64, f64, f64),
    blocks: Vec<Block>,
}

impl Document {
    pub fn new(font: &str, size_pt: u32, margins_cm: (f64, f64, f64, f64)) -> Self {
        Document {
            font: font.to_string(),
            size_pt,
            margins_cm,
            blocks: Vec::new(),
        }
    }

    pub fn push(&mut self, paragraph: Paragraph) {
        self.blocks.push(Block::Para(paragraph));
    }

    pub fn push_table(&mut self, table: Table) {
        self.blocks.push(Block::Table(table));
    }

    pub fn page_break(&mut self) {
        self.blocks.push(Block::PageBreak);
    }

    pub fn extend(&mut self, paragraphs: Vec<Paragraph>) {
        for p in paragraphs {
            self.push(p);
        }
    }

    /// Packs the document into .docx bytes.
    pub fn build(&self) -> anyhow::Result<Vec<u8>> {
        let cursor = Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(cursor);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file("[Content_Types].xml", opts)?;
        zip.write_all(CONTENT_TYPES.as_bytes())?;

        zip.start_file("_rels/.rels", opts)?;
        zip.write_all(ROOT_RELS.as_bytes())?;

        zip.start_file("word/_rels/document.xml.rels", opts)?;
        zip.write_all(DOCUMENT_RELS.as_bytes())?;

        zip.start_file("word/styles.xml", opts)?;
        zip.write_all(self.styles_xml().as_bytes())?;

        zip.start_file("word/document.xml", opts)?;
        zip.write_all(self.document_xml().as_bytes())?;

        let cursor = zip.finish()?;
        Ok(cursor.into_inner())
    }

    fn styles_xml(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<w:styles xmlns:w="{ns}">"#,
                r#"<w:style w:type="paragraph" w:styleId="Normal" w:default="1">"#,
                r#"<w:name w:val="Normal"/>"#,
                r#"<w:rPr><w:rFonts w:ascii="{font}" w:hAnsi="{font}" w:cs="{font}"/>"#,
                r#"<w:sz w:val="{half}"/><w:szCs w:val="{half}"/></w:rPr>"#,
                r#"</w:style></w:styles>"#
            ),
            ns = WPML_NS,
            font = escape_xml(&self.font),
            half = self.size_pt * 2
        )
    }

    fn document_xml(&self) -> String {
        let mut body = String::new();
        for block in &self.blocks {
            match block {
                Block::Para(p) => body.push_str(&paragraph_xml(p, self.size_pt)),
                Block::Table(t) => body.push_str(&table_xml(t)),
                Block::PageBreak => {
                    body.push_str(r#"<w:p><w:r><w:br w:type="page"/></w:r></w:p>"#)
                }
            }
        }
        let (left, right, top, bottom) = self.margins_cm;
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<w:document xmlns:w="{ns}"><w:body>{body}"#,
                r#"<w:sectPr><w:pgSz w:w="11906" w:h="16838"/>"#,
                r#"<w:pgMar w:top="{top}" w:right="{right}" w:bottom="{bottom}" w:left="{left}"/>"#,
                r#"</w:sectPr></w:body></w:document>"#
            ),
            ns = WPML_NS,
            body = body,
            top = cm_to_twips(top),
            right = cm_to_twips(right),
            bottom = cm_to_twips(bottom),
            left = cm_to_twips(left),
        )
    }
}

fn paragraph_xml(p: &Paragraph, base_size_pt: u32) -> String {
    let mut xml = String::from("<w:p>");
    match p.align {
        Align::Left => {}
        Align::Center => xml.push_str(r#"<w:pPr><w:jc w:val="center"/></w:pPr>"#),
        Align::Right => xml.push_str(r#"<w:pPr><w:jc w:val="right"/></w:pPr>"#),
    }
    for run in &p.runs {
        xml.push_str("<w:r>");
        let size = run.size_pt.unwrap_or(base_size_pt);
        let mut props = String::new();
        if run.bold {
            props.push_str("<w:b/>");
        }
        if run.italic {
            props.push_str("<w:i/>");
        }
        if run.size_pt.is_some() {
            props.push_str(&format!(r#"<w:sz w:val="{}"/>"#, size * 2));
        }
        if !props.is_empty() {
            xml.push_str(&format!("<w:rPr>{}</w:rPr>", props));
        }
        // Newlines and tabs inside run text become explicit break/tab elements.
        let mut first_line = true;
        for line in run.text.split('\n') {
            if !first_line {
                xml.push_str("<w:br/>");
            }
            first_line = false;
            let mut first_part = true;
            for part in line.split('\t') {
                if !first_part {
                    xml.push_str("<w:tab/>");
                }
                first_part = false;
                if !part.is_empty() {
                    xml.push_str(&format!(
                        r#"<w:t xml:space="preserve">{}</w:t>"#,
                        escape_xml(part)
                    ));
                }
            }
        }
        xml.push_str("</w:r>");
    }
    xml.push_str("</w:p>");
    xml
}

fn table_xml(t: &Table) -> String {
    let mut xml = String::from(concat!(
        "<w:tbl><w:tblPr><w:tblBorders>",
        r#"<w:top w:val="single" w:sz="4"/><w:bottom w:val="single" w:sz="4"/>"#,
        r#"<w:left w:val="single" w:sz="4"/><w:right w:val="single" w:sz="4"/>"#,
        r#"<w:insideH w:val="single" w:sz="4"/><w:insideV w:val="single" w:sz="4"/>"#,
        "</w:tblBorders></w:tblPr><w:tblGrid>"
    ));
    for width in &t.col_widths_cm {
        xml.push_str(&format!(r#"<w:gridCol w:w="{}"/>"#, cm_to_twips(*width)));
    }
    xml.push_str("</w:tblGrid>");
    for (row_idx, row) in t.rows.iter().enumerate() {
        xml.push_str("<w:tr>");
        for (col_idx, cell) in row.iter().enumerate() {
            let width = t
                .col_widths_cm
                .get(col_idx)
                .copied()
                .unwrap_or(4.0);
            xml.push_str(&format!(
                r#"<w:tc><w:tcPr><w:tcW w:w="{}" w:type="dxa"/></w:tcPr>"#,
                cm_to_twips(width)
            ));
            let para = if row_idx == 0 {
                Paragraph::centered().bold(cell.clone())
            } else {
                Paragraph::centered().text(cell.clone())
            };
            xml.push_str(&paragraph_xml(&para, 14));
            xml.push_str("</w:tc>");
        }
        xml.push_str("</w:tr>");
    }
    xml.push_str("</w:tbl>");
    xml
}

fn cm_to_twips(cm: f64) -> i64 {
    (cm * 1440.0 / 2.54).round() as i64
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

const CONTENT_TYPES: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
    r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
    r#"<Default Extension="xml" ContentType="application/xml"/>"#,
    r#"<Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>"#,
    r#"<Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/>"#,
    r#"</Types>"#
);

const ROOT_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>"#,
    r#"</Relationships>"#
);

const DOCUMENT_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
    r#"</Relationships>"#
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_entry(bytes: &[u8], name: &str) -> String {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes.to_vec())).expect("open docx zip");
        let mut entry = archive.by_name(name).expect("entry present");
        let mut content = String::new();
        entry.read_to_string(&mut content).expect("read entry");
        content
    }

    #[test]
    fn build_emits_all_required_parts() {
        let mut doc = Document::new("PT Serif", 14, (1.0, 1.0, 1.0, 1.0));
        doc.push(Paragraph::centered().bold("Заголовок"));
        let bytes = doc.build().expect("build docx");

        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes.clone())).expect("open docx zip");
        for name in [
            "[Content_Types].xml",
            "_rels/.rels",
            "word/_rels/document.xml.rels",
            "word/styles.xml",
            "word/document.xml",
        ] {
            assert!(archive.by_name(name).is_ok(), "missing {}", name);
        }

        let document = read_entry(&bytes, "word/document.xml");
        assert!(document.contains("Заголовок"));
        assert!(document.contains(r#"<w:jc w:val="center"/>"#));
        assert!(document.contains("<w:b/>"));
    }

    #[test]
    fn newlines_and_tabs_become_breaks() {
        let mut doc = Document::new("PT Serif", 14, (1.0, 1.0, 1.0, 1.0));
        doc.push(Paragraph::new().text("первая\n\tвторая"));
        let bytes = doc.build().expect("build docx");
        let document = read_entry(&bytes, "word/document.xml");
        assert!(document.contains("<w:br/>"));
        assert!(document.contains("<w:tab/>"));
    }

    #[test]
    fn xml_specials_are_escaped() {
        let mut doc = Document::new("PT Serif", 14, (1.0, 1.0, 1.0, 1.0));
        doc.push(Paragraph::new().text("Дуэт <скрипка & альт>"));
        let bytes = doc.build().expect("build docx");
        let document = read_entry(&bytes, "word/document.xml");
        assert!(document.contains("&lt;скрипка &amp; альт&gt;"));
    }
}
