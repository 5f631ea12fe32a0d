use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use lopdf::Document;
use regex::Regex;
use serde::Serialize;

use super::ExtractionError;

static WORD_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<w:t(?:\s[^>]*)?>([^<]*)</w:t>").unwrap());
static DRAWING_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a:t(?:\s[^>]*)?>([^<]*)</a:t>").unwrap());
static SLIDE_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static HTML_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());

/// Text of one page (PDF) or slide (presentation). Flat formats have one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentPage {
    pub page_number: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentText {
    pub pages: Vec<DocumentPage>,
}

impl DocumentText {
    /// Pages joined by blank lines.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }
}

/// Read a document from disk and extract its text layer by extension.
pub fn extract_document_text(path: &Path) -> Result<DocumentText, ExtractionError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let bytes = std::fs::read(path)?;
    let text = extract_text_from_bytes(&bytes, &ext)?;
    tracing::debug!(
        path = %path.display(),
        pages = text.pages.len(),
        "Document text extracted"
    );
    Ok(text)
}

pub fn extract_text_from_bytes(bytes: &[u8], extension: &str) -> Result<DocumentText, ExtractionError> {
    match extension {
        "pdf" => pdf_text(bytes),
        "docx" => word_text(bytes),
        "pptx" => slide_text(bytes),
        "txt" | "md" | "markdown" => Ok(single_page(&String::from_utf8_lossy(bytes))),
        "html" | "htm" => Ok(single_page(&strip_html(&String::from_utf8_lossy(bytes)))),
        other => Err(ExtractionError::UnsupportedFormat(format!(
            "no text extraction for .{other}"
        ))),
    }
}

fn single_page(text: &str) -> DocumentText {
    DocumentText {
        pages: vec![DocumentPage {
            page_number: 1,
            text: sanitize_text(text),
        }],
    }
}

fn pdf_text(bytes: &[u8]) -> Result<DocumentText, ExtractionError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| ExtractionError::DocumentParse(format!("Failed to load PDF: {e}")))?;

    let mut page_numbers: Vec<u32> = doc.get_pages().keys().copied().collect();
    page_numbers.sort_unstable();

    let pages = page_numbers
        .into_iter()
        .map(|page_number| {
            let text = doc.extract_text(&[page_number]).unwrap_or_else(|e| {
                tracing::warn!(page = page_number, error = %e, "No text layer on page");
                String::new()
            });
            DocumentPage {
                page_number,
                text: sanitize_text(&text),
            }
        })
        .collect();

    Ok(DocumentText { pages })
}

fn open_package(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>, ExtractionError> {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractionError::DocumentParse(format!("Failed to open package: {e}")))
}

fn read_xml(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String, ExtractionError> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| ExtractionError::DocumentParse(format!("{name}: {e}")))?;
    let mut xml = String::new();
    file.read_to_string(&mut xml)?;
    Ok(xml)
}

fn word_text(bytes: &[u8]) -> Result<DocumentText, ExtractionError> {
    let mut archive = open_package(bytes)?;
    let xml = read_xml(&mut archive, "word/document.xml")?;

    let paragraphs: Vec<String> = xml
        .split("</w:p>")
        .map(|para| {
            WORD_RUN
                .captures_iter(para)
                .map(|c| decode_entities(&c[1]))
                .collect::<String>()
        })
        .filter(|p| !p.trim().is_empty())
        .collect();

    Ok(single_page(&paragraphs.join("\n")))
}

fn slide_text(bytes: &[u8]) -> Result<DocumentText, ExtractionError> {
    let mut archive = open_package(bytes)?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = SLIDE_PART.captures(name)?[1].parse::<u32>().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut pages = Vec::with_capacity(slides.len());
    for (page_number, name) in slides {
        let xml = read_xml(&mut archive, &name)?;
        let text = xml
            .split("</a:p>")
            .map(|para| {
                DRAWING_RUN
                    .captures_iter(para)
                    .map(|c| decode_entities(&c[1]))
                    .collect::<String>()
            })
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        pages.push(DocumentPage {
            page_number,
            text: sanitize_text(&text),
        });
    }

    Ok(DocumentText { pages })
}

fn strip_html(html: &str) -> String {
    let without_scripts = HTML_SCRIPT.replace_all(html, " ");
    let block_breaks = without_scripts
        .replace("</p>", "\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("</div>", "\n");
    decode_entities(&HTML_TAG.replace_all(&block_breaks, ""))
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Drop control characters and blank lines, trim each line.
pub fn sanitize_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Generate a valid PDF with text using lopdf.
    fn make_test_pdf(texts: &[&str]) -> Vec<u8> {
        use lopdf::dictionary;
        use lopdf::{Object, Stream};

        let mut doc = Document::with_version("1.4");

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let pages_id = doc.new_object_id();
        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let content = format!("BT /F1 12 Tf 100 700 Td ({text}) Tj ET");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                },
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    fn make_package(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn pdf_pages_are_numbered() {
        let pdf = make_test_pdf(&["Quarterly revenue report", "Appendix tables"]);
        let text = extract_text_from_bytes(&pdf, "pdf").unwrap();
        assert_eq!(text.pages.len(), 2);
        assert_eq!(text.pages[0].page_number, 1);
        assert!(text.pages[0].text.contains("Quarterly"));
        assert!(text.pages[1].text.contains("Appendix"));
    }

    #[test]
    fn invalid_pdf_is_parse_error() {
        let result = extract_text_from_bytes(b"not a pdf", "pdf");
        assert!(matches!(result, Err(ExtractionError::DocumentParse(_))));
    }

    #[test]
    fn docx_runs_joined_per_paragraph() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world</w:t></w:r></w:p>
            <w:p><w:r><w:t>Fish &amp; chips</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let docx = make_package(&[("word/document.xml", xml)]);
        let text = extract_text_from_bytes(&docx, "docx").unwrap();
        assert_eq!(text.full_text(), "Hello world\nFish & chips");
    }

    #[test]
    fn pptx_slides_become_pages() {
        let slide = |t: &str| format!("<p:sld><a:p><a:r><a:t>{t}</a:t></a:r></a:p></p:sld>");
        let s1 = slide("Intro");
        let s10 = slide("Closing");
        let pptx = make_package(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
        ]);
        let text = extract_text_from_bytes(&pptx, "pptx").unwrap();
        assert_eq!(text.pages.len(), 2);
        assert_eq!(text.pages[0], DocumentPage { page_number: 1, text: "Intro".into() });
        assert_eq!(text.pages[1].page_number, 10);
    }

    #[test]
    fn html_tags_and_scripts_removed() {
        let html = "<html><head><script>var x = 1;</script></head><body><p>Title</p><div>Body &amp; more</div></body></html>";
        let text = extract_text_from_bytes(html.as_bytes(), "html").unwrap();
        assert_eq!(text.full_text(), "Title\nBody & more");
    }

    #[test]
    fn plain_text_is_sanitized() {
        let text = extract_text_from_bytes(b"line one\x00\n\n   line two  \x07", "txt").unwrap();
        assert_eq!(text.full_text(), "line one\nline two");
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let result = extract_text_from_bytes(b"{\\rtf1}", "rtf");
        assert!(matches!(result, Err(ExtractionError::UnsupportedFormat(_))));
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.MD");
        std::fs::write(&path, "# Notes\nremember").unwrap();
        let text = extract_document_text(&path).unwrap();
        assert_eq!(text.full_text(), "# Notes\nremember");
        assert!(!text.is_empty());
    }
}
