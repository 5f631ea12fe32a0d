//! Images embedded inside compound documents.
//!
//! Two container families are understood:
//! - paginated documents (PDF), where images live as `/XObject` resources,
//!   possibly nested inside form groups;
//! - OOXML packages (docx, pptx, xlsx), where images are package parts
//!   referenced through `_rels/*.rels` relationship files.
//!
//! Extraction never fails the caller: a bad image is skipped and counted, a
//! bad container yields an empty harvest flagged `document_failed`.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ocr::MAX_IMAGE_BYTES;
use super::types::ExtractedImage;
use super::ExtractionError;

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Reference chains longer than this are treated as broken.
const MAX_REFERENCE_HOPS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedMediaConfig {
    /// Maximum form-group nesting followed inside a page's resources.
    pub max_nesting_depth: usize,
    /// Largest image payload read or inflated from a container. Bigger
    /// entries are skipped before they are buffered.
    pub max_image_bytes: usize,
}

impl Default for EmbeddedMediaConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 32,
            max_image_bytes: MAX_IMAGE_BYTES,
        }
    }
}

/// Everything recovered from one container.
#[derive(Debug, Default)]
pub struct ImageHarvest {
    pub images: Vec<ExtractedImage>,
    /// Embedded images that were found but could not be decoded.
    pub skipped: usize,
    /// The container itself could not be opened.
    pub document_failed: bool,
}

impl ImageHarvest {
    fn failed() -> Self {
        Self {
            document_failed: true,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddedImageExtractor {
    config: EmbeddedMediaConfig,
}

impl EmbeddedImageExtractor {
    pub fn new(config: EmbeddedMediaConfig) -> Self {
        Self { config }
    }

    /// Dispatch on the container's magic bytes.
    pub fn extract_images(&self, bytes: &[u8]) -> ImageHarvest {
        if bytes.starts_with(PDF_MAGIC) {
            self.extract_pdf_images(bytes)
        } else if bytes.starts_with(ZIP_MAGIC) {
            self.extract_package_images(bytes)
        } else {
            let err = ExtractionError::UnsupportedFormat("unrecognized container signature".into());
            tracing::warn!(error = %err, "Cannot extract embedded images");
            ImageHarvest::failed()
        }
    }

    // ───────────────────────────────────────────────────────
    // PDF
    // ───────────────────────────────────────────────────────

    pub fn extract_pdf_images(&self, bytes: &[u8]) -> ImageHarvest {
        let doc = match Document::load_mem(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load PDF for image extraction");
                return ImageHarvest::failed();
            }
        };

        let mut walk = PdfWalk {
            doc: &doc,
            max_depth: self.config.max_nesting_depth,
            max_bytes: self.config.max_image_bytes,
            visited: HashSet::new(),
            harvest: ImageHarvest::default(),
        };

        for (page_number, page_id) in doc.get_pages() {
            let Some(resources) = walk.page_resources(page_id) else {
                continue;
            };
            walk.visit_resources(resources, page_number, 0);
        }

        tracing::debug!(
            images = walk.harvest.images.len(),
            skipped = walk.harvest.skipped,
            "PDF image extraction complete"
        );
        walk.harvest
    }

    // ───────────────────────────────────────────────────────
    // OOXML packages
    // ───────────────────────────────────────────────────────

    pub fn extract_package_images(&self, bytes: &[u8]) -> ImageHarvest {
        let mut archive = match zip::ZipArchive::new(Cursor::new(bytes)) {
            Ok(archive) => archive,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to open package for image extraction");
                return ImageHarvest::failed();
            }
        };

        let mut rels_parts: Vec<String> = archive
            .file_names()
            .filter(|name| is_rels_part(name))
            .map(str::to_string)
            .collect();
        rels_parts.sort();

        // target part → page number of the first part that referenced it
        let mut targets: BTreeMap<String, Option<u32>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        for rels_name in &rels_parts {
            let xml = match read_part_string(&mut archive, rels_name, self.config.max_image_bytes) {
                Ok(xml) => xml,
                Err(e) => {
                    tracing::warn!(part = %rels_name, error = %e, "Unreadable relationships part");
                    continue;
                }
            };
            let owner = owning_part(rels_name);
            let page_number = slide_number(&owner);

            for rel in parse_relationships(&xml) {
                if !rel.is_image() || rel.external {
                    continue;
                }
                let resolved = resolve_target(&owner, &rel.target);
                if !targets.contains_key(&resolved) {
                    targets.insert(resolved.clone(), page_number);
                    order.push(resolved);
                }
            }
        }

        let mut harvest = ImageHarvest::default();
        let max_bytes = self.config.max_image_bytes;
        for target in order {
            let page_number = targets.get(&target).copied().flatten();
            let blob = match read_part_bytes(&mut archive, &target, max_bytes) {
                Ok(blob) => blob,
                Err(e) => {
                    tracing::warn!(part = %target, error = %e, "Referenced image part unreadable");
                    harvest.skipped += 1;
                    continue;
                }
            };
            match decode_blob(&blob, max_bytes) {
                Ok((image, format)) => {
                    let (width, height) = image.dimensions();
                    harvest.images.push(ExtractedImage {
                        image,
                        page_number,
                        width,
                        height,
                        format,
                        source: target,
                    });
                }
                Err(e) => {
                    tracing::warn!(part = %target, error = %e, "Skipping undecodable embedded image");
                    harvest.skipped += 1;
                }
            }
        }

        tracing::debug!(
            images = harvest.images.len(),
            skipped = harvest.skipped,
            "Package image extraction complete"
        );
        harvest
    }
}

// ═══════════════════════════════════════════════════════════
// PDF resource walk
// ═══════════════════════════════════════════════════════════

struct PdfWalk<'a> {
    doc: &'a Document,
    max_depth: usize,
    max_bytes: usize,
    visited: HashSet<ObjectId>,
    harvest: ImageHarvest,
}

impl<'a> PdfWalk<'a> {
    /// Resources of a page, inherited from ancestors when absent.
    fn page_resources(&self, page_id: ObjectId) -> Option<&'a Dictionary> {
        let mut node = self.doc.get_dictionary(page_id).ok()?;
        for _ in 0..MAX_REFERENCE_HOPS {
            if let Ok(res) = node.get(b"Resources") {
                return resolve(self.doc, res)?.as_dict().ok();
            }
            let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
            node = self.doc.get_dictionary(parent).ok()?;
        }
        None
    }

    fn visit_resources(&mut self, resources: &'a Dictionary, page_number: u32, depth: usize) {
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|o| resolve(self.doc, o))
            .and_then(|o| o.as_dict().ok())
        else {
            return;
        };

        for (name, entry) in xobjects.iter() {
            if let Object::Reference(id) = entry {
                if !self.visited.insert(*id) {
                    continue;
                }
            }
            let Some(stream) = resolve(self.doc, entry).and_then(|o| o.as_stream().ok()) else {
                continue;
            };
            let name = String::from_utf8_lossy(name).into_owned();

            match name_of(&stream.dict, b"Subtype") {
                Some(b"Image") => self.take_image(stream, &name, page_number),
                Some(b"Form") => {
                    if depth + 1 > self.max_depth {
                        tracing::warn!(
                            xobject = %name,
                            depth,
                            "Form nesting limit reached, not descending"
                        );
                        continue;
                    }
                    if let Some(inner) = stream
                        .dict
                        .get(b"Resources")
                        .ok()
                        .and_then(|o| resolve(self.doc, o))
                        .and_then(|o| o.as_dict().ok())
                    {
                        self.visit_resources(inner, page_number, depth + 1);
                    }
                }
                _ => {}
            }
        }
    }

    fn take_image(&mut self, stream: &Stream, name: &str, page_number: u32) {
        match decode_pdf_image(self.doc, stream, self.max_bytes) {
            Ok((image, format)) => {
                let (width, height) = image.dimensions();
                self.harvest.images.push(ExtractedImage {
                    image,
                    page_number: Some(page_number),
                    width,
                    height,
                    format,
                    source: name.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    xobject = %name,
                    page = page_number,
                    error = %e,
                    "Skipping undecodable PDF image"
                );
                self.harvest.skipped += 1;
            }
        }
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    let mut current = obj;
    for _ in 0..MAX_REFERENCE_HOPS {
        match current {
            Object::Reference(id) => current = doc.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

fn name_of<'a>(dict: &'a Dictionary, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key).ok()? {
        Object::Name(name) => Some(name.as_slice()),
        _ => None,
    }
}

/// Filter chain of a stream, outermost first.
fn filters(doc: &Document, dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter").ok().and_then(|o| resolve(doc, o)) {
        Some(Object::Name(name)) => vec![name.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_pdf_image(
    doc: &Document,
    stream: &Stream,
    max_bytes: usize,
) -> Result<(DynamicImage, String), ExtractionError> {
    check_size(stream.content.len(), max_bytes)?;
    let filters = filters(doc, &stream.dict);
    let filter_names: Vec<&[u8]> = filters.iter().map(Vec::as_slice).collect();

    match filter_names.as_slice() {
        [b"DCTDecode"] => {
            let image = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
                .map_err(|e| ExtractionError::ImageDecode(e.to_string()))?;
            Ok((image, "jpeg".to_string()))
        }
        [] => decode_raw_pixels(doc, &stream.dict, stream.content.clone()),
        [b"FlateDecode"] => {
            if has_predictor(doc, &stream.dict) {
                return Err(ExtractionError::UnsupportedFormat(
                    "FlateDecode with a predictor".into(),
                ));
            }
            let data = inflate_bounded(&stream.content, max_bytes)?;
            decode_raw_pixels(doc, &stream.dict, data)
        }
        other => Err(ExtractionError::UnsupportedFormat(format!(
            "image filter chain {:?}",
            other
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect::<Vec<_>>()
        ))),
    }
}

fn check_size(len: usize, max_bytes: usize) -> Result<(), ExtractionError> {
    if len > max_bytes {
        return Err(ExtractionError::ImageDecode(format!(
            "embedded image of {len} bytes exceeds the {max_bytes}-byte limit"
        )));
    }
    Ok(())
}

/// Inflate a zlib stream, giving up as soon as the output passes `max_bytes`.
fn inflate_bounded(compressed: &[u8], max_bytes: usize) -> Result<Vec<u8>, ExtractionError> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(compressed)
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::ImageDecode(format!("inflate failed: {e}")))?;
    check_size(out.len(), max_bytes)?;
    Ok(out)
}

fn has_predictor(doc: &Document, dict: &Dictionary) -> bool {
    dict.get(b"DecodeParms")
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
        .and_then(|parms| parms.get(b"Predictor").ok())
        .and_then(|o| o.as_i64().ok())
        .is_some_and(|p| p > 1)
}

/// 8-bit DeviceGray / DeviceRGB sample buffers.
fn decode_raw_pixels(
    doc: &Document,
    dict: &Dictionary,
    mut data: Vec<u8>,
) -> Result<(DynamicImage, String), ExtractionError> {
    let int = |key: &[u8]| -> Option<i64> {
        dict.get(key)
            .ok()
            .and_then(|o| resolve(doc, o))
            .and_then(|o| o.as_i64().ok())
    };

    let width = int(b"Width").filter(|w| *w > 0).ok_or_else(|| {
        ExtractionError::ImageDecode("image XObject without a positive /Width".into())
    })? as u32;
    let height = int(b"Height").filter(|h| *h > 0).ok_or_else(|| {
        ExtractionError::ImageDecode("image XObject without a positive /Height".into())
    })? as u32;
    let bits = int(b"BitsPerComponent").unwrap_or(8);
    if bits != 8 {
        return Err(ExtractionError::UnsupportedFormat(format!(
            "{bits} bits per component"
        )));
    }

    let color_space = dict
        .get(b"ColorSpace")
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| match o {
            Object::Name(name) => Some(name.as_slice()),
            _ => None,
        });

    let pixels = width as usize * height as usize;
    match color_space {
        Some(b"DeviceGray") => {
            if data.len() < pixels {
                return Err(ExtractionError::ImageDecode("truncated gray sample data".into()));
            }
            data.truncate(pixels);
            GrayImage::from_raw(width, height, data)
                .map(|img| (DynamicImage::ImageLuma8(img), "raw-gray".to_string()))
                .ok_or_else(|| ExtractionError::ImageDecode("gray buffer size mismatch".into()))
        }
        Some(b"DeviceRGB") => {
            if data.len() < pixels * 3 {
                return Err(ExtractionError::ImageDecode("truncated RGB sample data".into()));
            }
            data.truncate(pixels * 3);
            RgbImage::from_raw(width, height, data)
                .map(|img| (DynamicImage::ImageRgb8(img), "raw-rgb".to_string()))
                .ok_or_else(|| ExtractionError::ImageDecode("RGB buffer size mismatch".into()))
        }
        other => Err(ExtractionError::UnsupportedFormat(format!(
            "color space {:?}",
            other.map(|n| String::from_utf8_lossy(n).into_owned())
        ))),
    }
}

// ═══════════════════════════════════════════════════════════
// Package relationships
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
struct Relationship {
    rel_type: String,
    target: String,
    external: bool,
}

impl Relationship {
    fn is_image(&self) -> bool {
        self.rel_type.ends_with("/image")
    }
}

static RELATIONSHIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Relationship\s[^>]*>").unwrap());
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z:]+)\s*=\s*"([^"]*)""#).unwrap());
static SLIDE_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ppt/slides/slide(\d+)\.xml$").unwrap());

fn parse_relationships(xml: &str) -> Vec<Relationship> {
    RELATIONSHIP
        .find_iter(xml)
        .map(|m| {
            let mut rel = Relationship {
                rel_type: String::new(),
                target: String::new(),
                external: false,
            };
            for cap in ATTRIBUTE.captures_iter(m.as_str()) {
                match &cap[1] {
                    "Type" => rel.rel_type = cap[2].to_string(),
                    "Target" => rel.target = cap[2].to_string(),
                    "TargetMode" => rel.external = cap[2].eq_ignore_ascii_case("External"),
                    _ => {}
                }
            }
            rel
        })
        .filter(|rel| !rel.target.is_empty())
        .collect()
}

fn is_rels_part(name: &str) -> bool {
    name.ends_with(".rels") && (name.starts_with("_rels/") || name.contains("/_rels/"))
}

/// `word/_rels/document.xml.rels` → `word/document.xml`; `_rels/.rels` → ``.
fn owning_part(rels_name: &str) -> String {
    let (dir, file) = match rels_name.rsplit_once("_rels/") {
        Some((dir, file)) => (dir, file),
        None => ("", rels_name),
    };
    let file = file.strip_suffix(".rels").unwrap_or(file);
    format!("{dir}{file}")
}

fn slide_number(part: &str) -> Option<u32> {
    SLIDE_PART
        .captures(part)
        .and_then(|c| c[1].parse::<u32>().ok())
}

/// Resolve a relationship target against the directory of its owning part.
fn resolve_target(owner: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return normalize_segments(absolute.split('/'));
    }
    let dir = owner.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    normalize_segments(dir.split('/').chain(target.split('/')))
}

fn normalize_segments<'a>(segments: impl Iterator<Item = &'a str>) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in segments {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

/// Read one package part. The declared size is checked first and the read
/// itself is capped, since a crafted header can understate the size.
fn read_part_bytes<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, ExtractionError> {
    let file = archive
        .by_name(name)
        .map_err(|e| ExtractionError::DocumentParse(format!("{name}: {e}")))?;
    check_size(usize::try_from(file.size()).unwrap_or(usize::MAX), max_bytes)?;
    let mut buf = Vec::new();
    file.take(max_bytes as u64 + 1).read_to_end(&mut buf)?;
    check_size(buf.len(), max_bytes)?;
    Ok(buf)
}

fn read_part_string<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: usize,
) -> Result<String, ExtractionError> {
    let bytes = read_part_bytes(archive, name, max_bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_blob(bytes: &[u8], max_bytes: usize) -> Result<(DynamicImage, String), ExtractionError> {
    check_size(bytes.len(), max_bytes)?;
    let format = image::guess_format(bytes)
        .map_err(|e| ExtractionError::ImageDecode(e.to_string()))?;
    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| ExtractionError::ImageDecode(e.to_string()))?;
    Ok((image, format!("{format:?}").to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::ocr::encode_png;
    use image::ImageOutputFormat;
    use lopdf::dictionary;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, image::Rgb([200, 40, 40])));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageOutputFormat::Jpeg(90)).unwrap();
        cursor.into_inner()
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        encode_png(&DynamicImage::new_rgb8(w, h)).unwrap()
    }

    /// Build a PDF whose pages each carry the given XObject resources.
    fn make_pdf(build: impl FnOnce(&mut Document) -> Vec<Dictionary>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let page_xobjects = build(&mut doc);

        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for xobjects in page_xobjects {
            let content_id = doc.add_object(Stream::new(dictionary! {}, b"q Q".to_vec()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Contents" => content_id,
                "Resources" => dictionary! { "XObject" => xobjects },
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

    fn rgb_xobject(doc: &mut Document, w: i64, h: i64) -> ObjectId {
        let data = vec![120u8; (w * h * 3) as usize];
        doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w,
                "Height" => h,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            data,
        ))
    }

    fn jpeg_xobject(doc: &mut Document, data: Vec<u8>, w: i64, h: i64) -> ObjectId {
        doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w,
                "Height" => h,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            data,
        ))
    }

    #[test]
    fn pdf_images_carry_page_numbers() {
        let pdf = make_pdf(|doc| {
            let raw = rgb_xobject(doc, 4, 3);
            let jpg = jpeg_xobject(doc, jpeg_bytes(16, 8), 16, 8);
            vec![
                dictionary! { "Im1" => raw },
                dictionary! { "Im2" => jpg },
            ]
        });

        let harvest = EmbeddedImageExtractor::default().extract_pdf_images(&pdf);
        assert!(!harvest.document_failed);
        assert_eq!(harvest.skipped, 0);
        assert_eq!(harvest.len(), 2);

        let raw = harvest.images.iter().find(|i| i.source == "Im1").unwrap();
        assert_eq!((raw.width, raw.height), (4, 3));
        assert_eq!(raw.page_number, Some(1));
        assert_eq!(raw.format, "raw-rgb");

        let jpg = harvest.images.iter().find(|i| i.source == "Im2").unwrap();
        assert_eq!((jpg.width, jpg.height), (16, 8));
        assert_eq!(jpg.page_number, Some(2));
        assert_eq!(jpg.format, "jpeg");
    }

    #[test]
    fn pdf_form_groups_are_recursed() {
        let pdf = make_pdf(|doc| {
            let inner = rgb_xobject(doc, 2, 2);
            let form = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "BBox" => vec![0.into(), 0.into(), 10.into(), 10.into()],
                    "Resources" => dictionary! {
                        "XObject" => dictionary! { "Inner" => inner },
                    },
                },
                b"q Q".to_vec(),
            ));
            vec![dictionary! { "Fm0" => form }]
        });

        let harvest = EmbeddedImageExtractor::default().extract_pdf_images(&pdf);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.images[0].source, "Inner");
    }

    #[test]
    fn pdf_self_referencing_form_terminates() {
        let pdf = make_pdf(|doc| {
            let img = rgb_xobject(doc, 2, 2);
            let form_id = doc.new_object_id();
            let form = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Form",
                    "Resources" => dictionary! {
                        "XObject" => dictionary! { "Self" => form_id, "Img" => img },
                    },
                },
                b"q Q".to_vec(),
            );
            doc.objects.insert(form_id, Object::Stream(form));
            vec![dictionary! { "Fm0" => form_id }]
        });

        let harvest = EmbeddedImageExtractor::default().extract_pdf_images(&pdf);
        assert_eq!(harvest.len(), 1);
    }

    #[test]
    fn pdf_nesting_depth_is_capped() {
        let pdf = make_pdf(|doc| {
            let img = rgb_xobject(doc, 2, 2);
            let form = doc.add_object(Stream::new(
                dictionary! {
                    "Subtype" => "Form",
                    "Resources" => dictionary! {
                        "XObject" => dictionary! { "Deep" => img },
                    },
                },
                b"q Q".to_vec(),
            ));
            vec![dictionary! { "Fm0" => form }]
        });

        let shallow = EmbeddedImageExtractor::new(EmbeddedMediaConfig {
            max_nesting_depth: 0,
            ..EmbeddedMediaConfig::default()
        });
        assert!(shallow.extract_pdf_images(&pdf).is_empty());
    }

    #[test]
    fn pdf_broken_image_is_skipped_not_fatal() {
        let pdf = make_pdf(|doc| {
            let good = rgb_xobject(doc, 3, 3);
            let bad = jpeg_xobject(doc, b"definitely not a jpeg".to_vec(), 10, 10);
            vec![dictionary! { "Good" => good, "Bad" => bad }]
        });

        let harvest = EmbeddedImageExtractor::default().extract_pdf_images(&pdf);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.skipped, 1);
        assert!(!harvest.document_failed);
    }

    #[test]
    fn garbage_pdf_yields_failed_harvest() {
        let harvest = EmbeddedImageExtractor::default().extract_pdf_images(b"%PDF-1.4 garbage");
        assert!(harvest.document_failed);
        assert!(harvest.is_empty());
    }

    fn flate_rgb_xobject(doc: &mut Document, w: i64, h: i64) -> ObjectId {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&vec![90u8; (w * h * 3) as usize]).unwrap();
        doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w,
                "Height" => h,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            encoder.finish().unwrap(),
        ))
    }

    fn capped(max_image_bytes: usize) -> EmbeddedImageExtractor {
        EmbeddedImageExtractor::new(EmbeddedMediaConfig {
            max_image_bytes,
            ..EmbeddedMediaConfig::default()
        })
    }

    #[test]
    fn pdf_flate_image_is_inflated() {
        let pdf = make_pdf(|doc| {
            let im = flate_rgb_xobject(doc, 8, 8);
            vec![dictionary! { "Im1" => im }]
        });
        let harvest = capped(1024).extract_pdf_images(&pdf);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.images[0].format, "raw-rgb");
    }

    #[test]
    fn pdf_inflation_past_limit_is_skipped() {
        // 64x64 RGB inflates to 12288 bytes from a tiny compressed stream.
        let pdf = make_pdf(|doc| {
            let bomb = flate_rgb_xobject(doc, 64, 64);
            let ok = rgb_xobject(doc, 4, 4);
            vec![dictionary! { "Im1" => bomb, "Im2" => ok }]
        });
        let harvest = capped(1024).extract_pdf_images(&pdf);
        assert!(!harvest.document_failed);
        assert_eq!(harvest.skipped, 1);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.images[0].source, "Im2");
    }

    // --- OOXML packages ---

    fn make_package(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const IMAGE_REL: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";

    #[test]
    fn docx_images_are_resolved_and_deduplicated() {
        let rels = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>
  <Relationship Id="rId2" Type="{IMAGE_REL}" Target="media/image1.png"/>
  <Relationship Id="rId3" Type="{IMAGE_REL}" Target="media/image1.png"/>
  <Relationship Id="rId4" Type="{IMAGE_REL}" Target="media/broken.png"/>
  <Relationship Id="rId5" Type="{IMAGE_REL}" Target="http://example.com/remote.png" TargetMode="External"/>
</Relationships>"#
        );
        let png = png_bytes(5, 7);
        let docx = make_package(&[
            ("[Content_Types].xml", b"<Types/>".as_slice()),
            ("word/document.xml", b"<w:document/>".as_slice()),
            ("word/_rels/document.xml.rels", rels.as_bytes()),
            ("word/media/image1.png", png.as_slice()),
            ("word/media/broken.png", b"not an image at all".as_slice()),
        ]);

        let harvest = EmbeddedImageExtractor::default().extract_package_images(&docx);
        assert!(!harvest.document_failed);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.skipped, 1);
        let img = &harvest.images[0];
        assert_eq!(img.source, "word/media/image1.png");
        assert_eq!((img.width, img.height), (5, 7));
        assert_eq!(img.format, "png");
        assert_eq!(img.page_number, None);
    }

    #[test]
    fn oversized_package_part_is_skipped() {
        let rels = format!(
            r#"<Relationships>
  <Relationship Id="rId1" Type="{IMAGE_REL}" Target="media/huge.png"/>
  <Relationship Id="rId2" Type="{IMAGE_REL}" Target="media/small.png"/>
</Relationships>"#
        );
        let huge = vec![0u8; 4096];
        let small = png_bytes(5, 7);
        let docx = make_package(&[
            ("word/_rels/document.xml.rels", rels.as_bytes()),
            ("word/media/huge.png", huge.as_slice()),
            ("word/media/small.png", small.as_slice()),
        ]);

        let harvest = capped(1024).extract_package_images(&docx);
        assert!(!harvest.document_failed);
        assert_eq!(harvest.skipped, 1);
        assert_eq!(harvest.len(), 1);
        assert_eq!(harvest.images[0].source, "word/media/small.png");
    }

    #[test]
    fn pptx_slide_images_get_slide_numbers() {
        let rels = |target: &str| {
            format!(
                r#"<Relationships><Relationship Id="rId1" Type="{IMAGE_REL}" Target="{target}"/></Relationships>"#
            )
        };
        let slide2_rels = rels("../media/image2.jpeg");
        let slide7_rels = rels("../media/image7.png");
        let jpeg = jpeg_bytes(8, 8);
        let png = png_bytes(3, 3);
        let pptx = make_package(&[
            ("ppt/slides/slide2.xml", b"<p:sld/>".as_slice()),
            ("ppt/slides/slide7.xml", b"<p:sld/>".as_slice()),
            ("ppt/slides/_rels/slide2.xml.rels", slide2_rels.as_bytes()),
            ("ppt/slides/_rels/slide7.xml.rels", slide7_rels.as_bytes()),
            ("ppt/media/image2.jpeg", jpeg.as_slice()),
            ("ppt/media/image7.png", png.as_slice()),
        ]);

        let harvest = EmbeddedImageExtractor::default().extract_images(&pptx);
        assert_eq!(harvest.len(), 2);
        let by_source: BTreeMap<_, _> = harvest
            .images
            .iter()
            .map(|i| (i.source.as_str(), i.page_number))
            .collect();
        assert_eq!(by_source["ppt/media/image2.jpeg"], Some(2));
        assert_eq!(by_source["ppt/media/image7.png"], Some(7));
    }

    #[test]
    fn unknown_container_is_failed_harvest() {
        let harvest = EmbeddedImageExtractor::default().extract_images(b"GIF89a....");
        assert!(harvest.document_failed);
    }

    #[test]
    fn corrupt_zip_is_failed_harvest() {
        let harvest = EmbeddedImageExtractor::default().extract_images(b"PK\x03\x04 truncated");
        assert!(harvest.document_failed);
    }

    #[test]
    fn target_resolution() {
        assert_eq!(owning_part("word/_rels/document.xml.rels"), "word/document.xml");
        assert_eq!(owning_part("_rels/.rels"), "");
        assert_eq!(resolve_target("word/document.xml", "media/a.png"), "word/media/a.png");
        assert_eq!(
            resolve_target("ppt/slides/slide1.xml", "../media/a.png"),
            "ppt/media/a.png"
        );
        assert_eq!(resolve_target("word/document.xml", "/word/media/b.png"), "word/media/b.png");
        assert_eq!(slide_number("ppt/slides/slide12.xml"), Some(12));
        assert_eq!(slide_number("ppt/slideLayouts/slideLayout1.xml"), None);
    }
}
