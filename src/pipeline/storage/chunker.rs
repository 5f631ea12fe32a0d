use serde::{Deserialize, Serialize};

use super::types::{Chunker, TextChunk};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_chars: usize,
    pub min_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1000,
            min_chunk_chars: 20,
            overlap_chars: 100,
        }
    }
}

/// Splits document text by headings first, then by paragraphs for large
/// sections, then by sentence boundaries for oversized paragraphs.
#[derive(Debug, Clone, Default)]
pub struct SectionChunker {
    config: ChunkingConfig,
}

impl SectionChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }
}

impl Chunker for SectionChunker {
    fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let mut chunks = Vec::new();
        let mut chunk_index = 0;

        for section in split_by_headings(text) {
            if section.content.len() <= self.config.max_chunk_chars {
                // merge_tiny_chunks handles small ones
                chunks.push(TextChunk {
                    content: section.content,
                    chunk_index,
                    section_title: section.title,
                    char_offset: section.offset,
                });
                chunk_index += 1;
            } else {
                chunks.extend(split_section_by_paragraphs(
                    &section,
                    &self.config,
                    &mut chunk_index,
                ));
            }
        }

        merge_tiny_chunks(&mut chunks, self.config.min_chunk_chars);
        chunks
    }
}

struct Section {
    title: Option<String>,
    content: String,
    offset: usize,
}

fn heading_title(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
        Some(trimmed[hashes..].trim())
    } else {
        None
    }
}

fn split_by_headings(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_title: Option<String> = None;
    let mut current_content = String::new();
    let mut current_offset = 0;
    let mut char_pos = 0;

    for line in text.lines() {
        if let Some(title) = heading_title(line) {
            if !current_content.trim().is_empty() {
                sections.push(Section {
                    title: current_title.take(),
                    content: current_content.trim().to_string(),
                    offset: current_offset,
                });
            }
            current_title = Some(title.to_string());
            current_content = String::new();
            current_offset = char_pos;
        } else {
            current_content.push_str(line);
            current_content.push('\n');
        }
        char_pos += line.len() + 1;
    }

    if !current_content.trim().is_empty() {
        sections.push(Section {
            title: current_title,
            content: current_content.trim().to_string(),
            offset: current_offset,
        });
    }

    sections
}

/// Largest char boundary in `s` that is `<= index`.
fn floor_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn split_section_by_paragraphs(
    section: &Section,
    config: &ChunkingConfig,
    chunk_index: &mut usize,
) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut char_offset = section.offset;

    for para in section.content.split("\n\n") {
        if current.len() + para.len() > config.max_chunk_chars && !current.is_empty() {
            chunks.push(TextChunk {
                content: current.trim().to_string(),
                chunk_index: *chunk_index,
                section_title: section.title.clone(),
                char_offset,
            });
            *chunk_index += 1;

            if current.len() > config.overlap_chars {
                let overlap_start = floor_boundary(&current, current.len() - config.overlap_chars);
                current = current[overlap_start..].to_string();
                char_offset += overlap_start;
            } else {
                current.clear();
            }
        }

        if para.len() > config.max_chunk_chars {
            chunks.extend(split_long_paragraph(
                para,
                &section.title,
                char_offset,
                config,
                chunk_index,
            ));
            char_offset += para.len();
            current.clear();
        } else {
            current.push_str(para);
            current.push_str("\n\n");
        }
    }

    if !current.trim().is_empty() {
        chunks.push(TextChunk {
            content: current.trim().to_string(),
            chunk_index: *chunk_index,
            section_title: section.title.clone(),
            char_offset,
        });
        *chunk_index += 1;
    }

    chunks
}

fn split_long_paragraph(
    para: &str,
    title: &Option<String>,
    base_offset: usize,
    config: &ChunkingConfig,
    chunk_index: &mut usize,
) -> Vec<TextChunk> {
    let max_chars = config.max_chunk_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < para.len() {
        let end = floor_boundary(para, start + max_chars);

        // Prefer a sentence boundary (". ") within the last 20% of the window
        let break_at = if end < para.len() {
            let search_start = floor_boundary(para, start + (max_chars * 4 / 5));
            para[search_start..end]
                .rfind(". ")
                .map(|pos| search_start + pos + 2)
                .unwrap_or(end)
        } else {
            end
        };
        // A window narrower than one character still has to advance.
        let break_at = if break_at <= start {
            para[start..]
                .char_indices()
                .nth(1)
                .map_or(para.len(), |(i, _)| start + i)
        } else {
            break_at
        };

        chunks.push(TextChunk {
            content: para[start..break_at].trim().to_string(),
            chunk_index: *chunk_index,
            section_title: title.clone(),
            char_offset: base_offset + start,
        });
        *chunk_index += 1;

        if break_at >= para.len() {
            break;
        }

        let next = if break_at > config.overlap_chars {
            floor_boundary(para, break_at - config.overlap_chars)
        } else {
            break_at
        };
        start = if next > start { next } else { break_at };
    }

    chunks
}

fn merge_tiny_chunks(chunks: &mut Vec<TextChunk>, min_chars: usize) {
    let mut i = 0;
    while i < chunks.len() {
        if chunks[i].content.len() < min_chars && i + 1 < chunks.len() {
            let next = chunks.remove(i + 1);
            chunks[i].content.push_str("\n\n");
            chunks[i].content.push_str(&next.content);
        } else {
            i += 1;
        }
    }
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.chunk_index = i;
    }
}
