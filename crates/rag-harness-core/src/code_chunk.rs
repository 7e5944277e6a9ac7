//! Line-window code chunker with a regex symbol pass.
//!
//! Code is windowed by line count rather than by tokens. Windows hold
//! `min_loc..=max_loc` lines and prefer to end right before a function or
//! class declaration, so each chunk tends to hold whole definitions.
//! Consecutive windows share `overlap_loc` lines.
//!
//! The same regex pass that finds the declaration boundaries also builds
//! a [`SymbolMap`] of functions, classes, and imports.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::chunk::estimate_tokens;
use crate::models::{Chunk, ChunkMetadata, ChunkMethod, Symbol, SymbolKind, SymbolMap};

/// Source languages with dedicated symbol patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    Rust,
    Java,
    Go,
    Cpp,
}

impl Language {
    /// Detect the language from a file extension.
    pub fn from_path(path: &Path) -> Option<Language> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" | "pyi" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "vue" => Some(Language::JavaScript),
            "rs" => Some(Language::Rust),
            "java" | "kt" => Some(Language::Java),
            "go" => Some(Language::Go),
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "hh" => Some(Language::Cpp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Go => "go",
            Language::Cpp => "cpp",
        }
    }

    const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::Rust,
        Language::Java,
        Language::Go,
        Language::Cpp,
    ];
}

struct SymbolPattern {
    language: Language,
    kind: SymbolKind,
    regex: Regex,
}

fn patterns() -> &'static [SymbolPattern] {
    static PATTERNS: OnceLock<Vec<SymbolPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        use Language::*;
        use SymbolKind::*;
        let raw: &[(Language, SymbolKind, &str)] = &[
            (Python, Function, r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)"),
            (Python, Class, r"^\s*class\s+([A-Za-z_]\w*)"),
            (Python, Import, r"^\s*import\s+([\w.]+)"),
            (Python, Import, r"^\s*from\s+([\w.]+)\s+import\b"),
            (
                JavaScript,
                Function,
                r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
            ),
            (
                JavaScript,
                Function,
                r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>",
            ),
            (
                JavaScript,
                Class,
                r"^\s*(?:export\s+)?(?:default\s+)?class\s+([A-Za-z_$][\w$]*)",
            ),
            (JavaScript, Import, r#"^\s*import\s+(?:.*?\s+from\s+)?['"]([^'"]+)['"]"#),
            (
                Rust,
                Function,
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?fn\s+([A-Za-z_]\w*)",
            ),
            (
                Rust,
                Class,
                r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+([A-Za-z_]\w*)",
            ),
            (Rust, Import, r"^\s*(?:pub\s+)?use\s+([\w:]+)"),
            (
                Java,
                Class,
                r"^\s*(?:(?:public|private|protected|abstract|final|static)\s+)*(?:class|interface|enum)\s+([A-Za-z_]\w*)",
            ),
            (
                Java,
                Function,
                r"^\s*(?:public|private|protected)\s+(?:(?:static|final|synchronized|abstract)\s+)*[\w<>\[\],\s]+?\s+([A-Za-z_]\w*)\s*\(",
            ),
            (Java, Import, r"^\s*import\s+(?:static\s+)?([\w.]+)\s*;"),
            (Go, Function, r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)"),
            (Go, Class, r"^type\s+([A-Za-z_]\w*)\s+(?:struct|interface)\b"),
            (Go, Import, r#"^\s*import\s+"([^"]+)""#),
            (Cpp, Class, r"^\s*(?:class|struct)\s+([A-Za-z_]\w*)\s*(?::|\{|$)"),
            (Cpp, Import, r#"^\s*#\s*include\s*[<"]([^>"]+)[>"]"#),
            (
                Cpp,
                Function,
                r"^(?:[\w:<>,\*&]+\s+)+\**([A-Za-z_]\w*)\s*\([^;]*\)\s*(?:const\s*)?\{?\s*$",
            ),
        ];
        raw.iter()
            .filter_map(|(language, kind, pattern)| {
                Regex::new(pattern).ok().map(|regex| SymbolPattern {
                    language: *language,
                    kind: *kind,
                    regex,
                })
            })
            .collect()
    })
}

/// Chunk code of unknown language, trying every language's patterns.
pub fn chunk_code(code: &str, min_loc: usize, max_loc: usize, overlap_loc: usize) -> (Vec<Chunk>, SymbolMap) {
    chunk_code_as(code, None, min_loc, max_loc, overlap_loc)
}

/// Chunk code using the patterns of `language` (all languages when `None`).
pub fn chunk_code_as(
    code: &str,
    language: Option<Language>,
    min_loc: usize,
    max_loc: usize,
    overlap_loc: usize,
) -> (Vec<Chunk>, SymbolMap) {
    if code.trim().is_empty() {
        return (Vec::new(), Vec::new());
    }

    let max_loc = max_loc.max(1);
    let min_loc = min_loc.clamp(1, max_loc);
    let overlap = overlap_loc.min(min_loc - 1);

    let lines: Vec<&str> = code.split_inclusive('\n').collect();
    let found = find_symbols(&lines, language);
    let boundaries: Vec<usize> = found
        .iter()
        .filter(|(_, kind, _)| *kind != SymbolKind::Import)
        .map(|(line, _, _)| *line)
        .collect();

    let ranges = line_windows(lines.len(), &boundaries, min_loc, max_loc, overlap);

    let chunks: Vec<Chunk> = ranges
        .iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let text: String = lines[*start..*end].concat();
            let mut metadata = ChunkMetadata::new(ChunkMethod::Code);
            metadata.start_line = Some(start + 1);
            metadata.end_line = Some(*end);
            metadata.language = language.map(|l| l.as_str().to_string());
            Chunk {
                chunk_index: i,
                token_estimate: estimate_tokens(&text),
                text,
                metadata,
            }
        })
        .collect();

    let symbols = found
        .into_iter()
        .map(|(line, kind, name)| Symbol {
            chunk_index: ranges
                .iter()
                .position(|(s, e)| line >= *s && line < *e)
                .unwrap_or(0),
            name,
            kind,
            line: line + 1,
        })
        .collect();

    (chunks, symbols)
}

/// Returns `(0-based line, kind, name)` for every recognized symbol, one per line.
fn find_symbols(lines: &[&str], language: Option<Language>) -> Vec<(usize, SymbolKind, String)> {
    let allowed: &[Language] = match language {
        Some(ref l) => std::slice::from_ref(l),
        None => &Language::ALL,
    };
    let mut found = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let line = line.trim_end_matches(['\n', '\r']);
        let hit = patterns()
            .iter()
            .filter(|p| allowed.contains(&p.language))
            .find_map(|p| {
                p.regex
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .map(|m| (p.kind, m.as_str().to_string()))
            });
        if let Some((kind, name)) = hit {
            found.push((idx, kind, name));
        }
    }
    found
}

/// Compute `[start, end)` line windows over `total` lines.
fn line_windows(total: usize, boundaries: &[usize], min_loc: usize, max_loc: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;

    while start < total {
        let hard_end = (start + max_loc).min(total);
        let mut end = hard_end;
        if hard_end < total {
            if let Some(&d) = boundaries
                .iter()
                .rev()
                .find(|&&d| d >= start + min_loc && d <= hard_end)
            {
                end = d;
            }
        }
        out.push((start, end));
        if end >= total {
            break;
        }
        start = if end - start > overlap { end - overlap } else { end };
    }

    // An undersized tail folds into its predecessor, which then owns the final lines.
    if out.len() >= 2 {
        let (last_start, last_end) = out[out.len() - 1];
        if last_end - last_start < min_loc {
            out.pop();
            if let Some(prev) = out.last_mut() {
                prev.1 = last_end;
            }
        }
    }
    out
}
