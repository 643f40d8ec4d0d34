//! Declaration, import and reference extraction from source code.
//!
//! Extraction is regex-based line scanning over a *masked* copy of the
//! source in which comments and string contents are blanked to spaces (byte
//! offsets are preserved). Declaration extents come from brace matching for
//! brace languages and from indentation for Python; nesting is recovered
//! from span containment afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{
    Declaration, DeclarationKind, ImportEdge, ImportedName, LineIndex, ReferenceKind,
    ReferenceSite, Span, StructuralUnit, Technology,
};

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

fn blank(out: &mut [u8], from: usize, to: usize) {
    let to = to.min(out.len());
    for b in out.iter_mut().take(to).skip(from) {
        if *b != b'\n' && *b != b'\r' {
            *b = b' ';
        }
    }
}

fn line_end(bytes: &[u8], from: usize) -> usize {
    bytes[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| from + p)
        .unwrap_or(bytes.len())
}

fn find_seq(bytes: &[u8], from: usize, seq: &[u8]) -> usize {
    if from >= bytes.len() {
        return bytes.len();
    }
    bytes[from..]
        .windows(seq.len())
        .position(|w| w == seq)
        .map(|p| from + p)
        .unwrap_or(bytes.len())
}

/// Index of the closing quote, or of the newline / end of input when the
/// literal is unterminated.
fn string_end(bytes: &[u8], from: usize, quote: u8, multiline: bool, escapes: bool) -> usize {
    let mut j = from;
    while j < bytes.len() {
        let c = bytes[j];
        if escapes && c == b'\\' {
            j += 2;
            continue;
        }
        if c == quote {
            return j;
        }
        if c == b'\n' && !multiline {
            return j;
        }
        j += 1;
    }
    bytes.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Blank comments and string-literal contents, keeping quotes, newlines and
/// byte offsets intact.
pub fn mask_source(source: &str, technology: Technology) -> String {
    let bytes = source.as_bytes();
    let n = bytes.len();
    let mut out = bytes.to_vec();
    let mut i = 0;

    while i < n {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied().unwrap_or(0);

        if technology == Technology::Python {
            if b == b'#' {
                let end = line_end(bytes, i);
                blank(&mut out, i, end);
                i = end;
                continue;
            }
            if b == b'"' || b == b'\'' {
                if next == b && bytes.get(i + 2) == Some(&b) {
                    let close = find_seq(bytes, i + 3, &[b, b, b]);
                    blank(&mut out, i + 3, close);
                    i = (close + 3).min(n);
                    continue;
                }
                let close = string_end(bytes, i + 1, b, false, true);
                blank(&mut out, i + 1, close);
                i = close + 1;
                continue;
            }
            i += 1;
            continue;
        }

        if b == b'/' && next == b'/' {
            let end = line_end(bytes, i);
            blank(&mut out, i, end);
            i = end;
            continue;
        }
        if b == b'/' && next == b'*' {
            let close = find_seq(bytes, i + 2, b"*/");
            let end = (close + 2).min(n);
            blank(&mut out, i, end);
            i = end;
            continue;
        }

        if technology == Technology::Rust {
            if b == b'r' && (i == 0 || !is_ident_byte(bytes[i - 1])) {
                let mut j = i + 1;
                while j < n && bytes[j] == b'#' {
                    j += 1;
                }
                if j < n && bytes[j] == b'"' && (j > i + 1 || next == b'"') {
                    let hashes = j - i - 1;
                    let mut k = j + 1;
                    while k < n {
                        if bytes[k] == b'"'
                            && bytes[k + 1..].iter().take(hashes).filter(|&&c| c == b'#').count()
                                == hashes
                        {
                            break;
                        }
                        k += 1;
                    }
                    blank(&mut out, j + 1, k);
                    i = (k + 1 + hashes).min(n);
                    continue;
                }
            }
            if b == b'\'' {
                if next == b'\\' {
                    let limit = (i + 12).min(n);
                    let mut j = i + 3;
                    while j < limit && bytes[j] != b'\'' {
                        j += 1;
                    }
                    if j < limit {
                        blank(&mut out, i + 1, j);
                        i = j + 1;
                        continue;
                    }
                } else if bytes.get(i + 2) == Some(&b'\'') && next != b'\'' {
                    blank(&mut out, i + 1, i + 2);
                    i += 3;
                    continue;
                }
                i += 1;
                continue;
            }
            if b == b'"' {
                let close = string_end(bytes, i + 1, b'"', true, true);
                blank(&mut out, i + 1, close);
                i = close + 1;
                continue;
            }
            i += 1;
            continue;
        }

        if technology == Technology::Java
            && b == b'"'
            && next == b'"'
            && bytes.get(i + 2) == Some(&b'"')
        {
            let close = find_seq(bytes, i + 3, b"\"\"\"");
            blank(&mut out, i + 3, close);
            i = (close + 3).min(n);
            continue;
        }

        let backtick = b == b'`'
            && matches!(
                technology,
                Technology::JavaScript | Technology::TypeScript | Technology::Go
            );
        if b == b'"' || b == b'\'' || backtick {
            let raw = backtick && technology == Technology::Go;
            let close = string_end(bytes, i + 1, b, backtick, !raw);
            blank(&mut out, i + 1, close);
            i = close + 1;
            continue;
        }
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

// ---------------------------------------------------------------------------
// Line view
// ---------------------------------------------------------------------------

struct Line<'a> {
    start: usize,
    masked: &'a str,
    source: &'a str,
}

impl Line<'_> {
    fn end(&self) -> usize {
        self.start + self.masked.len()
    }

    fn indent(&self) -> usize {
        self.masked.len() - self.masked.trim_start().len()
    }

    fn is_blank(&self) -> bool {
        self.masked.trim().is_empty()
    }
}

fn split_lines<'a>(source: &'a str, masked: &'a str) -> Vec<Line<'a>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for segment in masked.split('\n') {
        let end = start + segment.len();
        let trimmed = end - usize::from(segment.ends_with('\r'));
        lines.push(Line {
            start,
            masked: &masked[start..trimmed],
            source: source.get(start..trimmed).unwrap_or(""),
        });
        start = end + 1;
    }
    lines
}

// ---------------------------------------------------------------------------
// Compiled regex patterns
// ---------------------------------------------------------------------------

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][A-Za-z0-9_$]*").unwrap());

// -- Python --

static PY_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)").unwrap());

static PY_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*class\s+([A-Za-z_]\w*)\s*(\()?").unwrap());

static PY_ASSIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]*)?=[^=]").unwrap());

static PY_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());

static PY_FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+(\.*[\w.]*)\s+import\b").unwrap());

// -- JavaScript / TypeScript --

static JS_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:class|interface|enum)\s+([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static JS_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});

static JS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*(?::[^=]+)?=>)",
    )
    .unwrap()
});

static JS_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)").unwrap()
});

static JS_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|async|readonly|override|abstract|get|set)\s+)*\*?\s*([A-Za-z_$][\w$]*)\s*(?:<[^>]*>)?\s*\([^)]*\)\s*(?::[^{;]+)?\{",
    )
    .unwrap()
});

static JS_IMPORT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:import|export)\s+(?:type\s+)?([\s\S]*?)\s*from\s+['"]([^'"]+)['"]"#)
        .unwrap()
});

static JS_IMPORT_BARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*import\s+['"]([^'"]+)['"]"#).unwrap());

static JS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap()
});

// -- Java --

static JAVA_PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*package\s+([A-Za-z0-9_.]+)\s*;").unwrap());

static JAVA_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*import\s+(?:static\s+)?([A-Za-z0-9_.]+?)(\.\*)?\s*;").unwrap()
});

static JAVA_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|abstract|final|static|sealed|strictfp)\s+)*(?:class|interface|enum|record)\s+([A-Za-z_]\w*)",
    )
    .unwrap()
});

static JAVA_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|native|default)\s+)*(?:<[^>]*>\s*)?([\w<>\[\],.? ]+?)\s+([A-Za-z_]\w*)\s*\([^)]*\)\s*(?:throws\s+[\w., ]+)?\{",
    )
    .unwrap()
});

// -- Go --

static GO_PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*package\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

static GO_IMPORT_SINGLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*import\s+(?:[\w.]+\s+)?"([^"]+)""#).unwrap());

static GO_IMPORT_BLOCK_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s*\(").unwrap());

static GO_IMPORT_BLOCK_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*(?:[\w.]+\s+)?"([^"]+)""#).unwrap());

static GO_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*type\s+([A-Za-z_]\w*)(?:\[[^\]]*\])?\s+(?:struct|interface)\b").unwrap()
});

static GO_FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*func\s+([A-Za-z_]\w*)").unwrap());

static GO_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*func\s*\(\s*(?:[A-Za-z_]\w*\s+)?\*?\s*([A-Za-z_]\w*)(?:\[[^\]]*\])?\s*\)\s*([A-Za-z_]\w*)",
    )
    .unwrap()
});

static GO_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:const|var)\s+([A-Za-z_]\w*)").unwrap());

// -- Rust --

static RS_MOD_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_]\w*)\s*\{").unwrap()
});

static RS_MOD_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_]\w*)\s*;").unwrap()
});

static RS_USE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+").unwrap());

static RS_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:unsafe\s+)?(?:struct|enum|trait|union)\s+([A-Za-z_]\w*)",
    )
    .unwrap()
});

static RS_IMPL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:unsafe\s+)?impl\b").unwrap());

static RS_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+([A-Za-z_]\w*)"#,
    )
    .unwrap()
});

static RS_CONST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:const|static)\s+(?:mut\s+)?([A-Za-z_]\w*)\s*:")
        .unwrap()
});

// -- Decision points --

static PY_DECISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:if|elif|for|while|except|and|or|case)\b").unwrap());

static JS_DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|for|while|case|catch)\b|&&|\|\||\?\?|\?[ \t]").unwrap()
});

static JAVA_DECISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|for|while|case|catch)\b|&&|\|\||\?[ \t]+(?:extends|super)\b|\?[ \t]")
        .unwrap()
});

static GO_DECISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:if|for|case)\b|&&|\|\|").unwrap());

static RS_DECISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:if|for|while)\b|&&|\|\||=>").unwrap());

fn decision_re(technology: Technology) -> &'static Regex {
    match technology {
        Technology::Python => &PY_DECISION_RE,
        Technology::JavaScript | Technology::TypeScript => &JS_DECISION_RE,
        Technology::Java => &JAVA_DECISION_RE,
        Technology::Go => &GO_DECISION_RE,
        Technology::Rust => &RS_DECISION_RE,
    }
}

/// Count branch points in masked source text.
pub fn count_decision_points(masked: &str, technology: Technology) -> u32 {
    decision_re(technology)
        .find_iter(masked)
        .filter(|m| {
            // Java wildcard generics are not ternaries.
            !(technology == Technology::Java
                && m.as_str().starts_with('?')
                && m.as_str().trim_end().len() > 1)
        })
        .count() as u32
}

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

const PY_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield", "self", "cls", "match", "case",
];

const JS_KEYWORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete",
    "do", "else", "enum", "export", "extends", "false", "finally", "for", "function", "if",
    "implements", "import", "in", "instanceof", "interface", "let", "new", "null", "return",
    "super", "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while",
    "with", "yield", "async", "await", "static", "public", "private", "protected", "readonly",
    "type", "as", "from", "of", "undefined", "abstract", "declare", "get", "set", "keyof",
    "string", "number", "boolean", "any", "unknown", "never", "object",
];

const JAVA_KEYWORDS: &[&str] = &[
    "abstract", "assert", "boolean", "break", "byte", "case", "catch", "char", "class",
    "const", "continue", "default", "do", "double", "else", "enum", "extends", "final",
    "finally", "float", "for", "if", "implements", "import", "instanceof", "int", "interface",
    "long", "native", "new", "package", "private", "protected", "public", "return", "short",
    "static", "super", "switch", "synchronized", "this", "throw", "throws", "transient", "try",
    "void", "volatile", "while", "true", "false", "null", "var", "record", "sealed", "permits",
];

const GO_KEYWORDS: &[&str] = &[
    "break", "case", "chan", "const", "continue", "default", "defer", "else", "fallthrough",
    "for", "func", "go", "goto", "if", "import", "interface", "map", "package", "range",
    "return", "select", "struct", "switch", "type", "var", "nil", "true", "false", "string",
    "int", "int64", "int32", "uint", "byte", "bool", "error", "float64", "any",
];

const RS_KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while", "union", "i8", "i16", "i32", "i64", "i128",
    "isize", "u8", "u16", "u32", "u64", "u128", "usize", "f32", "f64", "bool", "char", "str",
];

fn keywords(technology: Technology) -> &'static [&'static str] {
    match technology {
        Technology::Python => PY_KEYWORDS,
        Technology::JavaScript | Technology::TypeScript => JS_KEYWORDS,
        Technology::Java => JAVA_KEYWORDS,
        Technology::Go => GO_KEYWORDS,
        Technology::Rust => RS_KEYWORDS,
    }
}

const STATEMENT_WORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "new", "else", "throw", "function",
    "synchronized", "do", "try", "await", "yield", "case",
];

// ---------------------------------------------------------------------------
// Module naming
// ---------------------------------------------------------------------------

/// Dotted module name for a file path (`pkg/mod.py` -> `pkg.mod`).
pub fn to_module_name(path: &str) -> String {
    let without_ext = match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => &path[..dot],
        _ => path,
    };
    without_ext
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join(".")
}

fn rust_module_path(path: &str) -> String {
    let rel = match path.rfind("src/") {
        Some(idx) if idx == 0 || path.as_bytes()[idx - 1] == b'/' => &path[idx + 4..],
        _ => path,
    };
    let mut parts: Vec<&str> = rel.trim_end_matches(".rs").split('/').collect();
    if matches!(parts.last(), Some(&"mod") | Some(&"lib") | Some(&"main")) {
        parts.pop();
    }
    parts.join("::")
}

fn separator(technology: Technology) -> &'static str {
    if technology == Technology::Rust {
        "::"
    } else {
        "."
    }
}

// ---------------------------------------------------------------------------
// Declaration candidates
// ---------------------------------------------------------------------------

struct Candidate {
    kind: DeclarationKind,
    name: String,
    name_start: usize,
    name_end: usize,
    line: usize,
    /// Only valid directly inside a class body.
    member_only: bool,
    /// Go method receiver type.
    owner: Option<String>,
    inherit: Option<(usize, usize)>,
    impl_label: Option<String>,
    newline_terminates: bool,
}

impl Candidate {
    fn new(kind: DeclarationKind, line: usize, line_start: usize, m: regex::Match<'_>) -> Self {
        Self {
            kind,
            name: m.as_str().to_string(),
            name_start: line_start + m.start(),
            name_end: line_start + m.end(),
            line,
            member_only: false,
            owner: None,
            inherit: None,
            impl_label: None,
            newline_terminates: false,
        }
    }
}

/// Range from `keyword` (first match after `from`) to the next `{` on the line.
fn keyword_range(line: &Line<'_>, from: usize, keywords: &[&str]) -> Option<(usize, usize)> {
    let rel_from = from.saturating_sub(line.start).min(line.masked.len());
    let tail = &line.masked[rel_from..];
    let start = keywords
        .iter()
        .filter_map(|kw| {
            IDENT_RE
                .find_iter(tail)
                .find(|m| m.as_str() == *kw)
                .map(|m| m.start())
        })
        .min()?;
    let end = tail[start..]
        .find('{')
        .map(|p| start + p)
        .unwrap_or(tail.len());
    Some((line.start + rel_from + start, line.start + rel_from + end))
}

fn match_close(masked: &[u8], open: usize, open_ch: u8, close_ch: u8) -> Option<usize> {
    let mut depth = 0i32;
    for (i, &b) in masked.iter().enumerate().skip(open) {
        if b == open_ch {
            depth += 1;
        } else if b == close_ch {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

fn python_candidates(lines: &[Line<'_>], masked: &[u8]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = PY_DEF_RE.captures(line.masked) {
            if let Some(m) = caps.get(1) {
                out.push(Candidate::new(DeclarationKind::Function, idx, line.start, m));
            }
            continue;
        }
        if let Some(caps) = PY_CLASS_RE.captures(line.masked) {
            if let Some(m) = caps.get(1) {
                let mut cand = Candidate::new(DeclarationKind::Class, idx, line.start, m);
                if let Some(paren) = caps.get(2) {
                    let open = line.start + paren.start();
                    if let Some(close) = match_close(masked, open, b'(', b')') {
                        cand.inherit = Some((open + 1, close));
                    }
                }
                out.push(cand);
            }
            continue;
        }
        if let Some(caps) = PY_ASSIGN_RE.captures(line.masked) {
            if let Some(m) = caps.get(1) {
                if !PY_KEYWORDS.contains(&m.as_str()) {
                    out.push(Candidate::new(DeclarationKind::Variable, idx, line.start, m));
                }
            }
        }
    }
    out
}

fn js_candidates(lines: &[Line<'_>]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(m) = JS_CLASS_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Class, idx, line.start, m);
            cand.inherit = keyword_range(line, cand.name_end, &["extends", "implements"]);
            out.push(cand);
            continue;
        }
        if let Some(m) = JS_FUNCTION_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Function, idx, line.start, m));
            continue;
        }
        if let Some(m) = JS_ARROW_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Function, idx, line.start, m);
            cand.newline_terminates = true;
            out.push(cand);
            continue;
        }
        if let Some(m) = JS_VAR_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Variable, idx, line.start, m);
            cand.newline_terminates = true;
            out.push(cand);
            continue;
        }
        if let Some(m) = JS_METHOD_RE.captures(line.masked).and_then(|c| c.get(1)) {
            if !STATEMENT_WORDS.contains(&m.as_str()) {
                let mut cand = Candidate::new(DeclarationKind::Function, idx, line.start, m);
                cand.member_only = true;
                out.push(cand);
            }
        }
    }
    out
}

fn java_candidates(lines: &[Line<'_>]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(m) = JAVA_CLASS_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Class, idx, line.start, m);
            cand.inherit = keyword_range(line, cand.name_end, &["extends", "implements"]);
            out.push(cand);
            continue;
        }
        if let Some(caps) = JAVA_METHOD_RE.captures(line.masked) {
            let (Some(ty), Some(m)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let first_type_word = ty.as_str().split_whitespace().next().unwrap_or("");
            if STATEMENT_WORDS.contains(&m.as_str()) || STATEMENT_WORDS.contains(&first_type_word)
            {
                continue;
            }
            let mut cand = Candidate::new(DeclarationKind::Function, idx, line.start, m);
            cand.member_only = true;
            out.push(cand);
        }
    }
    out
}

fn go_candidates(lines: &[Line<'_>]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(m) = GO_TYPE_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Class, idx, line.start, m));
            continue;
        }
        if let Some(caps) = GO_METHOD_RE.captures(line.masked) {
            if let (Some(recv), Some(m)) = (caps.get(1), caps.get(2)) {
                let mut cand = Candidate::new(DeclarationKind::Function, idx, line.start, m);
                cand.owner = Some(recv.as_str().to_string());
                out.push(cand);
            }
            continue;
        }
        if let Some(m) = GO_FUNCTION_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Function, idx, line.start, m));
            continue;
        }
        if let Some(m) = GO_VAR_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Variable, idx, line.start, m);
            cand.newline_terminates = true;
            out.push(cand);
        }
    }
    out
}

fn rust_candidates(lines: &[Line<'_>]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(m) = RS_MOD_BLOCK_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Module, idx, line.start, m));
            continue;
        }
        if let Some(m) = RS_TYPE_RE.captures(line.masked).and_then(|c| c.get(1)) {
            let mut cand = Candidate::new(DeclarationKind::Class, idx, line.start, m);
            let after = &line.masked[m.end()..];
            if after.trim_start().starts_with(':') {
                let colon = m.end() + after.find(':').unwrap_or(0);
                let end = line.masked[colon..]
                    .find(['{', ';'])
                    .map(|p| colon + p)
                    .unwrap_or(line.masked.len());
                cand.inherit = Some((line.start + colon + 1, line.start + end));
            }
            out.push(cand);
            continue;
        }
        if let Some(m) = RS_IMPL_RE.find(line.masked) {
            if let Some(cand) = rust_impl_candidate(line, idx, m.end()) {
                out.push(cand);
            }
            continue;
        }
        if let Some(m) = RS_FN_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Function, idx, line.start, m));
            continue;
        }
        if let Some(m) = RS_CONST_RE.captures(line.masked).and_then(|c| c.get(1)) {
            out.push(Candidate::new(DeclarationKind::Variable, idx, line.start, m));
        }
    }
    out
}

/// Skip a balanced `<...>` group starting at `pos`, if there is one.
fn skip_generics(text: &[u8], mut pos: usize) -> usize {
    while pos < text.len() && text[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if text.get(pos) != Some(&b'<') {
        return pos;
    }
    let mut depth = 0i32;
    while pos < text.len() {
        match text[pos] {
            b'<' => depth += 1,
            b'>' => {
                depth -= 1;
                if depth == 0 {
                    return pos + 1;
                }
            }
            _ => {}
        }
        pos += 1;
    }
    pos
}

/// Last path segment of a type expression in `text[from..to]`, before any
/// generic arguments.
fn type_name_in(text: &str, from: usize, to: usize) -> Option<(usize, usize)> {
    let slice = &text[from..to];
    let head_end = slice.find('<').unwrap_or(slice.len());
    IDENT_RE
        .find_iter(&slice[..head_end])
        .filter(|m| !matches!(m.as_str(), "dyn" | "mut"))
        .last()
        .map(|m| (from + m.start(), from + m.end()))
}

fn rust_impl_candidate(line: &Line<'_>, idx: usize, after_impl: usize) -> Option<Candidate> {
    let text = line.masked;
    let bytes = text.as_bytes();
    let header_start = skip_generics(bytes, after_impl);
    let header_end = text[header_start..]
        .find('{')
        .map(|p| header_start + p)
        .unwrap_or(text.len());
    let header = &text[header_start..header_end];
    let header = header.split(" where ").next().unwrap_or(header);
    let header_end = header_start + header.len();

    let (trait_range, type_from) = match header.find(" for ") {
        Some(pos) => (Some((header_start, header_start + pos)), header_start + pos + 5),
        None => (None, header_start),
    };
    let (name_start, name_end) = type_name_in(text, type_from, header_end)?;
    let name = text[name_start..name_end].to_string();
    let label = match trait_range {
        Some((s, e)) => format!("{} for {}", text[s..e].trim(), name),
        None => name.clone(),
    };
    Some(Candidate {
        kind: DeclarationKind::Impl,
        name,
        name_start: line.start + name_start,
        name_end: line.start + name_end,
        line: idx,
        member_only: false,
        owner: None,
        inherit: trait_range.map(|(s, e)| (line.start + s, line.start + e)),
        impl_label: Some(label),
        newline_terminates: false,
    })
}

// ---------------------------------------------------------------------------
// Extents
// ---------------------------------------------------------------------------

/// Whether a statement obviously continues past the newline at `nl`.
fn continues_past(masked: &[u8], line_start: usize, nl: usize) -> bool {
    masked[line_start..nl]
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| b"=([,+-*/?:.{&|<>!".contains(b))
        .unwrap_or(true)
}

/// End offset (exclusive) of a brace-language declaration whose name ends
/// at `from`.
fn brace_extent(masked: &[u8], from: usize, newline_terminates: bool) -> usize {
    let n = masked.len();
    let mut depth = 0i32;
    let mut line_start = masked[..from]
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    let mut i = from;
    while i < n {
        match masked[i] {
            b'(' | b'[' => depth += 1,
            b')' | b']' => {
                depth -= 1;
                if depth < 0 {
                    return i;
                }
            }
            b'{' if depth == 0 => {
                return match_close(masked, i, b'{', b'}')
                    .map(|c| c + 1)
                    .unwrap_or(n);
            }
            b';' if depth == 0 => return i + 1,
            b'\n' => {
                if depth == 0 && newline_terminates && !continues_past(masked, line_start, i) {
                    let mut end = i;
                    while end > from && masked[end - 1].is_ascii_whitespace() {
                        end -= 1;
                    }
                    return end;
                }
                line_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    n
}

/// Index of the last line of a Python header that may span lines.
fn python_header_end(lines: &[Line<'_>], line: usize) -> usize {
    let mut depth = 0i32;
    let mut idx = line;
    loop {
        for b in lines[idx].masked.bytes() {
            match b {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth -= 1,
                _ => {}
            }
        }
        if depth <= 0 || idx + 1 >= lines.len() {
            return idx;
        }
        idx += 1;
    }
}

/// Per line, whether it starts inside a triple-quoted string.
fn python_string_lines(lines: &[Line<'_>]) -> Vec<bool> {
    let mut open: Option<u8> = None;
    lines
        .iter()
        .map(|line| {
            let starts_inside = open.is_some();
            let text = line.masked.as_bytes();
            let mut i = 0;
            while i + 3 <= text.len() {
                let window = &text[i..i + 3];
                if window == b"\"\"\"" || window == b"'''" {
                    match open {
                        None => open = Some(window[0]),
                        Some(delim) if delim == window[0] => open = None,
                        Some(_) => {}
                    }
                    i += 3;
                } else {
                    i += 1;
                }
            }
            starts_inside
        })
        .collect()
}

/// Index of the last line belonging to a Python block opened at `line`.
fn python_block_end(
    lines: &[Line<'_>],
    in_string: &[bool],
    line: usize,
    header_end: usize,
) -> usize {
    let indent = lines[line].indent();
    let mut last = header_end;
    for (j, candidate) in lines.iter().enumerate().skip(header_end + 1) {
        if candidate.is_blank() || in_string[j] {
            if in_string[j] {
                last = j;
            }
            continue;
        }
        if candidate.indent() > indent {
            last = j;
        } else {
            break;
        }
    }
    last
}

fn python_nesting(
    lines: &[Line<'_>],
    in_string: &[bool],
    line: usize,
    header_end: usize,
    last: usize,
) -> u32 {
    let mut stack = vec![lines[line].indent()];
    let mut max_depth = 0usize;
    for (j, candidate) in lines.iter().enumerate().take(last + 1).skip(header_end + 1) {
        if candidate.is_blank() || in_string[j] {
            continue;
        }
        let indent = candidate.indent();
        while stack.len() > 1 && indent <= *stack.last().unwrap_or(&0) {
            stack.pop();
        }
        if indent > *stack.last().unwrap_or(&0) {
            stack.push(indent);
        }
        max_depth = max_depth.max(stack.len() - 1);
    }
    max_depth.saturating_sub(1) as u32
}

fn brace_nesting(masked: &[u8], span: Span) -> u32 {
    let mut depth = 0i32;
    let mut max_depth = 0i32;
    for &b in &masked[span.start..span.end.min(masked.len())] {
        match b {
            b'{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' => depth -= 1,
            _ => {}
        }
    }
    (max_depth - 1).max(0) as u32
}

// ---------------------------------------------------------------------------
// Tree assembly
// ---------------------------------------------------------------------------

struct Flat {
    cand: Candidate,
    span: Span,
    complexity: u32,
    max_nesting: u32,
    parent: Option<usize>,
}

fn assemble(
    idx: usize,
    flats: &[Flat],
    children: &[Vec<usize>],
    qualified: &[String],
) -> Declaration {
    let flat = &flats[idx];
    Declaration {
        name: flat.cand.name.clone(),
        qualified_name: qualified[idx].clone(),
        kind: flat.cand.kind,
        span: flat.span,
        name_span: Span::new(
            flat.cand.name_start,
            flat.cand.name_end,
            flat.span.start_line,
            flat.span.start_line,
        ),
        complexity: flat.complexity,
        max_nesting: flat.max_nesting,
        children: children[idx]
            .iter()
            .map(|&c| assemble(c, flats, children, qualified))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

struct ImportScan {
    imports: Vec<ImportEdge>,
    /// Statement ranges (imports and package clauses) excluded from references.
    excluded: Vec<(usize, usize)>,
    package: Option<String>,
}

/// Imported identifiers in `masked[from..to]`, skipping aliases after `as`.
fn names_in(
    masked: &str,
    from: usize,
    to: usize,
    skip: &[&str],
    index: &LineIndex,
) -> Vec<ImportedName> {
    let slice = &masked[from..to];
    let mut names = Vec::new();
    let mut after_as = false;
    for m in IDENT_RE.find_iter(slice) {
        let word = m.as_str();
        if word == "as" {
            after_as = true;
            continue;
        }
        if after_as {
            after_as = false;
            continue;
        }
        if skip.contains(&word) {
            continue;
        }
        names.push(ImportedName {
            name: word.to_string(),
            span: index.span(from + m.start(), from + m.end()),
        });
    }
    names
}

/// End offset of the first line, starting at `line`, whose masked text
/// satisfies `done`. Gives up after `limit` lines.
fn statement_end(
    lines: &[Line<'_>],
    line: usize,
    limit: usize,
    done: impl Fn(&str) -> bool,
) -> usize {
    for candidate in lines.iter().skip(line).take(limit) {
        if done(candidate.masked) {
            return candidate.end();
        }
    }
    lines[line].end()
}

fn scan_imports(
    lines: &[Line<'_>],
    source: &str,
    masked: &str,
    technology: Technology,
    index: &LineIndex,
) -> ImportScan {
    let mut scan = ImportScan {
        imports: Vec::new(),
        excluded: Vec::new(),
        package: None,
    };
    let mut go_block = false;

    for (idx, line) in lines.iter().enumerate() {
        let head = line.masked.trim_start();
        let start = line.start + line.indent();
        match technology {
            Technology::Python => {
                if head.starts_with("import ") {
                    if let Some(caps) = PY_IMPORT_RE.captures(line.masked) {
                        let list = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                        for part in list.split(',') {
                            let module = part.split_whitespace().next().unwrap_or("");
                            if module.is_empty() {
                                continue;
                            }
                            scan.imports.push(ImportEdge {
                                raw: line.source.trim().to_string(),
                                module: module.to_string(),
                                names: Vec::new(),
                                span: index.span(start, line.end()),
                            });
                        }
                        scan.excluded.push((start, line.end()));
                    }
                } else if head.starts_with("from ") {
                    if let Some(caps) = PY_FROM_RE.captures(line.masked) {
                        let module = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
                        let names_from = line.start + caps.get(0).map(|m| m.end()).unwrap_or(0);
                        let end = if line.masked.contains('(') && !line.masked.contains(')') {
                            statement_end(lines, idx, 64, |l| l.contains(')'))
                        } else {
                            line.end()
                        };
                        let names = names_in(masked, names_from, end, &[], index);
                        scan.imports.push(ImportEdge {
                            raw: source[start..end].trim().to_string(),
                            module,
                            names,
                            span: index.span(start, end),
                        });
                        scan.excluded.push((start, end));
                    }
                }
            }
            Technology::JavaScript | Technology::TypeScript => {
                let is_statement = head.starts_with("import")
                    || head.starts_with("export {")
                    || head.starts_with("export type {")
                    || head.starts_with("export *");
                if is_statement {
                    let end = if head.contains('{') && !head.contains('}') {
                        statement_end(lines, idx, 64, |l| l.contains("from") || l.contains(';'))
                    } else {
                        line.end()
                    };
                    let text = &source[start..end];
                    if let Some(caps) = JS_IMPORT_FROM_RE.captures(text) {
                        let (Some(clause), Some(module)) = (caps.get(1), caps.get(2)) else {
                            continue;
                        };
                        let names = names_in(
                            masked,
                            start + clause.start(),
                            start + clause.end(),
                            &["type", "default"],
                            index,
                        );
                        scan.imports.push(ImportEdge {
                            raw: text.trim().to_string(),
                            module: module.as_str().to_string(),
                            names,
                            span: index.span(start, end),
                        });
                        scan.excluded.push((start, end));
                        continue;
                    }
                    if let Some(module) = JS_IMPORT_BARE_RE.captures(text).and_then(|c| c.get(1)) {
                        scan.imports.push(ImportEdge {
                            raw: text.trim().to_string(),
                            module: module.as_str().to_string(),
                            names: Vec::new(),
                            span: index.span(start, end),
                        });
                        scan.excluded.push((start, end));
                        continue;
                    }
                }
                if line.masked.contains("require") || line.masked.contains("import") {
                    for caps in JS_REQUIRE_RE.captures_iter(line.source) {
                        let (Some(all), Some(module)) = (caps.get(0), caps.get(1)) else {
                            continue;
                        };
                        let s = line.start + all.start();
                        let e = line.start + all.end();
                        scan.imports.push(ImportEdge {
                            raw: all.as_str().to_string(),
                            module: module.as_str().to_string(),
                            names: Vec::new(),
                            span: index.span(s, e),
                        });
                        scan.excluded.push((s, e));
                    }
                }
            }
            Technology::Java => {
                if let Some(caps) = JAVA_PACKAGE_RE.captures(line.masked) {
                    scan.package = caps.get(1).map(|m| m.as_str().to_string());
                    scan.excluded.push((start, line.end()));
                    continue;
                }
                if let Some(caps) = JAVA_IMPORT_RE.captures(line.masked) {
                    let Some(module) = caps.get(1) else { continue };
                    let wildcard = caps.get(2).is_some();
                    let mut names = Vec::new();
                    if !wildcard {
                        let segment_start = module.as_str().rfind('.').map(|p| p + 1).unwrap_or(0);
                        let s = line.start + module.start() + segment_start;
                        names.push(ImportedName {
                            name: module.as_str()[segment_start..].to_string(),
                            span: index.span(s, line.start + module.end()),
                        });
                    }
                    let module_name = if wildcard {
                        format!("{}.*", module.as_str())
                    } else {
                        module.as_str().to_string()
                    };
                    scan.imports.push(ImportEdge {
                        raw: line.source.trim().to_string(),
                        module: module_name,
                        names,
                        span: index.span(start, line.end()),
                    });
                    scan.excluded.push((start, line.end()));
                }
            }
            Technology::Go => {
                if let Some(caps) = GO_PACKAGE_RE.captures(line.masked) {
                    scan.package = caps.get(1).map(|m| m.as_str().to_string());
                    scan.excluded.push((start, line.end()));
                    continue;
                }
                if GO_IMPORT_BLOCK_START_RE.is_match(line.masked) {
                    go_block = true;
                    scan.excluded.push((start, line.end()));
                    continue;
                }
                if go_block {
                    if head.starts_with(')') {
                        go_block = false;
                    } else if let Some(module) =
                        GO_IMPORT_BLOCK_LINE_RE.captures(line.source).and_then(|c| c.get(1))
                    {
                        scan.imports.push(ImportEdge {
                            raw: line.source.trim().to_string(),
                            module: module.as_str().to_string(),
                            names: Vec::new(),
                            span: index.span(start, line.end()),
                        });
                    }
                    scan.excluded.push((start, line.end()));
                    continue;
                }
                if head.starts_with("import") {
                    if let Some(module) =
                        GO_IMPORT_SINGLE_RE.captures(line.source).and_then(|c| c.get(1))
                    {
                        scan.imports.push(ImportEdge {
                            raw: line.source.trim().to_string(),
                            module: module.as_str().to_string(),
                            names: Vec::new(),
                            span: index.span(start, line.end()),
                        });
                        scan.excluded.push((start, line.end()));
                    }
                }
            }
            Technology::Rust => {
                if let Some(m) = RS_MOD_DECL_RE.captures(line.masked).and_then(|c| c.get(1)) {
                    scan.imports.push(ImportEdge {
                        raw: line.source.trim().to_string(),
                        module: format!("self::{}", m.as_str()),
                        names: Vec::new(),
                        span: index.span(start, line.end()),
                    });
                    scan.excluded.push((start, line.end()));
                    continue;
                }
                if let Some(m) = RS_USE_RE.find(line.masked) {
                    let end = statement_end(lines, idx, 64, |l| l.contains(';'));
                    let path_from = line.start + m.end();
                    let text = &masked[path_from..end];
                    let stmt = text.split(';').next().unwrap_or(text);
                    let (module, names) = match stmt.find('{') {
                        Some(brace) => {
                            let close = stmt.rfind('}').unwrap_or(stmt.len());
                            let names = names_in(
                                masked,
                                path_from + brace + 1,
                                path_from + close.max(brace + 1),
                                &["self", "super", "crate"],
                                index,
                            );
                            (stmt[..brace].trim().trim_end_matches("::").to_string(), names)
                        }
                        None => {
                            let lead = stmt.len() - stmt.trim_start().len();
                            let path = stmt.split(" as ").next().unwrap_or(stmt).trim();
                            let last = path.rsplit("::").next().unwrap_or(path);
                            let names = if last.is_empty() || last == "*" {
                                Vec::new()
                            } else {
                                let s = path_from + lead + path.len() - last.len();
                                vec![ImportedName {
                                    name: last.to_string(),
                                    span: index.span(s, s + last.len()),
                                }]
                            };
                            (path.to_string(), names)
                        }
                    };
                    scan.imports.push(ImportEdge {
                        raw: source[start..end].trim().to_string(),
                        module,
                        names,
                        span: index.span(start, end),
                    });
                    scan.excluded.push((start, end));
                }
            }
        }
    }
    scan
}

// ---------------------------------------------------------------------------
// Extraction entry point
// ---------------------------------------------------------------------------

/// Extract the structural unit of one file. `masked` must come from
/// [`mask_source`] for the same text and technology.
pub fn extract(path: &str, source: &str, masked: &str, technology: Technology) -> StructuralUnit {
    let lines = split_lines(source, masked);
    let index = LineIndex::new(source);
    let masked_bytes = masked.as_bytes();
    let imports = scan_imports(&lines, source, masked, technology, &index);

    let mut candidates = match technology {
        Technology::Python => python_candidates(&lines, masked_bytes),
        Technology::JavaScript | Technology::TypeScript => js_candidates(&lines),
        Technology::Java => java_candidates(&lines),
        Technology::Go => go_candidates(&lines),
        Technology::Rust => rust_candidates(&lines),
    };
    candidates.retain(|c| {
        !imports
            .excluded
            .iter()
            .any(|&(s, e)| s <= c.name_start && c.name_start < e)
    });

    // -- extents and metrics ------------------------------------------------
    let in_string = if technology == Technology::Python {
        python_string_lines(&lines)
    } else {
        Vec::new()
    };
    let mut flats: Vec<Flat> = candidates
        .into_iter()
        .map(|cand| {
            let line = &lines[cand.line];
            let start = line.start + line.indent();
            let (end, nesting) = if technology == Technology::Python {
                let header_end = python_header_end(&lines, cand.line);
                if cand.kind == DeclarationKind::Variable {
                    (lines[header_end].end(), 0)
                } else {
                    let last = python_block_end(&lines, &in_string, cand.line, header_end);
                    let nesting =
                        python_nesting(&lines, &in_string, cand.line, header_end, last);
                    (lines[last].end(), nesting)
                }
            } else {
                let end = brace_extent(masked_bytes, cand.name_end, cand.newline_terminates);
                let span = Span::new(start, end.max(start), 0, 0);
                (end.max(start), brace_nesting(masked_bytes, span))
            };
            let span = index.span(start, end);
            let complexity = 1 + count_decision_points(&masked[span.start..span.end], technology);
            Flat {
                cand,
                span,
                complexity,
                max_nesting: nesting,
                parent: None,
            }
        })
        .collect();
    flats.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then(b.span.end.cmp(&a.span.end))
            .then(a.cand.name_start.cmp(&b.cand.name_start))
    });

    // -- nesting ------------------------------------------------------------
    let mut accepted: Vec<Flat> = Vec::with_capacity(flats.len());
    let mut stack: Vec<usize> = Vec::new();
    for mut flat in flats {
        while let Some(&top) = stack.last() {
            if accepted[top].span.encloses(&flat.span) && accepted[top].span != flat.span {
                break;
            }
            stack.pop();
        }
        let parent = stack.last().copied();
        let parent_kind = parent.map(|p| accepted[p].cand.kind);
        if flat.cand.member_only
            && !matches!(parent_kind, Some(DeclarationKind::Class | DeclarationKind::Impl))
        {
            continue;
        }
        if flat.cand.kind == DeclarationKind::Variable {
            let mut cursor = parent;
            let mut inside_function = false;
            while let Some(p) = cursor {
                if accepted[p].cand.kind == DeclarationKind::Function {
                    inside_function = true;
                    break;
                }
                cursor = accepted[p].parent;
            }
            if inside_function {
                continue;
            }
        }
        flat.parent = parent;
        stack.push(accepted.len());
        accepted.push(flat);
    }

    // -- qualified names ----------------------------------------------------
    let sep = separator(technology);
    let prefix = match technology {
        Technology::Python => {
            let module = to_module_name(path);
            module
                .strip_suffix(".__init__")
                .map(str::to_string)
                .unwrap_or(module)
        }
        Technology::JavaScript | Technology::TypeScript => to_module_name(path),
        Technology::Java | Technology::Go => imports.package.clone().unwrap_or_default(),
        Technology::Rust => rust_module_path(path),
    };
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut qualified: Vec<String> = Vec::with_capacity(accepted.len());
    for i in 0..accepted.len() {
        let mut chain: Vec<String> = Vec::new();
        let mut cursor = accepted[i].parent;
        while let Some(p) = cursor {
            chain.push(accepted[p].cand.name.clone());
            cursor = accepted[p].parent;
        }
        chain.reverse();
        if let Some(owner) = &accepted[i].cand.owner {
            chain.push(owner.clone());
        }
        match &accepted[i].cand.impl_label {
            Some(label) => chain.push(format!("impl {label}")),
            None => chain.push(accepted[i].cand.name.clone()),
        }
        let mut name = if prefix.is_empty() {
            chain.join(sep)
        } else {
            format!("{prefix}{sep}{}", chain.join(sep))
        };
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            name = format!("{name}#{count}");
        }
        qualified.push(name);
    }

    // -- references ---------------------------------------------------------
    let symbol_names: HashSet<usize> = accepted
        .iter()
        .filter(|f| f.cand.kind.is_symbol())
        .map(|f| f.cand.name_start)
        .collect();
    let inherit: Vec<(usize, usize)> = accepted.iter().filter_map(|f| f.cand.inherit).collect();
    let kw = keywords(technology);
    let mut references = Vec::new();
    let mut open: Vec<usize> = Vec::new();
    let mut next_decl = 0;
    for m in IDENT_RE.find_iter(masked) {
        let offset = m.start();
        if offset > 0 && is_ident_byte(masked_bytes[offset - 1]) {
            continue;
        }
        let word = m.as_str();
        if kw.contains(&word) || symbol_names.contains(&offset) {
            continue;
        }
        if imports
            .excluded
            .iter()
            .any(|&(s, e)| s <= offset && offset < e)
        {
            continue;
        }
        while next_decl < accepted.len() && accepted[next_decl].span.start <= offset {
            while open
                .last()
                .is_some_and(|&top| accepted[top].span.end <= accepted[next_decl].span.start)
            {
                open.pop();
            }
            open.push(next_decl);
            next_decl += 1;
        }
        while open.last().is_some_and(|&top| accepted[top].span.end <= offset) {
            open.pop();
        }
        let kind = if inherit.iter().any(|&(s, e)| s <= offset && offset < e) {
            ReferenceKind::Inherit
        } else if masked[m.end()..].trim_start().starts_with('(') {
            ReferenceKind::Call
        } else {
            ReferenceKind::Use
        };
        references.push(ReferenceSite {
            name: word.to_string(),
            span: index.span(m.start(), m.end()),
            kind,
            enclosing: open.last().map(|&top| qualified[top].clone()),
        });
    }

    // -- tree -----------------------------------------------------------------
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); accepted.len()];
    let mut roots = Vec::new();
    for (i, flat) in accepted.iter().enumerate() {
        match flat.parent {
            Some(p) => children[p].push(i),
            None => roots.push(i),
        }
    }
    let declarations: Vec<Declaration> = roots
        .iter()
        .map(|&r| assemble(r, &accepted, &children, &qualified))
        .collect();
    let max_nesting = accepted.iter().map(|f| f.max_nesting).max().unwrap_or(0);

    StructuralUnit {
        declarations,
        imports: imports.imports,
        references,
        decision_points: count_decision_points(masked, technology),
        max_nesting,
    }
}
