//! Shared typed models used across indexing, graph, query and refactor layers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Technology
// ---------------------------------------------------------------------------

/// Source technology detected from a file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Go,
    Rust,
}

const TECHNOLOGY_BY_EXTENSION: &[(&str, Technology)] = &[
    ("py", Technology::Python),
    ("js", Technology::JavaScript),
    ("jsx", Technology::JavaScript),
    ("mjs", Technology::JavaScript),
    ("cjs", Technology::JavaScript),
    ("ts", Technology::TypeScript),
    ("tsx", Technology::TypeScript),
    ("java", Technology::Java),
    ("go", Technology::Go),
    ("rs", Technology::Rust),
];

impl Technology {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        TECHNOLOGY_BY_EXTENSION
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, tech)| *tech)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Technology::Python => "python",
            Technology::JavaScript => "javascript",
            Technology::TypeScript => "typescript",
            Technology::Java => "java",
            Technology::Go => "go",
            Technology::Rust => "rust",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Span
// ---------------------------------------------------------------------------

/// Half-open byte range `[start, end)` with 1-based inclusive line numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub start_line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, start_line: usize, end_line: usize) -> Self {
        Self {
            start,
            end,
            start_line,
            end_line,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// True if the two ranges share at least one byte. Zero-width spans only
    /// overlap a range that strictly contains their position.
    pub fn overlaps(&self, other: &Span) -> bool {
        if self.is_empty() || other.is_empty() {
            let (point, range) = if self.is_empty() {
                (self.start, other)
            } else {
                (other.start, self)
            };
            return range.start < point && point < range.end;
        }
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn encloses(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Maps byte offsets to 1-based line numbers.
#[derive(Clone, Debug)]
pub struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self {
            starts,
            len: text.len(),
        }
    }

    /// 1-based line containing `offset`.
    pub fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Byte offset where 1-based `line` starts, clamped to the text length.
    pub fn line_start(&self, line: usize) -> usize {
        self.starts
            .get(line.saturating_sub(1))
            .copied()
            .unwrap_or(self.len)
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    pub fn span(&self, start: usize, end: usize) -> Span {
        let last = if end > start { end - 1 } else { start };
        Span::new(start, end, self.line_of(start), self.line_of(last))
    }
}

// ---------------------------------------------------------------------------
// FileRecord
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ParseStatus {
    Unparsed,
    Parsed,
    ParseFailed { reason: String },
}

impl ParseStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, ParseStatus::ParseFailed { .. })
    }
}

/// A single indexed file. `path` is root-relative with `/` separators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub technology: Technology,
    pub fingerprint: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub mtime_ns: u128,
    pub line_count: usize,
    pub status: ParseStatus,
}

// ---------------------------------------------------------------------------
// Structural unit
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Module,
    Class,
    /// Rust `impl` block. Owns methods but is not itself a named symbol.
    Impl,
    Function,
    Variable,
    /// Opaque region the parser could not make sense of.
    Unparsed,
}

impl DeclarationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeclarationKind::Module => "module",
            DeclarationKind::Class => "class",
            DeclarationKind::Impl => "impl",
            DeclarationKind::Function => "function",
            DeclarationKind::Variable => "variable",
            DeclarationKind::Unparsed => "unparsed",
        }
    }

    /// Kinds that can be targeted by name and resolved from references.
    pub fn is_symbol(self) -> bool {
        !matches!(self, DeclarationKind::Impl | DeclarationKind::Unparsed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub qualified_name: String,
    pub kind: DeclarationKind,
    pub span: Span,
    pub name_span: Span,
    pub complexity: u32,
    pub max_nesting: u32,
    pub children: Vec<Declaration>,
}

impl Declaration {
    /// Preorder walk over this declaration and its descendants.
    pub fn walk(&self) -> Vec<&Declaration> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(decl) = stack.pop() {
            out.push(decl);
            for child in decl.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    pub fn methods(&self) -> impl Iterator<Item = &Declaration> {
        self.children
            .iter()
            .filter(|c| c.kind == DeclarationKind::Function)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    pub span: Span,
}

/// An import statement as written in the source file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEdge {
    pub raw: String,
    pub module: String,
    pub names: Vec<ImportedName>,
    pub span: Span,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Call,
    Inherit,
    Use,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSite {
    pub name: String,
    pub span: Span,
    pub kind: ReferenceKind,
    /// Qualified name of the innermost enclosing declaration.
    pub enclosing: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralUnit {
    pub declarations: Vec<Declaration>,
    pub imports: Vec<ImportEdge>,
    pub references: Vec<ReferenceSite>,
    pub decision_points: u32,
    pub max_nesting: u32,
}

impl StructuralUnit {
    /// Every declaration in preorder.
    pub fn all_declarations(&self) -> Vec<&Declaration> {
        self.declarations.iter().flat_map(|d| d.walk()).collect()
    }

    pub fn find_qualified(&self, qualified_name: &str) -> Option<&Declaration> {
        self.all_declarations()
            .into_iter()
            .find(|d| d.qualified_name == qualified_name)
    }
}

// ---------------------------------------------------------------------------
// Symbol ids and scopes
// ---------------------------------------------------------------------------

/// Identity of a declaration inside one index generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId {
    pub path: String,
    pub qualified_name: String,
}

impl SymbolId {
    pub fn new(path: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            qualified_name: qualified_name.into(),
        }
    }

    /// Stable 31-bit key, stored beside declarations in snapshot exports.
    pub fn numeric(&self) -> i64 {
        let key = format!("{}::{}", self.path, self.qualified_name);
        (crc32fast::hash(key.as_bytes()) & 0x7FFF_FFFF) as i64
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.path, self.qualified_name)
    }
}

/// Path-prefix filter for read operations. Empty means the whole index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub paths: Vec<String>,
}

impl Scope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|p| p.into().trim_end_matches('/').to_string())
                .collect(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        if self.paths.is_empty() {
            return true;
        }
        self.paths.iter().any(|prefix| {
            prefix.is_empty()
                || path == prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_technology_from_extension() {
        assert_eq!(Technology::from_extension(".py"), Some(Technology::Python));
        assert_eq!(Technology::from_extension("TSX"), Some(Technology::TypeScript));
        assert_eq!(Technology::from_extension("rs"), Some(Technology::Rust));
        assert_eq!(Technology::from_extension("md"), None);
    }

    #[test]
    fn test_span_overlap() {
        let a = Span::new(0, 10, 1, 1);
        let b = Span::new(5, 15, 1, 1);
        let c = Span::new(10, 12, 1, 1);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        let insert_inside = Span::new(5, 5, 1, 1);
        let insert_edge = Span::new(10, 10, 1, 1);
        assert!(a.overlaps(&insert_inside));
        assert!(!a.overlaps(&insert_edge));
    }

    #[test]
    fn test_line_index() {
        let text = "ab\ncd\n\nef";
        let idx = LineIndex::new(text);
        assert_eq!(idx.line_count(), 4);
        assert_eq!(idx.line_of(0), 1);
        assert_eq!(idx.line_of(2), 1);
        assert_eq!(idx.line_of(3), 2);
        assert_eq!(idx.line_of(6), 3);
        assert_eq!(idx.line_of(7), 4);
        assert_eq!(idx.line_start(2), 3);
        assert_eq!(idx.line_start(9), text.len());
        let span = idx.span(3, 6);
        assert_eq!((span.start_line, span.end_line), (2, 2));
    }

    #[test]
    fn test_scope_contains() {
        let scope = Scope::paths(["src/app/"]);
        assert!(scope.contains("src/app/main.py"));
        assert!(scope.contains("src/app"));
        assert!(!scope.contains("src/application.py"));
        assert!(Scope::all().contains("anything.rs"));
    }

    #[test]
    fn test_declaration_walk_is_preorder() {
        let leaf = |name: &str| Declaration {
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind: DeclarationKind::Function,
            span: Span::default(),
            name_span: Span::default(),
            complexity: 1,
            max_nesting: 0,
            children: vec![],
        };
        let mut class = leaf("A");
        class.kind = DeclarationKind::Class;
        class.children = vec![leaf("a1"), leaf("a2")];
        let names: Vec<&str> = class.walk().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["A", "a1", "a2"]);
        assert_eq!(class.methods().count(), 2);
    }
}
