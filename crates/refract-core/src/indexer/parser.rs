//! Parsing entry point and syntax-error detection.
//!
//! Declarations and references come from the line scanners in `symbols`.
//! This module decides where a file is malformed, using native tree-sitter
//! grammars where one is available and a brace-balance check for the rest,
//! and folds those regions into the structural unit.

use tree_sitter::{Language, Node, Parser};

use crate::indexer::symbols;
use crate::models::{Declaration, DeclarationKind, LineIndex, Span, StructuralUnit, Technology};

/// A file that parsed only partially. `partial` still carries everything
/// the scanner extracted, plus one `Unparsed` declaration per bad region.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub reason: String,
    pub partial: StructuralUnit,
}

/// Parse one file into its structural unit.
pub fn parse(
    path: &str,
    content: &str,
    technology: Technology,
) -> Result<StructuralUnit, ParseFailure> {
    let masked = symbols::mask_source(content, technology);
    let mut unit = symbols::extract(path, content, &masked, technology);
    let regions = malformed_regions(content, &masked, technology);
    let Some(first) = regions.first() else {
        return Ok(unit);
    };
    let reason = format!(
        "{} malformed region(s), first at line {}",
        regions.len(),
        first.start_line
    );
    for (i, region) in regions.iter().enumerate() {
        let name = format!("<unparsed:{}>", region.start_line);
        unit.declarations.push(Declaration {
            qualified_name: format!("{name}#{}", i + 1),
            name,
            kind: DeclarationKind::Unparsed,
            span: *region,
            name_span: Span::new(
                region.start,
                region.start,
                region.start_line,
                region.start_line,
            ),
            complexity: 0,
            max_nesting: 0,
            children: Vec::new(),
        });
    }
    unit.declarations.sort_by_key(|d| (d.span.start, d.kind == DeclarationKind::Unparsed));
    Err(ParseFailure {
        reason,
        partial: unit,
    })
}

/// Grammar for technologies that have one compiled in.
pub fn grammar_for(technology: Technology) -> Option<Language> {
    let language = match technology {
        Technology::Python => tree_sitter_python::LANGUAGE,
        Technology::Java => tree_sitter_java::LANGUAGE,
        Technology::TypeScript => tree_sitter_typescript::LANGUAGE_TSX,
        Technology::JavaScript => tree_sitter_typescript::LANGUAGE_TSX,
        Technology::Go => tree_sitter_go::LANGUAGE,
        Technology::Rust => return None,
    };
    Some(language.into())
}

/// Byte regions the parser could not make sense of, in source order.
///
/// `masked` is the source with comments and string contents blanked, as
/// produced by the scanner; it drives the fallback brace check.
pub fn malformed_regions(source: &str, masked: &str, technology: Technology) -> Vec<Span> {
    let lines = LineIndex::new(source);
    if let Some(language) = grammar_for(technology) {
        let mut parser = Parser::new();
        if parser.set_language(&language).is_ok() {
            if let Some(tree) = parser.parse(source.as_bytes(), None) {
                let mut regions = Vec::new();
                collect_errors(tree.root_node(), &lines, &mut regions);
                regions.sort();
                regions.dedup();
                return regions;
            }
        }
    }
    unbalanced_brackets(masked, &lines)
}

fn collect_errors(node: Node<'_>, lines: &LineIndex, out: &mut Vec<Span>) {
    if node.is_error() || node.is_missing() {
        out.push(lines.span(node.start_byte(), node.end_byte()));
        return;
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_errors(child, lines, out);
    }
}

/// Unmatched closers, and openers still open at end of file.
fn unbalanced_brackets(masked: &str, lines: &LineIndex) -> Vec<Span> {
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut regions = Vec::new();
    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'{' | b'(' | b'[' => stack.push((b, i)),
            b'}' | b')' | b']' => {
                let expected = match b {
                    b'}' => b'{',
                    b')' => b'(',
                    _ => b'[',
                };
                match stack.last() {
                    Some(&(open, _)) if open == expected => {
                        stack.pop();
                    }
                    _ => regions.push(lines.span(i, i + 1)),
                }
            }
            _ => {}
        }
    }
    for (_, start) in stack {
        regions.push(lines.span(start, masked.len()));
    }
    regions.sort();
    regions
}
