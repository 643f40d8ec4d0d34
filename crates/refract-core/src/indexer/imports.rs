//! Import resolution from language-specific import records to indexed files.
//!
//! Resolution order: an exact path present in the index, then the
//! technology's module naming convention. More than one distinct candidate
//! is reported as ambiguous, never guessed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ImportEdge, Technology};

/// Why an import did not resolve to indexed files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// Looks project-local but no indexed file matches.
    NotFound,
    /// Several indexed files match equally well.
    Ambiguous { candidates: Vec<String> },
    /// Standard library or third-party module.
    External,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// One or more target files. Several targets only arise when the import
    /// names a package directory (Go, Java wildcard) or several submodules.
    Resolved(Vec<String>),
    Unresolved(UnresolvedReason),
}

/// Index-wide facts resolution depends on.
pub struct ResolveContext<'a> {
    pub paths: &'a BTreeSet<String>,
    pub go_module: Option<&'a str>,
}

const JAVA_SOURCE_ROOTS: &[&str] = &["", "src/main/java/", "src/test/java/", "src/"];
const PYTHON_SOURCE_ROOTS: &[&str] = &["", "src/"];
const TS_SUFFIXES: &[&str] = &[
    "", ".ts", ".tsx", ".d.ts", ".js", ".jsx", ".mjs", ".cjs", "/index.ts", "/index.tsx",
    "/index.js", "/index.jsx",
];

fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|i| &path[..i]).unwrap_or("")
}

fn join(dir: &str, rest: &str) -> String {
    if dir.is_empty() {
        rest.to_string()
    } else {
        format!("{dir}/{rest}")
    }
}

pub fn normalize_posix_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            _ => stack.push(part),
        }
    }
    stack.join("/")
}

/// Files directly inside `dir` with the given extension, sorted.
fn files_in_dir(paths: &BTreeSet<String>, dir: &str, ext: &str) -> Vec<String> {
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    };
    paths
        .range(prefix.clone()..)
        .take_while(|p| p.starts_with(&prefix))
        .filter(|p| !p[prefix.len()..].contains('/') && p.ends_with(ext))
        .cloned()
        .collect()
}

/// Turn a candidate list into a resolution; `empty` is used when nothing
/// matched.
fn decide(mut found: Vec<String>, empty: UnresolvedReason) -> Resolution {
    found.sort();
    found.dedup();
    match found.len() {
        0 => Resolution::Unresolved(empty),
        1 => Resolution::Resolved(found),
        _ => Resolution::Unresolved(UnresolvedReason::Ambiguous { candidates: found }),
    }
}

fn existing(paths: &BTreeSet<String>, candidates: impl IntoIterator<Item = String>) -> Vec<String> {
    candidates
        .into_iter()
        .map(|c| normalize_posix_path(&c))
        .filter(|c| paths.contains(c))
        .collect()
}

// ---------------------------------------------------------------------------
// Per-technology conventions
// ---------------------------------------------------------------------------

fn resolve_python(source_path: &str, import: &ImportEdge, paths: &BTreeSet<String>) -> Resolution {
    let module = import.module.as_str();
    let levels = module.chars().take_while(|&c| c == '.').count();
    let suffix = &module[levels..];

    if levels == 0 {
        let base = module.replace('.', "/");
        let found = existing(
            paths,
            PYTHON_SOURCE_ROOTS
                .iter()
                .flat_map(|root| [format!("{root}{base}.py"), format!("{root}{base}/__init__.py")]),
        );
        return decide(found, UnresolvedReason::External);
    }

    let mut base_dir = parent_dir(source_path).to_string();
    for _ in 1..levels {
        base_dir = parent_dir(&base_dir).to_string();
    }
    if !suffix.is_empty() {
        let base = join(&base_dir, &suffix.replace('.', "/"));
        let found = existing(paths, [format!("{base}.py"), format!("{base}/__init__.py")]);
        return decide(found, UnresolvedReason::NotFound);
    }

    // `from . import a, b`: each name may be a submodule or a package member.
    let package_init = existing(paths, [join(&base_dir, "__init__.py")]);
    let mut targets = Vec::new();
    for name in &import.names {
        let base = join(&base_dir, &name.name);
        let found = existing(paths, [format!("{base}.py"), format!("{base}/__init__.py")]);
        match found.len() {
            0 => targets.extend(package_init.iter().cloned()),
            1 => targets.extend(found),
            _ => {
                return Resolution::Unresolved(UnresolvedReason::Ambiguous { candidates: found });
            }
        }
    }
    if import.names.is_empty() {
        targets.extend(package_init);
    }
    targets.sort();
    targets.dedup();
    if targets.is_empty() {
        Resolution::Unresolved(UnresolvedReason::NotFound)
    } else {
        Resolution::Resolved(targets)
    }
}

fn resolve_typescript(source_path: &str, module: &str, paths: &BTreeSet<String>) -> Resolution {
    if !module.starts_with('.') {
        return Resolution::Unresolved(UnresolvedReason::External);
    }
    let base = normalize_posix_path(&join(parent_dir(source_path), module));
    if paths.contains(&base) {
        return Resolution::Resolved(vec![base]);
    }
    let found = existing(paths, TS_SUFFIXES.iter().map(|s| format!("{base}{s}")));
    decide(found, UnresolvedReason::NotFound)
}

fn resolve_java(module: &str, paths: &BTreeSet<String>) -> Resolution {
    if let Some(package) = module.strip_suffix(".*") {
        let dir = package.replace('.', "/");
        let mut found: Vec<String> = JAVA_SOURCE_ROOTS
            .iter()
            .flat_map(|root| files_in_dir(paths, &format!("{root}{dir}"), ".java"))
            .collect();
        found.sort();
        found.dedup();
        return if found.is_empty() {
            Resolution::Unresolved(UnresolvedReason::External)
        } else {
            Resolution::Resolved(found)
        };
    }

    // Full name first; a static import or nested class drops one segment.
    let mut name = module;
    for _ in 0..2 {
        let rel = name.replace('.', "/");
        let found = existing(
            paths,
            JAVA_SOURCE_ROOTS.iter().map(|root| format!("{root}{rel}.java")),
        );
        if !found.is_empty() {
            return decide(found, UnresolvedReason::External);
        }
        match name.rfind('.') {
            Some(dot) => name = &name[..dot],
            None => break,
        }
    }
    Resolution::Unresolved(UnresolvedReason::External)
}

fn resolve_go(
    source_path: &str,
    module: &str,
    go_module: Option<&str>,
    paths: &BTreeSet<String>,
) -> Resolution {
    let dir = if module.starts_with('.') {
        normalize_posix_path(&join(parent_dir(source_path), module))
    } else {
        let Some(root) = go_module else {
            return Resolution::Unresolved(UnresolvedReason::External);
        };
        match module.strip_prefix(root) {
            Some("") => String::new(),
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
            _ => return Resolution::Unresolved(UnresolvedReason::External),
        }
    };
    let found = files_in_dir(paths, &dir, ".go");
    if found.is_empty() {
        Resolution::Unresolved(UnresolvedReason::NotFound)
    } else {
        Resolution::Resolved(found)
    }
}

/// Directory holding the crate root (`lib.rs` / `main.rs`) for a Rust file.
fn rust_crate_dir(source_path: &str, paths: &BTreeSet<String>) -> String {
    let mut dir = parent_dir(source_path);
    loop {
        if paths.contains(&join(dir, "lib.rs")) || paths.contains(&join(dir, "main.rs")) {
            return dir.to_string();
        }
        if dir.is_empty() {
            break;
        }
        dir = parent_dir(dir);
    }
    let mut dir = parent_dir(source_path);
    while !dir.is_empty() {
        if dir == "src" || dir.ends_with("/src") {
            return dir.to_string();
        }
        dir = parent_dir(dir);
    }
    parent_dir(source_path).to_string()
}

/// Module path of a Rust file relative to its crate directory.
fn rust_module_segments(crate_dir: &str, source_path: &str) -> Vec<String> {
    let rel = if crate_dir.is_empty() {
        source_path
    } else {
        source_path
            .strip_prefix(crate_dir)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(source_path)
    };
    let mut segments: Vec<String> = rel
        .trim_end_matches(".rs")
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if matches!(segments.last().map(String::as_str), Some("mod" | "lib" | "main")) {
        segments.pop();
    }
    segments
}

fn rust_module_files(
    crate_dir: &str,
    source_path: &str,
    segments: &[String],
    paths: &BTreeSet<String>,
) -> Vec<String> {
    if segments.is_empty() {
        let main = join(crate_dir, "main.rs");
        let lib = join(crate_dir, "lib.rs");
        if source_path == main || !paths.contains(&lib) {
            return existing(paths, [main]);
        }
        return vec![lib];
    }
    let base = join(crate_dir, &segments.join("/"));
    existing(paths, [format!("{base}.rs"), format!("{base}/mod.rs")])
}

fn is_rust_mod_decl(raw: &str) -> bool {
    raw.split_whitespace().any(|w| w == "mod") && !raw.split_whitespace().any(|w| w == "use")
}

fn resolve_rust(source_path: &str, import: &ImportEdge, paths: &BTreeSet<String>) -> Resolution {
    let crate_dir = rust_crate_dir(source_path, paths);
    let own = rust_module_segments(&crate_dir, source_path);
    let mut parts: Vec<&str> = import
        .module
        .split("::")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut absolute: Vec<String> = match parts.first().copied() {
        Some("crate") => {
            parts.remove(0);
            Vec::new()
        }
        Some("self") => {
            parts.remove(0);
            own.clone()
        }
        Some("super") => {
            let mut base = own.clone();
            while parts.first() == Some(&"super") {
                parts.remove(0);
                base.pop();
            }
            base
        }
        Some(first) => {
            let mut child = own.clone();
            child.push(first.to_string());
            if rust_module_files(&crate_dir, source_path, &child, paths).is_empty() {
                return Resolution::Unresolved(UnresolvedReason::External);
            }
            own.clone()
        }
        None => return Resolution::Unresolved(UnresolvedReason::NotFound),
    };
    let prefix_len = absolute.len();
    absolute.extend(parts.iter().map(|s| s.to_string()));

    if is_rust_mod_decl(&import.raw) {
        let found = rust_module_files(&crate_dir, source_path, &absolute, paths);
        return decide(found, UnresolvedReason::NotFound);
    }

    // Longest module prefix wins; the tail names items inside that module.
    for k in (prefix_len..=absolute.len()).rev() {
        let found = rust_module_files(&crate_dir, source_path, &absolute[..k], paths);
        if !found.is_empty() {
            return decide(found, UnresolvedReason::NotFound);
        }
    }
    Resolution::Unresolved(UnresolvedReason::NotFound)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Resolve one import of `source_path` against the indexed path set.
pub fn resolve(
    source_path: &str,
    technology: Technology,
    import: &ImportEdge,
    ctx: &ResolveContext<'_>,
) -> Resolution {
    let module = import.module.as_str();
    if module.is_empty() {
        return Resolution::Unresolved(UnresolvedReason::NotFound);
    }

    // Exact relative path, as written.
    if module.starts_with("./") || module.starts_with("../") {
        let exact = normalize_posix_path(&join(parent_dir(source_path), module));
        if ctx.paths.contains(&exact) {
            return Resolution::Resolved(vec![exact]);
        }
    } else if module.contains('/') && ctx.paths.contains(module) {
        return Resolution::Resolved(vec![module.to_string()]);
    }

    let resolution = match technology {
        Technology::Python => resolve_python(source_path, import, ctx.paths),
        Technology::JavaScript | Technology::TypeScript => {
            resolve_typescript(source_path, module, ctx.paths)
        }
        Technology::Java => resolve_java(module, ctx.paths),
        Technology::Go => resolve_go(source_path, module, ctx.go_module, ctx.paths),
        Technology::Rust => resolve_rust(source_path, import, ctx.paths),
    };
    if let Resolution::Unresolved(reason) = &resolution {
        if *reason != UnresolvedReason::External {
            debug!(path = source_path, module, ?reason, "import not resolved");
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImportedName, Span};

    fn paths(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn import(module: &str) -> ImportEdge {
        ImportEdge {
            raw: format!("import {module}"),
            module: module.to_string(),
            names: Vec::new(),
            span: Span::default(),
        }
    }

    fn resolve_in(
        source: &str,
        tech: Technology,
        edge: &ImportEdge,
        set: &BTreeSet<String>,
    ) -> Resolution {
        let ctx = ResolveContext {
            paths: set,
            go_module: Some("example.com/app"),
        };
        resolve(source, tech, edge, &ctx)
    }

    #[test]
    fn test_python_absolute_and_relative() {
        let set = paths(&["pkg/__init__.py", "pkg/a.py", "pkg/sub/b.py", "main.py"]);
        assert_eq!(
            resolve_in("main.py", Technology::Python, &import("pkg.a"), &set),
            Resolution::Resolved(vec!["pkg/a.py".to_string()])
        );
        assert_eq!(
            resolve_in("pkg/sub/b.py", Technology::Python, &import("..a"), &set),
            Resolution::Resolved(vec!["pkg/a.py".to_string()])
        );
        assert_eq!(
            resolve_in("main.py", Technology::Python, &import("os.path"), &set),
            Resolution::Unresolved(UnresolvedReason::External)
        );
        assert_eq!(
            resolve_in("pkg/a.py", Technology::Python, &import(".missing"), &set),
            Resolution::Unresolved(UnresolvedReason::NotFound)
        );
    }

    #[test]
    fn test_python_from_dot_import_names() {
        let set = paths(&["pkg/__init__.py", "pkg/a.py", "pkg/b.py"]);
        let mut edge = import(".");
        edge.names = ["a", "helper"]
            .iter()
            .map(|n| ImportedName {
                name: n.to_string(),
                span: Span::default(),
            })
            .collect();
        assert_eq!(
            resolve_in("pkg/b.py", Technology::Python, &edge, &set),
            Resolution::Resolved(vec!["pkg/__init__.py".to_string(), "pkg/a.py".to_string()])
        );
    }

    #[test]
    fn test_python_module_and_package_is_ambiguous() {
        let set = paths(&["util.py", "util/__init__.py", "main.py"]);
        match resolve_in("main.py", Technology::Python, &import("util"), &set) {
            Resolution::Unresolved(UnresolvedReason::Ambiguous { candidates }) => {
                assert_eq!(candidates, vec!["util.py", "util/__init__.py"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_typescript_probing() {
        let set = paths(&["src/a.ts", "src/lib/index.ts", "src/both.ts", "src/both.js"]);
        assert_eq!(
            resolve_in("src/main.ts", Technology::TypeScript, &import("./a"), &set),
            Resolution::Resolved(vec!["src/a.ts".to_string()])
        );
        assert_eq!(
            resolve_in("src/main.ts", Technology::TypeScript, &import("./lib"), &set),
            Resolution::Resolved(vec!["src/lib/index.ts".to_string()])
        );
        assert_eq!(
            resolve_in("src/main.ts", Technology::TypeScript, &import("./a.ts"), &set),
            Resolution::Resolved(vec!["src/a.ts".to_string()])
        );
        assert!(matches!(
            resolve_in("src/main.ts", Technology::TypeScript, &import("./both"), &set),
            Resolution::Unresolved(UnresolvedReason::Ambiguous { .. })
        ));
        assert_eq!(
            resolve_in("src/main.ts", Technology::TypeScript, &import("react"), &set),
            Resolution::Unresolved(UnresolvedReason::External)
        );
    }

    #[test]
    fn test_java_source_roots_and_wildcards() {
        let set = paths(&[
            "src/main/java/com/ex/A.java",
            "src/main/java/com/ex/B.java",
            "src/main/java/com/ex/inner/C.java",
        ]);
        assert_eq!(
            resolve_in("x.java", Technology::Java, &import("com.ex.A"), &set),
            Resolution::Resolved(vec!["src/main/java/com/ex/A.java".to_string()])
        );
        assert_eq!(
            resolve_in("x.java", Technology::Java, &import("com.ex.A.helper"), &set),
            Resolution::Resolved(vec!["src/main/java/com/ex/A.java".to_string()])
        );
        assert_eq!(
            resolve_in("x.java", Technology::Java, &import("com.ex.*"), &set),
            Resolution::Resolved(vec![
                "src/main/java/com/ex/A.java".to_string(),
                "src/main/java/com/ex/B.java".to_string(),
            ])
        );
        assert_eq!(
            resolve_in("x.java", Technology::Java, &import("java.util.List"), &set),
            Resolution::Unresolved(UnresolvedReason::External)
        );
    }

    #[test]
    fn test_go_module_packages() {
        let set = paths(&["go.mod", "main.go", "server/a.go", "server/b.go", "server/x/c.go"]);
        assert_eq!(
            resolve_in("main.go", Technology::Go, &import("example.com/app/server"), &set),
            Resolution::Resolved(vec!["server/a.go".to_string(), "server/b.go".to_string()])
        );
        assert_eq!(
            resolve_in("main.go", Technology::Go, &import("fmt"), &set),
            Resolution::Unresolved(UnresolvedReason::External)
        );
        assert_eq!(
            resolve_in("main.go", Technology::Go, &import("example.com/app/missing"), &set),
            Resolution::Unresolved(UnresolvedReason::NotFound)
        );
    }

    #[test]
    fn test_rust_mod_and_use() {
        let set = paths(&[
            "src/lib.rs",
            "src/models.rs",
            "src/indexer/mod.rs",
            "src/indexer/graph.rs",
        ]);
        let mut decl = import("self::indexer");
        decl.raw = "pub mod indexer;".to_string();
        assert_eq!(
            resolve_in("src/lib.rs", Technology::Rust, &decl, &set),
            Resolution::Resolved(vec!["src/indexer/mod.rs".to_string()])
        );
        let mut child = import("self::graph");
        child.raw = "mod graph;".to_string();
        assert_eq!(
            resolve_in("src/indexer/mod.rs", Technology::Rust, &child, &set),
            Resolution::Resolved(vec!["src/indexer/graph.rs".to_string()])
        );
        let mut missing = import("self::nope");
        missing.raw = "mod nope;".to_string();
        assert_eq!(
            resolve_in("src/lib.rs", Technology::Rust, &missing, &set),
            Resolution::Unresolved(UnresolvedReason::NotFound)
        );
        let graph = "src/indexer/graph.rs";
        assert_eq!(
            resolve_in(graph, Technology::Rust, &import("crate::models::Span"), &set),
            Resolution::Resolved(vec!["src/models.rs".to_string()])
        );
        assert_eq!(
            resolve_in(graph, Technology::Rust, &import("super::Thing"), &set),
            Resolution::Resolved(vec!["src/indexer/mod.rs".to_string()])
        );
        assert_eq!(
            resolve_in("src/models.rs", Technology::Rust, &import("std::fmt"), &set),
            Resolution::Unresolved(UnresolvedReason::External)
        );
    }

    #[test]
    fn test_normalize_posix_path() {
        assert_eq!(normalize_posix_path("a/./b/../c"), "a/c");
        assert_eq!(normalize_posix_path("./x.ts"), "x.ts");
    }
}
