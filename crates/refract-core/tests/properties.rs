//! Property tests over the public surface: indexing, the dependency graph,
//! metrics, pattern rules, backups and the apply/rollback path.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use proptest::prelude::*;
use tempfile::TempDir;

use refract_core::indexer::filesystem::FilterConfig;
use refract_core::indexer::graph;
use refract_core::indexer::parser::parse;
use refract_core::indexer::pipeline::{index_paths, CancellationToken, IndexSummary};
use refract_core::models::{DeclarationKind, Technology};
use refract_core::query::patterns::{find_patterns, Rule, RuleSet};
use refract_core::refactor::backup::BackupStore;
use refract_core::refactor::fs::{AtomicFileSink, FileSink};
use refract_core::refactor::plan::{PlanState, RefactorIntent, RefactorTarget};
use refract_core::store::index::ProjectIndex;
use refract_core::{Config, Engine, RefractError, RefractResult};

const MODULES: usize = 5;

fn index_all(index: &ProjectIndex, root: &Path) -> IndexSummary {
    index_paths(
        index,
        root,
        &[],
        &FilterConfig::default(),
        2,
        &CancellationToken::new(),
    )
    .unwrap()
}

/// Write `m0.py..m4.py`, each importing the modules listed for it.
fn write_modules(root: &Path, edges: &[(usize, usize)], salt: &str) {
    for i in 0..MODULES {
        let mut src = String::new();
        let targets: BTreeSet<usize> = edges
            .iter()
            .filter(|(from, _)| *from == i)
            .map(|(_, to)| *to)
            .collect();
        for target in targets {
            src.push_str(&format!("import m{target}\n"));
        }
        src.push_str(&format!("\ndef f{i}():\n    return \"{salt}\"\n"));
        fs::write(root.join(format!("m{i}.py")), src).unwrap();
    }
}

fn edge_list() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..MODULES, 0..MODULES), 0..10)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_reindexing_unchanged_tree_is_idempotent(edges in edge_list()) {
        let dir = TempDir::new().unwrap();
        write_modules(dir.path(), &edges, "v1");
        let index = ProjectIndex::new();
        let first = index_all(&index, dir.path());
        let before = index.snapshot();

        let second = index_all(&index, dir.path());
        prop_assert_eq!(second.generation, first.generation);
        prop_assert_eq!(second.files_indexed, 0);
        prop_assert_eq!(second.files_unchanged, MODULES);
        prop_assert_eq!(graph::build(&index.snapshot()), graph::build(&before));
    }

    #[test]
    fn test_incremental_graph_equals_full_build(
        initial in edge_list(),
        edited in edge_list(),
    ) {
        let dir = TempDir::new().unwrap();
        write_modules(dir.path(), &initial, "v1");
        let index = ProjectIndex::new();
        index_all(&index, dir.path());
        let old = index.snapshot();
        let previous = graph::build(&old);

        write_modules(dir.path(), &edited, "version-two");
        index_all(&index, dir.path());
        let new = index.snapshot();
        let changed = new.changed_since(&old);
        prop_assert_eq!(graph::update(&previous, &new, &changed), graph::build(&new));
    }

    #[test]
    fn test_ring_is_one_cycle_regardless_of_unrelated_file(size in 2usize..=MODULES) {
        let dir = TempDir::new().unwrap();
        for i in 0..size {
            let next = (i + 1) % size;
            fs::write(
                dir.path().join(format!("m{i}.py")),
                format!("import m{next}\n\ndef f{i}():\n    return 1\n"),
            )
            .unwrap();
        }
        let index = ProjectIndex::new();
        index_all(&index, dir.path());
        let ring: Vec<String> = (0..size).map(|i| format!("m{i}.py")).collect();
        let before = graph::build(&index.snapshot());
        prop_assert_eq!(&before.cycles, &vec![ring.clone()]);

        fs::write(dir.path().join("zz_unrelated.py"), "import os\n\nX = 1\n").unwrap();
        index_all(&index, dir.path());
        let after = graph::build(&index.snapshot());
        prop_assert_eq!(&after.cycles, &vec![ring]);
        prop_assert!(!after.in_cycle("zz_unrelated.py"));
    }

    #[test]
    fn test_complexity_grows_with_each_branch(branches in 0usize..8) {
        let body = |n: usize| {
            let mut src = String::from("def f(x):\n    y = 0\n");
            for i in 0..n {
                src.push_str(&format!("    if x > {i}:\n        y += 1\n"));
            }
            src.push_str("    return y\n");
            src
        };
        let complexity = |n: usize| {
            let unit = parse("f.py", &body(n), Technology::Python).unwrap();
            unit.declarations[0].complexity
        };
        let base = complexity(branches);
        prop_assert_eq!(base, 1 + branches as u32);
        prop_assert!(complexity(branches + 1) > base);
    }

    #[test]
    fn test_backup_restores_exact_bytes(
        content in prop::collection::vec(any::<u8>(), 0..2048),
        clobber in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/blob.bin");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, &content).unwrap();

        let store = BackupStore::new(dir.path(), ".refract/backups");
        let record = store.create("data/blob.bin", &content).unwrap();
        fs::write(&path, &clobber).unwrap();
        store.restore(&record).unwrap();
        prop_assert_eq!(fs::read(&path).unwrap(), content);
        prop_assert_eq!(store.list().unwrap(), vec![record]);
    }

    #[test]
    fn test_malformed_rule_never_hides_other_rules(pattern in "\\PC{0,12}") {
        let dir = TempDir::new().unwrap();
        let mut src = String::from("class Big:\n");
        for i in 0..12 {
            src.push_str(&format!("    def m{i}(self):\n        return {i}\n"));
        }
        fs::write(dir.path().join("big.py"), src).unwrap();
        let index = ProjectIndex::new();
        index_all(&index, dir.path());
        let snap = index.snapshot();

        let rules = RuleSet {
            rules: vec![
                Rule::NamingConvention {
                    kind: DeclarationKind::Class,
                    pattern,
                    technologies: vec![],
                },
                Rule::GodClass { max_methods: 10 },
            ],
        };
        let report = find_patterns(&snap, &graph::build(&snap), &rules);
        prop_assert!(report.errors.len() <= 1);
        prop_assert!(report.matches.iter().any(|m| m.pattern_id == "god_class"));
    }

    #[test]
    fn test_terminal_plan_states_never_move(
        steps in prop::collection::vec(0usize..6, 1..12),
    ) {
        let all = [
            PlanState::Requested,
            PlanState::Planned,
            PlanState::PreviewReady,
            PlanState::Applied,
            PlanState::Rejected,
            PlanState::Expired,
        ];
        let mut state = PlanState::Requested;
        for step in steps {
            let next = all[step];
            match state.transition(next, "p") {
                Ok(moved) => {
                    prop_assert!(!state.is_terminal());
                    state = moved;
                }
                Err(err) => {
                    let is_state_error = matches!(err, RefractError::InvalidPlanState { .. });
                    prop_assert!(is_state_error);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Apply rollback through the engine
// ---------------------------------------------------------------------------

struct FailingSink {
    inner: AtomicFileSink,
    fail_on: &'static str,
}

impl FileSink for FailingSink {
    fn write(&self, path: &str, content: &[u8]) -> RefractResult<()> {
        if path == self.fail_on {
            return Err(RefractError::Io(std::io::Error::other("device lost")));
        }
        self.inner.write(path, content)
    }
}

#[test]
fn test_failed_second_write_rolls_back_first() {
    let dir = TempDir::new().unwrap();
    let files = [
        ("lib.py", "def helper(x):\n    return x\n"),
        ("a.py", "from lib import helper\n\ndef fa():\n    return helper(1)\n"),
        ("b.py", "from lib import helper\n\ndef fb():\n    return helper(2)\n"),
    ];
    for (path, src) in files {
        fs::write(dir.path().join(path), src).unwrap();
    }

    let engine = Engine::new(dir.path(), Config::default()).unwrap();
    let root = engine.root().to_path_buf();
    let engine = engine.with_sink(Box::new(FailingSink {
        inner: AtomicFileSink::new(root),
        fail_on: "b.py",
    }));
    engine
        .index_paths(&[], &FilterConfig::default(), &CancellationToken::new())
        .unwrap();

    let id = engine
        .plan_refactor(
            RefactorTarget::Symbol {
                name: "helper".to_string(),
                path: Some("lib.py".to_string()),
            },
            RefactorIntent::Rename {
                new_name: "assist_with".to_string(),
            },
            &CancellationToken::new(),
        )
        .unwrap();
    engine.preview_refactor(&id).unwrap();

    let err = engine.apply_refactor(&id).unwrap_err();
    match err {
        RefractError::PartialApplyFailure {
            failed_path,
            succeeded,
            rolled_back,
            rollback_failures,
            ..
        } => {
            assert_eq!(failed_path, "b.py");
            assert_eq!(succeeded, vec!["a.py"]);
            assert_eq!(rolled_back, vec!["a.py"]);
            assert!(rollback_failures.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    for (path, src) in files {
        assert_eq!(fs::read_to_string(dir.path().join(path)).unwrap(), src);
    }
    assert_eq!(engine.plan_state(&id).unwrap(), PlanState::Rejected);
}
