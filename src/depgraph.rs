//! C4 — the dependency graph (spec.md §4.C4).
//!
//! Tracks `#load "path"` includes between spec files, and namespace
//! references/declarations between spec files and the source files they
//! depend on, so `watch` (§4.C7) can map a batch of changed files down to
//! the subset of specs actually affected instead of re-running everything.
//!
//! The spec text names `#load` directives precisely but leaves the
//! namespace-reference syntax unspecified (an Open Question, not guessed at
//! in `spec.md` itself). This module resolves it the way a preprocessor
//! would: `#using "Name"` in a spec file references a namespace, `namespace
//! Name { ... }` in a source file declares one - see DESIGN.md for the
//! rationale.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::Kind;
use crate::id::canonicalize_best_effort;

lazy_static! {
    static ref LOAD_RE: Regex = Regex::new(r#"(?m)^\s*#load\s+"([^"]+)""#).unwrap();
    static ref USING_RE: Regex = Regex::new(r#"(?m)^\s*#using\s+"([^"]+)""#).unwrap();
    static ref NAMESPACE_DECL_RE: Regex = Regex::new(r"(?m)^\s*namespace\s+([A-Za-z0-9_.]+)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: PathBuf,
    pub to: PathBuf,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedLoad {
    pub from: PathBuf,
    pub raw_path: String,
    pub line: u32,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    spec_files: HashSet<PathBuf>,
    edges: HashMap<PathBuf, Vec<DependencyEdge>>,
    pub unresolved: Vec<UnresolvedLoad>,
    namespace_uses: HashMap<PathBuf, HashSet<String>>,
    namespace_declarations: HashMap<String, HashSet<PathBuf>>,
}

impl DependencyGraph {
    /// Scans `spec_root` for `.spec` files (building `#load` edges and
    /// namespace-use sets) and, if given, `source_root` for files declaring
    /// namespaces. Neither walk fails the whole build on an unreadable
    /// file; that file is just skipped (spec.md §7 "local recovery is the
    /// default").
    pub fn build(spec_root: &Path, source_root: Option<&Path>) -> Result<Self, Kind> {
        let mut graph = Self::default();

        let mut spec_files = Vec::new();
        walk_files(spec_root, &mut |p| {
            if p.extension().is_some_and(|e| e == "spec") {
                spec_files.push(p.to_path_buf());
            }
        });

        for file in spec_files {
            let Ok(source) = fs::read_to_string(&file) else { continue };
            let absolute = canonicalize_best_effort(&file);
            graph.spec_files.insert(absolute.clone());

            let dir = file.parent().unwrap_or_else(|| Path::new("."));
            let mut edges = Vec::new();
            for cap in LOAD_RE.captures_iter(&source) {
                let raw = cap.get(1).unwrap().as_str();
                let line = line_of(&source, cap.get(0).unwrap().start());
                let candidate = dir.join(raw);
                if candidate.exists() {
                    edges.push(DependencyEdge {
                        from: absolute.clone(),
                        to: canonicalize_best_effort(&candidate),
                        line,
                    });
                } else {
                    graph.unresolved.push(UnresolvedLoad { from: absolute.clone(), raw_path: raw.to_owned(), line });
                }
            }
            graph.edges.insert(absolute.clone(), edges);

            let uses: HashSet<String> = USING_RE
                .captures_iter(&source)
                .map(|cap| cap.get(1).unwrap().as_str().to_owned())
                .collect();
            graph.namespace_uses.insert(absolute, uses);
        }

        if let Some(root) = source_root {
            let mut source_files = Vec::new();
            walk_files(root, &mut |p| source_files.push(p.to_path_buf()));
            for file in source_files {
                let Ok(source) = fs::read_to_string(&file) else { continue };
                let absolute = canonicalize_best_effort(&file);
                for cap in NAMESPACE_DECL_RE.captures_iter(&source) {
                    let name = cap.get(1).unwrap().as_str().to_owned();
                    graph.namespace_declarations.entry(name).or_default().insert(absolute.clone());
                }
            }
        }

        Ok(graph)
    }

    /// Transitive closure of `#load`-included files reachable from `file`,
    /// not including `file` itself. Cycles short-circuit via the visited
    /// set rather than looping forever (spec.md §4.C4 "cycles
    /// short-circuit, not fatal").
    pub fn transitive_closure(&self, file: &Path) -> HashSet<PathBuf> {
        let root = canonicalize_best_effort(file);
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        let mut closure = HashSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(edges) = self.edges.get(&current) {
                for edge in edges {
                    if closure.insert(edge.to.clone()) {
                        stack.push(edge.to.clone());
                    }
                }
            }
        }
        closure
    }

    pub fn namespaces_used_by(&self, file: &Path) -> HashSet<String> {
        self.namespace_uses.get(&canonicalize_best_effort(file)).cloned().unwrap_or_default()
    }

    pub fn files_declaring(&self, namespace: &str) -> HashSet<PathBuf> {
        self.namespace_declarations.get(namespace).cloned().unwrap_or_default()
    }

    /// Given a set of changed files, the set of spec files transitively
    /// affected: either the change is in the spec's own `#load` closure, or
    /// the changed file declares a namespace the spec uses (spec.md §4.C4
    /// "Change mapping").
    pub fn affected_specs(&self, changed: &HashSet<PathBuf>) -> HashSet<PathBuf> {
        let changed: HashSet<PathBuf> = changed.iter().map(|p| canonicalize_best_effort(p)).collect();

        let changed_namespaces: HashSet<&str> = self
            .namespace_declarations
            .iter()
            .filter(|(_, files)| files.iter().any(|f| changed.contains(f)))
            .map(|(name, _)| name.as_str())
            .collect();

        self.spec_files
            .iter()
            .filter(|spec_file| {
                if changed.contains(*spec_file) {
                    return true;
                }
                let closure = self.transitive_closure(spec_file);
                if closure.iter().any(|f| changed.contains(f)) {
                    return true;
                }
                let uses = self.namespace_uses.get(*spec_file);
                uses.is_some_and(|uses| uses.iter().any(|ns| changed_namespaces.contains(ns.as_str())))
            })
            .cloned()
            .collect()
    }
}

fn line_of(source: &str, byte_offset: usize) -> u32 {
    1 + source[..byte_offset].matches('\n').count() as u32
}

fn walk_files(root: &Path, visit: &mut impl FnMut(&Path)) {
    let Ok(entries) = fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, visit);
        } else {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write(path: &Path, contents: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn load_edges_build_transitive_closure() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("helpers.csx"), "// no directives here\n");
        write(&dir.path().join("a.spec"), "#load \"helpers.csx\"\ndescribe(\"A\", { it(\"x\", {}); });\n");
        write(&dir.path().join("b.spec"), "describe(\"B\", { it(\"y\", {}); });\n");

        let graph = DependencyGraph::build(dir.path(), None).unwrap();
        let a = canonicalize_best_effort(&dir.path().join("a.spec"));
        let helpers = canonicalize_best_effort(&dir.path().join("helpers.csx"));
        assert!(graph.transitive_closure(&a).contains(&helpers));
    }

    #[test]
    fn unresolved_load_is_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.spec"), "#load \"missing.csx\"\ndescribe(\"A\", { it(\"x\", {}); });\n");

        let graph = DependencyGraph::build(dir.path(), None).unwrap();
        assert_eq!(graph.unresolved.len(), 1);
        assert_eq!(graph.unresolved[0].raw_path, "missing.csx");
    }

    #[test]
    fn changed_helper_affects_only_the_spec_that_loads_it() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("helpers.csx"), "// helper\n");
        write(&dir.path().join("a.spec"), "#load \"helpers.csx\"\ndescribe(\"A\", { it(\"x\", {}); });\n");
        write(&dir.path().join("b.spec"), "describe(\"B\", { it(\"y\", {}); });\n");

        let graph = DependencyGraph::build(dir.path(), None).unwrap();
        let helpers = canonicalize_best_effort(&dir.path().join("helpers.csx"));
        let affected = graph.affected_specs(&HashSet::from([helpers]));

        let a = canonicalize_best_effort(&dir.path().join("a.spec"));
        let b = canonicalize_best_effort(&dir.path().join("b.spec"));
        assert!(affected.contains(&a));
        assert!(!affected.contains(&b));
    }

    #[test]
    fn namespace_change_affects_users_of_that_namespace() {
        let spec_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        write(&src_dir.path().join("widgets.cs"), "namespace Widgets.Core\n{\n}\n");
        write(
            &spec_dir.path().join("a.spec"),
            "#using \"Widgets.Core\"\ndescribe(\"A\", { it(\"x\", {}); });\n",
        );
        write(&spec_dir.path().join("b.spec"), "describe(\"B\", { it(\"y\", {}); });\n");

        let graph = DependencyGraph::build(spec_dir.path(), Some(src_dir.path())).unwrap();
        let changed = HashSet::from([canonicalize_best_effort(&src_dir.path().join("widgets.cs"))]);
        let affected = graph.affected_specs(&changed);

        let a = canonicalize_best_effort(&spec_dir.path().join("a.spec"));
        let b = canonicalize_best_effort(&spec_dir.path().join("b.spec"));
        assert!(affected.contains(&a));
        assert!(!affected.contains(&b));
    }
}
