//! C5 — selection & filters (spec.md §4.C5).
//!
//! Takes the flat, declaration-ordered list `tree::flatten` produces and a
//! `FilterSpec`, and reduces it to the runnable subset - everything else
//! comes back tagged with the rule that excluded it, in the same
//! declaration order, so reporters can show excluded specs with their
//! terminal status rather than just dropping them.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use regex::Regex;

use crate::tree::SpecDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFilter {
    pub file: PathBuf,
    pub lines: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub focused_only: bool,
    pub pending_only: bool,
    pub skipped_only: bool,
    pub line_filters: Vec<LineFilter>,
    pub include_tags: HashSet<String>,
    pub exclude_tags: HashSet<String>,
    pub name_regex: Option<Regex>,
    pub exclude_name_regex: Option<Regex>,
    pub context_globs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    FilteredByTag,
    FilteredByName,
    FilteredByContext,
    FilteredByLine,
    /// Also covers the `focused_only`/`pending_only`/`skipped_only` status
    /// flags (§4.C5 rule 1): those are an "isolate to this subset" mode
    /// exactly like focus mode, so a spec they exclude is reported the
    /// same way a non-focused sibling would be. See DESIGN.md.
    NotFocused,
    ExplicitlySkipped,
    Pending,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Runnable(Arc<SpecDefinition>),
    Excluded(Arc<SpecDefinition>, ExclusionReason),
}

impl Selection {
    pub fn spec(&self) -> &Arc<SpecDefinition> {
        match self {
            Selection::Runnable(s) => s,
            Selection::Excluded(s, _) => s,
        }
    }
}

/// Applies every rule in spec.md §4.C5's order, in one pass, over `specs`
/// (expected to already be in declaration order - the order `select`
/// returns results in).
pub fn select(specs: &[Arc<SpecDefinition>], filter: &FilterSpec) -> Vec<Selection> {
    let line_ok = line_containment(specs, filter);
    let mut reason: Vec<Option<ExclusionReason>> = vec![None; specs.len()];
    let mut survivors = Vec::new();

    for (i, spec) in specs.iter().enumerate() {
        if filter.focused_only || filter.pending_only || filter.skipped_only {
            let matches_any_flag = (filter.focused_only && spec.focused)
                || (filter.pending_only && spec.pending())
                || (filter.skipped_only && spec.skipped);
            if !matches_any_flag {
                reason[i] = Some(ExclusionReason::NotFocused);
                continue;
            }
        }

        if !line_ok[i] {
            reason[i] = Some(ExclusionReason::FilteredByLine);
            continue;
        }

        if !filter.include_tags.is_empty() && spec.tags.is_disjoint(&filter.include_tags) {
            reason[i] = Some(ExclusionReason::FilteredByTag);
            continue;
        }
        if !filter.exclude_tags.is_empty() && !spec.tags.is_disjoint(&filter.exclude_tags) {
            reason[i] = Some(ExclusionReason::FilteredByTag);
            continue;
        }

        let display = spec.id.display_name();
        if let Some(re) = &filter.name_regex {
            if !re.is_match(&display) {
                reason[i] = Some(ExclusionReason::FilteredByName);
                continue;
            }
        }
        if let Some(re) = &filter.exclude_name_regex {
            if re.is_match(&display) {
                reason[i] = Some(ExclusionReason::FilteredByName);
                continue;
            }
        }

        if !filter.context_globs.is_empty() {
            let matches = filter.context_globs.iter().any(|pattern| {
                glob::Pattern::new(pattern).is_ok_and(|p| {
                    p.matches(&display) || spec.id.context_path.iter().any(|c| p.matches(c))
                })
            });
            if !matches {
                reason[i] = Some(ExclusionReason::FilteredByContext);
                continue;
            }
        }

        survivors.push(i);
    }

    // Rule 6: focus mode is computed against the post-filter survivor set,
    // never cross-pollinating with specs already excluded above.
    if survivors.iter().any(|&i| specs[i].focused) {
        for &i in &survivors {
            if !specs[i].focused {
                reason[i] = Some(ExclusionReason::NotFocused);
            }
        }
    }

    // Rule 7: terminal status for whatever's left.
    for &i in &survivors {
        if reason[i].is_some() {
            continue;
        }
        if specs[i].skipped {
            reason[i] = Some(ExclusionReason::ExplicitlySkipped);
        } else if specs[i].pending() {
            reason[i] = Some(ExclusionReason::Pending);
        }
    }

    specs
        .iter()
        .cloned()
        .zip(reason)
        .map(|(spec, reason)| match reason {
            Some(r) => Selection::Excluded(spec, r),
            None => Selection::Runnable(spec),
        })
        .collect()
}

/// A spec at line `spec.line` in file `f` is "covered" by a requested line
/// `l` when `spec.line <= l` and no later spec in the same file also
/// satisfies that (i.e. it's the rightmost declared spec at or before `l` -
/// spec.md §4.C5 rule 2's "falls in the spec's source range").
fn line_containment(specs: &[Arc<SpecDefinition>], filter: &FilterSpec) -> Vec<bool> {
    if filter.line_filters.is_empty() {
        return vec![true; specs.len()];
    }

    let mut by_file: HashMap<&Path, Vec<(u32, usize)>> = HashMap::new();
    for (i, spec) in specs.iter().enumerate() {
        by_file.entry(spec.id.source_file.as_path()).or_default().push((spec.line, i));
    }
    for ordered in by_file.values_mut() {
        ordered.sort_by_key(|&(line, _)| line);
    }

    let mut matched = vec![false; specs.len()];
    let mut filtered_files: HashSet<&Path> = HashSet::new();
    for lf in &filter.line_filters {
        filtered_files.insert(lf.file.as_path());
        let Some(ordered) = by_file.get(lf.file.as_path()) else { continue };
        for &target in &lf.lines {
            if let Some(&(_, idx)) = ordered.iter().rev().find(|&&(line, _)| line <= target) {
                matched[idx] = true;
            }
        }
    }

    specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            if filtered_files.contains(spec.id.source_file.as_path()) {
                matched[i]
            } else {
                true
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::{declare, describe, fit, it, tag, xit};
    use crate::tree::flatten;

    fn scenario_s1() -> Vec<Arc<SpecDefinition>> {
        let tree = declare(|| {
            describe("A", || {
                it("x", || async { Ok(()) });
                fit("y", || async { Ok(()) });
                it("z", || async { Ok(()) });
            });
        })
        .unwrap();
        flatten(&tree)
    }

    #[test]
    fn s1_focus_mode_skips_non_focused_siblings() {
        let specs = scenario_s1();
        let selected = select(&specs, &FilterSpec::default());
        let reasons: Vec<_> = selected
            .iter()
            .map(|s| match s {
                Selection::Runnable(_) => None,
                Selection::Excluded(_, r) => Some(*r),
            })
            .collect();
        assert_eq!(reasons, vec![Some(ExclusionReason::NotFocused), None, Some(ExclusionReason::NotFocused)]);
    }

    #[test]
    fn tag_filters_include_and_exclude() {
        let tree = declare(|| {
            tag(&["slow"], || it("slow one", || async { Ok(()) }));
            it("fast one", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);

        let mut filter = FilterSpec::default();
        filter.include_tags.insert("slow".to_owned());
        let selected = select(&specs, &filter);
        assert!(matches!(selected[0], Selection::Runnable(_)));
        assert!(matches!(selected[1], Selection::Excluded(_, ExclusionReason::FilteredByTag)));
    }

    #[test]
    fn pending_and_skipped_specs_get_terminal_reasons() {
        let tree = declare(|| {
            xit("someday");
            it("now", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);
        let selected = select(&specs, &FilterSpec::default());
        assert!(matches!(selected[0], Selection::Excluded(_, ExclusionReason::Pending)));
        assert!(matches!(selected[1], Selection::Runnable(_)));
    }

    #[test]
    fn context_glob_matches_ancestor_description() {
        let tree = declare(|| {
            describe("Widgets", || {
                it("renders", || async { Ok(()) });
            });
            it("top level", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);
        let filter = FilterSpec { context_globs: vec!["Widg*".to_owned()], ..Default::default() };
        let selected = select(&specs, &filter);
        assert!(matches!(selected[0], Selection::Runnable(_)));
        assert!(matches!(selected[1], Selection::Excluded(_, ExclusionReason::FilteredByContext)));
    }

    #[test]
    fn line_filter_attributes_to_enclosing_spec() {
        let tree = declare(|| {
            it("a", || async { Ok(()) });
            it("b", || async { Ok(()) });
        })
        .unwrap();
        let specs = flatten(&tree);
        let target_file = specs[1].id.source_file.clone();
        let target_line = specs[1].line;
        let filter = FilterSpec {
            line_filters: vec![LineFilter { file: target_file, lines: vec![target_line] }],
            ..Default::default()
        };
        let selected = select(&specs, &filter);
        assert!(matches!(selected[0], Selection::Excluded(_, ExclusionReason::FilteredByLine)));
        assert!(matches!(selected[1], Selection::Runnable(_)));
    }
}
