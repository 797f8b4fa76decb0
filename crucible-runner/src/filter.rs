// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test selection.
//!
//! A filter decides, for each test, whether it runs, is reported as skipped,
//! or is hidden entirely. Selection combines regex matches against the
//! fully-qualified name with predicates over the test's attribute set.

use crate::{
    attrs::{AttrAction, AttrInstance, Attributes},
    test_name::TestName,
};
use regex::Regex;
use std::{collections::BTreeSet, ops::Not};

/// What the run loop should do with a test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterAction {
    /// Run the test.
    Run,
    /// Report the test as skipped without running it.
    Skip,
    /// Emit no events for the test at all.
    Hide,
    /// No filter had an opinion; the run loop applies the default skip rule.
    Indeterminate,
}

/// A filter decision plus an optional message (e.g. the skip reason).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterResult {
    /// The decision.
    pub action: FilterAction,
    /// The message accompanying the decision, if any.
    pub message: Option<String>,
}

impl FilterResult {
    /// Creates a result with no message.
    pub fn new(action: FilterAction) -> Self {
        Self {
            action,
            message: None,
        }
    }

    fn with_attr_message(action: FilterAction, attr: Option<&AttrInstance>) -> Self {
        let message = attr.map(AttrInstance::joined_values).filter(|m| !m.is_empty());
        Self { action, message }
    }
}

/// A predicate over (test identity, attribute set).
pub trait TestFilter {
    /// Decides what to do with one test.
    fn filter(&self, name: &TestName, attrs: &Attributes) -> FilterResult;
}

/// The filter used when no selection is configured: everything is
/// indeterminate, so the run loop applies the default skip rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFilter;

impl TestFilter for DefaultFilter {
    fn filter(&self, _name: &TestName, _attrs: &Attributes) -> FilterResult {
        FilterResult::new(FilterAction::Indeterminate)
    }
}

/// The default skip rule: a test carrying any skip-action attribute is
/// skipped with that attribute's values as the reason; anything else runs.
///
/// The run loop applies this whenever the configured filter returns
/// [`FilterAction::Indeterminate`].
pub fn filter_by_attr(attrs: &Attributes) -> FilterResult {
    for attr in attrs {
        if attr.action() == AttrAction::Skip {
            return FilterResult::with_attr_message(FilterAction::Skip, Some(attr));
        }
    }
    FilterResult::new(FilterAction::Run)
}

/// An ordered set of regex patterns matched against fully-qualified test
/// names.
///
/// Empty set → indeterminate; any pattern matching → run; none matching →
/// hide. Patterns use search semantics, so `^` anchors are needed for
/// prefix matches.
#[derive(Clone, Debug, Default)]
pub struct NameFilterSet {
    filters: Vec<Regex>,
}

impl NameFilterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pattern.
    pub fn insert(&mut self, pattern: Regex) {
        self.filters.push(pattern);
    }

    /// Whether the set has no patterns.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Matches `name` against the set.
    pub fn filter(&self, name: &TestName) -> FilterResult {
        if self.filters.is_empty() {
            return FilterResult::new(FilterAction::Indeterminate);
        }
        let full_name = name.full_name();
        if self.filters.iter().any(|re| re.is_match(&full_name)) {
            FilterResult::new(FilterAction::Run)
        } else {
            FilterResult::new(FilterAction::Hide)
        }
    }
}

impl FromIterator<Regex> for NameFilterSet {
    fn from_iter<T: IntoIterator<Item = Regex>>(iter: T) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

impl TestFilter for NameFilterSet {
    fn filter(&self, name: &TestName, _attrs: &Attributes) -> FilterResult {
        self.filter(name)
    }
}

/// One predicate in an attribute filter clause: "has attribute X", "has
/// attribute X with value V", or a negation of either.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttrFilterItem {
    name: String,
    value: Option<String>,
    negated: bool,
}

impl AttrFilterItem {
    /// The attribute name this item looks up.
    pub fn attribute(&self) -> &str {
        &self.name
    }

    /// Applies the predicate to the attribute found under this item's name,
    /// or `None` if the test does not carry it.
    pub fn matches(&self, attr: Option<&AttrInstance>) -> bool {
        let present = match (&self.value, attr) {
            (None, Some(_)) => true,
            (Some(value), Some(attr)) => attr.has_value(value),
            (_, None) => false,
        };
        present != self.negated
    }
}

/// Builds the predicate "has attribute `name`".
pub fn has_attr(name: impl Into<String>) -> AttrFilterItem {
    AttrFilterItem {
        name: name.into(),
        value: None,
        negated: false,
    }
}

/// Builds the predicate "has attribute `name` with value `value`".
pub fn has_attr_value(name: impl Into<String>, value: impl Into<String>) -> AttrFilterItem {
    AttrFilterItem {
        name: name.into(),
        value: Some(value.into()),
        negated: false,
    }
}

impl Not for AttrFilterItem {
    type Output = AttrFilterItem;

    fn not(mut self) -> Self::Output {
        self.negated = !self.negated;
        self
    }
}

/// A conjunction of [`AttrFilterItem`]s.
///
/// Any failing predicate hides the test, carrying the offending attribute's
/// values as the message. If all predicates pass, a skip-action attribute
/// that no predicate explicitly selected still skips the test; explicitly
/// selecting a skip-action attribute (e.g. `has_attr("skip")`) force-runs
/// it.
#[derive(Clone, Debug, Default)]
pub struct AttrFilter {
    items: Vec<AttrFilterItem>,
}

impl AttrFilter {
    /// Creates an empty clause, which runs everything except implicitly
    /// skipped tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate to the conjunction.
    pub fn insert(&mut self, item: AttrFilterItem) {
        self.items.push(item);
    }

    /// Evaluates the clause against an attribute set.
    pub fn filter(&self, attrs: &Attributes) -> FilterResult {
        let mut explicitly_shown = BTreeSet::new();
        for item in &self.items {
            let attr = attrs.get(item.attribute());
            if !item.matches(attr) {
                return FilterResult::with_attr_message(FilterAction::Hide, attr);
            } else if let Some(attr) = attr {
                explicitly_shown.insert(attr.name());
            }
        }

        for attr in attrs {
            if attr.action() == AttrAction::Skip && !explicitly_shown.contains(attr.name()) {
                return FilterResult::with_attr_message(FilterAction::Skip, Some(attr));
            }
        }
        FilterResult::new(FilterAction::Run)
    }
}

impl FromIterator<AttrFilterItem> for AttrFilter {
    fn from_iter<T: IntoIterator<Item = AttrFilterItem>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// A disjunction of [`AttrFilter`] clauses.
///
/// Empty set → indeterminate. Otherwise any clause yielding run wins
/// immediately; else the first skip found (a skip displaces a previously
/// recorded hide); else the first hide.
#[derive(Clone, Debug, Default)]
pub struct AttrFilterSet {
    filters: Vec<AttrFilter>,
}

impl AttrFilterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a clause to the disjunction.
    pub fn insert(&mut self, filter: AttrFilter) {
        self.filters.push(filter);
    }

    /// Whether the set has no clauses.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluates the disjunction against an attribute set.
    pub fn filter(&self, attrs: &Attributes) -> FilterResult {
        if self.filters.is_empty() {
            return FilterResult::new(FilterAction::Indeterminate);
        }

        let mut result: Option<FilterResult> = None;
        for f in &self.filters {
            let curr = f.filter(attrs);
            match curr.action {
                FilterAction::Run => return curr,
                FilterAction::Skip => {
                    if result
                        .as_ref()
                        .is_none_or(|r| r.action == FilterAction::Hide)
                    {
                        result = Some(curr);
                    }
                }
                FilterAction::Hide => {
                    if result.is_none() {
                        result = Some(curr);
                    }
                }
                FilterAction::Indeterminate => {}
            }
        }
        result.expect("non-empty filter set always produces a result")
    }
}

impl FromIterator<AttrFilter> for AttrFilterSet {
    fn from_iter<T: IntoIterator<Item = AttrFilter>>(iter: T) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

impl TestFilter for AttrFilterSet {
    fn filter(&self, _name: &TestName, attrs: &Attributes) -> FilterResult {
        self.filter(attrs)
    }
}

/// The combined filter: name patterns plus attribute clauses.
///
/// The name filter applies first and its hide is final. Otherwise the
/// attribute set decides; if the attribute set is indeterminate, the name
/// filter's result stands.
#[derive(Clone, Debug, Default)]
pub struct FilterSet {
    /// Selection by fully-qualified name.
    pub by_name: NameFilterSet,
    /// Selection by attributes.
    pub by_attr: AttrFilterSet,
}

impl FilterSet {
    /// Creates an empty filter set, equivalent to [`DefaultFilter`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestFilter for FilterSet {
    fn filter(&self, name: &TestName, attrs: &Attributes) -> FilterResult {
        let first = self.by_name.filter(name);
        if first.action == FilterAction::Hide {
            return first;
        }

        let second = self.by_attr.filter(attrs);
        if second.action == FilterAction::Indeterminate {
            first
        } else {
            second
        }
    }
}
