// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test attributes.
//!
//! Attributes are named tags attached to suites and tests. Filters select
//! tests by them, and a skip-action attribute (e.g. the conventional `skip`
//! tag) marks a test to be reported but not run.

use std::collections::{BTreeMap, BTreeSet, btree_map};

/// What carrying an attribute means for a test by default.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrAction {
    /// The test runs normally.
    Run,
    /// The test is reported as skipped unless a filter explicitly selects
    /// the attribute.
    Skip,
}

/// How two instances of the same attribute compose when suite-level and
/// test-level attributes are united.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrKind {
    /// A flag, optionally carrying a comment. The rightmost instance wins.
    Bool,
    /// A single-valued attribute. The rightmost instance wins.
    String,
    /// A multi-valued attribute. Instances union their value sets.
    List,
}

/// A single attribute attached to a suite or test: a name, an action, a
/// composition kind, and a set of values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttrInstance {
    name: String,
    action: AttrAction,
    kind: AttrKind,
    values: BTreeSet<String>,
}

impl AttrInstance {
    /// Creates a flag attribute with no values.
    pub fn flag(name: impl Into<String>, action: AttrAction) -> Self {
        Self {
            name: name.into(),
            action,
            kind: AttrKind::Bool,
            values: BTreeSet::new(),
        }
    }

    /// Creates a flag attribute with an explanatory comment.
    pub fn flag_comment(
        name: impl Into<String>,
        action: AttrAction,
        comment: impl Into<String>,
    ) -> Self {
        let mut values = BTreeSet::new();
        values.insert(comment.into());
        Self {
            name: name.into(),
            action,
            kind: AttrKind::Bool,
            values,
        }
    }

    /// Creates a single-valued attribute.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = BTreeSet::new();
        values.insert(value.into());
        Self {
            name: name.into(),
            action: AttrAction::Run,
            kind: AttrKind::String,
            values,
        }
    }

    /// Creates a multi-valued attribute.
    pub fn list<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            action: AttrAction::Run,
            kind: AttrKind::List,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// The conventional `skip` attribute.
    pub fn skip() -> Self {
        Self::flag("skip", AttrAction::Skip)
    }

    /// The conventional `skip` attribute with a reason.
    pub fn skip_because(comment: impl Into<String>) -> Self {
        Self::flag_comment("skip", AttrAction::Skip, comment)
    }

    /// The attribute's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attribute's default action.
    pub fn action(&self) -> AttrAction {
        self.action
    }

    /// The attribute's composition kind.
    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    /// The attribute's values, in sorted order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// Whether any value equals `value`.
    pub fn has_value(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    /// All values joined with `", "`. Used as the skip reason for
    /// skip-action attributes.
    pub fn joined_values(&self) -> String {
        let mut out = String::new();
        for v in &self.values {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(v);
        }
        out
    }

    /// Composes two instances of the same attribute, with `self` on the left
    /// (outer, e.g. suite-level) and `rhs` on the right (inner, e.g.
    /// test-level).
    fn compose(&self, rhs: &AttrInstance) -> AttrInstance {
        debug_assert_eq!(self.name, rhs.name);
        match self.kind {
            AttrKind::Bool | AttrKind::String => rhs.clone(),
            AttrKind::List => {
                let mut out = self.clone();
                out.values.extend(rhs.values.iter().cloned());
                out
            }
        }
    }
}

/// A set of attributes, unique by name. Iteration order is sorted by name,
/// independent of insertion order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Attributes {
    map: BTreeMap<String, AttrInstance>,
}

impl Attributes {
    /// Creates an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an attribute, replacing any previous instance with the same
    /// name.
    pub fn insert(&mut self, attr: AttrInstance) {
        self.map.insert(attr.name.clone(), attr);
    }

    /// Looks up an attribute by name.
    pub fn get(&self, name: &str) -> Option<&AttrInstance> {
        self.map.get(name)
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterates over attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = &AttrInstance> {
        self.map.values()
    }

    /// Unites two attribute sets, with `self` on the left (suite-level) and
    /// `rhs` on the right (test-level). Name collisions compose per the
    /// attribute's kind; for non-list kinds the rightmost instance wins.
    pub fn unite(&self, rhs: &Attributes) -> Attributes {
        let mut out = self.clone();
        for attr in rhs.iter() {
            match out.map.entry(attr.name.clone()) {
                btree_map::Entry::Occupied(mut entry) => {
                    let composed = entry.get().compose(attr);
                    entry.insert(composed);
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(attr.clone());
                }
            }
        }
        out
    }
}

impl FromIterator<AttrInstance> for Attributes {
    fn from_iter<T: IntoIterator<Item = AttrInstance>>(iter: T) -> Self {
        let mut out = Self::new();
        for attr in iter {
            out.insert(attr);
        }
        out
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a AttrInstance;
    type IntoIter = btree_map::Values<'a, String, AttrInstance>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.values()
    }
}
