// Copyright (c) The crucible Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Building suites of tests at runtime.
//!
//! A [`SuiteBuilder`] collects (name, closure, attributes) triples and
//! nested subsuites, then compiles them into a [`CompiledSuite`] tree that
//! the run loop traverses. Test bodies signal failure by panicking (e.g.
//! via `assert!`); panics are caught and converted into failure messages.
//!
//! Suites may carry a fixture: a [`FixtureFactory`] builds a fresh value
//! per test invocation, which is passed to setup, the test body, and
//! teardown in that order.

use crate::{
    attrs::{AttrInstance, Attributes},
    test_name::{TestUid, next_test_uid},
};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, Location, catch_unwind},
    rc::Rc,
};

/// The outcome of executing one test body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestVerdict {
    /// The test completed without panicking.
    Passed,
    /// The test panicked or otherwise failed.
    Failed {
        /// The failure message.
        message: String,
    },
}

impl TestVerdict {
    /// Creates a passed verdict.
    pub fn passed() -> Self {
        Self::Passed
    }

    /// Creates a failed verdict.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether the test passed.
    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// The failure message, if the test failed.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed { message } => Some(message),
        }
    }
}

/// Builds a fresh fixture value for each test invocation.
///
/// Any `Fn() -> T` closure is a factory; implement the trait directly when
/// construction needs shared state.
pub trait FixtureFactory<T> {
    /// Builds one fixture.
    fn make_fixture(&self) -> T;
}

impl<T, F> FixtureFactory<T> for F
where
    F: Fn() -> T,
{
    fn make_fixture(&self) -> T {
        self()
    }
}

/// A compiled test body: fixture construction, setup, the body itself, and
/// teardown, with panics converted to failures.
pub type TestFn = Box<dyn Fn() -> TestVerdict>;

/// One compiled test: identity, attributes, and the callable body.
pub struct TestInfo {
    id: TestUid,
    name: String,
    file: String,
    line: u32,
    attrs: Attributes,
    function: TestFn,
}

impl TestInfo {
    /// The test's uid.
    pub fn id(&self) -> TestUid {
        self.id
    }

    /// The test's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source file the test was declared in.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// The line the test was declared on.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// The test's attributes, united with all enclosing suites' attributes.
    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    /// Runs the test body, converting panics into failed verdicts.
    pub fn call(&self) -> TestVerdict {
        (self.function)()
    }
}

impl std::fmt::Debug for TestInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

/// A compiled suite: ordered tests followed by ordered subsuites.
pub struct CompiledSuite {
    name: String,
    file: String,
    line: u32,
    tests: Vec<TestInfo>,
    subsuites: Vec<CompiledSuite>,
}

impl CompiledSuite {
    /// The suite's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source file the suite was declared in.
    pub fn file(&self) -> &str {
        &self.file
    }

    /// The line the suite was declared on.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// The suite's own tests, in declaration order.
    pub fn tests(&self) -> &[TestInfo] {
        &self.tests
    }

    /// The suite's subsuites, in declaration order.
    pub fn subsuites(&self) -> &[CompiledSuite] {
        &self.subsuites
    }
}

impl std::fmt::Debug for CompiledSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSuite")
            .field("name", &self.name)
            .field("tests", &self.tests)
            .field("subsuites", &self.subsuites)
            .finish_non_exhaustive()
    }
}

/// Finds a test anywhere in a suite tree by uid.
pub fn find_test(suites: &[CompiledSuite], id: TestUid) -> Option<&TestInfo> {
    for suite in suites {
        if let Some(test) = suite.tests.iter().find(|t| t.id == id) {
            return Some(test);
        }
        if let Some(test) = find_test(&suite.subsuites, id) {
            return Some(test);
        }
    }
    None
}

struct PendingTest<T> {
    id: TestUid,
    name: String,
    file: String,
    line: u32,
    attrs: Attributes,
    body: Rc<dyn Fn(&mut T)>,
}

type DeferredSuite = Box<dyn FnOnce(&Attributes) -> CompiledSuite>;

/// Collects tests and subsuites before compilation. Obtained through
/// [`suite`] or [`suite_with`].
pub struct SuiteBuilder<T: 'static> {
    name: String,
    file: String,
    line: u32,
    attrs: Attributes,
    factory: Rc<dyn FixtureFactory<T>>,
    setup: Option<Rc<dyn Fn(&mut T)>>,
    teardown: Option<Rc<dyn Fn(&mut T)>>,
    tests: Vec<PendingTest<T>>,
    subsuites: Vec<DeferredSuite>,
}

impl<T: 'static> SuiteBuilder<T> {
    fn new(name: String, file: String, line: u32, factory: Rc<dyn FixtureFactory<T>>) -> Self {
        Self {
            name,
            file,
            line,
            attrs: Attributes::new(),
            factory,
            setup: None,
            teardown: None,
            tests: Vec::new(),
            subsuites: Vec::new(),
        }
    }

    /// Attaches an attribute to the suite. Suite attributes are united into
    /// every contained test's set, with the test's own attributes winning
    /// collisions.
    pub fn attr(&mut self, attr: AttrInstance) -> &mut Self {
        self.attrs.insert(attr);
        self
    }

    /// Runs before each of this suite's own tests, on the fresh fixture.
    pub fn setup(&mut self, f: impl Fn(&mut T) + 'static) -> &mut Self {
        self.setup = Some(Rc::new(f));
        self
    }

    /// Runs after each of this suite's own tests, even if the body failed.
    pub fn teardown(&mut self, f: impl Fn(&mut T) + 'static) -> &mut Self {
        self.teardown = Some(Rc::new(f));
        self
    }

    /// Declares a test.
    #[track_caller]
    pub fn test(&mut self, name: impl Into<String>, body: impl Fn(&mut T) + 'static) -> &mut Self {
        self.test_with(name, [], body)
    }

    /// Declares a test with attributes.
    #[track_caller]
    pub fn test_with(
        &mut self,
        name: impl Into<String>,
        attrs: impl IntoIterator<Item = AttrInstance>,
        body: impl Fn(&mut T) + 'static,
    ) -> &mut Self {
        let loc = Location::caller();
        self.tests.push(PendingTest {
            id: next_test_uid(),
            name: name.into(),
            file: loc.file().to_owned(),
            line: loc.line(),
            attrs: attrs.into_iter().collect(),
            body: Rc::new(body),
        });
        self
    }

    /// Declares a subsuite sharing this suite's fixture factory.
    #[track_caller]
    pub fn subsuite(
        &mut self,
        name: impl Into<String>,
        build: impl FnOnce(&mut SuiteBuilder<T>),
    ) -> &mut Self {
        let loc = Location::caller();
        let mut child = SuiteBuilder::new(
            name.into(),
            loc.file().to_owned(),
            loc.line(),
            Rc::clone(&self.factory),
        );
        build(&mut child);
        self.subsuites
            .push(Box::new(move |inherited| child.build(inherited)));
        self
    }

    /// Declares a subsuite with its own fixture factory.
    #[track_caller]
    pub fn subsuite_with<U: 'static>(
        &mut self,
        name: impl Into<String>,
        factory: impl FixtureFactory<U> + 'static,
        build: impl FnOnce(&mut SuiteBuilder<U>),
    ) -> &mut Self {
        let loc = Location::caller();
        let mut child = SuiteBuilder::new(
            name.into(),
            loc.file().to_owned(),
            loc.line(),
            Rc::new(factory),
        );
        build(&mut child);
        self.subsuites
            .push(Box::new(move |inherited| child.build(inherited)));
        self
    }

    fn build(self, inherited: &Attributes) -> CompiledSuite {
        let effective = inherited.unite(&self.attrs);

        let tests = self
            .tests
            .into_iter()
            .map(|test| {
                let attrs = effective.unite(&test.attrs);
                let factory = Rc::clone(&self.factory);
                let setup = self.setup.clone();
                let teardown = self.teardown.clone();
                let body = test.body;
                let function: TestFn = Box::new(move || {
                    execute(&*factory, setup.as_deref(), teardown.as_deref(), &*body)
                });
                TestInfo {
                    id: test.id,
                    name: test.name,
                    file: test.file,
                    line: test.line,
                    attrs,
                    function,
                }
            })
            .collect();

        let subsuites = self
            .subsuites
            .into_iter()
            .map(|build| build(&effective))
            .collect();

        CompiledSuite {
            name: self.name,
            file: self.file,
            line: self.line,
            tests,
            subsuites,
        }
    }
}

fn execute<T>(
    factory: &dyn FixtureFactory<T>,
    setup: Option<&dyn Fn(&mut T)>,
    teardown: Option<&dyn Fn(&mut T)>,
    body: &dyn Fn(&mut T),
) -> TestVerdict {
    // A panic during fixture construction or setup fails the test without
    // running the body or teardown.
    let mut fixture = match catch_unwind(AssertUnwindSafe(|| {
        let mut fixture = factory.make_fixture();
        if let Some(setup) = setup {
            setup(&mut fixture);
        }
        fixture
    })) {
        Ok(fixture) => fixture,
        Err(payload) => return TestVerdict::failed(panic_message(payload)),
    };

    let body_result = catch_unwind(AssertUnwindSafe(|| body(&mut fixture)));
    // Teardown runs even when the body failed; the body's message wins.
    let teardown_result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(teardown) = teardown {
            teardown(&mut fixture);
        }
    }));

    match (body_result, teardown_result) {
        (Ok(()), Ok(())) => TestVerdict::passed(),
        (Err(payload), _) | (Ok(()), Err(payload)) => {
            TestVerdict::failed(panic_message(payload))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test panicked".to_owned()
    }
}

/// Builds a suite with no fixture.
#[track_caller]
pub fn suite(
    name: impl Into<String>,
    build: impl FnOnce(&mut SuiteBuilder<()>),
) -> CompiledSuite {
    suite_with(name, || (), build)
}

/// Builds a suite whose tests receive a fixture built fresh per test.
#[track_caller]
pub fn suite_with<T: 'static>(
    name: impl Into<String>,
    factory: impl FixtureFactory<T> + 'static,
    build: impl FnOnce(&mut SuiteBuilder<T>),
) -> CompiledSuite {
    let loc = Location::caller();
    let mut builder = SuiteBuilder::new(
        name.into(),
        loc.file().to_owned(),
        loc.line(),
        Rc::new(factory),
    );
    build(&mut builder);
    builder.build(&Attributes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[test]
    fn builds_tests_in_declaration_order() {
        let compiled = suite("ordering", |b| {
            b.test("first", |_| {});
            b.test("second", |_| {});
            b.subsuite("inner", |b| {
                b.test("third", |_| {});
            });
        });

        let names: Vec<_> = compiled.tests().iter().map(|t| t.name()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(compiled.subsuites().len(), 1);
        assert_eq!(compiled.subsuites()[0].tests()[0].name(), "third");

        let mut ids: Vec<_> = compiled.tests().iter().map(|t| t.id()).collect();
        ids.push(compiled.subsuites()[0].tests()[0].id());
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids.len(), sorted.len(), "uids must be unique");
    }

    #[test]
    fn passing_and_panicking_bodies() {
        let compiled = suite("verdicts", |b| {
            b.test("passes", |_| {});
            b.test("fails", |_| panic!("boom: {}", 2));
            b.test("asserts", |_| assert_eq!(1, 2, "one is not two"));
        });

        assert_eq!(compiled.tests()[0].call(), TestVerdict::passed());
        let failed = compiled.tests()[1].call();
        assert_eq!(failed.message(), Some("boom: 2"));
        let asserted = compiled.tests()[2].call();
        assert!(
            asserted.message().unwrap().contains("one is not two"),
            "message was {:?}",
            asserted.message()
        );
    }

    #[test]
    fn attrs_unite_suite_then_test() {
        let compiled = suite("attrs", |b| {
            b.attr(AttrInstance::string("owner", "infra"));
            b.attr(AttrInstance::list("tags", ["slow"]));
            b.test("plain", |_| {});
            b.test_with(
                "tagged",
                [
                    AttrInstance::string("owner", "storage"),
                    AttrInstance::list("tags", ["net"]),
                ],
                |_| {},
            );
            b.subsuite("inner", |b| {
                b.test("nested", |_| {});
            });
        });

        let plain = compiled.tests()[0].attrs();
        assert!(plain.get("owner").unwrap().has_value("infra"));

        let tagged = compiled.tests()[1].attrs();
        assert!(tagged.get("owner").unwrap().has_value("storage"));
        let tags: Vec<_> = tagged.get("tags").unwrap().values().collect();
        assert_eq!(tags, ["net", "slow"]);

        // Suite attributes flow into subsuites.
        let nested = compiled.subsuites()[0].tests()[0].attrs();
        assert!(nested.get("owner").unwrap().has_value("infra"));
    }

    #[test]
    fn fixture_setup_teardown_order() {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

        let compiled = {
            let log = Rc::clone(&log);
            let factory_log = Rc::clone(&log);
            suite_with(
                "fixture",
                move || {
                    factory_log.borrow_mut().push("make".to_owned());
                    0u32
                },
                |b| {
                    let setup_log = Rc::clone(&log);
                    b.setup(move |n| {
                        setup_log.borrow_mut().push("setup".to_owned());
                        *n += 1;
                    });
                    let teardown_log = Rc::clone(&log);
                    b.teardown(move |_| {
                        teardown_log.borrow_mut().push("teardown".to_owned());
                    });
                    let body_log = Rc::clone(&log);
                    b.test("uses fixture", move |n| {
                        body_log.borrow_mut().push(format!("body {n}"));
                    });
                },
            )
        };

        assert_eq!(compiled.tests()[0].call(), TestVerdict::passed());
        assert_eq!(
            *log.borrow(),
            ["make", "setup", "body 1", "teardown"]
        );

        // A second invocation gets a fresh fixture.
        log.borrow_mut().clear();
        assert_eq!(compiled.tests()[0].call(), TestVerdict::passed());
        assert_eq!(
            *log.borrow(),
            ["make", "setup", "body 1", "teardown"]
        );
    }

    #[test]
    fn teardown_runs_after_failed_body() {
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let compiled = {
            let log = Rc::clone(&log);
            suite("teardown", move |b| {
                let teardown_log = Rc::clone(&log);
                b.teardown(move |_| teardown_log.borrow_mut().push("teardown"));
                b.test("fails", |_| panic!("body failed"));
            })
        };

        let verdict = compiled.tests()[0].call();
        assert_eq!(verdict.message(), Some("body failed"));
        assert_eq!(*log.borrow(), ["teardown"]);
    }

    #[test]
    fn subsuite_with_changes_fixture_type() {
        let compiled = suite("mixed", |b| {
            b.test("unit", |_| {});
            b.subsuite_with("strings", || String::from("seed"), |b| {
                b.test("has seed", |s: &mut String| {
                    assert_eq!(s, "seed");
                });
            });
        });

        assert_eq!(
            compiled.subsuites()[0].tests()[0].call(),
            TestVerdict::passed()
        );
    }

    #[test]
    fn find_test_searches_nested_suites() {
        let compiled = suite("outer", |b| {
            b.test("a", |_| {});
            b.subsuite("inner", |b| {
                b.test("b", |_| {});
            });
        });

        let nested_id = compiled.subsuites()[0].tests()[0].id();
        let suites = [compiled];
        assert_eq!(find_test(&suites, nested_id).unwrap().name(), "b");
        assert!(find_test(&suites, u64::MAX).is_none());
    }
}
