//! Test items and their reports.

use std::fmt;
use std::time::Duration;

use super::MarkedCallable;
use crate::error::{Error, Failure, Result};

/// Module name used when an item does not set one.
pub const DEFAULT_MODULE: &str = "default";

/// A test to run: its body and the fixtures it requests.
///
/// # Example
///
/// ```rust
/// use loopbridge::lifecycle::{MarkedCallable, TestItem};
/// use loopbridge::Failure;
///
/// let item = TestItem::new("test_answer", MarkedCallable::plain(|_request, args| {
///     let answer = args.get::<u32>("answer")?;
///     assert_eq!(*answer, 42);
///     Ok::<_, Failure>(())
/// }))
/// .unwrap()
/// .in_module("answers")
/// .with_args(["answer"]);
/// assert_eq!(item.module(), "answers");
/// ```
#[derive(Clone, Debug)]
pub struct TestItem {
    name: String,
    module: String,
    args: Vec<String>,
    callable: MarkedCallable,
}

impl TestItem {
    /// Creates an item in the default module.
    ///
    /// # Errors
    ///
    /// [`Error::MisplacedMark`] if `callable` carries a fixture-only mark.
    pub fn new(name: impl Into<String>, callable: MarkedCallable) -> Result<Self> {
        let name = name.into();
        let kind = callable.kind();
        if kind.is_fixture_only() {
            return Err(Error::MisplacedMark { name, kind });
        }
        Ok(Self {
            name,
            module: DEFAULT_MODULE.to_string(),
            args: Vec::new(),
            callable,
        })
    }

    /// Places the item in `module`; module-scoped fixtures are shared by
    /// the items of one module.
    #[must_use]
    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Declares the fixtures the body receives.
    #[must_use]
    pub fn with_args<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(names.into_iter().map(Into::into));
        self
    }

    /// Item name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module the item belongs to.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Requested fixture names.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn callable(&self) -> &MarkedCallable {
        &self.callable
    }
}

/// Lifecycle states an item passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Resolving the fixtures the item requests.
    CollectFixtures,
    /// Running the test body on the loop.
    RunBody,
    /// Tearing down function-scoped fixtures.
    DrainTeardowns,
    /// Finished.
    Done,
}

/// Terminal outcome of an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemOutcome {
    /// Body and all teardowns succeeded.
    Passed,
    /// The body failed.
    Failed,
    /// A fixture failed during setup or teardown.
    Error,
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemOutcome::Passed => "passed",
            ItemOutcome::Failed => "failed",
            ItemOutcome::Error => "error",
        })
    }
}

/// What happened while running one item.
#[derive(Clone, Debug)]
pub struct ItemReport {
    /// Item name.
    pub name: String,
    /// Item module.
    pub module: String,
    /// Fixture setup failure; the body did not run.
    pub setup: Option<Failure>,
    /// Body failure.
    pub call: Option<Failure>,
    /// Teardown failures, in the order they happened.
    pub teardown: Vec<Failure>,
    /// Wall time spent on the item.
    pub duration: Duration,
    /// States visited, in order.
    pub phases: Vec<Phase>,
}

impl ItemReport {
    pub(crate) fn new(item: &TestItem) -> Self {
        Self {
            name: item.name.clone(),
            module: item.module.clone(),
            setup: None,
            call: None,
            teardown: Vec::new(),
            duration: Duration::ZERO,
            phases: Vec::new(),
        }
    }

    /// Setup errors win over body failures, which win over teardown
    /// errors.
    #[must_use]
    pub fn outcome(&self) -> ItemOutcome {
        if self.setup.is_some() {
            ItemOutcome::Error
        } else if self.call.is_some() {
            ItemOutcome::Failed
        } else if !self.teardown.is_empty() {
            ItemOutcome::Error
        } else {
            ItemOutcome::Passed
        }
    }

    /// Returns true if any phase was cut short by an interrupt.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.failures().any(Failure::is_interrupted)
    }

    /// Every failure recorded, setup first.
    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.setup.iter().chain(self.call.iter()).chain(self.teardown.iter())
    }

    /// Panics with the recorded failures unless the item passed.
    #[track_caller]
    pub fn assert_passed(&self) {
        if self.outcome() != ItemOutcome::Passed {
            panic!("{self}");
        }
    }
}

impl fmt::Display for ItemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} {}", self.module, self.name, self.outcome())?;
        if let Some(failure) = &self.setup {
            write!(f, "\n  setup: {failure}")?;
        }
        if let Some(failure) = &self.call {
            write!(f, "\n  call: {failure}")?;
        }
        for failure in &self.teardown {
            write!(f, "\n  teardown: {failure}")?;
        }
        Ok(())
    }
}

/// Aggregate counts over a run.
///
/// Counted the way pytest counts: every executed body is one pass or one
/// failure, a failed setup is one error, and an item whose teardown failed
/// adds one more error on top of its pass or failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Bodies that passed.
    pub passed: usize,
    /// Bodies that failed.
    pub failed: usize,
    /// Setup and teardown errors.
    pub errors: usize,
}

impl Summary {
    /// Counts the outcomes in `reports`.
    #[must_use]
    pub fn from_reports(reports: &[ItemReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            if report.setup.is_some() {
                summary.errors += 1;
            } else if report.call.is_some() {
                summary.failed += 1;
            } else {
                summary.passed += 1;
            }
            if !report.teardown.is_empty() {
                summary.errors += 1;
            }
        }
        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        if self.passed > 0 {
            parts.push(format!("{} passed", self.passed));
        }
        match self.errors {
            0 => {}
            1 => parts.push("1 error".to_string()),
            n => parts.push(format!("{n} errors")),
        }
        if parts.is_empty() {
            f.write_str("no tests ran")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ItemReport {
        let item = TestItem::new("t", MarkedCallable::plain(|_, _| ())).unwrap();
        ItemReport::new(&item)
    }

    #[test]
    fn test_fixture_mark_on_test_rejected() {
        let fixture = MarkedCallable::async_fixture(|_, _| async { Ok::<_, Failure>(()) });
        assert!(matches!(
            TestItem::new("test_x", fixture),
            Err(Error::MisplacedMark { kind: super::super::ExecutionKind::AsyncFixture, .. })
        ));
    }

    #[test]
    fn test_outcome_precedence() {
        let mut r = report();
        assert_eq!(r.outcome(), ItemOutcome::Passed);

        r.teardown.push(Failure::msg("teardown"));
        assert_eq!(r.outcome(), ItemOutcome::Error);

        r.call = Some(Failure::msg("body"));
        assert_eq!(r.outcome(), ItemOutcome::Failed);

        r.setup = Some(Failure::msg("setup"));
        assert_eq!(r.outcome(), ItemOutcome::Error);
        assert_eq!(r.failures().count(), 3);
    }

    #[test]
    fn test_summary_counts_teardown_error_on_top() {
        let passed = report();
        let mut passed_then_broken = report();
        passed_then_broken.teardown.push(Failure::msg("did not stop"));
        let mut failed = report();
        failed.call = Some(Failure::msg("assert"));
        let mut setup_error = report();
        setup_error.setup = Some(Failure::msg("fixture"));

        let summary = Summary::from_reports(&[passed, passed_then_broken, failed, setup_error]);
        assert_eq!(
            summary,
            Summary {
                passed: 2,
                failed: 1,
                errors: 2
            }
        );
        assert_eq!(summary.to_string(), "1 failed, 2 passed, 2 errors");
        assert_eq!(Summary::default().to_string(), "no tests ran");
    }

    #[test]
    #[should_panic(expected = "default::t failed")]
    fn test_assert_passed_panics_with_report() {
        let mut r = report();
        r.call = Some(Failure::msg("boom"));
        r.assert_passed();
    }
}
