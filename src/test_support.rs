//! Step recorder shared by unit and integration tests.
//!
//! A `TestReport` records setup, action and assertion steps while a test runs
//! and, when `TEST_REPORT_DIR` is set, writes them to one text file per test
//! when dropped. Assertions still panic like the std macros.

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Create a `TestReport` named after the enclosing test function.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::test_support::TestReport::new(name, $title, file!(), line!())
    }};
}

enum Step {
    Setup(String),
    Action(String),
    Pass(String),
    Fail(String),
}

impl Step {
    fn line(&self) -> String {
        match self {
            Step::Setup(msg) => format!("STEP setup: {}", msg),
            Step::Action(msg) => format!("STEP action: {}", msg),
            Step::Pass(msg) => format!("STEP assert_pass: {}", msg),
            Step::Fail(msg) => format!("STEP assert_fail: {}", msg),
        }
    }
}

pub struct TestReport {
    full_path: String,
    title: String,
    source: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            source: format!("{}:{}", source_file, source_line),
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from),
        }
    }

    fn push(&self, step: Step) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }

    fn record(&self, pass: bool, msg: String) {
        self.push(if pass { Step::Pass(msg) } else { Step::Fail(msg) });
    }

    pub fn setup(&self, msg: impl Display) {
        self.push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.push(Step::Action(msg.to_string()));
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        self.record(
            pass,
            format!("{}: `{:?}` == `{:?}`", label, actual, expected),
        );
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.record(
            pass,
            format!("{}: `{:?}` contains `{:?}`", label, haystack, needle),
        );
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.record(value, format!("{}: `{}`", label, value));
        assert!(value, "{}", label);
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };

        let mut lines = vec![
            format!("NAME: {}", self.full_path),
            format!("TITLE: {}", self.title),
            format!("SOURCE: {}", self.source),
        ];
        if let Ok(steps) = self.steps.lock() {
            lines.extend(steps.iter().map(Step::line));
        }
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let path = dir.join(format!("{}.txt", self.full_path.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}
