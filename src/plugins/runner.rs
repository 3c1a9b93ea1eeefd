//! Runs an artifact's declared tests inside the sandbox.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::plugins::manifest::TestCase;
use crate::sandbox::{self, Instance, Program, SandboxPolicy, ScriptError};

/// Name of the synthetic result reported when the source fails to load.
pub const LOAD_RESULT: &str = "load";
/// Name of the synthetic result reported when the entry function is missing.
pub const PRESENCE_RESULT: &str = "presence";

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub name: String,
    pub input: serde_json::Map<String, serde_json::Value>,
    pub passed: bool,
    /// Expected output or substring the test declared.
    pub expected: Option<String>,
    /// `str(result)`, unset when the function returned `None` or raised.
    pub output: Option<String>,
    pub error: Option<String>,
    pub traceback: Option<String>,
}

impl TestResult {
    fn failed(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            input: serde_json::Map::new(),
            passed: false,
            expected: None,
            output: None,
            error: Some(error.into()),
            traceback: None,
        }
    }

    fn for_case(test: &TestCase) -> Self {
        Self {
            name: test.name.clone(),
            input: test.input.clone(),
            passed: false,
            expected: test.expected.clone().or_else(|| test.expected_contains.clone()),
            output: None,
            error: None,
            traceback: None,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub all_passed: bool,
    pub results: Vec<TestResult>,
    pub timed_out: bool,
}

impl TestRun {
    fn from_results(results: Vec<TestResult>, timed_out: bool) -> Self {
        Self {
            all_passed: !timed_out && results.iter().all(|r| r.passed),
            results,
            timed_out,
        }
    }

    /// The first failing result, if any.
    pub fn first_failure(&self) -> Option<&TestResult> {
        self.results.iter().find(|r| !r.passed)
    }
}

#[derive(Debug, Clone)]
pub struct TestRunner {
    timeout: Duration,
    policy: SandboxPolicy,
}

impl TestRunner {
    pub fn new(timeout: Duration, policy: SandboxPolicy) -> Self {
        Self { timeout, policy }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Load `source` and call `entry_function(**input)` for every test.
    ///
    /// All tests share one deadline. Once it passes, the running test is
    /// reported as a timeout and the rest as not run.
    pub async fn run_tests(&self, source: &str, tests: &[TestCase], entry_function: &str) -> TestRun {
        self.run_tests_with_helpers(source, &[], tests, entry_function).await
    }

    /// [`run_tests`](Self::run_tests) with helper modules loaded ahead of
    /// `source`.
    pub async fn run_tests_with_helpers(
        &self,
        source: &str,
        helpers: &[Program],
        tests: &[TestCase],
        entry_function: &str,
    ) -> TestRun {
        let program = match Program::compile(source) {
            Ok(program) => program,
            Err(e) => {
                return TestRun::from_results(
                    vec![TestResult::failed(LOAD_RESULT, format!("Failed to load code: {e}"))],
                    false,
                );
            }
        };

        let program = helpers
            .iter()
            .fold(program, |program, helper| program.with_helper(helper));
        let tests: Arc<[TestCase]> = tests.into();
        let entry = entry_function.to_string();
        let policy = self.policy;
        let timeout = self.timeout;

        let job_tests = Arc::clone(&tests);
        let outcome = sandbox::run_async(timeout, move |deadline| {
            Ok(run_all(&program, &policy, deadline, &job_tests, &entry, timeout))
        })
        .await;

        match outcome {
            Ok((results, timed_out)) => {
                let run = TestRun::from_results(results, timed_out);
                tracing::debug!(
                    entry = %entry_function,
                    tests = tests.len(),
                    all_passed = run.all_passed,
                    timed_out = run.timed_out,
                    "Test run finished"
                );
                run
            }
            Err(e) => {
                tracing::warn!(entry = %entry_function, "Abandoned test run: {}", e);
                let results = tests
                    .iter()
                    .map(|test| {
                        let mut result = TestResult::for_case(test);
                        result.error = Some(format!("Test run abandoned: {e}"));
                        result
                    })
                    .collect();
                TestRun::from_results(results, matches!(e, ScriptError::Timeout))
            }
        }
    }
}

fn run_all(
    program: &Program,
    policy: &SandboxPolicy,
    deadline: std::time::Instant,
    tests: &[TestCase],
    entry: &str,
    timeout: Duration,
) -> (Vec<TestResult>, bool) {
    let mut instance = match Instance::load(program, policy, deadline) {
        Ok(instance) => instance,
        Err(e) => {
            let mut result = TestResult::failed(LOAD_RESULT, format!("Failed to load code: {e}"));
            result.traceback = e.traceback();
            return (vec![result], matches!(e, ScriptError::Timeout));
        }
    };

    if !instance.has_function(entry) {
        return (
            vec![TestResult::failed(
                PRESENCE_RESULT,
                format!("Function '{entry}' not defined in code"),
            )],
            false,
        );
    }

    let mut results = Vec::with_capacity(tests.len());
    let mut timed_out = false;
    for test in tests {
        let mut result = TestResult::for_case(test);
        if timed_out {
            result.error = Some("Not run: test run timed out".to_string());
            results.push(result);
            continue;
        }

        match instance.call(entry, &test.input) {
            Ok(value) => {
                result.output = (!value.is_none).then(|| value.text.clone());
                if let Some(expected) = &test.expected {
                    if &value.text == expected {
                        result.passed = true;
                    } else {
                        result.error = Some(format!("Expected '{expected}', got '{}'", value.text));
                    }
                } else if let Some(fragment) = &test.expected_contains {
                    if value.text.contains(fragment.as_str()) {
                        result.passed = true;
                    } else {
                        result.error = Some(format!("Output doesn't contain '{fragment}'"));
                    }
                } else {
                    result.passed = true;
                }
            }
            Err(ScriptError::Timeout) => {
                timed_out = true;
                result.error = Some(format!("Timed out after {}s", timeout.as_secs_f64()));
            }
            Err(e) => {
                result.traceback = e.traceback();
                result.error = Some(e.to_string());
            }
        }
        results.push(result);
    }

    (results, timed_out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn runner() -> TestRunner {
        TestRunner::new(Duration::from_secs(5), SandboxPolicy::sandboxed(1_000_000))
    }

    const REVERSE: &str = "def reverse_text(text):\n    return text[::-1]\n";

    #[tokio::test]
    async fn test_exact_match_passes() {
        let tests = [TestCase::new("basic", json!({"text": "hello"})).expecting("olleh")];
        let run = runner().run_tests(REVERSE, &tests, "reverse_text").await;
        assert!(run.all_passed);
        assert!(!run.timed_out);
        assert_eq!(run.results[0].output.as_deref(), Some("olleh"));
        assert_eq!(run.results[0].input["text"], json!("hello"));
    }

    #[tokio::test]
    async fn test_expected_contains_and_no_expectation() {
        let tests = [
            TestCase::new("contains", json!({"text": "abc"})).containing("cb"),
            TestCase::new("runs", json!({"text": ""})),
        ];
        let run = runner().run_tests(REVERSE, &tests, "reverse_text").await;
        assert!(run.all_passed);
        assert_eq!(run.results[1].output.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_wrong_output_message() {
        let tests = [TestCase::new("wrong", json!({"text": "ab"})).expecting("ab")];
        let run = runner().run_tests(REVERSE, &tests, "reverse_text").await;
        assert!(!run.all_passed);
        assert_eq!(run.results[0].error.as_deref(), Some("Expected 'ab', got 'ba'"));

        let tests = [TestCase::new("missing", json!({"text": "ab"})).containing("zz")];
        let run = runner().run_tests(REVERSE, &tests, "reverse_text").await;
        assert_eq!(
            run.results[0].error.as_deref(),
            Some("Output doesn't contain 'zz'")
        );
    }

    #[tokio::test]
    async fn test_none_result_compares_as_text() {
        let source = "def nothing():\n    pass\n";
        let tests = [TestCase::new("none", json!({})).expecting("None")];
        let run = runner().run_tests(source, &tests, "nothing").await;
        assert!(run.all_passed);
        assert_eq!(run.results[0].output, None);
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let source = "def divide(a, b):\n    return a // b\n";
        let tests = [
            TestCase::new("ok", json!({"a": 6, "b": 3})).expecting("2"),
            TestCase::new("boom", json!({"a": 1, "b": 0})),
            TestCase::new("still_runs", json!({"a": 9, "b": 3})).expecting("3"),
        ];
        let run = runner().run_tests(source, &tests, "divide").await;

        assert!(!run.all_passed);
        let passed: Vec<bool> = run.results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, true]);
        let failure = run.first_failure().unwrap();
        assert_eq!(failure.name, "boom");
        assert!(failure.error.as_deref().unwrap().contains("ZeroDivisionError"));
        assert!(failure.traceback.as_deref().unwrap().contains("in divide"));
    }

    #[tokio::test]
    async fn test_wide_range_bounds_stay_within_one_test() {
        let source = "def pick(wide):\n    if wide:\n        return len(list(range(-9223372036854775807, 9223372036854775807, 4611686018427387904)))\n    return 0\n";
        let tests = [
            TestCase::new("before", json!({"wide": false})).expecting("0"),
            TestCase::new("wide", json!({"wide": true})).expecting("5"),
            TestCase::new("after", json!({"wide": false})).expecting("0"),
        ];
        let run = runner().run_tests(source, &tests, "pick").await;

        let passed: Vec<bool> = run.results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, true]);
        assert_eq!(run.results[1].error.as_deref(), Some("Expected '5', got '4'"));
    }

    #[tokio::test]
    async fn test_helpers_visible_to_tests() {
        let helper = Program::compile("def flip(text):\n    return text[::-1]\n").unwrap();
        let source = "def reverse_text(text):\n    return flip(text)\n";
        let tests = [TestCase::new("basic", json!({"text": "abc"})).expecting("cba")];

        let run = runner()
            .run_tests_with_helpers(source, &[helper], &tests, "reverse_text")
            .await;
        assert!(run.all_passed);

        let run = runner().run_tests(source, &tests, "reverse_text").await;
        assert!(run.results[0].error.as_deref().unwrap().contains("NameError"));
    }

    #[tokio::test]
    async fn test_load_failure_is_single_result() {
        let tests = [TestCase::new("never", json!({}))];

        let run = runner().run_tests("def f(:\n", &tests, "f").await;
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].name, LOAD_RESULT);

        let run = runner()
            .run_tests("import socket\n\ndef f():\n    return 1\n", &tests, "f")
            .await;
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].name, LOAD_RESULT);
        assert!(run.results[0].error.as_deref().unwrap().contains("Failed to load code"));
    }

    #[tokio::test]
    async fn test_missing_entry_function() {
        let tests = [TestCase::new("never", json!({}))];
        let run = runner().run_tests(REVERSE, &tests, "other").await;
        assert!(!run.all_passed);
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].name, PRESENCE_RESULT);
        assert_eq!(
            run.results[0].error.as_deref(),
            Some("Function 'other' not defined in code")
        );
    }

    #[tokio::test]
    async fn test_non_returning_function_times_out() {
        let source = "def spin(n):\n    while True:\n        n = n + 1\n    return n\n";
        let tests = [
            TestCase::new("first", json!({"n": 0})),
            TestCase::new("second", json!({"n": 1})),
        ];
        let runner = TestRunner::new(Duration::from_millis(300), SandboxPolicy::local());

        let started = std::time::Instant::now();
        let run = runner.run_tests(source, &tests, "spin").await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(run.timed_out);
        assert!(!run.all_passed);
        assert!(run.results[0].error.as_deref().unwrap().contains("Timed out"));
        assert!(run.results[1].error.as_deref().unwrap().starts_with("Not run"));
    }

    #[tokio::test]
    async fn test_step_budget_fails_only_that_test() {
        let source = "def count(n):\n    total = 0\n    for i in range(n):\n        total += i\n    return total\n";
        let tests = [
            TestCase::new("huge", json!({"n": 10_000_000})),
            TestCase::new("small", json!({"n": 4})).expecting("6"),
        ];
        let runner = TestRunner::new(Duration::from_secs(10), SandboxPolicy::sandboxed(10_000));
        let run = runner.run_tests(source, &tests, "count").await;

        assert!(!run.timed_out);
        assert!(run.results[0].error.as_deref().unwrap().contains("step budget"));
        assert!(run.results[1].passed);
    }
}
