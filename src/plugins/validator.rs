//! Static vetting of candidate source.
//!
//! The validator walks the parsed syntax tree and flags imports, calls and
//! attribute names that have no business in a plugin. It is a second line
//! of defense: the interpreter already lacks these capabilities, but a
//! clear rejection message is better feedback for the code's author than a
//! runtime `NameError`.

use std::collections::HashSet;

use serde::Serialize;

use crate::plugins::manifest::TrustLevel;
use crate::sandbox::ast::{self, Expr, Stmt, StmtKind, Target, Visitor};
use crate::sandbox::parse_module;

/// Root modules that may not be imported.
pub const FORBIDDEN_IMPORTS: &[&str] = &[
    // process / OS control
    "os",
    "subprocess",
    "sys",
    "shutil",
    "multiprocessing",
    "threading",
    "ctypes",
    "signal",
    // serialization
    "pickle",
    "marshal",
    "shelve",
    // network
    "socket",
    "urllib",
    "http",
    "requests",
    "httpx",
    "aiohttp",
    // dynamic import / code
    "importlib",
    "runpy",
    "code",
    "codeop",
    "builtins",
    "inspect",
    // filesystem
    "tempfile",
    "pathlib",
    "glob",
    "fnmatch",
    "io",
];

/// Functions that may not be called, by name or as a method.
pub const FORBIDDEN_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "input",
];

/// Reflective attribute names.
pub const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "__code__",
    "__globals__",
    "__builtins__",
    "__subclasses__",
    "__bases__",
    "__mro__",
    "__class__",
    "__dict__",
    "__closure__",
    "__func__",
    "__self__",
];

/// Outcome of a validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub accepted: bool,
    pub issues: Vec<String>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            accepted: issues.is_empty(),
            issues,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeValidator {
    allowed_imports: HashSet<String>,
}

impl CodeValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exempt the given root modules from the import denylist.
    pub fn with_allowed_imports<I, S>(imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_imports: imports.into_iter().map(Into::into).collect(),
        }
    }

    /// Validator for code running at `trust`. Local code may read the
    /// environment through `os.getenv`.
    pub fn for_trust(trust: TrustLevel) -> Self {
        match trust {
            TrustLevel::Sandbox => Self::new(),
            TrustLevel::Local => Self::with_allowed_imports(["os"]),
        }
    }

    /// Check `source`, reporting every violation found.
    pub fn validate(&self, source: &str) -> ValidationReport {
        let module = match parse_module(source) {
            Ok(module) => module,
            Err(e) => return ValidationReport::from_issues(vec![e.to_string()]),
        };

        let mut scan = Scan {
            validator: self,
            issues: Vec::new(),
        };
        ast::walk_module(&mut scan, &module);

        let mut issues = scan.issues;
        if module.top_level_functions().is_empty() {
            issues.push("Code must define at least one function".to_string());
        }
        ValidationReport::from_issues(issues)
    }

    fn import_forbidden(&self, dotted: &str) -> bool {
        let root = dotted.split('.').next().unwrap_or(dotted);
        FORBIDDEN_IMPORTS.contains(&root) && !self.allowed_imports.contains(root)
    }
}

struct Scan<'a> {
    validator: &'a CodeValidator,
    issues: Vec<String>,
}

impl Scan<'_> {
    fn check_attribute(&mut self, attr: &str) {
        if FORBIDDEN_ATTRIBUTES.contains(&attr) {
            self.issues
                .push(format!("Forbidden attribute access: {attr}"));
        }
    }
}

impl Visitor for Scan<'_> {
    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    if self.validator.import_forbidden(&alias.name) {
                        self.issues.push(format!("Forbidden import: {}", alias.name));
                    }
                }
            }
            StmtKind::ImportFrom { module, .. } => {
                if self.validator.import_forbidden(module) {
                    self.issues.push(format!("Forbidden import from: {module}"));
                }
            }
            _ => {}
        }
        ast::walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Call { func, .. } => match func.as_ref() {
                Expr::Name(name) if FORBIDDEN_CALLS.contains(&name.as_str()) => {
                    self.issues.push(format!("Forbidden call: {name}()"));
                }
                Expr::Attribute { attr, .. } if FORBIDDEN_CALLS.contains(&attr.as_str()) => {
                    self.issues.push(format!("Forbidden call: .{attr}()"));
                }
                _ => {}
            },
            Expr::Attribute { attr, .. } => self.check_attribute(attr),
            _ => {}
        }
        ast::walk_expr(self, expr);
    }

    fn visit_target(&mut self, target: &Target) {
        if let Target::Attribute { attr, .. } = target {
            self.check_attribute(attr);
        }
        ast::walk_target(self, target);
    }
}
