//! Compiled Code Units
//!
//! This module defines [`CodeUnit`], the compiled form of one interactive
//! submission as handed over by the front end. A unit is a bag of named
//! functions in a small expression IR, plus two well-known lists: the global
//! constructors and global destructors the execution engine must run around
//! the unit's lifetime.
//!
//! # Design
//!
//! The engine treats a unit as opaque beyond three capabilities:
//!
//! - name-based function lookup (entry points are ordinary named functions,
//!   typically synthetic wrappers generated one per submitted statement)
//! - access to the constructor/destructor lists
//! - structural validation and a diagnostic text dump
//!
//! Ownership transfers to the engine exactly once when the unit is loaded;
//! the engine is responsible for its eventual teardown.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use itertools::Itertools;

// =============================================================================
// Expression IR
// =============================================================================

/// One expression in a function body.
///
/// The IR is deliberately small: integer constants, parameter references,
/// integer arithmetic, calls to other functions in the same unit, and calls
/// through named external symbols. External symbols follow the C convention
/// used by the code generator: every parameter and the return value are
/// 64-bit integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// 64-bit integer constant
    Const(i64),
    /// Reference to the n-th function parameter
    Arg(usize),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    /// Call a function defined in the same unit
    CallLocal { callee: String, args: Vec<Expr> },
    /// Call through an external symbol, bound lazily at code-generation time
    CallExtern { symbol: String, args: Vec<Expr> },
}

impl Expr {
    /// Visit this expression and all sub-expressions in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Const(_) | Expr::Arg(_) => {}
            Expr::Add(lhs, rhs) | Expr::Sub(lhs, rhs) | Expr::Mul(lhs, rhs) => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expr::CallLocal { args, .. } | Expr::CallExtern { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
        }
    }

    /// Convenience constructor for `Add` without writing `Box::new` at every
    /// call site.
    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Add(Box::new(lhs), Box::new(rhs))
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(lhs), Box::new(rhs))
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(lhs), Box::new(rhs))
    }

    /// Call a function defined in the same unit.
    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::CallLocal {
            callee: callee.into(),
            args,
        }
    }

    /// Call through an external symbol.
    pub fn call_extern(symbol: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::CallExtern {
            symbol: symbol.into(),
            args,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Arg(i) => write!(f, "%{}", i),
            Expr::Add(lhs, rhs) => write!(f, "(+ {} {})", lhs, rhs),
            Expr::Sub(lhs, rhs) => write!(f, "(- {} {})", lhs, rhs),
            Expr::Mul(lhs, rhs) => write!(f, "(* {} {})", lhs, rhs),
            Expr::CallLocal { callee, args } if args.is_empty() => write!(f, "(call {})", callee),
            Expr::CallLocal { callee, args } => {
                write!(f, "(call {} {})", callee, args.iter().format(" "))
            }
            Expr::CallExtern { symbol, args } if args.is_empty() => {
                write!(f, "(extern {})", symbol)
            }
            Expr::CallExtern { symbol, args } => {
                write!(f, "(extern {} {})", symbol, args.iter().format(" "))
            }
        }
    }
}

// =============================================================================
// Function Definitions
// =============================================================================

/// How a function returns its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetKind {
    /// No return value; the body runs for its side effects.
    Unit,
    /// A single 64-bit scalar, returned in a register.
    Scalar,
    /// An oversized result written field by field into caller-supplied
    /// storage. The storage pointer is passed as an implicit first argument
    /// and no register value is returned.
    Aggregate { fields: usize },
}

impl fmt::Display for RetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetKind::Unit => write!(f, "unit"),
            RetKind::Scalar => write!(f, "i64"),
            RetKind::Aggregate { fields } => write!(f, "agg[{}]", fields),
        }
    }
}

/// One named function inside a [`CodeUnit`].
///
/// The body is an ordered sequence of expressions, evaluated left to right.
/// For a [`RetKind::Scalar`] function the value of the final expression is
/// the return value. For [`RetKind::Aggregate`] each body expression produces
/// one field of the result, written in order into the caller's storage. For
/// [`RetKind::Unit`] every value is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub params: usize,
    pub ret: RetKind,
    pub body: Vec<Expr>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, params: usize, ret: RetKind, body: Vec<Expr>) -> Self {
        FunctionDef {
            name: name.into(),
            params,
            ret,
            body,
        }
    }

    /// A function returning a single 64-bit scalar.
    pub fn scalar(name: impl Into<String>, params: usize, body: Vec<Expr>) -> Self {
        Self::new(name, params, RetKind::Scalar, body)
    }

    /// A function run purely for its side effects.
    pub fn effect(name: impl Into<String>, params: usize, body: Vec<Expr>) -> Self {
        Self::new(name, params, RetKind::Unit, body)
    }

    /// A function whose result is written into caller-supplied storage, one
    /// field per body expression.
    pub fn aggregate(name: impl Into<String>, params: usize, body: Vec<Expr>) -> Self {
        let fields = body.len();
        Self::new(name, params, RetKind::Aggregate { fields }, body)
    }

    /// All `(callee, argument count)` pairs of local calls in the body,
    /// in syntactic order. A callee referenced more than once appears once
    /// per call site.
    pub fn local_callees(&self) -> Vec<(&str, usize)> {
        let mut out = Vec::new();
        for expr in &self.body {
            expr.walk(&mut |e| {
                if let Expr::CallLocal { callee, args } = e {
                    out.push((callee.as_str(), args.len()));
                }
            });
        }
        out
    }

    /// All `(symbol, argument count)` pairs of external-symbol calls in the
    /// body, in syntactic order.
    pub fn extern_refs(&self) -> Vec<(&str, usize)> {
        let mut out = Vec::new();
        for expr in &self.body {
            expr.walk(&mut |e| {
                if let Expr::CallExtern { symbol, args } = e {
                    out.push((symbol.as_str(), args.len()));
                }
            });
        }
        out
    }
}

// =============================================================================
// Structural Verification
// =============================================================================

/// One structural problem found by [`CodeUnit::validate`].
///
/// Verification is diagnostic only; the engine never refuses to execute a
/// unit because of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    DuplicateFunction(String),
    UnknownCallee {
        function: String,
        callee: String,
    },
    CalleeArityMismatch {
        function: String,
        callee: String,
        expected: usize,
        got: usize,
    },
    /// A local call targets a function with an aggregate return; those are
    /// only invokable as entry points, where the engine supplies the storage
    /// pointer.
    AggregateCallee {
        function: String,
        callee: String,
    },
    ArgOutOfRange {
        function: String,
        index: usize,
        params: usize,
    },
    /// The same external symbol is called with two different argument counts;
    /// the code generator can only declare one signature per symbol.
    ExternArityConflict {
        symbol: String,
        first: usize,
        conflicting: usize,
    },
    EmptyScalarBody(String),
    FieldCountMismatch {
        function: String,
        fields: usize,
        body: usize,
    },
    /// A constructor or destructor list names a function that is missing or
    /// takes parameters.
    BadListMember {
        list: &'static str,
        name: String,
    },
}

impl fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyIssue::DuplicateFunction(name) => {
                write!(f, "function '{}' defined more than once", name)
            }
            VerifyIssue::UnknownCallee { function, callee } => {
                write!(f, "'{}' calls unknown function '{}'", function, callee)
            }
            VerifyIssue::CalleeArityMismatch {
                function,
                callee,
                expected,
                got,
            } => write!(
                f,
                "'{}' calls '{}' with {} argument(s), expected {}",
                function, callee, got, expected
            ),
            VerifyIssue::AggregateCallee { function, callee } => write!(
                f,
                "'{}' calls aggregate-returning function '{}' in expression position",
                function, callee
            ),
            VerifyIssue::ArgOutOfRange {
                function,
                index,
                params,
            } => write!(
                f,
                "'{}' references argument {} but takes {} parameter(s)",
                function, index, params
            ),
            VerifyIssue::ExternArityConflict {
                symbol,
                first,
                conflicting,
            } => write!(
                f,
                "external symbol '{}' called with both {} and {} argument(s)",
                symbol, first, conflicting
            ),
            VerifyIssue::EmptyScalarBody(name) => {
                write!(f, "scalar function '{}' has an empty body", name)
            }
            VerifyIssue::FieldCountMismatch {
                function,
                fields,
                body,
            } => write!(
                f,
                "'{}' declares {} aggregate field(s) but its body produces {}",
                function, fields, body
            ),
            VerifyIssue::BadListMember { list, name } => {
                write!(f, "{} list member '{}' is missing or takes parameters", list, name)
            }
        }
    }
}

// =============================================================================
// CodeUnit
// =============================================================================

/// A compiled unit: the product of one front-end submission.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    name: String,
    functions: Vec<FunctionDef>,
    index: HashMap<String, usize>,
    global_ctors: Option<Vec<String>>,
    global_dtors: Option<Vec<String>>,
}

impl CodeUnit {
    /// Start building a unit with the given name.
    pub fn builder(name: impl Into<String>) -> UnitBuilder {
        UnitBuilder {
            unit: CodeUnit {
                name: name.into(),
                functions: Vec::new(),
                index: HashMap::new(),
                global_ctors: None,
                global_dtors: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter()
    }

    /// The global constructor list, if the unit still carries one.
    pub fn global_ctors(&self) -> Option<&[String]> {
        self.global_ctors.as_deref()
    }

    /// Remove and return the global constructor list. After this the unit no
    /// longer carries the list, so a later initializer run is a no-op.
    pub fn take_global_ctors(&mut self) -> Option<Vec<String>> {
        self.global_ctors.take()
    }

    /// The global destructor list, if present. Unlike the constructor list
    /// this is never removed by the engine; destructor runs are repeatable.
    pub fn global_dtors(&self) -> Option<&[String]> {
        self.global_dtors.as_deref()
    }

    /// Check the unit for structural problems. Returns every issue found;
    /// an empty result means the unit is well formed.
    pub fn validate(&self) -> Vec<VerifyIssue> {
        let mut issues = Vec::new();

        let mut seen = HashMap::new();
        for def in &self.functions {
            if seen.insert(def.name.as_str(), ()).is_some() {
                issues.push(VerifyIssue::DuplicateFunction(def.name.clone()));
            }
        }

        let mut extern_arity: HashMap<&str, usize> = HashMap::new();
        for def in &self.functions {
            if matches!(def.ret, RetKind::Scalar) && def.body.is_empty() {
                issues.push(VerifyIssue::EmptyScalarBody(def.name.clone()));
            }
            if let RetKind::Aggregate { fields } = def.ret {
                if fields != def.body.len() {
                    issues.push(VerifyIssue::FieldCountMismatch {
                        function: def.name.clone(),
                        fields,
                        body: def.body.len(),
                    });
                }
            }

            for expr in &def.body {
                expr.walk(&mut |e| match e {
                    Expr::Arg(i) if *i >= def.params => {
                        issues.push(VerifyIssue::ArgOutOfRange {
                            function: def.name.clone(),
                            index: *i,
                            params: def.params,
                        });
                    }
                    Expr::CallLocal { callee, args } => match self.function(callee) {
                        None => issues.push(VerifyIssue::UnknownCallee {
                            function: def.name.clone(),
                            callee: callee.clone(),
                        }),
                        Some(target) => {
                            if target.params != args.len() {
                                issues.push(VerifyIssue::CalleeArityMismatch {
                                    function: def.name.clone(),
                                    callee: callee.clone(),
                                    expected: target.params,
                                    got: args.len(),
                                });
                            }
                            if matches!(target.ret, RetKind::Aggregate { .. }) {
                                issues.push(VerifyIssue::AggregateCallee {
                                    function: def.name.clone(),
                                    callee: callee.clone(),
                                });
                            }
                        }
                    },
                    Expr::CallExtern { symbol, args } => {
                        match extern_arity.get(symbol.as_str()) {
                            None => {
                                extern_arity.insert(symbol.as_str(), args.len());
                            }
                            Some(&first) if first != args.len() => {
                                issues.push(VerifyIssue::ExternArityConflict {
                                    symbol: symbol.clone(),
                                    first,
                                    conflicting: args.len(),
                                });
                            }
                            Some(_) => {}
                        }
                    }
                    _ => {}
                });
            }
        }

        for (list, names) in [
            ("constructor", self.global_ctors.as_deref()),
            ("destructor", self.global_dtors.as_deref()),
        ] {
            for name in names.unwrap_or_default() {
                let usable = self
                    .function(name)
                    .map(|def| def.params == 0)
                    .unwrap_or(false);
                if !usable {
                    issues.push(VerifyIssue::BadListMember {
                        list,
                        name: name.clone(),
                    });
                }
            }
        }

        issues
    }

    /// Render the unit as human-readable text. Never fails; intended for
    /// diagnostics only.
    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "unit {}", self.name);
        for def in &self.functions {
            let _ = writeln!(out, "  fn {}/{} -> {}", def.name, def.params, def.ret);
            for expr in &def.body {
                let _ = writeln!(out, "    {}", expr);
            }
        }
        let _ = writeln!(
            out,
            "  constructors: {}",
            match &self.global_ctors {
                Some(names) if !names.is_empty() => names.iter().join(", "),
                _ => "<none>".to_string(),
            }
        );
        let _ = writeln!(
            out,
            "  destructors: {}",
            match &self.global_dtors {
                Some(names) if !names.is_empty() => names.iter().join(", "),
                _ => "<none>".to_string(),
            }
        );
        out
    }
}

/// Fluent builder for [`CodeUnit`], used by front ends and tests.
pub struct UnitBuilder {
    unit: CodeUnit,
}

impl UnitBuilder {
    /// Add a function definition. The first definition of a name wins for
    /// lookup; duplicates are reported by [`CodeUnit::validate`].
    pub fn function(mut self, def: FunctionDef) -> Self {
        self.unit
            .index
            .entry(def.name.clone())
            .or_insert(self.unit.functions.len());
        self.unit.functions.push(def);
        self
    }

    /// Install the global constructor list.
    pub fn constructors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit.global_ctors = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Install the global destructor list.
    pub fn destructors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unit.global_dtors = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> CodeUnit {
        self.unit
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_unit() -> CodeUnit {
        CodeUnit::builder("sample")
            .function(FunctionDef::scalar(
                "double",
                1,
                vec![Expr::mul(Expr::Arg(0), Expr::Const(2))],
            ))
            .function(FunctionDef::scalar(
                "main_wrapper",
                0,
                vec![Expr::call("double", vec![Expr::Const(21)])],
            ))
            .constructors(["setup"])
            .function(FunctionDef::effect("setup", 0, vec![]))
            .build()
    }

    #[test]
    fn test_function_lookup() {
        let unit = sample_unit();
        assert!(unit.function("double").is_some());
        assert!(unit.function("missing").is_none());
        assert_eq!(unit.function("double").unwrap().params, 1);
    }

    #[test]
    fn test_validate_clean_unit() {
        assert!(sample_unit().validate().is_empty());
    }

    #[test]
    fn test_validate_unknown_callee() {
        let unit = CodeUnit::builder("bad")
            .function(FunctionDef::scalar(
                "f",
                0,
                vec![Expr::call("ghost", vec![])],
            ))
            .build();
        let issues = unit.validate();
        assert!(issues
            .iter()
            .any(|i| matches!(i, VerifyIssue::UnknownCallee { callee, .. } if callee == "ghost")));
    }

    #[test]
    fn test_validate_arity_mismatch() {
        let unit = CodeUnit::builder("bad")
            .function(FunctionDef::scalar("id", 1, vec![Expr::Arg(0)]))
            .function(FunctionDef::scalar(
                "f",
                0,
                vec![Expr::call("id", vec![Expr::Const(1), Expr::Const(2)])],
            ))
            .build();
        let issues = unit.validate();
        assert!(issues.iter().any(|i| matches!(
            i,
            VerifyIssue::CalleeArityMismatch {
                expected: 1,
                got: 2,
                ..
            }
        )));
    }

    #[test]
    fn test_validate_extern_arity_conflict() {
        let unit = CodeUnit::builder("bad")
            .function(FunctionDef::scalar(
                "f",
                0,
                vec![
                    Expr::call_extern("probe", vec![]),
                    Expr::call_extern("probe", vec![Expr::Const(1)]),
                ],
            ))
            .build();
        let issues = unit.validate();
        assert!(issues
            .iter()
            .any(|i| matches!(i, VerifyIssue::ExternArityConflict { symbol, .. } if symbol == "probe")));
    }

    #[test]
    fn test_validate_bad_list_member() {
        let unit = CodeUnit::builder("bad")
            .function(FunctionDef::effect("init", 1, vec![]))
            .constructors(["init", "phantom"])
            .build();
        let issues = unit.validate();
        // "init" takes a parameter, "phantom" does not exist
        assert_eq!(
            issues
                .iter()
                .filter(|i| matches!(i, VerifyIssue::BadListMember { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_take_global_ctors_removes_list() {
        let mut unit = sample_unit();
        assert!(unit.global_ctors().is_some());
        let taken = unit.take_global_ctors();
        assert_eq!(taken, Some(vec!["setup".to_string()]));
        assert!(unit.global_ctors().is_none());
    }

    #[test]
    fn test_dump_text_mentions_functions_and_lists() {
        let text = sample_unit().dump_text();
        assert!(text.contains("unit sample"));
        assert!(text.contains("fn double/1 -> i64"));
        assert!(text.contains("(* %0 2)"));
        assert!(text.contains("constructors: setup"));
        assert!(text.contains("destructors: <none>"));
    }

    #[test]
    fn test_expr_display() {
        let e = Expr::call(
            "f",
            vec![Expr::add(Expr::Const(1), Expr::Arg(0)), Expr::Const(3)],
        );
        assert_eq!(e.to_string(), "(call f (+ 1 %0) 3)");
    }
}
