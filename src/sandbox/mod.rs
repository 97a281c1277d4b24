// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandboxed evaluation of recipe scripts
//!
//! Recipes arrive in pull requests and are untrusted. This module parses a
//! recipe and evaluates it with an interpreter that has no access to the
//! host: it never spawns processes, never touches the filesystem and starts
//! from an empty environment. Commands that are not interpreter builtins or
//! script-defined functions are no-ops. The only output is the set of
//! variable and function bindings the script declared.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

mod interp;
mod parser;
mod pattern;

use interp::Interp;
use parser::Parser;

/// A variable value; the recipe language is dynamically typed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

/// Everything a recipe declared, as seen after evaluation
#[derive(Debug, Clone, Default)]
pub struct ScriptBindings {
    /// Variables set by the script
    pub vars: BTreeMap<String, Value>,

    /// Names of functions the script defined
    pub functions: BTreeSet<String>,

    /// Line of the first top-level assignment of each variable
    pub var_lines: HashMap<String, u32>,

    /// Line of the first top-level definition of each function
    pub func_lines: HashMap<String, u32>,
}

impl ScriptBindings {
    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }
}

/// Resource bounds for one evaluation
///
/// Every bound turns into a [`SandboxError`], so a recipe can neither
/// exhaust the stack or the heap nor keep a worker busy indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Commands executed before evaluation is aborted
    pub max_steps: usize,

    /// Maximum nesting of function calls
    pub max_depth: usize,

    /// Maximum nesting of compound commands and expansions, both in the
    /// source and at run time across function calls
    pub max_nesting: usize,

    /// Highest array index plus one
    pub max_array_len: usize,

    /// Bytes all expansions together may produce
    pub max_expansion_bytes: usize,

    /// Work units pattern matching may spend
    pub max_match_work: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 100_000,
            max_depth: 64,
            max_nesting: 100,
            max_array_len: 100_000,
            max_expansion_bytes: 16 << 20,
            max_match_work: 10_000_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("line {line}: unsupported construct: {construct}")]
    Unsupported { line: u32, construct: String },

    #[error("evaluation exceeded {0} steps")]
    StepBudget(usize),

    #[error("function calls nested deeper than {0}")]
    RecursionLimit(usize),

    #[error("commands nested deeper than {0} at run time")]
    NestingLimit(usize),

    #[error("array index {index} is beyond the {limit} element limit")]
    ArrayIndex { index: i64, limit: usize },

    #[error("expansions produced more than {0} bytes")]
    ExpansionBudget(usize),

    #[error("pattern matching exceeded {0} work units")]
    MatchBudget(usize),
}

/// Evaluate a recipe with the default limits
pub fn evaluate(source: &str) -> Result<ScriptBindings, SandboxError> {
    evaluate_with(source, Limits::default())
}

pub fn evaluate_with(source: &str, limits: Limits) -> Result<ScriptBindings, SandboxError> {
    let script = Parser::new(source)
        .max_nesting(limits.max_nesting)
        .parse()?;
    let (var_lines, func_lines) = interp::first_lines(&script);

    let mut interp = Interp::new(limits);
    interp.run(&script)?;
    let (vars, functions) = interp.into_bindings();

    Ok(ScriptBindings {
        vars,
        functions,
        var_lines,
        func_lines,
    })
}
