// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tree-walking interpreter for parsed recipes
//!
//! Only interpreter builtins and script-defined functions have effects, and
//! those effects are confined to the interpreter's own variable table.
//! Every string an expansion produces is charged against
//! [`Limits::max_expansion_bytes`] and every pattern match against
//! [`Limits::max_match_work`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use super::parser::{
    is_bare_literal, AndOr, Assign, AssignValue, Command, DeclArg, ParamExp, ParamOp,
    Pipeline, Subscript, TestToken, Word, WordPart,
};
use super::pattern::{self, Exhausted, Fuel};
use super::{Limits, SandboxError, Value};

type Result<T> = std::result::Result<T, SandboxError>;

/// Charged per stored string on top of its length
const SLOT_BYTES: usize = std::mem::size_of::<String>();

/// Parentheses allowed inside one conditional expression
const MAX_TEST_NESTING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    Return,
    Exit,
    Break(usize),
    Continue(usize),
}

/// Result of looking up a parameter before operators are applied
#[derive(Debug, Clone)]
enum Expanded {
    Unset,
    Scalar(String),
    Fields(Vec<String>),
}

impl Expanded {
    fn is_null(&self, colon: bool) -> bool {
        match self {
            Expanded::Unset => true,
            Expanded::Scalar(s) => colon && s.is_empty(),
            Expanded::Fields(v) => v.is_empty() || (colon && v.iter().all(String::is_empty)),
        }
    }

    fn map(self, f: impl Fn(&str) -> String) -> Expanded {
        match self {
            Expanded::Unset => Expanded::Unset,
            Expanded::Scalar(s) => Expanded::Scalar(f(&s)),
            Expanded::Fields(v) => Expanded::Fields(v.iter().map(|s| f(s)).collect()),
        }
    }

    fn try_map<E>(
        self,
        mut f: impl FnMut(&str) -> std::result::Result<String, E>,
    ) -> std::result::Result<Expanded, E> {
        Ok(match self {
            Expanded::Unset => Expanded::Unset,
            Expanded::Scalar(s) => Expanded::Scalar(f(&s)?),
            Expanded::Fields(v) => {
                Expanded::Fields(v.iter().map(|s| f(s)).collect::<std::result::Result<_, E>>()?)
            }
        })
    }

    fn bytes(&self) -> usize {
        match self {
            Expanded::Unset => 0,
            Expanded::Scalar(s) => s.len() + SLOT_BYTES,
            Expanded::Fields(v) => v.iter().map(|s| s.len() + SLOT_BYTES).sum(),
        }
    }

    fn joined(self) -> String {
        match self {
            Expanded::Unset => String::new(),
            Expanded::Scalar(s) => s,
            Expanded::Fields(v) => v.join(" "),
        }
    }
}

fn value_bytes(value: &Value) -> usize {
    match value {
        Value::Str(s) => s.len() + SLOT_BYTES,
        Value::List(items) => items.iter().map(|s| s.len() + SLOT_BYTES).sum(),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2 * SLOT_BYTES)
            .sum(),
    }
}

/// Accumulates fields during word expansion
#[derive(Default)]
struct Fields {
    fields: Vec<String>,
    current: String,
    has_current: bool,
}

impl Fields {
    fn push_quoted(&mut self, text: &str) {
        self.current.push_str(text);
        self.has_current = true;
    }

    fn push_split(&mut self, text: &str) {
        for c in text.chars() {
            if c.is_whitespace() {
                self.finish();
            } else {
                self.current.push(c);
                self.has_current = true;
            }
        }
    }

    fn push_list(&mut self, items: &[String], quoted: bool) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.finish();
            }
            if quoted {
                self.push_quoted(item);
            } else {
                self.push_split(item);
            }
        }
    }

    fn finish(&mut self) {
        if self.has_current {
            self.fields.push(std::mem::take(&mut self.current));
            self.has_current = false;
        }
    }

    fn into_fields(mut self) -> Vec<String> {
        self.finish();
        self.fields
    }
}

/// Saved state of a variable shadowed by `local`
struct Saved {
    value: Option<Value>,
    assoc: bool,
}

/// One argument of a conditional expression
struct TestArg {
    text: String,
    /// Unquoted, so it may act as an operator
    operator: bool,
    /// Right-hand side of `[[ == ]]` as a pattern
    pattern: Option<String>,
}

impl TestArg {
    fn is_op(&self, ops: &[&str]) -> bool {
        self.operator && ops.contains(&self.text.as_str())
    }
}

const UNARY_FILE_TESTS: &[&str] = &[
    "-a", "-b", "-c", "-d", "-e", "-f", "-g", "-h", "-k", "-p", "-r", "-s", "-t", "-u", "-w",
    "-x", "-G", "-L", "-N", "-O", "-S",
];
const BINARY_OPS: &[&str] = &[
    "=", "==", "!=", "<", ">", "=~", "-eq", "-ne", "-lt", "-le", "-gt", "-ge", "-nt", "-ot", "-ef",
];

pub struct Interp {
    vars: BTreeMap<String, Value>,
    assoc: HashSet<String>,
    funcs: HashMap<String, Rc<Command>>,
    frames: Vec<HashMap<String, Saved>>,
    status: i32,
    steps: usize,
    nesting: usize,
    expanded: usize,
    fuel: Fuel,
    limits: Limits,
}

impl Interp {
    pub fn new(limits: Limits) -> Self {
        Self {
            vars: BTreeMap::new(),
            assoc: HashSet::new(),
            funcs: HashMap::new(),
            frames: Vec::new(),
            status: 0,
            steps: 0,
            nesting: 0,
            expanded: 0,
            fuel: Fuel::new(limits.max_match_work),
            limits,
        }
    }

    pub fn run(&mut self, script: &[AndOr]) -> Result<()> {
        self.exec_list(script)?;
        Ok(())
    }

    pub fn into_bindings(self) -> (BTreeMap<String, Value>, BTreeSet<String>) {
        (self.vars, self.funcs.into_keys().collect())
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::StepBudget(self.limits.max_steps));
        }
        Ok(())
    }

    fn charge(&mut self, bytes: usize) -> Result<()> {
        self.expanded = self.expanded.saturating_add(bytes);
        if self.expanded > self.limits.max_expansion_bytes {
            return Err(SandboxError::ExpansionBudget(self.limits.max_expansion_bytes));
        }
        Ok(())
    }

    fn matched<T>(&self, result: std::result::Result<T, Exhausted>) -> Result<T> {
        result.map_err(|Exhausted| SandboxError::MatchBudget(self.limits.max_match_work))
    }

    fn check_index(&self, index: usize) -> Result<()> {
        let limit = self.limits.max_array_len;
        if index >= limit {
            return Err(SandboxError::ArrayIndex {
                index: i64::try_from(index).unwrap_or(i64::MAX),
                limit,
            });
        }
        Ok(())
    }

    fn exec_list(&mut self, list: &[AndOr]) -> Result<Flow> {
        for and_or in list {
            let flow = self.exec_and_or(and_or)?;
            if flow != Flow::Next {
                return Ok(flow);
            }
        }
        Ok(Flow::Next)
    }

    fn exec_and_or(&mut self, and_or: &AndOr) -> Result<Flow> {
        let mut flow = self.exec_pipeline(&and_or.first)?;
        for (and, pipeline) in &and_or.rest {
            if flow != Flow::Next {
                return Ok(flow);
            }
            if *and == (self.status == 0) {
                flow = self.exec_pipeline(pipeline)?;
            }
        }
        Ok(flow)
    }

    fn exec_pipeline(&mut self, pipeline: &Pipeline) -> Result<Flow> {
        let flow = match pipeline.commands.as_slice() {
            [single] => self.exec_command(single)?,
            commands => {
                // every stage runs in a subshell, so nothing it binds survives
                self.charge(self.vars.values().map(value_bytes).sum())?;
                let vars = self.vars.clone();
                let assoc = self.assoc.clone();
                let funcs = self.funcs.clone();
                for command in commands {
                    self.exec_command(command)?;
                }
                self.vars = vars;
                self.assoc = assoc;
                self.funcs = funcs;
                Flow::Next
            }
        };
        if pipeline.negated {
            self.status = i32::from(self.status == 0);
        }
        Ok(flow)
    }

    fn exec_command(&mut self, command: &Command) -> Result<Flow> {
        match command {
            Command::Simple { assigns, words } => {
                self.tick()?;
                let mut fields = Vec::new();
                for word in words {
                    fields.extend(self.expand_fields(word)?);
                }
                if fields.is_empty() {
                    for assign in assigns {
                        self.assign(assign)?;
                    }
                    self.status = 0;
                    return Ok(Flow::Next);
                }
                self.call(&fields)
            }
            Command::Declare { builtin, args } => {
                self.tick()?;
                self.declare(builtin, args)?;
                Ok(Flow::Next)
            }
            Command::Test(tokens) => {
                self.tick()?;
                let args = self.expand_test_tokens(tokens)?;
                let vars = &self.vars;
                let result = evaluate_test(&args, true, |name| vars.contains_key(name), &mut self.fuel);
                self.status = match self.matched(result)? {
                    Some(true) => 0,
                    Some(false) => 1,
                    None => 2,
                };
                Ok(Flow::Next)
            }
            Command::FuncDef { name, body, .. } => {
                self.tick()?;
                self.funcs.insert(name.clone(), Rc::clone(body));
                self.status = 0;
                Ok(Flow::Next)
            }
            compound => {
                if self.nesting >= self.limits.max_nesting {
                    return Err(SandboxError::NestingLimit(self.limits.max_nesting));
                }
                self.nesting += 1;
                let flow = self.exec_compound(compound);
                self.nesting -= 1;
                flow
            }
        }
    }

    fn exec_compound(&mut self, command: &Command) -> Result<Flow> {
        match command {
            Command::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    let flow = self.exec_list(condition)?;
                    if flow != Flow::Next {
                        return Ok(flow);
                    }
                    if self.status == 0 {
                        return self.exec_list(body);
                    }
                }
                match otherwise {
                    Some(body) => self.exec_list(body),
                    None => {
                        self.status = 0;
                        Ok(Flow::Next)
                    }
                }
            }
            Command::For { var, items, body } => {
                let items = match items {
                    Some(words) => {
                        let mut fields = Vec::new();
                        for word in words {
                            fields.extend(self.expand_fields(word)?);
                        }
                        fields
                    }
                    None => Vec::new(),
                };
                self.status = 0;
                for item in items {
                    self.tick()?;
                    self.set_scalar(var, item);
                    match self.exec_list(body)? {
                        Flow::Next | Flow::Continue(1) => {}
                        Flow::Break(1) => break,
                        Flow::Break(n) => return Ok(Flow::Break(n - 1)),
                        Flow::Continue(n) => return Ok(Flow::Continue(n - 1)),
                        flow => return Ok(flow),
                    }
                }
                Ok(Flow::Next)
            }
            Command::Case { subject, arms } => {
                let subject = self.expand_scalar(subject)?;
                for arm in arms {
                    for pat in &arm.patterns {
                        let pat = self.expand_pattern(pat)?;
                        let result = pattern::matches(&pat, &subject, &mut self.fuel);
                        if self.matched(result)? {
                            return self.exec_list(&arm.body);
                        }
                    }
                }
                self.status = 0;
                Ok(Flow::Next)
            }
            Command::Group(body) => self.exec_list(body),
            Command::Simple { .. }
            | Command::Declare { .. }
            | Command::Test(_)
            | Command::FuncDef { .. } => self.exec_command(command),
        }
    }

    fn call(&mut self, fields: &[String]) -> Result<Flow> {
        let args = &fields[1..];
        match fields[0].as_str() {
            "true" | ":" => self.status = 0,
            "false" => self.status = 1,
            "test" => self.builtin_test(args)?,
            "[" => match args.split_last() {
                Some((last, rest)) if last == "]" => self.builtin_test(rest)?,
                _ => self.status = 2,
            },
            "unset" => {
                let functions = args.iter().any(|a| a == "-f");
                for name in args.iter().filter(|a| !a.starts_with('-')) {
                    if functions {
                        self.funcs.remove(name);
                    } else {
                        self.vars.remove(name);
                        self.assoc.remove(name);
                    }
                }
                self.status = 0;
            }
            "return" | "exit" => {
                if let Some(code) = args.first() {
                    self.status = code.trim().parse::<i32>().unwrap_or(2) & 0xff;
                }
                return Ok(if fields[0] == "return" {
                    Flow::Return
                } else {
                    Flow::Exit
                });
            }
            "break" | "continue" => {
                let n = args
                    .first()
                    .and_then(|a| a.parse::<usize>().ok())
                    .unwrap_or(1)
                    .max(1);
                self.status = 0;
                return Ok(if fields[0] == "break" {
                    Flow::Break(n)
                } else {
                    Flow::Continue(n)
                });
            }
            name => match self.funcs.get(name).cloned() {
                Some(body) => return self.call_function(&body),
                // anything else would be an external program
                None => self.status = 0,
            },
        }
        Ok(Flow::Next)
    }

    fn call_function(&mut self, body: &Command) -> Result<Flow> {
        if self.frames.len() >= self.limits.max_depth {
            return Err(SandboxError::RecursionLimit(self.limits.max_depth));
        }
        self.frames.push(HashMap::new());
        let flow = self.exec_command(body);
        if let Some(frame) = self.frames.pop() {
            for (name, saved) in frame {
                match saved.value {
                    Some(value) => self.vars.insert(name.clone(), value),
                    None => self.vars.remove(&name),
                };
                if saved.assoc {
                    self.assoc.insert(name);
                } else {
                    self.assoc.remove(&name);
                }
            }
        }
        Ok(match flow? {
            Flow::Exit => Flow::Exit,
            _ => Flow::Next,
        })
    }

    fn builtin_test(&mut self, args: &[String]) -> Result<()> {
        let args: Vec<TestArg> = args
            .iter()
            .map(|text| TestArg {
                text: text.clone(),
                operator: true,
                pattern: None,
            })
            .collect();
        let vars = &self.vars;
        let result = evaluate_test(&args, false, |name| vars.contains_key(name), &mut self.fuel);
        self.status = match self.matched(result)? {
            Some(true) => 0,
            Some(false) => 1,
            None => 2,
        };
        Ok(())
    }

    fn declare(&mut self, builtin: &str, args: &[DeclArg]) -> Result<()> {
        let mut assoc = false;
        let mut global = false;
        for arg in args {
            if let DeclArg::Flag(flag) = arg {
                if flag.starts_with('-') {
                    assoc |= flag.contains('A');
                    global |= flag.contains('g');
                }
            }
        }
        let local = matches!(builtin, "local" | "declare" | "typeset") && !global;

        for arg in args {
            match arg {
                DeclArg::Flag(_) => {}
                DeclArg::Assign(assign) => {
                    if local {
                        self.make_local(&assign.name);
                    }
                    if assoc {
                        self.assoc.insert(assign.name.clone());
                    }
                    self.assign(assign)?;
                }
                DeclArg::Name(word) => {
                    for name in self.expand_fields(word)? {
                        if local {
                            self.make_local(&name);
                        }
                        if assoc {
                            self.assoc.insert(name);
                        }
                    }
                }
            }
        }
        self.status = 0;
        Ok(())
    }

    /// Shadow `name` for the rest of the current function call
    fn make_local(&mut self, name: &str) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        if frame.contains_key(name) {
            return;
        }
        frame.insert(
            name.to_string(),
            Saved {
                value: self.vars.remove(name),
                assoc: self.assoc.remove(name),
            },
        );
    }

    fn set_scalar(&mut self, name: &str, value: String) {
        match self.vars.get_mut(name) {
            Some(Value::List(items)) => match items.first_mut() {
                Some(first) => *first = value,
                None => items.push(value),
            },
            Some(Value::Map(map)) => {
                map.insert("0".into(), value);
            }
            _ => {
                self.vars.insert(name.to_string(), Value::Str(value));
            }
        }
    }

    fn assign(&mut self, assign: &Assign) -> Result<()> {
        let name = assign.name.as_str();
        match (&assign.index, &assign.value) {
            (Some(index), AssignValue::Scalar(word)) => {
                let key = self.expand_scalar(index)?;
                let value = self.expand_scalar(word)?;
                self.assign_element(name, key, value, assign.append)?;
            }
            (None, AssignValue::Scalar(word)) => {
                let mut value = self.expand_scalar(word)?;
                if assign.append {
                    let joined = format!("{}{}", self.scalar_ref(name).unwrap_or_default(), value);
                    self.charge(joined.len())?;
                    value = joined;
                }
                self.set_scalar(name, value);
            }
            (_, AssignValue::Array(elems)) => {
                let mut keyed = Vec::with_capacity(elems.len());
                for elem in elems {
                    match &elem.key {
                        Some(key) => {
                            let key = self.expand_scalar(key)?;
                            keyed.push((Some(key), vec![self.expand_scalar(&elem.value)?]));
                        }
                        None => keyed.push((None, self.expand_fields(&elem.value)?)),
                    }
                }

                let is_map = self.assoc.contains(name)
                    || keyed
                        .iter()
                        .any(|(key, _)| key.as_ref().map_or(false, |k| k.parse::<usize>().is_err()));

                let value = if is_map {
                    let mut map = match (assign.append, self.vars.get(name)) {
                        (true, Some(Value::Map(existing))) => existing.clone(),
                        _ => BTreeMap::new(),
                    };
                    for (key, values) in keyed {
                        for value in values {
                            let key = key.clone().unwrap_or_else(|| map.len().to_string());
                            map.insert(key, value);
                        }
                    }
                    Value::Map(map)
                } else {
                    let mut list = match (assign.append, self.vars.get(name)) {
                        (true, Some(Value::List(existing))) => existing.clone(),
                        (true, Some(Value::Str(existing))) => vec![existing.clone()],
                        _ => Vec::new(),
                    };
                    let mut next = list.len();
                    for (key, values) in keyed {
                        if let Some(index) = key.and_then(|k| k.parse::<usize>().ok()) {
                            next = index;
                        }
                        for value in values {
                            self.check_index(next)?;
                            if list.len() <= next {
                                list.resize(next + 1, String::new());
                            }
                            list[next] = value;
                            next += 1;
                        }
                    }
                    Value::List(list)
                };
                self.charge(value_bytes(&value))?;
                self.vars.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    fn assign_element(&mut self, name: &str, key: String, value: String, append: bool) -> Result<()> {
        if self.assoc.contains(name) || matches!(self.vars.get(name), Some(Value::Map(_))) {
            let map = match self.vars.entry(name.to_string()).or_insert_with(|| Value::Map(BTreeMap::new())) {
                Value::Map(map) => map,
                _ => return Ok(()),
            };
            let slot = map.entry(key).or_default();
            if append {
                slot.push_str(&value);
            } else {
                *slot = value;
            }
            return Ok(());
        }

        let index = self.arith_index(&key);
        let len = match self.vars.get(name) {
            Some(Value::List(items)) => items.len(),
            Some(Value::Str(_)) => 1,
            _ => 0,
        };
        let index = if index < 0 {
            usize::try_from(len as i64 + index).unwrap_or(0)
        } else {
            match usize::try_from(index) {
                Ok(index) => index,
                Err(_) => {
                    return Err(SandboxError::ArrayIndex {
                        index,
                        limit: self.limits.max_array_len,
                    })
                }
            }
        };
        self.check_index(index)?;
        self.charge(index.saturating_sub(len) * SLOT_BYTES)?;

        let mut list = match self.vars.remove(name) {
            Some(Value::List(items)) => items,
            Some(Value::Str(s)) => vec![s],
            _ => Vec::new(),
        };
        if list.len() <= index {
            list.resize(index + 1, String::new());
        }
        if append {
            list[index].push_str(&value);
        } else {
            list[index] = value;
        }
        self.vars.insert(name.to_string(), Value::List(list));
        Ok(())
    }

    /// Evaluate an array subscript; only integers and variable names are understood
    fn arith_index(&self, key: &str) -> i64 {
        let key = key.trim();
        if let Ok(n) = key.parse::<i64>() {
            return n;
        }
        self.scalar_ref(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }

    fn scalar_ref(&self, name: &str) -> Option<&str> {
        match self.vars.get(name)? {
            Value::Str(s) => Some(s),
            Value::List(items) => items.first().map(String::as_str),
            Value::Map(map) => map.get("0").map(String::as_str),
        }
    }

    fn lookup(&mut self, param: &ParamExp) -> Result<Expanded> {
        let name = param.name.as_str();
        match name {
            "@" | "*" => return Ok(Expanded::Fields(Vec::new())),
            "#" => return Ok(Expanded::Scalar("0".into())),
            "?" => return Ok(Expanded::Scalar(self.status.to_string())),
            "$" => return Ok(Expanded::Scalar("1".into())),
            _ if name.chars().all(|c| c.is_ascii_digit()) => return Ok(Expanded::Unset),
            _ => {}
        }

        Ok(match &param.index {
            None => self
                .scalar_ref(name)
                .map_or(Expanded::Unset, |s| Expanded::Scalar(s.to_string())),
            Some(Subscript::All) => Expanded::Fields(self.all_values(name)),
            Some(Subscript::Joined) => {
                if self.vars.contains_key(name) {
                    Expanded::Scalar(self.all_values(name).join(" "))
                } else {
                    Expanded::Unset
                }
            }
            Some(Subscript::Key(key)) => {
                let key = self.expand_scalar(key)?;
                match self.vars.get(name) {
                    Some(Value::Map(map)) => map
                        .get(&key)
                        .cloned()
                        .map_or(Expanded::Unset, Expanded::Scalar),
                    Some(Value::List(items)) => {
                        let index = self.arith_index(&key);
                        let index = if index < 0 {
                            items.len() as i64 + index
                        } else {
                            index
                        };
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| items.get(i).cloned())
                            .map_or(Expanded::Unset, Expanded::Scalar)
                    }
                    Some(Value::Str(s)) if self.arith_index(&key) == 0 => {
                        Expanded::Scalar(s.clone())
                    }
                    _ => Expanded::Unset,
                }
            }
        })
    }

    fn all_values(&self, name: &str) -> Vec<String> {
        match self.vars.get(name) {
            Some(Value::Str(s)) => vec![s.clone()],
            Some(Value::List(items)) => items.clone(),
            Some(Value::Map(map)) => map.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    fn expand_param(&mut self, param: &ParamExp) -> Result<Expanded> {
        let value = self.lookup(param)?;
        self.charge(value.bytes())?;
        if param.length {
            let len = match &value {
                Expanded::Unset => 0,
                Expanded::Scalar(s) => s.chars().count(),
                Expanded::Fields(v) => v.len(),
            };
            return Ok(Expanded::Scalar(len.to_string()));
        }

        let Some(op) = &param.op else {
            return Ok(value);
        };
        let result = match op {
            ParamOp::Default { colon, word } => {
                if value.is_null(*colon) {
                    Expanded::Scalar(self.expand_scalar(word)?)
                } else {
                    value
                }
            }
            ParamOp::Assign { colon, word } => {
                if value.is_null(*colon) {
                    let default = self.expand_scalar(word)?;
                    self.set_scalar(&param.name, default.clone());
                    Expanded::Scalar(default)
                } else {
                    value
                }
            }
            ParamOp::Alternate { colon, word } => {
                if value.is_null(*colon) {
                    Expanded::Scalar(String::new())
                } else {
                    Expanded::Scalar(self.expand_scalar(word)?)
                }
            }
            ParamOp::TrimPrefix { longest, pattern: pat } => {
                let pat = self.expand_pattern(pat)?;
                let fuel = &mut self.fuel;
                let result = value.try_map(|s| pattern::trim_prefix(s, &pat, *longest, fuel));
                self.matched(result)?
            }
            ParamOp::TrimSuffix { longest, pattern: pat } => {
                let pat = self.expand_pattern(pat)?;
                let fuel = &mut self.fuel;
                let result = value.try_map(|s| pattern::trim_suffix(s, &pat, *longest, fuel));
                self.matched(result)?
            }
            ParamOp::Replace {
                all,
                pattern: pat,
                replacement,
            } => {
                let pat = self.expand_pattern(pat)?;
                let replacement = self.expand_scalar(replacement)?;
                let fuel = &mut self.fuel;
                let result =
                    value.try_map(|s| pattern::replace(s, &pat, &replacement, *all, fuel));
                self.matched(result)?
            }
            ParamOp::Upper => value.map(str::to_uppercase),
            ParamOp::Lower => value.map(str::to_lowercase),
        };
        self.charge(result.bytes())?;
        Ok(result)
    }

    fn expand_fields(&mut self, word: &Word) -> Result<Vec<String>> {
        let mut fields = Fields::default();
        for part in word {
            match part {
                WordPart::Lit(s) | WordPart::Quoted(s) => fields.push_quoted(s),
                WordPart::Double(parts) => {
                    fields.has_current = true;
                    self.expand_double(parts, &mut fields)?;
                }
                WordPart::Param(param) => match self.expand_param(param)? {
                    Expanded::Unset => {}
                    Expanded::Scalar(s) => fields.push_split(&s),
                    Expanded::Fields(v) => fields.push_list(&v, false),
                },
                WordPart::CmdSubst => {}
            }
        }
        Ok(fields.into_fields())
    }

    fn expand_double(&mut self, parts: &[WordPart], fields: &mut Fields) -> Result<()> {
        let only_list = matches!(
            parts,
            [WordPart::Param(p)] if p.index == Some(Subscript::All) || p.name == "@"
        );
        if only_list {
            // "${list[@]}" with no elements yields no field at all
            fields.has_current = !fields.current.is_empty();
        }
        for part in parts {
            match part {
                WordPart::Param(param) => match self.expand_param(param)? {
                    Expanded::Fields(v) => fields.push_list(&v, true),
                    other => fields.push_quoted(&other.joined()),
                },
                other => {
                    let text = self.expand_scalar(std::slice::from_ref(other))?;
                    fields.push_quoted(&text);
                }
            }
        }
        Ok(())
    }

    fn expand_scalar(&mut self, word: &[WordPart]) -> Result<String> {
        let mut out = String::new();
        for part in word {
            match part {
                WordPart::Lit(s) | WordPart::Quoted(s) => out.push_str(s),
                WordPart::Double(parts) => out.push_str(&self.expand_scalar(parts)?),
                WordPart::Param(param) => out.push_str(&self.expand_param(param)?.joined()),
                WordPart::CmdSubst => {}
            }
        }
        Ok(out)
    }

    /// Expand a word for pattern matching; quoted text matches literally
    fn expand_pattern(&mut self, word: &[WordPart]) -> Result<String> {
        let mut out = String::new();
        for part in word {
            match part {
                WordPart::Lit(s) => out.push_str(s),
                WordPart::Quoted(s) => out.push_str(&pattern::escape(s)),
                WordPart::Double(parts) => {
                    let text = self.expand_scalar(parts)?;
                    out.push_str(&pattern::escape(&text));
                }
                WordPart::Param(param) => out.push_str(&self.expand_param(param)?.joined()),
                WordPart::CmdSubst => {}
            }
        }
        Ok(out)
    }

    fn expand_test_tokens(&mut self, tokens: &[TestToken]) -> Result<Vec<TestArg>> {
        let mut args: Vec<TestArg> = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token {
                TestToken::Op(op) => args.push(TestArg {
                    text: op.clone(),
                    operator: true,
                    pattern: None,
                }),
                TestToken::Word(word) => {
                    let after_match_op = args
                        .last()
                        .map_or(false, |prev| prev.is_op(&["=", "==", "!="]));
                    let pattern = if after_match_op {
                        Some(self.expand_pattern(word)?)
                    } else {
                        None
                    };
                    args.push(TestArg {
                        text: self.expand_scalar(word)?,
                        operator: is_bare_literal(word),
                        pattern,
                    });
                }
            }
        }
        Ok(args)
    }
}

/// Evaluate a conditional expression; `None` means it was malformed
fn evaluate_test(
    args: &[TestArg],
    extended: bool,
    is_set: impl Fn(&str) -> bool,
    fuel: &mut Fuel,
) -> std::result::Result<Option<bool>, Exhausted> {
    if args.is_empty() {
        return Ok(Some(false));
    }
    let mut eval = TestEval {
        args,
        pos: 0,
        depth: 0,
        extended,
        is_set: &is_set,
        fuel,
        exhausted: false,
    };
    let result = eval.or();
    if eval.exhausted {
        return Err(Exhausted);
    }
    Ok(result.filter(|_| eval.pos == args.len()))
}

struct TestEval<'a> {
    args: &'a [TestArg],
    pos: usize,
    depth: usize,
    extended: bool,
    is_set: &'a dyn Fn(&str) -> bool,
    fuel: &'a mut Fuel,
    exhausted: bool,
}

impl<'a> TestEval<'a> {
    fn peek(&self, offset: usize) -> Option<&'a TestArg> {
        self.args.get(self.pos + offset)
    }

    fn or(&mut self) -> Option<bool> {
        let mut result = self.and()?;
        while self.peek(0).map_or(false, |a| a.is_op(&["||", "-o"])) {
            self.pos += 1;
            let rhs = self.and()?;
            result = result || rhs;
        }
        Some(result)
    }

    fn and(&mut self) -> Option<bool> {
        let mut result = self.not()?;
        while self.peek(0).map_or(false, |a| a.is_op(&["&&", "-a"])) {
            self.pos += 1;
            let rhs = self.not()?;
            result = result && rhs;
        }
        Some(result)
    }

    fn not(&mut self) -> Option<bool> {
        let mut negated = false;
        while self.peek(0).map_or(false, |a| a.is_op(&["!"])) && self.peek(1).is_some() {
            self.pos += 1;
            negated = !negated;
        }
        self.primary().map(|result| result != negated)
    }

    fn primary(&mut self) -> Option<bool> {
        let first = self.peek(0)?;
        if first.is_op(&["("]) {
            if self.depth >= MAX_TEST_NESTING {
                return None;
            }
            self.pos += 1;
            self.depth += 1;
            let result = self.or();
            self.depth -= 1;
            let result = result?;
            if !self.peek(0)?.is_op(&[")"]) {
                return None;
            }
            self.pos += 1;
            return Some(result);
        }

        if let Some(op) = self.peek(1).filter(|a| a.is_op(BINARY_OPS)) {
            if let Some(rhs) = self.peek(2) {
                let result = self.binary(&first.text, &op.text, rhs);
                self.pos += 3;
                return result;
            }
        }

        if first.is_op(&["-z", "-n", "-v"]) || first.is_op(UNARY_FILE_TESTS) {
            if let Some(operand) = self.peek(1) {
                let result = match first.text.as_str() {
                    "-z" => operand.text.is_empty(),
                    "-n" => !operand.text.is_empty(),
                    "-v" => (self.is_set)(&operand.text),
                    // the sandbox has no filesystem
                    _ => false,
                };
                self.pos += 2;
                return Some(result);
            }
        }

        self.pos += 1;
        Some(!first.text.is_empty())
    }

    fn equals(&mut self, lhs: &str, rhs: &TestArg) -> bool {
        match (&rhs.pattern, self.extended) {
            (Some(pat), true) => match pattern::matches(pat, lhs, self.fuel) {
                Ok(matched) => matched,
                Err(Exhausted) => {
                    self.exhausted = true;
                    false
                }
            },
            _ => lhs == rhs.text,
        }
    }

    fn binary(&mut self, lhs: &str, op: &str, rhs: &TestArg) -> Option<bool> {
        let int = |s: &str| s.trim().parse::<i64>().ok();
        Some(match op {
            "=" | "==" => self.equals(lhs, rhs),
            "!=" => !self.equals(lhs, rhs),
            "<" => lhs < rhs.text.as_str(),
            ">" => lhs > rhs.text.as_str(),
            "-eq" => int(lhs)? == int(&rhs.text)?,
            "-ne" => int(lhs)? != int(&rhs.text)?,
            "-lt" => int(lhs)? < int(&rhs.text)?,
            "-le" => int(lhs)? <= int(&rhs.text)?,
            "-gt" => int(lhs)? > int(&rhs.text)?,
            "-ge" => int(lhs)? >= int(&rhs.text)?,
            _ => false,
        })
    }
}

/// Line of the first top-level assignment of each variable and the first
/// top-level definition of each function. Assignments prefixed to a
/// command count too.
pub fn first_lines(script: &[AndOr]) -> (HashMap<String, u32>, HashMap<String, u32>) {
    let mut vars = HashMap::new();
    let mut funcs = HashMap::new();
    for and_or in script {
        for pipeline in and_or.pipelines() {
            for command in &pipeline.commands {
                match command {
                    Command::Simple { assigns, .. } => {
                        for assign in assigns {
                            vars.entry(assign.name.clone()).or_insert(assign.line);
                        }
                    }
                    Command::Declare { args, .. } => {
                        for arg in args {
                            if let DeclArg::Assign(assign) = arg {
                                vars.entry(assign.name.clone()).or_insert(assign.line);
                            }
                        }
                    }
                    Command::FuncDef { name, line, .. } => {
                        funcs.entry(name.clone()).or_insert(*line);
                    }
                    _ => {}
                }
            }
        }
    }
    (vars, funcs)
}

#[cfg(test)]
mod tests {
    use super::super::parser::Parser;
    use super::*;

    fn run(source: &str) -> BTreeMap<String, Value> {
        let script = Parser::new(source).parse().unwrap();
        let mut interp = Interp::new(Limits::default());
        interp.run(&script).unwrap();
        interp.into_bindings().0
    }

    fn str_var(vars: &BTreeMap<String, Value>, name: &str) -> String {
        match vars.get(name) {
            Some(Value::Str(s)) => s.clone(),
            other => panic!("{name} is not a string: {other:?}"),
        }
    }

    #[test]
    fn test_parameter_operators() {
        let vars = run(concat!(
            "v=1.2.3\n",
            "a=${v//./_}\n",
            "b=${v%.*}\n",
            "c=${v#*.}\n",
            "d=${unset:-fallback}\n",
            "e=${#v}\n",
            "f=${v:+set}\n",
            "n=Hello\n",
            "g=${n,,}${n^^}\n",
        ));
        assert_eq!(str_var(&vars, "a"), "1_2_3");
        assert_eq!(str_var(&vars, "b"), "1.2");
        assert_eq!(str_var(&vars, "c"), "2.3");
        assert_eq!(str_var(&vars, "d"), "fallback");
        assert_eq!(str_var(&vars, "e"), "5");
        assert_eq!(str_var(&vars, "f"), "set");
        assert_eq!(str_var(&vars, "g"), "helloHELLO");
    }

    #[test]
    fn test_array_expansion_and_splitting() {
        let vars = run(concat!(
            "base=('a b' c)\n",
            "copy=(\"${base[@]}\" d)\n",
            "split=(${base[@]})\n",
            "empty=()\n",
            "none=(\"${empty[@]}\")\n",
        ));
        assert_eq!(
            vars["copy"],
            Value::List(vec!["a b".into(), "c".into(), "d".into()])
        );
        assert_eq!(
            vars["split"],
            Value::List(vec!["a".into(), "b".into(), "c".into()])
        );
        assert_eq!(vars["none"], Value::List(Vec::new()));
    }

    #[test]
    fn test_element_assignment_and_append() {
        let vars = run("deps=(a)\ndeps+=(b c)\ndeps[0]=z\nname=x\nname+=y\n");
        assert_eq!(
            vars["deps"],
            Value::List(vec!["z".into(), "b".into(), "c".into()])
        );
        assert_eq!(str_var(&vars, "name"), "xy");
    }

    #[test]
    fn test_declared_associative_array() {
        let vars = run("declare -A scripts\nscripts[postinstall]=post.sh\n");
        let Value::Map(map) = &vars["scripts"] else {
            panic!("expected map");
        };
        assert_eq!(map["postinstall"], "post.sh");
    }

    #[test]
    fn test_conditionals_and_case() {
        let vars = run(concat!(
            "arch=x86_64\n",
            "if [[ $arch == x86* ]]; then kind=intel; else kind=other; fi\n",
            "case $arch in\n",
            "  aarch64) bits=arm ;;\n",
            "  x86_64|i686) bits=x86 ;;\n",
            "esac\n",
            "[ -z \"$missing\" ] && empty=yes || empty=no\n",
            "if [ 3 -gt 5 ]; then cmp=gt; elif test 3 -lt 5; then cmp=lt; fi\n",
        ));
        assert_eq!(str_var(&vars, "kind"), "intel");
        assert_eq!(str_var(&vars, "bits"), "x86");
        assert_eq!(str_var(&vars, "empty"), "yes");
        assert_eq!(str_var(&vars, "cmp"), "lt");
    }

    #[test]
    fn test_quoted_pattern_is_literal() {
        let vars = run("x='a*'\nif [[ abc == \"a*\" ]]; then r=glob; else r=literal; fi\n");
        assert_eq!(str_var(&vars, "r"), "literal");
    }

    #[test]
    fn test_function_locals_are_restored() {
        let vars = run(concat!(
            "x=outer\n",
            "f() {\n",
            "  local x=inner\n",
            "  y=$x\n",
            "  return 3\n",
            "  z=unreachable\n",
            "}\n",
            "f\n",
            "status=$?\n",
        ));
        assert_eq!(str_var(&vars, "x"), "outer");
        assert_eq!(str_var(&vars, "y"), "inner");
        assert_eq!(str_var(&vars, "status"), "3");
        assert!(!vars.contains_key("z"));
    }

    #[test]
    fn test_loops_with_break_and_continue() {
        let vars = run(concat!(
            "out=\n",
            "for i in 1 2 3 4 5; do\n",
            "  if [ $i = 2 ]; then continue; fi\n",
            "  if [ $i = 4 ]; then break; fi\n",
            "  out+=$i\n",
            "done\n",
        ));
        assert_eq!(str_var(&vars, "out"), "13");
    }

    #[test]
    fn test_pipeline_stages_do_not_leak() {
        let vars = run("a=1 | b=2\n");
        assert!(!vars.contains_key("a"));
        assert!(!vars.contains_key("b"));
    }

    #[test]
    fn test_exit_stops_evaluation() {
        let vars = run("a=1\nexit 0\nb=2\n");
        assert!(vars.contains_key("a"));
        assert!(!vars.contains_key("b"));
    }

    #[test]
    fn test_first_lines_ignores_nested_assignments() {
        let script = Parser::new("if true; then\n  a=1\nfi\nb=2\nf() { :; }\n")
            .parse()
            .unwrap();
        let (vars, funcs) = first_lines(&script);
        assert!(!vars.contains_key("a"));
        assert_eq!(vars["b"], 4);
        assert_eq!(funcs["f"], 5);
    }

    #[test]
    fn test_first_lines_include_prefixed_assignments() {
        let script = Parser::new("CFLAGS=-O2 make
CFLAGS=-O3
").parse().unwrap();
        let (vars, _) = first_lines(&script);
        assert_eq!(vars["CFLAGS"], 1);
    }

    #[test]
    fn test_negation_and_grouping_in_conditions() {
        let vars = run(concat!(
            "if [[ ! ! -n x ]]; then a=yes; fi\n",
            "if [[ ! ( a == b ) && ( -z '' ) ]]; then b=yes; fi\n",
            "[ ! -n '' ] && c=yes\n",
        ));
        assert_eq!(str_var(&vars, "a"), "yes");
        assert_eq!(str_var(&vars, "b"), "yes");
        assert_eq!(str_var(&vars, "c"), "yes");
    }
}
