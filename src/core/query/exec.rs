use super::parser::*;
use crate::core::errors::*;
use crate::core::index::compare_values;
use crate::core::options::WriteOptions;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Execution counters reported by a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub writes_executed: u64,
    pub writes_ignored: u64,
    pub scanned_full: u64,
    pub filtered: u64,
}

/// Result of one document write issued by a query.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Document access a query runs against. Implemented by the transaction so
/// query reads and writes go through the same path as handle operations.
pub trait DocumentSource {
    fn scan(&mut self, collection: &str) -> Result<Vec<Value>>;
    fn insert(&mut self, collection: &str, doc: &Value, options: &WriteOptions) -> Result<WriteResult>;
    fn update(&mut self, collection: &str, selector: &Value, patch: &Value, options: &WriteOptions) -> Result<WriteResult>;
    fn replace(&mut self, collection: &str, selector: &Value, doc: &Value, options: &WriteOptions) -> Result<WriteResult>;
    fn remove(&mut self, collection: &str, selector: &Value, options: &WriteOptions) -> Result<WriteResult>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopSource {
    Collection(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    For { var: String, source: LoopSource },
    Filter(Expr),
    Let { var: String, expr: Expr },
    Limit { offset: u64, count: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Return { distinct: bool, expr: Expr },
    Modify {
        kind: ModifyKind,
        target: Expr,
        with: Option<Expr>,
        collection: String,
        ignore_errors: bool,
        options: WriteOptions,
        returning: Option<Expr>,
    },
}

/// A parsed query with every bind parameter substituted and every
/// collection resolved to a name.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub output: Output,
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
}

impl Plan {
    pub fn bind(query: Query, bind_vars: &Value) -> Result<Plan> {
        let empty = Map::new();
        let vars = match bind_vars {
            Value::Null => &empty,
            Value::Object(vars) => vars,
            _ => return Err(Error::bad_parameter("bind parameters must be an object")),
        };

        let mut binder = Binder {
            vars,
            used: BTreeSet::new(),
        };
        let mut reads = BTreeSet::new();
        let mut writes = BTreeSet::new();

        for collection in query.with {
            reads.insert(binder.collection(collection)?);
        }

        let mut steps = Vec::with_capacity(query.clauses.len());
        for clause in query.clauses {
            let step = match clause {
                Clause::For { var, source } => {
                    let source = match source {
                        Source::Collection(c) => {
                            let name = binder.collection(c)?;
                            reads.insert(name.clone());
                            LoopSource::Collection(name)
                        }
                        Source::Expr(e) => LoopSource::Expr(binder.expr(e)?),
                    };
                    Step::For { var, source }
                }
                Clause::Filter(e) => Step::Filter(binder.expr(e)?),
                Clause::Let { var, expr } => Step::Let {
                    var,
                    expr: binder.expr(expr)?,
                },
                Clause::Limit { offset, count } => Step::Limit {
                    offset: limit_value(&binder.expr(offset)?)?,
                    count: limit_value(&binder.expr(count)?)?,
                },
            };
            steps.push(step);
        }

        let output = match query.terminal {
            Terminal::Return { distinct, expr } => Output::Return {
                distinct,
                expr: binder.expr(expr)?,
            },
            Terminal::Modify(m) => {
                let collection = binder.collection(m.collection)?;
                writes.insert(collection.clone());
                let (ignore_errors, options) = match m.options {
                    Some(options) => modify_options(&eval(&binder.expr(options)?, &HashMap::new())?)?,
                    None => (false, WriteOptions::default()),
                };
                Output::Modify {
                    kind: m.kind,
                    target: binder.expr(m.target)?,
                    with: m.with.map(|w| binder.expr(w)).transpose()?,
                    collection,
                    ignore_errors,
                    options,
                    returning: m.returning.map(|r| binder.expr(r)).transpose()?,
                }
            }
        };

        if let Some(unused) = vars.keys().find(|name| !binder.used.contains(*name)) {
            return Err(Error::QueryBindParameterUndeclared { name: unused.clone() });
        }

        Ok(Plan {
            steps,
            output,
            reads,
            writes,
        })
    }

    /// Collections the query reads, excluding write targets.
    pub fn reads(&self) -> impl Iterator<Item = &String> {
        self.reads.iter().filter(|name| !self.writes.contains(*name))
    }

    pub fn writes(&self) -> impl Iterator<Item = &String> {
        self.writes.iter()
    }

    pub fn is_modification(&self) -> bool {
        matches!(self.output, Output::Modify { .. })
    }
}

struct Binder<'a> {
    vars: &'a Map<String, Value>,
    used: BTreeSet<String>,
}

impl<'a> Binder<'a> {
    fn lookup(&mut self, key: &str, name: &str) -> Result<&'a Value> {
        let value = self
            .vars
            .get(key)
            .ok_or_else(|| Error::QueryBindParameterMissing { name: name.to_string() })?;
        self.used.insert(key.to_string());
        Ok(value)
    }

    fn collection(&mut self, collection: CollectionRef) -> Result<String> {
        match collection {
            CollectionRef::Named(name) => Ok(name),
            CollectionRef::Bind(name) => {
                let key = format!("@{}", name);
                match self.lookup(&key, &key)? {
                    Value::String(s) if !s.is_empty() => Ok(s.clone()),
                    _ => Err(Error::QueryBindParameterType { name: key }),
                }
            }
        }
    }

    fn expr(&mut self, expr: Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::BindVar(name) => Expr::Literal(self.lookup(&name, &name)?.clone()),
            Expr::Array(items) => Expr::Array(items.into_iter().map(|e| self.expr(e)).collect::<Result<_>>()?),
            Expr::Object(fields) => Expr::Object(
                fields
                    .into_iter()
                    .map(|(k, e)| Ok((k, self.expr(e)?)))
                    .collect::<Result<_>>()?,
            ),
            Expr::Attribute(base, name) => Expr::Attribute(Box::new(self.expr(*base)?), name),
            Expr::Index(base, index) => Expr::Index(Box::new(self.expr(*base)?), Box::new(self.expr(*index)?)),
            Expr::Unary(op, operand) => Expr::Unary(op, Box::new(self.expr(*operand)?)),
            Expr::Binary(op, left, right) => {
                Expr::Binary(op, Box::new(self.expr(*left)?), Box::new(self.expr(*right)?))
            }
            other => other,
        })
    }
}

fn limit_value(expr: &Expr) -> Result<u64> {
    match expr {
        Expr::Literal(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::parse(format!("LIMIT value must be a non-negative integer, got {}", n))),
        other => Err(Error::parse(format!("LIMIT value must be a non-negative integer, got {:?}", other))),
    }
}

fn modify_options(options: &Value) -> Result<(bool, WriteOptions)> {
    let obj = options
        .as_object()
        .ok_or_else(|| Error::bad_parameter("OPTIONS must be an object"))?;

    let flag = |name: &str, default: bool| -> Result<bool> {
        match obj.get(name) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(Error::bad_parameter(format!("option '{}' must be a boolean", name))),
        }
    };

    let defaults = WriteOptions::default();
    let options = WriteOptions {
        if_match: None,
        ignore_revs: flag("ignoreRevs", defaults.ignore_revs)?,
        is_restore: false,
        keep_null: flag("keepNull", defaults.keep_null)?,
        merge_objects: flag("mergeObjects", defaults.merge_objects)?,
    };
    Ok((flag("ignoreErrors", false)?, options))
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        Value::Array(items) if items.len() == 1 => to_number(&items[0]),
        Value::Array(_) | Value::Object(_) => 0.0,
    }
}

fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

pub(crate) fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Value> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Array(items) => Value::Array(items.iter().map(|e| eval(e, env)).collect::<Result<_>>()?),
        Expr::Object(fields) => {
            let mut obj = Map::with_capacity(fields.len());
            for (key, e) in fields {
                obj.insert(key.clone(), eval(e, env)?);
            }
            Value::Object(obj)
        }
        Expr::Variable(name) => env.get(name).cloned().unwrap_or(Value::Null),
        Expr::BindVar(name) => return Err(Error::QueryBindParameterMissing { name: name.clone() }),
        Expr::Attribute(base, name) => match eval(base, env)? {
            Value::Object(mut obj) => obj.remove(name).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        Expr::Index(base, index) => {
            let base = eval(base, env)?;
            match (base, eval(index, env)?) {
                (Value::Array(mut items), Value::Number(n)) => {
                    let len = items.len() as i64;
                    let i = n.as_f64().unwrap_or(0.0) as i64;
                    let i = if i < 0 { len + i } else { i };
                    if (0..len).contains(&i) {
                        items.swap_remove(i as usize)
                    } else {
                        Value::Null
                    }
                }
                (Value::Object(mut obj), Value::String(key)) => obj.remove(&key).unwrap_or(Value::Null),
                _ => Value::Null,
            }
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, env)?;
            match op {
                UnaryOp::Not => Value::Bool(!truthy(&value)),
                UnaryOp::Neg => number_value(-to_number(&value)),
                UnaryOp::Plus => number_value(to_number(&value)),
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            let left = eval(left, env)?;
            if truthy(&left) {
                eval(right, env)?
            } else {
                left
            }
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let left = eval(left, env)?;
            if truthy(&left) {
                left
            } else {
                eval(right, env)?
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, env)?;
            let right = eval(right, env)?;
            binary(*op, &left, &right)
        }
    })
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    let cmp = || compare_values(left, right);
    let contains = || {
        right
            .as_array()
            .map(|items| items.iter().any(|item| compare_values(left, item) == Ordering::Equal))
            .unwrap_or(false)
    };

    match op {
        BinaryOp::Eq => Value::Bool(cmp() == Ordering::Equal),
        BinaryOp::Neq => Value::Bool(cmp() != Ordering::Equal),
        BinaryOp::Lt => Value::Bool(cmp() == Ordering::Less),
        BinaryOp::Lte => Value::Bool(cmp() != Ordering::Greater),
        BinaryOp::Gt => Value::Bool(cmp() == Ordering::Greater),
        BinaryOp::Gte => Value::Bool(cmp() != Ordering::Less),
        BinaryOp::In => Value::Bool(contains()),
        BinaryOp::NotIn => Value::Bool(!contains()),
        BinaryOp::Add => number_value(to_number(left) + to_number(right)),
        BinaryOp::Sub => number_value(to_number(left) - to_number(right)),
        BinaryOp::Mul => number_value(to_number(left) * to_number(right)),
        BinaryOp::Div => {
            let divisor = to_number(right);
            if divisor == 0.0 {
                Value::Null
            } else {
                number_value(to_number(left) / divisor)
            }
        }
        BinaryOp::Mod => {
            let divisor = to_number(right);
            if divisor == 0.0 {
                Value::Null
            } else {
                number_value(to_number(left) % divisor)
            }
        }
        BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

struct LoopFrame {
    step: usize,
    var: String,
    items: Vec<Value>,
    pos: usize,
}

/// Runs a plan one output row at a time.
///
/// Loops are kept as an explicit stack of frames, so execution can stop
/// after any row and resume on the next call without materializing the
/// rest of the result.
pub struct Executor {
    plan: Arc<Plan>,
    env: HashMap<String, Value>,
    frames: Vec<LoopFrame>,
    pc: usize,
    limits: Vec<(u64, u64)>,
    seen: Vec<Value>,
    stats: QueryStats,
    done: bool,
}

impl Executor {
    pub fn new(plan: Plan) -> Self {
        let steps = plan.steps.len();
        Self {
            plan: Arc::new(plan),
            env: HashMap::new(),
            frames: Vec::new(),
            pc: 0,
            limits: vec![(0, 0); steps],
            seen: Vec::new(),
            stats: QueryStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn next_row(&mut self, source: &mut dyn DocumentSource) -> Result<Option<Value>> {
        let plan = Arc::clone(&self.plan);

        loop {
            if self.done {
                return Ok(None);
            }

            if self.pc == plan.steps.len() {
                let row = self.emit(&plan.output, source)?;
                self.backtrack();
                match row {
                    Some(row) => return Ok(Some(row)),
                    None => continue,
                }
            }

            match &plan.steps[self.pc] {
                Step::For { var, source: loop_source } => {
                    let items = match loop_source {
                        LoopSource::Collection(name) => {
                            let docs = source.scan(name)?;
                            self.stats.scanned_full += docs.len() as u64;
                            docs
                        }
                        LoopSource::Expr(expr) => match eval(expr, &self.env)? {
                            Value::Array(items) => items,
                            Value::Null => Vec::new(),
                            other => {
                                return Err(Error::bad_parameter(format!(
                                    "FOR {} expects an array, got {}",
                                    var, other
                                )));
                            }
                        },
                    };

                    match items.first() {
                        Some(first) => {
                            self.env.insert(var.clone(), first.clone());
                            self.frames.push(LoopFrame {
                                step: self.pc,
                                var: var.clone(),
                                items,
                                pos: 0,
                            });
                            self.pc += 1;
                        }
                        None => self.backtrack(),
                    }
                }
                Step::Filter(expr) => {
                    if truthy(&eval(expr, &self.env)?) {
                        self.pc += 1;
                    } else {
                        self.stats.filtered += 1;
                        self.backtrack();
                    }
                }
                Step::Let { var, expr } => {
                    let value = eval(expr, &self.env)?;
                    self.env.insert(var.clone(), value);
                    self.pc += 1;
                }
                Step::Limit { offset, count } => {
                    let (skipped, emitted) = &mut self.limits[self.pc];
                    if *skipped < *offset {
                        *skipped += 1;
                        self.backtrack();
                    } else if *emitted < *count {
                        *emitted += 1;
                        self.pc += 1;
                    } else {
                        // Steps before the terminal have no side effects, so
                        // nothing past an exhausted limit can produce output.
                        self.done = true;
                    }
                }
            }
        }
    }

    fn backtrack(&mut self) {
        while let Some(frame) = self.frames.last_mut() {
            frame.pos += 1;
            if let Some(item) = frame.items.get(frame.pos) {
                self.env.insert(frame.var.clone(), item.clone());
                self.pc = frame.step + 1;
                return;
            }
            self.frames.pop();
        }
        self.done = true;
    }

    fn emit(&mut self, output: &Output, source: &mut dyn DocumentSource) -> Result<Option<Value>> {
        match output {
            Output::Return { distinct, expr } => {
                let value = eval(expr, &self.env)?;
                if *distinct {
                    if self.seen.iter().any(|s| compare_values(s, &value) == Ordering::Equal) {
                        return Ok(None);
                    }
                    self.seen.push(value.clone());
                }
                Ok(Some(value))
            }
            Output::Modify {
                kind,
                target,
                with,
                collection,
                ignore_errors,
                options,
                returning,
            } => {
                let target = eval(target, &self.env)?;
                let with = with.as_ref().map(|w| eval(w, &self.env)).transpose()?;

                let result = match kind {
                    ModifyKind::Insert => source.insert(collection, &target, options),
                    ModifyKind::Update => {
                        source.update(collection, &target, with.as_ref().unwrap_or(&target), options)
                    }
                    ModifyKind::Replace => {
                        source.replace(collection, &target, with.as_ref().unwrap_or(&target), options)
                    }
                    ModifyKind::Remove => source.remove(collection, &target, options),
                };

                let written = match result {
                    Ok(written) => written,
                    Err(err) if *ignore_errors && ignorable(&err) => {
                        self.stats.writes_ignored += 1;
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                };
                self.stats.writes_executed += 1;

                let Some(returning) = returning else {
                    return Ok(None);
                };
                self.env.insert("NEW".to_string(), written.new.unwrap_or(Value::Null));
                self.env.insert("OLD".to_string(), written.old.unwrap_or(Value::Null));
                let value = eval(returning, &self.env);
                self.env.remove("NEW");
                self.env.remove("OLD");
                value.map(Some)
            }
        }
    }
}

fn ignorable(err: &Error) -> bool {
    matches!(
        err,
        Error::DocumentNotFound { .. }
            | Error::UniqueConstraintViolation { .. }
            | Error::DocumentKeyBad { .. }
            | Error::DocumentTypeInvalid { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::parser::parse_query;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MemorySource {
        collections: BTreeMap<String, BTreeMap<String, Value>>,
        scans: usize,
    }

    impl MemorySource {
        fn with_docs(name: &str, docs: Vec<Value>) -> Self {
            let mut source = MemorySource::default();
            let coll = source.collections.entry(name.to_string()).or_default();
            for doc in docs {
                let key = doc["_key"].as_str().unwrap().to_string();
                coll.insert(key, doc);
            }
            source
        }

        fn key_of(selector: &Value) -> String {
            match selector {
                Value::String(s) => s.clone(),
                other => other["_key"].as_str().unwrap_or_default().to_string(),
            }
        }
    }

    impl DocumentSource for MemorySource {
        fn scan(&mut self, collection: &str) -> Result<Vec<Value>> {
            self.scans += 1;
            Ok(self
                .collections
                .get(collection)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default())
        }

        fn insert(&mut self, collection: &str, doc: &Value, _: &WriteOptions) -> Result<WriteResult> {
            let key = Self::key_of(doc);
            let coll = self.collections.entry(collection.to_string()).or_default();
            if coll.contains_key(&key) {
                return Err(Error::UniqueConstraintViolation {
                    collection: collection.to_string(),
                    index: "primary".to_string(),
                    key,
                });
            }
            coll.insert(key, doc.clone());
            Ok(WriteResult { new: Some(doc.clone()), old: None })
        }

        fn update(&mut self, collection: &str, selector: &Value, patch: &Value, _: &WriteOptions) -> Result<WriteResult> {
            let key = Self::key_of(selector);
            let doc = self
                .collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(&key))
                .ok_or(Error::DocumentNotFound { collection: collection.to_string(), key })?;
            let old = doc.clone();
            for (k, v) in patch.as_object().unwrap() {
                doc[k] = v.clone();
            }
            Ok(WriteResult { new: Some(doc.clone()), old: Some(old) })
        }

        fn replace(&mut self, collection: &str, selector: &Value, new: &Value, options: &WriteOptions) -> Result<WriteResult> {
            self.update(collection, selector, new, options)
        }

        fn remove(&mut self, collection: &str, selector: &Value, _: &WriteOptions) -> Result<WriteResult> {
            let key = Self::key_of(selector);
            let old = self
                .collections
                .get_mut(collection)
                .and_then(|c| c.remove(&key))
                .ok_or(Error::DocumentNotFound { collection: collection.to_string(), key })?;
            Ok(WriteResult { new: None, old: Some(old) })
        }
    }

    fn plan(query: &str, bind_vars: Value) -> Result<Plan> {
        Plan::bind(parse_query(query)?, &bind_vars)
    }

    fn run(query: &str, bind_vars: Value, source: &mut MemorySource) -> (Vec<Value>, QueryStats) {
        let mut exec = Executor::new(plan(query, bind_vars).unwrap());
        let mut rows = Vec::new();
        while let Some(row) = exec.next_row(source).unwrap() {
            rows.push(row);
        }
        (rows, exec.stats().clone())
    }

    fn numbers() -> MemorySource {
        MemorySource::with_docs(
            "nums",
            (1..=10).map(|i| json!({"_key": format!("k{:02}", i), "n": i})).collect(),
        )
    }

    #[test]
    fn test_array_loop_without_collections() {
        let mut source = MemorySource::default();
        let (rows, stats) = run("FOR i IN [1, 2, 3] RETURN i", Value::Null, &mut source);
        assert_eq!(rows, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(stats, QueryStats::default());
        assert_eq!(source.scans, 0);
    }

    #[test]
    fn test_filter_let_limit() {
        let mut source = numbers();
        let (rows, stats) = run(
            "FOR d IN nums FILTER d.n % 2 == 0 LET sq = d.n * d.n LIMIT 1, 2 RETURN {n: d.n, sq: sq}",
            Value::Null,
            &mut source,
        );
        assert_eq!(rows, vec![json!({"n": 4, "sq": 16}), json!({"n": 6, "sq": 36})]);
        assert_eq!(stats.scanned_full, 10);
        assert_eq!(stats.filtered, 3);
    }

    #[test]
    fn test_nested_loops_and_distinct() {
        let mut source = MemorySource::default();
        let (rows, _) = run(
            "FOR a IN [1, 2] FOR b IN [1, 2] RETURN DISTINCT a + b",
            Value::Null,
            &mut source,
        );
        assert_eq!(rows, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_remove_all_with_bound_collection() {
        let mut source = numbers();
        let (rows, stats) = run(
            "FOR i IN @@cn1 REMOVE i._key IN @@cn1",
            json!({"@cn1": "nums"}),
            &mut source,
        );
        assert!(rows.is_empty());
        assert_eq!(stats.writes_executed, 10);
        assert!(source.collections["nums"].is_empty());
    }

    #[test]
    fn test_insert_returning_new() {
        let mut source = MemorySource::default();
        let (rows, stats) = run(
            "FOR i IN ['a', 'b'] INSERT {_key: i, v: 1} INTO c RETURN NEW._key",
            Value::Null,
            &mut source,
        );
        assert_eq!(rows, vec![json!("a"), json!("b")]);
        assert_eq!(stats.writes_executed, 2);
        assert_eq!(source.collections["c"].len(), 2);
    }

    #[test]
    fn test_ignore_errors_counts_ignored_writes() {
        let mut source = numbers();
        let (_, stats) = run(
            "FOR k IN ['k01', 'missing', 'k02'] REMOVE k IN nums OPTIONS { ignoreErrors: true }",
            Value::Null,
            &mut source,
        );
        assert_eq!(stats.writes_executed, 2);
        assert_eq!(stats.writes_ignored, 1);

        let mut exec = Executor::new(plan("REMOVE 'missing' IN nums", Value::Null).unwrap());
        assert!(exec.next_row(&mut source).unwrap_err().is_not_found());
    }

    #[test]
    fn test_exhausted_limit_stops_early() {
        let mut source = MemorySource::default();
        let (rows, _) = run(
            "FOR a IN [1, 2, 3] FOR b IN [1, 2, 3] LIMIT 2 RETURN [a, b]",
            Value::Null,
            &mut source,
        );
        assert_eq!(rows, vec![json!([1, 1]), json!([1, 2])]);
    }

    #[test]
    fn test_streaming_is_lazy() {
        let mut source = numbers();
        let mut exec = Executor::new(plan("FOR d IN nums UPDATE d WITH {seen: true} IN nums RETURN OLD.n", Value::Null).unwrap());
        assert_eq!(exec.next_row(&mut source).unwrap(), Some(json!(1)));
        assert_eq!(exec.stats().writes_executed, 1);
        assert_eq!(source.collections["nums"]["k02"].get("seen"), None);
        assert!(!exec.is_done());
    }

    #[test]
    fn test_bind_parameter_errors() {
        assert_eq!(plan("RETURN @x", json!({})).unwrap_err().code(), 1551);
        assert_eq!(plan("RETURN 1", json!({"x": 1})).unwrap_err().code(), 1552);
        assert_eq!(plan("FOR d IN @@c RETURN d", json!({"@c": 5})).unwrap_err().code(), 1553);
        assert_eq!(plan("RETURN 1", json!([1])).unwrap_err().code(), 10);
    }

    #[test]
    fn test_access_sets() {
        let plan = plan(
            "WITH audit FOR d IN src FOR e IN dst INSERT d INTO dst",
            Value::Null,
        )
        .unwrap();
        assert_eq!(plan.reads().cloned().collect::<Vec<_>>(), vec!["audit", "src"]);
        assert_eq!(plan.writes().cloned().collect::<Vec<_>>(), vec!["dst"]);
        assert!(plan.is_modification());
    }

    #[test]
    fn test_expression_semantics() {
        let env = HashMap::new();
        let value = |q: &str| {
            let query = parse_query(q).unwrap();
            match Plan::bind(query, &Value::Null).unwrap().output {
                Output::Return { expr, .. } => eval(&expr, &env).unwrap(),
                _ => unreachable!(),
            }
        };
        assert_eq!(value("RETURN 7 / 2"), json!(3.5));
        assert_eq!(value("RETURN 1 / 0"), Value::Null);
        assert_eq!(value("RETURN null || 'x'"), json!("x"));
        assert_eq!(value("RETURN 0 && 'x'"), json!(0));
        assert_eq!(value("RETURN 2 IN [1, 2]"), json!(true));
        assert_eq!(value("RETURN 3 NOT IN [1, 2]"), json!(true));
        assert_eq!(value("RETURN [1, 2, 3][-1]"), json!(3));
        assert_eq!(value("RETURN {a: {b: 1}}.a.b"), json!(1));
        assert_eq!(value("RETURN null < false"), json!(true));
        assert_eq!(value("RETURN -'5'"), json!(-5));
    }
}
