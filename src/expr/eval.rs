//! Expression evaluator and the scope-chain lookup order (§4.1):
//! local task parameters → enclosing compound task's parameters
//! (`this.*`) → package variables → imported package variables
//! (qualified by package name) → environment (`env.NAME`) → builtins.

use std::collections::BTreeMap;

use crate::error::FlowError;
use crate::value::Value;

use super::ast::{BinOp, Expr, UnOp};
use super::builtins;

/// A single frame of name → value bindings. `Scope` chains several of
/// these together in lookup-order rather than nesting lexical blocks,
/// since the grammar has no local `let`.
#[derive(Debug, Default, Clone)]
pub struct Scope {
    /// Local task parameters, highest priority.
    pub locals: BTreeMap<String, Value>,
    /// `this.*` — the enclosing compound task's parameters, if any.
    pub this: Option<BTreeMap<String, Value>>,
    /// Package-level variables for the package the task belongs to.
    pub package_vars: BTreeMap<String, Value>,
    /// Imported packages' variables, keyed by the import qualifier used
    /// to reach them (e.g. `std` for `std.something`).
    pub imports: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locals(mut self, locals: BTreeMap<String, Value>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_this(mut self, this: BTreeMap<String, Value>) -> Self {
        self.this = Some(this);
        self
    }

    pub fn with_package_vars(mut self, vars: BTreeMap<String, Value>) -> Self {
        self.package_vars = vars;
        self
    }

    pub fn with_import(mut self, qualifier: impl Into<String>, vars: BTreeMap<String, Value>) -> Self {
        self.imports.insert(qualifier.into(), vars);
        self
    }

    fn lookup_ident(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        if name == "this" {
            return self.this.clone().map(Value::Map);
        }
        if let Some(v) = self.package_vars.get(name) {
            return Some(v.clone());
        }
        if let Some(vars) = self.imports.get(name) {
            return Some(Value::Map(vars.clone()));
        }
        if name == "env" {
            let map = std::env::vars().map(|(k, v)| (k, Value::from(v))).collect();
            return Some(Value::Map(map));
        }
        None
    }
}

/// Evaluate `expr` against `scope`, producing a `Value`.
///
/// `source` is the original expression text, carried through only for
/// error messages — the evaluator never re-parses it.
pub fn eval(expr: &Expr, scope: &Scope, source: &str) -> Result<Value, FlowError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::Str(s.as_str().into())),

        Expr::Ident(name) => scope.lookup_ident(name).ok_or_else(|| FlowError::ExprUnknownIdentifier {
            name: name.clone(),
            source: source.to_string(),
        }),

        Expr::Path(base, field) => {
            let base_val = eval(base, scope, source)?;
            match &base_val {
                Value::Map(m) => m.get(field).cloned().ok_or_else(|| FlowError::ExprUnknownIdentifier {
                    name: field.clone(),
                    source: source.to_string(),
                }),
                other => Err(FlowError::ExprInvalidTraversal {
                    source: source.to_string(),
                    type_name: other.type_name().to_string(),
                }),
            }
        }

        Expr::Index(base, idx) => {
            let base_val = eval(base, scope, source)?;
            let idx_val = eval(idx, scope, source)?;
            index_value(&base_val, &idx_val, source)
        }

        Expr::Slice(base, lo, hi) => {
            let base_val = eval(base, scope, source)?;
            let list = base_val.as_list().ok_or_else(|| FlowError::ExprInvalidTraversal {
                source: source.to_string(),
                type_name: base_val.type_name().to_string(),
            })?;
            let len = list.len() as i64;
            let lo = match lo {
                Some(e) => resolve_index(eval(e, scope, source)?.as_int(), len, source)?,
                None => 0,
            };
            let hi = match hi {
                Some(e) => resolve_index(eval(e, scope, source)?.as_int(), len, source)?,
                None => len,
            };
            let (lo, hi) = (lo.clamp(0, len) as usize, hi.clamp(0, len) as usize);
            if lo >= hi {
                Ok(Value::List(Vec::new()))
            } else {
                Ok(Value::List(list[lo..hi].to_vec()))
            }
        }

        Expr::Unary(op, e) => {
            let v = eval(e, scope, source)?;
            match op {
                UnOp::Not => Ok(Value::Bool(!v.is_truthy())),
                UnOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(FlowError::ExprTypeMismatch {
                        source: source.to_string(),
                        expected: "int or float".to_string(),
                        actual: other.type_name().to_string(),
                    }),
                },
            }
        }

        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, scope, source),

        Expr::Conditional { then, cond, els } => {
            if eval(cond, scope, source)?.is_truthy() {
                eval(then, scope, source)
            } else {
                eval(els, scope, source)
            }
        }

        Expr::Default(e, dflt) => match eval(e, scope, source) {
            Ok(Value::Null) | Err(_) => eval(dflt, scope, source),
            Ok(v) => Ok(v),
        },

        Expr::Pipe(base, stages) => {
            let mut v = eval(base, scope, source)?;
            for stage in stages {
                let args = stage
                    .args
                    .iter()
                    .map(|a| eval(a, scope, source))
                    .collect::<Result<Vec<_>, _>>()?;
                v = builtins::call(&stage.name, &v, &args, source)?;
            }
            Ok(v)
        }

        Expr::Call(name, args) => {
            let vals = args.iter().map(|a| eval(a, scope, source)).collect::<Result<Vec<_>, _>>()?;
            builtins::call_free(name, &vals, source)
        }
    }
}

fn resolve_index(idx: Option<i64>, len: i64, source: &str) -> Result<i64, FlowError> {
    let idx = idx.ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "int".to_string(),
        actual: "non-int".to_string(),
    })?;
    Ok(if idx < 0 { (len + idx).max(0) } else { idx })
}

fn index_value(base: &Value, idx: &Value, source: &str) -> Result<Value, FlowError> {
    match base {
        Value::List(items) => {
            let i = idx.as_int().ok_or_else(|| FlowError::ExprTypeMismatch {
                source: source.to_string(),
                expected: "int".to_string(),
                actual: idx.type_name().to_string(),
            })?;
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            items.get(i as usize).cloned().ok_or_else(|| FlowError::ExprInvalidTraversal {
                source: source.to_string(),
                type_name: "list (index out of bounds)".to_string(),
            })
        }
        Value::Map(m) => {
            let key = idx.as_str().ok_or_else(|| FlowError::ExprTypeMismatch {
                source: source.to_string(),
                expected: "str".to_string(),
                actual: idx.type_name().to_string(),
            })?;
            m.get(key).cloned().ok_or_else(|| FlowError::ExprUnknownIdentifier {
                name: key.to_string(),
                source: source.to_string(),
            })
        }
        other => Err(FlowError::ExprInvalidTraversal {
            source: source.to_string(),
            type_name: other.type_name().to_string(),
        }),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, scope: &Scope, source: &str) -> Result<Value, FlowError> {
    if matches!(op, BinOp::And) {
        let l = eval(lhs, scope, source)?;
        return if !l.is_truthy() { Ok(l) } else { eval(rhs, scope, source) };
    }
    if matches!(op, BinOp::Or) {
        let l = eval(lhs, scope, source)?;
        return if l.is_truthy() { Ok(l) } else { eval(rhs, scope, source) };
    }

    let l = eval(lhs, scope, source)?;
    let r = eval(rhs, scope, source)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &l, &r, source),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arithmetic(op, &l, &r, source),
        BinOp::And | BinOp::Or => unreachable!("handled above with short-circuit"),
    }
}

fn compare(op: BinOp, l: &Value, r: &Value, source: &str) -> Result<Value, FlowError> {
    let ordering = match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => {
            return Err(FlowError::ExprTypeMismatch {
                source: source.to_string(),
                expected: "comparable numeric or string operands".to_string(),
                actual: format!("{} vs {}", l.type_name(), r.type_name()),
            })
        }
    };
    let ordering = ordering.ok_or_else(|| FlowError::ExprTypeMismatch {
        source: source.to_string(),
        expected: "orderable values".to_string(),
        actual: "NaN".to_string(),
    })?;
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: BinOp, l: &Value, r: &Value, source: &str) -> Result<Value, FlowError> {
    if op == BinOp::Add {
        if let (Value::Str(a), Value::Str(b)) = (l, r) {
            return Ok(Value::Str(format!("{a}{b}").into()));
        }
        if let (Value::List(a), Value::List(b)) = (l, r) {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::List(out));
        }
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => int_arith(op, *a, *b, source),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let (a, b) = (as_f64(l, source)?, as_f64(r, source)?);
            float_arith(op, a, b)
        }
        _ => Err(FlowError::ExprTypeMismatch {
            source: source.to_string(),
            expected: "numeric operands".to_string(),
            actual: format!("{} and {}", l.type_name(), r.type_name()),
        }),
    }
}

fn as_f64(v: &Value, source: &str) -> Result<f64, FlowError> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(FlowError::ExprTypeMismatch {
            source: source.to_string(),
            expected: "numeric operand".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

fn int_arith(op: BinOp, a: i64, b: i64, source: &str) -> Result<Value, FlowError> {
    Ok(Value::Int(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0 {
                return Err(FlowError::ExprTypeMismatch {
                    source: source.to_string(),
                    expected: "non-zero divisor".to_string(),
                    actual: "0".to_string(),
                });
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(FlowError::ExprTypeMismatch {
                    source: source.to_string(),
                    expected: "non-zero divisor".to_string(),
                    actual: "0".to_string(),
                });
            }
            a % b
        }
        _ => unreachable!(),
    }))
}

fn float_arith(op: BinOp, a: f64, b: f64) -> Result<Value, FlowError> {
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a % b,
        _ => unreachable!(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse;

    fn eval_src(src: &str, scope: &Scope) -> Value {
        eval(&parse(src).unwrap(), scope, src).unwrap()
    }

    #[test]
    fn resolves_local_before_package_vars() {
        let scope = Scope::new()
            .with_locals(BTreeMap::from([("x".to_string(), Value::Int(1))]))
            .with_package_vars(BTreeMap::from([("x".to_string(), Value::Int(2))]));
        assert_eq!(eval_src("x", &scope), Value::Int(1));
    }

    #[test]
    fn falls_back_to_package_vars_when_not_local() {
        let scope = Scope::new().with_package_vars(BTreeMap::from([("y".to_string(), Value::Int(9))]));
        assert_eq!(eval_src("y", &scope), Value::Int(9));
    }

    #[test]
    fn this_dot_field_resolves_enclosing_params() {
        let scope = Scope::new().with_this(BTreeMap::from([("name".to_string(), Value::from("top"))]));
        assert_eq!(eval_src("this.name", &scope), Value::from("top"));
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let scope = Scope::new();
        assert!(matches!(
            eval(&parse("nope").unwrap(), &scope, "nope"),
            Err(FlowError::ExprUnknownIdentifier { .. })
        ));
    }

    #[test]
    fn arithmetic_and_comparison_evaluate() {
        let scope = Scope::new();
        assert_eq!(eval_src("1 + 2 * 3", &scope), Value::Int(7));
        assert_eq!(eval_src("1 < 2", &scope), Value::Bool(true));
    }

    #[test]
    fn default_operator_falls_back_on_missing_identifier() {
        let scope = Scope::new();
        assert_eq!(eval_src("missing :- 42", &scope), Value::Int(42));
    }

    #[test]
    fn conditional_picks_correct_branch() {
        let scope = Scope::new();
        assert_eq!(eval_src("1 if 1 < 2 else 2", &scope), Value::Int(1));
    }

    #[test]
    fn slice_and_index_work_on_lists() {
        let scope = Scope::new().with_locals(BTreeMap::from([(
            "xs".to_string(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]));
        assert_eq!(eval_src("xs[1:]", &scope), Value::List(vec![Value::Int(2), Value::Int(3)]));
        assert_eq!(eval_src("xs[-1]", &scope), Value::Int(3));
    }
}
