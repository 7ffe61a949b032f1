// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scalar expressions evaluated within physical plan operators.
//!
//! Expressions are a closed set of variants. Every variant has an exhaustive
//! canonical form (see [`ScalarExpr::canonicalize`]) so that two expressions
//! that differ only in the order of operands to commutative functions compare
//! equal, and a total evaluation function (see [`ScalarExpr::eval`]) which the
//! plan interpreter uses to check that cross-dataflow merging never changes a
//! result.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single value.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Datum {
    /// The SQL `NULL`.
    Null,
    /// Boolean false.
    False,
    /// Boolean true.
    True,
    /// A 64-bit signed integer.
    Int64(i64),
    /// A string.
    String(String),
}

impl Datum {
    fn from_bool(b: bool) -> Datum {
        if b {
            Datum::True
        } else {
            Datum::False
        }
    }

    /// Reports whether this datum is `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl From<i64> for Datum {
    fn from(i: i64) -> Datum {
        Datum::Int64(i)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Datum {
        Datum::String(s.to_string())
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Datum {
        Datum::from_bool(b)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("null"),
            Datum::False => f.write_str("false"),
            Datum::True => f.write_str("true"),
            Datum::Int64(i) => write!(f, "{}", i),
            Datum::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A row of datums.
pub type Row = Vec<Datum>;

/// Functions of one argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum UnaryFunc {
    Not,
    IsNull,
    Neg,
}

/// Functions of two arguments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum BinaryFunc {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryFunc {
    /// Reports whether `f(a, b) = f(b, a)` for all `a` and `b`.
    pub fn is_commutative(&self) -> bool {
        match self {
            BinaryFunc::Eq | BinaryFunc::NotEq | BinaryFunc::Add | BinaryFunc::Mul => true,
            BinaryFunc::Lt
            | BinaryFunc::Lte
            | BinaryFunc::Gt
            | BinaryFunc::Gte
            | BinaryFunc::Sub
            | BinaryFunc::Div
            | BinaryFunc::Mod => false,
        }
    }
}

/// Functions of any number of arguments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum VariadicFunc {
    And,
    Or,
    Coalesce,
}

impl VariadicFunc {
    /// Reports whether the function is insensitive to argument order and
    /// duplicate arguments, and may absorb nested calls to itself.
    pub fn is_associative_idempotent(&self) -> bool {
        match self {
            VariadicFunc::And | VariadicFunc::Or => true,
            VariadicFunc::Coalesce => false,
        }
    }
}

/// Functions whose result cannot be determined from their arguments.
///
/// Two calls to an unmaterializable function are never assumed to produce the
/// same value, so nothing that contains one is shared across dataflows.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum UnmaterializableFunc {
    CurrentTimestamp,
    Random,
}

/// A scalar expression over the columns of a row.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ScalarExpr {
    /// The value of the column at this position.
    Column(usize),
    /// A constant.
    Literal(Datum),
    /// A call to a function without deterministic output.
    CallUnmaterializable(UnmaterializableFunc),
    CallUnary {
        func: UnaryFunc,
        expr: Box<ScalarExpr>,
    },
    CallBinary {
        func: BinaryFunc,
        expr1: Box<ScalarExpr>,
        expr2: Box<ScalarExpr>,
    },
    CallVariadic {
        func: VariadicFunc,
        exprs: Vec<ScalarExpr>,
    },
}

/// Ambient state for evaluating unmaterializable functions.
#[derive(Debug)]
pub struct EvalContext {
    /// The value of `CurrentTimestamp`.
    pub now: i64,
    random_state: Cell<u64>,
}

impl EvalContext {
    /// Creates a context that reports `now` and seeds `Random` with `seed`.
    pub fn new(now: i64, seed: u64) -> Self {
        EvalContext {
            now,
            // xorshift requires a non-zero state.
            random_state: Cell::new(seed | 1),
        }
    }

    fn next_random(&self) -> i64 {
        let mut x = self.random_state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random_state.set(x);
        i64::from_ne_bytes(x.to_ne_bytes())
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        EvalContext::new(0, 0x2545_f491_4f6c_dd1d)
    }
}

impl ScalarExpr {
    /// A reference to the column at `column`.
    pub fn column(column: usize) -> Self {
        ScalarExpr::Column(column)
    }

    /// A constant.
    pub fn literal(datum: impl Into<Datum>) -> Self {
        ScalarExpr::Literal(datum.into())
    }

    /// Applies `func` to `self`.
    pub fn call_unary(self, func: UnaryFunc) -> Self {
        ScalarExpr::CallUnary {
            func,
            expr: Box::new(self),
        }
    }

    /// Applies `func` to `self` and `other`, in that order.
    pub fn call_binary(self, other: Self, func: BinaryFunc) -> Self {
        ScalarExpr::CallBinary {
            func,
            expr1: Box::new(self),
            expr2: Box::new(other),
        }
    }

    /// Shorthand for `self = other`.
    pub fn call_eq(self, other: Self) -> Self {
        self.call_binary(other, BinaryFunc::Eq)
    }

    /// The conjunction of `exprs`.
    pub fn and(exprs: Vec<ScalarExpr>) -> Self {
        ScalarExpr::CallVariadic {
            func: VariadicFunc::And,
            exprs,
        }
    }

    /// The disjunction of `exprs`.
    pub fn or(exprs: Vec<ScalarExpr>) -> Self {
        ScalarExpr::CallVariadic {
            func: VariadicFunc::Or,
            exprs,
        }
    }

    /// Calls `f` on each direct child.
    pub fn visit_children<'a, F: FnMut(&'a ScalarExpr)>(&'a self, mut f: F) {
        match self {
            ScalarExpr::Column(_)
            | ScalarExpr::Literal(_)
            | ScalarExpr::CallUnmaterializable(_) => {}
            ScalarExpr::CallUnary { expr, .. } => f(expr),
            ScalarExpr::CallBinary { expr1, expr2, .. } => {
                f(expr1);
                f(expr2);
            }
            ScalarExpr::CallVariadic { exprs, .. } => exprs.iter().for_each(f),
        }
    }

    /// Reports whether the expression evaluates to the same value whenever it
    /// is given the same row.
    pub fn is_deterministic(&self) -> bool {
        if let ScalarExpr::CallUnmaterializable(_) = self {
            return false;
        }
        let mut deterministic = true;
        self.visit_children(|e| deterministic &= e.is_deterministic());
        deterministic
    }

    /// Adds every column referenced by the expression to `columns`.
    pub fn support_into(&self, columns: &mut BTreeSet<usize>) {
        if let ScalarExpr::Column(c) = self {
            columns.insert(*c);
        }
        self.visit_children(|e| e.support_into(columns));
    }

    /// Rewrites the expression into its canonical form.
    ///
    /// The canonical form is a function of the expression's meaning only as
    /// far as the following rules see:
    ///  * operands of commutative binary functions are sorted,
    ///  * `a > b` becomes `b < a` and `a >= b` becomes `b <= a`,
    ///  * nested `AND`s (and `OR`s) are flattened, and their arguments
    ///    are sorted and deduplicated.
    ///
    /// None of the rules change the value the expression produces for any row.
    pub fn canonicalize(&mut self) {
        match self {
            ScalarExpr::Column(_)
            | ScalarExpr::Literal(_)
            | ScalarExpr::CallUnmaterializable(_) => {}
            ScalarExpr::CallUnary { expr, .. } => expr.canonicalize(),
            ScalarExpr::CallBinary { func, expr1, expr2 } => {
                expr1.canonicalize();
                expr2.canonicalize();
                let flipped = match func {
                    BinaryFunc::Gt => Some(BinaryFunc::Lt),
                    BinaryFunc::Gte => Some(BinaryFunc::Lte),
                    _ => None,
                };
                if let Some(flipped) = flipped {
                    *func = flipped;
                    std::mem::swap(expr1, expr2);
                } else if func.is_commutative() && expr1 > expr2 {
                    std::mem::swap(expr1, expr2);
                }
            }
            ScalarExpr::CallVariadic { func, exprs } => {
                for expr in exprs.iter_mut() {
                    expr.canonicalize();
                }
                if func.is_associative_idempotent() {
                    let func = *func;
                    let mut flattened = Vec::with_capacity(exprs.len());
                    for expr in exprs.drain(..) {
                        match expr {
                            ScalarExpr::CallVariadic {
                                func: inner,
                                exprs: nested,
                            } if inner == func => flattened.extend(nested),
                            other => flattened.push(other),
                        }
                    }
                    flattened.sort();
                    // Two calls to `random()` are not the same call.
                    if flattened.iter().all(|e| e.is_deterministic()) {
                        flattened.dedup();
                    }
                    *exprs = flattened;
                }
            }
        }
    }

    /// Evaluates the expression against `row`.
    ///
    /// Evaluation is total: type mismatches, out-of-range columns, and
    /// arithmetic overflow all produce `Datum::Null`.
    pub fn eval(&self, row: &[Datum], ctx: &EvalContext) -> Datum {
        match self {
            ScalarExpr::Column(c) => row.get(*c).cloned().unwrap_or(Datum::Null),
            ScalarExpr::Literal(d) => d.clone(),
            ScalarExpr::CallUnmaterializable(func) => match func {
                UnmaterializableFunc::CurrentTimestamp => Datum::Int64(ctx.now),
                UnmaterializableFunc::Random => Datum::Int64(ctx.next_random()),
            },
            ScalarExpr::CallUnary { func, expr } => eval_unary(*func, expr.eval(row, ctx)),
            ScalarExpr::CallBinary { func, expr1, expr2 } => {
                eval_binary(*func, expr1.eval(row, ctx), expr2.eval(row, ctx))
            }
            ScalarExpr::CallVariadic { func, exprs } => match func {
                VariadicFunc::And => {
                    let mut result = Datum::True;
                    for expr in exprs {
                        match expr.eval(row, ctx) {
                            Datum::False => return Datum::False,
                            Datum::True => {}
                            _ => result = Datum::Null,
                        }
                    }
                    result
                }
                VariadicFunc::Or => {
                    let mut result = Datum::False;
                    for expr in exprs {
                        match expr.eval(row, ctx) {
                            Datum::True => return Datum::True,
                            Datum::False => {}
                            _ => result = Datum::Null,
                        }
                    }
                    result
                }
                VariadicFunc::Coalesce => exprs
                    .iter()
                    .map(|e| e.eval(row, ctx))
                    .find(|d| !d.is_null())
                    .unwrap_or(Datum::Null),
            },
        }
    }
}

fn eval_unary(func: UnaryFunc, d: Datum) -> Datum {
    match (func, d) {
        (UnaryFunc::IsNull, d) => Datum::from_bool(d.is_null()),
        (UnaryFunc::Not, Datum::True) => Datum::False,
        (UnaryFunc::Not, Datum::False) => Datum::True,
        (UnaryFunc::Neg, Datum::Int64(i)) => i.checked_neg().map_or(Datum::Null, Datum::Int64),
        _ => Datum::Null,
    }
}

fn eval_binary(func: BinaryFunc, a: Datum, b: Datum) -> Datum {
    if a.is_null() || b.is_null() {
        return Datum::Null;
    }
    match func {
        BinaryFunc::Eq => Datum::from_bool(a == b),
        BinaryFunc::NotEq => Datum::from_bool(a != b),
        BinaryFunc::Lt | BinaryFunc::Lte | BinaryFunc::Gt | BinaryFunc::Gte => {
            if std::mem::discriminant(&a) != std::mem::discriminant(&b) {
                return Datum::Null;
            }
            Datum::from_bool(match func {
                BinaryFunc::Lt => a < b,
                BinaryFunc::Lte => a <= b,
                BinaryFunc::Gt => a > b,
                _ => a >= b,
            })
        }
        BinaryFunc::Add | BinaryFunc::Sub | BinaryFunc::Mul | BinaryFunc::Div | BinaryFunc::Mod => {
            let (Datum::Int64(a), Datum::Int64(b)) = (a, b) else {
                return Datum::Null;
            };
            let result = match func {
                BinaryFunc::Add => a.checked_add(b),
                BinaryFunc::Sub => a.checked_sub(b),
                BinaryFunc::Mul => a.checked_mul(b),
                BinaryFunc::Div => a.checked_div(b),
                _ => a.checked_rem(b),
            };
            result.map_or(Datum::Null, Datum::Int64)
        }
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarExpr::Column(c) => write!(f, "#{}", c),
            ScalarExpr::Literal(d) => write!(f, "{}", d),
            ScalarExpr::CallUnmaterializable(func) => write!(f, "{:?}()", func),
            ScalarExpr::CallUnary { func, expr } => write!(f, "{:?}({})", func, expr),
            ScalarExpr::CallBinary { func, expr1, expr2 } => {
                let op = match func {
                    BinaryFunc::Eq => "=",
                    BinaryFunc::NotEq => "!=",
                    BinaryFunc::Lt => "<",
                    BinaryFunc::Lte => "<=",
                    BinaryFunc::Gt => ">",
                    BinaryFunc::Gte => ">=",
                    BinaryFunc::Add => "+",
                    BinaryFunc::Sub => "-",
                    BinaryFunc::Mul => "*",
                    BinaryFunc::Div => "/",
                    BinaryFunc::Mod => "%",
                };
                write!(f, "({} {} {})", expr1, op, expr2)
            }
            ScalarExpr::CallVariadic { func, exprs } => {
                write!(f, "{:?}(", func)?;
                for (i, e) in exprs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str(")")
            }
        }
    }
}
