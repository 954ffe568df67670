//! Symbolic expressions over bound path variables.
//!
//! An expression is both a transport shape and an executable: it travels
//! inside plans and is evaluated by the dedicated interpreter below, never
//! by anything resembling a host-language eval. The operator table is
//! fixed; anything outside it is rejected at evaluation time by
//! construction of the enum.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PlasmaError, Result};
use crate::model::PropValue;
use crate::plan::OpId;
use crate::tuple::PathTuple;

/// The fixed operator table of the expression sub-language.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExprOp {
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Abs,
    Neg,
    Min,
    Max,
    // comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // logical
    And,
    Or,
    Not,
    // bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    // trigonometric
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
}

impl ExprOp {
    /// Number of arguments the operator takes.
    pub fn arity(&self) -> usize {
        match self {
            ExprOp::Abs
            | ExprOp::Neg
            | ExprOp::Not
            | ExprOp::Sin
            | ExprOp::Cos
            | ExprOp::Tan
            | ExprOp::Asin
            | ExprOp::Acos
            | ExprOp::Atan => 1,
            _ => 2,
        }
    }
}

/// Expression tree. `Prop` references appear in user input; the planner
/// lowers them to `Loaded` (a property-operator slot) and nested calls to
/// `Slot` (an expression-operator slot) before execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "kebab-case")]
pub enum Expr {
    /// A literal value.
    Literal(PropValue),
    /// A property of a bound path variable, pre-lowering.
    Prop {
        /// Path-variable symbol.
        pvar: String,
        /// Property name.
        prop: String,
    },
    /// A property loaded into a property-operator slot.
    Loaded {
        /// Property operator whose slot holds the value.
        op: OpId,
        /// Property name inside that slot.
        prop: String,
    },
    /// The computed value of an expression operator.
    Slot(OpId),
    /// Application of a fixed operator.
    Call {
        /// The operator applied.
        op: ExprOp,
        /// Its arguments.
        args: Vec<Expr>,
    },
}

impl Expr {
    /// A literal leaf.
    pub fn lit(value: impl Into<PropValue>) -> Self {
        Expr::Literal(value.into())
    }

    /// A pvar-property reference, e.g. `(score synth)`.
    pub fn prop(pvar: impl Into<String>, prop: impl Into<String>) -> Self {
        Expr::Prop {
            pvar: pvar.into(),
            prop: prop.into(),
        }
    }

    /// A call node.
    pub fn call(op: ExprOp, args: Vec<Expr>) -> Self {
        Expr::Call { op, args }
    }

    /// `(>= a b)`
    pub fn ge(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Ge, vec![a, b])
    }

    /// `(<= a b)`
    pub fn le(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Le, vec![a, b])
    }

    /// `(> a b)`
    pub fn gt(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Gt, vec![a, b])
    }

    /// `(< a b)`
    pub fn lt(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Lt, vec![a, b])
    }

    /// `(= a b)`
    pub fn eq(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Eq, vec![a, b])
    }

    /// `(not= a b)`
    pub fn ne(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Ne, vec![a, b])
    }

    /// `(and a b)`
    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::And, vec![a, b])
    }

    /// `(or a b)`
    pub fn or(a: Expr, b: Expr) -> Self {
        Expr::call(ExprOp::Or, vec![a, b])
    }

    /// `(not a)`
    pub fn not(a: Expr) -> Self {
        Expr::call(ExprOp::Not, vec![a])
    }
}

/// Evaluates an expression against a path tuple's bindings.
pub fn eval(expr: &Expr, pt: &PathTuple) -> Result<PropValue> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Prop { pvar, prop } => Err(PlasmaError::TypeMismatch(format!(
            "unlowered reference to ({prop} {pvar})"
        ))),
        Expr::Loaded { op, prop } => pt
            .props(op)
            .and_then(|map| map.get(prop))
            .cloned()
            .ok_or_else(|| {
                PlasmaError::TypeMismatch(format!("property '{prop}' not loaded at {op}"))
            }),
        Expr::Slot(op) => pt
            .value(op)
            .cloned()
            .ok_or_else(|| PlasmaError::TypeMismatch(format!("no computed value at {op}"))),
        Expr::Call { op, args } => {
            let mut vals = Vec::with_capacity(args.len());
            for arg in args {
                vals.push(eval(arg, pt)?);
            }
            apply(*op, &vals)
        }
    }
}

/// Evaluates an expression against a result record, used by the recursive
/// query driver where tuples have already been projected. `Prop` leaves
/// resolve through the record's field for the pvar.
pub fn eval_on_record(expr: &Expr, record: &BTreeMap<String, PropValue>) -> Result<PropValue> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Prop { pvar, prop } => match record.get(pvar) {
            Some(PropValue::Map(map)) => map.get(prop).cloned().ok_or_else(|| {
                PlasmaError::TypeMismatch(format!("record field '{pvar}' lacks '{prop}'"))
            }),
            Some(value) if prop == crate::model::ID_PROP => Ok(value.clone()),
            _ => Err(PlasmaError::TypeMismatch(format!(
                "record has no field '{pvar}'"
            ))),
        },
        Expr::Loaded { .. } | Expr::Slot(_) => Err(PlasmaError::TypeMismatch(
            "slot references cannot resolve against a record".into(),
        )),
        Expr::Call { op, args } => {
            let mut vals = Vec::with_capacity(args.len());
            for arg in args {
                vals.push(eval_on_record(arg, record)?);
            }
            apply(*op, &vals)
        }
    }
}

/// Boolean view of an evaluated predicate value.
pub fn truthy(value: &PropValue) -> Result<bool> {
    match value {
        PropValue::Bool(b) => Ok(*b),
        other => Err(PlasmaError::TypeMismatch(format!(
            "predicate evaluated to non-boolean {other:?}"
        ))),
    }
}

fn apply(op: ExprOp, args: &[PropValue]) -> Result<PropValue> {
    if args.len() != op.arity() {
        return Err(PlasmaError::TypeMismatch(format!(
            "{op:?} takes {} argument(s), got {}",
            op.arity(),
            args.len()
        )));
    }
    match op {
        ExprOp::Add => numeric(op, &args[0], &args[1], |a, b| a + b, |a, b| a + b),
        ExprOp::Sub => numeric(op, &args[0], &args[1], |a, b| a - b, |a, b| a - b),
        ExprOp::Mul => numeric(op, &args[0], &args[1], |a, b| a * b, |a, b| a * b),
        ExprOp::Mod => numeric(op, &args[0], &args[1], |a, b| a % b, |a, b| a % b),
        ExprOp::Min => numeric(op, &args[0], &args[1], i64::min, f64::min),
        ExprOp::Max => numeric(op, &args[0], &args[1], i64::max, f64::max),
        ExprOp::Div => {
            let (a, b) = floats(op, &args[0], &args[1])?;
            if b == 0.0 {
                return Err(PlasmaError::TypeMismatch("division by zero".into()));
            }
            Ok(PropValue::Float(a / b))
        }
        ExprOp::Pow => {
            let (a, b) = floats(op, &args[0], &args[1])?;
            Ok(PropValue::Float(a.powf(b)))
        }
        ExprOp::Abs => match &args[0] {
            PropValue::Int(v) => Ok(PropValue::Int(v.abs())),
            PropValue::Float(v) => Ok(PropValue::Float(v.abs())),
            other => Err(type_err(op, other)),
        },
        ExprOp::Neg => match &args[0] {
            PropValue::Int(v) => Ok(PropValue::Int(-v)),
            PropValue::Float(v) => Ok(PropValue::Float(-v)),
            other => Err(type_err(op, other)),
        },
        ExprOp::Eq => Ok(PropValue::Bool(prop_eq(&args[0], &args[1]))),
        ExprOp::Ne => Ok(PropValue::Bool(!prop_eq(&args[0], &args[1]))),
        ExprOp::Lt | ExprOp::Le | ExprOp::Gt | ExprOp::Ge => {
            let ord = args[0].partial_cmp_value(&args[1]).ok_or_else(|| {
                PlasmaError::TypeMismatch(format!(
                    "{op:?} cannot order {:?} against {:?}",
                    args[0], args[1]
                ))
            })?;
            let pass = match op {
                ExprOp::Lt => ord.is_lt(),
                ExprOp::Le => ord.is_le(),
                ExprOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(PropValue::Bool(pass))
        }
        ExprOp::And => Ok(PropValue::Bool(truthy(&args[0])? && truthy(&args[1])?)),
        ExprOp::Or => Ok(PropValue::Bool(truthy(&args[0])? || truthy(&args[1])?)),
        ExprOp::Not => Ok(PropValue::Bool(!truthy(&args[0])?)),
        ExprOp::BitAnd => bitwise(op, &args[0], &args[1], |a, b| a & b),
        ExprOp::BitOr => bitwise(op, &args[0], &args[1], |a, b| a | b),
        ExprOp::BitXor => bitwise(op, &args[0], &args[1], |a, b| a ^ b),
        ExprOp::Shl => bitwise(op, &args[0], &args[1], |a, b| a.wrapping_shl(b as u32)),
        ExprOp::Shr => bitwise(op, &args[0], &args[1], |a, b| a.wrapping_shr(b as u32)),
        ExprOp::Sin | ExprOp::Cos | ExprOp::Tan | ExprOp::Asin | ExprOp::Acos | ExprOp::Atan => {
            let v = args[0]
                .as_f64()
                .ok_or_else(|| type_err(op, &args[0]))?;
            let out = match op {
                ExprOp::Sin => v.sin(),
                ExprOp::Cos => v.cos(),
                ExprOp::Tan => v.tan(),
                ExprOp::Asin => v.asin(),
                ExprOp::Acos => v.acos(),
                _ => v.atan(),
            };
            Ok(PropValue::Float(out))
        }
    }
}

fn prop_eq(a: &PropValue, b: &PropValue) -> bool {
    if a == b {
        return true;
    }
    matches!(a.partial_cmp_value(b), Some(std::cmp::Ordering::Equal))
}

fn numeric(
    op: ExprOp,
    a: &PropValue,
    b: &PropValue,
    ints: fn(i64, i64) -> i64,
    flts: fn(f64, f64) -> f64,
) -> Result<PropValue> {
    match (a, b) {
        (PropValue::Int(x), PropValue::Int(y)) => Ok(PropValue::Int(ints(*x, *y))),
        _ => {
            let (x, y) = floats(op, a, b)?;
            Ok(PropValue::Float(flts(x, y)))
        }
    }
}

fn floats(op: ExprOp, a: &PropValue, b: &PropValue) -> Result<(f64, f64)> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(PlasmaError::TypeMismatch(format!(
            "{op:?} needs numeric arguments, got {a:?} and {b:?}"
        ))),
    }
}

fn bitwise(op: ExprOp, a: &PropValue, b: &PropValue, f: fn(i64, i64) -> i64) -> Result<PropValue> {
    match (a, b) {
        (PropValue::Int(x), PropValue::Int(y)) => Ok(PropValue::Int(f(*x, *y))),
        _ => Err(PlasmaError::TypeMismatch(format!(
            "{op:?} needs integer arguments, got {a:?} and {b:?}"
        ))),
    }
}

fn type_err(op: ExprOp, got: &PropValue) -> PlasmaError {
    PlasmaError::TypeMismatch(format!("{op:?} cannot take {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Slot;
    use proptest::prelude::*;

    fn pt_with_score(score: f64) -> PathTuple {
        let mut props = BTreeMap::new();
        props.insert("score".to_owned(), PropValue::Float(score));
        PathTuple::empty().bind(&OpId::new("o7"), Slot::Props(props))
    }

    #[test]
    fn loaded_reference_reads_the_property_slot() {
        let expr = Expr::ge(
            Expr::Loaded {
                op: OpId::new("o7"),
                prop: "score".into(),
            },
            Expr::lit(0.6),
        );
        assert_eq!(eval(&expr, &pt_with_score(0.8)).unwrap(), PropValue::Bool(true));
        assert_eq!(eval(&expr, &pt_with_score(0.4)).unwrap(), PropValue::Bool(false));
    }

    #[test]
    fn missing_property_is_a_type_mismatch() {
        let expr = Expr::Loaded {
            op: OpId::new("o7"),
            prop: "tempo".into(),
        };
        assert_eq!(
            eval(&expr, &pt_with_score(0.8)).unwrap_err().code(),
            "type-mismatch"
        );
    }

    #[test]
    fn unlowered_pvar_reference_fails_cleanly() {
        let expr = Expr::prop("synth", "score");
        assert!(eval(&expr, &PathTuple::empty()).is_err());
    }

    #[test]
    fn mixed_int_float_arithmetic_widens() {
        let expr = Expr::call(ExprOp::Add, vec![Expr::lit(1i64), Expr::lit(0.5)]);
        assert_eq!(eval(&expr, &PathTuple::empty()).unwrap(), PropValue::Float(1.5));

        let expr = Expr::call(ExprOp::Add, vec![Expr::lit(1i64), Expr::lit(2i64)]);
        assert_eq!(eval(&expr, &PathTuple::empty()).unwrap(), PropValue::Int(3));
    }

    #[test]
    fn division_by_zero_reports_not_panics() {
        let expr = Expr::call(ExprOp::Div, vec![Expr::lit(1i64), Expr::lit(0i64)]);
        assert!(eval(&expr, &PathTuple::empty()).is_err());
    }

    #[test]
    fn logic_requires_booleans() {
        let expr = Expr::and(Expr::lit(true), Expr::lit(1i64));
        assert_eq!(eval(&expr, &PathTuple::empty()).unwrap_err().code(), "type-mismatch");
    }

    #[test]
    fn eval_on_record_resolves_projected_fields() {
        let mut field = BTreeMap::new();
        field.insert("score".to_owned(), PropValue::Float(0.7));
        let mut record = BTreeMap::new();
        record.insert("synth".to_owned(), PropValue::Map(field));

        let expr = Expr::ge(Expr::prop("synth", "score"), Expr::lit(0.6));
        assert_eq!(eval_on_record(&expr, &record).unwrap(), PropValue::Bool(true));
    }

    proptest! {
        #[test]
        fn addition_commutes_on_ints(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
            let ab = eval(&Expr::call(ExprOp::Add, vec![Expr::lit(a), Expr::lit(b)]), &PathTuple::empty()).unwrap();
            let ba = eval(&Expr::call(ExprOp::Add, vec![Expr::lit(b), Expr::lit(a)]), &PathTuple::empty()).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn comparisons_agree_with_integer_ordering(a: i64, b: i64) {
            let lt = eval(&Expr::lt(Expr::lit(a), Expr::lit(b)), &PathTuple::empty()).unwrap();
            prop_assert_eq!(lt, PropValue::Bool(a < b));
            let ge = eval(&Expr::ge(Expr::lit(a), Expr::lit(b)), &PathTuple::empty()).unwrap();
            prop_assert_eq!(ge, PropValue::Bool(a >= b));
        }

        #[test]
        fn not_inverts_every_boolean(v: bool) {
            let out = eval(&Expr::not(Expr::lit(v)), &PathTuple::empty()).unwrap();
            prop_assert_eq!(out, PropValue::Bool(!v));
        }
    }
}
