//! Numeric, string and comparison operator semantics.
//!
//! Arithmetic promotes to real when either operand is real (modulo stays
//! integral); bitwise operators insist on integers; comparisons and `+`
//! switch to string semantics when either operand is string-like. Every
//! violation yields `undefined` with a warning message returned to the
//! caller for logging.

use crate::value::Value;

/// Outcome of a binary operator: the result value, or a warning message
/// with `undefined` as the implied result.
pub(crate) type OpResult<'p> = Result<Value<'p>, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumOp {
    Plus,
    Minus,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
}

impl NumOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
        }
    }

    fn is_bit_op(self) -> bool {
        matches!(self, Self::BitAnd | Self::BitOr | Self::BitXor)
    }
}

/// Executes an arithmetic or bitwise operator with numeric operands.
pub(crate) fn numop<'p>(op: NumOp, lhs: &Value<'p>, rhs: &Value<'p>) -> OpResult<'p> {
    let sym = op.symbol();
    if !lhs.is_number() {
        return Err(format!("Left operand of {sym} numeric operator is {}", lhs.tag_str()));
    }
    if !rhs.is_number() {
        return Err(format!("Right operand of {sym} numeric operator is {}", rhs.tag_str()));
    }
    if op.is_bit_op() {
        if !lhs.is_integral() {
            return Err(format!(
                "The left operand of {sym} numeric operator is a {} but an integer is expected",
                lhs.tag_str()
            ));
        }
        if !rhs.is_integral() {
            return Err(format!(
                "The right operand of {sym} numeric operator is a {} but an integer is expected",
                rhs.tag_str()
            ));
        }
    }

    match op {
        NumOp::BitAnd => return Ok(Value::Int(lhs.integral() & rhs.integral())),
        NumOp::BitOr => return Ok(Value::Int(lhs.integral() | rhs.integral())),
        NumOp::BitXor => return Ok(Value::Int(lhs.integral() ^ rhs.integral())),
        NumOp::Mod => {
            if rhs.integral() == 0 {
                return Err(format!("Right operand of {sym} division operator is zero"));
            }
            return Ok(Value::Int(lhs.integral().wrapping_rem(rhs.integral())));
        }
        NumOp::Div => {
            if rhs.real() == 0.0 {
                return Err(format!("Right operand of {sym} division operator is zero"));
            }
        }
        _ => {}
    }

    // promote to real if either operand is real
    if lhs.is_real() || rhs.is_real() {
        let result = match op {
            NumOp::Plus => lhs.real() + rhs.real(),
            NumOp::Minus => lhs.real() - rhs.real(),
            NumOp::Mul => lhs.real() * rhs.real(),
            NumOp::Div => lhs.real() / rhs.real(),
            _ => unreachable!("bit ops and modulo handled above"),
        };
        if !result.is_finite() {
            return Err("Floating point operation failed".to_owned());
        }
        return Ok(Value::Real(result));
    }
    let result = match op {
        NumOp::Plus => lhs.integral().wrapping_add(rhs.integral()),
        NumOp::Minus => lhs.integral().wrapping_sub(rhs.integral()),
        NumOp::Mul => lhs.integral().wrapping_mul(rhs.integral()),
        NumOp::Div => lhs.integral().wrapping_div(rhs.integral()),
        _ => unreachable!("bit ops and modulo handled above"),
    };
    Ok(Value::Int(result))
}

/// `+` with string semantics when either side is string-like.
pub(crate) fn plus<'p>(lhs: &Value<'p>, rhs: &Value<'p>) -> OpResult<'p> {
    if lhs.is_string_like() || rhs.is_string_like() {
        let mut result = lhs.printable().into_owned();
        result.push_str(&rhs.printable());
        return Ok(Value::Str(result));
    }
    numop(NumOp::Plus, lhs, rhs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Ge,
    Gt,
    Le,
    Lt,
}

/// Comparison: string comparison when either operand is string-like (the
/// other side compares by its printable form), numeric otherwise.
pub(crate) fn compare<'p>(op: CmpOp, lhs: &Value<'p>, rhs: &Value<'p>) -> OpResult<'p> {
    let outcome = if lhs.is_string_like() || rhs.is_string_like() {
        let lhs = lhs.printable();
        let rhs = rhs.printable();
        match op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Lt => lhs < rhs,
        }
    } else {
        let sym = match op {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Lt => "<",
        };
        if !lhs.is_number() {
            return Err(format!("Left operand of {sym} numeric operator is {}", lhs.tag_str()));
        }
        if !rhs.is_number() {
            return Err(format!("Right operand of {sym} numeric operator is {}", rhs.tag_str()));
        }
        if lhs.is_real() || rhs.is_real() {
            let (l, r) = (lhs.real(), rhs.real());
            match op {
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
                CmpOp::Ge => l >= r,
                CmpOp::Gt => l > r,
                CmpOp::Le => l <= r,
                CmpOp::Lt => l < r,
            }
        } else {
            let (l, r) = (lhs.integral(), rhs.integral());
            match op {
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
                CmpOp::Ge => l >= r,
                CmpOp::Gt => l > r,
                CmpOp::Le => l <= r,
                CmpOp::Lt => l < r,
            }
        }
    };
    Ok(Value::Int(i64::from(outcome)))
}

/// `str ** n`: repeats a string a non-negative number of times.
pub(crate) fn repeat<'p>(lhs: &Value<'p>, rhs: &Value<'p>) -> OpResult<'p> {
    if !rhs.is_integral() {
        return Err("Right operand of repeat string operator is not int".to_owned());
    }
    let count = rhs.integral();
    if count < 0 {
        return Err("Right operand of repeat string operator is negative".to_owned());
    }
    if !lhs.is_string_like() {
        return Err("Left operand of repeat string operator is not string".to_owned());
    }
    Ok(Value::Str(lhs.string().repeat(count as usize)))
}

/// Unary minus; numbers only.
pub(crate) fn unary_minus<'p>(arg: &Value<'p>) -> OpResult<'p> {
    match arg {
        Value::Int(v) => Ok(Value::Int(v.wrapping_neg())),
        Value::Real(v) => Ok(Value::Real(-v)),
        _ => Err("Operand of unary - operator is not number".to_owned()),
    }
}

/// Unary plus; numbers only.
pub(crate) fn unary_plus<'p>(arg: &Value<'p>) -> OpResult<'p> {
    match arg {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Real(v) => Ok(Value::Real(*v)),
        _ => Err("Operand of unary + operator is not number".to_owned()),
    }
}

/// Bitwise not; integers only.
pub(crate) fn bit_not<'p>(arg: &Value<'p>) -> OpResult<'p> {
    match arg {
        Value::Int(v) => Ok(Value::Int(!v)),
        _ => Err("Operand of bit ~ operator is not int".to_owned()),
    }
}

/// Logical not; undefined stays undefined.
pub(crate) fn logic_not<'p>(arg: &Value<'p>) -> Value<'p> {
    if arg.is_undefined() { Value::Undefined } else { Value::Int(i64::from(!arg.truthy())) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_to_real() {
        assert_eq!(numop(NumOp::Plus, &Value::Int(1), &Value::Real(0.5)).unwrap(), Value::Real(1.5));
        assert_eq!(numop(NumOp::Plus, &Value::Int(1), &Value::Int(2)).unwrap(), Value::Int(3));
    }

    #[test]
    fn division_by_zero_is_a_warning() {
        assert!(numop(NumOp::Div, &Value::Int(1), &Value::Int(0)).is_err());
        assert!(numop(NumOp::Mod, &Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn bit_ops_require_integers() {
        assert!(numop(NumOp::BitAnd, &Value::Real(1.0), &Value::Int(1)).is_err());
        assert_eq!(numop(NumOp::BitXor, &Value::Int(6), &Value::Int(3)).unwrap(), Value::Int(5));
    }

    #[test]
    fn string_plus_concatenates() {
        assert_eq!(plus(&Value::StrRef("a"), &Value::Int(1)).unwrap(), Value::Str("a1".into()));
        assert_eq!(plus(&Value::Int(1), &Value::Int(1)).unwrap(), Value::Int(2));
    }

    #[test]
    fn string_comparison() {
        assert_eq!(compare(CmpOp::Eq, &Value::StrRef("1"), &Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(compare(CmpOp::Lt, &Value::StrRef("a"), &Value::StrRef("b")).unwrap(), Value::Int(1));
    }

    #[test]
    fn repeat_string() {
        assert_eq!(repeat(&Value::StrRef("ab"), &Value::Int(3)).unwrap(), Value::Str("ababab".into()));
        assert!(repeat(&Value::StrRef("ab"), &Value::Int(-1)).is_err());
    }

    #[test]
    fn not_of_undefined_is_undefined() {
        assert!(logic_not(&Value::Undefined).is_undefined());
        assert_eq!(logic_not(&Value::Int(0)), Value::Int(1));
    }
}
