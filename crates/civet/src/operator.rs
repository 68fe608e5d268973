//! The operator table.
//!
//! Two disjoint operator sets (prefix and binary), each entry carrying its
//! spelling, precedence and associativity. The tokenizer matches operator
//! spellings greedily against this table (up to 3 characters) and the
//! expression parser drives its reduce decisions off the precedences.

use strum::IntoStaticStr;

/// Binary operators, including assignment and the short-circuit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum BinOp {
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Mod,
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum UnOp {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "!")]
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Assoc {
    Prefix,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Operator<Op> {
    pub name: &'static str,
    pub op: Op,
    pub prec: i32,
    pub assoc: Assoc,
}

/// Artificial precedence for call/index reduction; above every real operator.
pub(crate) const FUNC_CALL_PREC: i32 = 1000;

const BINARY: &[Operator<BinOp>] = &[
    Operator { name: "=", op: BinOp::Assign, prec: 10, assoc: Assoc::Right },
    Operator { name: "||", op: BinOp::Or, prec: 20, assoc: Assoc::Left },
    Operator { name: "&&", op: BinOp::And, prec: 30, assoc: Assoc::Left },
    Operator { name: "==", op: BinOp::Eq, prec: 40, assoc: Assoc::Left },
    Operator { name: "!=", op: BinOp::Ne, prec: 40, assoc: Assoc::Left },
    Operator { name: "<", op: BinOp::Lt, prec: 50, assoc: Assoc::Left },
    Operator { name: ">", op: BinOp::Gt, prec: 50, assoc: Assoc::Left },
    Operator { name: "<=", op: BinOp::Le, prec: 50, assoc: Assoc::Left },
    Operator { name: ">=", op: BinOp::Ge, prec: 50, assoc: Assoc::Left },
    Operator { name: "+", op: BinOp::Add, prec: 60, assoc: Assoc::Left },
    Operator { name: "-", op: BinOp::Sub, prec: 60, assoc: Assoc::Left },
    Operator { name: "*", op: BinOp::Mul, prec: 70, assoc: Assoc::Left },
    Operator { name: "/", op: BinOp::Div, prec: 70, assoc: Assoc::Left },
    Operator { name: "%", op: BinOp::Mod, prec: 70, assoc: Assoc::Left },
];

const PREFIX: &[Operator<UnOp>] = &[
    Operator { name: "-", op: UnOp::Neg, prec: 80, assoc: Assoc::Prefix },
    Operator { name: "!", op: UnOp::Not, prec: 80, assoc: Assoc::Prefix },
];

pub(crate) fn binary_op(name: &str) -> Option<&'static Operator<BinOp>> {
    BINARY.iter().find(|o| o.name == name)
}

pub(crate) fn prefix_op(name: &str) -> Option<&'static Operator<UnOp>> {
    PREFIX.iter().find(|o| o.name == name)
}

/// True if `text` is an operator spelling or a prefix of one.
///
/// Drives the tokenizer's greedy scan: it keeps consuming bytes while the
/// accumulated text can still become an operator.
pub(crate) fn is_op_prefix(text: &str) -> bool {
    BINARY.iter().map(|o| o.name).chain(PREFIX.iter().map(|o| o.name)).any(|n| n.starts_with(text))
}

/// True if `text` spells a complete operator.
pub(crate) fn is_op(text: &str) -> bool {
    binary_op(text).is_some() || prefix_op(text).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        assert_eq!(binary_op("<=").map(|o| o.op), Some(BinOp::Le));
        assert_eq!(prefix_op("!").map(|o| o.op), Some(UnOp::Not));
        assert!(binary_op("!").is_none());
        assert!(prefix_op("+").is_none());
    }

    #[test]
    fn prefix_matching_covers_partial_spellings() {
        assert!(is_op_prefix("&"));
        assert!(is_op_prefix("&&"));
        assert!(!is_op("&"));
        assert!(is_op("&&"));
        assert!(!is_op_prefix("&|"));
    }

    #[test]
    fn comparison_and_additive_precedence_ordering() {
        let lt = binary_op("<").unwrap().prec;
        let add = binary_op("+").unwrap().prec;
        let assign = binary_op("=").unwrap().prec;
        assert!(assign < lt && lt < add && add < FUNC_CALL_PREC);
        assert_eq!(binary_op("=").unwrap().assoc, Assoc::Right);
    }
}
