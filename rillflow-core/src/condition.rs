//! Composable write conditions over a stream's version.
//!
//! A [`WriteCondition`] is a boolean expression over the current version of a
//! stream, checked atomically at append time. The algebra is closed: a leaf
//! comparison against an expected version, or a logical composite of
//! sub-conditions. [`Condition::compile`] translates it, by structural
//! recursion, into the native predicate document the underlying log's
//! conditional-update mechanism consumes.

use std::fmt;

use serde_json::{Value, json};

/// Field the native predicate compares against.
pub const VERSION_FIELD: &str = "version";

/// Comparison operator for a leaf condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl ComparisonOp {
    /// Operator name in the log's native predicate dialect.
    #[must_use]
    pub(crate) const fn native_operator(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
        }
    }

    const fn holds(self, actual: u64, operand: u64) -> bool {
        match self {
            Self::Eq => actual == operand,
            Self::Ne => actual != operand,
            Self::Lt => actual < operand,
            Self::Lte => actual <= operand,
            Self::Gt => actual > operand,
            Self::Gte => actual >= operand,
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        };
        f.write_str(name)
    }
}

/// Logical combinator for composite conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// Boolean expression over a stream version.
///
/// Two shapes: a leaf [`Operation`](Condition::Operation) comparing the
/// version against an operand, or a [`Multi`](Condition::Multi) composite
/// combining sub-conditions with AND/OR/NOT.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Leaf comparison against an expected version.
    Operation {
        /// Comparison to apply.
        op: ComparisonOp,
        /// Expected version operand.
        operand: u64,
    },
    /// Logical composition of sub-conditions.
    Multi {
        /// Combinator.
        op: LogicalOp,
        /// Sub-conditions; NOT holds when none of them hold.
        operands: Vec<Condition>,
    },
}

impl Condition {
    /// Version must equal `operand`.
    #[must_use]
    pub const fn eq(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Eq,
            operand,
        }
    }

    /// Version must not equal `operand`.
    #[must_use]
    pub const fn ne(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Ne,
            operand,
        }
    }

    /// Version must be less than `operand`.
    #[must_use]
    pub const fn lt(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Lt,
            operand,
        }
    }

    /// Version must be less than or equal to `operand`.
    #[must_use]
    pub const fn lte(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Lte,
            operand,
        }
    }

    /// Version must be greater than `operand`.
    #[must_use]
    pub const fn gt(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Gt,
            operand,
        }
    }

    /// Version must be greater than or equal to `operand`.
    #[must_use]
    pub const fn gte(operand: u64) -> Self {
        Self::Operation {
            op: ComparisonOp::Gte,
            operand,
        }
    }

    /// All sub-conditions must hold.
    #[must_use]
    pub fn and(operands: impl IntoIterator<Item = Condition>) -> Self {
        Self::Multi {
            op: LogicalOp::And,
            operands: operands.into_iter().collect(),
        }
    }

    /// At least one sub-condition must hold.
    #[must_use]
    pub fn or(operands: impl IntoIterator<Item = Condition>) -> Self {
        Self::Multi {
            op: LogicalOp::Or,
            operands: operands.into_iter().collect(),
        }
    }

    /// The sub-condition must not hold.
    #[must_use]
    pub fn not(condition: Condition) -> Self {
        Self::Multi {
            op: LogicalOp::Not,
            operands: vec![condition],
        }
    }

    /// Compile to the native predicate document over the `version` field.
    ///
    /// Pure translation: a leaf maps to a comparison predicate, a composite
    /// recursively compiles its children and combines them (`$and`, `$or`;
    /// NOT compiles to `$nor`).
    #[must_use]
    pub fn compile(&self) -> Value {
        match self {
            Self::Operation { op, operand } => {
                json!({ (VERSION_FIELD): { (op.native_operator()): operand } })
            }
            Self::Multi { op, operands } => {
                let compiled: Vec<Value> = operands.iter().map(Condition::compile).collect();
                let combinator = match op {
                    LogicalOp::And => "$and",
                    LogicalOp::Or => "$or",
                    LogicalOp::Not => "$nor",
                };
                json!({ (combinator): compiled })
            }
        }
    }

    /// Evaluate the condition against a concrete version.
    ///
    /// Used by the store when a stream has no version record yet: the
    /// condition is checked against version 0 before the counter is
    /// initialized.
    #[must_use]
    pub fn holds(&self, version: u64) -> bool {
        match self {
            Self::Operation { op, operand } => op.holds(version, *operand),
            Self::Multi { op, operands } => match op {
                LogicalOp::And => operands.iter().all(|c| c.holds(version)),
                LogicalOp::Or => operands.iter().any(|c| c.holds(version)),
                LogicalOp::Not => !operands.iter().any(|c| c.holds(version)),
            },
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation { op, operand } => write!(f, "{op} {operand}"),
            Self::Multi { op, operands } => {
                let separator = match op {
                    LogicalOp::And => " and ",
                    LogicalOp::Or => " or ",
                    LogicalOp::Not => {
                        write!(f, "not (")?;
                        for (index, operand) in operands.iter().enumerate() {
                            if index > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{operand}")?;
                        }
                        return write!(f, ")");
                    }
                };
                write!(f, "(")?;
                for (index, operand) in operands.iter().enumerate() {
                    if index > 0 {
                        f.write_str(separator)?;
                    }
                    write!(f, "{operand}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Write condition scoping a [`Condition`] to the stream's version counter.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteCondition(Condition);

impl WriteCondition {
    /// Condition over the stream version.
    #[must_use]
    pub const fn stream_version(condition: Condition) -> Self {
        Self(condition)
    }

    /// Shorthand for the common append-after-read case: version must equal
    /// `version` exactly.
    #[must_use]
    pub const fn version_eq(version: u64) -> Self {
        Self(Condition::eq(version))
    }

    /// The wrapped condition expression.
    #[must_use]
    pub const fn condition(&self) -> &Condition {
        &self.0
    }

    /// Compile to the native predicate document. See [`Condition::compile`].
    #[must_use]
    pub fn compile(&self) -> Value {
        self.0.compile()
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream version to be {}", self.0)
    }
}
