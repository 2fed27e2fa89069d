//! Typed program representation consumed by the static analyzers.
//!
//! The front-end that parses generated scripts hands programs over in this
//! shape (usually as JSON). Every node is an explicit tagged variant with a
//! source [`Span`], so the detector and the taint tracker never need to
//! inspect live objects of the analyzed language.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source position of a node (1-based line, 0-based column).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Span {
    /// 1-based line number.
    pub line: u32,
    /// 0-based column offset.
    pub column: u32,
}

impl Span {
    /// Create a span at the given line and column.
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A complete program submitted for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Name of the submitted unit (module or script name).
    pub name: String,
    /// Top-level statements in source order.
    pub body: Vec<Stmt>,
}

impl Program {
    /// Create a program from its top-level statements.
    pub fn new(name: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    /// Parse a program from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns an error when the JSON does not describe a valid program.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A statement with its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    /// Position of the statement.
    pub span: Span,
    /// Statement variant.
    #[serde(flatten)]
    pub kind: StmtKind,
}

/// Imported name with optional alias (`import a.b as c`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    /// Dotted module or member name.
    pub name: String,
    /// Local binding, if renamed.
    #[serde(default)]
    pub asname: Option<String>,
}

/// One `context as target` clause of a `with` statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithItem {
    /// Context manager expression.
    pub context: Expr,
    /// Optional binding target.
    #[serde(default)]
    pub target: Option<Expr>,
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StmtKind {
    /// Bare expression statement.
    Expr {
        /// The evaluated expression.
        value: Expr,
    },
    /// `a = b = value`.
    Assign {
        /// Assignment targets.
        targets: Vec<Expr>,
        /// Assigned value.
        value: Expr,
    },
    /// `target += value` and friends.
    AugAssign {
        /// Updated target.
        target: Expr,
        /// Right-hand side.
        value: Expr,
    },
    /// `import a, b.c as d`.
    Import {
        /// Imported modules.
        names: Vec<Alias>,
    },
    /// `from module import a, b`.
    ImportFrom {
        /// Source module.
        module: String,
        /// Imported members.
        names: Vec<Alias>,
    },
    /// Function definition.
    FunctionDef {
        /// Function name.
        name: String,
        /// Positional parameter names.
        params: Vec<String>,
        /// Function body.
        body: Vec<Stmt>,
    },
    /// `return [value]`.
    Return {
        /// Returned value.
        #[serde(default)]
        value: Option<Expr>,
    },
    /// Conditional.
    If {
        /// Condition.
        test: Expr,
        /// Taken branch.
        body: Vec<Stmt>,
        /// Else branch.
        #[serde(default)]
        orelse: Vec<Stmt>,
    },
    /// `while` loop.
    While {
        /// Loop condition.
        test: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `for target in iter` loop.
    For {
        /// Loop variable.
        target: Expr,
        /// Iterated value.
        iter: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `with` block.
    With {
        /// Context clauses.
        items: Vec<WithItem>,
        /// Block body.
        body: Vec<Stmt>,
    },
    /// `try` block with handler bodies and `finally`.
    Try {
        /// Guarded body.
        body: Vec<Stmt>,
        /// Exception handler bodies.
        #[serde(default)]
        handlers: Vec<Vec<Stmt>>,
        /// `finally` body.
        #[serde(default)]
        finalbody: Vec<Stmt>,
    },
    /// No-op.
    Pass,
}

/// An expression with its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Position of the expression.
    pub span: Span,
    /// Expression variant.
    #[serde(flatten)]
    pub kind: ExprKind,
}

/// Keyword argument (`name=value`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    /// Keyword name.
    pub name: String,
    /// Argument value.
    pub value: Expr,
}

/// Literal constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    /// String literal.
    Str(String),
    /// Integer literal.
    Int(i64),
    /// Floating point literal.
    Float(f64),
    /// Boolean literal.
    Bool(bool),
    /// The null value.
    None,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOperator {
    /// `+` (also string concatenation).
    Add,
    /// `-`.
    Sub,
    /// `*`.
    Mul,
    /// `/`.
    Div,
    /// `%` (also printf-style formatting).
    Mod,
}

impl BinOperator {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExprKind {
    /// Variable reference.
    Name {
        /// Identifier.
        id: String,
    },
    /// Literal constant.
    Constant {
        /// Constant value.
        value: Literal,
    },
    /// `value.attr`.
    Attribute {
        /// Object expression.
        value: Box<Expr>,
        /// Attribute name.
        attr: String,
    },
    /// `value[index]`.
    Subscript {
        /// Indexed expression.
        value: Box<Expr>,
        /// Index expression.
        index: Box<Expr>,
    },
    /// Function or method call.
    Call {
        /// Callee.
        func: Box<Expr>,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Expr>,
        /// Keyword arguments.
        #[serde(default)]
        keywords: Vec<Keyword>,
    },
    /// Binary operation.
    BinOp {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinOperator,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Interpolated string; `parts` holds literal and interpolated pieces.
    FormattedString {
        /// String pieces in order.
        parts: Vec<Expr>,
    },
    /// List, tuple or set display.
    Collection {
        /// Elements in order.
        elements: Vec<Expr>,
    },
    /// Anonymous function.
    Lambda {
        /// Parameter names.
        params: Vec<String>,
        /// Body expression.
        body: Box<Expr>,
    },
}

impl Expr {
    /// Create an expression from a variant and a span.
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { span, kind }
    }

    /// `id` reference.
    pub fn name(id: impl Into<String>, span: Span) -> Self {
        Self::new(ExprKind::Name { id: id.into() }, span)
    }

    /// String literal.
    pub fn string(value: impl Into<String>, span: Span) -> Self {
        Self::new(
            ExprKind::Constant {
                value: Literal::Str(value.into()),
            },
            span,
        )
    }

    /// Integer literal.
    pub fn int(value: i64, span: Span) -> Self {
        Self::new(
            ExprKind::Constant {
                value: Literal::Int(value),
            },
            span,
        )
    }

    /// Boolean literal.
    pub fn bool(value: bool, span: Span) -> Self {
        Self::new(
            ExprKind::Constant {
                value: Literal::Bool(value),
            },
            span,
        )
    }

    /// `value.attr`.
    pub fn attr(value: Expr, attr: impl Into<String>, span: Span) -> Self {
        Self::new(
            ExprKind::Attribute {
                value: Box::new(value),
                attr: attr.into(),
            },
            span,
        )
    }

    /// `value[index]`.
    pub fn subscript(value: Expr, index: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::Subscript {
                value: Box::new(value),
                index: Box::new(index),
            },
            span,
        )
    }

    /// Positional call.
    pub fn call(func: Expr, args: Vec<Expr>, span: Span) -> Self {
        Self::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords: Vec::new(),
            },
            span,
        )
    }

    /// Call with keyword arguments.
    pub fn call_kw(func: Expr, args: Vec<Expr>, keywords: Vec<Keyword>, span: Span) -> Self {
        Self::new(
            ExprKind::Call {
                func: Box::new(func),
                args,
                keywords,
            },
            span,
        )
    }

    /// Binary operation.
    pub fn binop(left: Expr, op: BinOperator, right: Expr, span: Span) -> Self {
        Self::new(
            ExprKind::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        )
    }

    /// Build a dotted reference such as `os.path.join` from its parts.
    ///
    /// All nodes share the given span. An empty path yields an empty name.
    pub fn dotted(path: &str, span: Span) -> Self {
        let mut parts = path.split('.');
        let first = parts.next().unwrap_or_default();
        parts.fold(Self::name(first, span), |acc, part| {
            Self::attr(acc, part, span)
        })
    }

    /// Dotted name of a reference chain (`a.b.c`), if the expression is one.
    pub fn dotted_name(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Name { id } => Some(id.clone()),
            ExprKind::Attribute { value, attr } => {
                value.dotted_name().map(|base| format!("{base}.{attr}"))
            }
            _ => None,
        }
    }

    /// The string value, if this is a string literal.
    pub fn as_str_literal(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Constant {
                value: Literal::Str(s),
            } => Some(s),
            _ => None,
        }
    }

    /// Whether this expression is a literal constant.
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ExprKind::Constant { .. })
    }
}

impl Stmt {
    /// Create a statement from a variant and a span.
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { span, kind }
    }

    /// Expression statement.
    pub fn expr(value: Expr, span: Span) -> Self {
        Self::new(StmtKind::Expr { value }, span)
    }

    /// Single-target assignment to a name.
    pub fn assign(target: impl Into<String>, value: Expr, span: Span) -> Self {
        Self::new(
            StmtKind::Assign {
                targets: vec![Expr::name(target, span)],
                value,
            },
            span,
        )
    }

    /// `import module`.
    pub fn import(module: impl Into<String>, span: Span) -> Self {
        Self::new(
            StmtKind::Import {
                names: vec![Alias {
                    name: module.into(),
                    asname: None,
                }],
            },
            span,
        )
    }

    /// `def name(params): body`.
    pub fn function(name: impl Into<String>, params: &[&str], body: Vec<Stmt>, span: Span) -> Self {
        Self::new(
            StmtKind::FunctionDef {
                name: name.into(),
                params: params.iter().map(|p| (*p).to_owned()).collect(),
                body,
            },
            span,
        )
    }

    /// `return value`.
    pub fn ret(value: Expr, span: Span) -> Self {
        Self::new(StmtKind::Return { value: Some(value) }, span)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::None => f.write_str("None"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Name { id } => f.write_str(id),
            ExprKind::Constant { value } => write!(f, "{value}"),
            ExprKind::Attribute { value, attr } => write!(f, "{value}.{attr}"),
            ExprKind::Subscript { value, index } => write!(f, "{value}[{index}]"),
            ExprKind::Call {
                func,
                args,
                keywords,
            } => {
                write!(f, "{func}(")?;
                write_joined(f, args)?;
                for (i, kw) in keywords.iter().enumerate() {
                    if i > 0 || !args.is_empty() {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}={}", kw.name, kw.value)?;
                }
                f.write_str(")")
            }
            ExprKind::BinOp { left, op, right } => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            ExprKind::FormattedString { parts } => {
                f.write_str("f\"")?;
                for part in parts {
                    match part.as_str_literal() {
                        Some(s) => f.write_str(s)?,
                        None => write!(f, "{{{part}}}")?,
                    }
                }
                f.write_str("\"")
            }
            ExprKind::Collection { elements } => {
                f.write_str("[")?;
                write_joined(f, elements)?;
                f.write_str("]")
            }
            ExprKind::Lambda { params, body } => {
                write!(f, "lambda {}: {body}", params.join(", "))
            }
        }
    }
}
