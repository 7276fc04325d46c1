//! Kernel IR: the restricted language kernel bodies are written in.
//!
//! A body is a list of statements over `f32`-valued expressions. The same IR
//! describes kernel bodies and registered helper functions, so a single
//! evaluator (CPU) and a single code generator (WGSL) cover both.
//!
//! Bodies are assembled with [`BodyBuilder`]:
//!
//! ```rust,ignore
//! let body = KernelBody::build(|k| {
//!     let a = k.array("a");
//!     let x = k.thread_x();
//!     k.ret(a.at([x]) * 2.0);
//! });
//! ```
//!
//! Every value is a float. Comparisons and logical operators produce `1.0`
//! or `0.0`, and any non-zero value is truthy.

use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::ops;

use crate::error::{KernelError, Result};

/// Maximum number of indices in a single array access (`a[z][y][x]`).
pub const MAX_INDICES: usize = 3;

/// Parameter and return type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    /// Truncated toward zero when passed in or returned.
    Int,
    FloatArray,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::FloatArray => "float[]",
        }
    }

    pub fn is_array(self) -> bool {
        self == Self::FloatArray
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    /// Logical not: `1.0` when the operand is zero.
    Not,
    Abs,
    Sqrt,
    Exp,
    Log,
    Log2,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Floor,
    Ceil,
    Trunc,
    Sign,
    Fract,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Not => "not",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log2 => "log2",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tan => "tan",
            Self::Asin => "asin",
            Self::Acos => "acos",
            Self::Atan => "atan",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
            Self::Trunc => "trunc",
            Self::Sign => "sign",
            Self::Fract => "fract",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Truncated remainder (sign follows the dividend).
    Rem,
    Pow,
    Min,
    Max,
    Atan2,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Rem => "rem",
            Self::Pow => "pow",
            Self::Min => "min",
            Self::Max => "max",
            Self::Atan2 => "atan2",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::And => "and",
            Self::Or => "or",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    /// Scalar parameter read, or a whole array when passed to a call.
    Param(usize),
    Local(usize),
    /// Coordinate of the element being computed.
    Thread(Axis),
    /// Output size along an axis (1 for unused axes).
    Dim(Axis),
    /// `a[i0][i1]..`: indices are outermost first and address the innermost
    /// `indices.len()` axes of the array.
    Index { param: usize, indices: Vec<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Select {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// Call to a registered function.
    Call { name: String, args: Vec<Expr> },
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Expr::Const(v) => v.to_bits().hash(state),
            Expr::Param(i) | Expr::Local(i) => i.hash(state),
            Expr::Thread(axis) | Expr::Dim(axis) => axis.hash(state),
            Expr::Index { param, indices } => {
                param.hash(state);
                indices.hash(state);
            }
            Expr::Unary(op, input) => {
                op.hash(state);
                input.hash(state);
            }
            Expr::Binary(op, lhs, rhs) => {
                op.hash(state);
                lhs.hash(state);
                rhs.hash(state);
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.hash(state);
                then.hash(state);
                otherwise.hash(state);
            }
            Expr::Call { name, args } => {
                name.hash(state);
                args.hash(state);
            }
        }
    }
}

impl Expr {
    pub fn unary(op: UnaryOp, input: impl Into<Expr>) -> Expr {
        Expr::Unary(op, Box::new(input.into()))
    }

    pub fn binary(op: BinaryOp, lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Expr {
        Expr::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    /// `cond ? then : otherwise`
    pub fn select(cond: impl Into<Expr>, then: impl Into<Expr>, otherwise: impl Into<Expr>) -> Expr {
        Expr::Select {
            cond: Box::new(cond.into()),
            then: Box::new(then.into()),
            otherwise: Box::new(otherwise.into()),
        }
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Lt, self, rhs)
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Le, self, rhs)
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Gt, self, rhs)
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Ge, self, rhs)
    }

    pub fn eq_to(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Eq, self, rhs)
    }

    pub fn ne_to(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Ne, self, rhs)
    }

    pub fn and(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::And, self, rhs)
    }

    pub fn or(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Or, self, rhs)
    }

    pub fn not(self) -> Expr {
        Expr::unary(UnaryOp::Not, self)
    }

    pub fn pow(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Pow, self, rhs)
    }

    pub fn min(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Min, self, rhs)
    }

    pub fn max(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Max, self, rhs)
    }

    pub fn atan2(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Atan2, self, rhs)
    }

    pub fn abs(self) -> Expr {
        Expr::unary(UnaryOp::Abs, self)
    }

    pub fn sqrt(self) -> Expr {
        Expr::unary(UnaryOp::Sqrt, self)
    }

    pub fn exp(self) -> Expr {
        Expr::unary(UnaryOp::Exp, self)
    }

    /// Natural logarithm.
    pub fn ln(self) -> Expr {
        Expr::unary(UnaryOp::Log, self)
    }

    pub fn log2(self) -> Expr {
        Expr::unary(UnaryOp::Log2, self)
    }

    pub fn sin(self) -> Expr {
        Expr::unary(UnaryOp::Sin, self)
    }

    pub fn cos(self) -> Expr {
        Expr::unary(UnaryOp::Cos, self)
    }

    pub fn tan(self) -> Expr {
        Expr::unary(UnaryOp::Tan, self)
    }

    pub fn asin(self) -> Expr {
        Expr::unary(UnaryOp::Asin, self)
    }

    pub fn acos(self) -> Expr {
        Expr::unary(UnaryOp::Acos, self)
    }

    pub fn atan(self) -> Expr {
        Expr::unary(UnaryOp::Atan, self)
    }

    pub fn floor(self) -> Expr {
        Expr::unary(UnaryOp::Floor, self)
    }

    pub fn ceil(self) -> Expr {
        Expr::unary(UnaryOp::Ceil, self)
    }

    pub fn trunc(self) -> Expr {
        Expr::unary(UnaryOp::Trunc, self)
    }

    pub fn sign(self) -> Expr {
        Expr::unary(UnaryOp::Sign, self)
    }

    pub fn fract(self) -> Expr {
        Expr::unary(UnaryOp::Fract, self)
    }

    fn walk(&self, visit: &mut impl FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Const(_) | Expr::Param(_) | Expr::Local(_) | Expr::Thread(_) | Expr::Dim(_) => {}
            Expr::Index { indices, .. } => {
                for e in indices {
                    e.walk(visit);
                }
            }
            Expr::Unary(_, input) => input.walk(visit),
            Expr::Binary(_, lhs, rhs) => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(visit);
                then.walk(visit);
                otherwise.walk(visit);
            }
            Expr::Call { args, .. } => {
                for e in args {
                    e.walk(visit);
                }
            }
        }
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Const(v)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::Const(v as f64)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Const(v as f64)
    }
}

impl From<u32> for Expr {
    fn from(v: u32) -> Self {
        Expr::Const(v as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Hash)]
pub enum Stmt {
    /// Declares a new local, visible until the end of the enclosing block.
    Let { local: usize, value: Expr },
    Assign { local: usize, value: Expr },
    /// `for (counter = start; counter < end; counter += 1)`
    For {
        counter: usize,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Return(Expr),
}

impl Stmt {
    fn walk_exprs(&self, visit: &mut impl FnMut(&Expr)) {
        match self {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } | Stmt::Return(value) => {
                value.walk(visit)
            }
            Stmt::For {
                start, end, body, ..
            } => {
                start.walk(visit);
                end.walk(visit);
                for s in body {
                    s.walk_exprs(visit);
                }
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(visit);
                for s in then.iter().chain(otherwise) {
                    s.walk_exprs(visit);
                }
            }
        }
    }
}

/// A declared parameter. `ty: None` means untyped: kernels infer the type
/// from usage, helper functions default to `Float`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamDecl {
    pub name: String,
    pub ty: Option<ValueType>,
}

/// A kernel (or helper function) body.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelBody {
    params: Vec<ParamDecl>,
    stmts: Vec<Stmt>,
    locals: usize,
}

impl KernelBody {
    pub fn build(f: impl FnOnce(&mut BodyBuilder)) -> KernelBody {
        let mut builder = BodyBuilder::new();
        f(&mut builder);
        builder.finish()
    }

    /// Assemble a body from raw parts. `locals` is the number of local slots.
    pub fn from_parts(params: Vec<ParamDecl>, stmts: Vec<Stmt>, locals: usize) -> KernelBody {
        KernelBody {
            params,
            stmts,
            locals,
        }
    }

    pub fn params(&self) -> &[ParamDecl] {
        &self.params
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    pub fn local_count(&self) -> usize {
        self.locals
    }

    /// Parameter types for a kernel: declared, else `FloatArray` when the
    /// body indexes the parameter, else `Float`.
    pub fn inferred_types(&self) -> Vec<ValueType> {
        let indexed = self.indexed_params();
        self.params
            .iter()
            .enumerate()
            .map(|(i, p)| match p.ty {
                Some(ty) => ty,
                None if indexed.contains(&i) => ValueType::FloatArray,
                None => ValueType::Float,
            })
            .collect()
    }

    /// Parameter types for a helper function: declared, else `Float`.
    pub fn declared_types(&self) -> Vec<ValueType> {
        self.params
            .iter()
            .map(|p| p.ty.unwrap_or(ValueType::Float))
            .collect()
    }

    /// Names of every function called directly from this body.
    pub fn calls(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.walk_exprs(&mut |e| {
            if let Expr::Call { name, .. } = e {
                names.insert(name.clone());
            }
        });
        names
    }

    /// Hash of the body's structure. Parameter names do not participate;
    /// parameter types, statements and called function names do.
    pub fn structural_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn hash_into(&self, hasher: &mut impl Hasher) {
        self.params.len().hash(hasher);
        for p in &self.params {
            p.ty.hash(hasher);
        }
        self.locals.hash(hasher);
        self.stmts.hash(hasher);
    }

    /// Check that the body is well formed under the given parameter types.
    pub fn validate(&self, types: &[ValueType]) -> Result<()> {
        if types.len() != self.params.len() {
            return Err(KernelError::invalid(format!(
                "{} parameter type(s) supplied for {} parameter(s)",
                types.len(),
                self.params.len()
            )));
        }
        let mut validator = Validator {
            body: self,
            types,
            scopes: vec![Vec::new()],
            declared: HashSet::new(),
        };
        validator.block(&self.stmts)?;
        if !definitely_returns(&self.stmts) {
            return Err(KernelError::invalid("body does not return a value on every path"));
        }
        Ok(())
    }

    fn indexed_params(&self) -> HashSet<usize> {
        let mut indexed = HashSet::new();
        self.walk_exprs(&mut |e| {
            if let Expr::Index { param, .. } = e {
                indexed.insert(*param);
            }
        });
        indexed
    }

    fn walk_exprs(&self, visit: &mut impl FnMut(&Expr)) {
        for s in &self.stmts {
            s.walk_exprs(visit);
        }
    }
}

fn definitely_returns(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Return(_) => true,
        Stmt::If {
            then, otherwise, ..
        } => definitely_returns(then) && definitely_returns(otherwise),
        _ => false,
    })
}

struct Validator<'a> {
    body: &'a KernelBody,
    types: &'a [ValueType],
    scopes: Vec<Vec<usize>>,
    declared: HashSet<usize>,
}

impl Validator<'_> {
    fn block(&mut self, stmts: &[Stmt]) -> Result<()> {
        let mut returned = false;
        for stmt in stmts {
            if returned {
                return Err(KernelError::invalid("unreachable statement after return"));
            }
            self.stmt(stmt)?;
            returned = definitely_returns(std::slice::from_ref(stmt));
        }
        Ok(())
    }

    fn scoped(&mut self, seed: Option<usize>, stmts: &[Stmt]) -> Result<()> {
        self.scopes.push(Vec::new());
        if let Some(local) = seed {
            self.declare(local)?;
        }
        let result = self.block(stmts);
        self.scopes.pop();
        result
    }

    fn declare(&mut self, local: usize) -> Result<()> {
        if local >= self.body.locals {
            return Err(KernelError::invalid(format!(
                "local slot {local} exceeds the {} declared slot(s)",
                self.body.locals
            )));
        }
        if !self.declared.insert(local) {
            return Err(KernelError::invalid(format!("local {local} declared twice")));
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(local);
        }
        Ok(())
    }

    fn in_scope(&self, local: usize) -> bool {
        self.scopes.iter().any(|s| s.contains(&local))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Let { local, value } => {
                self.expr(value, false)?;
                self.declare(*local)
            }
            Stmt::Assign { local, value } => {
                if !self.in_scope(*local) {
                    return Err(KernelError::invalid(format!(
                        "assignment to undeclared local {local}"
                    )));
                }
                self.expr(value, false)
            }
            Stmt::For {
                counter,
                start,
                end,
                body,
            } => {
                self.expr(start, false)?;
                self.expr(end, false)?;
                self.scoped(Some(*counter), body)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond, false)?;
                self.scoped(None, then)?;
                self.scoped(None, otherwise)
            }
            Stmt::Return(value) => self.expr(value, false),
        }
    }

    fn param_type(&self, index: usize) -> Result<ValueType> {
        self.types.get(index).copied().ok_or_else(|| {
            KernelError::invalid(format!(
                "parameter {index} out of range ({} declared)",
                self.types.len()
            ))
        })
    }

    fn param_name(&self, index: usize) -> &str {
        self.body
            .params
            .get(index)
            .map(|p| p.name.as_str())
            .unwrap_or("?")
    }

    fn expr(&mut self, expr: &Expr, array_allowed: bool) -> Result<()> {
        match expr {
            Expr::Const(_) | Expr::Thread(_) | Expr::Dim(_) => Ok(()),
            Expr::Param(i) => {
                if self.param_type(*i)?.is_array() && !array_allowed {
                    return Err(KernelError::invalid(format!(
                        "array parameter '{}' used as a scalar value",
                        self.param_name(*i)
                    )));
                }
                Ok(())
            }
            Expr::Local(i) => {
                if self.in_scope(*i) {
                    Ok(())
                } else {
                    Err(KernelError::invalid(format!("read of undeclared local {i}")))
                }
            }
            Expr::Index { param, indices } => {
                if !self.param_type(*param)?.is_array() {
                    return Err(KernelError::invalid(format!(
                        "parameter '{}' is not an array and cannot be indexed",
                        self.param_name(*param)
                    )));
                }
                if indices.is_empty() || indices.len() > MAX_INDICES {
                    return Err(KernelError::invalid(format!(
                        "array access needs 1 to {MAX_INDICES} indices, got {}",
                        indices.len()
                    )));
                }
                indices.iter().try_for_each(|e| self.expr(e, false))
            }
            Expr::Unary(_, input) => self.expr(input, false),
            Expr::Binary(_, lhs, rhs) => {
                self.expr(lhs, false)?;
                self.expr(rhs, false)
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond, false)?;
                self.expr(then, false)?;
                self.expr(otherwise, false)
            }
            Expr::Call { name, args } => {
                if name.is_empty() {
                    return Err(KernelError::invalid("call to a function with an empty name"));
                }
                args.iter().try_for_each(|e| self.expr(e, true))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Handle to a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRef(usize);

impl ParamRef {
    pub fn index(self) -> usize {
        self.0
    }

    /// Scalar read (or whole-array reference when used as a call argument).
    pub fn value(self) -> Expr {
        Expr::Param(self.0)
    }

    /// Element read, indices outermost first: `a.at([y, x])` is `a[y][x]`.
    pub fn at<I, E>(self, indices: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Index {
            param: self.0,
            indices: indices.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<ParamRef> for Expr {
    fn from(p: ParamRef) -> Self {
        Expr::Param(p.0)
    }
}

/// Handle to a mutable local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local(usize);

impl Local {
    pub fn get(self) -> Expr {
        Expr::Local(self.0)
    }
}

impl From<Local> for Expr {
    fn from(l: Local) -> Self {
        Expr::Local(l.0)
    }
}

macro_rules! impl_arith {
    ($t:ty) => {
        impl<R: Into<Expr>> ops::Add<R> for $t {
            type Output = Expr;
            fn add(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::Add, self, rhs)
            }
        }
        impl<R: Into<Expr>> ops::Sub<R> for $t {
            type Output = Expr;
            fn sub(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::Sub, self, rhs)
            }
        }
        impl<R: Into<Expr>> ops::Mul<R> for $t {
            type Output = Expr;
            fn mul(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::Mul, self, rhs)
            }
        }
        impl<R: Into<Expr>> ops::Div<R> for $t {
            type Output = Expr;
            fn div(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::Div, self, rhs)
            }
        }
        impl<R: Into<Expr>> ops::Rem<R> for $t {
            type Output = Expr;
            fn rem(self, rhs: R) -> Expr {
                Expr::binary(BinaryOp::Rem, self, rhs)
            }
        }
        impl ops::Neg for $t {
            type Output = Expr;
            fn neg(self) -> Expr {
                Expr::unary(UnaryOp::Neg, self)
            }
        }
    };
}

impl_arith!(Expr);
impl_arith!(ParamRef);
impl_arith!(Local);

macro_rules! impl_scalar_lhs {
    ($($rhs:ty),*) => {$(
        impl ops::Add<$rhs> for f64 {
            type Output = Expr;
            fn add(self, rhs: $rhs) -> Expr {
                Expr::binary(BinaryOp::Add, self, rhs)
            }
        }
        impl ops::Sub<$rhs> for f64 {
            type Output = Expr;
            fn sub(self, rhs: $rhs) -> Expr {
                Expr::binary(BinaryOp::Sub, self, rhs)
            }
        }
        impl ops::Mul<$rhs> for f64 {
            type Output = Expr;
            fn mul(self, rhs: $rhs) -> Expr {
                Expr::binary(BinaryOp::Mul, self, rhs)
            }
        }
        impl ops::Div<$rhs> for f64 {
            type Output = Expr;
            fn div(self, rhs: $rhs) -> Expr {
                Expr::binary(BinaryOp::Div, self, rhs)
            }
        }
    )*};
}

impl_scalar_lhs!(Expr, ParamRef, Local);

/// Incrementally assembles a [`KernelBody`].
pub struct BodyBuilder {
    params: Vec<ParamDecl>,
    blocks: Vec<Vec<Stmt>>,
    locals: usize,
}

impl BodyBuilder {
    fn new() -> Self {
        BodyBuilder {
            params: Vec::new(),
            blocks: vec![Vec::new()],
            locals: 0,
        }
    }

    fn declare_param(&mut self, name: &str, ty: Option<ValueType>) -> ParamRef {
        self.params.push(ParamDecl {
            name: name.to_string(),
            ty,
        });
        ParamRef(self.params.len() - 1)
    }

    /// Untyped parameter.
    pub fn param(&mut self, name: &str) -> ParamRef {
        self.declare_param(name, None)
    }

    pub fn float(&mut self, name: &str) -> ParamRef {
        self.declare_param(name, Some(ValueType::Float))
    }

    pub fn int(&mut self, name: &str) -> ParamRef {
        self.declare_param(name, Some(ValueType::Int))
    }

    pub fn array(&mut self, name: &str) -> ParamRef {
        self.declare_param(name, Some(ValueType::FloatArray))
    }

    pub fn thread_x(&self) -> Expr {
        Expr::Thread(Axis::X)
    }

    pub fn thread_y(&self) -> Expr {
        Expr::Thread(Axis::Y)
    }

    pub fn thread_z(&self) -> Expr {
        Expr::Thread(Axis::Z)
    }

    pub fn dim(&self, axis: Axis) -> Expr {
        Expr::Dim(axis)
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    fn alloc_local(&mut self) -> usize {
        self.locals += 1;
        self.locals - 1
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self)) -> Vec<Stmt> {
        self.blocks.push(Vec::new());
        f(self);
        self.blocks.pop().unwrap_or_default()
    }

    /// Declare a local initialised to `init`.
    pub fn var(&mut self, init: impl Into<Expr>) -> Local {
        let local = self.alloc_local();
        self.push(Stmt::Let {
            local,
            value: init.into(),
        });
        Local(local)
    }

    pub fn assign(&mut self, local: Local, value: impl Into<Expr>) {
        self.push(Stmt::Assign {
            local: local.0,
            value: value.into(),
        });
    }

    /// `for (i = start; i < end; i++) { f(i) }`
    pub fn for_range(
        &mut self,
        start: impl Into<Expr>,
        end: impl Into<Expr>,
        f: impl FnOnce(&mut Self, Expr),
    ) {
        let counter = self.alloc_local();
        let body = self.nested(|b| f(b, Expr::Local(counter)));
        self.push(Stmt::For {
            counter,
            start: start.into(),
            end: end.into(),
            body,
        });
    }

    pub fn if_then(&mut self, cond: impl Into<Expr>, then: impl FnOnce(&mut Self)) {
        self.if_else(cond, then, |_| {});
    }

    pub fn if_else(
        &mut self,
        cond: impl Into<Expr>,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        let then = self.nested(then);
        let otherwise = self.nested(otherwise);
        self.push(Stmt::If {
            cond: cond.into(),
            then,
            otherwise,
        });
    }

    pub fn ret(&mut self, value: impl Into<Expr>) {
        self.push(Stmt::Return(value.into()));
    }

    fn finish(mut self) -> KernelBody {
        let stmts = self.blocks.pop().unwrap_or_default();
        KernelBody {
            params: self.params,
            stmts,
            locals: self.locals,
        }
    }
}
