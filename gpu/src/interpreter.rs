//! CPU executor: evaluates kernel bodies on the host, one output element at
//! a time.
//!
//! The thread coordinates and output dimensions travel in an explicit
//! [`ExecutionContext`]; nothing about the executing element lives in global
//! state. Helper functions are resolved by name from a [`FunctionSnapshot`]
//! taken when the run starts.
//!
//! Arithmetic is done in `f64` and each element is rounded to `f32` when it
//! is stored, so results agree with the GPU path within `f32` tolerance.

use crate::array::{Arg, ArrayData, NdArray};
use crate::config::Dimensions;
use crate::error::Result;
use crate::functions::{FunctionBody, FunctionSnapshot};
use crate::kernel_ir::{Axis, BinaryOp, Expr, KernelBody, Stmt, UnaryOp, ValueType};

/// Nested helper calls allowed before evaluation is aborted.
pub const MAX_CALL_DEPTH: usize = 64;

/// Iterations a single loop may run before evaluation is aborted.
pub const MAX_LOOP_ITERATIONS: u64 = 1 << 24;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpreterError {
    #[error("call to unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{name}' takes {expected} argument(s) but {got} were given")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("call depth exceeded {}", MAX_CALL_DEPTH)]
    StackOverflow,

    #[error("loop exceeded {} iterations", MAX_LOOP_ITERATIONS)]
    LoopLimit,

    #[error("body finished without returning a value")]
    MissingReturn,

    #[error("local slot {0} is out of range")]
    BadLocal(usize),
}

type EvalResult<T> = std::result::Result<T, InterpreterError>;

/// Identity of the element being computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    thread: [u32; 3],
    dims: [u32; 3],
}

impl ExecutionContext {
    pub fn new(thread: [u32; 3], dims: [u32; 3]) -> Self {
        ExecutionContext { thread, dims }
    }

    /// Context for the `id`-th element in row-major order (x fastest).
    pub fn for_linear(id: usize, dims: [u32; 3]) -> Self {
        let dx = dims[0].max(1) as usize;
        let dy = dims[1].max(1) as usize;
        let x = id % dx;
        let y = (id / dx) % dy;
        let z = id / (dx * dy);
        ExecutionContext {
            thread: [x as u32, y as u32, z as u32],
            dims,
        }
    }

    pub fn thread(&self, axis: Axis) -> u32 {
        self.thread[axis.index()]
    }

    pub fn dim(&self, axis: Axis) -> u32 {
        self.dims[axis.index()]
    }
}

#[derive(Debug, Clone, Copy)]
enum Elements<'a> {
    Host(&'a ArrayData),
    Words(&'a [f32]),
}

/// Read-only view of an array argument, padded to `(dz, dy, dx)`.
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a> {
    elements: Elements<'a>,
    dims: [usize; 3],
}

impl<'a> ArrayView<'a> {
    pub fn from_array(array: &'a NdArray) -> Self {
        ArrayView {
            elements: Elements::Host(array.data()),
            dims: array.dims3(),
        }
    }

    /// View over decoded device words.
    pub fn from_words(words: &'a [f32], dims: [usize; 3]) -> Self {
        ArrayView {
            elements: Elements::Words(words),
            dims,
        }
    }

    /// Element at `indices` (outermost first, addressing the innermost
    /// axes). Indices are floored; any index outside its axis reads `0.0`.
    pub fn load(&self, indices: &[f64]) -> f64 {
        let mut coords = [0usize; 3];
        let offset = 3usize.saturating_sub(indices.len());
        for (axis, &raw) in indices.iter().take(3).enumerate() {
            let slot = offset + axis;
            let idx = raw.floor();
            if !(idx >= 0.0 && idx < self.dims[slot] as f64) {
                return 0.0;
            }
            coords[slot] = idx as usize;
        }
        let flat = (coords[0] * self.dims[1] + coords[1]) * self.dims[2] + coords[2];
        match self.elements {
            Elements::Host(data) => data.get_f64(flat).unwrap_or(0.0),
            Elements::Words(words) => words.get(flat).map_or(0.0, |&w| w as f64),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    Scalar(f64),
    Array(ArrayView<'a>),
}

/// Bind kernel arguments to parameter types. `Int` scalars are truncated.
pub fn bind_args<'a>(types: &[ValueType], args: &'a [Arg]) -> EvalResult<Vec<Value<'a>>> {
    if types.len() != args.len() {
        return Err(InterpreterError::TypeMismatch(format!(
            "{} argument(s) for {} parameter(s)",
            args.len(),
            types.len()
        )));
    }
    types
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (ty, arg))| match (ty, arg) {
            (ValueType::Float, Arg::Scalar(v)) => Ok(Value::Scalar(*v)),
            (ValueType::Int, Arg::Scalar(v)) => Ok(Value::Scalar(v.trunc())),
            (ValueType::FloatArray, Arg::Array(a)) => Ok(Value::Array(ArrayView::from_array(a))),
            (ty, arg) => Err(InterpreterError::TypeMismatch(format!(
                "argument {i} is {} but the parameter is {}",
                arg.kind(),
                ty.name()
            ))),
        })
        .collect()
}

enum Flow {
    Next,
    Return(f64),
}

struct Frame<'f, 'a> {
    args: &'f [Value<'a>],
    locals: Vec<f64>,
}

impl Frame<'_, '_> {
    fn local(&self, slot: usize) -> EvalResult<f64> {
        self.locals
            .get(slot)
            .copied()
            .ok_or(InterpreterError::BadLocal(slot))
    }

    fn set_local(&mut self, slot: usize, value: f64) -> EvalResult<()> {
        match self.locals.get_mut(slot) {
            Some(l) => {
                *l = value;
                Ok(())
            }
            None => Err(InterpreterError::BadLocal(slot)),
        }
    }
}

/// Tree-walking evaluator for one element.
pub struct Interpreter<'s> {
    functions: &'s FunctionSnapshot,
    ctx: ExecutionContext,
    depth: usize,
}

impl<'s> Interpreter<'s> {
    pub fn new(functions: &'s FunctionSnapshot, ctx: ExecutionContext) -> Self {
        Interpreter {
            functions,
            ctx,
            depth: 0,
        }
    }

    /// Run `body` with bound arguments and return its value.
    pub fn evaluate(&mut self, body: &KernelBody, args: &[Value<'_>]) -> EvalResult<f64> {
        let mut frame = Frame {
            args,
            locals: vec![0.0; body.local_count()],
        };
        match self.block(&mut frame, body.stmts())? {
            Flow::Return(v) => Ok(v),
            Flow::Next => Err(InterpreterError::MissingReturn),
        }
    }

    fn block(&mut self, frame: &mut Frame<'_, '_>, stmts: &[Stmt]) -> EvalResult<Flow> {
        for stmt in stmts {
            if let Flow::Return(v) = self.stmt(frame, stmt)? {
                return Ok(Flow::Return(v));
            }
        }
        Ok(Flow::Next)
    }

    fn stmt(&mut self, frame: &mut Frame<'_, '_>, stmt: &Stmt) -> EvalResult<Flow> {
        match stmt {
            Stmt::Let { local, value } | Stmt::Assign { local, value } => {
                let v = self.expr(frame, value)?;
                frame.set_local(*local, v)?;
                Ok(Flow::Next)
            }
            Stmt::For {
                counter,
                start,
                end,
                body,
            } => {
                let start = self.expr(frame, start)?;
                frame.set_local(*counter, start)?;
                let mut iterations = 0u64;
                loop {
                    let bound = self.expr(frame, end)?;
                    if !(frame.local(*counter)? < bound) {
                        return Ok(Flow::Next);
                    }
                    if iterations == MAX_LOOP_ITERATIONS {
                        return Err(InterpreterError::LoopLimit);
                    }
                    iterations += 1;
                    if let Flow::Return(v) = self.block(frame, body)? {
                        return Ok(Flow::Return(v));
                    }
                    let next = frame.local(*counter)? + 1.0;
                    frame.set_local(*counter, next)?;
                }
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(self.expr(frame, cond)?) {
                    self.block(frame, then)
                } else {
                    self.block(frame, otherwise)
                }
            }
            Stmt::Return(value) => Ok(Flow::Return(self.expr(frame, value)?)),
        }
    }

    fn expr(&mut self, frame: &Frame<'_, '_>, expr: &Expr) -> EvalResult<f64> {
        match expr {
            Expr::Const(v) => Ok(*v),
            Expr::Param(i) => match frame.args.get(*i) {
                Some(Value::Scalar(v)) => Ok(*v),
                Some(Value::Array(_)) => Err(InterpreterError::TypeMismatch(format!(
                    "parameter {i} is an array and was read as a scalar"
                ))),
                None => Err(InterpreterError::TypeMismatch(format!(
                    "parameter {i} has no bound argument"
                ))),
            },
            Expr::Local(slot) => frame.local(*slot),
            Expr::Thread(axis) => Ok(self.ctx.thread(*axis) as f64),
            Expr::Dim(axis) => Ok(self.ctx.dim(*axis) as f64),
            Expr::Index { param, indices } => {
                let view = match frame.args.get(*param) {
                    Some(Value::Array(view)) => *view,
                    _ => {
                        return Err(InterpreterError::TypeMismatch(format!(
                            "parameter {param} is not an array"
                        )))
                    }
                };
                let mut idx = Vec::with_capacity(indices.len());
                for e in indices {
                    idx.push(self.expr(frame, e)?);
                }
                Ok(view.load(&idx))
            }
            Expr::Unary(op, input) => Ok(apply_unary(*op, self.expr(frame, input)?)),
            Expr::Binary(op, lhs, rhs) => {
                let a = self.expr(frame, lhs)?;
                let b = self.expr(frame, rhs)?;
                Ok(apply_binary(*op, a, b))
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                if truthy(self.expr(frame, cond)?) {
                    self.expr(frame, then)
                } else {
                    self.expr(frame, otherwise)
                }
            }
            Expr::Call { name, args } => self.call(frame, name, args),
        }
    }

    fn call(&mut self, frame: &Frame<'_, '_>, name: &str, args: &[Expr]) -> EvalResult<f64> {
        let functions = self.functions;
        let def = functions
            .get(name)
            .ok_or_else(|| InterpreterError::UnknownFunction(name.to_string()))?;
        let types = def.param_types();
        if types.len() != args.len() {
            return Err(InterpreterError::ArityMismatch {
                name: name.to_string(),
                expected: types.len(),
                got: args.len(),
            });
        }

        let mut values = Vec::with_capacity(args.len());
        for (ty, arg) in types.iter().zip(args) {
            let value = match (ty, arg) {
                (ValueType::FloatArray, Expr::Param(i)) => match frame.args.get(*i) {
                    Some(Value::Array(view)) => Value::Array(*view),
                    _ => {
                        return Err(InterpreterError::TypeMismatch(format!(
                            "'{name}' expects an array argument"
                        )))
                    }
                },
                (ValueType::FloatArray, _) => {
                    return Err(InterpreterError::TypeMismatch(format!(
                        "'{name}' expects an array argument"
                    )))
                }
                (ValueType::Int, e) => Value::Scalar(self.expr(frame, e)?.trunc()),
                (ValueType::Float, e) => Value::Scalar(self.expr(frame, e)?),
            };
            values.push(value);
        }

        if self.depth >= MAX_CALL_DEPTH {
            return Err(InterpreterError::StackOverflow);
        }
        self.depth += 1;
        let result = match def.body() {
            FunctionBody::Ir(body) => self.evaluate(body, &values),
            FunctionBody::Native { f, .. } => {
                let scalars: Vec<f64> = values
                    .iter()
                    .map(|v| match v {
                        Value::Scalar(s) => *s,
                        Value::Array(_) => 0.0,
                    })
                    .collect();
                Ok(f(&scalars))
            }
        };
        self.depth -= 1;

        let value = result?;
        Ok(match def.return_type() {
            ValueType::Int => value.trunc(),
            _ => value,
        })
    }
}

fn truthy(v: f64) -> bool {
    v != 0.0
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Unary operator semantics shared with the WGSL builtins.
pub fn apply_unary(op: UnaryOp, v: f64) -> f64 {
    match op {
        UnaryOp::Neg => -v,
        UnaryOp::Not => flag(v == 0.0),
        UnaryOp::Abs => v.abs(),
        UnaryOp::Sqrt => v.sqrt(),
        UnaryOp::Exp => v.exp(),
        UnaryOp::Log => v.ln(),
        UnaryOp::Log2 => v.log2(),
        UnaryOp::Sin => v.sin(),
        UnaryOp::Cos => v.cos(),
        UnaryOp::Tan => v.tan(),
        UnaryOp::Asin => v.asin(),
        UnaryOp::Acos => v.acos(),
        UnaryOp::Atan => v.atan(),
        UnaryOp::Floor => v.floor(),
        UnaryOp::Ceil => v.ceil(),
        UnaryOp::Trunc => v.trunc(),
        // sign(0) is 0, unlike f64::signum
        UnaryOp::Sign => {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                v
            }
        }
        UnaryOp::Fract => v - v.floor(),
    }
}

pub fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Min => a.min(b),
        BinaryOp::Max => a.max(b),
        BinaryOp::Atan2 => a.atan2(b),
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Le => flag(a <= b),
        BinaryOp::Gt => flag(a > b),
        BinaryOp::Ge => flag(a >= b),
        BinaryOp::Eq => flag(a == b),
        BinaryOp::Ne => flag(a != b),
        BinaryOp::And => flag(truthy(a) && truthy(b)),
        BinaryOp::Or => flag(truthy(a) || truthy(b)),
    }
}

/// Runs a whole kernel on the host.
pub struct CpuExecutor<'k> {
    body: &'k KernelBody,
    types: &'k [ValueType],
    functions: &'k FunctionSnapshot,
}

impl<'k> CpuExecutor<'k> {
    pub fn new(body: &'k KernelBody, types: &'k [ValueType], functions: &'k FunctionSnapshot) -> Self {
        CpuExecutor {
            body,
            types,
            functions,
        }
    }

    /// Evaluate every element of `dims`, returning an `f32` array shaped
    /// `[z][y][x]` (unused axes dropped).
    pub fn run(&self, dims: &Dimensions, args: &[Arg]) -> Result<NdArray> {
        let values = bind_args(self.types, args)?;
        let xyz = dims.xyz();
        let total = dims.total();
        let mut out = Vec::with_capacity(total);
        for id in 0..total {
            let ctx = ExecutionContext::for_linear(id, xyz);
            let v = Interpreter::new(self.functions, ctx).evaluate(self.body, &values)?;
            out.push(v as f32);
        }
        log::trace!("cpu executor evaluated {} element(s)", total);
        NdArray::new(dims.output_shape(), ArrayData::F32(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::functions::FunctionRegistry;
    use crate::kernel_ir::Axis;

    fn snapshot_for(registry: &FunctionRegistry, body: &KernelBody) -> FunctionSnapshot {
        registry.snapshot(&body.calls())
    }

    fn run(body: &KernelBody, dims: &[u32], args: &[Arg]) -> Result<NdArray> {
        let registry = FunctionRegistry::new();
        let snapshot = snapshot_for(&registry, body);
        let types = body.inferred_types();
        CpuExecutor::new(body, &types, &snapshot).run(&Dimensions::new(dims)?, args)
    }

    fn f32s(a: &NdArray) -> Vec<f32> {
        a.to_f32_vec()
    }

    #[test]
    fn test_doubles_each_element() {
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(a.at([x]) * 2.0);
        });
        let out = run(&body, &[4], &[vec![1.0f32, 2.0, 3.0, 4.0].into()]).unwrap();
        assert_eq!(out.shape(), &[4]);
        assert_eq!(f32s(&out), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_two_dimensional_output_is_row_major() {
        let body = KernelBody::build(|k| {
            let x = k.thread_x();
            let y = k.thread_y();
            k.ret(y * 10.0 + x);
        });
        let out = run(&body, &[3, 2], &[]).unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(f32s(&out), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_matrix_multiply_with_loop() {
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let b = k.param("b");
            let x = k.thread_x();
            let y = k.thread_y();
            let sum = k.var(0.0);
            k.for_range(0.0, 2.0, |k, i| {
                k.assign(sum, sum + a.at([y.clone(), i.clone()]) * b.at([i, x.clone()]));
            });
            k.ret(sum);
        });
        let a = NdArray::from_rows(&[vec![1.0f32, 2.0], vec![3.0, 4.0]]).unwrap();
        let b = NdArray::from_rows(&[vec![5.0f32, 6.0], vec![7.0, 8.0]]).unwrap();
        let out = run(&body, &[2, 2], &[a.into(), b.into()]).unwrap();
        assert_eq!(f32s(&out), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_out_of_range_reads_are_zero() {
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(a.at([x - 1.0]));
        });
        let out = run(&body, &[3], &[vec![5.0f32, 6.0, 7.0].into()]).unwrap();
        assert_eq!(f32s(&out), vec![0.0, 5.0, 6.0]);
    }

    #[test]
    fn test_fractional_indices_are_floored() {
        let view_data = NdArray::from_vec(vec![1.0f32, 2.0, 3.0]);
        let view = ArrayView::from_array(&view_data);
        assert_eq!(view.load(&[1.9]), 2.0);
        assert_eq!(view.load(&[-0.5]), 0.0);
        assert_eq!(view.load(&[3.0]), 0.0);
    }

    #[test]
    fn test_single_index_addresses_innermost_axis() {
        let m = NdArray::from_rows(&[vec![1.0f32, 2.0], vec![3.0, 4.0]]).unwrap();
        let view = ArrayView::from_array(&m);
        assert_eq!(view.load(&[1.0]), 2.0);
        assert_eq!(view.load(&[1.0, 0.0]), 3.0);
    }

    #[test]
    fn test_int_params_truncate() {
        let body = KernelBody::build(|k| {
            let n = k.int("n");
            k.ret(n * 1.0);
        });
        let out = run(&body, &[1], &[Arg::Scalar(-2.7)]).unwrap();
        assert_eq!(f32s(&out), vec![-2.0]);
    }

    #[test]
    fn test_sign_and_fract_follow_shader_semantics() {
        assert_eq!(apply_unary(UnaryOp::Sign, 0.0), 0.0);
        assert_eq!(apply_unary(UnaryOp::Sign, -3.0), -1.0);
        assert_eq!(apply_unary(UnaryOp::Fract, -0.25), 0.75);
        assert_eq!(apply_binary(BinaryOp::Rem, -7.0, 3.0), -1.0);
        assert_eq!(apply_binary(BinaryOp::And, 2.0, 0.0), 0.0);
    }

    #[test]
    fn test_polyfill_and_native_calls() {
        let registry = FunctionRegistry::new();
        registry
            .add_function("triple", FunctionBody::native(1, |a| a[0] * 3.0), None, None)
            .unwrap();
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(Expr::call("round", vec![a.at([x.clone()])]) + Expr::call("triple", vec![x]));
        });
        let snapshot = snapshot_for(&registry, &body);
        let types = body.inferred_types();
        let out = CpuExecutor::new(&body, &types, &snapshot)
            .run(&Dimensions::new(&[3]).unwrap(), &[vec![0.5f32, 1.4, -2.5].into()])
            .unwrap();
        assert_eq!(f32s(&out), vec![1.0, 4.0, 4.0]);
    }

    #[test]
    fn test_array_passed_to_helper() {
        let registry = FunctionRegistry::new();
        let first = KernelBody::build(|k| {
            let v = k.array("v");
            k.ret(v.at([0.0]));
        });
        registry
            .add_function("first", first, Some(vec![ValueType::FloatArray]), None)
            .unwrap();
        let body = KernelBody::build(|k| {
            let a = k.array("a");
            k.ret(Expr::call("first", vec![a.value()]));
        });
        let snapshot = snapshot_for(&registry, &body);
        let types = body.inferred_types();
        let out = CpuExecutor::new(&body, &types, &snapshot)
            .run(&Dimensions::new(&[2]).unwrap(), &[vec![9.0f32, 1.0].into()])
            .unwrap();
        assert_eq!(f32s(&out), vec![9.0, 9.0]);
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let registry = FunctionRegistry::new();
        let forever = KernelBody::build(|k| {
            let x = k.float("x");
            k.ret(Expr::call("forever", vec![x.value()]));
        });
        registry.add_function("forever", forever, None, None).unwrap();
        let body = KernelBody::build(|k| {
            k.ret(Expr::call("forever", vec![Expr::Const(1.0)]));
        });
        let snapshot = snapshot_for(&registry, &body);
        let err = CpuExecutor::new(&body, &[], &snapshot)
            .run(&Dimensions::new(&[1]).unwrap(), &[])
            .unwrap_err();
        assert_eq!(err, KernelError::Interpreter(InterpreterError::StackOverflow));
    }

    #[test]
    fn test_unknown_function_is_reported() {
        let body = KernelBody::build(|k| {
            k.ret(Expr::call("nowhere", vec![]));
        });
        let err = run(&body, &[1], &[]).unwrap_err();
        assert_eq!(
            err,
            KernelError::Interpreter(InterpreterError::UnknownFunction("nowhere".into()))
        );
    }

    #[test]
    fn test_dimension_reads() {
        let body = KernelBody::build(|k| {
            let d = k.dim(Axis::X);
            k.ret(d);
        });
        let out = run(&body, &[5], &[]).unwrap();
        assert!(f32s(&out).iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_context_for_linear() {
        let ctx = ExecutionContext::for_linear(7, [3, 2, 2]);
        assert_eq!(ctx.thread(Axis::X), 1);
        assert_eq!(ctx.thread(Axis::Y), 0);
        assert_eq!(ctx.thread(Axis::Z), 1);
    }
}
