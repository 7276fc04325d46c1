//! WebGPU Shading Language (WGSL) code generation.
//!
//! Emits one compute shader per kernel signature. Every value is an `f32`;
//! comparisons become `select(0.0, 1.0, ..)` and conditions test `!= 0.0`.
//! Array reads go through a generated `load_inN` helper that floors the
//! indices and returns `0.0` outside the array. Helper functions are
//! emitted as `fn_<name>` and receive the thread coordinates as their
//! first argument.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::functions::{FunctionBody, FunctionSnapshot};
use crate::interpreter::{apply_binary, apply_unary};
use crate::kernel_ir::{BinaryOp, Expr, KernelBody, Stmt, UnaryOp, ValueType};

use super::{BufferManifest, ProgramSnapshot, ShaderSource, ShaderSynthesizer, SynthesisRequest};

/// Default workgroup size for kernel dispatches.
pub const WORKGROUP_SIZE: u32 = 256;

/// Entry point of every generated shader.
pub const ENTRY_POINT: &str = "main";

/// WGSL back end.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgslSynthesizer;

impl ShaderSynthesizer for WgslSynthesizer {
    fn name(&self) -> &str {
        "wgsl"
    }

    fn synthesize(&self, request: &SynthesisRequest<'_>) -> Result<ShaderSource> {
        check_functions(request.functions)?;
        let manifest =
            BufferManifest::for_kernel(request.param_types, request.dimensions, WORKGROUP_SIZE);
        let text = emit_program(request, &manifest)?;
        log::debug!(
            "synthesized {} line(s) of WGSL for {} helper(s)",
            text.lines().count(),
            request.functions.names().len()
        );
        Ok(ShaderSource {
            text,
            entry_point: ENTRY_POINT.to_string(),
            manifest,
            program: Arc::new(ProgramSnapshot {
                body: Arc::clone(request.body),
                param_types: request.param_types.to_vec(),
                dimensions: request.dimensions.clone(),
                functions: request.functions.clone(),
            }),
        })
    }
}

/// Reject helper sets the device cannot run.
fn check_functions(functions: &FunctionSnapshot) -> Result<()> {
    if !functions.missing().is_empty() {
        let names: Vec<_> = functions.missing().iter().cloned().collect();
        return Err(KernelError::compilation(format!(
            "call to unknown function(s): {}",
            names.join(", ")
        )));
    }
    for def in functions.iter() {
        if def.body().is_native() {
            return Err(KernelError::compilation(format!(
                "function '{}' has a host-native body",
                def.name()
            )));
        }
        if def.param_types().iter().any(|t| t.is_array()) {
            return Err(KernelError::compilation(format!(
                "function '{}' takes an array parameter",
                def.name()
            )));
        }
    }
    let mut marks = HashMap::new();
    for def in functions.iter() {
        visit(def.name(), functions, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn visit(
    name: &str,
    functions: &FunctionSnapshot,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
) -> Result<()> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            path.push(name.to_string());
            return Err(KernelError::compilation(format!(
                "recursive call chain {}",
                path.join(" -> ")
            )));
        }
        None => {}
    }
    marks.insert(name.to_string(), Mark::Visiting);
    path.push(name.to_string());
    if let Some(FunctionBody::Ir(body)) = functions.get(name).map(|d| d.body()) {
        for callee in body.calls() {
            visit(&callee, functions, marks, path)?;
        }
    }
    path.pop();
    marks.insert(name.to_string(), Mark::Done);
    Ok(())
}

fn emit_program(request: &SynthesisRequest<'_>, manifest: &BufferManifest) -> Result<String> {
    let [dim_x, dim_y, dim_z] = request.dimensions.xyz();
    let mut src = String::new();

    for b in manifest.bindings() {
        let access = if b.read_only { "read" } else { "read_write" };
        let elem = if b.name == "shapes" { "u32" } else { "f32" };
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, {access}> {}: array<{elem}>;",
            b.binding, b.name
        );
    }

    let _ = write!(
        src,
        "\nconst DIM_X: u32 = {dim_x}u;\nconst DIM_Y: u32 = {dim_y}u;\nconst DIM_Z: u32 = {dim_z}u;\nconst OUTPUT_LEN: u32 = {}u;\nconst ROW_STRIDE: u32 = {}u;\n",
        manifest.output_len(),
        manifest.row_stride()
    );

    src.push_str("\nfn kf_bits(bits: u32) -> f32 {\n    return bitcast<f32>(bits);\n}\n");

    for slot in 0..manifest.array_params().len() {
        emit_loader(&mut src, slot);
    }

    for def in request.functions.iter() {
        if let FunctionBody::Ir(body) = def.body() {
            let params: String = (0..body.params().len())
                .map(|i| format!(", p{i}: f32"))
                .collect();
            let _ = writeln!(
                src,
                "\nfn fn_{}(thread: vec3<f32>{params}) -> f32 {{",
                def.name()
            );
            let mut emitter = Emitter::new(request.functions, def.param_types(), None);
            emitter.block(body.stmts())?;
            src.push_str(&emitter.out);
            src.push_str("}\n");
        }
    }

    let mut slots = vec![None; request.param_types.len()];
    for (slot, &param) in manifest.array_params().iter().enumerate() {
        slots[param] = Some(slot);
    }
    src.push_str("\nfn kernel_main(thread: vec3<f32>) -> f32 {\n");
    for (word, &param) in manifest.scalar_params().iter().enumerate() {
        let read = format!("scalars[{word}u]");
        let value = match request.param_types[param] {
            ValueType::Int => format!("trunc({read})"),
            _ => read,
        };
        let _ = writeln!(src, "    let p{param} = {value};");
    }
    let mut emitter = Emitter::new(request.functions, request.param_types, Some(&slots));
    emitter.block(request.body.stmts())?;
    src.push_str(&emitter.out);
    src.push_str("}\n");

    let _ = write!(
        src,
        "\n@compute @workgroup_size({WORKGROUP_SIZE})\nfn {ENTRY_POINT}(@builtin(global_invocation_id) gid: vec3<u32>) {{\n"
    );
    src.push_str("    _ = scalars[0];\n    _ = shapes[0];\n");
    for slot in 0..manifest.array_params().len() {
        let _ = writeln!(src, "    _ = in{slot}[0];");
    }
    src.push_str(
        "    let id = gid.x + gid.y * ROW_STRIDE;
    if (id >= OUTPUT_LEN) {
        return;
    }
    let x = id % DIM_X;
    let y = (id / DIM_X) % DIM_Y;
    let z = id / (DIM_X * DIM_Y);
    result[id] = kernel_main(vec3<f32>(f32(x), f32(y), f32(z)));
}
",
    );
    Ok(src)
}

fn emit_loader(src: &mut String, slot: usize) {
    let base = slot * 3;
    let _ = write!(
        src,
        r#"
fn load_in{slot}(iz: f32, iy: f32, ix: f32) -> f32 {{
    let dz = shapes[{base}u];
    let dy = shapes[{}u];
    let dx = shapes[{}u];
    let z = floor(iz);
    let y = floor(iy);
    let x = floor(ix);
    if (!(z >= 0.0 && z < f32(dz) && y >= 0.0 && y < f32(dy) && x >= 0.0 && x < f32(dx))) {{
        return 0.0;
    }}
    return in{slot}[(u32(z) * dy + u32(y)) * dx + u32(x)];
}}
"#,
        base + 1,
        base + 2
    );
}

struct Emitter<'a> {
    functions: &'a FunctionSnapshot,
    types: &'a [ValueType],
    /// Kernel parameter -> input slot. `None` inside helper functions.
    slots: Option<&'a [Option<usize>]>,
    out: String,
    depth: usize,
}

impl<'a> Emitter<'a> {
    fn new(
        functions: &'a FunctionSnapshot,
        types: &'a [ValueType],
        slots: Option<&'a [Option<usize>]>,
    ) -> Self {
        Emitter {
            functions,
            types,
            slots,
            out: String::new(),
            depth: 1,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn nested(&mut self, stmts: &[Stmt]) -> Result<()> {
        self.depth += 1;
        let result = self.block(stmts);
        self.depth -= 1;
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Let { local, value } => {
                let value = self.expr(value)?;
                self.line(&format!("var l{local}: f32 = {value};"));
            }
            Stmt::Assign { local, value } => {
                let value = self.expr(value)?;
                self.line(&format!("l{local} = {value};"));
            }
            Stmt::For {
                counter,
                start,
                end,
                body,
            } => {
                let start = self.expr(start)?;
                let end = self.expr(end)?;
                self.line(&format!(
                    "for (var l{counter}: f32 = {start}; l{counter} < {end}; l{counter} = l{counter} + 1.0) {{"
                ));
                self.nested(body)?;
                self.line("}");
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr(cond)?;
                self.line(&format!("if ({cond} != 0.0) {{"));
                self.nested(then)?;
                if !otherwise.is_empty() {
                    self.line("} else {");
                    self.nested(otherwise)?;
                }
                self.line("}");
            }
            Stmt::Return(value) => {
                let value = self.expr(value)?;
                self.line(&format!("return {value};"));
            }
        }
        Ok(())
    }

    fn is_array_param(&self, index: usize) -> bool {
        self.types.get(index).is_some_and(|t| t.is_array())
    }

    fn expr(&self, expr: &Expr) -> Result<String> {
        if let Some(v) = fold(expr) {
            return Ok(literal(v));
        }
        Ok(match expr {
            Expr::Const(v) => literal(*v),
            Expr::Param(i) => {
                if self.is_array_param(*i) {
                    return Err(KernelError::compilation(format!(
                        "array parameter {i} cannot be used as a value on the device"
                    )));
                }
                format!("p{i}")
            }
            Expr::Local(i) => format!("l{i}"),
            Expr::Thread(axis) => format!("thread.{}", axis.name()),
            Expr::Dim(axis) => format!("f32(DIM_{})", axis.name().to_ascii_uppercase()),
            Expr::Index { param, indices } => {
                let slot = self
                    .slots
                    .and_then(|s| s.get(*param).copied().flatten())
                    .ok_or_else(|| {
                        KernelError::compilation(format!("parameter {param} is not a bound array"))
                    })?;
                let mut args = vec!["0.0".to_string(); 3usize.saturating_sub(indices.len())];
                for index in indices {
                    args.push(self.expr(index)?);
                }
                format!("load_in{slot}({})", args.join(", "))
            }
            Expr::Unary(op, input) => unary(*op, &self.expr(input)?),
            Expr::Binary(op, lhs, rhs) => binary(*op, &self.expr(lhs)?, &self.expr(rhs)?),
            Expr::Select {
                cond,
                then,
                otherwise,
            } => format!(
                "select({}, {}, {} != 0.0)",
                self.expr(otherwise)?,
                self.expr(then)?,
                self.expr(cond)?
            ),
            Expr::Call { name, args } => self.call(name, args)?,
        })
    }

    fn call(&self, name: &str, args: &[Expr]) -> Result<String> {
        let def = self
            .functions
            .get(name)
            .ok_or_else(|| KernelError::compilation(format!("call to unknown function '{name}'")))?;
        if def.param_types().len() != args.len() {
            return Err(KernelError::compilation(format!(
                "'{name}' takes {} argument(s), {} given",
                def.param_types().len(),
                args.len()
            )));
        }
        let mut text = format!("fn_{name}(thread");
        for (ty, arg) in def.param_types().iter().zip(args) {
            let value = self.expr(arg)?;
            text.push_str(", ");
            if *ty == ValueType::Int {
                let _ = write!(text, "trunc({value})");
            } else {
                text.push_str(&value);
            }
        }
        text.push(')');
        Ok(match def.return_type() {
            ValueType::Int => format!("trunc({text})"),
            _ => text,
        })
    }
}

/// Value of a constant subtree. Folding on the host keeps the device from
/// rejecting constant expressions that overflow or divide by zero.
fn fold(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Const(v) => Some(*v),
        Expr::Unary(op, input) => Some(apply_unary(*op, fold(input)?)),
        Expr::Binary(op, lhs, rhs) => Some(apply_binary(*op, fold(lhs)?, fold(rhs)?)),
        Expr::Select {
            cond,
            then,
            otherwise,
        } => {
            let (c, t, o) = (fold(cond)?, fold(then)?, fold(otherwise)?);
            Some(if c != 0.0 { t } else { o })
        }
        _ => None,
    }
}

fn literal(v: f64) -> String {
    let v = v as f32;
    if !v.is_finite() {
        return format!("kf_bits({:#010x}u)", v.to_bits());
    }
    let text = format!("{v:?}");
    if text.starts_with('-') {
        format!("({text})")
    } else {
        text
    }
}

fn unary(op: UnaryOp, x: &str) -> String {
    match op {
        UnaryOp::Neg => format!("(-{x})"),
        UnaryOp::Not => format!("select(0.0, 1.0, {x} == 0.0)"),
        UnaryOp::Log => format!("log({x})"),
        other => format!("{}({x})", other.name()),
    }
}

fn binary(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("({a} + {b})"),
        BinaryOp::Sub => format!("({a} - {b})"),
        BinaryOp::Mul => format!("({a} * {b})"),
        BinaryOp::Div => format!("({a} / {b})"),
        BinaryOp::Rem => format!("({a} % {b})"),
        BinaryOp::Pow => format!("pow({a}, {b})"),
        BinaryOp::Min => format!("min({a}, {b})"),
        BinaryOp::Max => format!("max({a}, {b})"),
        BinaryOp::Atan2 => format!("atan2({a}, {b})"),
        BinaryOp::Lt => format!("select(0.0, 1.0, {a} < {b})"),
        BinaryOp::Le => format!("select(0.0, 1.0, {a} <= {b})"),
        BinaryOp::Gt => format!("select(0.0, 1.0, {a} > {b})"),
        BinaryOp::Ge => format!("select(0.0, 1.0, {a} >= {b})"),
        BinaryOp::Eq => format!("select(0.0, 1.0, {a} == {b})"),
        BinaryOp::Ne => format!("select(0.0, 1.0, {a} != {b})"),
        BinaryOp::And => format!("select(0.0, 1.0, ({a} != 0.0) && ({b} != 0.0))"),
        BinaryOp::Or => format!("select(0.0, 1.0, ({a} != 0.0) || ({b} != 0.0))"),
    }
}

/// Convenience for callers holding a bare body.
pub fn synthesize_body(
    body: &Arc<KernelBody>,
    dimensions: &crate::config::Dimensions,
    functions: &FunctionSnapshot,
) -> Result<ShaderSource> {
    let types = body.inferred_types();
    WgslSynthesizer.synthesize(&SynthesisRequest {
        body,
        param_types: &types,
        dimensions,
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dimensions;
    use crate::functions::FunctionRegistry;

    fn synth(registry: &FunctionRegistry, body: KernelBody, dims: &[u32]) -> Result<ShaderSource> {
        let body = Arc::new(body);
        let snapshot = registry.snapshot(&body.calls());
        synthesize_body(&body, &Dimensions::new(dims).unwrap(), &snapshot)
    }

    fn doubled() -> KernelBody {
        KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(a.at([x]) * 2.0);
        })
    }

    #[test]
    fn test_elementwise_kernel_layout() {
        let src = synth(&FunctionRegistry::new(), doubled(), &[4]).unwrap();
        let text = &src.text;
        assert!(text.contains("@group(0) @binding(0) var<storage, read> scalars: array<f32>;"));
        assert!(text.contains("@group(0) @binding(1) var<storage, read> shapes: array<u32>;"));
        assert!(text.contains("@group(0) @binding(2) var<storage, read> in0: array<f32>;"));
        assert!(text.contains("@group(0) @binding(3) var<storage, read_write> result: array<f32>;"));
        assert!(text.contains("const DIM_X: u32 = 4u;"));
        assert!(text.contains("@compute @workgroup_size(256)"));
        assert!(text.contains("fn main(@builtin(global_invocation_id) gid: vec3<u32>)"));
        assert!(text.contains("return (load_in0(0.0, 0.0, thread.x) * 2.0);"));
        assert_eq!(src.entry_point, "main");
        assert_eq!(src.manifest.array_params(), &[0]);
    }

    #[test]
    fn test_scalar_params_read_from_scalar_buffer() {
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let s = k.float("s");
            let n = k.int("n");
            let x = k.thread_x();
            k.ret(a.at([x]) * s + n);
        });
        let src = synth(&FunctionRegistry::new(), body, &[8]).unwrap();
        assert!(src.text.contains("let p1 = scalars[0u];"));
        assert!(src.text.contains("let p2 = trunc(scalars[1u]);"));
    }

    #[test]
    fn test_control_flow_and_comparisons() {
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let acc = k.var(0.0);
            k.for_range(0.0, 4.0, |k, i| {
                k.assign(acc, acc + a.at([i]));
            });
            let x = k.thread_x();
            k.if_else(x.lt(2.0), |k| k.ret(acc), |k| k.ret(-acc));
        });
        let text = synth(&FunctionRegistry::new(), body, &[4]).unwrap().text;
        assert!(text.contains("var l0: f32 = 0.0;"));
        assert!(text.contains("for (var l1: f32 = 0.0; l1 < 4.0; l1 = l1 + 1.0) {"));
        assert!(text.contains("if (select(0.0, 1.0, thread.x < 2.0) != 0.0) {"));
        assert!(text.contains("} else {"));
        assert!(text.contains("return (-l0);"));
    }

    #[test]
    fn test_helpers_are_emitted() {
        let registry = FunctionRegistry::new();
        let body = KernelBody::build(|k| {
            let a = k.param("a");
            let x = k.thread_x();
            k.ret(Expr::call("round", vec![a.at([x])]));
        });
        let text = synth(&registry, body, &[4]).unwrap().text;
        assert!(text.contains("fn fn_round(thread: vec3<f32>, p0: f32) -> f32 {"));
        assert!(text.contains("return floor((p0 + 0.5));"));
        assert!(text.contains("return fn_round(thread, load_in0(0.0, 0.0, thread.x));"));
    }

    #[test]
    fn test_int_helper_params_truncate() {
        let registry = FunctionRegistry::new();
        let half = KernelBody::build(|k| {
            let n = k.param("n");
            k.ret(n / 2.0);
        });
        registry
            .add_function("half", half, Some(vec![ValueType::Int]), Some(ValueType::Int))
            .unwrap();
        let body = KernelBody::build(|k| {
            let x = k.thread_x();
            k.ret(Expr::call("half", vec![x]));
        });
        let text = synth(&registry, body, &[4]).unwrap().text;
        assert!(text.contains("trunc(fn_half(thread, trunc(thread.x)))"));
    }

    #[test]
    fn test_native_helpers_cannot_be_synthesized() {
        let registry = FunctionRegistry::new();
        registry
            .add_function("twice", FunctionBody::native(1, |a| a[0] * 2.0), None, None)
            .unwrap();
        let body = KernelBody::build(|k| {
            let x = k.thread_x();
            k.ret(Expr::call("twice", vec![x]));
        });
        let err = synth(&registry, body, &[4]).unwrap_err();
        assert!(matches!(err, KernelError::CompilationFailed(_)));
    }

    #[test]
    fn test_recursion_is_rejected() {
        let registry = FunctionRegistry::new();
        let ping = KernelBody::build(|k| {
            let v = k.param("v");
            k.ret(Expr::call("pong", vec![v.value()]));
        });
        let pong = KernelBody::build(|k| {
            let v = k.param("v");
            k.ret(Expr::call("ping", vec![v.value()]));
        });
        registry.add_function("ping", ping, None, None).unwrap();
        registry.add_function("pong", pong, None, None).unwrap();
        let body = KernelBody::build(|k| {
            let x = k.thread_x();
            k.ret(Expr::call("ping", vec![x]));
        });
        let err = synth(&registry, body, &[4]).unwrap_err();
        assert!(err.to_string().contains("recursive"));
    }

    #[test]
    fn test_unknown_function_fails_compilation() {
        let body = KernelBody::build(|k| {
            k.ret(Expr::call("mystery", vec![]));
        });
        let err = synth(&FunctionRegistry::new(), body, &[1]).unwrap_err();
        assert!(matches!(err, KernelError::CompilationFailed(_)));
    }

    #[test]
    fn test_constant_subtrees_are_folded() {
        let body = KernelBody::build(|k| {
            let x = k.thread_x();
            k.ret(x + Expr::Const(1.0) / Expr::Const(0.0));
        });
        let text = synth(&FunctionRegistry::new(), body, &[2]).unwrap().text;
        assert!(text.contains("(thread.x + kf_bits(0x7f800000u))"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(2.0), "2.0");
        assert_eq!(literal(-0.5), "(-0.5)");
        assert_eq!(literal(f64::NEG_INFINITY), "kf_bits(0xff800000u)");
    }

    #[test]
    fn test_snapshot_travels_with_source() {
        let src = synth(&FunctionRegistry::new(), doubled(), &[3, 2]).unwrap();
        assert_eq!(src.program.dimensions.axes(), &[3, 2]);
        assert_eq!(src.program.param_types, vec![ValueType::FloatArray]);
        assert!(src.text.contains("const DIM_Y: u32 = 2u;"));
    }
}
