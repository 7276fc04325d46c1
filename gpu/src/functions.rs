//! Function registry: helper functions kernels may call by name.
//!
//! Definitions are immutable once registered; re-registering a name swaps in
//! a new `Arc<FunctionDefinition>` with a fresh generation number, which
//! changes the signature of every kernel that reaches it. Built-in polyfills
//! for math the shader target lacks are registered at construction under
//! reserved names.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{KernelError, Result};
use crate::kernel_ir::{Expr, KernelBody, ValueType};

/// Host-native helper body, invocable by the CPU executor only.
pub type NativeFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

#[derive(Clone)]
pub enum FunctionBody {
    Ir(Arc<KernelBody>),
    Native { arity: usize, f: NativeFn },
}

impl FunctionBody {
    pub fn native(arity: usize, f: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        FunctionBody::Native {
            arity,
            f: Arc::new(f),
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            FunctionBody::Ir(body) => body.params().len(),
            FunctionBody::Native { arity, .. } => *arity,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, FunctionBody::Native { .. })
    }

    fn default_types(&self) -> Vec<ValueType> {
        match self {
            FunctionBody::Ir(body) => body.declared_types(),
            FunctionBody::Native { arity, .. } => vec![ValueType::Float; *arity],
        }
    }
}

impl From<KernelBody> for FunctionBody {
    fn from(body: KernelBody) -> Self {
        FunctionBody::Ir(Arc::new(body))
    }
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Ir(body) => f.debug_tuple("Ir").field(body).finish(),
            FunctionBody::Native { arity, .. } => {
                f.debug_struct("Native").field("arity", arity).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDefinition {
    name: String,
    param_types: Vec<ValueType>,
    return_type: ValueType,
    body: FunctionBody,
    generation: u64,
    builtin: bool,
}

impl FunctionDefinition {
    /// Parameter types default to the body's declarations (untyped
    /// parameters are `Float`) and the return type defaults to `Float`.
    pub fn new(name: impl Into<String>, body: impl Into<FunctionBody>) -> Self {
        let body = body.into();
        FunctionDefinition {
            name: name.into(),
            param_types: body.default_types(),
            return_type: ValueType::Float,
            body,
            generation: 0,
            builtin: false,
        }
    }

    pub fn with_param_types(mut self, types: Vec<ValueType>) -> Self {
        self.param_types = types;
        self
    }

    pub fn with_return_type(mut self, ty: ValueType) -> Self {
        self.return_type = ty;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_types(&self) -> &[ValueType] {
        &self.param_types
    }

    pub fn return_type(&self) -> ValueType {
        self.return_type
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    /// Registration stamp; changes whenever the name is re-registered.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(KernelError::invalid(format!(
                "'{}' is not a valid function name",
                self.name
            )));
        }
        if self.return_type.is_array() {
            return Err(KernelError::invalid(format!(
                "function '{}' cannot return an array",
                self.name
            )));
        }
        if self.param_types.len() != self.body.arity() {
            return Err(KernelError::invalid(format!(
                "function '{}' declares {} parameter type(s) for {} parameter(s)",
                self.name,
                self.param_types.len(),
                self.body.arity()
            )));
        }
        match &self.body {
            FunctionBody::Ir(body) => body.validate(&self.param_types),
            FunctionBody::Native { .. } if self.param_types.iter().any(|t| t.is_array()) => {
                Err(KernelError::invalid(format!(
                    "native function '{}' only takes scalar parameters",
                    self.name
                )))
            }
            FunctionBody::Native { .. } => Ok(()),
        }
    }

    fn same_signature(&self, other: &FunctionDefinition) -> bool {
        self.param_types == other.param_types && self.return_type == other.return_type
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    Replaced,
}

/// The definitions a body reaches, resolved under a single read lock.
#[derive(Debug, Clone, Default)]
pub struct FunctionSnapshot {
    functions: BTreeMap<String, Arc<FunctionDefinition>>,
    missing: BTreeSet<String>,
}

impl FunctionSnapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<FunctionDefinition>> {
        self.functions.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FunctionDefinition>> {
        self.functions.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    /// Called names with no registered definition.
    pub fn missing(&self) -> &BTreeSet<String> {
        &self.missing
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Hash of (name, generation) pairs; part of a kernel's signature.
    pub fn fingerprint(&self, hasher: &mut impl Hasher) {
        self.functions.len().hash(hasher);
        for (name, def) in &self.functions {
            name.hash(hasher);
            def.generation.hash(hasher);
        }
        self.missing.hash(hasher);
    }
}

struct RegistryState {
    functions: HashMap<String, Arc<FunctionDefinition>>,
    next_generation: u64,
}

/// Shared, thread-safe store of helper functions.
pub struct FunctionRegistry {
    state: RwLock<RegistryState>,
    strict: bool,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .field("strict", &self.strict)
            .finish()
    }
}

impl FunctionRegistry {
    /// Registry holding only the built-in polyfills.
    pub fn new() -> Self {
        let registry = FunctionRegistry {
            state: RwLock::new(RegistryState {
                functions: HashMap::new(),
                next_generation: 1,
            }),
            strict: false,
        };
        registry.install_polyfills();
        registry
    }

    /// Registry that refuses redefinitions changing a function's types.
    pub fn strict() -> Self {
        FunctionRegistry {
            strict: true,
            ..Self::new()
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Register `body` under `name`. Omitted types default to `Float`.
    pub fn add_function(
        &self,
        name: &str,
        body: impl Into<FunctionBody>,
        param_types: Option<Vec<ValueType>>,
        return_type: Option<ValueType>,
    ) -> Result<Registration> {
        let mut def = FunctionDefinition::new(name, body);
        if let Some(types) = param_types {
            def = def.with_param_types(types);
        }
        if let Some(ty) = return_type {
            def = def.with_return_type(ty);
        }
        self.register(def)
    }

    pub fn register(&self, mut def: FunctionDefinition) -> Result<Registration> {
        def.validate()?;
        let mut state = self.state.write();
        if let Some(existing) = state.functions.get(&def.name) {
            if existing.builtin {
                return Err(KernelError::invalid(format!(
                    "'{}' is a reserved built-in function",
                    def.name
                )));
            }
            if self.strict && !existing.same_signature(&def) {
                return Err(KernelError::FunctionRedefinitionConflict {
                    name: def.name.clone(),
                    detail: format!(
                        "{} -> {} vs {} -> {}",
                        describe_types(&existing.param_types),
                        existing.return_type.name(),
                        describe_types(&def.param_types),
                        def.return_type.name()
                    ),
                });
            }
        }
        def.generation = state.next_generation;
        state.next_generation += 1;
        let name = def.name.clone();
        let outcome = match state.functions.insert(name.clone(), Arc::new(def)) {
            Some(_) => Registration::Replaced,
            None => Registration::Added,
        };
        log::debug!("registered function '{}' ({:?})", name, outcome);
        Ok(outcome)
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionDefinition>> {
        self.state.read().functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().functions.contains_key(name)
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.state
            .read()
            .functions
            .get(name)
            .is_some_and(|d| d.builtin)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state.read().functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transitive closure of `roots` through IR bodies.
    pub fn snapshot(&self, roots: &BTreeSet<String>) -> FunctionSnapshot {
        let state = self.state.read();
        let mut snapshot = FunctionSnapshot::default();
        let mut pending: Vec<String> = roots.iter().cloned().collect();
        while let Some(name) = pending.pop() {
            if snapshot.functions.contains_key(&name) || snapshot.missing.contains(&name) {
                continue;
            }
            match state.functions.get(&name) {
                Some(def) => {
                    if let FunctionBody::Ir(body) = &def.body {
                        pending.extend(body.calls());
                    }
                    snapshot.functions.insert(name, def.clone());
                }
                None => {
                    snapshot.missing.insert(name);
                }
            }
        }
        snapshot
    }

    fn install_polyfills(&self) {
        let mut state = self.state.write();
        for (name, body) in polyfills() {
            let mut def = FunctionDefinition::new(name, body);
            def.builtin = true;
            def.generation = state.next_generation;
            state.next_generation += 1;
            state.functions.insert(name.to_string(), Arc::new(def));
        }
    }
}

fn describe_types(types: &[ValueType]) -> String {
    let names: Vec<_> = types.iter().map(|t| t.name()).collect();
    format!("({})", names.join(", "))
}

fn unary_polyfill(f: impl FnOnce(Expr) -> Expr) -> KernelBody {
    KernelBody::build(|k| {
        let x = k.float("x");
        k.ret(f(x.value()));
    })
}

/// Math the WGSL target has no builtin for. `round` rounds halves up,
/// unlike WGSL's round-half-to-even.
fn polyfills() -> Vec<(&'static str, KernelBody)> {
    vec![
        ("round", unary_polyfill(|x| (x + 0.5).floor())),
        ("log10", unary_polyfill(|x| x.ln() / std::f64::consts::LN_10)),
        ("log1p", unary_polyfill(|x| (1.0 + x).ln())),
        ("expm1", unary_polyfill(|x| x.exp() - 1.0)),
        (
            "cbrt",
            unary_polyfill(|x| x.clone().sign() * x.abs().pow(1.0 / 3.0)),
        ),
        ("clamp01", unary_polyfill(|x| x.max(0.0).min(1.0))),
        (
            "hypot",
            KernelBody::build(|k| {
                let x = k.float("x");
                let y = k.float("y");
                k.ret((x * x + y * y).sqrt());
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> KernelBody {
        KernelBody::build(|k| {
            let v = k.param("v");
            k.ret(v * v);
        })
    }

    #[test]
    fn test_polyfills_are_preregistered_and_reserved() {
        let registry = FunctionRegistry::new();
        for name in ["round", "log10", "log1p", "expm1", "cbrt", "hypot", "clamp01"] {
            assert!(registry.is_reserved(name), "{name} should be reserved");
        }
        let err = registry
            .add_function("round", square(), None, None)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument(_)));
    }

    #[test]
    fn test_omitted_types_default_to_float() {
        let registry = FunctionRegistry::new();
        registry.add_function("square", square(), None, None).unwrap();
        let def = registry.get("square").unwrap();
        assert_eq!(def.param_types(), &[ValueType::Float]);
        assert_eq!(def.return_type(), ValueType::Float);
    }

    #[test]
    fn test_reregistration_replaces_and_bumps_generation() {
        let registry = FunctionRegistry::new();
        assert_eq!(
            registry.add_function("square", square(), None, None).unwrap(),
            Registration::Added
        );
        let first = registry.get("square").unwrap().generation();
        assert_eq!(
            registry.add_function("square", square(), None, None).unwrap(),
            Registration::Replaced
        );
        assert!(registry.get("square").unwrap().generation() > first);
    }

    #[test]
    fn test_strict_registry_rejects_signature_change() {
        let registry = FunctionRegistry::strict();
        registry.add_function("square", square(), None, None).unwrap();
        registry
            .add_function("square", square(), None, Some(ValueType::Float))
            .unwrap();
        let err = registry
            .add_function("square", square(), Some(vec![ValueType::Int]), None)
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::FunctionRedefinitionConflict { .. }
        ));
    }

    #[test]
    fn test_invalid_definitions_are_rejected() {
        let registry = FunctionRegistry::new();
        assert!(registry.add_function("1bad", square(), None, None).is_err());
        assert!(registry
            .add_function("square", square(), Some(vec![]), None)
            .is_err());
        assert!(registry
            .add_function("square", square(), None, Some(ValueType::FloatArray))
            .is_err());
        let native = FunctionBody::native(1, |a| a[0]);
        assert!(registry
            .add_function("ident", native, Some(vec![ValueType::FloatArray]), None)
            .is_err());
    }

    #[test]
    fn test_snapshot_follows_calls_and_records_missing() {
        let registry = FunctionRegistry::new();
        let outer = KernelBody::build(|k| {
            let v = k.param("v");
            k.ret(Expr::call("square", vec![v.value()]) + Expr::call("ghost", vec![]));
        });
        registry.add_function("square", square(), None, None).unwrap();
        registry.add_function("outer", outer, None, None).unwrap();

        let roots: BTreeSet<String> = ["outer".to_string()].into_iter().collect();
        let snapshot = registry.snapshot(&roots);
        assert_eq!(snapshot.names(), vec!["outer".to_string(), "square".to_string()]);
        assert!(snapshot.missing().contains("ghost"));
    }

    #[test]
    fn test_fingerprint_changes_on_replacement() {
        let registry = FunctionRegistry::new();
        registry.add_function("square", square(), None, None).unwrap();
        let roots: BTreeSet<String> = ["square".to_string()].into_iter().collect();

        let fingerprint = |s: &FunctionSnapshot| {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            s.fingerprint(&mut h);
            h.finish()
        };
        let before = fingerprint(&registry.snapshot(&roots));
        registry.add_function("square", square(), None, None).unwrap();
        assert_ne!(before, fingerprint(&registry.snapshot(&roots)));
    }
}
