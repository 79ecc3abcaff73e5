//! The symbolic tensor objects of a model.
//!
//! [`TensorSet`] owns the model, one component cache per tensor and the
//! dependency graph between tensors. Tensors are a closed set ([`TensorId`])
//! plus the model's derived declarations. Components are computed lazily and
//! cached; invalidating a tensor clears it and every tensor built on it in
//! topological order, bumping each cache's generation counter.

mod formulas;
mod lambda;
mod resources;

pub use lambda::{LambdaBlock, LambdaBody, TensorLambda};

use crate::error::ConfigurationError;
use crate::index::{AbstractIndex, Classification};
use crate::model::Model;
use crate::settings::TranslatorSettings;
use crate::storage::{offset_of, FlattenedTensor};
use crate::symbolic::{Ast, Expr, IndexSlot};
use crate::traits::TensorConcept;
use formulas::Arg;
use log::debug;
use resources::{ConcreteResources, LambdaResources};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorId {
    Connexion,
    Dv,
    Ddv,
    Dddv,
    SrVelocity,
    Mass,
    U1,
    U2,
    U3,
    A,
    B,
    C,
    Zeta1,
    Zeta2,
    /// Position in the model's derived declarations.
    Derived(usize),
}

impl TensorId {
    pub const BUILTIN: [TensorId; 14] = [
        TensorId::Connexion,
        TensorId::Dv,
        TensorId::Ddv,
        TensorId::Dddv,
        TensorId::SrVelocity,
        TensorId::Mass,
        TensorId::U1,
        TensorId::U2,
        TensorId::U3,
        TensorId::A,
        TensorId::B,
        TensorId::C,
        TensorId::Zeta1,
        TensorId::Zeta2,
    ];

    /// Name used by derived formulas to call this tensor.
    pub fn call_name(&self) -> Option<&'static str> {
        Some(match self {
            TensorId::Connexion => "Gamma",
            TensorId::Dv => "dV",
            TensorId::Ddv => "ddV",
            TensorId::Dddv => "dddV",
            TensorId::SrVelocity => "sr",
            TensorId::Mass => "M",
            TensorId::U1 => "u1",
            TensorId::U2 => "u2",
            TensorId::U3 => "u3",
            TensorId::A => "A",
            TensorId::B => "B",
            TensorId::C => "C",
            TensorId::Zeta1 => "zeta1",
            TensorId::Zeta2 => "zeta2",
            TensorId::Derived(_) => return None,
        })
    }

    pub fn from_call_name(name: &str) -> Option<TensorId> {
        TensorId::BUILTIN
            .iter()
            .copied()
            .find(|id| id.call_name() == Some(name))
    }

    /// Stem of the runtime array holding this tensor in lambda templates.
    fn array_stem(&self) -> Option<&'static str> {
        Some(match self {
            TensorId::Connexion => "Gamma",
            TensorId::Dv => "dV",
            TensorId::Ddv => "ddV",
            TensorId::Dddv => "dddV",
            TensorId::SrVelocity => "sr",
            TensorId::Mass => "mass",
            TensorId::U1 => "u1",
            TensorId::U2 => "u2",
            TensorId::U3 => "u3",
            TensorId::A => "A_tensor",
            TensorId::B => "B_tensor",
            TensorId::C => "C_tensor",
            TensorId::Zeta1 => "zeta1",
            TensorId::Zeta2 => "zeta2",
            TensorId::Derived(_) => return None,
        })
    }

    /// Index classifications of a built-in tensor (empty for derived ones).
    pub fn builtin_signature(&self) -> &'static [Classification] {
        use Classification::{FieldOnly as F, Full};
        match self {
            TensorId::Dv | TensorId::SrVelocity => &[F],
            TensorId::Ddv | TensorId::Mass => &[F, F],
            TensorId::Connexion | TensorId::Dddv | TensorId::A | TensorId::B | TensorId::C => {
                &[F, F, F]
            }
            TensorId::U1 | TensorId::Zeta1 => &[Full],
            TensorId::U2 | TensorId::Zeta2 => &[Full, Full],
            TensorId::U3 => &[Full, Full, Full],
            TensorId::Derived(_) => &[],
        }
    }

    /// Placeholder symbols a tensor directive renames, in argument order.
    pub fn placeholders(&self) -> &'static [&'static str] {
        use crate::model::placeholders::*;
        match self {
            TensorId::Mass | TensorId::U1 | TensorId::Zeta1 | TensorId::Zeta2 => &[HUBBLE_SQ, EPSILON],
            TensorId::U2 => &[K, SCALE_FACTOR, HUBBLE_SQ, EPSILON],
            TensorId::U3 | TensorId::A | TensorId::B | TensorId::C => {
                &[K1, K2, K3, SCALE_FACTOR, HUBBLE_SQ, EPSILON]
            }
            TensorId::Connexion
            | TensorId::Dv
            | TensorId::Ddv
            | TensorId::Dddv
            | TensorId::SrVelocity
            | TensorId::Derived(_) => &[],
        }
    }

    fn builtin_dependencies(&self) -> &'static [TensorId] {
        match self {
            TensorId::Connexion | TensorId::Dv | TensorId::B | TensorId::C => &[],
            TensorId::Zeta1 | TensorId::Zeta2 | TensorId::Derived(_) => &[],
            TensorId::Ddv => &[TensorId::Dv, TensorId::Connexion],
            TensorId::Dddv => &[TensorId::Ddv, TensorId::Connexion],
            TensorId::SrVelocity => &[TensorId::Dv],
            TensorId::Mass => &[TensorId::Ddv, TensorId::Dv],
            TensorId::U1 => &[TensorId::Dv, TensorId::Connexion],
            TensorId::U2 => &[TensorId::Mass, TensorId::Connexion],
            TensorId::U3 => &[TensorId::A, TensorId::B, TensorId::C],
            TensorId::A => &[TensorId::Dddv, TensorId::Ddv],
        }
    }

    /// Leaf tensors differentiate model expressions and have no
    /// index-generic lambda.
    fn is_leaf(&self) -> bool {
        matches!(
            self,
            TensorId::Connexion | TensorId::Dv | TensorId::Ddv | TensorId::Dddv
        )
    }
}

/// Names used when a lambda refers to runtime objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Naming {
    pub index_prefix: String,
    pub index_suffix: String,
    pub array_prefix: String,
    pub state_array: String,
}

impl From<&TranslatorSettings> for Naming {
    fn from(settings: &TranslatorSettings) -> Self {
        Self {
            index_prefix: settings.index_prefix.clone(),
            index_suffix: settings.index_suffix.clone(),
            array_prefix: settings.array_prefix.clone(),
            state_array: settings.state_array.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TensorCache {
    generation: u64,
    components: HashMap<Vec<usize>, Expr>,
    lambda: Option<TensorLambda>,
}

/// Every tensor object of one model, owned by one generation pass.
#[derive(Debug, Clone)]
pub struct TensorSet {
    model: Model,
    naming: Naming,
    dependencies: BTreeMap<TensorId, Vec<TensorId>>,
    caches: HashMap<TensorId, TensorCache>,
    acyclic: bool,
}

fn mentions_identifier(ast: &Ast, name: &str) -> bool {
    match ast {
        Ast::Identifier(id) => id == name,
        Ast::Number(_) => false,
        Ast::Unary(_, a) => mentions_identifier(a, name),
        Ast::Binary(l, _, r) => mentions_identifier(l, name) || mentions_identifier(r, name),
        Ast::Call(_, args) => args.iter().any(|a| mentions_identifier(a, name)),
    }
}

const FORMULA_BUILTINS: &[&str] = &["delta", "field", "momentum", "param"];

impl TensorSet {
    pub fn new(model: Model, settings: &TranslatorSettings) -> Result<Self, ConfigurationError> {
        let mut dependencies = BTreeMap::new();
        for id in TensorId::BUILTIN {
            dependencies.insert(id, id.builtin_dependencies().to_vec());
        }
        for (i, definition) in model.derived().iter().enumerate() {
            let mut deps = Vec::new();
            for call in &definition.calls {
                if FORMULA_BUILTINS.contains(&call.as_str()) {
                    continue;
                }
                let id = Self::resolve(&model, call).ok_or_else(|| ConfigurationError::UnknownTensor {
                    name: call.clone(),
                })?;
                if !deps.contains(&id) {
                    deps.push(id);
                }
            }
            if mentions_identifier(&definition.formula, "V") && !deps.contains(&TensorId::Dv) {
                deps.push(TensorId::Dv);
            }
            dependencies.insert(TensorId::Derived(i), deps);
        }

        Ok(Self {
            model,
            naming: Naming::from(settings),
            dependencies,
            caches: HashMap::new(),
            acyclic: false,
        })
    }

    fn resolve(model: &Model, name: &str) -> Option<TensorId> {
        TensorId::from_call_name(name).or_else(|| {
            model
                .derived()
                .iter()
                .position(|d| d.name == name)
                .map(TensorId::Derived)
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Every tensor of the set: built-ins first, then derived declarations.
    pub fn ids(&self) -> Vec<TensorId> {
        self.dependencies.keys().copied().collect()
    }

    pub fn lookup(&self, name: &str) -> Result<TensorId, ConfigurationError> {
        Self::resolve(&self.model, name).ok_or_else(|| ConfigurationError::UnknownTensor {
            name: name.to_string(),
        })
    }

    pub fn name(&self, id: TensorId) -> String {
        match id {
            TensorId::Derived(i) => self
                .model
                .derived()
                .get(i)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| format!("derived#{}", i)),
            builtin => builtin.call_name().unwrap_or_default().to_string(),
        }
    }

    pub fn array_name(&self, id: TensorId) -> String {
        let stem = match id.array_stem() {
            Some(stem) => stem.to_string(),
            None => self.name(id),
        };
        format!("{}{}", self.naming.array_prefix, stem)
    }

    pub fn signature(&self, id: TensorId) -> Vec<Classification> {
        match id {
            TensorId::Derived(i) => self
                .model
                .derived()
                .get(i)
                .map(|d| d.classes.clone())
                .unwrap_or_default(),
            builtin => builtin.builtin_signature().to_vec(),
        }
    }

    /// The tensor's own indices, decorated for lambda templates. Built-ins
    /// use `a b c` for field-only and `A B C` for full positions.
    pub fn indices(&self, id: TensorId) -> Vec<AbstractIndex> {
        let n = self.model.number_fields();
        let p = self.model.number_params();
        let decorate = |label: char, class: Classification| {
            AbstractIndex::new(label, class, n, p)
                .with_decoration(self.naming.index_prefix.clone(), self.naming.index_suffix.clone())
        };
        match id {
            TensorId::Derived(i) => match self.model.derived().get(i) {
                Some(d) => d
                    .labels
                    .iter()
                    .zip(&d.classes)
                    .map(|(l, c)| decorate(*l, *c))
                    .collect(),
                None => Vec::new(),
            },
            builtin => builtin
                .builtin_signature()
                .iter()
                .enumerate()
                .map(|(pos, class)| {
                    let base = match class {
                        Classification::Full => b'A',
                        Classification::FieldOnly | Classification::Parameter => b'a',
                    };
                    decorate((base + pos as u8) as char, *class)
                })
                .collect(),
        }
    }

    pub fn dependencies(&self, id: TensorId) -> &[TensorId] {
        self.dependencies.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every tensor built directly or transitively on `id`, in topological
    /// order (each before anything built on it).
    pub fn dependents(&self, id: TensorId) -> Vec<TensorId> {
        let mut reverse: BTreeMap<TensorId, Vec<TensorId>> = BTreeMap::new();
        for (tensor, deps) in &self.dependencies {
            for dep in deps {
                reverse.entry(*dep).or_default().push(*tensor);
            }
        }
        let mut reached = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            for user in reverse.get(&next).into_iter().flatten() {
                if !reached.contains(user) && *user != id {
                    reached.push(*user);
                    queue.push_back(*user);
                }
            }
        }
        // Kahn's order restricted to the reached set.
        let mut ordered = Vec::with_capacity(reached.len());
        let mut pending = reached;
        while !pending.is_empty() {
            let ready: Vec<TensorId> = pending
                .iter()
                .copied()
                .filter(|t| self.dependencies(*t).iter().all(|d| !pending.contains(d)))
                .collect();
            if ready.is_empty() {
                // Only reachable on a cyclic graph; keep the remainder as found.
                ordered.append(&mut pending);
                break;
            }
            pending.retain(|t| !ready.contains(t));
            ordered.extend(ready);
        }
        ordered
    }

    pub fn generation(&self, id: TensorId) -> u64 {
        self.caches.get(&id).map(|c| c.generation).unwrap_or(0)
    }

    pub fn is_cached(&self, id: TensorId, tuple: &[usize]) -> bool {
        self.caches
            .get(&id)
            .map(|c| c.components.contains_key(tuple))
            .unwrap_or(false)
    }

    /// Fails with `CyclicDependency` if any tensor reaches itself. Runs once;
    /// later calls are free.
    pub fn check_acyclic(&mut self) -> Result<(), ConfigurationError> {
        if self.acyclic {
            return Ok(());
        }
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }
        let mut marks: BTreeMap<TensorId, Mark> =
            self.dependencies.keys().map(|id| (*id, Mark::Unvisited)).collect();

        fn visit(
            set: &TensorSet,
            id: TensorId,
            marks: &mut BTreeMap<TensorId, Mark>,
            path: &mut Vec<TensorId>,
        ) -> Result<(), ConfigurationError> {
            match marks.get(&id).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::Active => {
                    let start = path.iter().position(|p| *p == id).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|t| set.name(*t)).collect();
                    cycle.push(set.name(id));
                    return Err(ConfigurationError::CyclicDependency {
                        tensor: set.name(id),
                        cycle,
                    });
                }
                Mark::Unvisited => {}
            }
            marks.insert(id, Mark::Active);
            path.push(id);
            for dep in set.dependencies(id) {
                visit(set, *dep, marks, path)?;
            }
            path.pop();
            marks.insert(id, Mark::Done);
            Ok(())
        }

        for id in self.ids() {
            visit(self, id, &mut marks, &mut Vec::new())?;
        }
        self.acyclic = true;
        Ok(())
    }

    fn validate_tuple(&self, id: TensorId, tuple: &[usize]) -> Result<Vec<AbstractIndex>, ConfigurationError> {
        let indices = self.indices(id);
        if indices.len() != tuple.len() {
            return Err(ConfigurationError::RankMismatch {
                tensor: self.name(id),
                expected: indices.len(),
                found: tuple.len(),
            });
        }
        let ranges: Vec<usize> = indices.iter().map(|i| i.numeric_range()).collect();
        offset_of(&ranges, tuple)?;
        Ok(indices)
    }

    /// One fully expanded component, cached until invalidated.
    pub fn component(&mut self, id: TensorId, tuple: &[usize]) -> Result<Expr, ConfigurationError> {
        self.check_acyclic()?;
        if let Some(hit) = self.caches.get(&id).and_then(|c| c.components.get(tuple)) {
            return Ok(hit.clone());
        }
        let indices = self.validate_tuple(id, tuple)?;

        let value = match id {
            TensorId::Derived(i) => {
                let definition = self.model.derived().get(i).cloned().ok_or_else(|| {
                    ConfigurationError::UnknownTensor {
                        name: format!("derived#{}", i),
                    }
                })?;
                let slots: Vec<IndexSlot> = tuple.iter().map(|v| IndexSlot::Fixed(*v)).collect();
                let model = self.model.clone();
                let signatures = move |name: &str| {
                    TensorSet::resolve(&model, name).map(|id| (id, signature_of(&model, id)))
                };
                formulas::derived(&mut ConcreteResources { set: self }, &definition, &slots, &signatures)?
            }
            leaf if leaf.is_leaf() => formulas::leaf(&mut ConcreteResources { set: self }, leaf, tuple)?,
            generic => {
                let args: Vec<Arg> = indices
                    .iter()
                    .zip(tuple)
                    .map(|(index, value)| Arg {
                        half: index.half_of(*value),
                        slot: IndexSlot::Fixed(index.species(*value)),
                    })
                    .collect();
                formulas::generic(&mut ConcreteResources { set: self }, generic, &args)?
            }
        };

        self.caches
            .entry(id)
            .or_default()
            .components
            .insert(tuple.to_vec(), value.clone());
        Ok(value)
    }

    /// Every component in flattened storage order.
    pub fn compute(&mut self, id: TensorId) -> Result<FlattenedTensor<Expr>, ConfigurationError> {
        self.check_acyclic()?;
        let indices = self.indices(id);
        debug!("computing {} ({} indices)", self.name(id), indices.len());
        FlattenedTensor::build(&indices, |tuple| self.component(id, tuple))
    }

    /// Lambda over the tensor's own indices, cached until invalidated.
    pub fn lambda(&mut self, id: TensorId) -> Result<TensorLambda, ConfigurationError> {
        self.check_acyclic()?;
        if let Some(hit) = self.caches.get(&id).and_then(|c| c.lambda.as_ref()) {
            return Ok(hit.clone());
        }
        let indices = self.indices(id);
        let name = self.name(id);

        let lambda = match id {
            leaf if leaf.is_leaf() => {
                TensorLambda::new(name, indices, LambdaBody::Table(self.compute(leaf)?))
            }
            TensorId::Derived(i) => {
                let definition = self.model.derived().get(i).cloned().ok_or_else(|| {
                    ConfigurationError::UnknownTensor {
                        name: format!("derived#{}", i),
                    }
                })?;
                let slots: Vec<IndexSlot> = indices
                    .iter()
                    .map(|index| IndexSlot::bound(index.label, index.decorated()))
                    .collect();
                let model = &self.model;
                let signatures = |name: &str| {
                    TensorSet::resolve(model, name).map(|id| (id, signature_of(model, id)))
                };
                let expr = formulas::derived(
                    &mut LambdaResources { set: self },
                    &definition,
                    &slots,
                    &signatures,
                )?;
                let pattern = vec![crate::index::Half::Whole; indices.len()];
                TensorLambda::new(name, indices, LambdaBody::Blocks(vec![LambdaBlock { pattern, expr }]))
            }
            generic => {
                let n = self.model.number_fields() as isize;
                let mut blocks = Vec::new();
                for pattern in lambda::half_patterns(&indices) {
                    let args: Vec<Arg> = indices
                        .iter()
                        .zip(&pattern)
                        .map(|(index, half)| {
                            let slot = IndexSlot::bound(index.label, index.decorated());
                            let slot = match half {
                                crate::index::Half::Momentum => slot.shifted(-n),
                                _ => slot,
                            };
                            Arg { half: *half, slot }
                        })
                        .collect();
                    let expr = formulas::generic(&mut LambdaResources { set: self }, generic, &args)?;
                    blocks.push(LambdaBlock { pattern, expr });
                }
                TensorLambda::new(name, indices, LambdaBody::Blocks(blocks))
            }
        };

        self.caches.entry(id).or_default().lambda = Some(lambda.clone());
        Ok(lambda)
    }

    /// Clears `id` and everything built on it, in topological order. Returns
    /// the invalidated tensors.
    pub fn invalidate(&mut self, id: TensorId) -> Vec<TensorId> {
        let mut order = vec![id];
        order.extend(self.dependents(id));
        for tensor in &order {
            let cache = self.caches.entry(*tensor).or_default();
            cache.components.clear();
            cache.lambda = None;
            cache.generation += 1;
        }
        debug!(
            "invalidated {}",
            order.iter().map(|t| self.name(*t)).collect::<Vec<_>>().join(", ")
        );
        order
    }

    /// Swaps the potential and invalidates every tensor that reads it.
    pub fn replace_potential(&mut self, text: &str) -> Result<Vec<TensorId>, ConfigurationError> {
        self.model.replace_potential(text)?;
        Ok(self.invalidate(TensorId::Dv))
    }

    pub fn tensor(&mut self, id: TensorId) -> BoundTensor<'_> {
        BoundTensor { set: self, id }
    }
}

fn signature_of(model: &Model, id: TensorId) -> Vec<Classification> {
    match id {
        TensorId::Derived(i) => model.derived().get(i).map(|d| d.classes.clone()).unwrap_or_default(),
        builtin => builtin.builtin_signature().to_vec(),
    }
}

/// One tensor of a set, seen through the [`TensorConcept`] capability.
pub struct BoundTensor<'a> {
    set: &'a mut TensorSet,
    id: TensorId,
}

impl BoundTensor<'_> {
    pub fn id(&self) -> TensorId {
        self.id
    }
}

impl TensorConcept for BoundTensor<'_> {
    fn compute(&mut self) -> Result<FlattenedTensor<Expr>, ConfigurationError> {
        self.set.compute(self.id)
    }

    fn compute_component(&mut self, indices: &[usize]) -> Result<Expr, ConfigurationError> {
        self.set.component(self.id, indices)
    }

    fn compute_lambda(&mut self) -> Result<TensorLambda, ConfigurationError> {
        self.set.lambda(self.id)
    }

    fn reset_cache(&mut self) {
        self.set.invalidate(self.id);
    }
}
