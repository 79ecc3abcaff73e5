//! Tensor formulas.
//!
//! Generic formulas are written once against [`Resources`] and serve both
//! concrete components and lambda templates. Leaf tensors differentiate the
//! potential or metric by field symbol and only exist as concrete components.

use super::resources::Resources;
use super::TensorId;
use crate::error::ConfigurationError;
use crate::index::{Classification, Half};
use crate::model::{placeholders, DerivedDefinition};
use crate::symbolic::{Ast, Expr, IndexSlot, Resolver};
use std::collections::HashMap;

/// One index of a generic formula: the half it lies in and the slot of its
/// species (field number).
#[derive(Debug, Clone)]
pub(crate) struct Arg {
    pub half: Half,
    pub slot: IndexSlot,
}

type Res = Result<Expr, ConfigurationError>;

fn sym(name: &str) -> Expr {
    Expr::symbol(name)
}

fn metric<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot) -> Res {
    if r.model().is_canonical() {
        Ok(Expr::delta(a.clone(), b.clone()))
    } else {
        r.metric_component(a, b)
    }
}

fn inverse_metric<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot) -> Res {
    if r.model().is_canonical() {
        Ok(Expr::delta(a.clone(), b.clone()))
    } else {
        r.inverse_metric_component(a, b)
    }
}

/// p_a = G_ab π^b
fn lowered_momentum<R: Resources>(r: &mut R, a: &IndexSlot) -> Res {
    if r.model().is_canonical() {
        return r.momentum(a);
    }
    let n = r.model().number_fields();
    let mut terms = Vec::with_capacity(n);
    for b in 0..n {
        let b = IndexSlot::Fixed(b);
        terms.push(metric(r, a, &b)? * r.momentum(&b)?);
    }
    Ok(Expr::add(terms))
}

/// G^ac f(c)
fn raise<R, F>(r: &mut R, a: &IndexSlot, mut f: F) -> Res
where
    R: Resources,
    F: FnMut(&mut R, &IndexSlot) -> Res,
{
    if r.model().is_canonical() {
        return f(r, a);
    }
    let n = r.model().number_fields();
    let mut terms = Vec::with_capacity(n);
    for c in 0..n {
        let c = IndexSlot::Fixed(c);
        let g = inverse_metric(r, a, &c)?;
        terms.push(g * f(r, &c)?);
    }
    Ok(Expr::add(terms))
}

/// Γ^a_bc π^c
fn connexion_momentum<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot) -> Res {
    if r.model().is_canonical() {
        return Ok(Expr::num(0.0));
    }
    let n = r.model().number_fields();
    let mut terms = Vec::with_capacity(n);
    for c in 0..n {
        let c = IndexSlot::Fixed(c);
        terms.push(r.tensor(TensorId::Connexion, &[a.clone(), b.clone(), c.clone()])? * r.momentum(&c)?);
    }
    Ok(Expr::add(terms))
}

/// Γ^a_bc π^b π^c
fn connexion_momentum_sq<R: Resources>(r: &mut R, a: &IndexSlot) -> Res {
    if r.model().is_canonical() {
        return Ok(Expr::num(0.0));
    }
    let n = r.model().number_fields();
    let mut terms = Vec::with_capacity(n);
    for b in 0..n {
        let b = IndexSlot::Fixed(b);
        terms.push(connexion_momentum(r, a, &b)? * r.momentum(&b)?);
    }
    Ok(Expr::add(terms))
}

/// Scalar products of the momentum triangle: k_i·k_j = (k_l² − k_i² − k_j²)/2.
struct Triangle {
    k1: Expr,
    k2: Expr,
    k3: Expr,
}

impl Triangle {
    fn new() -> Self {
        Self {
            k1: sym(placeholders::K1),
            k2: sym(placeholders::K2),
            k3: sym(placeholders::K3),
        }
    }

    fn dot(i: &Expr, j: &Expr, l: &Expr) -> Expr {
        (l.clone().square() - i.clone().square() - j.clone().square()) / Expr::num(2.0)
    }

    fn k1k2(&self) -> Expr {
        Self::dot(&self.k1, &self.k2, &self.k3)
    }

    fn k1k3(&self) -> Expr {
        Self::dot(&self.k1, &self.k3, &self.k2)
    }

    fn k2k3(&self) -> Expr {
        Self::dot(&self.k2, &self.k3, &self.k1)
    }
}

fn a_tensor<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot, c: &IndexSlot) -> Res {
    let mp = r.model().planck_mass();
    let hsq = sym(placeholders::HUBBLE_SQ);
    let eps = sym(placeholders::EPSILON);
    let scale = sym(placeholders::SCALE_FACTOR);
    let k = Triangle::new();
    let (pa, pb, pc) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?, lowered_momentum(r, c)?);

    let dddv = r.tensor(TensorId::Dddv, &[a.clone(), b.clone(), c.clone()])?;
    let ddv_bc = r.tensor(TensorId::Ddv, &[b.clone(), c.clone()])?;
    let ddv_ac = r.tensor(TensorId::Ddv, &[a.clone(), c.clone()])?;
    let ddv_ab = r.tensor(TensorId::Ddv, &[a.clone(), b.clone()])?;
    let (g_bc, g_ac, g_ab) = (metric(r, b, c)?, metric(r, a, c)?, metric(r, a, b)?);

    let mp2 = mp.square();
    Ok(-dddv / (Expr::num(3.0) * hsq.clone())
        - (pa.clone() * ddv_bc + pb.clone() * ddv_ac + pc.clone() * ddv_ab)
            / (Expr::num(6.0) * mp2.clone() * hsq.clone())
        + pa.clone() * pb.clone() * pc.clone() * (Expr::num(3.0) - eps)
            / (Expr::num(4.0) * mp2.clone().square())
        + (pa * g_bc * k.k2k3() + pb * g_ac * k.k1k3() + pc * g_ab * k.k1k2())
            / (Expr::num(4.0) * mp2 * scale.square() * hsq))
}

fn b_tensor<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot, c: &IndexSlot) -> Res {
    let mp2 = r.model().planck_mass().square();
    let k = Triangle::new();
    let (pa, pb, pc) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?, lowered_momentum(r, c)?);
    let (g_bc, g_ac) = (metric(r, b, c)?, metric(r, a, c)?);
    Ok(pa.clone() * pb.clone() * pc / (Expr::num(4.0) * mp2.clone().square())
        - (pa * g_bc * k.k1k3() + pb * g_ac * k.k2k3())
            / (Expr::num(2.0) * mp2 * k.k3.clone().square()))
}

fn c_tensor<R: Resources>(r: &mut R, a: &IndexSlot, b: &IndexSlot, c: &IndexSlot) -> Res {
    let mp2 = r.model().planck_mass().square();
    let k = Triangle::new();
    let (pa, pb, pc) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?, lowered_momentum(r, c)?);
    let (g_ab, g_ac, g_bc) = (metric(r, a, b)?, metric(r, a, c)?, metric(r, b, c)?);
    let k1sq = k.k1.clone().square();
    let k2sq = k.k2.clone().square();
    let angle = Expr::num(1.0) - k.k1k2().square() / (k1sq.clone() * k2sq.clone());
    Ok(g_ab * pc.clone() / (Expr::num(2.0) * mp2.clone())
        - pa.clone() * pb.clone() * pc * angle / (Expr::num(8.0) * mp2.clone().square())
        + (g_ac * pb * k.k1k2() / k2sq + g_bc * pa * k.k1k2() / k1sq) / (Expr::num(2.0) * mp2))
}

/// Formula of a tensor with an index-generic definition.
pub(crate) fn generic<R: Resources>(r: &mut R, id: TensorId, args: &[Arg]) -> Res {
    let mp = r.model().planck_mass();
    let hsq = sym(placeholders::HUBBLE_SQ);
    let eps = sym(placeholders::EPSILON);
    let three_minus_eps = Expr::num(3.0) - eps.clone();
    if args.len() != id.builtin_signature().len() {
        return Err(ConfigurationError::RankMismatch {
            tensor: format!("{:?}", id),
            expected: id.builtin_signature().len(),
            found: args.len(),
        });
    }
    let s = |i: usize| &args[i].slot;
    let halves: Vec<Half> = args.iter().map(|a| a.half).collect();

    match id {
        TensorId::SrVelocity => {
            let a = s(0);
            let raised = raise(r, a, |r, b| r.tensor(TensorId::Dv, &[b.clone()]))?;
            let v = r.potential()?;
            Ok(-mp.square() * raised / v)
        }
        TensorId::Mass => {
            let (a, b) = (s(0), s(1));
            let ddv = r.tensor(TensorId::Ddv, &[a.clone(), b.clone()])?;
            let (dva, dvb) = (r.tensor(TensorId::Dv, &[a.clone()])?, r.tensor(TensorId::Dv, &[b.clone()])?);
            let (pa, pb) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?);
            let mp2 = mp.square();
            Ok(ddv / hsq.clone()
                - three_minus_eps * pa.clone() * pb.clone() / mp2.clone()
                - (pa * dvb + pb * dva) / (mp2 * hsq))
        }
        TensorId::U1 => {
            let a = s(0);
            match halves[0] {
                Half::Momentum => {
                    let pi = r.momentum(a)?;
                    let force = raise(r, a, |r, b| r.tensor(TensorId::Dv, &[b.clone()]))?;
                    let gamma = connexion_momentum_sq(r, a)?;
                    Ok(-three_minus_eps * pi - force / hsq - gamma)
                }
                Half::Field | Half::Whole => r.momentum(a),
            }
        }
        TensorId::U2 => {
            let (a, b) = (s(0), s(1));
            let delta = Expr::delta(a.clone(), b.clone());
            match (halves[0], halves[1]) {
                (Half::Momentum, Half::Field) => {
                    let k = sym(placeholders::K);
                    let scale = sym(placeholders::SCALE_FACTOR);
                    let mass = raise(r, a, |r, c| r.tensor(TensorId::Mass, &[c.clone(), b.clone()]))?;
                    Ok(-(k.square() / (scale.square() * hsq)) * delta - mass)
                }
                (Half::Momentum, Half::Momentum) => {
                    Ok(-three_minus_eps * delta - connexion_momentum(r, a, b)?)
                }
                (_, Half::Momentum) => Ok(delta),
                _ => Ok(-connexion_momentum(r, a, b)?),
            }
        }
        TensorId::U3 => {
            let (a, b, c) = (s(0).clone(), s(1).clone(), s(2).clone());
            use Half::{Field as F, Momentum as M};
            let pattern = (halves[0], halves[1], halves[2]);
            let term = |r: &mut R, t: TensorId, order: [&IndexSlot; 2], raised_last: bool| {
                let (x, y) = (order[0].clone(), order[1].clone());
                raise(r, &a, |r, d| {
                    let slots = if raised_last {
                        [x.clone(), y.clone(), d.clone()]
                    } else {
                        [d.clone(), x.clone(), y.clone()]
                    };
                    r.tensor(t, &slots)
                })
            };
            match pattern {
                (F, F, F) => Ok(-term(r, TensorId::B, [&b, &c], true)?),
                (F, F, M) => Ok(-term(r, TensorId::C, [&c, &b], false)?),
                (F, M, F) => Ok(-term(r, TensorId::C, [&b, &c], false)?),
                (M, F, F) => Ok(Expr::num(3.0) * term(r, TensorId::A, [&b, &c], false)?),
                (M, F, M) => term(r, TensorId::B, [&c, &b], false),
                (M, M, F) => term(r, TensorId::B, [&b, &c], false),
                (M, M, M) => term(r, TensorId::C, [&b, &c], true),
                _ => Ok(Expr::num(0.0)),
            }
        }
        TensorId::A => a_tensor(r, s(0), s(1), s(2)),
        TensorId::B => b_tensor(r, s(0), s(1), s(2)),
        TensorId::C => c_tensor(r, s(0), s(1), s(2)),
        TensorId::Zeta1 => match halves[0] {
            Half::Momentum => Ok(Expr::num(0.0)),
            Half::Field | Half::Whole => {
                let pa = lowered_momentum(r, s(0))?;
                Ok(-pa / (Expr::num(2.0) * mp.square() * eps))
            }
        },
        TensorId::Zeta2 => {
            let (a, b) = (s(0), s(1));
            let mp2 = mp.square();
            match (halves[0], halves[1]) {
                (Half::Momentum, Half::Momentum) => Ok(Expr::num(0.0)),
                (Half::Momentum, _) | (_, Half::Momentum) => {
                    let (pa, pb) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?);
                    Ok(-pa * pb / (Expr::num(8.0) * mp2.square() * eps.square()))
                }
                _ => {
                    let (pa, pb) = (lowered_momentum(r, a)?, lowered_momentum(r, b)?);
                    let g = metric(r, a, b)?;
                    Ok(pa * pb / (Expr::num(4.0) * mp2.clone().square() * eps.clone().square())
                        - g / (Expr::num(4.0) * mp2 * eps))
                }
            }
        }
        TensorId::Connexion | TensorId::Dv | TensorId::Ddv | TensorId::Dddv | TensorId::Derived(_) => {
            Err(ConfigurationError::InvalidModel(format!(
                "{:?} has no index-generic formula",
                id
            )))
        }
    }
}

/// Concrete component of a leaf tensor.
pub(crate) fn leaf<R: Resources>(r: &mut R, id: TensorId, tuple: &[usize]) -> Res {
    let field_name = |r: &R, i: usize| r.model().field_names()[i].clone();
    let n = r.model().number_fields();
    let fixed = IndexSlot::Fixed;

    match id {
        TensorId::Connexion => {
            if r.model().is_canonical() {
                return Ok(Expr::num(0.0));
            }
            let (a, b, c) = (tuple[0], tuple[1], tuple[2]);
            let model = r.model();
            let (fb, fc) = (field_name(r, b), field_name(r, c));
            let mut terms = Vec::with_capacity(n);
            for d in 0..n {
                let fd = field_name(r, d);
                let bracket = model.metric(d, c).diff(&fb) + model.metric(d, b).diff(&fc)
                    - model.metric(b, c).diff(&fd);
                terms.push(model.inverse_metric(a, d) * bracket);
            }
            Ok(Expr::num(0.5) * Expr::add(terms))
        }
        TensorId::Dv => {
            let name = field_name(r, tuple[0]);
            Ok(r.potential()?.diff(&name))
        }
        TensorId::Ddv => {
            let (a, b) = (tuple[0], tuple[1]);
            let name = field_name(r, b);
            let mut out = r.tensor(TensorId::Dv, &[fixed(a)])?.diff(&name);
            if !r.model().is_canonical() {
                for c in 0..n {
                    let gamma = r.tensor(TensorId::Connexion, &[fixed(c), fixed(a), fixed(b)])?;
                    out = out - gamma * r.tensor(TensorId::Dv, &[fixed(c)])?;
                }
            }
            Ok(out)
        }
        TensorId::Dddv => {
            let (a, b, c) = (tuple[0], tuple[1], tuple[2]);
            let name = field_name(r, a);
            let mut out = r.tensor(TensorId::Ddv, &[fixed(b), fixed(c)])?.diff(&name);
            if !r.model().is_canonical() {
                for d in 0..n {
                    let g_ab = r.tensor(TensorId::Connexion, &[fixed(d), fixed(a), fixed(b)])?;
                    let g_ac = r.tensor(TensorId::Connexion, &[fixed(d), fixed(a), fixed(c)])?;
                    out = out - g_ab * r.tensor(TensorId::Ddv, &[fixed(d), fixed(c)])?
                        - g_ac * r.tensor(TensorId::Ddv, &[fixed(b), fixed(d)])?;
                }
            }
            Ok(out)
        }
        _ => Err(ConfigurationError::InvalidModel(format!(
            "{:?} is not a leaf tensor",
            id
        ))),
    }
}

/// Lowers a derived formula with its own labels bound to slots. Full-index
/// slots carry the raw value; derived formulas see no halves.
pub(crate) fn derived<R: Resources>(
    r: &mut R,
    definition: &DerivedDefinition,
    slots: &[IndexSlot],
    signatures: &dyn Fn(&str) -> Option<(TensorId, Vec<Classification>)>,
) -> Res {
    let labels = definition
        .labels
        .iter()
        .zip(&definition.classes)
        .zip(slots)
        .map(|((label, class), slot)| (*label, (*class, slot.clone())))
        .collect();
    let mut scope = DerivedScope {
        r,
        name: &definition.name,
        labels,
        signatures,
    };
    definition.formula.lower(&mut scope)
}

struct DerivedScope<'a, R> {
    r: &'a mut R,
    name: &'a str,
    labels: HashMap<char, (Classification, IndexSlot)>,
    signatures: &'a dyn Fn(&str) -> Option<(TensorId, Vec<Classification>)>,
}

impl<R: Resources> DerivedScope<'_, R> {
    fn context(&self) -> String {
        format!("derived tensor '{}'", self.name)
    }

    fn argument(&self, arg: &Ast, expected: Classification, position: usize) -> Result<IndexSlot, ConfigurationError> {
        match arg {
            Ast::Identifier(label) => {
                let mut chars = label.chars();
                let found = match (chars.next(), chars.next()) {
                    (Some(c), None) => self.labels.get(&c),
                    _ => None,
                };
                match found {
                    Some((class, slot)) if *class == expected => Ok(slot.clone()),
                    Some((class, _)) => Err(ConfigurationError::InvalidModel(format!(
                        "{}: index '{}' is {} but argument {} expects {}",
                        self.context(),
                        label,
                        class,
                        position,
                        expected
                    ))),
                    None => Err(ConfigurationError::UnknownSymbol {
                        name: label.clone(),
                        context: self.context(),
                    }),
                }
            }
            Ast::Number(v) if v.fract() == 0.0 && *v >= 0.0 => Ok(IndexSlot::Fixed(*v as usize)),
            other => Err(ConfigurationError::InvalidModel(format!(
                "{}: tensor arguments must be index labels or integers, got {:?}",
                self.context(),
                other
            ))),
        }
    }

    fn arguments(&self, args: &[Ast], expected: &[Classification], callee: &str) -> Result<Vec<IndexSlot>, ConfigurationError> {
        if args.len() != expected.len() {
            return Err(ConfigurationError::RankMismatch {
                tensor: callee.to_string(),
                expected: expected.len(),
                found: args.len(),
            });
        }
        args.iter()
            .zip(expected)
            .enumerate()
            .map(|(i, (arg, class))| self.argument(arg, *class, i))
            .collect()
    }
}

impl<R: Resources> Resolver for DerivedScope<'_, R> {
    type Error = ConfigurationError;

    fn identifier(&mut self, name: &str) -> Res {
        match name {
            "V" => self.r.potential(),
            "H2" => Ok(sym(placeholders::HUBBLE_SQ)),
            "eps" => Ok(sym(placeholders::EPSILON)),
            _ if self.r.model().declares(name) => self.r.symbol(name),
            placeholders::K
            | placeholders::K1
            | placeholders::K2
            | placeholders::K3
            | placeholders::SCALE_FACTOR => Ok(sym(name)),
            _ => Err(ConfigurationError::UnknownSymbol {
                name: name.to_string(),
                context: self.context(),
            }),
        }
    }

    fn call(&mut self, name: &str, args: &[Ast]) -> Res {
        use Classification::{FieldOnly, Parameter};
        match name {
            "delta" => {
                if args.len() != 2 {
                    return Err(ConfigurationError::RankMismatch {
                        tensor: name.to_string(),
                        expected: 2,
                        found: args.len(),
                    });
                }
                // Both sides share whatever classification the first label has.
                let class = match &args[0] {
                    Ast::Identifier(l) => l
                        .chars()
                        .next()
                        .and_then(|c| self.labels.get(&c))
                        .map(|(class, _)| *class)
                        .unwrap_or(FieldOnly),
                    _ => FieldOnly,
                };
                let slots = self.arguments(args, &[class, class], name)?;
                Ok(Expr::delta(slots[0].clone(), slots[1].clone()))
            }
            "field" => {
                let slots = self.arguments(args, &[FieldOnly], name)?;
                self.r.field(&slots[0])
            }
            "momentum" => {
                let slots = self.arguments(args, &[FieldOnly], name)?;
                self.r.momentum(&slots[0])
            }
            "param" => {
                let slots = self.arguments(args, &[Parameter], name)?;
                self.r.parameter(&slots[0])
            }
            _ => {
                let (id, signature) = (self.signatures)(name).ok_or_else(|| ConfigurationError::UnknownTensor {
                    name: name.to_string(),
                })?;
                let slots = self.arguments(args, &signature, name)?;
                self.r.tensor(id, &slots)
            }
        }
    }
}
