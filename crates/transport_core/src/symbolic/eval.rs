//! Numeric evaluation of symbolic expressions.
//!
//! Expressions compile to bytecode for a small stack VM so one compiled form
//! can be evaluated repeatedly at different points (used to check generated
//! algebra against finite differences and CSE rewrites against originals).

use super::expr::{Expr, Function};
use crate::error::EvalError;
use crate::traits::Scalar;
use std::collections::HashMap;

/// OpCodes for the stack VM.
#[derive(Debug, Clone, Copy)]
pub enum OpCode {
    /// Pushes a constant.
    LoadConst(f64),
    /// Pushes the value bound to a symbol slot.
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Compiles expressions, resolving symbol names to slots.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(var_names: &[String]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { var_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, EvalError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), EvalError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Symbol(name) => match self.var_map.get(name) {
                Some(&idx) => ops.push(OpCode::LoadVar(idx)),
                None => return Err(EvalError::UnboundSymbol(name.clone())),
            },
            Expr::Indexed(_) | Expr::Delta(_, _) => {
                return Err(EvalError::Unresolved(expr.to_string()))
            }
            Expr::Add(items) | Expr::Mul(items) => {
                let op = if matches!(expr, Expr::Add(_)) {
                    OpCode::Add
                } else {
                    OpCode::Mul
                };
                let mut first = true;
                for item in items {
                    self.compile_recursive(item, ops)?;
                    if !first {
                        ops.push(op);
                    }
                    first = false;
                }
                if first {
                    // An empty raw node still needs a value on the stack.
                    let identity = if matches!(op, OpCode::Add) { 0.0 } else { 1.0 };
                    ops.push(OpCode::LoadConst(identity));
                }
            }
            Expr::Pow(base, exp) => {
                self.compile_recursive(base, ops)?;
                self.compile_recursive(exp, ops)?;
                ops.push(OpCode::Pow);
            }
            Expr::Func(function, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(*function));
            }
        }
        Ok(())
    }
}

/// Stack-based virtual machine.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(*val).unwrap_or_else(T::nan)),
                OpCode::LoadVar(idx) => stack.push(vars[*idx]),
                OpCode::Add => {
                    let b = stack.pop().unwrap_or_else(T::nan);
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(a + b);
                }
                OpCode::Mul => {
                    let b = stack.pop().unwrap_or_else(T::nan);
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(a * b);
                }
                OpCode::Pow => {
                    let b = stack.pop().unwrap_or_else(T::nan);
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(power(a, b));
                }
                OpCode::Call(function) => {
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(function.apply(a));
                }
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

fn power<T: Scalar>(a: T, b: T) -> T {
    // Integer exponents keep negative bases well defined.
    match b.to_f64() {
        Some(e) if e.fract() == 0.0 && e.abs() <= i32::MAX as f64 => a.powi(e as i32),
        _ => a.powf(b),
    }
}

impl Expr {
    /// Evaluates the expression with the given symbol values.
    pub fn evaluate(&self, env: &HashMap<String, f64>) -> Result<f64, EvalError> {
        let names: Vec<String> = self.free_symbols().into_iter().collect();
        let mut vars = Vec::with_capacity(names.len());
        for name in &names {
            match env.get(name) {
                Some(v) => vars.push(*v),
                None => return Err(EvalError::UnboundSymbol(name.clone())),
            }
        }
        let bytecode = Compiler::new(&names).compile(self)?;
        let mut stack = Vec::with_capacity(32);
        Ok(VM::execute(&bytecode, &vars, &mut stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn evaluates_compound_expression() {
        let x = Expr::symbol("x");
        let y = Expr::symbol("y");
        let e = (x.clone() + Expr::num(1.0)) * Expr::pow(y.clone(), Expr::num(-2.0))
            - Expr::func(Function::Cos, x.clone());
        let env: HashMap<String, f64> = [("x".to_string(), 0.5), ("y".to_string(), 2.0)]
            .into_iter()
            .collect();
        let expected = 1.5 / 4.0 - 0.5f64.cos();
        assert!((e.evaluate(&env).expect("evaluates") - expected).abs() < 1e-12);
    }

    #[test]
    fn missing_binding_is_reported() {
        let e = Expr::symbol("x") + Expr::symbol("z");
        let env: HashMap<String, f64> = [("x".to_string(), 1.0)].into_iter().collect();
        assert_eq!(e.evaluate(&env), Err(EvalError::UnboundSymbol("z".to_string())));
    }

    #[test]
    fn negative_base_integer_power() {
        let e = Expr::pow(Expr::symbol("x"), Expr::num(3.0));
        let env: HashMap<String, f64> = [("x".to_string(), -2.0)].into_iter().collect();
        assert_eq!(e.evaluate(&env), Ok(-8.0));
    }

    #[test]
    fn bytecode_reused_across_points() {
        let names = vec!["x".to_string()];
        let e = Expr::symbol("x").square();
        let code = Compiler::new(&names).compile(&e).expect("compiles");
        let mut stack = Vec::new();
        assert_eq!(VM::execute(&code, &[3.0f64], &mut stack), 9.0);
        assert_eq!(VM::execute(&code, &[4.0f32], &mut Vec::new()), 16.0);
    }

    #[test]
    fn indexed_references_do_not_evaluate() {
        let e = Expr::indexed("__dV", vec![], vec![]);
        assert!(matches!(e.evaluate(&HashMap::new()), Err(EvalError::Unresolved(_))));
    }
}
