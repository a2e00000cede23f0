use std::sync::Arc;

use crate::ast::Expr;
use crate::RillError;

use super::scope::Scope;
use super::values::{FunctionValue, Value};

/// Renders a subtree as self-contained source text a remote evaluator can
/// run against an empty scope. Free variables are substituted with their
/// current concrete value — captured by value, never by name; the remote
/// side never sees caller variable names. Function calls carry their own
/// `def`, hoisted to the top of the emitted block so the program always
/// re-parses. The result is wrapped in one block so multi-statement bodies
/// are accepted.
pub(super) fn serialize_for_remote(expr: &Expr, scope: &Scope) -> Result<String, RillError> {
    let mut serializer = Serializer {
        scope,
        in_flight: Vec::new(),
        defs: Vec::new(),
    };
    let body = serializer.serialize(expr)?;
    let mut statements: Vec<String> = serializer.defs.into_iter().map(|(_, text)| text).collect();
    statements.push(body);
    Ok(format!("{{\n{}\n}}", statements.join("\n")))
}

struct Serializer<'a> {
    scope: &'a Scope,
    /// Functions whose bodies are currently being rendered; their parameters
    /// stay symbolic instead of being captured from the scope.
    in_flight: Vec<Arc<FunctionValue>>,
    /// Function definitions the output needs, one per name.
    defs: Vec<(String, String)>,
}

impl Serializer<'_> {
    fn serialize(&mut self, expr: &Expr) -> Result<String, RillError> {
        match expr {
            Expr::Int(value) => Ok(value.to_string()),
            Expr::Add(left, right) => {
                let left = self.serialize(left)?;
                let right = self.serialize(right)?;
                Ok(format!("{left}+{right}"))
            }
            Expr::Var(name) => self.serialize_var(name),
            Expr::Block(exprs) => {
                let mut statements = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    statements.push(self.serialize(expr)?);
                }
                Ok(format!("{{\n{}\n}}", statements.join("\n")))
            }
            Expr::FnCall { name, args } => self.serialize_call(name, args),
            Expr::Assign { .. } => Err(RillError::NotSerializable(
                "assignments cannot be shipped to a worker".to_string(),
            )),
            Expr::FnDef { .. } => Err(RillError::NotSerializable(
                "function definitions cannot be shipped to a worker".to_string(),
            )),
            Expr::Remote { .. } => Err(RillError::NotSerializable(
                "nested remote delegation cannot be shipped to a worker".to_string(),
            )),
        }
    }

    fn serialize_var(&mut self, name: &str) -> Result<String, RillError> {
        let is_param = self
            .in_flight
            .iter()
            .rev()
            .any(|func| func.params.iter().any(|param| param == name));
        if is_param {
            return Ok(name.to_string());
        }

        match self.scope.get(name) {
            None => Err(RillError::UnknownSymbol(name.to_string())),
            Some(Value::Int(value)) => Ok(value.to_string()),
            Some(Value::Pending(_)) => Err(RillError::NotSerializable(format!(
                "`{name}` is still pending"
            ))),
            Some(Value::Function(_)) => Err(RillError::NotSerializable(format!(
                "`{name}` is a function and can only be shipped through a call"
            ))),
            Some(Value::Fault(fault)) => Err(RillError::NotSerializable(format!(
                "`{name}` failed remotely: {}",
                fault.message
            ))),
        }
    }

    fn serialize_call(&mut self, name: &str, args: &[Expr]) -> Result<String, RillError> {
        let func = match self.scope.get(name) {
            Some(Value::Function(func)) => func,
            _ => return Err(RillError::NotAFunction(name.to_string())),
        };
        if args.len() != func.params.len() {
            return Err(RillError::ArityMismatch {
                name: name.to_string(),
                expected: func.params.len(),
                found: args.len(),
            });
        }

        let already_defined = self.defs.iter().any(|(defined, _)| defined == name)
            || self.in_flight.iter().any(|active| active.name == *name);
        if !already_defined {
            self.in_flight.push(func.clone());
            let body = self.serialize(&func.body);
            self.in_flight.pop();
            let def = format!("def {}({}) {}", func.name, func.params.join(","), body?);
            self.defs.push((func.name.clone(), def));
        }

        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            rendered.push(self.serialize(arg)?);
        }
        Ok(format!("{}({})", name, rendered.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::runtime::values::PendingValue;
    use uuid::Uuid;

    fn body_of(expr: &Expr) -> &Expr {
        match expr {
            Expr::Remote { inner, .. } => inner,
            other => other,
        }
    }

    fn serialize_source(source: &str, scope: &Scope) -> Result<String, RillError> {
        let expr = parse_program(source).expect("parse");
        serialize_for_remote(body_of(&expr), scope)
    }

    #[test]
    fn literals_and_sums_render_verbatim() {
        let scope = Scope::new();
        let program = serialize_source("1+2", &scope).expect("serialize");
        assert_eq!(program, "{\n1+2\n}");
    }

    #[test]
    fn free_variables_are_captured_by_value() {
        let mut scope = Scope::new();
        scope.set("x".to_string(), Value::Int(5));
        scope.set("y".to_string(), Value::Int(7));
        let program = serialize_source("x+y", &scope).expect("serialize");
        assert_eq!(program, "{\n5+7\n}");
    }

    #[test]
    fn unknown_free_variable_fails() {
        let scope = Scope::new();
        let err = serialize_source("x+1", &scope).expect_err("should fail");
        assert!(matches!(err, RillError::UnknownSymbol(name) if name == "x"));
    }

    #[test]
    fn pending_free_variable_is_not_serializable() {
        let mut scope = Scope::new();
        scope.set(
            "x".to_string(),
            Value::Pending(PendingValue { id: Uuid::new_v4() }),
        );
        let err = serialize_source("x+1", &scope).expect_err("should fail");
        assert!(matches!(err, RillError::NotSerializable(_)));
    }

    #[test]
    fn calls_emit_their_definition_with_symbolic_params() {
        let mut scope = Scope::new();
        let def = parse_program("def inc(a) a+1").expect("parse");
        let Expr::FnDef { name, params, body } = def else {
            panic!("expected def");
        };
        scope.set(
            name.clone(),
            Value::Function(Arc::new(FunctionValue { name, params, body })),
        );
        scope.set("x".to_string(), Value::Int(4));

        let program = serialize_source("inc(x)", &scope).expect("serialize");
        assert_eq!(program, "{\ndef inc(a) a+1\ninc(4)\n}");
    }

    #[test]
    fn repeated_calls_share_one_definition() {
        let mut scope = Scope::new();
        let def = parse_program("def inc(a) a+1").expect("parse");
        let Expr::FnDef { name, params, body } = def else {
            panic!("expected def");
        };
        scope.set(
            name.clone(),
            Value::Function(Arc::new(FunctionValue { name, params, body })),
        );

        let program = serialize_source("inc(1)+inc(2)", &scope).expect("serialize");
        assert_eq!(program, "{\ndef inc(a) a+1\ninc(1)+inc(2)\n}");
    }

    #[test]
    fn assignment_and_def_and_remote_are_rejected() {
        let scope = Scope::new();
        for source in ["x = 1", "def f(a) a", "remote(1)"] {
            let expr = parse_program(source).expect("parse");
            let err = serialize_for_remote(&expr, &scope).expect_err("should fail");
            assert!(matches!(err, RillError::NotSerializable(_)), "{source}");
        }
    }

    #[test]
    fn serialized_output_reparses() {
        let mut scope = Scope::new();
        scope.set("x".to_string(), Value::Int(3));
        let program = serialize_source("x+4", &scope).expect("serialize");
        assert!(parse_program(&program).is_ok());
    }
}
