#![forbid(unsafe_code)]

use std::fmt::{self, Write};

use crate::ir::*;

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Simple {
                base,
                arguments,
                nullable,
                ..
            } => {
                f.write_str(base)?;
                if !arguments.is_empty() {
                    f.write_char('<')?;
                    for (i, arg) in arguments.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_char('>')?;
                }
                if *nullable {
                    f.write_char('?')?;
                }
                Ok(())
            }
            IrType::Generic { name, nullable, .. } => {
                f.write_str(name)?;
                if *nullable {
                    f.write_char('?')?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for TemporaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IrTemporaryValueReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.id())
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer::default();
        p.function(self);
        f.write_str(&p.out)
    }
}

impl fmt::Display for IrPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut p = Printer::default();
        p.package(self);
        f.write_str(&p.out)
    }
}

/// Indentation-aware text dump of the IR. Output is stable and meant for
/// golden-style assertions.
#[derive(Default)]
struct Printer {
    out: String,
    depth: usize,
}

impl Printer {
    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn package(&mut self, package: &IrPackage) {
        self.line(format!("package {}", package.name));
        for v in &package.variables {
            self.line(format!(
                "global {}: {} =",
                v.declaration.name, v.declaration.ty
            ));
            self.nested(|p| p.implicit(&v.initializer));
        }
        for i in &package.interfaces {
            self.line(format!("interface {}", i.canonical_name));
            self.nested(|p| {
                for f in &i.member_functions {
                    p.function(f);
                }
            });
        }
        for c in &package.classes {
            self.line(format!("class {}", c.canonical_name));
            self.nested(|p| {
                for m in &c.member_variables {
                    p.line(format!("member {}: {}", m.name, m.ty));
                }
                p.function(&c.constructor);
                p.function(&c.destructor);
                for f in &c.member_functions {
                    p.function(f);
                }
            });
        }
        for f in &package.functions {
            self.function(f);
        }
    }

    fn function(&mut self, function: &IrFunction) {
        let params = function
            .parameters
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty))
            .collect::<Vec<_>>()
            .join(", ");
        let mut header = format!(
            "fun {}({params}) -> {}",
            function.symbol, function.return_type
        );
        if function.is_external_c {
            header.push_str(" external(C)");
        }
        if function.is_nothrow {
            header.push_str(" nothrow");
        }
        match &function.body {
            None => self.line(header),
            Some(body) => {
                header.push_str(" {");
                self.line(header);
                self.nested(|p| p.chunk(body));
                self.line("}");
            }
        }
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self)) {
        self.depth += 1;
        f(self);
        self.depth -= 1;
    }

    fn chunk(&mut self, chunk: &IrCodeChunk) {
        for stmt in &chunk.statements {
            self.statement(stmt);
        }
    }

    fn implicit(&mut self, eval: &IrImplicitEvaluation) {
        self.chunk(&eval.code);
        match &eval.result {
            Some(r) => self.line(format!("yield {r}")),
            None => self.line("yield"),
        }
    }

    fn statement(&mut self, stmt: &IrStatement) {
        match stmt {
            IrStatement::CreateTemporaryValue(t) => self.temporary(t),
            IrStatement::CreateStrongReference(t) => self.line(format!("refcount++ {t}")),
            IrStatement::DropStrongReference(t) => self.line(format!("refcount-- {t}")),
            IrStatement::VariableDeclaration(v) => self.line(format!("var {}: {}", v.name, v.ty)),
            IrStatement::Assignment(a) => match &a.target {
                IrAssignmentTarget::Variable(v) => self.line(format!("{} = {}", v.name, a.value)),
                IrAssignmentTarget::ClassMember { object, member } => {
                    self.line(format!("{object}.{member} = {}", a.value))
                }
            },
            IrStatement::ConditionalBranch(b) => {
                self.line(format!("if {} {{", b.condition));
                self.nested(|p| p.chunk(&b.then_branch));
                if let Some(else_branch) = &b.else_branch {
                    self.line("} else {");
                    self.nested(|p| p.chunk(else_branch));
                }
                self.line("}");
            }
            IrStatement::Return(r) => match &r.value {
                Some(v) => self.line(format!("return {v}")),
                None => self.line("return"),
            },
            IrStatement::Throw(t) => match &t.catch_target {
                Some(target) => self.line(format!("throw {} -> catch#{}", t.value, target.label)),
                None => self.line(format!("throw {}", t.value)),
            },
            IrStatement::While(w) => {
                self.line(format!("loop#{} {{", w.identity.label));
                self.nested(|p| p.chunk(&w.body));
                self.line("}");
            }
            IrStatement::Break(b) => self.line(format!("break loop#{}", b.from.label)),
            IrStatement::Continue(c) => self.line(format!("continue loop#{}", c.loop_.label)),
            IrStatement::DeallocateObject(t) => self.line(format!("deallocate {t}")),
            IrStatement::RegisterWeakReference(w) => self.line(format!(
                "register weak {} -> {}",
                w.weak_object, w.referred_object
            )),
            IrStatement::UnregisterWeakReference(w) => self.line(format!(
                "unregister weak {} -> {}",
                w.weak_object, w.referred_object
            )),
        }
    }

    fn temporary(&mut self, t: &IrTemporaryValueReference) {
        let decl = t.declaration();
        let prefix = format!(
            "{t}: {}{} =",
            decl.ty,
            if decl.counted_at_creation { " (counted)" } else { "" }
        );
        match &decl.value {
            IrExpression::IntegerLiteral(v) => self.line(format!("{prefix} {v}")),
            IrExpression::BooleanLiteral(v) => self.line(format!("{prefix} {v}")),
            IrExpression::StringLiteral(v) => self.line(format!("{prefix} {v:?}")),
            IrExpression::NullLiteral => self.line(format!("{prefix} null")),
            IrExpression::TemporaryValueReference(r) => self.line(format!("{prefix} {r}")),
            IrExpression::VariableAccess(v) => self.line(format!("{prefix} {}", v.name)),
            IrExpression::ClassMemberVariableAccess { base, member } => {
                self.line(format!("{prefix} {base}.{member}"))
            }
            IrExpression::StaticDispatchInvocation {
                function,
                arguments,
                landing_pad,
            } => {
                self.line(format!("{prefix} call {function}({})", join(arguments)));
                self.landing_pad(landing_pad.as_ref());
            }
            IrExpression::DynamicDispatchInvocation {
                interface,
                function,
                arguments,
                landing_pad,
            } => {
                self.line(format!(
                    "{prefix} dispatch {interface}::{function}({})",
                    join(arguments)
                ));
                self.landing_pad(landing_pad.as_ref());
            }
            IrExpression::AllocateObject { class } => self.line(format!("{prefix} allocate {class}")),
            IrExpression::IsNull(v) => self.line(format!("{prefix} isnull {v}")),
            IrExpression::NotNullAssertion(v) => self.line(format!("{prefix} notnull {v}")),
            IrExpression::IfExpression {
                condition,
                then_branch,
                else_branch,
            } => {
                self.line(format!("{prefix} if {condition} {{"));
                self.nested(|p| p.implicit(then_branch));
                self.line("} else {");
                self.nested(|p| p.implicit(else_branch));
                self.line("}");
            }
            IrExpression::TryCatchExpression {
                identity,
                body,
                catch_variable,
                catch_branch,
            } => {
                self.line(format!("{prefix} try#{} {{", identity.label));
                self.nested(|p| p.implicit(body));
                self.line(format!("}} catch {} {{", catch_variable.name));
                self.nested(|p| p.implicit(catch_branch));
                self.line("}");
            }
        }
    }

    fn landing_pad(&mut self, pad: Option<&IrInvocationLandingPad>) {
        let Some(pad) = pad else { return };
        let action = match &pad.action {
            IrLandingPadAction::Propagate => "propagate".to_string(),
            IrLandingPadAction::JumpToCatch(t) => format!("catch#{}", t.label),
            IrLandingPadAction::Swallow => "swallow".to_string(),
        };
        self.nested(|p| {
            p.line(format!("on exception ({action}) {{"));
            p.nested(|p| p.chunk(&pad.cleanup));
            p.line("}");
        });
    }
}

fn join(values: &[IrTemporaryValueReference]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
