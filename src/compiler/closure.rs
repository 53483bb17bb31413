//! Closure conversion and lambda lifting.
//!
//! Every lambda becomes a named top-level function whose parameter list is extended
//! with the variables it captures, and the place where the lambda appeared becomes a
//! [`MakeClosure`] node that evaluates those variables in the enclosing scope.
//!
//! Lambdas are converted innermost first, so by the time a lambda is analysed, every
//! lambda inside it is already a closure construction whose free-variable references
//! sit directly in its body.
use tracing::{debug, trace};

use crate::ast::{Ast, Binding, Lambda, MakeClosure, Name, NodeId, NodeKind, Var};

use super::{
    scope::{find_scope, ScopeError},
    Context,
};

/// Nodes below `id` (inclusive) in source order
fn pre_order(ast: &Ast, id: NodeId) -> Vec<NodeId> {
    let mut order = vec![];
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
        order.push(current);
        stack.extend(ast.children(current).into_iter().rev());
    }
    order
}

/// Convert every lambda in the program.
pub fn convert(ast: &mut Ast, context: &mut Context) -> Result<(), ScopeError> {
    let lambdas = ast
        .post_order(ast.root())
        .into_iter()
        .filter(|id| matches!(ast.kind(*id), NodeKind::Lambda(_)))
        .collect::<Vec<_>>();

    for id in lambdas {
        convert_lambda(ast, context, id)?;
    }
    Ok(())
}

/// Rewrites self-references and collects free variables in first-occurrence order.
fn analyse_body(
    ast: &mut Ast,
    lambda_id: NodeId,
    lambda: &Lambda,
    lifted: Name,
) -> Result<Vec<Name>, ScopeError> {
    let mut free = vec![];
    for id in pre_order(ast, lambda.body) {
        let NodeKind::Var(var) = *ast.kind(id) else {
            continue;
        };
        if var.is_recursive || lambda.params.contains(&var.name) {
            continue;
        }

        let scope = find_scope(ast, id, var.name)?;
        if scope == ast.root() {
            // builtin
            continue;
        }

        let binding = ast.symbols(scope).get(var.name).flatten();
        if scope == lambda_id && binding == Some(Binding::SelfRecursive) {
            trace!(node = %id, "self reference");
            *ast.kind_mut(id) = NodeKind::Var(Var {
                name: lifted,
                is_recursive: true,
                is_captured: false,
            });
        } else if (scope == lambda_id || ast.is_ancestor(scope, lambda_id))
            && !free.contains(&var.name)
        {
            // bound outside the body: either above the lambda, or in the table the
            // lambda itself carries as the body of a `let` or another lambda
            free.push(var.name);
        }
    }
    Ok(free)
}

/// Self-recursive calls pass the captured variables along explicitly
fn extend_recursive_calls(ast: &mut Ast, body: NodeId, lifted: Name, free: &[Name]) {
    for id in pre_order(ast, body) {
        let NodeKind::Apply(apply) = ast.kind(id) else {
            continue;
        };
        let calls_self = matches!(
            ast.kind(apply.operator),
            NodeKind::Var(Var { name, is_recursive: true, .. }) if *name == lifted
        );
        if !calls_self {
            continue;
        }

        let span = ast.span(id);
        let extra = free
            .iter()
            .map(|&name| {
                ast.alloc(
                    id,
                    span.clone(),
                    NodeKind::Var(Var {
                        name,
                        is_recursive: false,
                        is_captured: true,
                    }),
                )
            })
            .collect::<Vec<_>>();
        if let NodeKind::Apply(apply) = ast.kind_mut(id) {
            apply.operands.extend(extra);
        }
    }
}

fn convert_lambda(ast: &mut Ast, context: &mut Context, id: NodeId) -> Result<(), ScopeError> {
    let NodeKind::Lambda(lambda) = ast.kind(id).clone() else {
        unreachable!("only lambdas are queued for conversion");
    };
    let lifted = ast.intern(context.next_function_name());

    let free = analyse_body(ast, id, &lambda, lifted)?;
    extend_recursive_calls(ast, lambda.body, lifted, &free);

    let n_bound = lambda.params.len();
    let n_free = free.len();
    debug!(
        function = ast.resolve(lifted),
        n_bound,
        n_free,
        "lifting lambda"
    );

    let table = ast.symbols_mut(lambda.body);
    for &name in &free {
        table.insert_key(name);
    }

    let span = ast.span(id);
    let mut params = lambda.params;
    params.extend(free.iter().copied());
    let function = ast.alloc(
        ast.root(),
        span.clone(),
        NodeKind::Lambda(Lambda {
            name: Some(lifted),
            params,
            captured: n_free,
            body: lambda.body,
        }),
    );
    ast.push_function(function);

    let free_vars = free
        .iter()
        .map(|&name| {
            ast.alloc(
                id,
                span.clone(),
                NodeKind::Var(Var {
                    name,
                    is_recursive: false,
                    is_captured: false,
                }),
            )
        })
        .collect();
    ast.replace_kind(
        id,
        NodeKind::MakeClosure(MakeClosure {
            function: lifted,
            n_bound,
            n_free,
            free_vars,
        }),
    );
    ast.symbols_mut(id).remove_self_recursive();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::convert;
    use crate::{
        ast::{Ast, Name, NodeKind, Var},
        compiler::{parse_program, scope::resolve, Context},
    };
    use arbtest::arbtest;
    use assert2::{check, let_assert};

    fn converted(source: &str) -> Ast {
        let_assert!(Ok(mut ast) = parse_program(source));
        resolve(&mut ast);
        let mut context = Context::default();
        let_assert!(Ok(()) = convert(&mut ast, &mut context));
        ast
    }

    fn names(ast: &Ast, names: &[Name]) -> Vec<String> {
        names.iter().map(|n| ast.resolve(*n).to_owned()).collect()
    }

    #[test]
    fn closed_lambda_captures_nothing() {
        let ast = converted("((lambda (y) (plus y y)) 3)");
        let program = ast.program();
        check!(program.functions.len() == 1);
        let_assert!(NodeKind::Lambda(lifted) = ast.kind(program.functions[0]));
        check!(lifted.name.map(|n| ast.resolve(n)) == Some("_f0"));
        check!(names(&ast, &lifted.params) == ["y"]);
        check!(ast.parent(program.functions[0]) == Some(ast.root()));
        check!(ast.parent(lifted.body) == Some(program.functions[0]));

        let_assert!(NodeKind::Apply(apply) = ast.kind(program.main));
        let_assert!(NodeKind::MakeClosure(closure) = ast.kind(apply.operator));
        check!(ast.resolve(closure.function) == "_f0");
        check!(closure.n_bound == 1);
        check!(closure.n_free == 0);
        check!(closure.free_vars.is_empty());
    }

    #[test]
    fn free_variables_become_parameters() {
        let ast = converted("(let (x 1) (let (y 2) ((lambda (z) (plus x (plus y z))) 3)))");
        let_assert!(NodeKind::Lambda(lifted) = ast.kind(ast.program().functions[0]));
        check!(names(&ast, &lifted.params) == ["z", "x", "y"]);
        check!(lifted.captured == 2);
        check!(lifted.n_bound() == 1);
        check!(ast.symbols(lifted.body).len() == 3);
    }

    #[test]
    fn nested_lambdas_capture_through_closures() {
        let ast = converted("(let (a 1) (lambda (b) (lambda (c) (plus a (plus b c)))))");
        let functions = &ast.program().functions;
        check!(functions.len() == 2);
        let_assert!(NodeKind::Lambda(inner) = ast.kind(functions[0]));
        let_assert!(NodeKind::Lambda(outer) = ast.kind(functions[1]));
        check!(names(&ast, &inner.params) == ["c", "a", "b"]);
        // `a` reaches the inner closure through the outer one
        check!(names(&ast, &outer.params) == ["b", "a"]);

        let_assert!(NodeKind::MakeClosure(closure) = ast.kind(outer.body));
        check!(ast.resolve(closure.function) == "_f0");
        check!(closure.n_free == 2);
        let_assert!(NodeKind::Var(first) = ast.kind(closure.free_vars[0]));
        check!(ast.resolve(first.name) == "a");
        check!(ast.parent(closure.free_vars[0]) == Some(outer.body));
    }

    #[test]
    fn recursive_calls_pass_free_variables() {
        let source = "(let (k 1) (letrec (f (lambda (n) (if n (f (minus n k)) 0))) (f 5)))";
        let ast = converted(source);
        let function = ast.program().functions[0];
        let_assert!(NodeKind::Lambda(lifted) = ast.kind(function));
        check!(names(&ast, &lifted.params) == ["n", "k"]);

        let_assert!(NodeKind::If(branch) = ast.kind(lifted.body));
        let_assert!(NodeKind::Apply(call) = ast.kind(branch.then));
        let_assert!(NodeKind::Var(Var { name, is_recursive: true, .. }) = ast.kind(call.operator));
        check!(ast.resolve(*name) == "_f0");
        check!(call.operands.len() == 2);
        let_assert!(NodeKind::Var(extra) = ast.kind(call.operands[1]));
        check!(ast.resolve(extra.name) == "k");
        check!(extra.is_captured);

        // the marker is gone from the closure construction site
        let_assert!(NodeKind::Let(outer) = ast.kind(ast.program().main));
        let_assert!(NodeKind::Let(letrec) = ast.kind(outer.body));
        let_assert!(NodeKind::MakeClosure(_) = ast.kind(letrec.definition));
        check!(ast.symbols(letrec.definition).is_empty());
    }

    #[test]
    fn nested_recursion_rewrites_through_inner_closure() {
        let source = "(letrec (f (lambda (n) (lambda (m) (f m)))) f)";
        let ast = converted(source);
        let functions = &ast.program().functions;
        let_assert!(NodeKind::Lambda(inner) = ast.kind(functions[0]));
        check!(names(&ast, &inner.params) == ["m", "f"]);
        let_assert!(NodeKind::Lambda(outer) = ast.kind(functions[1]));
        check!(names(&ast, &outer.params) == ["n"]);

        let_assert!(NodeKind::MakeClosure(closure) = ast.kind(outer.body));
        let_assert!(NodeKind::Var(captured) = ast.kind(closure.free_vars[0]));
        check!(captured.is_recursive);
        check!(ast.resolve(captured.name) == "_f1");
    }

    #[test]
    fn undefined_free_variable_fails() {
        let_assert!(Ok(mut ast) = parse_program("(lambda (x) (plus x nope))"));
        resolve(&mut ast);
        let_assert!(Err(error) = convert(&mut ast, &mut Context::default()));
        check!(error.to_string() == "undefined variable `nope`");
    }

    /// Builds `(lambda (p0) (lambda (p1) ... (plus pK pJ)))` style towers
    fn lambda_tower(depth: usize, refs: &[usize]) -> String {
        let mut body = "0".to_owned();
        for r in refs {
            body = format!("(plus p{} {body})", r % depth);
        }
        let mut source = body;
        for level in (0..depth).rev() {
            source = format!("(lambda (p{level}) {source})");
        }
        source
    }

    #[test]
    fn lifting_leaves_no_nested_lambdas() {
        arbtest(|u| {
            let depth = u.int_in_range(1..=5)?;
            let refs: Vec<usize> = u.arbitrary()?;
            let source = lambda_tower(depth, &refs);
            let ast = converted(&source);
            let program = ast.program();
            check!(program.functions.len() == depth);

            let mut seen = std::collections::HashSet::new();
            for &function in &program.functions {
                let_assert!(NodeKind::Lambda(lifted) = ast.kind(function));
                let_assert!(Some(name) = lifted.name);
                check!(seen.insert(name), "duplicate function name");
                for node in ast.post_order(lifted.body) {
                    check!(
                        !matches!(ast.kind(node), NodeKind::Lambda(_)),
                        "lambda left in {source}"
                    );
                }
            }
            Ok(())
        });
    }
}
