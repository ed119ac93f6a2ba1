//! Instruction selection: turns the typed program tree into three-address
//! code over an unbounded supply of virtual registers.

use std::collections::{BTreeMap, VecDeque};

use hashbrown::{HashMap, HashSet};
use log::debug;

use crate::{
    error::{CompileError, CompileResult},
    middle::{
        runtime::{self, RuntimeSupport},
        tac::{self, GlobalInfo, Register, Statement, StatementKind, StringLiteral},
        typed::{self, Type},
    },
};

mod compiled;
mod expression;

pub use compiled::CompiledExpression;

/// Hands out `name_N` with a fresh `N` on every call
#[derive(Debug, Default)]
pub struct IdAppender {
    next: usize,
}

impl IdAppender {
    pub fn append(&mut self, name: &str) -> String {
        let id = self.next;
        self.next += 1;
        format!("{name}_{id}")
    }
}

/// Per-function naming state for temporaries and labels. Labels carry the
/// function name so they stay unique once all functions share one
/// instruction stream.
#[derive(Debug)]
pub struct NameContext {
    function_name: String,
    temporaries: IdAppender,
    labels: IdAppender,
}

impl NameContext {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            temporaries: IdAppender::default(),
            labels: IdAppender::default(),
        }
    }

    pub fn temporary(&mut self, hint: &str) -> Register {
        Register::new(self.temporaries.append(hint))
    }

    pub fn label(&mut self, hint: &str) -> String {
        format!("{}_{}", self.function_name, self.labels.append(hint))
    }
}

#[derive(Debug, Default)]
pub struct StringLiteralTable {
    literals: Vec<StringLiteral>,
}

impl StringLiteralTable {
    /// Name of the literal holding `value`, registering it on first use
    pub fn intern(&mut self, value: &str) -> String {
        if let Some(existing) = self.literals.iter().find(|l| l.value == value) {
            return existing.name.clone();
        }

        let name = format!("string_literal_{}", self.literals.len());
        self.literals.push(StringLiteral {
            name: name.clone(),
            value: value.to_owned(),
        });
        name
    }

    pub fn into_literals(self) -> Vec<StringLiteral> {
        self.literals
    }
}

#[derive(Debug, Clone)]
struct GlobalBinding {
    mangled_name: String,
    ty: Type,
}

/// Facts about the whole program that every function's selection needs
#[derive(Debug)]
struct ProgramFacts {
    globals: HashMap<String, GlobalBinding>,
    /// User functions by name, with their return type
    functions: HashMap<String, Type>,
    word_size: i64,
}

/// Selection state for one function body
struct FunctionContext<'a> {
    names: NameContext,
    facts: &'a ProgramFacts,
    literals: &'a mut StringLiteralTable,
    scope: HashMap<String, Register>,
    return_type: Type,
    /// Locals holding heap copies of strings, released at every return
    owned_string_locals: Vec<Register>,
    is_main: bool,
}

fn statement(kind: StatementKind, why: impl Into<String>) -> Statement {
    Statement::new(kind, why)
}

impl<'a> FunctionContext<'a> {
    fn new(
        name: &str,
        facts: &'a ProgramFacts,
        literals: &'a mut StringLiteralTable,
        return_type: Type,
        is_main: bool,
    ) -> Self {
        Self {
            names: NameContext::new(name),
            facts,
            literals,
            scope: HashMap::new(),
            return_type,
            owned_string_locals: vec![],
            is_main,
        }
    }

    fn is_global_target(&self, name: &str) -> bool {
        !self.scope.contains_key(name) && self.facts.globals.contains_key(name)
    }

    /// Gives every declared local a register before any code is emitted, so
    /// reads that precede the declaration still resolve.
    fn preassign_locals(&mut self, statements: &[typed::Statement]) -> Vec<Statement> {
        let mut initialization = Vec::new();

        for s in statements {
            let typed::Statement::Declaration { name, value } = s else {
                continue;
            };

            if self.scope.contains_key(name) || (self.is_main && self.facts.globals.contains_key(name)) {
                continue;
            }

            let register = self.names.temporary(&format!("local_{name}"));

            if value.ty == Type::String {
                initialization.push(statement(
                    StatementKind::LoadImmediate {
                        value: 0,
                        destination: register.clone(),
                    },
                    format!("{name} owns no string yet"),
                ));
                self.owned_string_locals.push(register.clone());
            }

            self.scope.insert(name.clone(), register);
        }

        initialization
    }

    fn select_body(&mut self, statements: &[typed::Statement]) -> CompileResult<Vec<Statement>> {
        let mut instructions = self.preassign_locals(statements);

        for s in statements {
            instructions.extend(self.select_statement(s)?);
        }

        Ok(instructions)
    }
}

fn select_function(
    definition: &typed::FunctionDefinition,
    facts: &ProgramFacts,
    literals: &mut StringLiteralTable,
) -> CompileResult<tac::Function> {
    let mut context = FunctionContext::new(
        &definition.name,
        facts,
        literals,
        definition.return_type.clone(),
        false,
    );

    let arguments = definition
        .parameters
        .iter()
        .map(|parameter| {
            let register = Register::new(format!("arg_{}", parameter.name));
            context
                .scope
                .insert(parameter.name.clone(), register.clone());
            register
        })
        .collect();

    let instructions = context.select_body(&definition.statements)?;

    debug!(
        "selected {} ({} instructions)",
        definition.name,
        instructions.len()
    );

    Ok(tac::Function::new(
        definition.name.clone(),
        arguments,
        instructions,
    ))
}

/// Releases every string global that currently owns a buffer
fn free_globals(program: &typed::Program, facts: &ProgramFacts) -> tac::Function {
    let mut names = NameContext::new(runtime::FREE_GLOBALS);
    let mut instructions = Vec::new();

    for global in program.globals.iter().filter(|g| g.ty == Type::String) {
        let Some(binding) = facts.globals.get(&global.name) else {
            continue;
        };

        let value = names.temporary("global");
        let skip = names.label("skip_free");

        instructions.extend([
            statement(
                StatementKind::LoadGlobal {
                    from: binding.mangled_name.clone(),
                    to: value.clone(),
                },
                format!("load {}", global.name),
            ),
            statement(
                StatementKind::GotoIfZero {
                    register: value.clone(),
                    label: skip.clone(),
                },
                "never assigned",
            ),
            statement(
                StatementKind::CallByName {
                    function: runtime::MY_FREE.into(),
                    arguments: vec![value],
                    destination: None,
                },
                format!("free {}", global.name),
            ),
            statement(StatementKind::Label { name: skip }, ""),
        ]);
    }

    tac::Function::new(runtime::FREE_GLOBALS, vec![], instructions)
}

/// Keeps the functions transitively referenced from `roots`, in their
/// original order
fn prune_unreachable(
    roots: impl IntoIterator<Item = String>,
    main: &tac::Function,
    candidates: Vec<tac::Function>,
) -> Vec<tac::Function> {
    let by_name: HashMap<&str, &tac::Function> = candidates
        .iter()
        .map(|f| (f.name.as_str(), f))
        .chain(std::iter::once((main.name.as_str(), main)))
        .collect();

    let mut reachable: HashSet<String> = HashSet::new();
    let mut worklist: VecDeque<String> = roots.into_iter().collect();

    while let Some(name) = worklist.pop_front() {
        if !reachable.insert(name.clone()) {
            continue;
        }

        let Some(function) = by_name.get(name.as_str()) else {
            continue;
        };

        for instruction in &function.instructions {
            if let Some(symbol) = instruction.kind.referenced_symbol() {
                if by_name.contains_key(symbol) && !reachable.contains(symbol) {
                    worklist.push_back(symbol.to_owned());
                }
            }
        }
    }
    drop(by_name);

    candidates
        .into_iter()
        .filter(|f| reachable.contains(&f.name))
        .collect()
}

pub fn select_program(
    program: &typed::Program,
    runtime_support: &RuntimeSupport,
) -> CompileResult<tac::Program> {
    let word_size = runtime_support.word_size;
    let mut mangler = IdAppender::default();
    let mut globals = BTreeMap::new();
    let mut global_bindings = HashMap::new();

    for global in &program.globals {
        if global_bindings.contains_key(&global.name) {
            return Err(CompileError::internal(format!(
                "global '{}' is declared twice",
                global.name
            )));
        }

        let mangled_name = mangler.append(&global.name);

        globals.insert(
            global.name.clone(),
            GlobalInfo {
                mangled_name: mangled_name.clone(),
                bytes: global.ty.size_in_bytes(word_size),
            },
        );
        global_bindings.insert(
            global.name.clone(),
            GlobalBinding {
                mangled_name,
                ty: global.ty.clone(),
            },
        );
    }

    globals.insert(
        runtime::FIRST_BLOCK.to_owned(),
        GlobalInfo {
            mangled_name: runtime::FIRST_BLOCK.to_owned(),
            bytes: word_size,
        },
    );

    let facts = ProgramFacts {
        globals: global_bindings,
        functions: program
            .functions
            .iter()
            .map(|f| (f.name.clone(), f.return_type.clone()))
            .collect(),
        word_size: word_size as i64,
    };

    let mut literals = StringLiteralTable::default();

    let mut user_functions = program
        .functions
        .iter()
        .map(|f| select_function(f, &facts, &mut literals))
        .collect::<CompileResult<Vec<_>>>()?;

    let main = {
        let mut context =
            FunctionContext::new("main", &facts, &mut literals, Type::Integer, true);
        let instructions = context.select_body(&program.main)?;
        tac::Function::new("main", vec![], instructions)
    };

    user_functions.push(free_globals(program, &facts));

    let roots = [
        "main".to_owned(),
        runtime::VERIFY_NO_LEAKS.to_owned(),
        runtime::FREE_GLOBALS.to_owned(),
    ];

    let mut candidates = user_functions;
    candidates.extend(runtime::library(runtime_support)?);

    let functions = prune_unreachable(roots, &main, candidates);

    debug!(
        "program has {} functions after pruning unreachable code",
        functions.len() + 1
    );

    let mut string_literals = literals.into_literals();
    string_literals.extend(runtime::error_strings());

    Ok(tac::Program {
        globals,
        functions,
        main,
        string_literals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        runtime::RuntimeSupport,
        typed::{BinaryOperator, GlobalDeclaration, build::*},
    };

    fn support() -> RuntimeSupport {
        RuntimeSupport::sbrk_and_print(8)
    }

    fn names(program: &tac::Program) -> Vec<&str> {
        program.functions.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn id_appender_is_monotonic() {
        let mut appender = IdAppender::default();

        assert_eq!(appender.append("x"), "x_0");
        assert_eq!(appender.append("x"), "x_1");
        assert_eq!(appender.append("y"), "y_2");
    }

    #[test]
    fn labels_are_scoped_to_their_function() {
        let mut names = NameContext::new("fact");

        assert_eq!(names.label("else"), "fact_else_0");
        assert_eq!(names.temporary("lhs").name(), "lhs_0");
    }

    #[test]
    fn integer_program_keeps_only_the_leak_checker_runtime() {
        let program = select_program(&main_only(vec![ret(number(7))]), &support()).unwrap();

        let functions = names(&program);

        assert!(functions.contains(&runtime::VERIFY_NO_LEAKS));
        assert!(functions.contains(&runtime::FREE_GLOBALS));
        assert!(functions.contains(&"print"), "leak checker reports through print");
        assert!(!functions.contains(&"string_concatenate"));
        assert!(!functions.contains(&runtime::MY_MALLOC));
    }

    #[test]
    fn concatenation_pulls_in_allocation_and_string_routines() {
        let program = select_program(
            &main_only(vec![ret(call(
                "length",
                vec![binary(BinaryOperator::Concatenate, string("a"), string("bc"))],
                Type::Integer,
            ))]),
            &support(),
        )
        .unwrap();

        let functions = names(&program);

        for needed in ["length", "string_concatenate", runtime::MY_MALLOC, runtime::MY_FREE] {
            assert!(functions.contains(&needed), "missing {needed}: {functions:?}");
        }
        assert!(!functions.contains(&"string_equality"));
    }

    #[test]
    fn uncalled_user_functions_are_dropped_with_their_runtime() {
        let dead = typed::FunctionDefinition {
            name: "dead".into(),
            parameters: vec![],
            return_type: Type::Integer,
            statements: vec![ret(call(
                "length",
                vec![binary(BinaryOperator::Concatenate, string("a"), string("b"))],
                Type::Integer,
            ))],
        };
        let alive = typed::FunctionDefinition {
            name: "alive".into(),
            parameters: vec![],
            return_type: Type::Integer,
            statements: vec![ret(number(1))],
        };
        let program = typed::Program {
            functions: vec![dead, alive],
            globals: vec![],
            main: vec![ret(call("alive", vec![], Type::Integer))],
        };

        let selected = select_program(&program, &support()).unwrap();
        let functions = names(&selected);

        assert!(functions.contains(&"alive"));
        assert!(!functions.contains(&"dead"));
        assert!(!functions.contains(&"string_concatenate"));
        assert!(!functions.contains(&runtime::MY_MALLOC));
    }

    #[test]
    fn globals_are_mangled_and_sized_by_type() {
        let program = typed::Program {
            functions: vec![],
            globals: vec![
                GlobalDeclaration {
                    name: "point".into(),
                    ty: product(&[("x", Type::Integer), ("y", Type::Integer)]),
                },
                GlobalDeclaration {
                    name: "name".into(),
                    ty: Type::String,
                },
            ],
            main: vec![ret(number(0))],
        };

        let selected = select_program(&program, &support()).unwrap();

        assert_eq!(selected.globals["point"].mangled_name, "point_0");
        assert_eq!(selected.globals["point"].bytes, 16);
        assert_eq!(selected.globals["name"].mangled_name, "name_1");
        assert_eq!(selected.globals["name"].bytes, 8);
        assert_eq!(selected.globals[runtime::FIRST_BLOCK].bytes, 8);

        let free_globals = selected.function(runtime::FREE_GLOBALS).unwrap();
        assert!(free_globals.instructions.iter().any(|s| matches!(
            &s.kind,
            StatementKind::LoadGlobal { from, .. } if from == "name_1"
        )));
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let mut table = StringLiteralTable::default();

        let first = table.intern("ab");
        let second = table.intern("cd");

        assert_eq!(table.intern("ab"), first);
        assert_ne!(first, second);
        assert_eq!(table.into_literals().len(), 2);
    }
}
