use mplc::{
    backend::{
        CodegenOptions, compile, compile_typed,
        simulator::simulate,
        targets::{PhysicalRegister, TargetDescription, mips::MIPS, x64::X64},
    },
    error::CompileError,
    execution::{ExecutionLimits, ExecutionResult},
    middle::{
        interpreter::interpret,
        selector::select_program,
        tac::{
            StatementKind,
            parser::{parse_functions, parse_program},
            pretty_print::to_plain_text,
        },
        typed::{self, BinaryOperator, FunctionDefinition, Type, build::*},
    },
};

/// Runs `program` through the interpreter and through lowering plus the
/// simulator, requiring both to agree
fn run_on<R: PhysicalRegister>(
    program: &typed::Program,
    target: &TargetDescription<R>,
    limits: &ExecutionLimits,
) -> ExecutionResult {
    let (selected, compiled) = compile_typed(program, target, &CodegenOptions::default())
        .unwrap_or_else(|e| panic!("{}: {e}", target.name));

    let interpreted = interpret(&selected, target.word_size, limits)
        .unwrap_or_else(|e| panic!("{} interpreter: {e}", target.name));
    let simulated = simulate(&compiled, target, limits)
        .unwrap_or_else(|e| panic!("{} simulator: {e}\n{}", target.name, to_plain_text(&compiled)));

    assert_eq!(interpreted, simulated, "interpreter and {} disagree", target.name);
    simulated
}

fn run_everywhere_with(program: &typed::Program, limits: &ExecutionLimits) -> ExecutionResult {
    let x64 = run_on(program, &*X64, limits);
    let mips = run_on(program, &*MIPS, limits);

    assert_eq!(x64, mips, "targets disagree");
    x64
}

fn run_everywhere(program: &typed::Program) -> ExecutionResult {
    run_everywhere_with(program, &ExecutionLimits::default())
}

fn integer(name: &str) -> typed::Expression {
    identifier(name, Type::Integer)
}

fn function(
    name: &str,
    parameters: &[&str],
    statements: Vec<typed::Statement>,
) -> FunctionDefinition {
    FunctionDefinition {
        name: name.into(),
        parameters: parameters.iter().map(|p| parameter(p, Type::Integer)).collect(),
        return_type: Type::Integer,
        statements,
    }
}

#[test]
fn nested_products() {
    let product = binary(
        BinaryOperator::Multiply,
        binary(
            BinaryOperator::Multiply,
            number(2),
            binary(BinaryOperator::Multiply, number(3), number(4)),
        ),
        number(5),
    );

    let result = run_everywhere(&main_only(vec![ret(product)]));

    assert_eq!(result.exit_code, 120);
    assert_eq!(result.stdout, "");
}

#[test]
fn concatenation_compared_in_a_ternary() {
    let condition = binary(
        BinaryOperator::Equal,
        binary(BinaryOperator::Concatenate, string("a"), string("b")),
        string("ab"),
    );

    let result = run_everywhere(&main_only(vec![ret(ternary(condition, number(5), number(6)))]));

    assert_eq!(result.exit_code, 5);
    assert_eq!(result.stdout, "");
}

#[test]
fn recursive_factorial() {
    let recursive_case = binary(
        BinaryOperator::Multiply,
        integer("n"),
        call(
            "factorial",
            vec![binary(BinaryOperator::Subtract, integer("n"), number(1))],
            Type::Integer,
        ),
    );

    let program = typed::Program {
        functions: vec![function(
            "factorial",
            &["n"],
            vec![ret(ternary(
                binary(BinaryOperator::Equal, integer("n"), number(1)),
                number(1),
                recursive_case,
            ))],
        )],
        globals: vec![],
        main: vec![ret(call("factorial", vec![number(5)], Type::Integer))],
    };

    assert_eq!(run_everywhere(&program).exit_code, 120);
}

#[test]
fn seven_arguments_are_summed() {
    let names = ["a", "b", "c", "d", "e", "f", "g"];
    let sum = names[1..]
        .iter()
        .fold(integer(names[0]), |total, name| {
            binary(BinaryOperator::Add, total, integer(name))
        });

    let program = typed::Program {
        functions: vec![function("sum7", &names, vec![ret(sum)])],
        globals: vec![],
        main: vec![ret(call(
            "sum7",
            (1..=7).map(number).collect(),
            Type::Integer,
        ))],
    };

    assert_eq!(run_everywhere(&program).exit_code, 28);
}

#[test]
fn length_of_a_fresh_concatenation_frees_it_once() {
    let program = main_only(vec![ret(call(
        "length",
        vec![binary(BinaryOperator::Concatenate, string("a"), string("bc"))],
        Type::Integer,
    ))]);

    let result = run_everywhere(&program);

    // A leak or double free would print and exit with -1
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "");
}

#[test]
fn twenty_chained_temporaries() {
    let mut statements = vec![declare("a", number(1))];
    for n in 0..20 {
        statements.push(declare(
            &format!("t{n}"),
            binary(BinaryOperator::Add, integer("a"), number(n)),
        ));
    }
    statements.push(ret(binary(BinaryOperator::Subtract, integer("t19"), integer("t16"))));

    assert_eq!(run_everywhere(&main_only(statements)).exit_code, 3);
}

#[test]
fn every_temporary_live_at_once_forces_spills() {
    let mut statements = vec![declare("a", number(1))];
    for n in 0..20 {
        statements.push(declare(
            &format!("t{n}"),
            binary(BinaryOperator::Add, integer("a"), number(n)),
        ));
    }
    let total = (1..20).fold(integer("t0"), |sum, n| {
        binary(BinaryOperator::Add, sum, integer(&format!("t{n}")))
    });
    statements.push(ret(total));

    let program = main_only(statements);

    let selected = select_program(&program, &X64.runtime).unwrap();
    let compiled = compile(&selected, &*X64, &CodegenOptions::default()).unwrap();
    assert!(compiled.functions[0].stack_usage.spill_count > 0);

    // sum of 1 + n for n in 0..20
    assert_eq!(run_everywhere(&program).exit_code, 210);
}

#[test]
fn printing_reaches_stdout() {
    let program = main_only(vec![
        typed::Statement::Expression(call("print", vec![string("hello ")], Type::Integer)),
        typed::Statement::Expression(call(
            "print",
            vec![binary(BinaryOperator::Concatenate, string("wor"), string("ld"))],
            Type::Integer,
        )),
        ret(number(0)),
    ]);

    let result = run_everywhere(&program);

    assert_eq!(result.stdout, "hello world");
    assert_eq!(result.exit_code, 0);
}

#[test]
fn read_int_consumes_stdin() {
    let program = main_only(vec![ret(binary(
        BinaryOperator::Add,
        call("readInt", vec![], Type::Integer),
        number(1),
    ))]);

    let limits = ExecutionLimits {
        stdin: "41\n".into(),
        ..ExecutionLimits::default()
    };

    assert_eq!(run_everywhere_with(&program, &limits).exit_code, 42);
}

/// Runs a handwritten `main` against the full runtime library of each
/// target, requiring the interpreter and the simulator to agree
fn run_main_with_runtime(main_source: &str) -> ExecutionResult {
    fn on<R: PhysicalRegister>(main_source: &str, target: &TargetDescription<R>) -> ExecutionResult {
        let support = target.runtime;
        let mut program = select_program(&main_only(vec![ret(number(0))]), &support).unwrap();
        for function in mplc::middle::runtime::library(&support).unwrap() {
            if program.function(&function.name).is_none() {
                program.functions.push(function);
            }
        }
        program.main = parse_functions(main_source).unwrap().remove(0);

        let limits = ExecutionLimits::default();
        let compiled = compile(&program, target, &CodegenOptions::default()).unwrap();
        let simulated = simulate(&compiled, target, &limits).unwrap();
        let interpreted = interpret(&program, target.word_size, &limits).unwrap();

        assert_eq!(interpreted, simulated, "interpreter and {} disagree", target.name);
        simulated
    }

    let x64 = on(main_source, &*X64);
    let mips = on(main_source, &*MIPS);

    assert_eq!(x64, mips, "targets disagree");
    x64
}

#[test]
fn leaks_abort_the_lowered_program() {
    let result = run_main_with_runtime(
        "(function) main():\n    r:size = 4\n    r:buffer = my_malloc(r:size)\n    r:zero = 0\n    return r:zero\n",
    );

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stdout, "Leaks detected! Exiting.");
}

#[test]
fn double_free_aborts() {
    let result = run_main_with_runtime(
        "(function) main():
    r:size = 4
    r:buffer = my_malloc(r:size)
    my_free(r:buffer)
    my_free(r:buffer)
    r:zero = 0
    return r:zero
",
    );

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stdout, "Double free detected! Exiting.");
}

#[test]
fn freeing_null_aborts() {
    let result = run_main_with_runtime(
        "(function) main():
    r:null = 0
    my_free(r:null)
    r:zero = 0
    return r:zero
",
    );

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stdout, "Tried to free null pointer! Exiting.");
}

#[test]
fn zero_byte_allocations_abort() {
    let result = run_main_with_runtime(
        "(function) main():
    r:size = 0
    r:buffer = my_malloc(r:size)
    my_free(r:buffer)
    r:zero = 0
    return r:zero
",
    );

    assert_eq!(result.exit_code, -1);
    assert_eq!(result.stdout, "Zero memory requested! Exiting.");
}

#[test]
fn freed_blocks_are_reused_and_leave_no_leak() {
    let result = run_main_with_runtime(
        "(function) main():
    r:size = 8
    r:first = my_malloc(r:size)
    my_free(r:first)
    r:small = 4
    r:second = my_malloc(r:small)
    my_free(r:second)
    r:same = 0
    goto main_done if r:first != r:second
    r:same = 1
    main_done:
    return r:same
",
    );

    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "");
}

fn list_of_integers() -> Type {
    Type::List(Box::new(Type::Integer))
}

#[test]
fn list_indexing_reads_zero_out_of_range() {
    let numbers = || identifier("numbers", list_of_integers());

    let program = main_only(vec![
        declare("numbers", list(vec![number(1), number(2), number(7)])),
        ret(binary(
            BinaryOperator::Add,
            binary(
                BinaryOperator::Add,
                binary(BinaryOperator::Multiply, number(10), index(numbers(), number(0))),
                index(numbers(), number(2)),
            ),
            binary(
                BinaryOperator::Add,
                index(numbers(), number(3)),
                index(numbers(), number(-1)),
            ),
        )),
    ]);

    let result = run_everywhere(&program);

    assert_eq!(result.exit_code, 17);
    assert_eq!(result.stdout, "");
}

#[test]
fn computed_indices_select_items() {
    let program = main_only(vec![
        declare("i", number(1)),
        ret(index(
            list(vec![number(4), number(5), number(6)]),
            binary(BinaryOperator::Add, integer("i"), integer("i")),
        )),
    ]);

    assert_eq!(run_everywhere(&program).exit_code, 6);
}

fn string_length(value: typed::Expression) -> typed::Expression {
    call("length", vec![value], Type::Integer)
}

#[test]
fn string_globals_are_freed_at_exit() {
    let greeting = || identifier("greeting", Type::String);

    let program = typed::Program {
        functions: vec![],
        globals: vec![typed::GlobalDeclaration {
            name: "greeting".into(),
            ty: Type::String,
        }],
        main: vec![
            declare("greeting", string("hi")),
            reassign(
                "greeting",
                binary(BinaryOperator::Concatenate, greeting(), string("!")),
            ),
            ret(string_length(greeting())),
        ],
    };

    let result = run_everywhere(&program);

    // Leaking either copy of the global would exit with -1
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "");
}

#[test]
fn reassigned_string_locals_release_their_previous_copy() {
    let s = || identifier("s", Type::String);

    let program = typed::Program {
        functions: vec![FunctionDefinition {
            name: "grow".into(),
            parameters: vec![],
            return_type: Type::Integer,
            statements: vec![
                declare("s", string("a")),
                reassign("s", binary(BinaryOperator::Concatenate, s(), string("bc"))),
                reassign("s", binary(BinaryOperator::Concatenate, s(), s())),
                ret(string_length(s())),
            ],
        }],
        globals: vec![],
        main: vec![ret(call("grow", vec![], Type::Integer))],
    };

    let result = run_everywhere(&program);

    assert_eq!(result.exit_code, 6);
    assert_eq!(result.stdout, "");
}

#[test]
fn returned_strings_are_freed_by_the_caller() {
    let program = typed::Program {
        functions: vec![FunctionDefinition {
            name: "prefixed".into(),
            parameters: vec![parameter("suffix", Type::String)],
            return_type: Type::String,
            statements: vec![ret(binary(
                BinaryOperator::Concatenate,
                string("a"),
                identifier("suffix", Type::String),
            ))],
        }],
        globals: vec![],
        main: vec![
            declare("kept", call("prefixed", vec![string("b")], Type::String)),
            ret(binary(
                BinaryOperator::Add,
                string_length(call("prefixed", vec![string("bc")], Type::String)),
                string_length(identifier("kept", Type::String)),
            )),
        ],
    };

    let result = run_everywhere(&program);

    assert_eq!(result.exit_code, 5);
    assert_eq!(result.stdout, "");
}

#[test]
fn lowering_twice_gives_identical_code() {
    let program = main_only(vec![ret(call(
        "length",
        vec![binary(BinaryOperator::Concatenate, string("x"), string("yz"))],
        Type::Integer,
    ))]);
    let selected = select_program(&program, &MIPS.runtime).unwrap();

    let first = compile(&selected, &*MIPS, &CodegenOptions::default()).unwrap();
    let second = compile(&selected, &*MIPS, &CodegenOptions::default()).unwrap();

    assert_eq!(first, second);
    assert_eq!(to_plain_text(&first), to_plain_text(&second));
}

#[test]
fn comments_are_optional() {
    let selected = select_program(&main_only(vec![ret(number(3))]), &X64.runtime).unwrap();

    let commented = compile(&selected, &*X64, &CodegenOptions { emit_comments: true }).unwrap();
    let bare = compile(&selected, &*X64, &CodegenOptions { emit_comments: false }).unwrap();

    let comments = |program: &mplc::backend::lir::TargetProgram<_>| {
        program
            .functions
            .iter()
            .flat_map(|f| &f.instructions)
            .filter(|s| matches!(s.kind, mplc::backend::lir::TargetStatementKind::Empty))
            .count()
    };

    assert!(comments(&commented) > 0);
    assert_eq!(comments(&bare), 0);
    assert_eq!(
        simulate(&commented, &*X64, &ExecutionLimits::default()),
        simulate(&bare, &*X64, &ExecutionLimits::default())
    );
}

#[test]
fn syscalls_with_too_many_arguments_are_rejected() {
    let mut program = select_program(&main_only(vec![ret(number(0))]), &MIPS.runtime).unwrap();
    program.main = parse_functions("(function) main():\n    syscall exit 1 2 3\n")
        .unwrap()
        .remove(0);

    assert!(matches!(
        compile(&program, &*MIPS, &CodegenOptions::default()),
        Err(CompileError::ResourceExhausted {
            requested: 3,
            available: 2,
            ..
        })
    ));
}

#[test]
fn syscalls_missing_from_the_target_are_unsupported() {
    let mut program = select_program(&main_only(vec![ret(number(0))]), &MIPS.runtime).unwrap();
    program.main = parse_functions("(function) main():\n    r:p = syscall mmap 0 8\n    return r:p\n")
        .unwrap()
        .remove(0);

    assert!(matches!(
        compile(&program, &*MIPS, &CodegenOptions::default()),
        Err(CompileError::Unsupported(_))
    ));
}

#[test]
fn handwritten_text_programs_run() {
    let source = "\
(function) twice(r:x):
    r:y = r:x + r:x
    return r:y

(function) main():
    r:seven = 7
    r:f = &twice
    r:result = r:f(r:seven)
    return r:result
";
    let mut program = parse_program(source).unwrap();
    let runtime = select_program(&main_only(vec![ret(number(0))]), &X64.runtime).unwrap();
    program.functions.extend(runtime.functions);
    program.globals.extend(runtime.globals);
    program.string_literals.extend(runtime.string_literals);

    let compiled = compile(&program, &*X64, &CodegenOptions::default()).unwrap();

    assert!(compiled.functions[0]
        .instructions
        .iter()
        .any(|s| matches!(s.kind, mplc::backend::lir::TargetStatementKind::CallByRegister { .. })));
    assert!(program.main.instructions.iter().any(|s| matches!(
        s.kind,
        StatementKind::CallByRegister { .. }
    )));

    let interpreted = interpret(&program, 8, &ExecutionLimits::default()).unwrap();
    let simulated = simulate(&compiled, &*X64, &ExecutionLimits::default()).unwrap();

    assert_eq!(simulated.exit_code, 14);
    assert_eq!(interpreted, simulated);
}
