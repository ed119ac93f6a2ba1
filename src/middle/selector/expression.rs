use crate::{
    error::{CompileError, CompileResult},
    middle::{
        runtime,
        selector::{CompiledExpression, FunctionContext, statement},
        tac::{Register, Statement, StatementKind},
        typed::{self, BinaryOperator, Expression, ExpressionKind, Type},
    },
};

fn load_immediate(value: i64, destination: &Register, why: impl Into<String>) -> Statement {
    statement(
        StatementKind::LoadImmediate {
            value,
            destination: destination.clone(),
        },
        why,
    )
}

fn move_register(from: &Register, to: &Register, why: impl Into<String>) -> Statement {
    statement(
        StatementKind::Move {
            from: from.clone(),
            to: to.clone(),
        },
        why,
    )
}

fn call(
    function: &str,
    arguments: &[&Register],
    destination: Option<&Register>,
    why: impl Into<String>,
) -> Statement {
    statement(
        StatementKind::CallByName {
            function: function.to_owned(),
            arguments: arguments.iter().map(|&a| a.clone()).collect(),
            destination: destination.cloned(),
        },
        why,
    )
}

fn label(name: &str) -> Statement {
    statement(StatementKind::Label { name: name.to_owned() }, "")
}

fn goto(label: &str, why: impl Into<String>) -> Statement {
    statement(
        StatementKind::Goto {
            label: label.to_owned(),
        },
        why,
    )
}

/// Names of runtime routines that user code may call directly
fn builtin(name: &str) -> Option<&'static str> {
    runtime::BUILTINS.iter().copied().find(|&b| b == name)
}

impl FunctionContext<'_> {
    /// Instructions that leave a heap copy of the string in `source` in
    /// `copy`
    fn copy_string(&mut self, source: &Register, copy: &Register) -> Vec<Statement> {
        let length = self.names.temporary("length");

        vec![
            call("length", &[source], Some(&length), "measure string to copy"),
            statement(
                StatementKind::Increment {
                    register: length.clone(),
                },
                "room for the terminator",
            ),
            call(runtime::MY_MALLOC, &[&length], Some(copy), "allocate copy"),
            call("string_copy", &[source, copy], None, "copy string"),
        ]
    }

    /// Frees `register` unless it holds null
    fn free_if_owned(&mut self, register: &Register, why: &str) -> Vec<Statement> {
        let skip = self.names.label("skip_free");

        vec![
            statement(
                StatementKind::GotoIfZero {
                    register: register.clone(),
                    label: skip.clone(),
                },
                "nothing to free",
            ),
            call(runtime::MY_FREE, &[register], None, why),
            label(&skip),
        ]
    }

    /// A heap buffer that lives until the end of the enclosing statement.
    /// `produce` fills `buffer`; the flag records whether that happened, since
    /// a ternary may skip the producing branch.
    fn owned_temporary(
        &mut self,
        destination: &Register,
        produce: impl FnOnce(&mut Self, &Register) -> Vec<Statement>,
    ) -> CompiledExpression {
        let buffer = self.names.temporary("owned_buffer");
        let materialized = self.names.temporary("owned_flag");

        let mut execute = produce(self, &buffer);
        execute.push(load_immediate(1, &materialized, "buffer now owned"));
        execute.push(move_register(&buffer, destination, "hand out the buffer"));

        let skip = self.names.label("skip_release");
        let release = vec![
            statement(
                StatementKind::GotoIfZero {
                    register: materialized.clone(),
                    label: skip.clone(),
                },
                "buffer was never allocated",
            ),
            call(runtime::MY_FREE, &[&buffer], None, "release temporary buffer"),
            label(&skip),
        ];

        CompiledExpression::acquire(
            vec![load_immediate(0, &materialized, "no buffer yet")],
            execute,
            release,
        )
    }

    fn select_into_temporary(
        &mut self,
        expression: &Expression,
        hint: &str,
    ) -> CompileResult<(Register, CompiledExpression)> {
        let register = self.names.temporary(hint);
        let compiled = self.select_expression(expression, &register)?;
        Ok((register, compiled))
    }

    pub(super) fn select_expression(
        &mut self,
        expression: &Expression,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        match &expression.kind {
            ExpressionKind::Number(value) => Ok(CompiledExpression::execute(vec![load_immediate(
                *value,
                destination,
                "number literal",
            )])),
            ExpressionKind::Boolean(value) => Ok(CompiledExpression::execute(vec![
                load_immediate(i64::from(*value), destination, "boolean literal"),
            ])),
            ExpressionKind::String(value) => {
                let symbol_name = self.literals.intern(value);

                Ok(CompiledExpression::execute(vec![statement(
                    StatementKind::LoadSymbolAddress {
                        symbol_name,
                        to: destination.clone(),
                    },
                    "string literal",
                )]))
            }
            ExpressionKind::Identifier(name) => self.select_identifier(name, &expression.ty, destination),
            ExpressionKind::FunctionLiteral { name } => {
                Ok(CompiledExpression::execute(vec![statement(
                    StatementKind::LoadSymbolAddress {
                        symbol_name: name.clone(),
                        to: destination.clone(),
                    },
                    "function literal",
                )]))
            }
            ExpressionKind::Binary { operator, lhs, rhs } => {
                self.select_binary(*operator, lhs, rhs, destination)
            }
            ExpressionKind::Ternary {
                condition,
                if_true,
                if_false,
            } => self.select_ternary(condition, if_true, if_false, destination),
            ExpressionKind::Call {
                function,
                arguments,
            } => self.select_call(function, arguments, &expression.ty, destination),
            ExpressionKind::ObjectLiteral { members } => {
                self.select_object_literal(members, destination)
            }
            ExpressionKind::MemberAccess { object, member } => {
                let offset = object
                    .ty
                    .member_offset(member, self.facts.word_size as usize)
                    .ok_or_else(|| {
                        CompileError::unsupported(format!(
                            "member access '{member}' on a value of type {:?}",
                            object.ty
                        ))
                    })?;

                let (object_register, compiled) = self.select_into_temporary(object, "object")?;

                let own = CompiledExpression::execute(vec![statement(
                    StatementKind::LoadMemory {
                        from: object_register,
                        to: destination.clone(),
                        offset: offset as i64,
                    },
                    format!("read member {member}"),
                )]);

                Ok(CompiledExpression::sequence(vec![compiled, own]))
            }
            ExpressionKind::ListLiteral { items } => self.select_list_literal(items, destination),
            ExpressionKind::IndexAccess { list, index } => {
                self.select_index_access(list, index, destination)
            }
        }
    }

    fn select_identifier(
        &mut self,
        name: &str,
        ty: &Type,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        if let Some(register) = self.scope.get(name) {
            return Ok(CompiledExpression::execute(vec![move_register(
                register,
                destination,
                format!("read {name}"),
            )]));
        }

        if let Some(global) = self.facts.globals.get(name) {
            let kind = if matches!(global.ty, Type::Product(_)) {
                StatementKind::LoadSymbolAddress {
                    symbol_name: global.mangled_name.clone(),
                    to: destination.clone(),
                }
            } else {
                StatementKind::LoadGlobal {
                    from: global.mangled_name.clone(),
                    to: destination.clone(),
                }
            };

            return Ok(CompiledExpression::execute(vec![statement(
                kind,
                format!("read global {name}"),
            )]));
        }

        let symbol = if self.facts.functions.contains_key(name) {
            name
        } else if let Some(builtin) = builtin(name) {
            builtin
        } else {
            return Err(CompileError::unsupported(format!(
                "identifier '{name}' of type {ty:?} has no storage"
            )));
        };

        Ok(CompiledExpression::execute(vec![statement(
            StatementKind::LoadSymbolAddress {
                symbol_name: symbol.to_owned(),
                to: destination.clone(),
            },
            format!("address of {name}"),
        )]))
    }

    fn select_binary(
        &mut self,
        operator: BinaryOperator,
        lhs: &Expression,
        rhs: &Expression,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let (lhs_register, lhs_compiled) = self.select_into_temporary(lhs, "lhs")?;
        let (rhs_register, rhs_compiled) = self.select_into_temporary(rhs, "rhs")?;

        let arithmetic = |kind: fn(Register, Register, Register) -> StatementKind, why: &str| {
            CompiledExpression::execute(vec![statement(
                kind(lhs_register.clone(), rhs_register.clone(), destination.clone()),
                why,
            )])
        };

        let own = match operator {
            BinaryOperator::Add => arithmetic(
                |lhs, rhs, destination| StatementKind::Add {
                    lhs,
                    rhs,
                    destination,
                },
                "add",
            ),
            BinaryOperator::Subtract => arithmetic(
                |lhs, rhs, destination| StatementKind::Subtract {
                    lhs,
                    rhs,
                    destination,
                },
                "subtract",
            ),
            BinaryOperator::Multiply => arithmetic(
                |lhs, rhs, destination| StatementKind::Multiply {
                    lhs,
                    rhs,
                    destination,
                },
                "multiply",
            ),
            BinaryOperator::Equal if lhs.ty == Type::String => {
                CompiledExpression::execute(vec![call(
                    "string_equality",
                    &[&lhs_register, &rhs_register],
                    Some(destination),
                    "compare strings",
                )])
            }
            BinaryOperator::Equal => {
                let equal = self.names.label("equal");
                let end = self.names.label("equality_end");

                CompiledExpression::execute(vec![
                    statement(
                        StatementKind::GotoIfEqual {
                            lhs: lhs_register.clone(),
                            rhs: rhs_register.clone(),
                            label: equal.clone(),
                        },
                        "compare",
                    ),
                    load_immediate(0, destination, "not equal"),
                    goto(&end, ""),
                    label(&equal),
                    load_immediate(1, destination, "equal"),
                    label(&end),
                ])
            }
            BinaryOperator::Concatenate => {
                let lhs_length = self.names.temporary("lhs_length");
                let rhs_length = self.names.temporary("rhs_length");
                let total = self.names.temporary("total_length");
                let (lhs_source, rhs_source) = (lhs_register.clone(), rhs_register.clone());

                self.owned_temporary(destination, move |_, buffer| {
                    vec![
                        call("length", &[&lhs_source], Some(&lhs_length), "lhs length"),
                        call("length", &[&rhs_source], Some(&rhs_length), "rhs length"),
                        statement(
                            StatementKind::Add {
                                lhs: lhs_length.clone(),
                                rhs: rhs_length.clone(),
                                destination: total.clone(),
                            },
                            "combined length",
                        ),
                        statement(
                            StatementKind::Increment {
                                register: total.clone(),
                            },
                            "room for the terminator",
                        ),
                        call(runtime::MY_MALLOC, &[&total], Some(buffer), "allocate result"),
                        call(
                            "string_concatenate",
                            &[&lhs_source, &rhs_source, buffer],
                            None,
                            "concatenate",
                        ),
                    ]
                })
            }
        };

        Ok(CompiledExpression::sequence(vec![lhs_compiled, rhs_compiled, own]))
    }

    fn select_ternary(
        &mut self,
        condition: &Expression,
        if_true: &Expression,
        if_false: &Expression,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let (condition_register, condition_compiled) =
            self.select_into_temporary(condition, "condition")?;
        let true_compiled = self.select_expression(if_true, destination)?;
        let false_compiled = self.select_expression(if_false, destination)?;

        let false_label = self.names.label("false_branch");
        let end_label = self.names.label("ternary_end");

        Ok(CompiledExpression::compose(
            vec![condition_compiled, true_compiled, false_compiled],
            move |executes| {
                let mut executes = executes.into_iter();
                let mut condition = executes.next().unwrap_or_default();
                let if_true = executes.next().unwrap_or_default();
                let if_false = executes.next().unwrap_or_default();

                condition.push(statement(
                    StatementKind::GotoIfZero {
                        register: condition_register,
                        label: false_label.clone(),
                    },
                    "ternary condition",
                ));
                condition.extend(if_true);
                condition.push(goto(&end_label, "skip false branch"));
                condition.push(label(&false_label));
                condition.extend(if_false);
                condition.push(label(&end_label));
                condition
            },
        ))
    }

    fn select_call(
        &mut self,
        function: &str,
        arguments: &[Expression],
        return_type: &Type,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let mut parts = Vec::with_capacity(arguments.len() + 2);
        let mut argument_registers = Vec::with_capacity(arguments.len());

        for (index, argument) in arguments.iter().enumerate() {
            let (register, compiled) =
                self.select_into_temporary(argument, &format!("argument{index}"))?;
            argument_registers.push(register);
            parts.push(compiled);
        }

        enum Callee {
            Name(String),
            Register(Register),
        }

        let callee = if let Some(register) = self.scope.get(function) {
            Callee::Register(register.clone())
        } else if self.facts.functions.contains_key(function) {
            Callee::Name(function.to_owned())
        } else if let Some(builtin) = builtin(function) {
            Callee::Name(builtin.to_owned())
        } else if let Some(global) = self.facts.globals.get(function) {
            let pointer = self.names.temporary("function_pointer");
            parts.push(CompiledExpression::execute(vec![statement(
                StatementKind::LoadGlobal {
                    from: global.mangled_name.clone(),
                    to: pointer.clone(),
                },
                format!("load function {function}"),
            )]));
            Callee::Register(pointer)
        } else {
            return Err(CompileError::unsupported(format!(
                "call to unknown function '{function}'"
            )));
        };

        let is_user_function = builtin(function).is_none() || self.scope.contains_key(function);
        let why = format!("call {function}");

        let kind = move |destination: Register| match callee {
            Callee::Name(function) => StatementKind::CallByName {
                function,
                arguments: argument_registers,
                destination: Some(destination),
            },
            Callee::Register(function) => StatementKind::CallByRegister {
                function,
                arguments: argument_registers,
                destination: Some(destination),
            },
        };

        let own = if *return_type == Type::String && is_user_function {
            self.owned_temporary(destination, move |_, buffer| {
                vec![statement(kind(buffer.clone()), why)]
            })
        } else {
            CompiledExpression::execute(vec![statement(kind(destination.clone()), why)])
        };

        parts.push(own);

        Ok(CompiledExpression::sequence(parts))
    }

    fn select_object_literal(
        &mut self,
        members: &[(String, Expression)],
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let word_size = self.facts.word_size;
        let object = self.names.temporary("object");
        let mut parts = Vec::with_capacity(members.len() + 1);
        let mut stores = vec![statement(
            StatementKind::Alloca {
                bytes: members.len() as i64 * word_size,
                register: object.clone(),
            },
            "object literal storage",
        )];

        for (index, (name, value)) in members.iter().enumerate() {
            let (register, compiled) = self.select_into_temporary(value, "member")?;
            parts.push(compiled);
            stores.push(statement(
                StatementKind::StoreMemory {
                    from: register,
                    address: object.clone(),
                    offset: index as i64 * word_size,
                },
                format!("store member {name}"),
            ));
        }

        stores.push(move_register(&object, destination, "object literal"));
        parts.push(CompiledExpression::execute(stores));

        Ok(CompiledExpression::sequence(parts))
    }

    fn select_list_literal(
        &mut self,
        items: &[Expression],
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let word_size = self.facts.word_size;
        let list = self.names.temporary("list");
        let length = self.names.temporary("list_length");
        let mut parts = Vec::with_capacity(items.len() + 1);
        let mut stores = vec![
            statement(
                StatementKind::Alloca {
                    bytes: (items.len() as i64 + 1) * word_size,
                    register: list.clone(),
                },
                "list literal storage",
            ),
            load_immediate(items.len() as i64, &length, "list length"),
            statement(
                StatementKind::StoreMemory {
                    from: length,
                    address: list.clone(),
                    offset: 0,
                },
                "length prefix",
            ),
        ];

        for (index, item) in items.iter().enumerate() {
            let (register, compiled) = self.select_into_temporary(item, "item")?;
            parts.push(compiled);
            stores.push(statement(
                StatementKind::StoreMemory {
                    from: register,
                    address: list.clone(),
                    offset: (index as i64 + 1) * word_size,
                },
                format!("store item {index}"),
            ));
        }

        stores.push(move_register(&list, destination, "list literal"));
        parts.push(CompiledExpression::execute(stores));

        Ok(CompiledExpression::sequence(parts))
    }

    /// Out-of-range indices, negative ones included, read as zero.
    fn select_index_access(
        &mut self,
        list: &Expression,
        index: &Expression,
        destination: &Register,
    ) -> CompileResult<CompiledExpression> {
        let word_size = self.facts.word_size;
        let (list_register, list_compiled) = self.select_into_temporary(list, "indexed_list")?;
        let (index_register, index_compiled) = self.select_into_temporary(index, "index")?;

        let length = self.names.temporary("length");
        let last_index = self.names.temporary("last_index");
        let zero = self.names.temporary("zero");
        let word = self.names.temporary("word_size");
        let offset = self.names.temporary("item_offset");
        let address = self.names.temporary("item_address");
        let out_of_range = self.names.label("out_of_range");
        let end = self.names.label("index_end");

        let own = CompiledExpression::execute(vec![
            statement(
                StatementKind::LoadMemory {
                    from: list_register.clone(),
                    to: length.clone(),
                    offset: 0,
                },
                "list length",
            ),
            move_register(&length, &last_index, ""),
            statement(
                StatementKind::AddImmediate {
                    register: last_index.clone(),
                    amount: -1,
                },
                "last valid index",
            ),
            load_immediate(0, &zero, ""),
            statement(
                StatementKind::GotoIfGreater {
                    lhs: index_register.clone(),
                    rhs: last_index,
                    label: out_of_range.clone(),
                },
                "index past the end",
            ),
            statement(
                StatementKind::GotoIfGreater {
                    lhs: zero,
                    rhs: index_register.clone(),
                    label: out_of_range.clone(),
                },
                "negative index",
            ),
            load_immediate(word_size, &word, ""),
            statement(
                StatementKind::Multiply {
                    lhs: index_register,
                    rhs: word,
                    destination: offset.clone(),
                },
                "item offset",
            ),
            statement(
                StatementKind::Add {
                    lhs: list_register,
                    rhs: offset,
                    destination: address.clone(),
                },
                "item address",
            ),
            statement(
                StatementKind::LoadMemory {
                    from: address,
                    to: destination.clone(),
                    offset: word_size,
                },
                "skip the length prefix",
            ),
            goto(&end, ""),
            label(&out_of_range),
            load_immediate(0, destination, "out of range reads as zero"),
            label(&end),
        ]);

        Ok(CompiledExpression::sequence(vec![list_compiled, index_compiled, own]))
    }

    /// Stores `value` into the variable `name`, copying strings so that every
    /// string variable owns its buffer.
    fn select_assignment(&mut self, name: &str, value: &Expression) -> CompileResult<Vec<Statement>> {
        let word_size = self.facts.word_size;

        if self.is_global_target(name) {
            let Some(global) = self.facts.globals.get(name).cloned() else {
                return Err(CompileError::internal(format!("global '{name}' vanished")));
            };

            let (register, compiled) = self.select_into_temporary(value, "global_value")?;
            let mut statements = compiled.prepare;
            statements.extend(compiled.execute);

            match &global.ty {
                Type::String => {
                    let previous = self.names.temporary("previous");
                    let copy = self.names.temporary("global_copy");

                    statements.push(statement(
                        StatementKind::LoadGlobal {
                            from: global.mangled_name.clone(),
                            to: previous.clone(),
                        },
                        format!("previous value of {name}"),
                    ));
                    statements.extend(self.copy_string(&register, &copy));
                    statements.push(statement(
                        StatementKind::StoreGlobal {
                            from: copy,
                            to: global.mangled_name.clone(),
                        },
                        format!("assign {name}"),
                    ));
                    statements.extend(self.free_if_owned(&previous, "release previous value"));
                }
                Type::Product(members) => {
                    let storage = self.names.temporary("global_storage");
                    statements.push(statement(
                        StatementKind::LoadSymbolAddress {
                            symbol_name: global.mangled_name.clone(),
                            to: storage.clone(),
                        },
                        format!("storage of {name}"),
                    ));

                    for (index, member) in members.iter().enumerate() {
                        let word = self.names.temporary("member_word");
                        let offset = index as i64 * word_size;

                        statements.push(statement(
                            StatementKind::LoadMemory {
                                from: register.clone(),
                                to: word.clone(),
                                offset,
                            },
                            format!("read {}", member.name),
                        ));
                        statements.push(statement(
                            StatementKind::StoreMemory {
                                from: word,
                                address: storage.clone(),
                                offset,
                            },
                            format!("copy {}", member.name),
                        ));
                    }
                }
                _ => statements.push(statement(
                    StatementKind::StoreGlobal {
                        from: register,
                        to: global.mangled_name.clone(),
                    },
                    format!("assign {name}"),
                )),
            }

            statements.extend(compiled.cleanup);
            return Ok(statements);
        }

        let Some(local) = self.scope.get(name).cloned() else {
            return Err(CompileError::unsupported(format!(
                "assignment to unknown variable '{name}'"
            )));
        };

        if value.ty != Type::String {
            return Ok(self.select_expression(value, &local)?.into_statements());
        }

        if !self.owned_string_locals.contains(&local) {
            return Err(CompileError::unsupported(format!(
                "reassigning the borrowed string parameter '{name}'"
            )));
        }

        let (register, compiled) = self.select_into_temporary(value, "string_value")?;
        let previous = self.names.temporary("previous");

        let mut statements = compiled.prepare;
        statements.extend(compiled.execute);
        statements.push(move_register(&local, &previous, format!("previous value of {name}")));
        statements.extend(self.copy_string(&register, &local));
        statements.extend(self.free_if_owned(&previous, "release previous value"));
        statements.extend(compiled.cleanup);

        Ok(statements)
    }

    fn select_return(&mut self, value: &Expression) -> CompileResult<Vec<Statement>> {
        let (mut result, compiled) = self.select_into_temporary(value, "result")?;

        let mut statements = compiled.prepare;
        statements.extend(compiled.execute);

        if self.return_type == Type::String && !self.is_main {
            let copy = self.names.temporary("returned_string");
            statements.extend(self.copy_string(&result, &copy));
            result = copy;
        }

        statements.extend(compiled.cleanup);

        for local in self.owned_string_locals.clone() {
            statements.extend(self.free_if_owned(&local, "release string local"));
        }

        statements.push(statement(
            StatementKind::Return {
                register: Some(result),
            },
            "",
        ));

        Ok(statements)
    }

    pub(super) fn select_statement(&mut self, s: &typed::Statement) -> CompileResult<Vec<Statement>> {
        match s {
            typed::Statement::Declaration { name, value }
            | typed::Statement::Reassignment { name, value } => self.select_assignment(name, value),
            typed::Statement::Return(value) => self.select_return(value),
            typed::Statement::Expression(value) => {
                let discarded = self.names.temporary("discarded");
                Ok(self.select_expression(value, &discarded)?.into_statements())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::middle::{
        runtime::RuntimeSupport,
        selector::select_program,
        tac::{self, StatementKind},
        typed::{BinaryOperator, ExpressionKind, Type, build::*},
    };

    fn main_of(statements: Vec<crate::middle::typed::Statement>) -> tac::Function {
        select_program(&main_only(statements), &RuntimeSupport::sbrk_and_print(8))
            .unwrap()
            .main
    }

    fn kinds(function: &tac::Function) -> Vec<&StatementKind> {
        function.instructions.iter().map(|s| &s.kind).collect()
    }

    #[test]
    fn arithmetic_uses_two_temporaries_and_one_opcode() {
        let main = main_of(vec![ret(binary(BinaryOperator::Add, number(1), number(2)))]);

        let kinds = kinds(&main);
        assert!(matches!(kinds[0], StatementKind::LoadImmediate { value: 1, .. }));
        assert!(matches!(kinds[1], StatementKind::LoadImmediate { value: 2, .. }));
        assert!(matches!(kinds[2], StatementKind::Add { .. }));
        assert!(matches!(kinds[3], StatementKind::Return { register: Some(_) }));
    }

    #[test]
    fn ternary_branches_around_the_true_arm() {
        let main = main_of(vec![ret(ternary(boolean(false), number(1), number(2)))]);

        let text: Vec<_> = kinds(&main).iter().map(|k| format!("{k:?}")).collect();
        let position = |needle: &str| text.iter().position(|t| t.contains(needle)).unwrap();

        assert!(position("GotoIfZero") < position("value: 1"));
        assert!(position("value: 1") < position("Goto { label"));
        assert!(position("Label { name: \"main_false_branch") < position("value: 2"));
    }

    #[test]
    fn concatenation_release_is_guarded_by_its_flag() {
        let main = main_of(vec![ret(call(
            "length",
            vec![binary(BinaryOperator::Concatenate, string("a"), string("b"))],
            Type::Integer,
        ))]);

        let kinds = kinds(&main);

        let flag_cleared = kinds
            .iter()
            .position(|k| matches!(k, StatementKind::LoadImmediate { value: 0, destination } if destination.name().starts_with("owned_flag")))
            .unwrap();
        let malloc = kinds
            .iter()
            .position(|k| matches!(k, StatementKind::CallByName { function, .. } if function == "my_malloc"))
            .unwrap();
        let free = kinds
            .iter()
            .position(|k| matches!(k, StatementKind::CallByName { function, .. } if function == "my_free"))
            .unwrap();
        let length = kinds
            .iter()
            .rposition(|k| matches!(k, StatementKind::CallByName { function, .. } if function == "length"))
            .unwrap();

        assert_eq!(flag_cleared, 0, "flag is cleared before anything runs");
        assert!(malloc < length && length < free);
        assert!(matches!(kinds[free - 1], StatementKind::GotoIfZero { .. }));
    }

    #[test]
    fn string_locals_are_released_before_returning() {
        let main = main_of(vec![
            declare("s", string("abc")),
            ret(call("length", vec![identifier("s", Type::String)], Type::Integer)),
        ]);

        let kinds = kinds(&main);
        let last_free = kinds
            .iter()
            .rposition(|k| matches!(k, StatementKind::CallByName { function, .. } if function == "my_free"))
            .unwrap();
        let ret = kinds
            .iter()
            .position(|k| matches!(k, StatementKind::Return { .. }))
            .unwrap();

        assert!(last_free < ret);
        assert!(matches!(kinds[0], StatementKind::LoadImmediate { value: 0, .. }));
    }

    #[test]
    fn member_access_reads_at_the_member_offset() {
        let point = product(&[("x", Type::Integer), ("y", Type::Integer)]);
        let object = crate::middle::typed::Expression {
            kind: ExpressionKind::ObjectLiteral {
                members: vec![("x".into(), number(3)), ("y".into(), number(4))],
            },
            ty: point,
        };
        let access = crate::middle::typed::Expression {
            kind: ExpressionKind::MemberAccess {
                object: Box::new(object),
                member: "y".into(),
            },
            ty: Type::Integer,
        };

        let main = main_of(vec![ret(access)]);

        assert!(kinds(&main).iter().any(|k| matches!(k, StatementKind::Alloca { bytes: 16, .. })));
        assert!(kinds(&main).iter().any(|k| matches!(k, StatementKind::LoadMemory { offset: 8, .. })));
    }

    #[test]
    fn unknown_calls_are_reported_not_guessed() {
        let error = select_program(
            &main_only(vec![ret(call("missing", vec![], Type::Integer))]),
            &RuntimeSupport::sbrk_and_print(8),
        )
        .unwrap_err();

        assert!(matches!(error, crate::error::CompileError::Unsupported(_)));
    }
}
