//! Maps virtual registers onto a finite set of physical registers.
//!
//! Allocation repeats until it succeeds: drop dead stores, compute liveness,
//! build the interference graph and colour it greedily in order of first
//! appearance. When a register cannot be coloured, a register is moved to a
//! stack slot. Every use then goes through a short-lived fragment register
//! that is loaded right before the use or stored right after the
//! definition, and allocation starts over.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, trace};

use crate::{
    backend::targets::PhysicalRegister,
    error::{CompileError, CompileResult},
    middle::{
        liveness::{LivenessSet, function_liveness},
        tac::{Function, Register, StackLocation, Statement, StatementKind},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Storage<R> {
    Register(R),
    /// Lives in the frame. Only call arguments name such a register directly;
    /// every other use was rewritten to go through a fragment.
    Stack(StackLocation),
}

/// Storage chosen for every virtual register that is neither a reserved
/// pseudo-register nor an argument passed in a register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAssignment<R> {
    pub storage: BTreeMap<Register, Storage<R>>,
}

impl<R: PhysicalRegister> RegisterAssignment<R> {
    pub fn get(&self, register: &Register) -> Option<Storage<R>> {
        self.storage.get(register).copied()
    }

    /// Physical registers handed out at least once, in register order
    pub fn used_registers(&self) -> BTreeSet<R> {
        self.storage
            .values()
            .filter_map(|storage| match storage {
                Storage::Register(register) => Some(*register),
                Storage::Stack(_) => None,
            })
            .collect()
    }
}

/// A function after allocation: spill code inserted, dead stores removed and
/// `spill_count` set
#[derive(Debug, Clone)]
pub struct AllocatedFunction<R> {
    pub function: Function,
    pub assignment: RegisterAssignment<R>,
}

/// Drops pure statements whose results are never read, until none are left
pub fn remove_dead_stores(function: &Function) -> CompileResult<Function> {
    let mut function = function.clone();

    loop {
        let liveness = function_liveness(&function)?;
        let before = function.instructions.len();

        function.instructions = function
            .instructions
            .into_iter()
            .enumerate()
            .filter(|(i, s)| {
                s.kind.has_side_effects()
                    || s.kind
                        .writes()
                        .iter()
                        .any(|w| w.is_reserved() || liveness[i + 1].contains(w))
            })
            .map(|(_, s)| s)
            .collect();

        if function.instructions.len() == before {
            return Ok(function);
        }

        trace!(
            "removed {} dead stores from {}",
            before - function.instructions.len(),
            function.name
        );
    }
}

fn is_call(kind: &StatementKind) -> bool {
    matches!(
        kind,
        StatementKind::CallByName { .. } | StatementKind::CallByRegister { .. }
    )
}

/// Renames `from` everywhere except in call argument lists
fn rename_outside_call_arguments(kind: &StatementKind, from: &Register, to: &Register) -> StatementKind {
    let rename = |r: &Register| if r == from { to.clone() } else { r.clone() };

    match kind {
        StatementKind::CallByName {
            function,
            arguments,
            destination,
        } => StatementKind::CallByName {
            function: function.clone(),
            arguments: arguments.clone(),
            destination: destination.as_ref().map(rename),
        },
        StatementKind::CallByRegister {
            function,
            arguments,
            destination,
        } => StatementKind::CallByRegister {
            function: rename(function),
            arguments: arguments.clone(),
            destination: destination.as_ref().map(rename),
        },
        other => other.with_register_renamed(from, to),
    }
}

/// Reads of `register` that need it in a physical register
fn reads_in_register(kind: &StatementKind, register: &Register) -> bool {
    match kind {
        StatementKind::CallByName { .. } => false,
        StatementKind::CallByRegister { function, .. } => function == register,
        other => other.reads().contains(register),
    }
}

#[derive(Debug, Default)]
struct SpillRewriter {
    fragments: HashSet<Register>,
    next_fragment: usize,
}

impl SpillRewriter {
    fn fragment(&mut self, of: &Register) -> Register {
        let fragment = Register::new(format!("{}_fragment_{}", of.name(), self.next_fragment));
        self.next_fragment += 1;
        self.fragments.insert(fragment.clone());
        fragment
    }

    /// Moves `register` into `location`. Each statement touching it gets its
    /// own fragment, loaded before a read and stored after a write. Call
    /// arguments keep naming `register`; lowering passes them straight from
    /// the frame.
    fn rewrite(&mut self, function: &mut Function, register: &Register, location: StackLocation) {
        let mut rewritten = Vec::with_capacity(function.instructions.len());

        for statement in std::mem::take(&mut function.instructions) {
            let reads = reads_in_register(&statement.kind, register);
            let writes = statement.kind.writes().contains(register);

            if !reads && !writes {
                rewritten.push(statement);
                continue;
            }

            let fragment = self.fragment(register);

            if reads {
                rewritten.push(Statement::new(
                    StatementKind::StackLoad {
                        location,
                        to: fragment.clone(),
                    },
                    format!("reload {}", register.name()),
                ));
            }

            let kind = if is_call(&statement.kind) {
                rename_outside_call_arguments(&statement.kind, register, &fragment)
            } else {
                statement.kind.with_register_renamed(register, &fragment)
            };
            rewritten.push(Statement::new(kind, statement.why));

            if writes {
                rewritten.push(Statement::new(
                    StatementKind::StackStore {
                        from: fragment,
                        location,
                    },
                    format!("spill {}", register.name()),
                ));
            }
        }

        function.instructions = rewritten;
    }
}

type InterferenceGraph = HashMap<Register, HashSet<Register>>;

fn interference_graph(
    function: &Function,
    liveness: &[LivenessSet],
    allocatable: &HashSet<Register>,
) -> InterferenceGraph {
    let mut graph: InterferenceGraph = allocatable.iter().map(|r| (r.clone(), HashSet::new())).collect();

    let mut connect = |a: &Register, b: &Register| {
        if a != b && allocatable.contains(a) && allocatable.contains(b) {
            graph.entry(a.clone()).or_default().insert(b.clone());
            graph.entry(b.clone()).or_default().insert(a.clone());
        }
    };

    // Registers live at the same point conflict
    for set in liveness {
        for (a, b) in set.iter().tuple_combinations() {
            connect(a, b);
        }
    }

    // A definition conflicts with everything live after it, even when the
    // definition itself is dead
    for (i, statement) in function.instructions.iter().enumerate() {
        for written in statement.kind.writes() {
            for live in &liveness[i + 1] {
                connect(&written, live);
            }
        }
    }

    graph
}

/// Registers in the order they first appear
fn appearance_order(function: &Function, allocatable: &HashSet<Register>) -> Vec<Register> {
    function
        .instructions
        .iter()
        .flat_map(|s| s.kind.reads().into_iter().chain(s.kind.writes()))
        .filter(|r| allocatable.contains(r))
        .unique()
        .collect()
}

/// Greedy colouring. Fails with the first register that has no colour left.
fn colour<R: PhysicalRegister>(
    order: &[Register],
    graph: &InterferenceGraph,
    registers: &[R],
) -> Result<HashMap<Register, R>, Register> {
    let mut colours: HashMap<Register, R> = HashMap::new();

    for register in order {
        let taken: HashSet<R> = graph
            .get(register)
            .into_iter()
            .flatten()
            .filter_map(|neighbour| colours.get(neighbour).copied())
            .collect();

        match registers.iter().find(|r| !taken.contains(*r)) {
            Some(&physical) => {
                colours.insert(register.clone(), physical);
            }
            None => return Err(register.clone()),
        }
    }

    Ok(colours)
}

fn live_range_length(register: &Register, liveness: &[LivenessSet]) -> usize {
    liveness.iter().filter(|set| set.contains(register)).count()
}

/// Allocates `registers` to the virtual registers of `function`. The first
/// `argument_register_count` arguments arrive in registers; the rest are
/// read from the caller's frame.
pub fn allocate<R: PhysicalRegister>(
    function: &Function,
    registers: &[R],
    argument_register_count: usize,
) -> CompileResult<AllocatedFunction<R>> {
    let mut function = function.clone();
    let mut rewriter = SpillRewriter::default();
    let mut on_stack: BTreeMap<Register, StackLocation> = BTreeMap::new();

    for (index, argument) in function
        .arguments
        .clone()
        .iter()
        .enumerate()
        .skip(argument_register_count)
    {
        let location = StackLocation::Argument(index - argument_register_count);
        trace!("{}: argument {} is passed on the stack", function.name, argument.name());
        rewriter.rewrite(&mut function, argument, location);
        on_stack.insert(argument.clone(), location);
    }

    let in_argument_register: HashSet<Register> = function
        .arguments
        .iter()
        .take(argument_register_count)
        .cloned()
        .collect();

    loop {
        function = remove_dead_stores(&function)?;
        let liveness = function_liveness(&function)?;

        let allocatable: HashSet<Register> = function
            .instructions
            .iter()
            .flat_map(|s| s.kind.reads().into_iter().chain(s.kind.writes()))
            .filter(|r| !r.is_reserved() && !in_argument_register.contains(r) && !on_stack.contains_key(r))
            .collect();

        let graph = interference_graph(&function, &liveness, &allocatable);
        let order = appearance_order(&function, &allocatable);

        let uncoloured = match colour(&order, &graph, registers) {
            Ok(colours) => {
                let storage = colours
                    .into_iter()
                    .map(|(r, physical)| (r, Storage::Register(physical)))
                    .chain(on_stack.into_iter().map(|(r, location)| (r, Storage::Stack(location))))
                    .collect();

                debug!(
                    "allocated {}: {} registers, {} spill slots",
                    function.name,
                    allocatable.len(),
                    function.spill_count
                );

                return Ok(AllocatedFunction {
                    function,
                    assignment: RegisterAssignment { storage },
                });
            }
            Err(register) => register,
        };

        let victim = if !rewriter.fragments.contains(&uncoloured) {
            uncoloured.clone()
        } else {
            graph
                .get(&uncoloured)
                .into_iter()
                .flatten()
                .filter(|neighbour| !rewriter.fragments.contains(*neighbour))
                .max_by(|a, b| {
                    live_range_length(a, &liveness)
                        .cmp(&live_range_length(b, &liveness))
                        .then_with(|| b.cmp(a))
                })
                .cloned()
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "cannot allocate {} in {}: every conflicting register is already a spill fragment",
                        uncoloured.name(),
                        function.name
                    ))
                })?
        };

        let location = StackLocation::Spill(function.spill_count);
        function.spill_count += 1;

        trace!("{}: spilling {} to {location:?}", function.name, victim.name());

        rewriter.rewrite(&mut function, &victim, location);
        on_stack.insert(victim, location);
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        execution::ExecutionLimits,
        middle::{
            interpreter::interpret,
            tac::{Program, parser::parse_functions},
        },
    };

    fn function(source: &str) -> Function {
        parse_functions(source).unwrap().remove(0)
    }

    /// No two registers live at the same point share a physical register
    fn assert_valid<R: PhysicalRegister>(allocated: &AllocatedFunction<R>) {
        let liveness = function_liveness(&allocated.function).unwrap();

        for (point, set) in liveness.iter().enumerate() {
            let physical: Vec<(R, &Register)> = set
                .iter()
                .filter_map(|r| match allocated.assignment.get(r) {
                    Some(Storage::Register(p)) => Some((p, r)),
                    _ => None,
                })
                .collect();

            for ((a, ra), (b, rb)) in physical.iter().tuple_combinations() {
                assert!(a != b, "{ra} and {rb} share {a} at point {point}");
            }
        }
    }

    fn run_alone(function: Function) -> i64 {
        let program = Program {
            globals: Default::default(),
            functions: vec![],
            main: function,
            string_literals: vec![],
        };

        interpret(&program, 8, &ExecutionLimits::default())
            .unwrap()
            .exit_code
    }

    #[test]
    fn non_overlapping_registers_share() {
        let f = function(indoc! {"
            (function) main():
                r:a = 1
                r:b = r:a + r:a
                r:c = 2
                r:d = r:c + r:b
                return r:d
        "});

        let allocated = allocate(&f, &[0u8, 1], 0).unwrap();

        assert_eq!(allocated.function.spill_count, 0);
        assert_valid(&allocated);
        assert_eq!(run_alone(allocated.function), 4);
    }

    #[test]
    fn dead_stores_are_removed_but_effects_stay() {
        let f = function(indoc! {"
            (function) main():
                r:unused = 5
                r:ignored = f()
                r:x = 1
                return r:x
        "});

        let cleaned = remove_dead_stores(&f).unwrap();

        assert_eq!(cleaned.instructions.len(), 3);
        assert!(matches!(cleaned.instructions[0].kind, StatementKind::CallByName { .. }));
    }

    #[test]
    fn pressure_forces_spills_and_keeps_results() {
        let mut source = String::from("(function) main():\n    r:a = 1\n");
        for n in 0..20 {
            source.push_str(&format!("    r:t{n} = {n}\n    r:t{n} = r:a + r:t{n}\n"));
        }
        source.push_str("    r:sum = 0\n");
        for n in 0..20 {
            source.push_str(&format!("    r:sum = r:sum + r:t{n}\n"));
        }
        source.push_str("    r:result = r:t19 - r:t16\n    r:result = r:result + r:sum\n    return r:result\n");

        let allocated = allocate(&function(&source), &[0u8, 1, 2, 3], 0).unwrap();

        assert!(allocated.function.spill_count > 0);
        assert_valid(&allocated);
        // 3 + sum(1 + n for n in 0..20)
        assert_eq!(run_alone(allocated.function), 3 + 210);
    }

    #[test]
    fn stack_arguments_are_loaded_from_the_caller_frame() {
        let f = function(indoc! {"
            (function) f(r:a, r:b, r:c):
                r:sum = r:a + r:c
                return r:sum
        "});

        let allocated = allocate(&f, &[0u8, 1, 2], 1).unwrap();

        assert!(allocated.function.instructions.iter().any(|s| matches!(
            s.kind,
            StatementKind::StackLoad {
                location: StackLocation::Argument(1),
                ..
            }
        )));
        assert_eq!(
            allocated.assignment.get(&Register::new("c")),
            Some(Storage::Stack(StackLocation::Argument(1)))
        );
        assert_eq!(allocated.assignment.get(&Register::new("a")), None);
    }

    #[test]
    fn spilled_call_arguments_are_not_reloaded() {
        let mut source = String::from("(function) main():\n");
        for n in 0..6 {
            source.push_str(&format!("    r:v{n} = {n}\n"));
        }
        source.push_str("    r:out = g(r:v0, r:v1, r:v2, r:v3, r:v4, r:v5)\n    return r:out\n");

        let allocated = allocate(&function(&source), &[0u8, 1, 2], 3).unwrap();

        let call = allocated
            .function
            .instructions
            .iter()
            .find(|s| matches!(s.kind, StatementKind::CallByName { .. }))
            .unwrap();
        let StatementKind::CallByName { arguments, .. } = &call.kind else {
            unreachable!()
        };

        let on_stack = arguments
            .iter()
            .filter(|a| matches!(allocated.assignment.get(a), Some(Storage::Stack(_))))
            .count();
        assert!(on_stack >= 3, "{on_stack} arguments were spilled");
        assert_valid(&allocated);
    }

    #[test]
    fn fragments_that_cannot_fit_are_internal_errors() {
        let f = function(indoc! {"
            (function) main():
                r:a = 1
                r:b = 2
                r:c = r:a + r:b
                return r:c
        "});

        assert!(matches!(
            allocate(&f, &[0u8], 0),
            Err(CompileError::InternalInvariant(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// However many temporaries are live at once, allocation keeps the
        /// program's result
        #[test]
        fn allocation_preserves_results(values in prop::collection::vec(-50i64..50, 1..24), registers in 2usize..6) {
            let mut source = String::from("(function) main():\n");
            for (n, value) in values.iter().enumerate() {
                source.push_str(&format!("    r:v{n} = {value}\n"));
            }
            source.push_str("    r:total = 0\n");
            for n in (0..values.len()).rev() {
                source.push_str(&format!("    r:total = r:total + r:v{n}\n"));
            }
            source.push_str("    return r:total\n");

            let f = function(&source);
            let expected = run_alone(f.clone());
            let physical: Vec<u8> = (0..registers as u8).collect();

            let allocated = allocate(&f, &physical, 0).unwrap();
            assert_valid(&allocated);

            prop_assert_eq!(run_alone(allocated.function), expected);
            prop_assert_eq!(expected, values.iter().sum::<i64>());
        }
    }
}
