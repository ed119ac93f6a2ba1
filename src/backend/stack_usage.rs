//! Frame layout of a lowered function.
//!
//! From the stack pointer upwards, after the prologue:
//!
//! ```text
//! spill slots | saved extra registers | saved used registers | alloca space
//! [return address, without a link register] | stack-passed arguments
//! ```

use crate::{
    backend::{
        register_allocation::AllocatedFunction,
        targets::{PhysicalRegister, TargetDescription},
    },
    middle::tac::StatementKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackUsage<R> {
    /// This function's own register-passed arguments, saved around every
    /// call it makes
    pub caller_saved_registers: Vec<R>,
    /// Arguments this function receives on the stack
    pub stack_arguments: usize,
    pub saved_extra_registers: Vec<R>,
    pub saved_used_registers: Vec<R>,
    pub spill_count: usize,
    pub alloca_words: usize,
    /// Whether the caller left a return address between the frame and the
    /// stack-passed arguments
    pub return_address_on_stack: bool,
}

pub fn words_for(bytes: i64, word_size: usize) -> usize {
    usize::try_from(bytes).unwrap_or(0).div_ceil(word_size)
}

impl<R: PhysicalRegister> StackUsage<R> {
    /// The entry point is never called, so it saves no used registers
    pub fn compute(allocated: &AllocatedFunction<R>, target: &TargetDescription<R>, is_entry: bool) -> Self {
        let function = &allocated.function;
        let in_registers = function
            .arguments
            .len()
            .min(target.function_argument_registers.len());

        let alloca_words = function
            .instructions
            .iter()
            .filter_map(|s| match s.kind {
                StatementKind::Alloca { bytes, .. } => Some(words_for(bytes, target.word_size)),
                _ => None,
            })
            .sum();

        Self {
            caller_saved_registers: target.function_argument_registers[..in_registers].to_vec(),
            stack_arguments: function.arguments.len() - in_registers,
            saved_extra_registers: target.extra_saved_registers.clone(),
            saved_used_registers: if is_entry {
                vec![]
            } else {
                allocated.assignment.used_registers().into_iter().collect()
            },
            spill_count: function.spill_count,
            alloca_words,
            return_address_on_stack: target.link_register.is_none(),
        }
    }

    /// Words the prologue reserves
    pub fn callee_reserve_count(&self) -> usize {
        self.spill_count
            + self.saved_extra_registers.len()
            + self.saved_used_registers.len()
            + self.alloca_words
    }

    pub fn spill_offset(&self, slot: usize) -> usize {
        slot
    }

    pub fn saved_extra_offset(&self, index: usize) -> usize {
        self.spill_count + index
    }

    pub fn saved_used_offset(&self, index: usize) -> usize {
        self.spill_count + self.saved_extra_registers.len() + index
    }

    pub fn alloca_base(&self) -> usize {
        self.spill_count + self.saved_extra_registers.len() + self.saved_used_registers.len()
    }

    /// Offset of the `index`th stack-passed argument
    pub fn stack_argument_offset(&self, index: usize) -> usize {
        self.callee_reserve_count() + usize::from(self.return_address_on_stack) + index
    }
}
