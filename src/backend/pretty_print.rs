use core::fmt::{Display, Formatter, Result};

use colored::Colorize;

use crate::{
    backend::lir::{TargetFunction, TargetProgram, TargetStatement, TargetStatementKind},
    middle::tac::pretty_print::escape_string,
};

fn register(r: &impl Display) -> String {
    r.to_string().yellow().to_string()
}

fn number(value: impl Display) -> String {
    value.to_string().purple().to_string()
}

fn stack(offset: usize) -> String {
    format!("{}[{}]", "sp".cyan(), number(offset))
}

impl<R: Display> Display for TargetStatementKind<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        use TargetStatementKind::*;

        let eq = "=".white();

        match self {
            Empty => Ok(()),
            Move { from, to } => write!(f, "{} {eq} {}", register(to), register(from)),
            LoadImmediate { value, destination } => {
                write!(f, "{} {eq} {}", register(destination), number(value))
            }
            AddImmediate { register: r, amount } => {
                write!(f, "{} {} {}", register(r), "+=".white(), number(amount))
            }
            Add {
                lhs,
                rhs,
                destination,
            } => write!(
                f,
                "{} {eq} {} + {}",
                register(destination),
                register(lhs),
                register(rhs)
            ),
            Subtract {
                lhs,
                rhs,
                destination,
            } => write!(
                f,
                "{} {eq} {} - {}",
                register(destination),
                register(lhs),
                register(rhs)
            ),
            Multiply {
                lhs,
                rhs,
                destination,
            } => write!(
                f,
                "{} {eq} {} * {}",
                register(destination),
                register(lhs),
                register(rhs)
            ),
            Increment { register: r } => write!(f, "{}++", register(r)),
            Label { name } => write!(f, "{}", format!("{name}:").bright_red()),
            FunctionLabel { name } => write!(f, "{}", format!("{name}:").blue()),
            Goto { label } => write!(f, "{} {}", "goto".cyan(), label.blue()),
            GotoIfEqual { lhs, rhs, label } => write!(
                f,
                "{} {} == {} {} {}",
                "if".cyan(),
                register(lhs),
                register(rhs),
                "goto".cyan(),
                label.blue()
            ),
            GotoIfNotEqual { lhs, rhs, label } => write!(
                f,
                "{} {} != {} {} {}",
                "if".cyan(),
                register(lhs),
                register(rhs),
                "goto".cyan(),
                label.blue()
            ),
            GotoIfZero { register: r, label } => write!(
                f,
                "{} {} == 0 {} {}",
                "if".cyan(),
                register(r),
                "goto".cyan(),
                label.blue()
            ),
            GotoIfGreater { lhs, rhs, label } => write!(
                f,
                "{} {} > {} {} {}",
                "if".cyan(),
                register(lhs),
                register(rhs),
                "goto".cyan(),
                label.blue()
            ),
            LoadGlobal { from, to } => write!(f, "{} {eq} {}", register(to), from.green()),
            StoreGlobal { from, to } => write!(f, "{} {eq} {}", to.green(), register(from)),
            LoadMemory { from, to, offset } => write!(
                f,
                "{} {eq} *({} + {})",
                register(to),
                register(from),
                number(offset)
            ),
            StoreMemory {
                from,
                address,
                offset,
            } => write!(
                f,
                "*({} + {}) {eq} {}",
                register(address),
                number(offset),
                register(from)
            ),
            LoadMemoryByte { address, to } => {
                write!(f, "{} {eq} {}*{}", register(to), "byte".cyan(), register(address))
            }
            StoreMemoryByte { address, contents } => write!(
                f,
                "{}*{} {eq} {}",
                "byte".cyan(),
                register(address),
                register(contents)
            ),
            StoreZeroToMemory { address, offset } => write!(
                f,
                "*({} + {}) {eq} {}",
                register(address),
                number(offset),
                number(0)
            ),
            LoadSymbolAddress { symbol_name, to } => {
                write!(f, "{} {eq} &{}", register(to), symbol_name.green())
            }
            Syscall => write!(f, "{}", "syscall".cyan()),
            CallByName { function } => write!(f, "{} {}", "call".cyan(), function.blue()),
            CallByRegister { function } => write!(f, "{} {}", "call".cyan(), register(function)),
            Return => write!(f, "{}", "return".cyan()),
            LoadStackOffset { offset, to } => write!(f, "{} {eq} &{}", register(to), stack(*offset)),
            StackLoad { offset, to } => write!(f, "{} {eq} {}", register(to), stack(*offset)),
            StackStore { from, offset } => write!(f, "{} {eq} {}", stack(*offset), register(from)),
            StackReserve { words } => write!(f, "{} {}", "reserve".cyan(), number(words)),
            StackRelease { words } => write!(f, "{} {}", "release".cyan(), number(words)),
            Push { register: r } => write!(f, "{} {}", "push".cyan(), register(r)),
            Pop { register: r } => write!(f, "{} {}", "pop".cyan(), register(r)),
        }
    }
}

impl<R: Display> Display for TargetStatement<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if matches!(self.kind, TargetStatementKind::Empty) {
            return write!(f, "{}", format!("; {}", self.why).bright_black());
        }

        match &self.kind {
            TargetStatementKind::Label { .. } | TargetStatementKind::FunctionLabel { .. } => {
                write!(f, "{}", self.kind)?
            }
            kind => write!(f, "    {kind}")?,
        }

        if !self.why.is_empty() {
            write!(f, " {}", format!("; {}", self.why).bright_black())?;
        }

        Ok(())
    }
}

impl<R: Display> Display for TargetFunction<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        for instruction in &self.instructions {
            if matches!(instruction.kind, TargetStatementKind::Empty) {
                writeln!(f, "    {instruction}")?;
            } else {
                writeln!(f, "{instruction}")?;
            }
        }

        Ok(())
    }
}

impl<R: Display> Display for TargetProgram<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        for global in &self.globals {
            writeln!(
                f,
                "{} {} {}",
                "(global)".magenta(),
                global.mangled_name.green(),
                number(global.bytes)
            )?;
        }

        for literal in &self.string_literals {
            writeln!(
                f,
                "{} {}: {}",
                "(string)".magenta(),
                literal.name.green(),
                format!("\"{}\"", escape_string(&literal.value)).bright_green()
            )?;
        }

        for function in &self.functions {
            writeln!(f)?;
            write!(f, "{function}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::targets::x64::X64Register, middle::tac::pretty_print::to_plain_text};

    fn plain(kind: TargetStatementKind<X64Register>, why: &str) -> String {
        to_plain_text(&TargetStatement::new(kind, why))
    }

    #[test]
    fn statements_read_like_assembly() {
        assert_eq!(
            plain(
                TargetStatementKind::Add {
                    lhs: X64Register::R11,
                    rhs: X64Register::R12,
                    destination: X64Register::Rax,
                },
                "sum"
            ),
            "    rax = r11 + r12 ; sum"
        );
        assert_eq!(
            plain(
                TargetStatementKind::StackLoad {
                    offset: 3,
                    to: X64Register::Rdi,
                },
                ""
            ),
            "    rdi = sp[3]"
        );
        assert_eq!(
            plain(TargetStatementKind::FunctionLabel { name: "main".into() }, ""),
            "main:"
        );
        assert_eq!(plain(TargetStatementKind::Empty, "r:x = 1"), "; r:x = 1");
    }
}
