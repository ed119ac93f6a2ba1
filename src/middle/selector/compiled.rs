use crate::middle::tac::Statement;

/// The instructions produced for one expression, split by when they run.
///
/// `prepare` runs before anything in the enclosing statement, `execute`
/// computes the value, and `cleanup` releases whatever `execute` acquired
/// once the enclosing statement has consumed the value. Composition keeps
/// releases in reverse acquisition order, so the outermost emitter only has
/// to splice `cleanup` after its last use of the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledExpression {
    pub prepare: Vec<Statement>,
    pub execute: Vec<Statement>,
    pub cleanup: Vec<Statement>,
}

impl CompiledExpression {
    pub fn execute(execute: Vec<Statement>) -> Self {
        Self {
            execute,
            ..Self::default()
        }
    }

    /// An expression that holds a resource until the end of the enclosing
    /// statement
    pub fn acquire(prepare: Vec<Statement>, execute: Vec<Statement>, release: Vec<Statement>) -> Self {
        Self {
            prepare,
            execute,
            cleanup: release,
        }
    }

    /// Joins sub-expressions in evaluation order. `combine` receives each
    /// part's `execute` list and decides how they interleave.
    pub fn compose(
        parts: Vec<CompiledExpression>,
        combine: impl FnOnce(Vec<Vec<Statement>>) -> Vec<Statement>,
    ) -> Self {
        let mut prepare = Vec::new();
        let mut executes = Vec::with_capacity(parts.len());
        let mut cleanups = Vec::with_capacity(parts.len());

        for part in parts {
            prepare.extend(part.prepare);
            executes.push(part.execute);
            cleanups.push(part.cleanup);
        }

        Self {
            prepare,
            execute: combine(executes),
            cleanup: cleanups.into_iter().rev().flatten().collect(),
        }
    }

    /// `compose` with plain concatenation
    pub fn sequence(parts: Vec<CompiledExpression>) -> Self {
        Self::compose(parts, |executes| executes.into_iter().flatten().collect())
    }

    pub fn into_statements(self) -> Vec<Statement> {
        let mut statements = self.prepare;
        statements.extend(self.execute);
        statements.extend(self.cleanup);
        statements
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(text: &str) -> Statement {
        Statement::comment(text)
    }

    fn notes(statements: &[Statement]) -> Vec<&str> {
        statements.iter().map(|s| s.why.as_str()).collect()
    }

    #[test]
    fn releases_run_in_reverse_acquisition_order() {
        let first = CompiledExpression::acquire(
            vec![note("prepare first")],
            vec![note("use first")],
            vec![note("release first")],
        );
        let second = CompiledExpression::acquire(
            vec![note("prepare second")],
            vec![note("use second")],
            vec![note("release second")],
        );

        let statements = CompiledExpression::sequence(vec![first, second]).into_statements();

        assert_eq!(
            notes(&statements),
            [
                "prepare first",
                "prepare second",
                "use first",
                "use second",
                "release second",
                "release first",
            ]
        );
    }

    #[test]
    fn combiner_controls_interleaving() {
        let parts = vec![
            CompiledExpression::execute(vec![note("a")]),
            CompiledExpression::execute(vec![note("b")]),
        ];

        let composed = CompiledExpression::compose(parts, |mut executes| {
            let b = executes.pop().unwrap_or_default();
            let a = executes.pop().unwrap_or_default();
            [b, vec![note("between")], a].concat()
        });

        assert_eq!(notes(&composed.execute), ["b", "between", "a"]);
        assert!(composed.prepare.is_empty() && composed.cleanup.is_empty());
    }
}
