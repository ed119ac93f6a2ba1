//! The fully typed, name-resolved program tree produced by the type checker.
//! Every expression carries its computed type, and every identifier refers
//! to exactly one parameter, local, global or function.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Integer,
    Boolean,
    String,
    Function {
        arguments: Vec<Type>,
        return_type: Box<Type>,
    },
    List(Box<Type>),
    Product(Vec<ProductMember>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductMember {
    pub name: String,
    pub ty: Type,
}

impl Type {
    /// Bytes needed to store a value of this type inline. Products are laid
    /// out one word per member; every other type is a single word.
    pub fn size_in_bytes(&self, word_size: usize) -> usize {
        match self {
            Type::Product(members) => members.len() * word_size,
            _ => word_size,
        }
    }

    /// Byte offset of `member` inside a product, if this is a product that
    /// has such a member.
    pub fn member_offset(&self, member: &str, word_size: usize) -> Option<usize> {
        match self {
            Type::Product(members) => members
                .iter()
                .position(|m| m.name == member)
                .map(|index| index * word_size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Equal,
    Concatenate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub kind: ExpressionKind,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionKind {
    Number(i64),
    Boolean(bool),
    String(String),
    Identifier(String),
    Binary {
        operator: BinaryOperator,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Ternary {
        condition: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
    Call {
        function: String,
        arguments: Vec<Expression>,
    },
    /// A function literal that the front end already hoisted to a named
    /// top-level function
    FunctionLiteral {
        name: String,
    },
    ObjectLiteral {
        members: Vec<(String, Expression)>,
    },
    MemberAccess {
        object: Box<Expression>,
        member: String,
    },
    ListLiteral {
        items: Vec<Expression>,
    },
    IndexAccess {
        list: Box<Expression>,
        index: Box<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Declaration { name: String, value: Expression },
    Reassignment { name: String, value: Expression },
    Return(Expression),
    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub return_type: Type,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDeclaration {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub functions: Vec<FunctionDefinition>,
    /// Names declared at the top level. Declarations of these names inside
    /// `main` store to process-wide storage.
    pub globals: Vec<GlobalDeclaration>,
    /// Top-level statements; the returned integer is the exit code
    pub main: Vec<Statement>,
}

/// Shorthand constructors for building typed trees by hand
pub mod build {
    use super::*;

    pub fn number(value: i64) -> Expression {
        Expression {
            kind: ExpressionKind::Number(value),
            ty: Type::Integer,
        }
    }

    pub fn boolean(value: bool) -> Expression {
        Expression {
            kind: ExpressionKind::Boolean(value),
            ty: Type::Boolean,
        }
    }

    pub fn string(value: &str) -> Expression {
        Expression {
            kind: ExpressionKind::String(value.into()),
            ty: Type::String,
        }
    }

    pub fn identifier(name: &str, ty: Type) -> Expression {
        Expression {
            kind: ExpressionKind::Identifier(name.into()),
            ty,
        }
    }

    pub fn binary(operator: BinaryOperator, lhs: Expression, rhs: Expression) -> Expression {
        let ty = match operator {
            BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Multiply => {
                Type::Integer
            }
            BinaryOperator::Equal => Type::Boolean,
            BinaryOperator::Concatenate => Type::String,
        };

        Expression {
            kind: ExpressionKind::Binary {
                operator,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        }
    }

    pub fn ternary(condition: Expression, if_true: Expression, if_false: Expression) -> Expression {
        let ty = if_true.ty.clone();

        Expression {
            kind: ExpressionKind::Ternary {
                condition: Box::new(condition),
                if_true: Box::new(if_true),
                if_false: Box::new(if_false),
            },
            ty,
        }
    }

    pub fn call(function: &str, arguments: Vec<Expression>, return_type: Type) -> Expression {
        Expression {
            kind: ExpressionKind::Call {
                function: function.into(),
                arguments,
            },
            ty: return_type,
        }
    }

    /// A list literal of integers
    pub fn list(items: Vec<Expression>) -> Expression {
        Expression {
            kind: ExpressionKind::ListLiteral { items },
            ty: Type::List(Box::new(Type::Integer)),
        }
    }

    pub fn index(list: Expression, index: Expression) -> Expression {
        let ty = match &list.ty {
            Type::List(item) => (**item).clone(),
            _ => Type::Integer,
        };

        Expression {
            kind: ExpressionKind::IndexAccess {
                list: Box::new(list),
                index: Box::new(index),
            },
            ty,
        }
    }

    pub fn declare(name: &str, value: Expression) -> Statement {
        Statement::Declaration {
            name: name.into(),
            value,
        }
    }

    pub fn reassign(name: &str, value: Expression) -> Statement {
        Statement::Reassignment {
            name: name.into(),
            value,
        }
    }

    pub fn ret(value: Expression) -> Statement {
        Statement::Return(value)
    }

    pub fn parameter(name: &str, ty: Type) -> Parameter {
        Parameter {
            name: name.into(),
            ty,
        }
    }

    pub fn product(members: &[(&str, Type)]) -> Type {
        Type::Product(
            members
                .iter()
                .map(|(name, ty)| ProductMember {
                    name: (*name).into(),
                    ty: ty.clone(),
                })
                .collect(),
        )
    }

    /// A program consisting only of top-level statements
    pub fn main_only(main: Vec<Statement>) -> Program {
        Program {
            functions: vec![],
            globals: vec![],
            main,
        }
    }
}
