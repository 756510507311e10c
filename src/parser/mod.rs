//! Parsing of IR3 source text.
//!
//! IR3 is line-oriented: one instruction per line, one function per
//! `define` block. The parser produces a fully name-resolved [`Program`];
//! variables are interned per function on first use, and function
//! references are resolved against the set of defined functions plus the
//! fixed runtime table.

use std::collections::HashMap;

use thiserror::Error;

use crate::error::CompileError;
use crate::ir::{
    runtime_table, Expr, ExtId, FnId, FunctionRef, Instruction, Ir3Function, Operator, Program,
    VarId, Variable,
};

#[derive(Debug, Error)]
pub enum ParseErrorKind {
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("expected '{0}'")]
    Expected(String),
    #[error("unexpected end of line")]
    UnexpectedEol,
    #[error("invalid integer literal: {0}")]
    IntegerLiteral(String),
    #[error("instructions may only appear inside a function body")]
    OutsideFunction,
    #[error("'define' may not appear inside a function body")]
    NestedDefine,
    #[error("missing '}}' at end of input")]
    UnterminatedBody,
    #[error("duplicate function '@{0}'")]
    DuplicateFunction(String),
    #[error("duplicate parameter '%{0}'")]
    DuplicateParameter(String),
    #[error("a program must define at least one function")]
    EmptyProgram,
}

/// A syntax error, reported with the 1-based source line it occurred on.
#[derive(Debug, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

pub fn parse(source: &str) -> Result<Program, CompileError> {
    Parser::new().run(source)
}

/// Splits one line into tokens. Parentheses, braces and commas separate
/// themselves; everything else splits on whitespace.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        if ch.is_whitespace() || "(){},".contains(ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if !ch.is_whitespace() {
                tokens.push(ch.to_string());
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A cursor over the tokens of a single line.
struct Line<'t> {
    tokens: &'t [String],
    position: usize,
    number: usize,
}

impl<'t> Line<'t> {
    fn error(&self, kind: ParseErrorKind) -> CompileError {
        CompileError::Parse(ParseError {
            line: self.number,
            kind,
        })
    }

    fn peek(&self) -> Option<&'t str> {
        self.tokens.get(self.position).map(String::as_str)
    }

    fn next(&mut self) -> Result<&'t str, CompileError> {
        let token = self
            .peek()
            .ok_or_else(|| self.error(ParseErrorKind::UnexpectedEol))?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, token: &str) -> Result<(), CompileError> {
        let found = self
            .peek()
            .ok_or_else(|| self.error(ParseErrorKind::Expected(token.to_string())))?;
        if found != token {
            return Err(self.error(ParseErrorKind::Expected(token.to_string())));
        }
        self.position += 1;
        Ok(())
    }

    fn finish(&self) -> Result<(), CompileError> {
        match self.peek() {
            None => Ok(()),
            Some(extra) => Err(self.error(ParseErrorKind::UnexpectedToken(extra.to_string()))),
        }
    }
}

/// Collects the variables of the function currently being parsed.
struct FunctionBuilder {
    name: String,
    vars: Vec<Variable>,
    var_ids: HashMap<String, VarId>,
    params: Vec<VarId>,
    instructions: Vec<Instruction>,
}

impl FunctionBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            vars: Vec::new(),
            var_ids: HashMap::new(),
            params: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Interns a variable name, creating it on first use.
    fn var(&mut self, name: &str) -> VarId {
        if let Some(id) = self.var_ids.get(name) {
            return *id;
        }
        let id = VarId(self.vars.len());
        self.vars.push(Variable::new(name));
        self.var_ids.insert(name.to_string(), id);
        id
    }

    fn finish(self) -> Result<Ir3Function, CompileError> {
        Ir3Function::new(self.name, self.vars, self.params, self.instructions)
    }
}

struct Parser {
    externals: Vec<crate::ir::ExternalFunction>,
    external_ids: HashMap<String, ExtId>,
    function_ids: HashMap<String, FnId>,
    functions: Vec<Ir3Function>,
    current: Option<FunctionBuilder>,
}

impl Parser {
    fn new() -> Self {
        let externals = runtime_table();
        let external_ids = externals
            .iter()
            .enumerate()
            .map(|(index, external)| (external.name.clone(), ExtId(index)))
            .collect();
        Self {
            externals,
            external_ids,
            function_ids: HashMap::new(),
            functions: Vec::new(),
            current: None,
        }
    }

    fn run(mut self, source: &str) -> Result<Program, CompileError> {
        // References may point at functions defined further down, so
        // collect every function name before parsing bodies.
        for (index, raw) in source.lines().enumerate() {
            let tokens = tokenize(raw);
            let mut line = Line {
                tokens: &tokens,
                position: 0,
                number: index + 1,
            };
            if line.peek() == Some("define") {
                line.next()?;
                let name = self.function_name_token(&mut line)?;
                let id = FnId(self.function_ids.len());
                if self.function_ids.insert(name.clone(), id).is_some() {
                    return Err(line.error(ParseErrorKind::DuplicateFunction(name)));
                }
            }
        }

        for (index, raw) in source.lines().enumerate() {
            let tokens = tokenize(raw);
            if tokens.is_empty() {
                continue;
            }
            let mut line = Line {
                tokens: &tokens,
                position: 0,
                number: index + 1,
            };
            self.line(&mut line)?;
        }

        if self.current.is_some() {
            return Err(CompileError::Parse(ParseError {
                line: source.lines().count(),
                kind: ParseErrorKind::UnterminatedBody,
            }));
        }
        if self.functions.is_empty() {
            return Err(CompileError::Parse(ParseError {
                line: 1,
                kind: ParseErrorKind::EmptyProgram,
            }));
        }

        let main_name = "main".to_string();
        let main_fn = self
            .function_ids
            .get(&main_name)
            .copied()
            .unwrap_or(FnId(0));
        Ok(Program {
            functions: self.functions,
            externals: self.externals,
            main_fn,
            main_name,
        })
    }

    fn line(&mut self, line: &mut Line) -> Result<(), CompileError> {
        match line.peek() {
            Some("define") => self.function_header(line),
            Some("}") => {
                line.next()?;
                line.finish()?;
                match self.current.take() {
                    Some(builder) => {
                        self.functions.push(builder.finish()?);
                        Ok(())
                    }
                    None => Err(line.error(ParseErrorKind::UnexpectedToken("}".to_string()))),
                }
            }
            Some(_) => {
                let mut builder = self
                    .current
                    .take()
                    .ok_or_else(|| line.error(ParseErrorKind::OutsideFunction))?;
                let result = self.instruction(line, &mut builder);
                self.current = Some(builder);
                result
            }
            None => Ok(()),
        }
    }

    fn function_header(&mut self, line: &mut Line) -> Result<(), CompileError> {
        if self.current.is_some() {
            return Err(line.error(ParseErrorKind::NestedDefine));
        }
        line.expect("define")?;
        let name = self.function_name_token(line)?;
        let mut builder = FunctionBuilder::new(name);

        line.expect("(")?;
        loop {
            match line.next()? {
                ")" => break,
                "," => continue,
                token => {
                    let name = variable_name(token, line)?;
                    let id = builder.var(name);
                    if builder.params.contains(&id) {
                        return Err(
                            line.error(ParseErrorKind::DuplicateParameter(name.to_string()))
                        );
                    }
                    builder.params.push(id);
                }
            }
        }
        line.expect("{")?;
        line.finish()?;

        self.current = Some(builder);
        Ok(())
    }

    fn function_name_token(&self, line: &mut Line) -> Result<String, CompileError> {
        let token = line.next()?;
        match token.strip_prefix('@') {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(line.error(ParseErrorKind::UnexpectedToken(token.to_string()))),
        }
    }

    fn instruction(
        &mut self,
        line: &mut Line,
        builder: &mut FunctionBuilder,
    ) -> Result<(), CompileError> {
        let instruction = match line.peek() {
            Some(token) if token.starts_with(':') => {
                let name = line.next()?[1..].to_string();
                Instruction::Label(name)
            }
            Some("br") => {
                line.next()?;
                let first = line.next()?;
                match first.strip_prefix(':') {
                    Some(label) => Instruction::Branch {
                        target: label.to_string(),
                        condition: None,
                    },
                    None => {
                        let condition = self.atom_from(first, line, builder)?;
                        let target = line.next()?;
                        let target = target
                            .strip_prefix(':')
                            .ok_or_else(|| {
                                line.error(ParseErrorKind::UnexpectedToken(target.to_string()))
                            })?
                            .to_string();
                        Instruction::Branch {
                            target,
                            condition: Some(condition),
                        }
                    }
                }
            }
            Some("return") => {
                line.next()?;
                let value = match line.peek() {
                    Some(_) => Some(self.atom(line, builder)?),
                    None => None,
                };
                Instruction::Return(value)
            }
            Some("store") => {
                line.next()?;
                let address = self.variable(line, builder)?;
                line.expect("<-")?;
                let source = self.variable(line, builder)?;
                Instruction::Store { address, source }
            }
            Some("call") => Instruction::Assign {
                dest: None,
                source: self.call_expr(line, builder)?,
            },
            Some(token) if token.starts_with('%') => {
                let dest = self.variable(line, builder)?;
                line.expect("<-")?;
                let source = self.assignment_source(line, builder)?;
                Instruction::Assign {
                    dest: Some(dest),
                    source,
                }
            }
            Some(other) => {
                return Err(line.error(ParseErrorKind::UnexpectedToken(other.to_string())))
            }
            None => return Ok(()),
        };
        line.finish()?;
        builder.instructions.push(instruction);
        Ok(())
    }

    /// The right-hand side of `%v <- ...`: a load, a call, a binary
    /// expression or a single atom.
    fn assignment_source(
        &mut self,
        line: &mut Line,
        builder: &mut FunctionBuilder,
    ) -> Result<Expr, CompileError> {
        match line.peek() {
            Some("load") => {
                line.next()?;
                Ok(Expr::Load(self.variable(line, builder)?))
            }
            Some("call") => self.call_expr(line, builder),
            _ => {
                let lhs = self.atom(line, builder)?;
                match line.peek() {
                    None => Ok(lhs),
                    Some(token) => {
                        let op = Operator::parse(token).ok_or_else(|| {
                            line.error(ParseErrorKind::UnexpectedToken(token.to_string()))
                        })?;
                        line.next()?;
                        let rhs = self.atom(line, builder)?;
                        Ok(Expr::Binary {
                            op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        })
                    }
                }
            }
        }
    }

    fn call_expr(
        &mut self,
        line: &mut Line,
        builder: &mut FunctionBuilder,
    ) -> Result<Expr, CompileError> {
        line.expect("call")?;
        let callee = self.callee(line, builder)?;
        line.expect("(")?;
        let mut args = Vec::new();
        loop {
            match line.peek() {
                Some(")") => {
                    line.next()?;
                    break;
                }
                Some(",") => {
                    line.next()?;
                }
                Some(_) => args.push(self.atom(line, builder)?),
                None => return Err(line.error(ParseErrorKind::Expected(")".to_string()))),
            }
        }
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
        })
    }

    /// A callee is a variable, a defined function or a runtime function.
    fn callee(
        &mut self,
        line: &mut Line,
        builder: &mut FunctionBuilder,
    ) -> Result<Expr, CompileError> {
        let token = line.next()?;
        if let Some(name) = token.strip_prefix('%') {
            return Ok(Expr::Var(builder.var(name)));
        }
        if let Some(name) = token.strip_prefix('@') {
            let id = self.function_ids.get(name).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    name: format!("@{name}"),
                    function: builder.name.clone(),
                }
            })?;
            return Ok(Expr::Function(FunctionRef::Ir3(*id)));
        }
        let id =
            self.external_ids
                .get(token)
                .ok_or_else(|| CompileError::UnresolvedReference {
                    name: token.to_string(),
                    function: builder.name.clone(),
                })?;
        Ok(Expr::Function(FunctionRef::External(*id)))
    }

    fn atom(&mut self, line: &mut Line, builder: &mut FunctionBuilder) -> Result<Expr, CompileError> {
        let token = line.next()?;
        self.atom_from(token, line, builder)
    }

    fn atom_from(
        &mut self,
        token: &str,
        line: &Line,
        builder: &mut FunctionBuilder,
    ) -> Result<Expr, CompileError> {
        if let Some(name) = token.strip_prefix('%') {
            return Ok(Expr::Var(builder.var(name)));
        }
        if let Some(name) = token.strip_prefix(':') {
            return Ok(Expr::Label(name.to_string()));
        }
        if let Some(name) = token.strip_prefix('@') {
            let id = self.function_ids.get(name).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    name: format!("@{name}"),
                    function: builder.name.clone(),
                }
            })?;
            return Ok(Expr::Function(FunctionRef::Ir3(*id)));
        }
        token
            .parse::<i64>()
            .map(Expr::Number)
            .map_err(|_| line.error(ParseErrorKind::IntegerLiteral(token.to_string())))
    }

    fn variable(
        &mut self,
        line: &mut Line,
        builder: &mut FunctionBuilder,
    ) -> Result<VarId, CompileError> {
        let token = line.next()?;
        Ok(builder.var(variable_name(token, line)?))
    }
}

fn variable_name<'t>(token: &'t str, line: &Line) -> Result<&'t str, CompileError> {
    match token.strip_prefix('%') {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(line.error(ParseErrorKind::UnexpectedToken(token.to_string()))),
    }
}
