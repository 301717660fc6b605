//! Recursive-descent parser producing per-function statement lists.
//!
//! The parser mirrors the classic chibicc structure: one helper per
//! precedence level, plus a statement layer on top. Locals are collected
//! while parsing; a bare identifier that has not been seen yet in the current
//! function declares a new local, so there is no separate declaration syntax.
//!
//! ```text
//! program    = function*
//! function   = ident "(" params? ")" "{" stmt* "}"
//! params     = ident ("," ident)*
//! stmt       = "return" expr ";"
//!            | "{" stmt* "}"
//!            | "if" "(" expr ")" stmt ("else" stmt)?
//!            | "while" "(" expr ")" stmt
//!            | "for" "(" expr-stmt? ";" expr? ";" expr-stmt? ")" stmt
//!            | expr-stmt ";"
//! expr       = assign
//! assign     = equality ("=" assign)?
//! equality   = relational ("==" relational | "!=" relational)*
//! relational = add ("<" add | "<=" add | ">" add | ">=" add)*
//! add        = mul ("+" mul | "-" mul)*
//! mul        = unary ("*" unary | "/" unary)*
//! unary      = ("+" | "-" | "&" | "*") unary | primary
//! primary    = "(" expr ")" | num | ident ("(" args? ")")?
//! args       = assign ("," assign)*
//! ```

use std::mem;

use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe_token, token_text};

/// Registers available for passing arguments, and therefore the parameter limit.
pub const MAX_ARGS: usize = 6;

/// Index of a local inside its function's `locals`.
pub type VarId = usize;

/// Binary operators recognised by the language. `>` and `>=` are folded into
/// `Lt`/`Le` with swapped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Shape of a node, with the payload specific to each kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
  Num {
    value: i64,
  },
  Var {
    var: VarId,
  },
  Binary {
    op: BinaryOp,
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Assign {
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Addr {
    operand: Box<Node>,
  },
  Deref {
    operand: Box<Node>,
  },
  Return {
    operand: Box<Node>,
  },
  If {
    cond: Box<Node>,
    then: Box<Node>,
    els: Option<Box<Node>>,
  },
  While {
    cond: Box<Node>,
    body: Box<Node>,
  },
  For {
    init: Option<Box<Node>>,
    cond: Option<Box<Node>>,
    inc: Option<Box<Node>>,
    body: Box<Node>,
  },
  Block {
    body: Vec<Node>,
  },
  ExprStmt {
    operand: Box<Node>,
  },
  Call {
    name: String,
    args: Vec<Node>,
  },
}

/// A syntax tree node together with the offset of the token that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
  pub kind: NodeKind,
  pub loc: usize,
}

impl Node {
  pub fn new(kind: NodeKind, loc: usize) -> Self {
    Self { kind, loc }
  }

  pub fn number(value: i64, loc: usize) -> Self {
    Self::new(NodeKind::Num { value }, loc)
  }

  pub fn var(var: VarId, loc: usize) -> Self {
    Self::new(NodeKind::Var { var }, loc)
  }

  pub fn binary(op: BinaryOp, lhs: Node, rhs: Node, loc: usize) -> Self {
    Self::new(
      NodeKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      loc,
    )
  }

  pub fn assign(lhs: Node, rhs: Node, loc: usize) -> Self {
    Self::new(
      NodeKind::Assign {
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      loc,
    )
  }

  fn expr_stmt(operand: Node) -> Self {
    let loc = operand.loc;
    Self::new(
      NodeKind::ExprStmt {
        operand: Box::new(operand),
      },
      loc,
    )
  }
}

/// A function-scoped variable. Parameters are locals too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
  pub name: String,
  /// Distance below the frame base; `None` until offsets are assigned.
  pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
  pub name: String,
  /// Parameters in declaration order, as indices into `locals`.
  pub params: Vec<VarId>,
  pub body: Vec<Node>,
  /// Every local in declaration order, parameters first.
  pub locals: Vec<Var>,
  pub stack_size: i64,
  /// Offset of the function name, for diagnostics about the definition.
  pub loc: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
  pub functions: Vec<Function>,
}

/// Parse a whole program from the token stream.
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Program> {
  let mut parser = Parser::new(tokens, source);
  let mut functions = Vec::new();

  while !parser.stream.is_eof() {
    let func = parser.parse_function()?;
    if functions.iter().any(|f: &Function| f.name == func.name) {
      return Err(CompileError::parse(
        source,
        func.loc,
        format!("redefinition of function \"{}\"", func.name),
      ));
    }
    functions.push(func);
  }

  Ok(Program { functions })
}

/// Parser state for one compilation: the token cursor and the locals of the
/// function currently being parsed.
struct Parser<'a> {
  stream: TokenStream<'a>,
  locals: Vec<Var>,
}

impl<'a> Parser<'a> {
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      stream: TokenStream::new(tokens, source),
      locals: Vec::new(),
    }
  }

  fn find_var(&self, name: &str) -> Option<VarId> {
    self.locals.iter().rposition(|var| var.name == name)
  }

  fn push_var(&mut self, name: String) -> VarId {
    self.locals.push(Var { name, offset: None });
    self.locals.len() - 1
  }

  fn parse_function(&mut self) -> CompileResult<Function> {
    self.locals.clear();

    let (name, loc) = self.stream.get_ident()?;
    self.stream.skip("(")?;
    let params = self.parse_params()?;
    self.stream.skip("{")?;
    let body = self.parse_compound()?;

    Ok(Function {
      name,
      params,
      body,
      locals: mem::take(&mut self.locals),
      stack_size: 0,
      loc,
    })
  }

  fn parse_params(&mut self) -> CompileResult<Vec<VarId>> {
    let mut params = Vec::new();
    if self.stream.equal(")") {
      return Ok(params);
    }

    loop {
      let (name, loc) = self.stream.get_ident()?;
      if params.len() == MAX_ARGS {
        return Err(CompileError::parse(
          self.stream.source,
          loc,
          format!("too many parameters, at most {MAX_ARGS} are supported"),
        ));
      }
      params.push(self.push_var(name));

      if self.stream.equal(")") {
        return Ok(params);
      }
      self.stream.skip(",")?;
    }
  }

  /// Statements up to and including the closing brace.
  fn parse_compound(&mut self) -> CompileResult<Vec<Node>> {
    let mut body = Vec::new();
    while !self.stream.equal("}") {
      if self.stream.is_eof() {
        self.stream.skip("}")?;
      }
      body.push(self.parse_stmt()?);
    }
    Ok(body)
  }

  fn parse_stmt(&mut self) -> CompileResult<Node> {
    let loc = self.stream.loc();

    if self.stream.equal("return") {
      let operand = self.parse_expr()?;
      self.stream.skip(";")?;
      return Ok(Node::new(
        NodeKind::Return {
          operand: Box::new(operand),
        },
        loc,
      ));
    }

    if self.stream.equal("{") {
      let body = self.parse_compound()?;
      return Ok(Node::new(NodeKind::Block { body }, loc));
    }

    if self.stream.equal("if") {
      self.stream.skip("(")?;
      let cond = self.parse_expr()?;
      self.stream.skip(")")?;
      let then = self.parse_stmt()?;
      let els = if self.stream.equal("else") {
        Some(Box::new(self.parse_stmt()?))
      } else {
        None
      };
      return Ok(Node::new(
        NodeKind::If {
          cond: Box::new(cond),
          then: Box::new(then),
          els,
        },
        loc,
      ));
    }

    if self.stream.equal("while") {
      self.stream.skip("(")?;
      let cond = self.parse_expr()?;
      self.stream.skip(")")?;
      let body = self.parse_stmt()?;
      return Ok(Node::new(
        NodeKind::While {
          cond: Box::new(cond),
          body: Box::new(body),
        },
        loc,
      ));
    }

    if self.stream.equal("for") {
      self.stream.skip("(")?;

      let mut init = None;
      if !self.stream.equal(";") {
        init = Some(Box::new(self.parse_expr_stmt()?));
        self.stream.skip(";")?;
      }

      let mut cond = None;
      if !self.stream.equal(";") {
        cond = Some(Box::new(self.parse_expr()?));
        self.stream.skip(";")?;
      }

      let mut inc = None;
      if !self.stream.equal(")") {
        inc = Some(Box::new(self.parse_expr_stmt()?));
        self.stream.skip(")")?;
      }

      let body = self.parse_stmt()?;
      return Ok(Node::new(
        NodeKind::For {
          init,
          cond,
          inc,
          body: Box::new(body),
        },
        loc,
      ));
    }

    let node = self.parse_expr_stmt()?;
    self.stream.skip(";")?;
    Ok(node)
  }

  fn parse_expr_stmt(&mut self) -> CompileResult<Node> {
    let expr = self.parse_expr()?;
    Ok(Node::expr_stmt(expr))
  }

  fn parse_expr(&mut self) -> CompileResult<Node> {
    self.parse_assign()
  }

  fn parse_assign(&mut self) -> CompileResult<Node> {
    let node = self.parse_equality()?;

    let loc = self.stream.loc();
    if self.stream.equal("=") {
      let rhs = self.parse_assign()?;
      return Ok(Node::assign(node, rhs, loc));
    }

    Ok(node)
  }

  fn parse_equality(&mut self) -> CompileResult<Node> {
    let mut node = self.parse_relational()?;

    loop {
      let loc = self.stream.loc();
      if self.stream.equal("==") {
        let rhs = self.parse_relational()?;
        node = Node::binary(BinaryOp::Eq, node, rhs, loc);
      } else if self.stream.equal("!=") {
        let rhs = self.parse_relational()?;
        node = Node::binary(BinaryOp::Ne, node, rhs, loc);
      } else {
        return Ok(node);
      }
    }
  }

  fn parse_relational(&mut self) -> CompileResult<Node> {
    let mut node = self.parse_add()?;

    loop {
      let loc = self.stream.loc();
      if self.stream.equal("<") {
        let rhs = self.parse_add()?;
        node = Node::binary(BinaryOp::Lt, node, rhs, loc);
      } else if self.stream.equal("<=") {
        let rhs = self.parse_add()?;
        node = Node::binary(BinaryOp::Le, node, rhs, loc);
      } else if self.stream.equal(">") {
        let rhs = self.parse_add()?;
        node = Node::binary(BinaryOp::Lt, rhs, node, loc);
      } else if self.stream.equal(">=") {
        let rhs = self.parse_add()?;
        node = Node::binary(BinaryOp::Le, rhs, node, loc);
      } else {
        return Ok(node);
      }
    }
  }

  fn parse_add(&mut self) -> CompileResult<Node> {
    let mut node = self.parse_mul()?;

    loop {
      let loc = self.stream.loc();
      if self.stream.equal("+") {
        let rhs = self.parse_mul()?;
        node = Node::binary(BinaryOp::Add, node, rhs, loc);
      } else if self.stream.equal("-") {
        let rhs = self.parse_mul()?;
        node = Node::binary(BinaryOp::Sub, node, rhs, loc);
      } else {
        return Ok(node);
      }
    }
  }

  fn parse_mul(&mut self) -> CompileResult<Node> {
    let mut node = self.parse_unary()?;

    loop {
      let loc = self.stream.loc();
      if self.stream.equal("*") {
        let rhs = self.parse_unary()?;
        node = Node::binary(BinaryOp::Mul, node, rhs, loc);
      } else if self.stream.equal("/") {
        let rhs = self.parse_unary()?;
        node = Node::binary(BinaryOp::Div, node, rhs, loc);
      } else {
        return Ok(node);
      }
    }
  }

  fn parse_unary(&mut self) -> CompileResult<Node> {
    let loc = self.stream.loc();

    if self.stream.equal("+") {
      return self.parse_unary();
    }

    if self.stream.equal("-") {
      // -x is lowered to 0 - x
      let operand = self.parse_unary()?;
      return Ok(Node::binary(
        BinaryOp::Sub,
        Node::number(0, loc),
        operand,
        loc,
      ));
    }

    if self.stream.equal("&") {
      let operand = self.parse_unary()?;
      return Ok(Node::new(
        NodeKind::Addr {
          operand: Box::new(operand),
        },
        loc,
      ));
    }

    if self.stream.equal("*") {
      let operand = self.parse_unary()?;
      return Ok(Node::new(
        NodeKind::Deref {
          operand: Box::new(operand),
        },
        loc,
      ));
    }

    self.parse_primary()
  }

  fn parse_primary(&mut self) -> CompileResult<Node> {
    if self.stream.equal("(") {
      let node = self.parse_expr()?;
      self.stream.skip(")")?;
      return Ok(node);
    }

    if self.stream.peek_kind() == Some(TokenKind::Ident) {
      let (name, loc) = self.stream.get_ident()?;

      // The lookahead alone decides: `f(` is a call even if `f` is a local.
      if self.stream.equal("(") {
        let args = self.parse_args()?;
        return Ok(Node::new(NodeKind::Call { name, args }, loc));
      }

      let var = match self.find_var(&name) {
        Some(var) => var,
        None => self.push_var(name),
      };
      return Ok(Node::var(var, loc));
    }

    let (value, loc) = self.stream.get_number()?;
    Ok(Node::number(value, loc))
  }

  /// Arguments after the opening parenthesis, up to and including `)`.
  fn parse_args(&mut self) -> CompileResult<Vec<Node>> {
    let mut args = Vec::new();
    if self.stream.equal(")") {
      return Ok(args);
    }

    args.push(self.parse_assign()?);
    while self.stream.equal(",") {
      args.push(self.parse_assign()?);
    }
    self.stream.skip(")")?;
    Ok(args)
  }
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  /// Take ownership of the token stream; the parser will advance `pos` as it consumes input.
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn peek_kind(&self) -> Option<TokenKind> {
    self.peek().map(|token| token.kind)
  }

  /// Source offset of the current token, or end of input past the last one.
  fn loc(&self) -> usize {
    self.peek().map_or(self.source.len(), |token| token.loc)
  }

  /// Consume the current token if it matches the provided keyword or punctuator.
  fn equal(&mut self, op: &str) -> bool {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Reserved
      && token.len == op.len()
      && token_text(token, self.source) == op
    {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      Ok(())
    } else {
      Err(self.unexpected(&format!("\"{s}\"")))
    }
  }

  /// Error for the current token, naming what was expected instead.
  fn unexpected(&self, expected: &str) -> CompileError {
    let got = describe_token(self.peek(), self.source);
    CompileError::parse(
      self.source,
      self.loc(),
      format!("expected {expected}, but got \"{got}\""),
    )
  }

  /// Parse the current token as an integer literal returning its value and location.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Num
    {
      let value = token.value.ok_or_else(|| CompileError::Internal {
        message: "numeric token missing value".to_string(),
      })?;
      let loc = token.loc;
      self.pos += 1;
      return Ok((value, loc));
    }

    Err(self.unexpected("an expression"))
  }

  /// Parse the current token as an identifier.
  fn get_ident(&mut self) -> CompileResult<(String, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      let name = token_text(token, self.source).to_string();
      let loc = token.loc;
      self.pos += 1;
      return Ok((name, loc));
    }

    Err(self.unexpected("an identifier"))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
  }
}
