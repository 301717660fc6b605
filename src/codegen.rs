//! Code generation: lower the parsed program into AArch64 assembly.
//!
//! The emitter is a simple stack machine: every expression leaves exactly one
//! value on the stack and every statement leaves the stack as it found it.
//! Each value occupies a 16-byte slot so `sp` stays aligned for calls. Locals
//! live in the frame and are addressed relative to the frame base `x29`.

use tracing::trace;

use crate::error::{CompileError, CompileResult};
use crate::parser::{BinaryOp, Function, MAX_ARGS, Node, NodeKind, Program};

const ARG_REGS: [&str; MAX_ARGS] = ["x0", "x1", "x2", "x3", "x4", "x5"];

const MAX_ADD_SUB_IMM: i64 = 0xfff;

/// Emit assembly for every function of the program.
pub fn generate(program: &Program, source: &str) -> CompileResult<String> {
  let mut generator = CodeGenerator::new(source);
  generator.asm.push_str("    .text\n");
  for func in &program.functions {
    generator.emit_function(func)?;
  }
  Ok(generator.asm)
}

/// Output buffer plus the state that spans one whole compilation.
struct CodeGenerator<'a> {
  source: &'a str,
  asm: String,
  /// Shared by all functions so branch labels never collide.
  label_seq: usize,
  /// Values currently on the evaluation stack.
  depth: usize,
}

impl<'a> CodeGenerator<'a> {
  fn new(source: &'a str) -> Self {
    Self {
      source,
      asm: String::new(),
      label_seq: 0,
      depth: 0,
    }
  }

  fn next_label(&mut self) -> usize {
    let seq = self.label_seq;
    self.label_seq += 1;
    seq
  }

  fn push(&mut self) {
    self.asm.push_str("    str x0, [sp, #-16]!\n");
    self.depth += 1;
  }

  fn pop(&mut self, reg: &str) {
    self.asm.push_str(&format!("    ldr {reg}, [sp], #16\n"));
    self.depth -= 1;
  }

  /// Drop the top of the stack without reading it.
  fn discard(&mut self) {
    self.asm.push_str("    add sp, sp, #16\n");
    self.depth -= 1;
  }

  /// Materialise a 64-bit constant in `reg`.
  fn load_imm(&mut self, reg: &str, value: i64) {
    if (0..=0xffff).contains(&value) {
      self.asm.push_str(&format!("    mov {reg}, #{value}\n"));
      return;
    }

    let bits = value as u64;
    self.asm.push_str(&format!("    movz {reg}, #{}\n", bits & 0xffff));
    for shift in [16, 32, 48] {
      let chunk = (bits >> shift) & 0xffff;
      if chunk != 0 {
        self.asm.push_str(&format!("    movk {reg}, #{chunk}, lsl #{shift}\n"));
      }
    }
  }

  /// `dst = base - value`. ADD/SUB immediates hold 12 bits, so larger values
  /// go through the `x10` scratch register.
  fn sub_imm(&mut self, dst: &str, base: &str, value: i64) {
    if (0..=MAX_ADD_SUB_IMM).contains(&value) {
      self.asm.push_str(&format!("    sub {dst}, {base}, #{value}\n"));
      return;
    }
    self.load_imm("x10", value);
    self.asm.push_str(&format!("    sub {dst}, {base}, x10\n"));
  }

  /// The assembler would read a symbol spelled like a register as that register.
  fn check_symbol(&self, name: &str, loc: usize) -> CompileResult<()> {
    if is_register_name(name) {
      return Err(CompileError::semantic(
        self.source,
        loc,
        format!("function name \"{name}\" clashes with a register name"),
      ));
    }
    Ok(())
  }

  fn emit_function(&mut self, func: &Function) -> CompileResult<()> {
    trace!(function = %func.name, stack_size = func.stack_size, "emitting function");
    self.check_symbol(&func.name, func.loc)?;

    self.asm.push_str(&format!("    .globl {}\n", func.name));
    self.asm.push_str(&format!("{}:\n", func.name));

    // Prologue
    self.asm.push_str("    stp x29, x30, [sp, #-16]!\n");
    self.asm.push_str("    mov x29, sp\n");
    if func.stack_size > 0 {
      self.sub_imm("sp", "sp", func.stack_size);
    }

    // Locals read before any assignment observe zero.
    for var in 0..func.locals.len() {
      let offset = local_offset(func, var)?;
      self.sub_imm("x9", "x29", offset);
      self.asm.push_str("    str xzr, [x9]\n");
    }

    for (reg, &param) in ARG_REGS.iter().zip(&func.params) {
      let offset = local_offset(func, param)?;
      self.sub_imm("x9", "x29", offset);
      self.asm.push_str(&format!("    str {reg}, [x9]\n"));
    }

    for stmt in &func.body {
      self.emit_stmt(stmt, func)?;
    }

    if self.depth != 0 {
      return Err(CompileError::Internal {
        message: format!(
          "evaluation stack unbalanced by {} in {}",
          self.depth, func.name
        ),
      });
    }

    // Epilogue
    self.asm.push_str(&format!(".L.return.{}:\n", func.name));
    self.asm.push_str("    mov sp, x29\n");
    self.asm.push_str("    ldp x29, x30, [sp], #16\n");
    self.asm.push_str("    ret\n");
    Ok(())
  }

  /// Emit a statement; the stack is left as it was found.
  fn emit_stmt(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::ExprStmt { operand } => {
        self.emit_expr(operand, func)?;
        self.discard();
      }
      NodeKind::Return { operand } => {
        self.emit_expr(operand, func)?;
        self.pop("x0");
        self.asm.push_str(&format!("    b .L.return.{}\n", func.name));
      }
      NodeKind::Block { body } => {
        for stmt in body {
          self.emit_stmt(stmt, func)?;
        }
      }
      NodeKind::If { cond, then, els } => {
        let seq = self.next_label();
        self.emit_expr(cond, func)?;
        self.pop("x0");
        match els {
          Some(els) => {
            self.asm.push_str(&format!("    cbz x0, .L.else.{seq}\n"));
            self.emit_stmt(then, func)?;
            self.asm.push_str(&format!("    b .L.end.{seq}\n"));
            self.asm.push_str(&format!(".L.else.{seq}:\n"));
            self.emit_stmt(els, func)?;
          }
          None => {
            self.asm.push_str(&format!("    cbz x0, .L.end.{seq}\n"));
            self.emit_stmt(then, func)?;
          }
        }
        self.asm.push_str(&format!(".L.end.{seq}:\n"));
      }
      NodeKind::While { cond, body } => {
        let seq = self.next_label();
        self.asm.push_str(&format!(".L.begin.{seq}:\n"));
        self.emit_expr(cond, func)?;
        self.pop("x0");
        self.asm.push_str(&format!("    cbz x0, .L.end.{seq}\n"));
        self.emit_stmt(body, func)?;
        self.asm.push_str(&format!("    b .L.begin.{seq}\n"));
        self.asm.push_str(&format!(".L.end.{seq}:\n"));
      }
      NodeKind::For {
        init,
        cond,
        inc,
        body,
      } => {
        let seq = self.next_label();
        if let Some(init) = init {
          self.emit_stmt(init, func)?;
        }
        self.asm.push_str(&format!(".L.begin.{seq}:\n"));
        if let Some(cond) = cond {
          self.emit_expr(cond, func)?;
          self.pop("x0");
          self.asm.push_str(&format!("    cbz x0, .L.end.{seq}\n"));
        }
        self.emit_stmt(body, func)?;
        if let Some(inc) = inc {
          self.emit_stmt(inc, func)?;
        }
        self.asm.push_str(&format!("    b .L.begin.{seq}\n"));
        self.asm.push_str(&format!(".L.end.{seq}:\n"));
      }
      NodeKind::Num { .. }
      | NodeKind::Var { .. }
      | NodeKind::Binary { .. }
      | NodeKind::Assign { .. }
      | NodeKind::Addr { .. }
      | NodeKind::Deref { .. }
      | NodeKind::Call { .. } => {
        return Err(CompileError::Internal {
          message: format!("expression used as a statement: {:?}", node.kind),
        });
      }
    }
    Ok(())
  }

  /// Emit stack-based code for a single expression node: exactly one value
  /// is pushed.
  fn emit_expr(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Num { value } => {
        self.load_imm("x0", *value);
        self.push();
      }
      NodeKind::Var { .. } => {
        self.emit_addr(node, func)?;
        self.load();
      }
      NodeKind::Addr { operand } => {
        self.emit_addr(operand, func)?;
      }
      NodeKind::Deref { operand } => {
        self.emit_expr(operand, func)?;
        self.load();
      }
      NodeKind::Assign { lhs, rhs } => {
        self.emit_addr(lhs, func)?;
        self.emit_expr(rhs, func)?;
        self.store();
      }
      NodeKind::Call { name, args } => {
        if args.len() > MAX_ARGS {
          return Err(CompileError::semantic(
            self.source,
            node.loc,
            format!("too many call arguments, at most {MAX_ARGS} are supported"),
          ));
        }
        self.check_symbol(name, node.loc)?;
        for arg in args {
          self.emit_expr(arg, func)?;
        }
        for reg in ARG_REGS[..args.len()].iter().rev() {
          self.pop(reg);
        }
        self.asm.push_str(&format!("    bl {name}\n"));
        self.push();
      }
      NodeKind::Binary { op, lhs, rhs } => {
        self.emit_expr(lhs, func)?;
        self.emit_expr(rhs, func)?;
        self.pop("x1");
        self.pop("x0");
        match op {
          BinaryOp::Add => self.asm.push_str("    add x0, x0, x1\n"),
          BinaryOp::Sub => self.asm.push_str("    sub x0, x0, x1\n"),
          BinaryOp::Mul => self.asm.push_str("    mul x0, x0, x1\n"),
          BinaryOp::Div => self.asm.push_str("    sdiv x0, x0, x1\n"),
          BinaryOp::Eq => self.compare("eq"),
          BinaryOp::Ne => self.compare("ne"),
          BinaryOp::Lt => self.compare("lt"),
          BinaryOp::Le => self.compare("le"),
        }
        self.push();
      }
      NodeKind::Return { .. }
      | NodeKind::If { .. }
      | NodeKind::While { .. }
      | NodeKind::For { .. }
      | NodeKind::Block { .. }
      | NodeKind::ExprStmt { .. } => {
        return Err(CompileError::Internal {
          message: format!("statement used as an expression: {:?}", node.kind),
        });
      }
    }
    Ok(())
  }

  /// Push the address of an lvalue without loading from it.
  fn emit_addr(&mut self, node: &Node, func: &Function) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Var { var } => {
        let offset = local_offset(func, *var)?;
        self.sub_imm("x0", "x29", offset);
        self.push();
        Ok(())
      }
      NodeKind::Deref { operand } => self.emit_expr(operand, func),
      _ => Err(CompileError::semantic(
        self.source,
        node.loc,
        "not an lvalue",
      )),
    }
  }

  /// Replace the address on top of the stack with the value it points to.
  fn load(&mut self) {
    self.pop("x0");
    self.asm.push_str("    ldr x0, [x0]\n");
    self.push();
  }

  /// Pop a value and an address, store the value, and push it back.
  fn store(&mut self) {
    self.pop("x1");
    self.pop("x0");
    self.asm.push_str("    str x1, [x0]\n");
    self.asm.push_str("    mov x0, x1\n");
    self.push();
  }

  fn compare(&mut self, cond: &str) {
    self.asm.push_str("    cmp x0, x1\n");
    self.asm.push_str(&format!("    cset x0, {cond}\n"));
  }
}

fn is_register_name(name: &str) -> bool {
  let name = name.to_ascii_lowercase();
  if matches!(
    name.as_str(),
    "sp" | "wsp" | "xzr" | "wzr" | "lr" | "fp" | "ip0" | "ip1"
  ) {
    return true;
  }
  let mut chars = name.chars();
  matches!(chars.next(), Some('x' | 'w' | 'b' | 'h' | 's' | 'd' | 'q' | 'v'))
    && chars.as_str().parse::<u32>().is_ok_and(|n| n <= 31)
}

fn local_offset(func: &Function, var: usize) -> CompileResult<i64> {
  func
    .locals
    .get(var)
    .and_then(|local| local.offset)
    .ok_or_else(|| CompileError::Internal {
      message: format!("local #{var} of {} has no stack offset", func.name),
    })
}
