//! A tiny interpreter for the AArch64 subset the code generator emits, so
//! integration tests can check what compiled programs compute without an
//! assembler or a target machine.

use std::collections::HashMap;

const STACK_TOP: i64 = 0x10_0000;
const RETURN_SENTINEL: i64 = -1;
const STEP_LIMIT: usize = 1_000_000;
/// What reads of never-written memory observe.
const GARBAGE: i64 = 0x5a5a_5a5a_5a5a_5a5a;

struct Instr {
  mnemonic: String,
  operands: Vec<String>,
}

struct Machine {
  regs: [i64; 31],
  sp: i64,
  flags: (i64, i64),
  memory: HashMap<i64, i64>,
}

/// Compile `source` and run its `main`, returning the value left in `x0`.
pub fn compile_and_run(source: &str) -> i64 {
  let asm = rchicc::generate_assembly(source)
    .unwrap_or_else(|err| panic!("compilation failed:\n{err}"));
  run(&asm).unwrap_or_else(|err| panic!("execution failed: {err}\n{asm}"))
}

pub fn run(asm: &str) -> Result<i64, String> {
  let (program, labels) = load(asm)?;
  let mut machine = Machine {
    regs: [0; 31],
    sp: STACK_TOP,
    flags: (0, 0),
    memory: HashMap::new(),
  };
  machine.regs[30] = RETURN_SENTINEL;

  let mut pc = *labels.get("main").ok_or("no main function")?;
  for _ in 0..STEP_LIMIT {
    let instr = program.get(pc).ok_or_else(|| format!("pc {pc} out of range"))?;
    match machine.step(instr, pc, &labels)? {
      Some(next) if next == RETURN_SENTINEL => return Ok(machine.regs[0]),
      Some(next) => pc = next as usize,
      None => pc += 1,
    }
  }
  Err("step limit exceeded".to_string())
}

fn load(asm: &str) -> Result<(Vec<Instr>, HashMap<String, usize>), String> {
  let mut program = Vec::new();
  let mut labels = HashMap::new();
  for line in asm.lines().map(str::trim).filter(|line| !line.is_empty()) {
    if let Some(label) = line.strip_suffix(':') {
      if labels.insert(label.to_string(), program.len()).is_some() {
        return Err(format!("duplicate label {label}"));
      }
    } else if !line.starts_with('.') {
      let (mnemonic, rest) = line.split_once(' ').unwrap_or((line, ""));
      program.push(Instr {
        mnemonic: mnemonic.to_string(),
        operands: split_operands(rest),
      });
    }
  }
  Ok((program, labels))
}

/// Split on commas that are not inside brackets.
fn split_operands(rest: &str) -> Vec<String> {
  let mut operands = Vec::new();
  let mut depth = 0;
  let mut current = String::new();
  for c in rest.chars() {
    match c {
      '[' => depth += 1,
      ']' => depth -= 1,
      ',' if depth == 0 => {
        operands.push(current.trim().to_string());
        current.clear();
        continue;
      }
      _ => {}
    }
    current.push(c);
  }
  if !current.trim().is_empty() {
    operands.push(current.trim().to_string());
  }
  operands
}

fn imm(operand: &str) -> Result<i64, String> {
  operand
    .strip_prefix('#')
    .and_then(|n| n.parse().ok())
    .ok_or_else(|| format!("bad immediate {operand}"))
}

impl Machine {
  fn read(&self, reg: &str) -> Result<i64, String> {
    match reg {
      "sp" => Ok(self.sp),
      "xzr" => Ok(0),
      _ => Ok(self.regs[reg_index(reg)?]),
    }
  }

  fn write(&mut self, reg: &str, value: i64) -> Result<(), String> {
    match reg {
      "sp" => self.sp = value,
      "xzr" => {}
      _ => self.regs[reg_index(reg)?] = value,
    }
    Ok(())
  }

  fn value(&self, operand: &str) -> Result<i64, String> {
    if operand.starts_with('#') {
      imm(operand)
    } else {
      self.read(operand)
    }
  }

  fn load_mem(&self, addr: i64) -> i64 {
    self.memory.get(&addr).copied().unwrap_or(GARBAGE)
  }

  /// Resolve `[base]`, `[base, #off]!` or `[base], #post`, applying writeback.
  /// Returns the effective address.
  fn address(&mut self, mem: &str, post: Option<&String>) -> Result<i64, String> {
    let pre_index = mem.ends_with('!');
    let inner = mem
      .trim_end_matches('!')
      .strip_prefix('[')
      .and_then(|m| m.strip_suffix(']'))
      .ok_or_else(|| format!("bad memory operand {mem}"))?;
    let parts = split_operands(inner);
    let base = parts.first().ok_or("empty memory operand")?;
    let offset = parts.get(1).map(|o| imm(o)).transpose()?.unwrap_or(0);

    let addr = self.read(base)?.wrapping_add(offset);
    if pre_index {
      self.write(base, addr)?;
    }
    if let Some(post) = post {
      let updated = self.read(base)?.wrapping_add(imm(post)?);
      self.write(base, updated)?;
    }
    Ok(addr)
  }

  /// Execute one instruction; returns the jump target if control transfers.
  fn step(
    &mut self,
    instr: &Instr,
    pc: usize,
    labels: &HashMap<String, usize>,
  ) -> Result<Option<i64>, String> {
    let ops = &instr.operands;
    let op = |i: usize| operand(instr, i);
    let target = |name: &str| jump_target(labels, name);

    match instr.mnemonic.as_str() {
      "mov" | "movz" => {
        let value = self.value(op(1)?)?;
        self.write(op(0)?, value)?;
      }
      "movk" => {
        let shift: u32 = op(2)?
          .strip_prefix("lsl #")
          .and_then(|s| s.parse().ok())
          .ok_or("bad movk shift")?;
        let chunk = (imm(op(1)?)? as u64) << shift;
        let mask = !(0xffff_u64 << shift);
        let value = (self.read(op(0)?)? as u64 & mask) | chunk;
        self.write(op(0)?, value as i64)?;
      }
      "add" | "sub" | "mul" | "sdiv" => {
        let lhs = self.read(op(1)?)?;
        let rhs = self.value(op(2)?)?;
        let result = match instr.mnemonic.as_str() {
          "add" => lhs.wrapping_add(rhs),
          "sub" => lhs.wrapping_sub(rhs),
          "mul" => lhs.wrapping_mul(rhs),
          _ if rhs == 0 => 0,
          _ => lhs.wrapping_div(rhs),
        };
        self.write(op(0)?, result)?;
      }
      "cmp" => self.flags = (self.read(op(0)?)?, self.read(op(1)?)?),
      "cset" => {
        let (a, b) = self.flags;
        let holds = match op(1)? {
          "eq" => a == b,
          "ne" => a != b,
          "lt" => a < b,
          "le" => a <= b,
          other => return Err(format!("unknown condition {other}")),
        };
        self.write(op(0)?, i64::from(holds))?;
      }
      "str" => {
        let value = self.read(op(0)?)?;
        let addr = self.address(op(1)?, ops.get(2))?;
        self.memory.insert(addr, value);
      }
      "ldr" => {
        let addr = self.address(op(1)?, ops.get(2))?;
        let value = self.load_mem(addr);
        self.write(op(0)?, value)?;
      }
      "stp" => {
        let (first, second) = (self.read(op(0)?)?, self.read(op(1)?)?);
        let addr = self.address(op(2)?, ops.get(3))?;
        self.memory.insert(addr, first);
        self.memory.insert(addr + 8, second);
      }
      "ldp" => {
        let addr = self.address(op(2)?, ops.get(3))?;
        let (first, second) = (self.load_mem(addr), self.load_mem(addr + 8));
        self.write(op(0)?, first)?;
        self.write(op(1)?, second)?;
      }
      "cbz" => {
        if self.read(op(0)?)? == 0 {
          return target(op(1)?);
        }
      }
      "b" => return target(op(0)?),
      "bl" => {
        self.regs[30] = pc as i64 + 1;
        return target(op(0)?);
      }
      "ret" => return Ok(Some(self.regs[30])),
      other => return Err(format!("unsupported instruction {other}")),
    }
    Ok(None)
  }
}

fn operand(instr: &Instr, i: usize) -> Result<&str, String> {
  instr
    .operands
    .get(i)
    .map(String::as_str)
    .ok_or_else(|| format!("{} is missing operand {i}", instr.mnemonic))
}

fn jump_target(labels: &HashMap<String, usize>, name: &str) -> Result<Option<i64>, String> {
  labels
    .get(name)
    .map(|&at| Some(at as i64))
    .ok_or_else(|| format!("undefined label {name}"))
}

fn reg_index(reg: &str) -> Result<usize, String> {
  reg
    .strip_prefix('x')
    .and_then(|n| n.parse::<usize>().ok())
    .filter(|&n| n < 31)
    .ok_or_else(|| format!("unknown register {reg}"))
}
