//! Stack layout: give every local a slot below the frame base.

use tracing::trace;

use crate::parser::{Function, Program};

const SLOT_SIZE: i64 = 8;

/// Assign offsets for every function in the program.
pub fn assign_offsets(program: &mut Program) {
  for func in &mut program.functions {
    assign_function_offsets(func);
  }
}

/// The most recently declared local sits closest to the frame base (offset 8)
/// and the first declared one furthest away. The frame is padded to 16 bytes.
fn assign_function_offsets(func: &mut Function) {
  let count = func.locals.len() as i64;
  for (i, var) in func.locals.iter_mut().enumerate() {
    var.offset = Some(SLOT_SIZE * (count - i as i64));
  }
  func.stack_size = align_to(SLOT_SIZE * count, 16);
  trace!(function = %func.name, locals = count, stack_size = func.stack_size, "assigned stack offsets");
}

pub fn align_to(n: i64, align: i64) -> i64 {
  (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn laid_out(source: &str) -> Program {
    let mut program = parse(tokenize(source).unwrap(), source).unwrap();
    assign_offsets(&mut program);
    program
  }

  #[test]
  fn last_declared_local_is_closest_to_frame_base() {
    let program = laid_out("main() { a = 1; b = 2; c = 3; return a; }");
    let offsets: Vec<_> = program.functions[0]
      .locals
      .iter()
      .map(|v| v.offset)
      .collect();
    assert_eq!(offsets, [Some(24), Some(16), Some(8)]);
  }

  #[test]
  fn stack_size_rounds_up_to_sixteen() {
    let program = laid_out("main() { a = 1; b = 2; c = 3; return a; }");
    assert_eq!(program.functions[0].stack_size, 32);

    let program = laid_out("main() { a = 1; b = 2; return a; }");
    assert_eq!(program.functions[0].stack_size, 16);
  }

  #[test]
  fn function_without_locals_has_empty_frame() {
    let program = laid_out("main() { return 42; }");
    assert_eq!(program.functions[0].stack_size, 0);
  }

  #[test]
  fn offsets_are_distinct_aligned_and_positive() {
    let program = laid_out("f(a, b, c) { d = a; e = b; return c; } main() { return f(1, 2, 3); }");
    let func = &program.functions[0];
    let mut offsets: Vec<i64> = func.locals.iter().filter_map(|v| v.offset).collect();
    assert_eq!(offsets.len(), func.locals.len());
    assert!(offsets.iter().all(|&o| o > 0 && o % 8 == 0 && o <= func.stack_size));
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), func.locals.len());
  }

  #[test]
  fn align_to_rounds_up() {
    assert_eq!(align_to(0, 16), 0);
    assert_eq!(align_to(8, 16), 16);
    assert_eq!(align_to(16, 16), 16);
    assert_eq!(align_to(17, 16), 32);
  }
}
