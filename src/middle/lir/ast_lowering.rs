//! Flattens the folded AST into the linear IR. Statements are emitted in
//! schedule order, each followed by a `Pop` of whatever it left on the
//! stack; the stream is terminated by the runtime-cleanup call.

use super::{Instruction, Value};
use crate::{
    frontend::ast::{Expression, ExpressionKind, NUMBER, Opcode, Program},
    middle::{
        fold::{LRT_ARRAY_COMPARE, LRT_CLEANUP, LRT_STRING_COMPARE},
        optimization::{Optimization, OptimizationFlags},
    },
    runtime::library::RUNTIME_LIBRARY,
};

pub fn lower_to_ir(program: &mut Program, flags: OptimizationFlags) {
    let mut lowering = Lowering {
        instructions: Vec::new(),
        skip_dead_statements: flags.enabled(Optimization::DeadStatement),
        skip_dead_parts: flags.enabled(Optimization::DeadExpressionPart),
        in_context: false,
    };

    for statement in &mut program.statements {
        if lowering.skip_dead_statements && !statement.expression.is_effective() {
            continue;
        }

        lowering.emit_expression(&mut statement.expression);
        lowering.push_pop(pushed_values(&statement.expression));
    }

    let mut terminator = Instruction::new(Opcode::CallLrt, LRT_CLEANUP, NUMBER);
    terminator.value = Value::Number(0.0);
    lowering.instructions.push(terminator);

    program.instructions = lowering.instructions;
}

/// How many values an already-emitted subtree actually leaves on the stack.
/// Lowered comparisons reuse `stack_load` to carry their comparison kind,
/// but like any other operator they push exactly one result.
fn pushed_values(expr: &Expression) -> i32 {
    if expr.opcode == Opcode::CallLrt
        && (expr.id_index == LRT_STRING_COMPARE || expr.id_index == LRT_ARRAY_COMPARE)
    {
        1
    } else {
        expr.stack_load
    }
}

#[derive(Debug)]
struct Lowering {
    instructions: Vec<Instruction>,
    skip_dead_statements: bool,
    skip_dead_parts: bool,
    /// Set while emitting call arguments and array items, where comma parts
    /// must stay even if they look dead.
    in_context: bool,
}

impl Lowering {
    fn push_pop(&mut self, count: i32) {
        if count != 0 {
            self.instructions.push(Instruction::pop(count));
        }
    }

    fn emit_in_context(&mut self, expr: &mut Expression, context: bool) {
        let saved = self.in_context;
        self.in_context = context;
        self.emit_expression(expr);
        self.in_context = saved;
    }

    fn emit_expression(&mut self, expr: &mut Expression) {
        match &mut expr.kind {
            ExpressionKind::Number(value) => {
                let mut instruction = Instruction::literal(expr.type_desc);
                instruction.value = Value::Number(*value);
                self.instructions.push(instruction);
            }
            ExpressionKind::Boolean(value) => {
                let mut instruction = Instruction::literal(expr.type_desc);
                instruction.value = Value::Bool(*value);
                self.instructions.push(instruction);
            }
            ExpressionKind::String { value, .. } => {
                let value = value.clone();
                let mut instruction = Instruction::from_expression(expr);
                instruction.value = Value::Str(value);
                self.instructions.push(instruction);
            }
            ExpressionKind::Array { items, item_count } => {
                let item_count = *item_count;
                if let Some(items) = items {
                    self.emit_in_context(items, true);
                }

                let mut instruction = Instruction::from_expression(expr);
                instruction.value = Value::Number(item_count as f64);
                self.instructions.push(instruction);
            }
            ExpressionKind::Identifier(name) => {
                let name = name.clone();
                let mut instruction = Instruction::from_expression(expr);
                instruction.value = Value::Str(name);
                self.instructions.push(instruction);
            }
            ExpressionKind::Unary { .. } => {
                let ExpressionKind::Unary { operand } = &mut expr.kind else {
                    unreachable!()
                };
                self.emit_expression(operand);

                let mut instruction = Instruction::from_expression(expr);
                if expr.opcode == Opcode::CallLrt {
                    instruction.value = Value::Number(0.0);
                }
                self.instructions.push(instruction);
            }
            ExpressionKind::Binary { .. } => self.emit_binary(expr),
        }
    }

    fn emit_binary(&mut self, expr: &mut Expression) {
        let opcode = expr.opcode;
        // Captured before the condition code is emitted so the `Alt` arm can
        // reach back to the `JumpFalse` its parent conditional pushed last.
        let mut start = self.instructions.len().wrapping_sub(1);

        let ExpressionKind::Binary { left, right } = &mut expr.kind else {
            unreachable!()
        };

        // The target of an assignment and the callee name produce no code.
        if opcode != Opcode::Assign && opcode != Opcode::Call {
            self.emit_expression(left);
        }

        if left.opcode == Opcode::Comma && opcode != Opcode::Comma {
            self.push_pop(left.stack_load - 1);
            left.stack_load = 1;
        }

        if opcode == Opcode::Conditional {
            self.instructions
                .push(Instruction::new(Opcode::JumpFalse, 0, NUMBER));
        } else if opcode == Opcode::Alt {
            self.instructions
                .push(Instruction::new(Opcode::Jump, 0, NUMBER));
            self.instructions[start].parameter = self.instructions.len() as i32;
            start = self.instructions.len() - 1;
        }

        let mut right_contribution = 0;

        if opcode == Opcode::Call {
            if let Some(right) = right {
                self.emit_in_context(right, true);
            }
        } else {
            let right = right.as_mut().unwrap();

            let emitted = opcode != Opcode::Comma
                || !self.skip_dead_parts
                || right.is_effective()
                || self.in_context;

            if emitted {
                if right.opcode == Opcode::Comma {
                    self.emit_in_context(right, false);
                } else {
                    self.emit_expression(right);
                }
            }

            if right.opcode == Opcode::Comma {
                self.push_pop(right.stack_load - 1);
                right.stack_load = 1;
            }

            // A skipped dead part contributes no value.
            right_contribution = if emitted { pushed_values(right) } else { 0 };
        }

        match opcode {
            Opcode::Alt => {
                self.instructions[start].parameter = self.instructions.len() as i32;
                return;
            }
            Opcode::Conditional => return,
            Opcode::Comma => {
                expr.stack_load = pushed_values(left) + right_contribution;
                return;
            }
            _ => {}
        }

        let mut instruction = Instruction::new(opcode, expr.id_index, expr.type_desc);

        match opcode {
            Opcode::CallLrt => {
                instruction.value = if expr.id_index == LRT_STRING_COMPARE
                    || expr.id_index == LRT_ARRAY_COMPARE
                {
                    // The comparison kind rides in `stack_load`.
                    Value::Number(expr.stack_load as f64)
                } else {
                    Value::Number(0.0)
                };
            }
            Opcode::Assign => {
                let name = left.identifier_name().unwrap();
                instruction.value = Value::Str(name.to_owned());
            }
            Opcode::Call => {
                let name = left.identifier_name().unwrap();
                instruction.value = Value::Str(name.to_owned());
                instruction.parameter = RUNTIME_LIBRARY[name].parameters.len() as i32;
            }
            Opcode::Equal
            | Opcode::NotEqual
            | Opcode::Less
            | Opcode::LessEqual
            | Opcode::Greater
            | Opcode::GreaterEqual => {
                // The generator dispatches numeric/boolean compares on the
                // operand type, not the boolean result type.
                instruction.type_desc = left.type_desc;
            }
            _ => {}
        }

        self.instructions.push(instruction);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        frontend::{Parser, SourceFile, SourceFileOrigin},
        middle::{dependency, fold, type_check},
    };

    fn lowered(contents: &str, flags: OptimizationFlags) -> Program {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut program = Program::new(Parser::parse_module(&source).expect("parse failed"));
        dependency::sort_statements(&mut program);
        type_check::check(&mut program);
        assert!(!program.any_errors(), "{:?}", program.messages);
        fold::run(&mut program);
        lower_to_ir(&mut program, flags);
        program
    }

    fn opcodes(program: &Program) -> Vec<Opcode> {
        program.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn schedules_loads_and_stores() {
        // After the dependency sort, `b = 2` runs first; folding leaves
        // `b + 1` intact because `b` is not a literal.
        let program = lowered("a = b + 1;\nb = 2;", OptimizationFlags::default());

        assert_eq!(
            opcodes(&program),
            [
                Opcode::Literal,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::Identifier,
                Opcode::Literal,
                Opcode::Add,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );

        assert_eq!(program.instructions[1].parameter, 0);
        assert_eq!(program.instructions[3].parameter, 0);
        assert_eq!(program.instructions[6].parameter, 1);
        assert_eq!(program.instructions[8].parameter, LRT_CLEANUP);
    }

    #[test]
    fn conditionals_lower_to_jumps() {
        let program = lowered("p = 1 < 2;\nx = p ? 10 : 20;", OptimizationFlags::default());

        let jump_false = program
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::JumpFalse)
            .expect("a JumpFalse");
        let jump = program
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::Jump)
            .expect("a Jump");

        // JumpFalse lands just past the unconditional Jump; the Jump lands on
        // the join.
        assert_eq!(program.instructions[jump_false].parameter as usize, jump + 1);
        assert_eq!(program.instructions[jump].parameter as usize, jump + 2);
        assert_eq!(
            program.instructions[jump + 2].opcode,
            Opcode::Assign,
            "the join is the store to x"
        );
    }

    #[test]
    fn calls_carry_arity_and_name() {
        let program = lowered("x = right(\"hello\", 2);", OptimizationFlags::default());

        let call = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::Call)
            .expect("a Call");
        assert_eq!(call.parameter, 2);
        assert_eq!(call.value, Value::Str("right".to_owned()));
    }

    #[test]
    fn array_literals_push_items_then_allocate(){
        let program = lowered("xs = [1, 2, 3];", OptimizationFlags::default());

        assert_eq!(
            opcodes(&program),
            [
                Opcode::Literal,
                Opcode::Literal,
                Opcode::Literal,
                Opcode::CallLrt,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );
        assert_eq!(program.instructions[3].value, Value::Number(3.0));
    }

    #[test]
    fn statement_residue_is_popped() {
        let program = lowered("1, 2, 3;", OptimizationFlags::from_bits(0));

        assert_eq!(
            opcodes(&program),
            [
                Opcode::Literal,
                Opcode::Literal,
                Opcode::Literal,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );
        assert_eq!(program.instructions[3].parameter, 3);
    }

    #[test]
    fn comma_values_reduce_before_use() {
        // The parenthesised list leaves two values; only its first is the
        // operand, so a Pop(1) squeezes it back down before the Add.
        let program = lowered("x = (7, 8) + 1;", OptimizationFlags::from_bits(0));

        assert_eq!(
            opcodes(&program),
            [
                Opcode::Literal,
                Opcode::Literal,
                Opcode::Pop,
                Opcode::Literal,
                Opcode::Add,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );
        assert_eq!(program.instructions[2].parameter, 1);
    }

    #[test]
    fn dead_statements_are_elided() {
        let with_dead = lowered("x = 5;\n7;", OptimizationFlags::from_bits(0));
        let without_dead = lowered("x = 5;\n7;", OptimizationFlags::default());

        assert_eq!(
            opcodes(&with_dead),
            [
                Opcode::Literal,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::Literal,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );
        assert_eq!(
            opcodes(&without_dead),
            [
                Opcode::Literal,
                Opcode::Assign,
                Opcode::Pop,
                Opcode::CallLrt,
            ]
        );
    }

    #[test]
    fn dead_comma_parts_contribute_no_code() {
        let program = lowered("x = 1;\n(y = 2 * x), 7;", OptimizationFlags::from_bits(0b0010));

        // The ineffective `7` vanishes; the statement pop shrinks to one.
        assert!(
            !program
                .instructions
                .iter()
                .any(|i| i.value == Value::Number(7.0))
        );
        let pops: Vec<_> = program
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::Pop)
            .map(|i| i.parameter)
            .collect();
        assert_eq!(pops, [1, 1]);
    }

    #[test]
    fn call_arguments_are_kept_even_when_dead() {
        let program = lowered(
            "x = count([1, 2]);",
            OptimizationFlags::from_bits(0b0010),
        );

        // Both literals survive inside the argument context.
        let literals = program
            .instructions
            .iter()
            .filter(|i| i.opcode == Opcode::Literal)
            .count();
        assert_eq!(literals, 2);
    }

    #[test]
    fn string_comparison_kind_rides_in_the_value() {
        let program = lowered("s = \"a\";\nb = s >= \"b\";", OptimizationFlags::default());

        let compare = program
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::CallLrt && i.parameter == LRT_STRING_COMPARE)
            .expect("a lowered string comparison");
        assert_eq!(compare.value, Value::Number(4.0));
    }
}
