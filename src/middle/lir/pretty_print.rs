use itertools::Itertools;

use super::{Instruction, Value};

/// Renders the instruction stream as the human-readable `-IC.txt` dump, one
/// instruction per line:
///
/// ```text
/// 00003 id         0 [number:0] b
/// ```
pub fn render_ic(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| format_instruction(index, instruction))
        .join("\n")
}

fn format_instruction(index: usize, instruction: &Instruction) -> String {
    let value = match &instruction.value {
        Value::None => String::new(),
        Value::Number(n) => format!("{n}"),
        Value::Str(s) => s.clone(),
        Value::Bool(b) => format!("{b}"),
    };

    format!(
        "{:05} {:<6} {:>5} [{}:{}] {}",
        index,
        instruction.opcode,
        instruction.parameter,
        instruction.type_desc.base,
        instruction.type_desc.dimension,
        value
    )
    .trim_end()
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{NUMBER, Opcode, TypeDescriptor};

    #[test]
    fn lines_are_indexed_and_typed() {
        let mut load = Instruction::new(Opcode::Identifier, 0, NUMBER);
        load.value = Value::Str("b".to_owned());
        let mut push = Instruction::literal(NUMBER);
        push.value = Value::Number(2.0);
        let pop = Instruction::pop(1);

        let dump = render_ic(&[push, load, pop]);
        let lines: Vec<_> = dump.lines().collect();

        assert_eq!(lines[0], "00000 const      0 [number:0] 2");
        assert_eq!(lines[1], "00001 id         0 [number:0] b");
        assert_eq!(lines[2], "00002 pop        1 [none:0]");
    }

    #[test]
    fn dimensions_show_in_the_type_column() {
        let alloc = Instruction::new(Opcode::CallLrt, 0, TypeDescriptor::array(crate::frontend::ast::Type::Number, 1));
        let dump = render_ic(&[alloc]);
        assert!(dump.contains("[number:1]"));
    }
}
