//! The `<module>.json` dump: circular statements, the symbol table sorted
//! by slot, the scheduled statements as annotated AST nodes, the linear IR,
//! and the diagnostics. Keys and shapes are stable so downstream tooling
//! can diff runs.

use serde_json::{Value as Json, json};

use crate::{
    frontend::ast::{Expression, ExpressionKind, Program, Statement, StatementKind},
    middle::lir::{Instruction, Value},
};

pub fn program_to_json(program: &Program) -> Json {
    let symbols: Vec<Json> = program
        .symbols_by_slot()
        .into_iter()
        .map(|(name, descriptor)| {
            json!({
                "name": name,
                "type": descriptor.type_desc.base.to_string(),
                "dim": descriptor.type_desc.dimension,
            })
        })
        .collect();

    let messages: Vec<Json> = program
        .messages
        .iter()
        .map(|message| Json::String(message.render()))
        .collect();

    json!({
        "circularStatements": statements_to_json(&program.circular_statements),
        "symbols": symbols,
        "executablestatements": statements_to_json(&program.statements),
        "ic": program.instructions.iter().map(instruction_to_json).collect::<Vec<_>>(),
        "messages": messages,
    })
}

fn statements_to_json(statements: &[Statement]) -> Json {
    Json::Array(statements.iter().map(statement_to_json).collect())
}

fn statement_to_json(statement: &Statement) -> Json {
    match &statement.kind {
        StatementKind::Expression => json!({
            "lineNumber": statement.line_number,
            "nodeType": "expression statement",
            "expression": expression_to_json(&statement.expression),
        }),
        StatementKind::Wait { id_list } => json!({
            "lineNumber": statement.line_number,
            "nodeType": "wait statement",
            "expression": expression_to_json(&statement.expression),
            "idList": id_list,
        }),
    }
}

fn expression_to_json(expression: &Expression) -> Json {
    let mut node = json!({
        "lineNumber": expression.loc.line,
        "nodeType": "expression node",
        "opCode": expression.opcode.code(),
        "mnemonic": expression.opcode.to_string(),
        "typeCode": expression.type_desc.base.code(),
        "type": expression.type_desc.base.to_string(),
        "dim": expression.type_desc.dimension,
        "idNdx": expression.id_index,
    });
    let object = node.as_object_mut().unwrap();

    match &expression.kind {
        ExpressionKind::Number(value) => {
            object.insert("numberValue".to_owned(), json!(value.to_string()));
        }
        ExpressionKind::String { raw, .. } => {
            object.insert("stringValue".to_owned(), json!(raw));
        }
        ExpressionKind::Boolean(value) => {
            object.insert("numberValue".to_owned(), json!(value.to_string()));
        }
        ExpressionKind::Array { items, .. } => {
            if let Some(items) = items {
                object.insert("left".to_owned(), expression_to_json(items));
            }
        }
        ExpressionKind::Identifier(name) => {
            object.insert("id".to_owned(), json!(name));
        }
        ExpressionKind::Binary { left, right } => {
            object.insert("left".to_owned(), expression_to_json(left));
            if let Some(right) = right {
                object.insert("right".to_owned(), expression_to_json(right));
            }
        }
        ExpressionKind::Unary { operand } => {
            object.insert("left".to_owned(), expression_to_json(operand));
        }
    }

    node
}

fn instruction_to_json(instruction: &Instruction) -> Json {
    let value = match &instruction.value {
        Value::None => Json::Null,
        Value::Number(n) => json!(n),
        Value::Str(s) => json!(s),
        Value::Bool(b) => json!(b),
    };

    json!({
        "mnemonic": instruction.opcode.to_string(),
        "opCode": instruction.opcode.code(),
        "type": instruction.type_desc.base.to_string(),
        "dim": instruction.type_desc.dimension,
        "p1": instruction.parameter,
        "offset": instruction.code_offset,
        "value": value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OptimizationFlags, compile,
        diagnostics::Message,
        frontend::{SourceFile, SourceFileOrigin},
    };

    fn dumped(contents: &str) -> Json {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut program = compile(&source, OptimizationFlags::default());
        program.messages.push(Message::info("Completed compilation"));
        program.sort_messages();
        program_to_json(&program)
    }

    #[test]
    fn top_level_keys_are_stable() {
        let dump = dumped("x = 1;");
        let object = dump.as_object().unwrap();

        for key in [
            "circularStatements",
            "symbols",
            "executablestatements",
            "ic",
            "messages",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn symbols_are_sorted_by_slot() {
        let dump = dumped("b = a + 1;\na = 2;");

        let symbols = dump["symbols"].as_array().unwrap();
        assert_eq!(symbols[0]["name"], "a");
        assert_eq!(symbols[0]["type"], "number");
        assert_eq!(symbols[0]["dim"], 0);
        assert_eq!(symbols[1]["name"], "b");
    }

    #[test]
    fn messages_render_sorted_with_severity() {
        let dump = dumped("x = y;\nq = 1 ? 2 : 3;");

        let messages: Vec<_> = dump["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap().to_owned())
            .collect();

        assert_eq!(
            messages,
            [
                "Line Number 1 [Error]: The variable `y` is not defined.",
                "Line Number 2 [Error]: The first operand of the ternary operator should be `bool`.",
                "[Info]: Completed compilation.",
            ]
        );
    }

    #[test]
    fn instructions_expose_mnemonic_and_parameter() {
        let dump = dumped("x = 1;");

        let ic = dump["ic"].as_array().unwrap();
        assert_eq!(ic[0]["mnemonic"], "const");
        assert_eq!(ic[1]["mnemonic"], "assign");
        assert_eq!(ic[1]["p1"], 0);
        assert_eq!(ic.last().unwrap()["mnemonic"], "lrt");
    }

    #[test]
    fn wait_statements_dump_their_id_list() {
        let dump = dumped("a = 1;\nwait (a) print(\"\" + a);");

        let statements = dump["executablestatements"].as_array().unwrap();
        assert_eq!(statements[1]["nodeType"], "wait statement");
        assert_eq!(statements[1]["idList"][0], "a");
    }
}
