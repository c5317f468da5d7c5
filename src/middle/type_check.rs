//! Type checking runs after the dependency sort, so every non-circular use
//! of a symbol is seen after the statement that defines it. The checker
//! deduces a `TypeDescriptor` per expression, records the slot index of every
//! identifier reference, and counts calls/assignments for the dead-code
//! analysis later on.
//!
//! A sub-expression that fails to type stays at `None` and is suppressed in
//! the enclosing expression instead of producing a cascade of errors.

use hashbrown::HashMap;

use crate::{
    diagnostics::{Location, Message},
    frontend::ast::{
        BOOLEAN, Expression, ExpressionKind, NONE, NUMBER, Opcode, Program, Statement,
        StatementKind, SymbolDescriptor, STRING, Type, TypeDescriptor,
    },
    runtime::library::RUNTIME_LIBRARY,
};

pub fn check(program: &mut Program) {
    let mut checker = Checker {
        symbol_table: std::mem::take(&mut program.symbol_table),
        frames: Vec::new(),
        messages: Vec::new(),
    };

    for statement in &mut program.statements {
        checker.check_statement(statement);
    }

    for statement in &program.circular_statements {
        checker.messages.push(Message::error_at_line(
            statement.line_number,
            "Statement is in circular dependency",
        ));
    }

    program.symbol_table = checker.symbol_table;
    program.messages.append(&mut checker.messages);
}

#[derive(Debug)]
struct Checker {
    symbol_table: HashMap<String, SymbolDescriptor>,
    /// Argument-list frames. A frame is opened per `Call` (and per
    /// parenthesised comma chain); comma operands push their types so that a
    /// call site can match them against the signature in call order.
    frames: Vec<Vec<TypeDescriptor>>,
    messages: Vec<Message>,
}

impl Checker {
    fn error(&mut self, loc: Location, text: impl Into<String>) {
        self.messages.push(Message::error(loc, text));
    }

    fn check_statement(&mut self, statement: &mut Statement) {
        self.check_expression(&mut statement.expression, Opcode::None);

        if let StatementKind::Wait { id_list } = &statement.kind {
            for id in id_list {
                if !self.symbol_table.contains_key(id.as_str()) {
                    self.messages.push(Message::error_at_line(
                        statement.line_number,
                        format!("The symbol `{id}` is not defined"),
                    ));
                }
            }
        }
    }

    /// `parent` is the opcode of the enclosing operator: an identifier means
    /// a definition under `Assign`, a library function under `Call`, and a
    /// plain use anywhere else.
    fn check_expression(&mut self, expr: &mut Expression, parent: Opcode) {
        let loc = expr.loc;

        match &mut expr.kind {
            ExpressionKind::Number(_) | ExpressionKind::String { .. } | ExpressionKind::Boolean(_) => {}
            ExpressionKind::Identifier(name) => {
                if let Some(symbol) = self.symbol_table.get(name.as_str()) {
                    expr.type_desc = symbol.type_desc;
                    if parent != Opcode::Assign {
                        expr.id_index = symbol.slot;
                    }
                } else if let Some(signature) = RUNTIME_LIBRARY.get(name.as_str()) {
                    if parent == Opcode::Call {
                        expr.type_desc = signature.return_type;
                        expr.id_index = signature.index;
                    } else if parent != Opcode::Assign {
                        let name = name.clone();
                        self.error(
                            loc,
                            format!("Can't use runtime library function `{name}` without calling it"),
                        );
                    }
                } else {
                    let name = name.clone();
                    self.error(loc, format!("The variable `{name}` is not defined"));
                }
            }
            ExpressionKind::Array { items, item_count } => {
                if let Some(items) = items {
                    self.frames.push(Vec::new());
                    self.check_expression(items, Opcode::None);
                    expr.function_call_count += items.function_call_count;
                    expr.assignment_count += items.assignment_count;

                    let frame = self.frames.pop().unwrap();
                    if !frame.iter().all(|t| *t == items.type_desc) {
                        self.messages.push(Message::error(
                            loc,
                            "All items of an array should be of the same type",
                        ));
                    }

                    expr.type_desc = items.type_desc;
                    *item_count = frame.len() + 1;
                }

                expr.type_desc.dimension += 1;
            }
            ExpressionKind::Unary { operand } => {
                self.check_expression(operand, Opcode::None);
                expr.function_call_count += operand.function_call_count;
                expr.assignment_count += operand.assignment_count;

                if operand.type_desc.base == Type::None {
                    return;
                }

                match expr.opcode {
                    Opcode::Not => {
                        if operand.type_desc != BOOLEAN {
                            self.error(
                                loc,
                                "Unary `!` operator requires its operand to be of type `boolean`",
                            );
                        } else {
                            expr.type_desc = operand.type_desc;
                        }
                    }
                    Opcode::Minus => {
                        if operand.type_desc != NUMBER {
                            self.error(
                                loc,
                                "Unary `-` operator requires its operand to be of type `number`",
                            );
                        } else {
                            expr.type_desc = operand.type_desc;
                        }
                    }
                    _ => {}
                }
            }
            ExpressionKind::Binary { .. } => self.check_binary(expr),
        }
    }

    fn check_binary(&mut self, expr: &mut Expression) {
        let loc = expr.loc;
        let opcode = expr.opcode;

        let ExpressionKind::Binary { left, right } = &mut expr.kind else {
            unreachable!()
        };

        self.check_expression(left, opcode);
        expr.function_call_count += left.function_call_count;
        expr.assignment_count += left.assignment_count;

        if let Some(right) = right {
            if (opcode == Opcode::Call && left.type_desc != NONE) || right.opcode == Opcode::Comma {
                self.frames.push(Vec::new());
            }

            self.check_expression(right, Opcode::None);
            expr.function_call_count += right.function_call_count;
            expr.assignment_count += right.assignment_count;
        }

        // Error suppression: an already-failed operand silences this operator
        // too, except where the rule below still has something to say.
        let right_is_none = right.as_ref().is_some_and(|r| r.type_desc == NONE);
        if (opcode != Opcode::Assign && opcode != Opcode::Comma && left.type_desc == NONE)
            || (opcode != Opcode::Conditional
                && opcode != Opcode::Call
                && opcode != Opcode::ArrayAccess
                && opcode != Opcode::Comma
                && right_is_none)
        {
            return;
        }

        match opcode {
            Opcode::Assign => {
                let Some(name) = left.identifier_name().map(String::from) else {
                    self.error(loc, "The LHS of the assignment operator must be an identifier");
                    return;
                };
                let right = right.as_ref().unwrap();

                if RUNTIME_LIBRARY.contains_key(name.as_str()) {
                    self.error(
                        loc,
                        format!(
                            "Cannot redefine runtime library function name `{name}` as a variable name"
                        ),
                    );
                } else if self.symbol_table.entry_ref(name.as_str()).or_default().type_desc != NONE
                {
                    self.error(loc, format!("The variable `{name}` has already been defined"));
                } else {
                    expr.type_desc = right.type_desc;
                    left.type_desc = right.type_desc;

                    let symbol = self.symbol_table.get_mut(name.as_str()).unwrap();
                    symbol.type_desc = expr.type_desc;
                    expr.id_index = symbol.slot;
                    expr.assignment_count += 1;
                }
            }
            Opcode::Conditional => {
                if left.type_desc != BOOLEAN {
                    self.error(loc, "The first operand of the ternary operator should be `bool`");
                }

                expr.type_desc = right.as_ref().unwrap().type_desc;
            }
            Opcode::Alt => {
                let right = right.as_ref().unwrap();
                if left.type_desc != right.type_desc {
                    self.error(
                        loc,
                        "Last 2 operands of the ternary operator should be of the same type",
                    );
                } else {
                    expr.type_desc = left.type_desc;
                }
            }
            Opcode::And | Opcode::Or => {
                let right = right.as_ref().unwrap();
                if left.type_desc != BOOLEAN || right.type_desc != BOOLEAN {
                    self.error(
                        loc,
                        "Boolean operators can only be applied to `boolean` types",
                    );
                } else {
                    expr.type_desc = BOOLEAN;
                }
            }
            Opcode::Multiply | Opcode::Divide | Opcode::Subtract => {
                let right = right.as_ref().unwrap();
                if left.type_desc != NUMBER || right.type_desc != NUMBER {
                    self.error(
                        loc,
                        format!(
                            "Operator `{}` requires its operands to be of the type `number`",
                            opcode.symbol()
                        ),
                    );
                } else {
                    expr.type_desc = NUMBER;
                }
            }
            Opcode::Add => {
                let right = right.as_ref().unwrap();
                if left.type_desc == NUMBER && right.type_desc == NUMBER {
                    expr.type_desc = NUMBER;
                } else if (left.type_desc == STRING
                    && (right.type_desc == STRING || right.type_desc == NUMBER))
                    || (left.type_desc == NUMBER && right.type_desc == STRING)
                {
                    expr.type_desc = STRING;
                } else if left.type_desc.is_array() {
                    if left.type_desc.item_type() == right.type_desc {
                        expr.type_desc = left.type_desc;
                    } else {
                        self.error(
                            loc,
                            "The item being appended should be the same type as the array's items",
                        );
                    }
                } else {
                    self.error(
                        loc,
                        format!(
                            "Cannot add `{}` to `{}`",
                            right.type_desc, left.type_desc
                        ),
                    );
                }
            }
            Opcode::Less | Opcode::LessEqual | Opcode::Greater | Opcode::GreaterEqual => {
                let right = right.as_ref().unwrap();
                if left.type_desc.is_array() || left.type_desc == BOOLEAN {
                    self.error(
                        loc,
                        format!(
                            "Operator `{}` is not supported for `{}`",
                            opcode.symbol(),
                            left.type_desc
                        ),
                    );
                } else if left.type_desc != right.type_desc {
                    self.error(
                        loc,
                        format!(
                            "Operator `{}` requires its operands to be of the same type",
                            opcode.symbol()
                        ),
                    );
                } else {
                    expr.type_desc = BOOLEAN;
                }
            }
            Opcode::Equal | Opcode::NotEqual => {
                let right = right.as_ref().unwrap();
                if left.type_desc != right.type_desc {
                    self.error(
                        loc,
                        format!(
                            "Operator `{}` requires its operands to be of the same type",
                            opcode.symbol()
                        ),
                    );
                } else {
                    expr.type_desc = BOOLEAN;
                }
            }
            Opcode::ArrayAccess => {
                let right = right.as_ref().unwrap();
                if !left.type_desc.is_array() {
                    self.error(loc, "Array access operator can only be applied to an array");
                } else if right.opcode == Opcode::Comma {
                    self.error(loc, "Cannot index an array by a list of expressions");
                } else if right.type_desc != NUMBER {
                    self.error(loc, "Array index should be `number`");
                } else {
                    expr.type_desc = left.type_desc.item_type();
                }
            }
            Opcode::Call => {
                match left.identifier_name() {
                    None => {
                        self.error(
                            loc,
                            "The first operand of a call operator can only be an identifier",
                        );
                    }
                    Some(name) => match RUNTIME_LIBRARY.get(name) {
                        None => {
                            let name = name.to_owned();
                            self.error(loc, format!("`{name}` is not a runtime library function"));
                        }
                        Some(signature) => {
                            let mut argument_count = 0;
                            if let Some(right) = right {
                                // The outermost comma operand is the first
                                // argument; insert it at the front so the
                                // frame reads in call order.
                                let frame = self.frames.last_mut().unwrap();
                                frame.insert(0, right.type_desc);
                                argument_count = frame.len();
                            }

                            if signature.parameters.len() != argument_count {
                                self.messages.push(Message::error(
                                    loc,
                                    format!(
                                        "Mismatch in function argument count: expected {}, received {}",
                                        signature.parameters.len(),
                                        argument_count
                                    ),
                                ));
                            }

                            for idx in 0..signature.parameters.len().min(argument_count) {
                                let parameter = signature.parameters[idx];
                                let argument = self.frames.last().unwrap()[idx];
                                if argument != parameter && argument != NONE {
                                    self.messages.push(Message::error(
                                        loc,
                                        format!(
                                            "Type mismatch in function argument position {}: expected `{parameter}`, received `{argument}`",
                                            idx + 1
                                        ),
                                    ));
                                }
                            }

                            expr.type_desc = left.type_desc;
                            expr.function_call_count += 1;
                        }
                    },
                }

                if right.is_some() {
                    self.frames.pop();
                }
            }
            Opcode::Comma => {
                expr.type_desc = left.type_desc;
                let right = right.as_ref().unwrap();

                if right.opcode == Opcode::Comma {
                    self.frames.pop();
                }

                if let Some(frame) = self.frames.last_mut() {
                    frame.push(right.type_desc);
                }
            }
            _ => {}
        }
    }
}
