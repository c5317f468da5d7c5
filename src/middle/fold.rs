//! Constant folding and runtime-library lowering. Literal sub-expressions
//! are evaluated at compile time; string, array, and comparison operators
//! that the code generator cannot express inline are rewritten into
//! `CallLrt` nodes carrying their sub-op in `id_index`.
//!
//! Folding a node may replace the whole subtree, so the traversal is by
//! value: every visit consumes an `Expression` and returns the expression
//! that should stand in its place.

use crate::{
    diagnostics::Message,
    frontend::ast::{Expression, ExpressionKind, NUMBER, Opcode, Program, STRING},
};

/// CallLrt sub-ops (the `id_index` of a lowered node).
pub const LRT_ALLOCATE_ARRAY: i32 = 0;
pub const LRT_ARRAY_ELEMENT: i32 = 1;
pub const LRT_APPEND_ELEMENT: i32 = 2;
pub const LRT_ALLOCATE_STRING: i32 = 3;
pub const LRT_CAT_STRING: i32 = 4;
pub const LRT_NUMBER_TO_STRING: i32 = 5;
pub const LRT_STRING_COMPARE: i32 = 6;
pub const LRT_ARRAY_COMPARE: i32 = 7;
pub const LRT_CLEANUP: i32 = 8;

pub fn run(program: &mut Program) {
    let mut messages = Vec::new();

    for statement in &mut program.statements {
        fold_in_place(&mut statement.expression, &mut messages);
    }

    program.messages.append(&mut messages);
}

fn fold_in_place(slot: &mut Expression, messages: &mut Vec<Message>) {
    let placeholder = Expression::number(slot.loc, 0.0);
    let expression = std::mem::replace(slot, placeholder);
    *slot = fold_expression(expression, messages);
}

/// The fold-time rendering of a number appended to a string; the runtime's
/// `number_to_string` uses the same fixed-point format.
pub fn render_number(value: f64) -> String {
    format!("{value:.6}")
}

fn lower_string_literal(mut expr: Expression) -> Expression {
    expr.opcode = Opcode::CallLrt;
    expr.id_index = LRT_ALLOCATE_STRING;
    expr
}

/// Whether an operand evaluates to an array at runtime. A lowered array
/// literal already carries its item type, so the opcode has to be consulted
/// alongside the descriptor.
fn yields_array(expr: &Expression) -> bool {
    expr.type_desc.is_array()
        || (expr.opcode == Opcode::CallLrt && expr.id_index == LRT_ALLOCATE_ARRAY)
}

/// Wraps a numeric operand in the number-to-string runtime conversion.
fn convert_to_string(operand: Expression) -> Expression {
    let mut lrt = Expression::unary(operand.loc, Opcode::CallLrt, operand);
    lrt.id_index = LRT_NUMBER_TO_STRING;
    lrt.type_desc = STRING;
    lrt
}

fn fold_expression(mut expr: Expression, messages: &mut Vec<Message>) -> Expression {
    match expr.kind {
        ExpressionKind::Number(_) | ExpressionKind::Boolean(_) | ExpressionKind::Identifier(_) => {
            expr
        }
        ExpressionKind::String { .. } => lower_string_literal(expr),
        ExpressionKind::Array { ref mut items, .. } => {
            if let Some(items) = items {
                fold_in_place(items, messages);
            }

            if expr.opcode != Opcode::CallLrt {
                expr.opcode = Opcode::CallLrt;
                expr.id_index = LRT_ALLOCATE_ARRAY;
                // The lowered node stands for the constructed array itself,
                // so its type is the item type handed to the allocator.
                expr.type_desc.dimension -= 1;
            }
            expr
        }
        ExpressionKind::Unary { .. } => fold_unary(expr, messages),
        ExpressionKind::Binary { .. } => fold_binary(expr, messages),
    }
}

fn fold_unary(mut expr: Expression, messages: &mut Vec<Message>) -> Expression {
    let ExpressionKind::Unary { ref mut operand } = expr.kind else {
        unreachable!()
    };
    fold_in_place(operand, messages);

    match expr.opcode {
        Opcode::Not => {
            if let ExpressionKind::Boolean(value) = operand.kind {
                return Expression::boolean(expr.loc, !value);
            }
        }
        Opcode::Minus => {
            if let ExpressionKind::Number(value) = operand.kind {
                return Expression::number(expr.loc, -value);
            }
        }
        _ => {}
    }

    expr
}

/// The header of a binary node plus its already-folded children, pulled
/// apart so the reductions below can move either child out freely.
struct BinaryParts {
    expr: Expression,
    left: Box<Expression>,
    right: Box<Expression>,
}

impl BinaryParts {
    fn reassemble(self) -> Expression {
        let mut expr = self.expr;
        expr.kind = ExpressionKind::Binary {
            left: self.left,
            right: Some(self.right),
        };
        expr
    }
}

fn fold_binary(mut expr: Expression, messages: &mut Vec<Message>) -> Expression {
    let kind = std::mem::replace(&mut expr.kind, ExpressionKind::Number(0.0));
    let ExpressionKind::Binary { left, right } = kind else {
        unreachable!()
    };

    let left = Box::new(fold_expression(*left, messages));
    let right = right.map(|r| Box::new(fold_expression(*r, messages)));

    let Some(right) = right else {
        // Nullary call; nothing to reduce.
        expr.kind = ExpressionKind::Binary { left, right: None };
        return expr;
    };

    let parts = BinaryParts { expr, left, right };

    match parts.expr.opcode {
        Opcode::Add => reduce_addition(parts),
        Opcode::Subtract => reduce_subtraction(parts),
        Opcode::Multiply => reduce_multiplication(parts),
        Opcode::Divide => reduce_division(parts, messages),
        Opcode::And | Opcode::Or => reduce_logical(parts),
        Opcode::Equal
        | Opcode::NotEqual
        | Opcode::Less
        | Opcode::LessEqual
        | Opcode::Greater
        | Opcode::GreaterEqual => reduce_comparison(parts),
        Opcode::Conditional => reduce_ternary(parts),
        Opcode::ArrayAccess => {
            let mut parts = parts;
            parts.expr.opcode = Opcode::CallLrt;
            parts.expr.id_index = LRT_ARRAY_ELEMENT;
            parts.reassemble()
        }
        _ => parts.reassemble(),
    }
}

fn reduce_addition(mut parts: BinaryParts) -> Expression {
    let loc = parts.expr.loc;

    if let ExpressionKind::String { value: lv, raw: lraw } = &parts.left.kind {
        if let ExpressionKind::String { value: rv, raw: rraw } = &parts.right.kind {
            let folded =
                Expression::string(loc, format!("{lv}{rv}"), format!("{lraw}{rraw}"));
            return lower_string_literal(folded);
        }

        if lv.is_empty() {
            let right = *parts.right;
            return if right.type_desc == STRING {
                right
            } else {
                convert_to_string(right)
            };
        }

        if let ExpressionKind::Number(rn) = parts.right.kind {
            let rendered = render_number(rn);
            let folded =
                Expression::string(loc, format!("{lv}{rendered}"), format!("{lraw}{rendered}"));
            return lower_string_literal(folded);
        }
    } else if let ExpressionKind::String { value: rv, raw: rraw } = &parts.right.kind {
        if rv.is_empty() {
            let left = *parts.left;
            return if left.type_desc == STRING {
                left
            } else {
                convert_to_string(left)
            };
        }

        if let ExpressionKind::Number(ln) = parts.left.kind {
            let rendered = render_number(ln);
            let folded =
                Expression::string(loc, format!("{rendered}{rv}"), format!("{rendered}{rraw}"));
            return lower_string_literal(folded);
        }
    } else if let ExpressionKind::Number(ln) = parts.left.kind {
        if let ExpressionKind::Number(rn) = parts.right.kind {
            return Expression::number(loc, ln + rn);
        }

        if ln == 0.0 && parts.right.type_desc == NUMBER {
            return *parts.right;
        }
    } else if let ExpressionKind::Number(rn) = parts.right.kind {
        if rn == 0.0 && parts.left.type_desc == NUMBER {
            return *parts.left;
        }
    }

    // Mixed string/number additions coerce the numeric side at runtime.
    if parts.left.type_desc == NUMBER && parts.right.type_desc == STRING {
        let left = *parts.left;
        parts.left = Box::new(convert_to_string(left));
    } else if parts.left.type_desc == STRING && parts.right.type_desc == NUMBER {
        let right = *parts.right;
        parts.right = Box::new(convert_to_string(right));
    }

    if parts.left.type_desc == STRING && parts.right.type_desc == STRING {
        parts.expr.opcode = Opcode::CallLrt;
        parts.expr.id_index = LRT_CAT_STRING;
    } else if yields_array(&parts.left) {
        parts.expr.opcode = Opcode::CallLrt;
        parts.expr.id_index = LRT_APPEND_ELEMENT;
    }

    parts.reassemble()
}

fn reduce_subtraction(parts: BinaryParts) -> Expression {
    let loc = parts.expr.loc;

    if let ExpressionKind::Number(ln) = parts.left.kind {
        if let ExpressionKind::Number(rn) = parts.right.kind {
            return Expression::number(loc, ln - rn);
        }

        if ln == 0.0 {
            let mut negated = Expression::unary(loc, Opcode::Minus, *parts.right);
            negated.type_desc = NUMBER;
            return negated;
        }
    } else if let ExpressionKind::Number(rn) = parts.right.kind {
        if rn == 0.0 {
            return *parts.left;
        }
    }

    parts.reassemble()
}

fn reduce_multiplication(parts: BinaryParts) -> Expression {
    let loc = parts.expr.loc;

    if let ExpressionKind::Number(ln) = parts.left.kind {
        if let ExpressionKind::Number(rn) = parts.right.kind {
            return Expression::number(loc, ln * rn);
        }

        if ln == 0.0 {
            return Expression::number(loc, 0.0);
        }
    } else if let ExpressionKind::Number(rn) = parts.right.kind {
        if rn == 0.0 {
            return Expression::number(loc, 0.0);
        }
    }

    parts.reassemble()
}

fn reduce_division(parts: BinaryParts, messages: &mut Vec<Message>) -> Expression {
    let loc = parts.expr.loc;

    if let ExpressionKind::Number(rn) = parts.right.kind {
        if rn == 0.0 {
            messages.push(Message::error(loc, "Division by zero"));
            return Expression::number(loc, 0.0);
        }

        if rn == 1.0 {
            return *parts.left;
        }

        if let ExpressionKind::Number(ln) = parts.left.kind {
            return Expression::number(loc, ln / rn);
        }
    } else if let ExpressionKind::Number(ln) = parts.left.kind {
        if ln == 0.0 {
            return Expression::number(loc, 0.0);
        }
    }

    parts.reassemble()
}

fn reduce_logical(parts: BinaryParts) -> Expression {
    let and = parts.expr.opcode == Opcode::And;

    if let ExpressionKind::Boolean(lb) = parts.left.kind {
        return match (and, lb) {
            (true, true) | (false, false) => *parts.right,
            (true, false) => Expression::boolean(parts.left.loc, false),
            (false, true) => Expression::boolean(parts.left.loc, true),
        };
    }

    if let ExpressionKind::Boolean(rb) = parts.right.kind {
        return match (and, rb) {
            (true, true) | (false, false) => *parts.left,
            (true, false) => Expression::boolean(parts.right.loc, false),
            (false, true) => Expression::boolean(parts.right.loc, true),
        };
    }

    parts.reassemble()
}

fn reduce_comparison(mut parts: BinaryParts) -> Expression {
    let loc = parts.expr.loc;
    let opcode = parts.expr.opcode;

    // Matching on the literal payload (not the opcode) folds string literals
    // even after they have been lowered to runtime allocations.
    let folded = match (&parts.left.kind, &parts.right.kind) {
        (ExpressionKind::Number(ln), ExpressionKind::Number(rn)) => Some(match opcode {
            Opcode::Less => ln < rn,
            Opcode::LessEqual => ln <= rn,
            Opcode::Greater => ln > rn,
            Opcode::GreaterEqual => ln >= rn,
            Opcode::Equal => ln == rn,
            _ => ln != rn,
        }),
        (
            ExpressionKind::String { value: lv, .. },
            ExpressionKind::String { value: rv, .. },
        ) => Some(match opcode {
            Opcode::Less => lv < rv,
            Opcode::LessEqual => lv <= rv,
            Opcode::Greater => lv > rv,
            Opcode::GreaterEqual => lv >= rv,
            Opcode::Equal => lv == rv,
            _ => lv != rv,
        }),
        (ExpressionKind::Boolean(lb), ExpressionKind::Boolean(rb)) => match opcode {
            Opcode::Equal => Some(lb == rb),
            Opcode::NotEqual => Some(lb != rb),
            _ => None,
        },
        _ => None,
    };

    if let Some(result) = folded {
        return Expression::boolean(loc, result);
    }

    // 0 eq, 1 ne, 2 gt, 3 lt, 4 ge, 5 le; carried to the runtime comparator
    // through `stack_load`.
    let comparison_kind = match opcode {
        Opcode::Equal => 0,
        Opcode::NotEqual => 1,
        Opcode::Greater => 2,
        Opcode::Less => 3,
        Opcode::GreaterEqual => 4,
        _ => 5,
    };

    if parts.left.type_desc == STRING {
        parts.expr.opcode = Opcode::CallLrt;
        parts.expr.id_index = LRT_STRING_COMPARE;
        parts.expr.stack_load = comparison_kind;
    } else if yields_array(&parts.left) {
        parts.expr.opcode = Opcode::CallLrt;
        parts.expr.id_index = LRT_ARRAY_COMPARE;
        parts.expr.stack_load = comparison_kind;
    }

    parts.reassemble()
}

fn reduce_ternary(parts: BinaryParts) -> Expression {
    let ExpressionKind::Boolean(condition) = parts.left.kind else {
        return parts.reassemble();
    };

    let ExpressionKind::Binary {
        left: positive,
        right: negative,
    } = parts.right.kind
    else {
        unreachable!("the right child of a conditional is always an alternative pair");
    };

    if condition {
        *positive
    } else {
        *negative.unwrap()
    }
}
