//! Statement scheduling. A module's statements may reference symbols defined
//! by later statements; this pass reorders them into a valid execution
//! schedule with Kahn's algorithm over the symbol define/use graph, assigns
//! every defined symbol a dense slot index, and quarantines statements that
//! participate in a dependency cycle.

use std::collections::{BTreeSet, VecDeque};

use hashbrown::{HashMap, HashSet};

use crate::{
    frontend::ast::{Expression, ExpressionKind, Opcode, Program, Statement, StatementKind},
    runtime::library::RUNTIME_LIBRARY,
};

#[derive(Debug, Default)]
struct Relations {
    defines: HashSet<usize>,
    depends: HashSet<usize>,
}

#[derive(Debug, Default)]
struct Collector {
    symbols: HashMap<String, Relations>,
    /// Symbols defined per statement, in source order (drives slot numbering).
    defined_in_order: Vec<Vec<String>>,
    statement_index: usize,
}

impl Collector {
    fn visit_statement(&mut self, index: usize, statement: &Statement) {
        self.statement_index = index;
        self.defined_in_order.push(Vec::new());

        if let StatementKind::Wait { id_list } = &statement.kind {
            for id in id_list {
                self.depend_on(id);
            }
        }

        self.visit_expression(&statement.expression, Opcode::None);
    }

    fn visit_expression(&mut self, expression: &Expression, parent: Opcode) {
        match &expression.kind {
            ExpressionKind::Identifier(name) => {
                // Library names are not user symbols; a call target is not a
                // data dependency either.
                if RUNTIME_LIBRARY.contains_key(name.as_str()) {
                    return;
                }

                if parent == Opcode::Assign {
                    self.define(name);
                } else if parent != Opcode::Call {
                    self.depend_on(name);
                }
            }
            ExpressionKind::Array { items, .. } => {
                if let Some(items) = items {
                    self.visit_expression(items, Opcode::None);
                }
            }
            ExpressionKind::Binary { left, right } => {
                self.visit_expression(left, expression.opcode);
                if let Some(right) = right {
                    self.visit_expression(right, Opcode::None);
                }
            }
            ExpressionKind::Unary { operand } => {
                self.visit_expression(operand, Opcode::None);
            }
            _ => {}
        }
    }

    fn define(&mut self, name: &str) {
        let relations = self.symbols.entry_ref(name).or_default();
        relations.defines.insert(self.statement_index);

        let defined = self.defined_in_order.last_mut().unwrap();
        if !defined.iter().any(|d| d == name) {
            defined.push(name.to_owned());
        }
    }

    fn depend_on(&mut self, name: &str) {
        self.symbols
            .entry_ref(name)
            .or_default()
            .depends
            .insert(self.statement_index);
    }
}

/// Reorders `program.statements` topologically, moving statements stuck in a
/// cycle into `program.circular_statements` (in their original order), and
/// seeds the symbol table with a slot index per defined symbol.
pub fn sort_statements(program: &mut Program) {
    let mut collector = Collector::default();
    for (index, statement) in program.statements.iter().enumerate() {
        collector.visit_statement(index, statement);
    }

    let count = program.statements.len();

    // One edge per (defining statement, using statement) pair; the successor
    // set deduplicates so a statement's in-degree matches the edges that will
    // actually be decremented.
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
    let mut in_degree = vec![0usize; count];

    for relations in collector.symbols.values() {
        for &defining in &relations.defines {
            for &using in &relations.depends {
                if successors[defining].insert(using) {
                    in_degree[using] += 1;
                }
            }
        }
    }

    // Kahn's algorithm; the FIFO queue breaks ties by original statement
    // index. Slots are handed out as defining statements are scheduled.
    let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);
    let mut next_slot = 0i32;

    while let Some(index) = queue.pop_front() {
        order.push(index);

        for name in &collector.defined_in_order[index] {
            let symbol = program.symbol_table.entry_ref(name.as_str()).or_default();
            if symbol.slot < 0 {
                symbol.slot = next_slot;
                next_slot += 1;
            }
        }

        for &successor in &successors[index] {
            in_degree[successor] -= 1;
            if in_degree[successor] == 0 {
                queue.push_back(successor);
            }
        }
    }

    let mut slots: Vec<Option<Statement>> = program.statements.drain(..).map(Some).collect();
    program.statements = order
        .into_iter()
        .map(|index| slots[index].take().unwrap())
        .collect();
    program.circular_statements = slots.into_iter().flatten().collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{Parser, SourceFile, SourceFileOrigin};

    fn sorted_program(contents: &str) -> Program {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut program = Program::new(Parser::parse_module(&source).expect("parse failed"));
        sort_statements(&mut program);
        program
    }

    fn statement_lines(statements: &[Statement]) -> Vec<u32> {
        statements.iter().map(|s| s.line_number).collect()
    }

    #[test]
    fn reorders_by_definition() {
        let program = sorted_program("a = b + 1;\nb = 2;");

        assert_eq!(statement_lines(&program.statements), [2, 1]);
        assert!(program.circular_statements.is_empty());
        assert_eq!(program.symbol_table["b"].slot, 0);
        assert_eq!(program.symbol_table["a"].slot, 1);
    }

    #[test]
    fn independent_statements_keep_source_order() {
        let program = sorted_program("a = 1;\nb = 2;\nc = a + b;");
        assert_eq!(statement_lines(&program.statements), [1, 2, 3]);
    }

    #[test]
    fn cycles_are_quarantined_in_source_order() {
        let program = sorted_program("a = b + 1;\nb = a + 1;\nc = 3;");

        assert_eq!(statement_lines(&program.statements), [3]);
        assert_eq!(statement_lines(&program.circular_statements), [1, 2]);
        assert_eq!(program.symbol_table["c"].slot, 0);
        assert!(!program.symbol_table.contains_key("a"));
    }

    #[test]
    fn self_reference_is_circular() {
        let program = sorted_program("x = x + 1;");
        assert!(program.statements.is_empty());
        assert_eq!(program.circular_statements.len(), 1);
    }

    #[test]
    fn wait_list_creates_dependencies() {
        let program = sorted_program("wait (b) 1 + 1;\nb = 2;");
        assert_eq!(statement_lines(&program.statements), [2, 1]);
    }

    #[test]
    fn call_targets_are_not_dependencies() {
        // `print` is a library name and `print(x)` only depends on `x`.
        let program = sorted_program("print(\"\" + x);\nx = 1;");
        assert_eq!(statement_lines(&program.statements), [2, 1]);
    }

    #[test]
    fn shared_edges_do_not_inflate_in_degrees() {
        // Both `a` and `b` flow from line 2 into line 1; the duplicate edge
        // must not leave line 1 with a phantom in-degree.
        let program = sorted_program("c = a + b;\na = (b = 2), 1;");
        assert_eq!(statement_lines(&program.statements), [2, 1]);
        assert!(program.circular_statements.is_empty());
    }
}
