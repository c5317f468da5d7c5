//! Native code generation. Walks the optimised instruction stream, emits
//! position-independent x86-64 into a build buffer, resolves jump targets
//! from instruction indices to byte offsets, and publishes the result on an
//! executable page together with the `Runtime` the code talks to.

use std::io;

use crate::{
    frontend::ast::{NUMBER, Opcode, Program, STRING},
    middle::{
        fold::{
            LRT_ALLOCATE_ARRAY, LRT_ALLOCATE_STRING, LRT_APPEND_ELEMENT, LRT_ARRAY_COMPARE,
            LRT_ARRAY_ELEMENT, LRT_CAT_STRING, LRT_CLEANUP, LRT_NUMBER_TO_STRING,
            LRT_STRING_COMPARE,
        },
        lir::{Instruction, Value},
    },
    runtime::{self, Array, Runtime, library::RUNTIME_LIBRARY},
};

use self::{memory::ExecutableMemory, x86_64::Assembler};

pub mod memory;
pub mod x86_64;

/// Flattened addresses of the runtime's `extern "C"` entry points.
#[derive(Debug, Clone, Copy)]
struct EntryPoints {
    allocate_array: usize,
    array_element: usize,
    append_element: usize,
    allocate_string: usize,
    cat_string: usize,
    number_to_string: usize,
    string_compare: usize,
    array_compare: usize,
    post_exec_cleanup: usize,
    check_exception: usize,
}

impl EntryPoints {
    fn resolve() -> Self {
        let allocate_array: unsafe extern "C" fn(*mut Runtime, u64, i64, *const u64) -> *mut Array =
            runtime::allocate_array;
        let array_element: unsafe extern "C" fn(*mut Runtime, *const Array, i64) -> u64 =
            runtime::array_element;
        let append_element: unsafe extern "C" fn(*mut Array, u64) -> *mut Array =
            runtime::append_element;
        let allocate_string: unsafe extern "C" fn(*mut Runtime, *const String) -> *mut String =
            runtime::allocate_string;
        let cat_string: unsafe extern "C" fn(*mut Runtime, *const String, *const String) -> *mut String =
            runtime::cat_string;
        let number_to_string: unsafe extern "C" fn(*mut Runtime, f64) -> *mut String =
            runtime::number_to_string;
        let string_compare: unsafe extern "C" fn(*const String, *const String, i64) -> i64 =
            runtime::string_compare;
        let array_compare: unsafe extern "C" fn(*const Array, *const Array) -> i64 =
            runtime::array_compare;
        let post_exec_cleanup: unsafe extern "C" fn(*mut Runtime) -> i64 =
            runtime::post_exec_cleanup;
        let check_exception: unsafe extern "C" fn(*mut Runtime) -> i64 = runtime::check_exception;

        Self {
            allocate_array: allocate_array as usize,
            array_element: array_element as usize,
            append_element: append_element as usize,
            allocate_string: allocate_string as usize,
            cat_string: cat_string as usize,
            number_to_string: number_to_string as usize,
            string_compare: string_compare as usize,
            array_compare: array_compare as usize,
            post_exec_cleanup: post_exec_cleanup as usize,
            check_exception: check_exception as usize,
        }
    }
}

#[derive(Debug)]
struct Codegen {
    assembler: Assembler,
    runtime: Box<Runtime>,
    entries: EntryPoints,
    /// String literals owned by the compiled program; the generated code
    /// embeds their addresses.
    literal_pool: Vec<Box<String>>,
    /// Byte offsets of the rel32 slots that must branch to the unwind exit.
    unwind_fixups: Vec<usize>,
}

/// A runnable compilation result. Owns the executable page, the runtime
/// arena, and the literal pool the code points into; dropping it unmaps the
/// code.
#[derive(Debug)]
pub struct CompiledProgram {
    memory: ExecutableMemory,
    runtime: Box<Runtime>,
    _literal_pool: Vec<Box<String>>,
}

impl CompiledProgram {
    /// Runs the generated code once, synchronously, on this thread.
    pub fn run(&mut self) {
        let entry: unsafe extern "C" fn() = unsafe { std::mem::transmute(self.memory.as_ptr()) };
        unsafe { entry() };
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

/// Translates the program's IR and publishes it as a callable function.
pub fn generate(program: &mut Program) -> io::Result<CompiledProgram> {
    let variable_count = program.symbol_table.len();

    let mut codegen = Codegen {
        assembler: Assembler::new(),
        runtime: Box::new(Runtime::default()),
        entries: EntryPoints::resolve(),
        literal_pool: Vec::new(),
        unwind_fixups: Vec::new(),
    };

    codegen.assembler.prologue(variable_count);

    for instruction in &mut program.instructions {
        codegen.translate(instruction);
    }

    codegen.finish(variable_count);
    codegen.backpatch_jumps(&program.instructions);

    let memory = ExecutableMemory::publish(codegen.assembler.bytes())?;

    Ok(CompiledProgram {
        memory,
        runtime: codegen.runtime,
        _literal_pool: codegen.literal_pool,
    })
}

impl Codegen {
    fn runtime_address(&self) -> u64 {
        &*self.runtime as *const Runtime as u64
    }

    fn translate(&mut self, instruction: &mut Instruction) {
        instruction.code_offset = self.assembler.len() as i32;

        match instruction.opcode {
            Opcode::Assign => self.assembler.store_local(instruction.parameter),
            Opcode::Identifier => self.assembler.push_local(instruction.parameter),
            Opcode::Literal => match instruction.value {
                Value::Number(value) => self.assembler.push_immediate_f64(value),
                Value::Bool(value) => self.assembler.push_immediate_bool(value),
                _ => unreachable!("string literals are lowered to runtime allocations"),
            },
            Opcode::Pop => self.assembler.drop_slots(instruction.parameter),

            Opcode::Add => self.assembler.xmm_arithmetic(0x58),
            Opcode::Subtract => self.assembler.xmm_arithmetic(0x5c),
            Opcode::Multiply => self.assembler.xmm_arithmetic(0x59),
            Opcode::Divide => self.assembler.xmm_arithmetic(0x5e),

            Opcode::And => self.assembler.boolean_arithmetic(0x21),
            Opcode::Or => self.assembler.boolean_arithmetic(0x09),
            Opcode::Not => self.assembler.xor_top_with(1),
            Opcode::Minus => self.assembler.xor_top_with(0x8000_0000_0000_0000),

            Opcode::Equal => self.assembler.compare_and_push(instruction.type_desc, 0x75),
            Opcode::NotEqual => self.assembler.compare_and_push(instruction.type_desc, 0x74),
            Opcode::Less => self.assembler.compare_and_push(instruction.type_desc, 0x7d),
            Opcode::LessEqual => self.assembler.compare_and_push(instruction.type_desc, 0x7f),
            Opcode::Greater => self.assembler.compare_and_push(instruction.type_desc, 0x7e),
            Opcode::GreaterEqual => self.assembler.compare_and_push(instruction.type_desc, 0x7c),

            Opcode::Jump => {
                self.assembler.jump_placeholder();
            }
            Opcode::JumpFalse => {
                self.assembler.jump_false_placeholder();
            }

            Opcode::Call => self.translate_call(instruction),
            Opcode::CallLrt => self.translate_lrt(instruction),

            _ => {}
        }
    }

    /// Marshals the top `arity` stack slots into argument registers per the
    /// signature (doubles through xmm, pointers through the integer
    /// registers), prepending the runtime for string-returning functions.
    fn translate_call(&mut self, instruction: &Instruction) {
        let Value::Str(name) = &instruction.value else {
            unreachable!("calls carry their target name")
        };
        let signature = &RUNTIME_LIBRARY[name.as_str()];

        let mut double_count = signature
            .parameters
            .iter()
            .filter(|p| **p == NUMBER)
            .count();
        let mut integral_count = signature.parameters.len() - double_count;
        if signature.return_type == STRING {
            integral_count += 1;
        }

        // Arguments pop in reverse (the last argument is on top).
        for parameter in signature.parameters.iter().rev() {
            if *parameter == NUMBER {
                double_count -= 1;
                self.assembler.pop_into_argument(double_count, true);
            } else {
                integral_count -= 1;
                self.assembler.pop_into_argument(integral_count, false);
            }
        }

        if signature.return_type == STRING {
            self.assembler
                .load_immediate_argument(0, self.runtime_address());
        }

        self.assembler.call_absolute(signature.entry.address());
        self.assembler.push_result(signature.return_type == NUMBER);
    }

    fn translate_lrt(&mut self, instruction: &Instruction) {
        let runtime = self.runtime_address();

        match instruction.parameter {
            LRT_ALLOCATE_ARRAY => {
                let Value::Number(count) = instruction.value else {
                    unreachable!("array allocations carry their item count")
                };
                let count = count as i64;

                self.assembler.stack_pointer_argument();
                self.assembler.load_immediate_argument(2, count as u64);
                self.assembler
                    .load_immediate_argument(1, instruction.type_desc.to_bits());
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.allocate_array);

                // The items are consumed off the evaluation stack.
                self.assembler.drop_slots(count as i32);
                self.assembler.push_result(false);
            }
            LRT_ARRAY_ELEMENT => {
                self.assembler.pop_into_argument(0, true);
                self.assembler.double_to_integer_argument();
                self.assembler.pop_into_argument(1, false);
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.array_element);
                self.assembler.push_result(false);

                // A failed access unwinds through the cleanup exit.
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.check_exception);
                let fixup = self.assembler.jump_if_nonzero_placeholder();
                self.unwind_fixups.push(fixup);
            }
            LRT_APPEND_ELEMENT => {
                self.assembler.pop_into_argument(1, false);
                self.assembler.pop_into_argument(0, false);
                self.assembler.call_absolute(self.entries.append_element);
                self.assembler.push_result(false);
            }
            LRT_ALLOCATE_STRING => {
                let Value::Str(text) = &instruction.value else {
                    unreachable!("string allocations carry their text")
                };
                let literal = Box::new(text.clone());
                let address = &*literal as *const String as u64;
                self.literal_pool.push(literal);

                self.assembler.load_immediate_argument(1, address);
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.allocate_string);
                self.assembler.push_result(false);
            }
            LRT_CAT_STRING => {
                self.assembler.pop_into_argument(2, false);
                self.assembler.pop_into_argument(1, false);
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.cat_string);
                self.assembler.push_result(false);
            }
            LRT_NUMBER_TO_STRING => {
                self.assembler.pop_into_argument(0, true);
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.number_to_string);
                self.assembler.push_result(false);
            }
            LRT_STRING_COMPARE => {
                let Value::Number(kind) = instruction.value else {
                    unreachable!("string comparisons carry their kind")
                };

                self.assembler.load_immediate_argument(2, kind as i64 as u64);
                self.assembler.pop_into_argument(1, false);
                self.assembler.pop_into_argument(0, false);
                self.assembler.call_absolute(self.entries.string_compare);
                self.assembler.push_result(false);
            }
            LRT_ARRAY_COMPARE => {
                let Value::Number(kind) = instruction.value else {
                    unreachable!("array comparisons carry their kind")
                };

                self.assembler.pop_into_argument(1, false);
                self.assembler.pop_into_argument(0, false);
                self.assembler.call_absolute(self.entries.array_compare);
                // The runtime answers equality; inequality flips it.
                if kind as i64 == 1 {
                    self.assembler.flip_result();
                }
                self.assembler.push_result(false);
            }
            LRT_CLEANUP => {
                self.assembler.load_immediate_argument(0, runtime);
                self.assembler.call_absolute(self.entries.post_exec_cleanup);
            }
            _ => unreachable!("unknown runtime sub-op"),
        }
    }

    /// Emits the two exits (normal and unwind) and points every recorded
    /// exception branch at the unwind one.
    fn finish(&mut self, variable_count: usize) {
        self.assembler.epilogue();

        let unwind_location = self.assembler.len();
        self.assembler
            .load_immediate_argument(0, self.runtime_address());
        self.assembler.call_absolute(self.entries.post_exec_cleanup);
        self.assembler.unwind_epilogue(variable_count);

        for &fixup in &self.unwind_fixups {
            self.assembler
                .patch_i32(fixup, unwind_location as i32 - fixup as i32 - 4);
        }
    }

    /// Rewrites jump placeholders from IR instruction indices to pc-relative
    /// byte displacements.
    fn backpatch_jumps(&mut self, instructions: &[Instruction]) {
        for (index, instruction) in instructions.iter().enumerate() {
            if matches!(instruction.opcode, Opcode::Jump | Opcode::JumpFalse) {
                let target = instructions[instruction.parameter as usize].code_offset;
                let next = instructions[index + 1].code_offset;
                self.assembler.patch_i32(next as usize - 4, target - next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OptimizationFlags, compile,
        frontend::{SourceFile, SourceFileOrigin},
    };

    fn compiled(contents: &str) -> (Program, CompiledProgram) {
        let source = SourceFile {
            contents: contents.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut program = compile(&source, OptimizationFlags::default());
        assert!(!program.any_errors(), "{:?}", program.messages);
        let compiled = generate(&mut program).expect("mapping the code failed");
        (program, compiled)
    }

    #[test]
    fn emits_monotonic_code_offsets() {
        let (program, _compiled) = compiled("a = 1;\nb = a + 2;\nc = a < b;");

        let offsets: Vec<_> = program.instructions.iter().map(|i| i.code_offset).collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]), "{offsets:?}");
    }

    #[test]
    fn jump_displacements_connect_the_branches() {
        let (program, _compiled) = compiled("p = 1 < 2;\nx = p ? 10 : 20;");

        let jump_false = program
            .instructions
            .iter()
            .position(|i| i.opcode == Opcode::JumpFalse)
            .expect("a JumpFalse survives");

        // Its displacement must equal the distance from the instruction after
        // the placeholder to the false branch's code offset.
        let target_index = program.instructions[jump_false].parameter as usize;
        let target_offset = program.instructions[target_index].code_offset;
        let next_offset = program.instructions[jump_false + 1].code_offset;
        assert!(target_offset > next_offset);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn runs_arithmetic_to_completion() {
        let (_program, mut compiled) = compiled("a = 2 + 3;\nb = a * 2;\nc = b / 5 - 1;");
        compiled.run();
        assert!(!compiled.runtime().exception);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn out_of_bounds_access_unwinds_with_the_exception_flag() {
        let (_program, mut compiled) = compiled("x = [1, 2, 3];\ny = x[10];\nz = y + 1;");
        compiled.run();
        assert!(compiled.runtime().exception);
    }
}
