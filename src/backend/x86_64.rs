//! Byte-level x86-64 emission. The `Assembler` owns the writeable build
//! buffer and knows the handful of instruction shapes the IR needs: stack
//! pushes and pops, xmm arithmetic against the top of the evaluation stack,
//! compare-and-set sequences, and the System V call shim that marshals
//! arguments out of evaluation-stack slots.
//!
//! Generated code keeps every value in an 8-byte stack slot. Foreign calls
//! snapshot `rsp` in `r12` (preserved in the prologue) and realign to 16
//! bytes, as the ABI demands.

use crate::frontend::ast::{Type, TypeDescriptor};

/// General purpose registers in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

/// Integer-class argument registers, in System V order.
pub const ARGUMENT_REGISTERS: [Register; 4] =
    [Register::Rdi, Register::Rsi, Register::Rdx, Register::Rcx];

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_f64(&mut self, value: f64) {
        self.emit_u64(value.to_bits());
    }

    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// push rbp; mov rbp, rsp; sub rsp, <locals>; push r12
    pub fn prologue(&mut self, variable_count: usize) {
        self.emit(&[0x55, 0x48, 0x89, 0xe5, 0x48, 0x81, 0xec]);
        self.emit_u32(variable_count as u32 * 8);
        self.emit(&[0x41, 0x54]);
    }

    /// pop r12; mov rsp, rbp; pop rbp; ret
    pub fn epilogue(&mut self) {
        self.emit(&[0x41, 0x5c, 0x48, 0x89, 0xec, 0x5d, 0xc3]);
    }

    /// mov r12, [rbp - <spill>]; mov rsp, rbp; pop rbp; ret — the unwind
    /// exit, which cannot pop r12 because rsp is not at the frame bottom.
    pub fn unwind_epilogue(&mut self, variable_count: usize) {
        self.emit(&[0x4c, 0x8b, 0xa5]);
        self.emit_i32(-((variable_count as i32 + 1) * 8));
        self.emit(&[0x48, 0x89, 0xec, 0x5d, 0xc3]);
    }

    /// mov rax, <value>; push rax
    pub fn push_immediate_f64(&mut self, value: f64) {
        self.emit(&[0x48, 0xb8]);
        self.emit_f64(value);
        self.emit(&[0x50]);
    }

    /// push <value> (8-bit immediate, zero extended)
    pub fn push_immediate_bool(&mut self, value: bool) {
        self.emit(&[0x6a, value as u8]);
    }

    /// push [rbp - 8 * (slot + 1)]
    pub fn push_local(&mut self, slot: i32) {
        self.emit(&[0xff, 0xb5]);
        self.emit_i32((slot + 1) * -8);
    }

    /// mov rax, [rsp]; mov [rbp - 8 * (slot + 1)], rax — stores the top of
    /// stack into a local, leaving the value in place.
    pub fn store_local(&mut self, slot: i32) {
        self.emit(&[0x48, 0x8b, 0x04, 0x24, 0x48, 0x89, 0x85]);
        self.emit_i32((slot + 1) * -8);
    }

    /// add rsp, 8 * count
    pub fn drop_slots(&mut self, count: i32) {
        self.emit(&[0x48, 0x81, 0xc4]);
        self.emit_u32(count as u32 * 8);
    }

    /// movsd xmm0, [rsp+8]; <op>sd xmm0, [rsp]; add rsp, 8;
    /// movsd [rsp], xmm0 — one double binary operation against the stack.
    pub fn xmm_arithmetic(&mut self, operation: u8) {
        self.emit(&[
            0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08, 0xf2, 0x0f, operation, 0x04, 0x24,
        ]);
        self.emit(&[0x48, 0x83, 0xc4, 0x08, 0xf2, 0x0f, 0x11, 0x04, 0x24]);
    }

    /// pop rax; and/or [rsp], rax
    pub fn boolean_arithmetic(&mut self, operation: u8) {
        self.emit(&[0x58, 0x48, operation, 0x04, 0x24]);
    }

    /// Compares the two top stack values and pushes 0 or 1. `jump_code` is
    /// the signed-condition short-jump opcode that *skips* the set-to-1; for
    /// doubles it is rewritten into its unsigned cousin because UCOMISD sets
    /// carry/zero rather than sign/overflow.
    pub fn compare_and_push(&mut self, type_desc: TypeDescriptor, jump_code: u8) {
        let mut jump_code = jump_code;

        match type_desc.base {
            Type::Number => {
                // xor rcx, rcx; add rsp, 16;
                // movsd xmm0, [rsp-8]; ucomisd xmm0, [rsp-16]
                self.emit(&[0x48, 0x31, 0xc9]);
                self.emit(&[
                    0x48, 0x83, 0xc4, 0x10, 0xf2, 0x0f, 0x10, 0x44, 0x24, 0xf8, 0x66, 0x0f,
                    0x2f, 0x44, 0x24, 0xf0,
                ]);

                if jump_code > 0x78 {
                    jump_code = ((jump_code << 1) & 0b100) | 0b10 | (jump_code & 0xf1);
                }
            }
            Type::Boolean => {
                // xor rcx, rcx; pop rdi; pop rax; cmp rax, rdi
                self.emit(&[0x48, 0x31, 0xc9]);
                self.emit(&[0x5f, 0x58, 0x48, 0x39, 0xf8]);
            }
            _ => unreachable!("string and array comparisons are lowered to runtime calls"),
        }

        // j<cc> +3; inc rcx; push rcx
        self.emit(&[jump_code, 0x03, 0x48, 0xff, 0xc1, 0x51]);
    }

    /// pop rax; xor [rsp], rax with the given 64-bit mask in rax — realises
    /// boolean not (mask 1) and float negation (sign bit).
    pub fn xor_top_with(&mut self, mask: u64) {
        if mask <= u32::MAX as u64 {
            self.emit(&[0xb8]);
            self.emit_u32(mask as u32);
        } else {
            self.emit(&[0x48, 0xb8]);
            self.emit_u64(mask);
        }
        self.emit(&[0x48, 0x31, 0x04, 0x24, 0xf2, 0x0f, 0x10, 0x04, 0x24]);
    }

    /// Pops the top stack value into an argument register: xmm<idx> for
    /// doubles, the idx-th integer argument register otherwise.
    pub fn pop_into_argument(&mut self, index: usize, is_double: bool) {
        self.emit(&[0x58]); // pop rax

        if is_double {
            // movq xmm<index>, rax
            self.emit(&[0x66, 0x48, 0x0f, 0x6e, 0xc0 + 8 * index as u8]);
        } else {
            // mov <reg>, rax
            self.emit(&[0x48, 0x89, 0xc0 + ARGUMENT_REGISTERS[index] as u8]);
        }
    }

    /// mov <reg>, <imm64> into the idx-th integer argument register.
    pub fn load_immediate_argument(&mut self, index: usize, value: u64) {
        self.emit(&[0x48, 0xb8 + ARGUMENT_REGISTERS[index] as u8]);
        self.emit_u64(value);
    }

    /// cvtsd2si rdx, xmm0 — converts a popped double index to an integer
    /// argument.
    pub fn double_to_integer_argument(&mut self) {
        self.emit(&[0xf2, 0x48, 0x0f, 0x2d, 0xd0]);
    }

    /// mov rax, <address>; mov r12, rsp; and rsp, -16; call rax;
    /// mov rsp, r12 — an absolute call with 16-byte alignment around it.
    pub fn call_absolute(&mut self, address: usize) {
        self.emit(&[0x48, 0xb8]);
        self.emit_u64(address as u64);
        self.emit(&[
            0x49, 0x89, 0xe4, 0x48, 0x83, 0xe4, 0xf0, 0xff, 0xd0, 0x4c, 0x89, 0xe4,
        ]);
    }

    /// Pushes a call's return value: doubles come back in xmm0 and move
    /// through rax; everything else is already in rax.
    pub fn push_result(&mut self, is_double: bool) {
        if is_double {
            self.emit(&[0x66, 0x48, 0x0f, 0x7e, 0xc0]); // movq rax, xmm0
        }
        self.emit(&[0x50]);
    }

    /// xor rax, 1 — flips a 0/1 comparison result.
    pub fn flip_result(&mut self) {
        self.emit(&[0x48, 0x83, 0xf0, 0x01]);
    }

    /// mov rcx, rsp — hands the current stack pointer to a runtime call.
    pub fn stack_pointer_argument(&mut self) {
        self.emit(&[0x48, 0x89, 0xe1]);
    }

    /// jmp rel32 with a zero placeholder; returns the offset to patch.
    pub fn jump_placeholder(&mut self) -> usize {
        self.emit(&[0xe9]);
        self.emit_u32(0);
        self.len() - 4
    }

    /// pop rax; or rax, rax; jz rel32 with a zero placeholder; returns the
    /// offset to patch.
    pub fn jump_false_placeholder(&mut self) -> usize {
        self.emit(&[0x58, 0x48, 0x09, 0xc0, 0x0f, 0x84]);
        self.emit_u32(0);
        self.len() - 4
    }

    /// or rax, rax; jnz rel32 with a zero placeholder; returns the offset to
    /// patch (used for the exception check after array accesses).
    pub fn jump_if_nonzero_placeholder(&mut self) -> usize {
        self.emit(&[0x48, 0x09, 0xc0, 0x0f, 0x85]);
        self.emit_u32(0);
        self.len() - 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{BOOLEAN, NUMBER};

    #[test]
    fn prologue_reserves_locals_and_saves_r12() {
        let mut assembler = Assembler::new();
        assembler.prologue(3);

        assert_eq!(
            assembler.bytes(),
            [
                0x55, // push rbp
                0x48, 0x89, 0xe5, // mov rbp, rsp
                0x48, 0x81, 0xec, 0x18, 0x00, 0x00, 0x00, // sub rsp, 24
                0x41, 0x54, // push r12
            ]
        );
    }

    #[test]
    fn locals_are_addressed_below_the_frame_pointer() {
        let mut assembler = Assembler::new();
        assembler.push_local(0);
        assembler.push_local(2);

        // push [rbp - 8] and push [rbp - 24]
        assert_eq!(
            assembler.bytes(),
            [
                0xff, 0xb5, 0xf8, 0xff, 0xff, 0xff, //
                0xff, 0xb5, 0xe8, 0xff, 0xff, 0xff,
            ]
        );
    }

    #[test]
    fn double_compares_rewrite_signed_jumps_to_unsigned() {
        // `<` skips the inc with jge for integers, jae after ucomisd.
        let mut signed = Assembler::new();
        signed.compare_and_push(BOOLEAN, 0x7d);
        assert_eq!(signed.bytes()[signed.len() - 6], 0x7d);

        let mut unsigned = Assembler::new();
        unsigned.compare_and_push(NUMBER, 0x7d);
        assert_eq!(unsigned.bytes()[unsigned.len() - 6], 0x73);
    }

    #[test]
    fn argument_marshalling_targets_the_sysv_registers() {
        let mut assembler = Assembler::new();
        assembler.pop_into_argument(0, false);
        assert_eq!(assembler.bytes(), [0x58, 0x48, 0x89, 0xc7]); // mov rdi, rax

        let mut assembler = Assembler::new();
        assembler.pop_into_argument(1, true);
        assert_eq!(assembler.bytes(), [0x58, 0x66, 0x48, 0x0f, 0x6e, 0xc8]); // movq xmm1, rax

        let mut assembler = Assembler::new();
        assembler.load_immediate_argument(0, 0x1122334455667788);
        assert_eq!(
            assembler.bytes(),
            [0x48, 0xbf, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn placeholders_report_their_patch_offsets() {
        let mut assembler = Assembler::new();
        let jump = assembler.jump_placeholder();
        assert_eq!(jump, 1);

        assembler.patch_i32(jump, -5);
        assert_eq!(&assembler.bytes()[1..5], (-5i32).to_le_bytes());

        let false_jump = assembler.jump_false_placeholder();
        assert_eq!(&assembler.bytes()[false_jump - 6..false_jump], [
            0x58, 0x48, 0x09, 0xc0, 0x0f, 0x84
        ]);
    }
}
