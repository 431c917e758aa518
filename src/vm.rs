//! The CPU: decoder, fetch-decode-execute loop and the I/O channel.

use crate::endian;
use crate::instruction::{Fault, FaultKind, Instruction, Opcode, Result};
use crate::memory::{MemoryMap, Space};
use crate::options::Options;
use crate::registers::{Register, RegisterFile};
use log::{debug, trace};
use std::io::{Read, Write};

/// Decodes the instruction at `ip` out of program space.
///
/// Returns the executable descriptor and the address of the next
/// instruction. Operands are decoded with the endianness selected by the
/// opcode's parity.
pub fn decode(
    memory: &MemoryMap,
    ip: u128,
    options: &Options,
) -> std::result::Result<(Instruction, u128), FaultKind> {
    let opcode_cell = memory.load_cell(Space::Program, ip)?;
    let op = Opcode::from_cell(opcode_cell)?;
    let endianness = op.endianness();

    let mut args = [0u128; 2];
    let mut offset = ip
        .checked_add(1)
        .ok_or(FaultKind::OutOfBounds {
            space: Space::Program,
            addr: ip,
        })?;

    for (slot, kind) in args.iter_mut().zip(op.args()) {
        let cells = kind.cells(options);
        let raw = memory.load_cells(Space::Program, offset, cells)?;
        *slot = endian::value_from_cells(endianness, &raw, options.char_bit);
        offset += cells as u128;
    }

    Ok((Instruction { op, args }, offset))
}

/// The Evil VM.
///
/// Owns the register file, the memory map and the byte-granular I/O
/// channel. The caller supplies the channel ends; they default to stdin
/// and stdout.
#[allow(missing_debug_implementations)]
pub struct Vm {
    /// The active registers.
    pub registers: RegisterFile,
    /// The resolved address spaces.
    pub memory: MemoryMap,
    /// The machine configuration.
    pub options: Options,
    /// Whether the CPU has executed `halt`.
    pub halted: bool,
    /// The input channel read by `in`.
    pub input: Box<dyn Read>,
    /// The output channel written by `out` and `seek`, recommended to be
    /// `std::io::stdout()`.
    pub output: Box<dyn Write>,
    executed: u64,
}

impl Vm {
    /// Creates a VM over an assembled program image, talking to stdin and
    /// stdout.
    #[must_use]
    pub fn new(program: &[u64], options: &Options) -> Self {
        Self::with_io(
            program,
            options,
            Box::new(std::io::stdin()),
            Box::new(std::io::stdout()),
        )
    }

    /// Creates a VM with caller-supplied channel ends.
    #[must_use]
    pub fn with_io(
        program: &[u64],
        options: &Options,
        input: Box<dyn Read>,
        output: Box<dyn Write>,
    ) -> Self {
        Self {
            registers: RegisterFile::new(options),
            memory: MemoryMap::build(program, options),
            options: options.clone(),
            halted: false,
            input,
            output,
            executed: 0,
        }
    }

    /// Runs the fetch-decode-execute loop until `halt` or a fault.
    ///
    /// The output channel is flushed before returning, fault or not.
    pub fn execute(&mut self) -> Result<()> {
        let result = self.run_loop();
        if let Err(err) = self.output.flush() {
            debug!("output flush failed: {}", err);
        }

        if let Err(fault) = &result {
            debug!("registers at fault:\n{}", self.registers);
        }
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        while !self.halted {
            self.step()?;

            self.executed += 1;
            if let Some(limit) = self.options.halt_after {
                if self.executed >= limit {
                    debug!("instruction limit of {} reached", limit);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Executes a single instruction.
    pub fn step(&mut self) -> Result<()> {
        let ip = self.registers.get(Register::Ip);
        let fault = |kind| Fault { kind, ip };

        let (instruction, next_ip) = decode(&self.memory, ip, &self.options).map_err(fault)?;
        trace!("{:08x}: {}", ip, instruction);

        self.registers.set(Register::Ip, next_ip);
        instruction.execute(self).map_err(fault)
    }

    /// Number of instructions executed so far.
    #[inline]
    #[must_use]
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::Endianness;
    use crate::options::OptionBuilder;
    use crate::registers::Flag;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A Write handle the test can keep a view into.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.borrow().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn vm_with_program(program: &[u64], options: &Options) -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        let vm = Vm::with_io(
            program,
            options,
            Box::new(std::io::empty()),
            Box::new(buf.clone()),
        );
        (vm, buf)
    }

    /// Hand-encodes one instruction into cells.
    fn encode(op: Opcode, args: &[u128], options: &Options) -> Vec<u64> {
        let mut cells = vec![op as u64];
        for (kind, &arg) in op.args().iter().zip(args) {
            cells.extend(endian::cells_from_value(
                op.endianness(),
                arg,
                options.char_bit,
                kind.cells(options),
            ));
        }
        cells
    }

    fn encode_program(instructions: &[(Opcode, &[u128])], options: &Options) -> Vec<u64> {
        let mut image = Vec::new();
        for (op, args) in instructions {
            image.extend(encode(*op, args, options));
        }
        image
    }

    #[test]
    fn decode_round_trips_every_opcode() {
        let options = OptionBuilder::new().build().unwrap();
        for &op in Opcode::ALL {
            let args: Vec<u128> = op
                .args()
                .iter()
                .enumerate()
                .map(|(idx, kind)| match kind {
                    crate::instruction::ArgKind::Reg => (idx as u128) % 6,
                    _ => 0x42 + idx as u128,
                })
                .collect();

            let image = encode(op, &args, &options);
            let map = MemoryMap::build(&image, &options);
            let (decoded, next_ip) = decode(&map, 0, &options).unwrap();

            assert_eq!(decoded.op, op);
            assert_eq!(next_ip, op.encoded_size(&options) as u128);
            for (idx, &arg) in args.iter().enumerate() {
                assert_eq!(decoded.args[idx], arg, "operand {} of {:?}", idx, op);
            }
        }
    }

    #[test]
    fn operand_endianness_follows_opcode_parity() {
        let options = OptionBuilder::new().char_bit(8).build().unwrap();

        // movw.i2r has an even opcode, so operands encode little-endian.
        assert_eq!(Opcode::MovwI2r.endianness(), Endianness::Little);
        let image = encode(Opcode::MovwI2r, &[0, 0x0102], &options);
        assert_eq!(&image[2..4], &[0x02, 0x01]);

        // movb.m2r has an odd opcode, so its address encodes big-endian.
        assert_eq!(Opcode::MovbM2r.endianness(), Endianness::Big);
        let image = encode(Opcode::MovbM2r, &[0, 0x0102], &options);
        let addr_cells = image[2..].to_vec();
        assert_eq!(addr_cells[addr_cells.len() - 1], 0x02);
        assert_eq!(addr_cells[addr_cells.len() - 2], 0x01);

        // Both decode back to the same operand values.
        for &(op, arg) in &[(Opcode::MovwI2r, 0x0102u128), (Opcode::MovbM2r, 0x0102)] {
            let image = encode(op, &[0, arg], &options);
            let map = MemoryMap::build(&image, &options);
            let (decoded, _) = decode(&map, 0, &options).unwrap();
            assert_eq!(decoded.args[1], arg);
        }
    }

    #[test]
    fn fetch_past_the_program_end_faults() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(&[(Opcode::MovwI2r, &[0, 1])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);

        // First step decodes fine, the next fetch is out of bounds.
        vm.step().unwrap();
        let fault = vm.step().unwrap_err();
        assert_eq!(fault.ip, image.len() as u128);
        assert!(matches!(fault.kind, FaultKind::OutOfBounds { space: Space::Program, .. }));
    }

    #[test]
    fn unknown_opcode_faults_with_ip() {
        let options = OptionBuilder::new().build().unwrap();
        let (mut vm, _) = vm_with_program(&[0x1F0], &options);
        let fault = vm.execute().unwrap_err();
        assert_eq!(fault.kind, FaultKind::UnknownOpcode(0x1F0));
        assert_eq!(fault.ip, 0);
    }

    #[test]
    fn halt_stops_the_loop_cleanly() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(
            &[(Opcode::MovwI2r, &[0, 7]), (Opcode::Halt, &[])],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        assert!(vm.halted);
        assert_eq!(vm.registers.get(Register::A), 7);
        assert_eq!(vm.instructions_executed(), 2);
    }

    #[test]
    fn halt_after_limit_stops_an_endless_program() {
        let options = OptionBuilder::new().halt_after(Some(10)).build().unwrap();
        // jmp 0 forever
        let image = encode_program(&[(Opcode::Jmp, &[0])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        assert_eq!(vm.instructions_executed(), 10);
    }

    #[test]
    fn division_by_zero_faults() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(&[(Opcode::DivB, &[0, 0])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);
        let fault = vm.execute().unwrap_err();
        assert_eq!(fault.kind, FaultKind::DivByZero);
        assert_eq!(fault.ip, 0);
    }

    #[test]
    fn wraparound_add_sets_zero_and_carry() {
        // movb.i2r a, 0xFF; add.b a, 1 with 8-bit cells leaves a zero low
        // byte, Z and C set, O clear.
        let options = OptionBuilder::new().char_bit(8).build().unwrap();
        let image = encode_program(
            &[
                (Opcode::MovbI2r, &[Register::A.id() as u128, 0xFF]),
                (Opcode::AddB, &[Register::A.id() as u128, 1]),
                (Opcode::Halt, &[]),
            ],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();

        assert_eq!(vm.registers.get_width(Register::A, crate::registers::Width::Byte), 0);
        assert!(vm.registers.flag(Flag::Zero));
        assert!(vm.registers.flag(Flag::Carry));
        assert!(!vm.registers.flag(Flag::Overflow));
    }

    #[test]
    fn call_and_ret_balance_the_stack() {
        let options = OptionBuilder::new().build().unwrap();
        // call f; halt; f: ret
        let call_size = Opcode::Call.encoded_size(&options) as u128;
        let halt_size = Opcode::Halt.encoded_size(&options) as u128;
        let f = call_size + halt_size;
        let image = encode_program(
            &[(Opcode::Call, &[f]), (Opcode::Halt, &[]), (Opcode::Ret, &[])],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();

        assert!(vm.halted);
        assert_eq!(vm.registers.get(Register::Sp), 0);
    }

    #[test]
    fn deep_recursion_overflows_the_stack() {
        let options = OptionBuilder::new().stack_size(50).build().unwrap();
        // f: call f
        let image = encode_program(&[(Opcode::Call, &[0])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);
        let fault = vm.execute().unwrap_err();
        assert_eq!(fault.kind, FaultKind::StackOverflow);
    }

    #[test]
    fn ret_with_empty_stack_underflows() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(&[(Opcode::Ret, &[])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);
        let fault = vm.execute().unwrap_err();
        assert_eq!(fault.kind, FaultKind::StackUnderflow);
    }

    #[test]
    fn push_pop_round_trips_a_word() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(
            &[
                (Opcode::MovwI2r, &[Register::A.id() as u128, 0xBEEF]),
                (Opcode::Push, &[Register::A.id() as u128]),
                (Opcode::Pop, &[Register::B.id() as u128]),
                (Opcode::Halt, &[]),
            ],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();

        assert_eq!(vm.registers.get(Register::B), 0xBEEF);
        assert_eq!(vm.registers.get(Register::Sp), 0);
    }

    #[test]
    fn relative_and_absolute_jumps_agree() {
        let options = OptionBuilder::new().build().unwrap();
        let jmp_size = Opcode::Jmp.encoded_size(&options) as u128;
        // Target is right past both jumps and a pad instruction.
        let pad_size = Opcode::MovwI2r.encoded_size(&options) as u128;

        // Absolute: jmp over the pad to the halt.
        let target = jmp_size + pad_size;
        let image = encode_program(
            &[
                (Opcode::Jmp, &[target]),
                (Opcode::MovwI2r, &[Register::A.id() as u128, 1]),
                (Opcode::Halt, &[]),
            ],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        let absolute_ip = vm.registers.get(Register::Ip);
        assert_eq!(vm.registers.get(Register::A), 0);

        // Relative: same control flow, displacement over the pad.
        let image = encode_program(
            &[
                (Opcode::JmpRel, &[pad_size]),
                (Opcode::MovwI2r, &[Register::A.id() as u128, 1]),
                (Opcode::Halt, &[]),
            ],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        assert_eq!(vm.registers.get(Register::Ip), absolute_ip);
        assert_eq!(vm.registers.get(Register::A), 0);
    }

    #[test]
    fn backward_relative_jump_uses_sign_extension() {
        let options = OptionBuilder::new().build().unwrap();
        let loop_size = Opcode::LoopRel.encoded_size(&options) as u128;
        let mov_size = Opcode::MovwI2r.encoded_size(&options) as u128;

        // c = 3; spin: loop.rel spin; halt
        let displacement = (loop_size as i128).wrapping_neg() as u128;
        let image = encode_program(
            &[
                (Opcode::MovwI2r, &[Register::C.id() as u128, 3]),
                (Opcode::LoopRel, &[displacement & options.addr_mask()]),
                (Opcode::Halt, &[]),
            ],
            &options,
        );
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        assert_eq!(vm.registers.get(Register::C), 0);
        assert_eq!(
            vm.registers.get(Register::Ip),
            mov_size + loop_size + Opcode::Halt.encoded_size(&options) as u128
        );
    }

    #[test]
    fn input_reports_eof_with_carry_and_all_ones() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(&[(Opcode::In, &[]), (Opcode::Halt, &[])], &options);
        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();

        assert!(vm.registers.flag(Flag::Carry));
        assert_eq!(vm.registers.get(Register::A), options.word_mask());
    }

    #[test]
    fn input_reads_bytes_and_clears_carry() {
        let options = OptionBuilder::new().build().unwrap();
        let image = encode_program(
            &[(Opcode::In, &[]), (Opcode::Out, &[]), (Opcode::Halt, &[])],
            &options,
        );
        let buf = SharedBuf::default();
        let mut vm = Vm::with_io(
            &image,
            &options,
            Box::new(std::io::Cursor::new(vec![b'x'])),
            Box::new(buf.clone()),
        );
        vm.execute().unwrap();

        assert!(!vm.registers.flag(Flag::Carry));
        assert_eq!(buf.contents(), b"x");
    }

    #[test]
    fn memory_aliasing_lets_ram_writes_reach_program_reads() {
        // A program writes a byte through the ram name, then reads it back
        // from the shared bank through program space with lpb.
        let options = OptionBuilder::new()
            .map_memory("ram=program".parse().unwrap())
            .build()
            .unwrap();

        let mut instructions: Vec<(Opcode, Vec<u128>)> = vec![
            (Opcode::MovwI2r, vec![Register::A.id() as u128, 42]),
            (Opcode::MovwI2r, vec![Register::B.id() as u128, 0]),
            (Opcode::Stb, vec![Register::B.id() as u128, Register::A.id() as u128]),
            (Opcode::MovwI2r, vec![Register::C.id() as u128, 0]),
            (Opcode::Lpb, vec![Register::B.id() as u128, Register::C.id() as u128]),
            (Opcode::Halt, vec![]),
        ];

        // The write target is a scratch cell right past the program.
        let image_len: usize = instructions
            .iter()
            .map(|(op, _)| op.encoded_size(&options))
            .sum();
        let scratch = image_len as u128;
        instructions[1].1[1] = scratch;
        instructions[3].1[1] = scratch;

        let mut image = Vec::new();
        for (op, args) in &instructions {
            image.extend(encode(*op, args, &options));
        }
        // One scratch cell for the store.
        image.push(0);

        let (mut vm, _) = vm_with_program(&image, &options);
        vm.execute().unwrap();
        assert_eq!(vm.registers.get_width(Register::B, crate::registers::Width::Byte), 42);
    }
}
