
use super::*;
use crate::memory::Space;
use crate::options::{OptionBuilder, Options};
use crate::registers::{Flag, Register, Width};
use crate::vm::Vm;

fn vm_with(options: &Options) -> Vm {
    Vm::with_io(
        &[],
        options,
        Box::new(std::io::empty()),
        Box::new(std::io::sink()),
    )
}

fn vm() -> Vm {
    vm_with(&OptionBuilder::new().build().unwrap())
}

fn vm_8bit() -> Vm {
    vm_with(&OptionBuilder::new().char_bit(8).build().unwrap())
}

fn instr(op: Opcode, args: &[u128]) -> Instruction {
    let mut padded = [0u128; 2];
    padded[..args.len()].copy_from_slice(args);
    Instruction { op, args: padded }
}

fn run(vm: &mut Vm, op: Opcode, args: &[u128]) {
    instr(op, args).execute(vm).unwrap();
}

#[test]
fn mov_between_registers_copies_a_word() {
    let mut vm = vm();
    vm.registers.set(Register::B, 0xCAFE);
    run(&mut vm, Opcode::MovwR2r, &[Register::A.id().into(), Register::B.id().into()]);
    assert_eq!(vm.registers.get(Register::A), 0xCAFE);
    // Moves leave the flags alone.
    assert_eq!(vm.registers.get(Register::F), 0);
}

#[test]
fn byte_moves_preserve_the_high_bits() {
    let mut vm = vm();
    vm.registers.set(Register::A, 0x1FF_FF);
    run(&mut vm, Opcode::MovbI2r, &[Register::A.id().into(), 0x0A]);
    assert_eq!(vm.registers.get(Register::A), 0x1FF_FF & !0x1FF | 0x0A);
}

#[test]
fn memory_moves_round_trip_through_ram() {
    let mut vm = vm();
    vm.registers.set(Register::A, 0x1234);
    run(&mut vm, Opcode::MovwR2m, &[8, Register::A.id().into()]);
    run(&mut vm, Opcode::MovwM2r, &[Register::B.id().into(), 8]);
    assert_eq!(vm.registers.get(Register::B), 0x1234);
}

#[test]
fn indirect_loads_and_stores_use_register_addresses() {
    let mut vm = vm();
    vm.registers.set(Register::A, 99);
    vm.registers.set(Register::B, 16);
    run(&mut vm, Opcode::Stw, &[Register::B.id().into(), Register::A.id().into()]);
    run(&mut vm, Opcode::Ldw, &[Register::C.id().into(), Register::B.id().into()]);
    assert_eq!(vm.registers.get(Register::C), 99);
}

#[test]
fn address_width_loads_move_addr_cells() {
    let mut vm = vm();
    let addr_cells = vm.options.addr_size as usize;
    vm.memory
        .store_value(Space::Ram, 4, addr_cells, 0x0777)
        .unwrap();
    vm.registers.set(Register::B, 4);
    run(&mut vm, Opcode::Lda, &[Register::A.id().into(), Register::B.id().into()]);
    assert_eq!(vm.registers.get_width(Register::A, Width::Addr), 0x0777);
}

#[test]
fn add_sets_zero_and_carry_on_wraparound() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 0xFF);
    run(&mut vm, Opcode::AddB, &[Register::A.id().into(), 1]);

    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0);
    assert!(vm.registers.flag(Flag::Zero));
    assert!(vm.registers.flag(Flag::Carry));
    assert!(!vm.registers.flag(Flag::Overflow));
    assert!(!vm.registers.flag(Flag::Sign));
}

#[test]
fn add_sets_signed_overflow() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 0x7F);
    run(&mut vm, Opcode::AddB, &[Register::A.id().into(), 1]);

    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0x80);
    assert!(vm.registers.flag(Flag::Overflow));
    assert!(vm.registers.flag(Flag::Sign));
    assert!(!vm.registers.flag(Flag::Carry));
}

#[test]
fn sub_borrow_sets_carry_and_sign() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 1);
    run(&mut vm, Opcode::SubB, &[Register::A.id().into(), 2]);

    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0xFF);
    assert!(vm.registers.flag(Flag::Carry));
    assert!(vm.registers.flag(Flag::Sign));
    assert!(!vm.registers.flag(Flag::Zero));
}

#[test]
fn cmp_sets_flags_without_writing_back() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 5);
    run(&mut vm, Opcode::CmpB, &[Register::A.id().into(), 5]);

    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 5);
    assert!(vm.registers.flag(Flag::Zero));
    assert!(!vm.registers.flag(Flag::Carry));
}

#[test]
fn division_truncates_toward_zero() {
    let mut vm = vm();
    let word_bits = vm.options.word_bits();

    vm.registers.set(Register::A, (-7i128) as u128);
    run(&mut vm, Opcode::DivW, &[Register::A.id().into(), 2]);
    let quotient = crate::endian::sign_extend(vm.registers.get(Register::A), word_bits);
    assert_eq!(quotient, -3);
}

#[test]
fn modulo_takes_the_sign_of_the_dividend() {
    let mut vm = vm();
    let word_bits = vm.options.word_bits();

    vm.registers.set(Register::A, (-7i128) as u128);
    run(&mut vm, Opcode::ModW, &[Register::A.id().into(), 2]);
    let remainder = crate::endian::sign_extend(vm.registers.get(Register::A), word_bits);
    assert_eq!(remainder, -1);

    vm.registers.set(Register::A, 7);
    run(&mut vm, Opcode::ModW, &[Register::A.id().into(), 2]);
    assert_eq!(vm.registers.get(Register::A), 1);
}

#[test]
fn division_by_zero_register_faults() {
    let mut vm = vm();
    vm.registers.set(Register::A, 10);
    vm.registers.set(Register::B, 0);
    let err = instr(
        Opcode::DivR,
        &[Register::A.id().into(), Register::B.id().into()],
    )
    .execute(&mut vm)
    .unwrap_err();
    assert_eq!(err, FaultKind::DivByZero);
}

#[test]
fn bitwise_operations_clear_carry_and_overflow() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 0b1100);
    run(&mut vm, Opcode::AndB, &[Register::A.id().into(), 0b1010]);
    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0b1000);
    assert!(!vm.registers.flag(Flag::Carry));
    assert!(!vm.registers.flag(Flag::Overflow));

    run(&mut vm, Opcode::XorB, &[Register::A.id().into(), 0b1000]);
    assert!(vm.registers.flag(Flag::Zero));
}

#[test]
fn shifts_report_the_last_bit_out() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 0b1000_0001);

    run(&mut vm, Opcode::ShlB, &[Register::A.id().into(), 1]);
    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0b0000_0010);
    assert!(vm.registers.flag(Flag::Carry));

    run(&mut vm, Opcode::ShrB, &[Register::A.id().into(), 2]);
    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0);
    assert!(vm.registers.flag(Flag::Carry));
    assert!(vm.registers.flag(Flag::Zero));
}

#[test]
fn not_and_neg_work_at_byte_width() {
    let mut vm = vm_8bit();
    vm.registers.set(Register::A, 0x0F);
    run(&mut vm, Opcode::NotB, &[Register::A.id().into()]);
    assert_eq!(vm.registers.get_width(Register::A, Width::Byte), 0xF0);

    vm.registers.set(Register::B, 1);
    run(&mut vm, Opcode::NegB, &[Register::B.id().into()]);
    assert_eq!(vm.registers.get_width(Register::B, Width::Byte), 0xFF);
    assert!(vm.registers.flag(Flag::Carry));
    assert!(vm.registers.flag(Flag::Sign));
}

#[test]
fn conditional_jumps_follow_the_flags() {
    let mut vm = vm();

    // Z set: je taken, jne not.
    vm.registers.set_flag(Flag::Zero, true);
    run(&mut vm, Opcode::Je, &[64]);
    assert_eq!(vm.registers.get(Register::Ip), 64);
    run(&mut vm, Opcode::Jne, &[128]);
    assert_eq!(vm.registers.get(Register::Ip), 64);

    // C set: jb taken, jae not.
    vm.registers.set_flag(Flag::Zero, false);
    vm.registers.set_flag(Flag::Carry, true);
    run(&mut vm, Opcode::Jb, &[32]);
    assert_eq!(vm.registers.get(Register::Ip), 32);
    run(&mut vm, Opcode::Jae, &[99]);
    assert_eq!(vm.registers.get(Register::Ip), 32);
}

#[test]
fn signed_jumps_use_sign_and_overflow() {
    let mut vm = vm();

    // S != O means less.
    vm.registers.set_flag(Flag::Sign, true);
    run(&mut vm, Opcode::Jl, &[10]);
    assert_eq!(vm.registers.get(Register::Ip), 10);

    // S == O means greater-or-equal.
    vm.registers.set_flag(Flag::Overflow, true);
    run(&mut vm, Opcode::Jge, &[20]);
    assert_eq!(vm.registers.get(Register::Ip), 20);
    run(&mut vm, Opcode::Jl, &[30]);
    assert_eq!(vm.registers.get(Register::Ip), 20);
}

#[test]
fn loop_decrements_c_and_branches_while_nonzero() {
    let mut vm = vm();
    vm.registers.set(Register::C, 2);

    run(&mut vm, Opcode::Loop, &[40]);
    assert_eq!(vm.registers.get(Register::C), 1);
    assert_eq!(vm.registers.get(Register::Ip), 40);

    vm.registers.set(Register::Ip, 0);
    run(&mut vm, Opcode::Loop, &[40]);
    assert_eq!(vm.registers.get(Register::C), 0);
    assert_eq!(vm.registers.get(Register::Ip), 0);

    // Flags stay untouched through the whole dance.
    assert_eq!(vm.registers.get(Register::F), 0);
}

#[test]
fn push_and_pop_leave_flags_unchanged() {
    let mut vm = vm();
    vm.registers.set_flag(Flag::Carry, true);
    vm.registers.set(Register::A, 7);

    run(&mut vm, Opcode::Push, &[Register::A.id().into()]);
    run(&mut vm, Opcode::Pop, &[Register::B.id().into()]);

    assert_eq!(vm.registers.get(Register::B), 7);
    assert_eq!(vm.registers.get(Register::Sp), 0);
    assert!(vm.registers.flag(Flag::Carry));
}

#[test]
fn seek_writes_a_cursor_move_to_the_output() {
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Sink(Rc<RefCell<Vec<u8>>>);
    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let options = OptionBuilder::new().build().unwrap();
    let sink = Sink::default();
    let mut vm = Vm::with_io(
        &[],
        &options,
        Box::new(std::io::empty()),
        Box::new(sink.clone()),
    );

    vm.registers.set(Register::A, 5);
    vm.registers.set(Register::B, 2);
    run(&mut vm, Opcode::Seek, &[]);

    let written = sink.0.borrow().clone();
    let text = String::from_utf8_lossy(&written);
    assert!(text.starts_with('\u{1b}'), "expected an escape sequence, got {:?}", text);
}

#[test]
fn halt_raises_the_halted_flag() {
    let mut vm = vm();
    assert!(!vm.halted);
    run(&mut vm, Opcode::Halt, &[]);
    assert!(vm.halted);
}

#[test]
fn invalid_register_ids_fault() {
    let mut vm = vm();
    let err = instr(Opcode::Push, &[200]).execute(&mut vm).unwrap_err();
    assert_eq!(err, FaultKind::InvalidRegister(200));
}
