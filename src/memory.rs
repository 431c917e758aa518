//! Address spaces and the memory map.
//!
//! The machine sees three logical address spaces. Each resolves to exactly
//! one backing bank of cells; a user-supplied list of alias directives can
//! collapse any subset of the names onto a shared bank. The `program` name
//! is read only, and that property travels with the name rather than the
//! bank, so a store through an aliased `ram` into the same bank succeeds.

use crate::dump::make_cells_dump;
use crate::endian::{self, Endianness};
use crate::instruction::FaultKind;
use crate::options::Options;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A logical address space name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Ram,
    Program,
    Stack,
}

impl Space {
    pub const ALL: [Space; 3] = [Space::Ram, Space::Program, Space::Stack];

    #[inline]
    fn index(self) -> usize {
        match self {
            Space::Ram => 0,
            Space::Program => 1,
            Space::Stack => 2,
        }
    }
}

impl Display for Space {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Space::Ram => write!(f, "ram"),
            Space::Program => write!(f, "program"),
            Space::Stack => write!(f, "stack"),
        }
    }
}

impl FromStr for Space {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ram" => Ok(Space::Ram),
            "program" => Ok(Space::Program),
            "stack" => Ok(Space::Stack),
            _ => Err(()),
        }
    }
}

/// One backing bank of cells.
///
/// Cells are stored as host integers wide enough for any `char_bit` up to
/// 64; every store masks the value down to the configured width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    cells: Vec<u64>,
    char_bit: u32,
}

impl Memory {
    #[must_use]
    pub fn new(size: usize, char_bit: u32) -> Self {
        Self {
            cells: vec![0; size],
            char_bit,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn char_bit(&self) -> u32 {
        self.char_bit
    }

    #[inline]
    fn get(&self, addr: u128) -> Option<u64> {
        if addr >= self.cells.len() as u128 {
            return None;
        }
        Some(self.cells[addr as usize])
    }

    #[inline]
    fn set(&mut self, addr: u128, value: u64) -> Option<()> {
        if addr >= self.cells.len() as u128 {
            return None;
        }
        self.cells[addr as usize] = value & endian::mask(self.char_bit) as u64;
        Some(())
    }

    #[inline]
    #[must_use]
    pub fn cells(&self) -> &[u64] {
        &self.cells
    }
}

impl Display for Memory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", make_cells_dump(&self.cells, self.char_bit, 8))
    }
}

/// The resolved memory map: three logical names over one to three banks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    banks: Vec<Memory>,
    index: [usize; 3],
}

impl MemoryMap {
    /// Builds the map from the configured alias directives and loads the
    /// program image at offset zero of the program bank.
    #[must_use]
    pub fn build(program_image: &[u64], options: &Options) -> Self {
        let program_space = match options.program_size {
            Some(size) => size.max(program_image.len()),
            None => program_image.len(),
        };
        let requested = [options.ram_size, program_space, options.stack_size];

        // Tiny union-find over the three names; directives are transitive.
        let mut parent = [0usize, 1, 2];
        fn root(parent: &[usize; 3], mut i: usize) -> usize {
            while parent[i] != i {
                i = parent[i];
            }
            i
        }
        for mapping in &options.memory_map {
            let dst = root(&parent, mapping.dst.index());
            let src = root(&parent, mapping.src.index());
            parent[dst] = src;
        }

        let mut banks = Vec::new();
        let mut bank_of_root = [usize::max_value(); 3];
        let mut index = [0usize; 3];

        for space in &Space::ALL {
            let r = root(&parent, space.index());
            if bank_of_root[r] == usize::max_value() {
                bank_of_root[r] = banks.len();
                banks.push(Memory::new(0, options.char_bit));
            }
            index[space.index()] = bank_of_root[r];
        }

        for space in &Space::ALL {
            let bank = &mut banks[index[space.index()]];
            let size = requested[space.index()];
            if bank.len() < size {
                bank.cells.resize(size, 0);
            }
        }

        let mut map = Self { banks, index };

        let cell_mask = options.cell_mask() as u64;
        let program = &mut map.banks[map.index[Space::Program.index()]];
        for (cell, &value) in program.cells.iter_mut().zip(program_image) {
            *cell = value & cell_mask;
        }

        map
    }

    /// Resolves a logical name to its backing bank.
    #[inline]
    #[must_use]
    pub fn space(&self, space: Space) -> &Memory {
        &self.banks[self.index[space.index()]]
    }

    /// Two names are aliased when they resolve to the same bank.
    #[inline]
    #[must_use]
    pub fn aliased(&self, a: Space, b: Space) -> bool {
        self.index[a.index()] == self.index[b.index()]
    }

    fn writable(&mut self, space: Space) -> Result<&mut Memory, FaultKind> {
        if space == Space::Program {
            return Err(FaultKind::ReadOnlyWrite(space));
        }
        Ok(&mut self.banks[self.index[space.index()]])
    }

    pub fn load_cell(&self, space: Space, addr: u128) -> Result<u64, FaultKind> {
        self.space(space)
            .get(addr)
            .ok_or(FaultKind::OutOfBounds { space, addr })
    }

    pub fn store_cell(&mut self, space: Space, addr: u128, value: u64) -> Result<(), FaultKind> {
        self.writable(space)?
            .set(addr, value)
            .ok_or(FaultKind::OutOfBounds { space, addr })
    }

    /// Loads a value spanning `num_cells` cells. The in-memory layout is
    /// always little-endian; only operand encoding varies with opcode
    /// parity.
    pub fn load_value(
        &self,
        space: Space,
        addr: u128,
        num_cells: usize,
    ) -> Result<u128, FaultKind> {
        let cells = self.load_cells(space, addr, num_cells)?;
        Ok(endian::value_from_cells(
            Endianness::Little,
            &cells,
            self.space(space).char_bit,
        ))
    }

    /// Stores a value over `num_cells` cells, little-endian.
    pub fn store_value(
        &mut self,
        space: Space,
        addr: u128,
        num_cells: usize,
        value: u128,
    ) -> Result<(), FaultKind> {
        let char_bit = self.space(space).char_bit;
        let cells = endian::cells_from_value(Endianness::Little, value, char_bit, num_cells);
        self.store_cells(space, addr, &cells)
    }

    /// Reads `num_cells` consecutive cells starting at `addr`.
    pub fn load_cells(
        &self,
        space: Space,
        addr: u128,
        num_cells: usize,
    ) -> Result<Vec<u64>, FaultKind> {
        let bank = self.space(space);
        let end = addr
            .checked_add(num_cells as u128)
            .ok_or(FaultKind::OutOfBounds { space, addr })?;
        if end > bank.len() as u128 {
            return Err(FaultKind::OutOfBounds { space, addr });
        }
        Ok(bank.cells[addr as usize..end as usize].to_vec())
    }

    /// Writes a block of cells starting at `addr`.
    pub fn store_cells(&mut self, space: Space, addr: u128, cells: &[u64]) -> Result<(), FaultKind> {
        let bank = self.writable(space)?;
        let end = addr
            .checked_add(cells.len() as u128)
            .ok_or(FaultKind::OutOfBounds { space, addr })?;
        if end > bank.len() as u128 {
            return Err(FaultKind::OutOfBounds { space, addr });
        }
        let cell_mask = endian::mask(bank.char_bit) as u64;
        for (slot, &value) in bank.cells[addr as usize..end as usize]
            .iter_mut()
            .zip(cells)
        {
            *slot = value & cell_mask;
        }
        Ok(())
    }
}
