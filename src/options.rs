//! Machine configuration.
//!
//! Everything unusual about the architecture is decided here: how many bits
//! a cell holds, how many cells make up a word or an address, how large the
//! three address spaces are and which of them share a backing store.

use crate::endian;
use crate::memory::Space;
use std::str::FromStr;

/// Default number of bits per cell.
pub const DEFAULT_CHAR_BIT: u32 = 9;
/// Default number of cells per machine word.
pub const DEFAULT_WORD_SIZE: u32 = 7;
/// Default number of cells per address.
pub const DEFAULT_ADDR_SIZE: u32 = 5;
/// Default RAM size, in cells.
pub const DEFAULT_RAM_SIZE: usize = 1024;
/// Default call stack size, in cells.
pub const DEFAULT_STACK_SIZE: usize = 256;

/// An `dst=src` alias directive for the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub dst: Space,
    pub src: Space,
}

impl FromStr for Mapping {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '=');
        let dst = parts.next().unwrap_or("");
        let src = parts
            .next()
            .ok_or_else(|| OptionsError::BadMapping(s.to_string()))?;

        let parse = |name: &str| {
            Space::from_str(name).map_err(|_| OptionsError::BadMapping(s.to_string()))
        };

        Ok(Self {
            dst: parse(dst)?,
            src: parse(src)?,
        })
    }
}

/// A configuration problem that prevents the VM from being built.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum OptionsError {
    #[display(fmt = "char-bit must be between 1 and 64, got {}", _0)]
    BadCharBit(u32),
    #[display(fmt = "{} must be at least one cell", _0)]
    ZeroWidth(&'static str),
    #[display(
        fmt = "{} of {} cells at {} bits per cell exceeds the supported 128-bit value width",
        _0,
        _1,
        _2
    )]
    WidthTooLarge(&'static str, u32, u32),
    #[display(fmt = "invalid memory mapping: {}", _0)]
    BadMapping(String),
}

impl std::error::Error for OptionsError {}

/// The initialized options for the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub char_bit: u32,
    pub word_size: u32,
    pub addr_size: u32,
    pub ram_size: usize,
    pub stack_size: usize,
    /// Fixed program space size. When absent the program space is exactly
    /// as large as the assembled image.
    pub program_size: Option<usize>,
    pub memory_map: Vec<Mapping>,
    /// Stop cleanly after this many executed instructions.
    pub halt_after: Option<u64>,
}

impl Options {
    #[inline]
    #[must_use]
    pub fn word_bits(&self) -> u32 {
        self.word_size * self.char_bit
    }

    #[inline]
    #[must_use]
    pub fn addr_bits(&self) -> u32 {
        self.addr_size * self.char_bit
    }

    #[inline]
    #[must_use]
    pub fn cell_mask(&self) -> u128 {
        endian::mask(self.char_bit)
    }

    #[inline]
    #[must_use]
    pub fn word_mask(&self) -> u128 {
        endian::mask(self.word_bits())
    }

    #[inline]
    #[must_use]
    pub fn addr_mask(&self) -> u128 {
        endian::mask(self.addr_bits())
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            char_bit: DEFAULT_CHAR_BIT,
            word_size: DEFAULT_WORD_SIZE,
            addr_size: DEFAULT_ADDR_SIZE,
            ram_size: DEFAULT_RAM_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            program_size: None,
            memory_map: Vec::new(),
            halt_after: None,
        }
    }
}

/// Builder for [`Options`].
#[derive(Debug, Clone)]
pub struct OptionBuilder {
    options: Options,
}

impl OptionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: Options::default(),
        }
    }

    #[must_use]
    pub fn char_bit(mut self, char_bit: u32) -> Self {
        self.options.char_bit = char_bit;
        self
    }

    #[must_use]
    pub fn word_size(mut self, word_size: u32) -> Self {
        self.options.word_size = word_size;
        self
    }

    #[must_use]
    pub fn addr_size(mut self, addr_size: u32) -> Self {
        self.options.addr_size = addr_size;
        self
    }

    #[must_use]
    pub fn ram_size(mut self, ram_size: usize) -> Self {
        self.options.ram_size = ram_size;
        self
    }

    #[must_use]
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.options.stack_size = stack_size;
        self
    }

    #[must_use]
    pub fn program_size(mut self, program_size: Option<usize>) -> Self {
        self.options.program_size = program_size;
        self
    }

    #[must_use]
    pub fn map_memory(mut self, mapping: Mapping) -> Self {
        self.options.memory_map.push(mapping);
        self
    }

    #[must_use]
    pub fn halt_after(mut self, halt_after: Option<u64>) -> Self {
        self.options.halt_after = halt_after;
        self
    }

    pub fn build(self) -> Result<Options, OptionsError> {
        let options = self.options;

        if options.char_bit == 0 || options.char_bit > 64 {
            return Err(OptionsError::BadCharBit(options.char_bit));
        }
        if options.word_size == 0 {
            return Err(OptionsError::ZeroWidth("word-size"));
        }
        if options.addr_size == 0 {
            return Err(OptionsError::ZeroWidth("addr-size"));
        }

        // Words and addresses travel through u128 arithmetic.
        if u64::from(options.word_size) * u64::from(options.char_bit) > 128 {
            return Err(OptionsError::WidthTooLarge(
                "word",
                options.word_size,
                options.char_bit,
            ));
        }
        if u64::from(options.addr_size) * u64::from(options.char_bit) > 128 {
            return Err(OptionsError::WidthTooLarge(
                "address",
                options.addr_size,
                options.char_bit,
            ));
        }

        Ok(options)
    }
}

impl Default for OptionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
