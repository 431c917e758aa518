use evil_vm::{Mapping, OptionBuilder, Options, OptionsError};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "evil-vm",
    about = "Run a program within the Evil VM",
    rename_all = "kebab-case"
)]
pub struct Cli {
    /// Assembly source file to load and execute
    #[structopt(parse(from_os_str))]
    pub source: PathBuf,

    /// Number of bits per byte
    #[structopt(short = "b", long, default_value = "9")]
    pub char_bit: u32,

    /// Number of bytes per machine word
    #[structopt(short = "w", long, default_value = "7")]
    pub word_size: u32,

    /// Number of bytes per memory address
    #[structopt(short = "a", long, default_value = "5")]
    pub addr_size: u32,

    /// Size, in cells, of the RAM address space
    #[structopt(short = "r", long, default_value = "1024")]
    pub ram_size: usize,

    /// Size, in cells, of the return stack address space
    #[structopt(short = "s", long, default_value = "256")]
    pub stack_size: usize,

    /// Size, in cells, of the program address space. If not specified,
    /// program memory is just large enough for the assembled bytecode
    #[structopt(short = "p", long)]
    pub program_size: Option<usize>,

    /// Remap address spaces, e.g. `ram=program` makes RAM use the program
    /// address space. Available: program, ram, stack
    #[structopt(short = "m", long = "map-memory")]
    pub map_memory: Vec<Mapping>,

    /// Halt the VM after executing this many instructions
    #[structopt(short = "H", long = "halt-after")]
    pub halt_after: Option<u64>,
}

impl Cli {
    /// Turns the parsed arguments into validated machine options.
    pub fn to_options(&self) -> Result<Options, OptionsError> {
        let mut builder = OptionBuilder::new()
            .char_bit(self.char_bit)
            .word_size(self.word_size)
            .addr_size(self.addr_size)
            .ram_size(self.ram_size)
            .stack_size(self.stack_size)
            .program_size(self.program_size)
            .halt_after(self.halt_after);

        for mapping in &self.map_memory {
            builder = builder.map_memory(*mapping);
        }

        builder.build()
    }
}
