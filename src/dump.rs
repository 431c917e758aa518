//! Hexdump rendering for debug logs.

use crate::endian;

/// Renders a cell slice as a hexdump-like string.
///
/// Each cell is zero-padded to the hex width of `char_bit` bits; `per_line`
/// cells are printed per line, prefixed with the offset of the first one.
#[must_use]
pub fn make_cells_dump(cells: &[u64], char_bit: u32, per_line: usize) -> String {
    let cell_width = format!("{:x}", endian::mask(char_bit.min(64)) as u64).len();
    let per_line = per_line.max(1);

    let mut out = String::new();
    for (line, chunk) in cells.chunks(per_line).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:08x} ", line * per_line));
        for cell in chunk {
            out.push_str(&format!(" {:0width$x}", cell, width = cell_width));
        }
    }

    out
}
