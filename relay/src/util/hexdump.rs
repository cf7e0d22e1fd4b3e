use std::fmt::{Display, Formatter};

/// Formats bytes as a classic 16-bytes-per-line hex dump. It is a `Display` wrapper rather than a
///  `String` so that trace statements don't pay for formatting unless the level is enabled.
pub struct HexDump<'a>(pub &'a [u8]);

impl Display for HexDump<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (line, chunk) in self.0.chunks(16).enumerate() {
            write!(f, "\n{:04x}: ", line * 16)?;
            for i in 0..16 {
                if i == 8 {
                    write!(f, " ")?;
                }
                match chunk.get(i) {
                    Some(b) => write!(f, " {:02x}", b)?,
                    None => write!(f, "   ")?,
                }
            }
            write!(f, "  ")?;
            for &b in chunk {
                let c = if b.is_ascii_graphic() { b as char } else { '.' };
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
