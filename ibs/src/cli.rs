//! CLI argument definitions

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "ibs",
    about = "Run the instruction-sampling subsystem against a simulated machine",
    after_help = "\
EXAMPLES:
    ibs                                  4-core machine, 32 op samples on cpu 0
    ibs --flavor fetch --cpu 2           fetch sampling on core 2
    ibs --family 0x17 --model 0x01       exercise the continuous enable workaround"
)]
pub struct Args {
    /// Number of simulated cores
    #[arg(long, default_value = "4")]
    pub cpus: usize,

    /// Simulated processor family (hex accepted with 0x prefix)
    #[arg(long, default_value = "0x19", value_parser = parse_maybe_hex_u16)]
    pub family: u16,

    /// Simulated processor model
    #[arg(long, default_value = "0x01", value_parser = parse_maybe_hex_u8)]
    pub model: u8,

    /// Core to sample on
    #[arg(long, default_value = "0")]
    pub cpu: u32,

    /// Sampling flavor: "op" or "fetch"
    #[arg(long, default_value = "op")]
    pub flavor: String,

    /// Number of samples to collect before exiting
    #[arg(long, default_value = "32")]
    pub samples: u64,

    /// Microseconds between simulated sampling interrupts
    #[arg(long, default_value = "500")]
    pub period_us: u64,
}

fn parse_maybe_hex_u16(s: &str) -> Result<u16, String> {
    let parsed = s
        .strip_prefix("0x")
        .map_or_else(|| s.parse(), |hex| u16::from_str_radix(hex, 16));
    parsed.map_err(|e| e.to_string())
}

fn parse_maybe_hex_u8(s: &str) -> Result<u8, String> {
    let parsed = s
        .strip_prefix("0x")
        .map_or_else(|| s.parse(), |hex| u8::from_str_radix(hex, 16));
    parsed.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_decimal_both_parse() {
        assert_eq!(parse_maybe_hex_u16("0x17").unwrap(), 0x17);
        assert_eq!(parse_maybe_hex_u16("23").unwrap(), 23);
        assert!(parse_maybe_hex_u8("0x1ff").is_err());
    }
}
