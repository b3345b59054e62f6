use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// What the code cache does once its pool arena is full.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ArenaPolicyOpt {
    Grow,
    FlushAll,
    Fail,
}

#[derive(Debug, Parser)]
#[clap(name = "ee-mu", version, disable_help_flag = true)]
#[clap(next_help_heading = "Runner Options")]
pub struct RunnerOpts {
    /// Raw little-endian guest image
    pub image: PathBuf,

    /// Physical address the image is copied to
    #[arg(long, value_parser = parse_u32, default_value = "0")]
    pub load_addr: u32,

    /// Virtual address execution starts at
    #[arg(long, value_parser = parse_u32, default_value = "0x80000000")]
    pub entry: u32,

    /// Total guest cycles to run before stopping
    #[arg(long, default_value_t = 10_000_000)]
    pub cycles: u64,

    /// Cycles handed to the core per scheduler quantum
    #[arg(long, default_value_t = 1024)]
    pub quantum: u64,

    /// Size of guest RAM in bytes, mapped at physical address 0
    #[arg(long, value_parser = parse_u32, default_value = "0x2000000")]
    pub ram_size: u32,

    #[arg(long, value_enum, default_value_t = ArenaPolicyOpt::Grow)]
    pub arena_policy: ArenaPolicyOpt,

    /// Wall-clock limit in milliseconds; raises the stop flag when it expires
    #[arg(long)]
    pub wall_limit_ms: Option<u64>,

    /// tracing filter directive, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log: String,

    #[arg(long, short, action = ArgAction::Help)]
    help: (),
}

/// Accepts decimal or `0x` prefixed hex
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.replace('_', "");
    let result = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    result.map_err(|e| format!("invalid number {:?}: {}", s, e))
}
