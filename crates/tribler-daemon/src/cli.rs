//! Command-line flags. Every flag overrides the matching config entry.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tribler_tunnel::settings::{ExtendPolicy, LengthPolicy, SelectionPolicy};

#[derive(Parser, Debug, Default)]
#[command(name = "tribler-tunnel")]
#[command(about = "Anonymous tunnel node with a SOCKS5 UDP front end")]
#[command(version)]
pub struct Cli {
    /// SOCKS5 listen port
    #[arg(short = 'p', long = "socks5")]
    pub socks5: Option<u16>,

    /// How circuits are extended
    #[arg(short = 'e', long = "extend-strategy", value_enum)]
    pub extend_strategy: Option<ExtendArg>,

    /// Circuit length: `constant N` or `random MIN MAX`
    #[arg(short = 'l', long = "length-strategy", num_args = 2..=3)]
    pub length_strategy: Option<Vec<String>>,

    /// Circuit selection: `random MIN`, `round-robin MIN` or `length MIN MAX`
    #[arg(short = 's', long = "select-strategy", num_args = 2..=3)]
    pub select_strategy: Option<Vec<String>>,

    /// Live circuits to keep
    #[arg(long)]
    pub max_circuits: Option<usize>,

    /// Crawl STATS from verified candidates
    #[arg(long)]
    pub crawl: bool,

    /// Config file (default: $TRIBLER_DATA_DIR/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overlay UDP port
    #[arg(long)]
    pub listen: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExtendArg {
    Subset,
    Delegate,
    Random,
}

impl From<ExtendArg> for ExtendPolicy {
    fn from(arg: ExtendArg) -> Self {
        match arg {
            ExtendArg::Subset => Self::Subset,
            ExtendArg::Delegate => Self::Delegate,
            ExtendArg::Random => Self::Random,
        }
    }
}

fn number(arg: &str, what: &str) -> Result<usize> {
    arg.parse()
        .with_context(|| format!("{what} must be a number, got '{arg}'"))
}

pub fn parse_length(args: &[String]) -> Result<LengthPolicy> {
    match args {
        [kind, hops] if kind == "constant" => Ok(LengthPolicy::Constant {
            hops: number(hops, "hops")?,
        }),
        [kind, min, max] if kind == "random" => {
            let (min, max) = (number(min, "min")?, number(max, "max")?);
            if min > max {
                bail!("length range {min}..{max} is empty");
            }
            Ok(LengthPolicy::Random { min, max })
        }
        _ => bail!("expected `constant N` or `random MIN MAX`, got {args:?}"),
    }
}

pub fn parse_selection(args: &[String]) -> Result<SelectionPolicy> {
    match args {
        [kind, min] if kind == "random" => Ok(SelectionPolicy::Random {
            min_population: number(min, "min")?,
        }),
        [kind, min] if kind == "round-robin" => Ok(SelectionPolicy::RoundRobin {
            min_population: number(min, "min")?,
        }),
        [kind, min, max] if kind == "length" => Ok(SelectionPolicy::Length {
            min: number(min, "min")?,
            max: number(max, "max")?,
        }),
        _ => bail!("expected `random MIN`, `round-robin MIN` or `length MIN MAX`, got {args:?}"),
    }
}
