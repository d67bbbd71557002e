#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::Infallible;
use std::io::Write;

use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use indicatif::{ProgressBar, ProgressStyle};

use sn8f_isp::protocol::MAX_CHUNK;
use sn8f_isp::sim::{SimDelay, SimTarget};
use sn8f_isp::{parse_u16, IspGpio, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    #[structopt(flatten)]
    options: Options,

    /// Run against a simulated target instead of GPIO hardware
    #[structopt(long)]
    sim: bool,

    /// Do not send the unlock sequence after power up
    #[structopt(long)]
    no_unlock: bool,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Check the target responds
    Check,

    /// Read and verify the chip ID
    Id,

    /// Read 1 to 32 words
    Read {
        #[structopt(long, parse(try_from_str = parse_u16))]
        address: u16,

        #[structopt(long, default_value = "1")]
        count: usize,
    },

    /// Program 1 to 32 words
    Write {
        #[structopt(long, parse(try_from_str = parse_u16))]
        address: u16,

        #[structopt(parse(try_from_str = parse_u16), required = true)]
        words: Vec<u16>,
    },

    /// Erase the whole code memory
    EraseAll,

    /// Erase the 128 word page containing an address
    ErasePage {
        #[structopt(long, parse(try_from_str = parse_u16))]
        address: u16,
    },

    /// Dump a range of memory as hex, defaults to the whole code memory
    Dump {
        #[structopt(long, default_value = "0", parse(try_from_str = parse_u16))]
        start: u16,

        #[structopt(long, parse(try_from_str = parse_u16))]
        length: Option<u16>,
    },
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let res = if o.sim {
        info!("Using simulated target");

        let target = SimTarget::new(o.options.pins.clone());
        let mut p: Programmer<_, _, Infallible> =
            Programmer::new(target, SimDelay::default(), o.options.clone());
        run(&mut p, &o)
    } else {
        info!("Exporting GPIO lines");

        match Programmer::linux(o.options.clone()) {
            Ok(mut p) => {
                let res = run(&mut p, &o);

                if let Err(e) = p.release().0.unexport() {
                    warn!("Error unexporting GPIO lines: {:?}", e);
                }

                res
            },
            Err(e) => {
                error!("Error opening GPIO lines: {:?}", e);
                return;
            }
        }
    };

    if let Err(e) = res {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run<G, D, E>(p: &mut Programmer<G, D, E>, o: &Args) -> anyhow::Result<()>
where
    G: IspGpio<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    E: std::fmt::Debug + Send + Sync + 'static,
{
    let res = session(p, o);

    // Always leave the target unpowered
    if let Err(e) = p.shutdown() {
        error!("Error shutting down target: {:?}", e);
    }

    res
}

fn session<G, D, E>(p: &mut Programmer<G, D, E>, o: &Args) -> anyhow::Result<()>
where
    G: IspGpio<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    E: std::fmt::Debug + Send + Sync + 'static,
{
    debug!("Geometry: code 0x{:04x} words, user 0x{:04x} words",
        p.options().code_size, p.options().user_size);

    info!("Powering up target");

    if o.no_unlock {
        p.power_up()?;
    } else {
        p.reset()?;
    }

    p.check()?;

    let id = p.identify()?;
    info!("Chip ID: 0x{:04x}", id);

    match &o.command {
        Command::Check => {
            info!("Target connected!");
        },
        Command::Id => {
            println!("0x{:04x}", id);
        },
        Command::Read { address, count } => {
            let mut data = vec![0u16; *count];
            p.read_words(*address, &mut data)?;
            println!("{}", format_words(*address, &data));
        },
        Command::Write { address, words } => {
            p.enable_erase_write()?;
            p.write_words(*address, words)?;
            info!("Wrote {} word(s) at 0x{:04x}", words.len(), address);
        },
        Command::EraseAll => {
            p.enable_erase_write()?;
            p.erase_all()?;
            info!("Chip erased");
        },
        Command::ErasePage { address } => {
            p.enable_erase_write()?;
            p.erase_page(*address)?;
            info!("Page erased");
        },
        Command::Dump { start, length } => {
            let length = length.unwrap_or(p.options().code_size) as usize;

            let pb = ProgressBar::new(length as u64);
            pb.set_style(ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} words"));

            let stdout = std::io::stdout();
            dump(p, *start, length, &mut stdout.lock(), &pb)?;

            pb.finish_and_clear();
        },
    }

    Ok(())
}

/// Read `length` words from `start`, writing one hex line per block to `out`
fn dump<G, D, E, W>(p: &mut Programmer<G, D, E>, start: u16, length: usize, out: &mut W, pb: &ProgressBar) -> anyhow::Result<()>
where
    G: IspGpio<E>,
    D: DelayUs<u32> + DelayMs<u32>,
    E: std::fmt::Debug + Send + Sync + 'static,
    W: Write,
{
    let mut offset = 0;
    while offset < length {
        let address = start.wrapping_add(offset as u16);

        // Stay inside the 32 word block so reads never wrap
        let block = MAX_CHUNK - (address as usize % MAX_CHUNK);
        let n = block.min(length - offset);

        let mut data = vec![0u16; n];
        p.read_words(address, &mut data)?;

        writeln!(out, "{}", format_words(address, &data))?;
        pb.inc(n as u64);

        offset += n;
    }

    out.flush()?;

    Ok(())
}

/// Format words as little endian hex
fn format_words(address: u16, data: &[u16]) -> String {
    let bytes: Vec<u8> = data.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect();
    format!("{:04x}: {}", address, hex::encode(bytes))
}
