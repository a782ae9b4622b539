use anyhow::Result;
use clap::Parser;

use picsp::protocol::{Dspic33, Pic16, Pic24};
use picsp::{Engine, Family, Flashing, GpioLink, GpioLinkConfig, Progress};

#[derive(clap::Parser)]
#[command(
    name = "picsp",
    about = "GPIO bit-bang in-circuit serial programmer for PIC microcontrollers",
    version
)]
struct Cli {
    /// Target protocol family
    #[arg(short, long, value_enum)]
    family: Family,

    /// GPIO character device the ICSP lines are wired to
    #[arg(long, default_value = "/dev/gpiochip0")]
    gpiochip: String,

    /// MCLR (reset) line offset
    #[arg(long, default_value_t = 4)]
    mclr: u32,

    /// PGC (clock) line offset
    #[arg(long, default_value_t = 27)]
    pgc: u32,

    /// PGD (data) line offset
    #[arg(long, default_value_t = 22)]
    pgd: u32,

    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Identify the connected chip and print its info
    Info,
    /// Check whether the chip is blank
    Blank,
    /// Bulk erase program memory and configuration
    Erase,
    /// Program a hex file, then verify
    Flash {
        /// Intel HEX file to program
        path: String,
        /// Skip read-back verification
        #[arg(long)]
        no_verify: bool,
    },
    /// Compare chip contents against a hex file
    Verify {
        path: String,
    },
    /// Read the chip into a hex file
    Read {
        path: String,
    },
    /// Print the configuration registers
    DumpConfig,
}

/// Progress rendered as an indicatif bar over 0..100.
struct BarProgress {
    bar: indicatif::ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        BarProgress {
            bar: indicatif::ProgressBar::new(100),
        }
    }
}

impl Progress for BarProgress {
    fn percent(&mut self, pct: u8) {
        self.bar.set_position(pct as u64);
    }
}

impl Drop for BarProgress {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Err(err) = run(cli) {
        log::error!("{:#}", err);
        std::process::exit(picsp::error::exit_code(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let link = GpioLink::open(&GpioLinkConfig {
        chip: cli.gpiochip.clone(),
        mclr: cli.mclr,
        clock: cli.pgc,
        data: cli.pgd,
    })?;

    match cli.family {
        Family::Pic16 => drive(Pic16::new(link), &cli),
        Family::Pic24 => drive(Pic24::new(link), &cli),
        Family::Dspic33 => drive(Dspic33::new(link), &cli),
    }
}

/// Run one subcommand inside an identify/release session.
fn drive<E: Engine>(engine: E, cli: &Cli) -> Result<()> {
    let mut flashing = Flashing::open(engine, cli.family)?;
    let result = dispatch(&mut flashing, &cli.command);
    let released = flashing.close();
    result.and(released)
}

fn dispatch<E: Engine>(flashing: &mut Flashing<E>, command: &Command) -> Result<()> {
    match command {
        Command::Info => flashing.dump_info(),
        Command::Blank => {
            let blank = flashing.blank_check(&mut BarProgress::new())?;
            log::info!("chip is {}", if blank { "blank" } else { "not blank" });
            Ok(())
        }
        Command::Erase => flashing.erase(),
        Command::Flash { path, no_verify } => {
            flashing.dump_info()?;
            flashing.flash_file(path, !no_verify, &mut BarProgress::new())
        }
        Command::Verify { path } => {
            flashing.verify_file(path, &mut BarProgress::new())
        }
        Command::Read { path } => flashing.read_to_file(path, &mut BarProgress::new()),
        Command::DumpConfig => flashing.dump_config(),
    }
}
