#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use picorv32_isp_loader::{linux::DEFAULT_BAUD, Error, Options, ProgramImage, Programmer, Progress, FLASH_BASE};

#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "Flash a Verilog hex image through the PicoRV32 ISP bootloader")]
pub struct Args {
    /// Memory image to flash (objcopy -O verilog output)
    image: String,

    /// Serial port to connect to
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Flash base address in the image address space
    #[structopt(long, default_value = "0x01000000", parse(try_from_str = parse_hex))]
    flash_base: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    if o.flash_base != FLASH_BASE {
        info!("Using flash base 0x{:08x}", o.flash_base);
    }
    if o.baud != DEFAULT_BAUD {
        warn!("Bootloader expects {} baud, using {}", DEFAULT_BAUD, o.baud);
    }

    let image = ProgramImage::from_file(&o.image, o.flash_base)
        .with_context(|| format!("Error loading image '{}'", o.image))?;

    info!("Read program with {}", bytefmt::format(image.len() as u64));
    debug!("Image head: {}", hex::encode(image.chunk(0, 16)));

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options)
        .map_err(|e| anyhow::anyhow!("Error connecting to serial port: {:?}", e))?;

    info!("Waiting for reset");

    match p.init() {
        Ok(_) => (),
        Err(e @ Error::DeviceNotDetected { .. }) => {
            error!("PicoRV32 not detected or not in ISP mode");
            error!("Check serial port or press the reset button");
            return Err(e.into());
        }
        Err(e) => return Err(e).context("Error connecting to bootloader"),
    }

    info!("Bootloader connected!");

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:16} [{bar:40}] {pos}/{len} pages")
            .progress_chars("=> "),
    );

    let summary = p
        .flash(&image, |e| match e {
            Progress::Erasing { sector, sectors } => {
                bar.set_message(&format!("Sector {}/{}", sector + 1, sectors));
            }
            Progress::Programmed { pages, .. } => {
                bar.set_length(pages as u64);
                bar.inc(1);
            }
        })
        .context("Error flashing image")?;

    bar.finish_with_message("Done");

    if summary.checksum_mismatches > 0 {
        warn!(
            "{} checksum mismatches, {} pages retransmitted",
            summary.checksum_mismatches, summary.retransmits
        );
    }

    info!(
        "Flashing completed: {} in {} sectors, {} pages",
        bytefmt::format(summary.bytes as u64),
        summary.sectors,
        summary.pages
    );

    Ok(())
}
