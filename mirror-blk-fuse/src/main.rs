//! Host tool for creating and exercising mirrored disk images.
//!
//! A logical disk lives on two replica image files. `create` sizes and
//! formats the pair; `write`, `read` and `check` drive it through the same
//! engine and dispatch path a real front end would use; `corrupt` damages a
//! raw image on purpose so the repair path can be watched doing its job
//! (`RUST_LOG=warn` makes it visible).

mod dispatch;
mod file_disk;

use std::cmp::min;
use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::process;
use std::sync::{mpsc, Arc};

use clap::{App, Arg, ArgMatches, SubCommand};
use mirror_blk::{
    BlockDevice, DiskError, DiskLayout, MirrorVolume, CHECKSUMS_PER_SECTOR, SECTOR_SIZE,
};
use rand::Rng;

use dispatch::{IoDispatcher, IoOp, IoRequest};
use file_disk::FileDisk;

fn main() {
    env_logger::init();
    let matches = App::new("mirror-blk-fuse")
        .about("Mirrored disk images with per-sector checksums")
        .subcommand(
            SubCommand::with_name("create")
                .about("Create and format a fresh pair of replica images")
                .arg(dev_a())
                .arg(dev_b())
                .arg(size_mib()),
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write a file's bytes to the logical disk")
                .arg(dev_a())
                .arg(dev_b())
                .arg(size_mib())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("input")
                        .long("input")
                        .takes_value(true)
                        .required(true)
                        .help("File whose bytes are written, zero-padded to whole sectors"),
                ),
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read sectors from the logical disk")
                .arg(dev_a())
                .arg(dev_b())
                .arg(size_mib())
                .arg(sector_arg())
                .arg(
                    Arg::with_name("count")
                        .long("count")
                        .takes_value(true)
                        .default_value("1")
                        .help("Sectors to read"),
                )
                .arg(
                    Arg::with_name("output")
                        .long("output")
                        .takes_value(true)
                        .help("Write the bytes here instead of hexdumping them"),
                ),
        )
        .subcommand(
            SubCommand::with_name("check")
                .about("Read every logical sector, repairing what one replica got wrong")
                .arg(dev_a())
                .arg(dev_b())
                .arg(size_mib()),
        )
        .subcommand(
            SubCommand::with_name("corrupt")
                .about("Overwrite one sector of a raw replica image with random bytes")
                .arg(
                    Arg::with_name("image")
                        .long("image")
                        .takes_value(true)
                        .required(true)
                        .help("Replica image file to damage"),
                )
                .arg(sector_arg()),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("create", Some(sub)) => cmd_create(sub),
        ("write", Some(sub)) => cmd_write(sub),
        ("read", Some(sub)) => cmd_read(sub),
        ("check", Some(sub)) => cmd_check(sub),
        ("corrupt", Some(sub)) => cmd_corrupt(sub),
        _ => {
            eprintln!("no subcommand given; try --help");
            process::exit(2);
        }
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        process::exit(1);
    }
}

fn dev_a() -> Arg<'static, 'static> {
    Arg::with_name("dev-a")
        .long("dev-a")
        .takes_value(true)
        .required(true)
        .help("Replica 0 image file")
}

fn dev_b() -> Arg<'static, 'static> {
    Arg::with_name("dev-b")
        .long("dev-b")
        .takes_value(true)
        .required(true)
        .help("Replica 1 image file")
}

fn size_mib() -> Arg<'static, 'static> {
    Arg::with_name("size-mib")
        .long("size-mib")
        .takes_value(true)
        .default_value("95")
        .help("Logical disk capacity in MiB")
}

fn sector_arg() -> Arg<'static, 'static> {
    Arg::with_name("sector")
        .long("sector")
        .takes_value(true)
        .default_value("0")
        .help("First logical sector")
}

/// Layout for a logical disk of `mib` MiB.
fn mib_to_layout(mib: u64) -> Result<DiskLayout, Box<dyn Error>> {
    if mib == 0 {
        return Err("capacity must be at least 1 MiB".into());
    }
    Ok(DiskLayout::new(mib * 1024 * 1024 / SECTOR_SIZE as u64))
}

fn layout_of(sub: &ArgMatches) -> Result<DiskLayout, Box<dyn Error>> {
    mib_to_layout(sub.value_of("size-mib").unwrap().parse()?)
}

fn sector_of(sub: &ArgMatches) -> Result<u64, Box<dyn Error>> {
    Ok(sub.value_of("sector").unwrap().parse()?)
}

/// Open both replicas and put the volume on its worker thread.
fn open_dispatcher(sub: &ArgMatches) -> Result<(IoDispatcher, DiskLayout), Box<dyn Error>> {
    let layout = layout_of(sub)?;
    let a = FileDisk::open(Path::new(sub.value_of("dev-a").unwrap()))?;
    let b = FileDisk::open(Path::new(sub.value_of("dev-b").unwrap()))?;
    let volume = MirrorVolume::open([Arc::new(a) as Arc<dyn BlockDevice>, Arc::new(b)], layout)?;
    Ok((IoDispatcher::spawn(volume)?, layout))
}

/// Submit one request and wait for its completion.
fn run_request(
    dispatcher: &IoDispatcher,
    op: IoOp,
    sector: u64,
    buf: Vec<u8>,
) -> mirror_blk::Result<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    dispatcher.submit(
        IoRequest { op, sector, buf },
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap_or(Err(DiskError::Io))
}

fn cmd_create(sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let layout = layout_of(sub)?;
    let a = FileDisk::create(Path::new(sub.value_of("dev-a").unwrap()), layout.total_sectors())?;
    let b = FileDisk::create(Path::new(sub.value_of("dev-b").unwrap()), layout.total_sectors())?;
    MirrorVolume::format([Arc::new(a) as Arc<dyn BlockDevice>, Arc::new(b)], layout)?;
    println!(
        "created mirrored volume: {} data + {} checksum sectors per replica ({} bytes logical)",
        layout.data_sectors(),
        layout.checksum_sectors(),
        layout.data_sectors() * SECTOR_SIZE as u64
    );
    Ok(())
}

/// Zero-pad `data` to a whole number of sectors.
fn pad_to_sectors(mut data: Vec<u8>) -> Vec<u8> {
    let sectors = data.len().div_ceil(SECTOR_SIZE);
    data.resize(sectors * SECTOR_SIZE, 0);
    data
}

fn cmd_write(sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let (dispatcher, layout) = open_dispatcher(sub)?;
    let sector = sector_of(sub)?;
    let input = sub.value_of("input").unwrap();
    let data = fs::read(input)?;
    if data.is_empty() {
        return Err(format!("{}: input file is empty", input).into());
    }
    let data = pad_to_sectors(data);
    let count = data.len() / SECTOR_SIZE;
    if !layout.contains_range(sector, count) {
        return Err(format!(
            "{} sectors at {} do not fit a {}-sector disk",
            count,
            sector,
            layout.data_sectors()
        )
        .into());
    }
    run_request(&dispatcher, IoOp::Write, sector, data)?;
    println!("wrote {} sectors at sector {}", count, sector);
    Ok(())
}

fn cmd_read(sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let (dispatcher, layout) = open_dispatcher(sub)?;
    let sector = sector_of(sub)?;
    let count: usize = sub.value_of("count").unwrap().parse()?;
    if count == 0 {
        return Err("--count must be at least 1".into());
    }
    if !layout.contains_range(sector, count) {
        return Err(format!(
            "{} sectors at {} do not fit a {}-sector disk",
            count,
            sector,
            layout.data_sectors()
        )
        .into());
    }
    let data = run_request(&dispatcher, IoOp::Read, sector, vec![0u8; count * SECTOR_SIZE])?;
    match sub.value_of("output") {
        Some(path) => fs::write(path, &data)?,
        None => hexdump(&data, sector),
    }
    Ok(())
}

/// Read the whole data region group by group; single-replica damage heals as
/// a side effect. Returns the sectors no replica could supply.
fn verify_volume(dispatcher: &IoDispatcher, layout: &DiskLayout) -> Vec<u64> {
    let mut bad = Vec::new();
    let mut sector = 0;
    while sector < layout.data_sectors() {
        let count = min(
            CHECKSUMS_PER_SECTOR as u64,
            layout.data_sectors() - sector,
        );
        let buf = vec![0u8; count as usize * SECTOR_SIZE];
        if run_request(dispatcher, IoOp::Read, sector, buf).is_err() {
            // Narrow the failed span down to the guilty sectors.
            for one in sector..sector + count {
                if run_request(dispatcher, IoOp::Read, one, vec![0u8; SECTOR_SIZE]).is_err() {
                    bad.push(one);
                }
            }
        }
        sector += count;
    }
    bad
}

fn cmd_check(sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let (dispatcher, layout) = open_dispatcher(sub)?;
    let bad = verify_volume(&dispatcher, &layout);
    if bad.is_empty() {
        println!("all {} sectors verified", layout.data_sectors());
        return Ok(());
    }
    for sector in &bad {
        eprintln!("sector {}: unrecoverable on both replicas", sector);
    }
    Err(format!("{} unrecoverable sectors", bad.len()).into())
}

fn cmd_corrupt(sub: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let image = sub.value_of("image").unwrap();
    let sector = sector_of(sub)?;
    let mut file = OpenOptions::new().read(true).write(true).open(image)?;
    let sectors = file.metadata()?.len() / SECTOR_SIZE as u64;
    if sector >= sectors {
        return Err(format!("{}: sector {} beyond {} sectors", image, sector, sectors).into());
    }
    let mut junk = [0u8; SECTOR_SIZE];
    rand::thread_rng().fill(&mut junk[..]);
    file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
    file.write_all(&junk)?;
    println!("corrupted sector {} of {}", sector, image);
    Ok(())
}

fn hexdump(data: &[u8], first_sector: u64) {
    for (i, sector) in data.chunks(SECTOR_SIZE).enumerate() {
        println!("sector {}:", first_sector + i as u64);
        for (line_no, line) in sector.chunks(16).enumerate() {
            let hex: String = line.iter().map(|byte| format!("{:02x} ", byte)).collect();
            let ascii: String = line
                .iter()
                .map(|&byte| if (0x20..0x7f).contains(&byte) { byte as char } else { '.' })
                .collect();
            println!("  {:04x}  {:<48} {}", line_no * 16, hex, ascii);
        }
    }
}
