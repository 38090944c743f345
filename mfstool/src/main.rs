use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, warn};
use minixfs::io::{BlockStorage, ImageFile, ImageFileBuilder};
use minixfs::{FormatOptions, FsError, MinixFs, Version};

/// Inspect and edit a Minix filesystem image without mounting it.
///
/// Paths name an entry of the root directory (`name`) or of a directory in
/// the root (`dir/name`).
#[derive(Parser)]
#[command(name = "mfstool", version)]
struct Cli {
    /// Filesystem image to operate on.
    image: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory, the root when no path is given.
    Ls { path: Option<String> },
    /// Write a file's contents to stdout.
    Cat { path: String },
    /// Create an empty file.
    Touch { path: String },
    /// Create a directory.
    Mkdir { path: String },
    /// Append text to the end of a file.
    Append { path: String, text: String },
    /// Create a new image and format it.
    Mkfs {
        /// Size of the image in 1K blocks.
        #[arg(short, long)]
        blocks: usize,
        #[arg(short = 'v', long, value_enum, default_value = "v1")]
        fs_version: FsVersion,
        /// Width of directory entry names, 14 or 30.
        #[arg(short, long, default_value_t = 30)]
        names: usize,
        /// Number of inodes, a third of the blocks by default.
        #[arg(short, long)]
        inodes: Option<u32>,
    },
    /// Print the image geometry and free space.
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum FsVersion {
    V1,
    V2,
}

impl From<FsVersion> for Version {
    fn from(version: FsVersion) -> Self {
        match version {
            FsVersion::V1 => Version::V1,
            FsVersion::V2 => Version::V2,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(error) = run(Cli::parse()) {
        eprintln!("error: {:#}", error);
        std::process::exit(exit_code(&error));
    }
}

/// Distinct exit status per failure category so scripts can tell them apart.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<FsError>() {
        Some(FsError::CorruptImage(_)) => 2,
        Some(FsError::InvalidInode(_)) => 3,
        Some(FsError::NotFound(_)) => 4,
        Some(FsError::NotAFile(_)) => 5,
        Some(FsError::NotADirectory(_)) => 6,
        Some(FsError::DuplicateName(_)) => 7,
        Some(FsError::NameTooLong { .. }) | Some(FsError::InvalidName(_)) => 8,
        Some(FsError::OutOfSpace(_)) => 9,
        Some(FsError::FileTooLarge { .. }) => 10,
        Some(FsError::TooManyLinks(_)) => 11,
        Some(FsError::InvalidGeometry(_)) => 12,
        Some(FsError::Io(_)) | None => 1,
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Mkfs {
            blocks,
            fs_version,
            names,
            inodes,
        } => {
            let options = FormatOptions {
                version: fs_version.into(),
                name_len: names,
                inodes,
            };
            mkfs(&cli.image, blocks, &options)
        }
        command => edit(&cli.image, command),
    }
}

fn edit(image: &Path, command: Command) -> Result<()> {
    let dev = ImageFile::open_disk(image)
        .with_context(|| format!("cannot open image {}", image.display()))?;
    let mut fs = MinixFs::open(dev)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Ls { path } => {
            for entry in fs.ls(path.as_deref())? {
                out.write_all(&entry.name)?;
                out.write_all(b"\n")?;
            }
        }
        Command::Cat { path } => out.write_all(&fs.cat(&path)?)?,
        Command::Touch { path } => {
            fs.touch(&path)?;
        }
        Command::Mkdir { path } => {
            fs.mkdir(&path)?;
        }
        Command::Append { path, text } => fs.append(&path, text.as_bytes())?,
        Command::Info => {
            let layout = *fs.layout();
            let usage = fs.usage()?;
            writeln!(out, "version:          {:?}", layout.version)?;
            writeln!(out, "name length:      {}", layout.name_len)?;
            writeln!(out, "zone size:        {}", layout.zone_size())?;
            writeln!(out, "first data zone:  {}", layout.first_data_zone)?;
            writeln!(out, "max file size:    {}", layout.max_size)?;
            writeln!(out, "inodes:           {} ({} free)", usage.inodes, usage.free_inodes)?;
            writeln!(out, "data zones:       {} ({} free)", usage.data_zones, usage.free_zones)?;
        }
        Command::Mkfs { .. } => {}
    }
    out.flush()?;
    fs.sync()?;
    Ok(())
}

fn mkfs(path: &Path, blocks: usize, options: &FormatOptions) -> Result<()> {
    // Refuse to clobber an existing image.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("cannot create image {}", path.display()))?;
    // A fresh file already reads as zeros once extended.
    let formatted = ImageFileBuilder::from(file)
        .with_block_count(blocks)
        .clear_medium(false)
        .build()
        .map_err(FsError::from)
        .and_then(|dev| MinixFs::format(dev, options));
    let fs = match formatted {
        Ok(fs) => fs,
        Err(err) => {
            if let Err(cleanup) = std::fs::remove_file(path) {
                warn!("could not remove {}: {}", path.display(), cleanup);
            }
            return Err(err.into());
        }
    };
    let layout = fs.layout();
    debug!("formatted {}", path.display());
    println!(
        "{}: {:?} filesystem, {} inodes, {} zones",
        path.display(),
        layout.version,
        layout.inode_count,
        layout.zone_count
    );
    Ok(())
}
